//! Turn-based call mode over HTTP
//!
//! Instead of streaming, whole utterances are exchanged: record a fixed
//! window, upload it as a WAV file, play the WAV reply, repeat until the
//! server marks the session as ended.

use std::sync::Arc;
use std::time::Duration;

use reqwest::StatusCode;
use reqwest::multipart::{Form, Part};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::audio::{CaptureDevice, Devices, PlaybackScheduler, samples_to_wav, wav_to_samples};
use crate::events::EventSink;
use crate::{Error, Result};

/// Response header that ends the call after the reply is played
pub const SESSION_END_HEADER: &str = "X-Session-End";

/// Outcome of uploading one utterance
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TurnReply {
    /// Server had nothing to say (204); record again
    NoResponse,
    /// Server answered with a non-success status; record again
    Rejected(StatusCode),
    /// Spoken reply as a WAV file
    Reply { wav: Vec<u8>, session_end: bool },
}

#[derive(Debug, Serialize)]
struct StartRequest<'a> {
    due_amount: serde_json::Value,
    lang: &'a str,
}

#[derive(Debug, Deserialize)]
struct StartResponse {
    session_id: String,
}

#[derive(Debug, Serialize)]
struct EndRequest<'a> {
    session_id: &'a str,
}

/// Client for the turn-based session API
#[derive(Debug, Clone)]
pub struct TurnClient {
    client: reqwest::Client,
    base_url: String,
}

impl TurnClient {
    /// Create a client for the API at `base_url`
    #[must_use]
    pub fn new(base_url: &str) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }

    /// Open a session and return its id
    ///
    /// # Errors
    ///
    /// Returns `Error::Transport` on a non-success status, `Error::Http` if
    /// the request or response body fails
    pub async fn start_session(&self, due_amount: &str, lang: &str) -> Result<String> {
        let body = StartRequest {
            due_amount: amount_value(due_amount),
            lang,
        };
        let response = self
            .client
            .post(self.endpoint("/api/session/start"))
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(Error::Transport(format!("session/start failed: {status}")));
        }

        let started: StartResponse = response.json().await?;
        tracing::info!(session_id = %started.session_id, "turn session started");
        Ok(started.session_id)
    }

    /// Fetch the greeting clip; `None` if the server has none
    ///
    /// # Errors
    ///
    /// Returns `Error::Http` if the request fails
    pub async fn kickoff(&self, session_id: &str) -> Result<Option<Vec<u8>>> {
        let response = self
            .client
            .get(self.endpoint("/api/voice-kickoff"))
            .query(&[("session_id", session_id)])
            .send()
            .await?;

        if !response.status().is_success() {
            tracing::debug!(status = %response.status(), "no kickoff audio");
            return Ok(None);
        }
        Ok(Some(response.bytes().await?.to_vec()))
    }

    /// Upload one recorded utterance
    ///
    /// # Errors
    ///
    /// Returns `Error::Http` if the request fails
    pub async fn send_utterance(&self, session_id: &str, wav: Vec<u8>) -> Result<TurnReply> {
        tracing::debug!(audio_bytes = wav.len(), "uploading utterance");

        let file = Part::bytes(wav)
            .file_name("user.wav")
            .mime_str("audio/wav")?;
        let form = Form::new()
            .part("file", file)
            .text("session_id", session_id.to_string());

        let response = self
            .client
            .post(self.endpoint("/api/voice-chat"))
            .multipart(form)
            .send()
            .await?;

        let status = response.status();
        if status == StatusCode::NO_CONTENT {
            return Ok(TurnReply::NoResponse);
        }
        if !status.is_success() {
            tracing::warn!(status = %status, "voice-chat rejected utterance");
            return Ok(TurnReply::Rejected(status));
        }

        let session_end = response
            .headers()
            .get(SESSION_END_HEADER)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|v| v.eq_ignore_ascii_case("true"));
        let wav = response.bytes().await?.to_vec();

        Ok(TurnReply::Reply { wav, session_end })
    }

    /// Close the session
    ///
    /// # Errors
    ///
    /// Returns `Error::Http` if the request fails
    pub async fn end_session(&self, session_id: &str) -> Result<()> {
        self.client
            .post(self.endpoint("/api/session/end"))
            .json(&EndRequest { session_id })
            .send()
            .await?;
        tracing::info!(session_id, "turn session ended");
        Ok(())
    }
}

/// Send numeric amounts as JSON numbers, anything else as a string
fn amount_value(amount: &str) -> serde_json::Value {
    amount
        .trim()
        .parse::<u64>()
        .map_or_else(|_| serde_json::Value::from(amount), serde_json::Value::from)
}

/// A turn-based call: record, upload, play, repeat
pub struct TurnSession {
    client: TurnClient,
    capture: Option<Box<dyn CaptureDevice>>,
    scheduler: PlaybackScheduler,
    record_window: Duration,
    session_id: Option<String>,
    log: Arc<dyn EventSink>,
}

impl TurnSession {
    #[must_use]
    pub fn new(
        client: TurnClient,
        devices: Devices,
        record_window: Duration,
        log: Arc<dyn EventSink>,
    ) -> Self {
        Self {
            client,
            capture: devices.capture,
            scheduler: PlaybackScheduler::new(devices.output),
            record_window,
            session_id: None,
            log,
        }
    }

    /// Id of the open session
    #[must_use]
    pub fn session_id(&self) -> Option<&str> {
        self.session_id.as_deref()
    }

    /// Open a session and play the greeting
    ///
    /// # Errors
    ///
    /// Returns an error if the session cannot be started or the microphone
    /// cannot be opened
    pub async fn start(&mut self, due_amount: &str, lang: &str) -> Result<()> {
        let capture = self
            .capture
            .as_mut()
            .ok_or_else(|| Error::Device("no microphone available".to_string()))?;
        capture.probe()?;

        let session_id = self.client.start_session(due_amount, lang).await?;
        self.log.push(&format!("session {session_id} started"));
        self.session_id = Some(session_id.clone());

        if let Some(greeting) = self.client.kickoff(&session_id).await? {
            self.play(&greeting).await;
        }
        Ok(())
    }

    /// Exchange turns until the server ends the session
    ///
    /// # Errors
    ///
    /// Returns an error if there is no open session or recording fails
    pub async fn converse(&mut self) -> Result<()> {
        let session_id = self
            .session_id
            .clone()
            .ok_or_else(|| Error::ProtocolViolation("no open session".to_string()))?;

        loop {
            self.log.push("Listening… speak now");
            let wav = self.record().await?;

            self.log.push("Processing…");
            match self.client.send_utterance(&session_id, wav).await {
                Ok(TurnReply::NoResponse) => self.log.push("No response, retrying…"),
                Ok(TurnReply::Rejected(status)) => self.log.push(&format!("Server error {status}")),
                Ok(TurnReply::Reply { wav, session_end }) => {
                    self.log.push("Playing reply…");
                    self.play(&wav).await;
                    if session_end {
                        self.log.push("Call ended.");
                        return Ok(());
                    }
                }
                Err(e) => self.log.push(&format!("Send error: {e}")),
            }
        }
    }

    /// Close the session; errors are logged and ignored
    pub async fn end(&mut self) {
        if let Some(capture) = self.capture.as_mut() {
            capture.stop();
        }
        if let Some(session_id) = self.session_id.take() {
            if let Err(e) = self.client.end_session(&session_id).await {
                tracing::debug!(error = %e, "session end failed");
            }
            self.log.push("Disconnected.");
        }
    }

    async fn record(&mut self) -> Result<Vec<u8>> {
        let capture = self
            .capture
            .as_mut()
            .ok_or_else(|| Error::Device("no microphone available".to_string()))?;

        let (tx, mut rx) = mpsc::channel(64);
        let rate = capture.start(tx)?;

        let mut samples = Vec::new();
        let window = tokio::time::sleep(self.record_window);
        tokio::pin!(window);
        loop {
            tokio::select! {
                () = &mut window => break,
                chunk = rx.recv() => match chunk {
                    Some(chunk) => samples.extend(chunk),
                    None => break,
                },
            }
        }
        capture.stop();
        while let Ok(chunk) = rx.try_recv() {
            samples.extend(chunk);
        }

        tracing::debug!(samples = samples.len(), rate, "utterance recorded");
        samples_to_wav(&samples, rate)
    }

    /// Play a WAV clip and wait for it to finish
    async fn play(&mut self, wav: &[u8]) {
        let (samples, rate) = match wav_to_samples(wav) {
            Ok(decoded) => decoded,
            Err(e) => {
                tracing::warn!(error = %e, "reply is not a playable WAV");
                self.log.push(&format!("bad audio reply: {e}"));
                return;
            }
        };

        if self.scheduler.schedule(&samples, rate).is_some() {
            let left = self.scheduler.remaining();
            tokio::time::sleep(Duration::from_secs_f64(left)).await;
        }
    }
}
