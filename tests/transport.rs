//! Transport lifecycle integration tests
//!
//! Drives the voice client against an in-memory agent with paused time, so
//! backoff and keep-alive timings are exact.

use std::sync::Arc;
use std::time::Duration;

use base64::Engine;
use beacon_call::audio::encode_pcm16le;
use beacon_call::{ConnectionState, Devices, Frame, MicAccess, VoiceClient};
use serde_json::json;
use tokio::sync::mpsc;
use tokio::time::Instant;

mod common;

use common::{
    FakeCapture, FakeOutput, MemoryConnector, MicBehavior, MicHandle, Peer, SpeakerHandle,
    eventually, sine, test_config,
};

struct Harness {
    client: VoiceClient,
    connector: Arc<MemoryConnector>,
    peers: mpsc::UnboundedReceiver<Peer>,
    mic: MicHandle,
    speaker: SpeakerHandle,
}

impl Harness {
    fn start(mic: MicBehavior) -> Self {
        let (connector, peers) = MemoryConnector::new();
        let (capture, mic) = FakeCapture::new(48_000, mic);
        let (output, speaker) = FakeOutput::new();
        let devices = Devices {
            capture: Some(Box::new(capture)),
            output: Some(Box::new(output)),
        };
        let client = VoiceClient::new(&test_config(), connector.clone(), devices);

        Self {
            client,
            connector,
            peers,
            mic,
            speaker,
        }
    }

    /// Connect and consume the initiation message
    async fn open(&mut self) -> Peer {
        self.client.connect().await;
        let mut peer = self.peers.recv().await.expect("no connection");
        let init = peer.next_json().await.expect("no initiation");
        assert_eq!(init["type"], "conversation_initiation_client_data");
        peer
    }

    async fn ready(&self, peer: &Peer) {
        peer.send_json(&json!({
            "type": "conversation_initiation_metadata",
            "conversation_initiation_metadata_event": { "conversation_id": "conv_1" }
        }));
        self.client
            .wait_for(|s| s.agent_ready)
            .await
            .expect("client exited");
    }

    fn logged(&self, needle: &str) -> bool {
        self.count(needle) > 0
    }

    fn count(&self, needle: &str) -> usize {
        self.client
            .logs()
            .iter()
            .filter(|line| line.contains(needle))
            .count()
    }
}

// ---- handshake ----

#[tokio::test(start_paused = true)]
async fn test_initiation_is_first_message() {
    let mut h = Harness::start(MicBehavior::Works);
    h.client.connect().await;

    let mut peer = h.peers.recv().await.unwrap();
    assert!(peer.url.starts_with("ws://agent.test/ws/app?"));
    assert!(peer.url.contains("agent_name=Pooja"));
    assert!(peer.url.contains("customer_name=Ram"));
    assert!(peer.url.contains("amount=15000"));
    assert!(peer.url.contains("due_date=20th"));
    assert!(peer.url.contains("&sid="));

    let init = peer.next_json().await.unwrap();
    assert_eq!(init["type"], "conversation_initiation_client_data");
    assert_eq!(
        init["conversation_config_override"]["conversation"]["text_only"],
        false
    );

    let vars = init["dynamic_variables"]["variables"].as_array().unwrap();
    let names: Vec<_> = vars.iter().map(|v| v["name"].as_str().unwrap()).collect();
    assert_eq!(
        names,
        ["agent_name", "customer_name", "amount", "due_date", "sid"]
    );
    assert_eq!(vars[0]["value"], "Pooja");

    let status = h.client.wait_for(|s| s.connected).await.unwrap();
    assert_eq!(status.state, ConnectionState::Open);
    assert_eq!(status.connections, 1);
    assert!(status.session_id.is_some());
    assert!(h.logged("WS OPEN"));
}

#[tokio::test(start_paused = true)]
async fn test_nested_initiation_shape() {
    let (connector, mut peers) = MemoryConnector::new();
    let mut config = test_config();
    config.agent.initiation_shape = beacon_call::InitiationShape::Nested;
    let client = VoiceClient::new(&config, connector, Devices::none());

    client.connect().await;
    let mut peer = peers.recv().await.unwrap();
    let init = peer.next_json().await.unwrap();

    assert_eq!(init["type"], "conversation_initiation_client_data");
    assert!(init.get("dynamic_variables").is_none());
    assert_eq!(
        init["conversation_initiation_client_data"]["conversation_config_override"]["conversation"]
            ["text_only"],
        false
    );
}

#[tokio::test(start_paused = true)]
async fn test_connect_while_open_is_ignored() {
    let mut h = Harness::start(MicBehavior::Works);
    let mut peer = h.open().await;

    h.client.connect().await;
    h.client.connect().await;
    h.client.send_text("still here").await;

    // Commands run in order, so the text arriving means both connects were seen
    let msg = peer.next_of_type("user_message").await.unwrap();
    assert_eq!(msg["text"], "still here");
    assert!(h.peers.try_recv().is_err());
    assert_eq!(h.connector.attempts().len(), 1);
}

// ---- readiness ----

#[tokio::test(start_paused = true)]
async fn test_ready_auto_starts_mic_once() {
    let mut h = Harness::start(MicBehavior::Works);
    let mut peer = h.open().await;

    // Open but not ready: no audio yet
    let status = h.client.status();
    assert_eq!(status.mic_access, MicAccess::Granted);
    assert!(!status.mic_on);
    assert_eq!(h.mic.starts(), 0);

    h.ready(&peer).await;
    let status = h.client.wait_for(|s| s.mic_on).await.unwrap();
    assert_eq!(status.status, "Streaming mic");
    assert_eq!(h.mic.starts(), 1);
    assert!(h.logged("Mic ON (inRate=48000)"));

    // A repeated readiness message does not restart capture
    peer.send_json(&json!({ "type": "agent_ready" }));
    h.client.stop_mic(false).await;
    h.client.wait_for(|s| !s.mic_on).await.unwrap();
    peer.send_json(&json!({ "type": "agent_ready" }));
    assert!(eventually(|| h.count("agent initialized") == 3).await);
    assert_eq!(h.mic.starts(), 1);
    assert!(!h.client.status().mic_on);
    assert!(peer.sent_so_far().iter().all(|f| !matches!(f, Frame::Binary(_))));
}

#[tokio::test(start_paused = true)]
async fn test_mic_start_requires_open_connection() {
    let h = Harness::start(MicBehavior::Works);

    h.client.start_mic().await;
    h.client.prefetch_permission().await;
    let status = h
        .client
        .wait_for(|s| s.mic_access == MicAccess::Granted)
        .await
        .unwrap();

    assert!(!status.mic_on);
    assert_eq!(h.mic.starts(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_uplink_frames_after_ready() {
    let mut h = Harness::start(MicBehavior::Works);
    let mut peer = h.open().await;
    h.ready(&peer).await;
    h.client.wait_for(|s| s.mic_on).await.unwrap();

    // 100 ms at 48 kHz in odd-sized callback chunks
    let raw = sine(1000.0, 48_000, 4800, 0.5);
    for chunk in raw.chunks(1000) {
        assert!(h.mic.feed(chunk.to_vec()));
    }

    let frame = peer.next_binary().await.unwrap();
    assert_eq!(frame.len(), 3200);
}

#[tokio::test(start_paused = true)]
async fn test_stop_mic_flushes_partial_frame_and_ends_turn() {
    let mut h = Harness::start(MicBehavior::Works);
    let mut peer = h.open().await;
    h.ready(&peer).await;
    h.client.wait_for(|s| s.mic_on).await.unwrap();

    // Half a frame never fills the accumulator
    assert!(h.mic.feed(vec![0.25; 2400]));
    h.client.stop_mic(true).await;

    let tail = peer.next_binary().await.unwrap();
    assert_eq!(tail.len(), 1600);
    let end = peer.next_json().await.unwrap();
    assert_eq!(end["type"], "user_audio_end");

    let status = h.client.wait_for(|s| !s.mic_on).await.unwrap();
    assert!(status.connected);
    assert!(!h.mic.is_running());
}

// ---- permission ----

#[tokio::test(start_paused = true)]
async fn test_permission_denied_aborts_connect() {
    let h = Harness::start(MicBehavior::Denied);
    h.client.connect().await;

    let status = h
        .client
        .wait_for(|s| s.mic_access == MicAccess::Denied)
        .await
        .unwrap();
    assert_eq!(status.state, ConnectionState::Disconnected);
    assert_eq!(status.status, "Microphone permission denied.");

    // No reconnect is ever scheduled for a denial
    tokio::time::sleep(Duration::from_secs(60)).await;
    assert!(h.connector.attempts().is_empty());
    assert!(h.client.status().reconnect_in.is_none());
}

#[tokio::test(start_paused = true)]
async fn test_missing_mic_continues_text_only() {
    let mut h = Harness::start(MicBehavior::Missing);
    let mut peer = h.open().await;
    h.ready(&peer).await;

    let status = h.client.status();
    assert_eq!(status.mic_access, MicAccess::Unavailable);
    assert!(!status.mic_on);

    h.client.send_text("hello").await;
    let msg = peer.next_json().await.unwrap();
    assert_eq!(msg["type"], "user_message");
}

// ---- outbound ----

#[tokio::test(start_paused = true)]
async fn test_send_text_trims_and_skips_blank() {
    let mut h = Harness::start(MicBehavior::Works);
    let mut peer = h.open().await;

    h.client.send_text("   ").await;
    h.client.send_text("  namaste  ").await;

    let msg = peer.next_json().await.unwrap();
    assert_eq!(
        msg,
        json!({ "type": "user_message", "text": "namaste", "expect_audio": true })
    );
    assert!(h.logged("sent: \"namaste\""));
}

#[tokio::test(start_paused = true)]
async fn test_send_text_while_disconnected_is_dropped() {
    let mut h = Harness::start(MicBehavior::Works);
    h.client.send_text("too early").await;

    let mut peer = h.open().await;
    h.client.send_text("on time").await;

    let msg = peer.next_json().await.unwrap();
    assert_eq!(msg["text"], "on time");
}

#[tokio::test(start_paused = true)]
async fn test_keepalive_every_twenty_seconds() {
    let mut h = Harness::start(MicBehavior::Works);
    let mut peer = h.open().await;
    let opened = Instant::now();

    let first = peer.next_of_type("client_keepalive").await.unwrap();
    assert_eq!(opened.elapsed(), Duration::from_secs(20));
    let ts = first["ts"].as_str().unwrap();
    assert!(chrono::DateTime::parse_from_rfc3339(ts).is_ok());

    peer.next_of_type("client_keepalive").await.unwrap();
    assert_eq!(opened.elapsed(), Duration::from_secs(40));
}

// ---- inbound ----

#[tokio::test(start_paused = true)]
async fn test_binary_audio_plays_back_to_back() {
    let mut h = Harness::start(MicBehavior::Works);
    let peer = h.open().await;

    // Two 100 ms chunks at 16 kHz
    let pcm = encode_pcm16le(&sine(440.0, 16_000, 1600, 0.5));
    peer.send_binary(pcm.clone());
    peer.send_binary(pcm.clone());
    assert!(eventually(|| h.speaker.queued().len() == 2).await);

    let queued = h.speaker.queued();
    assert!(queued[0].start.abs() < 1e-9);
    assert!((queued[1].start - 0.1).abs() < 1e-9);
    assert!(queued.iter().all(|q| q.samples == 1600 && q.rate == 16_000));

    // After an underrun the next chunk starts at the device clock
    h.speaker.set_time(5.0);
    peer.send_binary(pcm);
    assert!(eventually(|| h.speaker.queued().len() == 3).await);
    assert!((h.speaker.queued()[2].start - 5.0).abs() < 1e-9);
    assert!(h.logged("raw chunk 3200 bytes"));
}

#[tokio::test(start_paused = true)]
async fn test_inline_audio_event_is_scheduled() {
    let mut h = Harness::start(MicBehavior::Works);
    let peer = h.open().await;

    let pcm = encode_pcm16le(&[0.1; 800]);
    let encoded = base64::engine::general_purpose::STANDARD.encode(&pcm);
    peer.send_json(&json!({ "type": "audio", "audio_event": { "audio_base_64": encoded } }));

    assert!(eventually(|| h.speaker.queued().len() == 1).await);
    assert_eq!(h.speaker.queued()[0].samples, 800);
}

#[tokio::test(start_paused = true)]
async fn test_malformed_audio_is_dropped() {
    let mut h = Harness::start(MicBehavior::Works);
    let peer = h.open().await;

    peer.send_binary(vec![1, 2, 3]);
    peer.send_text("not json at all");
    assert!(eventually(|| h.logged("RAW: not json at all")).await);

    assert!(h.logged("dropped audio"));
    assert!(h.speaker.queued().is_empty());
    assert!(h.client.status().connected);
}

#[tokio::test(start_paused = true)]
async fn test_transcripts_and_ping_are_logged() {
    let mut h = Harness::start(MicBehavior::Missing);
    let peer = h.open().await;

    peer.send_json(&json!({
        "type": "agent_response",
        "agent_response_event": { "agent_response": "Hello Ram" }
    }));
    peer.send_json(&json!({
        "type": "user_transcript",
        "user_transcription_event": { "user_transcript": "hi" }
    }));
    peer.send_json(&json!({ "type": "ping", "ping_event": { "event_id": 7 } }));

    let status = h
        .client
        .wait_for(|s| s.status == "Listening…")
        .await
        .unwrap();
    assert!(status.connected);
    assert!(h.logged("agent: Hello Ram"));
    assert!(h.logged("user: hi"));
    assert!(h.logged("listening…"));
}

// ---- reconnect ----

#[tokio::test(start_paused = true)]
async fn test_unexpected_close_reconnects_with_backoff() {
    let mut h = Harness::start(MicBehavior::Works);
    let mut peer = h.open().await;

    h.connector.refuse(1);
    peer.drop_connection();
    let lost_at = Instant::now();

    let status = h
        .client
        .wait_for(|s| s.reconnect_in.is_some())
        .await
        .unwrap();
    assert_eq!(status.state, ConnectionState::Disconnected);
    assert_eq!(status.status, "Reconnecting in 2s");
    assert!(h.logged("WS CLOSE (none)"));

    // First retry at +2 s is refused, the next waits another 4 s
    let mut second = h.peers.recv().await.unwrap();
    second.next_json().await.unwrap();

    let attempts = h.connector.attempts();
    assert_eq!(attempts.len(), 3);
    assert!(attempts[1].refused);
    assert_eq!(attempts[1].at - lost_at, Duration::from_secs(2));
    assert_eq!(attempts[2].at - lost_at, Duration::from_secs(6));

    // A successful open resets the counter
    let status = h.client.wait_for(|s| s.connected).await.unwrap();
    assert_eq!(status.retries, 0);
    assert_eq!(status.connections, 2);
}

#[tokio::test(start_paused = true)]
async fn test_reconnect_countdown_ticks_down() {
    let mut h = Harness::start(MicBehavior::Works);
    let mut peer = h.open().await;

    h.connector.refuse(1);
    peer.drop_connection();
    let status = h
        .client
        .wait_for(|s| s.reconnect_in.is_some())
        .await
        .unwrap();
    assert_eq!(status.status, "Reconnecting in 2s");

    tokio::time::sleep(Duration::from_millis(1500)).await;
    let status = h.client.status();
    assert_eq!(status.status, "Reconnecting in 1s");
    assert_eq!(status.reconnect_in, Some(Duration::from_secs(1)));

    // The refused retry starts a fresh 4 s countdown
    tokio::time::sleep(Duration::from_millis(1000)).await;
    assert_eq!(h.client.status().status, "Reconnecting in 4s");
    tokio::time::sleep(Duration::from_millis(3000)).await;
    assert_eq!(h.client.status().status, "Reconnecting in 1s");
}

#[tokio::test(start_paused = true)]
async fn test_disconnect_abandons_hung_handshake() {
    let h = Harness::start(MicBehavior::Works);
    h.connector.stall(1);

    h.client.connect().await;
    h.client
        .wait_for(|s| s.state == ConnectionState::Connecting)
        .await
        .unwrap();
    let asked = Instant::now();

    h.client.disconnect().await;
    let status = h
        .client
        .wait_for(|s| s.state == ConnectionState::Disconnected)
        .await
        .unwrap();
    assert_eq!(asked.elapsed(), Duration::ZERO);
    assert!(status.reconnect_in.is_none());
    assert_eq!(status.status, "Not connected");
    assert!(h.logged("connect cancelled"));

    // The abandoned attempt never times out into a retry
    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(h.connector.attempts().len(), 1);
    assert!(!h.logged("connect error"));
}

#[tokio::test(start_paused = true)]
async fn test_agent_close_code_is_logged_and_mic_stops() {
    let mut h = Harness::start(MicBehavior::Works);
    let peer = h.open().await;
    h.ready(&peer).await;
    h.client.wait_for(|s| s.mic_on).await.unwrap();

    peer.close(1011);
    let status = h.client.wait_for(|s| !s.connected).await.unwrap();

    assert!(!status.mic_on);
    assert!(!status.agent_ready);
    assert!(!h.mic.is_running());
    assert!(h.logged("WS CLOSE (1011)"));
}

#[tokio::test(start_paused = true)]
async fn test_manual_disconnect_cancels_pending_reconnect() {
    let mut h = Harness::start(MicBehavior::Works);
    let mut peer = h.open().await;

    peer.drop_connection();
    h.client
        .wait_for(|s| s.reconnect_in.is_some())
        .await
        .unwrap();

    h.client.disconnect().await;
    let status = h
        .client
        .wait_for(|s| s.reconnect_in.is_none())
        .await
        .unwrap();
    assert_eq!(status.status, "Not connected");
    assert!(h.logged("pending reconnect cancelled"));

    tokio::time::sleep(Duration::from_secs(120)).await;
    assert_eq!(h.connector.attempts().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_manual_disconnect_closes_normally() {
    let mut h = Harness::start(MicBehavior::Works);
    let peer = h.open().await;
    h.ready(&peer).await;

    h.client.disconnect().await;
    let status = h.client.wait_for(|s| !s.connected).await.unwrap();

    assert_eq!(peer.closed_with(), Some((1000, "manual".to_string())));
    assert!(!status.mic_on);
    assert!(h.logged("manually closed"));

    tokio::time::sleep(Duration::from_secs(120)).await;
    assert_eq!(h.connector.attempts().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_connect_after_manual_disconnect() {
    let mut h = Harness::start(MicBehavior::Works);
    let _first = h.open().await;

    h.client.disconnect().await;
    h.client.wait_for(|s| !s.connected).await.unwrap();

    let _second = h.open().await;
    let status = h.client.wait_for(|s| s.connected).await.unwrap();
    assert_eq!(status.connections, 2);
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_closes_connection() {
    let mut h = Harness::start(MicBehavior::Works);
    let peer = h.open().await;

    h.client.shutdown().await;
    assert_eq!(peer.closed_with(), Some((1000, "manual".to_string())));
}
