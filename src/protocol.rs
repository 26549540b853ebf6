//! Control messages exchanged with the conversational agent
//!
//! Inbound text frames are JSON objects discriminated by `type`. They are
//! parsed into the closed [`InboundMessage`] set; anything else lands in
//! [`InboundMessage::Unknown`] with the raw payload kept for logging.

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{Error, Result};

/// Message kinds that mark the agent as ready for audio
const READY_KINDS: [&str; 2] = ["conversation_initiation_metadata", "agent_ready"];

/// A parsed inbound control message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundMessage {
    /// Initiation acknowledged; the agent accepts audio from now on
    AgentReady { conversation_id: Option<String> },
    /// Server liveness ping
    Ping { event_id: Option<u64> },
    /// Text of what the agent said
    AgentResponse { text: String },
    /// Server-side transcript of what the user said
    UserTranscript { text: String },
    /// Inline PCM16LE audio at 16 kHz, already base64-decoded
    Audio { pcm: Vec<u8> },
    /// Any other JSON object
    Unknown { kind: Option<String>, raw: String },
}

#[derive(Debug, Default, Deserialize)]
struct Envelope {
    #[serde(rename = "type")]
    kind: Option<String>,
    ping_event: Option<PingEvent>,
    conversation_initiation_metadata_event: Option<InitiationMetadataEvent>,
    agent_response_event: Option<AgentResponseEvent>,
    user_transcription_event: Option<UserTranscriptionEvent>,
    audio_event: Option<AudioEvent>,
}

#[derive(Debug, Default, Deserialize)]
struct PingEvent {
    event_id: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct InitiationMetadataEvent {
    conversation_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct AgentResponseEvent {
    agent_response: Option<String>,
}

#[derive(Debug, Deserialize)]
struct UserTranscriptionEvent {
    user_transcript: Option<String>,
}

#[derive(Debug, Deserialize)]
struct AudioEvent {
    audio_base_64: Option<String>,
}

impl InboundMessage {
    /// Parse one inbound text frame
    ///
    /// # Errors
    ///
    /// Returns `Error::Format` if the frame is not JSON, a known message has
    /// the wrong field types, or inline audio is not valid base64
    pub fn parse(text: &str) -> Result<Self> {
        let value: Value = serde_json::from_str(text)
            .map_err(|e| Error::Format(format!("inbound frame is not JSON: {e}")))?;

        if !value.is_object() {
            return Ok(Self::Unknown {
                kind: None,
                raw: text.to_string(),
            });
        }

        let env: Envelope = serde_json::from_value(value)
            .map_err(|e| Error::Format(format!("malformed control message: {e}")))?;
        let kind = env.kind.as_deref();

        if kind.is_some_and(|k| READY_KINDS.contains(&k)) {
            return Ok(Self::AgentReady {
                conversation_id: env
                    .conversation_initiation_metadata_event
                    .and_then(|e| e.conversation_id),
            });
        }

        if kind == Some("ping") || env.ping_event.is_some() {
            return Ok(Self::Ping {
                event_id: env.ping_event.and_then(|p| p.event_id),
            });
        }

        match kind {
            Some("agent_response") => Ok(Self::AgentResponse {
                text: env
                    .agent_response_event
                    .and_then(|e| e.agent_response)
                    .unwrap_or_default(),
            }),
            Some("user_transcript") => Ok(Self::UserTranscript {
                text: env
                    .user_transcription_event
                    .and_then(|e| e.user_transcript)
                    .unwrap_or_default(),
            }),
            Some("audio") => {
                let encoded = env
                    .audio_event
                    .and_then(|e| e.audio_base_64)
                    .unwrap_or_default();
                let pcm = BASE64
                    .decode(encoded.as_bytes())
                    .map_err(|e| Error::Format(format!("inline audio is not base64: {e}")))?;
                Ok(Self::Audio { pcm })
            }
            _ => Ok(Self::Unknown {
                kind: env.kind,
                raw: text.to_string(),
            }),
        }
    }
}

/// Wire shape of the initiation message
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InitiationShape {
    /// Overrides and variables at the top level
    #[default]
    Flat,
    /// Overrides wrapped under `conversation_initiation_client_data`
    Nested,
}

/// One `{name, value}` dynamic variable
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DynamicVariable {
    pub name: String,
    pub value: String,
}

impl DynamicVariable {
    #[must_use]
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConfigOverride {
    pub conversation: ConversationOverride,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConversationOverride {
    pub text_only: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DynamicVariables {
    pub variables: Vec<DynamicVariable>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InitiationBody {
    pub conversation_config_override: ConfigOverride,
    pub dynamic_variables: DynamicVariables,
}

/// Payload of `conversation_initiation_client_data`
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConversationInitiation {
    #[serde(flatten)]
    flat: Option<InitiationBody>,
    #[serde(skip_serializing_if = "Option::is_none")]
    conversation_initiation_client_data: Option<InitiationBody>,
}

impl ConversationInitiation {
    /// Build an initiation that enables audio and carries `variables`
    #[must_use]
    pub fn new(shape: InitiationShape, variables: Vec<DynamicVariable>) -> Self {
        let body = InitiationBody {
            conversation_config_override: ConfigOverride {
                conversation: ConversationOverride { text_only: false },
            },
            dynamic_variables: DynamicVariables { variables },
        };
        match shape {
            InitiationShape::Flat => Self {
                flat: Some(body),
                conversation_initiation_client_data: None,
            },
            InitiationShape::Nested => Self {
                flat: None,
                conversation_initiation_client_data: Some(body),
            },
        }
    }
}

/// Outbound control message
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutboundMessage {
    /// Sent once per connection right after the handshake
    ConversationInitiationClientData(ConversationInitiation),
    /// Liveness message with an ISO-8601 timestamp
    ClientKeepalive { ts: String },
    /// Typed user text
    UserMessage { text: String, expect_audio: bool },
    /// End of the user's spoken turn
    UserAudioEnd,
}

impl OutboundMessage {
    /// Keep-alive stamped with the current wall-clock time
    #[must_use]
    pub fn keepalive_now() -> Self {
        Self::ClientKeepalive {
            ts: chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true),
        }
    }

    /// User text asking for a spoken reply
    #[must_use]
    pub fn user_text(text: impl Into<String>) -> Self {
        Self::UserMessage {
            text: text.into(),
            expect_audio: true,
        }
    }

    /// Serialize to a JSON text frame
    ///
    /// # Errors
    ///
    /// Returns `Error::Serialization` if encoding fails
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}
