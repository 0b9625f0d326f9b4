//! Requests, upstream events and the client-facing JSON messages.

use base64::{Engine, engine::general_purpose::STANDARD as BASE64};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::config::{TtsConfig, VoiceClass};
use crate::error::ControlError;

// ================== Requests ==================

/// Which kind of upstream a request drives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RequestKind {
    Tts,
    Story,
}

impl RequestKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RequestKind::Tts => "tts",
            RequestKind::Story => "story",
        }
    }
}

/// A text-to-speech request, normalized for the vendor.
#[derive(Debug, Clone, PartialEq)]
pub struct SynthesisRequest {
    /// Text, already cut to the configured character limit.
    pub text: String,
    pub voice_id: String,
    pub voice_class: VoiceClass,
    /// Fresh id sent to the vendor as `reqid`.
    pub request_id: String,
}

impl SynthesisRequest {
    /// Builds a request: truncates the text, fills in the default voice and
    /// classifies it.
    pub fn new(text: &str, voice_id: &str, tts: &TtsConfig) -> Self {
        let voice_id = if voice_id.is_empty() {
            tts.default_voice.clone()
        } else {
            voice_id.to_string()
        };
        Self {
            text: text.chars().take(tts.max_text_chars).collect(),
            voice_class: tts.classify(&voice_id),
            voice_id,
            request_id: Uuid::new_v4().to_string(),
        }
    }
}

/// A story-generation request.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StoryRequest {
    pub title: String,
    pub prompt: String,
    /// Extra model parameters merged into the upstream request body.
    pub extra: Map<String, Value>,
}

// ================== Upstream Events ==================

/// Incremental text from the generation stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TextDelta {
    /// Visible story text.
    Content(String),
    /// Model reasoning, relayed on its own channel.
    Reasoning(String),
}

/// Event produced by an upstream session for its owning client session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpstreamEvent {
    Audio(Bytes),
    Text(TextDelta),
    Complete,
    Error(String),
}

impl UpstreamEvent {
    /// Returns true for the last event an upstream session emits.
    pub fn is_terminal(&self) -> bool {
        matches!(self, UpstreamEvent::Complete | UpstreamEvent::Error(_))
    }
}

/// Lifecycle of one upstream session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SessionState {
    #[default]
    Idle,
    /// Opening the vendor websocket.
    Connecting,
    /// Waiting for HTTP response headers.
    Requesting,
    Streaming,
    Completed,
    Failed,
    Closed,
}

impl SessionState {
    /// Returns true once no further events may be emitted.
    pub fn is_done(&self) -> bool {
        matches!(
            self,
            SessionState::Completed | SessionState::Failed | SessionState::Closed
        )
    }
}

// ================== Client Wire Messages ==================

/// Control message sent by a client.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    Tts {
        #[serde(default)]
        text: String,
        #[serde(default, rename = "voiceId")]
        voice_id: String,
    },
    GenerateStory {
        #[serde(default)]
        title: String,
        #[serde(default)]
        prompt: String,
        #[serde(flatten)]
        extra: Map<String, Value>,
    },
}

impl ClientMessage {
    /// Parses a text frame from the client.
    pub fn parse(text: &str) -> Result<Self, ControlError> {
        let value: Value = serde_json::from_str(text).map_err(|_| ControlError::InvalidFormat)?;
        let kind = value
            .get("type")
            .and_then(Value::as_str)
            .ok_or(ControlError::InvalidFormat)?;

        match kind {
            "tts" | "generate_story" => {
                serde_json::from_value(value).map_err(|_| ControlError::InvalidFormat)
            }
            other => Err(ControlError::UnknownType(other.to_string())),
        }
    }
}

/// Message sent to a client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    TtsAudio { data: String },
    TtsComplete,
    StoryChunk { chunk: String },
    StoryReasoning { chunk: String },
    StoryComplete,
    Error { message: String },
}

impl ServerMessage {
    pub fn error(message: impl Into<String>) -> Self {
        ServerMessage::Error {
            message: message.into(),
        }
    }

    /// Maps an upstream event to the message relayed for `kind`.
    pub fn from_upstream(kind: RequestKind, event: UpstreamEvent) -> Self {
        match (kind, event) {
            (_, UpstreamEvent::Audio(bytes)) => ServerMessage::TtsAudio {
                data: BASE64.encode(&bytes),
            },
            (_, UpstreamEvent::Text(TextDelta::Content(chunk))) => {
                ServerMessage::StoryChunk { chunk }
            }
            (_, UpstreamEvent::Text(TextDelta::Reasoning(chunk))) => {
                ServerMessage::StoryReasoning { chunk }
            }
            (RequestKind::Tts, UpstreamEvent::Complete) => ServerMessage::TtsComplete,
            (RequestKind::Story, UpstreamEvent::Complete) => ServerMessage::StoryComplete,
            (_, UpstreamEvent::Error(message)) => ServerMessage::Error { message },
        }
    }

    /// Serializes to the JSON text frame.
    pub fn to_json(&self) -> String {
        // Every variant is a plain struct of strings; serialization cannot fail.
        serde_json::to_string(self).unwrap_or_default()
    }
}
