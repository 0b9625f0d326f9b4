//! Streaming relay for speech synthesis and story generation.
//!
//! Browser clients connect over a websocket and send JSON control messages.
//! Each request opens its own upstream session:
//!
//! - `tts`: a binary websocket to the Volcano TTS service. Audio frames are
//!   decoded, decompressed and relayed as base64 `tts_audio` messages.
//! - `generate_story`: a streaming chat-completion POST. `data: ` lines are
//!   reassembled, parsed and relayed as `story_chunk` / `story_reasoning`.
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use storyvoice_relay::{Config, gateway};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = Config::load(None)?;
//!     gateway::serve(Arc::new(config)).await?;
//!     Ok(())
//! }
//! ```
//!
//! # Client messages
//!
//! ```text
//! -> {"type":"tts","text":"从前有座山","voiceId":"S_xxx"}
//! <- {"type":"tts_audio","data":"SUQz..."}
//! <- {"type":"tts_complete"}
//!
//! -> {"type":"generate_story","title":"小红帽","prompt":"..."}
//! <- {"type":"story_reasoning","chunk":"..."}
//! <- {"type":"story_chunk","chunk":"..."}
//! <- {"type":"story_complete"}
//! ```
//!
//! Any failure is reported as `{"type":"error","message":"..."}` and only
//! ends the upstream session it belongs to.

pub mod config;
pub mod error;
pub mod gateway;
pub mod protocol;
pub mod session;
pub mod sse;
pub mod story;
pub mod tts;
pub mod types;
pub mod upstream;

pub use config::{Config, LlmConfig, TimeoutConfig, TtsConfig, VoiceClass, VoiceRoute};
pub use error::{ControlError, DecodeError, Error, ParseError, Result};
pub use gateway::{AppState, router, serve, serve_listener};
pub use session::ClientSession;
pub use story::StoryUpstream;
pub use tts::TtsUpstream;
pub use types::{
    ClientMessage, RequestKind, ServerMessage, SessionState, StoryRequest, SynthesisRequest,
    TextDelta, UpstreamEvent,
};
pub use upstream::{EventSink, RoutedEvent, UpstreamHandle};
