//! Error types for the relay.

use thiserror::Error;

/// Result type alias for relay operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Frame-local wire decoding failure.
///
/// A decode error only ever drops the offending frame; the upstream
/// connection stays open.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    /// Buffer shorter than the header it declares.
    #[error("frame truncated: need {need} bytes, have {have}")]
    Truncated { need: usize, have: usize },

    /// Sequence/size fields point past the end of the buffer.
    #[error("payload offset {offset} exceeds frame length {len}")]
    OffsetOverflow { offset: usize, len: usize },

    /// Payload flagged as gzip did not inflate.
    #[error("bad compression: {0}")]
    BadCompression(String),
}

/// A single event-stream line that could not be parsed.
#[derive(Error, Debug)]
#[error("malformed event-stream line: {0}")]
pub struct ParseError(#[from] pub serde_json::Error);

/// A client control message that could not be accepted.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ControlError {
    /// Not JSON, no `type`, or fields of the wrong shape.
    #[error("invalid message format")]
    InvalidFormat,

    /// Well-formed JSON with a `type` this relay does not serve.
    #[error("unknown message type: {0}")]
    UnknownType(String),
}

/// Error type for relay operations.
#[derive(Error, Debug)]
pub enum Error {
    /// Wire frame decoding error.
    #[error("decode error: {0}")]
    Decode(#[from] DecodeError),

    /// JSON serialization/deserialization error.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// YAML configuration error.
    #[error("yaml error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// HTTP request error.
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    /// WebSocket error.
    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    /// IO error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Invalid or incomplete configuration.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// Non-2xx response from an upstream HTTP endpoint.
    #[error("upstream status {status}: {body}")]
    UpstreamStatus { status: u16, body: String },

    /// Error reported by the upstream service itself.
    #[error("upstream error: {0}")]
    Upstream(String),

    /// An upstream operation exceeded its deadline.
    #[error("{0} timed out")]
    Timeout(&'static str),
}

impl Error {
    /// Returns true if the error was raised before any transport was opened.
    pub fn is_config(&self) -> bool {
        matches!(self, Error::Config(_))
    }

    /// Text relayed to a client for this failure.
    pub fn client_message(&self) -> String {
        match self {
            Error::Config(message) => message.clone(),
            Error::Timeout(_) => "upstream timeout".to_string(),
            Error::Upstream(message) => message.clone(),
            other => other.to_string(),
        }
    }
}
