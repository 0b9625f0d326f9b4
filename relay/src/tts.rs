//! Upstream TTS session over the Volcano binary websocket protocol.
//!
//! One session per synthesis request:
//! `Idle -> Connecting -> Streaming -> {Completed | Failed} -> Closed`.
//!
//! [`TtsMachine`] is the state machine; it reacts to a closed set of
//! [`Inbound`] events and never touches the network. [`TtsUpstream::run`]
//! owns the websocket and feeds the machine.

use std::sync::Arc;

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use http::HeaderValue;
use http::header::AUTHORIZATION;
use serde::Serialize;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{Config, VoiceRoute};
use crate::error::{Error, Result};
use crate::protocol::{self, CompressionType, FrameBody};
use crate::types::{SessionState, SynthesisRequest, UpstreamEvent};
use crate::upstream::{EventSink, deadline};

/// Message relayed when the vendor connection drops before completion.
pub const CONNECTION_ERROR: &str = "connection error";

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

// ================== State Machine ==================

/// Everything that can happen to a TTS upstream.
#[derive(Debug, Clone)]
pub enum Inbound {
    /// The websocket is open and the request frame was sent.
    Opened,
    /// One binary message from the vendor.
    Frame(Bytes),
    /// Open, send or receive failed.
    TransportError(String),
    /// The vendor closed the connection.
    Closed,
    /// A connect or idle deadline expired.
    TimedOut,
}

/// Result of feeding one [`Inbound`] to the machine.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct Step {
    /// Events for the client, in order.
    pub events: Vec<UpstreamEvent>,
    /// The transport must be closed now.
    pub close: bool,
}

/// TTS upstream state machine.
#[derive(Debug, Default)]
pub struct TtsMachine {
    state: SessionState,
    chunks: u64,
    bytes: u64,
}

impl TtsMachine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Audio chunks and bytes relayed so far.
    pub fn stats(&self) -> (u64, u64) {
        (self.chunks, self.bytes)
    }

    /// Marks the transport as being opened.
    pub fn connecting(&mut self) {
        if self.state == SessionState::Idle {
            self.state = SessionState::Connecting;
        }
    }

    /// Final transition; nothing is emitted afterwards.
    pub fn close(&mut self) {
        self.state = SessionState::Closed;
    }

    pub fn handle(&mut self, inbound: Inbound) -> Step {
        if self.state.is_done() {
            return Step::default();
        }

        match inbound {
            Inbound::Opened => {
                if self.state == SessionState::Connecting {
                    self.state = SessionState::Streaming;
                }
                Step::default()
            }
            Inbound::Frame(data) => {
                if self.state != SessionState::Streaming {
                    debug!(state = ?self.state, "frame before stream start ignored");
                    return Step::default();
                }
                self.on_frame(&data)
            }
            Inbound::TransportError(err) => {
                warn!(error = %err, "tts transport error");
                self.fail(CONNECTION_ERROR.to_string())
            }
            Inbound::Closed => {
                warn!("tts upstream closed before completion");
                self.fail(CONNECTION_ERROR.to_string())
            }
            Inbound::TimedOut => {
                warn!("tts upstream timed out");
                self.fail(Error::Timeout("tts").client_message())
            }
        }
    }

    fn on_frame(&mut self, data: &[u8]) -> Step {
        let frame = match protocol::decode(data) {
            Ok(frame) => frame,
            Err(err) => {
                warn!(error = %err, len = data.len(), "dropping undecodable frame");
                return Step::default();
            }
        };

        match frame.body {
            FrameBody::Audio {
                audio, is_final, ..
            } => {
                let mut step = Step::default();
                if !audio.is_empty() {
                    self.chunks += 1;
                    self.bytes += audio.len() as u64;
                    step.events.push(UpstreamEvent::Audio(audio));
                }
                if is_final {
                    self.state = SessionState::Completed;
                    step.events.push(UpstreamEvent::Complete);
                    step.close = true;
                }
                step
            }
            FrameBody::Error(message) => {
                warn!(message = %message, "tts vendor error");
                self.fail(Error::Upstream(message).client_message())
            }
            FrameBody::Other { payload } => {
                debug!(
                    message_type = ?frame.header.message_type,
                    len = payload.len(),
                    "ignoring non-audio frame"
                );
                Step::default()
            }
        }
    }

    fn fail(&mut self, message: String) -> Step {
        self.state = SessionState::Failed;
        Step {
            events: vec![UpstreamEvent::Error(message)],
            close: true,
        }
    }
}

// ================== Vendor Request ==================

/// Application information.
#[derive(Debug, Serialize)]
struct AppInfo {
    appid: String,
    token: String,
    cluster: String,
}

/// User information.
#[derive(Debug, Serialize)]
struct UserInfo {
    uid: String,
}

/// TTS audio parameters.
#[derive(Debug, Serialize)]
struct AudioParams {
    voice_type: String,
    encoding: String,
    speed_ratio: f64,
}

/// TTS request parameters.
#[derive(Debug, Serialize)]
struct RequestParams {
    reqid: String,
    text: String,
    text_type: &'static str,
    operation: &'static str,
}

/// Vendor request body, sent gzip-compressed in one full-client frame.
#[derive(Debug, Serialize)]
struct TtsRequestPayload {
    app: AppInfo,
    user: UserInfo,
    audio: AudioParams,
    request: RequestParams,
}

// ================== Upstream Driver ==================

/// Drives TTS upstream sessions against the configured vendor endpoint.
#[derive(Clone)]
pub struct TtsUpstream {
    config: Arc<Config>,
}

impl TtsUpstream {
    pub fn new(config: Arc<Config>) -> Self {
        Self { config }
    }

    /// Encodes the request frame for `req`, resolving credentials by voice.
    pub fn encode_request(&self, req: &SynthesisRequest) -> Result<(VoiceRoute, Vec<u8>)> {
        let tts = &self.config.tts;
        let route = tts.route(req.voice_class)?;

        let payload = TtsRequestPayload {
            app: AppInfo {
                appid: route.app_id.clone(),
                token: route.token.clone(),
                cluster: route.cluster.clone(),
            },
            user: UserInfo {
                uid: tts.uid.clone(),
            },
            audio: AudioParams {
                voice_type: req.voice_id.clone(),
                encoding: tts.encoding.clone(),
                speed_ratio: tts.speed_ratio,
            },
            request: RequestParams {
                reqid: req.request_id.clone(),
                text: req.text.clone(),
                text_type: "plain",
                operation: "submit",
            },
        };

        let frame = protocol::encode(&payload, CompressionType::Gzip)?;
        Ok((route, frame))
    }

    /// Runs one session to completion, failure or cancellation.
    ///
    /// Emits zero or more `Audio` events followed by exactly one `Complete`
    /// or `Error`, unless cancelled first.
    pub async fn run(&self, req: SynthesisRequest, sink: EventSink, cancel: CancellationToken) {
        let upstream_id = sink.upstream_id();
        let mut machine = TtsMachine::new();

        let (route, frame) = match self.encode_request(&req) {
            Ok(encoded) => encoded,
            Err(err) => {
                warn!(upstream_id, error = %err, "tts request rejected");
                sink.emit(UpstreamEvent::Error(err.client_message())).await;
                machine.close();
                return;
            }
        };

        info!(
            upstream_id,
            reqid = %req.request_id,
            voice = %req.voice_id,
            cluster = %route.cluster,
            chars = req.text.chars().count(),
            "tts session start"
        );

        machine.connecting();
        let opened = tokio::select! {
            _ = cancel.cancelled() => {
                debug!(upstream_id, "tts cancelled while connecting");
                machine.close();
                return;
            }
            opened = self.open(&route.token, frame) => opened,
        };

        let mut ws = match opened {
            Ok(ws) => ws,
            Err(err) => {
                let inbound = match err {
                    Error::Timeout(_) => Inbound::TimedOut,
                    other => Inbound::TransportError(other.to_string()),
                };
                let step = machine.handle(inbound);
                sink.emit_all(step.events).await;
                machine.close();
                return;
            }
        };
        machine.handle(Inbound::Opened);

        let idle = self.config.timeouts.idle();
        loop {
            let next = tokio::select! {
                _ = cancel.cancelled() => {
                    debug!(upstream_id, "tts cancelled");
                    break;
                }
                next = deadline(idle, "idle", ws.next()) => next,
            };

            let inbound = match next {
                Err(_) => Inbound::TimedOut,
                Ok(None) => Inbound::Closed,
                Ok(Some(Err(err))) => Inbound::TransportError(err.to_string()),
                Ok(Some(Ok(WsMessage::Binary(data)))) => Inbound::Frame(data),
                Ok(Some(Ok(WsMessage::Close(_)))) => Inbound::Closed,
                Ok(Some(Ok(WsMessage::Text(text)))) => {
                    debug!(upstream_id, text = %text.as_str(), "ignoring text message from vendor");
                    continue;
                }
                Ok(Some(Ok(_))) => continue,
            };

            let step = machine.handle(inbound);
            if !sink.emit_all(step.events).await {
                debug!(upstream_id, "owner gone");
                break;
            }
            if step.close {
                break;
            }
        }

        if deadline(self.config.timeouts.connect(), "close", ws.close(None))
            .await
            .is_err()
        {
            debug!(upstream_id, "vendor close timed out");
        }
        let (chunks, bytes) = machine.stats();
        info!(upstream_id, state = ?machine.state(), chunks, bytes, "tts session closed");
        machine.close();
    }

    /// Opens the vendor websocket and sends the request frame.
    async fn open(&self, token: &str, frame: Vec<u8>) -> Result<WsStream> {
        let mut request = self.config.tts.url.as_str().into_client_request()?;
        let auth = HeaderValue::from_str(&format!("Bearer;{}", token))
            .map_err(|e| Error::Config(format!("invalid token: {}", e)))?;
        request.headers_mut().insert(AUTHORIZATION, auth);

        let (mut ws, _response) =
            deadline(self.config.timeouts.connect(), "connect", connect_async(request)).await??;
        ws.send(WsMessage::Binary(frame.into())).await?;
        Ok(ws)
    }
}
