//! Local stand-ins for the TTS vendor and the completion endpoint.

#![allow(dead_code)]

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::{
    Json, Router,
    body::{Body, Bytes},
    extract::State,
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::post,
};
use futures::{SinkExt, StreamExt};
use storyvoice_relay::protocol::{self, BinaryProtocol, FrameBody, Message};
use storyvoice_relay::{Config, EventSink, RequestKind, RoutedEvent, UpstreamEvent};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::tungstenite::handshake::server::{
    ErrorResponse, Request, Response as WsResponse,
};

// ================== Fake TTS Vendor ==================

/// One step of a scripted vendor reply.
#[derive(Clone)]
pub enum VendorStep {
    /// Send raw bytes as one binary message.
    Raw(Vec<u8>),
    /// Send an audio frame.
    Audio(&'static [u8], bool),
    /// Send an error frame.
    Error(&'static str),
    Sleep(Duration),
    /// Keep the connection open without reading from it, then end the script.
    Stall(Duration),
    /// Drop the TCP connection without a close frame.
    Hangup,
}

/// What the fake vendor observed.
pub struct VendorReport {
    pub authorization: Option<String>,
    pub request: serde_json::Value,
    /// The client closed the connection after the script ran.
    pub client_closed: bool,
}

pub fn audio_frame(audio: &[u8], is_final: bool) -> Vec<u8> {
    BinaryProtocol::new()
        .marshal(&Message::audio(None, audio.to_vec(), is_final))
        .unwrap()
}

pub fn error_frame(text: &str) -> Vec<u8> {
    BinaryProtocol::new().marshal(&Message::error(text)).unwrap()
}

/// Starts a vendor that serves one connection with `script`.
pub async fn spawn_vendor(script: Vec<VendorStep>) -> (String, oneshot::Receiver<VendorReport>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (report_tx, report_rx) = oneshot::channel();

    tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let report = serve_vendor(stream, |_| script).await;
        let _ = report_tx.send(report);
    });

    (format!("ws://{}", addr), report_rx)
}

/// Starts a vendor that accepts any number of connections. Each one is
/// answered with the script whose key equals the request text.
pub async fn spawn_vendor_by_text(
    scripts: Vec<(&'static str, Vec<VendorStep>)>,
) -> (String, mpsc::UnboundedReceiver<VendorReport>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (report_tx, report_rx) = mpsc::unbounded_channel();
    let scripts = Arc::new(scripts);

    tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                return;
            };
            let scripts = scripts.clone();
            let report_tx = report_tx.clone();
            tokio::spawn(async move {
                let report = serve_vendor(stream, |request| {
                    let text = request["request"]["text"].as_str().unwrap_or_default();
                    scripts
                        .iter()
                        .find(|(key, _)| *key == text)
                        .map(|(_, script)| script.clone())
                        .unwrap_or_else(|| panic!("no script for text {:?}", text))
                })
                .await;
                let _ = report_tx.send(report);
            });
        }
    });

    (format!("ws://{}", addr), report_rx)
}

/// Runs one vendor connection: reads the request frame, plays the script
/// chosen for it, then waits for the client to close.
async fn serve_vendor(
    stream: TcpStream,
    choose: impl FnOnce(&serde_json::Value) -> Vec<VendorStep>,
) -> VendorReport {
    let auth = Arc::new(Mutex::new(None));
    let seen = auth.clone();
    let mut ws = tokio_tungstenite::accept_hdr_async(
        stream,
        move |req: &Request, resp: WsResponse| {
            *seen.lock().unwrap() = req
                .headers()
                .get("authorization")
                .and_then(|v| v.to_str().ok())
                .map(str::to_string);
            Ok::<_, ErrorResponse>(resp)
        },
    )
    .await
    .unwrap();

    let request: serde_json::Value = match ws.next().await {
        Some(Ok(WsMessage::Binary(data))) => {
            let frame = protocol::decode(&data).unwrap();
            let FrameBody::Other { payload } = frame.body else {
                panic!("expected full client request");
            };
            serde_json::from_slice(&payload).unwrap()
        }
        other => panic!("expected request frame, got {:?}", other),
    };

    for step in choose(&request) {
        match step {
            VendorStep::Raw(data) => {
                let _ = ws.send(WsMessage::Binary(data.into())).await;
            }
            VendorStep::Audio(audio, is_final) => {
                let _ = ws
                    .send(WsMessage::Binary(audio_frame(audio, is_final).into()))
                    .await;
            }
            VendorStep::Error(text) => {
                let _ = ws.send(WsMessage::Binary(error_frame(text).into())).await;
            }
            VendorStep::Sleep(d) => tokio::time::sleep(d).await,
            VendorStep::Stall(d) => {
                // hold the socket without reading it
                tokio::time::sleep(d).await;
                let authorization = auth.lock().unwrap().clone();
                return VendorReport {
                    authorization,
                    request,
                    client_closed: false,
                };
            }
            VendorStep::Hangup => {
                let authorization = auth.lock().unwrap().clone();
                drop(ws);
                return VendorReport {
                    authorization,
                    request,
                    client_closed: false,
                };
            }
        }
    }

    // Script done; wait for the client to close.
    let closed = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            match ws.next().await {
                Some(Ok(WsMessage::Close(_))) | None | Some(Err(_)) => return true,
                Some(Ok(_)) => {}
            }
        }
    })
    .await
    .unwrap_or(false);

    let authorization = auth.lock().unwrap().clone();
    VendorReport {
        authorization,
        request,
        client_closed: closed,
    }
}

// ================== Fake Completion Endpoint ==================

/// Scripted reply of the fake completion endpoint.
#[derive(Clone)]
pub struct LlmScript {
    pub status: StatusCode,
    /// Body chunks, written with a short pause between them.
    pub chunks: Vec<String>,
    /// Keep the body open after the last chunk.
    pub hold: bool,
}

impl LlmScript {
    pub fn ok(chunks: Vec<String>) -> Self {
        Self {
            status: StatusCode::OK,
            chunks,
            hold: false,
        }
    }
}

/// A request seen by the fake completion endpoint.
#[derive(Debug)]
pub struct LlmRequest {
    pub authorization: Option<String>,
    pub body: serde_json::Value,
}

#[derive(Clone)]
struct LlmState {
    script: LlmScript,
    seen: mpsc::UnboundedSender<LlmRequest>,
}

async fn completions(
    State(state): State<LlmState>,
    headers: HeaderMap,
    Json(body): Json<serde_json::Value>,
) -> Response {
    let _ = state.seen.send(LlmRequest {
        authorization: headers
            .get("authorization")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string),
        body,
    });

    let script = state.script;
    if !script.status.is_success() {
        let text = script.chunks.concat();
        return (script.status, text).into_response();
    }

    let stream = async_stream::stream! {
        for chunk in script.chunks {
            yield Ok::<_, Infallible>(Bytes::from(chunk));
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        if script.hold {
            tokio::time::sleep(Duration::from_secs(30)).await;
        }
    };
    Response::builder()
        .header("content-type", "text/event-stream")
        .body(Body::from_stream(stream))
        .unwrap()
}

/// Starts a completion endpoint answering every request with `script`.
/// Returns the base URL.
pub async fn spawn_llm(script: LlmScript) -> (String, mpsc::UnboundedReceiver<LlmRequest>) {
    let (seen, seen_rx) = mpsc::unbounded_channel();
    let app = Router::new()
        .route("/chat/completions", post(completions))
        .with_state(LlmState { script, seen });

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr: SocketAddr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (format!("http://{}", addr), seen_rx)
}

/// One `data: ` line carrying a content delta.
pub fn content_line(text: &str) -> String {
    format!(
        "data: {}\n\n",
        serde_json::json!({"choices": [{"delta": {"content": text}}]})
    )
}

// ================== Helpers ==================

/// Config with credentials for both upstreams.
pub fn config(tts_url: &str, llm_url: &str) -> Config {
    let mut config = Config::default();
    config.tts.url = tts_url.to_string();
    config.tts.app_id = "app-1".to_string();
    config.tts.token = "tok-1".to_string();
    config.tts.clone_app_id = "icl-app".to_string();
    config.tts.clone_token = "icl-tok".to_string();
    config.llm.base_url = llm_url.to_string();
    config.llm.api_key = "sk-test".to_string();
    config.llm.model = "story-model".to_string();
    config.timeouts.connect_secs = 5;
    config.timeouts.idle_secs = 5;
    config
}

pub fn sink(kind: RequestKind) -> (EventSink, mpsc::Receiver<RoutedEvent>) {
    let (tx, rx) = mpsc::channel(64);
    (EventSink::new(1, kind, tx), rx)
}

/// Collects events up to and including the first terminal one.
pub async fn collect(rx: &mut mpsc::Receiver<RoutedEvent>) -> Vec<UpstreamEvent> {
    let mut events = Vec::new();
    while let Some(routed) = tokio::time::timeout(Duration::from_secs(10), rx.recv())
        .await
        .expect("upstream stalled")
    {
        let terminal = routed.event.is_terminal();
        events.push(routed.event);
        if terminal {
            break;
        }
    }
    events
}

/// A local address nothing listens on.
pub async fn dead_addr() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap()
}
