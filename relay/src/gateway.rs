//! Websocket gateway: accepts client connections and gives each one its own
//! [`ClientSession`].
//!
//! Routes:
//! - GET /        - websocket upgrade
//! - GET /ws      - websocket upgrade
//! - GET /healthz - liveness check

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use axum::{
    Router,
    extract::{
        State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    response::IntoResponse,
    routing::get,
};
use tokio::net::TcpListener;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::error::Result;
use crate::session::ClientSession;
use crate::types::ServerMessage;

/// Shared gateway state. Everything here is read-only after startup except
/// the session counter.
#[derive(Clone)]
pub struct AppState {
    config: Arc<Config>,
    http: reqwest::Client,
    next_session: Arc<AtomicU64>,
}

impl AppState {
    pub fn new(config: Arc<Config>) -> Self {
        Self {
            config,
            http: reqwest::Client::new(),
            next_session: Arc::new(AtomicU64::new(1)),
        }
    }

    fn new_session(&self) -> ClientSession {
        let id = self.next_session.fetch_add(1, Ordering::Relaxed);
        ClientSession::new(id, self.config.clone(), self.http.clone())
    }
}

/// Builds the gateway router.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/", get(ws_handler))
        .route("/ws", get(ws_handler))
        .route("/healthz", get(healthz))
        .with_state(state)
}

/// Binds `config.listen` and serves until the process stops.
pub async fn serve(config: Arc<Config>) -> Result<()> {
    let listener = TcpListener::bind(config.listen.as_str()).await?;
    serve_listener(listener, AppState::new(config)).await
}

/// Serves on an already-bound listener.
pub async fn serve_listener(listener: TcpListener, state: AppState) -> Result<()> {
    let addr: SocketAddr = listener.local_addr()?;
    info!(%addr, "gateway listening");
    axum::serve(listener, router(state)).await?;
    Ok(())
}

async fn healthz() -> &'static str {
    "ok"
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

enum Action {
    Client(Option<std::result::Result<Message, axum::Error>>),
    Relay(Option<ServerMessage>),
}

async fn handle_socket(mut socket: WebSocket, state: AppState) {
    let mut session = state.new_session();
    let id = session.id();
    info!(session = id, "client connected");

    loop {
        let action = tokio::select! {
            msg = socket.recv() => Action::Client(msg),
            msg = session.next_event() => Action::Relay(msg),
        };

        let reply = match action {
            Action::Client(None) | Action::Client(Some(Ok(Message::Close(_)))) => break,
            Action::Client(Some(Err(err))) => {
                debug!(session = id, error = %err, "client transport error");
                break;
            }
            Action::Client(Some(Ok(Message::Text(text)))) => session.handle_text(text.as_str()),
            Action::Client(Some(Ok(Message::Binary(data)))) => {
                debug!(session = id, len = data.len(), "ignoring binary client frame");
                None
            }
            Action::Client(Some(Ok(_))) => None,
            Action::Relay(msg) => msg,
        };

        if let Some(reply) = reply {
            if let Err(err) = socket.send(Message::Text(reply.to_json().into())).await {
                warn!(session = id, error = %err, "send to client failed");
                break;
            }
        }
    }

    session.close();
    info!(session = id, "client disconnected");
}
