//! Upstream generation session over a streaming chat-completion endpoint.
//!
//! `Idle -> Requesting -> Streaming -> {Completed | Failed} -> Closed`.

use std::sync::Arc;

use bytes::Bytes;
use futures::StreamExt;
use serde_json::{Map, Value, json};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::error::{Error, Result};
use crate::sse::{Line, LineDecoder, parse_line};
use crate::types::{SessionState, StoryRequest, UpstreamEvent};
use crate::upstream::{EventSink, deadline};

// ================== State Machine ==================

/// Everything that can happen to a generation upstream once the response
/// headers have arrived.
#[derive(Debug, Clone)]
pub enum Inbound {
    /// 2xx response headers received.
    Accepted,
    /// One chunk of the response body.
    Chunk(Bytes),
    /// The body ended.
    End,
    /// Request or body read failed.
    TransportError(String),
    /// A connect or idle deadline expired.
    TimedOut,
}

/// Generation upstream state machine.
#[derive(Debug, Default)]
pub struct StoryMachine {
    state: SessionState,
    decoder: LineDecoder,
    deltas: u64,
    skipped: u64,
}

impl StoryMachine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Marks the request as sent.
    pub fn requesting(&mut self) {
        if self.state == SessionState::Idle {
            self.state = SessionState::Requesting;
        }
    }

    pub fn close(&mut self) {
        self.state = SessionState::Closed;
    }

    /// Feeds one inbound event. Returns the events for the client, in order.
    pub fn handle(&mut self, inbound: Inbound) -> Vec<UpstreamEvent> {
        if self.state.is_done() {
            return Vec::new();
        }

        match inbound {
            Inbound::Accepted => {
                self.state = SessionState::Streaming;
                Vec::new()
            }
            Inbound::Chunk(bytes) => {
                if self.state != SessionState::Streaming {
                    return Vec::new();
                }
                let lines = self.decoder.push(&bytes);
                let mut events = Vec::new();
                for line in lines {
                    self.on_line(&line, &mut events);
                }
                events
            }
            Inbound::End => {
                let mut events = Vec::new();
                if self.decoder.pending() > 0 {
                    debug!(bytes = self.decoder.pending(), "parsing unterminated last line");
                }
                if let Some(tail) = self.decoder.finish() {
                    self.on_line(&tail, &mut events);
                }
                self.state = SessionState::Completed;
                events.push(UpstreamEvent::Complete);
                debug!(deltas = self.deltas, skipped = self.skipped, "story stream ended");
                events
            }
            Inbound::TransportError(message) => {
                warn!(error = %message, "story transport error");
                self.fail(message)
            }
            Inbound::TimedOut => {
                warn!("story upstream timed out");
                self.fail(Error::Timeout("story").client_message())
            }
        }
    }

    fn on_line(&mut self, line: &str, events: &mut Vec<UpstreamEvent>) {
        match parse_line(line) {
            Ok(Line::Delta(delta)) => {
                for text in delta.into_text_deltas() {
                    self.deltas += 1;
                    events.push(UpstreamEvent::Text(text));
                }
            }
            Ok(Line::Done) | Ok(Line::Skip) => {}
            Err(err) => {
                self.skipped += 1;
                warn!(error = %err, "skipping malformed line");
            }
        }
    }

    fn fail(&mut self, message: String) -> Vec<UpstreamEvent> {
        self.state = SessionState::Failed;
        vec![UpstreamEvent::Error(message)]
    }
}

// ================== Upstream Driver ==================

/// Drives generation sessions against the configured completion endpoint.
#[derive(Clone)]
pub struct StoryUpstream {
    config: Arc<Config>,
    client: reqwest::Client,
}

impl StoryUpstream {
    pub fn new(config: Arc<Config>, client: reqwest::Client) -> Self {
        Self { config, client }
    }

    /// Builds the completion request body.
    ///
    /// Extra request fields override the configured model parameters;
    /// `stream` is always true.
    pub fn build_body(&self, req: &StoryRequest) -> Value {
        let llm = &self.config.llm;

        let mut messages = Vec::new();
        if !llm.system_prompt.is_empty() {
            messages.push(json!({"role": "system", "content": llm.system_prompt}));
        }
        let prompt = if req.prompt.is_empty() {
            &req.title
        } else {
            &req.prompt
        };
        messages.push(json!({"role": "user", "content": prompt}));

        let mut body = Map::new();
        body.insert("model".to_string(), json!(llm.model));
        body.insert("temperature".to_string(), json!(llm.temperature));
        for (key, value) in &req.extra {
            body.insert(key.clone(), value.clone());
        }
        body.insert("messages".to_string(), Value::Array(messages));
        body.insert("stream".to_string(), Value::Bool(true));
        Value::Object(body)
    }

    /// Sends the request and waits for a 2xx response.
    async fn send(&self, req: &StoryRequest) -> Result<reqwest::Response> {
        let llm = &self.config.llm;
        let api_key = llm.api_key()?;

        let response = self
            .client
            .post(llm.completions_url())
            .header("Authorization", format!("Bearer {}", api_key))
            .header("Content-Type", "application/json")
            .json(&self.build_body(req))
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "unknown".to_string());
            return Err(Error::UpstreamStatus { status, body });
        }
        Ok(response)
    }

    /// Runs one session to completion, failure or cancellation.
    pub async fn run(&self, req: StoryRequest, sink: EventSink, cancel: CancellationToken) {
        let upstream_id = sink.upstream_id();
        let mut machine = StoryMachine::new();

        info!(
            upstream_id,
            title = %req.title,
            model = %self.config.llm.model,
            "story session start"
        );

        machine.requesting();
        let sent = tokio::select! {
            _ = cancel.cancelled() => {
                debug!(upstream_id, "story cancelled while requesting");
                machine.close();
                return;
            }
            sent = deadline(self.config.timeouts.connect(), "connect", self.send(&req)) => sent,
        };

        let response = match sent.and_then(|r| r) {
            Ok(response) => response,
            Err(err) => {
                warn!(upstream_id, error = %err, "story request failed");
                let events = match err {
                    Error::Timeout(_) => machine.handle(Inbound::TimedOut),
                    other => machine.handle(Inbound::TransportError(other.client_message())),
                };
                sink.emit_all(events).await;
                machine.close();
                return;
            }
        };
        machine.handle(Inbound::Accepted);

        let idle = self.config.timeouts.idle();
        let mut body = response.bytes_stream();
        loop {
            let next = tokio::select! {
                _ = cancel.cancelled() => {
                    debug!(upstream_id, "story cancelled");
                    break;
                }
                next = deadline(idle, "idle", body.next()) => next,
            };

            let inbound = match next {
                Err(_) => Inbound::TimedOut,
                Ok(None) => Inbound::End,
                Ok(Some(Ok(bytes))) => Inbound::Chunk(bytes),
                Ok(Some(Err(err))) => Inbound::TransportError(Error::from(err).to_string()),
            };
            let terminal = matches!(
                inbound,
                Inbound::TimedOut | Inbound::End | Inbound::TransportError(_)
            );

            if !sink.emit_all(machine.handle(inbound)).await {
                debug!(upstream_id, "owner gone");
                break;
            }
            if terminal {
                break;
            }
        }

        info!(upstream_id, state = ?machine.state(), "story session closed");
        machine.close();
    }
}
