//! Per-client session: parses control messages, owns the live upstream
//! sessions and turns their events into client messages.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::story::StoryUpstream;
use crate::tts::TtsUpstream;
use crate::types::{
    ClientMessage, RequestKind, ServerMessage, StoryRequest, SynthesisRequest,
};
use crate::upstream::{EventSink, RoutedEvent, UpstreamHandle};

/// Buffered upstream events per client.
const EVENT_BUFFER: usize = 64;

/// Reported for a `tts` request without text.
pub const TEXT_REQUIRED: &str = "text is required";

/// State for one connected client.
///
/// Holds at most one live upstream per [`RequestKind`]. A new request of a
/// kind cancels the previous one; events the cancelled upstream still had in
/// flight are dropped by upstream id. Dropping the session cancels
/// everything it owns.
pub struct ClientSession {
    id: u64,
    config: Arc<Config>,
    tts: TtsUpstream,
    story: StoryUpstream,
    tx: mpsc::Sender<RoutedEvent>,
    rx: mpsc::Receiver<RoutedEvent>,
    tts_slot: Option<UpstreamHandle>,
    story_slot: Option<UpstreamHandle>,
    next_upstream: u64,
}

impl ClientSession {
    pub fn new(id: u64, config: Arc<Config>, http: reqwest::Client) -> Self {
        let (tx, rx) = mpsc::channel(EVENT_BUFFER);
        Self {
            id,
            tts: TtsUpstream::new(config.clone()),
            story: StoryUpstream::new(config.clone(), http),
            config,
            tx,
            rx,
            tts_slot: None,
            story_slot: None,
            next_upstream: 0,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Returns true if an upstream of `kind` is live.
    pub fn is_active(&self, kind: RequestKind) -> bool {
        match kind {
            RequestKind::Tts => self.tts_slot.is_some(),
            RequestKind::Story => self.story_slot.is_some(),
        }
    }

    /// Handles one text frame from the client.
    ///
    /// Returns a message to send back immediately when the frame is
    /// rejected; accepted requests answer through [`Self::next_event`].
    pub fn handle_text(&mut self, text: &str) -> Option<ServerMessage> {
        let msg = match ClientMessage::parse(text) {
            Ok(msg) => msg,
            Err(err) => {
                warn!(session = self.id, error = %err, "rejecting client message");
                return Some(ServerMessage::error(err.to_string()));
            }
        };

        match msg {
            ClientMessage::Tts { text, voice_id } => {
                if text.trim().is_empty() {
                    return Some(ServerMessage::error(TEXT_REQUIRED));
                }
                let req = SynthesisRequest::new(&text, &voice_id, &self.config.tts);
                self.start_tts(req);
            }
            ClientMessage::GenerateStory {
                title,
                prompt,
                extra,
            } => {
                self.start_story(StoryRequest {
                    title,
                    prompt,
                    extra,
                });
            }
        }
        None
    }

    /// Starts a synthesis upstream, replacing any live one.
    pub fn start_tts(&mut self, req: SynthesisRequest) {
        let (sink, cancel) = self.prepare(RequestKind::Tts);
        let upstream_id = sink.upstream_id();
        let tts = self.tts.clone();
        let child = cancel.clone();
        let task = tokio::spawn(async move { tts.run(req, sink, child).await });
        self.tts_slot = Some(UpstreamHandle::new(upstream_id, cancel, task));
    }

    /// Starts a generation upstream, replacing any live one.
    pub fn start_story(&mut self, req: StoryRequest) {
        let (sink, cancel) = self.prepare(RequestKind::Story);
        let upstream_id = sink.upstream_id();
        let story = self.story.clone();
        let child = cancel.clone();
        let task = tokio::spawn(async move { story.run(req, sink, child).await });
        self.story_slot = Some(UpstreamHandle::new(upstream_id, cancel, task));
    }

    fn prepare(&mut self, kind: RequestKind) -> (EventSink, CancellationToken) {
        if let Some(previous) = self.slot_mut(kind).take() {
            info!(
                session = self.id,
                kind = kind.as_str(),
                upstream_id = previous.id(),
                "replacing live upstream"
            );
            previous.cancel();
        }

        self.next_upstream += 1;
        let sink = EventSink::new(self.next_upstream, kind, self.tx.clone());
        (sink, CancellationToken::new())
    }

    fn slot_mut(&mut self, kind: RequestKind) -> &mut Option<UpstreamHandle> {
        match kind {
            RequestKind::Tts => &mut self.tts_slot,
            RequestKind::Story => &mut self.story_slot,
        }
    }

    /// Maps an upstream event to a client message.
    ///
    /// Returns `None` for events from an upstream that is no longer the
    /// live one of its kind. Clears the slot after a terminal event.
    pub fn on_upstream(&mut self, routed: RoutedEvent) -> Option<ServerMessage> {
        let RoutedEvent {
            upstream_id,
            kind,
            event,
        } = routed;

        let slot = self.slot_mut(kind);
        match slot.as_ref() {
            Some(handle) if handle.id() == upstream_id => {}
            _ => {
                debug!(upstream_id, kind = kind.as_str(), "dropping stale upstream event");
                return None;
            }
        }
        if event.is_terminal() {
            *slot = None;
        }

        Some(ServerMessage::from_upstream(kind, event))
    }

    /// Waits for the next message to relay to the client. Cancel-safe.
    pub async fn next_event(&mut self) -> Option<ServerMessage> {
        loop {
            let routed = self.rx.recv().await?;
            if let Some(msg) = self.on_upstream(routed) {
                return Some(msg);
            }
        }
    }

    /// Cancels every live upstream.
    pub fn close(&mut self) {
        for kind in [RequestKind::Tts, RequestKind::Story] {
            if let Some(handle) = self.slot_mut(kind).take() {
                if !handle.is_finished() {
                    debug!(session = self.id, upstream_id = handle.id(), "cancelling upstream");
                }
                handle.cancel();
            }
        }
    }
}

impl Drop for ClientSession {
    fn drop(&mut self) {
        self.close();
    }
}
