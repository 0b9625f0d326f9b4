//! Plumbing shared by the upstream sessions: event routing back to the
//! owning client session, cancellation handles and deadlines.

use std::future::Future;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};
use crate::types::{RequestKind, UpstreamEvent};

/// An upstream event tagged with the upstream that produced it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoutedEvent {
    pub upstream_id: u64,
    pub kind: RequestKind,
    pub event: UpstreamEvent,
}

/// Sending half handed to an upstream session.
///
/// Holds only a routing id, never a reference to the owner.
#[derive(Debug, Clone)]
pub struct EventSink {
    upstream_id: u64,
    kind: RequestKind,
    tx: mpsc::Sender<RoutedEvent>,
}

impl EventSink {
    pub fn new(upstream_id: u64, kind: RequestKind, tx: mpsc::Sender<RoutedEvent>) -> Self {
        Self {
            upstream_id,
            kind,
            tx,
        }
    }

    pub fn upstream_id(&self) -> u64 {
        self.upstream_id
    }

    /// Delivers an event. Returns false once the owner has gone away.
    pub async fn emit(&self, event: UpstreamEvent) -> bool {
        self.tx
            .send(RoutedEvent {
                upstream_id: self.upstream_id,
                kind: self.kind,
                event,
            })
            .await
            .is_ok()
    }

    /// Delivers events in order, stopping at the first failed send.
    pub async fn emit_all(&self, events: Vec<UpstreamEvent>) -> bool {
        for event in events {
            if !self.emit(event).await {
                return false;
            }
        }
        true
    }
}

/// Owner-side handle to a running upstream task.
#[derive(Debug)]
pub struct UpstreamHandle {
    id: u64,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl UpstreamHandle {
    pub fn new(id: u64, cancel: CancellationToken, task: JoinHandle<()>) -> Self {
        Self { id, cancel, task }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Signals the task to close its transport and stop. Does not wait.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

impl Drop for UpstreamHandle {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Runs `fut` under an optional deadline.
pub async fn deadline<F>(limit: Option<Duration>, what: &'static str, fut: F) -> Result<F::Output>
where
    F: Future,
{
    match limit {
        Some(limit) => tokio::time::timeout(limit, fut)
            .await
            .map_err(|_| Error::Timeout(what)),
        None => Ok(fut.await),
    }
}
