//! The endpoint status channel.

use telefab_api::{ErrorCode, StatusCode, StatusEvent};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

/// Fan-out of [StatusEvent]s to any number of registered receivers.
///
/// Emission never blocks: receivers that fall behind buffer unboundedly
/// (status traffic is low-rate), and receivers that were dropped are
/// pruned on the next emit.
#[derive(Debug, Clone, Default)]
pub struct StatusFeed {
    senders: Arc<Mutex<Vec<mpsc::UnboundedSender<StatusEvent>>>>,
}

impl StatusFeed {
    /// Construct an empty feed.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new receiver. Events emitted from now on are
    /// delivered to it.
    pub fn subscribe(&self) -> StatusReceiver {
        let (tx, rx) = mpsc::unbounded_channel();
        self.senders.lock().unwrap().push(tx);
        StatusReceiver { rx }
    }

    /// Emit one event to every live receiver.
    pub fn emit(&self, event: StatusEvent) {
        tracing::debug!(?event, "status");
        self.senders
            .lock()
            .unwrap()
            .retain(|tx| tx.send(event.clone()).is_ok());
    }

    /// Emit a lifecycle status.
    pub fn status<C: std::fmt::Display>(&self, code: StatusCode, context: C) {
        self.emit(StatusEvent::Status {
            code,
            context: context.to_string(),
        });
    }

    /// Emit an error.
    pub fn error<C: std::fmt::Display>(&self, code: ErrorCode, context: C) {
        self.emit(StatusEvent::Error {
            code,
            context: context.to_string(),
        });
    }
}

/// The consuming side of the status channel.
#[derive(Debug)]
pub struct StatusReceiver {
    rx: mpsc::UnboundedReceiver<StatusEvent>,
}

impl StatusReceiver {
    /// Await the next event. Returns `None` once the endpoint is gone.
    pub async fn recv(&mut self) -> Option<StatusEvent> {
        self.rx.recv().await
    }

    /// Take an event if one is ready.
    pub fn try_recv(&mut self) -> Option<StatusEvent> {
        self.rx.try_recv().ok()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[tokio::test]
    async fn events_reach_every_receiver() {
        let feed = StatusFeed::new();
        let mut a = feed.subscribe();
        let mut b = feed.subscribe();
        feed.status(StatusCode::PeerAdded, "127.0.0.1:1");
        assert!(a.recv().await.is_some());
        assert!(b.recv().await.is_some());
    }

    #[tokio::test]
    async fn dropped_receivers_are_pruned() {
        let feed = StatusFeed::new();
        let a = feed.subscribe();
        drop(a);
        feed.error(ErrorCode::Unspecified, "x");
        assert!(feed.senders.lock().unwrap().is_empty());
    }
}
