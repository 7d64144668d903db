//! The clone replica actor.
//!
//! A clone mirrors its master by applying replicated events in arrival
//! order. Events with non-increasing sequence numbers from the same
//! publisher are dropped (replay after reconnection); a gap in the
//! sequence triggers a full snapshot re-fetch from the master.

use super::CloneMsg;
use crate::requests::Requests;
use std::collections::HashMap;
use std::sync::Arc;
use telefab_api::{
    store::{Entry, Event, Query, QueryReply},
    wire::Frame,
    EndpointId, Timestamp, Value,
};
use tokio::sync::mpsc;

pub(crate) fn spawn_clone(
    name: String,
    requests: Arc<Requests>,
) -> (mpsc::UnboundedSender<CloneMsg>, tokio::task::AbortHandle) {
    let (tx, rx) = mpsc::unbounded_channel();
    let actor = CloneActor {
        name,
        requests,
        mirror: HashMap::new(),
        publisher_seqs: HashMap::new(),
    };
    let abort = tokio::task::spawn(clone_task(actor, rx)).abort_handle();
    (tx, abort)
}

struct CloneActor {
    name: String,
    requests: Arc<Requests>,
    mirror: HashMap<Value, (Value, Option<Timestamp>)>,
    publisher_seqs: HashMap<EndpointId, u64>,
}

async fn clone_task(
    mut actor: CloneActor,
    mut rx: mpsc::UnboundedReceiver<CloneMsg>,
) {
    // Try to start from the master's current state. Not fatal when the
    // master is unreachable; events (or a later gap resync) catch up.
    if let Err(err) = actor.resync(None).await {
        tracing::debug!(
            store = %actor.name,
            "initial clone sync unavailable: {err}"
        );
    }

    while let Some(msg) = rx.recv().await {
        match msg {
            CloneMsg::Event {
                seq,
                publisher,
                event,
            } => {
                actor.handle_event(seq, publisher, event).await;
            }
            CloneMsg::Mirror { reply } => {
                let entries = actor
                    .mirror
                    .iter()
                    .map(|(key, (value, expiry))| Entry {
                        key: key.clone(),
                        value: value.clone(),
                        expiry: *expiry,
                    })
                    .collect();
                let _ = reply.send(entries);
            }
            CloneMsg::Shutdown { reply } => {
                let _ = reply.send(());
                return;
            }
        }
    }
}

impl CloneActor {
    async fn handle_event(
        &mut self,
        seq: u64,
        publisher: EndpointId,
        event: Event,
    ) {
        match self.publisher_seqs.get(&publisher).copied() {
            Some(last) if seq <= last => {
                tracing::debug!(
                    store = %self.name, %publisher, seq, last,
                    "dropping replayed store event"
                );
                return;
            }
            Some(last) if seq > last + 1 => {
                tracing::debug!(
                    store = %self.name, %publisher, seq, last,
                    "event gap, refetching snapshot"
                );
                self.publisher_seqs.insert(publisher, seq);
                if let Err(err) = self.resync(Some(seq)).await {
                    tracing::warn!(
                        store = %self.name,
                        "snapshot refetch failed: {err}"
                    );
                }
                // The snapshot is at least as new as the gap event, so
                // the event itself is not re-applied.
                return;
            }
            _ => (),
        }
        self.publisher_seqs.insert(publisher, seq);
        self.apply(event);
    }

    fn apply(&mut self, event: Event) {
        match event {
            Event::Update { key, value, expiry } => {
                self.mirror.insert(key, (value, expiry));
            }
            Event::Erase { key } | Event::Expire { key } => {
                self.mirror.remove(&key);
            }
            Event::Clear => self.mirror.clear(),
        }
    }

    /// Replace the mirror with a full snapshot from the master.
    async fn resync(
        &mut self,
        _triggering_seq: Option<u64>,
    ) -> telefab_api::FabResult<()> {
        let request_id = self.requests.next_request_id();
        let frame = Frame::StoreRequest {
            request_id,
            requester: self.requests.endpoint(),
            store: self.name.clone(),
            query: Query::Snapshot,
        };
        match self.requests.call(request_id, frame).await? {
            QueryReply::Entries(entries) => {
                self.mirror = entries
                    .into_iter()
                    .map(|e| (e.key, (e.value, e.expiry)))
                    .collect();
                Ok(())
            }
            QueryReply::Err { context, .. } => Err(
                telefab_api::FabError::backend(context),
            ),
            QueryReply::Ok(_) => Err(telefab_api::FabError::other(
                "snapshot reply carried a plain value",
            )),
        }
    }
}
