//! The master replica actor.
//!
//! The master owns the authoritative backend for one named store. It
//! applies commands one at a time, publishes the resulting events on
//! the store's clone topic, and answers queries on the requester's
//! response topic. Command replay after reconnection is dropped via
//! per-publisher sequence numbers.

use super::MasterMsg;
use crate::router::{RouterCmd, RouterSender};
use crate::status::StatusFeed;
use std::collections::HashMap;
use std::time::Duration;
use telefab_api::{
    store::{
        aspect_of, Command, DynStoreBackend, Entry, Event, Query,
        QueryReply,
    },
    wire::Frame,
    EndpointId, ErrorCode, FabError, FabResult, Timestamp, Value,
};
use tokio::sync::mpsc;

/// How often the master walks its entries to reap expired ones that
/// nobody has looked up.
const SWEEP_INTERVAL: Duration = Duration::from_secs(1);

pub(crate) fn spawn_master(
    name: String,
    backend: DynStoreBackend,
    endpoint: EndpointId,
    router: RouterSender,
    status: StatusFeed,
) -> (mpsc::UnboundedSender<MasterMsg>, tokio::task::AbortHandle) {
    let (tx, rx) = mpsc::unbounded_channel();
    let actor = MasterActor {
        name,
        endpoint,
        router,
        status,
        backend,
        event_seq: 0,
        publisher_seqs: HashMap::new(),
    };
    let abort = tokio::task::spawn(master_task(actor, rx)).abort_handle();
    (tx, abort)
}

struct MasterActor {
    name: String,
    endpoint: EndpointId,
    router: RouterSender,
    status: StatusFeed,
    backend: DynStoreBackend,
    event_seq: u64,
    publisher_seqs: HashMap<EndpointId, u64>,
}

async fn master_task(
    mut actor: MasterActor,
    mut rx: mpsc::UnboundedReceiver<MasterMsg>,
) {
    let mut sweep = tokio::time::interval(SWEEP_INTERVAL);
    sweep.set_missed_tick_behavior(
        tokio::time::MissedTickBehavior::Skip,
    );
    loop {
        tokio::select! {
            msg = rx.recv() => match msg {
                Some(MasterMsg::Command { seq, publisher, command }) => {
                    actor.handle_command(seq, publisher, command).await;
                }
                Some(MasterMsg::Request { request_id, requester, query }) => {
                    actor.handle_request(request_id, requester, query).await;
                }
                Some(MasterMsg::Shutdown { reply }) => {
                    // The mailbox is drained up to this point, so every
                    // accepted mutation already published its event.
                    let _ = reply.send(());
                    return;
                }
                None => return,
            },
            _ = sweep.tick() => {
                actor.sweep().await;
            }
        }
    }
}

impl MasterActor {
    async fn handle_command(
        &mut self,
        seq: u64,
        publisher: EndpointId,
        command: Command,
    ) {
        // Replayed or reordered commands from a reconnecting publisher
        // are dropped.
        if let Some(&last) = self.publisher_seqs.get(&publisher) {
            if seq <= last {
                tracing::debug!(
                    store = %self.name, %publisher, seq, last,
                    "dropping replayed store command"
                );
                return;
            }
        }
        self.publisher_seqs.insert(publisher, seq);

        let now = Timestamp::now();
        match command {
            Command::Put { key, value, expiry } => {
                match self.backend.put(
                    key.clone(),
                    value.clone(),
                    expiry,
                ) {
                    Ok(()) => {
                        self.publish(Event::Update { key, value, expiry })
                            .await;
                    }
                    Err(err) => self.report_backend(&err),
                }
            }
            Command::Add {
                request_id,
                key,
                delta,
                expiry,
            } => {
                let result = self
                    .expire_if_due(&key, now)
                    .await
                    .and_then(|_| self.backend.add(key, delta, expiry));
                self.finish_mutation(request_id, publisher, result).await;
            }
            Command::Subtract {
                request_id,
                key,
                delta,
                expiry,
            } => {
                let result = self.expire_if_due(&key, now).await.and_then(
                    |_| self.backend.subtract(key, delta, expiry),
                );
                self.finish_mutation(request_id, publisher, result).await;
            }
            Command::Erase { key } => match self.backend.erase(&key) {
                Ok(_present) => {
                    self.publish(Event::Erase { key }).await;
                }
                Err(err) => self.report_backend(&err),
            },
            Command::Expire { request_id, key } => {
                match self.backend.expire(&key, now) {
                    Ok(removed) => {
                        if removed {
                            self.publish(Event::Expire { key }).await;
                        }
                        self.respond(
                            request_id,
                            publisher,
                            QueryReply::Ok(Value::Bool(removed)),
                        )
                        .await;
                    }
                    Err(err) => {
                        self.respond(
                            request_id,
                            publisher,
                            QueryReply::from(&err),
                        )
                        .await;
                    }
                }
            }
            Command::PutUnique {
                request_id,
                key,
                value,
                expiry,
            } => {
                let outcome = self
                    .expire_if_due(&key, now)
                    .await
                    .and_then(|_| self.backend.exists(&key));
                match outcome {
                    Ok(true) => {
                        // Conflict is a successful `false`, not an
                        // error.
                        self.respond(
                            request_id,
                            publisher,
                            QueryReply::Ok(Value::Bool(false)),
                        )
                        .await;
                    }
                    Ok(false) => {
                        match self.backend.put(
                            key.clone(),
                            value.clone(),
                            expiry,
                        ) {
                            Ok(()) => {
                                self.publish(Event::Update {
                                    key,
                                    value,
                                    expiry,
                                })
                                .await;
                                self.respond(
                                    request_id,
                                    publisher,
                                    QueryReply::Ok(Value::Bool(true)),
                                )
                                .await;
                            }
                            Err(err) => {
                                self.respond(
                                    request_id,
                                    publisher,
                                    QueryReply::from(&err),
                                )
                                .await;
                            }
                        }
                    }
                    Err(err) => {
                        self.respond(
                            request_id,
                            publisher,
                            QueryReply::from(&err),
                        )
                        .await;
                    }
                }
            }
            Command::Clear => match self.backend.clear() {
                Ok(()) => {
                    self.publish(Event::Clear).await;
                }
                Err(err) => self.report_backend(&err),
            },
        }
    }

    async fn handle_request(
        &mut self,
        request_id: u64,
        requester: EndpointId,
        query: Query,
    ) {
        let now = Timestamp::now();
        let reply = match query {
            Query::Get { key } => {
                self.live_value(&key, now).await.map(QueryReply::Ok)
            }
            Query::GetAspect { key, aspect } => self
                .live_value(&key, now)
                .await
                .and_then(|v| aspect_of(&v, &aspect))
                .map(QueryReply::Ok),
            Query::Exists { key } => self
                .live_entry(&key, now)
                .await
                .map(|e| QueryReply::Ok(Value::Bool(e.is_some()))),
            Query::Keys => self.live_entries(now).map(|entries| {
                QueryReply::Ok(Value::set(
                    entries.into_iter().map(|e| e.key),
                ))
            }),
            Query::Size => self.live_entries(now).map(|entries| {
                QueryReply::Ok(Value::Count(entries.len() as u64))
            }),
            Query::Snapshot => {
                self.live_entries(now).map(QueryReply::Entries)
            }
        };
        let reply = match reply {
            Ok(reply) => reply,
            Err(err) => QueryReply::from(&err),
        };
        self.respond(request_id, requester, reply).await;
    }

    /// Reap entries whose expiry nobody tripped over yet.
    async fn sweep(&mut self) {
        let now = Timestamp::now();
        let snapshot = match self.backend.snapshot() {
            Ok(snapshot) => snapshot,
            Err(err) => {
                self.report_backend(&err);
                return;
            }
        };
        for entry in snapshot {
            if let Some(at) = entry.expiry {
                if at <= now {
                    match self.backend.erase(&entry.key) {
                        Ok(_) => {
                            self.publish(Event::Expire {
                                key: entry.key,
                            })
                            .await;
                        }
                        Err(err) => self.report_backend(&err),
                    }
                }
            }
        }
    }

    /// Lazily remove `key` if its expiry passed, emitting the expire
    /// event clones need.
    async fn expire_if_due(
        &mut self,
        key: &Value,
        now: Timestamp,
    ) -> FabResult<()> {
        if self.backend.expire(key, now)? {
            self.publish(Event::Expire { key: key.clone() }).await;
        }
        Ok(())
    }

    async fn live_entry(
        &mut self,
        key: &Value,
        now: Timestamp,
    ) -> FabResult<Option<Entry>> {
        self.expire_if_due(key, now).await?;
        self.backend.get(key)
    }

    async fn live_value(
        &mut self,
        key: &Value,
        now: Timestamp,
    ) -> FabResult<Value> {
        self.live_entry(key, now).await?.map(|e| e.value).ok_or_else(
            || FabError::no_such_key(format!("{key}")),
        )
    }

    fn live_entries(&self, now: Timestamp) -> FabResult<Vec<Entry>> {
        Ok(self
            .backend
            .snapshot()?
            .into_iter()
            .filter(|e| e.expiry.map(|at| at > now).unwrap_or(true))
            .collect())
    }

    async fn finish_mutation(
        &mut self,
        request_id: u64,
        publisher: EndpointId,
        result: FabResult<Entry>,
    ) {
        match result {
            Ok(entry) => {
                let value = entry.value.clone();
                self.publish(Event::Update {
                    key: entry.key,
                    value: entry.value,
                    expiry: entry.expiry,
                })
                .await;
                self.respond(
                    request_id,
                    publisher,
                    QueryReply::Ok(value),
                )
                .await;
            }
            Err(err) => {
                self.respond(request_id, publisher, QueryReply::from(&err))
                    .await;
            }
        }
    }

    async fn publish(&mut self, event: Event) {
        self.event_seq += 1;
        let frame = Frame::StoreEvent {
            seq: self.event_seq,
            publisher: self.endpoint,
            store: self.name.clone(),
            event,
        };
        if self
            .router
            .send(RouterCmd::Frame { from: None, frame })
            .await
            .is_err()
        {
            tracing::warn!(
                store = %self.name,
                "router gone, store event not replicated"
            );
        }
    }

    async fn respond(
        &mut self,
        request_id: u64,
        requester: EndpointId,
        reply: QueryReply,
    ) {
        let frame = Frame::StoreResponse {
            request_id,
            requester,
            reply,
        };
        let _ = self
            .router
            .send(RouterCmd::Frame { from: None, frame })
            .await;
    }

    fn report_backend(&self, err: &FabError) {
        self.status.error(
            ErrorCode::BackendFailure,
            format!("store {}: {err}", self.name),
        );
    }
}
