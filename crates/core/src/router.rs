//! The core router actor.
//!
//! The router owns the routing table, the local subscriber registry,
//! the peer outbound senders, and the store actor mailboxes. All of it
//! is private state of a single task fed by a command mailbox; every
//! other part of the endpoint talks to the router through messages.

use crate::peer::PeerCmd;
use crate::status::StatusFeed;
use crate::store::{CloneMsg, MasterMsg};
use crate::subscriber::{Message, PushOutcome, SubQueue};
use crate::routing::RoutingTable;
use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::Arc;
use telefab_api::{
    config::FabricConfig, store::QueryReply, topic, wire::Frame, EndpointId,
    ErrorCode, FabError, FabResult, Filter, StatusCode, Topic, Value,
};
use tokio::sync::{mpsc, oneshot};

/// Router mailbox depth. Deep enough to decouple bursts, bounded so
/// publishers feel backpressure instead of growing memory.
pub(crate) const ROUTER_MAILBOX: usize = 4096;

pub(crate) type RouterSender = mpsc::Sender<RouterCmd>;

pub(crate) enum RouterCmd {
    /// A locally published data message.
    Publish { topic: Topic, value: Value },
    /// A routed frame, either from a peer (`from` set) or from a local
    /// store handle or actor (`from` empty).
    Frame {
        from: Option<EndpointId>,
        frame: Frame,
    },
    SubscriberAdd {
        id: u64,
        filter: Filter,
        queue: Arc<SubQueue>,
    },
    SubscriberRemove {
        id: u64,
    },
    /// A peer finished its handshake. Fails on id collision.
    PeerInstall {
        peer: EndpointId,
        addr: SocketAddr,
        filter: Filter,
        outbound: mpsc::Sender<Frame>,
        cmd: mpsc::UnboundedSender<PeerCmd>,
        reply: oneshot::Sender<FabResult<()>>,
    },
    PeerFilter {
        peer: EndpointId,
        filter: Filter,
    },
    PeerRemove {
        peer: EndpointId,
    },
    /// The canonical filter this endpoint advertises on the wire.
    WireFilter {
        reply: oneshot::Sender<Filter>,
    },
    /// Is `topic` deliverable anywhere: a matching peer, or a local
    /// master when the topic is a store command topic?
    HasRoute {
        topic: Topic,
        reply: oneshot::Sender<bool>,
    },
    MasterAdd {
        name: String,
        mailbox: mpsc::UnboundedSender<MasterMsg>,
        reply: oneshot::Sender<FabResult<()>>,
    },
    CloneAdd {
        name: String,
        mailbox: mpsc::UnboundedSender<CloneMsg>,
        reply: oneshot::Sender<FabResult<()>>,
    },
    RequestRegister {
        request_id: u64,
        reply_to: oneshot::Sender<QueryReply>,
    },
    RequestCancel {
        request_id: u64,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

struct PeerLink {
    addr: SocketAddr,
    outbound: mpsc::Sender<Frame>,
    cmd: mpsc::UnboundedSender<PeerCmd>,
}

struct Router {
    id: EndpointId,
    cfg: FabricConfig,
    status: StatusFeed,
    table: RoutingTable,
    subscribers: HashMap<u64, (Filter, Arc<SubQueue>)>,
    peers: HashMap<EndpointId, PeerLink>,
    masters: HashMap<String, mpsc::UnboundedSender<MasterMsg>>,
    clones: HashMap<String, mpsc::UnboundedSender<CloneMsg>>,
    pending: HashMap<u64, oneshot::Sender<QueryReply>>,
    wire_filter: Filter,
    sent_filters: HashMap<EndpointId, Filter>,
    discovered: HashSet<EndpointId>,
}

pub(crate) fn spawn(
    id: EndpointId,
    cfg: FabricConfig,
    status: StatusFeed,
) -> (RouterSender, tokio::task::AbortHandle) {
    let (tx, rx) = mpsc::channel(ROUTER_MAILBOX);
    let router = Router {
        id,
        cfg,
        status,
        table: RoutingTable::new(),
        subscribers: HashMap::new(),
        peers: HashMap::new(),
        masters: HashMap::new(),
        clones: HashMap::new(),
        pending: HashMap::new(),
        wire_filter: base_wire_filter(),
        sent_filters: HashMap::new(),
        discovered: HashSet::new(),
    };
    let abort = tokio::task::spawn(router_task(router, rx)).abort_handle();
    (tx, abort)
}

fn base_wire_filter() -> Filter {
    Filter::from_prefixes([topic::STORE_TOPIC_PREFIX])
}

async fn router_task(mut router: Router, mut rx: mpsc::Receiver<RouterCmd>) {
    while let Some(cmd) = rx.recv().await {
        match cmd {
            RouterCmd::Publish { topic, value } => {
                let frame = Frame::Data {
                    hops: 0,
                    topic,
                    value,
                };
                router.route(None, frame).await;
            }
            RouterCmd::Frame { from, frame } => {
                router.route(from, frame).await;
            }
            RouterCmd::SubscriberAdd { id, filter, queue } => {
                router.subscribers.insert(id, (filter, queue));
                router.refresh_filters();
            }
            RouterCmd::SubscriberRemove { id } => {
                if router.subscribers.remove(&id).is_some() {
                    router.refresh_filters();
                }
            }
            RouterCmd::PeerInstall {
                peer,
                addr,
                filter,
                outbound,
                cmd,
                reply,
            } => {
                let result = router.install_peer(
                    peer, addr, filter, outbound, cmd,
                );
                if result.is_ok() {
                    router.refresh_filters();
                }
                let _ = reply.send(result);
            }
            RouterCmd::PeerFilter { peer, filter } => {
                if router.peers.contains_key(&peer) {
                    router.table.update(peer, filter);
                    router.refresh_filters();
                }
            }
            RouterCmd::PeerRemove { peer } => {
                router.table.remove(&peer);
                router.peers.remove(&peer);
                router.sent_filters.remove(&peer);
                router.refresh_filters();
            }
            RouterCmd::WireFilter { reply } => {
                let _ = reply.send(router.wire_filter.clone());
            }
            RouterCmd::HasRoute { topic, reply } => {
                let local = topic::store_name_from_master_topic(&topic)
                    .map(|name| router.masters.contains_key(name))
                    .unwrap_or(false);
                let _ =
                    reply.send(local || router.table.has_route(&topic));
            }
            RouterCmd::MasterAdd {
                name,
                mailbox,
                reply,
            } => {
                let result = if router.masters.contains_key(&name)
                    || router.clones.contains_key(&name)
                {
                    Err(FabError::other(format!(
                        "store {name} already attached"
                    )))
                } else {
                    router.masters.insert(name, mailbox);
                    Ok(())
                };
                let _ = reply.send(result);
            }
            RouterCmd::CloneAdd {
                name,
                mailbox,
                reply,
            } => {
                let result = if router.masters.contains_key(&name)
                    || router.clones.contains_key(&name)
                {
                    Err(FabError::other(format!(
                        "store {name} already attached"
                    )))
                } else {
                    router.clones.insert(name, mailbox);
                    Ok(())
                };
                let _ = reply.send(result);
            }
            RouterCmd::RequestRegister {
                request_id,
                reply_to,
            } => {
                router.pending.insert(request_id, reply_to);
            }
            RouterCmd::RequestCancel { request_id } => {
                router.pending.remove(&request_id);
            }
            RouterCmd::Shutdown { reply } => {
                router.shutdown();
                let _ = reply.send(());
                break;
            }
        }
    }
}

impl Router {
    fn install_peer(
        &mut self,
        peer: EndpointId,
        addr: SocketAddr,
        filter: Filter,
        outbound: mpsc::Sender<Frame>,
        cmd: mpsc::UnboundedSender<PeerCmd>,
    ) -> FabResult<()> {
        if peer == self.id {
            return Err(FabError::other(format!(
                "{addr} reports our own endpoint id"
            )));
        }
        if self.peers.contains_key(&peer) {
            return Err(FabError::other(format!(
                "duplicate peering with endpoint {peer}"
            )));
        }
        self.peers.insert(
            peer,
            PeerLink {
                addr,
                outbound,
                cmd,
            },
        );
        self.table.update(peer, filter);
        Ok(())
    }

    /// The filter covering local subscribers plus the reserved store
    /// namespace.
    fn local_filter(&self) -> Filter {
        let mut filter = base_wire_filter();
        for (sub_filter, _) in self.subscribers.values() {
            filter = filter.union(sub_filter);
        }
        filter
    }

    /// Recompute what every peer should see from us and push updates
    /// where something changed.
    ///
    /// A forwarder advertises downstream subscriptions too, so a
    /// message can cross intermediate endpoints with no local
    /// subscriber. The filter sent to a given peer excludes that
    /// peer's own contribution (split horizon), which keeps an
    /// acyclic mesh from echoing subscriptions back where they came
    /// from.
    fn refresh_filters(&mut self) {
        let local = self.local_filter();

        let mut full = local.clone();
        for (_, peer_filter) in self.table.iter() {
            full = full.union(peer_filter);
        }
        self.wire_filter = full;

        let mut updates = Vec::new();
        for (peer, link) in self.peers.iter() {
            let mut tailored = local.clone();
            for (other, other_filter) in self.table.iter() {
                if other != peer {
                    tailored = tailored.union(other_filter);
                }
            }
            if self.sent_filters.get(peer) != Some(&tailored) {
                updates.push((*peer, link.cmd.clone(), tailored));
            }
        }
        for (peer, cmd, filter) in updates {
            self.sent_filters.insert(peer, filter.clone());
            let _ = cmd.send(PeerCmd::SendFilterUpdate(filter));
        }
    }

    /// Deliver a frame locally and forward it to matching peers.
    async fn route(&mut self, from: Option<EndpointId>, frame: Frame) {
        let topic = match route_topic(&frame) {
            Some(t) => t,
            None => {
                tracing::warn!(?from, "unroutable frame type from peer");
                return;
            }
        };

        self.note_origin(&frame);
        if self.deliver_local(&topic, &frame) {
            // Consumed at its destination; nothing left to forward.
            return;
        }

        // Forwarding. Data frames carry the hop TTL; store frames are
        // bounded by their targeted topics plus sender exclusion.
        let forwarded = match &frame {
            Frame::Data { hops, topic, value } => {
                let next = hops + 1;
                if next > self.cfg.max_hops {
                    tracing::debug!(%topic, "hop limit reached, not forwarding");
                    return;
                }
                Frame::Data {
                    hops: next,
                    topic: topic.clone(),
                    value: value.clone(),
                }
            }
            other => other.clone(),
        };

        for peer in self.table.routes(&topic) {
            if Some(peer) == from {
                continue;
            }
            if let Some(link) = self.peers.get(&peer) {
                // Bounded send: a slow peer pushes back on the router,
                // and through the router's mailbox on publishers.
                if link.outbound.send(forwarded.clone()).await.is_err() {
                    tracing::debug!(
                        peer = %peer, addr = %link.addr,
                        "dropping frame for departed peer"
                    );
                }
            }
        }
    }

    /// Store frames carry their origin endpoint. An origin beyond our
    /// direct peers is an endpoint we just learned exists.
    fn note_origin(&mut self, frame: &Frame) {
        let origin = match frame {
            Frame::StoreCommand { publisher, .. }
            | Frame::StoreEvent { publisher, .. } => *publisher,
            Frame::StoreRequest { requester, .. } => *requester,
            _ => return,
        };
        if origin != self.id
            && !self.peers.contains_key(&origin)
            && self.discovered.insert(origin)
        {
            self.status.status(
                StatusCode::EndpointDiscovered,
                format!("{origin}"),
            );
        }
    }

    /// Deliver a frame to local consumers. Returns true when the frame
    /// reached its terminal destination here: a command or request at
    /// the store's master, or a response addressed to this endpoint.
    fn deliver_local(&mut self, topic: &Topic, frame: &Frame) -> bool {
        match frame {
            Frame::Data { topic, value, .. } => {
                let mut dead = Vec::new();
                for (id, (filter, queue)) in self.subscribers.iter() {
                    if !filter.matches(topic) {
                        continue;
                    }
                    match queue.push(Message {
                        topic: topic.clone(),
                        value: value.clone(),
                    }) {
                        PushOutcome::Queued => (),
                        PushOutcome::Overflow => {
                            self.status.error(
                                ErrorCode::WriteOverflow,
                                format!(
                                    "subscriber {id} dropped a message on {topic}"
                                ),
                            );
                        }
                        PushOutcome::Closed => dead.push(*id),
                    }
                }
                if !dead.is_empty() {
                    for id in dead {
                        self.subscribers.remove(&id);
                    }
                    self.refresh_filters();
                }
                false
            }
            Frame::StoreCommand {
                seq,
                publisher,
                store,
                command,
            } => {
                if let Some(master) = self.masters.get(store) {
                    let _ = master.send(MasterMsg::Command {
                        seq: *seq,
                        publisher: *publisher,
                        command: command.clone(),
                    });
                    true
                } else {
                    false
                }
            }
            Frame::StoreRequest {
                request_id,
                requester,
                store,
                query,
            } => {
                if let Some(master) = self.masters.get(store) {
                    let _ = master.send(MasterMsg::Request {
                        request_id: *request_id,
                        requester: *requester,
                        query: query.clone(),
                    });
                    true
                } else {
                    false
                }
            }
            Frame::StoreEvent {
                seq,
                publisher,
                store,
                event,
            } => {
                if let Some(clone) = self.clones.get(store) {
                    let _ = clone.send(CloneMsg::Event {
                        seq: *seq,
                        publisher: *publisher,
                        event: event.clone(),
                    });
                }
                // Other clones may live beyond this endpoint.
                false
            }
            Frame::StoreResponse {
                request_id,
                requester,
                reply,
            } => {
                if *requester == self.id {
                    if let Some(tx) = self.pending.remove(request_id) {
                        let _ = tx.send(reply.clone());
                    }
                    true
                } else {
                    false
                }
            }
            _ => {
                tracing::warn!(%topic, "control frame reached the router");
                true
            }
        }
    }

    fn shutdown(&mut self) {
        for (_, (_, queue)) in self.subscribers.drain() {
            queue.close_for_shutdown();
        }
        for (_, tx) in self.pending.drain() {
            let _ = tx.send(QueryReply::Err {
                code: ErrorCode::ShutdownInProgress,
                context: "endpoint shutting down".into(),
            });
        }
        self.masters.clear();
        self.clones.clear();
        self.peers.clear();
    }
}

/// The topic a frame routes under, derived for store frames from their
/// store name or requester.
fn route_topic(frame: &Frame) -> Option<Topic> {
    match frame {
        Frame::Data { topic, .. } => Some(topic.clone()),
        Frame::StoreCommand { store, .. }
        | Frame::StoreRequest { store, .. } => {
            Some(topic::store_master_topic(store))
        }
        Frame::StoreEvent { store, .. } => {
            Some(topic::store_clone_topic(store))
        }
        Frame::StoreResponse { requester, .. } => {
            Some(topic::store_response_topic(*requester))
        }
        _ => None,
    }
}
