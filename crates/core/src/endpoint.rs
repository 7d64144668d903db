//! The endpoint: the public face of one fabric participant.

use crate::peer::{self, PeerCmd, PeerCtx, PeerMap};
use crate::requests::Requests;
use crate::router::{self, RouterCmd, RouterSender};
use crate::status::{StatusFeed, StatusReceiver};
use crate::store::{
    spawn_clone, spawn_master, CloneMsg, MasterMsg, Store,
};
use crate::subscriber::{SubQueue, Subscriber};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use telefab_api::{
    builder::Builder,
    config::FabricConfig,
    store::DynStoreBackend,
    transport::{ConnectionHandler, DynConnection, DynTransport},
    EndpointId, ErrorCode, FabError, FabResult, Filter, PeerInfo,
    Timestamp, Topic, Value,
};
use tokio::sync::{mpsc, oneshot};

/// How long shutdown waits for each actor to acknowledge its flush.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(1);

/// A process participant in the fabric: hosts subscribers and stores,
/// and peers with other endpoints over the configured transport.
///
/// Cheap to clone; the last handle dropped tears the endpoint down.
#[derive(Clone)]
pub struct Endpoint {
    inner: Arc<EndpointInner>,
}

struct EndpointInner {
    id: EndpointId,
    builder: Arc<Builder>,
    cfg: FabricConfig,
    status: StatusFeed,
    router: RouterSender,
    router_abort: tokio::task::AbortHandle,
    transport: DynTransport,
    peers: PeerMap,
    requests: Arc<Requests>,
    stores: Mutex<HashMap<String, StoreRecord>>,
    next_subscriber: AtomicU64,
    shutting_down: AtomicBool,
}

enum StoreMailbox {
    Master(mpsc::UnboundedSender<MasterMsg>),
    Clone(mpsc::UnboundedSender<CloneMsg>),
}

struct StoreRecord {
    handle: Store,
    mailbox: StoreMailbox,
    abort: tokio::task::AbortHandle,
}

impl Drop for EndpointInner {
    fn drop(&mut self) {
        self.router_abort.abort();
        for entry in self.peers.lock().unwrap().values() {
            entry.abort.abort();
        }
        for record in self.stores.lock().unwrap().values() {
            record.abort.abort();
        }
    }
}

impl std::fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Endpoint")
            .field("id", &self.inner.id)
            .field("addr", &self.local_addr())
            .finish()
    }
}

/// Hands accepted transport connections to fresh peer actors.
#[derive(Debug)]
struct IncomingHandler {
    ctx: PeerCtx,
}

impl ConnectionHandler for IncomingHandler {
    fn incoming(&self, conn: DynConnection) {
        peer::spawn_accepted(self.ctx.clone(), conn);
    }
}

impl Endpoint {
    /// Construct an endpoint from a frozen builder, optionally
    /// listening for peers at `bind`.
    pub async fn create(
        builder: Arc<Builder>,
        bind: Option<SocketAddr>,
    ) -> FabResult<Self> {
        let cfg: FabricConfig = builder.config.get_module_config()?;
        let id = EndpointId::random();
        let status = StatusFeed::new();
        let (router, router_abort) =
            router::spawn(id, cfg.clone(), status.clone());
        let peers: PeerMap = Arc::new(Mutex::new(HashMap::new()));
        let requests = Arc::new(Requests::new(
            router.clone(),
            id,
            cfg.store_request_timeout(),
        ));

        let ctx = PeerCtx {
            id,
            cfg: cfg.clone(),
            router: router.clone(),
            status: status.clone(),
            peers: peers.clone(),
        };
        let handler = Arc::new(IncomingHandler { ctx });
        let transport = builder
            .transport
            .create(builder.clone(), bind, handler)
            .await?;

        Ok(Self {
            inner: Arc::new(EndpointInner {
                id,
                builder,
                cfg,
                status,
                router,
                router_abort,
                transport,
                peers,
                requests,
                stores: Mutex::new(HashMap::new()),
                next_subscriber: AtomicU64::new(1),
                shutting_down: AtomicBool::new(false),
            }),
        })
    }

    /// This endpoint's stable identity.
    pub fn id(&self) -> EndpointId {
        self.inner.id
    }

    /// The address peers can reach this endpoint at, when listening.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.inner.transport.local_addr()
    }

    /// The status channel: peer lifecycle and error events.
    pub fn status_events(&self) -> StatusReceiver {
        self.inner.status.subscribe()
    }

    /// Publish a message. Blocks only when downstream peer buffers are
    /// exerting backpressure.
    pub async fn publish<T, V>(&self, topic: T, value: V) -> FabResult<()>
    where
        T: AsRef<str>,
        V: Into<Value>,
    {
        self.check_live()?;
        let topic = Topic::new(topic.as_ref())?;
        self.inner
            .router
            .send(RouterCmd::Publish {
                topic,
                value: value.into(),
            })
            .await
            .map_err(|_| FabError::ShutdownInProgress)
    }

    /// Subscribe to all topics matching `filter`, with the configured
    /// default queue capacity.
    pub async fn subscribe(&self, filter: Filter) -> FabResult<Subscriber> {
        self.subscribe_with_capacity(
            filter,
            self.inner.cfg.subscriber_queue_capacity,
        )
        .await
    }

    /// Subscribe with an explicit bounded queue capacity. When the
    /// queue is full further matching messages are dropped for this
    /// subscriber only, surfacing `write_overflow` on the status
    /// channel.
    pub async fn subscribe_with_capacity(
        &self,
        filter: Filter,
        capacity: usize,
    ) -> FabResult<Subscriber> {
        self.check_live()?;
        let id = self
            .inner
            .next_subscriber
            .fetch_add(1, Ordering::Relaxed);
        let queue = SubQueue::new(capacity)?;
        self.inner
            .router
            .send(RouterCmd::SubscriberAdd {
                id,
                filter,
                queue: queue.clone(),
            })
            .await
            .map_err(|_| FabError::ShutdownInProgress)?;
        let router = self.inner.router.clone();
        Ok(Subscriber {
            id,
            queue,
            on_drop: Box::new(move |id| {
                let _ = router.try_send(RouterCmd::SubscriberRemove { id });
            }),
        })
    }

    /// Start peering with the endpoint at `addr`. A failed dial is
    /// reported once as `peer_unavailable` and not retried.
    pub fn peer(&self, addr: SocketAddr) -> FabResult<()> {
        self.peer_inner(addr, None)
    }

    /// Start peering with `addr`, retrying failed dials every
    /// `interval` (with growing spacing) until it succeeds or the peer
    /// is removed.
    pub fn peer_with_retry(
        &self,
        addr: SocketAddr,
        interval: Duration,
    ) -> FabResult<()> {
        self.peer_inner(addr, Some(interval))
    }

    fn peer_inner(
        &self,
        addr: SocketAddr,
        retry: Option<Duration>,
    ) -> FabResult<()> {
        self.check_live()?;
        if self.inner.peers.lock().unwrap().contains_key(&addr) {
            return Err(FabError::other(format!(
                "already peering with {addr}"
            )));
        }
        let ctx = self.peer_ctx();
        peer::spawn_dialer(
            ctx,
            self.inner.transport.clone(),
            addr,
            retry,
        );
        Ok(())
    }

    /// Remove the peering with `addr`. Unknown addresses surface
    /// `peer_invalid` on the status channel and nothing goes on the
    /// wire.
    pub fn unpeer(&self, addr: SocketAddr) {
        let entry_cmd = self
            .inner
            .peers
            .lock()
            .unwrap()
            .get(&addr)
            .map(|e| e.cmd.clone());
        match entry_cmd {
            Some(cmd) if cmd.send(PeerCmd::Unpeer).is_ok() => (),
            _ => {
                self.inner.status.error(
                    ErrorCode::PeerInvalid,
                    format!("no peering with {addr}"),
                );
            }
        }
    }

    /// A snapshot of every known peer record.
    pub fn peers(&self) -> Vec<PeerInfo> {
        self.inner
            .peers
            .lock()
            .unwrap()
            .iter()
            .map(|(addr, entry)| {
                let state = entry.state.lock().unwrap();
                PeerInfo {
                    addr: *addr,
                    status: state.status,
                    last_handshake: state.last_handshake,
                }
            })
            .collect()
    }

    /// Host the master replica of store `name`, persisting through the
    /// builder's backend factory.
    pub async fn attach_master(&self, name: &str) -> FabResult<Store> {
        let backend = self
            .inner
            .builder
            .store_backend
            .create(self.inner.builder.clone(), name)
            .await?;
        self.attach_master_with_backend(name, backend).await
    }

    /// Host the master replica of store `name` on an explicit backend.
    pub async fn attach_master_with_backend(
        &self,
        name: &str,
        backend: DynStoreBackend,
    ) -> FabResult<Store> {
        self.check_live()?;
        let (mailbox, abort) = spawn_master(
            name.to_string(),
            backend,
            self.inner.id,
            self.inner.router.clone(),
            self.inner.status.clone(),
        );
        let (tx, rx) = oneshot::channel();
        let registered = self
            .inner
            .router
            .send(RouterCmd::MasterAdd {
                name: name.to_string(),
                mailbox: mailbox.clone(),
                reply: tx,
            })
            .await
            .map_err(|_| FabError::ShutdownInProgress);
        let registered = match registered {
            Ok(()) => rx
                .await
                .unwrap_or(Err(FabError::ShutdownInProgress)),
            Err(err) => Err(err),
        };
        if let Err(err) = registered {
            abort.abort();
            return Err(err);
        }

        let handle = Store::new(
            name.to_string(),
            self.inner.router.clone(),
            self.inner.requests.clone(),
            None,
            self.inner.cfg.store_reconnect_timeout(),
        );
        self.inner.stores.lock().unwrap().insert(
            name.to_string(),
            StoreRecord {
                handle: handle.clone(),
                mailbox: StoreMailbox::Master(mailbox),
                abort,
            },
        );
        Ok(handle)
    }

    /// Host a clone replica of store `name`, mirroring the master
    /// hosted elsewhere in the fabric.
    pub async fn attach_clone(&self, name: &str) -> FabResult<Store> {
        self.check_live()?;
        let (mailbox, abort) =
            spawn_clone(name.to_string(), self.inner.requests.clone());
        let (tx, rx) = oneshot::channel();
        let registered = self
            .inner
            .router
            .send(RouterCmd::CloneAdd {
                name: name.to_string(),
                mailbox: mailbox.clone(),
                reply: tx,
            })
            .await
            .map_err(|_| FabError::ShutdownInProgress);
        let registered = match registered {
            Ok(()) => rx
                .await
                .unwrap_or(Err(FabError::ShutdownInProgress)),
            Err(err) => Err(err),
        };
        if let Err(err) = registered {
            abort.abort();
            return Err(err);
        }

        let handle = Store::new(
            name.to_string(),
            self.inner.router.clone(),
            self.inner.requests.clone(),
            Some(mailbox.clone()),
            self.inner.cfg.store_reconnect_timeout(),
        );
        self.inner.stores.lock().unwrap().insert(
            name.to_string(),
            StoreRecord {
                handle: handle.clone(),
                mailbox: StoreMailbox::Clone(mailbox),
                abort,
            },
        );
        Ok(handle)
    }

    /// A client handle on store `name` hosted elsewhere in the fabric.
    /// No replica is attached locally; every operation is forwarded to
    /// the master.
    pub fn store_client(&self, name: &str) -> Store {
        Store::new(
            name.to_string(),
            self.inner.router.clone(),
            self.inner.requests.clone(),
            None,
            self.inner.cfg.store_reconnect_timeout(),
        )
    }

    /// The handle of an attached store, if any.
    pub fn store(&self, name: &str) -> Option<Store> {
        self.inner
            .stores
            .lock()
            .unwrap()
            .get(name)
            .map(|r| r.handle.clone())
    }

    /// Tear the endpoint down cooperatively: masters finish and flush
    /// their events, peers flush their outbound queues and say
    /// goodbye, pending operations fail with `shutdown_in_progress`.
    pub async fn shutdown(&self) {
        if self.inner.shutting_down.swap(true, Ordering::AcqRel) {
            return;
        }

        // Stores first, so their last events still ride the peers.
        let mailboxes: Vec<StoreMailbox> = {
            let mut stores = self.inner.stores.lock().unwrap();
            stores
                .values_mut()
                .map(|r| match &r.mailbox {
                    StoreMailbox::Master(tx) => {
                        StoreMailbox::Master(tx.clone())
                    }
                    StoreMailbox::Clone(tx) => {
                        StoreMailbox::Clone(tx.clone())
                    }
                })
                .collect()
        };
        for mailbox in mailboxes {
            let (tx, rx) = oneshot::channel();
            let sent = match &mailbox {
                StoreMailbox::Master(m) => {
                    m.send(MasterMsg::Shutdown { reply: tx }).is_ok()
                }
                StoreMailbox::Clone(c) => {
                    c.send(CloneMsg::Shutdown { reply: tx }).is_ok()
                }
            };
            if sent {
                let _ = tokio::time::timeout(SHUTDOWN_GRACE, rx).await;
            }
        }

        // Peers flush and say goodbye.
        let peer_cmds: Vec<_> = self
            .inner
            .peers
            .lock()
            .unwrap()
            .values()
            .map(|e| e.cmd.clone())
            .collect();
        let mut acks = Vec::new();
        for cmd in peer_cmds {
            let (tx, rx) = oneshot::channel();
            if cmd.send(PeerCmd::Shutdown(tx)).is_ok() {
                acks.push(rx);
            }
        }
        for ack in acks {
            let _ = tokio::time::timeout(SHUTDOWN_GRACE, ack).await;
        }

        // The router closes subscriber queues and fails pending
        // requests.
        let (tx, rx) = oneshot::channel();
        if self
            .inner
            .router
            .send(RouterCmd::Shutdown { reply: tx })
            .await
            .is_ok()
        {
            let _ = tokio::time::timeout(SHUTDOWN_GRACE, rx).await;
        }

        // Whatever is left stops now.
        self.inner.router_abort.abort();
        for entry in self.inner.peers.lock().unwrap().values() {
            entry.abort.abort();
        }
        for record in self.inner.stores.lock().unwrap().values() {
            record.abort.abort();
        }
    }

    fn peer_ctx(&self) -> PeerCtx {
        PeerCtx {
            id: self.inner.id,
            cfg: self.inner.cfg.clone(),
            router: self.inner.router.clone(),
            status: self.inner.status.clone(),
            peers: self.inner.peers.clone(),
        }
    }

    fn check_live(&self) -> FabResult<()> {
        if self.inner.shutting_down.load(Ordering::Acquire) {
            return Err(FabError::ShutdownInProgress);
        }
        Ok(())
    }
}

/// Build a timestamp `d` from now, for store expiries.
pub fn expiry_after(d: Duration) -> Timestamp {
    Timestamp::now() + d
}
