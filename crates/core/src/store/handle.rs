//! The client-facing store handle.
//!
//! A [Store] resolves to the master directly when this endpoint hosts
//! it, and forwards over the fabric otherwise. Mutations ride
//! sequenced commands to the master topic; reads are request/response
//! with a per-endpoint request id and the configured timeout.

use super::CloneMsg;
use crate::requests::Requests;
use crate::router::{RouterCmd, RouterSender};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use telefab_api::{
    store::{Command, Entry, Query, QueryReply},
    topic,
    wire::Frame,
    FabError, FabResult, Timestamp, Value,
};
use tokio::sync::{mpsc, oneshot};

/// How often a degraded handle probes for a route to its master while
/// a write waits.
const ROUTE_PROBE_INTERVAL: Duration = Duration::from_millis(200);

/// A handle on one named store.
///
/// Cheap to clone; clones share the command sequence so writes from
/// one endpoint stay ordered.
#[derive(Clone)]
pub struct Store {
    inner: Arc<StoreInner>,
}

struct StoreInner {
    name: String,
    router: RouterSender,
    requests: Arc<Requests>,
    seq: AtomicU64,
    // Writes serialize here so sequence numbers enter the router in
    // order even when callers race.
    send_lock: tokio::sync::Mutex<()>,
    clone_mailbox: Option<mpsc::UnboundedSender<CloneMsg>>,
    reconnect_timeout: Duration,
}

impl std::fmt::Debug for Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Store")
            .field("name", &self.inner.name)
            .finish()
    }
}

impl Store {
    pub(crate) fn new(
        name: String,
        router: RouterSender,
        requests: Arc<Requests>,
        clone_mailbox: Option<mpsc::UnboundedSender<CloneMsg>>,
        reconnect_timeout: Duration,
    ) -> Self {
        Self {
            inner: Arc::new(StoreInner {
                name,
                router,
                requests,
                seq: AtomicU64::new(0),
                send_lock: tokio::sync::Mutex::new(()),
                clone_mailbox,
                reconnect_timeout,
            }),
        }
    }

    /// The store's name.
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Unconditionally set `key` to `value`, optionally expiring.
    pub async fn put<K, V>(
        &self,
        key: K,
        value: V,
        expiry: Option<Timestamp>,
    ) -> FabResult<()>
    where
        K: Into<Value>,
        V: Into<Value>,
    {
        self.send_command(Command::Put {
            key: key.into(),
            value: value.into(),
            expiry,
        })
        .await
    }

    /// Remove `key`.
    pub async fn erase<K: Into<Value>>(&self, key: K) -> FabResult<()> {
        self.send_command(Command::Erase { key: key.into() }).await
    }

    /// Drop every entry.
    pub async fn clear(&self) -> FabResult<()> {
        self.send_command(Command::Clear).await
    }

    /// Combine `delta` into the value at `key`, returning the result.
    /// Fails with a type clash when the existing value does not admit
    /// the operation.
    pub async fn add<K, V>(
        &self,
        key: K,
        delta: V,
        expiry: Option<Timestamp>,
    ) -> FabResult<Value>
    where
        K: Into<Value>,
        V: Into<Value>,
    {
        let key = key.into();
        let delta = delta.into();
        self.call_command(|request_id| Command::Add {
            request_id,
            key,
            delta,
            expiry,
        })
        .await?
        .into_result()
    }

    /// Remove `delta` from the value at `key`, returning the result.
    pub async fn subtract<K, V>(
        &self,
        key: K,
        delta: V,
        expiry: Option<Timestamp>,
    ) -> FabResult<Value>
    where
        K: Into<Value>,
        V: Into<Value>,
    {
        let key = key.into();
        let delta = delta.into();
        self.call_command(|request_id| Command::Subtract {
            request_id,
            key,
            delta,
            expiry,
        })
        .await?
        .into_result()
    }

    /// Set `key` iff it is absent. Returns whether the write won; a
    /// conflict is a successful `false`, not an error.
    pub async fn put_unique<K, V>(
        &self,
        key: K,
        value: V,
        expiry: Option<Timestamp>,
    ) -> FabResult<bool>
    where
        K: Into<Value>,
        V: Into<Value>,
    {
        let key = key.into();
        let value = value.into();
        let reply = self
            .call_command(|request_id| Command::PutUnique {
                request_id,
                key,
                value,
                expiry,
            })
            .await?
            .into_result()?;
        match reply {
            Value::Bool(won) => Ok(won),
            other => Err(FabError::other(format!(
                "put_unique answered with {other}"
            ))),
        }
    }

    /// Remove `key` iff it exists, has an expiry, and the expiry has
    /// passed. Returns whether it was removed.
    pub async fn expire<K: Into<Value>>(&self, key: K) -> FabResult<bool> {
        let key = key.into();
        let reply = self
            .call_command(|request_id| Command::Expire {
                request_id,
                key,
            })
            .await?
            .into_result()?;
        match reply {
            Value::Bool(removed) => Ok(removed),
            other => Err(FabError::other(format!(
                "expire answered with {other}"
            ))),
        }
    }

    /// Fetch the value at `key`; absent (or expired) keys fail with
    /// [FabError::NoSuchKey].
    pub async fn get<K: Into<Value>>(&self, key: K) -> FabResult<Value> {
        self.query(Query::Get { key: key.into() })
            .await?
            .into_result()
    }

    /// Fetch an indexed aspect of the value at `key`: a table entry, a
    /// vector position, or set membership.
    pub async fn get_aspect<K, A>(
        &self,
        key: K,
        aspect: A,
    ) -> FabResult<Value>
    where
        K: Into<Value>,
        A: Into<Value>,
    {
        self.query(Query::GetAspect {
            key: key.into(),
            aspect: aspect.into(),
        })
        .await?
        .into_result()
    }

    /// Does `key` exist (and is unexpired)?
    pub async fn exists<K: Into<Value>>(&self, key: K) -> FabResult<bool> {
        match self.query(Query::Exists { key: key.into() })
            .await?
            .into_result()?
        {
            Value::Bool(exists) => Ok(exists),
            other => Err(FabError::other(format!(
                "exists answered with {other}"
            ))),
        }
    }

    /// Every live key.
    pub async fn keys(&self) -> FabResult<Vec<Value>> {
        match self.query(Query::Keys).await?.into_result()? {
            Value::Set(keys) => Ok(keys.into_iter().collect()),
            other => Err(FabError::other(format!(
                "keys answered with {other}"
            ))),
        }
    }

    /// Number of live entries.
    pub async fn size(&self) -> FabResult<u64> {
        match self.query(Query::Size).await?.into_result()? {
            Value::Count(n) => Ok(n),
            other => Err(FabError::other(format!(
                "size answered with {other}"
            ))),
        }
    }

    /// Every live entry, fetched from the master.
    pub async fn snapshot(&self) -> FabResult<Vec<Entry>> {
        match self.query(Query::Snapshot).await? {
            QueryReply::Entries(entries) => Ok(entries),
            reply => reply.into_result().map(|_| Vec::new()),
        }
    }

    /// The local clone mirror, when this handle fronts a clone. Useful
    /// for inspecting replication without touching the master.
    pub async fn mirror(&self) -> FabResult<Vec<Entry>> {
        let mailbox = self.inner.clone_mailbox.as_ref().ok_or_else(|| {
            FabError::other(format!(
                "store {} has no local clone",
                self.inner.name
            ))
        })?;
        let (tx, rx) = oneshot::channel();
        mailbox
            .send(CloneMsg::Mirror { reply: tx })
            .map_err(|_| FabError::ShutdownInProgress)?;
        rx.await.map_err(|_| FabError::ShutdownInProgress)
    }

    // -- internals --

    async fn send_command(&self, command: Command) -> FabResult<()> {
        self.ensure_route().await?;
        let _guard = self.inner.send_lock.lock().await;
        let seq = self.inner.seq.fetch_add(1, Ordering::Relaxed) + 1;
        let frame = Frame::StoreCommand {
            seq,
            publisher: self.inner.requests.endpoint(),
            store: self.inner.name.clone(),
            command,
        };
        self.inner
            .router
            .send(RouterCmd::Frame { from: None, frame })
            .await
            .map_err(|_| FabError::ShutdownInProgress)
    }

    async fn call_command(
        &self,
        build: impl FnOnce(u64) -> Command,
    ) -> FabResult<QueryReply> {
        self.ensure_route().await?;
        let request_id = self.inner.requests.next_request_id();
        let rx = self.inner.requests.register(request_id).await?;
        {
            // Sequence allocation and the send stay under one lock so
            // commands enter the router in sequence order.
            let _guard = self.inner.send_lock.lock().await;
            let seq = self.inner.seq.fetch_add(1, Ordering::Relaxed) + 1;
            let frame = Frame::StoreCommand {
                seq,
                publisher: self.inner.requests.endpoint(),
                store: self.inner.name.clone(),
                command: build(request_id),
            };
            self.inner.requests.send(frame).await?;
        }
        self.inner.requests.finish(request_id, rx).await
    }

    async fn query(&self, query: Query) -> FabResult<QueryReply> {
        // Reads fail fast while the master is unreachable.
        if !self.has_route().await? {
            return Err(FabError::backend(format!(
                "no route to the master of store {}",
                self.inner.name
            )));
        }
        let request_id = self.inner.requests.next_request_id();
        let frame = Frame::StoreRequest {
            request_id,
            requester: self.inner.requests.endpoint(),
            store: self.inner.name.clone(),
            query,
        };
        self.inner.requests.call(request_id, frame).await
    }

    async fn has_route(&self) -> FabResult<bool> {
        let (tx, rx) = oneshot::channel();
        self.inner
            .router
            .send(RouterCmd::HasRoute {
                topic: topic::store_master_topic(&self.inner.name),
                reply: tx,
            })
            .await
            .map_err(|_| FabError::ShutdownInProgress)?;
        rx.await.map_err(|_| FabError::ShutdownInProgress)
    }

    /// Writes queue while the master is unreachable, up to the
    /// reconnect timeout, then fail with a backend error.
    async fn ensure_route(&self) -> FabResult<()> {
        if self.has_route().await? {
            return Ok(());
        }
        let deadline =
            tokio::time::Instant::now() + self.inner.reconnect_timeout;
        loop {
            tokio::time::sleep(ROUTE_PROBE_INTERVAL).await;
            if self.has_route().await? {
                return Ok(());
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(FabError::backend(format!(
                    "master of store {} unreachable for {:?}",
                    self.inner.name, self.inner.reconnect_timeout
                )));
            }
        }
    }
}
