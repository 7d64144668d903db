//! The in-process stub transport.
//!
//! This is NOT a production module. It is for testing only: it
//! "connects" endpoints within the same process through channel pairs
//! registered in a static global, keyed by synthetic loopback
//! addresses.

use bytes::Bytes;
use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use telefab_api::{
    builder::Builder,
    config::Config,
    transport::{
        Connection, ConnectionHandler, DynConnection,
        DynConnectionHandler, DynTransport, DynTransportFactory,
        Transport, TransportFactory,
    },
    BoxFut, FabError, FabResult,
};
use tokio::sync::mpsc;

/// The in-process stub transport factory.
#[derive(Debug)]
pub struct MemTransportFactory {}

impl MemTransportFactory {
    /// Construct a new MemTransportFactory.
    pub fn create() -> DynTransportFactory {
        let out: DynTransportFactory = Arc::new(MemTransportFactory {});
        out
    }
}

impl TransportFactory for MemTransportFactory {
    fn default_config(&self, _config: &mut Config) -> FabResult<()> {
        Ok(())
    }

    fn create(
        &self,
        _builder: Arc<Builder>,
        bind: Option<SocketAddr>,
        handler: DynConnectionHandler,
    ) -> BoxFut<'static, FabResult<DynTransport>> {
        Box::pin(async move {
            let out: DynTransport =
                Arc::new(MemTransport::create(bind, handler));
            Ok(out)
        })
    }
}

#[derive(Debug)]
struct MemTransport {
    local: SocketAddr,
    accept_task: tokio::task::AbortHandle,
}

impl Drop for MemTransport {
    fn drop(&mut self) {
        get_stat().remove(&self.local);
        self.accept_task.abort();
    }
}

impl MemTransport {
    fn create(
        bind: Option<SocketAddr>,
        handler: DynConnectionHandler,
    ) -> Self {
        let (local, mut accept_rx) = get_stat().listen(bind);
        let accept_task = tokio::task::spawn(async move {
            while let Some(conn) = accept_rx.recv().await {
                handler.incoming(conn);
            }
        })
        .abort_handle();
        Self { local, accept_task }
    }
}

impl Transport for MemTransport {
    fn local_addr(&self) -> Option<SocketAddr> {
        Some(self.local)
    }

    fn connect(
        &self,
        addr: SocketAddr,
    ) -> BoxFut<'_, FabResult<DynConnection>> {
        Box::pin(async move { get_stat().connect(self.local, addr) })
    }
}

type FrameSend = mpsc::UnboundedSender<Bytes>;
type FrameRecv = mpsc::UnboundedReceiver<Bytes>;
type AcceptSend = mpsc::UnboundedSender<DynConnection>;

struct MemConnection {
    peer: SocketAddr,
    send: Mutex<Option<FrameSend>>,
    recv: tokio::sync::Mutex<FrameRecv>,
}

impl std::fmt::Debug for MemConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemConnection")
            .field("peer", &self.peer)
            .finish()
    }
}

impl Connection for MemConnection {
    fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    fn send(&self, data: Bytes) -> BoxFut<'_, FabResult<()>> {
        Box::pin(async move {
            let send = self.send.lock().unwrap().clone();
            match send {
                Some(send) if send.send(data).is_ok() => Ok(()),
                _ => Err(FabError::transport("connection closed")),
            }
        })
    }

    fn recv(&self) -> BoxFut<'_, Option<Bytes>> {
        Box::pin(async move { self.recv.lock().await.recv().await })
    }

    fn close(&self) -> BoxFut<'_, ()> {
        Box::pin(async move {
            self.send.lock().unwrap().take();
        })
    }
}

/// The static global registry of in-process listeners.
struct Stat {
    listeners: Mutex<HashMap<SocketAddr, AcceptSend>>,
    next_port: AtomicU16,
}

impl Stat {
    fn new() -> Self {
        Self {
            listeners: Mutex::new(HashMap::new()),
            next_port: AtomicU16::new(1),
        }
    }

    /// Register a listener, allocating a synthetic address unless one
    /// with a concrete port was supplied.
    fn listen(
        &self,
        bind: Option<SocketAddr>,
    ) -> (SocketAddr, mpsc::UnboundedReceiver<DynConnection>) {
        let addr = match bind {
            Some(addr) if addr.port() != 0 => addr,
            _ => SocketAddr::new(
                IpAddr::V4(Ipv4Addr::LOCALHOST),
                self.next_port.fetch_add(1, Ordering::Relaxed),
            ),
        };
        let (tx, rx) = mpsc::unbounded_channel();
        self.listeners.lock().unwrap().insert(addr, tx);
        (addr, rx)
    }

    fn remove(&self, addr: &SocketAddr) {
        self.listeners.lock().unwrap().remove(addr);
    }

    /// Open a channel pair to a registered listener.
    fn connect(
        &self,
        from: SocketAddr,
        to: SocketAddr,
    ) -> FabResult<DynConnection> {
        let accept = self
            .listeners
            .lock()
            .unwrap()
            .get(&to)
            .cloned()
            .ok_or_else(|| {
                FabError::transport(format!("nothing listening at {to}"))
            })?;

        let (a_tx, a_rx) = mpsc::unbounded_channel();
        let (b_tx, b_rx) = mpsc::unbounded_channel();

        let ours: DynConnection = Arc::new(MemConnection {
            peer: to,
            send: Mutex::new(Some(a_tx)),
            recv: tokio::sync::Mutex::new(b_rx),
        });
        let theirs: DynConnection = Arc::new(MemConnection {
            peer: from,
            send: Mutex::new(Some(b_tx)),
            recv: tokio::sync::Mutex::new(a_rx),
        });

        accept.send(theirs).map_err(|_| {
            FabError::transport(format!("listener at {to} went away"))
        })?;
        Ok(ours)
    }
}

static STAT: OnceLock<Stat> = OnceLock::new();
fn get_stat() -> &'static Stat {
    STAT.get_or_init(Stat::new)
}

#[cfg(test)]
mod test {
    use super::*;

    #[derive(Debug)]
    struct Collect(Mutex<Vec<DynConnection>>);

    impl ConnectionHandler for Collect {
        fn incoming(&self, conn: DynConnection) {
            self.0.lock().unwrap().push(conn);
        }
    }

    #[tokio::test]
    async fn connect_and_exchange() {
        let handler = Arc::new(Collect(Mutex::new(Vec::new())));
        let listener = MemTransport::create(None, handler.clone());
        let addr = listener.local_addr().unwrap();

        let conn = listener.connect(addr).await.unwrap();
        conn.send(Bytes::from_static(b"hi")).await.unwrap();

        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        let accepted =
            handler.0.lock().unwrap().pop().expect("no connection");
        assert_eq!(
            Bytes::from_static(b"hi"),
            accepted.recv().await.unwrap()
        );

        accepted.send(Bytes::from_static(b"yo")).await.unwrap();
        assert_eq!(Bytes::from_static(b"yo"), conn.recv().await.unwrap());

        conn.close().await;
        assert!(accepted.recv().await.is_none());
    }

    #[tokio::test]
    async fn connect_to_nowhere_fails() {
        let addr: SocketAddr = "127.0.0.1:65000".parse().unwrap();
        assert!(get_stat().connect(addr, addr).is_err());
    }
}
