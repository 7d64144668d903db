//! Transport-related types.
//!
//! A transport delivers whole length-framed byte sequences reliably and
//! in order per connection. Everything above this seam (handshakes,
//! routing, flow control) is transport-agnostic; everything below it
//! (sockets, TLS, in-process pipes) is a driver.

use crate::{builder, config, BoxFut, FabResult};
use bytes::Bytes;
use std::net::SocketAddr;
use std::sync::Arc;

/// One reliable, ordered, framed byte channel to a remote endpoint.
pub trait Connection: 'static + Send + Sync + std::fmt::Debug {
    /// The remote address of this connection.
    fn peer_addr(&self) -> SocketAddr;

    /// Send one framed byte sequence. Resolves once the frame is handed
    /// to the driver; delivery is not acknowledged.
    fn send(&self, data: Bytes) -> BoxFut<'_, FabResult<()>>;

    /// Receive the next framed byte sequence. Returns `None` once the
    /// connection is closed. Only one task may be parked here at a
    /// time; the peer actor is that task.
    fn recv(&self) -> BoxFut<'_, Option<Bytes>>;

    /// Close the connection. Frames already handed to the driver are
    /// flushed on a best-effort basis.
    fn close(&self) -> BoxFut<'_, ()>;
}

/// Trait-object [Connection].
pub type DynConnection = Arc<dyn Connection>;

/// Receives connections that remote endpoints opened to us.
pub trait ConnectionHandler: 'static + Send + Sync + std::fmt::Debug {
    /// An incoming connection was accepted.
    fn incoming(&self, conn: DynConnection);
}

/// Trait-object [ConnectionHandler].
pub type DynConnectionHandler = Arc<dyn ConnectionHandler>;

/// A bound transport instance.
pub trait Transport: 'static + Send + Sync + std::fmt::Debug {
    /// The address peers can reach this endpoint at, if listening.
    fn local_addr(&self) -> Option<SocketAddr>;

    /// Open a connection to a remote endpoint.
    fn connect(
        &self,
        addr: SocketAddr,
    ) -> BoxFut<'_, FabResult<DynConnection>>;
}

/// Trait-object [Transport].
pub type DynTransport = Arc<dyn Transport>;

/// A factory for constructing [Transport] instances.
pub trait TransportFactory: 'static + Send + Sync + std::fmt::Debug {
    /// Help the builder construct a default config from the chosen
    /// module factories.
    fn default_config(&self, config: &mut config::Config) -> FabResult<()>;

    /// Construct a transport instance, bound to `bind` when listening
    /// is wanted. Incoming connections are handed to `handler`.
    fn create(
        &self,
        builder: Arc<builder::Builder>,
        bind: Option<SocketAddr>,
        handler: DynConnectionHandler,
    ) -> BoxFut<'static, FabResult<DynTransport>>;
}

/// Trait-object [TransportFactory].
pub type DynTransportFactory = Arc<dyn TransportFactory>;
