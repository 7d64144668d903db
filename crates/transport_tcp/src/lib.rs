#![deny(missing_docs)]
//! TCP transport driver for telefab.
//!
//! Frames travel as `len:u32le || frame bytes`, where `len` counts the
//! frame type byte plus its payload. Each connection runs a reader
//! task and a writer task; the reader leans on the TCP receive window
//! for backpressure when the peer actor falls behind.

use bytes::Bytes;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use telefab_api::{
    builder::Builder,
    config::{Config, ModConfig},
    transport::{
        Connection, DynConnection, DynConnectionHandler, DynTransport,
        DynTransportFactory, Transport, TransportFactory,
    },
    BoxFut, FabError, FabResult,
};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;

/// Length prefix bytes on every frame.
const FRAME_HEADER_LEN: usize = 4;

/// Inbound frames buffered per connection before the reader stops
/// pulling from the socket.
const INBOUND_BUFFER: usize = 64;

/// TcpTransport configuration types.
mod config {
    use super::ModConfig;

    /// Configuration parameters for
    /// [TcpTransportFactory](super::TcpTransportFactory).
    #[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
    #[serde(rename_all = "camelCase", default)]
    pub struct TcpTransportConfig {
        /// Largest accepted frame in bytes. Oversize frames are a
        /// protocol error and close the connection. Default: 16 MiB.
        pub max_frame_bytes: u32,
    }

    impl Default for TcpTransportConfig {
        fn default() -> Self {
            Self {
                max_frame_bytes: 16 * 1024 * 1024,
            }
        }
    }

    impl ModConfig for TcpTransportConfig {
        const MODULE: &'static str = "tcpTransport";
    }
}

pub use config::*;

/// The TCP transport factory.
#[derive(Debug)]
pub struct TcpTransportFactory {}

impl TcpTransportFactory {
    /// Construct a new TcpTransportFactory.
    pub fn create() -> DynTransportFactory {
        let out: DynTransportFactory = Arc::new(TcpTransportFactory {});
        out
    }
}

impl TransportFactory for TcpTransportFactory {
    fn default_config(&self, config: &mut Config) -> FabResult<()> {
        config.add_default_module_config::<TcpTransportConfig>()
    }

    fn create(
        &self,
        builder: Arc<Builder>,
        bind: Option<SocketAddr>,
        handler: DynConnectionHandler,
    ) -> BoxFut<'static, FabResult<DynTransport>> {
        Box::pin(async move {
            let config: TcpTransportConfig =
                builder.config.get_module_config()?;
            let out: DynTransport = Arc::new(
                TcpTransport::create(config, bind, handler).await?,
            );
            Ok(out)
        })
    }
}

#[derive(Debug)]
struct TcpTransport {
    local: Option<SocketAddr>,
    max_frame: usize,
    accept_task: Option<tokio::task::AbortHandle>,
}

impl Drop for TcpTransport {
    fn drop(&mut self) {
        if let Some(task) = &self.accept_task {
            task.abort();
        }
    }
}

impl TcpTransport {
    async fn create(
        config: TcpTransportConfig,
        bind: Option<SocketAddr>,
        handler: DynConnectionHandler,
    ) -> FabResult<Self> {
        let max_frame = config.max_frame_bytes as usize;
        let (local, accept_task) = match bind {
            None => (None, None),
            Some(bind) => {
                let listener =
                    TcpListener::bind(bind).await.map_err(|err| {
                        FabError::transport_src(
                            format!("cannot listen at {bind}"),
                            err,
                        )
                    })?;
                let local = listener.local_addr().map_err(|err| {
                    FabError::transport_src("listener has no address", err)
                })?;
                let task = tokio::task::spawn(accept_loop(
                    listener, handler, max_frame,
                ))
                .abort_handle();
                (Some(local), Some(task))
            }
        };
        Ok(Self {
            local,
            max_frame,
            accept_task,
        })
    }
}

async fn accept_loop(
    listener: TcpListener,
    handler: DynConnectionHandler,
    max_frame: usize,
) {
    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                let conn = TcpConnection::spawn(stream, peer, max_frame);
                handler.incoming(conn);
            }
            Err(err) => {
                tracing::warn!("accept failed: {err}");
                tokio::time::sleep(std::time::Duration::from_millis(100))
                    .await;
            }
        }
    }
}

impl Transport for TcpTransport {
    fn local_addr(&self) -> Option<SocketAddr> {
        self.local
    }

    fn connect(
        &self,
        addr: SocketAddr,
    ) -> BoxFut<'_, FabResult<DynConnection>> {
        Box::pin(async move {
            let stream =
                TcpStream::connect(addr).await.map_err(|err| {
                    FabError::transport_src(
                        format!("cannot connect to {addr}"),
                        err,
                    )
                })?;
            Ok(TcpConnection::spawn(stream, addr, self.max_frame))
        })
    }
}

struct TcpConnection {
    peer: SocketAddr,
    out_tx: Mutex<Option<mpsc::UnboundedSender<Bytes>>>,
    in_rx: tokio::sync::Mutex<mpsc::Receiver<Bytes>>,
    reader: tokio::task::AbortHandle,
    writer: tokio::task::AbortHandle,
}

impl std::fmt::Debug for TcpConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TcpConnection")
            .field("peer", &self.peer)
            .finish()
    }
}

impl Drop for TcpConnection {
    fn drop(&mut self) {
        self.reader.abort();
        self.writer.abort();
    }
}

impl TcpConnection {
    fn spawn(
        stream: TcpStream,
        peer: SocketAddr,
        max_frame: usize,
    ) -> DynConnection {
        let _ = stream.set_nodelay(true);
        let (read_half, write_half) = stream.into_split();
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let (in_tx, in_rx) = mpsc::channel(INBOUND_BUFFER);

        let writer = tokio::task::spawn(write_loop(write_half, out_rx))
            .abort_handle();
        let reader = tokio::task::spawn(read_loop(
            read_half, in_tx, max_frame,
        ))
        .abort_handle();

        let out: DynConnection = Arc::new(Self {
            peer,
            out_tx: Mutex::new(Some(out_tx)),
            in_rx: tokio::sync::Mutex::new(in_rx),
            reader,
            writer,
        });
        out
    }
}

impl Connection for TcpConnection {
    fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    fn send(&self, data: Bytes) -> BoxFut<'_, FabResult<()>> {
        Box::pin(async move {
            let tx = self.out_tx.lock().unwrap().clone();
            match tx {
                Some(tx) if tx.send(data).is_ok() => Ok(()),
                _ => Err(FabError::transport("connection closed")),
            }
        })
    }

    fn recv(&self) -> BoxFut<'_, Option<Bytes>> {
        Box::pin(async move { self.in_rx.lock().await.recv().await })
    }

    fn close(&self) -> BoxFut<'_, ()> {
        Box::pin(async move {
            // Dropping the sender lets the writer drain queued frames
            // and then shut the socket down.
            self.out_tx.lock().unwrap().take();
        })
    }
}

async fn write_loop(
    mut write_half: OwnedWriteHalf,
    mut out_rx: mpsc::UnboundedReceiver<Bytes>,
) {
    while let Some(data) = out_rx.recv().await {
        let len = (data.len() as u32).to_le_bytes();
        if write_half.write_all(&len).await.is_err() {
            return;
        }
        if write_half.write_all(&data).await.is_err() {
            return;
        }
    }
    let _ = write_half.shutdown().await;
}

async fn read_loop(
    mut read_half: OwnedReadHalf,
    in_tx: mpsc::Sender<Bytes>,
    max_frame: usize,
) {
    loop {
        let mut header = [0u8; FRAME_HEADER_LEN];
        if read_half.read_exact(&mut header).await.is_err() {
            return;
        }
        let len = u32::from_le_bytes(header) as usize;
        if len == 0 || len + FRAME_HEADER_LEN > max_frame {
            tracing::warn!(len, "dropping connection: bad frame length");
            return;
        }
        let mut body = vec![0u8; len];
        if read_half.read_exact(&mut body).await.is_err() {
            return;
        }
        if in_tx.send(Bytes::from(body)).await.is_err() {
            return;
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use telefab_api::transport::ConnectionHandler;

    #[derive(Debug)]
    struct Collect(Mutex<Vec<DynConnection>>);

    impl ConnectionHandler for Collect {
        fn incoming(&self, conn: DynConnection) {
            self.0.lock().unwrap().push(conn);
        }
    }

    async fn pair() -> (DynConnection, DynConnection, TcpTransport) {
        let handler = Arc::new(Collect(Mutex::new(Vec::new())));
        let transport = TcpTransport::create(
            TcpTransportConfig::default(),
            Some("127.0.0.1:0".parse().unwrap()),
            handler.clone(),
        )
        .await
        .unwrap();
        let addr = transport.local_addr().unwrap();
        let conn = transport.connect(addr).await.unwrap();

        let accepted = loop {
            if let Some(c) = handler.0.lock().unwrap().pop() {
                break c;
            }
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        };
        (conn, accepted, transport)
    }

    #[tokio::test]
    async fn frames_cross_whole() {
        telefab_test_utils::enable_tracing();
        let (a, b, _transport) = pair().await;
        a.send(Bytes::from_static(b"one")).await.unwrap();
        a.send(Bytes::from_static(b"two")).await.unwrap();
        assert_eq!(Bytes::from_static(b"one"), b.recv().await.unwrap());
        assert_eq!(Bytes::from_static(b"two"), b.recv().await.unwrap());
        b.send(Bytes::from_static(b"back")).await.unwrap();
        assert_eq!(Bytes::from_static(b"back"), a.recv().await.unwrap());
    }

    #[tokio::test]
    async fn close_ends_remote_recv() {
        let (a, b, _transport) = pair().await;
        a.send(Bytes::from_static(b"bye")).await.unwrap();
        a.close().await;
        assert_eq!(Bytes::from_static(b"bye"), b.recv().await.unwrap());
        assert!(b.recv().await.is_none());
        assert!(a.send(Bytes::from_static(b"x")).await.is_err());
    }

    #[tokio::test]
    async fn oversize_frame_drops_connection() {
        let handler = Arc::new(Collect(Mutex::new(Vec::new())));
        let transport = TcpTransport::create(
            TcpTransportConfig {
                max_frame_bytes: 64,
            },
            Some("127.0.0.1:0".parse().unwrap()),
            handler.clone(),
        )
        .await
        .unwrap();
        let addr = transport.local_addr().unwrap();

        // raw client announcing an oversize frame
        let mut raw = TcpStream::connect(addr).await.unwrap();
        raw.write_all(&1_000_000u32.to_le_bytes()).await.unwrap();
        raw.write_all(&[0u8; 16]).await.unwrap();

        let accepted = loop {
            if let Some(c) = handler.0.lock().unwrap().pop() {
                break c;
            }
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        };
        assert!(accepted.recv().await.is_none());
    }
}
