//! The peer connection actor.
//!
//! One actor per configured or accepted peer. The actor dials (with
//! optional retry), runs the handshake, then splits into an outbound
//! pump (credit-gated frame writes, keep-alive, credit rounds) and an
//! inbound pump (frame decode and router handoff). Credits and
//! keep-alive state flow between the pumps directly so a busy router
//! can never wedge flow control.

use crate::router::{RouterCmd, RouterSender};
use crate::status::StatusFeed;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use telefab_api::{
    config::FabricConfig,
    transport::{DynConnection, DynTransport},
    wire::{Frame, PROTOCOL_VERSION},
    EndpointId, ErrorCode, Filter, PeerStatus, StatusCode, Timestamp,
};
use tokio::sync::{mpsc, oneshot, Semaphore};

/// Commands the endpoint sends to a peer actor.
pub(crate) enum PeerCmd {
    /// Our advertised filter changed; announce it.
    SendFilterUpdate(Filter),
    /// Graceful removal: goodbye, close, no retry.
    Unpeer,
    /// Endpoint shutdown: flush the outbound queue, goodbye, close.
    Shutdown(oneshot::Sender<()>),
}

pub(crate) struct PeerEntry {
    pub cmd: mpsc::UnboundedSender<PeerCmd>,
    pub abort: tokio::task::AbortHandle,
    pub state: Arc<Mutex<PeerState>>,
}

/// The live view of one peer record.
pub(crate) struct PeerState {
    pub status: PeerStatus,
    pub last_handshake: Option<Timestamp>,
}

impl PeerState {
    fn new(status: PeerStatus) -> Self {
        Self {
            status,
            last_handshake: None,
        }
    }
}

pub(crate) type PeerMap = Arc<Mutex<HashMap<SocketAddr, PeerEntry>>>;

/// Shared dependencies of every peer actor.
#[derive(Clone)]
pub(crate) struct PeerCtx {
    pub id: EndpointId,
    pub cfg: FabricConfig,
    pub router: RouterSender,
    pub status: StatusFeed,
    pub peers: PeerMap,
}

impl std::fmt::Debug for PeerCtx {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerCtx").field("id", &self.id).finish()
    }
}

/// Spawn an actor that dials `addr`, optionally retrying failures
/// every `retry` (with growing spacing) until told to stop.
pub(crate) fn spawn_dialer(
    ctx: PeerCtx,
    transport: DynTransport,
    addr: SocketAddr,
    retry: Option<Duration>,
) {
    let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
    let peer_status =
        Arc::new(Mutex::new(PeerState::new(PeerStatus::Initialized)));
    let task = tokio::task::spawn(peer_task(
        ctx.clone(),
        Mode::Dial {
            transport,
            retry,
        },
        addr,
        peer_status.clone(),
        cmd_tx.clone(),
        cmd_rx,
    ));
    ctx.peers.lock().unwrap().insert(
        addr,
        PeerEntry {
            cmd: cmd_tx,
            abort: task.abort_handle(),
            state: peer_status,
        },
    );
}

/// Spawn an actor for a connection a remote endpoint opened to us.
pub(crate) fn spawn_accepted(ctx: PeerCtx, conn: DynConnection) {
    let addr = conn.peer_addr();
    let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
    let peer_status =
        Arc::new(Mutex::new(PeerState::new(PeerStatus::Connecting)));
    let task = tokio::task::spawn(peer_task(
        ctx.clone(),
        Mode::Accepted {
            conn: Some(conn),
        },
        addr,
        peer_status.clone(),
        cmd_tx.clone(),
        cmd_rx,
    ));
    ctx.peers.lock().unwrap().insert(
        addr,
        PeerEntry {
            cmd: cmd_tx,
            abort: task.abort_handle(),
            state: peer_status,
        },
    );
}

enum Mode {
    Dial {
        transport: DynTransport,
        retry: Option<Duration>,
    },
    Accepted {
        conn: Option<DynConnection>,
    },
}

/// Why a running connection ended.
enum ConnEnd {
    /// Local unpeer or endpoint shutdown; never retried.
    Deliberate,
    /// Protocol violation or id collision; never retried.
    Fatal,
    /// Transport loss or keep-alive expiry; retried when configured.
    Lost,
}

/// Retry spacing: starts at the configured interval and widens, so an
/// endpoint that stays down is probed ever more lazily.
struct RetrySpacing {
    interval: Duration,
    inner: backon::ExponentialBackoff,
}

impl RetrySpacing {
    fn new(interval: Duration) -> Self {
        Self {
            interval,
            inner: Self::build(interval),
        }
    }

    fn build(interval: Duration) -> backon::ExponentialBackoff {
        use backon::BackoffBuilder;
        backon::ExponentialBuilder::default()
            .with_factor(2.0)
            .with_min_delay(interval)
            .with_max_delay(interval.saturating_mul(16))
            .with_max_times(usize::MAX)
            .build()
    }

    fn next(&mut self) -> Duration {
        match self.inner.next() {
            Some(d) => d,
            None => {
                self.inner = Self::build(self.interval);
                self.interval
            }
        }
    }

    fn reset(&mut self) {
        self.inner = Self::build(self.interval);
    }
}

fn set_status(slot: &Arc<Mutex<PeerState>>, status: PeerStatus) {
    let mut state = slot.lock().unwrap();
    state.status = status;
    if status == PeerStatus::Peered {
        state.last_handshake = Some(Timestamp::now());
    }
}

async fn peer_task(
    ctx: PeerCtx,
    mut mode: Mode,
    addr: SocketAddr,
    peer_status: Arc<Mutex<PeerState>>,
    cmd_tx: mpsc::UnboundedSender<PeerCmd>,
    mut cmd_rx: mpsc::UnboundedReceiver<PeerCmd>,
) {
    let mut spacing = match &mode {
        Mode::Dial {
            retry: Some(interval),
            ..
        } => Some(RetrySpacing::new(*interval)),
        _ => None,
    };
    let mut reported_unavailable = false;

    loop {
        let conn = match &mut mode {
            Mode::Accepted { conn } => match conn.take() {
                Some(conn) => conn,
                None => break,
            },
            Mode::Dial { transport, retry } => {
                set_status(&peer_status, PeerStatus::Connecting);
                match transport.connect(addr).await {
                    Ok(conn) => {
                        reported_unavailable = false;
                        if let Some(spacing) = spacing.as_mut() {
                            spacing.reset();
                        }
                        conn
                    }
                    Err(err) => {
                        if !reported_unavailable {
                            ctx.status.error(
                                ErrorCode::PeerUnavailable,
                                format!("cannot reach {addr}: {err}"),
                            );
                            reported_unavailable = true;
                        }
                        match (retry, spacing.as_mut()) {
                            (Some(_), Some(spacing)) => {
                                set_status(
                                    &peer_status,
                                    PeerStatus::Reconnecting,
                                );
                                let delay = spacing.next();
                                if sleep_unless_cancelled(
                                    &mut cmd_rx,
                                    delay,
                                    &ctx,
                                    addr,
                                )
                                .await
                                {
                                    continue;
                                }
                                break;
                            }
                            _ => break,
                        }
                    }
                }
            }
        };

        let end = run_connection(
            &ctx,
            conn,
            addr,
            &peer_status,
            cmd_tx.clone(),
            &mut cmd_rx,
        )
        .await;
        let retrying = matches!(
            &mode,
            Mode::Dial { retry: Some(_), .. }
        );
        match end {
            ConnEnd::Deliberate | ConnEnd::Fatal => break,
            ConnEnd::Lost if retrying => {
                set_status(&peer_status, PeerStatus::Reconnecting);
                if let Some(spacing) = spacing.as_mut() {
                    let delay = spacing.next();
                    if !sleep_unless_cancelled(
                        &mut cmd_rx,
                        delay,
                        &ctx,
                        addr,
                    )
                    .await
                    {
                        break;
                    }
                }
            }
            ConnEnd::Lost => break,
        }
    }

    set_status(&peer_status, PeerStatus::Disconnected);
    ctx.peers.lock().unwrap().remove(&addr);
}

/// Sleep out a retry delay, aborting early on unpeer or shutdown.
/// Returns whether the retry should proceed.
async fn sleep_unless_cancelled(
    cmd_rx: &mut mpsc::UnboundedReceiver<PeerCmd>,
    delay: Duration,
    ctx: &PeerCtx,
    addr: SocketAddr,
) -> bool {
    let sleep = tokio::time::sleep(delay);
    tokio::pin!(sleep);
    loop {
        tokio::select! {
            _ = &mut sleep => return true,
            cmd = cmd_rx.recv() => match cmd {
                Some(PeerCmd::SendFilterUpdate(_)) => continue,
                Some(PeerCmd::Unpeer) => {
                    ctx.status.status(
                        StatusCode::PeerRemoved,
                        format!("{addr} (retry cancelled)"),
                    );
                    return false;
                }
                Some(PeerCmd::Shutdown(ack)) => {
                    let _ = ack.send(());
                    return false;
                }
                None => return false,
            },
        }
    }
}

/// What the inbound pump tells the outbound loop when it stops.
enum InboundEnd {
    /// The remote said goodbye.
    Goodbye,
    /// The transport closed or failed.
    Closed,
    /// The remote sent garbage.
    Protocol(String),
}

async fn run_connection(
    ctx: &PeerCtx,
    conn: DynConnection,
    addr: SocketAddr,
    peer_status: &Arc<Mutex<PeerState>>,
    cmd_tx: mpsc::UnboundedSender<PeerCmd>,
    cmd_rx: &mut mpsc::UnboundedReceiver<PeerCmd>,
) -> ConnEnd {
    // Ask the router what we currently advertise.
    let (tx, rx) = oneshot::channel();
    if ctx
        .router
        .send(RouterCmd::WireFilter { reply: tx })
        .await
        .is_err()
    {
        conn.close().await;
        return ConnEnd::Deliberate;
    }
    let wire_filter = match rx.await {
        Ok(f) => f,
        Err(_) => {
            conn.close().await;
            return ConnEnd::Deliberate;
        }
    };

    let hello = Frame::Hello {
        version: PROTOCOL_VERSION,
        peer: ctx.id,
        filter: wire_filter,
    };
    if conn.send(hello.encode()).await.is_err() {
        conn.close().await;
        ctx.status.error(
            ErrorCode::PeerDisconnectDuringHandshake,
            format!("{addr} closed before hello"),
        );
        return ConnEnd::Lost;
    }

    // Symmetric handshake: collect the remote HELLO and the ack of
    // ours, in either order.
    let handshake_deadline =
        ctx.cfg.peer_ping_interval().saturating_mul(2);
    let mut remote: Option<(EndpointId, Filter)> = None;
    let mut acked = false;
    while remote.is_none() || !acked {
        let raw = match tokio::time::timeout(
            handshake_deadline,
            conn.recv(),
        )
        .await
        {
            Ok(Some(raw)) => raw,
            Ok(None) | Err(_) => {
                conn.close().await;
                ctx.status.error(
                    ErrorCode::PeerDisconnectDuringHandshake,
                    format!("{addr} dropped mid-handshake"),
                );
                return ConnEnd::Lost;
            }
        };
        let frame = match Frame::decode(&raw) {
            Ok(frame) => frame,
            Err(err) => {
                conn.close().await;
                ctx.status.error(
                    ErrorCode::PeerIncompatible,
                    format!("{addr}: {err}"),
                );
                return ConnEnd::Fatal;
            }
        };
        match frame {
            Frame::Hello {
                version,
                peer,
                filter,
            } => {
                if version != PROTOCOL_VERSION {
                    conn.close().await;
                    ctx.status.error(
                        ErrorCode::PeerIncompatible,
                        format!(
                            "{addr} speaks version {version}, we speak {PROTOCOL_VERSION}"
                        ),
                    );
                    return ConnEnd::Fatal;
                }
                remote = Some((peer, filter));
                if conn
                    .send(Frame::HelloAck { peer: ctx.id }.encode())
                    .await
                    .is_err()
                {
                    conn.close().await;
                    ctx.status.error(
                        ErrorCode::PeerDisconnectDuringHandshake,
                        format!("{addr} dropped mid-handshake"),
                    );
                    return ConnEnd::Lost;
                }
            }
            Frame::HelloAck { .. } => acked = true,
            other => {
                conn.close().await;
                ctx.status.error(
                    ErrorCode::PeerIncompatible,
                    format!(
                        "{addr} sent {:?} during handshake",
                        other.frame_type()
                    ),
                );
                return ConnEnd::Fatal;
            }
        }
    }
    let Some((peer_id, peer_filter)) = remote else {
        return ConnEnd::Lost;
    };

    // Install in the routing table; collisions end the connection.
    let (install_tx, install_reply) = oneshot::channel();
    let (outbound_tx, outbound_rx) =
        mpsc::channel(ctx.cfg.peer_buffer_capacity as usize);
    let install = RouterCmd::PeerInstall {
        peer: peer_id,
        addr,
        filter: peer_filter,
        outbound: outbound_tx,
        cmd: cmd_tx,
        reply: install_tx,
    };
    let installed = match ctx.router.send(install).await {
        Ok(()) => install_reply.await.unwrap_or_else(|_| {
            Err(telefab_api::FabError::ShutdownInProgress)
        }),
        Err(_) => Err(telefab_api::FabError::ShutdownInProgress),
    };
    if let Err(err) = installed {
        conn.close().await;
        ctx.status.error(
            ErrorCode::PeerInvalid,
            format!("{addr}: {err}"),
        );
        return ConnEnd::Fatal;
    }

    set_status(peer_status, PeerStatus::Peered);
    ctx.status
        .status(StatusCode::PeerAdded, format!("{addr} ({peer_id})"));

    // Flow-control and keep-alive state shared by the two pumps.
    let credit =
        Arc::new(Semaphore::new(ctx.cfg.peer_buffer_capacity as usize));
    let consumed = Arc::new(AtomicU32::new(0));
    let last_recv = Arc::new(Mutex::new(Instant::now()));
    let (note_tx, note_rx) = mpsc::unbounded_channel();

    let inbound = tokio::task::spawn(inbound_pump(
        conn.clone(),
        ctx.router.clone(),
        peer_id,
        ctx.cfg.peer_buffer_capacity,
        credit.clone(),
        consumed.clone(),
        last_recv.clone(),
        note_tx,
    ));

    let end = outbound_loop(
        ctx,
        &conn,
        addr,
        peer_id,
        credit,
        consumed,
        last_recv,
        outbound_rx,
        note_rx,
        cmd_rx,
    )
    .await;

    inbound.abort();
    let _ = ctx
        .router
        .send(RouterCmd::PeerRemove { peer: peer_id })
        .await;
    end
}

#[allow(clippy::too_many_arguments)]
async fn outbound_loop(
    ctx: &PeerCtx,
    conn: &DynConnection,
    addr: SocketAddr,
    peer_id: EndpointId,
    credit: Arc<Semaphore>,
    consumed: Arc<AtomicU32>,
    last_recv: Arc<Mutex<Instant>>,
    mut outbound_rx: mpsc::Receiver<Frame>,
    mut note_rx: mpsc::UnboundedReceiver<InboundEnd>,
    cmd_rx: &mut mpsc::UnboundedReceiver<PeerCmd>,
) -> ConnEnd {
    let ping_interval = ctx.cfg.peer_ping_interval();
    let mut ping = tokio::time::interval(ping_interval);
    ping.set_missed_tick_behavior(
        tokio::time::MissedTickBehavior::Skip,
    );
    let mut credit_round =
        tokio::time::interval(ctx.cfg.credit_interval());
    credit_round.set_missed_tick_behavior(
        tokio::time::MissedTickBehavior::Skip,
    );
    let mut pending: Option<Frame> = None;
    let mut last_write = Instant::now();

    loop {
        tokio::select! {
            biased;

            note = note_rx.recv() => {
                return match note {
                    Some(InboundEnd::Goodbye) => {
                        conn.close().await;
                        ctx.status.status(
                            StatusCode::PeerLost,
                            format!("{addr} ({peer_id}) said goodbye"),
                        );
                        ConnEnd::Fatal
                    }
                    Some(InboundEnd::Protocol(why)) => {
                        conn.close().await;
                        ctx.status.error(
                            ErrorCode::PeerIncompatible,
                            format!("{addr}: {why}"),
                        );
                        ConnEnd::Fatal
                    }
                    Some(InboundEnd::Closed) | None => {
                        conn.close().await;
                        ctx.status.status(
                            StatusCode::PeerLost,
                            format!("{addr} ({peer_id})"),
                        );
                        ConnEnd::Lost
                    }
                };
            }

            cmd = cmd_rx.recv() => match cmd {
                Some(PeerCmd::SendFilterUpdate(filter)) => {
                    let frame = Frame::FilterUpdate { filter };
                    if conn.send(frame.encode()).await.is_err() {
                        ctx.status.status(
                            StatusCode::PeerLost,
                            format!("{addr} ({peer_id})"),
                        );
                        return ConnEnd::Lost;
                    }
                    last_write = Instant::now();
                }
                Some(PeerCmd::Unpeer) => {
                    let _ = conn.send(Frame::Goodbye.encode()).await;
                    conn.close().await;
                    ctx.status.status(
                        StatusCode::PeerRemoved,
                        format!("{addr} ({peer_id})"),
                    );
                    return ConnEnd::Deliberate;
                }
                Some(PeerCmd::Shutdown(ack)) => {
                    flush_outbound(conn, &mut outbound_rx).await;
                    let _ = conn.send(Frame::Goodbye.encode()).await;
                    conn.close().await;
                    ctx.status.status(
                        StatusCode::PeerRemoved,
                        format!("{addr} ({peer_id})"),
                    );
                    let _ = ack.send(());
                    return ConnEnd::Deliberate;
                }
                None => {
                    conn.close().await;
                    return ConnEnd::Deliberate;
                }
            },

            _ = ping.tick() => {
                let idle_in = last_recv.lock().unwrap().elapsed();
                if idle_in >= ping_interval.saturating_mul(2) {
                    conn.close().await;
                    ctx.status.status(
                        StatusCode::PeerLost,
                        format!("{addr} ({peer_id}) stopped answering"),
                    );
                    return ConnEnd::Lost;
                }
                if last_write.elapsed() >= ping_interval {
                    if conn.send(Frame::Ping.encode()).await.is_err() {
                        ctx.status.status(
                            StatusCode::PeerLost,
                            format!("{addr} ({peer_id})"),
                        );
                        return ConnEnd::Lost;
                    }
                    last_write = Instant::now();
                }
            }

            _ = credit_round.tick() => {
                let n = consumed.swap(0, Ordering::AcqRel);
                if n > 0 {
                    let frame = Frame::Credit { n };
                    if conn.send(frame.encode()).await.is_err() {
                        ctx.status.status(
                            StatusCode::PeerLost,
                            format!("{addr} ({peer_id})"),
                        );
                        return ConnEnd::Lost;
                    }
                    last_write = Instant::now();
                }
            }

            frame = outbound_rx.recv(), if pending.is_none() => {
                match frame {
                    Some(frame) => pending = Some(frame),
                    None => {
                        conn.close().await;
                        return ConnEnd::Deliberate;
                    }
                }
            }

            permit = credit.clone().acquire_owned(), if pending.is_some() => {
                let Ok(permit) = permit else {
                    conn.close().await;
                    return ConnEnd::Deliberate;
                };
                // Spent for good; the remote replenishes via CREDIT.
                permit.forget();
                if let Some(frame) = pending.take() {
                    if conn.send(frame.encode()).await.is_err() {
                        ctx.status.status(
                            StatusCode::PeerLost,
                            format!("{addr} ({peer_id})"),
                        );
                        return ConnEnd::Lost;
                    }
                    last_write = Instant::now();
                }
            }
        }
    }
}

/// Best-effort drain of queued frames during shutdown, credit ignored.
async fn flush_outbound(
    conn: &DynConnection,
    outbound_rx: &mut mpsc::Receiver<Frame>,
) {
    while let Ok(frame) = outbound_rx.try_recv() {
        if conn.send(frame.encode()).await.is_err() {
            break;
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn inbound_pump(
    conn: DynConnection,
    router: RouterSender,
    peer_id: EndpointId,
    capacity: u32,
    credit: Arc<Semaphore>,
    consumed: Arc<AtomicU32>,
    last_recv: Arc<Mutex<Instant>>,
    note: mpsc::UnboundedSender<InboundEnd>,
) {
    loop {
        let raw = match conn.recv().await {
            Some(raw) => raw,
            None => {
                let _ = note.send(InboundEnd::Closed);
                return;
            }
        };
        *last_recv.lock().unwrap() = Instant::now();
        let frame = match Frame::decode(&raw) {
            Ok(frame) => frame,
            Err(err) => {
                let _ = note.send(InboundEnd::Protocol(err.to_string()));
                return;
            }
        };
        match frame {
            Frame::Data { .. }
            | Frame::StoreCommand { .. }
            | Frame::StoreEvent { .. }
            | Frame::StoreRequest { .. }
            | Frame::StoreResponse { .. } => {
                consumed.fetch_add(1, Ordering::AcqRel);
                if router
                    .send(RouterCmd::Frame {
                        from: Some(peer_id),
                        frame,
                    })
                    .await
                    .is_err()
                {
                    let _ = note.send(InboundEnd::Closed);
                    return;
                }
            }
            Frame::FilterUpdate { filter } => {
                if router
                    .send(RouterCmd::PeerFilter {
                        peer: peer_id,
                        filter,
                    })
                    .await
                    .is_err()
                {
                    let _ = note.send(InboundEnd::Closed);
                    return;
                }
            }
            Frame::Ping => {
                if conn.send(Frame::Pong.encode()).await.is_err() {
                    let _ = note.send(InboundEnd::Closed);
                    return;
                }
            }
            Frame::Pong => (),
            Frame::Credit { n } => {
                // Never grow past twice the window, whatever the
                // remote claims.
                let room = (capacity as usize * 2)
                    .saturating_sub(credit.available_permits());
                credit.add_permits((n as usize).min(room));
            }
            Frame::Goodbye => {
                let _ = note.send(InboundEnd::Goodbye);
                return;
            }
            Frame::Hello { .. } | Frame::HelloAck { .. } => {
                let _ = note.send(InboundEnd::Protocol(
                    "handshake frame after handshake".into(),
                ));
                return;
            }
        }
    }
}
