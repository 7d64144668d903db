//! Endpoint behavior over the in-process transport: routing, filter
//! propagation, handshakes, keep-alive, and flow control.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use telefab_api::{
    builder::Builder,
    config::{Config, FabricConfig},
    transport::{ConnectionHandler, DynConnection},
    wire::{Frame, PROTOCOL_VERSION},
    EndpointId, ErrorCode, Filter, PeerStatus, StatusCode, StatusEvent,
    Value,
};
use telefab_core::{
    Endpoint, MemBackendFactory, MemTransportFactory, StatusReceiver,
};
use telefab_test_utils::{enable_tracing, iter_check};

fn mem_builder(fabric: Option<FabricConfig>) -> Arc<Builder> {
    let mut builder = Builder {
        config: Config::default(),
        transport: MemTransportFactory::create(),
        store_backend: MemBackendFactory::create(),
    };
    builder.set_default_config().unwrap();
    if let Some(fabric) = fabric {
        builder.config.set_module_config(&fabric).unwrap();
    }
    builder.build()
}

async fn endpoint(fabric: Option<FabricConfig>) -> Endpoint {
    Endpoint::create(mem_builder(fabric), None).await.unwrap()
}

async fn await_status(rx: &mut StatusReceiver, want: StatusCode) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        match tokio::time::timeout_at(deadline, rx.recv()).await {
            Ok(Some(StatusEvent::Status { code, .. })) if code == want => {
                return
            }
            Ok(Some(_)) => continue,
            Ok(None) => panic!("status channel closed awaiting {want:?}"),
            Err(_) => panic!("timed out awaiting {want:?}"),
        }
    }
}

async fn await_error(rx: &mut StatusReceiver, want: ErrorCode) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        match tokio::time::timeout_at(deadline, rx.recv()).await {
            Ok(Some(StatusEvent::Error { code, .. })) if code == want => {
                return
            }
            Ok(Some(_)) => continue,
            Ok(None) => panic!("status channel closed awaiting {want:?}"),
            Err(_) => panic!("timed out awaiting {want:?}"),
        }
    }
}

#[derive(Debug)]
struct NullHandler;

impl ConnectionHandler for NullHandler {
    fn incoming(&self, _conn: DynConnection) {}
}

/// A bare transport connection to `addr`, bypassing the peer actor.
async fn raw_connect(addr: SocketAddr) -> DynConnection {
    let builder = mem_builder(None);
    let transport = builder
        .transport
        .clone()
        .create(builder, None, Arc::new(NullHandler))
        .await
        .unwrap();
    transport.connect(addr).await.unwrap()
}

#[tokio::test]
async fn local_delivery_without_peers() {
    enable_tracing();
    let ep = endpoint(None).await;
    let sub = ep
        .subscribe(Filter::from_prefixes(["a"]))
        .await
        .unwrap();
    ep.publish("a/b", 42_i64).await.unwrap();
    let msg = sub.recv().await.unwrap();
    assert_eq!("a/b", msg.topic.as_str());
    assert_eq!(Value::Integer(42), msg.value);
}

#[tokio::test]
async fn forwarding_crosses_an_intermediate_endpoint() {
    enable_tracing();
    let a = endpoint(None).await;
    let b = endpoint(None).await;
    let c = endpoint(None).await;

    let c_sub = c
        .subscribe(Filter::from_prefixes(["chain"]))
        .await
        .unwrap();

    let mut b_status = b.status_events();
    b.peer(c.local_addr().unwrap()).unwrap();
    await_status(&mut b_status, StatusCode::PeerAdded).await;

    let mut a_status = a.status_events();
    a.peer(b.local_addr().unwrap()).unwrap();
    await_status(&mut a_status, StatusCode::PeerAdded).await;

    // B has no subscriber of its own; it forwards because C's
    // subscription propagated into B's advertised filter.
    iter_check!(5000, 100, {
        a.publish("chain/x", 1_i64).await.unwrap();
        if c_sub.available() > 0 {
            break;
        }
    });
    assert_eq!(
        Value::Integer(1),
        c_sub.poll().unwrap()[0].value,
    );
}

#[tokio::test]
async fn hop_limit_stops_forwarding() {
    enable_tracing();
    let fabric = FabricConfig {
        max_hops: 1,
        ..Default::default()
    };
    let a = endpoint(Some(fabric.clone())).await;
    let b = endpoint(Some(fabric.clone())).await;
    let c = endpoint(Some(fabric)).await;

    let b_sub = b
        .subscribe(Filter::from_prefixes(["chain"]))
        .await
        .unwrap();
    let c_sub = c
        .subscribe(Filter::from_prefixes(["chain"]))
        .await
        .unwrap();

    let mut b_status = b.status_events();
    b.peer(c.local_addr().unwrap()).unwrap();
    await_status(&mut b_status, StatusCode::PeerAdded).await;
    let mut a_status = a.status_events();
    a.peer(b.local_addr().unwrap()).unwrap();
    await_status(&mut a_status, StatusCode::PeerAdded).await;

    // One hop reaches B; the second hop to C exceeds the TTL.
    iter_check!(5000, 50, {
        a.publish("chain/x", 7_i64).await.unwrap();
        if b_sub.available() > 0 {
            break;
        }
    });
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(0, c_sub.available());
}

#[tokio::test]
async fn version_mismatch_is_rejected() {
    enable_tracing();
    let a = endpoint(None).await;
    let mut a_status = a.status_events();

    let conn = raw_connect(a.local_addr().unwrap()).await;
    conn.send(
        Frame::Hello {
            version: PROTOCOL_VERSION + 1,
            peer: EndpointId::random(),
            filter: Filter::new(),
        }
        .encode(),
    )
    .await
    .unwrap();

    await_error(&mut a_status, ErrorCode::PeerIncompatible).await;
    // The connection is closed; drain our side until it ends.
    iter_check!(2000, 20, {
        if conn.recv().await.is_none() {
            break;
        }
    });
}

#[tokio::test]
async fn duplicate_endpoint_id_is_rejected() {
    enable_tracing();
    let a = endpoint(None).await;
    let b = endpoint(None).await;
    let mut a_status = a.status_events();
    let mut b_status = b.status_events();

    b.peer(a.local_addr().unwrap()).unwrap();
    await_status(&mut a_status, StatusCode::PeerAdded).await;
    await_status(&mut b_status, StatusCode::PeerAdded).await;

    // A second connection claiming B's identity collides.
    let conn = raw_connect(a.local_addr().unwrap()).await;
    conn.send(
        Frame::Hello {
            version: PROTOCOL_VERSION,
            peer: b.id(),
            filter: Filter::new(),
        }
        .encode(),
    )
    .await
    .unwrap();
    // Complete our half of the handshake.
    loop {
        let raw = match conn.recv().await {
            Some(raw) => raw,
            None => break,
        };
        match Frame::decode(&raw).unwrap() {
            Frame::Hello { .. } => {
                conn.send(
                    Frame::HelloAck { peer: b.id() }.encode(),
                )
                .await
                .unwrap();
            }
            Frame::HelloAck { .. } => (),
            _ => (),
        }
    }

    await_error(&mut a_status, ErrorCode::PeerInvalid).await;
}

#[tokio::test]
async fn garbage_during_handshake_is_fatal() {
    enable_tracing();
    let a = endpoint(None).await;
    let mut a_status = a.status_events();

    let conn = raw_connect(a.local_addr().unwrap()).await;
    conn.send(Frame::Ping.encode()).await.unwrap();

    await_error(&mut a_status, ErrorCode::PeerIncompatible).await;
}

#[tokio::test]
async fn idle_connection_stays_alive_and_loss_is_noticed() {
    enable_tracing();
    let fabric = FabricConfig {
        peer_ping_interval_ms: 100,
        ..Default::default()
    };
    let a = endpoint(Some(fabric.clone())).await;
    let b = endpoint(Some(fabric)).await;
    let mut a_status = a.status_events();
    let mut b_status = b.status_events();

    a.peer(b.local_addr().unwrap()).unwrap();
    await_status(&mut a_status, StatusCode::PeerAdded).await;
    await_status(&mut b_status, StatusCode::PeerAdded).await;

    // Several ping intervals pass without traffic; keep-alive holds
    // the peering together.
    tokio::time::sleep(Duration::from_millis(600)).await;
    assert!(a
        .peers()
        .iter()
        .any(|p| p.status == PeerStatus::Peered));
    assert!(a_status.try_recv().is_none());

    // Hard-dropping B tears its tasks down; A notices the loss.
    drop(b);
    await_status(&mut a_status, StatusCode::PeerLost).await;
}

#[tokio::test]
async fn credits_replenish_and_nothing_is_lost_remotely() {
    enable_tracing();
    let fabric = FabricConfig {
        peer_buffer_capacity: 8,
        credit_interval_ms: 50,
        subscriber_queue_capacity: 256,
        ..Default::default()
    };
    let a = endpoint(Some(fabric.clone())).await;
    let b = endpoint(Some(fabric)).await;

    let b_sub = b
        .subscribe(Filter::from_prefixes(["burst"]))
        .await
        .unwrap();
    let mut a_status = a.status_events();
    a.peer(b.local_addr().unwrap()).unwrap();
    await_status(&mut a_status, StatusCode::PeerAdded).await;

    // Far more messages than the credit window; every one must cross,
    // in order, once credits cycle.
    for i in 0..100_i64 {
        a.publish("burst/n", i).await.unwrap();
    }

    let mut got = Vec::new();
    while got.len() < 100 {
        let batch = b_sub.get(100 - got.len()).await.unwrap();
        got.extend(batch.into_iter().map(|m| m.value));
    }
    let want: Vec<Value> =
        (0..100_i64).map(Value::Integer).collect();
    assert_eq!(want, got);
}

#[tokio::test]
async fn store_without_reachable_master_degrades() {
    enable_tracing();
    let fabric = FabricConfig {
        store_reconnect_timeout_ms: 300,
        ..Default::default()
    };
    let lonely = endpoint(Some(fabric)).await;
    let client = lonely.store_client("nowhere");

    // Reads fail fast.
    let start = std::time::Instant::now();
    assert!(matches!(
        client.get("x").await,
        Err(telefab_api::FabError::BackendFailure { .. })
    ));
    assert!(start.elapsed() < Duration::from_millis(200));

    // Writes queue for the reconnect window, then give up.
    let start = std::time::Instant::now();
    assert!(matches!(
        client.put("x", 1_i64, None).await,
        Err(telefab_api::FabError::BackendFailure { .. })
    ));
    assert!(start.elapsed() >= Duration::from_millis(300));
}

#[tokio::test]
async fn queued_write_flushes_when_master_appears() {
    enable_tracing();
    let fabric = FabricConfig {
        store_reconnect_timeout_ms: 5_000,
        ..Default::default()
    };
    let ep = endpoint(Some(fabric)).await;
    let client = ep.store_client("latecomer");

    let writer = {
        let client = client.clone();
        tokio::spawn(async move {
            client.put("x", 7_i64, None).await
        })
    };
    tokio::time::sleep(Duration::from_millis(100)).await;

    // The master appears on the same endpoint; the queued write lands.
    let master = ep.attach_master("latecomer").await.unwrap();
    writer.await.unwrap().unwrap();
    iter_check!(2000, 50, {
        if master.exists("x").await.unwrap() {
            break;
        }
    });
}

#[tokio::test]
async fn peer_records_report_their_status() {
    enable_tracing();
    let a = endpoint(None).await;
    let b = endpoint(None).await;
    let mut b_status = b.status_events();

    b.peer(a.local_addr().unwrap()).unwrap();
    await_status(&mut b_status, StatusCode::PeerAdded).await;
    iter_check!(2000, 20, {
        let peers = b.peers();
        if peers.len() == 1 && peers[0].status == PeerStatus::Peered {
            break;
        }
    });

    b.unpeer(a.local_addr().unwrap());
    await_status(&mut b_status, StatusCode::PeerRemoved).await;
    iter_check!(2000, 20, {
        if b.peers().is_empty() {
            break;
        }
    });
}
