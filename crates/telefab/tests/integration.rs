//! Cross-endpoint scenarios over the TCP transport.

use std::time::Duration;
use telefab::{
    default_builder, BuilderExt, Endpoint, ErrorCode, FabError, Filter,
    StatusCode, StatusEvent, StatusReceiver, Value,
};
use telefab_test_utils::{enable_tracing, iter_check};

async fn make_endpoint() -> Endpoint {
    let builder = default_builder().with_default_config().unwrap().build();
    Endpoint::create(builder, Some("127.0.0.1:0".parse().unwrap()))
        .await
        .unwrap()
}

async fn await_status(rx: &mut StatusReceiver, want: StatusCode) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let next = tokio::time::timeout_at(deadline, rx.recv()).await;
        match next {
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
        let next = tokio::time::timeout_at(deadline, rx.recv()).await;
        match next {
            Ok(Some(StatusEvent::Error { code, .. })) if code == want => {
                return
            }
            Ok(Some(_)) => continue,
            Ok(None) => panic!("status channel closed awaiting {want:?}"),
            Err(_) => panic!("timed out awaiting {want:?}"),
        }
    }
}

#[tokio::test]
async fn prefix_routing_across_three_endpoints() {
    enable_tracing();
    let a = make_endpoint().await;
    let b = make_endpoint().await;
    let c = make_endpoint().await;

    let b_sub = b
        .subscribe(Filter::from_prefixes(["zeek/events"]))
        .await
        .unwrap();
    let c_sub = c
        .subscribe(Filter::from_prefixes(["zeek/events/errors"]))
        .await
        .unwrap();

    let mut a_status = a.status_events();
    a.peer(b.local_addr().unwrap()).unwrap();
    await_status(&mut a_status, StatusCode::PeerAdded).await;
    a.peer(c.local_addr().unwrap()).unwrap();
    await_status(&mut a_status, StatusCode::PeerAdded).await;

    a.publish("zeek/events/errors", "oops").await.unwrap();
    a.publish("zeek/events/data", 123_i64).await.unwrap();

    let b_got = b_sub.get(2).await.unwrap();
    let b_more = if b_got.len() < 2 {
        b_sub.get(2 - b_got.len()).await.unwrap()
    } else {
        Vec::new()
    };
    let b_values: Vec<Value> = b_got
        .into_iter()
        .chain(b_more)
        .map(|m| m.value)
        .collect();
    assert_eq!(
        vec![Value::from("oops"), Value::from(123_i64)],
        b_values,
    );

    let c_got = c_sub.recv().await.unwrap();
    assert_eq!(Value::from("oops"), c_got.value);
    assert_eq!("zeek/events/errors", c_got.topic.as_str());

    // The second publication must never show up at C.
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(c_sub.poll().unwrap().is_empty());
}

#[tokio::test]
async fn unpeer_is_observed_once_and_then_invalid() {
    enable_tracing();
    let a = make_endpoint().await;
    let b = make_endpoint().await;
    let mut a_status = a.status_events();
    let mut b_status = b.status_events();

    b.peer(a.local_addr().unwrap()).unwrap();
    await_status(&mut a_status, StatusCode::PeerAdded).await;
    await_status(&mut b_status, StatusCode::PeerAdded).await;

    b.unpeer(a.local_addr().unwrap());
    await_status(&mut b_status, StatusCode::PeerRemoved).await;
    await_status(&mut a_status, StatusCode::PeerLost).await;

    // The peering is gone, so a second unpeer is invalid, locally
    // only.
    iter_check!(2000, 50, {
        if b.peers().is_empty() {
            break;
        }
    });
    b.unpeer(a.local_addr().unwrap());
    await_error(&mut b_status, ErrorCode::PeerInvalid).await;
    assert!(a_status.try_recv().is_none());
}

#[tokio::test]
async fn retry_connects_once_listener_appears() {
    enable_tracing();
    // Reserve a port, then free it for the late listener.
    let addr = {
        let probe = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        probe.local_addr().unwrap()
    };

    let b = make_endpoint().await;
    let mut b_status = b.status_events();
    b.peer_with_retry(addr, Duration::from_millis(250)).unwrap();
    await_error(&mut b_status, ErrorCode::PeerUnavailable).await;

    let builder = default_builder().with_default_config().unwrap().build();
    let a = Endpoint::create(builder, Some(addr)).await.unwrap();
    let mut a_status = a.status_events();

    await_status(&mut b_status, StatusCode::PeerAdded).await;
    await_status(&mut a_status, StatusCode::PeerAdded).await;
}

#[tokio::test]
async fn store_replication_and_type_clash() {
    enable_tracing();
    let a = make_endpoint().await;
    let b = make_endpoint().await;
    let c = make_endpoint().await;

    let mut b_status = b.status_events();
    let mut c_status = c.status_events();
    b.peer(a.local_addr().unwrap()).unwrap();
    await_status(&mut b_status, StatusCode::PeerAdded).await;
    c.peer(a.local_addr().unwrap()).unwrap();
    await_status(&mut c_status, StatusCode::PeerAdded).await;

    a.attach_master("kv").await.unwrap();
    let clone = b.attach_clone("kv").await.unwrap();
    let client = c.store_client("kv");

    client.put("x", 7_i64, None).await.unwrap();
    let after_add = client.add("x", 2_i64, None).await.unwrap();
    assert_eq!(Value::from(9_i64), after_add);

    // Reads through the clone handle resolve at the master.
    assert_eq!(Value::from(9_i64), clone.get("x").await.unwrap());

    // The clone mirror converges on the same state.
    iter_check!(5000, 100, {
        let mirror = clone.mirror().await.unwrap();
        if mirror.len() == 1 && mirror[0].value == Value::from(9_i64) {
            break;
        }
    });

    assert!(matches!(
        client.add("x", "oops", None).await,
        Err(FabError::TypeClash { .. })
    ));
}

#[tokio::test]
async fn expiry_is_absolute_and_lazy() {
    enable_tracing();
    let a = make_endpoint().await;
    let store = a.attach_master("ttl").await.unwrap();

    store
        .put("x", "v", Some(telefab::expiry_after(Duration::from_millis(100))))
        .await
        .unwrap();

    assert!(store.exists("x").await.unwrap());
    assert!(!store.expire("x").await.unwrap());

    tokio::time::sleep(Duration::from_millis(150)).await;
    assert!(store.expire("x").await.unwrap());
    assert!(!store.exists("x").await.unwrap());
    assert!(matches!(
        store.get("x").await,
        Err(FabError::NoSuchKey { .. })
    ));
}

#[tokio::test]
async fn subscriber_overflow_drops_without_reordering() {
    enable_tracing();
    let a = make_endpoint().await;
    let b = make_endpoint().await;

    let b_sub = b
        .subscribe_with_capacity(
            Filter::from_prefixes(["flood"]),
            4,
        )
        .await
        .unwrap();
    let mut b_status = b.status_events();

    let mut a_status = a.status_events();
    a.peer(b.local_addr().unwrap()).unwrap();
    await_status(&mut a_status, StatusCode::PeerAdded).await;

    for i in 0..100_i64 {
        a.publish("flood/n", i).await.unwrap();
    }

    // The queue filled and at least one message was dropped for this
    // subscriber.
    await_error(&mut b_status, ErrorCode::WriteOverflow).await;
    iter_check!(5000, 50, {
        if b_sub.available() >= 4 {
            break;
        }
    });

    let got: Vec<i64> = b_sub
        .poll()
        .unwrap()
        .into_iter()
        .map(|m| match m.value {
            Value::Integer(i) => i,
            other => panic!("unexpected payload {other}"),
        })
        .collect();
    assert!(got.len() >= 4);
    // No reordering among what survived.
    assert!(got.windows(2).all(|w| w[0] < w[1]));
    // The first queued messages survived intact.
    assert_eq!(0, got[0]);
}

#[tokio::test]
async fn store_operation_surface() {
    enable_tracing();
    let a = make_endpoint().await;
    let store = a.attach_master("ops").await.unwrap();

    // put_unique wins once, loses once, and the loss is not an error.
    assert!(store.put_unique("lock", "me", None).await.unwrap());
    assert!(!store.put_unique("lock", "you", None).await.unwrap());
    assert_eq!(Value::from("me"), store.get("lock").await.unwrap());

    // aspect reads over the three container kinds
    store
        .put(
            "t",
            Value::table([(Value::from("a"), Value::from(1_i64))]),
            None,
        )
        .await
        .unwrap();
    assert_eq!(
        Value::from(1_i64),
        store.get_aspect("t", "a").await.unwrap()
    );
    store
        .put(
            "v",
            Value::vector([Value::from("x"), Value::from("y")]),
            None,
        )
        .await
        .unwrap();
    assert_eq!(
        Value::from("y"),
        store.get_aspect("v", 1_u64).await.unwrap()
    );
    store
        .put("s", Value::set([Value::from(5_i64)]), None)
        .await
        .unwrap();
    assert_eq!(
        Value::Bool(true),
        store.get_aspect("s", 5_i64).await.unwrap()
    );

    // set union through add, set difference through subtract
    let after = store
        .add("s", Value::set([Value::from(6_i64)]), None)
        .await
        .unwrap();
    assert_eq!(
        Value::set([Value::from(5_i64), Value::from(6_i64)]),
        after,
    );
    let after = store
        .subtract("s", Value::set([Value::from(5_i64)]), None)
        .await
        .unwrap();
    assert_eq!(Value::set([Value::from(6_i64)]), after);

    assert_eq!(4, store.size().await.unwrap());
    assert_eq!(4, store.keys().await.unwrap().len());

    store.erase("lock").await.unwrap();
    iter_check!(2000, 50, {
        if !store.exists("lock").await.unwrap() {
            break;
        }
    });

    store.clear().await.unwrap();
    iter_check!(2000, 50, {
        if store.size().await.unwrap() == 0 {
            break;
        }
    });
}

#[tokio::test]
async fn publish_without_matching_subscriber_is_a_noop() {
    enable_tracing();
    let a = make_endpoint().await;
    let b = make_endpoint().await;

    let b_sub = b
        .subscribe(Filter::from_prefixes(["interesting"]))
        .await
        .unwrap();
    let mut a_status = a.status_events();
    a.peer(b.local_addr().unwrap()).unwrap();
    await_status(&mut a_status, StatusCode::PeerAdded).await;

    a.publish("boring/topic", 1_i64).await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(0, b_sub.available());
}

#[tokio::test]
async fn shutdown_notifies_peers_and_fails_waiters() {
    enable_tracing();
    let a = make_endpoint().await;
    let b = make_endpoint().await;
    let mut a_status = a.status_events();
    let mut b_status = b.status_events();

    b.peer(a.local_addr().unwrap()).unwrap();
    await_status(&mut a_status, StatusCode::PeerAdded).await;
    await_status(&mut b_status, StatusCode::PeerAdded).await;

    let sub = b
        .subscribe(Filter::from_prefixes(["quiet"]))
        .await
        .unwrap();

    b.shutdown().await;

    // The remote side notices the departure.
    await_status(&mut a_status, StatusCode::PeerLost).await;
    // Local waiters fail with shutdown.
    assert!(matches!(
        sub.recv().await,
        Err(FabError::ShutdownInProgress)
    ));
    assert!(matches!(
        b.publish("quiet/x", 1_i64).await,
        Err(FabError::ShutdownInProgress)
    ));
}
