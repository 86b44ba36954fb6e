// tests/handles.rs
//
// Caller-scoped handle behavior: reference counting, isolation between
// handles, shared establishment, and the liveness-gating policy.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::time::{sleep, timeout};

use stomp_mux::{
    // ---
    ActivityPolicy,
    ClientConfig,
    ClientRegistry,
    Destination,
    Error,
    Frame,
    Liveness,
    MemoryTransportFactory,
};

fn fast_config() -> ClientConfig {
    // ---
    ClientConfig::default()
        .with_reconnect_delay(Duration::from_millis(10))
        .with_max_reconnect_attempts(3)
        .with_heartbeat_interval(Duration::from_secs(60))
}

#[tokio::test]
async fn topic_refcount_keeps_delivery_until_last_unsubscribe() {
    // ---
    // Arrange: three logical subscribers on one destination.
    // ---
    let factory = MemoryTransportFactory::new();
    let registry = ClientRegistry::builder(factory.clone())
        .with_config(fast_config())
        .build();

    let handle = registry.connect("mem://a").await.expect("connect");
    let dest = Destination::from("/topic/shared");

    let first = handle.subscribe(dest.clone(), false).await.expect("sub");
    let second = handle.subscribe(dest.clone(), false).await.expect("sub");
    let mut third = handle.subscribe(dest.clone(), false).await.expect("sub");

    let session = factory.session().expect("session");
    assert_eq!(session.subscription_count(&dest), 1);

    // ---
    // Act: all but one unsubscribe.
    // ---
    first.cancel().await;
    second.cancel().await;

    // ---
    // Assert: the topic stays attached and delivering.
    // ---
    assert_eq!(session.subscription_count(&dest), 1);
    session
        .inject(Frame::message(dest.clone(), &b"still-live"[..]))
        .await;
    let frame = timeout(Duration::from_millis(500), third.inbox.recv())
        .await
        .expect("timed out")
        .expect("conduit completed unexpectedly");
    assert_eq!(frame.body.as_ref(), b"still-live");

    // The last unsubscribe removes the topic; no further delivery.
    third.cancel().await;
    for _ in 0..200 {
        if session.subscription_count(&dest) == 0 {
            break;
        }
        sleep(Duration::from_millis(2)).await;
    }
    assert_eq!(session.subscription_count(&dest), 0);
    assert!(
        third.inbox.recv().await.is_none(),
        "conduit should complete when the topic is removed"
    );

    handle.disconnect().await;
}

#[tokio::test]
async fn disconnecting_one_handle_leaves_others_untouched() {
    // ---
    let factory = MemoryTransportFactory::new();
    let registry = ClientRegistry::builder(factory.clone())
        .with_config(fast_config())
        .build();

    let first = registry.connect("mem://a").await.expect("connect");
    let second = registry.connect("mem://a").await.expect("connect");

    let dest_x = Destination::from("/topic/x");
    let dest_y = Destination::from("/topic/y");

    let _first_x = first.subscribe(dest_x.clone(), false).await.expect("sub");
    let mut second_x = second.subscribe(dest_x.clone(), false).await.expect("sub");
    let mut second_y = second.subscribe(dest_y.clone(), false).await.expect("sub");

    let session = factory.session().expect("session");
    assert_eq!(session.subscription_count(&dest_x), 1);

    first.disconnect().await;

    // The shared topic survives: the other handle still holds a reference.
    assert_eq!(session.subscription_count(&dest_x), 1);
    assert_eq!(session.subscription_count(&dest_y), 1);
    assert!(!session.is_disconnected());

    session.inject(Frame::message(dest_x.clone(), &b"x1"[..])).await;
    session.inject(Frame::message(dest_y.clone(), &b"y1"[..])).await;

    let frame = timeout(Duration::from_millis(500), second_x.inbox.recv())
        .await
        .expect("timed out")
        .expect("conduit completed unexpectedly");
    assert_eq!(frame.body.as_ref(), b"x1");
    let frame = timeout(Duration::from_millis(500), second_y.inbox.recv())
        .await
        .expect("timed out")
        .expect("conduit completed unexpectedly");
    assert_eq!(frame.body.as_ref(), b"y1");

    // A disconnected handle fails fast.
    assert!(matches!(
        first.subscribe("/topic/z", false).await,
        Err(Error::Closed)
    ));

    // Last handle out tears the endpoint down.
    second.disconnect().await;
    assert_eq!(registry.endpoint_count().await, 0);
    for _ in 0..200 {
        if session.is_disconnected() {
            break;
        }
        sleep(Duration::from_millis(2)).await;
    }
    assert!(session.is_disconnected());
}

#[tokio::test]
async fn concurrent_connects_share_one_establishment() {
    // ---
    let factory = MemoryTransportFactory::new();
    let registry = ClientRegistry::builder(factory.clone())
        .with_config(fast_config())
        .build();

    let (first, second) = tokio::join!(registry.connect("mem://a"), registry.connect("mem://a"));
    let first = first.expect("first connect");
    let second = second.expect("second connect");

    assert_eq!(factory.connect_attempts(), 1);
    assert_eq!(registry.endpoint_count().await, 1);

    // Both handles are live against the single shared connection.
    first
        .send("/queue/out", HashMap::new(), &b"from-first"[..])
        .await
        .expect("send");
    second
        .send("/queue/out", HashMap::new(), &b"from-second"[..])
        .await
        .expect("send");
    assert_eq!(factory.session().expect("session").sent_frames().len(), 2);

    first.disconnect().await;
    second.disconnect().await;
    assert_eq!(registry.endpoint_count().await, 0);
}

#[tokio::test]
async fn establishment_failure_rejects_every_queued_caller() {
    // ---
    let factory = MemoryTransportFactory::new();
    let registry = ClientRegistry::builder(factory.clone())
        .with_config(fast_config())
        .build();

    factory.fail_next_connects(1);

    let (first, second) = tokio::join!(registry.connect("mem://a"), registry.connect("mem://a"));
    assert!(matches!(first, Err(Error::Connect(_))));
    assert!(matches!(second, Err(Error::Connect(_))));

    // One attempt for the whole batch, and no stale endpoint state.
    assert_eq!(factory.connect_attempts(), 1);
    assert_eq!(registry.endpoint_count().await, 0);

    // A later connect starts fresh and succeeds.
    let handle = registry.connect("mem://a").await.expect("connect");
    assert_eq!(factory.connect_attempts(), 2);
    handle.disconnect().await;
}

struct CountingLiveness(AtomicU32);

impl Liveness for CountingLiveness {
    fn heartbeat(&self) {
        self.0.fetch_add(1, Ordering::SeqCst);
    }
}

#[tokio::test]
async fn liveness_signal_is_gated_by_payload_inspection() {
    // ---
    let factory = MemoryTransportFactory::new();
    let liveness = Arc::new(CountingLiveness(AtomicU32::new(0)));
    let registry = ClientRegistry::builder(factory.clone())
        .with_config(fast_config())
        .with_liveness(liveness.clone())
        .build();

    let handle = registry.connect("mem://a").await.expect("connect");

    // Ordinary traffic is user activity.
    handle
        .send("/app/chat/send", HashMap::new(), &br#"{"text":"hi"}"#[..])
        .await
        .expect("send");
    assert_eq!(liveness.0.load(Ordering::SeqCst), 1);

    // Automated touch traffic is not.
    handle
        .send(
            "/app/session/touch",
            HashMap::new(),
            &br#"{"userOriginated":false,"visible":false}"#[..],
        )
        .await
        .expect("send");
    assert_eq!(liveness.0.load(Ordering::SeqCst), 1);

    // Touch traffic carrying a user-activity flag is.
    handle
        .send(
            "/app/session/touch",
            HashMap::new(),
            &br#"{"userOriginated":true}"#[..],
        )
        .await
        .expect("send");
    assert_eq!(liveness.0.load(Ordering::SeqCst), 2);

    // Every send was forwarded regardless of the liveness decision.
    assert_eq!(factory.session().expect("session").sent_frames().len(), 3);

    handle.disconnect().await;
}

struct NeverActive;

impl ActivityPolicy for NeverActive {
    fn signals_activity(&self, _destination: &Destination, _body: &[u8]) -> bool {
        false
    }
}

#[tokio::test]
async fn activity_policy_is_pluggable() {
    // ---
    let factory = MemoryTransportFactory::new();
    let liveness = Arc::new(CountingLiveness(AtomicU32::new(0)));
    let registry = ClientRegistry::builder(factory.clone())
        .with_config(fast_config())
        .with_liveness(liveness.clone())
        .with_activity_policy(Arc::new(NeverActive))
        .build();

    let handle = registry.connect("mem://a").await.expect("connect");
    handle
        .send("/app/chat/send", HashMap::new(), &b"{}"[..])
        .await
        .expect("send");

    assert_eq!(liveness.0.load(Ordering::SeqCst), 0);
    handle.disconnect().await;
}

#[tokio::test]
async fn empty_destination_fails_fast() {
    // ---
    let factory = MemoryTransportFactory::new();
    let registry = ClientRegistry::builder(factory.clone())
        .with_config(fast_config())
        .build();

    let handle = registry.connect("mem://a").await.expect("connect");

    assert!(matches!(
        handle.subscribe("", false).await,
        Err(Error::InvalidDestination(_))
    ));
    assert!(matches!(
        handle.send("", HashMap::new(), &b"x"[..]).await,
        Err(Error::InvalidDestination(_))
    ));

    handle.disconnect().await;
}

#[tokio::test]
async fn transport_mode_is_exposed_for_diagnostics() {
    // ---
    let factory = MemoryTransportFactory::new();
    let registry = ClientRegistry::builder(factory.clone())
        .with_config(fast_config())
        .build();

    let handle = registry.connect("mem://a").await.expect("connect");
    assert_eq!(handle.transport_mode().await.as_deref(), Some("memory"));

    handle.disconnect().await;
    assert_eq!(handle.transport_mode().await, None);
}
