// tests/transport_memory.rs
//
// Reference semantics of the in-memory transport: exact-match delivery,
// ordered close observers, and scripted connect failures.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::time::timeout;

use stomp_mux::{
    // ---
    Destination,
    Frame,
    MemoryTransportFactory,
    TransportFactory,
    TransportSession,
};

#[tokio::test]
async fn memory_subscribe_then_inject_delivers() {
    // ---
    // Arrange
    // ---
    let factory = MemoryTransportFactory::new();
    let session = factory
        .connect("mem://transport")
        .await
        .expect("failed to create memory session");
    let memory = factory.session().expect("session recorded");

    let destination = Destination::from("test.destination");
    let mut raw = session
        .subscribe(destination.clone())
        .await
        .expect("subscribe failed");

    // ---
    // Act
    // ---
    memory
        .inject(Frame::message(destination.clone(), &b"hello"[..]))
        .await;

    // ---
    // Assert
    // ---
    let received = timeout(Duration::from_millis(100), raw.inbox.recv())
        .await
        .expect("timed out waiting for frame")
        .expect("subscription channel closed unexpectedly");

    assert_eq!(received.body.as_ref(), b"hello");
    assert_eq!(received.destination, destination);
}

#[tokio::test]
async fn memory_matching_is_exact() {
    // ---
    let factory = MemoryTransportFactory::new();
    let session = factory.connect("mem://transport").await.expect("connect");
    let memory = factory.session().expect("session recorded");

    let mut raw = session
        .subscribe(Destination::from("a.b"))
        .await
        .expect("subscribe failed");

    memory.inject(Frame::message("a.b.c", &b"nope"[..])).await;
    memory.inject(Frame::message("a.b", &b"yes"[..])).await;

    let received = timeout(Duration::from_millis(100), raw.inbox.recv())
        .await
        .expect("timed out")
        .expect("channel closed");
    assert_eq!(received.body.as_ref(), b"yes");
}

#[tokio::test]
async fn close_observers_fire_once_in_registration_order() {
    // ---
    let factory = MemoryTransportFactory::new();
    let session = factory.connect("mem://transport").await.expect("connect");
    let memory = factory.session().expect("session recorded");

    let order: Arc<Mutex<Vec<(u8, Option<u16>)>>> = Arc::new(Mutex::new(Vec::new()));

    for tag in [1u8, 2, 3] {
        let order = order.clone();
        session.on_close(Box::new(move |event| {
            order.lock().expect("lock").push((tag, event.code));
        }));
    }

    memory.force_close(Some(42));
    // A second close is a no-op; observers fire at most once.
    memory.force_close(Some(99));

    assert_eq!(
        *order.lock().expect("lock"),
        vec![(1, Some(42)), (2, Some(42)), (3, Some(42))]
    );
}

#[tokio::test]
async fn observer_registered_after_close_fires_immediately() {
    // ---
    let factory = MemoryTransportFactory::new();
    let session = factory.connect("mem://transport").await.expect("connect");
    let memory = factory.session().expect("session recorded");

    memory.force_close(None);

    let fired = Arc::new(Mutex::new(None));
    let fired_in = fired.clone();
    session.on_close(Box::new(move |event| {
        *fired_in.lock().expect("lock") = Some(event.code);
    }));

    assert_eq!(*fired.lock().expect("lock"), Some(None));
}

#[tokio::test]
async fn local_disconnect_does_not_fire_observers() {
    // ---
    let factory = MemoryTransportFactory::new();
    let session = factory.connect("mem://transport").await.expect("connect");

    let fired = Arc::new(Mutex::new(false));
    let fired_in = fired.clone();
    session.on_close(Box::new(move |_event| {
        *fired_in.lock().expect("lock") = true;
    }));

    session.disconnect().await;

    assert!(!*fired.lock().expect("lock"));
    assert!(factory.session().expect("session").is_disconnected());
}

#[tokio::test]
async fn scripted_connect_failures_then_success() {
    // ---
    let factory = MemoryTransportFactory::new();
    factory.fail_next_connects(2);

    assert!(factory.connect("mem://transport").await.is_err());
    assert!(factory.connect("mem://transport").await.is_err());
    assert!(factory.connect("mem://transport").await.is_ok());
    assert_eq!(factory.connect_attempts(), 3);
}
