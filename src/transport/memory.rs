// src/transport/memory.rs

//! In-memory transport implementation.
//!
//! This file contains the concrete implementation of the domain-level
//! transport traits using in-process data structures only.
//!
//! The memory transport is the **reference implementation** of transport
//! semantics and the test double for the connection core: connect attempts
//! can be scripted to fail, sessions can be force-closed with a chosen
//! close code, inbound frames can be injected, and outbound frames are
//! recorded for assertions.
//!
//! ## Non-Goals
//!
//! - Persistence or durability
//! - Real network behavior or timing
//! - Emulation of any specific wire protocol

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::mpsc;

use crate::domain::{
    // ---
    CloseEvent,
    CloseObserver,
    Destination,
    Frame,
    RawSubscription,
    RawSubscriptionId,
    SessionPtr,
    TransportFactory,
    TransportSession,
};
use crate::{Error, Result};

fn lock_ignore_poison<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    // ---
    match m.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

struct FactoryInner {
    // ---
    fail_next: u32,
    attempts: u32,
    current: Option<Arc<MemorySession>>,
}

/// Factory producing in-memory sessions.
///
/// Each successful `connect` yields a brand-new [`MemorySession`]; the most
/// recent one is retrievable for test orchestration.
pub struct MemoryTransportFactory {
    inner: Mutex<FactoryInner>,
}

impl MemoryTransportFactory {
    pub fn new() -> Arc<Self> {
        // ---
        Arc::new(Self {
            inner: Mutex::new(FactoryInner {
                fail_next: 0,
                attempts: 0,
                current: None,
            }),
        })
    }

    /// Script the next `n` connect attempts to fail.
    pub fn fail_next_connects(&self, n: u32) {
        lock_ignore_poison(&self.inner).fail_next = n;
    }

    /// Total connect attempts observed, successful or not.
    pub fn connect_attempts(&self) -> u32 {
        lock_ignore_poison(&self.inner).attempts
    }

    /// The most recently established session, if any.
    pub fn session(&self) -> Option<Arc<MemorySession>> {
        lock_ignore_poison(&self.inner).current.clone()
    }
}

#[async_trait::async_trait]
impl TransportFactory for MemoryTransportFactory {
    async fn connect(&self, endpoint: &str) -> Result<SessionPtr> {
        // ---
        let mut inner = lock_ignore_poison(&self.inner);
        inner.attempts += 1;

        if inner.fail_next > 0 {
            inner.fail_next -= 1;
            return Err(Error::Connect(format!(
                "scripted connect failure for {endpoint}"
            )));
        }

        let session = Arc::new(MemorySession {
            endpoint: endpoint.to_string(),
            inner: Mutex::new(SessionInner {
                next_subscription: 0,
                subscriptions: HashMap::new(),
                sent: Vec::new(),
                close_observers: Vec::new(),
                closed: None,
                disconnected: false,
            }),
        });

        inner.current = Some(session.clone());
        Ok(session as SessionPtr)
    }
}

struct SessionInner {
    // ---
    next_subscription: u64,
    subscriptions: HashMap<RawSubscriptionId, (Destination, mpsc::Sender<Frame>)>,
    sent: Vec<Frame>,
    close_observers: Vec<CloseObserver>,
    closed: Option<CloseEvent>,
    disconnected: bool,
}

/// One in-memory session.
///
/// ## Semantics
///
/// - Raw subscriptions are registered immediately; frames injected after
///   `subscribe()` returns are deliverable.
/// - Close observers fire exactly once, in registration order, on
///   [`force_close`](Self::force_close); a local `disconnect()` does not
///   fire them.
/// - Outbound frames are recorded, never delivered anywhere.
pub struct MemorySession {
    endpoint: String,
    inner: Mutex<SessionInner>,
}

impl MemorySession {
    /// The endpoint this session was opened for.
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Deliver an inbound frame to every raw subscription matching its
    /// destination (exact string match, the reference semantics).
    pub async fn inject(&self, frame: Frame) {
        // ---
        let senders: Vec<mpsc::Sender<Frame>> = {
            let inner = lock_ignore_poison(&self.inner);
            inner
                .subscriptions
                .values()
                .filter(|(destination, _)| destination.0 == frame.destination.0)
                .map(|(_, sender)| sender.clone())
                .collect()
        };

        for sender in senders {
            // Ignore send failures; a closed inbox means the raw
            // subscription was dropped.
            let _ = sender.send(frame.clone()).await;
        }
    }

    /// Simulate the raw socket closing with an optional close code.
    ///
    /// Observers registered via `on_close` fire synchronously, in
    /// registration order. All raw subscriptions are invalidated.
    pub fn force_close(&self, code: Option<u16>) {
        // ---
        let observers = {
            let mut inner = lock_ignore_poison(&self.inner);
            if inner.closed.is_some() || inner.disconnected {
                return;
            }
            inner.closed = Some(CloseEvent { code });
            inner.subscriptions.clear();
            std::mem::take(&mut inner.close_observers)
        };

        for observer in observers {
            observer(CloseEvent { code });
        }
    }

    /// Frames sent on this session, in transmit order.
    pub fn sent_frames(&self) -> Vec<Frame> {
        lock_ignore_poison(&self.inner).sent.clone()
    }

    /// Number of live raw subscriptions for a destination.
    pub fn subscription_count(&self, destination: &Destination) -> usize {
        // ---
        lock_ignore_poison(&self.inner)
            .subscriptions
            .values()
            .filter(|(dest, _)| dest.0 == destination.0)
            .count()
    }

    /// True after a local `disconnect()`.
    pub fn is_disconnected(&self) -> bool {
        lock_ignore_poison(&self.inner).disconnected
    }
}

#[async_trait::async_trait]
impl TransportSession for MemorySession {
    // ---
    fn transport_mode(&self) -> &str {
        "memory"
    }

    fn on_close(&self, observer: CloseObserver) {
        // ---
        let already_closed = {
            let mut inner = lock_ignore_poison(&self.inner);
            match inner.closed {
                Some(event) => Some(event),
                None => {
                    inner.close_observers.push(observer);
                    return;
                }
            }
        };

        if let Some(event) = already_closed {
            observer(event);
        }
    }

    async fn send(&self, frame: Frame) -> Result<()> {
        // ---
        let mut inner = lock_ignore_poison(&self.inner);
        if inner.closed.is_some() || inner.disconnected {
            return Err(Error::Transport("session closed".to_string()));
        }
        inner.sent.push(frame);
        Ok(())
    }

    async fn subscribe(&self, destination: Destination) -> Result<RawSubscription> {
        // ---
        let (tx, rx) = mpsc::channel(16);

        let mut inner = lock_ignore_poison(&self.inner);
        if inner.closed.is_some() || inner.disconnected {
            return Err(Error::Transport("session closed".to_string()));
        }

        let id = RawSubscriptionId(inner.next_subscription);
        inner.next_subscription += 1;
        inner.subscriptions.insert(id, (destination, tx));

        Ok(RawSubscription { id, inbox: rx })
    }

    async fn unsubscribe(&self, id: RawSubscriptionId) {
        // ---
        lock_ignore_poison(&self.inner).subscriptions.remove(&id);
    }

    async fn disconnect(&self) {
        // ---
        let mut inner = lock_ignore_poison(&self.inner);
        inner.disconnected = true;
        inner.subscriptions.clear();
        inner.close_observers.clear();
    }
}
