//! Caller-scoped connection handle.
//!
//! Each successful `connect()` yields one [`ConnectionHandle`]. The handle
//! delegates subscribe/send to the endpoint's multiplex channel, tracks the
//! subscriptions it created so `disconnect()` can release exactly those, and
//! gates the liveness signal through the injected activity policy.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use bytes::Bytes;
use tokio::sync::broadcast;

use crate::channel::{SubscriptionCanceller, TopicSubscription};
use crate::domain::{Destination, Frame};
use crate::manager::{ConnectionEvent, ConnectionManager};
use crate::{Error, Result};

/// Acquire a mutex guard, intentionally ignoring poisoning.
///
/// The protected state is the handle's own canceller list; there are no
/// invariants spanning multiple fields, and the worst outcome of a poisoned
/// lock is a subscription cancelled twice (cancellation is idempotent).
fn lock_ignore_poison<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    // ---
    match m.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Caller-scoped view of one endpoint's shared connection.
///
/// Handles are independent: disconnecting one never cancels subscriptions
/// created by a different handle on the same endpoint. The underlying
/// physical session is shared and survives until the last handle releases
/// it.
pub struct ConnectionHandle {
    // ---
    manager: Arc<ConnectionManager>,
    subscriptions: Mutex<Vec<SubscriptionCanceller>>,
    disconnected: AtomicBool,
}

impl ConnectionHandle {
    pub(crate) fn new(manager: Arc<ConnectionManager>) -> Self {
        // ---
        Self {
            manager,
            subscriptions: Mutex::new(Vec::new()),
            disconnected: AtomicBool::new(false),
        }
    }

    /// Subscribe to a destination through the shared channel.
    ///
    /// The subscription is tracked by this handle: `disconnect()` cancels
    /// it along with every other subscription created here.
    ///
    /// # Errors
    ///
    /// Returns `Error::Closed` after `disconnect()`, or
    /// `Error::InvalidDestination` for an empty destination.
    pub async fn subscribe(
        &self,
        destination: impl Into<Destination>,
        replay: bool,
    ) -> Result<TopicSubscription> {
        // ---
        if self.disconnected.load(Ordering::Acquire) || self.manager.is_terminated().await {
            return Err(Error::Closed);
        }

        let subscription = self
            .manager
            .channel()
            .subscribe(destination.into(), replay)
            .await?;

        lock_ignore_poison(&self.subscriptions).push(subscription.canceller());

        Ok(subscription)
    }

    /// Send a frame, queueing it if the endpoint is mid-reconnect.
    ///
    /// Before the send is forwarded, the activity policy decides whether it
    /// counts as user activity; if so, the liveness collaborator's
    /// `heartbeat()` is signaled. Automated traffic passes through without
    /// keeping the session alive.
    ///
    /// # Errors
    ///
    /// Returns `Error::Closed` after `disconnect()`,
    /// `Error::InvalidDestination` for an empty destination, or the
    /// transport error when a live session rejects the send.
    pub async fn send(
        &self,
        destination: impl Into<Destination>,
        headers: HashMap<String, String>,
        body: impl Into<Bytes>,
    ) -> Result<()> {
        // ---
        if self.disconnected.load(Ordering::Acquire) || self.manager.is_terminated().await {
            return Err(Error::Closed);
        }

        let frame = Frame::new(destination, headers, body);

        let collaborators = self.manager.collaborators();
        if collaborators
            .activity
            .signals_activity(&frame.destination, &frame.body)
        {
            collaborators.liveness.heartbeat();
        }

        self.manager.channel().send(frame).await
    }

    /// The event stream for this endpoint: heartbeat ticks while connected
    /// and a terminal event if the endpoint fails.
    pub fn events(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.manager.subscribe_events()
    }

    /// Negotiated transport mode of the current session, for UI diagnostics.
    ///
    /// `None` while no physical session exists.
    pub async fn transport_mode(&self) -> Option<String> {
        self.manager.channel().transport_mode().await
    }

    /// Release this caller: cancel every subscription created through this
    /// handle, then drop the caller reference on the shared connection.
    ///
    /// Idempotent. Other handles on the same endpoint are unaffected unless
    /// this was the last one, in which case the endpoint is torn down.
    pub async fn disconnect(&self) {
        // ---
        if self.disconnected.swap(true, Ordering::AcqRel) {
            return;
        }

        let cancellers: Vec<SubscriptionCanceller> =
            lock_ignore_poison(&self.subscriptions).drain(..).collect();

        for canceller in cancellers {
            canceller.cancel().await;
        }

        self.manager.release().await;
    }
}
