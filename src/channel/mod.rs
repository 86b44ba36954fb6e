//! Topic multiplexing over one physical session.
//!
//! The multiplex channel shares a single [`TransportSession`] among
//! arbitrarily many logical topic subscribers and keeps logical state
//! consistent across reconnects:
//!
//! - subscribers attach to per-destination conduits that outlive any one
//!   physical session
//! - sends issued while disconnected queue in FIFO order and flush as one
//!   atomic step when a session arrives
//! - every new session re-attaches each live topic exactly once
//!
//! All channel state lives behind one async mutex, standing in for the
//! single event-loop turn of the original environment: the flush-then-clear
//! of the pending queue happens under one lock hold, so a concurrent send
//! cannot interleave between flush and clear.

mod topic;

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;

use crate::domain::{Destination, Frame, RawSubscription, SessionPtr};
use crate::macros::{log_debug, log_warn};
use crate::{Error, Result};

use topic::{PhysicalAttachment, TopicRegistry, SUBSCRIBER_INBOX_DEPTH};

struct ChannelInner {
    // ---
    /// Current physical session, if any.
    session: Option<SessionPtr>,

    /// Per-destination multiplexing state.
    topics: TopicRegistry,

    /// Sends captured while no session exists, in call order.
    pending: VecDeque<Frame>,
}

/// Reference-counted fan-out of one physical session to many logical
/// subscribers.
///
/// One channel exists per endpoint, owned by that endpoint's lifecycle
/// manager.
pub(crate) struct MultiplexChannel {
    warn_body_bytes: usize,
    inner: Mutex<ChannelInner>,
}

impl MultiplexChannel {
    pub(crate) fn new(warn_body_bytes: usize) -> Arc<Self> {
        // ---
        Arc::new(Self {
            warn_body_bytes,
            inner: Mutex::new(ChannelInner {
                session: None,
                topics: TopicRegistry::new(),
                pending: VecDeque::new(),
            }),
        })
    }

    /// Register a logical subscriber for `destination`.
    ///
    /// The conduit is replay-capable iff `replay` is requested by the first
    /// subscriber of the topic. When a session exists and the topic is not
    /// yet physically attached, a fresh physical subscription is attached
    /// before this call returns.
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidDestination` for an empty destination.
    pub(crate) async fn subscribe(
        self: &Arc<Self>,
        destination: Destination,
        replay: bool,
    ) -> Result<TopicSubscription> {
        // ---
        if destination.0.is_empty() {
            return Err(Error::InvalidDestination(destination.0.to_string()));
        }

        let (tx, rx) = mpsc::channel(SUBSCRIBER_INBOX_DEPTH);

        let (id, attach_to) = {
            let mut inner = self.inner.lock().await;
            let (id, replayed) = inner.topics.add_subscriber(&destination, replay, tx.clone());

            if let Some(frame) = replayed {
                // Fresh inbox with room for at least one frame; if the
                // subscriber somehow raced it full, the replay is dropped
                // like any other backpressured delivery.
                let _ = tx.try_send(frame);
            }

            // Attach only when the topic has no physical subscription yet;
            // additional logical subscribers share the existing one. Checked
            // under the same lock as the registration so a concurrent attach
            // or session swap cannot slip in between.
            if inner.topics.is_attached(&destination) {
                (id, None)
            } else {
                (id, inner.session.clone())
            }
        };

        if let Some(session) = attach_to {
            self.attach_topic(&session, &destination).await;
        }

        let canceller = SubscriptionCanceller {
            shared: Arc::new(CancelShared {
                channel: Arc::downgrade(self),
                destination: destination.clone(),
                id,
                done: AtomicBool::new(false),
            }),
        };

        Ok(TopicSubscription {
            destination,
            inbox: rx,
            canceller,
        })
    }

    /// Transmit a frame now, or queue it while disconnected.
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidDestination` for an empty destination, or the
    /// transport error when a live session rejects the send.
    pub(crate) async fn send(&self, frame: Frame) -> Result<()> {
        // ---
        if frame.destination.0.is_empty() {
            return Err(Error::InvalidDestination(frame.destination.0.to_string()));
        }

        self.warn_if_oversized(&frame);

        // The lock is held across the transmit so sends cannot reorder
        // against a concurrent flush of the pending queue.
        let mut inner = self.inner.lock().await;
        match inner.session.clone() {
            Some(session) => {
                if let Err(_err) = session.send(frame.clone()).await {
                    // A failing session is a dying session; the loss is
                    // recovered silently, so queue for the replacement
                    // instead of surfacing a transient error.
                    log_debug!("send on dying session queued: {_err}");
                    inner.pending.push_back(frame);
                }
                Ok(())
            }
            None => {
                inner.pending.push_back(frame);
                Ok(())
            }
        }
    }

    /// Adopt a new physical session: flush pending sends FIFO, then attach
    /// every live topic exactly once.
    pub(crate) async fn attach(self: &Arc<Self>, session: SessionPtr) {
        // ---
        let unattached = {
            let mut inner = self.inner.lock().await;
            inner.session = Some(session.clone());

            // Flush-then-clear as one step: flushing under the lock means a
            // concurrent send observes either the old queue or the live
            // session, never a half-flushed queue.
            while let Some(frame) = inner.pending.pop_front() {
                if let Err(_err) = session.send(frame.clone()).await {
                    // This session died before the flush finished; keep the
                    // remainder queued, in order, for its successor.
                    log_warn!("pending flush interrupted: {_err}");
                    inner.pending.push_front(frame);
                    break;
                }
            }

            inner.topics.unattached()
        };

        for destination in unattached {
            self.attach_topic(&session, &destination).await;
        }
    }

    /// Drop physical attachments after a session loss.
    ///
    /// Topics, conduits, and subscribers persist untouched; logical
    /// subscribers simply stop receiving frames until the next attach.
    pub(crate) async fn detach(&self) {
        // ---
        let mut inner = self.inner.lock().await;
        inner.session = None;
        inner.topics.detach_all();
    }

    /// Tear down everything: completes all conduits, drops pending sends,
    /// and returns the session (if any) for the caller to disconnect.
    pub(crate) async fn clear(&self) -> Option<SessionPtr> {
        // ---
        let mut inner = self.inner.lock().await;
        inner.topics.clear();
        inner.pending.clear();
        inner.session.take()
    }

    /// Negotiated transport mode of the current session, for diagnostics.
    pub(crate) async fn transport_mode(&self) -> Option<String> {
        // ---
        let inner = self.inner.lock().await;
        inner
            .session
            .as_ref()
            .map(|session| session.transport_mode().to_string())
    }

    #[cfg(test)]
    pub(crate) async fn topic_count(&self) -> usize {
        self.inner.lock().await.topics.len()
    }

    /// Attach a physical subscription for one topic, guarding against the
    /// topic disappearing or being attached concurrently while the raw
    /// subscribe was in flight.
    async fn attach_topic(self: &Arc<Self>, session: &SessionPtr, destination: &Destination) {
        // ---
        {
            let inner = self.inner.lock().await;
            if !inner.topics.contains(destination) {
                return;
            }
        }

        let raw = match session.subscribe(destination.clone()).await {
            Ok(raw) => raw,
            Err(_err) => {
                log_warn!("physical subscribe failed for {destination}: {_err}");
                return;
            }
        };

        let RawSubscription { id, inbox } = raw;
        let forward = spawn_forward(Arc::downgrade(self), destination.clone(), inbox);

        let stale = {
            let mut inner = self.inner.lock().await;

            // The session may have been replaced while the raw subscribe was
            // in flight; an attachment to a dead session is useless.
            let current = inner
                .session
                .as_ref()
                .is_some_and(|current| Arc::ptr_eq(current, session));

            if current {
                inner.topics.attach(destination, PhysicalAttachment { id, forward })
            } else {
                Some(PhysicalAttachment { id, forward })
            }
        };

        if stale.is_some() {
            // Lost the race (topic gone, already attached, or session
            // replaced). Dropping the attachment aborts the forward task;
            // the wire-level unsubscribe is best-effort.
            let session = session.clone();
            tokio::spawn(async move {
                session.unsubscribe(id).await;
            });
        }
    }

    /// Remove a logical subscriber; called from cancellation handles.
    async fn unsubscribe(&self, destination: &Destination, id: u64) {
        // ---
        let (removal, session) = {
            let mut inner = self.inner.lock().await;
            let removal = inner.topics.remove_subscriber(destination, id);
            (removal, inner.session.clone())
        };

        if !removal.topic_removed {
            return;
        }

        log_debug!("topic {destination} removed (last subscriber cancelled)");

        if let (Some(physical), Some(session)) = (removal.physical, session) {
            // Best-effort network traffic; never blocks the cancelling
            // caller.
            let raw_id = physical.id;
            tokio::spawn(async move {
                session.unsubscribe(raw_id).await;
            });
        }
    }

    /// Fan an inbound frame out to every subscriber of its topic.
    async fn deliver(&self, destination: &Destination, frame: Frame) {
        // ---
        let senders = {
            let mut inner = self.inner.lock().await;
            inner.topics.deliver(destination, &frame)
        };

        for sender in senders {
            // A closed inbox means the subscriber is being cancelled.
            let _ = sender.send(frame.clone()).await;
        }
    }

    fn warn_if_oversized(&self, frame: &Frame) {
        // ---
        let size = frame.body.len();
        if size <= self.warn_body_bytes {
            return;
        }

        match serde_json::from_slice::<serde_json::Value>(&frame.body) {
            Ok(_value) => {
                #[cfg(feature = "logging")]
                log_warn!(
                    "oversized outbound body ({size} bytes) to {}: {}",
                    frame.destination,
                    serde_json::to_string_pretty(&_value).unwrap_or_default()
                );
            }
            Err(_) => {
                log_warn!(
                    "oversized outbound body ({size} bytes) to {}",
                    frame.destination
                );
            }
        }
    }
}

/// Pump frames from a raw subscription inbox into the channel conduit.
///
/// The task exits when the raw inbox closes (session died) or the channel is
/// gone; it is aborted when the topic detaches.
fn spawn_forward(
    channel: Weak<MultiplexChannel>,
    destination: Destination,
    mut inbox: mpsc::Receiver<Frame>,
) -> JoinHandle<()> {
    // ---
    tokio::spawn(async move {
        loop {
            match inbox.recv().await {
                Some(frame) => {
                    let Some(channel) = channel.upgrade() else {
                        break;
                    };
                    channel.deliver(&destination, frame).await;
                }
                None => {
                    log_debug!("raw subscription closed for {destination}");
                    break;
                }
            }
        }
    })
}

struct CancelShared {
    // ---
    channel: Weak<MultiplexChannel>,
    destination: Destination,
    id: u64,
    done: AtomicBool,
}

/// Idempotent cancellation handle for one logical subscription.
///
/// Cloneable so that both the subscriber and its owning connection handle
/// can cancel; whichever calls first wins, later calls are no-ops.
#[derive(Clone)]
pub struct SubscriptionCanceller {
    shared: Arc<CancelShared>,
}

impl SubscriptionCanceller {
    /// Cancel the subscription: decrement the topic's reference count and,
    /// when this was the last subscriber, remove the topic.
    pub async fn cancel(&self) {
        // ---
        if self.shared.done.swap(true, Ordering::AcqRel) {
            return;
        }

        if let Some(channel) = self.shared.channel.upgrade() {
            channel
                .unsubscribe(&self.shared.destination, self.shared.id)
                .await;
        }
    }
}

/// A live logical subscription to one destination.
///
/// Frames arrive on `inbox` in physical arrival order. The subscription
/// stays registered until [`cancel`](Self::cancel) is called (directly or
/// through the owning handle's disconnect); merely dropping it stops
/// delivery but leaves the topic's reference count to the canceller.
pub struct TopicSubscription {
    // ---
    destination: Destination,

    /// Receiver channel for frames delivered to this subscriber.
    pub inbox: mpsc::Receiver<Frame>,

    canceller: SubscriptionCanceller,
}

impl TopicSubscription {
    /// The destination this subscription is registered for.
    pub fn destination(&self) -> &Destination {
        &self.destination
    }

    /// A cloneable cancellation handle for this subscription.
    pub fn canceller(&self) -> SubscriptionCanceller {
        self.canceller.clone()
    }

    /// Cancel this subscription.
    pub async fn cancel(&self) {
        self.canceller.cancel().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::TransportFactory;
    use crate::transport::{MemorySession, MemoryTransportFactory};
    use std::time::Duration;
    use tokio::time::{sleep, timeout};

    async fn connected_session(
        factory: &MemoryTransportFactory,
    ) -> (SessionPtr, Arc<MemorySession>) {
        // ---
        let session = factory.connect("mem://channel").await.expect("connect");
        let memory = factory.session().expect("session recorded");
        (session, memory)
    }

    #[tokio::test]
    async fn pending_sends_flush_in_call_order_on_attach() {
        // ---
        let channel = MultiplexChannel::new(usize::MAX);

        for i in 0..3 {
            channel
                .send(Frame::message("/queue/out", format!("m{i}")))
                .await
                .expect("queued send");
        }

        let factory = MemoryTransportFactory::new();
        let (session, memory) = connected_session(&factory).await;
        channel.attach(session).await;

        let sent = memory.sent_frames();
        assert_eq!(sent.len(), 3);
        for (i, frame) in sent.iter().enumerate() {
            assert_eq!(frame.body.as_ref(), format!("m{i}").as_bytes());
        }
    }

    #[tokio::test]
    async fn last_cancel_removes_topic_and_raw_subscription() {
        // ---
        let factory = MemoryTransportFactory::new();
        let channel = MultiplexChannel::new(usize::MAX);
        let (session, memory) = connected_session(&factory).await;
        channel.attach(session).await;

        let dest = Destination::from("/topic/t");
        let first = channel.subscribe(dest.clone(), false).await.expect("sub");
        let second = channel.subscribe(dest.clone(), false).await.expect("sub");

        // Two logical subscribers share one physical subscription.
        assert_eq!(memory.subscription_count(&dest), 1);

        first.cancel().await;
        assert_eq!(channel.topic_count().await, 1);
        assert_eq!(memory.subscription_count(&dest), 1);

        second.cancel().await;
        assert_eq!(channel.topic_count().await, 0);

        // The wire-level unsubscribe is spawned; give it a moment.
        for _ in 0..50 {
            if memory.subscription_count(&dest) == 0 {
                break;
            }
            sleep(Duration::from_millis(2)).await;
        }
        assert_eq!(memory.subscription_count(&dest), 0);
    }

    #[tokio::test]
    async fn replay_conduit_redelivers_last_frame() {
        // ---
        let factory = MemoryTransportFactory::new();
        let channel = MultiplexChannel::new(usize::MAX);
        let (session, memory) = connected_session(&factory).await;
        channel.attach(session).await;

        let dest = Destination::from("/topic/r");
        let mut first = channel.subscribe(dest.clone(), true).await.expect("sub");

        memory.inject(Frame::message(dest.clone(), &b"retained"[..])).await;

        let frame = timeout(Duration::from_millis(500), first.inbox.recv())
            .await
            .expect("timed out")
            .expect("conduit completed unexpectedly");
        assert_eq!(frame.body.as_ref(), b"retained");

        // A late subscriber receives the retained frame without a new
        // publish.
        let mut late = channel.subscribe(dest.clone(), false).await.expect("sub");
        let replayed = timeout(Duration::from_millis(500), late.inbox.recv())
            .await
            .expect("timed out")
            .expect("conduit completed unexpectedly");
        assert_eq!(replayed.body.as_ref(), b"retained");
    }

    #[tokio::test]
    async fn additional_subscribers_reuse_the_existing_attachment() {
        // ---
        let factory = MemoryTransportFactory::new();
        let channel = MultiplexChannel::new(usize::MAX);
        let (session, memory) = connected_session(&factory).await;
        channel.attach(session).await;

        let dest = Destination::from("/topic/shared");
        let mut first = channel.subscribe(dest.clone(), false).await.expect("sub");
        let mut second = channel.subscribe(dest.clone(), false).await.expect("sub");

        // The second logical subscriber must not open a second wire-level
        // subscription, not even transiently.
        assert_eq!(memory.subscription_count(&dest), 1);

        // One raw subscription means one delivery per subscriber per frame.
        memory.inject(Frame::message(dest.clone(), &b"once"[..])).await;
        for sub in [&mut first, &mut second] {
            let frame = timeout(Duration::from_millis(500), sub.inbox.recv())
                .await
                .expect("timed out")
                .expect("conduit completed unexpectedly");
            assert_eq!(frame.body.as_ref(), b"once");
            assert!(
                timeout(Duration::from_millis(50), sub.inbox.recv())
                    .await
                    .is_err(),
                "frame was delivered twice"
            );
        }
    }

    #[tokio::test]
    async fn cancellation_is_idempotent() {
        // ---
        let channel = MultiplexChannel::new(usize::MAX);
        let dest = Destination::from("/topic/i");

        let first = channel.subscribe(dest.clone(), false).await.expect("sub");
        let _second = channel.subscribe(dest.clone(), false).await.expect("sub");

        first.cancel().await;
        first.cancel().await;

        // Double-cancel of the first must not decrement the second away.
        assert_eq!(channel.topic_count().await, 1);
    }
}
