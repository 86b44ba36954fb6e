// src/domain/transport.rs

//! Transport domain abstractions.
//!
//! This module defines the seam between the connection core and the concrete
//! wire transport. It intentionally avoids any reference to sockets, frame
//! grammars, or client libraries; the transport is assumed to be already
//! authorized and capable of delivering opaque frames.
//!
//! The transport layer is responsible only for delivering frames to raw
//! subscriptions on one live session. Higher-level semantics such as
//! reconnection, multiplexing, reference counting, and pending-send replay
//! are handled by the core.
//!
//! Concrete implementations of this interface live under `src/transport/`.

use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::Result;

/// A destination string.
///
/// A `Destination` names a topic on the server to which frames may be sent
/// or from which frames may be received. Its interpretation is
/// transport-specific; the core treats it as an opaque identifier.
///
/// Destinations are immutable, cheap to clone, and safe to share across
/// tasks.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct Destination(pub Arc<str>);

impl<T> From<T> for Destination
where
    T: Into<Arc<str>>,
{
    fn from(value: T) -> Self {
        // ---
        Destination(value.into())
    }
}

impl std::fmt::Display for Destination {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

/// An opaque message frame.
///
/// A `Frame` is the unit of transport between the core and the server. It
/// carries a destination, protocol headers, and a payload. The transport
/// layer does not interpret the payload; it is responsible only for
/// delivery.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Frame {
    // ---
    /// Delivery destination used by the transport for routing.
    pub destination: Destination,

    /// Protocol headers attached to the frame.
    ///
    /// Header semantics are defined by the wire protocol, not by this core.
    pub headers: HashMap<String, String>,

    /// Opaque payload bytes.
    pub body: Bytes,
}

impl Frame {
    /// Create a frame.
    pub fn new(
        destination: impl Into<Destination>,
        headers: HashMap<String, String>,
        body: impl Into<Bytes>,
    ) -> Self {
        // ---
        Self {
            destination: destination.into(),
            headers,
            body: body.into(),
        }
    }

    /// Create a frame with no headers.
    pub fn message(destination: impl Into<Destination>, body: impl Into<Bytes>) -> Self {
        // ---
        Self::new(destination, HashMap::new(), body)
    }
}

/// Identifier of a raw subscription on one physical session.
///
/// Valid only for the session that issued it; a replacement session after a
/// reconnect issues fresh identifiers.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct RawSubscriptionId(pub u64);

/// Handle returned from a successful raw subscription.
///
/// The subscription remains active until either:
/// - [`TransportSession::unsubscribe`] is called with `id`
/// - the session closes
///
/// Dropping the inbox stops delivery but does not send an unsubscribe on the
/// wire; the core issues explicit best-effort unsubscribes.
pub struct RawSubscription {
    // ---
    /// Identifier used for explicit unsubscription.
    pub id: RawSubscriptionId,

    /// Receiver channel for frames delivered to this subscription.
    pub inbox: mpsc::Receiver<Frame>,
}

/// Close notification delivered to registered close observers.
///
/// `code` is the numeric close code reported by the raw socket, when one
/// exists. The core maps well-known codes to session-policy signals and
/// treats everything else as a transient loss.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CloseEvent {
    /// Optional numeric close code from the raw socket.
    pub code: Option<u16>,
}

/// Observer invoked when the session's raw socket closes.
///
/// Observers are invoked at most once, in registration order. This replaces
/// ad-hoc patching of a foreign `onclose` hook with an explicit ordered list.
pub type CloseObserver = Box<dyn FnOnce(CloseEvent) + Send>;

/// Factory producing physical sessions for endpoint strings.
///
/// The factory is injected at registry construction; the core never opens
/// sockets itself. Each successful `connect` yields a brand-new session;
/// sessions are replaced wholesale on every reconnect, never reused.
#[async_trait::async_trait]
pub trait TransportFactory: Send + Sync {
    /// Open a new physical session to `endpoint`.
    ///
    /// # Errors
    ///
    /// Returns `Error::Connect` (or `Error::Transport`) if the session could
    /// not be established. The core decides whether the failure is
    /// establishment-fatal or part of a silent reconnect.
    async fn connect(&self, endpoint: &str) -> Result<SessionPtr>;
}

/// One live transport-level session.
///
/// Implementations must ensure that:
/// - Once `subscribe()` returns successfully, frames arriving *after* that
///   point for the destination are deliverable on the returned inbox.
/// - `send()` is non-blocking with respect to subscribers.
/// - Close observers registered via `on_close()` fire exactly once, in
///   registration order, when the underlying socket closes for any reason
///   other than a local `disconnect()` call.
///
/// The in-memory session serves as the reference implementation of these
/// semantics.
#[async_trait::async_trait]
pub trait TransportSession: Send + Sync {
    /// The negotiated transport mode (e.g. `"websocket"`, `"memory"`).
    ///
    /// Informational; exposed to callers for diagnostics only.
    fn transport_mode(&self) -> &str;

    /// Register a close observer.
    ///
    /// If the session is already closed, the observer fires immediately.
    fn on_close(&self, observer: CloseObserver);

    /// Transmit a frame on the wire.
    async fn send(&self, frame: Frame) -> Result<()>;

    /// Open a raw subscription for a destination.
    async fn subscribe(&self, destination: Destination) -> Result<RawSubscription>;

    /// Best-effort removal of a raw subscription.
    ///
    /// Failures are ignorable; a dead session has already invalidated all of
    /// its subscriptions.
    async fn unsubscribe(&self, id: RawSubscriptionId);

    /// Tear down the session deliberately.
    ///
    /// A local disconnect does not fire close observers.
    async fn disconnect(&self);
}

/// Shared session pointer.
///
/// This is an `Arc<dyn TransportSession>`, which means:
/// - `.clone()` is cheap (only increments a reference count)
/// - the lifecycle manager and the multiplex channel share one session
/// - concrete transport types are erased behind a stable domain interface.
pub type SessionPtr = Arc<dyn TransportSession>;
