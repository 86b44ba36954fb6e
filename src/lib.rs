//! Durable, reconnecting, multiplexed pub/sub sessions over one physical
//! connection per endpoint.
//!
//! This library presents each caller with an always-available,
//! independently-cancelable topic subscription while internally sharing a
//! single message-oriented connection per server endpoint: it survives
//! drops through a bounded fixed-interval reconnect loop, replays sends
//! buffered while disconnected, and re-establishes every live topic's
//! physical subscription transparently.
//!
//! The wire transport is injected through [`TransportFactory`]; the core
//! never opens sockets itself and assumes the transport is already
//! authorized. Session policy (logout, expiry, liveness, environment
//! reload) lives in injected collaborators; the core only forwards
//! signals.
//!
//! # Overview
//!
//! - [`ClientRegistry`]: endpoint → shared connection, created lazily,
//!   removed when the last caller disconnects
//! - [`ConnectionHandle`]: caller-scoped facade tracking its own
//!   subscriptions
//! - [`TopicSubscription`]: one logical subscriber's inbox plus an explicit
//!   cancellation handle

// Import all sub modules once...
mod channel;
mod config;
mod error;
mod handle;
mod manager;
mod policy;
mod registry;
mod transport;

mod domain;
mod macros;

// Re-export main types
pub use config::ClientConfig;
pub use error::{Error, Result};
pub use handle::ConnectionHandle;
pub use registry::{ClientRegistry, ClientRegistryBuilder};

pub use channel::{SubscriptionCanceller, TopicSubscription};
pub use manager::{ConnectionEvent, TerminalReason};

pub use policy::{
    //
    ActivityPolicy,
    Liveness,
    NullCollaborator,
    ReloadHook,
    SessionEvents,
    TouchInspectionPolicy,
    CLOSE_ADMIN_LOGOUT,
    CLOSE_LOGGED_OUT,
    CLOSE_SESSION_EXPIRED,
};

pub use transport::{MemorySession, MemoryTransportFactory};

// --- transport seam re-exports
pub use domain::{
    //
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
