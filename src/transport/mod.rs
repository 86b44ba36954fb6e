//! Transport implementations.
//!
//! This module provides concrete implementations of the domain-level
//! transport traits. The in-memory transport is always available and serves
//! as the reference implementation of transport semantics; real transports
//! (WebSocket, ...) are supplied by applications through the injected
//! [`TransportFactory`](crate::TransportFactory).
//!
//! Domain code must not depend on transport-specific types.

mod memory;

pub use memory::{MemorySession, MemoryTransportFactory};
