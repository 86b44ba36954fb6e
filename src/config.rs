//! Public, transport-agnostic client configuration.
//!
//! This type intentionally contains no transport-specific concepts
//! (socket options, framing, authentication). Transport factories are
//! responsible for interpreting endpoint strings into concrete connections;
//! this config only governs the lifecycle policy around them.

use std::time::Duration;

/// Connection lifecycle configuration.
///
/// Reconnection parameters are fixed configuration constants, not per-call
/// knobs: exceeding the retry budget is a hard terminal failure for the
/// endpoint, not a retryable condition.
///
/// # Example
///
/// ```
/// use stomp_mux::ClientConfig;
/// use std::time::Duration;
///
/// let config = ClientConfig::default()
///     .with_reconnect_delay(Duration::from_secs(1))
///     .with_max_reconnect_attempts(3);
/// ```
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Fixed delay between reconnect attempts after an established
    /// connection is lost.
    ///
    /// The interval is deliberately constant rather than exponential; every
    /// attempt in the retry loop waits the same amount.
    pub reconnect_delay: Duration,

    /// Maximum number of reconnect attempts before the endpoint enters the
    /// terminal failure state.
    pub max_reconnect_attempts: u32,

    /// Interval of the liveness tick delivered to handles while connected.
    ///
    /// The tick is strictly periodic and independent of message traffic.
    pub heartbeat_interval: Duration,

    /// When true, exhausting the reconnect budget asks the environment for a
    /// hard reload instead of surfacing a terminal error to callers.
    pub reload_on_exhaustion: bool,

    /// Outbound bodies larger than this are logged with a warning.
    ///
    /// Diagnostic only; the send proceeds regardless.
    pub warn_body_bytes: usize,
}

impl Default for ClientConfig {
    /// Reasonable defaults:
    ///
    /// - `reconnect_delay`: 2s (fixed interval)
    /// - `max_reconnect_attempts`: 10
    /// - `heartbeat_interval`: 30s
    /// - `reload_on_exhaustion`: false
    /// - `warn_body_bytes`: 16 KiB
    fn default() -> Self {
        // ---
        Self {
            reconnect_delay: Duration::from_secs(2),
            max_reconnect_attempts: 10,
            heartbeat_interval: Duration::from_secs(30),
            reload_on_exhaustion: false,
            warn_body_bytes: 16 * 1024,
        }
    }
}

impl ClientConfig {
    /// Set the fixed delay between reconnect attempts.
    pub fn with_reconnect_delay(mut self, delay: Duration) -> Self {
        self.reconnect_delay = delay;
        self
    }

    /// Set the reconnect attempt budget.
    pub fn with_max_reconnect_attempts(mut self, attempts: u32) -> Self {
        self.max_reconnect_attempts = attempts;
        self
    }

    /// Set the heartbeat tick interval.
    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    /// Ask the environment for a hard reload when retries exhaust, instead
    /// of surfacing a terminal error.
    pub fn with_reload_on_exhaustion(mut self, reload: bool) -> Self {
        self.reload_on_exhaustion = reload;
        self
    }

    /// Set the oversized-body warning threshold in bytes.
    pub fn with_warn_body_bytes(mut self, bytes: usize) -> Self {
        self.warn_body_bytes = bytes;
        self
    }
}
