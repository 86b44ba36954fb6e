//! Per-endpoint connection lifecycle.
//!
//! The manager owns at most one physical session at a time and hides its
//! churn from callers:
//!
//! ```text
//! Disconnected → Connecting → Connected → Reconnecting → Connected
//!                                      ↘ Failed → Disconnected
//! ```
//!
//! Establishment failures are reported to whichever callers are waiting.
//! Loss of an established session is recovered silently through a bounded
//! fixed-interval retry loop; handles and topic registrations persist
//! logically across the gap. Only an exhausted retry budget surfaces as a
//! terminal failure (or an environment hard-reload, when configured).
//!
//! A strictly periodic heartbeat tick is emitted to all handles while
//! connected, independent of message traffic.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use tokio::sync::{broadcast, oneshot, Mutex};
use tokio::task::JoinHandle;

use crate::channel::MultiplexChannel;
use crate::config::ClientConfig;
use crate::domain::{CloseEvent, SessionPtr, TransportFactory};
use crate::macros::{log_debug, log_error, log_info, log_warn};
use crate::policy::{CLOSE_ADMIN_LOGOUT, CLOSE_LOGGED_OUT, CLOSE_SESSION_EXPIRED};
use crate::registry::{ClientRegistry, Collaborators};
use crate::ConnectionHandle;
use crate::{Error, Result};

/// Connection lifecycle state for one endpoint.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LifecycleState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    Failed,
}

/// Why an endpoint terminated.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TerminalReason {
    /// The reconnect budget was exhausted.
    RetriesExhausted,
    /// The raw socket closed with a logout code.
    LoggedOut,
    /// The raw socket closed with the session-timeout code.
    SessionExpired,
}

/// Event delivered on every handle's event stream.
///
/// Transient reconnects are deliberately invisible here; callers see only
/// liveness ticks and terminal failures.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionEvent {
    /// Periodic liveness tick while connected.
    Heartbeat,
    /// The endpoint failed terminally; all handles are released.
    Terminated(TerminalReason),
}

/// Cloneable rejection reason for queued connect waiters.
#[derive(Clone, Debug)]
enum WaiterError {
    Connect(String),
    Terminal(TerminalReason),
}

type Waiter = oneshot::Sender<std::result::Result<(), WaiterError>>;

struct ManagerInner {
    // ---
    state: LifecycleState,

    /// Number of live [`ConnectionHandle`]s.
    callers: usize,

    /// Callers queued behind an in-flight attempt.
    waiters: Vec<Waiter>,

    /// Heartbeat ticker task, present while connected.
    ticker: Option<JoinHandle<()>>,

    /// Reconnect loop task, present while reconnecting.
    reconnector: Option<JoinHandle<()>>,

    /// Bumped on every session change or teardown; guards stale close
    /// notifications and abandoned reconnect loops.
    epoch: u64,
}

/// Owner of the physical connection lifecycle for one endpoint.
///
/// Created lazily by the [`ClientRegistry`], destroyed when the last handle
/// disconnects.
pub(crate) struct ConnectionManager {
    endpoint: String,
    config: ClientConfig,
    factory: Arc<dyn TransportFactory>,
    channel: Arc<MultiplexChannel>,
    collaborators: Collaborators,
    registry: std::sync::Weak<ClientRegistry>,
    events: broadcast::Sender<ConnectionEvent>,
    inner: Mutex<ManagerInner>,
}

impl ConnectionManager {
    pub(crate) fn new(
        endpoint: String,
        config: ClientConfig,
        factory: Arc<dyn TransportFactory>,
        collaborators: Collaborators,
        registry: std::sync::Weak<ClientRegistry>,
    ) -> Arc<Self> {
        // ---
        let (events, _) = broadcast::channel(16);
        let channel = MultiplexChannel::new(config.warn_body_bytes);

        Arc::new(Self {
            endpoint,
            config,
            factory,
            channel,
            collaborators,
            registry,
            events,
            inner: Mutex::new(ManagerInner {
                state: LifecycleState::Disconnected,
                callers: 0,
                waiters: Vec::new(),
                ticker: None,
                reconnector: None,
                epoch: 0,
            }),
        })
    }

    pub(crate) fn channel(&self) -> &Arc<MultiplexChannel> {
        &self.channel
    }

    pub(crate) fn collaborators(&self) -> &Collaborators {
        &self.collaborators
    }

    pub(crate) fn subscribe_events(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.events.subscribe()
    }

    /// True once the endpoint has been torn down (or failed terminally).
    ///
    /// Handles only exist after a successful connect, so for them these
    /// states can only mean the shared connection is gone for good.
    pub(crate) async fn is_terminated(&self) -> bool {
        // ---
        matches!(
            self.inner.lock().await.state,
            LifecycleState::Disconnected | LifecycleState::Failed
        )
    }

    /// Obtain a handle, connecting if necessary.
    ///
    /// Resolves immediately when already connected; otherwise the caller is
    /// queued and settled together with the in-flight attempt.
    pub(crate) async fn connect(self: &Arc<Self>) -> Result<ConnectionHandle> {
        // ---
        let rx = {
            let mut inner = self.inner.lock().await;
            match inner.state {
                LifecycleState::Connected => {
                    inner.callers += 1;
                    return Ok(ConnectionHandle::new(self.clone()));
                }
                LifecycleState::Connecting | LifecycleState::Reconnecting => {
                    let (tx, rx) = oneshot::channel();
                    inner.waiters.push(tx);
                    rx
                }
                LifecycleState::Disconnected | LifecycleState::Failed => {
                    inner.state = LifecycleState::Connecting;
                    let (tx, rx) = oneshot::channel();
                    inner.waiters.push(tx);

                    let manager = self.clone();
                    tokio::spawn(async move {
                        manager.run_initial_attempt().await;
                    });
                    rx
                }
            }
        };

        match rx.await {
            Ok(Ok(())) => {
                let mut inner = self.inner.lock().await;
                if inner.state == LifecycleState::Connected {
                    inner.callers += 1;
                    Ok(ConnectionHandle::new(self.clone()))
                } else {
                    Err(Error::Closed)
                }
            }
            Ok(Err(WaiterError::Connect(msg))) => Err(Error::Connect(msg)),
            Ok(Err(WaiterError::Terminal(TerminalReason::RetriesExhausted))) => {
                Err(Error::RetriesExhausted)
            }
            Ok(Err(WaiterError::Terminal(_))) => Err(Error::Closed),
            Err(_) => Err(Error::Closed),
        }
    }

    /// A handle finished; tear the endpoint down when it was the last.
    pub(crate) async fn release(self: &Arc<Self>) {
        // ---
        let idle = {
            let mut inner = self.inner.lock().await;
            if inner.callers == 0 {
                return;
            }
            inner.callers -= 1;
            inner.callers == 0
        };

        if idle {
            log_debug!("last handle released for {}", self.endpoint);
            self.teardown(None).await;
        }
    }

    /// First attempt for a batch of queued callers.
    ///
    /// Failure here rejects the whole batch; there is no silent retry before
    /// the endpoint has ever been connected.
    async fn run_initial_attempt(self: Arc<Self>) {
        // ---
        log_info!("connecting to {}", self.endpoint);

        match self.factory.connect(&self.endpoint).await {
            Ok(session) => self.install_session(session).await,
            Err(err) => {
                log_warn!("connection to {} failed: {err}", self.endpoint);

                let idle = {
                    let mut inner = self.inner.lock().await;
                    inner.state = LifecycleState::Disconnected;
                    let msg = err.to_string();
                    for waiter in inner.waiters.drain(..) {
                        let _ = waiter.send(Err(WaiterError::Connect(msg.clone())));
                    }
                    inner.callers == 0
                };

                // No caller ever held a handle; leave no stale entry behind.
                if idle {
                    if let Some(registry) = self.registry.upgrade() {
                        registry.remove(&self.endpoint, &self).await;
                    }
                }
            }
        }
    }

    /// Adopt a freshly established session (initial connect or reconnect).
    ///
    /// Boxed: the close watcher spawned inside eventually re-enters
    /// `install_session` through the reconnect loop, and the resulting
    /// recursive future needs a type-erased edge.
    fn install_session<'a>(
        self: &'a Arc<Self>,
        session: SessionPtr,
    ) -> Pin<Box<dyn Future<Output = ()> + Send + 'a>> {
        Box::pin(self.install_session_inner(session))
    }

    async fn install_session_inner(self: &Arc<Self>, session: SessionPtr) {
        // ---
        // Attach the channel first: pending sends flush and topics re-attach
        // before any queued caller observes the connected state.
        self.channel.attach(session.clone()).await;

        let epoch = {
            let mut inner = self.inner.lock().await;
            inner.state = LifecycleState::Connected;
            inner.epoch += 1;
            inner.reconnector = None;

            for waiter in inner.waiters.drain(..) {
                let _ = waiter.send(Ok(()));
            }

            if let Some(ticker) = inner.ticker.take() {
                ticker.abort();
            }
            inner.ticker = Some(self.spawn_ticker());

            inner.epoch
        };

        log_info!("connected to {} ({})", self.endpoint, session.transport_mode());

        // Watch for the session's close. The observer fires at most once;
        // the epoch guard discards notifications from replaced sessions.
        let (tx, rx) = oneshot::channel();
        session.on_close(Box::new(move |event| {
            let _ = tx.send(event);
        }));

        let manager = Arc::downgrade(self);
        tokio::spawn(async move {
            if let Ok(event) = rx.await {
                if let Some(manager) = manager.upgrade() {
                    manager.handle_close(epoch, event).await;
                }
            }
        });
    }

    /// React to the raw socket closing underneath an established session.
    async fn handle_close(self: &Arc<Self>, epoch: u64, event: CloseEvent) {
        // ---
        {
            let mut inner = self.inner.lock().await;
            if inner.epoch != epoch || inner.state != LifecycleState::Connected {
                return;
            }

            if let Some(ticker) = inner.ticker.take() {
                ticker.abort();
            }

            // Session-policy closes tear down without reconnecting; the
            // session ended by decision, not by accident.
            let policy_close = matches!(
                event.code,
                Some(CLOSE_SESSION_EXPIRED) | Some(CLOSE_LOGGED_OUT) | Some(CLOSE_ADMIN_LOGOUT)
            );

            if !policy_close {
                log_info!(
                    "connection to {} lost (code {:?}), reconnecting",
                    self.endpoint,
                    event.code
                );

                inner.state = LifecycleState::Reconnecting;
                inner.epoch += 1;
                let epoch = inner.epoch;

                // Detach before releasing the manager lock so no send can
                // observe the dead session once the state has flipped.
                self.channel.detach().await;

                let manager = self.clone();
                inner.reconnector = Some(tokio::spawn(async move {
                    manager.run_reconnect_loop(epoch).await;
                }));
                return;
            }
        }

        match event.code {
            Some(CLOSE_SESSION_EXPIRED) => {
                self.collaborators.session_events.session_expired();
                self.teardown(Some(TerminalReason::SessionExpired)).await;
            }
            Some(CLOSE_LOGGED_OUT) => {
                self.collaborators.session_events.logout(true, false);
                self.teardown(Some(TerminalReason::LoggedOut)).await;
            }
            Some(CLOSE_ADMIN_LOGOUT) => {
                self.collaborators.session_events.logout(true, true);
                self.teardown(Some(TerminalReason::LoggedOut)).await;
            }
            _ => {}
        }
    }

    /// Bounded fixed-interval retry loop after an unexpected loss.
    ///
    /// The back-off interval is constant and independent of the attempt
    /// count; exceeding the budget is a hard terminal failure.
    async fn run_reconnect_loop(self: Arc<Self>, epoch: u64) {
        // ---
        let max = self.config.max_reconnect_attempts;

        for attempt in 1..=max {
            tokio::time::sleep(self.config.reconnect_delay).await;

            {
                let inner = self.inner.lock().await;
                if inner.epoch != epoch || inner.state != LifecycleState::Reconnecting {
                    return;
                }
            }

            log_info!(
                "reconnect attempt {attempt}/{max} for {}",
                self.endpoint
            );

            match self.factory.connect(&self.endpoint).await {
                Ok(session) => {
                    let stale = {
                        let inner = self.inner.lock().await;
                        inner.epoch != epoch || inner.state != LifecycleState::Reconnecting
                    };
                    if stale {
                        session.disconnect().await;
                        return;
                    }

                    self.install_session(session).await;
                    return;
                }
                Err(_err) => {
                    log_warn!("reconnect attempt {attempt}/{max} failed: {_err}");
                }
            }
        }

        {
            let mut inner = self.inner.lock().await;
            if inner.epoch != epoch || inner.state != LifecycleState::Reconnecting {
                return;
            }
            inner.state = LifecycleState::Failed;
            // This task is the reconnector; clear the slot so teardown does
            // not abort it mid-flight.
            inner.reconnector = None;
        }

        log_error!("reconnect budget exhausted for {}", self.endpoint);

        if self.config.reload_on_exhaustion {
            self.collaborators.reload.reload();
        } else {
            self.teardown(Some(TerminalReason::RetriesExhausted)).await;
        }
    }

    /// Release everything for this endpoint.
    ///
    /// With a `reason`, the teardown is terminal and broadcast to handles;
    /// without one it is a quiet last-caller shutdown.
    async fn teardown(self: &Arc<Self>, reason: Option<TerminalReason>) {
        // ---
        {
            let mut inner = self.inner.lock().await;
            inner.state = LifecycleState::Disconnected;
            inner.epoch += 1;
            inner.callers = 0;

            if let Some(ticker) = inner.ticker.take() {
                ticker.abort();
            }
            if let Some(reconnector) = inner.reconnector.take() {
                reconnector.abort();
            }

            for waiter in inner.waiters.drain(..) {
                let _ = waiter.send(Err(match reason {
                    Some(reason) => WaiterError::Terminal(reason),
                    None => WaiterError::Connect("connection closed".to_string()),
                }));
            }
        }

        if let Some(reason) = reason {
            let _ = self.events.send(ConnectionEvent::Terminated(reason));
        }

        if let Some(session) = self.channel.clear().await {
            session.disconnect().await;
        }

        if let Some(registry) = self.registry.upgrade() {
            registry.remove(&self.endpoint, self).await;
        }
    }

    /// Strictly periodic liveness tick, not coalesced with traffic.
    fn spawn_ticker(self: &Arc<Self>) -> JoinHandle<()> {
        // ---
        let events = self.events.clone();
        let interval = self.config.heartbeat_interval;

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            // The immediate first tick of tokio's interval is not a
            // heartbeat; skip it.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                // Send fails only while no handle is listening; keep
                // ticking, handles may subscribe later.
                let _ = events.send(ConnectionEvent::Heartbeat);
            }
        })
    }
}
