//! Process-wide endpoint registry.
//!
//! The registry is the only unavoidable shared mutable state in the core:
//! a map from endpoint to its singleton lifecycle manager. It is an explicit
//! object with an injectable lifetime (constructed once at application
//! start, resettable between test runs) rather than a language-level
//! global.
//!
//! Lifecycle: an entry appears on the first `connect()` for an endpoint and
//! disappears when that endpoint's last handle disconnects. Fully empty is
//! a valid steady state.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::Mutex;

use crate::config::ClientConfig;
use crate::domain::TransportFactory;
use crate::manager::ConnectionManager;
use crate::policy::{
    ActivityPolicy, Liveness, NullCollaborator, ReloadHook, SessionEvents, TouchInspectionPolicy,
};
use crate::ConnectionHandle;
use crate::{Error, Result};

/// Injected collaborator set shared by every endpoint of one registry.
#[derive(Clone)]
pub(crate) struct Collaborators {
    // ---
    pub(crate) session_events: Arc<dyn SessionEvents>,
    pub(crate) liveness: Arc<dyn Liveness>,
    pub(crate) reload: Arc<dyn ReloadHook>,
    pub(crate) activity: Arc<dyn ActivityPolicy>,
}

/// Builder for a [`ClientRegistry`].
///
/// Every collaborator defaults to a no-op (and the activity policy to
/// [`TouchInspectionPolicy`]); wire in only what the application cares
/// about.
pub struct ClientRegistryBuilder {
    // ---
    factory: Arc<dyn TransportFactory>,
    config: ClientConfig,
    collaborators: Collaborators,
}

impl ClientRegistryBuilder {
    /// Override the lifecycle configuration.
    pub fn with_config(mut self, config: ClientConfig) -> Self {
        self.config = config;
        self
    }

    /// Wire in the session/logout collaborator.
    pub fn with_session_events(mut self, session_events: Arc<dyn SessionEvents>) -> Self {
        self.collaborators.session_events = session_events;
        self
    }

    /// Wire in the liveness collaborator.
    pub fn with_liveness(mut self, liveness: Arc<dyn Liveness>) -> Self {
        self.collaborators.liveness = liveness;
        self
    }

    /// Wire in the environment reload hook.
    pub fn with_reload_hook(mut self, reload: Arc<dyn ReloadHook>) -> Self {
        self.collaborators.reload = reload;
        self
    }

    /// Replace the activity policy used to gate liveness signaling.
    pub fn with_activity_policy(mut self, activity: Arc<dyn ActivityPolicy>) -> Self {
        self.collaborators.activity = activity;
        self
    }

    pub fn build(self) -> Arc<ClientRegistry> {
        // ---
        Arc::new(ClientRegistry {
            factory: self.factory,
            config: self.config,
            collaborators: self.collaborators,
            managers: Mutex::new(HashMap::new()),
        })
    }
}

/// Map from endpoint to its singleton connection manager.
///
/// # Example
///
/// ```no_run
/// # use std::collections::HashMap;
/// # use std::sync::Arc;
/// # use stomp_mux::{ClientRegistry, MemoryTransportFactory};
/// # async fn example() -> stomp_mux::Result<()> {
/// let factory = MemoryTransportFactory::new();
/// let registry = ClientRegistry::new(factory);
///
/// let handle = registry.connect("wss://example/ws").await?;
/// let mut sub = handle.subscribe("/topic/news", false).await?;
/// handle.send("/app/hello", HashMap::new(), &b"hi"[..]).await?;
///
/// while let Some(frame) = sub.inbox.recv().await {
///     println!("received {:?}", frame.body);
/// }
/// # Ok(())
/// # }
/// ```
pub struct ClientRegistry {
    // ---
    factory: Arc<dyn TransportFactory>,
    config: ClientConfig,
    collaborators: Collaborators,
    managers: Mutex<HashMap<String, Arc<ConnectionManager>>>,
}

impl ClientRegistry {
    /// Create a registry with default configuration and no-op collaborators.
    pub fn new(factory: Arc<dyn TransportFactory>) -> Arc<Self> {
        Self::builder(factory).build()
    }

    /// Start building a registry with explicit collaborators.
    pub fn builder(factory: Arc<dyn TransportFactory>) -> ClientRegistryBuilder {
        // ---
        let noop = Arc::new(NullCollaborator);
        ClientRegistryBuilder {
            factory,
            config: ClientConfig::default(),
            collaborators: Collaborators {
                session_events: noop.clone(),
                liveness: noop.clone(),
                reload: noop,
                activity: Arc::new(TouchInspectionPolicy),
            },
        }
    }

    /// Obtain a handle to `endpoint`, creating the shared connection on
    /// first use.
    ///
    /// Two callers connecting to the same endpoint share one physical
    /// connection; concurrent calls before the first resolves are settled
    /// together by the single underlying attempt.
    ///
    /// # Errors
    ///
    /// Returns `Error::Connect` if establishment fails (every queued caller
    /// receives the error), or `Error::RetriesExhausted`/`Error::Closed`
    /// when joining an endpoint that terminates before settling.
    pub async fn connect(self: &Arc<Self>, endpoint: &str) -> Result<ConnectionHandle> {
        // ---
        if endpoint.is_empty() {
            return Err(Error::Connect("empty endpoint".to_string()));
        }

        let manager = {
            let mut managers = self.managers.lock().await;
            managers
                .entry(endpoint.to_string())
                .or_insert_with(|| {
                    ConnectionManager::new(
                        endpoint.to_string(),
                        self.config.clone(),
                        self.factory.clone(),
                        self.collaborators.clone(),
                        Arc::downgrade(self),
                    )
                })
                .clone()
        };

        manager.connect().await
    }

    /// Number of endpoints with live state. Zero is a valid steady state.
    pub async fn endpoint_count(&self) -> usize {
        self.managers.lock().await.len()
    }

    /// Drop an endpoint entry once its manager is done.
    ///
    /// Guarded by pointer identity so a torn-down manager cannot evict a
    /// successor created for the same endpoint in the meantime.
    pub(crate) async fn remove(&self, endpoint: &str, manager: &Arc<ConnectionManager>) {
        // ---
        let mut managers = self.managers.lock().await;
        if let Some(current) = managers.get(endpoint) {
            if Arc::ptr_eq(current, manager) {
                managers.remove(endpoint);
            }
        }
    }
}
