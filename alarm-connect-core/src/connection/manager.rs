//! Connection Lifecycle Manager
//!
//! Creates, reconfigures and tears down panel connections against the shared
//! [`ConnectionRegistry`](super::ConnectionRegistry).
//!
//! ## Lifecycle
//!
//! - **create**: merge configuration, refuse a panel number that is already
//!   taken, build the client, spawn the background task that drives the
//!   client's connect sequence, register.
//! - **update**: re-merge and push the configuration into the live client.
//!   The background task is left alone.
//! - **destroy**: mark the connection draining, let the client stop
//!   gracefully (bounded by [`ManagerConfig::stop_timeout`]), cancel the
//!   background task, then remove it from the registry.
//!
//! Lifecycle operations are serialized by an internal lock, so the panel
//! check and the registration in `create` cannot interleave with another
//! `create`. Routing only takes the registry read lock and is never blocked
//! by a client's connect or stop sequence.

use super::{
    Connection, ConnectionEvent, ConnectionId, ConnectionInfo, LifecycleCell, LifecycleState,
    PanelId, SharedRegistry, TaskHandle,
};
use crate::client::{ClientFactory, PanelClient, SessionReporter};
use crate::config::{combine, panel_id_from, ConfigEntry, ConfigMap};
use crate::migration::Migrator;
use crate::{LinkError, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Events buffered per subscriber before the slowest one starts lagging
pub const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Default time a client gets to stop before its task is cancelled
pub const DEFAULT_STOP_TIMEOUT: Duration = Duration::from_secs(10);

/// Lifecycle manager configuration
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    /// How long `destroy` waits for the client's graceful stop
    pub stop_timeout: Duration,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            stop_timeout: DEFAULT_STOP_TIMEOUT,
        }
    }
}

/// Creates, updates and destroys panel connections
pub struct LifecycleManager {
    /// Registry shared with the command router
    registry: SharedRegistry,

    /// Builds a client per panel
    factory: Arc<dyn ClientFactory>,

    config: ManagerConfig,

    /// Migration chain applied to stored configuration
    migrator: Migrator,

    /// Serializes create/update/destroy
    lifecycle_lock: Mutex<()>,

    /// Event fan-out, events without subscribers are dropped
    event_tx: broadcast::Sender<ConnectionEvent>,
}

impl LifecycleManager {
    /// Create a lifecycle manager over a shared registry
    pub fn new(
        registry: SharedRegistry,
        factory: Arc<dyn ClientFactory>,
        config: ManagerConfig,
    ) -> Self {
        let (event_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);

        Self {
            registry,
            factory,
            config,
            migrator: Migrator::default(),
            lifecycle_lock: Mutex::new(()),
            event_tx,
        }
    }

    /// Replace the migration chain
    pub fn with_migrator(mut self, migrator: Migrator) -> Self {
        self.migrator = migrator;
        self
    }

    /// Shared registry handle
    pub fn registry(&self) -> SharedRegistry {
        Arc::clone(&self.registry)
    }

    pub fn config(&self) -> &ManagerConfig {
        &self.config
    }

    /// Subscribe to connection events
    ///
    /// Every subscriber sees every event sent after it subscribed. A
    /// subscriber that falls more than [`EVENT_CHANNEL_CAPACITY`] events
    /// behind skips the oldest ones.
    pub fn subscribe(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.event_tx.subscribe()
    }

    /// Create and register a connection
    ///
    /// Fails with `DuplicatePanel` when the merged configuration names a
    /// panel that already has a connection, and with `NotReady` when the
    /// client could not reach the panel. Nothing is registered on failure,
    /// so the same call can simply be retried.
    pub async fn create(
        &self,
        id: ConnectionId,
        base: &ConfigMap,
        overrides: &ConfigMap,
    ) -> Result<ConnectionId> {
        let _guard = self.lifecycle_lock.lock().await;
        self.create_locked(id, base, overrides).await
    }

    async fn create_locked(
        &self,
        id: ConnectionId,
        base: &ConfigMap,
        overrides: &ConfigMap,
    ) -> Result<ConnectionId> {
        let merged = combine(base, overrides);
        let panel_id = panel_id_from(&merged)?;

        {
            let registry = self.registry.read().await;
            if registry.contains(&id) {
                warn!("Connection {} is already registered", id);
                return Err(LinkError::DuplicateId(id));
            }
            if registry.is_panel_id_taken(panel_id) {
                warn!(
                    "Refusing connection {}: panel {} is already configured",
                    id, panel_id
                );
                return Err(LinkError::DuplicatePanel(panel_id));
            }
        }

        debug!("Creating client for panel {} ({})", panel_id, id);
        let state = Arc::new(LifecycleCell::new());
        let client = self
            .factory
            .create_client(panel_id, &merged)
            .await
            .map_err(|e| {
                if e.is_recoverable() {
                    warn!("Panel {} not reachable yet: {}", panel_id, e);
                    LinkError::NotReady(e.to_string())
                } else {
                    error!("Failed to create client for panel {}: {}", panel_id, e);
                    e
                }
            })?;

        if client.panel_id() != panel_id {
            warn!(
                "Client for panel {} reports panel {}",
                panel_id,
                client.panel_id()
            );
        }

        state
            .advance(LifecycleState::Connecting)
            .map_err(|current| {
                LinkError::InvalidState(format!("new connection {} is {}", id, current))
            })?;

        let mut connection = Connection::new(
            id.clone(),
            panel_id,
            Arc::clone(&client),
            Arc::clone(&state),
            base.clone(),
            overrides.clone(),
            merged,
        );

        let handle = self.spawn_session(id.clone(), panel_id, Arc::clone(&client), state);
        let abort = handle.abort_handle();
        connection.attach_task(TaskHandle::new(handle));

        let registered = self.registry.write().await.register(connection);
        if let Err(e) = registered {
            error!("Failed to register connection {}: {}", id, e);
            abort.abort();
            self.stop_client(&id, client.as_ref()).await;
            return Err(e);
        }

        info!("Connection {} registered for panel {}", id, panel_id);
        let _ = self.event_tx.send(ConnectionEvent::Registered {
            id: id.clone(),
            panel_id,
        });

        Ok(id)
    }

    /// Spawn the background task driving the client's connect sequence
    fn spawn_session(
        &self,
        id: ConnectionId,
        panel_id: PanelId,
        client: Arc<dyn PanelClient>,
        state: Arc<LifecycleCell>,
    ) -> JoinHandle<()> {
        let reporter = SessionReporter::new(id.clone(), panel_id, state, self.event_tx.clone());
        let event_tx = self.event_tx.clone();

        tokio::spawn(async move {
            let error = match client.connect(reporter).await {
                Ok(()) => {
                    debug!("Connect sequence for panel {} ended", panel_id);
                    None
                }
                Err(e) => {
                    error!("Connect sequence for panel {} failed: {}", panel_id, e);
                    Some(e.to_string())
                }
            };

            let _ = event_tx.send(ConnectionEvent::TaskFinished { id, error });
        })
    }

    /// Push new override configuration into a live connection
    ///
    /// An unknown id is not an error: there is nothing to update. The panel
    /// number of a live connection cannot change.
    pub async fn update(&self, id: &ConnectionId, overrides: &ConfigMap) -> Result<()> {
        let _guard = self.lifecycle_lock.lock().await;

        let mut registry = self.registry.write().await;
        let Some(connection) = registry.lookup_mut(id) else {
            debug!("Update for unknown connection {}, nothing to do", id);
            return Ok(());
        };

        let merged = combine(connection.base_config(), overrides);
        let requested = panel_id_from(&merged)?;
        if requested != connection.panel_id() {
            warn!(
                "Connection {} asked to move from panel {} to panel {}",
                id,
                connection.panel_id(),
                requested
            );
            return Err(LinkError::PanelIdentityChangeUnsupported {
                current: connection.panel_id(),
                requested,
            });
        }

        connection.client().update_config(&merged)?;
        connection.replace_config(overrides.clone(), merged);

        info!(
            "Updated configuration of connection {} (panel {})",
            id,
            connection.panel_id()
        );
        let _ = self.event_tx.send(ConnectionEvent::Reconfigured {
            id: id.clone(),
            panel_id: connection.panel_id(),
        });

        Ok(())
    }

    /// Tear a connection down and remove it
    ///
    /// The client is stopped before its task is cancelled. Once this returns
    /// the panel number is free for a new connection.
    pub async fn destroy(&self, id: &ConnectionId) -> Result<()> {
        let _guard = self.lifecycle_lock.lock().await;
        self.destroy_locked(id).await
    }

    async fn destroy_locked(&self, id: &ConnectionId) -> Result<()> {
        let (client, panel_id) = {
            let registry = self.registry.read().await;
            let connection = registry
                .lookup(id)
                .ok_or_else(|| LinkError::NotFound(id.clone()))?;

            if let Err(current) = connection.lifecycle().advance(LifecycleState::Draining) {
                warn!("Connection {} is {} at teardown", id, current);
            }
            (connection.client(), connection.panel_id())
        };

        info!("Stopping connection {} (panel {})", id, panel_id);
        self.stop_client(id, client.as_ref()).await;

        let removed = {
            let mut registry = self.registry.write().await;
            if let Some(connection) = registry.lookup_mut(id) {
                connection.cancel_task();
                if let Err(current) = connection.lifecycle().advance(LifecycleState::Terminated) {
                    warn!("Connection {} is {} at removal", id, current);
                }
            }
            registry.remove(id)
        };

        if removed.is_some() {
            info!("Connection {} removed, panel {} is free", id, panel_id);
            let _ = self.event_tx.send(ConnectionEvent::Removed {
                id: id.clone(),
                panel_id,
            });
        }

        Ok(())
    }

    /// Graceful stop bounded by the configured timeout
    async fn stop_client(&self, id: &ConnectionId, client: &dyn PanelClient) {
        match tokio::time::timeout(self.config.stop_timeout, client.stop_all()).await {
            Ok(Ok(())) => debug!("Client of connection {} stopped", id),
            Ok(Err(e)) => warn!("Client of connection {} failed to stop cleanly: {}", id, e),
            Err(_) => warn!(
                "Client of connection {} did not stop within {:?}, cancelling",
                id, self.config.stop_timeout
            ),
        }
    }

    /// Migrate stored data, then combine it with override data
    pub fn migrate_and_combine(
        &self,
        stored_version: u32,
        data: &ConfigMap,
        overrides: &ConfigMap,
    ) -> Result<(u32, ConfigMap)> {
        self.migrator
            .migrate_and_combine(stored_version, data, overrides)
    }

    /// A configuration entry was added or loaded
    pub async fn on_connection_configured(
        &self,
        id: ConnectionId,
        base: &ConfigMap,
        overrides: &ConfigMap,
    ) -> Result<ConnectionId> {
        self.create(id, base, overrides).await
    }

    /// Set up a persisted entry
    ///
    /// Migrates the entry in place, creates its connection and then refreshes
    /// the entry the way the host shows it: title `Panel <n>` and options set
    /// to the merged configuration. A migration failure only affects this
    /// entry.
    pub async fn setup_entry(&self, entry: &mut ConfigEntry) -> Result<ConnectionId> {
        if self.migrator.migrate_entry(entry)? {
            info!(
                "Entry {} migrated to version {}",
                entry.entry_id, entry.version
            );
        }

        let id = self
            .create(entry.entry_id.clone(), &entry.data, &entry.options)
            .await?;

        let registry = self.registry.read().await;
        if let Some(connection) = registry.lookup(&id) {
            entry.title = ConfigEntry::title_for(connection.panel_id());
            entry.options = connection.config().clone();
        }

        Ok(id)
    }

    /// The options of an entry changed
    pub async fn on_connection_reconfigured(
        &self,
        id: &ConnectionId,
        overrides: &ConfigMap,
    ) -> Result<()> {
        self.update(id, overrides).await
    }

    /// An entry was removed
    pub async fn on_connection_removed(&self, id: &ConnectionId) -> Result<()> {
        self.destroy(id).await
    }

    /// Tear a connection down and create it again from its stored configuration
    pub async fn reload(&self, id: &ConnectionId) -> Result<ConnectionId> {
        let _guard = self.lifecycle_lock.lock().await;

        let (base, overrides) = {
            let registry = self.registry.read().await;
            let connection = registry
                .lookup(id)
                .ok_or_else(|| LinkError::NotFound(id.clone()))?;
            (
                connection.base_config().clone(),
                connection.override_config().clone(),
            )
        };

        info!("Reloading connection {}", id);
        self.destroy_locked(id).await?;
        self.create_locked(id.clone(), &base, &overrides).await
    }

    /// Destroy every registered connection
    pub async fn shutdown(&self) {
        let ids: Vec<ConnectionId> = self.registry.read().await.ids().cloned().collect();
        info!("Shutting down {} connection(s)", ids.len());

        for id in ids {
            match self.destroy(&id).await {
                Ok(()) | Err(LinkError::NotFound(_)) => {}
                Err(e) => error!("Failed to stop connection {}: {}", id, e),
            }
        }
    }

    /// Snapshot of one connection
    pub async fn connection(&self, id: &ConnectionId) -> Option<ConnectionInfo> {
        self.registry.read().await.lookup(id).map(Connection::info)
    }

    /// Snapshot of the connection owning a panel
    pub async fn connection_for_panel(&self, panel_id: PanelId) -> Option<ConnectionInfo> {
        self.registry
            .read()
            .await
            .lookup_by_panel(panel_id)
            .map(Connection::info)
    }

    /// Snapshots of all connections
    pub async fn connections(&self) -> Vec<ConnectionInfo> {
        self.registry.read().await.snapshot()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::ConnectionRegistry;
    use crate::test_utils::{MockCall, MockFactory};
    use serde_json::json;

    fn map(value: serde_json::Value) -> ConfigMap {
        serde_json::from_value(value).unwrap()
    }

    fn panel(n: u32) -> ConfigMap {
        map(json!({ "panel_number": n }))
    }

    fn manager(factory: Arc<MockFactory>) -> LifecycleManager {
        LifecycleManager::new(ConnectionRegistry::shared(), factory, ManagerConfig::default())
    }

    #[tokio::test]
    async fn test_create_registers_connection() {
        let factory = MockFactory::new();
        let manager = manager(factory.clone());

        let id = manager
            .create("e1".into(), &ConfigMap::new(), &panel(3))
            .await
            .unwrap();
        assert_eq!(id, ConnectionId::from("e1"));

        let info = manager.connection_for_panel(PanelId(3)).await.unwrap();
        assert_eq!(info.id, id);
        assert_eq!(info.panel_id, PanelId(3));
        assert_eq!(factory.created(), 1);
    }

    #[tokio::test]
    async fn test_create_defaults_to_panel_zero() {
        let manager = manager(MockFactory::new());

        manager
            .create("e1".into(), &ConfigMap::new(), &ConfigMap::new())
            .await
            .unwrap();
        assert!(manager.connection_for_panel(PanelId(0)).await.is_some());
    }

    #[tokio::test]
    async fn test_duplicate_panel_never_builds_client() {
        let factory = MockFactory::new();
        let manager = manager(factory.clone());

        manager
            .create("e1".into(), &panel(1), &ConfigMap::new())
            .await
            .unwrap();
        let err = manager
            .create("e2".into(), &ConfigMap::new(), &panel(1))
            .await
            .unwrap_err();

        assert!(matches!(err, LinkError::DuplicatePanel(PanelId(1))));
        assert_eq!(factory.created(), 1);
        assert!(manager.connection(&"e2".into()).await.is_none());
    }

    #[tokio::test]
    async fn test_duplicate_id_rejected() {
        let manager = manager(MockFactory::new());

        manager
            .create("e1".into(), &panel(1), &ConfigMap::new())
            .await
            .unwrap();
        let err = manager
            .create("e1".into(), &panel(2), &ConfigMap::new())
            .await
            .unwrap_err();
        assert!(matches!(err, LinkError::DuplicateId(_)));
    }

    #[tokio::test]
    async fn test_transport_failure_is_not_ready_and_retryable() {
        let factory = MockFactory::new();
        factory.fail_next(LinkError::ConnectionRefused("adapter offline".to_string()));
        let manager = manager(factory.clone());

        let err = manager
            .create("e1".into(), &panel(2), &ConfigMap::new())
            .await
            .unwrap_err();
        assert!(matches!(err, LinkError::NotReady(_)));
        assert!(manager.connections().await.is_empty());

        manager
            .create("e1".into(), &panel(2), &ConfigMap::new())
            .await
            .unwrap();
        assert_eq!(manager.connections().await.len(), 1);
    }

    #[tokio::test]
    async fn test_configuration_failure_passes_through() {
        let factory = MockFactory::new();
        factory.fail_next(LinkError::Configuration("no host".to_string()));
        let manager = manager(factory);

        let err = manager
            .create("e1".into(), &panel(2), &ConfigMap::new())
            .await
            .unwrap_err();
        assert!(matches!(err, LinkError::Configuration(_)));
    }

    #[tokio::test]
    async fn test_session_becomes_active() {
        let factory = MockFactory::new();
        let manager = manager(factory.clone());
        let mut events = manager.subscribe();

        manager
            .create("e1".into(), &panel(4), &ConfigMap::new())
            .await
            .unwrap();

        let mut saw_active = false;
        while let Ok(Ok(event)) =
            tokio::time::timeout(Duration::from_secs(1), events.recv()).await
        {
            if matches!(event, ConnectionEvent::SessionActive { .. }) {
                saw_active = true;
                break;
            }
        }
        assert!(saw_active);
        assert_eq!(
            manager.connection(&"e1".into()).await.unwrap().state,
            LifecycleState::Active
        );
    }

    #[tokio::test]
    async fn test_every_subscriber_sees_events() {
        let manager = manager(MockFactory::new());
        let mut first = manager.subscribe();
        let mut second = manager.subscribe();

        manager
            .create("e1".into(), &panel(1), &ConfigMap::new())
            .await
            .unwrap();

        for events in [&mut first, &mut second] {
            let event = tokio::time::timeout(Duration::from_millis(500), events.recv())
                .await
                .unwrap()
                .unwrap();
            assert_eq!(
                event,
                ConnectionEvent::Registered {
                    id: "e1".into(),
                    panel_id: PanelId(1)
                }
            );
        }
    }

    #[tokio::test]
    async fn test_events_without_subscribers_are_dropped() {
        let factory = MockFactory::new();
        let manager = manager(factory.clone());

        for round in 0..3 {
            manager
                .create("e1".into(), &panel(1), &ConfigMap::new())
                .await
                .unwrap();
            manager.destroy(&"e1".into()).await.unwrap();
            assert_eq!(round + 1, factory.created());
        }

        // a late subscriber only sees what happens after it subscribed
        let mut events = manager.subscribe();
        assert!(matches!(
            events.try_recv(),
            Err(broadcast::error::TryRecvError::Empty)
        ));
    }

    #[tokio::test]
    async fn test_update_pushes_merged_config() {
        let factory = MockFactory::new();
        let manager = manager(factory.clone());

        let base = map(json!({"panel_number": 2, "host": "10.0.0.5", "port": 30000}));
        manager
            .create("e1".into(), &base, &ConfigMap::new())
            .await
            .unwrap();

        manager
            .update(&"e1".into(), &map(json!({"port": 10628})))
            .await
            .unwrap();

        let client = factory.client(PanelId(2)).unwrap();
        client.wait_for(MockCall::Connect).await;

        let pushed = client.configs();
        assert_eq!(pushed.len(), 1);
        assert_eq!(pushed[0]["port"], json!(10628));
        assert_eq!(pushed[0]["host"], json!("10.0.0.5"));
        // the session task was not restarted
        assert_eq!(client.count(MockCall::Connect), 1);
    }

    #[tokio::test]
    async fn test_update_unknown_id_is_noop() {
        let manager = manager(MockFactory::new());
        manager
            .update(&"missing".into(), &panel(1))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_update_rejects_panel_change() {
        let factory = MockFactory::new();
        let manager = manager(factory.clone());

        manager
            .create("e1".into(), &panel(1), &ConfigMap::new())
            .await
            .unwrap();
        let err = manager.update(&"e1".into(), &panel(2)).await.unwrap_err();

        assert!(matches!(
            err,
            LinkError::PanelIdentityChangeUnsupported {
                current: PanelId(1),
                requested: PanelId(2)
            }
        ));
        assert!(factory.client(PanelId(1)).unwrap().configs().is_empty());
    }

    #[tokio::test]
    async fn test_destroy_stops_before_cancelling() {
        let factory = MockFactory::new();
        let manager = manager(factory.clone());

        manager
            .create("e1".into(), &panel(1), &ConfigMap::new())
            .await
            .unwrap();
        let client = factory.client(PanelId(1)).unwrap();
        client.wait_for(MockCall::Connect).await;

        manager.destroy(&"e1".into()).await.unwrap();
        client.wait_for(MockCall::Cancelled).await;

        let calls = client.calls();
        let stop = calls.iter().position(|c| *c == MockCall::StopAll).unwrap();
        let cancelled = calls.iter().position(|c| *c == MockCall::Cancelled).unwrap();
        assert!(stop < cancelled);
        assert!(manager.connection(&"e1".into()).await.is_none());
        assert!(manager.connection_for_panel(PanelId(1)).await.is_none());
    }

    #[tokio::test]
    async fn test_destroy_bounded_by_stop_timeout() {
        let factory = MockFactory::new();
        factory.set_stop_delay(Duration::from_secs(60));
        let manager = LifecycleManager::new(
            ConnectionRegistry::shared(),
            factory,
            ManagerConfig {
                stop_timeout: Duration::from_millis(50),
            },
        );

        manager
            .create("e1".into(), &panel(1), &ConfigMap::new())
            .await
            .unwrap();
        tokio::time::timeout(Duration::from_secs(5), manager.destroy(&"e1".into()))
            .await
            .expect("destroy hung on a stuck client")
            .unwrap();
        assert!(manager.connections().await.is_empty());
    }

    #[tokio::test]
    async fn test_destroy_twice_is_not_found() {
        let manager = manager(MockFactory::new());

        manager
            .create("e1".into(), &panel(1), &ConfigMap::new())
            .await
            .unwrap();
        manager.destroy(&"e1".into()).await.unwrap();
        let err = manager.destroy(&"e1".into()).await.unwrap_err();
        assert!(matches!(err, LinkError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_setup_entry_migrates_and_refreshes() {
        let manager = manager(MockFactory::new());

        let mut entry = ConfigEntry::new(
            "e1",
            map(json!({"panel_number": 6, "force_standard": true})),
        );
        entry.version = 1;
        entry.options = map(json!({"motion_off": 120}));

        manager.setup_entry(&mut entry).await.unwrap();
        assert_eq!(entry.version, 2);
        assert_eq!(entry.title, "Panel 6");
        assert_eq!(entry.options["emulation_mode"], json!("Standard"));
        assert_eq!(entry.options["motion_off"], json!(120));
    }

    #[tokio::test]
    async fn test_setup_entry_malformed_registers_nothing() {
        let factory = MockFactory::new();
        let manager = manager(factory.clone());

        let mut entry = ConfigEntry::new("e1", map(json!({"panel_number": 6})));
        entry.version = 1;

        let err = manager.setup_entry(&mut entry).await.unwrap_err();
        assert!(matches!(err, LinkError::MalformedLegacyConfig(_)));
        assert_eq!(factory.created(), 0);
        assert!(manager.connections().await.is_empty());
    }

    #[tokio::test]
    async fn test_reload_recreates_connection() {
        let factory = MockFactory::new();
        let manager = manager(factory.clone());

        manager
            .create("e1".into(), &panel(3), &ConfigMap::new())
            .await
            .unwrap();
        manager.reload(&"e1".into()).await.unwrap();

        assert_eq!(factory.created(), 2);
        assert_eq!(
            manager.connection_for_panel(PanelId(3)).await.unwrap().id,
            ConnectionId::from("e1")
        );
    }

    #[tokio::test]
    async fn test_shutdown_destroys_all() {
        let manager = manager(MockFactory::new());

        for n in 0..3 {
            manager
                .create(format!("e{}", n).into(), &panel(n), &ConfigMap::new())
                .await
                .unwrap();
        }
        manager.shutdown().await;
        assert!(manager.connections().await.is_empty());
    }
}
