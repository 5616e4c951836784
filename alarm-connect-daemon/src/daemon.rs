//! Daemon
//!
//! Wires the entries file, the lifecycle manager and the command router
//! together and runs the control loop.

use crate::config::Config;
use crate::control::{ControlAction, ControlRequest, ControlResponse};
use crate::entries::{EntryChanges, EntryStore};
use crate::error_handler::ErrorHandler;
use crate::recovery::ReconnectionStrategy;
use crate::tcp_client::TcpClientFactory;
use alarm_connect_core::{
    ClientFactory, CommandRouter, ConfigEntry, ConnectionEvent, ConnectionId, ConnectionRegistry,
    EntityDirectory, LifecycleManager, LinkError, LogNotifier, Notifier, PanelId, ServiceCall,
    TargetDescriptor,
};
use anyhow::{Context, Result};
use futures::future::join_all;
use std::collections::HashSet;
use std::io;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader, Lines, Stdin};
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

/// Entity id under which a panel's alarm control panel is addressed
pub fn panel_entity(panel_id: PanelId) -> TargetDescriptor {
    TargetDescriptor::new(format!("alarm_control_panel.alarm_panel_{}", panel_id))
}

/// What woke the control loop
enum Step {
    Shutdown(io::Result<()>),
    ReloadSignal,
    Control(io::Result<Option<String>>),
    Event(std::result::Result<ConnectionEvent, RecvError>),
    RetryUnready,
}

/// How setting up one entry ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SetupOutcome {
    Connected,
    /// The panel was not reachable, setup is tried again later
    NotReady,
    Failed,
}

/// Reload requests delivered as SIGHUP
struct ReloadSignal {
    #[cfg(unix)]
    hangup: tokio::signal::unix::Signal,
}

impl ReloadSignal {
    fn new() -> Result<Self> {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};
            let hangup = signal(SignalKind::hangup()).context("Failed to listen for SIGHUP")?;
            Ok(Self { hangup })
        }
        #[cfg(not(unix))]
        {
            Ok(Self {})
        }
    }

    async fn recv(&mut self) {
        #[cfg(unix)]
        {
            if self.hangup.recv().await.is_some() {
                return;
            }
        }
        std::future::pending::<()>().await
    }
}

async fn next_control_line(
    control: &mut Option<Lines<BufReader<Stdin>>>,
) -> io::Result<Option<String>> {
    match control {
        Some(lines) => lines.next_line().await,
        None => std::future::pending().await,
    }
}

/// Alarm panel daemon
pub struct Daemon {
    config: Config,
    entries: EntryStore,
    manager: Arc<LifecycleManager>,
    router: Arc<CommandRouter>,
    directory: Arc<EntityDirectory>,
    error_handler: ErrorHandler,
    events: Option<broadcast::Receiver<ConnectionEvent>>,
    /// Entries whose last setup failed with `NotReady`
    unready: HashSet<ConnectionId>,
}

impl Daemon {
    /// Create a daemon talking to panels over TCP
    pub async fn new(config: Config) -> Result<Self> {
        let factory = Arc::new(TcpClientFactory::new(&config.link));
        Self::with_factory(config, factory, Arc::new(LogNotifier)).await
    }

    /// Create a daemon with its own client factory and notifier
    pub async fn with_factory(
        config: Config,
        factory: Arc<dyn ClientFactory>,
        notifier: Arc<dyn Notifier>,
    ) -> Result<Self> {
        let entries = EntryStore::load(&config.paths.entries_file)
            .context("Failed to load panel entries")?;
        info!(
            "Loaded {} panel entries from {}",
            entries.entries().len(),
            entries.path().display()
        );

        let registry = ConnectionRegistry::shared();
        let manager = Arc::new(LifecycleManager::new(
            registry.clone(),
            factory,
            config.manager_config(),
        ));
        let directory = Arc::new(EntityDirectory::new());
        let router = Arc::new(CommandRouter::new(
            registry,
            directory.clone(),
            notifier.clone(),
        ));
        let events = manager.subscribe();

        Ok(Self {
            config,
            entries,
            manager,
            router,
            directory,
            error_handler: ErrorHandler::new(notifier),
            events: Some(events),
            unready: HashSet::new(),
        })
    }

    /// Set up every stored entry
    ///
    /// Entries are set up concurrently. Entries that fail stay in the file
    /// and are not connected. Entries that were not ready are tried again
    /// from the control loop.
    pub async fn start(&mut self) -> Result<()> {
        let pending: Vec<ConfigEntry> = self.entries.entries().to_vec();
        let total = pending.len();

        let setup = self.config.setup.clone();
        let connected = self.set_up(pending, || setup.strategy()).await?;

        info!("{}/{} panels set up", connected, total);
        Ok(())
    }

    /// Set up `pending` entries concurrently and store the results
    ///
    /// Returns how many were connected.
    async fn set_up<F>(&mut self, pending: Vec<ConfigEntry>, strategy: F) -> Result<usize>
    where
        F: Fn() -> ReconnectionStrategy,
    {
        let this = &*self;
        let setups = pending
            .into_iter()
            .map(|entry| this.setup_with_retry(entry, strategy()));
        let results = join_all(setups).await;

        let mut connected = 0;
        for (entry, outcome) in results {
            match outcome {
                SetupOutcome::Connected => {
                    connected += 1;
                    self.unready.remove(&entry.entry_id);
                }
                SetupOutcome::NotReady => {
                    self.unready.insert(entry.entry_id.clone());
                }
                SetupOutcome::Failed => {
                    self.unready.remove(&entry.entry_id);
                }
            }
            self.entries.upsert(entry);
        }
        self.entries.save().context("Failed to save panel entries")?;

        Ok(connected)
    }

    /// Try the entries that were not ready once more
    ///
    /// Returns how many were connected.
    pub async fn retry_unready(&mut self) -> Result<usize> {
        let mut pending = Vec::new();
        for id in &self.unready {
            let Some(entry) = self.entries.get(id) else {
                continue;
            };
            if self.manager.connection(id).await.is_none() {
                pending.push(entry.clone());
            }
        }
        self.unready = pending.iter().map(|entry| entry.entry_id.clone()).collect();
        if pending.is_empty() {
            return Ok(0);
        }

        debug!("Retrying {} entries that were not ready", pending.len());
        let single_attempt = || ReconnectionStrategy::new(Duration::ZERO, Duration::ZERO, 0);
        self.set_up(pending, single_attempt).await
    }

    /// Delay between retries of entries that were not ready
    fn unready_retry_period(&self) -> Duration {
        Duration::from_secs(self.config.setup.max_delay_secs.max(1))
    }

    /// Set up one entry, retrying while the panel is not ready
    ///
    /// Returns the entry as it should be stored and how the setup ended.
    async fn setup_with_retry(
        &self,
        mut entry: ConfigEntry,
        mut strategy: ReconnectionStrategy,
    ) -> (ConfigEntry, SetupOutcome) {
        loop {
            match self.manager.setup_entry(&mut entry).await {
                Ok(id) => {
                    if let Some(info) = self.manager.connection(&id).await {
                        self.directory
                            .register(panel_entity(info.panel_id), info.panel_id)
                            .await;
                    }
                    return (entry, SetupOutcome::Connected);
                }
                Err(e) => {
                    let retry = self.error_handler.handle_error(
                        &e,
                        "setting up entry",
                        Some(&entry.entry_id),
                    );
                    if !retry || !matches!(e, LinkError::NotReady(_)) {
                        return (entry, SetupOutcome::Failed);
                    }

                    let Some(delay) = strategy.next_delay() else {
                        info!(
                            "Entry {} not ready after {} retries, trying again later",
                            entry.entry_id, strategy.attempt
                        );
                        return (entry, SetupOutcome::NotReady);
                    };
                    info!(
                        "Retrying entry {} in {:?} ({})",
                        entry.entry_id,
                        delay,
                        strategy.status()
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    async fn remove_entry(&mut self, id: &ConnectionId) {
        self.unready.remove(id);
        if let Some(info) = self.manager.connection(id).await {
            self.directory.unregister_panel(info.panel_id).await;
        }

        match self.manager.on_connection_removed(id).await {
            Ok(()) | Err(LinkError::NotFound(_)) => {}
            Err(e) => {
                self.error_handler
                    .handle_error(&e, "removing entry", Some(id));
            }
        }
    }

    /// Re-read the entries file and apply what changed
    ///
    /// Stored entries that still have no connection are set up again too.
    pub async fn reload_entries(&mut self) -> Result<()> {
        let loaded = EntryStore::load(self.entries.path()).context("Failed to reload entries")?;
        let changes = EntryChanges::between(self.entries.entries(), loaded.entries());

        if changes.is_empty() {
            info!("Panel entries unchanged");
        } else {
            info!(
                "Applying entry changes: {} added, {} removed, {} replaced, {} reconfigured",
                changes.added.len(),
                changes.removed.len(),
                changes.replaced.len(),
                changes.reconfigured.len()
            );
        }

        for id in &changes.removed {
            self.remove_entry(id).await;
            self.entries.remove(id);
        }
        for entry in &changes.replaced {
            self.remove_entry(&entry.entry_id).await;
        }
        for entry in changes.reconfigured {
            if let Err(e) = self
                .manager
                .on_connection_reconfigured(&entry.entry_id, &entry.options)
                .await
            {
                self.error_handler
                    .handle_error(&e, "reconfiguring entry", Some(&entry.entry_id));
            }
            self.entries.upsert(entry);
        }

        let mut pending: Vec<ConfigEntry> = changes
            .replaced
            .into_iter()
            .chain(changes.added)
            .collect();
        for entry in self.entries.entries() {
            if pending.iter().any(|p| p.entry_id == entry.entry_id) {
                continue;
            }
            if self.manager.connection(&entry.entry_id).await.is_none() {
                info!("Entry {} has no connection, setting it up again", entry.entry_id);
                pending.push(entry.clone());
            }
        }

        if pending.is_empty() {
            return Ok(());
        }
        let setup = self.config.setup.clone();
        self.set_up(pending, || setup.strategy()).await?;

        Ok(())
    }

    /// Recreate every connection from its stored configuration
    pub async fn restart_connections(&self) -> usize {
        let mut restarted = 0;
        for info in self.manager.connections().await {
            match self.manager.reload(&info.id).await {
                Ok(_) => restarted += 1,
                Err(e) => {
                    self.directory.unregister_panel(info.panel_id).await;
                    self.error_handler
                        .handle_error(&e, "restarting connection", Some(&info.id));
                }
            }
        }
        restarted
    }

    /// Handle one line of control input
    pub async fn handle_control_line(&mut self, line: &str) -> Option<ControlResponse> {
        let request = match ControlRequest::parse(line) {
            Ok(Some(request)) => request,
            Ok(None) => return None,
            Err(e) => {
                warn!("Invalid control request: {}", e);
                return Some(ControlResponse::Error {
                    error: format!("invalid request: {}", e),
                });
            }
        };

        let response = match request {
            ControlRequest::Service(call) => self.dispatch(call),
            ControlRequest::Action {
                action: ControlAction::Status,
                ..
            } => ControlResponse::Status {
                connections: self.manager.connections().await,
            },
            ControlRequest::Action {
                action: ControlAction::Reload,
                entry_id: Some(id),
            } => match self.manager.reload(&id).await {
                Ok(id) => ControlResponse::Done {
                    done: format!("reloaded {}", id),
                },
                Err(e) => {
                    self.error_handler
                        .handle_error(&e, "reloading connection", Some(&id));
                    ControlResponse::Error {
                        error: e.to_string(),
                    }
                }
            },
            ControlRequest::Action {
                action: ControlAction::Restart,
                ..
            } => ControlResponse::Done {
                done: format!("restarted {} connections", self.restart_connections().await),
            },
            ControlRequest::Action {
                action: ControlAction::Reload,
                entry_id: None,
            } => match self.reload_entries().await {
                Ok(()) => ControlResponse::Done {
                    done: "reloaded entries".to_string(),
                },
                Err(e) => {
                    error!("Reload failed: {:#}", e);
                    ControlResponse::Error {
                        error: format!("{:#}", e),
                    }
                }
            },
        };

        Some(response)
    }

    /// Hand a service call to the router without waiting for it
    fn dispatch(&self, call: ServiceCall) -> ControlResponse {
        let accepted = call.label().to_string();
        let router = self.router.clone();
        tokio::spawn(async move {
            router.dispatch(&call).await;
        });
        ControlResponse::Accepted { accepted }
    }

    fn handle_event(&self, event: ConnectionEvent) {
        match event {
            ConnectionEvent::Registered { id, panel_id } => {
                debug!("Connection {} registered for panel {}", id, panel_id)
            }
            ConnectionEvent::SessionActive { id, panel_id } => {
                info!("Panel {} connected ({})", panel_id, id)
            }
            ConnectionEvent::SessionLost {
                id,
                panel_id,
                reason,
            } => warn!(
                "Panel {} lost its session ({}): {}",
                panel_id,
                id,
                reason.as_deref().unwrap_or("no reason given")
            ),
            ConnectionEvent::Reconfigured { id, panel_id } => {
                info!("Panel {} reconfigured ({})", panel_id, id)
            }
            ConnectionEvent::TaskFinished { id, error: Some(e) } => {
                error!("Connection {} stopped: {}", id, e)
            }
            ConnectionEvent::TaskFinished { id, error: None } => {
                warn!("Connection {} stopped on its own", id)
            }
            ConnectionEvent::Removed { id, panel_id } => {
                info!("Panel {} released ({})", panel_id, id)
            }
        }
    }

    /// Run until Ctrl+C
    pub async fn run(&mut self) -> Result<()> {
        let mut events = self
            .events
            .take()
            .context("Daemon control loop is already running")?;
        let mut reload = ReloadSignal::new()?;
        let mut control = self
            .config
            .control
            .stdin
            .then(|| BufReader::new(tokio::io::stdin()).lines());
        let period = self.unready_retry_period();
        let mut retry = interval_at(Instant::now() + period, period);
        retry.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!("Daemon running, press Ctrl+C to stop");

        loop {
            let step = tokio::select! {
                result = tokio::signal::ctrl_c() => Step::Shutdown(result),
                _ = reload.recv() => Step::ReloadSignal,
                line = next_control_line(&mut control) => Step::Control(line),
                event = events.recv() => Step::Event(event),
                _ = retry.tick(), if !self.unready.is_empty() => Step::RetryUnready,
            };

            match step {
                Step::Shutdown(result) => {
                    result.context("Failed to listen for Ctrl+C")?;
                    info!("Received shutdown signal");
                    break;
                }
                Step::ReloadSignal => {
                    info!("Received SIGHUP, reloading entries");
                    if let Err(e) = self.reload_entries().await {
                        error!("Reload failed: {:#}", e);
                    }
                }
                Step::Control(Ok(Some(line))) => {
                    if let Some(response) = self.handle_control_line(&line).await {
                        println!("{}", response.to_line());
                    }
                }
                Step::Control(Ok(None)) => {
                    info!("Control input closed");
                    control = None;
                }
                Step::Control(Err(e)) => {
                    warn!("Failed to read control input: {}", e);
                    control = None;
                }
                Step::Event(Ok(event)) => self.handle_event(event),
                Step::Event(Err(RecvError::Lagged(skipped))) => {
                    warn!("Missed {} connection events", skipped)
                }
                Step::Event(Err(RecvError::Closed)) => {
                    warn!("Connection event stream closed");
                    events = self.manager.subscribe();
                }
                Step::RetryUnready => match self.retry_unready().await {
                    Ok(0) => {}
                    Ok(connected) => info!("{} entries connected on retry", connected),
                    Err(e) => error!("Retry failed: {:#}", e),
                },
            }
        }

        Ok(())
    }

    /// Stop every connection and persist the entries
    pub async fn shutdown(&mut self) -> Result<()> {
        info!("Shutting down daemon...");
        self.manager.shutdown().await;
        self.entries.save().context("Failed to save panel entries")?;
        info!("Daemon stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PathConfig;
    use alarm_connect_core::{
        ConfigMap, EventLogRequest, LifecycleState, Notification, PanelClient, PanelCommandRequest,
        ReconnectRequest, SensorBypassRequest, SensorImageRequest, SessionReporter,
    };
    use async_trait::async_trait;
    use serde_json::json;
    use std::fs;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;
    use tempfile::TempDir;

    struct QuietClient(PanelId);

    #[async_trait]
    impl PanelClient for QuietClient {
        fn panel_id(&self) -> PanelId {
            self.0
        }

        async fn connect(&self, reporter: SessionReporter) -> alarm_connect_core::Result<()> {
            reporter.session_established();
            std::future::pending().await
        }

        fn update_config(&self, _config: &ConfigMap) -> alarm_connect_core::Result<()> {
            Ok(())
        }

        async fn stop_all(&self) -> alarm_connect_core::Result<()> {
            Ok(())
        }

        async fn fetch_event_log(&self, _: &EventLogRequest) -> alarm_connect_core::Result<()> {
            Ok(())
        }

        async fn reconnect(&self, _: &ReconnectRequest) -> alarm_connect_core::Result<()> {
            Ok(())
        }

        async fn send_panel_command(
            &self,
            _: &PanelCommandRequest,
        ) -> alarm_connect_core::Result<()> {
            Ok(())
        }

        async fn set_sensor_bypass(&self, _: &SensorBypassRequest) -> alarm_connect_core::Result<()> {
            Ok(())
        }

        async fn request_sensor_image(
            &self,
            _: &SensorImageRequest,
        ) -> alarm_connect_core::Result<()> {
            Ok(())
        }
    }

    /// Fails the first `not_ready` builds with `NotReady`
    #[derive(Default)]
    struct QuietFactory {
        not_ready: AtomicUsize,
    }

    #[async_trait]
    impl ClientFactory for QuietFactory {
        async fn create_client(
            &self,
            panel_id: PanelId,
            _config: &ConfigMap,
        ) -> alarm_connect_core::Result<Arc<dyn PanelClient>> {
            let pending = self.not_ready.load(Ordering::SeqCst);
            if pending > 0 {
                self.not_ready.store(pending - 1, Ordering::SeqCst);
                return Err(LinkError::NotReady("adapter booting".to_string()));
            }
            Ok(Arc::new(QuietClient(panel_id)))
        }
    }

    #[derive(Default)]
    struct Messages(Mutex<Vec<String>>);

    impl Notifier for Messages {
        fn notify(&self, notification: Notification) {
            self.0.lock().unwrap().push(notification.message);
        }
    }

    fn config_in(dir: &TempDir) -> Config {
        let mut config = Config::default();
        config.paths = PathConfig::in_dir(dir.path().to_path_buf());
        config.setup.initial_delay_secs = 0;
        config.control.stdin = false;
        config
    }

    const ENTRIES: &str = r#"
        [[entry]]
        entry_id = "legacy"
        [entry.data]
        panel_number = 0
        host = "panel.lan"
        port = 10628
        force_standard = true

        [[entry]]
        entry_id = "second"
        version = 2
        [entry.data]
        panel_number = 1
        host = "garage.lan"
        port = 10628
    "#;

    async fn started(
        dir: &TempDir,
        factory: Arc<QuietFactory>,
    ) -> (Daemon, Arc<Messages>) {
        started_with(config_in(dir), factory).await
    }

    async fn started_with(config: Config, factory: Arc<QuietFactory>) -> (Daemon, Arc<Messages>) {
        fs::write(&config.paths.entries_file, ENTRIES).unwrap();

        let messages = Arc::new(Messages::default());
        let mut daemon = Daemon::with_factory(config, factory, messages.clone())
            .await
            .unwrap();
        daemon.start().await.unwrap();
        (daemon, messages)
    }

    #[tokio::test]
    async fn test_start_migrates_and_titles_entries() {
        let dir = TempDir::new().unwrap();
        let (daemon, _) = started(&dir, Arc::new(QuietFactory::default())).await;

        assert_eq!(daemon.manager.connections().await.len(), 2);

        let legacy = daemon.entries.get(&"legacy".into()).unwrap();
        assert_eq!(legacy.version, 2);
        assert_eq!(legacy.title, "Panel 0");
        assert_eq!(legacy.options["emulation_mode"], json!("Standard"));
        assert_eq!(legacy.data["emulation_mode"], json!("Standard"));

        // persisted as migrated
        let stored = EntryStore::load(daemon.entries.path()).unwrap();
        assert_eq!(stored.get(&"legacy".into()).unwrap().version, 2);
    }

    #[tokio::test]
    async fn test_start_retries_not_ready_panels() {
        let dir = TempDir::new().unwrap();
        let factory = Arc::new(QuietFactory {
            not_ready: AtomicUsize::new(2),
        });
        let (daemon, messages) = started(&dir, factory).await;

        assert_eq!(daemon.manager.connections().await.len(), 2);
        assert!(messages.0.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_duplicate_panel_entry_is_reported() {
        let dir = TempDir::new().unwrap();
        let config = config_in(&dir);
        fs::write(
            &config.paths.entries_file,
            r#"
            [[entry]]
            entry_id = "a"
            version = 2
            [entry.data]
            panel_number = 3
            [[entry]]
            entry_id = "b"
            version = 2
            [entry.data]
            panel_number = 3
            "#,
        )
        .unwrap();

        let messages = Arc::new(Messages::default());
        let mut daemon =
            Daemon::with_factory(config, Arc::new(QuietFactory::default()), messages.clone())
                .await
                .unwrap();
        daemon.start().await.unwrap();

        assert_eq!(daemon.manager.connections().await.len(), 1);
        let messages = messages.0.lock().unwrap();
        assert_eq!(messages.len(), 1);
        assert!(messages[0].contains("Panel Number 3 is not unique"));
        // both entries are kept
        assert_eq!(daemon.entries.entries().len(), 2);
    }

    #[tokio::test]
    async fn test_control_status_and_service_calls() {
        let dir = TempDir::new().unwrap();
        let (mut daemon, messages) = started(&dir, Arc::new(QuietFactory::default())).await;

        match daemon.handle_control_line(r#"{"action": "status"}"#).await {
            Some(ControlResponse::Status { connections }) => {
                assert_eq!(connections.len(), 2);
                assert!(connections
                    .iter()
                    .all(|c| c.state != LifecycleState::Terminated));
            }
            other => panic!("unexpected response: {:?}", other),
        }

        let response = daemon
            .handle_control_line(
                r#"{"service": "event_log", "entity_id": "alarm_control_panel.alarm_panel_7"}"#,
            )
            .await;
        assert_eq!(
            response,
            Some(ControlResponse::Accepted {
                accepted: "Event log".to_string()
            })
        );

        // the dispatch runs in the background
        tokio::time::timeout(Duration::from_secs(2), async {
            while messages.0.lock().unwrap().is_empty() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
        assert_eq!(
            messages.0.lock().unwrap()[0],
            "Event log failed - Panel not found"
        );

        assert!(matches!(
            daemon.handle_control_line("not json").await,
            Some(ControlResponse::Error { .. })
        ));
        assert_eq!(daemon.handle_control_line("").await, None);
    }

    #[tokio::test]
    async fn test_reload_single_connection() {
        let dir = TempDir::new().unwrap();
        let (mut daemon, _) = started(&dir, Arc::new(QuietFactory::default())).await;

        let response = daemon
            .handle_control_line(r#"{"action": "reload", "entry_id": "second"}"#)
            .await;
        assert!(matches!(response, Some(ControlResponse::Done { .. })));

        let response = daemon
            .handle_control_line(r#"{"action": "reload", "entry_id": "missing"}"#)
            .await;
        assert!(matches!(response, Some(ControlResponse::Error { .. })));
    }

    #[tokio::test]
    async fn test_restart_recreates_every_connection() {
        let dir = TempDir::new().unwrap();
        let (mut daemon, _) = started(&dir, Arc::new(QuietFactory::default())).await;
        let before = daemon.manager.connections().await;

        let response = daemon.handle_control_line(r#"{"action": "restart"}"#).await;
        assert_eq!(
            response,
            Some(ControlResponse::Done {
                done: "restarted 2 connections".to_string()
            })
        );

        let after = daemon.manager.connections().await;
        assert_eq!(after.len(), 2);
        assert_eq!(
            after.iter().map(|c| c.panel_id).collect::<Vec<_>>(),
            before.iter().map(|c| c.panel_id).collect::<Vec<_>>()
        );
    }

    #[tokio::test]
    async fn test_reload_entries_applies_changes() {
        let dir = TempDir::new().unwrap();
        let (mut daemon, _) = started(&dir, Arc::new(QuietFactory::default())).await;
        let path = daemon.entries.path().to_path_buf();

        // drop "second", add "third" on the panel number it released
        let mut store = EntryStore::load(&path).unwrap();
        store.remove(&"second".into());
        store.upsert(ConfigEntry::new(
            "third",
            serde_json::from_value(json!({"panel_number": 1, "host": "shed.lan", "port": 1}))
                .unwrap(),
        ));
        store.save().unwrap();

        daemon.reload_entries().await.unwrap();

        let connections = daemon.manager.connections().await;
        let ids: Vec<&str> = connections.iter().map(|c| c.id.as_str()).collect();
        assert_eq!(ids, vec!["legacy", "third"]);
        assert_eq!(
            daemon.entries.get(&"third".into()).unwrap().title,
            "Panel 1"
        );
        assert!(daemon.entries.get(&"second".into()).is_none());

        // nothing changed the second time
        daemon.reload_entries().await.unwrap();
        assert_eq!(daemon.manager.connections().await.len(), 2);
    }

    #[tokio::test]
    async fn test_shutdown_stops_everything() {
        let dir = TempDir::new().unwrap();
        let (mut daemon, _) = started(&dir, Arc::new(QuietFactory::default())).await;

        daemon.shutdown().await.unwrap();
        assert!(daemon.manager.connections().await.is_empty());
    }

    /// Config whose setup gives up after one retry
    fn impatient_config(dir: &TempDir) -> Config {
        let mut config = config_in(dir);
        config.setup.max_attempts = 1;
        config
    }

    #[tokio::test]
    async fn test_reload_sets_up_entries_left_unconnected() {
        let dir = TempDir::new().unwrap();
        let factory = Arc::new(QuietFactory {
            not_ready: AtomicUsize::new(usize::MAX),
        });
        let (mut daemon, messages) = started_with(impatient_config(&dir), factory.clone()).await;

        assert!(daemon.manager.connections().await.is_empty());
        assert_eq!(daemon.unready.len(), 2);
        assert!(messages.0.lock().unwrap().is_empty());

        // entries file is unchanged, the panels came up in the meantime
        factory.not_ready.store(0, Ordering::SeqCst);
        daemon.reload_entries().await.unwrap();

        assert_eq!(daemon.manager.connections().await.len(), 2);
        assert!(daemon.unready.is_empty());
    }

    #[tokio::test]
    async fn test_retry_unready_connects_recovered_panels() {
        let dir = TempDir::new().unwrap();
        let factory = Arc::new(QuietFactory {
            not_ready: AtomicUsize::new(usize::MAX),
        });
        let (mut daemon, _) = started_with(impatient_config(&dir), factory.clone()).await;
        assert!(daemon.manager.connections().await.is_empty());

        // still down: both stay queued
        assert_eq!(daemon.retry_unready().await.unwrap(), 0);
        assert_eq!(daemon.unready.len(), 2);

        // one more failure, then the panels answer
        factory.not_ready.store(1, Ordering::SeqCst);
        assert_eq!(daemon.retry_unready().await.unwrap(), 1);
        assert_eq!(daemon.unready.len(), 1);

        assert_eq!(daemon.retry_unready().await.unwrap(), 1);
        assert!(daemon.unready.is_empty());
        assert_eq!(daemon.manager.connections().await.len(), 2);

        // nothing left to retry
        assert_eq!(daemon.retry_unready().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_removed_entry_is_not_retried() {
        let dir = TempDir::new().unwrap();
        let factory = Arc::new(QuietFactory {
            not_ready: AtomicUsize::new(usize::MAX),
        });
        let (mut daemon, _) = started_with(impatient_config(&dir), factory.clone()).await;
        assert_eq!(daemon.unready.len(), 2);

        let mut store = EntryStore::load(daemon.entries.path()).unwrap();
        store.remove(&"legacy".into());
        store.save().unwrap();
        daemon.reload_entries().await.unwrap();
        assert!(!daemon.unready.contains(&ConnectionId::from("legacy")));

        factory.not_ready.store(0, Ordering::SeqCst);
        assert_eq!(daemon.retry_unready().await.unwrap(), 1);
        let connections = daemon.manager.connections().await;
        assert_eq!(connections.len(), 1);
        assert_eq!(connections[0].id, ConnectionId::from("second"));
    }
}
