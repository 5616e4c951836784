//! Test utilities
//!
//! In-memory panel client, client factory and notifier for unit tests.

use crate::client::{
    ClientFactory, EventLogRequest, PanelClient, PanelCommand, PanelCommandRequest,
    ReconnectRequest, SensorBypassRequest, SensorImageRequest, SessionReporter,
};
use crate::config::ConfigMap;
use crate::connection::PanelId;
use crate::notification::{Notification, Notifier};
use crate::{LinkError, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Calls observed by a [`MockClient`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MockCall {
    Connect,
    /// The connect future was dropped before finishing
    Cancelled,
    UpdateConfig,
    StopAll,
    FetchEventLog,
    Reconnect,
    PanelCommand(PanelCommand),
    SensorBypass(bool),
    SensorImage,
}

/// Panel client that records every call
///
/// `connect` reports an established session and then runs until its task is
/// cancelled.
#[derive(Debug)]
pub struct MockClient {
    panel_id: PanelId,
    calls: Mutex<Vec<MockCall>>,
    configs: Mutex<Vec<ConfigMap>>,
    stop_delay: Option<Duration>,
    request_failure: Mutex<Option<String>>,
}

struct CancelGuard<'a> {
    calls: &'a Mutex<Vec<MockCall>>,
}

impl Drop for CancelGuard<'_> {
    fn drop(&mut self) {
        self.calls.lock().unwrap().push(MockCall::Cancelled);
    }
}

impl MockClient {
    pub fn new(panel_id: PanelId) -> Arc<Self> {
        Self::with_stop_delay(panel_id, None)
    }

    pub fn with_stop_delay(panel_id: PanelId, stop_delay: Option<Duration>) -> Arc<Self> {
        Arc::new(Self {
            panel_id,
            calls: Mutex::new(Vec::new()),
            configs: Mutex::new(Vec::new()),
            stop_delay,
            request_failure: Mutex::new(None),
        })
    }

    /// Make every service request fail with a transport error
    pub fn fail_requests(&self, message: &str) {
        *self.request_failure.lock().unwrap() = Some(message.to_string());
    }

    pub fn calls(&self) -> Vec<MockCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn count(&self, call: MockCall) -> usize {
        self.calls.lock().unwrap().iter().filter(|c| **c == call).count()
    }

    /// Configurations pushed through `update_config`
    pub fn configs(&self) -> Vec<ConfigMap> {
        self.configs.lock().unwrap().clone()
    }

    /// Wait until `call` has been recorded
    pub async fn wait_for(&self, call: MockCall) {
        tokio::time::timeout(Duration::from_secs(2), async {
            while self.count(call.clone()) == 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap_or_else(|_| panic!("{:?} was never called", call));
    }

    fn record(&self, call: MockCall) -> Result<()> {
        self.calls.lock().unwrap().push(call);
        match self.request_failure.lock().unwrap().as_ref() {
            Some(message) => Err(LinkError::Transport(message.clone())),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl PanelClient for MockClient {
    fn panel_id(&self) -> PanelId {
        self.panel_id
    }

    async fn connect(&self, reporter: SessionReporter) -> Result<()> {
        self.calls.lock().unwrap().push(MockCall::Connect);
        let _guard = CancelGuard {
            calls: &self.calls,
        };
        reporter.session_established();
        std::future::pending::<()>().await;
        Ok(())
    }

    fn update_config(&self, config: &ConfigMap) -> Result<()> {
        self.calls.lock().unwrap().push(MockCall::UpdateConfig);
        self.configs.lock().unwrap().push(config.clone());
        Ok(())
    }

    async fn stop_all(&self) -> Result<()> {
        self.calls.lock().unwrap().push(MockCall::StopAll);
        if let Some(delay) = self.stop_delay {
            tokio::time::sleep(delay).await;
        }
        Ok(())
    }

    async fn fetch_event_log(&self, _request: &EventLogRequest) -> Result<()> {
        self.record(MockCall::FetchEventLog)
    }

    async fn reconnect(&self, _request: &ReconnectRequest) -> Result<()> {
        self.record(MockCall::Reconnect)
    }

    async fn send_panel_command(&self, request: &PanelCommandRequest) -> Result<()> {
        self.record(MockCall::PanelCommand(request.command))
    }

    async fn set_sensor_bypass(&self, request: &SensorBypassRequest) -> Result<()> {
        self.record(MockCall::SensorBypass(request.bypass))
    }

    async fn request_sensor_image(&self, _request: &SensorImageRequest) -> Result<()> {
        self.record(MockCall::SensorImage)
    }
}

/// Factory handing out [`MockClient`]s
#[derive(Debug, Default)]
pub struct MockFactory {
    clients: Mutex<HashMap<PanelId, Arc<MockClient>>>,
    next_error: Mutex<Option<LinkError>>,
    stop_delay: Mutex<Option<Duration>>,
    created: AtomicUsize,
}

impl MockFactory {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Fail the next `create_client` with `error`
    pub fn fail_next(&self, error: LinkError) {
        *self.next_error.lock().unwrap() = Some(error);
    }

    /// Clients built from now on take `delay` to stop
    pub fn set_stop_delay(&self, delay: Duration) {
        *self.stop_delay.lock().unwrap() = Some(delay);
    }

    /// Number of clients built
    pub fn created(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }

    /// Most recent client built for a panel
    pub fn client(&self, panel_id: PanelId) -> Option<Arc<MockClient>> {
        self.clients.lock().unwrap().get(&panel_id).cloned()
    }
}

#[async_trait]
impl ClientFactory for MockFactory {
    async fn create_client(
        &self,
        panel_id: PanelId,
        _config: &ConfigMap,
    ) -> Result<Arc<dyn PanelClient>> {
        if let Some(error) = self.next_error.lock().unwrap().take() {
            return Err(error);
        }

        let delay = *self.stop_delay.lock().unwrap();
        let client = MockClient::with_stop_delay(panel_id, delay);
        self.clients
            .lock()
            .unwrap()
            .insert(panel_id, Arc::clone(&client));
        self.created.fetch_add(1, Ordering::SeqCst);
        Ok(client)
    }
}

/// Notifier that keeps everything it is given
#[derive(Debug, Default)]
pub struct RecordingNotifier {
    notifications: Mutex<Vec<Notification>>,
}

impl RecordingNotifier {
    pub fn notifications(&self) -> Vec<Notification> {
        self.notifications.lock().unwrap().clone()
    }

    pub fn messages(&self) -> Vec<String> {
        self.notifications()
            .into_iter()
            .map(|n| n.message)
            .collect()
    }
}

impl Notifier for RecordingNotifier {
    fn notify(&self, notification: Notification) {
        self.notifications.lock().unwrap().push(notification);
    }
}
