//! TCP Panel Link
//!
//! Panel client for panels attached through an Ethernet adapter. The client
//! keeps a TCP link to the adapter open from the connection's background
//! task and reconnects with exponential backoff when it drops. Panel
//! protocol commands are not spoken over this link.

use crate::config::LinkConfig;
use crate::recovery::{ReconnectionStrategy, INITIAL_RETRY_DELAY, MAX_RETRY_ATTEMPTS};
use alarm_connect_core::config::{CONF_DEVICE_TYPE, CONF_EMULATION_MODE, CONF_HOST, CONF_PORT};
use alarm_connect_core::{
    ClientFactory, ConfigMap, EmulationMode, EventLogRequest, LinkError, PanelClient,
    PanelCommandRequest, PanelId, ReconnectRequest, Result, SensorBypassRequest,
    SensorImageRequest, SessionReporter,
};
use async_trait::async_trait;
use serde_json::Value;
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{lookup_host, TcpStream};
use tokio::sync::{watch, Notify};
use tracing::{debug, info, trace, warn};

/// Device type served by this client
pub const DEVICE_TYPE_ETHERNET: &str = "ethernet";

/// Where and how to reach a panel
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkTarget {
    pub host: String,
    pub port: u16,
    pub emulation_mode: EmulationMode,
}

impl LinkTarget {
    /// Read the link settings from a merged configuration
    pub fn from_config(config: &ConfigMap) -> Result<Self> {
        let device_type = config
            .get(CONF_DEVICE_TYPE)
            .and_then(Value::as_str)
            .unwrap_or(DEVICE_TYPE_ETHERNET);
        if !device_type.eq_ignore_ascii_case(DEVICE_TYPE_ETHERNET) {
            return Err(LinkError::UnsupportedFeature(format!(
                "{} devices are not supported",
                device_type
            )));
        }

        let host = config
            .get(CONF_HOST)
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|host| !host.is_empty())
            .ok_or_else(|| LinkError::Configuration(format!("missing {}", CONF_HOST)))?;

        let port = match config.get(CONF_PORT) {
            Some(Value::Number(n)) => n.as_u64().and_then(|p| u16::try_from(p).ok()),
            Some(Value::String(s)) => s.trim().parse::<u16>().ok(),
            _ => None,
        }
        .filter(|port| *port != 0)
        .ok_or_else(|| LinkError::Configuration(format!("missing or invalid {}", CONF_PORT)))?;

        let emulation_mode = match config.get(CONF_EMULATION_MODE) {
            None | Some(Value::Null) => EmulationMode::ALL[0],
            Some(Value::String(mode)) => mode.parse()?,
            Some(other) => {
                return Err(LinkError::Configuration(format!(
                    "invalid {}: {}",
                    CONF_EMULATION_MODE, other
                )))
            }
        };

        Ok(Self {
            host: host.to_string(),
            port,
            emulation_mode,
        })
    }

    /// Resolve the adapter address
    pub async fn resolve(&self) -> Result<SocketAddr> {
        let context = format!("resolving {}", self.host);
        let mut addrs = lookup_host((self.host.as_str(), self.port))
            .await
            .map_err(|e| LinkError::from_io_error(e, &context))?;

        addrs
            .next()
            .ok_or_else(|| LinkError::Transport(format!("{} has no address", self.host)))
    }

    fn same_address(&self, other: &LinkTarget) -> bool {
        self.host == other.host && self.port == other.port
    }
}

/// Why a link session ended
#[derive(Debug)]
enum SessionEnd {
    Stopped,
    Reconnect,
    TargetChanged,
    Closed,
    Failed(String),
}

impl fmt::Display for SessionEnd {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionEnd::Stopped => f.write_str("stopped"),
            SessionEnd::Reconnect => f.write_str("reconnect requested"),
            SessionEnd::TargetChanged => f.write_str("adapter address changed"),
            SessionEnd::Closed => f.write_str("closed by adapter"),
            SessionEnd::Failed(e) => write!(f, "read failed: {}", e),
        }
    }
}

/// TCP link to one panel adapter
pub struct TcpPanelClient {
    panel_id: PanelId,
    target: watch::Sender<LinkTarget>,
    stop: watch::Sender<bool>,
    session_open: watch::Sender<bool>,
    reconnect: Notify,
    connect_timeout: Duration,
    max_reconnect_delay: Duration,
}

impl TcpPanelClient {
    pub fn new(
        panel_id: PanelId,
        target: LinkTarget,
        connect_timeout: Duration,
        max_reconnect_delay: Duration,
    ) -> Self {
        let (target, _) = watch::channel(target);
        let (stop, _) = watch::channel(false);
        let (session_open, _) = watch::channel(false);

        Self {
            panel_id,
            target,
            stop,
            session_open,
            reconnect: Notify::new(),
            connect_timeout,
            max_reconnect_delay,
        }
    }

    async fn open(&self, target: &LinkTarget) -> Result<TcpStream> {
        let addr = target.resolve().await?;
        let context = format!("connecting to {}", addr);

        let stream = tokio::time::timeout(self.connect_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| LinkError::Timeout(context.clone()))?
            .map_err(|e| LinkError::from_io_error(e, &context))?;
        stream.set_nodelay(true)?;

        Ok(stream)
    }

    async fn run_session(
        &self,
        mut stream: TcpStream,
        current: &LinkTarget,
        stop: &mut watch::Receiver<bool>,
        target_rx: &mut watch::Receiver<LinkTarget>,
    ) -> SessionEnd {
        let mut buf = [0u8; 512];

        let end = loop {
            tokio::select! {
                read = stream.read(&mut buf) => match read {
                    Ok(0) => break SessionEnd::Closed,
                    Ok(n) => trace!("Panel {} adapter sent {} bytes", self.panel_id, n),
                    Err(e) => break SessionEnd::Failed(e.to_string()),
                },
                _ = stop.changed() => break SessionEnd::Stopped,
                _ = self.reconnect.notified() => break SessionEnd::Reconnect,
                changed = target_rx.changed() => {
                    if changed.is_err() {
                        break SessionEnd::Stopped;
                    }
                    let next = target_rx.borrow_and_update().clone();
                    if !next.same_address(current) {
                        break SessionEnd::TargetChanged;
                    }
                    info!("Panel {} emulation mode is now {}", self.panel_id, next.emulation_mode);
                }
            }
        };

        if let Err(e) = stream.shutdown().await {
            debug!("Panel {} link shutdown: {}", self.panel_id, e);
        }
        end
    }

    fn protocol_required(&self, operation: &str) -> LinkError {
        LinkError::UnsupportedFeature(format!(
            "{} on panel {} needs the panel protocol",
            operation, self.panel_id
        ))
    }
}

#[async_trait]
impl PanelClient for TcpPanelClient {
    fn panel_id(&self) -> PanelId {
        self.panel_id
    }

    async fn connect(&self, reporter: SessionReporter) -> Result<()> {
        let mut stop = self.stop.subscribe();
        let mut target_rx = self.target.subscribe();
        let mut strategy = ReconnectionStrategy::new(
            INITIAL_RETRY_DELAY,
            self.max_reconnect_delay,
            MAX_RETRY_ATTEMPTS,
        );

        loop {
            if *stop.borrow() {
                break;
            }

            let target = target_rx.borrow_and_update().clone();
            match self.open(&target).await {
                Ok(stream) => {
                    strategy.reset();
                    info!(
                        "Panel {} link up to {}:{} ({})",
                        self.panel_id, target.host, target.port, target.emulation_mode
                    );
                    self.session_open.send_replace(true);
                    reporter.session_established();

                    let end = self
                        .run_session(stream, &target, &mut stop, &mut target_rx)
                        .await;
                    self.session_open.send_replace(false);

                    match end {
                        SessionEnd::Stopped => break,
                        SessionEnd::Reconnect | SessionEnd::TargetChanged => {
                            reporter.session_lost(Some(end.to_string()));
                            continue;
                        }
                        SessionEnd::Closed | SessionEnd::Failed(_) => {
                            reporter.session_lost(Some(end.to_string()));
                        }
                    }
                }
                Err(e) => warn!("Panel {} link attempt failed: {}", self.panel_id, e),
            }

            let delay = strategy.next_delay().unwrap_or(strategy.max_delay);
            debug!(
                "Panel {} reconnecting in {:?} ({})",
                self.panel_id,
                delay,
                strategy.status()
            );

            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = self.reconnect.notified() => strategy.reset(),
                _ = stop.changed() => {}
                _ = target_rx.changed() => strategy.reset(),
            }
        }

        self.session_open.send_replace(false);
        debug!("Panel {} link loop ended", self.panel_id);
        Ok(())
    }

    fn update_config(&self, config: &ConfigMap) -> Result<()> {
        let target = LinkTarget::from_config(config)?;
        debug!("Panel {} link settings updated: {:?}", self.panel_id, target);
        self.target.send_replace(target);
        Ok(())
    }

    async fn stop_all(&self) -> Result<()> {
        self.stop.send_replace(true);

        let mut open = self.session_open.subscribe();
        let _ = open.wait_for(|open| !*open).await;

        info!("Panel {} link stopped", self.panel_id);
        Ok(())
    }

    async fn fetch_event_log(&self, _request: &EventLogRequest) -> Result<()> {
        Err(self.protocol_required("Event log"))
    }

    async fn reconnect(&self, _request: &ReconnectRequest) -> Result<()> {
        if *self.stop.borrow() {
            return Err(LinkError::InvalidState(format!(
                "panel {} link is stopping",
                self.panel_id
            )));
        }

        info!("Panel {} reconnect requested", self.panel_id);
        self.reconnect.notify_one();
        Ok(())
    }

    async fn send_panel_command(&self, request: &PanelCommandRequest) -> Result<()> {
        Err(self.protocol_required(request.command.as_str()))
    }

    async fn set_sensor_bypass(&self, _request: &SensorBypassRequest) -> Result<()> {
        Err(self.protocol_required("Sensor bypass"))
    }

    async fn request_sensor_image(&self, _request: &SensorImageRequest) -> Result<()> {
        Err(self.protocol_required("Sensor image"))
    }
}

/// Builds [`TcpPanelClient`]s
#[derive(Debug, Clone)]
pub struct TcpClientFactory {
    connect_timeout: Duration,
    max_reconnect_delay: Duration,
}

impl TcpClientFactory {
    pub fn new(config: &LinkConfig) -> Self {
        Self {
            connect_timeout: config.connect_timeout(),
            max_reconnect_delay: config.max_reconnect_delay(),
        }
    }
}

#[async_trait]
impl ClientFactory for TcpClientFactory {
    async fn create_client(
        &self,
        panel_id: PanelId,
        config: &ConfigMap,
    ) -> Result<Arc<dyn PanelClient>> {
        let target = LinkTarget::from_config(config)?;

        // An adapter that does not resolve is not ready yet
        let addr = tokio::time::timeout(self.connect_timeout, target.resolve())
            .await
            .map_err(|_| LinkError::Timeout(format!("resolving {}", target.host)))??;
        debug!("Panel {} adapter resolves to {}", panel_id, addr);

        Ok(Arc::new(TcpPanelClient::new(
            panel_id,
            target,
            self.connect_timeout,
            self.max_reconnect_delay,
        )))
    }
}
