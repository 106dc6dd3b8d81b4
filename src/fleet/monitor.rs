//! Fleet monitor facade.
//!
//! [`FleetMonitor`] owns one instance of every component and is the only
//! thing the tool surface talks to. Components are wired by injection: the
//! registry, host store and clock come in as trait objects, so the whole
//! facade runs against scripted fakes in tests.
//!
//! # Telemetry reads
//!
//! | cache entry | live session | result |
//! |-------------|--------------|--------|
//! | present | yes | cached view |
//! | present | no | cached view with `stale = true` |
//! | absent | yes | refresh first, then the fresh view |
//! | absent | no | [`FleetError::CacheUnavailable`] |

use std::sync::Arc;
use std::time::Duration;

use serde::de::DeserializeOwned;
use tracing::{info, warn};

use crate::fleet::clock::{Clock, SystemClock};
use crate::fleet::config::SchedulerConfig;
use crate::fleet::error::FleetError;
use crate::fleet::hosts::{Credentials, Host, HostStore};
use crate::fleet::registry::{RemoteSessions, SshSessionRegistry};
use crate::fleet::scheduler::RefreshScheduler;
use crate::fleet::shell::{ShellBridge, ShellHandle};
use crate::fleet::store::{AcceleratorFilter, SnapshotKind, TelemetryStore};
use crate::fleet::transfer::TransferGateway;
use crate::fleet::types::{
    AcceleratorHistory, AcceleratorSnapshot, DirectoryListing, DisconnectResponse, FileEntry,
    FleetOverview, FleetOverviewEntry, RefreshConfig, RefreshOutcome, RefreshStatus, SessionInfo,
    ShellSessionInfo, SystemHistory, SystemSnapshot, TelemetryView, Timestamp,
};

/// History window used when the caller gives no start.
pub const DEFAULT_HISTORY_WINDOW: Duration = Duration::from_secs(24 * 3600);

pub struct FleetMonitor {
    registry: Arc<dyn RemoteSessions>,
    hosts: Arc<dyn HostStore>,
    store: Arc<TelemetryStore>,
    scheduler: RefreshScheduler,
    shells: ShellBridge,
    files: TransferGateway,
}

impl FleetMonitor {
    pub fn new(
        registry: Arc<dyn RemoteSessions>,
        hosts: Arc<dyn HostStore>,
        clock: Arc<dyn Clock>,
        config: SchedulerConfig,
    ) -> Self {
        let store = Arc::new(TelemetryStore::new(Arc::clone(&clock)));
        let command_timeout = config.command.timeout;
        Self {
            scheduler: RefreshScheduler::new(
                Arc::clone(&registry),
                Arc::clone(&hosts),
                Arc::clone(&store),
                config,
            ),
            shells: ShellBridge::new(Arc::clone(&registry), clock),
            files: TransferGateway::new(Arc::clone(&registry), command_timeout),
            registry,
            hosts,
            store,
        }
    }

    /// SSH registry, system clock and scheduler settings from the environment.
    pub fn from_env(hosts: Arc<dyn HostStore>) -> Self {
        Self::new(
            Arc::new(SshSessionRegistry::from_env()),
            hosts,
            Arc::new(SystemClock),
            SchedulerConfig::from_env(),
        )
    }

    pub fn start(&self) {
        self.scheduler.start();
    }

    pub fn stop(&self) {
        self.scheduler.stop();
    }

    fn require_host(&self, host_id: &str) -> Result<Host, FleetError> {
        self.hosts
            .get_host(host_id)
            .ok_or_else(|| FleetError::NotFound(format!("host {}", host_id)))
    }

    // ------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------

    pub async fn host_telemetry(
        &self,
        host_id: &str,
    ) -> Result<TelemetryView<AcceleratorSnapshot>, FleetError> {
        self.telemetry(host_id, SnapshotKind::Accelerator).await
    }

    pub async fn system_telemetry(
        &self,
        host_id: &str,
    ) -> Result<TelemetryView<SystemSnapshot>, FleetError> {
        self.telemetry(host_id, SnapshotKind::System).await
    }

    async fn telemetry<T: DeserializeOwned>(
        &self,
        host_id: &str,
        kind: SnapshotKind,
    ) -> Result<TelemetryView<T>, FleetError> {
        self.require_host(host_id)?;
        let connected = self.registry.is_connected(host_id);

        if let Some(entry) = self.store.read_snapshot::<T>(host_id, kind) {
            return Ok(entry.into_view(host_id, !connected));
        }
        if connected {
            self.scheduler.refresh_or_wait(host_id).await?;
            if let Some(entry) = self.store.read_snapshot::<T>(host_id, kind) {
                let stale = !self.registry.is_connected(host_id);
                return Ok(entry.into_view(host_id, stale));
            }
        }
        Err(FleetError::CacheUnavailable(host_id.to_string()))
    }

    /// Accelerator history in `[start, end]`. `end` defaults to now and
    /// `start` to [`DEFAULT_HISTORY_WINDOW`] before `end`.
    pub fn accelerator_history(
        &self,
        host_id: &str,
        filter: AcceleratorFilter,
        start: Option<Timestamp>,
        end: Option<Timestamp>,
    ) -> Result<AcceleratorHistory, FleetError> {
        self.require_host(host_id)?;
        let (start, end) = self.window(start, end)?;
        Ok(self
            .store
            .query_accelerator_history(host_id, filter, start, end))
    }

    pub fn system_history(
        &self,
        host_id: &str,
        start: Option<Timestamp>,
        end: Option<Timestamp>,
    ) -> Result<SystemHistory, FleetError> {
        self.require_host(host_id)?;
        let (start, end) = self.window(start, end)?;
        Ok(self.store.query_system_history(host_id, start, end))
    }

    fn window(
        &self,
        start: Option<Timestamp>,
        end: Option<Timestamp>,
    ) -> Result<(Timestamp, Timestamp), FleetError> {
        let end = end.unwrap_or_else(|| self.store.now_ms());
        let window = DEFAULT_HISTORY_WINDOW.as_millis() as Timestamp;
        let start = start.unwrap_or(end.saturating_sub(window));
        if start > end {
            return Err(FleetError::Validation(format!(
                "history window start {} is after end {}",
                start, end
            )));
        }
        Ok((start, end))
    }

    pub fn refresh_status(&self, host_id: &str) -> Result<RefreshStatus, FleetError> {
        self.scheduler.status(host_id)
    }

    /// One row per known host.
    pub fn fleet_overview(&self) -> FleetOverview {
        let hosts: Vec<FleetOverviewEntry> = self
            .hosts
            .list_host_ids()
            .into_iter()
            .filter_map(|id| {
                let host = self.hosts.get_host(&id)?;
                let status = self.scheduler.status(&id).ok()?;
                Some(FleetOverviewEntry {
                    connected: self.registry.is_connected(&id),
                    host_name: host.name,
                    auto_refresh: status.auto_refresh,
                    interval_ms: status.interval_ms,
                    refreshing: status.refreshing,
                    state: status.state,
                    accelerator_last_updated: self
                        .store
                        .last_updated(&id, SnapshotKind::Accelerator),
                    system_last_updated: self.store.last_updated(&id, SnapshotKind::System),
                    last_error: self.store.last_error(&id),
                    host_id: id,
                })
            })
            .collect();
        FleetOverview {
            count: hosts.len(),
            hosts,
        }
    }

    // ------------------------------------------------------------------
    // Commands
    // ------------------------------------------------------------------

    pub async fn trigger_refresh(&self, host_id: &str) -> Result<RefreshOutcome, FleetError> {
        self.scheduler.refresh_one(host_id).await
    }

    pub fn set_refresh_config(
        &self,
        host_id: &str,
        config: RefreshConfig,
    ) -> Result<RefreshConfig, FleetError> {
        self.scheduler.set_refresh_config(host_id, config)
    }

    /// Connect now, optionally with replacement credentials, and restart the
    /// host's polling lifecycle if the scheduler runs.
    pub async fn connect_host(
        &self,
        host_id: &str,
        credentials: Option<Credentials>,
    ) -> Result<SessionInfo, FleetError> {
        let host = self.require_host(host_id)?;
        match self.registry.connect(&host, credentials).await {
            Ok(session) => {
                self.store.set_connection_status(host_id, true, None);
                if self.scheduler.is_running() {
                    self.scheduler.reconnect(host_id)?;
                }
                Ok(session)
            }
            Err(e) => {
                warn!("Manual connect to host {} failed: {}", host_id, e);
                self.store
                    .set_connection_status(host_id, false, Some(e.to_string()));
                Err(e)
            }
        }
    }

    /// Close the host's shells, stop polling it and drop its session.
    pub async fn disconnect_host(&self, host_id: &str) -> Result<DisconnectResponse, FleetError> {
        self.require_host(host_id)?;
        let closed_sessions = self.shells.close_all_for_host(host_id).await;
        self.scheduler.remove_host(host_id);
        let existed = self.registry.disconnect(host_id).await;
        self.store.set_connection_status(host_id, false, None);

        info!(
            "Disconnected host {} ({} shell(s) closed)",
            host_id, closed_sessions
        );
        Ok(DisconnectResponse {
            host_id: host_id.to_string(),
            closed_sessions,
            message: if existed {
                format!("Host {} disconnected", host_id)
            } else {
                format!("Host {} had no active session", host_id)
            },
        })
    }

    /// Start tracking a host that was added to the host store.
    pub fn add_host(&self, host_id: &str) -> Result<(), FleetError> {
        self.scheduler.add_host(host_id)
    }

    /// Tear down everything held for a host that left the host store.
    pub async fn remove_host(&self, host_id: &str) {
        self.shells.close_all_for_host(host_id).await;
        self.scheduler.remove_host(host_id);
        self.registry.disconnect(host_id).await;
        self.store.remove_host(host_id);
    }

    // ------------------------------------------------------------------
    // Interactive sessions
    // ------------------------------------------------------------------

    pub async fn open_session(
        &self,
        host_id: &str,
        cols: u32,
        rows: u32,
    ) -> Result<ShellHandle, FleetError> {
        self.require_host(host_id)?;
        self.shells.open(host_id, cols, rows).await
    }

    pub async fn send_input(&self, session_id: &str, data: Vec<u8>) -> Result<(), FleetError> {
        self.shells.send_input(session_id, data).await
    }

    pub async fn resize_session(
        &self,
        session_id: &str,
        cols: u32,
        rows: u32,
    ) -> Result<(), FleetError> {
        self.shells.resize(session_id, cols, rows).await
    }

    pub async fn close_session(&self, session_id: &str) -> Result<(), FleetError> {
        self.shells.close(session_id, "Closed by client").await
    }

    pub fn sessions(&self, host_id: Option<&str>) -> Vec<ShellSessionInfo> {
        self.shells.list(host_id)
    }

    // ------------------------------------------------------------------
    // Files
    // ------------------------------------------------------------------

    pub async fn list_dir(&self, host_id: &str, path: &str) -> Result<DirectoryListing, FleetError> {
        self.require_host(host_id)?;
        self.files.list(host_id, path).await
    }

    pub async fn stat(&self, host_id: &str, path: &str) -> Result<Option<FileEntry>, FleetError> {
        self.require_host(host_id)?;
        self.files.stat(host_id, path).await
    }

    pub async fn create_directory(
        &self,
        host_id: &str,
        parent: &str,
        name: &str,
    ) -> Result<String, FleetError> {
        self.require_host(host_id)?;
        self.files.create_directory(host_id, parent, name).await
    }

    pub async fn delete(&self, host_id: &str, path: &str) -> Result<(), FleetError> {
        self.require_host(host_id)?;
        self.files.delete(host_id, path).await
    }

    pub async fn rename(&self, host_id: &str, from: &str, to: &str) -> Result<(), FleetError> {
        self.require_host(host_id)?;
        self.files.rename(host_id, from, to).await
    }

    pub async fn download(&self, host_id: &str, path: &str) -> Result<Vec<u8>, FleetError> {
        self.require_host(host_id)?;
        self.files.read_content(host_id, path).await
    }

    pub async fn upload(
        &self,
        host_id: &str,
        dir: &str,
        name: &str,
        content: &[u8],
    ) -> Result<String, FleetError> {
        self.require_host(host_id)?;
        self.files.upload(host_id, dir, name, content).await
    }

    pub async fn autocomplete(&self, host_id: &str, partial: &str) -> Vec<String> {
        self.files.autocomplete(host_id, partial).await
    }
}
