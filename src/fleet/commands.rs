//! MCP fleet tools implementation.
//!
//! Thin tool surface over [`FleetMonitor`]:
//!
//! - `fleet_overview`: One row per host with connection and refresh state
//! - `host_telemetry`: Cached accelerator snapshot for a host
//! - `system_telemetry`: Cached memory, storage, port and container snapshot
//! - `accelerator_history`: Accelerator history with aggregates over a window
//! - `system_history`: System history with aggregates over a window
//! - `refresh_status`: Refresh and reconnect state of a host
//! - `trigger_refresh`: Refresh a host now
//! - `set_refresh_config`: Change auto-refresh and the polling interval
//! - `connect_host`: Connect now, optionally with replacement credentials
//! - `disconnect_host`: Close a host's shells and session and stop polling it
//! - `list_dir`: List a remote directory
//! - `autocomplete_path`: Complete a partial remote path

use std::path::PathBuf;
use std::sync::Arc;

use poem_mcpserver::{Tools, tool::StructuredContent};
use tracing::info;

use super::hosts::Credentials;
use super::monitor::FleetMonitor;
use super::store::AcceleratorFilter;
use super::types::{
    AcceleratorHistory, AcceleratorSnapshot, AutocompleteResponse, DirectoryListing,
    DisconnectResponse, FleetOverview, RefreshConfig, RefreshOutcome, RefreshStatus, SessionInfo,
    SystemHistory, SystemSnapshot, TelemetryView,
};

/// MCP fleet tool implementation.
///
/// Every tool delegates to the shared [`FleetMonitor`], so tool sessions
/// created by the transport all see one cache and one scheduler.
pub struct FleetTools {
    monitor: Arc<FleetMonitor>,
}

impl FleetTools {
    pub fn new(monitor: Arc<FleetMonitor>) -> Self {
        Self { monitor }
    }
}

/// Build a connect-time credential override from tool parameters.
///
/// A password wins over a key file; no parameters means the inventory
/// credentials are used.
fn credentials_override(
    password: Option<String>,
    key_path: Option<String>,
    passphrase: Option<String>,
) -> Option<Credentials> {
    match (password, key_path) {
        (Some(password), _) => Some(Credentials::Password { password }),
        (None, Some(path)) => Some(Credentials::KeyFile {
            path: PathBuf::from(path),
            passphrase,
        }),
        (None, None) => None,
    }
}

#[Tools]
impl FleetTools {
    /// Overview of every host in the inventory.
    ///
    /// Each row carries the connection flag, auto-refresh settings, whether a
    /// refresh is running, the lifecycle state (connecting, connected,
    /// backoff, given_up) and when each telemetry kind was last updated.
    async fn fleet_overview(&self) -> StructuredContent<FleetOverview> {
        StructuredContent(self.monitor.fleet_overview())
    }

    /// Latest accelerator telemetry for a host: chips, health, board info,
    /// memory, usage, ECC counters and accelerator processes.
    ///
    /// Served from the cache. When the host is disconnected the last known
    /// snapshot is returned with `stale=true`. When nothing is cached yet and
    /// the host is connected, a refresh runs first, or the one already
    /// running is awaited.
    async fn host_telemetry(
        &self,
        /// Host identifier from the inventory
        host_id: String,
    ) -> Result<StructuredContent<TelemetryView<AcceleratorSnapshot>>, String> {
        self.monitor
            .host_telemetry(&host_id)
            .await
            .map(StructuredContent)
            .map_err(|e| e.to_string())
    }

    /// Latest host-system telemetry: memory, mounted storage, listening
    /// ports and containers. Same cache rules as `host_telemetry`.
    async fn system_telemetry(
        &self,
        /// Host identifier from the inventory
        host_id: String,
    ) -> Result<StructuredContent<TelemetryView<SystemSnapshot>>, String> {
        self.monitor
            .system_telemetry(&host_id)
            .await
            .map(StructuredContent)
            .map_err(|e| e.to_string())
    }

    /// Accelerator history records in a time window, oldest first, with
    /// avg/min/max of temperature, power, memory rate, AI-core usage and ECC
    /// errors.
    ///
    /// The window defaults to the last 24 hours. History is kept for
    /// `FLEET_HISTORY_RETENTION_HOURS`.
    async fn accelerator_history(
        &self,
        /// Host identifier from the inventory
        host_id: String,
        /// Only records of this NPU (optional)
        npu_id: Option<i64>,
        /// Only records of this chip (optional)
        chip_id: Option<i64>,
        /// Window start, epoch milliseconds (default: 24 hours before end)
        start_ms: Option<i64>,
        /// Window end, epoch milliseconds (default: now)
        end_ms: Option<i64>,
    ) -> Result<StructuredContent<AcceleratorHistory>, String> {
        let filter = AcceleratorFilter { npu_id, chip_id };
        self.monitor
            .accelerator_history(&host_id, filter, start_ms, end_ms)
            .map(StructuredContent)
            .map_err(|e| e.to_string())
    }

    /// System history records in a time window, oldest first, with
    /// avg/min/max of memory usage, storage usage and container counts.
    async fn system_history(
        &self,
        /// Host identifier from the inventory
        host_id: String,
        /// Window start, epoch milliseconds (default: 24 hours before end)
        start_ms: Option<i64>,
        /// Window end, epoch milliseconds (default: now)
        end_ms: Option<i64>,
    ) -> Result<StructuredContent<SystemHistory>, String> {
        self.monitor
            .system_history(&host_id, start_ms, end_ms)
            .map(StructuredContent)
            .map_err(|e| e.to_string())
    }

    /// Refresh state of a host: whether a refresh is in flight, the refresh
    /// config, the lifecycle state and reconnect attempt bookkeeping.
    async fn refresh_status(
        &self,
        /// Host identifier from the inventory
        host_id: String,
    ) -> Result<StructuredContent<RefreshStatus>, String> {
        self.monitor
            .refresh_status(&host_id)
            .map(StructuredContent)
            .map_err(|e| e.to_string())
    }

    /// Refresh a host's telemetry now, whether or not auto-refresh is on.
    ///
    /// Returns `skipped` when a refresh for the host is already running. A
    /// `failed` outcome still updates the cache with the error.
    async fn trigger_refresh(
        &self,
        /// Host identifier from the inventory
        host_id: String,
    ) -> Result<StructuredContent<RefreshOutcome>, String> {
        info!("Manual refresh requested for host {}", host_id);
        self.monitor
            .trigger_refresh(&host_id)
            .await
            .map(StructuredContent)
            .map_err(|e| e.to_string())
    }

    /// Change a host's refresh settings. Omitted fields keep their value.
    ///
    /// The interval must be between 10000 and 300000 ms. A new interval
    /// takes effect without restarting the host's connection.
    async fn set_refresh_config(
        &self,
        /// Host identifier from the inventory
        host_id: String,
        /// Enable or disable scheduled refreshes (optional)
        auto_refresh: Option<bool>,
        /// Polling interval in milliseconds, 10000..=300000 (optional)
        interval_ms: Option<u64>,
    ) -> Result<StructuredContent<RefreshConfig>, String> {
        let current = self
            .monitor
            .refresh_status(&host_id)
            .map_err(|e| e.to_string())?;
        let config = RefreshConfig {
            auto_refresh: auto_refresh.unwrap_or(current.auto_refresh),
            interval_ms: interval_ms.unwrap_or(current.interval_ms),
        };
        self.monitor
            .set_refresh_config(&host_id, config)
            .map(StructuredContent)
            .map_err(|e| e.to_string())
    }

    /// Connect to a host now and restart its polling lifecycle.
    ///
    /// This is also how a host leaves the `given_up` state. Credentials from
    /// the inventory are used unless a password or key path is given here.
    async fn connect_host(
        &self,
        /// Host identifier from the inventory
        host_id: String,
        /// Password to use instead of the inventory credentials (optional)
        password: Option<String>,
        /// Path to a private key file to use instead of the inventory credentials (optional)
        key_path: Option<String>,
        /// Passphrase for the key file (optional)
        passphrase: Option<String>,
    ) -> Result<StructuredContent<SessionInfo>, String> {
        let credentials = credentials_override(password, key_path, passphrase);
        self.monitor
            .connect_host(&host_id, credentials)
            .await
            .map(StructuredContent)
            .map_err(|e| e.to_string())
    }

    /// Disconnect a host: close its interactive shells, stop its polling
    /// lifecycle and drop its SSH session. Cached telemetry is kept and
    /// reported as stale.
    async fn disconnect_host(
        &self,
        /// Host identifier from the inventory
        host_id: String,
    ) -> Result<StructuredContent<DisconnectResponse>, String> {
        self.monitor
            .disconnect_host(&host_id)
            .await
            .map(StructuredContent)
            .map_err(|e| e.to_string())
    }

    /// List a remote directory, directories first, then by name.
    async fn list_dir(
        &self,
        /// Host identifier from the inventory
        host_id: String,
        /// Absolute remote path (default: "/")
        path: Option<String>,
    ) -> Result<StructuredContent<DirectoryListing>, String> {
        let path = path.unwrap_or_else(|| "/".to_string());
        self.monitor
            .list_dir(&host_id, &path)
            .await
            .map(StructuredContent)
            .map_err(|e| e.to_string())
    }

    /// Complete a partial remote path. Directory suggestions end with "/".
    ///
    /// At most 20 suggestions; an unreachable host yields none.
    async fn autocomplete_path(
        &self,
        /// Host identifier from the inventory
        host_id: String,
        /// Partial path typed so far
        partial: String,
    ) -> StructuredContent<AutocompleteResponse> {
        StructuredContent(AutocompleteResponse {
            suggestions: self.monitor.autocomplete(&host_id, &partial).await,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    mod credentials {
        use super::*;

        #[test]
        fn test_no_override() {
            assert_eq!(credentials_override(None, None, Some("x".into())), None);
        }

        #[test]
        fn test_password_wins() {
            assert_eq!(
                credentials_override(Some("pw".into()), Some("/k".into()), None),
                Some(Credentials::Password {
                    password: "pw".into()
                })
            );
        }

        #[test]
        fn test_key_file_keeps_passphrase() {
            assert_eq!(
                credentials_override(None, Some("/home/ops/.ssh/id_ed25519".into()), Some("pp".into())),
                Some(Credentials::KeyFile {
                    path: PathBuf::from("/home/ops/.ssh/id_ed25519"),
                    passphrase: Some("pp".into()),
                })
            );
        }
    }
}
