//! Serializable telemetry, history and response types.
//!
//! Snapshot types are what the parsers produce and what the store serializes
//! into cache entries. Response types are returned by the [`FleetMonitor`]
//! facade and the MCP tools. All types implement `Serialize`, `Deserialize`
//! and `JsonSchema` so they can be handed to the MCP layer unchanged.
//!
//! [`FleetMonitor`]: crate::fleet::monitor::FleetMonitor

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Milliseconds since the Unix epoch.
pub type Timestamp = i64;

/// Sentinel accelerator id for processes that could not be attributed to a device.
pub const UNKNOWN_ACCELERATOR: i64 = -1;

/// Raw result of one remote command. A non-zero exit code is not an error.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
}

impl CommandOutput {
    pub fn new(stdout: impl Into<String>, stderr: impl Into<String>, exit_code: i32) -> Self {
        Self {
            stdout: stdout.into(),
            stderr: stderr.into(),
            exit_code,
        }
    }

    /// Synthetic failure used when a command could not be run at all.
    pub fn failure(message: impl Into<String>) -> Self {
        Self::new("", message, 1)
    }

    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// True when a parser should treat this output as "nothing to parse".
    pub fn is_unusable(&self) -> bool {
        self.exit_code != 0 || self.stdout.trim().is_empty()
    }
}

// ---------------------------------------------------------------------------
// Accelerator telemetry
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Device {
    pub id: i64,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Chip {
    pub npu_id: i64,
    pub chip_id: i64,
    pub name: String,
    pub health: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct BoardInfo {
    pub npu_id: i64,
    pub name: String,
    pub health: String,
    pub firmware_version: String,
    pub software_version: String,
}

/// Temperatures in degrees Celsius, rounded.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Temperature {
    pub npu_id: i64,
    pub chip_id: i64,
    pub npu_temp: i64,
    pub ai_core_temp: i64,
}

/// Power in watts, rounded.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Power {
    pub npu_id: i64,
    pub chip_id: i64,
    pub power_usage: i64,
    pub power_limit: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct MemoryInfo {
    pub npu_id: i64,
    pub chip_id: i64,
    /// MB in use
    pub memory_usage: i64,
    /// MB total
    pub memory_total: i64,
    /// Percent
    pub memory_usage_rate: i64,
    /// Percent, from the per-device common info
    pub hbm_usage_rate: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Usage {
    pub npu_id: i64,
    pub chip_id: i64,
    pub ai_core_usage: i64,
    pub memory_usage: i64,
    pub bandwidth_usage: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Ecc {
    pub npu_id: i64,
    pub chip_id: i64,
    pub ecc_error_count: i64,
    pub ecc_mode: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct AcceleratorProcess {
    pub pid: i64,
    pub process_name: String,
    pub memory_usage: i64,
    pub ai_core_usage: i64,
    /// Device id, or [`UNKNOWN_ACCELERATOR`] when it could not be attributed
    pub npu_id: i64,
}

/// Everything collected from the accelerators of one host in one refresh.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct AcceleratorSnapshot {
    pub devices: Vec<Device>,
    pub chips: Vec<Chip>,
    pub board_info: Vec<BoardInfo>,
    pub temperatures: Vec<Temperature>,
    pub power: Vec<Power>,
    pub memory: Vec<MemoryInfo>,
    pub usage: Vec<Usage>,
    pub processes: Vec<AcceleratorProcess>,
    pub ecc: Vec<Ecc>,
    pub collected_at: Timestamp,
}

// ---------------------------------------------------------------------------
// Host-system telemetry
// ---------------------------------------------------------------------------

/// Memory summary in MB.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SystemMemory {
    pub total: i64,
    pub used: i64,
    pub free: i64,
    pub available: i64,
    pub buffers: i64,
    pub cached: i64,
    pub usage_percent: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct StorageMount {
    pub filesystem: String,
    pub size: String,
    pub used: String,
    pub available: String,
    pub usage_percent: i64,
    pub mount_point: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ListeningPort {
    pub protocol: String,
    pub local_address: String,
    #[schemars(schema_with = "crate::fleet::schema::uint")]
    pub port: u16,
    pub state: String,
    pub process: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pid: Option<i64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum ContainerState {
    Running,
    Stopped,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Container {
    pub id: String,
    pub name: String,
    pub image: String,
    pub status: String,
    pub state: ContainerState,
    pub ports: String,
    pub created_at: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SystemSnapshot {
    pub memory: SystemMemory,
    pub storage: Vec<StorageMount>,
    pub ports: Vec<ListeningPort>,
    pub containers: Vec<Container>,
    pub collected_at: Timestamp,
}

// ---------------------------------------------------------------------------
// History
// ---------------------------------------------------------------------------

/// One history row per (host, npu, chip) per successful refresh.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct AcceleratorHistoryRecord {
    pub host_id: String,
    pub npu_id: i64,
    pub chip_id: i64,
    pub temperature: i64,
    pub power_usage: i64,
    pub memory_usage_rate: i64,
    pub ai_core_usage: i64,
    pub ecc_error_count: i64,
    pub timestamp: Timestamp,
}

/// One history row per host per successful refresh.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SystemHistoryRecord {
    pub host_id: String,
    pub memory_usage_percent: i64,
    /// Highest usage across all mounts
    pub storage_usage_percent: i64,
    pub container_count: i64,
    pub running_containers: i64,
    pub timestamp: Timestamp,
}

/// Average, minimum and maximum of one metric over a query window.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct MetricAggregate {
    pub avg: f64,
    pub min: f64,
    pub max: f64,
}

impl MetricAggregate {
    /// Aggregate a series; an empty series yields all zeros.
    pub fn from_values(values: impl IntoIterator<Item = f64>) -> Self {
        let mut count = 0usize;
        let mut sum = 0.0;
        let mut min = f64::INFINITY;
        let mut max = f64::NEG_INFINITY;
        for value in values {
            count += 1;
            sum += value;
            min = min.min(value);
            max = max.max(value);
        }
        if count == 0 {
            return Self::default();
        }
        Self {
            avg: sum / count as f64,
            min,
            max,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct AcceleratorHistorySummary {
    pub temperature: MetricAggregate,
    pub power_usage: MetricAggregate,
    pub memory_usage_rate: MetricAggregate,
    pub ai_core_usage: MetricAggregate,
    pub ecc_error_count: MetricAggregate,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SystemHistorySummary {
    pub memory_usage_percent: MetricAggregate,
    pub storage_usage_percent: MetricAggregate,
    pub container_count: MetricAggregate,
    pub running_containers: MetricAggregate,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct AcceleratorHistory {
    pub records: Vec<AcceleratorHistoryRecord>,
    pub summary: AcceleratorHistorySummary,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct SystemHistory {
    pub records: Vec<SystemHistoryRecord>,
    pub summary: SystemHistorySummary,
}

// ---------------------------------------------------------------------------
// Responses
// ---------------------------------------------------------------------------

/// Cached telemetry for one host.
///
/// `stale` is set when the host currently has no live session; the data is
/// then the last snapshot written while it was reachable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct TelemetryView<T> {
    pub host_id: String,
    pub stale: bool,
    pub connected: bool,
    pub last_updated_at: Timestamp,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_success_at: Option<Timestamp>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    pub data: T,
}

/// Per-host lifecycle position in the scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleState {
    Disconnected,
    Connecting,
    Connected,
    Backoff,
    GivenUp,
}

impl std::fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LifecycleState::Disconnected => write!(f, "disconnected"),
            LifecycleState::Connecting => write!(f, "connecting"),
            LifecycleState::Connected => write!(f, "connected"),
            LifecycleState::Backoff => write!(f, "backoff"),
            LifecycleState::GivenUp => write!(f, "given_up"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct RefreshConfig {
    pub auto_refresh: bool,
    #[schemars(schema_with = "crate::fleet::schema::uint")]
    pub interval_ms: u64,
}

impl Default for RefreshConfig {
    fn default() -> Self {
        Self {
            auto_refresh: true,
            interval_ms: crate::fleet::config::DEFAULT_REFRESH_INTERVAL_MS,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct RefreshStatus {
    pub host_id: String,
    pub refreshing: bool,
    pub auto_refresh: bool,
    #[schemars(schema_with = "crate::fleet::schema::uint")]
    pub interval_ms: u64,
    /// Absent when the scheduler is not tracking the host
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<LifecycleState>,
    #[schemars(schema_with = "crate::fleet::schema::uint")]
    pub reconnect_attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_connect_attempt_at: Option<Timestamp>,
}

/// Result of a manual refresh request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case", tag = "outcome")]
pub enum RefreshOutcome {
    Completed,
    Failed { error: String },
    /// Another refresh for the host was already in flight
    Skipped,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct FleetOverviewEntry {
    pub host_id: String,
    pub host_name: String,
    pub connected: bool,
    pub auto_refresh: bool,
    #[schemars(schema_with = "crate::fleet::schema::uint")]
    pub interval_ms: u64,
    pub refreshing: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<LifecycleState>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub accelerator_last_updated: Option<Timestamp>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_last_updated: Option<Timestamp>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, JsonSchema)]
pub struct FleetOverview {
    pub hosts: Vec<FleetOverviewEntry>,
    pub count: usize,
}

/// Registry session metadata returned on connect.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SessionInfo {
    pub host_id: String,
    pub address: String,
    pub username: String,
    /// RFC3339
    pub connected_at: String,
    /// True when an existing live session passed the liveness probe and was kept
    pub reused: bool,
}

#[derive(Debug, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct DisconnectResponse {
    pub host_id: String,
    /// Interactive sessions closed along with the connection
    pub closed_sessions: usize,
    pub message: String,
}

/// Metadata of one interactive shell.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ShellSessionInfo {
    pub session_id: String,
    pub host_id: String,
    #[schemars(schema_with = "crate::fleet::schema::uint")]
    pub cols: u32,
    #[schemars(schema_with = "crate::fleet::schema::uint")]
    pub rows: u32,
    pub created_at: Timestamp,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum FileKind {
    Directory,
    File,
    Symlink,
    Other,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct FileEntry {
    pub name: String,
    pub path: String,
    pub kind: FileKind,
    #[schemars(schema_with = "crate::fleet::schema::uint")]
    pub size: u64,
    pub permissions: String,
    pub owner: String,
    pub group: String,
    /// Raw modification date as printed by the remote listing
    pub modified: String,
    /// Best-effort epoch milliseconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub modified_at: Option<Timestamp>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub link_target: Option<String>,
}

impl FileEntry {
    pub fn is_dir(&self) -> bool {
        self.kind == FileKind::Directory
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct DirectoryListing {
    pub path: String,
    pub entries: Vec<FileEntry>,
    /// Absent at the filesystem root
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_path: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, JsonSchema)]
pub struct AutocompleteResponse {
    pub suggestions: Vec<String>,
}
