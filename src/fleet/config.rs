//! Configuration resolution for the fleet core.
//!
//! Values follow a three-tier priority system:
//!
//! 1. **Parameter** - Explicitly provided function parameter (highest priority)
//! 2. **Environment Variable** - Value from environment variable
//! 3. **Default** - Built-in default value (lowest priority)
//!
//! # Environment Variables
//!
//! | Variable | Default | Description |
//! |----------|---------|-------------|
//! | `FLEET_CONNECT_TIMEOUT` | 30s | SSH connection timeout in seconds |
//! | `FLEET_COMMAND_TIMEOUT` | 30s | Remote command timeout in seconds |
//! | `FLEET_COMMAND_ATTEMPTS` | 3 | Attempts per telemetry command |
//! | `FLEET_COMMAND_RETRY_DELAY_MS` | 1000ms | Fixed delay between command attempts |
//! | `FLEET_RECONNECT_INITIAL_MS` | 60000ms | First reconnect backoff |
//! | `FLEET_RECONNECT_MAX_MS` | 600000ms | Reconnect backoff cap |
//! | `FLEET_MAX_RECONNECT_ATTEMPTS` | 10 | Connect failures before giving up |
//! | `FLEET_HISTORY_RETENTION_HOURS` | 24h | History retention horizon |
//! | `FLEET_CLEANUP_INTERVAL_SECS` | 3600s | Period of the retention sweep |
//! | `FLEET_MAX_CHANNELS_PER_HOST` | 8 | Concurrent exec channels per session |
//! | `FLEET_COMPRESSION` | true | Enable zlib compression |
//! | `FLEET_HOSTS_FILE` | hosts.json | Host inventory loaded by the binaries |

use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::fleet::error::FleetError;

/// Default SSH connection timeout in seconds
pub(crate) const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 30;

/// Default remote command timeout in seconds
pub(crate) const DEFAULT_COMMAND_TIMEOUT_SECS: u64 = 30;

/// Default attempts per telemetry command
pub(crate) const DEFAULT_COMMAND_ATTEMPTS: u32 = 3;

/// Default delay between command attempts in milliseconds
pub(crate) const DEFAULT_COMMAND_RETRY_DELAY_MS: u64 = 1000;

/// Default first reconnect backoff (1 minute)
pub(crate) const DEFAULT_RECONNECT_INITIAL_MS: u64 = 60_000;

/// Default reconnect backoff cap (10 minutes)
pub(crate) const DEFAULT_RECONNECT_MAX_MS: u64 = 600_000;

/// Default number of connect failures tolerated before giving up
pub(crate) const DEFAULT_MAX_RECONNECT_ATTEMPTS: u32 = 10;

/// Default history retention in hours
pub(crate) const DEFAULT_HISTORY_RETENTION_HOURS: u64 = 24;

/// Default retention sweep period in seconds
pub(crate) const DEFAULT_CLEANUP_INTERVAL_SECS: u64 = 3600;

/// Default concurrent exec channels per SSH session
pub(crate) const DEFAULT_MAX_CHANNELS_PER_HOST: usize = 8;

/// Default host inventory path
pub(crate) const DEFAULT_HOSTS_FILE: &str = "hosts.json";

/// Refresh interval bounds and default, in milliseconds
pub const MIN_REFRESH_INTERVAL_MS: u64 = 10_000;
pub const MAX_REFRESH_INTERVAL_MS: u64 = 300_000;
pub const DEFAULT_REFRESH_INTERVAL_MS: u64 = 30_000;

/// Liveness probe timeout
pub(crate) const LIVENESS_TIMEOUT: Duration = Duration::from_secs(5);

pub(crate) const CONNECT_TIMEOUT_ENV_VAR: &str = "FLEET_CONNECT_TIMEOUT";
pub(crate) const COMMAND_TIMEOUT_ENV_VAR: &str = "FLEET_COMMAND_TIMEOUT";
pub(crate) const COMMAND_ATTEMPTS_ENV_VAR: &str = "FLEET_COMMAND_ATTEMPTS";
pub(crate) const COMMAND_RETRY_DELAY_ENV_VAR: &str = "FLEET_COMMAND_RETRY_DELAY_MS";
pub(crate) const RECONNECT_INITIAL_ENV_VAR: &str = "FLEET_RECONNECT_INITIAL_MS";
pub(crate) const RECONNECT_MAX_ENV_VAR: &str = "FLEET_RECONNECT_MAX_MS";
pub(crate) const MAX_RECONNECT_ATTEMPTS_ENV_VAR: &str = "FLEET_MAX_RECONNECT_ATTEMPTS";
pub(crate) const HISTORY_RETENTION_ENV_VAR: &str = "FLEET_HISTORY_RETENTION_HOURS";
pub(crate) const CLEANUP_INTERVAL_ENV_VAR: &str = "FLEET_CLEANUP_INTERVAL_SECS";
pub(crate) const MAX_CHANNELS_ENV_VAR: &str = "FLEET_MAX_CHANNELS_PER_HOST";
pub(crate) const COMPRESSION_ENV_VAR: &str = "FLEET_COMPRESSION";
pub(crate) const HOSTS_FILE_ENV_VAR: &str = "FLEET_HOSTS_FILE";

/// Resolve a value with priority: parameter -> env var -> default.
///
/// Unparseable environment values fall through to the default.
fn resolve<T: FromStr>(param: Option<T>, env_var: &str, default: T) -> T {
    // Priority 1: Use parameter if provided
    if let Some(value) = param {
        return value;
    }

    // Priority 2: Use environment variable if set
    if let Ok(raw) = env::var(env_var)
        && let Ok(value) = raw.trim().parse::<T>()
    {
        return value;
    }

    // Priority 3: Default value
    default
}

pub(crate) fn resolve_connect_timeout(timeout_secs: Option<u64>) -> Duration {
    Duration::from_secs(resolve(
        timeout_secs,
        CONNECT_TIMEOUT_ENV_VAR,
        DEFAULT_CONNECT_TIMEOUT_SECS,
    ))
}

pub(crate) fn resolve_command_timeout(timeout_secs: Option<u64>) -> Duration {
    Duration::from_secs(resolve(
        timeout_secs,
        COMMAND_TIMEOUT_ENV_VAR,
        DEFAULT_COMMAND_TIMEOUT_SECS,
    ))
}

/// Attempts per command; never less than one.
pub(crate) fn resolve_command_attempts(attempts: Option<u32>) -> u32 {
    resolve(attempts, COMMAND_ATTEMPTS_ENV_VAR, DEFAULT_COMMAND_ATTEMPTS).max(1)
}

pub(crate) fn resolve_command_retry_delay(delay_ms: Option<u64>) -> Duration {
    Duration::from_millis(resolve(
        delay_ms,
        COMMAND_RETRY_DELAY_ENV_VAR,
        DEFAULT_COMMAND_RETRY_DELAY_MS,
    ))
}

/// Concurrent exec channels per host; never less than one.
pub(crate) fn resolve_max_channels(max: Option<usize>) -> usize {
    resolve(max, MAX_CHANNELS_ENV_VAR, DEFAULT_MAX_CHANNELS_PER_HOST).max(1)
}

/// Resolve the compression setting with priority: parameter -> env var -> default (true)
pub(crate) fn resolve_compression(compress_param: Option<bool>) -> bool {
    if let Some(compress) = compress_param {
        return compress;
    }

    if let Ok(env_compress) = env::var(COMPRESSION_ENV_VAR) {
        return env_compress.eq_ignore_ascii_case("true") || env_compress == "1";
    }

    true
}

pub fn resolve_hosts_file(path: Option<String>) -> PathBuf {
    PathBuf::from(resolve(
        path,
        HOSTS_FILE_ENV_VAR,
        DEFAULT_HOSTS_FILE.to_string(),
    ))
}

/// Reject refresh intervals outside `[MIN_REFRESH_INTERVAL_MS, MAX_REFRESH_INTERVAL_MS]`.
pub fn validate_refresh_interval(interval_ms: u64) -> Result<u64, FleetError> {
    if (MIN_REFRESH_INTERVAL_MS..=MAX_REFRESH_INTERVAL_MS).contains(&interval_ms) {
        Ok(interval_ms)
    } else {
        Err(FleetError::Validation(format!(
            "refresh interval must be between {} and {} ms, got {}",
            MIN_REFRESH_INTERVAL_MS, MAX_REFRESH_INTERVAL_MS, interval_ms
        )))
    }
}

/// Settings for opening SSH sessions.
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    pub connect_timeout: Duration,
    pub compress: bool,
    pub max_channels_per_host: usize,
}

impl RegistryConfig {
    pub fn from_env() -> Self {
        Self {
            connect_timeout: resolve_connect_timeout(None),
            compress: resolve_compression(None),
            max_channels_per_host: resolve_max_channels(None),
        }
    }
}

/// Per-command timeout and retry policy used while collecting telemetry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommandPolicy {
    pub timeout: Duration,
    pub attempts: u32,
    pub retry_delay: Duration,
}

impl CommandPolicy {
    pub fn from_env() -> Self {
        Self {
            timeout: resolve_command_timeout(None),
            attempts: resolve_command_attempts(None),
            retry_delay: resolve_command_retry_delay(None),
        }
    }
}

impl Default for CommandPolicy {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(DEFAULT_COMMAND_TIMEOUT_SECS),
            attempts: DEFAULT_COMMAND_ATTEMPTS,
            retry_delay: Duration::from_millis(DEFAULT_COMMAND_RETRY_DELAY_MS),
        }
    }
}

/// Scheduler tunables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchedulerConfig {
    pub reconnect_initial: Duration,
    pub reconnect_max: Duration,
    pub max_reconnect_attempts: u32,
    pub history_retention: Duration,
    pub cleanup_interval: Duration,
    pub command: CommandPolicy,
}

impl SchedulerConfig {
    pub fn from_env() -> Self {
        Self {
            reconnect_initial: Duration::from_millis(resolve(
                None,
                RECONNECT_INITIAL_ENV_VAR,
                DEFAULT_RECONNECT_INITIAL_MS,
            )),
            reconnect_max: Duration::from_millis(resolve(
                None,
                RECONNECT_MAX_ENV_VAR,
                DEFAULT_RECONNECT_MAX_MS,
            )),
            max_reconnect_attempts: resolve(
                None,
                MAX_RECONNECT_ATTEMPTS_ENV_VAR,
                DEFAULT_MAX_RECONNECT_ATTEMPTS,
            ),
            history_retention: Duration::from_secs(
                resolve(
                    None,
                    HISTORY_RETENTION_ENV_VAR,
                    DEFAULT_HISTORY_RETENTION_HOURS,
                ) * 3600,
            ),
            cleanup_interval: Duration::from_secs(
                resolve(None, CLEANUP_INTERVAL_ENV_VAR, DEFAULT_CLEANUP_INTERVAL_SECS).max(1),
            ),
            command: CommandPolicy::from_env(),
        }
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            reconnect_initial: Duration::from_millis(DEFAULT_RECONNECT_INITIAL_MS),
            reconnect_max: Duration::from_millis(DEFAULT_RECONNECT_MAX_MS),
            max_reconnect_attempts: DEFAULT_MAX_RECONNECT_ATTEMPTS,
            history_retention: Duration::from_secs(DEFAULT_HISTORY_RETENTION_HOURS * 3600),
            cleanup_interval: Duration::from_secs(DEFAULT_CLEANUP_INTERVAL_SECS),
            command: CommandPolicy::default(),
        }
    }
}
