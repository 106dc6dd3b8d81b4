//! Host inventory boundary.
//!
//! Host records and their refresh configuration are owned by an external
//! configuration store. The core only reads hosts and persists refresh
//! settings through the [`HostStore`] trait. [`InMemoryHostStore`] is the
//! bundled implementation, optionally seeded from a JSON inventory file:
//!
//! ```json
//! [
//!   {
//!     "id": "h1",
//!     "name": "train-node-01",
//!     "address": "10.0.0.11:22",
//!     "username": "ops",
//!     "credentials": { "type": "key_file", "path": "/etc/fleet/id_ed25519" },
//!     "refresh": { "autoRefresh": true, "intervalMs": 30000 }
//!   }
//! ]
//! ```

use std::fmt;
use std::path::{Path, PathBuf};

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::fleet::error::FleetError;
use crate::fleet::types::RefreshConfig;

/// Secret material used to authenticate against a host.
///
/// `Debug` redacts every secret.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Credentials {
    Password {
        password: String,
    },
    PrivateKey {
        pem: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        passphrase: Option<String>,
    },
    KeyFile {
        path: PathBuf,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        passphrase: Option<String>,
    },
    Agent,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Credentials::Password { .. } => f.write_str("Password(<redacted>)"),
            Credentials::PrivateKey { .. } => f.write_str("PrivateKey(<redacted>)"),
            Credentials::KeyFile { path, .. } => write!(f, "KeyFile({:?})", path),
            Credentials::Agent => f.write_str("Agent"),
        }
    }
}

/// A monitored host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Host {
    pub id: String,
    pub name: String,
    /// `host` or `host:port`
    pub address: String,
    pub username: String,
    pub credentials: Credentials,
}

/// Read-mostly view of the external configuration store.
pub trait HostStore: Send + Sync {
    fn get_host(&self, id: &str) -> Option<Host>;

    fn list_host_ids(&self) -> Vec<String>;

    /// Refresh settings for the host, or the defaults when none were stored.
    fn get_refresh_config(&self, id: &str) -> RefreshConfig;

    fn set_refresh_config(&self, id: &str, config: RefreshConfig) -> Result<(), FleetError>;
}

#[derive(Debug, Deserialize)]
struct InventoryEntry {
    #[serde(flatten)]
    host: Host,
    #[serde(default)]
    refresh: Option<RefreshConfig>,
}

/// DashMap-backed [`HostStore`].
#[derive(Default)]
pub struct InMemoryHostStore {
    hosts: DashMap<String, Host>,
    refresh: DashMap<String, RefreshConfig>,
}

impl InMemoryHostStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, host: Host) {
        self.hosts.insert(host.id.clone(), host);
    }

    pub fn remove(&self, id: &str) -> Option<Host> {
        self.refresh.remove(id);
        self.hosts.remove(id).map(|(_, host)| host)
    }

    /// Parse a JSON inventory (array of hosts with optional `refresh`).
    pub fn from_json(json: &str) -> Result<Self, FleetError> {
        let entries: Vec<InventoryEntry> = serde_json::from_str(json)?;
        let store = Self::new();
        for entry in entries {
            if entry.host.id.trim().is_empty() {
                return Err(FleetError::Validation("host id must not be empty".into()));
            }
            if let Some(refresh) = entry.refresh {
                crate::fleet::config::validate_refresh_interval(refresh.interval_ms)?;
                store.refresh.insert(entry.host.id.clone(), refresh);
            }
            store.insert(entry.host);
        }
        Ok(store)
    }

    /// Load an inventory file.
    pub fn load(path: &Path) -> Result<Self, FleetError> {
        let json = std::fs::read_to_string(path).map_err(|e| {
            FleetError::NotFound(format!("host inventory {}: {}", path.display(), e))
        })?;
        let store = Self::from_json(&json)?;
        info!(
            "Loaded {} host(s) from {}",
            store.hosts.len(),
            path.display()
        );
        Ok(store)
    }
}

impl HostStore for InMemoryHostStore {
    fn get_host(&self, id: &str) -> Option<Host> {
        self.hosts.get(id).map(|h| h.clone())
    }

    fn list_host_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.hosts.iter().map(|h| h.key().clone()).collect();
        ids.sort();
        ids
    }

    fn get_refresh_config(&self, id: &str) -> RefreshConfig {
        self.refresh.get(id).map(|c| *c).unwrap_or_default()
    }

    fn set_refresh_config(&self, id: &str, config: RefreshConfig) -> Result<(), FleetError> {
        if !self.hosts.contains_key(id) {
            return Err(FleetError::NotFound(format!("host {}", id)));
        }
        self.refresh.insert(id.to_string(), config);
        Ok(())
    }
}

#[cfg(test)]
pub(crate) fn test_host(id: &str) -> Host {
    Host {
        id: id.to_string(),
        name: format!("{}-name", id),
        address: "127.0.0.1:22".to_string(),
        username: "ops".to_string(),
        credentials: Credentials::Password {
            password: "secret".to_string(),
        },
    }
}
