//! Remote session registry.
//!
//! Holds zero or one live authenticated SSH session per host and is the only
//! owner of those sessions. The scheduler, the shell bridge and the transfer
//! gateway all reach hosts through the [`RemoteSessions`] trait, injected as an
//! `Arc<dyn RemoteSessions>`.
//!
//! # Concurrency
//!
//! - `connect` is serialized per host, so two concurrent connects never open
//!   two sessions for one host.
//! - `execute` may be called concurrently for the same host. Each call opens
//!   its own exec channel; a per-host semaphore bounds how many run at once so
//!   fan-out queries stay under the server's `MaxSessions`.
//! - A session found closed by the transport is evicted on the spot and the
//!   caller gets [`FleetError::NotConnected`].
//!
//! No retries happen here; callers decide.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use russh::{Disconnect, client};
use tokio::sync::{Mutex, Semaphore, mpsc};
use tracing::{debug, info, warn};

use crate::fleet::client::{connect_to_ssh, execute_ssh_command, open_pty_shell};
use crate::fleet::config::{LIVENESS_TIMEOUT, RegistryConfig};
use crate::fleet::error::FleetError;
use crate::fleet::hosts::{Credentials, Host};
use crate::fleet::session::SshClientHandler;
use crate::fleet::storage::{DashMapSessionStorage, SessionStorage, StoredSession};
use crate::fleet::types::{CommandOutput, SessionInfo};

/// Command used to probe session liveness.
pub(crate) const LIVENESS_COMMAND: &str = "echo alive";

/// Terminal size in character cells.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PtySize {
    pub cols: u32,
    pub rows: u32,
}

impl Default for PtySize {
    fn default() -> Self {
        Self { cols: 80, rows: 24 }
    }
}

/// Client-to-remote messages for an interactive shell stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShellCommand {
    Data(Vec<u8>),
    Resize(PtySize),
    Close,
}

/// Duplex byte stream to a remote PTY shell.
pub struct ShellChannel {
    pub input: mpsc::Sender<ShellCommand>,
    pub output: mpsc::Receiver<Vec<u8>>,
}

/// Registry contract shared by every component that talks to hosts.
#[async_trait]
pub trait RemoteSessions: Send + Sync {
    /// Reuse the host's live session if it passes a liveness probe, otherwise
    /// open and authenticate a new one. `credentials` replaces the stored ones.
    async fn connect(
        &self,
        host: &Host,
        credentials: Option<Credentials>,
    ) -> Result<SessionInfo, FleetError>;

    /// Close and forget the host's session. Returns whether one existed.
    async fn disconnect(&self, host_id: &str) -> bool;

    /// Run a command. Non-zero exit is returned as data, not as an error.
    async fn execute(
        &self,
        host_id: &str,
        command: &str,
        timeout: Duration,
    ) -> Result<CommandOutput, FleetError>;

    /// Non-blocking membership check.
    fn is_connected(&self, host_id: &str) -> bool;

    /// Real liveness probe; evicts the session and returns false on failure.
    async fn is_alive(&self, host_id: &str) -> bool;

    /// Open a PTY-backed shell on the host's session.
    async fn open_shell(&self, host_id: &str, size: PtySize) -> Result<ShellChannel, FleetError>;
}

/// russh-backed [`RemoteSessions`].
pub struct SshSessionRegistry {
    sessions: DashMapSessionStorage,
    connect_locks: DashMap<String, Arc<Mutex<()>>>,
    config: RegistryConfig,
}

impl SshSessionRegistry {
    pub fn new(config: RegistryConfig) -> Self {
        Self {
            sessions: DashMapSessionStorage::new(),
            connect_locks: DashMap::new(),
            config,
        }
    }

    pub fn from_env() -> Self {
        Self::new(RegistryConfig::from_env())
    }

    fn connect_lock(&self, host_id: &str) -> Arc<Mutex<()>> {
        self.connect_locks
            .entry(host_id.to_string())
            .or_default()
            .clone()
    }

    async fn probe(handle: &client::Handle<SshClientHandler>) -> bool {
        if handle.is_closed() {
            return false;
        }
        matches!(
            execute_ssh_command(handle, LIVENESS_COMMAND, LIVENESS_TIMEOUT).await,
            Ok(output) if output.success()
        )
    }

    /// Drop `handle` from the map (if it is still the host's session) and close it.
    async fn evict(&self, host_id: &str, handle: &Arc<client::Handle<SshClientHandler>>) {
        if self.sessions.remove_if_handle(host_id, handle).is_some() {
            warn!("Evicting dead session for host {}", host_id);
        }
        let _ = handle
            .disconnect(Disconnect::ByApplication, "session evicted", "en")
            .await;
    }
}

#[async_trait]
impl RemoteSessions for SshSessionRegistry {
    async fn connect(
        &self,
        host: &Host,
        credentials: Option<Credentials>,
    ) -> Result<SessionInfo, FleetError> {
        let lock = self.connect_lock(&host.id);
        let _guard = lock.lock().await;

        if let Some(existing) = self.sessions.get(&host.id) {
            if Self::probe(&existing.handle).await {
                debug!("Reusing live session for host {}", host.id);
                return Ok(SessionInfo {
                    reused: true,
                    ..existing.info
                });
            }
            self.evict(&host.id, &existing.handle).await;
        }

        info!(
            "Connecting to {} ({}@{})",
            host.id, host.username, host.address
        );

        let handle = connect_to_ssh(
            host,
            credentials.as_ref(),
            self.config.connect_timeout,
            self.config.compress,
        )
        .await?;

        let info = SessionInfo {
            host_id: host.id.clone(),
            address: host.address.clone(),
            username: host.username.clone(),
            connected_at: chrono::Utc::now().to_rfc3339(),
            reused: false,
        };

        self.sessions.insert(
            host.id.clone(),
            StoredSession {
                info: info.clone(),
                handle: Arc::new(handle),
                channels: Arc::new(Semaphore::new(self.config.max_channels_per_host)),
            },
        );

        info!("Connected to host {}", host.id);
        Ok(info)
    }

    async fn disconnect(&self, host_id: &str) -> bool {
        match self.sessions.remove(host_id) {
            Some(session) => {
                if let Err(e) = session
                    .handle
                    .disconnect(Disconnect::ByApplication, "disconnected", "en")
                    .await
                {
                    debug!("Disconnect of host {} reported: {}", host_id, e);
                }
                info!("Disconnected host {}", host_id);
                true
            }
            None => false,
        }
    }

    async fn execute(
        &self,
        host_id: &str,
        command: &str,
        timeout: Duration,
    ) -> Result<CommandOutput, FleetError> {
        let session = self
            .sessions
            .get(host_id)
            .ok_or_else(|| FleetError::NotConnected(host_id.to_string()))?;

        if session.handle.is_closed() {
            self.evict(host_id, &session.handle).await;
            return Err(FleetError::NotConnected(host_id.to_string()));
        }

        let _permit = session
            .channels
            .acquire()
            .await
            .map_err(|_| FleetError::NotConnected(host_id.to_string()))?;

        match execute_ssh_command(&session.handle, command, timeout).await {
            Err(_) if session.handle.is_closed() => {
                self.evict(host_id, &session.handle).await;
                Err(FleetError::NotConnected(host_id.to_string()))
            }
            result => result,
        }
    }

    fn is_connected(&self, host_id: &str) -> bool {
        self.sessions.contains(host_id)
    }

    async fn is_alive(&self, host_id: &str) -> bool {
        let Some(session) = self.sessions.get(host_id) else {
            return false;
        };
        if Self::probe(&session.handle).await {
            return true;
        }
        self.evict(host_id, &session.handle).await;
        false
    }

    async fn open_shell(&self, host_id: &str, size: PtySize) -> Result<ShellChannel, FleetError> {
        let session = self
            .sessions
            .get(host_id)
            .ok_or_else(|| FleetError::NotConnected(host_id.to_string()))?;

        match open_pty_shell(&session.handle, size).await {
            Err(_) if session.handle.is_closed() => {
                self.evict(host_id, &session.handle).await;
                Err(FleetError::NotConnected(host_id.to_string()))
            }
            result => result,
        }
    }
}
