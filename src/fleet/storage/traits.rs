//! Storage trait definitions.

use std::sync::Arc;

use russh::client;
use tokio::sync::{Semaphore, mpsc};

use crate::fleet::registry::ShellCommand;
use crate::fleet::session::SshClientHandler;
use crate::fleet::shell::RunningShell;
use crate::fleet::types::{SessionInfo, ShellSessionInfo};

/// A live registry session.
pub struct StoredSession {
    pub info: SessionInfo,
    pub handle: Arc<client::Handle<SshClientHandler>>,
    /// Bounds concurrent exec channels on this session
    pub channels: Arc<Semaphore>,
}

/// Cloned view of a stored session.
#[derive(Clone)]
pub struct SessionRef {
    pub info: SessionInfo,
    pub handle: Arc<client::Handle<SshClientHandler>>,
    pub channels: Arc<Semaphore>,
}

/// Host-keyed storage of registry sessions; at most one per host.
pub trait SessionStorage: Send + Sync {
    /// Insert the session for a host, returning any session it replaced.
    fn insert(&self, host_id: String, session: StoredSession) -> Option<SessionRef>;

    fn get(&self, host_id: &str) -> Option<SessionRef>;

    fn remove(&self, host_id: &str) -> Option<SessionRef>;

    /// Remove the host's session only if it still holds `handle`.
    ///
    /// Keeps a session opened by a concurrent reconnect from being evicted
    /// on behalf of the stale one.
    fn remove_if_handle(
        &self,
        host_id: &str,
        handle: &Arc<client::Handle<SshClientHandler>>,
    ) -> Option<SessionRef>;

    fn contains(&self, host_id: &str) -> bool;

    fn host_ids(&self) -> Vec<String>;

    fn list(&self) -> Vec<SessionInfo>;
}

/// Storage of interactive shells with a per-host secondary index.
pub trait ShellStorage: Send + Sync {
    fn register(&self, shell: RunningShell);

    fn unregister(&self, session_id: &str) -> Option<RunningShell>;

    /// Input side of the shell's stream.
    fn input(&self, session_id: &str) -> Option<mpsc::Sender<ShellCommand>>;

    /// Remember a new terminal size. Returns false for unknown sessions.
    fn set_size(&self, session_id: &str, cols: u32, rows: u32) -> bool;

    fn info(&self, session_id: &str) -> Option<ShellSessionInfo>;

    fn list_by_host(&self, host_id: &str) -> Vec<String>;

    fn count_by_host(&self, host_id: &str) -> usize;

    fn list_filtered(&self, host_id: Option<&str>) -> Vec<ShellSessionInfo>;
}
