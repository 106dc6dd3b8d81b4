//! DashMap-based interactive shell storage.
//!
//! Includes a secondary index for O(1) host-to-shells lookups.

use std::collections::HashSet;

use dashmap::DashMap;
use tokio::sync::mpsc;

use crate::fleet::registry::ShellCommand;
use crate::fleet::shell::RunningShell;
use crate::fleet::types::ShellSessionInfo;

use super::traits::ShellStorage;

/// DashMap-based implementation of `ShellStorage`.
///
/// - Primary storage: session_id -> RunningShell
/// - Secondary index: host_id -> HashSet<session_id>
#[derive(Default)]
pub struct DashMapShellStorage {
    shells: DashMap<String, RunningShell>,
    shells_by_host: DashMap<String, HashSet<String>>,
}

impl DashMapShellStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ShellStorage for DashMapShellStorage {
    fn register(&self, shell: RunningShell) {
        let host_id = shell.info.host_id.clone();
        let session_id = shell.info.session_id.clone();

        self.shells.insert(session_id.clone(), shell);

        self.shells_by_host
            .entry(host_id)
            .or_default()
            .insert(session_id);
    }

    fn unregister(&self, session_id: &str) -> Option<RunningShell> {
        let removed = self.shells.remove(session_id).map(|(_, shell)| shell);

        if let Some(ref shell) = removed
            && let Some(mut set) = self.shells_by_host.get_mut(&shell.info.host_id)
        {
            set.remove(session_id);
            if set.is_empty() {
                drop(set);
                self.shells_by_host
                    .remove_if(&shell.info.host_id, |_, set| set.is_empty());
            }
        }

        removed
    }

    fn input(&self, session_id: &str) -> Option<mpsc::Sender<ShellCommand>> {
        self.shells.get(session_id).map(|shell| shell.input.clone())
    }

    fn set_size(&self, session_id: &str, cols: u32, rows: u32) -> bool {
        match self.shells.get_mut(session_id) {
            Some(mut shell) => {
                shell.info.cols = cols;
                shell.info.rows = rows;
                true
            }
            None => false,
        }
    }

    fn info(&self, session_id: &str) -> Option<ShellSessionInfo> {
        self.shells.get(session_id).map(|shell| shell.info.clone())
    }

    fn list_by_host(&self, host_id: &str) -> Vec<String> {
        self.shells_by_host
            .get(host_id)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default()
    }

    fn count_by_host(&self, host_id: &str) -> usize {
        self.shells_by_host
            .get(host_id)
            .map(|set| set.len())
            .unwrap_or(0)
    }

    fn list_filtered(&self, host_id: Option<&str>) -> Vec<ShellSessionInfo> {
        self.shells
            .iter()
            .filter(|entry| host_id.map(|h| entry.info.host_id == h).unwrap_or(true))
            .map(|entry| entry.info.clone())
            .collect()
    }
}
