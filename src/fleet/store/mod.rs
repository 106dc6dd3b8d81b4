//! Cache & history store.
//!
//! Holds the latest snapshot per (host, kind) as an opaque JSON payload, the
//! per-host connection status, and the history tables. Every write replaces
//! an entry wholesale under the map's shard lock, so readers never observe a
//! half-written entry and need no extra locking.
//!
//! # Invariants
//!
//! - `last_success_at` never decreases.
//! - A failed write keeps the previous `last_success_at`.
//! - A payload that no longer deserializes reads as a cache miss.

mod history;

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{debug, info, warn};

use crate::fleet::clock::Clock;
use crate::fleet::error::FleetError;
use crate::fleet::types::{
    AcceleratorHistory, AcceleratorSnapshot, SystemHistory, SystemSnapshot, TelemetryView,
    Timestamp,
};

pub use history::AcceleratorFilter;
use history::{HistoryTables, accelerator_rows, summarize_accelerator, summarize_system, system_row};

/// Which snapshot a cache entry holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SnapshotKind {
    Accelerator,
    System,
}

impl std::fmt::Display for SnapshotKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SnapshotKind::Accelerator => write!(f, "accelerator"),
            SnapshotKind::System => write!(f, "system"),
        }
    }
}

#[derive(Debug, Clone)]
struct StoredEntry {
    payload: String,
    last_updated_at: Timestamp,
    last_success_at: Option<Timestamp>,
    last_error: Option<String>,
}

/// Connection status as last recorded by the scheduler.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConnectionStatus {
    pub connected: bool,
    pub last_connected_at: Option<Timestamp>,
    pub last_error: Option<String>,
}

/// A decoded cache entry merged with the host's connection status.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheEntry<T> {
    pub data: T,
    pub last_updated_at: Timestamp,
    pub last_success_at: Option<Timestamp>,
    pub last_error: Option<String>,
    pub connected: bool,
}

impl<T> CacheEntry<T> {
    pub fn into_view(self, host_id: &str, stale: bool) -> TelemetryView<T> {
        TelemetryView {
            host_id: host_id.to_string(),
            stale,
            connected: self.connected,
            last_updated_at: self.last_updated_at,
            last_success_at: self.last_success_at,
            last_error: self.last_error,
            data: self.data,
        }
    }
}

pub struct TelemetryStore {
    entries: DashMap<(String, SnapshotKind), StoredEntry>,
    connections: DashMap<String, ConnectionStatus>,
    history: HistoryTables,
    clock: Arc<dyn Clock>,
}

impl TelemetryStore {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: DashMap::new(),
            connections: DashMap::new(),
            history: HistoryTables::default(),
            clock,
        }
    }

    pub fn now_ms(&self) -> Timestamp {
        self.clock.now_ms()
    }

    /// Serialize `snapshot` and replace the (host, kind) entry.
    ///
    /// On success `last_success_at` is stamped and the error cleared; on
    /// failure the previous `last_success_at` is kept and `error` recorded.
    pub fn write_snapshot<T: Serialize>(
        &self,
        host_id: &str,
        kind: SnapshotKind,
        snapshot: &T,
        success: bool,
        error: Option<String>,
    ) -> Result<(), FleetError> {
        let payload = serde_json::to_string(snapshot)?;
        let now = self.clock.now_ms();

        let mut entry = self
            .entries
            .entry((host_id.to_string(), kind))
            .or_insert_with(|| StoredEntry {
                payload: String::new(),
                last_updated_at: now,
                last_success_at: None,
                last_error: None,
            });

        let previous_success = entry.last_success_at;
        *entry = StoredEntry {
            payload,
            last_updated_at: now,
            last_success_at: if success {
                Some(previous_success.map_or(now, |prev| prev.max(now)))
            } else {
                previous_success
            },
            last_error: if success { None } else { error },
        };

        debug!(
            "Stored {} snapshot for host {} (success: {})",
            kind, host_id, success
        );
        Ok(())
    }

    /// Read and decode the (host, kind) entry.
    ///
    /// `None` when never written or when the payload does not decode as `T`.
    pub fn read_snapshot<T: DeserializeOwned>(
        &self,
        host_id: &str,
        kind: SnapshotKind,
    ) -> Option<CacheEntry<T>> {
        let stored = self
            .entries
            .get(&(host_id.to_string(), kind))
            .map(|e| e.value().clone())?;

        let data = match serde_json::from_str::<T>(&stored.payload) {
            Ok(data) => data,
            Err(e) => {
                warn!(
                    "Discarding malformed {} cache payload for host {}: {}",
                    kind, host_id, e
                );
                return None;
            }
        };

        let connection = self.connection_status(host_id).unwrap_or_default();
        let connected = connection.connected;
        let connection_error = if connected { None } else { connection.last_error };
        Some(CacheEntry {
            data,
            last_updated_at: stored.last_updated_at,
            last_success_at: stored.last_success_at,
            last_error: stored.last_error.or(connection_error),
            connected,
        })
    }

    pub fn last_updated(&self, host_id: &str, kind: SnapshotKind) -> Option<Timestamp> {
        self.entries
            .get(&(host_id.to_string(), kind))
            .map(|e| e.last_updated_at)
    }

    /// Most relevant error for the host: the connection error while
    /// disconnected, otherwise the newest failed snapshot's error.
    pub fn last_error(&self, host_id: &str) -> Option<String> {
        if let Some(status) = self.connection_status(host_id)
            && !status.connected
            && status.last_error.is_some()
        {
            return status.last_error;
        }
        [SnapshotKind::Accelerator, SnapshotKind::System]
            .into_iter()
            .filter_map(|kind| {
                self.entries
                    .get(&(host_id.to_string(), kind))
                    .and_then(|e| e.last_error.clone().map(|err| (e.last_updated_at, err)))
            })
            .max_by_key(|(at, _)| *at)
            .map(|(_, err)| err)
    }

    pub fn set_connection_status(&self, host_id: &str, connected: bool, error: Option<String>) {
        let now = self.clock.now_ms();
        let mut status = self.connections.entry(host_id.to_string()).or_default();
        status.connected = connected;
        if connected {
            status.last_connected_at = Some(now);
            status.last_error = None;
        } else {
            status.last_error = error;
        }
    }

    pub fn connection_status(&self, host_id: &str) -> Option<ConnectionStatus> {
        self.connections.get(host_id).map(|s| s.value().clone())
    }

    /// Append one row per (npu, chip) observed in `snapshot`.
    pub fn append_accelerator_history(
        &self,
        host_id: &str,
        snapshot: &AcceleratorSnapshot,
        timestamp: Timestamp,
    ) {
        let rows = accelerator_rows(host_id, snapshot, timestamp);
        debug!("Appending {} accelerator history row(s) for {}", rows.len(), host_id);
        self.history.append_accelerator(host_id, rows);
    }

    pub fn append_system_history(
        &self,
        host_id: &str,
        snapshot: &SystemSnapshot,
        timestamp: Timestamp,
    ) {
        self.history
            .append_system(host_id, system_row(host_id, snapshot, timestamp));
    }

    /// Rows with `start <= timestamp <= end`, ascending, plus their aggregate.
    pub fn query_accelerator_history(
        &self,
        host_id: &str,
        filter: AcceleratorFilter,
        start: Timestamp,
        end: Timestamp,
    ) -> AcceleratorHistory {
        summarize_accelerator(self.history.accelerator_range(host_id, filter, start, end))
    }

    pub fn query_system_history(
        &self,
        host_id: &str,
        start: Timestamp,
        end: Timestamp,
    ) -> SystemHistory {
        summarize_system(self.history.system_range(host_id, start, end))
    }

    /// Delete history rows older than `now - horizon`. Returns rows removed.
    ///
    /// A horizon reaching past the epoch removes nothing.
    pub fn cleanup(&self, horizon: Duration) -> usize {
        let horizon_ms = i64::try_from(horizon.as_millis()).unwrap_or(i64::MAX);
        let cutoff = self.clock.now_ms().saturating_sub(horizon_ms);
        let removed = self.history.delete_before(cutoff);
        if removed > 0 {
            info!("History cleanup removed {} row(s)", removed);
        }
        removed
    }

    /// Forget everything stored for a host.
    pub fn remove_host(&self, host_id: &str) {
        self.entries.retain(|(id, _), _| id != host_id);
        self.connections.remove(host_id);
        self.history.remove_host(host_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fleet::testing::ManualClock;
    use crate::fleet::types::{Chip, SystemMemory};

    fn store() -> (TelemetryStore, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(0));
        (TelemetryStore::new(clock.clone()), clock)
    }

    fn system(usage_percent: i64) -> SystemSnapshot {
        SystemSnapshot {
            memory: SystemMemory {
                usage_percent,
                ..Default::default()
            },
            ..Default::default()
        }
    }

    mod cache {
        use super::*;

        #[test]
        fn test_never_written_is_miss() {
            let (store, _) = store();
            assert!(store
                .read_snapshot::<SystemSnapshot>("h1", SnapshotKind::System)
                .is_none());
            assert_eq!(store.last_updated("h1", SnapshotKind::System), None);
        }

        #[test]
        fn test_success_then_failure_preserves_last_success() {
            let (store, clock) = store();
            clock.set(1_000);
            store
                .write_snapshot("h1", SnapshotKind::System, &system(40), true, None)
                .unwrap();
            clock.set(2_000);
            store
                .write_snapshot(
                    "h1",
                    SnapshotKind::System,
                    &SystemSnapshot::default(),
                    false,
                    Some("boom".into()),
                )
                .unwrap();

            let entry = store
                .read_snapshot::<SystemSnapshot>("h1", SnapshotKind::System)
                .unwrap();
            assert_eq!(entry.last_updated_at, 2_000);
            assert_eq!(entry.last_success_at, Some(1_000));
            assert_eq!(entry.last_error.as_deref(), Some("boom"));
            assert_eq!(entry.data, SystemSnapshot::default());
        }

        #[test]
        fn test_last_success_never_decreases() {
            let (store, clock) = store();
            let mut last = None;
            for (at, success) in [(500, true), (900, false), (300, true), (1200, true), (50, false)]
            {
                clock.set(at);
                store
                    .write_snapshot(
                        "h1",
                        SnapshotKind::System,
                        &system(1),
                        success,
                        (!success).then(|| "x".to_string()),
                    )
                    .unwrap();
                let current = store
                    .read_snapshot::<SystemSnapshot>("h1", SnapshotKind::System)
                    .unwrap()
                    .last_success_at;
                assert!(current >= last);
                last = current;
            }
            assert_eq!(last, Some(1200));
        }

        #[test]
        fn test_kinds_are_independent() {
            let (store, _) = store();
            store
                .write_snapshot("h1", SnapshotKind::System, &system(5), true, None)
                .unwrap();
            assert!(store
                .read_snapshot::<AcceleratorSnapshot>("h1", SnapshotKind::Accelerator)
                .is_none());
        }

        #[test]
        fn test_malformed_payload_reads_as_miss() {
            let (store, _) = store();
            store
                .write_snapshot("h1", SnapshotKind::System, &"not a snapshot", true, None)
                .unwrap();
            assert!(store
                .read_snapshot::<SystemSnapshot>("h1", SnapshotKind::System)
                .is_none());
        }

        #[test]
        fn test_read_merges_connection_status() {
            let (store, _) = store();
            store
                .write_snapshot("h1", SnapshotKind::System, &system(5), true, None)
                .unwrap();
            store.set_connection_status("h1", false, Some("host h1 is not connected".into()));
            let entry = store
                .read_snapshot::<SystemSnapshot>("h1", SnapshotKind::System)
                .unwrap();
            assert!(!entry.connected);
            assert_eq!(entry.last_error.as_deref(), Some("host h1 is not connected"));

            store.set_connection_status("h1", true, None);
            let entry = store
                .read_snapshot::<SystemSnapshot>("h1", SnapshotKind::System)
                .unwrap();
            assert!(entry.connected);
            assert_eq!(entry.last_error, None);
        }

        #[test]
        fn test_last_error_prefers_connection_error() {
            let (store, clock) = store();
            store
                .write_snapshot("h1", SnapshotKind::System, &system(1), false, Some("df".into()))
                .unwrap();
            assert_eq!(store.last_error("h1").as_deref(), Some("df"));
            clock.set(10);
            store.set_connection_status("h1", false, Some("refused".into()));
            assert_eq!(store.last_error("h1").as_deref(), Some("refused"));
        }

        #[test]
        fn test_into_view() {
            let (store, _) = store();
            store
                .write_snapshot("h1", SnapshotKind::System, &system(5), true, None)
                .unwrap();
            let view = store
                .read_snapshot::<SystemSnapshot>("h1", SnapshotKind::System)
                .unwrap()
                .into_view("h1", true);
            assert!(view.stale);
            assert_eq!(view.host_id, "h1");
            assert_eq!(view.data.memory.usage_percent, 5);
        }
    }

    mod history {
        use super::*;

        fn accelerator(chips: &[(i64, i64)]) -> AcceleratorSnapshot {
            AcceleratorSnapshot {
                chips: chips
                    .iter()
                    .map(|&(npu_id, chip_id)| Chip {
                        npu_id,
                        chip_id,
                        name: "Ascend".into(),
                        health: "OK".into(),
                    })
                    .collect(),
                ..Default::default()
            }
        }

        #[test]
        fn test_window_and_aggregate() {
            let (store, _) = store();
            for (ts, usage) in [(100, 10), (200, 30), (300, 50), (400, 70)] {
                store.append_system_history("h1", &system(usage), ts);
            }
            let history = store.query_system_history("h1", 200, 300);
            assert_eq!(history.records.len(), 2);
            assert!(history.records.windows(2).all(|w| w[0].timestamp <= w[1].timestamp));
            let agg = history.summary.memory_usage_percent;
            assert_eq!((agg.min, agg.max), (30.0, 50.0));
            assert!(agg.max >= agg.avg && agg.avg >= agg.min);
        }

        #[test]
        fn test_empty_window_is_zero_aggregate() {
            let (store, _) = store();
            store.append_system_history("h1", &system(50), 100);
            let history = store.query_system_history("h1", 500, 600);
            assert!(history.records.is_empty());
            assert_eq!(history.summary.memory_usage_percent.max, 0.0);
        }

        #[test]
        fn test_accelerator_rows_per_chip() {
            let (store, _) = store();
            store.append_accelerator_history("h1", &accelerator(&[(0, 0), (1, 0)]), 100);
            let all = store.query_accelerator_history("h1", AcceleratorFilter::default(), 0, 100);
            assert_eq!(all.records.len(), 2);
            let one = store.query_accelerator_history(
                "h1",
                AcceleratorFilter {
                    npu_id: Some(1),
                    chip_id: Some(0),
                },
                0,
                100,
            );
            assert_eq!(one.records.len(), 1);
        }

        #[test]
        fn test_cleanup_uses_horizon() {
            let (store, clock) = store();
            store.append_system_history("h1", &system(1), 1_000);
            store.append_system_history("h1", &system(1), 5_000);
            store.append_accelerator_history("h1", &accelerator(&[(0, 0)]), 1_000);
            clock.set(10_000);
            assert_eq!(store.cleanup(Duration::from_millis(6_000)), 2);
            assert_eq!(store.query_system_history("h1", 0, 10_000).records.len(), 1);
            assert_eq!(store.cleanup(Duration::from_millis(6_000)), 0);
        }

        #[test]
        fn test_cleanup_with_unbounded_horizon_keeps_rows() {
            let (store, clock) = store();
            store.append_system_history("h1", &system(1), 1_000);
            store.append_accelerator_history("h1", &accelerator(&[(0, 0)]), 1_000);
            clock.set(10_000);
            assert_eq!(store.cleanup(Duration::MAX), 0);
            assert_eq!(store.cleanup(Duration::from_secs(u64::MAX / 1_000)), 0);
            assert_eq!(store.query_system_history("h1", 0, 10_000).records.len(), 1);
            let accelerator_rows =
                store.query_accelerator_history("h1", AcceleratorFilter::default(), 0, 10_000);
            assert_eq!(accelerator_rows.records.len(), 1);
        }

        #[test]
        fn test_remove_host_forgets_everything() {
            let (store, _) = store();
            store
                .write_snapshot("h1", SnapshotKind::System, &system(1), true, None)
                .unwrap();
            store.set_connection_status("h1", true, None);
            store.append_system_history("h1", &system(1), 1);
            store.remove_host("h1");
            assert!(store
                .read_snapshot::<SystemSnapshot>("h1", SnapshotKind::System)
                .is_none());
            assert!(store.connection_status("h1").is_none());
            assert!(store.query_system_history("h1", 0, 10).records.is_empty());
        }
    }
}
