//! Time-series history tables.
//!
//! Rows are kept per host in ascending timestamp order. Appends normally land
//! at the end; a row stamped earlier than the newest one (clock step back) is
//! inserted in place so range queries can rely on the ordering.

use std::collections::BTreeSet;

use dashmap::DashMap;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::fleet::types::{
    AcceleratorHistory, AcceleratorHistoryRecord, AcceleratorHistorySummary, AcceleratorSnapshot,
    ContainerState, MetricAggregate, SystemHistory, SystemHistoryRecord, SystemHistorySummary,
    SystemSnapshot, Timestamp,
};

/// Restricts an accelerator history query to one device and/or chip.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct AcceleratorFilter {
    #[serde(default)]
    pub npu_id: Option<i64>,
    #[serde(default)]
    pub chip_id: Option<i64>,
}

impl AcceleratorFilter {
    fn matches(&self, record: &AcceleratorHistoryRecord) -> bool {
        self.npu_id.is_none_or(|id| id == record.npu_id)
            && self.chip_id.is_none_or(|id| id == record.chip_id)
    }
}

trait Timestamped {
    fn timestamp(&self) -> Timestamp;
}

impl Timestamped for AcceleratorHistoryRecord {
    fn timestamp(&self) -> Timestamp {
        self.timestamp
    }
}

impl Timestamped for SystemHistoryRecord {
    fn timestamp(&self) -> Timestamp {
        self.timestamp
    }
}

fn insert_ordered<R: Timestamped>(rows: &mut Vec<R>, row: R) {
    let at = rows.partition_point(|r| r.timestamp() <= row.timestamp());
    rows.insert(at, row);
}

/// One row per (npu, chip) key seen in any per-chip list of the snapshot.
pub(crate) fn accelerator_rows(
    host_id: &str,
    snapshot: &AcceleratorSnapshot,
    timestamp: Timestamp,
) -> Vec<AcceleratorHistoryRecord> {
    let keys: BTreeSet<(i64, i64)> = snapshot
        .chips
        .iter()
        .map(|c| (c.npu_id, c.chip_id))
        .chain(snapshot.temperatures.iter().map(|t| (t.npu_id, t.chip_id)))
        .chain(snapshot.power.iter().map(|p| (p.npu_id, p.chip_id)))
        .chain(snapshot.memory.iter().map(|m| (m.npu_id, m.chip_id)))
        .chain(snapshot.usage.iter().map(|u| (u.npu_id, u.chip_id)))
        .chain(snapshot.ecc.iter().map(|e| (e.npu_id, e.chip_id)))
        .collect();

    keys.into_iter()
        .map(|(npu_id, chip_id)| {
            let key = |n: i64, c: i64| n == npu_id && c == chip_id;
            AcceleratorHistoryRecord {
                host_id: host_id.to_string(),
                npu_id,
                chip_id,
                temperature: snapshot
                    .temperatures
                    .iter()
                    .find(|t| key(t.npu_id, t.chip_id))
                    .map_or(0, |t| t.npu_temp),
                power_usage: snapshot
                    .power
                    .iter()
                    .find(|p| key(p.npu_id, p.chip_id))
                    .map_or(0, |p| p.power_usage),
                memory_usage_rate: snapshot
                    .memory
                    .iter()
                    .find(|m| key(m.npu_id, m.chip_id))
                    .map_or(0, |m| m.memory_usage_rate),
                ai_core_usage: snapshot
                    .usage
                    .iter()
                    .find(|u| key(u.npu_id, u.chip_id))
                    .map_or(0, |u| u.ai_core_usage),
                ecc_error_count: snapshot
                    .ecc
                    .iter()
                    .find(|e| key(e.npu_id, e.chip_id))
                    .map_or(0, |e| e.ecc_error_count),
                timestamp,
            }
        })
        .collect()
}

pub(crate) fn system_row(
    host_id: &str,
    snapshot: &SystemSnapshot,
    timestamp: Timestamp,
) -> SystemHistoryRecord {
    SystemHistoryRecord {
        host_id: host_id.to_string(),
        memory_usage_percent: snapshot.memory.usage_percent,
        storage_usage_percent: snapshot
            .storage
            .iter()
            .map(|m| m.usage_percent)
            .max()
            .unwrap_or_default(),
        container_count: snapshot.containers.len() as i64,
        running_containers: snapshot
            .containers
            .iter()
            .filter(|c| c.state == ContainerState::Running)
            .count() as i64,
        timestamp,
    }
}

fn aggregate<R>(records: &[R], metric: impl Fn(&R) -> i64) -> MetricAggregate {
    MetricAggregate::from_values(records.iter().map(|r| metric(r) as f64))
}

pub(crate) fn summarize_accelerator(records: Vec<AcceleratorHistoryRecord>) -> AcceleratorHistory {
    let summary = AcceleratorHistorySummary {
        temperature: aggregate(&records, |r| r.temperature),
        power_usage: aggregate(&records, |r| r.power_usage),
        memory_usage_rate: aggregate(&records, |r| r.memory_usage_rate),
        ai_core_usage: aggregate(&records, |r| r.ai_core_usage),
        ecc_error_count: aggregate(&records, |r| r.ecc_error_count),
    };
    AcceleratorHistory { records, summary }
}

pub(crate) fn summarize_system(records: Vec<SystemHistoryRecord>) -> SystemHistory {
    let summary = SystemHistorySummary {
        memory_usage_percent: aggregate(&records, |r| r.memory_usage_percent),
        storage_usage_percent: aggregate(&records, |r| r.storage_usage_percent),
        container_count: aggregate(&records, |r| r.container_count),
        running_containers: aggregate(&records, |r| r.running_containers),
    };
    SystemHistory { records, summary }
}

/// Per-host history rows for both snapshot kinds.
#[derive(Default)]
pub(crate) struct HistoryTables {
    accelerator: DashMap<String, Vec<AcceleratorHistoryRecord>>,
    system: DashMap<String, Vec<SystemHistoryRecord>>,
}

impl HistoryTables {
    pub fn append_accelerator(&self, host_id: &str, rows: Vec<AcceleratorHistoryRecord>) {
        let mut table = self.accelerator.entry(host_id.to_string()).or_default();
        for row in rows {
            insert_ordered(table.value_mut(), row);
        }
    }

    pub fn append_system(&self, host_id: &str, row: SystemHistoryRecord) {
        let mut table = self.system.entry(host_id.to_string()).or_default();
        insert_ordered(table.value_mut(), row);
    }

    pub fn accelerator_range(
        &self,
        host_id: &str,
        filter: AcceleratorFilter,
        start: Timestamp,
        end: Timestamp,
    ) -> Vec<AcceleratorHistoryRecord> {
        self.accelerator
            .get(host_id)
            .map(|rows| {
                rows.iter()
                    .filter(|r| (start..=end).contains(&r.timestamp) && filter.matches(r))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn system_range(
        &self,
        host_id: &str,
        start: Timestamp,
        end: Timestamp,
    ) -> Vec<SystemHistoryRecord> {
        self.system
            .get(host_id)
            .map(|rows| {
                rows.iter()
                    .filter(|r| (start..=end).contains(&r.timestamp))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Delete rows stamped strictly before `cutoff`. Returns rows removed.
    pub fn delete_before(&self, cutoff: Timestamp) -> usize {
        let mut removed = 0;
        for mut rows in self.accelerator.iter_mut() {
            let before = rows.len();
            rows.retain(|r| r.timestamp >= cutoff);
            removed += before - rows.len();
        }
        for mut rows in self.system.iter_mut() {
            let before = rows.len();
            rows.retain(|r| r.timestamp >= cutoff);
            removed += before - rows.len();
        }
        removed
    }

    pub fn remove_host(&self, host_id: &str) {
        self.accelerator.remove(host_id);
        self.system.remove(host_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fleet::types::{Chip, Container, Ecc, StorageMount, SystemMemory, Temperature};

    fn chip(npu_id: i64, chip_id: i64) -> Chip {
        Chip {
            npu_id,
            chip_id,
            name: "Ascend".into(),
            health: "OK".into(),
        }
    }

    #[test]
    fn test_accelerator_rows_union_keys() {
        let snapshot = AcceleratorSnapshot {
            chips: vec![chip(0, 0)],
            temperatures: vec![
                Temperature {
                    npu_id: 0,
                    chip_id: 0,
                    npu_temp: 45,
                    ai_core_temp: 50,
                },
                Temperature {
                    npu_id: 1,
                    chip_id: 0,
                    npu_temp: 60,
                    ai_core_temp: 61,
                },
            ],
            ecc: vec![Ecc {
                npu_id: 0,
                chip_id: 0,
                ecc_error_count: 4,
                ecc_mode: String::new(),
            }],
            ..Default::default()
        };
        let rows = accelerator_rows("h1", &snapshot, 100);
        assert_eq!(rows.len(), 2);
        assert_eq!((rows[0].temperature, rows[0].ecc_error_count), (45, 4));
        assert_eq!((rows[1].npu_id, rows[1].temperature), (1, 60));
        assert_eq!(rows[1].ecc_error_count, 0);
        assert!(rows.iter().all(|r| r.timestamp == 100 && r.host_id == "h1"));
    }

    #[test]
    fn test_system_row_derivation() {
        let container = |state| Container {
            id: "c".into(),
            name: "n".into(),
            image: "i".into(),
            status: String::new(),
            state,
            ports: String::new(),
            created_at: String::new(),
        };
        let mount = |usage_percent| StorageMount {
            filesystem: "/dev/sda1".into(),
            size: "1G".into(),
            used: "1G".into(),
            available: "0".into(),
            usage_percent,
            mount_point: "/".into(),
        };
        let snapshot = SystemSnapshot {
            memory: SystemMemory {
                usage_percent: 37,
                ..Default::default()
            },
            storage: vec![mount(20), mount(85)],
            containers: vec![
                container(ContainerState::Running),
                container(ContainerState::Stopped),
                container(ContainerState::Running),
            ],
            ..Default::default()
        };
        let row = system_row("h1", &snapshot, 7);
        assert_eq!(row.memory_usage_percent, 37);
        assert_eq!(row.storage_usage_percent, 85);
        assert_eq!(row.container_count, 3);
        assert_eq!(row.running_containers, 2);
    }

    mod tables {
        use super::*;

        fn system(ts: Timestamp, memory: i64) -> SystemHistoryRecord {
            SystemHistoryRecord {
                host_id: "h1".into(),
                memory_usage_percent: memory,
                storage_usage_percent: 0,
                container_count: 0,
                running_containers: 0,
                timestamp: ts,
            }
        }

        #[test]
        fn test_out_of_order_append_stays_sorted() {
            let tables = HistoryTables::default();
            tables.append_system("h1", system(300, 1));
            tables.append_system("h1", system(100, 2));
            tables.append_system("h1", system(200, 3));
            let stamps: Vec<_> = tables
                .system_range("h1", 0, 1000)
                .iter()
                .map(|r| r.timestamp)
                .collect();
            assert_eq!(stamps, vec![100, 200, 300]);
        }

        #[test]
        fn test_range_is_inclusive() {
            let tables = HistoryTables::default();
            for ts in [100, 200, 300, 400] {
                tables.append_system("h1", system(ts, 10));
            }
            let rows = tables.system_range("h1", 200, 300);
            assert_eq!(rows.len(), 2);
            assert_eq!(rows[0].timestamp, 200);
            assert_eq!(rows[1].timestamp, 300);
        }

        #[test]
        fn test_delete_before_is_strict() {
            let tables = HistoryTables::default();
            for ts in [100, 200, 300] {
                tables.append_system("h1", system(ts, 10));
            }
            assert_eq!(tables.delete_before(200), 1);
            assert_eq!(tables.delete_before(200), 0);
            assert_eq!(tables.system_range("h1", 0, 1000).len(), 2);
        }

        #[test]
        fn test_filter_by_chip() {
            let tables = HistoryTables::default();
            let snapshot = AcceleratorSnapshot {
                chips: vec![chip(0, 0), chip(0, 1), chip(1, 0)],
                ..Default::default()
            };
            tables.append_accelerator("h1", accelerator_rows("h1", &snapshot, 10));
            let filter = AcceleratorFilter {
                npu_id: Some(0),
                chip_id: None,
            };
            assert_eq!(tables.accelerator_range("h1", filter, 0, 10).len(), 2);
            let filter = AcceleratorFilter {
                npu_id: Some(0),
                chip_id: Some(1),
            };
            assert_eq!(tables.accelerator_range("h1", filter, 0, 10).len(), 1);
            assert!(tables
                .accelerator_range("h2", AcceleratorFilter::default(), 0, 10)
                .is_empty());
        }

        #[test]
        fn test_summary_over_window() {
            let history = summarize_system(vec![system(1, 20), system(2, 40), system(3, 90)]);
            let agg = history.summary.memory_usage_percent;
            assert_eq!(agg.min, 20.0);
            assert_eq!(agg.max, 90.0);
            assert!((agg.avg - 50.0).abs() < 1e-9);

            let empty = summarize_system(Vec::new());
            assert!(empty.records.is_empty());
            assert_eq!(empty.summary, SystemHistorySummary::default());
        }
    }
}
