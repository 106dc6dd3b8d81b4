//! Host-system telemetry: memory, storage, listening ports and containers.

use std::collections::HashSet;

use tracing::debug;

use crate::fleet::config::CommandPolicy;
use crate::fleet::parsers::retry::{CommandRunner, run_with_retry};
use crate::fleet::parsers::rules::{int_token, lines, tokens};
use crate::fleet::types::{
    CommandOutput, Container, ContainerState, ListeningPort, StorageMount, SystemMemory,
    SystemSnapshot, Timestamp,
};

pub(crate) const MEMORY_COMMAND: &str = "free -m";
pub(crate) const STORAGE_COMMAND: &str = "df -h";
pub(crate) const PORTS_COMMAND: &str = "ss -tlnp 2>/dev/null || netstat -tlnp 2>/dev/null";
pub(crate) const CONTAINERS_COMMAND: &str = "docker ps -a --format \
    '{{.ID}}\\t{{.Names}}\\t{{.Image}}\\t{{.Status}}\\t{{.Ports}}\\t{{.CreatedAt}}' \
    2>/dev/null || echo 'Docker not available'";

const DOCKER_UNAVAILABLE: &str = "Docker not available";

/// Mount points under these paths are container layers, not real storage.
const IGNORED_MOUNT_PATHS: &[&str] = &["/docker/", "/overlay2/"];

/// `free -m`
///
/// Columns are located by the header so both the old
/// `buffers cached` layout and the newer `buff/cache available` layout work.
/// `available` is always `free + buffers + cached`.
pub fn parse_memory(output: &CommandOutput) -> SystemMemory {
    if output.is_unusable() {
        return SystemMemory::default();
    }

    let mut header: Vec<String> = Vec::new();
    for line in lines(&output.stdout) {
        let parts = tokens(line);
        if !parts.first().is_some_and(|first| first.ends_with(':')) {
            if header.is_empty() {
                header = parts.iter().map(|p| p.to_ascii_lowercase()).collect();
            }
            continue;
        }
        if parts[0] != "Mem:" {
            continue;
        }

        let values: Vec<i64> = parts[1..]
            .iter()
            .map(|p| int_token(p).unwrap_or_default())
            .collect();
        let column = |names: &[&str], fallback: usize| -> i64 {
            header
                .iter()
                .position(|h| names.contains(&h.as_str()))
                .or(if header.is_empty() { Some(fallback) } else { None })
                .and_then(|i| values.get(i).copied())
                .unwrap_or_default()
        };

        let total = column(&["total"], 0);
        let used = column(&["used"], 1);
        let free = column(&["free"], 2);
        let buffers = column(&["buffers"], 4);
        let cached = column(&["cached", "cache", "buff/cache"], 5);
        let usage_percent = if total > 0 {
            (used as f64 / total as f64 * 100.0).round() as i64
        } else {
            0
        };

        return SystemMemory {
            total,
            used,
            free,
            available: free + buffers + cached,
            buffers,
            cached,
            usage_percent,
        };
    }

    SystemMemory::default()
}

/// `df -h`, skipping container layers and repeated mount points.
pub fn parse_storage(output: &CommandOutput) -> Vec<StorageMount> {
    if output.is_unusable() {
        return Vec::new();
    }

    let mut seen = HashSet::new();
    lines(&output.stdout)
        .skip(1)
        .filter_map(|line| {
            let parts = tokens(line);
            if parts.len() < 6 {
                return None;
            }
            let mount_point = parts[5..].join(" ");
            if IGNORED_MOUNT_PATHS.iter().any(|p| mount_point.contains(p))
                || !seen.insert(mount_point.clone())
            {
                return None;
            }
            Some(StorageMount {
                filesystem: parts[0].to_string(),
                size: parts[1].to_string(),
                used: parts[2].to_string(),
                available: parts[3].to_string(),
                usage_percent: int_token(parts[4]).unwrap_or_default(),
                mount_point,
            })
        })
        .collect()
}

fn split_port(local: &str) -> Option<(String, u16)> {
    let (address, port) = local.rsplit_once(':')?;
    Some((address.to_string(), port.parse().ok()?))
}

/// `users:(("sshd",pid=1234,fd=3))` -> ("sshd", 1234)
fn ss_process(line: &str) -> Option<(String, Option<i64>)> {
    let start = line.find("users:((\"")? + "users:((\"".len();
    let rest = &line[start..];
    let end = rest.find('"')?;
    let pid = rest
        .find("pid=")
        .and_then(|i| int_token(&rest[i + "pid=".len()..]));
    Some((rest[..end].to_string(), pid))
}

/// `ss -tlnp`, or `netstat -tlnp` when `ss` is missing.
pub fn parse_ports(output: &CommandOutput) -> Vec<ListeningPort> {
    if output.is_unusable() {
        return Vec::new();
    }

    lines(&output.stdout)
        .filter_map(|line| {
            let parts = tokens(line);
            if parts.first() == Some(&"LISTEN") && parts.len() >= 5 {
                let (local_address, port) = split_port(parts[3])?;
                let (process, pid) = ss_process(line).unwrap_or_else(|| ("-".to_string(), None));
                return Some(ListeningPort {
                    protocol: "tcp".to_string(),
                    local_address,
                    port,
                    state: "LISTEN".to_string(),
                    process,
                    pid,
                });
            }
            if parts.len() >= 6 && parts[0].starts_with("tcp") && parts[5] == "LISTEN" {
                let (local_address, port) = split_port(parts[3])?;
                let (pid, process) = match parts.get(6).and_then(|p| p.split_once('/')) {
                    Some((pid, name)) => (pid.parse().ok(), name.to_string()),
                    None => (None, "-".to_string()),
                };
                return Some(ListeningPort {
                    protocol: parts[0].to_string(),
                    local_address,
                    port,
                    state: "LISTEN".to_string(),
                    process,
                    pid,
                });
            }
            None
        })
        .collect()
}

/// `docker ps -a` in the tab-separated format of [`CONTAINERS_COMMAND`].
///
/// Lines without tabs are split on runs of two or more spaces, which is how
/// the default table layout separates columns.
pub fn parse_containers(output: &CommandOutput) -> Vec<Container> {
    if output.is_unusable() || output.stdout.contains(DOCKER_UNAVAILABLE) {
        return Vec::new();
    }

    lines(&output.stdout)
        .filter(|line| !line.starts_with("CONTAINER"))
        .filter_map(|line| {
            let fields: Vec<&str> = if line.contains('\t') {
                line.split('\t').map(str::trim).collect()
            } else {
                line.split("  ")
                    .map(str::trim)
                    .filter(|f| !f.is_empty())
                    .collect()
            };
            if fields.len() < 4 {
                debug!("Skipping unparseable container row: {}", line);
                return None;
            }
            let field = |i: usize| fields.get(i).copied().unwrap_or_default().to_string();
            let status = field(3);
            Some(Container {
                id: field(0),
                name: field(1),
                image: field(2),
                state: if status.contains("Up") {
                    ContainerState::Running
                } else {
                    ContainerState::Stopped
                },
                status,
                ports: field(4),
                created_at: field(5),
            })
        })
        .collect()
}

/// Collect a host-system snapshot stamped with `collected_at`.
pub async fn collect_system_snapshot(
    runner: &dyn CommandRunner,
    policy: CommandPolicy,
    collected_at: Timestamp,
) -> SystemSnapshot {
    let (memory, storage, ports, containers) = futures::join!(
        run_with_retry(runner, MEMORY_COMMAND, policy),
        run_with_retry(runner, STORAGE_COMMAND, policy),
        run_with_retry(runner, PORTS_COMMAND, policy),
        run_with_retry(runner, CONTAINERS_COMMAND, policy),
    );

    SystemSnapshot {
        memory: parse_memory(&memory),
        storage: parse_storage(&storage),
        ports: parse_ports(&ports),
        containers: parse_containers(&containers),
        collected_at,
    }
}
