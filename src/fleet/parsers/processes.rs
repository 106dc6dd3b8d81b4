//! Accelerator process discovery.
//!
//! Three strategies are tried in order and the first that yields anything
//! wins:
//!
//! 1. The process table embedded in the combined `npu-smi info` output
//!    (no extra command).
//! 2. `npu-smi info proc -i <npu>` for every known device.
//! 3. A system scan: `fuser` on the device nodes plus a `ps` name filter.
//!    This cannot tell which device a process uses, so every hit carries
//!    [`UNKNOWN_ACCELERATOR`].
//!
//! The merged result is deduplicated by pid in one pass at the end.

use std::collections::HashSet;

use futures::future::join_all;
use tracing::debug;

use crate::fleet::config::CommandPolicy;
use crate::fleet::parsers::retry::{CommandRunner, run_with_retry};
use crate::fleet::parsers::rules::{int_token, lines, tokens};
use crate::fleet::types::{AcceleratorProcess, CommandOutput, UNKNOWN_ACCELERATOR};

/// Device nodes probed by the system scan.
const DEVICE_NODE_COUNT: i64 = 8;

/// Upper bound on pids taken from the name filter.
const SCAN_PID_LIMIT: usize = 50;

const PROCESS_NAME_FILTER: &str = "ascend|npu|davinci|torch_npu|mindspore|pytorch|python.*train";

pub(crate) fn proc_listing_command(npu_id: i64) -> String {
    format!("npu-smi info proc -i {}", npu_id)
}

pub(crate) fn fuser_command() -> String {
    let nodes: Vec<String> = (0..DEVICE_NODE_COUNT)
        .map(|i| format!("/dev/davinci{}", i))
        .collect();
    format!("fuser {} 2>/dev/null", nodes.join(" "))
}

pub(crate) fn name_filter_command() -> String {
    format!(
        "ps aux | grep -E '{}' | grep -v grep | awk '{{print $2}}' | head -{}",
        PROCESS_NAME_FILTER, SCAN_PID_LIMIT
    )
}

pub(crate) fn process_names_command(pids: &[i64]) -> String {
    let list: Vec<String> = pids.iter().map(i64::to_string).collect();
    format!("ps -o pid=,comm= -p {} 2>/dev/null", list.join(","))
}

/// Process rows of the combined `npu-smi info` table.
///
/// Rows look like `| 0   0 | 123456 | python | 3000 |`. The device status
/// rows of the same table never have a numeric second column and are
/// rejected by the pid check; bus-id rows are skipped outright.
pub fn parse_process_table(output: &CommandOutput) -> Vec<AcceleratorProcess> {
    if output.is_unusable() {
        return Vec::new();
    }

    lines(&output.stdout)
        .filter(|line| line.starts_with('|') && line.ends_with('|'))
        .filter(|line| !line.to_ascii_lowercase().contains("process id"))
        .filter(|line| !(line.contains("0000:") && line.contains('/')))
        .filter_map(|line| {
            let parts: Vec<&str> = line
                .split('|')
                .map(str::trim)
                .filter(|part| !part.is_empty())
                .collect();
            if parts.len() < 3 {
                return None;
            }
            let npu_id = parts[0].split_whitespace().next()?.parse::<i64>().ok()?;
            let pid = parts[1].parse::<i64>().ok()?;
            if npu_id < 0 || pid <= 0 || parts[2].is_empty() {
                return None;
            }
            let memory_usage = parts
                .get(3)
                .and_then(|mem| mem.split_whitespace().next())
                .and_then(int_token)
                .unwrap_or_default();
            Some(AcceleratorProcess {
                pid,
                process_name: parts[2].to_string(),
                memory_usage,
                ai_core_usage: 0,
                npu_id,
            })
        })
        .collect()
}

/// `npu-smi info proc -i <npu>`: `pid name memory aicore` rows.
pub fn parse_proc_listing(output: &CommandOutput, npu_id: i64) -> Vec<AcceleratorProcess> {
    if output.is_unusable() || output.stdout.contains("does not support") {
        return Vec::new();
    }

    lines(&output.stdout)
        .filter_map(|line| {
            let parts = tokens(line);
            if parts.len() < 2 {
                return None;
            }
            let pid = parts[0].parse::<i64>().ok().filter(|pid| *pid > 0)?;
            Some(AcceleratorProcess {
                pid,
                process_name: parts[1].to_string(),
                memory_usage: parts.get(2).and_then(|t| int_token(t)).unwrap_or_default(),
                ai_core_usage: parts.get(3).and_then(|t| int_token(t)).unwrap_or_default(),
                npu_id,
            })
        })
        .collect()
}

/// Pids from `fuser` and the `ps` name filter, in first-seen order.
pub fn parse_scan_pids(fuser: &CommandOutput, filtered: &CommandOutput) -> Vec<i64> {
    let mut seen = HashSet::new();
    [fuser, filtered]
        .into_iter()
        .filter(|output| !output.stdout.trim().is_empty())
        .flat_map(|output| output.stdout.split_whitespace())
        .filter_map(int_token)
        .filter(|pid| *pid > 0 && seen.insert(*pid))
        .collect()
}

/// `ps -o pid=,comm=` rows.
pub fn parse_process_names(output: &CommandOutput) -> Vec<(i64, String)> {
    lines(&output.stdout)
        .filter_map(|line| {
            let (pid, name) = line.split_once(char::is_whitespace)?;
            Some((pid.parse().ok()?, name.trim().to_string()))
        })
        .collect()
}

/// Keep the first record seen for each pid.
pub fn dedupe_by_pid(processes: Vec<AcceleratorProcess>) -> Vec<AcceleratorProcess> {
    let mut seen = HashSet::new();
    processes
        .into_iter()
        .filter(|process| seen.insert(process.pid))
        .collect()
}

async fn scan_system(runner: &dyn CommandRunner, policy: CommandPolicy) -> Vec<AcceleratorProcess> {
    let fuser_cmd = fuser_command();
    let name_filter_cmd = name_filter_command();
    let (fuser, filtered) = futures::join!(
        run_with_retry(runner, &fuser_cmd, policy),
        run_with_retry(runner, &name_filter_cmd, policy),
    );

    let pids = parse_scan_pids(&fuser, &filtered);
    if pids.is_empty() {
        return Vec::new();
    }

    let names = parse_process_names(
        &run_with_retry(runner, &process_names_command(&pids), policy).await,
    );

    pids.into_iter()
        .map(|pid| AcceleratorProcess {
            pid,
            process_name: names
                .iter()
                .find(|(known, _)| *known == pid)
                .map(|(_, name)| name.clone())
                .unwrap_or_else(|| "unknown".to_string()),
            memory_usage: 0,
            ai_core_usage: 0,
            npu_id: UNKNOWN_ACCELERATOR,
        })
        .collect()
}

/// Run the discovery chain.
///
/// * `combined` - Output of the combined `npu-smi info` query, already fetched
/// * `npu_ids` - Devices to query individually when the table is empty
pub async fn discover_processes(
    runner: &dyn CommandRunner,
    policy: CommandPolicy,
    combined: &CommandOutput,
    npu_ids: &[i64],
) -> Vec<AcceleratorProcess> {
    let mut found = parse_process_table(combined);

    if found.is_empty() && !npu_ids.is_empty() {
        debug!("Process table empty, querying {} device(s)", npu_ids.len());
        let listings = join_all(npu_ids.iter().map(|npu_id| async move {
            let output = run_with_retry(runner, &proc_listing_command(*npu_id), policy).await;
            parse_proc_listing(&output, *npu_id)
        }))
        .await;
        found = listings.into_iter().flatten().collect();
    }

    if found.is_empty() {
        debug!("Per-device listing empty, falling back to system scan");
        found = scan_system(runner, policy).await;
    }

    dedupe_by_pid(found)
}
