//! Concurrent accelerator snapshot collection.
//!
//! One refresh issues the top-level queries together, then every per-chip
//! and per-device detail query together, then process discovery. Each
//! command goes through [`run_with_retry`]; a failed command leaves its
//! record zeroed rather than failing the snapshot.

use futures::future::join_all;
use tracing::debug;

use crate::fleet::config::CommandPolicy;
use crate::fleet::parsers::accelerator::{
    distinct_npu_ids, parse_board, parse_chips, parse_devices, parse_ecc, parse_hbm_usage_rate,
    parse_memory, parse_power, parse_temperature, parse_usage,
};
use crate::fleet::parsers::processes::discover_processes;
use crate::fleet::parsers::retry::{CommandRunner, run_with_retry};
use crate::fleet::types::{AcceleratorSnapshot, Chip, Timestamp};

pub(crate) const DEVICE_LIST_COMMAND: &str = "npu-smi info -l";
pub(crate) const CHIP_LIST_COMMAND: &str = "npu-smi info -m";
pub(crate) const COMBINED_INFO_COMMAND: &str = "npu-smi info";

/// Chip-scoped detail query, e.g. `npu-smi info -t temp -i 0 -c 0`.
pub(crate) fn chip_query(kind: &str, chip: &Chip) -> String {
    format!(
        "npu-smi info -t {} -i {} -c {}",
        kind, chip.npu_id, chip.chip_id
    )
}

/// Device-scoped detail query, e.g. `npu-smi info -t board -i 0`.
pub(crate) fn device_query(kind: &str, npu_id: i64) -> String {
    format!("npu-smi info -t {} -i {}", kind, npu_id)
}

/// Collect a full accelerator snapshot stamped with `collected_at`.
pub async fn collect_accelerator_snapshot(
    runner: &dyn CommandRunner,
    policy: CommandPolicy,
    collected_at: Timestamp,
) -> AcceleratorSnapshot {
    let (devices, chips, combined) = futures::join!(
        run_with_retry(runner, DEVICE_LIST_COMMAND, policy),
        run_with_retry(runner, CHIP_LIST_COMMAND, policy),
        run_with_retry(runner, COMBINED_INFO_COMMAND, policy),
    );

    let devices = parse_devices(&devices);
    let chips = parse_chips(&chips);
    let npu_ids = distinct_npu_ids(&chips);

    debug!(
        "Collecting detail for {} device(s), {} chip(s)",
        npu_ids.len(),
        chips.len()
    );

    let per_device = join_all(npu_ids.iter().map(|npu_id| async move {
        let board_query = device_query("board", *npu_id);
        let common_query = device_query("common", *npu_id);
        let (board, common) = futures::join!(
            run_with_retry(runner, &board_query, policy),
            run_with_retry(runner, &common_query, policy),
        );
        (
            parse_board(&board, *npu_id),
            (*npu_id, parse_hbm_usage_rate(&common)),
        )
    }));

    let per_chip = join_all(chips.iter().map(|chip| async move {
        let temp_query = chip_query("temp", chip);
        let power_query = chip_query("power", chip);
        let memory_query = chip_query("memory", chip);
        let usages_query = chip_query("usages", chip);
        let ecc_query = chip_query("ecc", chip);
        futures::join!(
            run_with_retry(runner, &temp_query, policy),
            run_with_retry(runner, &power_query, policy),
            run_with_retry(runner, &memory_query, policy),
            run_with_retry(runner, &usages_query, policy),
            run_with_retry(runner, &ecc_query, policy),
        )
    }));

    let (per_device, per_chip, processes) = futures::join!(
        per_device,
        per_chip,
        discover_processes(runner, policy, &combined, &npu_ids),
    );

    let (board_info, hbm_rates): (Vec<_>, Vec<_>) = per_device.into_iter().unzip();
    let hbm_rate_of = |npu_id: i64| {
        hbm_rates
            .iter()
            .find(|(id, _)| *id == npu_id)
            .map(|(_, rate)| *rate)
            .unwrap_or_default()
    };

    let mut snapshot = AcceleratorSnapshot {
        devices,
        board_info,
        processes,
        collected_at,
        ..Default::default()
    };

    for (chip, (temp, power, memory, usage, ecc)) in chips.iter().zip(per_chip) {
        let (npu, id) = (chip.npu_id, chip.chip_id);
        snapshot.temperatures.push(parse_temperature(&temp, npu, id));
        snapshot.power.push(parse_power(&power, npu, id));
        snapshot
            .memory
            .push(parse_memory(&memory, npu, id, hbm_rate_of(npu)));
        snapshot.usage.push(parse_usage(&usage, npu, id));
        snapshot.ecc.push(parse_ecc(&ecc, npu, id));
    }

    snapshot.chips = chips;
    snapshot
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fleet::parsers::processes::fuser_command;
    use crate::fleet::testing::ScriptedRunner;
    use crate::fleet::types::CommandOutput;

    fn ok(stdout: &str) -> CommandOutput {
        CommandOutput::new(stdout, "", 0)
    }

    fn two_chip_host() -> ScriptedRunner {
        let chip0 = Chip {
            npu_id: 0,
            chip_id: 0,
            name: String::new(),
            health: String::new(),
        };
        let chip1 = Chip { npu_id: 1, ..chip0.clone() };
        ScriptedRunner::new()
            .with(DEVICE_LIST_COMMAND, ok("NPU ID : 0\nProduct Name : A\nNPU ID : 1\nProduct Name : B\n"))
            .with(
                CHIP_LIST_COMMAND,
                ok("NPU ID Chip ID Chip Logic ID Chip Name\n0 0 0 Ascend\n0 1 - Mcu\n1 0 1 Ascend\n"),
            )
            .with(COMBINED_INFO_COMMAND, ok("| 0   0 | 77 | python | 100 |\n"))
            .with(&device_query("board", 0), ok("Product Name : A\nHealth : OK\n"))
            .with(&device_query("common", 0), ok("HBM Usage Rate(%) : 12\n"))
            .with(&device_query("common", 1), ok("HBM Usage Rate(%) : 30\n"))
            .with(&chip_query("temp", &chip0), ok("NPU Temperature (C) : 41\n"))
            .with(&chip_query("temp", &chip1), ok("NPU Temperature (C) : 52\n"))
            .with(&chip_query("power", &chip0), ok("Power Usage(W) : 90.2\n"))
            .with(&chip_query("usages", &chip1), ok("Aicore Usage Rate(%) : 64\n"))
            .with_error(
                &chip_query("ecc", &chip1),
                crate::fleet::error::FleetError::Command("channel failure".into()),
            )
    }

    #[tokio::test(start_paused = true)]
    async fn test_collects_per_chip_records() {
        let runner = two_chip_host();
        let snapshot =
            collect_accelerator_snapshot(&runner, CommandPolicy::default(), 1_000).await;

        assert_eq!(snapshot.collected_at, 1_000);
        assert_eq!(snapshot.devices.len(), 2);
        assert_eq!(snapshot.chips.len(), 2);
        assert_eq!(snapshot.board_info.len(), 2);
        assert_eq!(snapshot.board_info[0].health, "OK");
        assert_eq!(snapshot.temperatures[0].npu_temp, 41);
        assert_eq!(snapshot.temperatures[1].npu_temp, 52);
        assert_eq!(snapshot.power[0].power_usage, 90);
        assert_eq!(snapshot.usage[1].ai_core_usage, 64);
        assert_eq!(snapshot.memory[0].hbm_usage_rate, 12);
        assert_eq!(snapshot.memory[1].hbm_usage_rate, 30);
        assert_eq!(snapshot.processes.len(), 1);
        assert_eq!(snapshot.processes[0].pid, 77);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_query_leaves_zeroed_record() {
        let runner = two_chip_host();
        let snapshot =
            collect_accelerator_snapshot(&runner, CommandPolicy::default(), 0).await;
        assert_eq!(snapshot.ecc.len(), 2);
        assert_eq!(snapshot.ecc[1].npu_id, 1);
        assert_eq!(snapshot.ecc[1].ecc_error_count, 0);
        // The failing query was attempted once per configured attempt
        let ecc = chip_query("ecc", &snapshot.chips[1]);
        assert_eq!(runner.count(&ecc), CommandPolicy::default().attempts as usize);
    }

    #[tokio::test(start_paused = true)]
    async fn test_board_and_common_once_per_device() {
        let runner = two_chip_host();
        collect_accelerator_snapshot(&runner, CommandPolicy::default(), 0).await;
        assert_eq!(runner.count(&device_query("board", 0)), 1);
        assert_eq!(runner.count(&device_query("common", 1)), 1);
        assert_eq!(runner.count(&fuser_command()), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_accelerators() {
        let runner = ScriptedRunner::new();
        let snapshot = collect_accelerator_snapshot(&runner, CommandPolicy::default(), 5).await;
        assert!(snapshot.chips.is_empty());
        assert!(snapshot.temperatures.is_empty());
        assert!(snapshot.processes.is_empty());
        assert_eq!(snapshot.collected_at, 5);
    }
}
