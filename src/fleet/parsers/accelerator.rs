//! Parsers for `npu-smi` accelerator output.
//!
//! Every function here is pure: it takes a [`CommandOutput`] and returns a
//! typed record. Unusable output (non-zero exit or blank stdout) yields an
//! empty list or a zeroed record, never an error, so one broken query cannot
//! fail the whole snapshot.
//!
//! Scalar fields keep the first matching line. ECC error counters are summed
//! over every counter line.

use crate::fleet::parsers::rules::{
    LabelRule, classify, label_integer, label_rounded, lines, set_once, tokens,
    value_after_colon,
};
use crate::fleet::types::{
    BoardInfo, Chip, CommandOutput, Device, Ecc, MemoryInfo, Power, Temperature, Usage,
};

/// Feed every classified line of `output` to `apply`.
fn scan<F: Copy>(output: &CommandOutput, rules: &[LabelRule<F>], mut apply: impl FnMut(F, &str)) {
    if output.is_unusable() {
        return;
    }
    for line in lines(&output.stdout) {
        if let Some(field) = classify(rules, line) {
            apply(field, line);
        }
    }
}

/// `npu-smi info -l`
///
/// Accepts both the key/value block layout (`NPU ID : 0` followed by
/// `Product Name : ...`) and a plain table whose rows start with the id.
pub fn parse_devices(output: &CommandOutput) -> Vec<Device> {
    if output.is_unusable() {
        return Vec::new();
    }

    let mut devices = Vec::new();
    let mut current: Option<Device> = None;

    for line in lines(&output.stdout) {
        if let Some((label, value)) = line.split_once(':') {
            let label = label.trim().to_ascii_lowercase();
            if label == "npu id" {
                devices.extend(current.take());
                current = value.trim().parse().ok().map(|id| Device {
                    id,
                    name: String::new(),
                });
            } else if label.contains("name")
                && let Some(device) = current.as_mut()
                && device.name.is_empty()
            {
                device.name = value.trim().to_string();
            }
            continue;
        }

        let parts = tokens(line);
        if parts.len() >= 2
            && let Ok(id) = parts[0].parse::<i64>()
        {
            devices.push(Device {
                id,
                name: parts[1..].join(" "),
            });
        }
    }

    devices.extend(current);
    devices
}

/// `npu-smi info -m`
///
/// Rows are `npu chip logic-id name...`. Management controller rows
/// (`Mcu`) are dropped.
pub fn parse_chips(output: &CommandOutput) -> Vec<Chip> {
    if output.is_unusable() {
        return Vec::new();
    }

    lines(&output.stdout)
        .filter_map(|line| {
            let parts = tokens(line);
            if parts.len() < 4 {
                return None;
            }
            let npu_id = parts[0].parse::<i64>().ok()?;
            let chip_id = parts[1].parse::<i64>().ok()?;
            let name = parts[3..].join(" ");
            if name.eq_ignore_ascii_case("mcu") {
                return None;
            }
            Some(Chip {
                npu_id,
                chip_id,
                name,
                health: "OK".to_string(),
            })
        })
        .collect()
}

#[derive(Clone, Copy)]
enum BoardField {
    Name,
    Health,
    Firmware,
    Software,
}

const BOARD_RULES: &[LabelRule<BoardField>] = &[
    LabelRule::new(BoardField::Name, &["npu name", "name"]),
    LabelRule::new(BoardField::Health, &["health"]),
    LabelRule::new(BoardField::Firmware, &["firmware version"]),
    LabelRule::new(BoardField::Software, &["software version", "version"]),
];

/// `npu-smi info -t board -i <npu>`
pub fn parse_board(output: &CommandOutput, npu_id: i64) -> BoardInfo {
    let (mut name, mut health, mut firmware, mut software) = (None, None, None, None);
    scan(output, BOARD_RULES, |field, line| {
        let value = value_after_colon(line).map(str::to_string);
        match field {
            BoardField::Name => set_once(&mut name, value),
            BoardField::Health => set_once(&mut health, value),
            BoardField::Firmware => set_once(&mut firmware, value),
            BoardField::Software => set_once(&mut software, value),
        }
    });
    BoardInfo {
        npu_id,
        name: name.unwrap_or_default(),
        health: health.unwrap_or_default(),
        firmware_version: firmware.unwrap_or_default(),
        software_version: software.unwrap_or_default(),
    }
}

#[derive(Clone, Copy)]
enum TempField {
    Npu,
    AiCore,
}

const TEMPERATURE_RULES: &[LabelRule<TempField>] = &[
    LabelRule::new(TempField::Npu, &["npu temperature", "hbm temperature"]),
    LabelRule::new(TempField::AiCore, &["ai core temperature", "aicore temperature"]),
];

/// `npu-smi info -t temp -i <npu> -c <chip>`
pub fn parse_temperature(output: &CommandOutput, npu_id: i64, chip_id: i64) -> Temperature {
    let (mut npu, mut ai_core) = (None, None);
    scan(output, TEMPERATURE_RULES, |field, line| match field {
        TempField::Npu => set_once(&mut npu, label_rounded(line)),
        TempField::AiCore => set_once(&mut ai_core, label_rounded(line)),
    });
    Temperature {
        npu_id,
        chip_id,
        npu_temp: npu.unwrap_or_default(),
        ai_core_temp: ai_core.unwrap_or_default(),
    }
}

#[derive(Clone, Copy)]
enum PowerField {
    Usage,
    Limit,
}

const POWER_RULES: &[LabelRule<PowerField>] = &[
    LabelRule::new(PowerField::Usage, &["power usage", "real-time power"]),
    LabelRule::new(PowerField::Limit, &["power limit", "power cap"]),
];

/// `npu-smi info -t power -i <npu> -c <chip>`
pub fn parse_power(output: &CommandOutput, npu_id: i64, chip_id: i64) -> Power {
    let (mut usage, mut limit) = (None, None);
    scan(output, POWER_RULES, |field, line| match field {
        PowerField::Usage => set_once(&mut usage, label_rounded(line)),
        PowerField::Limit => set_once(&mut limit, label_rounded(line)),
    });
    Power {
        npu_id,
        chip_id,
        power_usage: usage.unwrap_or_default(),
        power_limit: limit.unwrap_or_default(),
    }
}

#[derive(Clone, Copy)]
enum MemoryField {
    Used,
    Total,
    Rate,
}

// "Memory Usage(MB)" and "Memory Usage Rate(%)" share a prefix; the
// exclusions keep each line on one field.
const MEMORY_RULES: &[LabelRule<MemoryField>] = &[
    LabelRule::new(MemoryField::Used, &["memory usage"]).excluding(&["rate"]),
    LabelRule::new(MemoryField::Total, &["memory total", "hbm capacity"]),
    LabelRule::new(MemoryField::Rate, &["memory usage rate"]),
    LabelRule::new(MemoryField::Rate, &["usage rate"]).excluding(&["hbm"]),
];

/// `npu-smi info -t memory -i <npu> -c <chip>`
///
/// `hbm_usage_rate` comes from the device's common info and is copied in.
pub fn parse_memory(
    output: &CommandOutput,
    npu_id: i64,
    chip_id: i64,
    hbm_usage_rate: i64,
) -> MemoryInfo {
    let (mut used, mut total, mut rate) = (None, None, None);
    scan(output, MEMORY_RULES, |field, line| match field {
        MemoryField::Used => set_once(&mut used, label_integer(line)),
        MemoryField::Total => set_once(&mut total, label_integer(line)),
        MemoryField::Rate => set_once(&mut rate, label_integer(line)),
    });
    MemoryInfo {
        npu_id,
        chip_id,
        memory_usage: used.unwrap_or_default(),
        memory_total: total.unwrap_or_default(),
        memory_usage_rate: rate.unwrap_or_default(),
        hbm_usage_rate,
    }
}

/// `npu-smi info -t common -i <npu>`: HBM usage rate in percent.
///
/// Prefers an explicit usage/utilization line over any other HBM line.
pub fn parse_hbm_usage_rate(output: &CommandOutput) -> i64 {
    if output.is_unusable() {
        return 0;
    }
    let hbm_lines: Vec<&str> = lines(&output.stdout)
        .filter(|line| line.to_ascii_lowercase().contains("hbm"))
        .collect();
    hbm_lines
        .iter()
        .find(|line| {
            let lowered = line.to_ascii_lowercase();
            lowered.contains("rate") || lowered.contains("util")
        })
        .or(hbm_lines.first())
        .and_then(|line| label_integer(line))
        .unwrap_or_default()
}

#[derive(Clone, Copy)]
enum UsageField {
    AiCore,
    Memory,
    Bandwidth,
}

const USAGE_RULES: &[LabelRule<UsageField>] = &[
    LabelRule::new(UsageField::AiCore, &["ai core usage", "aicore usage"]),
    LabelRule::new(UsageField::Memory, &["memory usage"]),
    LabelRule::new(UsageField::Bandwidth, &["bandwidth"]),
];

/// `npu-smi info -t usages -i <npu> -c <chip>`
pub fn parse_usage(output: &CommandOutput, npu_id: i64, chip_id: i64) -> Usage {
    let (mut ai_core, mut memory, mut bandwidth) = (None, None, None);
    scan(output, USAGE_RULES, |field, line| match field {
        UsageField::AiCore => set_once(&mut ai_core, label_integer(line)),
        UsageField::Memory => set_once(&mut memory, label_integer(line)),
        UsageField::Bandwidth => set_once(&mut bandwidth, label_integer(line)),
    });
    Usage {
        npu_id,
        chip_id,
        ai_core_usage: ai_core.unwrap_or_default(),
        memory_usage: memory.unwrap_or_default(),
        bandwidth_usage: bandwidth.unwrap_or_default(),
    }
}

#[derive(Clone, Copy)]
enum EccField {
    Count,
    Mode,
}

const ECC_RULES: &[LabelRule<EccField>] = &[
    LabelRule::new(EccField::Count, &["error count"]),
    LabelRule::new(EccField::Mode, &["ecc mode", "ecc enable"]),
];

/// `npu-smi info -t ecc -i <npu> -c <chip>`
pub fn parse_ecc(output: &CommandOutput, npu_id: i64, chip_id: i64) -> Ecc {
    let mut count = 0;
    let mut mode = None;
    scan(output, ECC_RULES, |field, line| match field {
        EccField::Count => count += label_integer(line).unwrap_or_default(),
        EccField::Mode => set_once(&mut mode, value_after_colon(line).map(str::to_string)),
    });
    Ecc {
        npu_id,
        chip_id,
        ecc_error_count: count,
        ecc_mode: mode.unwrap_or_default(),
    }
}

/// Distinct device ids referenced by `chips`, ascending.
pub fn distinct_npu_ids(chips: &[Chip]) -> Vec<i64> {
    let mut ids: Vec<i64> = chips.iter().map(|chip| chip.npu_id).collect();
    ids.sort_unstable();
    ids.dedup();
    ids
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ok(stdout: &str) -> CommandOutput {
        CommandOutput::new(stdout, "", 0)
    }

    mod devices {
        use super::*;

        #[test]
        fn test_key_value_blocks() {
            let out = ok("        Total Count                    : 2\n\n\
                          NPU ID                         : 0\n\
                          Product Name                   : IT21PDDA01\n\
                          Serial Number                  : 123\n\n\
                          NPU ID                         : 1\n\
                          Product Name                   : IT21PDDA01\n");
            assert_eq!(
                parse_devices(&out),
                vec![
                    Device {
                        id: 0,
                        name: "IT21PDDA01".into()
                    },
                    Device {
                        id: 1,
                        name: "IT21PDDA01".into()
                    },
                ]
            );
        }

        #[test]
        fn test_table_rows() {
            let out = ok("NPU  Name\n---  ----\n0    Ascend 910B\n1    Ascend 910B\n");
            let devices = parse_devices(&out);
            assert_eq!(devices.len(), 2);
            assert_eq!(devices[1].id, 1);
            assert_eq!(devices[1].name, "Ascend 910B");
        }

        #[test]
        fn test_failed_command_is_empty() {
            assert!(parse_devices(&CommandOutput::failure("command not found")).is_empty());
            assert!(parse_devices(&ok("")).is_empty());
        }
    }

    mod chips {
        use super::*;

        #[test]
        fn test_filters_management_controller() {
            let out = ok(
                "NPU ID   Chip ID   Chip Logic ID   Chip Name\n\
                 0        0         0               Ascend 910B3\n\
                 0        1         -               Mcu\n\
                 1        0         1               Ascend 910B3\n\
                 1        1         -               MCU\n",
            );
            let chips = parse_chips(&out);
            assert_eq!(chips.len(), 2);
            assert_eq!(chips[0].npu_id, 0);
            assert_eq!(chips[0].name, "Ascend 910B3");
            assert_eq!(chips[1].npu_id, 1);
            assert_eq!(chips[1].health, "OK");
        }

        #[test]
        fn test_short_rows_skipped() {
            assert!(parse_chips(&ok("0 0 0\n")).is_empty());
        }

        #[test]
        fn test_distinct_npu_ids() {
            let chip = |npu_id, chip_id| Chip {
                npu_id,
                chip_id,
                name: "x".into(),
                health: "OK".into(),
            };
            let chips = vec![chip(1, 0), chip(0, 0), chip(1, 1)];
            assert_eq!(distinct_npu_ids(&chips), vec![0, 1]);
        }
    }

    mod detail {
        use super::*;

        #[test]
        fn test_board() {
            let out = ok("NPU ID : 3\n\
                          Product Name : IT21PDDA01\n\
                          Health : OK\n\
                          Software Version : 23.0.rc2\n\
                          Firmware Version : 7.0.0.5.242\n");
            let board = parse_board(&out, 3);
            assert_eq!(board.npu_id, 3);
            assert_eq!(board.name, "IT21PDDA01");
            assert_eq!(board.health, "OK");
            assert_eq!(board.software_version, "23.0.rc2");
            assert_eq!(board.firmware_version, "7.0.0.5.242");
        }

        #[test]
        fn test_temperature_rounds() {
            let out = ok("NPU Temperature (C) : 45.6\nAI Core Temperature (C) : 50.4\n");
            let temp = parse_temperature(&out, 0, 1);
            assert_eq!((temp.npu_temp, temp.ai_core_temp), (46, 50));
            assert_eq!(temp.chip_id, 1);
        }

        #[test]
        fn test_power() {
            let out = ok("Real-time Power(W) : 93.6\nPower Limit(W) : 350\n");
            let power = parse_power(&out, 0, 0);
            assert_eq!((power.power_usage, power.power_limit), (94, 350));
        }

        #[test]
        fn test_memory_labels_do_not_collide() {
            let out = ok("Memory Usage(MB) : 3378\n\
                          HBM Capacity(MB) : 65536\n\
                          HBM Usage Rate(%) : 9\n\
                          Memory Usage Rate(%) : 5\n");
            let mem = parse_memory(&out, 0, 0, 7);
            assert_eq!(mem.memory_usage, 3378);
            assert_eq!(mem.memory_total, 65536);
            assert_eq!(mem.memory_usage_rate, 5);
            assert_eq!(mem.hbm_usage_rate, 7);
        }

        #[test]
        fn test_hbm_rate_prefers_rate_line() {
            let out = ok("HBM Capacity(MB) : 65536\nHBM Usage Rate(%) : 12\n");
            assert_eq!(parse_hbm_usage_rate(&out), 12);
            assert_eq!(parse_hbm_usage_rate(&ok("Chip Count : 1")), 0);
        }

        #[test]
        fn test_usage() {
            let out = ok("Memory Usage Rate(%) : 3\n\
                          Aicore Usage Rate(%) : 87\n\
                          DDR Bandwidth Usage Rate(%) : 11\n\
                          HBM Bandwidth Usage Rate(%) : 40\n");
            let usage = parse_usage(&out, 0, 0);
            assert_eq!(usage.ai_core_usage, 87);
            assert_eq!(usage.memory_usage, 3);
            assert_eq!(usage.bandwidth_usage, 11);
        }

        #[test]
        fn test_ecc_sums_counters() {
            let out = ok("ECC Mode : Enable\n\
                          DDR Single Bit Error Count : 2\n\
                          DDR Double Bit Error Count : 1\n\
                          HBM Single Bit Error Count : 0\n");
            let ecc = parse_ecc(&out, 0, 0);
            assert_eq!(ecc.ecc_error_count, 3);
            assert_eq!(ecc.ecc_mode, "Enable");
        }

        #[test]
        fn test_failed_detail_is_zeroed() {
            let failed = CommandOutput::failure("timeout");
            assert_eq!(parse_power(&failed, 2, 0), Power {
                npu_id: 2,
                ..Default::default()
            });
            assert_eq!(parse_ecc(&failed, 0, 0).ecc_error_count, 0);
        }
    }
}
