//! Counter-configuration service
//!
//! Turns the user's `-c` strings into raw configuration strings understood by
//! the kernel module, and `-V` strings into a virtual-counter selection.
//!
//! ## Raw format (`-r`)
//!
//! Comma-separated `key[=value]` tokens, e.g. `pmc0,pmc1,pmc3=0x2e,umask3=0x41`.
//! Per-counter keys are suffixed with the counter number (`pmcN`, `umaskN`,
//! `ebsN`, `cmaskN`, `edgeN`, `invN`, `usrN`, `osN`, `anyN`); `coretype=N`
//! restricts the experiment to one core type. Each string is one experiment.
//!
//! ## Mnemonic format
//!
//! Comma-separated event names from the PMU's table ([`super::events`]),
//! e.g. `instr_retired_fixed,unhalted_core_cycles_fixed,llc_misses`. Fixed
//! events land on their fixed counter, the rest on general-purpose counters
//! in order.

use pmctrack_common::{MAX_COUNTER_CONFIGS, MAX_PERFORMANCE_COUNTERS, MAX_VIRTUAL_COUNTERS};

use super::events::{pmu_table, PmuTable};
use super::CounterInfo;
use crate::domain::ConfigError;

const COUNTER_KEYS: &[&str] = &["pmc", "umask", "ebs", "cmask", "edge", "inv", "usr", "os", "any"];

/// Event assigned to a counter in one experiment (for the mapping preamble)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CounterMapping {
    pub experiment: usize,
    pub counter: u32,
    pub event: String,
}

/// Result of translating the `-c` strings
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PmcConfiguration {
    /// One raw string per experiment, in `-c` order
    pub raw_configs: Vec<String>,
    /// Empty when the strings were given in raw format
    pub mappings: Vec<CounterMapping>,
    /// Union of the counters used by all experiments
    pub global_pmc_mask: u32,
}

/// Facts extracted from one raw configuration string
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RawConfigSummary {
    pub pmc_mask: u32,
    pub ebs: bool,
}

/// Translate user `-c` strings (mnemonic or raw) into raw strings
///
/// # Errors
/// Too many strings, malformed raw tokens, unknown PMU or event names.
pub fn parse_pmc_configuration(
    user_configs: &[String],
    raw_format: bool,
    pmu: u32,
) -> Result<PmcConfiguration, ConfigError> {
    if user_configs.len() > MAX_COUNTER_CONFIGS {
        return Err(ConfigError::TooManyConfigs { max: MAX_COUNTER_CONFIGS });
    }

    let mut out = PmcConfiguration::default();

    if raw_format {
        for cfg in user_configs {
            let summary = analyze_raw(cfg)?;
            out.global_pmc_mask |= summary.pmc_mask;
            out.raw_configs.push(cfg.trim().to_string());
        }
        return Ok(out);
    }

    if user_configs.is_empty() {
        return Ok(out);
    }

    let table = pmu_table(pmu).ok_or_else(|| ConfigError::BadCounterConfig {
        cfg: user_configs.join(" "),
        reason: format!("unknown PMU {pmu}"),
    })?;

    for (experiment, cfg) in user_configs.iter().enumerate() {
        let (raw, mask, mappings) = translate_mnemonic(cfg, table, experiment)?;
        out.raw_configs.push(raw);
        out.global_pmc_mask |= mask;
        out.mappings.extend(mappings);
    }

    Ok(out)
}

fn translate_mnemonic(
    cfg: &str,
    table: &PmuTable,
    experiment: usize,
) -> Result<(String, u32, Vec<CounterMapping>), ConfigError> {
    let bad = |reason: String| ConfigError::BadCounterConfig { cfg: cfg.to_string(), reason };

    let mut next_gp = table.first_gp_counter;
    let gp_end = table.first_gp_counter + table.nr_gp_counters;
    let mut mask = 0u32;
    let mut tokens = Vec::new();
    let mut mappings = Vec::new();

    for name in cfg.split(',').map(str::trim) {
        if name.is_empty() {
            return Err(bad("empty event name".to_string()));
        }
        let desc = table
            .lookup(name)
            .ok_or_else(|| ConfigError::UnknownEvent { event: name.to_string(), pmu: table.id })?;

        let counter = if let Some(counter) = desc.fixed_counter {
            counter
        } else {
            if next_gp >= gp_end {
                return Err(bad(format!("more than {} general-purpose events", table.nr_gp_counters)));
            }
            next_gp += 1;
            next_gp - 1
        };

        if mask & (1 << counter) != 0 {
            return Err(bad(format!("counter pmc{counter} assigned twice")));
        }
        mask |= 1 << counter;

        if desc.fixed_counter.is_some() {
            tokens.push(format!("pmc{counter}"));
        } else {
            tokens.push(format!("pmc{counter}=0x{:x}", desc.code));
            if let Some(umask) = desc.umask {
                tokens.push(format!("umask{counter}=0x{umask:x}"));
            }
        }
        mappings.push(CounterMapping { experiment, counter, event: desc.name.to_string() });
    }

    Ok((tokens.join(","), mask, mappings))
}

fn parse_number(s: &str) -> Option<u64> {
    match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(hex, 16).ok(),
        None => s.parse().ok(),
    }
}

/// Validate a raw configuration string and extract its counter mask
///
/// # Errors
/// [`ConfigError::BadCounterConfig`] describing the first bad token.
pub fn analyze_raw(cfg: &str) -> Result<RawConfigSummary, ConfigError> {
    let bad = |reason: String| ConfigError::BadCounterConfig { cfg: cfg.to_string(), reason };

    let mut summary = RawConfigSummary { pmc_mask: 0, ebs: false };

    for token in cfg.split(',').map(str::trim) {
        if token.is_empty() {
            return Err(bad("empty token".to_string()));
        }
        let (key, value) = match token.split_once('=') {
            Some((k, v)) => (k, Some(v)),
            None => (token, None),
        };
        if let Some(value) = value {
            if parse_number(value).is_none() {
                return Err(bad(format!("invalid value in '{token}'")));
            }
        }

        if key == "coretype" {
            if value.is_none() {
                return Err(bad("coretype requires a value".to_string()));
            }
            continue;
        }

        let digits = key.find(|c: char| c.is_ascii_digit()).ok_or_else(|| bad(format!("unknown key '{key}'")))?;
        let (prefix, number) = key.split_at(digits);
        if !COUNTER_KEYS.contains(&prefix) {
            return Err(bad(format!("unknown key '{key}'")));
        }
        let counter: u32 = number.parse().map_err(|_| bad(format!("bad counter number in '{key}'")))?;
        if counter as usize >= MAX_PERFORMANCE_COUNTERS {
            return Err(bad(format!("counter {counter} out of range")));
        }

        match prefix {
            "pmc" => summary.pmc_mask |= 1 << counter,
            "ebs" => summary.ebs = true,
            _ => {}
        }
    }

    if summary.pmc_mask == 0 {
        return Err(bad("no pmcN counter selected".to_string()));
    }
    Ok(summary)
}

/// Aggregate what a set of raw strings configures
///
/// # Errors
/// Any string failing [`analyze_raw`].
pub fn summarize_raw_configs(raw_configs: &[String]) -> Result<CounterInfo, ConfigError> {
    let mut info = CounterInfo { nr_experiments: raw_configs.len(), ..CounterInfo::default() };
    for cfg in raw_configs {
        let summary = analyze_raw(cfg)?;
        info.pmc_mask |= summary.pmc_mask;
        info.ebs |= summary.ebs;
    }
    info.nr_counters = info.pmc_mask.count_ones();
    Ok(info)
}

/// Virtual-counter selection (`-V`)
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VirtualConfig {
    pub mask: u32,
    pub count: u32,
    /// At least one counter was selected by name
    pub mnemonics_used: bool,
    /// Raw form handed to the kernel (`virt0,virt2`)
    pub raw: String,
    /// Names of the selected counters, when known
    pub names: Vec<(u32, String)>,
}

/// Parse a `-V` string: `virtN` tokens, a `0x` mask, or counter names
///
/// `known` lists the counters exported by the kernel module (`virtN`, name).
///
/// # Errors
/// [`ConfigError::BadVirtualConfig`] for unknown names or out-of-range indices.
pub fn parse_virtual_config(user: &str, known: &[(u32, String)]) -> Result<VirtualConfig, ConfigError> {
    let bad = || ConfigError::BadVirtualConfig(user.to_string());
    let mut cfg = VirtualConfig::default();

    for token in user.split(',').map(str::trim) {
        if token.is_empty() {
            return Err(bad());
        }
        if let Some(hex) = token.strip_prefix("0x") {
            cfg.mask |= u32::from_str_radix(hex, 16).map_err(|_| bad())?;
        } else if let Some(n) = token.strip_prefix("virt").and_then(|n| n.parse::<u32>().ok()) {
            cfg.mask |= 1u32.checked_shl(n).ok_or_else(bad)?;
        } else {
            let (idx, _) = known.iter().find(|(_, name)| name.eq_ignore_ascii_case(token)).ok_or_else(bad)?;
            cfg.mask |= 1u32.checked_shl(*idx).ok_or_else(bad)?;
            cfg.mnemonics_used = true;
        }
    }

    if cfg.mask == 0 || (32 - cfg.mask.leading_zeros()) as usize > MAX_VIRTUAL_COUNTERS {
        return Err(bad());
    }

    cfg.count = cfg.mask.count_ones();
    let selected: Vec<u32> = (0..u32::BITS).filter(|bit| cfg.mask & (1 << bit) != 0).collect();
    cfg.raw = selected.iter().map(|n| format!("virt{n}")).collect::<Vec<_>>().join(",");
    cfg.names = selected
        .iter()
        .filter_map(|n| known.iter().find(|(idx, _)| idx == n).cloned())
        .collect();
    Ok(cfg)
}
