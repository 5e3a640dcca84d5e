//! CPU affinity utilities
//!
//! Resolves `-b`/`-B` CPU selectors into masks, checks them against the CPUs
//! listed in `/sys/devices/system/cpu/online`, and applies them with
//! `sched_setaffinity(2)`.
//!
//! A selector is either a `0x`-prefixed hexadecimal mask (`0x5` = CPUs 0 and
//! 2) or a single decimal CPU number (`3` = mask `0x8`).

#![allow(unsafe_code)] // cpu_set_t manipulation and sched_setaffinity

use anyhow::{Context, Result};
use std::fs;
use std::io;

use crate::domain::{ConfigError, CpuId, CpuMask};

/// Parse a CPU selector into a mask
///
/// # Errors
/// Returns [`ConfigError::InvalidCpuSelector`] for malformed input, CPU
/// numbers beyond the 64-bit mask and empty masks.
pub fn parse_cpu_selector(selector: &str) -> Result<CpuMask, ConfigError> {
    let invalid = || ConfigError::InvalidCpuSelector(selector.to_string());
    let selector = selector.trim();

    let mask = if let Some(hex) =
        selector.strip_prefix("0x").or_else(|| selector.strip_prefix("0X"))
    {
        u64::from_str_radix(hex, 16).map_err(|_| invalid())?
    } else {
        let cpu: u32 = selector.parse().map_err(|_| invalid())?;
        1u64.checked_shl(cpu).ok_or_else(invalid)?
    };

    if mask == 0 {
        return Err(invalid());
    }
    Ok(CpuMask(mask))
}

/// Get list of online CPU IDs from /sys/devices/system/cpu/online
///
/// Returns a vector of CPU IDs (e.g., [0, 1, 2, 3] for a 4-core system).
pub fn online_cpus() -> Result<Vec<CpuId>> {
    let content = fs::read_to_string("/sys/devices/system/cpu/online")
        .context("Failed to read /sys/devices/system/cpu/online")?;
    parse_cpu_list(&content)
}

/// Parse the kernel's CPU list format: "0-3" or "0-3,8-11" for NUMA systems
pub fn parse_cpu_list(content: &str) -> Result<Vec<CpuId>> {
    let mut cpus = Vec::new();

    for range in content.trim().split(',').filter(|r| !r.is_empty()) {
        if let Some((start, end)) = range.split_once('-') {
            let start: u32 = start.parse().with_context(|| format!("Bad CPU range '{range}'"))?;
            let end: u32 = end.parse().with_context(|| format!("Bad CPU range '{range}'"))?;
            cpus.extend((start..=end).map(CpuId));
        } else {
            let cpu: u32 = range.parse().with_context(|| format!("Bad CPU number '{range}'"))?;
            cpus.push(CpuId(cpu));
        }
    }

    Ok(cpus)
}

/// Check that `mask` selects at least one of the `online` CPUs
///
/// # Errors
/// Returns [`ConfigError::NoOnlineCpu`] otherwise.
pub fn validate_mask(mask: CpuMask, online: &[CpuId]) -> Result<(), ConfigError> {
    if online.iter().any(|&cpu| mask.contains(cpu)) {
        Ok(())
    } else {
        Err(ConfigError::NoOnlineCpu(mask))
    }
}

/// Kernel CPU set built ahead of time
///
/// Built in the parent so the forked child only has to issue the
/// `sched_setaffinity` system call.
#[derive(Clone, Copy)]
pub struct CpuSet {
    set: libc::cpu_set_t,
}

impl CpuSet {
    #[must_use]
    pub fn from_mask(mask: CpuMask) -> Self {
        // SAFETY: cpu_set_t is a plain bit array, all-zeroes is the empty set
        let mut set: libc::cpu_set_t = unsafe { std::mem::zeroed() };
        for cpu in mask.cpus() {
            // SAFETY: cpu < 64 < CPU_SETSIZE
            unsafe { libc::CPU_SET(cpu.0 as usize, &mut set) };
        }
        Self { set }
    }

    /// Bind the calling process. Async-signal-safe: usable between fork and exec.
    pub fn apply_to_current(&self) -> io::Result<()> {
        // SAFETY: `set` is a valid cpu_set_t owned by self
        let rc = unsafe {
            libc::sched_setaffinity(0, std::mem::size_of::<libc::cpu_set_t>(), &self.set)
        };
        if rc == 0 {
            Ok(())
        } else {
            Err(io::Error::last_os_error())
        }
    }
}

/// Bind the monitor itself (`-B`)
pub fn bind_current_process(mask: CpuMask) -> Result<()> {
    CpuSet::from_mask(mask)
        .apply_to_current()
        .with_context(|| format!("Error when binding process to cpumask {mask}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_cpu_selector() {
        assert_eq!(parse_cpu_selector("0x5").unwrap(), CpuMask(0b101));
        assert_eq!(parse_cpu_selector("3").unwrap(), CpuMask(0b1000));
        assert_eq!(parse_cpu_selector("0").unwrap(), CpuMask(1));
        assert!(parse_cpu_selector("0x0").is_err());
        assert!(parse_cpu_selector("64").is_err());
        assert!(parse_cpu_selector("abc").is_err());
        assert!(parse_cpu_selector("").is_err());
    }

    #[test]
    fn test_parse_cpu_list() {
        let cpus = parse_cpu_list("0-3,8,10-11\n").unwrap();
        let ids: Vec<u32> = cpus.iter().map(|c| c.0).collect();
        assert_eq!(ids, vec![0, 1, 2, 3, 8, 10, 11]);
        assert!(parse_cpu_list("0-x").is_err());
    }

    #[test]
    fn test_validate_mask() {
        let online = parse_cpu_list("0-3").unwrap();
        assert!(validate_mask(CpuMask(0x2), &online).is_ok());
        assert!(matches!(validate_mask(CpuMask(0x100), &online), Err(ConfigError::NoOnlineCpu(_))));
    }

    #[test]
    fn test_online_cpus() {
        #[cfg(target_os = "linux")]
        {
            let cpus = online_cpus().expect("Failed to read online CPUs");
            assert!(cpus.contains(&CpuId(0)));
        }
    }
}
