//! Measurement subsystem interface
//!
//! The monitor never programs counters itself. Everything goes through the
//! [`Measurement`] trait, implemented for the PMCTrack kernel module by
//! [`procfs::ProcPmc`]:
//!
//! - [`config`] / [`events`] - translation of `-c`/`-V` strings
//! - [`Measurement::check_counter_config`] - counter count, mask, experiments
//! - [`Measurement::configuration_plan`] - the ordered control writes that
//!   configure and start counting, for a process or system-wide
//! - [`Measurement::attach_process`] / [`Measurement::open_monitor`] /
//!   [`Measurement::request_shared_region`] - sample collection
//! - [`SampleMerge`] - numeric accumulation contract
//!
//! ## Configuration plans
//!
//! In per-thread mode the counters are configured by the *target* process,
//! between `fork()` and `exec()`, because the kernel module applies
//! configuration to the calling task. Nothing there may allocate or take
//! locks, so the controller builds a [`ConfigPlan`] of pre-encoded writes
//! (C-string paths and byte payloads) and the child replays it with raw
//! system calls. System-wide mode replays the same kind of plan in the
//! controller.

#![allow(unsafe_code)] // raw open/write/close for the fork-safe plan replay

pub mod config;
pub mod events;
pub mod procfs;

use std::ffi::CString;
use std::fmt;
use std::os::fd::OwnedFd;

use pmctrack_common::PmcSample;

use crate::domain::{ConfigError, MeasurementError, Pid};
use crate::monitor::source::SharedRegion;

/// Where a configuration plan takes effect
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigScope {
    /// The calling process (replayed by the target before `exec`)
    Process,
    /// All CPUs, owned by the controller
    SystemWide,
}

/// Step of the setup sequence, reported back by the target on failure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConfigStep {
    Affinity = 1,
    KernelBufferSize = 2,
    Counters = 3,
    SamplingPeriod = 4,
    VirtualCounters = 5,
    StartCounting = 6,
}

impl ConfigStep {
    #[must_use]
    pub fn from_code(code: u8) -> Option<Self> {
        Some(match code {
            1 => Self::Affinity,
            2 => Self::KernelBufferSize,
            3 => Self::Counters,
            4 => Self::SamplingPeriod,
            5 => Self::VirtualCounters,
            6 => Self::StartCounting,
            _ => return None,
        })
    }

    #[must_use]
    pub fn code(self) -> u8 {
        self as u8
    }
}

impl fmt::Display for ConfigStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Affinity => "bind to the requested CPUs",
            Self::KernelBufferSize => "set the kernel buffer size",
            Self::Counters => "configure counters",
            Self::SamplingPeriod => "configure the sampling period",
            Self::VirtualCounters => "configure virtual counters",
            Self::StartCounting => "start counting",
        })
    }
}

/// One pre-encoded write to a control file
#[derive(Debug, Clone)]
pub struct ControlWrite {
    pub step: ConfigStep,
    pub path: CString,
    pub payload: Vec<u8>,
}

/// A failed plan step, without any heap data
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StepFailure {
    pub index: usize,
    pub step: ConfigStep,
    pub errno: i32,
}

/// Ordered control writes configuring and starting the counters
#[derive(Debug, Clone, Default)]
pub struct ConfigPlan {
    writes: Vec<ControlWrite>,
}

impl ConfigPlan {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a write of `payload` to `path`
    ///
    /// # Errors
    /// Fails when the path or payload contains a NUL byte.
    pub fn push(&mut self, step: ConfigStep, path: &std::path::Path, payload: &str) -> Result<(), ConfigError> {
        use std::os::unix::ffi::OsStrExt;

        let nul = |what: &str| ConfigError::BadCounterConfig {
            cfg: what.to_string(),
            reason: "contains a NUL byte".to_string(),
        };
        let path_c = CString::new(path.as_os_str().as_bytes()).map_err(|_| nul(&path.display().to_string()))?;
        if payload.as_bytes().contains(&0) {
            return Err(nul(payload));
        }
        self.writes.push(ControlWrite { step, path: path_c, payload: payload.as_bytes().to_vec() });
        Ok(())
    }

    #[must_use]
    pub fn writes(&self) -> &[ControlWrite] {
        &self.writes
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.writes.is_empty()
    }

    /// Replay the plan with raw `open`/`write`/`close`
    ///
    /// Async-signal-safe: performs no allocation and takes no locks, so it can
    /// run in a forked child of a multi-threaded process.
    ///
    /// # Errors
    /// The first failing write, with the `errno` it produced.
    pub fn replay(&self) -> Result<(), StepFailure> {
        for (index, write) in self.writes.iter().enumerate() {
            let fail = |errno| StepFailure { index, step: write.step, errno };

            // SAFETY: path is a valid NUL-terminated string owned by the plan
            let fd = unsafe { libc::open(write.path.as_ptr(), libc::O_WRONLY | libc::O_CLOEXEC) };
            if fd < 0 {
                return Err(fail(errno()));
            }
            // SAFETY: payload buffer is valid for payload.len() bytes
            let written = unsafe { libc::write(fd, write.payload.as_ptr().cast(), write.payload.len()) };
            let write_errno = errno();
            // SAFETY: fd was returned by open above
            unsafe { libc::close(fd) };

            if written < 0 {
                return Err(fail(write_errno));
            }
            if written.unsigned_abs() != write.payload.len() {
                return Err(fail(libc::EIO));
            }
        }
        Ok(())
    }
}

fn errno() -> i32 {
    std::io::Error::last_os_error().raw_os_error().unwrap_or(libc::EIO)
}

/// What the subsystem reports about a counter configuration
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CounterInfo {
    /// Number of distinct hardware counters in use
    pub nr_counters: u32,
    /// Union of the counters in use (bit N = pmcN)
    pub pmc_mask: u32,
    /// Number of multiplexed configurations
    pub nr_experiments: usize,
    /// Event-based sampling requested by at least one experiment
    pub ebs: bool,
}

/// Everything needed to build a configuration plan
#[derive(Debug, Clone, Copy)]
pub struct CounterRequest<'a> {
    /// Raw strings to apply; empty when the kernel drives the counters
    pub raw_configs: &'a [String],
    /// Raw virtual-counter selection (`virt0,virt2`)
    pub virtual_config: Option<&'a str>,
    pub period_ms: u32,
    /// No `-c` given but the kernel has a counter configuration of its own
    pub kernel_drives_pmcs: bool,
    pub kernel_buffer_size: Option<usize>,
}

/// Measurement subsystem operations consumed by the monitor
pub trait Measurement {
    /// Validate raw strings (or query the kernel's own configuration when
    /// `raw_configs` is empty)
    ///
    /// # Errors
    /// Malformed strings or an unreadable kernel configuration.
    fn check_counter_config(&self, raw_configs: &[String]) -> Result<CounterInfo, MeasurementError>;

    /// Virtual counters exported by the subsystem, as (index, name)
    ///
    /// # Errors
    /// The listing cannot be read.
    fn virtual_counters(&self) -> Result<Vec<(u32, String)>, MeasurementError>;

    /// Build the ordered writes that configure and start counting
    ///
    /// # Errors
    /// A string cannot be encoded for the control files.
    fn configuration_plan(
        &self,
        request: &CounterRequest<'_>,
        scope: ConfigScope,
    ) -> Result<ConfigPlan, MeasurementError>;

    /// Apply a plan in the calling (controller) process
    ///
    /// # Errors
    /// The first rejected write, with its path and payload.
    fn apply(&self, plan: &ConfigPlan) -> Result<(), MeasurementError> {
        plan.replay().map_err(|failure| {
            let write = &plan.writes()[failure.index];
            MeasurementError::ControlWrite {
                path: std::path::PathBuf::from(write.path.to_string_lossy().into_owned()),
                payload: String::from_utf8_lossy(&write.payload).into_owned(),
                source: std::io::Error::from_raw_os_error(failure.errno),
            }
        })
    }

    /// Tell the subsystem which process the monitor entry follows
    ///
    /// # Errors
    /// The subsystem rejected the PID.
    fn attach_process(&mut self, pid: Pid) -> Result<(), MeasurementError>;

    /// Open the entry samples are read from
    ///
    /// # Errors
    /// The entry cannot be opened.
    fn open_monitor(&mut self) -> Result<OwnedFd, MeasurementError>;

    /// Map the subsystem's shared sample buffer for `monitor`
    ///
    /// # Errors
    /// The mapping was refused.
    fn request_shared_region(&self, monitor: &OwnedFd) -> Result<SharedRegion, MeasurementError>;
}

/// Numeric accumulation contract used by aggregate mode
pub trait SampleMerge {
    fn merge(&self, aggregate: &mut PmcSample, sample: &PmcSample, copy_metadata: bool);
}

/// Merge as implemented by the PMCTrack kernel module: sums, metadata from
/// the first sample
#[derive(Debug, Clone, Copy, Default)]
pub struct KernelMerge;

impl SampleMerge for KernelMerge {
    fn merge(&self, aggregate: &mut PmcSample, sample: &PmcSample, copy_metadata: bool) {
        aggregate.accumulate(sample, copy_metadata);
    }
}
