//! Structured error types for pmctrack
//!
//! Using thiserror for automatic Display implementation and error chaining.
//! Library modules return these; `main.rs` wraps them in `anyhow` with context.

use std::io;
use std::path::PathBuf;
use std::time::Duration;

use super::types::{CpuMask, EntityId, Pid};
use crate::pmc::ConfigStep;
use thiserror::Error;

/// Problems with the user-supplied configuration (always fatal, before fork)
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Invalid CPU selector '{0}': expected a CPU number or a 0x-prefixed mask")]
    InvalidCpuSelector(String),

    #[error("CPU mask {0} does not select any online CPU")]
    NoOnlineCpu(CpuMask),

    #[error("Sorry! cannot accept more than {max} PMC configuration strings")]
    TooManyConfigs { max: usize },

    #[error("Wrong format for PMC configuration string '{cfg}': {reason}")]
    BadCounterConfig { cfg: String, reason: String },

    #[error("Unknown event '{event}' for PMU {pmu}")]
    UnknownEvent { event: String, pmu: u32 },

    #[error("Error parsing virtual counter configuration '{0}'")]
    BadVirtualConfig(String),

    #[error("Please specify events to monitor!")]
    NoEvents,

    #[error("Sampling period must be at least 1ms")]
    InvalidPeriod,

    #[error("Invalid handshake timeout: {0}s")]
    InvalidHandshakeTimeout(f64),

    #[error("Missing command to monitor")]
    MissingCommand,
}

/// Failures talking to the PMCTrack kernel module
#[derive(Error, Debug)]
pub enum MeasurementError {
    #[error("PMCTrack kernel module not available ({0} not found)")]
    ModuleNotLoaded(PathBuf),

    #[error("Failed to write '{payload}' to {}: {source}", path.display())]
    ControlWrite { path: PathBuf, payload: String, source: io::Error },

    #[error("Failed to read {}: {source}", path.display())]
    ControlRead { path: PathBuf, source: io::Error },

    #[error("Unexpected content in {}: {line}", path.display())]
    ControlParse { path: PathBuf, line: String },

    #[error("Failed to open monitor entry {}: {source}", path.display())]
    OpenMonitor { path: PathBuf, source: io::Error },

    #[error("Failed to map shared sample buffer: {0}")]
    SharedRegion(io::Error),

    #[error("Failed to read samples: {0}")]
    Read(io::Error),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// Failures while launching the target and waiting for its readiness signal
#[derive(Error, Debug)]
pub enum HandshakeError {
    #[error("Error forking process: {0}")]
    Fork(io::Error),

    #[error("Failed to create readiness channel: {0}")]
    Channel(io::Error),

    #[error("Invalid argument for target command (contains NUL byte): {0:?}")]
    InvalidArgument(String),

    #[error("Target process failed to {step}: {source}")]
    ChildSetupFailed { step: ConfigStep, source: io::Error },

    #[error("Target process exited before counters were configured")]
    PrematureExit,

    #[error("Target process did not signal readiness within {0:?}")]
    Timeout(Duration),
}

/// Recoverable accumulation failures: the offending sample is dropped
#[derive(Error, Debug, PartialEq, Eq)]
pub enum AccumulatorError {
    #[error("Entity capacity of {capacity} reached, dropping sample for {entity}")]
    CapacityExceeded { capacity: usize, entity: EntityId },

    #[error("Experiment index {exp_idx} out of range (configured experiments: {nr_experiments})")]
    ExperimentOutOfRange { exp_idx: i32, nr_experiments: usize },
}

/// Failures of the sampling control loop and epilogue
#[derive(Error, Debug)]
pub enum MonitorError {
    #[error("Target process exited before profiling started")]
    PrematureExit,

    #[error("Failed to write report: {0}")]
    Report(#[source] io::Error),

    #[error("Failed to reap target process {pid}: {source}")]
    Reap { pid: Pid, source: io::Error },

    #[error("Failed to signal target process {pid}: {source}")]
    Signal { pid: Pid, source: io::Error },

    #[error(transparent)]
    Measurement(#[from] MeasurementError),
}
