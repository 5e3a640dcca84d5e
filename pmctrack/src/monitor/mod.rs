//! # Monitoring session
//!
//! Ties the pieces together for one run of the monitored command:
//!
//! 1. translate and check the counter configuration ([`crate::pmc`])
//! 2. install the [`signals::SignalRelay`] (before forking)
//! 3. system-wide mode: configure and start counting in the controller
//! 4. fork the command; per-thread mode configures counters in the child
//!    ([`launcher`], [`handshake`])
//! 5. attach, open the [`source::MonitorSource`]
//! 6. run the [`control_loop::ControlLoop`] into a
//!    [`SessionReport`](crate::report::session::SessionReport)
//! 7. [`epilogue`]: reap, `[Process times]`, exit code

pub mod accumulator;
pub mod control_loop;
pub mod epilogue;
pub mod handshake;
pub mod launcher;
pub mod signals;
pub mod source;

use std::io::Write;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use log::{error, info, warn};
use pmctrack_common::PmcSample;

use crate::affinity::parse_cpu_selector;
use crate::cli::Args;
use crate::domain::{ConfigError, CpuId, CpuMask, EntityId, MeasurementError, MonitorError, Pid};
use crate::pmc::config::{parse_pmc_configuration, parse_virtual_config, PmcConfiguration, VirtualConfig};
use crate::pmc::{ConfigPlan, ConfigScope, CounterInfo, CounterRequest, KernelMerge, Measurement};
use crate::report::session::{Preamble, SessionReport};
use crate::report::table::TableFormatter;
use crate::report::ReportLayout;
use accumulator::AccumulationEngine;
use control_loop::{ControlLoop, Phase, TerminationPolicy, TerminationReason};
use epilogue::{reap_target, write_process_times};
use launcher::{launch, LaunchOptions, Target};
use signals::{SignalRelay, TerminationState};
use source::MonitorSource;

/// How long the target may take to configure its counters
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Whose counters are monitored
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MonitorMode {
    /// The command's threads; counters configured by the command itself
    PerThread,
    /// Every CPU; counters owned by the monitor (`-S`)
    SystemWide,
}

impl MonitorMode {
    /// Entity owning a sample: the `pid` field is a thread ID per-thread and
    /// a CPU number system-wide
    ///
    /// `None` for a negative CPU number.
    #[must_use]
    pub fn entity_of(self, sample: &PmcSample) -> Option<EntityId> {
        match self {
            Self::PerThread => Some(EntityId::Thread(Pid(sample.pid))),
            Self::SystemWide => u32::try_from(sample.pid).ok().map(|cpu| EntityId::Cpu(CpuId(cpu))),
        }
    }

    #[must_use]
    pub fn config_scope(self) -> ConfigScope {
        match self {
            Self::PerThread => ConfigScope::Process,
            Self::SystemWide => ConfigScope::SystemWide,
        }
    }
}

/// Output discipline
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputMode {
    /// One row per sample as it arrives
    Stream,
    /// One row per (entity, experiment) at the end (`-A`)
    Accumulate,
}

/// Validated settings of one monitoring run
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub mode: MonitorMode,
    pub output: OutputMode,
    pub period_ms: u32,
    pub max_samples: Option<u64>,
    pub timeout: Option<Duration>,
    pub extended: bool,
    pub legacy: bool,
    pub raw_format: bool,
    pub show_times: bool,
    pub pmu: u32,
    pub counter_configs: Vec<String>,
    pub virtual_config: Option<String>,
    pub target_affinity: Option<CpuMask>,
    pub monitor_affinity: Option<CpuMask>,
    pub kernel_buffer_size: Option<usize>,
    pub max_entities: Option<usize>,
    pub handshake_timeout: Duration,
    pub pmc_root: PathBuf,
    pub output_path: Option<PathBuf>,
    pub command: Vec<String>,
}

#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn period_millis(secs: f64) -> Option<u32> {
    let ms = (secs * 1000.0).trunc();
    (ms.is_finite() && ms >= 1.0 && ms <= f64::from(u32::MAX)).then_some(ms as u32)
}

impl SessionConfig {
    /// Validate the command line
    ///
    /// # Errors
    /// Bad period, CPU selectors or handshake timeout, or no command.
    pub fn from_args(args: &Args) -> Result<Self, ConfigError> {
        if args.command.is_empty() {
            return Err(ConfigError::MissingCommand);
        }
        let period_ms = period_millis(args.period).ok_or(ConfigError::InvalidPeriod)?;
        let handshake_timeout = Duration::try_from_secs_f64(args.handshake_timeout)
            .map_err(|_| ConfigError::InvalidHandshakeTimeout(args.handshake_timeout))?;

        Ok(Self {
            mode: if args.system_wide { MonitorMode::SystemWide } else { MonitorMode::PerThread },
            output: if args.accumulate { OutputMode::Accumulate } else { OutputMode::Stream },
            period_ms,
            max_samples: args.max_samples,
            timeout: args.timeout.map(Duration::from_secs),
            extended: args.extended,
            legacy: args.legacy,
            raw_format: args.raw,
            show_times: args.times,
            pmu: args.pmu,
            counter_configs: args.counter_configs.clone(),
            virtual_config: args.virtual_config.clone(),
            target_affinity: args.bind_target.as_deref().map(parse_cpu_selector).transpose()?,
            monitor_affinity: args.bind_monitor.as_deref().map(parse_cpu_selector).transpose()?,
            kernel_buffer_size: args.kernel_buffer_size,
            max_entities: args.max_entities,
            handshake_timeout,
            pmc_root: args.pmc_root.clone(),
            output_path: args.output.clone(),
            command: args.command.clone(),
        })
    }

    #[must_use]
    pub fn period(&self) -> Duration {
        Duration::from_millis(u64::from(self.period_ms))
    }
}

/// Outcome of a completed run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionSummary {
    /// Exit code to propagate (the command's)
    pub exit_code: i32,
    pub samples: u64,
    /// `Done`, or `Error` when monitoring stopped on a runtime failure
    pub phase: Phase,
    pub limit: Option<TerminationReason>,
    /// Samples rejected by the accumulator
    pub dropped: u64,
}

/// Resolved counter setup
#[derive(Debug)]
struct CounterSetup {
    pmc: PmcConfiguration,
    info: CounterInfo,
    virt: VirtualConfig,
    kernel_drives_pmcs: bool,
}

/// One monitoring run against a measurement backend
pub struct Session<M: Measurement> {
    config: SessionConfig,
    measurement: M,
}

impl<M: Measurement> Session<M> {
    #[must_use]
    pub fn new(config: SessionConfig, measurement: M) -> Self {
        Self { config, measurement }
    }

    fn resolve_counters(&self) -> Result<CounterSetup, MeasurementError> {
        let pmc = parse_pmc_configuration(&self.config.counter_configs, self.config.raw_format, self.config.pmu)?;
        let info = self.measurement.check_counter_config(&pmc.raw_configs)?;
        let kernel_drives_pmcs = pmc.raw_configs.is_empty() && info.nr_counters != 0;

        let virt = match &self.config.virtual_config {
            Some(user) => parse_virtual_config(user, &self.measurement.virtual_counters()?)?,
            None => VirtualConfig::default(),
        };

        if info.nr_counters == 0 && virt.count == 0 {
            return Err(ConfigError::NoEvents.into());
        }
        if kernel_drives_pmcs {
            info!("Counters are driven by the kernel module ({} experiments)", info.nr_experiments);
        }
        if info.ebs {
            info!("Event-based sampling enabled");
        }

        Ok(CounterSetup { pmc, info, virt, kernel_drives_pmcs })
    }

    fn attach_and_open(&mut self, pid: Pid) -> Result<MonitorSource, MeasurementError> {
        if self.config.mode == MonitorMode::PerThread {
            self.measurement.attach_process(pid)?;
        }
        MonitorSource::acquire(&mut self.measurement, self.config.kernel_buffer_size)
    }

    /// Run the command under monitoring, writing the report to `out`
    ///
    /// # Errors
    /// Setup failures (configuration, fork, handshake, sample source). Once
    /// monitoring runs, read failures only end the loop early: the summary
    /// still carries the command's exit code.
    #[allow(clippy::too_many_lines)]
    pub fn run<W: Write>(mut self, out: W) -> Result<SessionSummary> {
        let counters = self.resolve_counters()?;
        let mode = self.config.mode;
        let nr_experiments = counters.info.nr_experiments.max(1);

        let layout = ReportLayout {
            nr_experiments,
            pmc_mask: counters.info.pmc_mask,
            virt_mask: counters.virt.mask,
            extended: self.config.extended,
            system_wide: mode == MonitorMode::SystemWide,
        };
        let preamble = Preamble {
            legacy: self.config.legacy,
            raw_counters: self.config.raw_format || counters.kernel_drives_pmcs,
            mappings: counters.pmc.mappings.clone(),
            virtual_names: if counters.virt.mnemonics_used { counters.virt.names.clone() } else { Vec::new() },
        };

        let relay = SignalRelay::install().context("Failed to install signal handlers")?;

        let request = CounterRequest {
            raw_configs: &counters.pmc.raw_configs,
            virtual_config: (counters.virt.count > 0).then_some(counters.virt.raw.as_str()),
            period_ms: self.config.period_ms,
            kernel_drives_pmcs: counters.kernel_drives_pmcs,
            kernel_buffer_size: self.config.kernel_buffer_size,
        };
        let plan = self.measurement.configuration_plan(&request, mode.config_scope())?;

        let child_plan = match mode {
            MonitorMode::SystemWide => {
                self.measurement.apply(&plan).context("Failed to configure system-wide monitoring")?;
                info!("System-wide counting started");
                ConfigPlan::new()
            }
            MonitorMode::PerThread => plan,
        };

        let mut child = launch(&LaunchOptions {
            command: &self.config.command,
            affinity: self.config.target_affinity,
            plan: &child_plan,
            handshake_timeout: self.config.handshake_timeout,
        })
        .with_context(|| format!("Failed to launch '{}'", self.config.command[0]))?;

        let mut source = match self.attach_and_open(child.pid()) {
            Ok(source) => source,
            Err(e) => {
                abandon(&mut child);
                return Err(e).context("Failed to set up sample collection");
            }
        };
        info!("Sample source ready (capacity {} samples)", source.capacity());

        let mut report = match self.config.output {
            OutputMode::Stream => SessionReport::stream(out, TableFormatter, layout, preamble, mode),
            OutputMode::Accumulate => SessionReport::accumulate(
                out,
                TableFormatter,
                layout,
                preamble,
                mode,
                AccumulationEngine::new(KernelMerge, nr_experiments, self.config.max_entities),
            ),
        };
        if let Err(e) = report.begin() {
            abandon(&mut child);
            return Err(e.into());
        }

        let policy = TerminationPolicy::new(self.config.max_samples, self.config.timeout, child.started());
        let state = TerminationState { profiling_started: true, ..TerminationState::default() };
        let outcome = ControlLoop::new(
            &mut source,
            &mut child,
            &mut report,
            relay.events(),
            self.config.period(),
            policy,
            state,
        )
        .run();

        if let Err(e) = report.finish() {
            error!("{e}");
        }

        let exit = reap_target(&mut child, outcome.exit).context("Failed to collect the command's exit status")?;
        if self.config.show_times {
            let out = report.writer();
            write_process_times(&mut *out, child.started(), &exit)
                .and_then(|()| out.flush())
                .context("Failed to write process times")?;
        }

        if let Some(MonitorError::PrematureExit) = outcome.error {
            bail!(MonitorError::PrematureExit);
        }

        Ok(SessionSummary {
            exit_code: exit.exit_code(),
            samples: outcome.samples,
            phase: outcome.phase,
            limit: outcome.limit,
            dropped: report.engine().map_or(0, AccumulationEngine::dropped),
        })
    }
}

/// Stop and reap a target whose monitoring could not start
fn abandon<T: Target>(target: &mut T) {
    if let Err(e) = target.terminate().and_then(|()| target.reap().map(drop)) {
        warn!("{e}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    fn args(argv: &[&str]) -> Args {
        Args::try_parse_from(std::iter::once("pmctrack").chain(argv.iter().copied())).unwrap()
    }

    #[test]
    fn test_defaults() {
        let cfg = SessionConfig::from_args(&args(&["-c", "instr", "./app"])).unwrap();
        assert_eq!(cfg.mode, MonitorMode::PerThread);
        assert_eq!(cfg.output, OutputMode::Stream);
        assert_eq!(cfg.period(), Duration::from_secs(1));
        assert_eq!(cfg.handshake_timeout, DEFAULT_HANDSHAKE_TIMEOUT);
        assert_eq!(cfg.max_samples, None);
        assert_eq!(cfg.command, vec!["./app"]);
    }

    #[test]
    fn test_full_option_set() {
        let cfg = SessionConfig::from_args(&args(&[
            "-c", "pmc0", "-c", "pmc1", "-r", "-T", "0.25", "-n", "5", "-N", "2", "-A", "-S", "-b", "0x3", "-B",
            "1", "-k", "8192", "-e", "-L", "-t", "--max-entities", "16", "sh", "-c", "exit 3",
        ]))
        .unwrap();
        assert_eq!(cfg.counter_configs, vec!["pmc0", "pmc1"]);
        assert!(cfg.raw_format && cfg.extended && cfg.legacy && cfg.show_times);
        assert_eq!(cfg.period_ms, 250);
        assert_eq!(cfg.max_samples, Some(5));
        assert_eq!(cfg.timeout, Some(Duration::from_secs(2)));
        assert_eq!(cfg.output, OutputMode::Accumulate);
        assert_eq!(cfg.mode, MonitorMode::SystemWide);
        assert_eq!(cfg.target_affinity, Some(CpuMask(0x3)));
        assert_eq!(cfg.monitor_affinity, Some(CpuMask(0x2)));
        assert_eq!(cfg.kernel_buffer_size, Some(8192));
        assert_eq!(cfg.max_entities, Some(16));
        // options after the command belong to the command
        assert_eq!(cfg.command, vec!["sh", "-c", "exit 3"]);
    }

    #[test]
    fn test_invalid_values() {
        assert!(matches!(
            SessionConfig::from_args(&args(&["-T", "0.0001", "./app"])),
            Err(ConfigError::InvalidPeriod)
        ));
        assert!(matches!(
            SessionConfig::from_args(&args(&["-b", "zz", "./app"])),
            Err(ConfigError::InvalidCpuSelector(_))
        ));
        assert!(SessionConfig::from_args(&args(&["--handshake-timeout=-1", "./app"])).is_err());
    }

    #[test]
    fn test_command_is_required() {
        assert!(Args::try_parse_from(["pmctrack", "-c", "instr"]).is_err());
    }

    #[test]
    fn test_entity_interpretation() {
        let sample = PmcSample { pid: 3, ..PmcSample::default() };
        assert_eq!(MonitorMode::PerThread.entity_of(&sample), Some(EntityId::Thread(Pid(3))));
        assert_eq!(MonitorMode::SystemWide.entity_of(&sample), Some(EntityId::Cpu(CpuId(3))));

        let bogus = PmcSample { pid: -1, ..PmcSample::default() };
        assert_eq!(MonitorMode::SystemWide.entity_of(&bogus), None);
        assert_eq!(MonitorMode::PerThread.entity_of(&bogus), Some(EntityId::Thread(Pid(-1))));
        assert_eq!(MonitorMode::SystemWide.config_scope(), ConfigScope::SystemWide);
    }
}
