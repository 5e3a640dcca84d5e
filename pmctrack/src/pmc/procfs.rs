//! PMCTrack kernel module backend (`/proc/pmc`)
//!
//! ## Entries
//!
//! | Entry           | Direction | Purpose                                          |
//! |-----------------|-----------|--------------------------------------------------|
//! | `config`        | write     | per-process counters, period, virtual counters, buffer size, attach |
//! | `syswide`       | write     | system-wide counters, period, virtual counters, start |
//! | `enable`        | write     | start counting for the calling process            |
//! | `monitor`       | read/mmap | sample records ([`PmcSample`] array)             |
//! | `kernel_config` | read      | counter configuration chosen by the kernel, one raw string per line |
//! | `vcounters`     | read      | exported virtual counters, `virtN name` per line |
//! | `properties`    | read      | `key=value` facts, e.g. `shared_buffer_size`     |
//!
//! The root directory is configurable so tests can run against a plain
//! directory.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::os::fd::OwnedFd;
use std::path::PathBuf;

use log::debug;
use pmctrack_common::{PmcSample, MAX_VIRTUAL_COUNTERS};

use super::config::summarize_raw_configs;
use super::{ConfigPlan, ConfigScope, ConfigStep, CounterInfo, CounterRequest, Measurement};
use crate::domain::{MeasurementError, Pid};
use crate::monitor::source::SharedRegion;

/// Default location of the kernel module's entries
pub const DEFAULT_ROOT: &str = "/proc/pmc";

/// Shared buffer size used when `properties` does not announce one
pub const DEFAULT_SHARED_REGION_BYTES: usize = 1024 * PmcSample::SIZE;

/// [`Measurement`] implementation over the `/proc/pmc` entries
#[derive(Debug)]
pub struct ProcPmc {
    root: PathBuf,
    attached: Option<Pid>,
}

impl ProcPmc {
    /// Open the backend rooted at `root`
    ///
    /// # Errors
    /// [`MeasurementError::ModuleNotLoaded`] if `root` does not exist.
    pub fn new(root: impl Into<PathBuf>) -> Result<Self, MeasurementError> {
        let root = root.into();
        if !root.is_dir() {
            return Err(MeasurementError::ModuleNotLoaded(root));
        }
        Ok(Self { root, attached: None })
    }

    /// PID given to [`Measurement::attach_process`], if any
    #[must_use]
    pub fn attached(&self) -> Option<Pid> {
        self.attached
    }

    fn entry(&self, name: &str) -> PathBuf {
        self.root.join(name)
    }

    /// Read an optional entry; a missing entry reads as `None`
    fn read_optional(&self, name: &str) -> Result<Option<String>, MeasurementError> {
        let path = self.entry(name);
        match fs::read_to_string(&path) {
            Ok(content) => Ok(Some(content)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(source) => Err(MeasurementError::ControlRead { path, source }),
        }
    }

    fn write_control(&self, name: &str, payload: &str) -> Result<(), MeasurementError> {
        let path = self.entry(name);
        let result = OpenOptions::new().write(true).open(&path).and_then(|mut f| f.write_all(payload.as_bytes()));
        result.map_err(|source| MeasurementError::ControlWrite { path, payload: payload.to_string(), source })
    }

    /// Raw strings of the configuration the kernel applies on its own
    fn kernel_counter_configs(&self) -> Result<Vec<String>, MeasurementError> {
        Ok(self
            .read_optional("kernel_config")?
            .map(|content| {
                content.lines().map(str::trim).filter(|l| !l.is_empty()).map(ToString::to_string).collect()
            })
            .unwrap_or_default())
    }

    fn shared_region_bytes(&self) -> Result<usize, MeasurementError> {
        let Some(content) = self.read_optional("properties")? else {
            return Ok(DEFAULT_SHARED_REGION_BYTES);
        };
        for line in content.lines() {
            if let Some(value) = line.trim().strip_prefix("shared_buffer_size=") {
                return value.trim().parse().map_err(|_| MeasurementError::ControlParse {
                    path: self.entry("properties"),
                    line: line.to_string(),
                });
            }
        }
        Ok(DEFAULT_SHARED_REGION_BYTES)
    }
}

impl Measurement for ProcPmc {
    fn check_counter_config(&self, raw_configs: &[String]) -> Result<CounterInfo, MeasurementError> {
        if !raw_configs.is_empty() {
            return Ok(summarize_raw_configs(raw_configs)?);
        }
        let kernel = self.kernel_counter_configs()?;
        if kernel.is_empty() {
            return Ok(CounterInfo::default());
        }
        debug!("Kernel-driven counter configuration: {kernel:?}");
        Ok(summarize_raw_configs(&kernel)?)
    }

    fn virtual_counters(&self) -> Result<Vec<(u32, String)>, MeasurementError> {
        let Some(content) = self.read_optional("vcounters")? else {
            return Ok(Vec::new());
        };
        content
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(|line| {
                line.split_once(char::is_whitespace)
                    .and_then(|(id, name)| {
                        let idx: u32 = id.strip_prefix("virt")?.parse().ok()?;
                        let in_range = usize::try_from(idx).is_ok_and(|i| i < MAX_VIRTUAL_COUNTERS);
                        in_range.then(|| (idx, name.trim().to_string()))
                    })
                    .ok_or_else(|| MeasurementError::ControlParse {
                        path: self.entry("vcounters"),
                        line: line.to_string(),
                    })
            })
            .collect()
    }

    fn configuration_plan(
        &self,
        request: &CounterRequest<'_>,
        scope: ConfigScope,
    ) -> Result<ConfigPlan, MeasurementError> {
        let target = match scope {
            ConfigScope::Process => self.entry("config"),
            ConfigScope::SystemWide => self.entry("syswide"),
        };
        let mut plan = ConfigPlan::new();

        if let Some(size) = request.kernel_buffer_size {
            plan.push(ConfigStep::KernelBufferSize, &self.entry("config"), &format!("kernel_buffer_size {size}"))?;
        }
        for cfg in request.raw_configs {
            plan.push(ConfigStep::Counters, &target, cfg)?;
        }

        let period = if request.kernel_drives_pmcs {
            format!("kernel_timeout {}", request.period_ms)
        } else {
            format!("timeout {}", request.period_ms)
        };
        plan.push(ConfigStep::SamplingPeriod, &target, &period)?;

        if let Some(virt) = request.virtual_config {
            plan.push(ConfigStep::VirtualCounters, &target, &format!("virtcfg {virt}"))?;
        }

        match scope {
            ConfigScope::Process => plan.push(ConfigStep::StartCounting, &self.entry("enable"), "1")?,
            ConfigScope::SystemWide => plan.push(ConfigStep::StartCounting, &target, "start")?,
        }

        Ok(plan)
    }

    fn attach_process(&mut self, pid: Pid) -> Result<(), MeasurementError> {
        self.write_control("config", &format!("attach {pid}"))?;
        self.attached = Some(pid);
        Ok(())
    }

    fn open_monitor(&mut self) -> Result<OwnedFd, MeasurementError> {
        let path = self.entry("monitor");
        File::open(&path).map(OwnedFd::from).map_err(|source| MeasurementError::OpenMonitor { path, source })
    }

    fn request_shared_region(&self, monitor: &OwnedFd) -> Result<SharedRegion, MeasurementError> {
        let bytes = self.shared_region_bytes()?;
        SharedRegion::map(monitor, bytes).map_err(MeasurementError::SharedRegion)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fake_root() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        for entry in ["config", "syswide", "enable", "monitor"] {
            fs::write(dir.path().join(entry), "").unwrap();
        }
        dir
    }

    fn payloads(plan: &ConfigPlan) -> Vec<(ConfigStep, String)> {
        plan.writes().iter().map(|w| (w.step, String::from_utf8(w.payload.clone()).unwrap())).collect()
    }

    #[test]
    fn test_missing_root_means_module_not_loaded() {
        let err = ProcPmc::new("/nonexistent/pmc").unwrap_err();
        assert!(matches!(err, MeasurementError::ModuleNotLoaded(_)));
    }

    #[test]
    fn test_process_plan_order() {
        let dir = fake_root();
        let pmc = ProcPmc::new(dir.path()).unwrap();
        let configs = vec!["pmc0,pmc1".to_string()];
        let request = CounterRequest {
            raw_configs: &configs,
            virtual_config: Some("virt0"),
            period_ms: 250,
            kernel_drives_pmcs: false,
            kernel_buffer_size: Some(8192),
        };

        let plan = pmc.configuration_plan(&request, ConfigScope::Process).unwrap();
        assert_eq!(
            payloads(&plan),
            vec![
                (ConfigStep::KernelBufferSize, "kernel_buffer_size 8192".to_string()),
                (ConfigStep::Counters, "pmc0,pmc1".to_string()),
                (ConfigStep::SamplingPeriod, "timeout 250".to_string()),
                (ConfigStep::VirtualCounters, "virtcfg virt0".to_string()),
                (ConfigStep::StartCounting, "1".to_string()),
            ]
        );
        assert!(plan.writes()[4].path.to_str().unwrap().ends_with("enable"));
    }

    #[test]
    fn test_system_wide_plan_applies_in_controller() {
        let dir = fake_root();
        let pmc = ProcPmc::new(dir.path()).unwrap();
        let request = CounterRequest {
            raw_configs: &[],
            virtual_config: None,
            period_ms: 1000,
            kernel_drives_pmcs: true,
            kernel_buffer_size: None,
        };

        let plan = pmc.configuration_plan(&request, ConfigScope::SystemWide).unwrap();
        pmc.apply(&plan).unwrap();

        // Each write opens the entry afresh at offset 0
        assert!(fs::read_to_string(dir.path().join("syswide")).unwrap().starts_with("start"));
        assert_eq!(payloads(&plan)[0], (ConfigStep::SamplingPeriod, "kernel_timeout 1000".to_string()));
    }

    #[test]
    fn test_apply_reports_path_and_payload() {
        let dir = fake_root();
        let pmc = ProcPmc::new(dir.path()).unwrap();
        fs::remove_file(dir.path().join("enable")).unwrap();
        let request = CounterRequest {
            raw_configs: &[],
            virtual_config: None,
            period_ms: 10,
            kernel_drives_pmcs: false,
            kernel_buffer_size: None,
        };
        let plan = pmc.configuration_plan(&request, ConfigScope::Process).unwrap();
        let err = pmc.apply(&plan).unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("enable") && msg.contains("'1'"), "{msg}");
    }

    #[test]
    fn test_kernel_driven_configuration() {
        let dir = fake_root();
        fs::write(dir.path().join("kernel_config"), "pmc0,pmc1\npmc0,pmc2=0xc4\n").unwrap();
        let pmc = ProcPmc::new(dir.path()).unwrap();

        let info = pmc.check_counter_config(&[]).unwrap();
        assert_eq!(info.nr_experiments, 2);
        assert_eq!(info.pmc_mask, 0b111);

        let none = ProcPmc::new(fake_root().path()).unwrap().check_counter_config(&[]).unwrap();
        assert_eq!(none, CounterInfo::default());
    }

    #[test]
    fn test_virtual_counter_listing() {
        let dir = fake_root();
        fs::write(dir.path().join("vcounters"), "virt0 energy_core\nvirt1 energy_dram\n").unwrap();
        let pmc = ProcPmc::new(dir.path()).unwrap();
        assert_eq!(
            pmc.virtual_counters().unwrap(),
            vec![(0, "energy_core".to_string()), (1, "energy_dram".to_string())]
        );

        fs::write(dir.path().join("vcounters"), "garbage\n").unwrap();
        assert!(pmc.virtual_counters().is_err());

        // Index beyond the sample record's virtual counter slots
        fs::write(dir.path().join("vcounters"), "virt40 energy\n").unwrap();
        assert!(matches!(pmc.virtual_counters(), Err(MeasurementError::ControlParse { .. })));
    }

    #[test]
    fn test_attach_records_pid() {
        let dir = fake_root();
        let mut pmc = ProcPmc::new(dir.path()).unwrap();
        pmc.attach_process(Pid(4321)).unwrap();
        assert_eq!(pmc.attached(), Some(Pid(4321)));
        assert_eq!(fs::read_to_string(dir.path().join("config")).unwrap(), "attach 4321");
    }
}
