//! CLI argument definitions

use clap::Parser;
use std::path::PathBuf;

use crate::pmc::procfs::DEFAULT_ROOT;

#[derive(Parser, Debug)]
#[command(
    name = "pmctrack",
    about = "Monitor hardware and virtual performance counters of a command",
    disable_version_flag = true,
    after_help = "\
EXAMPLES:
    pmctrack -c instr,cycles ./app                     Sample every second
    pmctrack -T 0.5 -c instr,llc_misses -A ./app       Aggregate per thread
    pmctrack -r -c pmc0,pmc1,pmc3=0x2e,umask3=0x41 ./app
    pmctrack -S -c instr -b 0x3 ./app                  Per-CPU, app bound to CPUs 0-1"
)]
pub struct Args {
    /// Counter configuration (mnemonic, or raw with -r); repeat to multiplex
    #[arg(short = 'c', value_name = "CONFIG")]
    pub counter_configs: Vec<String>,

    /// Virtual counters to monitor (virtN list, 0x mask or names)
    #[arg(short = 'V', value_name = "VIRT_CONFIG")]
    pub virtual_config: Option<String>,

    /// Write results to FILE instead of stdout
    #[arg(short = 'o', value_name = "FILE")]
    pub output: Option<PathBuf>,

    /// Seconds between two consecutive counter samplings
    #[arg(short = 'T', value_name = "SECS", default_value_t = 1.0)]
    pub period: f64,

    /// Bind the launched program to a CPU number or 0x CPU mask
    #[arg(short = 'b', value_name = "CPU|MASK")]
    pub bind_target: Option<String>,

    /// Bind the monitor itself to a CPU number or 0x CPU mask
    #[arg(short = 'B', value_name = "CPU|MASK")]
    pub bind_monitor: Option<String>,

    /// Stop the command once this many samples were collected
    #[arg(short = 'n', value_name = "MAX_SAMPLES")]
    pub max_samples: Option<u64>,

    /// Stop the command after this many seconds
    #[arg(short = 'N', value_name = "SECS")]
    pub timeout: Option<u64>,

    /// Extended output (core type column)
    #[arg(short = 'e')]
    pub extended: bool,

    /// Aggregate counts per thread (or CPU) and print them at the end
    #[arg(short = 'A')]
    pub accumulate: bool,

    /// Size in bytes of the kernel buffer used for samples
    #[arg(short = 'k', value_name = "BYTES")]
    pub kernel_buffer_size: Option<usize>,

    /// System-wide monitoring (per CPU)
    #[arg(short = 'S')]
    pub system_wide: bool,

    /// Counter configurations are in raw format
    #[arg(short = 'r')]
    pub raw: bool,

    /// PMU whose event table translates mnemonic configurations
    #[arg(short = 'p', value_name = "PMU", default_value_t = 0)]
    pub pmu: u32,

    /// Legacy output: no event-to-counter mappings
    #[arg(short = 'L')]
    pub legacy: bool,

    /// Show real, user and sys time of the command
    #[arg(short = 't')]
    pub times: bool,

    /// Maximum number of threads/CPUs tracked in aggregate mode
    #[arg(long, value_name = "N")]
    pub max_entities: Option<usize>,

    /// Seconds to wait for the command to finish its counter setup
    #[arg(long, value_name = "SECS", default_value_t = 10.0)]
    pub handshake_timeout: f64,

    /// Location of the PMCTrack kernel module entries
    #[arg(long, value_name = "DIR", default_value = DEFAULT_ROOT, hide = true)]
    pub pmc_root: PathBuf,

    /// Command line of the program to monitor
    #[arg(
        value_name = "COMMAND",
        required = true,
        num_args = 1..,
        trailing_var_arg = true,
        allow_hyphen_values = true
    )]
    pub command: Vec<String>,
}
