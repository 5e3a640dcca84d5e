//! # pmctrack - Main Entry Point
//!
//! Parses the command line, runs the pre-flight checks, binds the monitor to
//! its CPUs (`-B`) and runs one [`Session`] against the `/proc/pmc` backend.
//! The process exits with the monitored command's exit code.

use anyhow::{Context, Result};
use clap::Parser;
use log::{debug, warn};
use std::fs::File;
use std::io::{self, LineWriter, Write};

use pmctrack::affinity::{bind_current_process, online_cpus, validate_mask};
use pmctrack::cli::Args;
use pmctrack::domain::CpuMask;
use pmctrack::monitor::{Session, SessionConfig};
use pmctrack::pmc::procfs::ProcPmc;
use pmctrack::preflight::run_preflight_checks;

// Exit codes
const EXIT_ERROR: i32 = 1;
const EXIT_USAGE: i32 = 2;
const EXIT_NOPERM: i32 = 77;

fn main() {
    env_logger::init();
    std::process::exit(match run() {
        Ok(code) => code,
        Err(e) => {
            let code = exit_code_for(&e);
            eprintln!("error: {e:#}");
            code
        }
    });
}

fn exit_code_for(err: &anyhow::Error) -> i32 {
    let msg = format!("{err:#}").to_lowercase();
    if msg.contains("permission denied") {
        EXIT_NOPERM
    } else if msg.contains("missing required argument") || msg.contains("missing command") {
        EXIT_USAGE
    } else {
        EXIT_ERROR
    }
}

/// Check CPU masks against the online CPUs, when those can be read
fn validate_masks(masks: &[CpuMask]) -> Result<()> {
    if masks.is_empty() {
        return Ok(());
    }
    match online_cpus() {
        Ok(online) => {
            for &mask in masks {
                validate_mask(mask, &online)?;
            }
        }
        Err(e) => warn!("{e:#}, CPU masks not validated"),
    }
    Ok(())
}

fn run() -> Result<i32> {
    let args = Args::parse();
    let config = SessionConfig::from_args(&args)?;

    let masks: Vec<CpuMask> = config.target_affinity.into_iter().chain(config.monitor_affinity).collect();
    validate_masks(&masks)?;

    if let Some(mask) = config.monitor_affinity {
        bind_current_process(mask)?;
        debug!("Monitor bound to cpumask {mask}");
    }

    run_preflight_checks(&config.pmc_root, &config.command[0])?;
    let pmc = ProcPmc::new(&config.pmc_root)?;

    let out: Box<dyn Write> = match &config.output_path {
        Some(path) => Box::new(LineWriter::new(
            File::create(path).with_context(|| format!("Failed to open output file {}", path.display()))?,
        )),
        None => Box::new(io::stdout()),
    };

    let summary = Session::new(config, pmc).run(out)?;
    debug!(
        "Session ended in phase {:?} after {} samples ({} dropped)",
        summary.phase, summary.samples, summary.dropped
    );
    if let Some(limit) = &summary.limit {
        debug!("Stopped early: {limit}");
    }

    Ok(summary.exit_code)
}
