//! Pre-flight checks for pmctrack
//!
//! Validates the environment before anything is forked: the kernel module
//! entries must exist and be writable, and the command must resolve to an
//! executable. Failures carry actionable messages.

#![allow(unsafe_code)] // access(2) requires unsafe

use anyhow::{bail, Result};
use std::ffi::CString;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

/// Run all pre-flight checks before the session starts
pub fn run_preflight_checks(pmc_root: &Path, command: &str) -> Result<()> {
    check_module_loaded(pmc_root)?;
    check_control_access(pmc_root)?;
    check_command(command)?;
    Ok(())
}

/// Check that the PMCTrack kernel module exposes its entries
pub fn check_module_loaded(pmc_root: &Path) -> Result<()> {
    if !pmc_root.is_dir() {
        bail!(
            "PMCTrack kernel module not available ({} not found)\n\n\
             Load the module first, e.g.: sudo modprobe mchw_intel_core",
            pmc_root.display()
        );
    }
    Ok(())
}

/// Check that the configuration entry accepts writes from this user
fn check_control_access(pmc_root: &Path) -> Result<()> {
    let config = pmc_root.join("config");
    if !config.exists() {
        bail!(
            "{} not found\n\n\
             The PMCTrack kernel module seems to be loaded only partially.",
            config.display()
        );
    }
    let Ok(c_path) = CString::new(config.as_os_str().as_bytes()) else {
        return Ok(());
    };
    // SAFETY: c_path is a valid NUL-terminated string
    if unsafe { libc::access(c_path.as_ptr(), libc::W_OK) } != 0 {
        bail!(
            "Permission denied: cannot write {}\n\n\
             Run with: sudo pmctrack ...",
            config.display()
        );
    }
    Ok(())
}

/// Check that `command` names an executable, directly or through `PATH`
pub fn check_command(command: &str) -> Result<()> {
    if command.contains('/') {
        let path = Path::new(command);
        if !path.exists() {
            bail!(
                "Command not found: {command}\n\n\
                 Make sure the path is correct and the program exists."
            );
        }
        if !is_executable(path) {
            bail!("Not an executable file: {command}");
        }
        return Ok(());
    }

    if find_in_path(command).is_none() {
        bail!(
            "Command not found: {command}\n\n\
             It is not in any directory listed in PATH."
        );
    }
    Ok(())
}

fn find_in_path(command: &str) -> Option<PathBuf> {
    let path = std::env::var_os("PATH")?;
    std::env::split_paths(&path).map(|dir| dir.join(command)).find(|p| is_executable(p))
}

fn is_executable(path: &Path) -> bool {
    path.metadata().is_ok_and(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
}
