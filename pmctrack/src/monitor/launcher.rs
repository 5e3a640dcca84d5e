//! # Target launcher
//!
//! Forks the monitored program and runs its setup between `fork` and `exec`.
//!
//! The controller may be multi-threaded (the signal relay runs on its own
//! thread), so the child is restricted to async-signal-safe operations:
//! everything it needs is built beforehand ([`ConfigPlan`], [`CpuSet`],
//! NUL-terminated argv, the exec error message) and it only issues raw
//! system calls.
//!
//! ## Child sequence
//!
//! 1. bind to the requested CPUs (`-b`)
//! 2. replay the configuration plan (per-thread mode only; empty otherwise)
//! 3. report readiness on the handshake pipe
//! 4. `execvp` the command; on failure print a message and `_exit(127)`
//!
//! A failed step 1 or 2 is reported on the pipe and the child exits with 1.

#![allow(unsafe_code)] // fork/execvp/wait4/kill

use std::ffi::CString;
use std::io;
use std::time::{Duration, Instant};

use log::{debug, info};

use super::handshake::{readiness_channel, ReadyNotifier};
use crate::affinity::CpuSet;
use crate::domain::{CpuMask, HandshakeError, MonitorError, Pid};
use crate::pmc::{ConfigPlan, ConfigStep};

/// Exit code of the child when the command cannot be executed
pub const EXIT_EXEC_FAILED: i32 = 127;

/// Final status and resource usage of the target
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChildExit {
    /// Raw `wait4` status
    pub status: i32,
    pub user_time: Duration,
    pub system_time: Duration,
    /// When the exit was observed
    pub ended: Instant,
}

impl ChildExit {
    /// Exit code to propagate: the target's own code, 128+N when killed by
    /// signal N
    #[must_use]
    pub fn exit_code(&self) -> i32 {
        if libc::WIFEXITED(self.status) {
            libc::WEXITSTATUS(self.status)
        } else if libc::WIFSIGNALED(self.status) {
            128 + libc::WTERMSIG(self.status)
        } else {
            1
        }
    }

    fn from_wait(status: i32, usage: &libc::rusage) -> Self {
        Self {
            status,
            user_time: timeval_to_duration(usage.ru_utime),
            system_time: timeval_to_duration(usage.ru_stime),
            ended: Instant::now(),
        }
    }
}

fn timeval_to_duration(tv: libc::timeval) -> Duration {
    let secs = u64::try_from(tv.tv_sec).unwrap_or(0);
    let micros = u32::try_from(tv.tv_usec).unwrap_or(0);
    Duration::new(secs, 0) + Duration::from_micros(u64::from(micros))
}

/// The monitored process, as seen by the control loop
pub trait Target {
    fn pid(&self) -> Pid;

    /// Ask the target to stop (SIGTERM)
    ///
    /// # Errors
    /// The signal could not be delivered for a reason other than the target
    /// being gone already.
    fn terminate(&mut self) -> Result<(), MonitorError>;

    /// Collect the exit status if the target has exited
    ///
    /// # Errors
    /// `wait4` failed.
    fn try_reap(&mut self) -> Result<Option<ChildExit>, MonitorError>;

    /// Wait for the target to exit
    ///
    /// # Errors
    /// `wait4` failed.
    fn reap(&mut self) -> Result<ChildExit, MonitorError>;
}

/// What to run and how to set it up
#[derive(Debug, Clone, Copy)]
pub struct LaunchOptions<'a> {
    pub command: &'a [String],
    /// CPUs the target is bound to (`-b`)
    pub affinity: Option<CpuMask>,
    /// Control writes the target replays before `exec`
    pub plan: &'a ConfigPlan,
    pub handshake_timeout: Duration,
}

/// Forked target process
#[derive(Debug)]
pub struct ChildProcess {
    pid: Pid,
    started: Instant,
    exit: Option<ChildExit>,
}

/// Everything the child touches, prepared before `fork`
struct ChildSetup<'a> {
    argv: Vec<CString>,
    argv_ptrs: Vec<*const libc::c_char>,
    affinity: Option<CpuSet>,
    plan: &'a ConfigPlan,
    exec_error: Vec<u8>,
}

impl<'a> ChildSetup<'a> {
    fn prepare(options: &LaunchOptions<'a>) -> Result<Self, HandshakeError> {
        if options.command.is_empty() {
            return Err(HandshakeError::InvalidArgument(String::new()));
        }
        let argv = options
            .command
            .iter()
            .map(|arg| CString::new(arg.as_bytes()).map_err(|_| HandshakeError::InvalidArgument(arg.clone())))
            .collect::<Result<Vec<_>, _>>()?;
        let mut argv_ptrs: Vec<*const libc::c_char> = argv.iter().map(|a| a.as_ptr()).collect();
        argv_ptrs.push(std::ptr::null());

        Ok(Self {
            argv,
            argv_ptrs,
            affinity: options.affinity.map(CpuSet::from_mask),
            plan: options.plan,
            exec_error: format!("pmctrack: Error when trying to execute program {}\n", options.command[0])
                .into_bytes(),
        })
    }

    /// Runs in the forked child; never returns
    fn run(&self, notifier: &ReadyNotifier) -> ! {
        if let Some(cpus) = &self.affinity {
            if let Err(err) = cpus.apply_to_current() {
                notifier.notify_failure(ConfigStep::Affinity, err.raw_os_error().unwrap_or(libc::EINVAL));
                // SAFETY: terminating the child without running atexit handlers
                unsafe { libc::_exit(1) };
            }
        }

        if let Err(failure) = self.plan.replay() {
            notifier.notify_failure(failure.step, failure.errno);
            // SAFETY: as above
            unsafe { libc::_exit(1) };
        }

        notifier.notify_ready();

        // SAFETY: argv_ptrs is a NULL-terminated array of pointers into argv
        unsafe {
            libc::execvp(self.argv[0].as_ptr(), self.argv_ptrs.as_ptr());
            libc::write(libc::STDERR_FILENO, self.exec_error.as_ptr().cast(), self.exec_error.len());
            libc::_exit(EXIT_EXEC_FAILED)
        }
    }
}

/// Fork the target, let it configure itself, and wait for its readiness
///
/// # Errors
/// Fork failure, a setup step reported by the child, the child exiting
/// before readiness, or the handshake timing out (the child is killed).
pub fn launch(options: &LaunchOptions<'_>) -> Result<ChildProcess, HandshakeError> {
    let setup = ChildSetup::prepare(options)?;
    let (receiver, notifier) = readiness_channel()?;
    let started = Instant::now();

    // SAFETY: the child only runs `setup.run`, which is async-signal-safe
    let pid = unsafe { libc::fork() };
    if pid < 0 {
        return Err(HandshakeError::Fork(io::Error::last_os_error()));
    }
    if pid == 0 {
        setup.run(&notifier);
    }

    let pid = Pid(pid);
    debug!("Forked target {pid} ({})", options.command.join(" "));
    drop(notifier);

    if let Err(err) = receiver.wait(options.handshake_timeout) {
        if !matches!(err, HandshakeError::ChildSetupFailed { .. } | HandshakeError::PrematureExit) {
            // SAFETY: pid is our own child, not yet reaped
            unsafe { libc::kill(pid.as_raw(), libc::SIGKILL) };
        }
        let mut status = 0;
        // SAFETY: pid is our own child
        unsafe { libc::waitpid(pid.as_raw(), &mut status, 0) };
        return Err(err);
    }

    info!("Target {pid} configured and running");
    Ok(ChildProcess { pid, started, exit: None })
}

impl ChildProcess {
    /// When the target was forked
    #[must_use]
    pub fn started(&self) -> Instant {
        self.started
    }

    /// Exit status, if already collected
    #[must_use]
    pub fn exit(&self) -> Option<ChildExit> {
        self.exit
    }

    fn wait(&mut self, flags: i32) -> Result<Option<ChildExit>, MonitorError> {
        if let Some(exit) = self.exit {
            return Ok(Some(exit));
        }
        let mut status = 0;
        // SAFETY: rusage is plain old data
        let mut usage: libc::rusage = unsafe { std::mem::zeroed() };
        loop {
            // SAFETY: status and usage are valid for writing
            let rc = unsafe { libc::wait4(self.pid.as_raw(), &mut status, flags, &mut usage) };
            if rc == 0 {
                return Ok(None);
            }
            if rc > 0 {
                let exit = ChildExit::from_wait(status, &usage);
                self.exit = Some(exit);
                return Ok(Some(exit));
            }
            let err = io::Error::last_os_error();
            if err.kind() != io::ErrorKind::Interrupted {
                return Err(MonitorError::Reap { pid: self.pid, source: err });
            }
        }
    }
}

impl Target for ChildProcess {
    fn pid(&self) -> Pid {
        self.pid
    }

    fn terminate(&mut self) -> Result<(), MonitorError> {
        if self.exit.is_some() {
            return Ok(());
        }
        // SAFETY: plain kill(2) on our child
        if unsafe { libc::kill(self.pid.as_raw(), libc::SIGTERM) } < 0 {
            let err = io::Error::last_os_error();
            if err.raw_os_error() != Some(libc::ESRCH) {
                return Err(MonitorError::Signal { pid: self.pid, source: err });
            }
        }
        Ok(())
    }

    fn try_reap(&mut self) -> Result<Option<ChildExit>, MonitorError> {
        self.wait(libc::WNOHANG)
    }

    fn reap(&mut self) -> Result<ChildExit, MonitorError> {
        self.wait(0)?.ok_or_else(|| MonitorError::Reap {
            pid: self.pid,
            source: io::Error::from(io::ErrorKind::WouldBlock),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn status_exited(code: i32) -> i32 {
        (code & 0xff) << 8
    }

    #[test]
    fn test_exit_code_mapping() {
        let exit = |status| ChildExit {
            status,
            user_time: Duration::ZERO,
            system_time: Duration::ZERO,
            ended: Instant::now(),
        };
        assert_eq!(exit(status_exited(0)).exit_code(), 0);
        assert_eq!(exit(status_exited(3)).exit_code(), 3);
        assert_eq!(exit(libc::SIGTERM).exit_code(), 128 + libc::SIGTERM);
    }

    #[test]
    fn test_timeval_conversion() {
        let d = timeval_to_duration(libc::timeval { tv_sec: 2, tv_usec: 250_000 });
        assert_eq!(d, Duration::from_millis(2250));
    }

    #[test]
    fn test_prepare_rejects_nul_and_empty() {
        let plan = ConfigPlan::new();
        let bad = vec!["echo".to_string(), "a\0b".to_string()];
        let opts = LaunchOptions { command: &bad, affinity: None, plan: &plan, handshake_timeout: Duration::from_secs(1) };
        assert!(matches!(ChildSetup::prepare(&opts), Err(HandshakeError::InvalidArgument(_))));

        let opts = LaunchOptions { command: &[], ..opts };
        assert!(ChildSetup::prepare(&opts).is_err());
    }
}
