//! Readiness handshake between the target and the controller
//!
//! A close-on-exec pipe carries exactly one fixed-size record from the
//! forked target to the controller:
//!
//! ```text
//! byte 0     tag: 1 = ready, 2 = setup failed
//! byte 1     failed step (ConfigStep code), 0 when ready
//! bytes 2-5  errno (native endian), 0 when ready
//! ```
//!
//! Writing the record is a single `write(2)` of less than `PIPE_BUF` bytes,
//! which is atomic and async-signal-safe. End-of-file without a record means
//! the target died before finishing its setup.

#![allow(unsafe_code)] // pipe2/poll/read/write on raw descriptors

use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::time::{Duration, Instant};

use crate::domain::HandshakeError;
use crate::pmc::ConfigStep;

const TAG_READY: u8 = 1;
const TAG_FAILED: u8 = 2;
const RECORD_LEN: usize = 6;

/// Child-side end of the readiness channel
#[derive(Debug)]
pub struct ReadyNotifier {
    fd: OwnedFd,
}

/// Controller-side end of the readiness channel
#[derive(Debug)]
pub struct ReadyReceiver {
    fd: OwnedFd,
}

/// Create the readiness channel (both ends close-on-exec)
///
/// # Errors
/// [`HandshakeError::Channel`] if `pipe2` fails.
pub fn readiness_channel() -> Result<(ReadyReceiver, ReadyNotifier), HandshakeError> {
    let mut fds = [0; 2];
    // SAFETY: fds is a valid array of two ints
    if unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_CLOEXEC) } < 0 {
        return Err(HandshakeError::Channel(io::Error::last_os_error()));
    }
    // SAFETY: pipe2 returned two fresh descriptors we now own
    let (read, write) = unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) };
    Ok((ReadyReceiver { fd: read }, ReadyNotifier { fd: write }))
}

fn encode(tag: u8, step: u8, errno: i32) -> [u8; RECORD_LEN] {
    let mut record = [0; RECORD_LEN];
    record[0] = tag;
    record[1] = step;
    record[2..].copy_from_slice(&errno.to_ne_bytes());
    record
}

impl ReadyNotifier {
    /// Async-signal-safe: usable between fork and exec
    pub fn notify_ready(&self) {
        self.send(&encode(TAG_READY, 0, 0));
    }

    /// Async-signal-safe: usable between fork and exec
    pub fn notify_failure(&self, step: ConfigStep, errno: i32) {
        self.send(&encode(TAG_FAILED, step.code(), errno));
    }

    fn send(&self, record: &[u8; RECORD_LEN]) {
        // Nothing useful can be done on failure: the controller sees EOF
        // SAFETY: record is valid for RECORD_LEN bytes
        unsafe { libc::write(self.fd.as_raw_fd(), record.as_ptr().cast(), RECORD_LEN) };
    }
}

impl ReadyReceiver {
    /// Block until the target reports, closes the channel, or `timeout` expires
    ///
    /// The notifier must have been dropped in the controller beforehand,
    /// otherwise end-of-file is never observed.
    ///
    /// # Errors
    /// - [`HandshakeError::ChildSetupFailed`] with the step the target reported
    /// - [`HandshakeError::PrematureExit`] on end-of-file without a record
    /// - [`HandshakeError::Timeout`] when nothing arrived in time
    pub fn wait(self, timeout: Duration) -> Result<(), HandshakeError> {
        let deadline = Instant::now() + timeout;
        let mut record = [0u8; RECORD_LEN];
        let mut filled = 0;

        while filled < RECORD_LEN {
            self.poll_readable(deadline, timeout)?;

            // SAFETY: the slice after `filled` is valid for writing
            let n = unsafe {
                libc::read(self.fd.as_raw_fd(), record[filled..].as_mut_ptr().cast(), RECORD_LEN - filled)
            };
            match n {
                0 => return Err(HandshakeError::PrematureExit),
                n if n > 0 => filled += n.unsigned_abs(),
                _ => {
                    let err = io::Error::last_os_error();
                    if err.kind() != io::ErrorKind::Interrupted {
                        return Err(HandshakeError::Channel(err));
                    }
                }
            }
        }

        decode(&record)
    }

    fn poll_readable(&self, deadline: Instant, timeout: Duration) -> Result<(), HandshakeError> {
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(HandshakeError::Timeout(timeout));
            }
            let mut pfd = libc::pollfd { fd: self.fd.as_raw_fd(), events: libc::POLLIN, revents: 0 };
            let millis = i32::try_from(remaining.as_millis().max(1)).unwrap_or(i32::MAX);

            // SAFETY: pfd is a valid pollfd for the duration of the call
            let rc = unsafe { libc::poll(&mut pfd, 1, millis) };
            if rc > 0 {
                return Ok(());
            }
            if rc < 0 {
                let err = io::Error::last_os_error();
                if err.kind() != io::ErrorKind::Interrupted {
                    return Err(HandshakeError::Channel(err));
                }
            }
        }
    }
}

fn decode(record: &[u8; RECORD_LEN]) -> Result<(), HandshakeError> {
    let mut errno = [0u8; 4];
    errno.copy_from_slice(&record[2..]);
    let errno = i32::from_ne_bytes(errno);

    match record[0] {
        TAG_READY => Ok(()),
        TAG_FAILED => {
            let step = ConfigStep::from_code(record[1]).ok_or_else(|| {
                HandshakeError::Channel(io::Error::new(io::ErrorKind::InvalidData, "unknown setup step"))
            })?;
            Err(HandshakeError::ChildSetupFailed { step, source: io::Error::from_raw_os_error(errno) })
        }
        _ => Err(HandshakeError::Channel(io::Error::new(io::ErrorKind::InvalidData, "malformed readiness record"))),
    }
}
