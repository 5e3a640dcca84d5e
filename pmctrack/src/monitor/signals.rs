//! Signal relay
//!
//! SIGCHLD, SIGINT and SIGTERM are received by a dedicated thread running a
//! current-thread tokio runtime and forwarded to the control loop as
//! [`LoopEvent`]s over a crossbeam channel. The loop itself never runs in a
//! signal handler; it reacts to events between blocking waits and keeps the
//! resulting flags in [`TerminationState`].

use std::io;
use std::thread;

use crossbeam_channel::{unbounded, Receiver};
use log::debug;
use tokio::signal::unix::{signal, SignalKind};

/// Event delivered to the control loop
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopEvent {
    /// SIGCHLD: the target may have exited
    ChildExited,
    /// SIGINT / SIGTERM received by the monitor
    Interrupt(i32),
}

/// Flags set while handling [`LoopEvent`]s, read by the control loop
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TerminationState {
    pub target_exited: bool,
    pub abort_requested: bool,
    pub profiling_started: bool,
}

/// Handle on the relay thread
///
/// The handlers are registered by the time [`SignalRelay::install`] returns,
/// so it must be called before the target is forked. The thread exits after
/// the receiver is dropped and one more signal arrives, or with the process.
#[derive(Debug)]
pub struct SignalRelay {
    events: Receiver<LoopEvent>,
}

impl SignalRelay {
    /// Register the handlers and start the relay thread
    ///
    /// # Errors
    /// The runtime or one of the signal streams could not be created.
    pub fn install() -> io::Result<Self> {
        let runtime = tokio::runtime::Builder::new_current_thread().enable_all().build()?;

        let (mut sigchld, mut sigint, mut sigterm) = {
            let _guard = runtime.enter();
            (
                signal(SignalKind::child())?,
                signal(SignalKind::interrupt())?,
                signal(SignalKind::terminate())?,
            )
        };

        let (tx, events) = unbounded();

        thread::Builder::new().name("pmctrack-signals".to_string()).spawn(move || {
            runtime.block_on(async move {
                loop {
                    let event = tokio::select! {
                        Some(()) = sigchld.recv() => LoopEvent::ChildExited,
                        Some(()) = sigint.recv() => LoopEvent::Interrupt(libc::SIGINT),
                        Some(()) = sigterm.recv() => LoopEvent::Interrupt(libc::SIGTERM),
                        else => break,
                    };
                    debug!("Relaying {event:?}");
                    if tx.send(event).is_err() {
                        break;
                    }
                }
            });
        })?;

        Ok(Self { events })
    }

    #[must_use]
    pub fn events(&self) -> &Receiver<LoopEvent> {
        &self.events
    }
}
