//! # Sampling Control Loop
//!
//! Timer- and signal-paced drain of the [`SampleSource`].
//!
//! ## Phases
//!
//! ```text
//! CONFIGURING ──▶ RUNNING ──▶ DRAINING ──▶ DONE
//!                    │            │
//!                    └────────────┴──▶ ERROR
//! ```
//!
//! `CONFIGURING` (handshake, source acquisition) happens before the loop is
//! built; [`ControlLoop::run`] covers the rest.
//!
//! ## Cycle
//!
//! While the target is alive, each iteration waits on the event channel with
//! the sampling period as deadline; the deadline expiring is the timer tick.
//! Every wake-up that is not an abort drains one batch and hands each sample
//! to the [`SampleSink`] in order, with a sequence number starting at 1 and
//! shared across batches. Once the target has exited, batches are drained
//! back to back until one comes back empty.
//!
//! ## Termination policy
//!
//! Checked after every processed sample while the target is alive: when the
//! sequence counter passes the sample limit, or the wall-clock timeout has
//! elapsed, the target receives SIGTERM once. The loop carries on draining
//! until the exit is observed.
//!
//! ## Premature exit
//!
//! A command dying during its counter setup is caught by the handshake: the
//! pipe reaches EOF without a readiness record and the launch fails before
//! any loop exists. [`Session`](super::Session) therefore always builds the
//! loop with `profiling_started` set. The check in the child-exit handler
//! only matters to callers that start the loop ahead of the handshake.

use std::fmt;
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, RecvTimeoutError};
use log::{debug, error, info, warn};
use pmctrack_common::PmcSample;

use super::launcher::{ChildExit, Target};
use super::signals::{LoopEvent, TerminationState};
use super::source::SampleSource;
use crate::domain::MonitorError;

/// Consumer of drained samples (stream printer or accumulator)
pub trait SampleSink {
    /// Handle one sample; `seq` starts at 1 and grows across batches
    ///
    /// # Errors
    /// Fatal output failures only; recoverable conditions are handled inside.
    fn consume(&mut self, seq: u64, sample: &PmcSample) -> Result<(), MonitorError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Configuring,
    Running,
    Draining,
    Done,
    Error,
}

/// Why the target was asked to stop
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminationReason {
    MaxSamples(u64),
    Timeout(Duration),
}

impl fmt::Display for TerminationReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MaxSamples(n) => write!(f, "maximum of {n} samples reached"),
            Self::Timeout(d) => write!(f, "timeout of {}s reached", d.as_secs_f64()),
        }
    }
}

/// Sample-count and wall-clock limits (`-n`, `-N`)
#[derive(Debug, Clone, Copy)]
pub struct TerminationPolicy {
    max_samples: Option<u64>,
    timeout: Option<Duration>,
    started: Instant,
}

impl TerminationPolicy {
    #[must_use]
    pub fn new(max_samples: Option<u64>, timeout: Option<Duration>, started: Instant) -> Self {
        Self { max_samples, timeout, started }
    }

    /// `next_seq` is the sequence number the next sample would get
    #[must_use]
    pub fn check(&self, next_seq: u64, now: Instant) -> Option<TerminationReason> {
        if let Some(max) = self.max_samples {
            if next_seq > max {
                return Some(TerminationReason::MaxSamples(max));
            }
        }
        match self.timeout {
            Some(limit) if now.saturating_duration_since(self.started) >= limit => {
                Some(TerminationReason::Timeout(limit))
            }
            _ => None,
        }
    }
}

/// Result of a run
#[derive(Debug)]
pub struct LoopOutcome {
    /// `Done` or `Error`
    pub phase: Phase,
    pub samples: u64,
    pub state: TerminationState,
    /// Limit that made the loop send SIGTERM, if any
    pub limit: Option<TerminationReason>,
    /// Exit status, if observed during the loop
    pub exit: Option<ChildExit>,
    pub error: Option<MonitorError>,
}

/// One monitoring run over a source, a target and a sink
pub struct ControlLoop<'a, S, T, K> {
    source: &'a mut S,
    target: &'a mut T,
    sink: &'a mut K,
    events: &'a Receiver<LoopEvent>,
    period: Duration,
    policy: TerminationPolicy,
    state: TerminationState,
    phase: Phase,
    next_seq: u64,
    limit: Option<TerminationReason>,
    exit: Option<ChildExit>,
}

impl<'a, S: SampleSource, T: Target, K: SampleSink> ControlLoop<'a, S, T, K> {
    #[must_use]
    pub fn new(
        source: &'a mut S,
        target: &'a mut T,
        sink: &'a mut K,
        events: &'a Receiver<LoopEvent>,
        period: Duration,
        policy: TerminationPolicy,
        state: TerminationState,
    ) -> Self {
        Self {
            source,
            target,
            sink,
            events,
            period,
            policy,
            state,
            phase: Phase::Configuring,
            next_seq: 1,
            limit: None,
            exit: None,
        }
    }

    pub fn run(mut self) -> LoopOutcome {
        self.phase = Phase::Running;
        let error = self.cycle().err();
        if let Some(err) = &error {
            error!("Monitoring stopped: {err}");
            self.phase = Phase::Error;
        } else {
            self.phase = Phase::Done;
        }

        LoopOutcome {
            phase: self.phase,
            samples: self.next_seq - 1,
            state: self.state,
            limit: self.limit,
            exit: self.exit,
            error,
        }
    }

    fn cycle(&mut self) -> Result<(), MonitorError> {
        let mut batch = Vec::new();

        while !self.state.abort_requested {
            if !self.state.target_exited {
                self.wait_for_tick()?;
            }
            if self.state.abort_requested {
                break;
            }

            let n = self.source.read_batch(&mut batch)?;
            if n == 0 && self.state.target_exited {
                self.phase = Phase::Draining;
                debug!("Target exited and sample buffer drained");
                break;
            }
            if n > 0 {
                debug!("Drained {n} samples");
            }

            for sample in &batch {
                self.sink.consume(self.next_seq, sample)?;
                self.next_seq += 1;
                self.enforce_limits()?;
            }
        }
        Ok(())
    }

    /// Block until the next tick or signal event, then handle queued events
    fn wait_for_tick(&mut self) -> Result<(), MonitorError> {
        match self.events.recv_timeout(self.period) {
            Ok(event) => self.handle_event(event)?,
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => {
                // No relay any more: poll the target on every tick instead
                std::thread::sleep(self.period);
                self.handle_event(LoopEvent::ChildExited)?;
            }
        }
        while let Ok(event) = self.events.try_recv() {
            self.handle_event(event)?;
        }
        Ok(())
    }

    fn handle_event(&mut self, event: LoopEvent) -> Result<(), MonitorError> {
        match event {
            LoopEvent::ChildExited => {
                if !self.state.profiling_started {
                    return Err(MonitorError::PrematureExit);
                }
                if self.state.target_exited {
                    return Ok(());
                }
                if let Some(exit) = self.target.try_reap()? {
                    info!("Target {} exited", self.target.pid());
                    self.state.target_exited = true;
                    self.exit = Some(exit);
                }
            }
            LoopEvent::Interrupt(signo) => {
                info!("Received signal {signo}, stopping target {}", self.target.pid());
                self.target.terminate()?;
                self.state.abort_requested = true;
            }
        }
        Ok(())
    }

    fn enforce_limits(&mut self) -> Result<(), MonitorError> {
        if self.state.target_exited || self.limit.is_some() {
            return Ok(());
        }
        if let Some(reason) = self.policy.check(self.next_seq, Instant::now()) {
            warn!("{reason}. Killing child process {}", self.target.pid());
            self.target.terminate()?;
            self.limit = Some(reason);
        }
        Ok(())
    }
}
