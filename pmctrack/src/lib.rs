//! # pmctrack - Performance Monitoring Counter Tracker
//!
//! pmctrack launches a command and periodically reports the hardware (PMC)
//! and virtual counter values that the PMCTrack kernel module collects for
//! its threads, or for every CPU in system-wide mode.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                  Monitored command (child)                   │
//! │   affinity ─▶ counter configuration ─▶ READY ─▶ execvp       │
//! └───────────────────────┬──────────────────────────────────────┘
//!                         │ handshake pipe
//!                         ▼
//! ┌──────────────────────────────────────────────────────────────┐
//! │                  pmctrack (controller)                       │
//! │                                                              │
//! │  ┌────────────┐   ┌──────────────┐   ┌──────────────────┐    │
//! │  │  Monitor   │──▶│ Control loop │──▶│ Report (stream/  │    │
//! │  │  source    │   │ (phases,     │   │ accumulate)      │    │
//! │  │ (mmap/read)│   │  limits)     │   └──────────────────┘    │
//! │  └────────────┘   └──────▲───────┘                           │
//! │                          │ SIGCHLD / SIGINT / SIGTERM        │
//! │                   ┌──────┴───────┐                           │
//! │                   │ Signal relay │                           │
//! │                   └──────────────┘                           │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Module Structure
//!
//! - [`cli`]: command-line surface
//! - [`pmc`]: counter configuration parsing, event tables and the
//!   `/proc/pmc` measurement backend
//! - [`monitor`]: session orchestration, launcher, handshake, sample
//!   source, control loop, accumulation and epilogue
//! - [`report`]: table formatting of samples and aggregates
//! - [`affinity`]: CPU selectors and `sched_setaffinity`
//! - [`preflight`]: environment checks with actionable messages
//! - [`domain`]: newtypes and error enums
//!
//! ## Typical Usage
//!
//! ```bash
//! # Count retired instructions and cycles of ./app every 500ms
//! pmctrack -T 0.5 -c instr,cycles ./app
//!
//! # Per-thread totals at the end, stop after 10 seconds
//! pmctrack -A -N 10 -c instr,llc_misses ./app
//! ```

pub mod affinity;
pub mod cli;
pub mod domain;
pub mod monitor;
pub mod pmc;
pub mod preflight;
pub mod report;
