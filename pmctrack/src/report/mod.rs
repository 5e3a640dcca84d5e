//! Report output
//!
//! - [`ReportFormatter`] - how headers, rows and counter mappings look
//!   ([`table::TableFormatter`] is the column layout of the classic tool)
//! - [`session::SessionReport`] - when things are printed: streamed per
//!   sample or aggregated at the end

pub mod session;
pub mod table;

use std::io::{self, Write};

use pmctrack_common::PmcSample;

use crate::domain::EntityId;
use crate::pmc::config::CounterMapping;

/// Shape of the sample table, fixed for a session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReportLayout {
    pub nr_experiments: usize,
    /// Hardware counter columns (bit N = pmcN)
    pub pmc_mask: u32,
    /// Virtual counter columns (bit N = virtN)
    pub virt_mask: u32,
    /// `-e`: extra metadata columns
    pub extended: bool,
    /// Entity column shows CPUs instead of threads
    pub system_wide: bool,
}

/// Report-formatting service
pub trait ReportFormatter {
    /// Event-to-counter lines (`pmcN=event`, `virtN=name`)
    ///
    /// # Errors
    /// Write failures.
    fn print_counter_mappings(
        &self,
        out: &mut dyn Write,
        mappings: &[CounterMapping],
        virtual_names: &[(u32, String)],
        nr_experiments: usize,
    ) -> io::Result<()>;

    /// Column header line
    ///
    /// # Errors
    /// Write failures.
    fn print_header(&self, out: &mut dyn Write, layout: &ReportLayout) -> io::Result<()>;

    /// One row; `nsample` is the sequence number (stream) or the number of
    /// samples aggregated (accumulate)
    ///
    /// # Errors
    /// Write failures.
    fn print_sample(
        &self,
        out: &mut dyn Write,
        layout: &ReportLayout,
        nsample: u64,
        entity: EntityId,
        sample: &PmcSample,
    ) -> io::Result<()>;
}
