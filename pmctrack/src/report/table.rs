//! Fixed-width sample table
//!
//! ```text
//! nsample    pid      event          pmc0          pmc1          pmc3
//!       1  10767       tick    2017968202    1004955691       4505179
//! ```
//!
//! `-e` adds a `coretype` column, more than one experiment adds `expid`.
//! Counters a row does not carry print as `-`.

use std::io::{self, Write};

use pmctrack_common::PmcSample;

use super::{ReportFormatter, ReportLayout};
use crate::domain::EntityId;
use crate::pmc::config::CounterMapping;

const COUNTER_WIDTH: usize = 14;

fn set_bits(mask: u32) -> impl Iterator<Item = u32> {
    (0..u32::BITS).filter(move |bit| mask & (1 << bit) != 0)
}

/// Column layout of the classic `pmctrack` output
#[derive(Debug, Clone, Copy, Default)]
pub struct TableFormatter;

impl ReportFormatter for TableFormatter {
    fn print_counter_mappings(
        &self,
        out: &mut dyn Write,
        mappings: &[CounterMapping],
        virtual_names: &[(u32, String)],
        nr_experiments: usize,
    ) -> io::Result<()> {
        for mapping in mappings {
            if nr_experiments > 1 {
                write!(out, "exp{}: ", mapping.experiment)?;
            }
            writeln!(out, "pmc{}={}", mapping.counter, mapping.event)?;
        }
        for (idx, name) in virtual_names {
            writeln!(out, "virt{idx}={name}")?;
        }
        Ok(())
    }

    fn print_header(&self, out: &mut dyn Write, layout: &ReportLayout) -> io::Result<()> {
        let entity = if layout.system_wide { "cpu" } else { "pid" };
        write!(out, "{:>7}{entity:>7}{:>11}", "nsample", "event")?;
        if layout.extended {
            write!(out, "{:>9}", "coretype")?;
        }
        if layout.nr_experiments > 1 {
            write!(out, "{:>6}", "expid")?;
        }
        for counter in set_bits(layout.pmc_mask) {
            write!(out, "{:>COUNTER_WIDTH$}", format!("pmc{counter}"))?;
        }
        for counter in set_bits(layout.virt_mask) {
            write!(out, "{:>COUNTER_WIDTH$}", format!("virt{counter}"))?;
        }
        writeln!(out)
    }

    fn print_sample(
        &self,
        out: &mut dyn Write,
        layout: &ReportLayout,
        nsample: u64,
        entity: EntityId,
        sample: &PmcSample,
    ) -> io::Result<()> {
        write!(out, "{nsample:>7}{:>7}{:>11}", entity.raw(), sample.kind().label())?;
        if layout.extended {
            write!(out, "{:>9}", sample.coretype)?;
        }
        if layout.nr_experiments > 1 {
            write!(out, "{:>6}", sample.exp_idx)?;
        }

        let columns = set_bits(layout.pmc_mask)
            .map(|c| sample.counter_value(c))
            .chain(set_bits(layout.virt_mask).map(|c| sample.virtual_value(c)));
        for value in columns {
            match value {
                Some(v) => write!(out, "{v:>COUNTER_WIDTH$}")?,
                None => write!(out, "{:>COUNTER_WIDTH$}", "-")?,
            }
        }
        writeln!(out)
    }
}
