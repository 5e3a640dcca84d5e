//! Session report: stream or accumulate
//!
//! Stream mode prints the preamble and header before monitoring starts and
//! one row per sample as it is drained. Accumulate mode prints nothing while
//! monitoring and emits preamble, header and one row per (entity,
//! experiment) in [`SessionReport::finish`].
//!
//! The preamble (`[Event-to-counter mappings]` … `[Event counts]`) is left
//! out in legacy mode, and when the counters are raw or kernel-driven and no
//! virtual counter was selected by name.

use std::io::Write;

use log::warn;
use pmctrack_common::PmcSample;

use super::{ReportFormatter, ReportLayout};
use crate::domain::MonitorError;
use crate::monitor::accumulator::AccumulationEngine;
use crate::monitor::control_loop::SampleSink;
use crate::monitor::MonitorMode;
use crate::pmc::config::CounterMapping;
use crate::pmc::SampleMerge;

/// What the `[Event-to-counter mappings]` block may show
#[derive(Debug, Clone, Default)]
pub struct Preamble {
    /// `-L`
    pub legacy: bool,
    /// Counters given in raw format or driven by the kernel
    pub raw_counters: bool,
    /// Mnemonic counter assignments (empty for raw counters)
    pub mappings: Vec<CounterMapping>,
    /// Virtual counters selected by name
    pub virtual_names: Vec<(u32, String)>,
}

impl Preamble {
    #[must_use]
    pub fn is_visible(&self) -> bool {
        !self.legacy && (!self.raw_counters || !self.virtual_names.is_empty())
    }
}

enum Discipline<M: SampleMerge> {
    Stream,
    Accumulate(AccumulationEngine<M>),
}

/// Report sink fed by the control loop
pub struct SessionReport<W: Write, F: ReportFormatter, M: SampleMerge> {
    out: W,
    formatter: F,
    layout: ReportLayout,
    preamble: Preamble,
    mode: MonitorMode,
    discipline: Discipline<M>,
}

impl<W: Write, F: ReportFormatter, M: SampleMerge> SessionReport<W, F, M> {
    /// Per-sample output
    pub fn stream(out: W, formatter: F, layout: ReportLayout, preamble: Preamble, mode: MonitorMode) -> Self {
        Self { out, formatter, layout, preamble, mode, discipline: Discipline::Stream }
    }

    /// Aggregated output at the end
    pub fn accumulate(
        out: W,
        formatter: F,
        layout: ReportLayout,
        preamble: Preamble,
        mode: MonitorMode,
        engine: AccumulationEngine<M>,
    ) -> Self {
        Self { out, formatter, layout, preamble, mode, discipline: Discipline::Accumulate(engine) }
    }

    /// Call once before monitoring starts
    ///
    /// # Errors
    /// [`MonitorError::Report`] on write failures.
    pub fn begin(&mut self) -> Result<(), MonitorError> {
        if matches!(self.discipline, Discipline::Stream) {
            self.print_table_head()?;
            self.out.flush().map_err(MonitorError::Report)?;
        }
        Ok(())
    }

    /// Call once after monitoring ended, successfully or not
    ///
    /// # Errors
    /// [`MonitorError::Report`] on write failures.
    pub fn finish(&mut self) -> Result<(), MonitorError> {
        if let Some(dropped) = self.engine().map(AccumulationEngine::dropped) {
            if dropped > 0 {
                warn!("{dropped} samples could not be accumulated");
            }
            self.print_table_head()?;
        }
        if let Discipline::Accumulate(engine) = &self.discipline {
            for (entity, _, agg) in engine.rows() {
                self.formatter
                    .print_sample(&mut self.out, &self.layout, agg.count, entity, &agg.sample)
                    .map_err(MonitorError::Report)?;
            }
        }
        self.out.flush().map_err(MonitorError::Report)
    }

    fn print_table_head(&mut self) -> Result<(), MonitorError> {
        if self.preamble.is_visible() {
            let mappings: &[CounterMapping] =
                if self.preamble.raw_counters { &[] } else { &self.preamble.mappings };
            writeln!(self.out, "[Event-to-counter mappings]").map_err(MonitorError::Report)?;
            self.formatter
                .print_counter_mappings(
                    &mut self.out,
                    mappings,
                    &self.preamble.virtual_names,
                    self.layout.nr_experiments,
                )
                .map_err(MonitorError::Report)?;
            writeln!(self.out, "[Event counts]").map_err(MonitorError::Report)?;
        }
        self.formatter.print_header(&mut self.out, &self.layout).map_err(MonitorError::Report)
    }

    /// Accumulation state, in accumulate mode
    #[must_use]
    pub fn engine(&self) -> Option<&AccumulationEngine<M>> {
        match &self.discipline {
            Discipline::Accumulate(engine) => Some(engine),
            Discipline::Stream => None,
        }
    }

    /// Output writer, e.g. for the `[Process times]` block
    pub fn writer(&mut self) -> &mut W {
        &mut self.out
    }

    pub fn into_writer(self) -> W {
        self.out
    }
}

impl<W: Write, F: ReportFormatter, M: SampleMerge> SampleSink for SessionReport<W, F, M> {
    fn consume(&mut self, seq: u64, sample: &PmcSample) -> Result<(), MonitorError> {
        let Some(entity) = self.mode.entity_of(sample) else {
            warn!("Dropping sample {seq} with invalid CPU number {}", sample.pid);
            return Ok(());
        };
        match &mut self.discipline {
            Discipline::Stream => self
                .formatter
                .print_sample(&mut self.out, &self.layout, seq, entity, sample)
                .map_err(MonitorError::Report),
            Discipline::Accumulate(engine) => {
                if let Err(err) = engine.add(entity, sample) {
                    warn!("{err}");
                }
                Ok(())
            }
        }
    }
}
