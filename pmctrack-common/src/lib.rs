//! # Shared Data Structures (PMCTrack kernel module ↔ Userspace)
//!
//! Defines the sample record produced by the PMCTrack kernel module and read
//! by the monitor through `/proc/pmc/monitor`. The record uses `#[repr(C)]`
//! so the byte layout matches what the kernel writes into the sample buffer
//! (either a shared memory mapping of the monitor entry or a plain `read(2)`
//! buffer).
//!
//! ## Key Types
//!
//! - [`PmcSample`] - One raw sample: owning thread/CPU, experiment index,
//!   hardware counter values and virtual counter values
//! - [`SampleType`] - Why the kernel emitted the sample (tick, EBS, exit...)
//!
//! ## Merge Contract
//!
//! [`PmcSample::accumulate`] is the numeric accumulation contract used by
//! aggregate ("`-A`") mode. Counter values are summed, the elapsed time is
//! summed, and metadata (type, core type, masks) is taken from the first
//! sample folded into an aggregate.

#![no_std]

// ============================================================================
// Limits
// ============================================================================

/// Maximum number of hardware counters carried by a single sample
pub const MAX_PERFORMANCE_COUNTERS: usize = 8;

/// Maximum number of virtual counters carried by a single sample
pub const MAX_VIRTUAL_COUNTERS: usize = 20;

/// Maximum number of multiplexed counter configurations ("experiments")
///
/// The kernel module rotates through at most this many `-c` configurations.
pub const MAX_COUNTER_CONFIGS: usize = 5;

// ============================================================================
// Sample Types
// ============================================================================

/// **Tick**: sample taken when the sampling period expired
pub const PMC_SAMPLE_TICK: u32 = 0;

/// **EBS**: sample taken when an event-based-sampling counter overflowed
pub const PMC_SAMPLE_EBS: u32 = 1;

/// **Exit**: final counts flushed when the monitored thread exited
pub const PMC_SAMPLE_EXIT: u32 = 2;

/// **Migration**: counts flushed when the thread migrated to another core type
pub const PMC_SAMPLE_MIGRATION: u32 = 3;

/// Decoded form of [`PmcSample::sample_type`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SampleType {
    Tick,
    Ebs,
    Exit,
    Migration,
    Unknown(u32),
}

impl SampleType {
    #[must_use]
    pub const fn from_raw(raw: u32) -> Self {
        match raw {
            PMC_SAMPLE_TICK => Self::Tick,
            PMC_SAMPLE_EBS => Self::Ebs,
            PMC_SAMPLE_EXIT => Self::Exit,
            PMC_SAMPLE_MIGRATION => Self::Migration,
            other => Self::Unknown(other),
        }
    }

    /// Label used in the `event` column of the report
    #[must_use]
    pub const fn label(self) -> &'static str {
        match self {
            Self::Tick => "tick",
            Self::Ebs => "ebs",
            Self::Exit => "exit",
            Self::Migration => "migration",
            Self::Unknown(_) => "unknown",
        }
    }
}

// ============================================================================
// Sample Record
// ============================================================================

/// Raw sample emitted by the PMCTrack kernel module
///
/// **Memory Layout**: `#[repr(C)]` with explicit reserved fields so that no
/// implicit padding exists (264 bytes).
///
/// **Counter packing**: `pmc_counts[k]` holds the value of the k-th counter
/// whose bit is set in `pmc_mask` (lowest bit first). The same applies to
/// `virtual_counts` and `virt_mask`. Use [`PmcSample::counter_value`] and
/// [`PmcSample::virtual_value`] to look values up by counter number.
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PmcSample {
    // ========================================================================
    // Metadata
    // ========================================================================
    /// Why the sample was emitted (see `PMC_SAMPLE_*`)
    pub sample_type: u32,

    /// Core type the thread was running on (asymmetric multicores), 0 otherwise
    pub coretype: i32,

    /// Index of the counter configuration that produced this sample
    ///
    /// Ranges over `0..nr_experiments`. With a single `-c` string it is
    /// always 0.
    pub exp_idx: i32,

    /// Owning entity
    ///
    /// **Value**:
    /// - Per-thread mode: thread ID of the monitored thread
    /// - System-wide mode: CPU number the counts were collected on
    pub pid: i32,

    /// Number of valid entries in `pmc_counts`
    pub nr_counters: u8,

    /// Number of valid entries in `virtual_counts`
    pub nr_virtual_counters: u8,

    /// Reserved
    #[allow(clippy::pub_underscore_fields)]
    pub _reserved0: [u8; 2],

    /// Hardware counters present in this sample (bit N = pmcN)
    pub pmc_mask: u32,

    /// Virtual counters present in this sample (bit N = virtN)
    pub virt_mask: u32,

    /// Reserved (keeps `elapsed_time` 8-byte aligned)
    #[allow(clippy::pub_underscore_fields)]
    pub _reserved1: u32,

    // ========================================================================
    // Values
    // ========================================================================
    /// Time covered by this sample, in milliseconds
    pub elapsed_time: u64,

    /// Packed hardware counter values
    pub pmc_counts: [u64; MAX_PERFORMANCE_COUNTERS],

    /// Packed virtual counter values
    pub virtual_counts: [u64; MAX_VIRTUAL_COUNTERS],
}

impl Default for PmcSample {
    fn default() -> Self {
        Self {
            sample_type: PMC_SAMPLE_TICK,
            coretype: 0,
            exp_idx: 0,
            pid: 0,
            nr_counters: 0,
            nr_virtual_counters: 0,
            _reserved0: [0; 2],
            pmc_mask: 0,
            virt_mask: 0,
            _reserved1: 0,
            elapsed_time: 0,
            pmc_counts: [0; MAX_PERFORMANCE_COUNTERS],
            virtual_counts: [0; MAX_VIRTUAL_COUNTERS],
        }
    }
}

/// Position of `bit` among the set bits of `mask`, if the bit is set
const fn packed_index(mask: u32, bit: u32) -> Option<usize> {
    if bit >= u32::BITS || mask & (1 << bit) == 0 {
        return None;
    }
    Some((mask & ((1 << bit) - 1)).count_ones() as usize)
}

impl PmcSample {
    /// Size of one record in the kernel buffer
    pub const SIZE: usize = core::mem::size_of::<Self>();

    #[must_use]
    pub const fn kind(&self) -> SampleType {
        SampleType::from_raw(self.sample_type)
    }

    /// Value of hardware counter `pmcN`, if this sample carries it
    #[must_use]
    pub fn counter_value(&self, counter: u32) -> Option<u64> {
        packed_index(self.pmc_mask, counter)
            .filter(|&k| k < usize::from(self.nr_counters) && k < MAX_PERFORMANCE_COUNTERS)
            .map(|k| self.pmc_counts[k])
    }

    /// Value of virtual counter `virtN`, if this sample carries it
    #[must_use]
    pub fn virtual_value(&self, counter: u32) -> Option<u64> {
        packed_index(self.virt_mask, counter)
            .filter(|&k| k < usize::from(self.nr_virtual_counters) && k < MAX_VIRTUAL_COUNTERS)
            .map(|k| self.virtual_counts[k])
    }

    /// Fold `cur` into `self` (the running aggregate).
    ///
    /// With `copy_metadata` set, `self` is (re)initialised from `cur`, which
    /// both copies the metadata and seeds the sums with the first values.
    /// Otherwise packed counter values and the elapsed time are added
    /// (wrapping, as the hardware counters do).
    pub fn accumulate(&mut self, cur: &Self, copy_metadata: bool) {
        if copy_metadata {
            *self = *cur;
            return;
        }

        let nr_counters = usize::from(self.nr_counters.min(cur.nr_counters)).min(MAX_PERFORMANCE_COUNTERS);
        for k in 0..nr_counters {
            self.pmc_counts[k] = self.pmc_counts[k].wrapping_add(cur.pmc_counts[k]);
        }

        let nr_virtual =
            usize::from(self.nr_virtual_counters.min(cur.nr_virtual_counters)).min(MAX_VIRTUAL_COUNTERS);
        for k in 0..nr_virtual {
            self.virtual_counts[k] = self.virtual_counts[k].wrapping_add(cur.virtual_counts[k]);
        }

        self.elapsed_time = self.elapsed_time.wrapping_add(cur.elapsed_time);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(pid: i32, pmc_mask: u32, counts: &[u64]) -> PmcSample {
        let mut s = PmcSample { pid, pmc_mask, ..PmcSample::default() };
        s.nr_counters = u8::try_from(counts.len()).unwrap();
        s.pmc_counts[..counts.len()].copy_from_slice(counts);
        s
    }

    #[test]
    fn test_layout_has_no_implicit_padding() {
        assert_eq!(PmcSample::SIZE, 264);
        assert_eq!(core::mem::align_of::<PmcSample>(), 8);
    }

    #[test]
    fn test_counter_value_uses_packed_index() {
        // pmc0, pmc1 and pmc3 configured: pmc3 lives at packed slot 2
        let s = sample(10, 0b1011, &[100, 200, 300]);
        assert_eq!(s.counter_value(0), Some(100));
        assert_eq!(s.counter_value(1), Some(200));
        assert_eq!(s.counter_value(2), None);
        assert_eq!(s.counter_value(3), Some(300));
        assert_eq!(s.counter_value(40), None);
    }

    #[test]
    fn test_accumulate_copies_then_sums() {
        let first = PmcSample { elapsed_time: 10, coretype: 1, ..sample(7, 0b11, &[5, 6]) };
        let second = PmcSample { elapsed_time: 12, coretype: 0, ..sample(7, 0b11, &[1, 2]) };

        let mut acc = PmcSample::default();
        acc.accumulate(&first, true);
        acc.accumulate(&second, false);

        assert_eq!(acc.counter_value(0), Some(6));
        assert_eq!(acc.counter_value(1), Some(8));
        assert_eq!(acc.elapsed_time, 22);
        // metadata stays the one from the first sample
        assert_eq!(acc.coretype, 1);
    }

    #[test]
    fn test_sample_type_labels() {
        assert_eq!(SampleType::from_raw(PMC_SAMPLE_EXIT).label(), "exit");
        assert_eq!(SampleType::from_raw(99), SampleType::Unknown(99));
    }
}
