//! Mnemonic event tables
//!
//! Maps event names accepted by `-c` (without `-r`) to raw event encodings,
//! per PMU. Only the architectural events every PMU of a family provides are
//! listed; anything else must be given in raw format.

/// Raw encoding of a named event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EventDesc {
    pub name: &'static str,
    /// Fixed-function counter that always counts this event, if any
    pub fixed_counter: Option<u32>,
    pub code: u32,
    pub umask: Option<u32>,
}

/// Counter layout and event list of one PMU
#[derive(Debug)]
pub struct PmuTable {
    pub id: u32,
    pub name: &'static str,
    /// First general-purpose counter (fixed counters come before it)
    pub first_gp_counter: u32,
    pub nr_gp_counters: u32,
    pub events: &'static [EventDesc],
}

impl PmuTable {
    #[must_use]
    pub fn lookup(&self, name: &str) -> Option<&EventDesc> {
        self.events.iter().find(|e| e.name.eq_ignore_ascii_case(name))
    }
}

const fn fixed(name: &'static str, counter: u32, code: u32) -> EventDesc {
    EventDesc { name, fixed_counter: Some(counter), code, umask: None }
}

const fn gp(name: &'static str, code: u32, umask: Option<u32>) -> EventDesc {
    EventDesc { name, fixed_counter: None, code, umask }
}

static INTEL_CORE: PmuTable = PmuTable {
    id: 0,
    name: "intel-core",
    first_gp_counter: 3,
    nr_gp_counters: 4,
    events: &[
        fixed("instr_retired_fixed", 0, 0xc0),
        fixed("unhalted_core_cycles_fixed", 1, 0x3c),
        fixed("unhalted_ref_cycles_fixed", 2, 0x00),
        gp("instr", 0xc0, None),
        gp("cycles", 0x3c, None),
        gp("llc_references", 0x2e, Some(0x4f)),
        gp("llc_misses", 0x2e, Some(0x41)),
        gp("branch_instr_retired", 0xc4, None),
        gp("branch_misses_retired", 0xc5, None),
    ],
};

static ARMV8: PmuTable = PmuTable {
    id: 1,
    name: "armv8",
    first_gp_counter: 1,
    nr_gp_counters: 6,
    events: &[
        fixed("cpu_cycles_fixed", 0, 0x11),
        gp("instr", 0x08, None),
        gp("cycles", 0x11, None),
        gp("l1d_cache_refill", 0x03, None),
        gp("l2d_cache_refill", 0x17, None),
        gp("br_mis_pred", 0x10, None),
    ],
};

/// Event table of PMU `id` (`-p`)
#[must_use]
pub fn pmu_table(id: u32) -> Option<&'static PmuTable> {
    [&INTEL_CORE, &ARMV8].into_iter().find(|t| t.id == id)
}
