//! Domain types providing compile-time safety and self-documentation
//!
//! These newtype wrappers keep thread IDs, CPU numbers and CPU masks apart in
//! function signatures, and [`EntityId`] makes the per-mode meaning of a
//! sample's owner explicit.

use std::fmt;

/// Process / thread ID
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Pid(pub i32);

impl Pid {
    #[must_use]
    pub fn as_raw(self) -> libc::pid_t {
        self.0
    }
}

impl fmt::Display for Pid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// CPU ID
///
/// Represents a logical CPU number (0, 1, 2, ...).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CpuId(pub u32);

impl fmt::Display for CpuId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CPU:{}", self.0)
    }
}

/// Unit of aggregation
///
/// A thread in per-thread mode, a CPU in system-wide mode. Both come from the
/// same `pid` field of the raw sample; the monitor mode decides which one it
/// is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntityId {
    Thread(Pid),
    Cpu(CpuId),
}

impl EntityId {
    /// Raw identifier as printed in the report's `pid`/`cpu` column
    #[must_use]
    pub fn raw(self) -> i64 {
        match self {
            Self::Thread(pid) => i64::from(pid.0),
            Self::Cpu(cpu) => i64::from(cpu.0),
        }
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Thread(pid) => write!(f, "TID:{pid}"),
            Self::Cpu(cpu) => write!(f, "{cpu}"),
        }
    }
}

/// CPU affinity mask (bit N = CPU N)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CpuMask(pub u64);

impl CpuMask {
    /// CPUs selected by this mask, lowest first
    pub fn cpus(self) -> impl Iterator<Item = CpuId> {
        (0..u64::BITS).filter(move |bit| self.0 & (1 << bit) != 0).map(CpuId)
    }

    #[must_use]
    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    #[must_use]
    pub fn contains(self, cpu: CpuId) -> bool {
        cpu.0 < u64::BITS && self.0 & (1 << cpu.0) != 0
    }
}

impl fmt::Display for CpuMask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:x}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cpu_mask_iterates_selected_cpus() {
        let mask = CpuMask(0b1010_0001);
        let cpus: Vec<CpuId> = mask.cpus().collect();
        assert_eq!(cpus, vec![CpuId(0), CpuId(5), CpuId(7)]);
        assert!(mask.contains(CpuId(5)));
        assert!(!mask.contains(CpuId(1)));
        assert!(!mask.contains(CpuId(200)));
    }

    #[test]
    fn test_entity_display() {
        assert_eq!(EntityId::Thread(Pid(42)).to_string(), "TID:42");
        assert_eq!(EntityId::Cpu(CpuId(3)).to_string(), "CPU:3");
        assert_eq!(EntityId::Cpu(CpuId(3)).raw(), 3);
    }
}
