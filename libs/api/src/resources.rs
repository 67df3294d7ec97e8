//! Resource quantities for placement accounting.

use serde::{Deserialize, Serialize};

/// A cpu/memory quantity pair.
///
/// Cpu is counted in millicores so fractional requests stay integral.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceSet {
    #[serde(default)]
    pub cpu_millis: u64,

    #[serde(default)]
    pub memory_bytes: u64,
}

impl ResourceSet {
    pub const ZERO: ResourceSet = ResourceSet {
        cpu_millis: 0,
        memory_bytes: 0,
    };

    #[must_use]
    pub fn new(cpu_millis: u64, memory_bytes: u64) -> Self {
        Self {
            cpu_millis,
            memory_bytes,
        }
    }

    #[must_use]
    pub fn add(&self, other: &ResourceSet) -> ResourceSet {
        ResourceSet {
            cpu_millis: self.cpu_millis.saturating_add(other.cpu_millis),
            memory_bytes: self.memory_bytes.saturating_add(other.memory_bytes),
        }
    }

    #[must_use]
    pub fn saturating_sub(&self, other: &ResourceSet) -> ResourceSet {
        ResourceSet {
            cpu_millis: self.cpu_millis.saturating_sub(other.cpu_millis),
            memory_bytes: self.memory_bytes.saturating_sub(other.memory_bytes),
        }
    }

    /// Returns true if both dimensions fit within `capacity`.
    #[must_use]
    pub fn fits_within(&self, capacity: &ResourceSet) -> bool {
        self.cpu_millis <= capacity.cpu_millis && self.memory_bytes <= capacity.memory_bytes
    }

    /// The larger of the two utilization fractions, in `[0.0, 1.0+]`.
    ///
    /// Used by the scheduler's resource-balance scoring.
    #[must_use]
    pub fn dominant_fraction_of(&self, capacity: &ResourceSet) -> f64 {
        let cpu = fraction(self.cpu_millis, capacity.cpu_millis);
        let mem = fraction(self.memory_bytes, capacity.memory_bytes);
        cpu.max(mem)
    }
}

fn fraction(used: u64, capacity: u64) -> f64 {
    if capacity == 0 {
        if used == 0 {
            0.0
        } else {
            f64::INFINITY
        }
    } else {
        used as f64 / capacity as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fits_within_checks_both_dimensions() {
        let capacity = ResourceSet::new(2000, 4096);
        assert!(ResourceSet::new(2000, 4096).fits_within(&capacity));
        assert!(!ResourceSet::new(2001, 0).fits_within(&capacity));
        assert!(!ResourceSet::new(0, 4097).fits_within(&capacity));
    }

    #[test]
    fn saturating_sub_floors_at_zero() {
        let a = ResourceSet::new(100, 100);
        let b = ResourceSet::new(200, 50);
        assert_eq!(a.saturating_sub(&b), ResourceSet::new(0, 50));
    }

    #[test]
    fn dominant_fraction_picks_larger() {
        let capacity = ResourceSet::new(1000, 1000);
        let used = ResourceSet::new(250, 750);
        assert!((used.dominant_fraction_of(&capacity) - 0.75).abs() < 1e-9);
    }

    #[test]
    fn zero_capacity_with_usage_is_infinite() {
        let used = ResourceSet::new(1, 0);
        assert!(used.dominant_fraction_of(&ResourceSet::ZERO).is_infinite());
    }
}
