//! Resource quantities.

use serde::{Deserialize, Serialize};

/// A bundle of resource quantities.
///
/// Used both for node capacity and for the request of a server plan.
/// `cpu` is expressed in hundredths of a core, so a plan asking for
/// `cpu: 50` wants half a core.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Resources {
    pub cpu: u64,
    pub ram_mb: u64,
    #[serde(default)]
    pub disk_gb: u64,
}

impl Resources {
    pub const ZERO: Self = Self {
        cpu: 0,
        ram_mb: 0,
        disk_gb: 0,
    };

    pub const fn new(cpu: u64, ram_mb: u64, disk_gb: u64) -> Self {
        Self {
            cpu,
            ram_mb,
            disk_gb,
        }
    }

    /// Returns true if every dimension of `self` is at most `other`'s.
    pub fn fits_within(&self, other: &Resources) -> bool {
        self.cpu <= other.cpu && self.ram_mb <= other.ram_mb && self.disk_gb <= other.disk_gb
    }

    pub fn saturating_add(&self, other: &Resources) -> Resources {
        Resources {
            cpu: self.cpu.saturating_add(other.cpu),
            ram_mb: self.ram_mb.saturating_add(other.ram_mb),
            disk_gb: self.disk_gb.saturating_add(other.disk_gb),
        }
    }

    pub fn saturating_sub(&self, other: &Resources) -> Resources {
        Resources {
            cpu: self.cpu.saturating_sub(other.cpu),
            ram_mb: self.ram_mb.saturating_sub(other.ram_mb),
            disk_gb: self.disk_gb.saturating_sub(other.disk_gb),
        }
    }

    pub fn is_zero(&self) -> bool {
        *self == Self::ZERO
    }
}
