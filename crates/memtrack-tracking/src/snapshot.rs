use memtrack_core::{MemoryProtection, Pa, Va};
use serde::Serialize;

use crate::handle::HandleId;

/// A point-in-time view of the tracking graph.
#[derive(Debug, Clone, Default, Serialize)]
pub struct TrackingSnapshot {
    /// Virtual regions in address order.
    pub virtual_regions: Vec<VirtualRegionSnapshot>,

    /// Physical regions in address order.
    pub physical_regions: Vec<PhysicalRegionSnapshot>,
}

/// A virtual region as seen by [`TrackingSnapshot`].
#[derive(Debug, Clone, Serialize)]
pub struct VirtualRegionSnapshot {
    /// Start of the region.
    pub address: Va,

    /// Size of the region in bytes.
    pub size: u64,

    /// Protection applied on the virtual side.
    pub protection: MemoryProtection,

    /// Protection the handles of the region require.
    pub required_protection: MemoryProtection,

    /// Handles observing the region.
    pub handles: Vec<HandleId>,

    /// Start addresses of the physical regions backing the region.
    pub physical_children: Vec<Pa>,
}

/// A physical region as seen by [`TrackingSnapshot`].
#[derive(Debug, Clone, Serialize)]
pub struct PhysicalRegionSnapshot {
    /// Start of the region.
    pub address: Pa,

    /// Size of the region in bytes.
    pub size: u64,

    /// Protection applied to the backing memory.
    pub protection: MemoryProtection,

    /// Combined protection required by the parents.
    pub required_protection: MemoryProtection,

    /// Start addresses of the virtual regions translating into the region.
    pub parents: Vec<Va>,
}

impl TrackingSnapshot {
    /// Returns the virtual region containing `va`.
    pub fn virtual_region(&self, va: Va) -> Option<&VirtualRegionSnapshot> {
        self.virtual_regions
            .iter()
            .find(|region| region.address <= va && va.0 < region.address.0 + region.size)
    }

    /// Returns the physical region containing `pa`.
    pub fn physical_region(&self, pa: Pa) -> Option<&PhysicalRegionSnapshot> {
        self.physical_regions
            .iter()
            .find(|region| region.address <= pa && pa.0 < region.address.0 + region.size)
    }
}
