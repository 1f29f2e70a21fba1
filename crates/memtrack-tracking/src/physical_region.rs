use indexmap::IndexSet;
use memtrack_core::{MemoryProtection, NonOverlappingRange, Pa, Range, Va};

/// A contiguous span of backing memory.
///
/// Knows the virtual regions that translate into it. These are lookup-only
/// keys into the virtual region index, the physical region does not own its
/// parents. A physical region without parents is deleted.
#[derive(Debug)]
pub(crate) struct PhysicalRegion {
    address: Pa,
    size: u64,

    /// Virtual regions aliasing this region.
    pub(crate) parents: IndexSet<Va>,

    /// Protection currently applied to the backing memory.
    pub(crate) protection: MemoryProtection,
}

impl PhysicalRegion {
    pub(crate) fn new(address: Pa, size: u64) -> Self {
        Self {
            address,
            size,
            parents: IndexSet::new(),
            protection: MemoryProtection::RW,
        }
    }
}

impl Range for PhysicalRegion {
    type Address = Pa;

    fn address(&self) -> Pa {
        self.address
    }

    fn size(&self) -> u64 {
        self.size
    }
}

impl NonOverlappingRange for PhysicalRegion {
    fn split(&mut self, split_address: Pa) -> Self {
        let high = Self {
            address: split_address,
            size: self.end_address().offset_from(split_address),
            parents: self.parents.clone(),
            protection: self.protection,
        };

        self.size = split_address.offset_from(self.address);
        high
    }
}
