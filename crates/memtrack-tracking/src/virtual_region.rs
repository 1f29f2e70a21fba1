use std::sync::Arc;

use indexmap::IndexMap;
use memtrack_core::{MemoryProtection, NonOverlappingRange, Pa, Range, Va};
use smallvec::SmallVec;

use crate::handle::{HandleId, HandleShared};

/// A contiguous span of guest virtual memory.
///
/// Owns the membership of the handles observing it and caches the physical
/// regions its translation resolves to.
#[derive(Debug)]
pub(crate) struct VirtualRegion {
    address: Va,
    size: u64,

    /// Handles observing this region.
    pub(crate) handles: IndexMap<HandleId, Arc<HandleShared>>,

    /// Physical regions backing this region.
    ///
    /// Keys into the physical region index. Rebuilt whenever the translation
    /// of this range may have changed.
    pub(crate) physical_children: SmallVec<[Pa; 4]>,

    /// Protection currently applied on the virtual side.
    pub(crate) protection: MemoryProtection,
}

impl VirtualRegion {
    pub(crate) fn new(address: Va, size: u64) -> Self {
        Self {
            address,
            size,
            handles: IndexMap::new(),
            physical_children: SmallVec::new(),
            protection: MemoryProtection::RW,
        }
    }

    /// Returns the weakest protection that still traps every access one of
    /// the handles is waiting for.
    pub(crate) fn required_permission(&self) -> MemoryProtection {
        MemoryProtection::combine(
            self.handles
                .values()
                .map(|handle| handle.required_permission()),
        )
    }
}

impl Range for VirtualRegion {
    type Address = Va;

    fn address(&self) -> Va {
        self.address
    }

    fn size(&self) -> u64 {
        self.size
    }
}

impl NonOverlappingRange for VirtualRegion {
    /// Physical children are not carried over. Translation depends on the
    /// address, so both halves must rebuild them.
    fn split(&mut self, split_address: Va) -> Self {
        let high = Self {
            address: split_address,
            size: self.end_address().offset_from(split_address),
            handles: self.handles.clone(),
            physical_children: SmallVec::new(),
            protection: self.protection,
        };

        self.size = split_address.offset_from(self.address);
        high
    }
}
