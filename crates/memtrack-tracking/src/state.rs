//! The virtual/physical region graph.
//!
//! Everything in here runs with the tracking lock held.

use std::{collections::HashMap, sync::Arc};

use memtrack_core::{
    AddressSpace, MemoryBlock, MemoryProtection, Pa, PhysicalRanges, Range, RangeIndex,
    TrackingOptions, Va,
};
use smallvec::SmallVec;

use crate::{
    handle::{HandleId, HandleShared, PendingActions},
    physical_region::PhysicalRegion,
    snapshot::{PhysicalRegionSnapshot, TrackingSnapshot, VirtualRegionSnapshot},
    virtual_region::VirtualRegion,
};

/// Physical regions whose parent set changed and that must be either
/// reprotected or deleted once the graph is consistent again.
type Touched = SmallVec<[Pa; 8]>;

pub(crate) struct TrackingState<Block, Space>
where
    Block: MemoryBlock,
    Space: AddressSpace,
{
    pub(crate) block: Block,
    pub(crate) space: Space,
    options: TrackingOptions,

    virtual_regions: RangeIndex<VirtualRegion>,
    physical_regions: RangeIndex<PhysicalRegion>,

    /// Virtual regions observed by each handle.
    handles: HashMap<HandleId, SmallVec<[Va; 2]>>,
}

impl<Block, Space> TrackingState<Block, Space>
where
    Block: MemoryBlock,
    Space: AddressSpace,
{
    pub(crate) fn new(block: Block, space: Space, options: TrackingOptions) -> Self {
        Self {
            block,
            space,
            options,
            virtual_regions: RangeIndex::new(),
            physical_regions: RangeIndex::new(),
            handles: HashMap::new(),
        }
    }

    pub(crate) fn virtual_region_count(&self) -> usize {
        self.virtual_regions.len()
    }

    pub(crate) fn physical_region_count(&self) -> usize {
        self.physical_regions.len()
    }

    pub(crate) fn handle_count(&self) -> usize {
        self.handles.len()
    }

    ///////////////////////////////////////////////////////////////////////////
    // Handles
    ///////////////////////////////////////////////////////////////////////////

    /// Registers a handle with the virtual regions tiling its range.
    pub(crate) fn add_handle(&mut self, handle: Arc<HandleShared>) {
        let (id, address, size) = (handle.id(), handle.address(), handle.size());

        let regions = self.get_or_add_virtual(address, size);

        for &va in &regions {
            if let Some(region) = self.virtual_regions.get_mut(va) {
                region.handles.insert(id, handle.clone());
            }
        }

        tracing::debug!(%id, %address, size, regions = regions.len(), "begin tracking");

        // Regions created by a split already registered themselves.
        let entry = self.handles.entry(id).or_default();
        for va in regions {
            if !entry.contains(&va) {
                entry.push(va);
            }
        }
    }

    /// Removes a handle from every region observing it.
    ///
    /// Regions left without handles are deleted, physical regions left
    /// without parents too.
    pub(crate) fn remove_handle(&mut self, id: HandleId) {
        let regions = match self.handles.remove(&id) {
            Some(regions) => regions,
            None => {
                tracing::warn!(%id, "removing an unknown handle");
                return;
            }
        };

        let mut touched = Touched::new();

        for va in regions {
            let region = match self.virtual_regions.get_mut(va) {
                Some(region) => region,
                None => {
                    tracing::error!(%id, %va, "handle refers to a missing virtual region");
                    continue;
                }
            };

            region.handles.swap_remove(&id);

            if region.handles.is_empty() {
                self.remove_virtual(va, &mut touched);
            } else {
                self.update_virtual_protection(va);
            }
        }

        self.settle_physical(touched);
        tracing::debug!(%id, "end tracking");
    }

    /// Recomputes protection for every region observed by a handle.
    pub(crate) fn update_handle_protection(&mut self, id: HandleId) {
        let regions = match self.handles.get(&id) {
            Some(regions) => regions.clone(),
            None => return,
        };

        for va in regions {
            self.update_virtual_protection(va);
        }
    }

    ///////////////////////////////////////////////////////////////////////////
    // Virtual regions
    ///////////////////////////////////////////////////////////////////////////

    /// Returns the virtual regions exactly tiling `[address, address + size)`,
    /// creating and splitting regions as needed.
    fn get_or_add_virtual(&mut self, address: Va, size: u64) -> SmallVec<[Va; 2]> {
        let tiling = self
            .virtual_regions
            .get_or_add(address, size, VirtualRegion::new);

        let mut touched = Touched::new();
        let mut rebuild = SmallVec::<[Va; 8]>::new();

        for &(low, high) in &tiling.splits {
            tracing::debug!(%low, %high, "split virtual region");

            // The new half inherited the handles of the low half. Make the
            // handles aware of it.
            let ids = match self.virtual_regions.get(high) {
                Some(region) => region.handles.keys().copied().collect::<SmallVec<[_; 4]>>(),
                None => continue,
            };

            for id in ids {
                let entry = self.handles.entry(id).or_default();
                if !entry.contains(&high) {
                    entry.push(high);
                }
            }

            // The low half still caches the children of the whole region.
            self.clear_physical_children(low, &mut touched);

            for va in [low, high] {
                if !rebuild.contains(&va) {
                    rebuild.push(va);
                }
            }
        }

        for &va in &tiling.created {
            tracing::debug!(%va, "new virtual region");
            rebuild.push(va);
        }

        for va in rebuild {
            self.update_physical_children(va, &mut touched);
        }

        self.settle_physical(touched);

        tiling.regions.into_iter().collect()
    }

    /// Deletes a virtual region that lost its last handle.
    fn remove_virtual(&mut self, va: Va, touched: &mut Touched) {
        self.clear_physical_children(va, touched);

        let region = match self.virtual_regions.remove(va) {
            Some(region) => region,
            None => return,
        };

        if region.protection != MemoryProtection::RW {
            self.protect_virtual(va, region.size(), MemoryProtection::RW);
        }

        tracing::debug!(%va, size = region.size(), "removed virtual region");
    }

    /// Rebuilds the physical children of every virtual region overlapping
    /// `[address, address + size)`.
    pub(crate) fn recalculate_overlapping(&mut self, address: Va, size: u64) {
        let regions = self.virtual_regions.find_overlaps(address, size);
        let mut touched = Touched::new();

        for &va in &regions {
            self.clear_physical_children(va, &mut touched);
        }

        for va in regions {
            self.update_physical_children(va, &mut touched);
        }

        self.settle_physical(touched);
    }

    /// Detaches a virtual region from its physical children.
    ///
    /// Children are not deleted here, even if they lost their last parent.
    /// They are recorded in `touched` for [`settle_physical`].
    ///
    /// [`settle_physical`]: Self::settle_physical
    fn clear_physical_children(&mut self, va: Va, touched: &mut Touched) {
        let children = match self.virtual_regions.get_mut(va) {
            Some(region) => std::mem::take(&mut region.physical_children),
            None => return,
        };

        for pa in children {
            if let Some(child) = self.physical_regions.get_mut(pa) {
                child.parents.swap_remove(&va);
            }

            touched.push(pa);
        }
    }

    /// Derives the physical children of a virtual region from the current
    /// translation of its range.
    ///
    /// Physical regions split on the way are recorded in `touched`, the half
    /// outside of the translation may have been left without parents.
    fn update_physical_children(&mut self, va: Va, touched: &mut Touched) {
        let (address, size) = match self.virtual_regions.get(va) {
            Some(region) => (region.address(), region.size()),
            None => return,
        };

        debug_assert!(
            self.virtual_regions
                .get(va)
                .is_some_and(|region| region.physical_children.is_empty()),
            "physical children were not cleared"
        );

        let ranges = self.space.translate(address, size);
        validate_translation(address, size, &ranges);

        let mut children = SmallVec::<[Pa; 4]>::new();

        for range in ranges {
            let tiling = self
                .physical_regions
                .get_or_add(range.address, range.size, PhysicalRegion::new);

            for &(low, high) in &tiling.splits {
                tracing::debug!(%low, %high, "split physical region");
                touched.push(high);

                // Every parent of the low half now also translates into the
                // high half.
                let parents = match self.physical_regions.get(high) {
                    Some(region) => region.parents.iter().copied().collect::<SmallVec<[_; 4]>>(),
                    None => continue,
                };

                for parent in parents {
                    if let Some(region) = self.virtual_regions.get_mut(parent) {
                        region.physical_children.push(high);
                    }
                }
            }

            for &pa in &tiling.created {
                tracing::debug!(%pa, %va, "new physical region");
            }

            children.extend(tiling.regions);
        }

        for &pa in &children {
            if let Some(child) = self.physical_regions.get_mut(pa) {
                child.parents.insert(va);
            }
        }

        if let Some(region) = self.virtual_regions.get_mut(va) {
            region.physical_children = children.clone();
        }

        for pa in children {
            self.update_physical_protection(pa);
        }
    }

    /// Pushes the protection required by the handles of a virtual region,
    /// then cascades to its physical children.
    pub(crate) fn update_virtual_protection(&mut self, va: Va) {
        let (required, current, size) = match self.virtual_regions.get(va) {
            Some(region) => (region.required_permission(), region.protection, region.size()),
            None => return,
        };

        if required != current {
            self.protect_virtual(va, size, required);
        }

        self.update_children_protection(va);
    }

    fn update_children_protection(&mut self, va: Va) {
        let children = match self.virtual_regions.get(va) {
            Some(region) => region.physical_children.clone(),
            None => return,
        };

        for pa in children {
            self.update_physical_protection(pa);
        }
    }

    /// Signals an access to a virtual region.
    ///
    /// Protection is lifted first, so that accesses from other threads stop
    /// faulting, then every handle is signalled and the protection of the
    /// region itself recomputed. Physical children are left to the caller.
    fn signal_virtual(&mut self, va: Va, write: bool, actions: &mut PendingActions) {
        let size = match self.virtual_regions.get(va) {
            Some(region) => region.size(),
            None => return,
        };

        self.protect_virtual(va, size, MemoryProtection::RW);

        let required = match self.virtual_regions.get(va) {
            Some(region) => {
                for handle in region.handles.values() {
                    handle.signal(write, actions);
                }

                region.required_permission()
            }
            None => return,
        };

        if required != MemoryProtection::RW {
            self.protect_virtual(va, size, required);
        }
    }

    fn protect_virtual(&mut self, va: Va, size: u64, protection: MemoryProtection) {
        tracing::trace!(%va, size, %protection, "protect virtual region");

        match self.space.set_protection(va, size, protection) {
            Ok(()) => {
                if let Some(region) = self.virtual_regions.get_mut(va) {
                    region.protection = protection;
                }
            }
            Err(err) => {
                tracing::error!(%va, size, %protection, %err, "failed to protect virtual region");
            }
        }
    }

    ///////////////////////////////////////////////////////////////////////////
    // Physical regions
    ///////////////////////////////////////////////////////////////////////////

    /// Recomputes the protection of a physical region from its parents.
    fn update_physical_protection(&mut self, pa: Pa) {
        let (required, current, size) = match self.physical_regions.get(pa) {
            Some(region) => {
                let required = MemoryProtection::combine(
                    region
                        .parents
                        .iter()
                        .filter_map(|&parent| self.virtual_regions.get(parent))
                        .map(VirtualRegion::required_permission),
                );

                (required, region.protection, region.size())
            }
            None => return,
        };

        if required != current {
            self.protect_physical(pa, size, required);
        }
    }

    /// Reprotects or deletes physical regions whose parent set changed.
    fn settle_physical(&mut self, touched: Touched) {
        for pa in touched {
            let (orphaned, protection, size) = match self.physical_regions.get(pa) {
                Some(region) => (region.parents.is_empty(), region.protection, region.size()),
                None => continue,
            };

            if !orphaned {
                self.update_physical_protection(pa);
                continue;
            }

            if protection != MemoryProtection::RW {
                self.protect_physical(pa, size, MemoryProtection::RW);
            }

            self.physical_regions.remove(pa);
            tracing::debug!(%pa, size, "removed physical region");
        }
    }

    fn protect_physical(&mut self, pa: Pa, size: u64, protection: MemoryProtection) {
        tracing::trace!(%pa, size, %protection, "protect physical region");

        match self.block.map_with_permission(pa, size, protection) {
            Ok(()) => {
                if let Some(region) = self.physical_regions.get_mut(pa) {
                    region.protection = protection;
                }
            }
            Err(err) => {
                tracing::error!(%pa, size, %protection, %err, "failed to protect physical region");
            }
        }
    }

    ///////////////////////////////////////////////////////////////////////////
    // Faults
    ///////////////////////////////////////////////////////////////////////////

    /// Dispatches a fault on backing memory.
    ///
    /// Returns `None` if no physical region covers the address.
    pub(crate) fn physical_memory_event(
        &mut self,
        address: Pa,
        write: bool,
    ) -> Option<PendingActions> {
        let regions = self.physical_regions.find_overlaps_bounded(
            address,
            self.options.fault_access_size,
            self.options.max_fault_overlaps,
        );

        if regions.is_empty() {
            return None;
        }

        let mut actions = PendingActions::new();
        let mut signaled = SmallVec::<[Va; 4]>::new();

        for &pa in &regions {
            let (size, parents) = match self.physical_regions.get(pa) {
                Some(region) => (
                    region.size(),
                    region.parents.iter().copied().collect::<SmallVec<[_; 4]>>(),
                ),
                None => continue,
            };

            // Stop the access from faulting again before the handles have
            // been notified.
            self.protect_physical(pa, size, MemoryProtection::RW);

            for va in parents {
                if !signaled.contains(&va) {
                    self.signal_virtual(va, write, &mut actions);
                    signaled.push(va);
                }
            }
        }

        for va in signaled {
            self.update_children_protection(va);
        }

        for pa in regions {
            self.update_physical_protection(pa);
        }

        Some(actions)
    }

    /// Dispatches a fault on the virtual side.
    ///
    /// Returns `None` if no virtual region overlaps the range.
    pub(crate) fn virtual_memory_event(
        &mut self,
        address: Va,
        size: u64,
        write: bool,
    ) -> Option<PendingActions> {
        let regions = self.virtual_regions.find_overlaps(address, size.max(1));

        if regions.is_empty() {
            return None;
        }

        let mut actions = PendingActions::new();

        for &va in &regions {
            self.signal_virtual(va, write, &mut actions);
        }

        for va in regions {
            self.update_children_protection(va);
        }

        Some(actions)
    }

    ///////////////////////////////////////////////////////////////////////////
    // Introspection
    ///////////////////////////////////////////////////////////////////////////

    pub(crate) fn snapshot(&self) -> TrackingSnapshot {
        let virtual_regions = self
            .virtual_regions
            .iter()
            .map(|region| VirtualRegionSnapshot {
                address: region.address(),
                size: region.size(),
                protection: region.protection,
                required_protection: region.required_permission(),
                handles: region.handles.keys().copied().collect(),
                physical_children: region.physical_children.to_vec(),
            })
            .collect();

        let physical_regions = self
            .physical_regions
            .iter()
            .map(|region| PhysicalRegionSnapshot {
                address: region.address(),
                size: region.size(),
                protection: region.protection,
                required_protection: MemoryProtection::combine(
                    region
                        .parents
                        .iter()
                        .filter_map(|&parent| self.virtual_regions.get(parent))
                        .map(VirtualRegion::required_permission),
                ),
                parents: region.parents.iter().copied().collect(),
            })
            .collect();

        TrackingSnapshot {
            virtual_regions,
            physical_regions,
        }
    }
}

/// Asserts that the address space honoured the translation contract.
fn validate_translation(va: Va, size: u64, ranges: &PhysicalRanges) {
    for range in ranges {
        assert!(
            range.size != 0,
            "translation of {va}+{size:#x} returned an empty range at {}",
            range.address
        );

        assert!(
            range.address.checked_add(range.size).is_some(),
            "translation of {va}+{size:#x} returned a range that overflows: {range:?}"
        );
    }

    let mut sorted = ranges.clone();
    sorted.sort_unstable_by_key(|range| range.address);

    for pair in sorted.windows(2) {
        assert!(
            pair[0].end_address() <= pair[1].address,
            "translation of {va}+{size:#x} returned overlapping ranges {:?} and {:?}",
            pair[0],
            pair[1]
        );
    }
}
