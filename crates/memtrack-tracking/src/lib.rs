//! Memory tracking driven by protection faults.
//!
//! Consumers subscribe to ranges of guest virtual memory with
//! [`MemoryTracking::begin_tracking`] and receive a [`RegionHandle`]. The
//! engine keeps two indices of non-overlapping regions:
//!
//! - **Virtual regions** partition the tracked guest virtual address space.
//!   Each knows the handles observing it.
//! - **Physical regions** partition the backing memory those virtual ranges
//!   translate into. Each knows the virtual regions aliasing it.
//!
//! The protection of every region is the combination of what its handles
//! require. A handle waiting for writes needs its pages read-only, a handle
//! with a pending pre-action needs them inaccessible. When an access faults,
//! the backing [`MemoryBlock`] calls back into the engine, which lifts the
//! protection, notifies every handle of every aliasing virtual region and
//! finally protects the pages again where still required.
//!
//! All mutation of the region graph happens under a single lock. Pre-actions
//! are taken under that lock and run once it has been released.
//!
//! [`MemoryBlock`]: memtrack_core::MemoryBlock

mod handle;
mod multi_region_handle;
mod physical_region;
mod snapshot;
mod state;
mod virtual_region;


use std::sync::{
    Arc, Mutex,
    atomic::{AtomicU64, Ordering},
};

pub use memtrack_core::{
    AddressSpace, MappingTable, MemoryBlock, MemoryProtection, Pa, PhysicalRange,
    PhysicalRanges, Range, TrackingError, TrackingOptions, Va,
};

pub use self::{
    handle::{HandleId, PreAction, RegionHandle},
    multi_region_handle::MultiRegionHandle,
    snapshot::{PhysicalRegionSnapshot, TrackingSnapshot, VirtualRegionSnapshot},
};
use self::{
    handle::{HandleShared, PendingActions, lock},
    state::TrackingState,
};

/// State shared between [`MemoryTracking`], its handles and the fault
/// handler registered with the memory block.
pub(crate) struct Shared<Block, Space>
where
    Block: MemoryBlock,
    Space: AddressSpace,
{
    state: Mutex<TrackingState<Block, Space>>,
    next_handle_id: AtomicU64,
    options: TrackingOptions,
}

impl<Block, Space> Shared<Block, Space>
where
    Block: MemoryBlock,
    Space: AddressSpace,
{
    fn physical_memory_event(&self, address: Pa, write: bool) -> bool {
        let actions = lock(&self.state).physical_memory_event(address, write);

        match actions {
            Some(actions) => {
                run_actions(actions);
                true
            }
            None => {
                tracing::warn!(%address, write, "fault outside of tracked memory");
                false
            }
        }
    }

    fn virtual_memory_event(&self, address: Va, size: u64, write: bool) -> bool {
        let actions = lock(&self.state).virtual_memory_event(address, size, write);

        match actions {
            Some(actions) => {
                run_actions(actions);
                true
            }
            None => false,
        }
    }

    pub(crate) fn update_handle_protection(&self, id: HandleId) {
        lock(&self.state).update_handle_protection(id);
    }

    pub(crate) fn remove_handle(&self, id: HandleId) {
        lock(&self.state).remove_handle(id);
    }
}

fn run_actions(actions: PendingActions) {
    for action in actions {
        action();
    }
}

/// The memory tracking engine.
///
/// Cloning is cheap, clones refer to the same tracking state.
pub struct MemoryTracking<Block, Space>
where
    Block: MemoryBlock,
    Space: AddressSpace,
{
    shared: Arc<Shared<Block, Space>>,
}

impl<Block, Space> Clone for MemoryTracking<Block, Space>
where
    Block: MemoryBlock,
    Space: AddressSpace,
{
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl<Block, Space> MemoryTracking<Block, Space>
where
    Block: MemoryBlock,
    Space: AddressSpace,
{
    /// Creates a new tracking engine with default options.
    pub fn new(block: Block, space: Space) -> Self {
        Self::with_options(block, space, TrackingOptions::default())
    }

    /// Creates a new tracking engine.
    ///
    /// Registers a fault handler with `block`. The handler holds only a weak
    /// reference to the engine, faults delivered after the last clone of the
    /// engine has been dropped are reported as unrecognized.
    ///
    /// # Panics
    ///
    /// Panics if the page size is not a power of two.
    pub fn with_options(mut block: Block, space: Space, options: TrackingOptions) -> Self {
        assert!(
            options.page_size.is_power_of_two(),
            "page size must be a power of two"
        );

        let shared = Arc::new_cyclic(|weak| {
            let weak = weak.clone();

            block.register_fault_handler(Box::new(move |address, write| {
                match weak.upgrade() {
                    Some(shared) => Shared::physical_memory_event(&shared, address, write),
                    None => false,
                }
            }));

            Shared {
                state: Mutex::new(TrackingState::new(block, space, options)),
                next_handle_id: AtomicU64::new(1),
                options,
            }
        });

        tracing::debug!(?options, "memory tracking created");
        Self { shared }
    }

    /// Returns the options the engine was created with.
    pub fn options(&self) -> &TrackingOptions {
        &self.shared.options
    }

    /// Starts tracking `[address, address + size)`.
    ///
    /// The range is expanded to page boundaries. The returned handle starts
    /// dirty.
    pub fn begin_tracking(
        &self,
        address: Va,
        size: u64,
    ) -> Result<RegionHandle<Block, Space>, TrackingError> {
        let (address, size) = self.page_align(address, size)?;

        let id = HandleId(self.shared.next_handle_id.fetch_add(1, Ordering::Relaxed));
        let handle = Arc::new(HandleShared::new(id, address, size));

        lock(&self.shared.state).add_handle(handle.clone());

        Ok(RegionHandle {
            shared: handle,
            tracking: self.shared.clone(),
        })
    }

    /// Starts tracking `[address, address + size)` with one handle per
    /// `granularity` bytes.
    ///
    /// The last handle covers whatever remains, so it may be shorter.
    pub fn begin_granular_tracking(
        &self,
        address: Va,
        size: u64,
        granularity: u64,
    ) -> Result<MultiRegionHandle<Block, Space>, TrackingError> {
        if granularity == 0 || granularity & self.shared.options.page_mask() != 0 {
            return Err(TrackingError::InvalidGranularity(granularity));
        }

        let (address, size) = self.page_align(address, size)?;

        let mut handles = Vec::new();
        let mut offset = 0;

        while offset < size {
            let chunk = granularity.min(size - offset);
            handles.push(self.begin_tracking(address + offset, chunk)?);
            offset += chunk;
        }

        Ok(MultiRegionHandle::new(handles, address, size, granularity))
    }

    /// Notifies the engine that `[va, va + size)` now translates to
    /// `[pa, pa + size)`.
    ///
    /// The change is forwarded to the address space first, then the
    /// affected virtual regions are resolved again.
    pub fn map(&self, va: Va, pa: Pa, size: u64) -> Result<(), TrackingError> {
        let mut state = lock(&self.shared.state);

        state.space.map(va, pa, size)?;
        state.recalculate_overlapping(va, size);

        tracing::debug!(%va, %pa, size, "mapped");
        Ok(())
    }

    /// Notifies the engine that `[va, va + size)` no longer translates.
    pub fn unmap(&self, va: Va, size: u64) -> Result<(), TrackingError> {
        let mut state = lock(&self.shared.state);

        state.space.unmap(va, size)?;
        state.recalculate_overlapping(va, size);

        tracing::debug!(%va, size, "unmapped");
        Ok(())
    }

    /// Handles a protection fault on backing memory.
    ///
    /// Returns `false` if the address is not tracked, in which case the
    /// fault is a genuine invalid access.
    ///
    /// # Panics
    ///
    /// Panics if the access touches more physical regions than
    /// [`TrackingOptions::max_fault_overlaps`].
    pub fn physical_memory_event(&self, address: Pa, write: bool) -> bool {
        self.shared.physical_memory_event(address, write)
    }

    /// Handles an access reported on the virtual side.
    ///
    /// Returns `false` if no tracked region overlaps the range.
    pub fn virtual_memory_event(&self, address: Va, size: u64, write: bool) -> bool {
        self.shared.virtual_memory_event(address, size, write)
    }

    /// Returns the number of virtual regions.
    pub fn virtual_region_count(&self) -> usize {
        lock(&self.shared.state).virtual_region_count()
    }

    /// Returns the number of physical regions.
    pub fn physical_region_count(&self) -> usize {
        lock(&self.shared.state).physical_region_count()
    }

    /// Returns the number of live handles.
    pub fn handle_count(&self) -> usize {
        lock(&self.shared.state).handle_count()
    }

    /// Captures the current state of the region graph.
    pub fn snapshot(&self) -> TrackingSnapshot {
        lock(&self.shared.state).snapshot()
    }

    /// Logs the region graph at debug level.
    pub fn dump(&self) {
        let snapshot = self.snapshot();

        for region in &snapshot.virtual_regions {
            tracing::debug!(
                address = %region.address,
                size = region.size,
                protection = %region.protection,
                required = %region.required_protection,
                handles = ?region.handles,
                children = ?region.physical_children,
                "virtual region"
            );
        }

        for region in &snapshot.physical_regions {
            tracing::debug!(
                address = %region.address,
                size = region.size,
                protection = %region.protection,
                required = %region.required_protection,
                parents = ?region.parents,
                "physical region"
            );
        }
    }

    fn page_align(&self, address: Va, size: u64) -> Result<(Va, u64), TrackingError> {
        if size == 0 {
            return Err(TrackingError::EmptyRange);
        }

        let mask = self.shared.options.page_mask();

        let end = address
            .0
            .checked_add(size)
            .and_then(|end| end.checked_add(mask))
            .ok_or(TrackingError::OutOfBounds)?
            & !mask;

        let start = address.0 & !mask;
        Ok((Va(start), end - start))
    }
}
