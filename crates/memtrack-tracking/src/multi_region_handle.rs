use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};

use memtrack_core::{AddressSpace, MemoryBlock, Range, TrackingError, Va};

use crate::handle::RegionHandle;

/// A run of same-sized [`RegionHandle`]s covering one contiguous range.
///
/// Answers "what changed" with as few callbacks as possible: consecutive
/// dirty handles are reported as a single range.
pub struct MultiRegionHandle<Block, Space>
where
    Block: MemoryBlock,
    Space: AddressSpace,
{
    handles: Vec<RegionHandle<Block, Space>>,
    address: Va,
    size: u64,
    granularity: u64,

    /// Set whenever one of the handles is written to.
    dirty: Arc<AtomicBool>,
}

impl<Block, Space> MultiRegionHandle<Block, Space>
where
    Block: MemoryBlock,
    Space: AddressSpace,
{
    pub(crate) fn new(
        handles: Vec<RegionHandle<Block, Space>>,
        address: Va,
        size: u64,
        granularity: u64,
    ) -> Self {
        let dirty = Arc::new(AtomicBool::new(true));

        for handle in &handles {
            handle.shared.set_parent(dirty.clone());
        }

        Self {
            handles,
            address,
            size,
            granularity,
            dirty,
        }
    }

    /// Returns the start of the tracked range.
    pub fn address(&self) -> Va {
        self.address
    }

    /// Returns the size of the tracked range.
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Returns the size of each handle. The last one may be shorter.
    pub fn granularity(&self) -> u64 {
        self.granularity
    }

    /// Returns the handles in address order.
    pub fn handles(&self) -> &[RegionHandle<Block, Space>] {
        &self.handles
    }

    /// Returns the aggregate dirty flag.
    ///
    /// May report `true` even though every handle is clean, never the
    /// other way around.
    pub fn dirty(&self) -> bool {
        self.dirty.load(Ordering::Acquire)
    }

    /// Marks the range as possibly modified.
    pub fn signal_write(&self) {
        self.dirty.store(true, Ordering::Release);
    }

    /// Checks whether any of the handles is dirty.
    pub fn calculate_dirty(&self) -> bool {
        self.handles.iter().any(RegionHandle::dirty)
    }

    /// Reports every modified range and protects it again.
    ///
    /// `f` receives the start and size of each run of consecutive dirty
    /// handles. Does nothing if no handle was written since the last query.
    pub fn query_modified(&self, f: impl FnMut(Va, u64)) {
        if !self.dirty.swap(false, Ordering::AcqRel) {
            return;
        }

        scan(&self.handles, f);
    }

    /// Same as [`query_modified`], restricted to the handles overlapping
    /// `[address, address + size)`.
    ///
    /// [`query_modified`]: Self::query_modified
    pub fn query_modified_range(
        &self,
        address: Va,
        size: u64,
        f: impl FnMut(Va, u64),
    ) -> Result<(), TrackingError> {
        let end = match address.checked_add(size) {
            Some(end) if size != 0 => end,
            _ => return Err(TrackingError::RangeNotTracked { address, size }),
        };

        if address < self.address || end > self.address + self.size {
            return Err(TrackingError::RangeNotTracked { address, size });
        }

        if !self.dirty.swap(false, Ordering::AcqRel) {
            return Ok(());
        }

        let first = (address.offset_from(self.address) / self.granularity) as usize;
        let last = ((end - 1).offset_from(self.address) / self.granularity) as usize;

        scan(&self.handles[first..=last], f);

        // Handles outside of the scanned span may still be dirty.
        if self.calculate_dirty() {
            self.dirty.store(true, Ordering::Release);
        }

        Ok(())
    }

    /// Stops tracking the whole range.
    pub fn dispose(self) {
        drop(self);
    }
}

/// Reports runs of consecutive dirty handles, reprotecting each one.
fn scan<Block, Space>(handles: &[RegionHandle<Block, Space>], mut f: impl FnMut(Va, u64))
where
    Block: MemoryBlock,
    Space: AddressSpace,
{
    let mut run: Option<(Va, u64)> = None;

    for handle in handles {
        if handle.dirty() {
            handle.reprotect();

            match &mut run {
                Some((_, size)) => *size += handle.size(),
                None => run = Some((handle.address(), handle.size())),
            }
        } else if let Some((start, size)) = run.take() {
            f(start, size);
        }
    }

    if let Some((start, size)) = run {
        f(start, size);
    }
}

impl<Block, Space> std::fmt::Debug for MultiRegionHandle<Block, Space>
where
    Block: MemoryBlock,
    Space: AddressSpace,
{
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("MultiRegionHandle")
            .field("address", &self.address)
            .field("size", &self.size)
            .field("granularity", &self.granularity)
            .field("dirty", &self.dirty())
            .field("handles", &self.handles.len())
            .finish()
    }
}
