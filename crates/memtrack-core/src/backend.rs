use smallvec::SmallVec;

use crate::{MemoryProtection, Pa, Range, TrackingError, Va};

/// Callback invoked by a [`MemoryBlock`] when an access to a protected page
/// faults.
///
/// Receives the faulting backing address and whether the access was a write.
/// Returns `false` if the fault does not belong to a tracked region, in which
/// case it must be treated as a genuine invalid access.
pub type FaultHandler = Box<dyn Fn(Pa, bool) -> bool + Send + Sync>;

/// A contiguous range of backing memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PhysicalRange {
    /// Start of the range.
    pub address: Pa,

    /// Size of the range in bytes.
    pub size: u64,
}

impl PhysicalRange {
    /// Creates a new physical range.
    pub fn new(address: Pa, size: u64) -> Self {
        Self { address, size }
    }
}

impl From<(Pa, u64)> for PhysicalRange {
    fn from((address, size): (Pa, u64)) -> Self {
        Self { address, size }
    }
}

impl Range for PhysicalRange {
    type Address = Pa;

    fn address(&self) -> Pa {
        self.address
    }

    fn size(&self) -> u64 {
        self.size
    }
}

/// The physical ranges backing a virtual range.
pub type PhysicalRanges = SmallVec<[PhysicalRange; 4]>;

/// The host memory block backing tracked memory.
///
/// Changes the page protection of backing memory and delivers protection
/// faults.
pub trait MemoryBlock: Send + 'static {
    /// Applies `protection` to `[address, address + size)`.
    ///
    /// Must be synchronous and idempotent.
    fn map_with_permission(
        &mut self,
        address: Pa,
        size: u64,
        protection: MemoryProtection,
    ) -> Result<(), TrackingError>;

    /// Registers the handler to call when an access faults.
    fn register_fault_handler(&mut self, handler: FaultHandler);
}

/// The guest address space.
///
/// Translates guest virtual addresses into backing addresses and applies
/// protection on the virtual side.
pub trait AddressSpace: Send + 'static {
    /// Translates `[va, va + size)` into the physical ranges backing it.
    ///
    /// The translation of a virtual range need not be contiguous. Unmapped
    /// parts are omitted. Returned ranges must be non-empty and must not
    /// overlap each other.
    fn translate(&self, va: Va, size: u64) -> PhysicalRanges;

    /// Applies `protection` to the virtual range `[va, va + size)`.
    fn set_protection(
        &mut self,
        va: Va,
        size: u64,
        protection: MemoryProtection,
    ) -> Result<(), TrackingError>;

    /// Called when `[va, va + size)` is mapped to `[pa, pa + size)`.
    ///
    /// Address spaces that keep their own translation tables update them
    /// here. The default implementation does nothing.
    fn map(&mut self, va: Va, pa: Pa, size: u64) -> Result<(), TrackingError> {
        let _ = (va, pa, size);
        Ok(())
    }

    /// Called when `[va, va + size)` is unmapped.
    ///
    /// The default implementation does nothing.
    fn unmap(&mut self, va: Va, size: u64) -> Result<(), TrackingError> {
        let _ = (va, size);
        Ok(())
    }
}
