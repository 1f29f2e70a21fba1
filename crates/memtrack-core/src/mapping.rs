use std::collections::BTreeMap;

use crate::{AddressSpace, MemoryProtection, Pa, PhysicalRange, PhysicalRanges, TrackingError, Va};

/// A page-granular guest address space.
///
/// Keeps a table of mapped virtual pages and the virtual-side protection of
/// each page. Suitable for guests whose translation is maintained by the
/// emulator itself.
#[derive(Debug)]
pub struct MappingTable {
    page_size: u64,

    /// Mapped pages.
    /// Virtual page address -> physical page address.
    pages: BTreeMap<Va, Pa>,

    /// Virtual pages with a protection other than `RW`.
    protections: BTreeMap<Va, MemoryProtection>,
}

impl MappingTable {
    /// Creates an empty table.
    ///
    /// # Panics
    ///
    /// Panics if `page_size` is not a power of two.
    pub fn new(page_size: u64) -> Self {
        assert!(page_size.is_power_of_two(), "page size must be a power of two");

        Self {
            page_size,
            pages: BTreeMap::new(),
            protections: BTreeMap::new(),
        }
    }

    /// Returns the page size.
    pub fn page_size(&self) -> u64 {
        self.page_size
    }

    /// Returns the number of mapped pages.
    pub fn mapped_pages(&self) -> usize {
        self.pages.len()
    }

    /// Translates a single virtual address.
    pub fn translate_address(&self, va: Va) -> Option<Pa> {
        let page = va.align_down(self.page_size);
        let pa = self.pages.get(&page)?;
        Some(*pa + va.offset_from(page))
    }

    /// Returns the virtual-side protection of the page containing `va`.
    pub fn protection(&self, va: Va) -> MemoryProtection {
        let page = va.align_down(self.page_size);

        match self.protections.get(&page) {
            Some(protection) => *protection,
            None => MemoryProtection::RW,
        }
    }

    fn check_alignment(&self, address: u64, size: u64) -> Result<(), TrackingError> {
        let mask = self.page_size - 1;

        if address & mask != 0 || size & mask != 0 {
            return Err(TrackingError::Misaligned { address, size });
        }

        Ok(())
    }

    fn pages_in(&self, va: Va, size: u64) -> impl Iterator<Item = Va> + use<> {
        let first = va.align_down(self.page_size);
        let end = va.0 + size;
        let page_size = self.page_size;

        (first.0..end).step_by(page_size as usize).map(Va)
    }
}

impl AddressSpace for MappingTable {
    fn translate(&self, va: Va, size: u64) -> PhysicalRanges {
        let mut result = PhysicalRanges::new();

        if size == 0 {
            return result;
        }

        let end = va + size;
        let first = va.align_down(self.page_size);

        for (&page, &pa) in self.pages.range(first..end) {
            let start = page.max(va);
            let stop = (page + self.page_size).min(end);
            let address = pa + start.offset_from(page);
            let size = stop.offset_from(start);

            // Coalesce runs that are contiguous in physical memory.
            if let Some(last) = result.last_mut() {
                if last.address + last.size == address {
                    last.size += size;
                    continue;
                }
            }

            result.push(PhysicalRange::new(address, size));
        }

        merge_aliased(&mut result);
        result
    }

    fn set_protection(
        &mut self,
        va: Va,
        size: u64,
        protection: MemoryProtection,
    ) -> Result<(), TrackingError> {
        for page in self.pages_in(va, size) {
            if protection == MemoryProtection::RW {
                self.protections.remove(&page);
            } else {
                self.protections.insert(page, protection);
            }
        }

        tracing::trace!(%va, size, %protection, "virtual protection");
        Ok(())
    }

    fn map(&mut self, va: Va, pa: Pa, size: u64) -> Result<(), TrackingError> {
        self.check_alignment(va.0, size)?;
        self.check_alignment(pa.0, 0)?;

        for page in self.pages_in(va, size) {
            self.pages.insert(page, pa + page.offset_from(va));
        }

        Ok(())
    }

    fn unmap(&mut self, va: Va, size: u64) -> Result<(), TrackingError> {
        self.check_alignment(va.0, size)?;

        for page in self.pages_in(va, size) {
            self.pages.remove(&page);
            self.protections.remove(&page);
        }

        Ok(())
    }
}

/// Merges ranges backed by the same memory.
///
/// Several virtual pages may map to one physical page. Their runs are
/// reported once, so that the result never overlaps itself.
fn merge_aliased(ranges: &mut PhysicalRanges) {
    let mut sorted = ranges.clone();
    sorted.sort_unstable_by_key(|range| range.address);

    if sorted
        .windows(2)
        .all(|pair| pair[0].address + pair[0].size <= pair[1].address)
    {
        return;
    }

    let mut merged = PhysicalRanges::new();

    for range in sorted {
        match merged.last_mut() {
            Some(last) if range.address < last.address + last.size => {
                let end = (last.address + last.size).max(range.address + range.size);
                last.size = end.offset_from(last.address);
            }
            _ => merged.push(range),
        }
    }

    tracing::trace!(?merged, "merged aliased pages");
    *ranges = merged;
}
