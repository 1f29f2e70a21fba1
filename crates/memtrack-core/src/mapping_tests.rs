use crate::{
    AddressSpace as _, MappingTable, MemoryProtection, Pa, PhysicalRange, TrackingError, Va,
};

const PAGE_SIZE: u64 = 0x1000;

#[test]
fn translate_coalesces_contiguous_pages() -> Result<(), TrackingError> {
    let mut table = MappingTable::new(PAGE_SIZE);
    table.map(Va(0x10000), Pa(0x4000), 0x3000)?;

    let ranges = table.translate(Va(0x10000), 0x3000);
    assert_eq!(ranges.as_slice(), &[PhysicalRange::new(Pa(0x4000), 0x3000)]);

    Ok(())
}

#[test]
fn translate_splits_discontiguous_pages() -> Result<(), TrackingError> {
    let mut table = MappingTable::new(PAGE_SIZE);
    table.map(Va(0x10000), Pa(0x8000), 0x1000)?;
    table.map(Va(0x11000), Pa(0x2000), 0x1000)?;

    let ranges = table.translate(Va(0x10000), 0x2000);
    assert_eq!(
        ranges.as_slice(),
        &[
            PhysicalRange::new(Pa(0x8000), 0x1000),
            PhysicalRange::new(Pa(0x2000), 0x1000),
        ]
    );

    Ok(())
}

#[test]
fn translate_skips_unmapped_pages() -> Result<(), TrackingError> {
    let mut table = MappingTable::new(PAGE_SIZE);
    table.map(Va(0x0), Pa(0x0), 0x3000)?;
    table.unmap(Va(0x1000), 0x1000)?;

    let ranges = table.translate(Va(0x0), 0x3000);
    assert_eq!(
        ranges.as_slice(),
        &[
            PhysicalRange::new(Pa(0x0), 0x1000),
            PhysicalRange::new(Pa(0x2000), 0x1000),
        ]
    );
    assert_eq!(table.mapped_pages(), 2);
    assert_eq!(table.translate_address(Va(0x1010)), None);
    assert_eq!(table.translate_address(Va(0x2010)), Some(Pa(0x2010)));

    Ok(())
}

#[test]
fn translate_merges_aliased_pages() -> Result<(), TrackingError> {
    let mut table = MappingTable::new(PAGE_SIZE);
    table.map(Va(0x0), Pa(0x10000), 0x1000)?;
    table.map(Va(0x1000), Pa(0x10000), 0x2000)?;

    let ranges = table.translate(Va(0x0), 0x3000);
    assert_eq!(ranges.as_slice(), &[PhysicalRange::new(Pa(0x10000), 0x2000)]);

    let ranges = table.translate(Va(0x0), 0x2000);
    assert_eq!(ranges.as_slice(), &[PhysicalRange::new(Pa(0x10000), 0x1000)]);

    Ok(())
}

#[test]
fn translate_unaligned_range() -> Result<(), TrackingError> {
    let mut table = MappingTable::new(PAGE_SIZE);
    table.map(Va(0x0), Pa(0x5000), 0x2000)?;

    let ranges = table.translate(Va(0x800), 0x1000);
    assert_eq!(ranges.as_slice(), &[PhysicalRange::new(Pa(0x5800), 0x1000)]);

    Ok(())
}

#[test]
fn map_rejects_misaligned_range() {
    let mut table = MappingTable::new(PAGE_SIZE);

    let result = table.map(Va(0x10), Pa(0x0), 0x1000);
    assert!(matches!(result, Err(TrackingError::Misaligned { .. })));
}

#[test]
fn virtual_protection_is_per_page() -> Result<(), TrackingError> {
    let mut table = MappingTable::new(PAGE_SIZE);
    table.map(Va(0x0), Pa(0x0), 0x2000)?;

    table.set_protection(Va(0x1000), 0x1000, MemoryProtection::R)?;
    assert_eq!(table.protection(Va(0x0)), MemoryProtection::RW);
    assert_eq!(table.protection(Va(0x1800)), MemoryProtection::R);

    table.set_protection(Va(0x0), 0x2000, MemoryProtection::RW)?;
    assert_eq!(table.protection(Va(0x1800)), MemoryProtection::RW);

    Ok(())
}

#[test]
fn protection_lattice() {
    assert_eq!(MemoryProtection::RW & MemoryProtection::R, MemoryProtection::R);
    assert_eq!(MemoryProtection::R & MemoryProtection::NONE, MemoryProtection::NONE);
    assert_eq!(
        MemoryProtection::combine([MemoryProtection::RW, MemoryProtection::R]),
        MemoryProtection::R
    );
    assert_eq!(MemoryProtection::combine(std::iter::empty()), MemoryProtection::RW);
    assert_eq!(MemoryProtection::RW.to_string(), "rw");
    assert_eq!(MemoryProtection::R.to_string(), "r-");
    assert_eq!(MemoryProtection::NONE.to_string(), "--");
}
