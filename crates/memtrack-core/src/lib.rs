//! Core types for memory tracking.
//!
//! Memory tracking lets consumers observe reads and writes to arbitrary
//! ranges of guest memory without instrumenting every access. Tracked pages
//! are protected on the host, and the resulting protection faults are routed
//! to whoever subscribed to the faulting range.
//!
//! This crate provides the vocabulary shared by the tracking engine and its
//! collaborators:
//!
//! - [`Va`] and [`Pa`] address types.
//! - [`MemoryProtection`], the protection lattice.
//! - [`Range`], [`NonOverlappingRange`] and [`RangeIndex`], an ordered
//!   container of disjoint ranges with find-or-create tiling.
//! - [`MemoryBlock`] and [`AddressSpace`], the collaborators that apply
//!   protection and translate guest addresses.
//! - [`MappingTable`], a ready-made page-granular [`AddressSpace`].
//! - [`TrackingOptions`] and [`TrackingError`].

mod address;
mod backend;
mod error;
pub(crate) mod macros;
mod mapping;
mod options;
mod protection;
pub mod range;

#[cfg(test)]
mod mapping_tests;

pub use self::{
    address::{Pa, Va},
    backend::{AddressSpace, FaultHandler, MemoryBlock, PhysicalRange, PhysicalRanges},
    error::TrackingError,
    mapping::MappingTable,
    options::TrackingOptions,
    protection::MemoryProtection,
    range::{Address, NonOverlappingRange, Range, RangeIndex, Tiling},
};
