//! Address ranges and the non-overlapping range index.

use std::{
    collections::BTreeMap,
    fmt::{Debug, Display},
    hash::Hash,
    ops::{Add, Sub},
};

use smallvec::SmallVec;

/// An address type usable as a range key.
pub trait Address:
    Debug
    + Display
    + Copy
    + Ord
    + Hash
    + From<u64>
    + Into<u64>
    + Add<u64, Output = Self>
    + Sub<u64, Output = Self>
    + Send
    + Sync
    + 'static
{
    /// Returns the raw address value.
    fn as_u64(self) -> u64 {
        self.into()
    }
}

/// A contiguous range of memory.
pub trait Range {
    /// Address type of the range.
    type Address: Address;

    /// Returns the start address of the range.
    fn address(&self) -> Self::Address;

    /// Returns the size of the range in bytes.
    fn size(&self) -> u64;

    /// Returns the first address past the end of the range.
    fn end_address(&self) -> Self::Address {
        self.address() + self.size()
    }

    /// Checks whether the range intersects `[address, address + size)`.
    fn overlaps_with(&self, address: Self::Address, size: u64) -> bool {
        let start = address.as_u64();
        let end = start.saturating_add(size);

        self.address().as_u64() < end && start < self.end_address().as_u64()
    }
}

/// A range that can live in a [`RangeIndex`].
pub trait NonOverlappingRange: Range {
    /// Splits the range at `split_address`.
    ///
    /// The range shrinks to `[address, split_address)` and the returned range
    /// covers `[split_address, end_address)`. Owners are copied to the new
    /// range, never moved, so references held elsewhere remain valid.
    fn split(&mut self, split_address: Self::Address) -> Self
    where
        Self: Sized;
}

/// Result buffer of overlap queries.
///
/// Sized for the common fan-out, larger results spill to the heap.
pub type Overlaps<A> = SmallVec<[A; 10]>;

/// Result of [`RangeIndex::get_or_add`].
#[derive(Debug)]
pub struct Tiling<A>
where
    A: Address,
{
    /// Keys of the regions covering the requested range, in address order.
    pub regions: SmallVec<[A; 4]>,

    /// Keys of the regions created to fill gaps.
    pub created: SmallVec<[A; 4]>,

    /// Splits performed, as `(low, high)` key pairs.
    ///
    /// The `high` region is new and inherited the owners of `low`.
    pub splits: SmallVec<[(A, A); 2]>,
}

impl<A> Default for Tiling<A>
where
    A: Address,
{
    fn default() -> Self {
        Self {
            regions: SmallVec::new(),
            created: SmallVec::new(),
            splits: SmallVec::new(),
        }
    }
}

/// An ordered container of non-overlapping ranges.
///
/// Ranges are keyed by their start address. Since no two stored ranges
/// overlap, the start address identifies a live range; other structures
/// refer to ranges by this key.
#[derive(Debug)]
pub struct RangeIndex<R>
where
    R: NonOverlappingRange,
{
    items: BTreeMap<R::Address, R>,
}

impl<R> Default for RangeIndex<R>
where
    R: NonOverlappingRange,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<R> RangeIndex<R>
where
    R: NonOverlappingRange,
{
    /// Creates an empty index.
    pub fn new() -> Self {
        Self {
            items: BTreeMap::new(),
        }
    }

    /// Returns the number of stored ranges.
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// Checks whether the index is empty.
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Returns the range starting at `address`.
    pub fn get(&self, address: R::Address) -> Option<&R> {
        self.items.get(&address)
    }

    /// Returns the range starting at `address`.
    pub fn get_mut(&mut self, address: R::Address) -> Option<&mut R> {
        self.items.get_mut(&address)
    }

    /// Returns an iterator over the stored ranges in address order.
    pub fn iter(&self) -> impl Iterator<Item = &R> {
        self.items.values()
    }

    /// Inserts a range.
    ///
    /// # Panics
    ///
    /// Panics if the range is empty or overlaps a stored range.
    pub fn insert(&mut self, item: R) {
        assert!(item.size() != 0, "inserting an empty range");

        let overlaps = self.find_overlaps(item.address(), item.size());
        assert!(
            overlaps.is_empty(),
            "range {}+{:#x} overlaps {:?}",
            item.address(),
            item.size(),
            overlaps
        );

        self.items.insert(item.address(), item);
    }

    /// Removes the range starting at `address`.
    pub fn remove(&mut self, address: R::Address) -> Option<R> {
        self.items.remove(&address)
    }

    /// Returns the keys of all ranges intersecting `[address, address + size)`,
    /// in address order.
    pub fn find_overlaps(&self, address: R::Address, size: u64) -> Overlaps<R::Address> {
        let start = address.as_u64();
        let end = R::Address::from(start.saturating_add(size));

        let mut result = self
            .items
            .range(..end)
            .rev()
            .take_while(|(_, item)| item.end_address().as_u64() > start)
            .map(|(&key, _)| key)
            .collect::<Overlaps<_>>();

        result.reverse();
        result
    }

    /// Same as [`find_overlaps`], for callers with a bounded result buffer.
    ///
    /// # Panics
    ///
    /// Panics if more than `max_results` ranges overlap. Truncating the
    /// result would silently drop notifications.
    ///
    /// [`find_overlaps`]: Self::find_overlaps
    pub fn find_overlaps_bounded(
        &self,
        address: R::Address,
        size: u64,
        max_results: usize,
    ) -> Overlaps<R::Address> {
        let result = self.find_overlaps(address, size);

        assert!(
            result.len() <= max_results,
            "{} ranges overlap {}+{:#x}, result buffer holds {}",
            result.len(),
            address,
            size,
            max_results
        );

        result
    }

    /// Splits the range starting at `address` at `split_address`.
    ///
    /// Returns the key of the new (high) range.
    ///
    /// # Panics
    ///
    /// Panics if there is no range at `address` or `split_address` does not
    /// fall strictly inside it.
    pub fn split(&mut self, address: R::Address, split_address: R::Address) -> R::Address {
        let item = match self.items.get_mut(&address) {
            Some(item) => item,
            None => panic!("no range at {address}"),
        };

        assert!(
            item.address() < split_address && split_address < item.end_address(),
            "split address {split_address} outside of {}..{}",
            item.address(),
            item.end_address()
        );

        let high = item.split(split_address);
        debug_assert_eq!(high.address(), split_address);

        self.items.insert(split_address, high);
        split_address
    }

    /// Returns the ranges exactly tiling `[address, address + size)`.
    ///
    /// Ranges crossing either edge of the requested range are split, and
    /// gaps are filled with ranges produced by `factory`, which receives the
    /// start and size of each gap.
    pub fn get_or_add(
        &mut self,
        address: R::Address,
        size: u64,
        mut factory: impl FnMut(R::Address, u64) -> R,
    ) -> Tiling<R::Address> {
        let start = address.as_u64();
        let end = start + size;

        let mut tiling = Tiling::default();
        let mut cursor = start;

        for mut key in self.find_overlaps(address, size) {
            let (item_start, item_end) = match self.items.get(&key) {
                Some(item) => (item.address().as_u64(), item.end_address().as_u64()),
                None => unreachable!("overlap query returned a missing key"),
            };

            if item_start < start {
                // Take the high half, the low half stays outside of the request.
                let high = self.split(key, address);
                tiling.splits.push((key, high));
                key = high;
            } else if cursor < item_start {
                self.fill(&mut tiling, cursor, item_start - cursor, &mut factory);
            }

            if item_end > end {
                let high = self.split(key, R::Address::from(end));
                tiling.splits.push((key, high));
            }

            tiling.regions.push(key);
            cursor = item_end.min(end);
        }

        if cursor < end {
            self.fill(&mut tiling, cursor, end - cursor, &mut factory);
        }

        tiling
    }

    fn fill(
        &mut self,
        tiling: &mut Tiling<R::Address>,
        address: u64,
        size: u64,
        factory: &mut impl FnMut(R::Address, u64) -> R,
    ) {
        let key = R::Address::from(address);
        let item = factory(key, size);
        debug_assert_eq!(item.address(), key);
        debug_assert_eq!(item.size(), size);

        self.items.insert(key, item);
        tiling.created.push(key);
        tiling.regions.push(key);
    }
}
