use serde::{Deserialize, Serialize};

/// Tracking configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackingOptions {
    /// The size of a page in bytes. Must be a power of two.
    ///
    /// Tracked ranges are expanded to page boundaries.
    pub page_size: u64,

    /// The number of bytes assumed to be touched by a faulting access.
    pub fault_access_size: u64,

    /// The maximum number of physical regions a single fault may touch.
    ///
    /// Exceeding this bound is a logic error.
    pub max_fault_overlaps: usize,
}

impl TrackingOptions {
    /// Default page size.
    pub const DEFAULT_PAGE_SIZE: u64 = 0x1000;

    /// Default access size of a fault.
    pub const DEFAULT_FAULT_ACCESS_SIZE: u64 = 8;

    /// Default bound on physical regions touched by a fault.
    pub const DEFAULT_MAX_FAULT_OVERLAPS: usize = 10;

    /// Sets the page size.
    pub fn with_page_size(self, page_size: u64) -> Self {
        Self { page_size, ..self }
    }

    /// Sets the access size of a fault.
    pub fn with_fault_access_size(self, fault_access_size: u64) -> Self {
        Self {
            fault_access_size,
            ..self
        }
    }

    /// Sets the bound on physical regions touched by a fault.
    pub fn with_max_fault_overlaps(self, max_fault_overlaps: usize) -> Self {
        Self {
            max_fault_overlaps,
            ..self
        }
    }

    /// Returns the mask of the in-page offset bits.
    pub fn page_mask(&self) -> u64 {
        self.page_size - 1
    }
}

impl Default for TrackingOptions {
    fn default() -> Self {
        Self {
            page_size: Self::DEFAULT_PAGE_SIZE,
            fault_access_size: Self::DEFAULT_FAULT_ACCESS_SIZE,
            max_fault_overlaps: Self::DEFAULT_MAX_FAULT_OVERLAPS,
        }
    }
}
