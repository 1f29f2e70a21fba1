use crate::Va;

/// An error that can occur while tracking memory.
#[derive(thiserror::Error, Debug)]
pub enum TrackingError {
    /// The backing memory block or the address space failed.
    #[error(transparent)]
    Block(Box<dyn std::error::Error + Send + Sync>),

    /// The requested range is empty.
    #[error("The requested range is empty.")]
    EmptyRange,

    /// The requested range wraps around the address space.
    #[error("Out of bounds")]
    OutOfBounds,

    /// The address or size is not aligned to the page size.
    #[error("Misaligned range (address: {address:#x}, size: {size:#x})")]
    Misaligned {
        /// Start of the offending range.
        address: u64,

        /// Size of the offending range.
        size: u64,
    },

    /// The granularity is zero or not a multiple of the page size.
    #[error("Invalid granularity {0:#x}")]
    InvalidGranularity(u64),

    /// The queried range lies outside of the tracked range.
    #[error("Range {address}+{size:#x} is not tracked by this handle")]
    RangeNotTracked {
        /// Start of the queried range.
        address: Va,

        /// Size of the queried range.
        size: u64,
    },
}

impl TrackingError {
    /// Wraps an error reported by a collaborator.
    pub fn block(err: impl std::error::Error + Send + Sync + 'static) -> Self {
        Self::Block(Box::new(err))
    }
}
