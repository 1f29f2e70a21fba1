use serde::{Deserialize, Serialize};

bitflags::bitflags! {
    /// Page protection applied to tracked memory.
    ///
    /// Protection levels form a lattice under bitwise AND: combining the
    /// requirements of several observers yields the weakest protection that
    /// still lets every observer receive the traps it asked for.
    /// [`MemoryProtection::NONE`] is the absorbing element.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub struct MemoryProtection: u8 {
        /// Read permission.
        const R = 0b00000001;

        /// Write permission.
        const W = 0b00000010;

        /// Combined Read and Write permissions.
        const RW = Self::R.bits() | Self::W.bits();
    }
}

impl MemoryProtection {
    /// No access. Every read and write traps.
    pub const NONE: Self = Self::empty();

    /// Combines the protection requirements of a set of observers.
    ///
    /// Starts from [`MemoryProtection::RW`] and stops as soon as the result
    /// reaches [`MemoryProtection::NONE`].
    pub fn combine(iter: impl IntoIterator<Item = Self>) -> Self {
        let mut result = Self::RW;

        for protection in iter {
            result &= protection;

            if result.is_empty() {
                break;
            }
        }

        result
    }
}

impl Default for MemoryProtection {
    fn default() -> Self {
        Self::RW
    }
}

impl std::fmt::Display for MemoryProtection {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        let mut result = [b'-'; 2];

        if self.contains(MemoryProtection::R) {
            result[0] = b'r';
        }
        if self.contains(MemoryProtection::W) {
            result[1] = b'w';
        }

        // SAFETY: The `result` array is always valid UTF-8.
        f.write_str(unsafe { std::str::from_utf8_unchecked(&result) })
    }
}
