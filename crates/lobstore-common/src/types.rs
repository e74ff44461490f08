//! Core type definitions for lobstore
//!
//! Block identifiers, fragment addresses and the store geometry that maps
//! one onto the other.

use crate::error::{Error, Result};
use derive_more::{Display, From, Into};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Smallest accepted block size (1 KiB)
pub const MIN_BLOCK_SIZE: u32 = 1024;

/// Largest accepted block size (1 MiB)
pub const MAX_BLOCK_SIZE: u32 = 1024 * 1024;

/// Largest number of fragments a single block may be split into
pub const MAX_FRAGMENTS_PER_BLOCK: u32 = 64;

/// Page number of a fixed-size block on the backing medium
#[derive(
    Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, From, Into, Display,
)]
#[display("{_0}")]
pub struct BlockId(u64);

impl BlockId {
    /// Create a block id from a raw page number
    #[must_use]
    pub const fn new(page: u64) -> Self {
        Self(page)
    }

    /// Get the raw page number
    #[must_use]
    pub const fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Debug for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BlockId({})", self.0)
    }
}

/// Opaque 64-bit fragment address
///
/// Encodes the byte position of the fragment on the medium, so it is always
/// a multiple of the fragment size. Zero is reserved for "unallocated".
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, From, Into, Default)]
pub struct FragmentAddr(u64);

impl FragmentAddr {
    /// The unallocated address
    pub const NULL: Self = Self(0);

    /// Wrap a raw address as stored in an inode slot
    #[must_use]
    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    /// Get the raw address
    #[must_use]
    pub const fn raw(self) -> u64 {
        self.0
    }

    /// Check whether this is the unallocated address
    #[must_use]
    pub const fn is_null(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Debug for FragmentAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FragmentAddr({:#x})", self.0)
    }
}

impl fmt::Display for FragmentAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// Fixed block/fragment geometry of a store
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Geometry {
    block_size: u32,
    fragments_per_block: u32,
}

impl Geometry {
    /// Validate and build a geometry
    ///
    /// Both values must be powers of two, the block size must lie within
    /// [`MIN_BLOCK_SIZE`, `MAX_BLOCK_SIZE`] and a block may hold at most
    /// [`MAX_FRAGMENTS_PER_BLOCK`] fragments.
    pub fn new(block_size: u32, fragments_per_block: u32) -> Result<Self> {
        if !block_size.is_power_of_two() || !(MIN_BLOCK_SIZE..=MAX_BLOCK_SIZE).contains(&block_size)
        {
            return Err(Error::invalid_argument(format!(
                "block size {block_size} must be a power of two between {MIN_BLOCK_SIZE} and {MAX_BLOCK_SIZE}"
            )));
        }
        if !fragments_per_block.is_power_of_two() || fragments_per_block > MAX_FRAGMENTS_PER_BLOCK {
            return Err(Error::invalid_argument(format!(
                "fragments per block {fragments_per_block} must be a power of two no larger than {MAX_FRAGMENTS_PER_BLOCK}"
            )));
        }
        Ok(Self {
            block_size,
            fragments_per_block,
        })
    }

    /// Block size in bytes
    #[must_use]
    pub const fn block_size(&self) -> usize {
        self.block_size as usize
    }

    /// Number of fragments per block
    #[must_use]
    pub const fn fragments_per_block(&self) -> u32 {
        self.fragments_per_block
    }

    /// Fragment size in bytes
    #[must_use]
    pub const fn fragment_size(&self) -> usize {
        (self.block_size / self.fragments_per_block) as usize
    }

    /// Byte offset of a block on the medium
    #[must_use]
    pub const fn block_offset(&self, block: BlockId) -> u64 {
        block.get() * self.block_size as u64
    }

    /// Address of fragment `index` inside `block`
    #[must_use]
    pub const fn fragment_addr(&self, block: BlockId, index: u32) -> FragmentAddr {
        FragmentAddr(self.block_offset(block) + index as u64 * self.fragment_size() as u64)
    }

    /// Split a fragment address into its block and in-block fragment index
    pub fn split(&self, addr: FragmentAddr) -> Result<(BlockId, u32)> {
        let fragment_size = self.fragment_size() as u64;
        if addr.is_null() || addr.raw() % fragment_size != 0 {
            return Err(Error::invalid_argument(format!(
                "fragment address {addr} is not a multiple of fragment size {fragment_size}"
            )));
        }
        let block = BlockId(addr.raw() / u64::from(self.block_size));
        let index = (addr.raw() % u64::from(self.block_size)) / fragment_size;
        Ok((block, index as u32))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_geometry_validation() {
        assert!(Geometry::new(8192, 8).is_ok());
        assert!(Geometry::new(8000, 8).is_err());
        assert!(Geometry::new(512, 1).is_err());
        assert!(Geometry::new(8192, 3).is_err());
        assert!(Geometry::new(8192, 128).is_err());
    }

    #[test]
    fn test_fragment_addressing() {
        let geometry = Geometry::new(8192, 8).unwrap();
        assert_eq!(geometry.fragment_size(), 1024);

        let addr = geometry.fragment_addr(BlockId::new(3), 5);
        assert_eq!(addr.raw(), 3 * 8192 + 5 * 1024);
        assert_eq!(geometry.split(addr).unwrap(), (BlockId::new(3), 5));
    }

    #[test]
    fn test_split_rejects_bad_addresses() {
        let geometry = Geometry::new(8192, 8).unwrap();
        assert!(geometry.split(FragmentAddr::NULL).is_err());
        assert!(geometry.split(FragmentAddr::from_raw(8192 + 10)).is_err());
    }
}
