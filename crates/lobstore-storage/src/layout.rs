//! Medium layout definitions
//!
//! Medium Layout:
//! ```text
//! +------------------+  Block 0 (offset 0)
//! |   Superblock     |  256 bytes - magic, version, geometry, checksums
//! |  Block Bitmap    |  1 bit per block, metadata blocks marked used
//! | Fragment Bitmap  |  1 bit per fragment
//! +------------------+  Block `meta_blocks`
//! |   Data Blocks    |  Whole blocks and fragment blocks
//! +------------------+
//! ```
//!
//! The metadata region is padded to a whole number of blocks. Since block 0
//! always belongs to it, no fragment is ever placed at address zero.

use bytes::{Buf, BufMut, BytesMut};
use lobstore_common::{Error, Geometry, Result};

/// Magic number for the lobstore medium format
pub const MAGIC: [u8; 8] = *b"LOBSTORE";

/// Current format version
pub const FORMAT_VERSION: u32 = 1;

/// Superblock size (256 bytes)
pub const SUPERBLOCK_SIZE: usize = 256;

/// Superblock stored at the beginning of the medium
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Superblock {
    /// Magic number for format identification
    pub magic: [u8; 8],
    /// Format version
    pub version: u32,
    /// Block size in bytes
    pub block_size: u32,
    /// Fragments per block
    pub fragments_per_block: u32,
    /// Total number of blocks, metadata included
    pub total_blocks: u64,
    /// Number of blocks used by the metadata region
    pub meta_blocks: u64,
    /// Creation timestamp (Unix epoch)
    pub created_at: u64,
    /// Number of completed syncs
    pub sync_count: u64,
    /// CRC32C of both allocation bitmaps
    pub bitmap_checksum: u32,
    /// Checksum of superblock (excluding this field)
    pub checksum: u32,
}

impl Superblock {
    /// Offset of the checksum field within the superblock:
    /// magic(8) + version(4) + block_size(4) + fragments_per_block(4) +
    /// total_blocks(8) + meta_blocks(8) + created_at(8) + sync_count(8) +
    /// bitmap_checksum(4) = 56
    const CHECKSUM_OFFSET: usize = 56;

    /// Create a new superblock for a medium of `total_blocks` blocks
    pub fn new(geometry: Geometry, total_blocks: u64) -> Result<Self> {
        let meta_blocks = MetadataRegion::blocks_needed(geometry, total_blocks);
        if total_blocks <= meta_blocks {
            return Err(Error::invalid_argument(format!(
                "{total_blocks} blocks leave no room for data after {meta_blocks} metadata blocks"
            )));
        }

        let now = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();

        let mut sb = Self {
            magic: MAGIC,
            version: FORMAT_VERSION,
            block_size: geometry.block_size() as u32,
            fragments_per_block: geometry.fragments_per_block(),
            total_blocks,
            meta_blocks,
            created_at: now,
            sync_count: 0,
            bitmap_checksum: 0,
            checksum: 0,
        };
        sb.update_checksum();
        Ok(sb)
    }

    /// Geometry recorded in the superblock
    pub fn geometry(&self) -> Result<Geometry> {
        Geometry::new(self.block_size, self.fragments_per_block)
            .map_err(|e| Error::corruption(format!("superblock geometry: {e}")))
    }

    /// Serialize superblock to bytes
    pub fn to_bytes(&self) -> [u8; SUPERBLOCK_SIZE] {
        let mut buf = BytesMut::with_capacity(SUPERBLOCK_SIZE);

        buf.put_slice(&self.magic);
        buf.put_u32_le(self.version);
        buf.put_u32_le(self.block_size);
        buf.put_u32_le(self.fragments_per_block);
        buf.put_u64_le(self.total_blocks);
        buf.put_u64_le(self.meta_blocks);
        buf.put_u64_le(self.created_at);
        buf.put_u64_le(self.sync_count);
        buf.put_u32_le(self.bitmap_checksum);
        buf.put_u32_le(self.checksum);

        // Pad to SUPERBLOCK_SIZE
        buf.resize(SUPERBLOCK_SIZE, 0);

        let mut out = [0u8; SUPERBLOCK_SIZE];
        out.copy_from_slice(&buf);
        out
    }

    /// Parse superblock from bytes
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        if data.len() < SUPERBLOCK_SIZE {
            return Err(Error::corruption("superblock too small"));
        }

        let mut buf = data;

        let mut magic = [0u8; 8];
        buf.copy_to_slice(&mut magic);
        if magic != MAGIC {
            return Err(Error::corruption("invalid superblock magic"));
        }

        let version = buf.get_u32_le();
        if version != FORMAT_VERSION {
            return Err(Error::corruption(format!(
                "unsupported format version: {version}"
            )));
        }

        let sb = Self {
            magic,
            version,
            block_size: buf.get_u32_le(),
            fragments_per_block: buf.get_u32_le(),
            total_blocks: buf.get_u64_le(),
            meta_blocks: buf.get_u64_le(),
            created_at: buf.get_u64_le(),
            sync_count: buf.get_u64_le(),
            bitmap_checksum: buf.get_u32_le(),
            checksum: buf.get_u32_le(),
        };

        if sb.compute_checksum() != sb.checksum {
            return Err(Error::corruption("superblock checksum mismatch"));
        }

        Ok(sb)
    }

    /// Compute checksum of superblock (CRC32C)
    fn compute_checksum(&self) -> u32 {
        let bytes = self.to_bytes();
        crc32c::crc32c(&bytes[..Self::CHECKSUM_OFFSET])
    }

    /// Update the checksum field after modifying other fields
    pub fn update_checksum(&mut self) {
        self.checksum = self.compute_checksum();
    }

    /// Validate superblock consistency
    pub fn validate(&self) -> Result<()> {
        let geometry = self.geometry()?;
        if self
            .total_blocks
            .checked_mul(geometry.block_size() as u64)
            .is_none()
        {
            return Err(Error::corruption(format!(
                "{} blocks of {} bytes overflow a 64-bit medium size",
                self.total_blocks,
                geometry.block_size()
            )));
        }
        if self.meta_blocks != MetadataRegion::blocks_needed(geometry, self.total_blocks) {
            return Err(Error::corruption(format!(
                "metadata region of {} blocks does not match {} total blocks",
                self.meta_blocks, self.total_blocks
            )));
        }
        if self.total_blocks <= self.meta_blocks {
            return Err(Error::corruption("no data blocks"));
        }
        Ok(())
    }
}

/// Encoded metadata region: superblock plus both allocation bitmaps
pub struct MetadataRegion;

impl MetadataRegion {
    /// Bytes needed for the block bitmap
    #[must_use]
    pub fn block_bitmap_len(total_blocks: u64) -> usize {
        total_blocks.div_ceil(8) as usize
    }

    /// Bytes needed for the fragment bitmap
    #[must_use]
    pub fn fragment_bitmap_len(geometry: Geometry, total_blocks: u64) -> usize {
        total_blocks
            .saturating_mul(u64::from(geometry.fragments_per_block()))
            .div_ceil(8) as usize
    }

    /// Number of blocks reserved for the metadata region
    #[must_use]
    pub fn blocks_needed(geometry: Geometry, total_blocks: u64) -> u64 {
        let bytes = SUPERBLOCK_SIZE
            + Self::block_bitmap_len(total_blocks)
            + Self::fragment_bitmap_len(geometry, total_blocks);
        (bytes as u64).div_ceil(geometry.block_size() as u64)
    }

    /// Encode the region, refreshing the bitmap checksum in `sb`
    pub fn encode(sb: &mut Superblock, block_bits: &[u8], fragment_bits: &[u8]) -> Vec<u8> {
        let mut hasher = crc32c::crc32c(block_bits);
        hasher = crc32c::crc32c_append(hasher, fragment_bits);
        sb.bitmap_checksum = hasher;
        sb.update_checksum();

        let len = (sb.meta_blocks * u64::from(sb.block_size)) as usize;
        let mut region = Vec::with_capacity(len);
        region.extend_from_slice(&sb.to_bytes());
        region.extend_from_slice(block_bits);
        region.extend_from_slice(fragment_bits);
        region.resize(len, 0);
        region
    }

    /// Split a region read from the medium into its bitmaps
    ///
    /// `region` must start with the superblock `sb` was parsed from.
    pub fn decode<'a>(sb: &Superblock, region: &'a [u8]) -> Result<(&'a [u8], &'a [u8])> {
        let geometry = sb.geometry()?;
        let block_len = Self::block_bitmap_len(sb.total_blocks);
        let fragment_len = Self::fragment_bitmap_len(geometry, sb.total_blocks);
        let end = SUPERBLOCK_SIZE + block_len + fragment_len;
        if region.len() < end {
            return Err(Error::corruption("metadata region truncated"));
        }

        let block_bits = &region[SUPERBLOCK_SIZE..SUPERBLOCK_SIZE + block_len];
        let fragment_bits = &region[SUPERBLOCK_SIZE + block_len..end];

        let checksum = crc32c::crc32c_append(crc32c::crc32c(block_bits), fragment_bits);
        if checksum != sb.bitmap_checksum {
            return Err(Error::corruption(format!(
                "allocation bitmap checksum mismatch: computed={checksum:08x}, stored={:08x}",
                sb.bitmap_checksum
            )));
        }

        Ok((block_bits, fragment_bits))
    }
}
