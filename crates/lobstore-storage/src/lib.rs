//! lobstore Storage Engine - Large-object block store
//!
//! This crate implements the page-oriented store behind BLOB and CLOB
//! columns:
//! - Backing media (files, block devices, memory)
//! - Superblock and allocation bitmaps
//! - Block and fragment allocation
//! - Block caching (clock eviction with write-back or write-through)
//! - Inode addressing of out-of-row objects
//! - Byte and character readers and writers

pub mod block;
pub mod cache;
pub mod inode;
pub mod layout;
pub mod medium;
pub mod store;
pub mod stream;

// Re-exports
pub use block::{Allocator, Bitmap, Block, BlockState};
pub use cache::{BlockCache, BlockGuard, CacheStats, WriteBlock};
pub use inode::{INLINE_SIZE, INODE_DIRECT_SLOTS, INODE_SIZE, Inode, Resolved};
pub use layout::{FORMAT_VERSION, MAGIC, MetadataRegion, SUPERBLOCK_SIZE, Superblock};
pub use medium::{FileMedium, Medium, MemoryMedium};
pub use store::Store;
pub use stream::{BlobReader, BlobWriter, ClobReader, ClobWriter};
