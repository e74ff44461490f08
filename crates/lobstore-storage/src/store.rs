//! Block and fragment store
//!
//! The [`Store`] ties a medium, its metadata region, the allocator and the
//! block cache together. Callers address whole blocks by [`BlockId`] and
//! sub-block fragments by [`FragmentAddr`]; every access goes through the
//! cache.

use crate::block::Allocator;
use crate::cache::{BlockCache, BlockGuard, WriteBlock};
use crate::layout::{MetadataRegion, SUPERBLOCK_SIZE, Superblock};
use crate::medium::{FileMedium, Medium, MemoryMedium};
use lobstore_common::{
    BlockId, Error, FragmentAddr, Geometry, Result, StoreConfig, WritePolicy,
};
use parking_lot::Mutex;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Page-oriented store of blocks and fragments
pub struct Store {
    medium: Arc<dyn Medium>,
    geometry: Geometry,
    superblock: Mutex<Superblock>,
    allocator: Allocator,
    cache: BlockCache,
}

impl Store {
    /// Format `medium` as a new store
    ///
    /// The whole medium is used; `config.capacity_blocks` only sizes media
    /// created by [`Store::create_file`] and [`Store::in_memory`].
    pub fn create(medium: Arc<dyn Medium>, config: &StoreConfig) -> Result<Self> {
        let geometry = config.validate()?;
        let total_blocks = medium.size() / geometry.block_size() as u64;
        let superblock = Superblock::new(geometry, total_blocks)?;
        let allocator = Allocator::format(geometry, total_blocks, superblock.meta_blocks);
        let cache = BlockCache::new(
            Arc::clone(&medium),
            geometry,
            config.cache_blocks,
            config.write_policy,
        )?;

        info!(
            medium = %medium.describe(),
            block_size = geometry.block_size(),
            fragment_size = geometry.fragment_size(),
            total_blocks,
            meta_blocks = superblock.meta_blocks,
            "formatting store"
        );

        let store = Self {
            medium,
            geometry,
            superblock: Mutex::new(superblock),
            allocator,
            cache,
        };
        store.write_metadata()?;
        store.medium.sync()?;
        Ok(store)
    }

    /// Open a store previously formatted on `medium`
    ///
    /// Geometry comes from the superblock; only the cache settings of
    /// `config` are used.
    pub fn open(medium: Arc<dyn Medium>, config: &StoreConfig) -> Result<Self> {
        config.validate()?;

        let mut header = [0u8; SUPERBLOCK_SIZE];
        medium.read_at(0, &mut header)?;
        let superblock = Superblock::from_bytes(&header)?;
        superblock.validate()?;
        let geometry = superblock.geometry()?;

        let needed = superblock
            .total_blocks
            .checked_mul(geometry.block_size() as u64)
            .ok_or_else(|| Error::corruption("superblock block count overflows"))?;
        if needed > medium.size() {
            return Err(Error::corruption(format!(
                "superblock describes {needed} bytes but {} holds {}",
                medium.describe(),
                medium.size()
            )));
        }

        let mut region = vec![0u8; superblock.meta_blocks as usize * geometry.block_size()];
        medium.read_at(0, &mut region)?;
        let (block_bits, fragment_bits) = MetadataRegion::decode(&superblock, &region)?;
        let allocator = Allocator::from_bytes(
            geometry,
            superblock.total_blocks,
            superblock.meta_blocks,
            block_bits,
            fragment_bits,
        )?;

        if geometry.block_size() != config.block_size as usize
            || geometry.fragments_per_block() != config.fragments_per_block
        {
            debug!(
                block_size = geometry.block_size(),
                fragments_per_block = geometry.fragments_per_block(),
                "using geometry recorded on the medium"
            );
        }

        let cache = BlockCache::new(
            Arc::clone(&medium),
            geometry,
            config.cache_blocks,
            config.write_policy,
        )?;

        info!(
            medium = %medium.describe(),
            total_blocks = superblock.total_blocks,
            free_blocks = allocator.free_blocks(),
            sync_count = superblock.sync_count,
            "opened store"
        );

        Ok(Self {
            medium,
            geometry,
            superblock: Mutex::new(superblock),
            allocator,
            cache,
        })
    }

    /// Create a store file of `config.capacity_blocks` blocks
    pub fn create_file(path: impl AsRef<Path>, config: &StoreConfig) -> Result<Self> {
        let geometry = config.validate()?;
        let size = config.capacity_blocks * geometry.block_size() as u64;
        let medium = FileMedium::create(path, size)?;
        Self::create(Arc::new(medium), config)
    }

    /// Open an existing store file
    pub fn open_file(path: impl AsRef<Path>, config: &StoreConfig) -> Result<Self> {
        let medium = FileMedium::open(path, false)?;
        Self::open(Arc::new(medium), config)
    }

    /// Create a store on a fresh in-memory medium
    pub fn in_memory(config: &StoreConfig) -> Result<Self> {
        let geometry = config.validate()?;
        let size = usize::try_from(config.capacity_blocks)
            .ok()
            .and_then(|blocks| blocks.checked_mul(geometry.block_size()))
            .ok_or_else(|| {
                Error::configuration(format!(
                    "{} blocks do not fit in memory",
                    config.capacity_blocks
                ))
            })?;
        Self::create(Arc::new(MemoryMedium::new(size)), config)
    }

    /// Store geometry
    #[must_use]
    pub fn geometry(&self) -> Geometry {
        self.geometry
    }

    /// Block size in bytes
    #[must_use]
    pub fn block_size(&self) -> usize {
        self.geometry.block_size()
    }

    /// Fragment size in bytes
    #[must_use]
    pub fn fragment_size(&self) -> usize {
        self.geometry.fragment_size()
    }

    /// The block cache
    #[must_use]
    pub fn cache(&self) -> &BlockCache {
        &self.cache
    }

    /// Copy of the current superblock
    #[must_use]
    pub fn superblock(&self) -> Superblock {
        self.superblock.lock().clone()
    }

    /// Total number of blocks, metadata included
    #[must_use]
    pub fn total_blocks(&self) -> u64 {
        self.allocator.total_blocks()
    }

    /// Number of free blocks
    #[must_use]
    pub fn free_blocks(&self) -> u64 {
        self.allocator.free_blocks()
    }

    /// Number of allocated fragments
    #[must_use]
    pub fn used_fragments(&self) -> u64 {
        self.allocator.used_fragments()
    }

    fn check_block(&self, id: BlockId) -> Result<()> {
        let meta_blocks = self.superblock.lock().meta_blocks;
        if id.get() < meta_blocks || id.get() >= self.total_blocks() {
            return Err(Error::invalid_argument(format!(
                "block {id} is outside the data region {meta_blocks}..{}",
                self.total_blocks()
            )));
        }
        if !self.allocator.is_block_allocated(id) {
            return Err(Error::invalid_argument(format!("block {id} is not allocated")));
        }
        Ok(())
    }

    /// Map a fragment address to its block and byte offset in that block
    fn locate(&self, addr: FragmentAddr) -> Result<(BlockId, usize)> {
        let (block, index) = self.geometry.split(addr)?;
        self.check_block(block)?;
        Ok((block, index as usize * self.fragment_size()))
    }

    fn finish_write(&self, block: WriteBlock<'_>) -> Result<()> {
        match self.cache.policy() {
            WritePolicy::WriteThrough => block.commit(),
            WritePolicy::WriteBack => Ok(()),
        }
    }

    /// Allocate a whole block; it reads as zeros
    pub fn allocate_block(&self) -> Result<BlockId> {
        let id = self.allocator.allocate_block()?;
        let block = match self.cache.acquire_new(id) {
            Ok(block) => block,
            Err(e) => {
                if let Err(undo) = self.allocator.free_block(id) {
                    warn!(block = %id, error = %undo, "failed to roll back block allocation");
                }
                return Err(e);
            }
        };
        self.finish_write(block)?;
        debug!(block = %id, "allocated block");
        Ok(id)
    }

    /// Free a whole block
    ///
    /// A cached copy is written back if dirty and dropped. Fails with
    /// `ConcurrentModification` while the block is held, and with
    /// `InvalidArgument` for a block holding fragments; a failed free
    /// leaves the cache untouched.
    pub fn free_block(&self, id: BlockId) -> Result<()> {
        self.check_block(id)?;
        if self.allocator.holds_fragments(id) {
            return Err(Error::invalid_argument(format!(
                "block {id} holds fragments; free them instead"
            )));
        }
        self.cache.discard(id)?;
        self.allocator.free_block(id)?;
        debug!(block = %id, "freed block");
        Ok(())
    }

    /// Hold a block for reading
    pub fn read_block(&self, id: BlockId) -> Result<BlockGuard> {
        self.check_block(id)?;
        self.cache.acquire(id)
    }

    /// Hold a block for writing
    pub fn write_block(&self, id: BlockId) -> Result<WriteBlock<'_>> {
        self.check_block(id)?;
        self.cache.acquire_write(id)
    }

    /// Allocate a zero-filled fragment
    pub fn allocate_fragment(&self) -> Result<FragmentAddr> {
        let (addr, new_block) = self.allocator.allocate_fragment()?;
        let zeroed = self.locate(addr).and_then(|(block, start)| {
            let mut guard = if new_block {
                self.cache.acquire_new(block)?
            } else {
                self.cache.acquire_write(block)?
            };
            let len = self.fragment_size();
            guard.write(|data| data[start..start + len].fill(0));
            self.finish_write(guard)
        });

        if let Err(e) = zeroed {
            match self.allocator.free_fragment(addr) {
                Ok(Some(block)) => {
                    if let Err(undo) = self.allocator.release_empty_block(block) {
                        warn!(%block, error = %undo, "failed to release fragment block");
                    }
                }
                Ok(None) => {}
                Err(undo) => {
                    warn!(%addr, error = %undo, "failed to roll back fragment allocation");
                }
            }
            return Err(e);
        }

        debug!(%addr, new_block, "allocated fragment");
        Ok(addr)
    }

    /// Free a fragment; an emptied fragment block is freed with it
    pub fn free_fragment(&self, addr: FragmentAddr) -> Result<()> {
        let Some(block) = self.allocator.free_fragment(addr)? else {
            debug!(%addr, "freed fragment");
            return Ok(());
        };

        match self.cache.discard(block) {
            Ok(()) => self.allocator.release_empty_block(block)?,
            Err(e @ Error::ConcurrentModification(_)) => {
                // A reader still holds the block; reuse it for fragments
                warn!(%block, error = %e, "keeping empty fragment block");
                self.allocator.restore_partial(block);
            }
            Err(e) => {
                self.allocator.restore_partial(block);
                return Err(e);
            }
        }
        debug!(%addr, %block, "freed fragment and its block");
        Ok(())
    }

    /// Read bytes from a fragment
    ///
    /// Reads up to `dest.len()` bytes starting `frag_offset` bytes into the
    /// fragment and stops at the fragment end. Returns 0 once `frag_offset`
    /// reaches the end of the fragment.
    pub fn read_fragment(
        &self,
        addr: FragmentAddr,
        frag_offset: usize,
        dest: &mut [u8],
    ) -> Result<usize> {
        let fragment_size = self.fragment_size();
        if frag_offset >= fragment_size || dest.is_empty() {
            return Ok(0);
        }
        let (block, start) = self.locate(addr)?;
        let n = dest.len().min(fragment_size - frag_offset);
        let start = start + frag_offset;

        let guard = self.cache.acquire(block)?;
        guard.read(|data| dest[..n].copy_from_slice(&data[start..start + n]));
        Ok(n)
    }

    /// Read UTF-16 code units from a fragment
    ///
    /// Each unit is two big-endian bytes; `frag_offset` is in bytes.
    /// Returns the number of units read.
    pub fn read_fragment_chars(
        &self,
        addr: FragmentAddr,
        frag_offset: usize,
        dest: &mut [u16],
    ) -> Result<usize> {
        let fragment_size = self.fragment_size();
        if frag_offset >= fragment_size {
            return Ok(0);
        }
        let n = dest.len().min((fragment_size - frag_offset) / 2);
        if n == 0 {
            return Ok(0);
        }
        let (block, start) = self.locate(addr)?;
        let start = start + frag_offset;

        let guard = self.cache.acquire(block)?;
        guard.read(|data| {
            for (unit, pair) in dest[..n]
                .iter_mut()
                .zip(data[start..start + 2 * n].chunks_exact(2))
            {
                *unit = u16::from_be_bytes([pair[0], pair[1]]);
            }
        });
        Ok(n)
    }

    /// Write bytes into a fragment
    ///
    /// Writes up to `src.len()` bytes, stopping at the fragment end, and
    /// returns the number written.
    pub fn write_fragment(&self, addr: FragmentAddr, frag_offset: usize, src: &[u8]) -> Result<usize> {
        let fragment_size = self.fragment_size();
        if frag_offset >= fragment_size || src.is_empty() {
            return Ok(0);
        }
        let (block, start) = self.locate(addr)?;
        let n = src.len().min(fragment_size - frag_offset);
        let start = start + frag_offset;

        let mut guard = self.cache.acquire_write(block)?;
        guard.write(|data| data[start..start + n].copy_from_slice(&src[..n]));
        self.finish_write(guard)?;
        Ok(n)
    }

    /// Write UTF-16 code units into a fragment as big-endian pairs
    pub fn write_fragment_chars(
        &self,
        addr: FragmentAddr,
        frag_offset: usize,
        src: &[u16],
    ) -> Result<usize> {
        let fragment_size = self.fragment_size();
        if frag_offset >= fragment_size {
            return Ok(0);
        }
        let n = src.len().min((fragment_size - frag_offset) / 2);
        if n == 0 {
            return Ok(0);
        }
        let (block, start) = self.locate(addr)?;
        let start = start + frag_offset;

        let mut guard = self.cache.acquire_write(block)?;
        guard.write(|data| {
            for (pair, unit) in data[start..start + 2 * n]
                .chunks_exact_mut(2)
                .zip(&src[..n])
            {
                pair.copy_from_slice(&unit.to_be_bytes());
            }
        });
        self.finish_write(guard)?;
        Ok(n)
    }

    fn write_metadata(&self) -> Result<()> {
        let mut superblock = self.superblock.lock();
        let (block_bits, fragment_bits) = self.allocator.snapshot();
        let region = MetadataRegion::encode(&mut superblock, &block_bits, &fragment_bits);
        if let Err(e) = self.medium.write_at(0, &region) {
            self.allocator.mark_dirty();
            return Err(e);
        }
        Ok(())
    }

    /// Write back dirty blocks, persist the metadata region and sync the
    /// medium
    pub fn sync(&self) -> Result<()> {
        let flushed = self.cache.flush_all()?;
        {
            let mut superblock = self.superblock.lock();
            superblock.sync_count += 1;
        }
        self.write_metadata()?;
        self.medium.sync()?;
        debug!(flushed, "synced store");
        Ok(())
    }
}

impl Drop for Store {
    fn drop(&mut self) {
        if let Err(e) = self.sync() {
            warn!(medium = %self.medium.describe(), error = %e, "failed to sync store on close");
        }
    }
}
