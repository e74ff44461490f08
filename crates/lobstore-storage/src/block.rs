//! Blocks and block allocation
//!
//! This module provides:
//! - The cached [`Block`] with its state tag and holder count
//! - A bitmap with a next-free search hint
//! - The [`Allocator`] handing out whole blocks and fragments

use crate::medium::Medium;
use lobstore_common::{BlockId, Error, FragmentAddr, Geometry, Result};
use parking_lot::{Mutex, RwLock, RwLockWriteGuard};
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicU64, AtomicUsize, Ordering};
use tracing::{debug, error};

/// Lifecycle state of a cached block
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum BlockState {
    /// Contents are being read from the medium
    Loading = 0,
    /// Contents match the medium
    Clean = 1,
    /// Contents were modified and not yet written back
    Dirty = 2,
    /// Contents are being written back
    Flushing = 3,
    /// Block was released and must not be used
    Freed = 4,
    /// Load failed; the next acquire retries
    Invalid = 5,
}

impl BlockState {
    const fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Loading,
            1 => Self::Clean,
            2 => Self::Dirty,
            3 => Self::Flushing,
            4 => Self::Freed,
            _ => Self::Invalid,
        }
    }
}

/// One page of the store, shared by every current holder
///
/// Reads of the buffer run concurrently; a write excludes readers and other
/// writers for the duration of one closure call.
pub struct Block {
    id: BlockId,
    data: RwLock<Box<[u8]>>,
    state: AtomicU8,
    holders: AtomicUsize,
}

impl Block {
    /// Create a block that is about to be filled from the medium
    pub(crate) fn loading(id: BlockId, size: usize) -> Self {
        Self::with_state(id, size, BlockState::Loading)
    }

    /// Create a zero-filled block that has no medium contents yet
    pub(crate) fn zeroed(id: BlockId, size: usize) -> Self {
        Self::with_state(id, size, BlockState::Dirty)
    }

    fn with_state(id: BlockId, size: usize, state: BlockState) -> Self {
        Self {
            id,
            data: RwLock::new(vec![0u8; size].into_boxed_slice()),
            state: AtomicU8::new(state as u8),
            holders: AtomicUsize::new(0),
        }
    }

    /// Page number of this block
    #[must_use]
    pub fn id(&self) -> BlockId {
        self.id
    }

    /// Current state
    #[must_use]
    pub fn state(&self) -> BlockState {
        BlockState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub(crate) fn set_state(&self, state: BlockState) {
        self.state.store(state as u8, Ordering::Release);
    }

    /// Number of live guards on this block
    #[must_use]
    pub fn holders(&self) -> usize {
        self.holders.load(Ordering::Acquire)
    }

    /// Check if the block has unwritten changes
    #[must_use]
    pub fn is_dirty(&self) -> bool {
        matches!(self.state(), BlockState::Dirty | BlockState::Flushing)
    }

    pub(crate) fn hold(&self) {
        self.holders.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn release(&self) {
        let prev = self.holders.fetch_sub(1, Ordering::AcqRel);
        if prev == 0 {
            error!(block = %self.id, "block released more often than held");
            debug_assert!(prev > 0, "holder count underflow on block {}", self.id);
            self.holders.store(0, Ordering::Release);
        }
    }

    /// Run `f` over the block contents
    pub fn read<R>(&self, f: impl FnOnce(&[u8]) -> R) -> R {
        let data = self.data.read();
        f(&data)
    }

    /// Run `f` over the mutable block contents and mark the block dirty
    pub(crate) fn write<R>(&self, f: impl FnOnce(&mut [u8]) -> R) -> R {
        let mut data = self.data.write();
        let out = f(&mut data);
        self.set_state(BlockState::Dirty);
        out
    }

    /// Lock the buffer for an in-flight load
    ///
    /// Other holders block in [`Block::wait_ready`] until the guard is
    /// dropped.
    pub(crate) fn lock_for_load(&self) -> RwLockWriteGuard<'_, Box<[u8]>> {
        self.data.write()
    }

    /// Wait for an in-flight load; false if the load failed
    pub(crate) fn wait_ready(&self) -> bool {
        let _data = self.data.read();
        !matches!(self.state(), BlockState::Invalid | BlockState::Loading)
    }

    /// Write the block back if it is dirty
    ///
    /// Returns whether a write was issued. On failure the block stays dirty.
    pub(crate) fn flush(&self, medium: &dyn Medium, geometry: Geometry) -> Result<bool> {
        // Excludes writers and other flushers but not readers
        let data = self.data.upgradable_read();
        if self
            .state
            .compare_exchange(
                BlockState::Dirty as u8,
                BlockState::Flushing as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_err()
        {
            return Ok(false);
        }

        match medium.write_at(geometry.block_offset(self.id), &data) {
            Ok(()) => {
                self.set_state(BlockState::Clean);
                debug!(block = %self.id, "flushed block");
                Ok(true)
            }
            Err(e) => {
                self.set_state(BlockState::Dirty);
                error!(block = %self.id, error = %e, "failed to flush block");
                Err(e)
            }
        }
    }
}

impl std::fmt::Debug for Block {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Block")
            .field("id", &self.id)
            .field("state", &self.state())
            .field("holders", &self.holders())
            .finish_non_exhaustive()
    }
}

/// Bitmap for tracking allocation
///
/// Uses one bit per unit: 0 = free, 1 = used
pub struct Bitmap {
    /// Bitmap data
    data: RwLock<Vec<u8>>,
    /// Total number of bits
    len: u64,
    /// Number of free bits (cached)
    free: AtomicU64,
    /// Hint for next free bit search
    search_hint: AtomicU64,
}

impl Bitmap {
    /// Create a new bitmap of `len` bits (all free)
    #[must_use]
    pub fn new(len: u64) -> Self {
        Self {
            data: RwLock::new(vec![0u8; len.div_ceil(8) as usize]),
            len,
            free: AtomicU64::new(len),
            search_hint: AtomicU64::new(0),
        }
    }

    /// Load bitmap from bytes
    #[must_use]
    pub fn from_bytes(data: &[u8], len: u64) -> Self {
        let mut bits = vec![0u8; len.div_ceil(8) as usize];
        let copy_len = bits.len().min(data.len());
        bits[..copy_len].copy_from_slice(&data[..copy_len]);

        let free = (0..len).filter(|&bit| !Self::is_set_in_slice(&bits, bit)).count() as u64;

        Self {
            data: RwLock::new(bits),
            len,
            free: AtomicU64::new(free),
            search_hint: AtomicU64::new(0),
        }
    }

    /// Get the bitmap data as bytes
    #[must_use]
    pub fn to_bytes(&self) -> Vec<u8> {
        self.data.read().clone()
    }

    /// Check if a bit is set (out of range bits count as set)
    #[must_use]
    pub fn is_set(&self, bit: u64) -> bool {
        if bit >= self.len {
            return true;
        }
        Self::is_set_in_slice(&self.data.read(), bit)
    }

    fn is_set_in_slice(data: &[u8], bit: u64) -> bool {
        data[(bit / 8) as usize] & (1 << (bit % 8)) != 0
    }

    fn set_in_slice(data: &mut [u8], bit: u64) {
        data[(bit / 8) as usize] |= 1 << (bit % 8);
    }

    fn clear_in_slice(data: &mut [u8], bit: u64) {
        data[(bit / 8) as usize] &= !(1 << (bit % 8));
    }

    /// Mark a bit used; returns false if it already was
    pub fn set(&self, bit: u64) -> bool {
        if bit >= self.len {
            return false;
        }
        let mut data = self.data.write();
        if Self::is_set_in_slice(&data, bit) {
            return false;
        }
        Self::set_in_slice(&mut data, bit);
        self.free.fetch_sub(1, Ordering::Relaxed);
        true
    }

    /// Allocate the first free bit, searching from the hint and wrapping
    pub fn allocate(&self) -> Option<u64> {
        let mut data = self.data.write();
        let hint = self.search_hint.load(Ordering::Relaxed).min(self.len);

        let bit = self
            .find_free_in_range(&data, hint, self.len)
            .or_else(|| self.find_free_in_range(&data, 0, hint))?;

        Self::set_in_slice(&mut data, bit);
        self.free.fetch_sub(1, Ordering::Relaxed);
        self.search_hint.store(bit + 1, Ordering::Relaxed);
        Some(bit)
    }

    /// Allocate the first free bit in `[start, end)` without moving the hint
    pub fn allocate_in(&self, start: u64, end: u64) -> Option<u64> {
        let mut data = self.data.write();
        let bit = self.find_free_in_range(&data, start, end)?;
        Self::set_in_slice(&mut data, bit);
        self.free.fetch_sub(1, Ordering::Relaxed);
        Some(bit)
    }

    fn find_free_in_range(&self, data: &[u8], start: u64, end: u64) -> Option<u64> {
        (start..end.min(self.len)).find(|&bit| !Self::is_set_in_slice(data, bit))
    }

    /// Free a single bit
    pub fn free(&self, bit: u64) -> Result<()> {
        if bit >= self.len {
            return Err(Error::invalid_argument(format!(
                "bit {bit} out of range (max {})",
                self.len
            )));
        }

        let mut data = self.data.write();
        if !Self::is_set_in_slice(&data, bit) {
            return Err(Error::invalid_argument(format!("bit {bit} is not allocated")));
        }

        Self::clear_in_slice(&mut data, bit);
        self.free.fetch_add(1, Ordering::Relaxed);

        // Update hint if this bit is before current hint
        if bit < self.search_hint.load(Ordering::Relaxed) {
            self.search_hint.store(bit, Ordering::Relaxed);
        }

        Ok(())
    }

    /// Count set bits in `[start, end)`
    #[must_use]
    pub fn count_set(&self, start: u64, end: u64) -> u64 {
        let data = self.data.read();
        (start..end.min(self.len))
            .filter(|&bit| Self::is_set_in_slice(&data, bit))
            .count() as u64
    }

    /// Get the number of free bits
    #[must_use]
    pub fn free_count(&self) -> u64 {
        self.free.load(Ordering::Relaxed)
    }

    /// Get the total number of bits
    #[must_use]
    pub fn len(&self) -> u64 {
        self.len
    }

    /// Check if the bitmap has no bits
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

/// Block and fragment allocator
///
/// Whole blocks come from the block bitmap. Fragments are packed into
/// fragment blocks: a block taken from the block bitmap whose fragments are
/// tracked in the fragment bitmap. Fragment blocks with at least one free
/// fragment are kept in a partial set so new fragments fill them first.
pub struct Allocator {
    geometry: Geometry,
    meta_blocks: u64,
    blocks: Bitmap,
    fragments: Bitmap,
    /// Fragment blocks with free fragments; also serializes fragment ops
    partial: Mutex<BTreeSet<u64>>,
    dirty: AtomicBool,
}

impl Allocator {
    /// Create an allocator for a freshly formatted medium
    ///
    /// Blocks `0..meta_blocks` are reserved for the metadata region.
    #[must_use]
    pub fn format(geometry: Geometry, total_blocks: u64, meta_blocks: u64) -> Self {
        let blocks = Bitmap::new(total_blocks);
        for block in 0..meta_blocks {
            blocks.set(block);
        }
        Self {
            geometry,
            meta_blocks,
            blocks,
            fragments: Bitmap::new(total_blocks * u64::from(geometry.fragments_per_block())),
            partial: Mutex::new(BTreeSet::new()),
            dirty: AtomicBool::new(true),
        }
    }

    /// Rebuild an allocator from persisted bitmaps
    pub fn from_bytes(
        geometry: Geometry,
        total_blocks: u64,
        meta_blocks: u64,
        block_bits: &[u8],
        fragment_bits: &[u8],
    ) -> Result<Self> {
        let fpb = u64::from(geometry.fragments_per_block());
        let blocks = Bitmap::from_bytes(block_bits, total_blocks);
        let fragments = Bitmap::from_bytes(fragment_bits, total_blocks * fpb);

        let mut partial = BTreeSet::new();
        for block in 0..total_blocks {
            let used = fragments.count_set(block * fpb, (block + 1) * fpb);
            if used == 0 {
                continue;
            }
            if block < meta_blocks || !blocks.is_set(block) {
                return Err(Error::corruption(format!(
                    "block {block} holds fragments but is not an allocated data block"
                )));
            }
            if used < fpb {
                partial.insert(block);
            }
        }
        if (0..meta_blocks).any(|block| !blocks.is_set(block)) {
            return Err(Error::corruption("metadata block marked free"));
        }

        Ok(Self {
            geometry,
            meta_blocks,
            blocks,
            fragments,
            partial: Mutex::new(partial),
            dirty: AtomicBool::new(false),
        })
    }

    fn fragment_range(&self, block: u64) -> (u64, u64) {
        let fpb = u64::from(self.geometry.fragments_per_block());
        (block * fpb, (block + 1) * fpb)
    }

    fn check_data_block(&self, id: BlockId) -> Result<()> {
        if id.get() < self.meta_blocks || id.get() >= self.blocks.len() {
            return Err(Error::invalid_argument(format!(
                "block {id} is outside the data region {}..{}",
                self.meta_blocks,
                self.blocks.len()
            )));
        }
        Ok(())
    }

    /// Allocate a whole block
    pub fn allocate_block(&self) -> Result<BlockId> {
        let block = self
            .blocks
            .allocate()
            .ok_or_else(|| Error::storage_full("no free blocks"))?;
        self.dirty.store(true, Ordering::Release);
        Ok(BlockId::new(block))
    }

    /// Free a whole block
    pub fn free_block(&self, id: BlockId) -> Result<()> {
        self.check_data_block(id)?;
        let _partial = self.partial.lock();
        if self.holds_fragments(id) {
            return Err(Error::invalid_argument(format!(
                "block {id} holds fragments; free them instead"
            )));
        }
        self.blocks.free(id.get())?;
        self.dirty.store(true, Ordering::Release);
        Ok(())
    }

    /// Check if any fragment of a block is allocated
    #[must_use]
    pub fn holds_fragments(&self, id: BlockId) -> bool {
        let (start, end) = self.fragment_range(id.get());
        self.fragments.count_set(start, end) > 0
    }

    /// Check if a block is allocated
    #[must_use]
    pub fn is_block_allocated(&self, id: BlockId) -> bool {
        self.blocks.is_set(id.get())
    }

    /// Allocate a fragment
    ///
    /// Returns the address and whether a new fragment block was taken.
    pub fn allocate_fragment(&self) -> Result<(FragmentAddr, bool)> {
        let mut partial = self.partial.lock();
        let (block, new_block) = match partial.first() {
            Some(&block) => (block, false),
            None => {
                let block = self
                    .blocks
                    .allocate()
                    .ok_or_else(|| Error::storage_full("no free blocks for fragments"))?;
                (block, true)
            }
        };

        let (start, end) = self.fragment_range(block);
        let Some(bit) = self.fragments.allocate_in(start, end) else {
            partial.remove(&block);
            return Err(Error::corruption(format!(
                "fragment block {block} listed as partial but has no free fragment"
            )));
        };

        if self.fragments.count_set(start, end) == end - start {
            partial.remove(&block);
        } else {
            partial.insert(block);
        }
        self.dirty.store(true, Ordering::Release);

        let addr = self
            .geometry
            .fragment_addr(BlockId::new(block), (bit - start) as u32);
        Ok((addr, new_block))
    }

    /// Free a fragment
    ///
    /// Returns the fragment block if it no longer holds any fragment. That
    /// block stays allocated until [`Allocator::release_empty_block`] or
    /// [`Allocator::restore_partial`] is called.
    pub fn free_fragment(&self, addr: FragmentAddr) -> Result<Option<BlockId>> {
        let (block, index) = self.geometry.split(addr)?;
        self.check_data_block(block)?;

        let mut partial = self.partial.lock();
        let (start, end) = self.fragment_range(block.get());
        self.fragments.free(start + u64::from(index)).map_err(|_| {
            Error::invalid_argument(format!("fragment {addr} is not allocated"))
        })?;
        self.dirty.store(true, Ordering::Release);

        if self.fragments.count_set(start, end) == 0 {
            partial.remove(&block.get());
            Ok(Some(block))
        } else {
            partial.insert(block.get());
            Ok(None)
        }
    }

    /// Check if a fragment is allocated
    #[must_use]
    pub fn is_fragment_allocated(&self, addr: FragmentAddr) -> bool {
        self.geometry.split(addr).is_ok_and(|(block, index)| {
            let (start, _) = self.fragment_range(block.get());
            self.fragments.is_set(start + u64::from(index))
        })
    }

    /// Return an emptied fragment block to the block pool
    pub fn release_empty_block(&self, id: BlockId) -> Result<()> {
        let _partial = self.partial.lock();
        self.blocks.free(id.get())?;
        self.dirty.store(true, Ordering::Release);
        Ok(())
    }

    /// Keep an emptied fragment block for future fragments
    pub fn restore_partial(&self, id: BlockId) {
        self.partial.lock().insert(id.get());
    }

    /// Number of free blocks
    #[must_use]
    pub fn free_blocks(&self) -> u64 {
        self.blocks.free_count()
    }

    /// Number of allocated fragments
    #[must_use]
    pub fn used_fragments(&self) -> u64 {
        self.fragments.len() - self.fragments.free_count()
    }

    /// Total number of blocks, metadata included
    #[must_use]
    pub fn total_blocks(&self) -> u64 {
        self.blocks.len()
    }

    /// Check if the bitmaps changed since the last [`Allocator::snapshot`]
    #[must_use]
    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::Acquire)
    }

    /// Copy both bitmaps and clear the dirty flag
    pub fn snapshot(&self) -> (Vec<u8>, Vec<u8>) {
        let _partial = self.partial.lock();
        self.dirty.store(false, Ordering::Release);
        (self.blocks.to_bytes(), self.fragments.to_bytes())
    }

    /// Mark the bitmaps as needing a write
    pub fn mark_dirty(&self) {
        self.dirty.store(true, Ordering::Release);
    }
}
