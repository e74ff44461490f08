//! Block cache for the store
//!
//! Fixed-capacity cache of [`Block`]s with clock (second-chance) eviction.
//! Every cached block sits in a slot of a ring; a slot's reference bit is
//! set on each access and cleared as the hand passes. Blocks with live
//! guards are never evicted, and dirty victims are written back before
//! their slot is reused.

use crate::block::{Block, BlockState};
use crate::medium::Medium;
use lobstore_common::{BlockId, Error, Geometry, Result, WritePolicy};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, trace, warn};

/// Cache statistics for monitoring
#[derive(Debug, Default)]
pub struct CacheStats {
    /// Number of cache hits
    pub hits: AtomicU64,
    /// Number of cache misses
    pub misses: AtomicU64,
    /// Number of blocks evicted
    pub evictions: AtomicU64,
    /// Number of dirty blocks written back to the medium
    pub writebacks: AtomicU64,
}

impl CacheStats {
    /// Calculate hit ratio (0.0 to 1.0)
    #[must_use]
    pub fn hit_ratio(&self) -> f64 {
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let total = hits + misses;
        if total == 0 {
            return 0.0;
        }
        hits as f64 / total as f64
    }

    /// Reset all statistics
    pub fn reset(&self) {
        self.hits.store(0, Ordering::Relaxed);
        self.misses.store(0, Ordering::Relaxed);
        self.evictions.store(0, Ordering::Relaxed);
        self.writebacks.store(0, Ordering::Relaxed);
    }
}

struct Slot {
    block: Arc<Block>,
    referenced: bool,
}

struct CacheInner {
    ring: Vec<Option<Slot>>,
    index: HashMap<BlockId, usize>,
    hand: usize,
}

impl CacheInner {
    /// Find a cached block, mark it referenced and take a hold on it
    fn hold(&mut self, id: BlockId) -> Option<Arc<Block>> {
        let idx = *self.index.get(&id)?;
        let slot = self.ring[idx].as_mut()?;
        slot.referenced = true;
        slot.block.hold();
        Some(Arc::clone(&slot.block))
    }

    fn install(&mut self, idx: usize, block: Arc<Block>) {
        self.index.insert(block.id(), idx);
        self.ring[idx] = Some(Slot {
            block,
            referenced: true,
        });
    }

    fn remove(&mut self, idx: usize) -> Option<Arc<Block>> {
        let slot = self.ring[idx].take()?;
        self.index.remove(&slot.block.id());
        Some(slot.block)
    }

    /// Remove `block` if it is still the instance cached under its id
    fn remove_if_same(&mut self, block: &Arc<Block>) {
        if let Some(&idx) = self.index.get(&block.id())
            && self.ring[idx]
                .as_ref()
                .is_some_and(|slot| Arc::ptr_eq(&slot.block, block))
        {
            self.remove(idx);
        }
    }
}

/// Clock-evicting block cache over a medium
pub struct BlockCache {
    inner: Mutex<CacheInner>,
    medium: Arc<dyn Medium>,
    geometry: Geometry,
    capacity: usize,
    policy: WritePolicy,
    stats: CacheStats,
}

impl BlockCache {
    /// Create a cache holding at most `capacity` blocks
    pub fn new(
        medium: Arc<dyn Medium>,
        geometry: Geometry,
        capacity: usize,
        policy: WritePolicy,
    ) -> Result<Self> {
        if capacity == 0 {
            return Err(Error::configuration("block cache capacity must be positive"));
        }
        let mut ring = Vec::with_capacity(capacity);
        ring.resize_with(capacity, || None);

        Ok(Self {
            inner: Mutex::new(CacheInner {
                ring,
                index: HashMap::with_capacity(capacity),
                hand: 0,
            }),
            medium,
            geometry,
            capacity,
            policy,
            stats: CacheStats::default(),
        })
    }

    /// Get the write policy
    #[must_use]
    pub fn policy(&self) -> WritePolicy {
        self.policy
    }

    /// Get cache statistics
    #[must_use]
    pub fn stats(&self) -> &CacheStats {
        &self.stats
    }

    /// Maximum number of cached blocks
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Get the current number of cached blocks
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.lock().index.len()
    }

    /// Check if the cache is empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.lock().index.is_empty()
    }

    /// Check if a block is cached
    #[must_use]
    pub fn contains(&self, id: BlockId) -> bool {
        self.inner.lock().index.contains_key(&id)
    }

    /// Current number of dirty blocks
    #[must_use]
    pub fn dirty_count(&self) -> usize {
        self.inner
            .lock()
            .ring
            .iter()
            .flatten()
            .filter(|slot| slot.block.is_dirty())
            .count()
    }

    /// Get a held block, loading it from the medium on a miss
    ///
    /// Concurrent callers for the same id share one instance; a caller that
    /// races an in-flight load waits for it, and a failed load is retried by
    /// the next caller.
    pub fn acquire(&self, id: BlockId) -> Result<BlockGuard> {
        loop {
            let mut inner = self.inner.lock();

            if let Some(block) = inner.hold(id) {
                drop(inner);
                self.stats.hits.fetch_add(1, Ordering::Relaxed);
                let guard = BlockGuard { block };
                if guard.block.wait_ready() {
                    return Ok(guard);
                }
                trace!(block = %id, "retrying failed load");
                continue;
            }

            self.stats.misses.fetch_add(1, Ordering::Relaxed);
            let idx = self.claim_slot(&mut inner)?;
            let block = Arc::new(Block::loading(id, self.geometry.block_size()));
            block.hold();
            let guard = BlockGuard {
                block: Arc::clone(&block),
            };
            let mut data = block.lock_for_load();
            inner.install(idx, Arc::clone(&block));
            drop(inner);

            let offset = self.geometry.block_offset(id);
            return match self.medium.read_at(offset, &mut data) {
                Ok(()) => {
                    block.set_state(BlockState::Clean);
                    trace!(block = %id, "loaded block");
                    Ok(guard)
                }
                Err(e) => {
                    block.set_state(BlockState::Invalid);
                    self.inner.lock().remove_if_same(&block);
                    drop(data);
                    warn!(block = %id, error = %e, "failed to load block");
                    Err(e)
                }
            };
        }
    }

    /// Get a writable block
    pub fn acquire_write(&self, id: BlockId) -> Result<WriteBlock<'_>> {
        let guard = self.acquire(id)?;
        Ok(WriteBlock { cache: self, guard })
    }

    /// Install a freshly allocated block as zeros without reading the medium
    pub fn acquire_new(&self, id: BlockId) -> Result<WriteBlock<'_>> {
        let mut inner = self.inner.lock();

        let guard = if let Some(block) = inner.hold(id) {
            drop(inner);
            let guard = BlockGuard { block };
            // A load may still be in flight for a stale copy
            guard.block.wait_ready();
            guard.block.write(|data| data.fill(0));
            guard
        } else {
            let idx = self.claim_slot(&mut inner)?;
            let block = Arc::new(Block::zeroed(id, self.geometry.block_size()));
            block.hold();
            inner.install(idx, Arc::clone(&block));
            BlockGuard { block }
        };

        Ok(WriteBlock { cache: self, guard })
    }

    /// Pick a slot for a new block, evicting a victim if the ring is full
    fn claim_slot(&self, inner: &mut CacheInner) -> Result<usize> {
        if let Some(idx) = inner.ring.iter().position(Option::is_none) {
            return Ok(idx);
        }

        let len = inner.ring.len();
        // Two passes: the first may only clear reference bits
        for _ in 0..2 * len {
            let idx = inner.hand;
            inner.hand = (idx + 1) % len;

            let Some(slot) = inner.ring[idx].as_mut() else {
                return Ok(idx);
            };
            if slot.block.holders() > 0 {
                continue;
            }
            if slot.referenced {
                slot.referenced = false;
                continue;
            }

            let victim = Arc::clone(&slot.block);
            if victim.is_dirty() {
                self.flush_block(&victim)?;
            }
            inner.remove(idx);
            self.stats.evictions.fetch_add(1, Ordering::Relaxed);
            trace!(block = %victim.id(), "evicted block");
            return Ok(idx);
        }

        warn!(capacity = self.capacity, "every cached block is held");
        Err(Error::CacheExhausted {
            capacity: self.capacity,
        })
    }

    /// Write back one block if dirty
    fn flush_block(&self, block: &Block) -> Result<bool> {
        let flushed = block.flush(self.medium.as_ref(), self.geometry)?;
        if flushed {
            self.stats.writebacks.fetch_add(1, Ordering::Relaxed);
        }
        Ok(flushed)
    }

    /// Evict a block, writing it back first if dirty
    ///
    /// Returns false if the block is not cached or is held.
    pub fn evict(&self, id: BlockId) -> Result<bool> {
        let mut inner = self.inner.lock();
        let Some(&idx) = inner.index.get(&id) else {
            return Ok(false);
        };
        let Some(block) = inner.ring[idx].as_ref().map(|slot| Arc::clone(&slot.block)) else {
            return Ok(false);
        };
        if block.holders() > 0 {
            return Ok(false);
        }
        if block.is_dirty() {
            self.flush_block(&block)?;
        }
        inner.remove(idx);
        self.stats.evictions.fetch_add(1, Ordering::Relaxed);
        Ok(true)
    }

    /// Drop a block that is being freed
    ///
    /// A dirty block is written back first. Fails with
    /// `ConcurrentModification` while any guard on the block is alive.
    pub fn discard(&self, id: BlockId) -> Result<()> {
        let mut inner = self.inner.lock();
        let Some(&idx) = inner.index.get(&id) else {
            return Ok(());
        };
        let Some(block) = inner.ring[idx].as_ref().map(|slot| Arc::clone(&slot.block)) else {
            return Ok(());
        };
        let holders = block.holders();
        if holders > 0 {
            return Err(Error::concurrent_modification(format!(
                "block {id} freed while {holders} holders remain"
            )));
        }
        if block.is_dirty() {
            self.flush_block(&block)?;
        }
        block.set_state(BlockState::Freed);
        inner.remove(idx);
        debug!(block = %id, "discarded block");
        Ok(())
    }

    /// Write back every dirty block
    ///
    /// All dirty blocks are attempted; the first error is returned.
    pub fn flush_all(&self) -> Result<usize> {
        let dirty: Vec<BlockGuard> = {
            let inner = self.inner.lock();
            inner
                .ring
                .iter()
                .flatten()
                .filter(|slot| slot.block.is_dirty())
                .map(|slot| {
                    slot.block.hold();
                    BlockGuard {
                        block: Arc::clone(&slot.block),
                    }
                })
                .collect()
        };

        let mut flushed = 0;
        let mut first_error = None;
        for guard in dirty {
            match self.flush_block(&guard.block) {
                Ok(true) => flushed += 1,
                Ok(false) => {}
                Err(e) => {
                    first_error.get_or_insert(e);
                }
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => {
                debug!(flushed, "flushed dirty blocks");
                Ok(flushed)
            }
        }
    }
}

/// Shared hold on a cached block
///
/// The block cannot be evicted while the guard lives. Dropping the guard
/// releases the hold.
pub struct BlockGuard {
    block: Arc<Block>,
}

impl BlockGuard {
    /// Page number of the held block
    #[must_use]
    pub fn id(&self) -> BlockId {
        self.block.id()
    }

    /// Current state of the held block
    #[must_use]
    pub fn state(&self) -> BlockState {
        self.block.state()
    }

    /// The held block
    #[must_use]
    pub fn block(&self) -> &Block {
        &self.block
    }

    /// Run `f` over the block contents
    pub fn read<R>(&self, f: impl FnOnce(&[u8]) -> R) -> R {
        self.block.read(f)
    }
}

impl Drop for BlockGuard {
    fn drop(&mut self) {
        self.block.release();
    }
}

impl std::fmt::Debug for BlockGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("BlockGuard").field(&*self.block).finish()
    }
}

/// Write-capable hold on a cached block
///
/// Every write marks the block dirty. [`WriteBlock::commit`] writes the
/// block back and releases it; dropping without commit leaves the block
/// dirty for later write-back.
pub struct WriteBlock<'a> {
    cache: &'a BlockCache,
    guard: BlockGuard,
}

impl WriteBlock<'_> {
    /// Page number of the held block
    #[must_use]
    pub fn id(&self) -> BlockId {
        self.guard.id()
    }

    /// Current state of the held block
    #[must_use]
    pub fn state(&self) -> BlockState {
        self.guard.state()
    }

    /// Run `f` over the block contents
    pub fn read<R>(&self, f: impl FnOnce(&[u8]) -> R) -> R {
        self.guard.read(f)
    }

    /// Run `f` over the mutable block contents, marking the block dirty
    pub fn write<R>(&mut self, f: impl FnOnce(&mut [u8]) -> R) -> R {
        self.guard.block.write(f)
    }

    /// Write the block back and release it
    pub fn commit(self) -> Result<()> {
        self.cache.flush_block(&self.guard.block)?;
        Ok(())
    }
}
