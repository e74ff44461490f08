//! Inode records
//!
//! An inode is a fixed 120-byte record embedded in caller-owned bytes (a
//! table row, usually):
//!
//! ```text
//! +--------+-----------------------------------------------+
//! | length |  slot 0 | slot 1 | ...             | slot 13  |
//! | 8 (BE) |  8 (BE) each                                  |
//! +--------+-----------------------------------------------+
//! ```
//!
//! Objects of at most [`INLINE_SIZE`] bytes are stored inline in place of
//! the slot table. Larger objects are split into fragment-sized ranges and
//! slot `i` holds the address of the fragment covering range `i`.

use crate::store::Store;
use lobstore_common::{Error, FragmentAddr, Result};
use tracing::debug;

/// Number of direct fragment slots
pub const INODE_DIRECT_SLOTS: usize = 14;

/// Size of the big-endian length prefix
pub const INODE_HEADER_SIZE: usize = 8;

/// Size of one fragment address slot
pub const INODE_ADDR_SIZE: usize = 8;

/// Size of an inode record
pub const INODE_SIZE: usize = INODE_HEADER_SIZE + INODE_DIRECT_SLOTS * INODE_ADDR_SIZE;

/// Largest object stored inline
pub const INLINE_SIZE: usize = INODE_SIZE - INODE_HEADER_SIZE;

/// Where a logical offset lives
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Resolved {
    /// Inline payload; `offset` indexes the caller's buffer directly
    Inline { offset: usize },
    /// Inside the fragment at this address
    Fragment(FragmentAddr),
    /// In a slot that has no fragment; reads as zeros
    Unallocated,
}

/// View of an inode record at `offset` inside `buf`
pub struct Inode<B> {
    buf: B,
    offset: usize,
}

impl<B: AsRef<[u8]>> Inode<B> {
    /// Wrap the record at `offset`; the whole record must fit in `buf`
    pub fn new(buf: B, offset: usize) -> Result<Self> {
        let len = buf.as_ref().len();
        if offset.checked_add(INODE_SIZE).is_none_or(|end| end > len) {
            return Err(Error::invalid_argument(format!(
                "inode at offset {offset} does not fit in {len} bytes"
            )));
        }
        Ok(Self { buf, offset })
    }

    fn record(&self) -> &[u8] {
        &self.buf.as_ref()[self.offset..self.offset + INODE_SIZE]
    }

    /// Offset of the record inside the caller's buffer
    #[must_use]
    pub fn offset(&self) -> usize {
        self.offset
    }

    /// Object length in bytes
    #[must_use]
    pub fn len(&self) -> u64 {
        let mut prefix = [0u8; INODE_HEADER_SIZE];
        prefix.copy_from_slice(&self.record()[..INODE_HEADER_SIZE]);
        u64::from_be_bytes(prefix)
    }

    /// Check if the object is empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Check if the object is stored inline
    #[must_use]
    pub fn is_inline(&self) -> bool {
        self.len() <= INLINE_SIZE as u64
    }

    /// Largest object length for a given fragment size
    #[must_use]
    pub fn capacity(fragment_size: usize) -> u64 {
        (INODE_DIRECT_SLOTS * fragment_size) as u64
    }

    /// Object length, checked against what the slot table can address
    ///
    /// A longer length means the record is damaged or was never written;
    /// its slot bytes are not addresses and must not be followed.
    pub fn checked_len(&self, fragment_size: usize) -> Result<u64> {
        let length = self.len();
        let capacity = Self::capacity(fragment_size);
        if length > capacity {
            return Err(Error::corruption(format!(
                "inode length {length} exceeds capacity of {capacity} bytes"
            )));
        }
        Ok(length)
    }

    /// Address stored in slot `slot`
    pub fn slot(&self, slot: usize) -> Result<FragmentAddr> {
        if slot >= INODE_DIRECT_SLOTS {
            return Err(Error::invalid_argument(format!(
                "slot {slot} out of range (max {INODE_DIRECT_SLOTS})"
            )));
        }
        let start = INODE_HEADER_SIZE + slot * INODE_ADDR_SIZE;
        let mut raw = [0u8; INODE_ADDR_SIZE];
        raw.copy_from_slice(&self.record()[start..start + INODE_ADDR_SIZE]);
        Ok(FragmentAddr::from_raw(u64::from_be_bytes(raw)))
    }

    /// Slots that hold a fragment
    pub fn allocated_slots(&self) -> impl Iterator<Item = (usize, FragmentAddr)> + '_ {
        (0..INODE_DIRECT_SLOTS)
            .filter_map(|slot| self.slot(slot).ok().map(|addr| (slot, addr)))
            .filter(|(_, addr)| !addr.is_null())
    }

    /// Inline payload, clamped at the object length
    #[must_use]
    pub fn inline_data(&self) -> &[u8] {
        let len = (self.len() as usize).min(INLINE_SIZE);
        &self.record()[INODE_HEADER_SIZE..INODE_HEADER_SIZE + len]
    }

    /// Find where `logical_offset` lives
    ///
    /// Offsets past the last slot fail with `InvalidOffset` whatever the
    /// object length; so do inline offsets past [`INLINE_SIZE`].
    pub fn resolve(&self, store: &Store, logical_offset: u64) -> Result<Resolved> {
        let fragment_size = store.fragment_size() as u64;
        let slot = logical_offset / fragment_size;
        if slot >= INODE_DIRECT_SLOTS as u64 {
            return Err(Error::InvalidOffset {
                offset: logical_offset,
                capacity: Self::capacity(store.fragment_size()),
            });
        }

        if self.is_inline() {
            if logical_offset >= INLINE_SIZE as u64 {
                return Err(Error::InvalidOffset {
                    offset: logical_offset,
                    capacity: INLINE_SIZE as u64,
                });
            }
            return Ok(Resolved::Inline {
                offset: self.offset + INODE_HEADER_SIZE + logical_offset as usize,
            });
        }

        let addr = self.slot(slot as usize)?;
        Ok(if addr.is_null() {
            Resolved::Unallocated
        } else {
            Resolved::Fragment(addr)
        })
    }

    /// Give back the wrapped buffer
    pub fn into_inner(self) -> B {
        self.buf
    }
}

impl<B: AsRef<[u8]> + AsMut<[u8]>> Inode<B> {
    fn record_mut(&mut self) -> &mut [u8] {
        &mut self.buf.as_mut()[self.offset..self.offset + INODE_SIZE]
    }

    /// Set the object length
    pub fn set_len(&mut self, len: u64) {
        self.record_mut()[..INODE_HEADER_SIZE].copy_from_slice(&len.to_be_bytes());
    }

    /// Store `addr` in slot `slot`
    pub fn set_slot(&mut self, slot: usize, addr: FragmentAddr) -> Result<()> {
        if slot >= INODE_DIRECT_SLOTS {
            return Err(Error::invalid_argument(format!(
                "slot {slot} out of range (max {INODE_DIRECT_SLOTS})"
            )));
        }
        let start = INODE_HEADER_SIZE + slot * INODE_ADDR_SIZE;
        self.record_mut()[start..start + INODE_ADDR_SIZE].copy_from_slice(&addr.raw().to_be_bytes());
        Ok(())
    }

    /// The whole inline area, regardless of length
    pub fn inline_data_mut(&mut self) -> &mut [u8] {
        &mut self.record_mut()[INODE_HEADER_SIZE..]
    }

    /// Fragment holding `logical_offset`, allocated on first use
    ///
    /// The record is read as a slot table whatever its length, so an inline
    /// object must be promoted before its first fragment write. Returns the
    /// address and whether it was allocated by this call.
    pub fn resolve_for_write(
        &mut self,
        store: &Store,
        logical_offset: u64,
    ) -> Result<(FragmentAddr, bool)> {
        let slot = logical_offset / store.fragment_size() as u64;
        if slot >= INODE_DIRECT_SLOTS as u64 {
            return Err(Error::InvalidOffset {
                offset: logical_offset,
                capacity: Self::capacity(store.fragment_size()),
            });
        }
        let slot = slot as usize;

        let addr = self.slot(slot)?;
        if !addr.is_null() {
            return Ok((addr, false));
        }

        let addr = store.allocate_fragment()?;
        self.set_slot(slot, addr)?;
        debug!(slot, %addr, "allocated inode fragment");
        Ok((addr, true))
    }

    /// Free every fragment and reset to an empty inline object
    ///
    /// Returns the number of fragments freed. On error the slots freed so
    /// far are already cleared, so the call can be retried. A record whose
    /// length is past capacity fails with `Corruption` and frees nothing.
    pub fn free_fragments(&mut self, store: &Store) -> Result<usize> {
        self.checked_len(store.fragment_size())?;
        let mut freed = 0;
        if !self.is_inline() {
            let slots: Vec<_> = self.allocated_slots().collect();
            for (slot, addr) in slots {
                store.free_fragment(addr)?;
                self.set_slot(slot, FragmentAddr::NULL)?;
                freed += 1;
            }
        }
        self.clear();
        Ok(freed)
    }

    /// Zero the record: an empty inline object
    pub fn clear(&mut self) {
        self.record_mut().fill(0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lobstore_common::StoreConfig;

    fn store() -> Store {
        Store::in_memory(&StoreConfig {
            block_size: 1024,
            fragments_per_block: 4,
            capacity_blocks: 64,
            cache_blocks: 8,
            ..StoreConfig::default()
        })
        .unwrap()
    }

    #[test]
    fn test_layout_constants() {
        assert_eq!(INODE_SIZE, 120);
        assert_eq!(INLINE_SIZE, 112);
    }

    #[test]
    fn test_new_checks_bounds() {
        assert!(Inode::new(&[0u8; 120][..], 0).is_ok());
        assert!(Inode::new(&[0u8; 120][..], 1).is_err());
        assert!(Inode::new(&[0u8; 200][..], 80).is_ok());
        assert!(Inode::new(&[0u8; 8][..], usize::MAX).is_err());
    }

    #[test]
    fn test_length_is_big_endian() {
        let mut row = [0u8; 130];
        let mut inode = Inode::new(&mut row[..], 10).unwrap();
        inode.set_len(0x0102);
        assert_eq!(inode.len(), 0x0102);
        assert_eq!(&row[10..18], &[0, 0, 0, 0, 0, 0, 1, 2]);
    }

    #[test]
    fn test_resolve_inline() {
        let store = store();
        let mut row = [0u8; 140];
        let mut inode = Inode::new(&mut row[..], 20).unwrap();
        inode.set_len(5);
        inode.inline_data_mut()[..5].copy_from_slice(b"hello");

        assert_eq!(inode.inline_data(), b"hello");
        assert_eq!(
            inode.resolve(&store, 3).unwrap(),
            Resolved::Inline { offset: 20 + 8 + 3 }
        );
        assert!(matches!(
            inode.resolve(&store, 112),
            Err(Error::InvalidOffset { .. })
        ));
    }

    #[test]
    fn test_resolve_past_last_slot_fails_for_any_length() {
        let store = store();
        let capacity = Inode::<&[u8]>::capacity(store.fragment_size());
        assert_eq!(capacity, 14 * 256);

        for len in [0, 50, 113, 1000, capacity] {
            let mut record = [0u8; INODE_SIZE];
            let mut inode = Inode::new(&mut record[..], 0).unwrap();
            inode.set_len(len);
            let err = inode.resolve(&store, capacity).unwrap_err();
            assert!(
                matches!(err, Error::InvalidOffset { offset, .. } if offset == capacity),
                "length {len}: {err}"
            );
        }
    }

    #[test]
    fn test_resolve_fragments() {
        let store = store();
        let mut record = [0u8; INODE_SIZE];
        let mut inode = Inode::new(&mut record[..], 0).unwrap();
        inode.set_len(600);
        let addr = store.allocate_fragment().unwrap();
        inode.set_slot(1, addr).unwrap();

        assert_eq!(inode.resolve(&store, 0).unwrap(), Resolved::Unallocated);
        assert_eq!(inode.resolve(&store, 256).unwrap(), Resolved::Fragment(addr));
        assert_eq!(inode.resolve(&store, 511).unwrap(), Resolved::Fragment(addr));
        assert_eq!(inode.resolve(&store, 512).unwrap(), Resolved::Unallocated);
    }

    #[test]
    fn test_resolve_for_write_allocates_in_place() {
        let store = store();
        let mut row = vec![0xaau8; 16];
        row.extend_from_slice(&[0u8; INODE_SIZE]);
        let mut inode = Inode::new(&mut row[..], 16).unwrap();

        let (addr, allocated) = inode.resolve_for_write(&store, 300).unwrap();
        assert!(allocated);
        assert_eq!(inode.slot(1).unwrap(), addr);
        assert_eq!(inode.resolve_for_write(&store, 400).unwrap(), (addr, false));
        assert!(matches!(
            inode.resolve_for_write(&store, 14 * 256),
            Err(Error::InvalidOffset { .. })
        ));

        // Bytes before the record are untouched
        assert!(row[..16].iter().all(|&b| b == 0xaa));
        let slot_bytes = &row[16 + 8 + 8..16 + 8 + 16];
        assert_eq!(slot_bytes, &addr.raw().to_be_bytes());
    }

    #[test]
    fn test_free_fragments_resets_inode() {
        let store = store();
        let mut record = [0u8; INODE_SIZE];
        let mut inode = Inode::new(&mut record[..], 0).unwrap();
        for offset in [0, 256, 512] {
            inode.resolve_for_write(&store, offset).unwrap();
        }
        inode.set_len(700);
        assert_eq!(inode.allocated_slots().count(), 3);
        assert_eq!(store.used_fragments(), 3);

        assert_eq!(inode.free_fragments(&store).unwrap(), 3);
        assert!(inode.is_empty());
        assert_eq!(inode.allocated_slots().count(), 0);
        assert_eq!(store.used_fragments(), 0);
    }

    #[test]
    fn test_free_fragments_rejects_oversized_length() {
        let store = store();
        let owned = store.allocate_fragment().unwrap();
        store.write_fragment(owned, 0, b"someone else").unwrap();

        let mut record = [0u8; INODE_SIZE];
        let mut inode = Inode::new(&mut record[..], 0).unwrap();
        inode.set_slot(0, owned).unwrap();
        inode.set_len(u64::MAX);

        assert!(matches!(
            inode.free_fragments(&store),
            Err(Error::Corruption(_))
        ));
        assert_eq!(inode.slot(0).unwrap(), owned);
        assert_eq!(store.used_fragments(), 1);

        let mut buf = [0u8; 12];
        store.read_fragment(owned, 0, &mut buf).unwrap();
        assert_eq!(&buf, b"someone else");
    }

    #[test]
    fn test_checked_len() {
        let mut record = [0u8; INODE_SIZE];
        let mut inode = Inode::new(&mut record[..], 0).unwrap();
        inode.set_len(14 * 256);
        assert_eq!(inode.checked_len(256).unwrap(), 14 * 256);
        inode.set_len(14 * 256 + 1);
        assert!(matches!(inode.checked_len(256), Err(Error::Corruption(_))));
    }

    #[test]
    fn test_free_fragments_inline_frees_nothing() {
        let store = store();
        let mut record = [0u8; INODE_SIZE];
        let mut inode = Inode::new(&mut record[..], 0).unwrap();
        inode.set_len(3);
        inode.inline_data_mut()[..3].copy_from_slice(b"abc");

        assert_eq!(inode.free_fragments(&store).unwrap(), 0);
        assert!(record.iter().all(|&b| b == 0));
    }
}
