//! Object readers and writers
//!
//! Readers and writers work over an inode record inside caller-owned bytes.
//! BLOBs are raw bytes. CLOBs are UTF-16 code units stored as big-endian
//! byte pairs, so the inode length of a CLOB is twice its character count.
//!
//! A read returns at most the rest of the current fragment; callers loop
//! for more. End of stream is `Ok(None)`.

use crate::inode::{INLINE_SIZE, Inode, Resolved};
use crate::store::Store;
use lobstore_common::{Error, FragmentAddr, Result};
use std::io;
use tracing::{trace, warn};

/// Read position over an inode, caching the last resolved fragment
struct Cursor<'a> {
    store: &'a Store,
    inode: Inode<&'a [u8]>,
    length: u64,
    position: u64,
    last_range: Option<u64>,
    last_fragment: Resolved,
    closed: bool,
}

impl<'a> Cursor<'a> {
    fn open(store: &'a Store, buf: &'a [u8], offset: usize) -> Result<Self> {
        let inode = Inode::new(buf, offset)?;
        let length = inode.checked_len(store.fragment_size())?;
        Ok(Self {
            store,
            inode,
            length,
            position: 0,
            last_range: None,
            last_fragment: Resolved::Unallocated,
            closed: false,
        })
    }

    fn remaining(&self) -> u64 {
        if self.closed {
            0
        } else {
            self.length - self.position
        }
    }

    fn fragment_size(&self) -> usize {
        self.store.fragment_size()
    }

    /// Offset of the position inside its fragment
    fn fragment_offset(&self) -> usize {
        (self.position % self.fragment_size() as u64) as usize
    }

    /// Location of the current position; re-resolved only on a range change
    fn locate(&mut self) -> Result<Resolved> {
        let range = self.position / self.fragment_size() as u64;
        if self.last_range != Some(range) {
            self.last_fragment = self.inode.resolve(self.store, self.position)?;
            self.last_range = Some(range);
            trace!(range, fragment = ?self.last_fragment, "resolved fragment");
        }
        Ok(self.last_fragment)
    }

    fn skip(&mut self, n: u64) -> u64 {
        let n = n.min(self.remaining());
        self.position += n;
        n
    }

    fn close(&mut self) {
        self.closed = true;
        self.last_range = None;
        self.last_fragment = Resolved::Unallocated;
    }
}

/// Byte reader over a BLOB inode
pub struct BlobReader<'a> {
    cursor: Cursor<'a>,
}

impl<'a> BlobReader<'a> {
    /// Open a reader over the inode at `offset` in `buf`
    pub fn open(store: &'a Store, buf: &'a [u8], offset: usize) -> Result<Self> {
        Ok(Self {
            cursor: Cursor::open(store, buf, offset)?,
        })
    }

    /// Object length in bytes
    #[must_use]
    pub fn len(&self) -> u64 {
        self.cursor.length
    }

    /// Check if the object is empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.cursor.length == 0
    }

    /// Bytes read or skipped so far
    #[must_use]
    pub fn position(&self) -> u64 {
        self.cursor.position
    }

    /// Read the next byte
    pub fn read_byte(&mut self) -> Result<Option<u8>> {
        let mut byte = [0u8; 1];
        Ok(self.next_chunk(&mut byte)?.map(|_| byte[0]))
    }

    /// Read up to `buf.len()` bytes, stopping at a fragment boundary
    pub fn read(&mut self, buf: &mut [u8]) -> Result<Option<usize>> {
        self.next_chunk(buf)
    }

    fn next_chunk(&mut self, buf: &mut [u8]) -> Result<Option<usize>> {
        let remaining = self.cursor.remaining();
        if remaining == 0 {
            return Ok(None);
        }
        let want = buf.len().min(usize::try_from(remaining).unwrap_or(usize::MAX));
        if want == 0 {
            return Ok(Some(0));
        }

        let frag_offset = self.cursor.fragment_offset();
        let n = match self.cursor.locate()? {
            Resolved::Inline { .. } => {
                let start = self.cursor.position as usize;
                buf[..want].copy_from_slice(&self.cursor.inode.inline_data()[start..start + want]);
                want
            }
            Resolved::Fragment(addr) => {
                self.cursor
                    .store
                    .read_fragment(addr, frag_offset, &mut buf[..want])?
            }
            Resolved::Unallocated => {
                let n = want.min(self.cursor.fragment_size() - frag_offset);
                buf[..n].fill(0);
                n
            }
        };

        self.cursor.position += n as u64;
        Ok(Some(n))
    }

    /// Skip up to `n` bytes; returns the number skipped
    pub fn skip(&mut self, n: u64) -> u64 {
        self.cursor.skip(n)
    }

    /// Drop the cached fragment; later reads return end of stream
    pub fn close(&mut self) {
        self.cursor.close();
    }
}

impl io::Read for BlobReader<'_> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self.next_chunk(buf) {
            Ok(n) => Ok(n.unwrap_or(0)),
            Err(Error::StorageIo(e)) => Err(e),
            Err(e) => Err(io::Error::other(e)),
        }
    }
}

/// UTF-16 reader over a CLOB inode
pub struct ClobReader<'a> {
    cursor: Cursor<'a>,
}

impl<'a> ClobReader<'a> {
    /// Open a reader over the inode at `offset` in `buf`
    pub fn open(store: &'a Store, buf: &'a [u8], offset: usize) -> Result<Self> {
        Ok(Self {
            cursor: Cursor::open(store, buf, offset)?,
        })
    }

    /// Object length in characters
    #[must_use]
    pub fn len(&self) -> u64 {
        self.cursor.length / 2
    }

    /// Check if the object is empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Characters read or skipped so far
    #[must_use]
    pub fn position(&self) -> u64 {
        self.cursor.position / 2
    }

    /// Read the next UTF-16 code unit
    pub fn read_char(&mut self) -> Result<Option<u16>> {
        let mut unit = [0u16; 1];
        Ok(self.read(&mut unit)?.map(|_| unit[0]))
    }

    /// Read up to `buf.len()` code units, stopping at a fragment boundary
    pub fn read(&mut self, buf: &mut [u16]) -> Result<Option<usize>> {
        let remaining = self.cursor.remaining() / 2;
        if remaining == 0 {
            return Ok(None);
        }
        let want = buf.len().min(usize::try_from(remaining).unwrap_or(usize::MAX));
        if want == 0 {
            return Ok(Some(0));
        }

        let frag_offset = self.cursor.fragment_offset();
        let n = match self.cursor.locate()? {
            Resolved::Inline { .. } => {
                let start = self.cursor.position as usize;
                let bytes = &self.cursor.inode.inline_data()[start..start + 2 * want];
                for (unit, pair) in buf[..want].iter_mut().zip(bytes.chunks_exact(2)) {
                    *unit = u16::from_be_bytes([pair[0], pair[1]]);
                }
                want
            }
            Resolved::Fragment(addr) => {
                self.cursor
                    .store
                    .read_fragment_chars(addr, frag_offset, &mut buf[..want])?
            }
            Resolved::Unallocated => {
                let n = want.min((self.cursor.fragment_size() - frag_offset) / 2);
                buf[..n].fill(0);
                n
            }
        };

        self.cursor.position += 2 * n as u64;
        Ok(Some(n))
    }

    /// Read the rest of the object as a string
    pub fn read_to_string(&mut self) -> Result<String> {
        let mut units = Vec::with_capacity(usize::try_from(self.cursor.remaining() / 2).unwrap_or(0));
        let mut chunk = vec![0u16; self.cursor.fragment_size() / 2];
        while let Some(n) = self.read(&mut chunk)? {
            units.extend_from_slice(&chunk[..n]);
        }
        String::from_utf16(&units).map_err(|e| Error::corruption(format!("invalid UTF-16 in CLOB: {e}")))
    }

    /// Skip up to `n` characters; returns the number skipped
    pub fn skip(&mut self, n: u64) -> u64 {
        self.cursor.skip(n.saturating_mul(2)) / 2
    }

    /// Drop the cached fragment; later reads return end of stream
    pub fn close(&mut self) {
        self.cursor.close();
    }
}

/// Appending writer over a mutable inode
struct ObjectWriter<'a> {
    store: &'a Store,
    inode: Inode<&'a mut [u8]>,
}

impl<'a> ObjectWriter<'a> {
    /// Fails with `Corruption`, freeing nothing, if the record's length is
    /// past capacity
    fn create(store: &'a Store, buf: &'a mut [u8], offset: usize) -> Result<Self> {
        let mut inode = Inode::new(buf, offset)?;
        let freed = inode.free_fragments(store)?;
        if freed > 0 {
            trace!(freed, "released previous object");
        }
        Ok(Self { store, inode })
    }

    fn append(store: &'a Store, buf: &'a mut [u8], offset: usize) -> Result<Self> {
        let inode = Inode::new(buf, offset)?;
        inode.checked_len(store.fragment_size())?;
        Ok(Self { store, inode })
    }

    /// Append `data`; on error the inode is left as it was
    fn write(&mut self, data: &[u8]) -> Result<()> {
        if data.is_empty() {
            return Ok(());
        }

        let old_len = self.inode.len();
        let capacity = Inode::<&[u8]>::capacity(self.store.fragment_size());
        let new_len = old_len + data.len() as u64;
        if new_len > capacity {
            return Err(Error::storage_full(format!(
                "object of {new_len} bytes exceeds inode capacity of {capacity} bytes"
            )));
        }

        if new_len <= INLINE_SIZE as u64 {
            let start = old_len as usize;
            self.inode.inline_data_mut()[start..start + data.len()].copy_from_slice(data);
            self.inode.set_len(new_len);
            return Ok(());
        }

        // Growing past the inline area moves the payload into fragment 0
        let promoted = self.inode.is_inline().then(|| self.inode.inline_data().to_vec());
        let mut allocated = Vec::new();
        match self.write_fragments(old_len, data, promoted.as_deref(), &mut allocated) {
            Ok(()) => {
                self.inode.set_len(new_len);
                Ok(())
            }
            Err(e) => {
                self.rollback(&allocated, promoted.as_deref());
                Err(e)
            }
        }
    }

    fn write_fragments(
        &mut self,
        old_len: u64,
        data: &[u8],
        promoted: Option<&[u8]>,
        allocated: &mut Vec<(usize, FragmentAddr)>,
    ) -> Result<()> {
        if let Some(inline) = promoted {
            self.inode.inline_data_mut().fill(0);
            self.write_at(0, inline, allocated)?;
            trace!(len = inline.len(), "promoted inline object");
        }
        self.write_at(old_len, data, allocated)
    }

    fn write_at(
        &mut self,
        mut position: u64,
        mut data: &[u8],
        allocated: &mut Vec<(usize, FragmentAddr)>,
    ) -> Result<()> {
        let fragment_size = self.store.fragment_size() as u64;
        while !data.is_empty() {
            let (addr, fresh) = self.inode.resolve_for_write(self.store, position)?;
            if fresh {
                allocated.push(((position / fragment_size) as usize, addr));
            }
            let frag_offset = (position % fragment_size) as usize;
            let n = self.store.write_fragment(addr, frag_offset, data)?;
            position += n as u64;
            data = &data[n..];
        }
        Ok(())
    }

    fn rollback(&mut self, allocated: &[(usize, FragmentAddr)], promoted: Option<&[u8]>) {
        for &(slot, addr) in allocated {
            if let Err(e) = self.store.free_fragment(addr) {
                warn!(%addr, error = %e, "failed to free fragment during rollback");
            }
            if let Err(e) = self.inode.set_slot(slot, FragmentAddr::NULL) {
                warn!(slot, error = %e, "failed to clear slot during rollback");
            }
        }
        if let Some(inline) = promoted {
            let area = self.inode.inline_data_mut();
            area.fill(0);
            area[..inline.len()].copy_from_slice(inline);
        }
    }
}

/// Byte writer over a BLOB inode
pub struct BlobWriter<'a> {
    inner: ObjectWriter<'a>,
}

impl<'a> BlobWriter<'a> {
    /// Start a new, empty object, freeing any fragments the inode held
    pub fn create(store: &'a Store, buf: &'a mut [u8], offset: usize) -> Result<Self> {
        Ok(Self {
            inner: ObjectWriter::create(store, buf, offset)?,
        })
    }

    /// Continue writing at the end of the existing object
    pub fn append(store: &'a Store, buf: &'a mut [u8], offset: usize) -> Result<Self> {
        Ok(Self {
            inner: ObjectWriter::append(store, buf, offset)?,
        })
    }

    /// Object length in bytes
    #[must_use]
    pub fn len(&self) -> u64 {
        self.inner.inode.len()
    }

    /// Check if the object is empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Append bytes
    ///
    /// Fails with `StorageFull` without writing anything if the object would
    /// outgrow the inode.
    pub fn write(&mut self, data: &[u8]) -> Result<()> {
        self.inner.write(data)
    }

    /// Finish writing; returns the object length
    pub fn finish(self) -> u64 {
        self.len()
    }
}

impl io::Write for BlobWriter<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self.inner.write(buf) {
            Ok(()) => Ok(buf.len()),
            Err(Error::StorageIo(e)) => Err(e),
            Err(e) => Err(io::Error::other(e)),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// UTF-16 writer over a CLOB inode
pub struct ClobWriter<'a> {
    inner: ObjectWriter<'a>,
}

impl<'a> ClobWriter<'a> {
    /// Start a new, empty object, freeing any fragments the inode held
    pub fn create(store: &'a Store, buf: &'a mut [u8], offset: usize) -> Result<Self> {
        Ok(Self {
            inner: ObjectWriter::create(store, buf, offset)?,
        })
    }

    /// Continue writing at the end of the existing object
    pub fn append(store: &'a Store, buf: &'a mut [u8], offset: usize) -> Result<Self> {
        Ok(Self {
            inner: ObjectWriter::append(store, buf, offset)?,
        })
    }

    /// Object length in characters
    #[must_use]
    pub fn len(&self) -> u64 {
        self.inner.inode.len() / 2
    }

    /// Check if the object is empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Append UTF-16 code units
    pub fn write_chars(&mut self, chars: &[u16]) -> Result<()> {
        let bytes: Vec<u8> = chars.iter().flat_map(|unit| unit.to_be_bytes()).collect();
        self.inner.write(&bytes)
    }

    /// Append a string
    pub fn write_str(&mut self, text: &str) -> Result<()> {
        let units: Vec<u16> = text.encode_utf16().collect();
        self.write_chars(&units)
    }

    /// Finish writing; returns the object length in characters
    pub fn finish(self) -> u64 {
        self.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inode::INODE_SIZE;
    use lobstore_common::StoreConfig;
    use rand::Rng;
    use std::io::Read;

    const FS: usize = 256;

    fn config() -> StoreConfig {
        StoreConfig {
            block_size: 1024,
            fragments_per_block: 4,
            capacity_blocks: 64,
            cache_blocks: 8,
            ..StoreConfig::default()
        }
    }

    fn store() -> Store {
        Store::in_memory(&config()).unwrap()
    }

    fn random_bytes(len: usize) -> Vec<u8> {
        let mut data = vec![0u8; len];
        rand::thread_rng().fill(&mut data[..]);
        data
    }

    fn write_blob(store: &Store, record: &mut [u8], data: &[u8]) {
        let mut writer = BlobWriter::create(store, record, 0).unwrap();
        writer.write(data).unwrap();
        assert_eq!(writer.finish(), data.len() as u64);
    }

    fn read_blob(store: &Store, record: &[u8]) -> Vec<u8> {
        let mut reader = BlobReader::open(store, record, 0).unwrap();
        let mut out = Vec::new();
        reader.read_to_end(&mut out).unwrap();
        out
    }

    fn slots(record: &[u8]) -> Vec<bool> {
        let inode = Inode::new(record, 0).unwrap();
        (0..14).map(|slot| !inode.slot(slot).unwrap().is_null()).collect()
    }

    #[test]
    fn test_clob_hello_inline() {
        let store = store();
        let mut record = [0u8; INODE_SIZE];
        {
            let mut writer = ClobWriter::create(&store, &mut record, 0).unwrap();
            writer.write_str("hello").unwrap();
            assert_eq!(writer.finish(), 5);
        }
        assert_eq!(Inode::new(&record[..], 0).unwrap().len(), 10);
        assert_eq!(store.used_fragments(), 0);

        let mut reader = ClobReader::open(&store, &record, 0).unwrap();
        let mut buf = [0u16; 10];
        assert_eq!(reader.read(&mut buf).unwrap(), Some(5));
        assert_eq!(String::from_utf16(&buf[..5]).unwrap(), "hello");
        assert_eq!(reader.read(&mut buf).unwrap(), None);
        assert_eq!(reader.read_char().unwrap(), None);
    }

    #[test]
    fn test_blob_inline_roundtrip_uses_no_fragments() {
        let store = store();
        for len in [0, 1, 57, INLINE_SIZE] {
            let data = random_bytes(len);
            let mut record = [0u8; INODE_SIZE];
            write_blob(&store, &mut record, &data);
            assert_eq!(read_blob(&store, &record), data);
        }
        assert_eq!(store.used_fragments(), 0);
    }

    #[test]
    fn test_blob_inline_at_row_offset() {
        let store = store();
        let mut row = vec![0x55u8; 40 + INODE_SIZE + 8];
        row[40..40 + INODE_SIZE].fill(0);
        {
            let mut writer = BlobWriter::create(&store, &mut row, 40).unwrap();
            writer.write(b"row payload").unwrap();
        }
        assert!(row[..40].iter().all(|&b| b == 0x55));
        assert!(row[40 + INODE_SIZE..].iter().all(|&b| b == 0x55));

        let mut reader = BlobReader::open(&store, &row, 40).unwrap();
        let mut buf = [0u8; 32];
        assert_eq!(reader.read(&mut buf).unwrap(), Some(11));
        assert_eq!(&buf[..11], b"row payload");
    }

    #[test]
    fn test_blob_fragment_roundtrip_lengths() {
        let store = store();
        for len in [
            INLINE_SIZE + 1,
            FS - 1,
            FS,
            FS + 1,
            2 * FS,
            7 * FS + 1,
            14 * FS - 1,
            14 * FS,
        ] {
            let data = random_bytes(len);
            let mut record = [0u8; INODE_SIZE];
            write_blob(&store, &mut record, &data);
            assert_eq!(read_blob(&store, &record), data, "length {len}");

            let used = slots(&record).iter().filter(|&&used| used).count();
            assert_eq!(used, len.div_ceil(FS), "length {len}");

            let mut inode = Inode::new(&mut record[..], 0).unwrap();
            inode.free_fragments(&store).unwrap();
        }
        assert_eq!(store.used_fragments(), 0);
    }

    #[test]
    fn test_blob_three_and_a_bit_fragments() {
        let store = store();
        let data = random_bytes(3 * FS + 10);
        let mut record = [0u8; INODE_SIZE];
        write_blob(&store, &mut record, &data);

        let expected: Vec<bool> = (0..14).map(|slot| slot <= 3).collect();
        assert_eq!(slots(&record), expected);

        // A read straddling the slot 1 / slot 2 boundary takes two calls
        let mut reader = BlobReader::open(&store, &record, 0).unwrap();
        assert_eq!(reader.skip(2 * FS as u64 - 5), 2 * FS as u64 - 5);
        let mut buf = [0u8; 10];
        assert_eq!(reader.read(&mut buf).unwrap(), Some(5));
        assert_eq!(reader.read(&mut buf[5..]).unwrap(), Some(5));
        assert_eq!(&buf[..], &data[2 * FS - 5..2 * FS + 5]);
    }

    #[test]
    fn test_read_past_length_is_end_of_stream() {
        let store = store();
        for len in [20, 3 * FS + 10] {
            let data = random_bytes(len);
            let mut record = [0u8; INODE_SIZE];
            write_blob(&store, &mut record, &data);

            let mut reader = BlobReader::open(&store, &record, 0).unwrap();
            assert_eq!(reader.skip(10_000), len as u64);
            let mut buf = [0u8; 16];
            assert_eq!(reader.read(&mut buf).unwrap(), None);
            assert_eq!(reader.read_byte().unwrap(), None);
        }
    }

    #[test]
    fn test_read_clamps_at_length_inside_fragment() {
        let store = store();
        let data = random_bytes(FS + 30);
        let mut record = [0u8; INODE_SIZE];
        write_blob(&store, &mut record, &data);

        let mut reader = BlobReader::open(&store, &record, 0).unwrap();
        reader.skip(FS as u64);
        let mut buf = [0u8; FS];
        assert_eq!(reader.read(&mut buf).unwrap(), Some(30));
        assert_eq!(reader.read(&mut buf).unwrap(), None);
    }

    #[test]
    fn test_read_byte_by_byte() {
        let store = store();
        let data = random_bytes(FS + 3);
        let mut record = [0u8; INODE_SIZE];
        write_blob(&store, &mut record, &data);

        let mut reader = BlobReader::open(&store, &record, 0).unwrap();
        let mut out = Vec::new();
        while let Some(byte) = reader.read_byte().unwrap() {
            out.push(byte);
        }
        assert_eq!(out, data);
        assert_eq!(reader.position(), data.len() as u64);
    }

    #[test]
    fn test_close_is_idempotent() {
        let store = store();
        let mut record = [0u8; INODE_SIZE];
        write_blob(&store, &mut record, &random_bytes(2 * FS));

        let mut reader = BlobReader::open(&store, &record, 0).unwrap();
        let mut buf = [0u8; 8];
        assert_eq!(reader.read(&mut buf).unwrap(), Some(8));
        reader.close();
        reader.close();
        assert_eq!(reader.read(&mut buf).unwrap(), None);
    }

    #[test]
    fn test_unallocated_slot_reads_zeros() {
        let store = store();
        let addr = store.allocate_fragment().unwrap();
        store.write_fragment(addr, 0, &[7u8; FS]).unwrap();

        let mut record = [0u8; INODE_SIZE];
        {
            let mut inode = Inode::new(&mut record[..], 0).unwrap();
            inode.set_len(2 * FS as u64);
            inode.set_slot(1, addr).unwrap();
        }

        let out = read_blob(&store, &record);
        assert!(out[..FS].iter().all(|&b| b == 0));
        assert!(out[FS..].iter().all(|&b| b == 7));
    }

    #[test]
    fn test_capacity_exceeded_fails_fast() {
        let store = store();
        let mut record = [0u8; INODE_SIZE];
        let mut writer = BlobWriter::create(&store, &mut record, 0).unwrap();
        writer.write(&random_bytes(100)).unwrap();

        let err = writer.write(&random_bytes(14 * FS)).unwrap_err();
        assert!(matches!(err, Error::StorageFull(_)));
        assert_eq!(writer.len(), 100);
        assert_eq!(store.used_fragments(), 0);
    }

    #[test]
    fn test_promotion_keeps_inline_bytes() {
        let store = store();
        let first = random_bytes(100);
        let second = random_bytes(300);
        let mut record = [0u8; INODE_SIZE];
        {
            let mut writer = BlobWriter::create(&store, &mut record, 0).unwrap();
            writer.write(&first).unwrap();
            assert_eq!(store.used_fragments(), 0);
            writer.write(&second).unwrap();
        }
        assert_eq!(store.used_fragments(), 2);

        let mut expected = first;
        expected.extend_from_slice(&second);
        assert_eq!(read_blob(&store, &record), expected);
    }

    #[test]
    fn test_failed_promotion_rolls_back() {
        let store = Store::in_memory(&StoreConfig {
            capacity_blocks: 4,
            ..config()
        })
        .unwrap();
        let inline = random_bytes(50);
        let mut record = [0u8; INODE_SIZE];
        write_blob(&store, &mut record, &inline);

        // Exhaust the data blocks
        for _ in 0..3 {
            store.allocate_block().unwrap();
        }

        {
            let mut writer = BlobWriter::append(&store, &mut record, 0).unwrap();
            let err = writer.write(&random_bytes(200)).unwrap_err();
            assert!(err.is_capacity());
            assert_eq!(writer.len(), 50);
        }
        assert_eq!(read_blob(&store, &record), inline);
    }

    #[test]
    fn test_failed_growth_frees_new_fragments() {
        let store = Store::in_memory(&StoreConfig {
            capacity_blocks: 4,
            ..config()
        })
        .unwrap();
        // 3 data blocks of 4 fragments; keep one block for the object
        store.allocate_block().unwrap();
        store.allocate_block().unwrap();

        let first = random_bytes(3 * FS);
        let mut record = [0u8; INODE_SIZE];
        write_blob(&store, &mut record, &first);
        assert_eq!(store.used_fragments(), 3);

        {
            let mut writer = BlobWriter::append(&store, &mut record, 0).unwrap();
            // Needs two more fragments; only one is left
            assert!(writer.write(&random_bytes(2 * FS)).is_err());
            assert_eq!(writer.len(), 3 * FS as u64);
        }
        assert_eq!(store.used_fragments(), 3);
        assert_eq!(slots(&record).iter().filter(|&&used| used).count(), 3);
        assert_eq!(read_blob(&store, &record), first);
    }

    #[test]
    fn test_append_continues_object() {
        let store = store();
        let first = random_bytes(300);
        let second = random_bytes(300);
        let mut record = [0u8; INODE_SIZE];
        write_blob(&store, &mut record, &first);
        {
            let mut writer = BlobWriter::append(&store, &mut record, 0).unwrap();
            writer.write(&second).unwrap();
            assert_eq!(writer.finish(), 600);
        }

        let mut expected = first;
        expected.extend_from_slice(&second);
        assert_eq!(read_blob(&store, &record), expected);
    }

    #[test]
    fn test_create_frees_previous_fragments() {
        let store = store();
        let mut record = [0u8; INODE_SIZE];
        write_blob(&store, &mut record, &random_bytes(5 * FS));
        assert_eq!(store.used_fragments(), 5);

        write_blob(&store, &mut record, b"small");
        assert_eq!(store.used_fragments(), 0);
        assert_eq!(read_blob(&store, &record), b"small");
    }

    #[test]
    fn test_io_write_and_read() {
        let store = store();
        let data = random_bytes(5 * FS + 17);
        let mut record = [0u8; INODE_SIZE];
        {
            let mut writer = BlobWriter::create(&store, &mut record, 0).unwrap();
            std::io::copy(&mut &data[..], &mut writer).unwrap();
        }
        assert_eq!(read_blob(&store, &record), data);
    }

    #[test]
    fn test_clob_spans_fragments() {
        let store = store();
        let text: String = "snow ☃ and more text ".repeat(40);
        let mut record = [0u8; INODE_SIZE];
        {
            let mut writer = ClobWriter::create(&store, &mut record, 0).unwrap();
            writer.write_str(&text).unwrap();
        }

        let units = text.encode_utf16().count();
        assert_eq!(Inode::new(&record[..], 0).unwrap().len(), 2 * units as u64);

        let mut reader = ClobReader::open(&store, &record, 0).unwrap();
        assert_eq!(reader.len(), units as u64);
        assert_eq!(reader.read_to_string().unwrap(), text);
        assert_eq!(reader.read_char().unwrap(), None);
    }

    #[test]
    fn test_clob_read_stops_at_fragment_boundary() {
        let store = store();
        let text: String = std::iter::repeat_n('x', FS).collect();
        let mut record = [0u8; INODE_SIZE];
        {
            let mut writer = ClobWriter::create(&store, &mut record, 0).unwrap();
            writer.write_str(&text).unwrap();
        }

        // FS chars occupy two fragments of FS / 2 chars each
        let mut reader = ClobReader::open(&store, &record, 0).unwrap();
        assert_eq!(reader.skip(FS as u64 / 2 - 3), FS as u64 / 2 - 3);
        let mut buf = [0u16; 8];
        assert_eq!(reader.read(&mut buf).unwrap(), Some(3));
        assert_eq!(reader.read(&mut buf).unwrap(), Some(8));
        assert_eq!(reader.position(), FS as u64 / 2 + 8);
    }

    #[test]
    fn test_clob_invalid_utf16_is_corruption() {
        let store = store();
        let mut record = [0u8; INODE_SIZE];
        {
            let mut writer = ClobWriter::create(&store, &mut record, 0).unwrap();
            writer.write_chars(&[0xd800, 0x0041]).unwrap();
        }

        let mut reader = ClobReader::open(&store, &record, 0).unwrap();
        assert!(matches!(
            reader.read_to_string(),
            Err(Error::Corruption(_))
        ));
    }

    #[test]
    fn test_eviction_round_trip_with_small_cache() {
        let store = Store::in_memory(&StoreConfig {
            cache_blocks: 2,
            ..config()
        })
        .unwrap();

        let mut records = vec![[0u8; INODE_SIZE]; 4];
        let payloads: Vec<Vec<u8>> = (0..4).map(|_| random_bytes(10 * FS)).collect();
        for (record, data) in records.iter_mut().zip(&payloads) {
            write_blob(&store, record, data);
        }
        assert!(store.cache().stats().evictions.load(std::sync::atomic::Ordering::Relaxed) > 0);

        for (record, data) in records.iter().zip(&payloads) {
            assert_eq!(&read_blob(&store, record), data);
        }
    }

    #[test]
    fn test_oversized_length_rejected() {
        let store = store();
        let mut record = [0u8; INODE_SIZE];
        Inode::new(&mut record[..], 0)
            .unwrap()
            .set_len(14 * FS as u64 + 1);

        assert!(matches!(
            BlobReader::open(&store, &record, 0),
            Err(Error::Corruption(_))
        ));
        assert!(BlobWriter::append(&store, &mut record, 0).is_err());
    }

    #[test]
    fn test_create_over_damaged_record_frees_nothing() {
        let store = store();
        let mut other = [0u8; INODE_SIZE];
        let data = random_bytes(2 * FS);
        write_blob(&store, &mut other, &data);
        assert_eq!(store.used_fragments(), 2);

        // A stale record whose slot table points at the other object
        let mut record = other;
        Inode::new(&mut record[..], 0)
            .unwrap()
            .set_len(0x5555_5555_5555_5555);

        assert!(matches!(
            BlobWriter::create(&store, &mut record, 0),
            Err(Error::Corruption(_))
        ));
        assert!(matches!(
            ClobWriter::create(&store, &mut record, 0),
            Err(Error::Corruption(_))
        ));
        assert_eq!(store.used_fragments(), 2);
        assert_eq!(read_blob(&store, &other), data);

        // Garbage that is not even a valid address is rejected the same way
        let mut garbage = [0x55u8; INODE_SIZE];
        assert!(matches!(
            BlobWriter::create(&store, &mut garbage, 0),
            Err(Error::Corruption(_))
        ));
    }
}
