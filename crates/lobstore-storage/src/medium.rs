//! Backing media for a store
//!
//! A [`Medium`] is a fixed-size random-access byte range. Two
//! implementations are provided:
//! - [`FileMedium`]: a regular file or block device, positional I/O
//! - [`MemoryMedium`]: a heap buffer, for tests and scratch stores

use lobstore_common::{Error, Result};
use parking_lot::RwLock;
use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::Path;

/// Random-access backing medium
pub trait Medium: Send + Sync {
    /// Fill `buf` from `offset`
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<()>;

    /// Write all of `buf` at `offset`
    fn write_at(&self, offset: u64, buf: &[u8]) -> Result<()>;

    /// Make previous writes durable
    fn sync(&self) -> Result<()>;

    /// Size of the medium in bytes
    fn size(&self) -> u64;

    /// Human-readable name used in log messages
    fn describe(&self) -> String;
}

/// File-backed medium using positional reads and writes
pub struct FileMedium {
    file: File,
    path: String,
    size: u64,
    read_only: bool,
}

impl FileMedium {
    /// Open an existing file or block device
    pub fn open(path: impl AsRef<Path>, read_only: bool) -> Result<Self> {
        let path_str = path.as_ref().to_string_lossy().to_string();

        let mut options = OpenOptions::new();
        options.read(true);
        if !read_only {
            options.write(true);
        }

        let file = options.open(&path).map_err(|e| {
            Error::StorageIo(std::io::Error::new(
                e.kind(),
                format!("failed to open {path_str}: {e}"),
            ))
        })?;

        let size = if Self::is_block_device(&path) {
            Self::get_block_device_size(&file, &path_str)?
        } else {
            file.metadata()?.len()
        };

        Ok(Self {
            file,
            path: path_str,
            size,
            read_only,
        })
    }

    /// Create a file of the given size
    ///
    /// Regular files are created or truncated and then sized. For block
    /// devices the size parameter is ignored and the device size is used.
    pub fn create(path: impl AsRef<Path>, size: u64) -> Result<Self> {
        let path_str = path.as_ref().to_string_lossy().to_string();
        let is_block_device = Self::is_block_device(&path);

        let mut options = OpenOptions::new();
        options.read(true).write(true);
        if !is_block_device {
            options.create(true).truncate(true);
        }

        let file = options.open(&path).map_err(|e| {
            Error::StorageIo(std::io::Error::new(
                e.kind(),
                format!("failed to create {path_str}: {e}"),
            ))
        })?;

        let actual_size = if is_block_device {
            Self::get_block_device_size(&file, &path_str)?
        } else {
            file.set_len(size)?;
            size
        };

        Ok(Self {
            file,
            path: path_str,
            size: actual_size,
            read_only: false,
        })
    }

    /// Check if path is a block device (missing paths are not)
    fn is_block_device(path: impl AsRef<Path>) -> bool {
        use std::os::unix::fs::FileTypeExt;
        std::fs::metadata(&path)
            .map(|m| m.file_type().is_block_device())
            .unwrap_or(false)
    }

    /// Get block device size by seeking to the end
    fn get_block_device_size(file: &File, path: &str) -> Result<u64> {
        use std::io::{Seek, SeekFrom};
        let mut f = file;
        let size = f.seek(SeekFrom::End(0)).map_err(|e| {
            Error::StorageIo(std::io::Error::new(
                e.kind(),
                format!("failed to get device size for {path}: {e}"),
            ))
        })?;
        f.seek(SeekFrom::Start(0))?;
        Ok(size)
    }

    /// Get the file path
    pub fn path(&self) -> &str {
        &self.path
    }

    fn check_range(&self, offset: u64, len: usize) -> Result<()> {
        if offset + len as u64 > self.size {
            return Err(Error::StorageIo(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                format!(
                    "range {offset}..{} is outside {} ({} bytes)",
                    offset + len as u64,
                    self.path,
                    self.size
                ),
            )));
        }
        Ok(())
    }
}

impl Medium for FileMedium {
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        self.check_range(offset, buf.len())?;
        self.file.read_exact_at(buf, offset)?;
        Ok(())
    }

    fn write_at(&self, offset: u64, buf: &[u8]) -> Result<()> {
        if self.read_only {
            return Err(Error::StorageIo(std::io::Error::new(
                std::io::ErrorKind::PermissionDenied,
                format!("{} is read-only", self.path),
            )));
        }
        self.check_range(offset, buf.len())?;
        self.file.write_all_at(buf, offset)?;
        Ok(())
    }

    fn sync(&self) -> Result<()> {
        self.file.sync_data()?;
        Ok(())
    }

    fn size(&self) -> u64 {
        self.size
    }

    fn describe(&self) -> String {
        self.path.clone()
    }
}

/// In-memory medium
pub struct MemoryMedium {
    data: RwLock<Vec<u8>>,
}

impl MemoryMedium {
    /// Create a zero-filled medium of `size` bytes
    #[must_use]
    pub fn new(size: usize) -> Self {
        Self {
            data: RwLock::new(vec![0u8; size]),
        }
    }

    fn out_of_range(offset: u64, len: usize, size: usize) -> Error {
        Error::StorageIo(std::io::Error::new(
            std::io::ErrorKind::UnexpectedEof,
            format!(
                "range {offset}..{} is outside memory medium ({size} bytes)",
                offset + len as u64
            ),
        ))
    }

    fn range(offset: u64, len: usize, size: usize) -> Result<std::ops::Range<usize>> {
        usize::try_from(offset)
            .ok()
            .and_then(|start| Some(start..start.checked_add(len)?))
            .filter(|range| range.end <= size)
            .ok_or_else(|| Self::out_of_range(offset, len, size))
    }
}

impl Medium for MemoryMedium {
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        let data = self.data.read();
        let range = Self::range(offset, buf.len(), data.len())?;
        buf.copy_from_slice(&data[range]);
        Ok(())
    }

    fn write_at(&self, offset: u64, buf: &[u8]) -> Result<()> {
        let mut data = self.data.write();
        let range = Self::range(offset, buf.len(), data.len())?;
        data[range].copy_from_slice(buf);
        Ok(())
    }

    fn sync(&self) -> Result<()> {
        Ok(())
    }

    fn size(&self) -> u64 {
        self.data.read().len() as u64
    }

    fn describe(&self) -> String {
        "memory".to_string()
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    #[test]
    fn test_memory_medium_roundtrip() {
        let medium = MemoryMedium::new(4096);
        medium.write_at(100, b"hello").unwrap();

        let mut buf = [0u8; 5];
        medium.read_at(100, &mut buf).unwrap();
        assert_eq!(&buf, b"hello");
        assert_eq!(medium.size(), 4096);
    }

    #[test]
    fn test_memory_medium_out_of_range() {
        let medium = MemoryMedium::new(64);
        let mut buf = [0u8; 8];
        assert!(matches!(
            medium.read_at(60, &mut buf),
            Err(Error::StorageIo(_))
        ));
        assert!(medium.write_at(64, b"x").is_err());
    }

    #[test]
    fn test_file_medium_create_and_read() {
        let temp = NamedTempFile::new().unwrap();
        let path = temp.path();

        {
            let file = FileMedium::create(path, 8192).unwrap();
            assert_eq!(file.size(), 8192);
            file.write_at(4096, b"test data pattern").unwrap();
            file.sync().unwrap();
        }

        {
            let file = FileMedium::open(path, true).unwrap();
            let mut buf = [0u8; 17];
            file.read_at(4096, &mut buf).unwrap();
            assert_eq!(&buf, b"test data pattern");
            assert!(file.write_at(0, b"nope").is_err());
        }
    }

    #[test]
    fn test_file_medium_rejects_reads_past_end() {
        let temp = NamedTempFile::new().unwrap();
        let file = FileMedium::create(temp.path(), 1024).unwrap();
        let mut buf = [0u8; 16];
        assert!(file.read_at(1020, &mut buf).is_err());
    }
}
