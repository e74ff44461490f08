//! Error types for lobstore
//!
//! This module defines the common error type used by the store, the cache
//! and the object streams.

use thiserror::Error;

/// Common result type for lobstore operations
pub type Result<T> = std::result::Result<T, Error>;

/// Common error type for lobstore
#[derive(Debug, Error)]
pub enum Error {
    // Medium errors
    #[error("storage I/O error: {0}")]
    StorageIo(#[from] std::io::Error),

    #[error("storage full: {0}")]
    StorageFull(String),

    // Addressing errors
    #[error("invalid offset {offset}: addressable capacity is {capacity} bytes")]
    InvalidOffset { offset: u64, capacity: u64 },

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    // Cache errors
    #[error("concurrent modification: {0}")]
    ConcurrentModification(String),

    #[error("block cache exhausted: all {capacity} slots are held")]
    CacheExhausted { capacity: usize },

    // Format errors
    #[error("data corruption detected: {0}")]
    Corruption(String),

    #[error("configuration error: {0}")]
    Configuration(String),
}

impl Error {
    /// Create a storage-full error
    pub fn storage_full(msg: impl Into<String>) -> Self {
        Self::StorageFull(msg.into())
    }

    /// Create an invalid argument error
    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        Self::InvalidArgument(msg.into())
    }

    /// Create a concurrent modification error
    pub fn concurrent_modification(msg: impl Into<String>) -> Self {
        Self::ConcurrentModification(msg.into())
    }

    /// Create a corruption error
    pub fn corruption(msg: impl Into<String>) -> Self {
        Self::Corruption(msg.into())
    }

    /// Create a configuration error
    pub fn configuration(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    /// Check if the error leaves the store in a state the caller cannot
    /// repair by retrying or growing the store
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::StorageIo(_) | Self::ConcurrentModification(_) | Self::Corruption(_)
        )
    }

    /// Check if the error is caused by running out of space
    #[must_use]
    pub fn is_capacity(&self) -> bool {
        matches!(self, Self::StorageFull(_) | Self::CacheExhausted { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_fatal() {
        let io = std::io::Error::other("medium gone");
        assert!(Error::from(io).is_fatal());
        assert!(Error::concurrent_modification("holder count").is_fatal());
        assert!(!Error::storage_full("no fragments").is_fatal());
        assert!(
            !Error::InvalidOffset {
                offset: 10,
                capacity: 5
            }
            .is_fatal()
        );
    }

    #[test]
    fn test_error_capacity() {
        assert!(Error::storage_full("no blocks").is_capacity());
        assert!(Error::CacheExhausted { capacity: 4 }.is_capacity());
        assert!(!Error::corruption("bad magic").is_capacity());
    }

    #[test]
    fn test_error_display() {
        let err = Error::InvalidOffset {
            offset: 20,
            capacity: 14,
        };
        assert_eq!(
            err.to_string(),
            "invalid offset 20: addressable capacity is 14 bytes"
        );
    }
}
