//! lobstore Common - Shared types and utilities
//!
//! This crate provides the identifier types, the error taxonomy and the
//! store configuration used by every lobstore component.

pub mod config;
pub mod error;
pub mod types;

pub use config::{StoreConfig, WritePolicy};
pub use error::{Error, Result};
pub use types::*;
