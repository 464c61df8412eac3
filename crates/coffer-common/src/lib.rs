//! Coffer Common - Shared types and utilities
//!
//! This crate provides the common types, error definitions and name
//! validation used across all coffer components.

pub mod error;
pub mod types;

pub use error::{to_object_err, ObjectError, ObjectResult, StorageError, StorageResult};
pub use types::*;
