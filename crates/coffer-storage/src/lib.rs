//! Coffer Storage - Uniform block/file interface over a single disk
//!
//! The [`StorageAPI`] trait is the data-plane contract of one disk: volumes
//! and files, nothing cross-disk. `PosixDisk` implements it over a local
//! filesystem path; the RPC crate provides the remote twin; `FaultyDisk`
//! wraps any implementation with sticky fault injection for quorum tests.

pub mod api;
pub mod faulty;
pub mod posix;

pub use api::StorageAPI;
pub use faulty::FaultyDisk;
pub use posix::PosixDisk;
