//! Coffer Object - Erasure-coded object layer
//!
//! Composes a fixed set of storage disks into one object store:
//! - quorum-governed bucket and object operations,
//! - per-(bucket, object) namespace locking,
//! - a lazy sorted tree walker feeding paginated listings,
//! - multipart uploads and healing.

pub mod cache;
pub mod format;
pub mod meta;
pub mod namespace_lock;
pub mod quorum;
pub mod tree_walk;
pub mod tree_walk_pool;
pub mod xl;

mod bucket;
mod heal;
mod list;
mod multipart;
mod object;

pub use cache::ObjectCache;
pub use meta::{ChecksumInfo, ErasureInfo, ObjectPartInfo, XlMetaV1, XL_META_JSON_FILE};
pub use namespace_lock::{NsLockGuard, NsLockMap, SystemLockState};
pub use tree_walk::{start_tree_walk, TreeWalkResult, TreeWalkSource};
pub use tree_walk_pool::{ListParams, TreeWalkPool, TreeWalkSession};
pub use xl::XlObjects;
