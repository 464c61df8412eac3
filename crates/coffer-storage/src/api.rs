//! The storage API contract.

use async_trait::async_trait;
use coffer_common::{DiskInfo, FileInfo, StorageResult, VolInfo};

/// Capability set over one disk.
///
/// A remote disk is identical in contract to a local one; the transport is
/// an implementation detail. File paths use forward slashes on every
/// platform. Directory entries returned by [`list_dir`](Self::list_dir) end
/// with a `/`; plain files do not.
#[async_trait]
pub trait StorageAPI: Send + Sync {
    /// Total/free capacity and filesystem type of the disk.
    async fn disk_info(&self) -> StorageResult<DiskInfo>;

    /// Create a volume.
    async fn make_vol(&self, volume: &str) -> StorageResult<()>;

    /// List all volumes, unsorted.
    async fn list_vols(&self) -> StorageResult<Vec<VolInfo>>;

    /// Stat a volume.
    async fn stat_vol(&self, volume: &str) -> StorageResult<VolInfo>;

    /// Delete an empty volume.
    async fn delete_vol(&self, volume: &str) -> StorageResult<()>;

    /// List the children of a directory, unsorted. Directories carry a
    /// trailing slash.
    async fn list_dir(&self, volume: &str, dir_path: &str) -> StorageResult<Vec<String>>;

    /// Read the full contents of a file.
    async fn read_all(&self, volume: &str, path: &str) -> StorageResult<Vec<u8>>;

    /// Read up to `buf.len()` bytes at `offset`. A short read is success;
    /// the returned count says how much of `buf` was filled.
    async fn read_file(
        &self,
        volume: &str,
        path: &str,
        offset: u64,
        buf: &mut [u8],
    ) -> StorageResult<u64>;

    /// Append bytes to a file, creating it (and parent directories) if
    /// absent.
    async fn append_file(&self, volume: &str, path: &str, buf: &[u8]) -> StorageResult<()>;

    /// Stat a regular file.
    async fn stat_file(&self, volume: &str, path: &str) -> StorageResult<FileInfo>;

    /// Atomically rename a file, creating destination parents implicitly.
    /// When both paths end with a slash the rename moves a whole directory.
    async fn rename_file(
        &self,
        src_volume: &str,
        src_path: &str,
        dst_volume: &str,
        dst_path: &str,
    ) -> StorageResult<()>;

    /// Delete a file and prune now-empty parents up to (but not including)
    /// the volume root.
    async fn delete_file(&self, volume: &str, path: &str) -> StorageResult<()>;
}
