//! Fault-injecting disk wrapper.
//!
//! Delegates to an inner disk for the first `n` calls, then returns a sticky
//! `FaultyDisk` error. Quorum-tolerance tests use this to take disks offline
//! at precise points of an operation.

use crate::api::StorageAPI;
use async_trait::async_trait;
use coffer_common::{DiskInfo, FileInfo, StorageError, StorageResult, VolInfo};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

/// A disk that goes bad after a configured number of successful calls.
pub struct FaultyDisk {
    inner: Arc<dyn StorageAPI>,
    remaining: AtomicI64,
}

impl FaultyDisk {
    /// Wrap `inner`, allowing `successes` calls through before failing.
    pub fn new(inner: Arc<dyn StorageAPI>, successes: i64) -> Self {
        Self {
            inner,
            remaining: AtomicI64::new(successes),
        }
    }

    fn take_call(&self) -> StorageResult<()> {
        if self.remaining.fetch_sub(1, Ordering::SeqCst) > 0 {
            Ok(())
        } else {
            Err(StorageError::FaultyDisk)
        }
    }
}

#[async_trait]
impl StorageAPI for FaultyDisk {
    async fn disk_info(&self) -> StorageResult<DiskInfo> {
        self.take_call()?;
        self.inner.disk_info().await
    }

    async fn make_vol(&self, volume: &str) -> StorageResult<()> {
        self.take_call()?;
        self.inner.make_vol(volume).await
    }

    async fn list_vols(&self) -> StorageResult<Vec<VolInfo>> {
        self.take_call()?;
        self.inner.list_vols().await
    }

    async fn stat_vol(&self, volume: &str) -> StorageResult<VolInfo> {
        self.take_call()?;
        self.inner.stat_vol(volume).await
    }

    async fn delete_vol(&self, volume: &str) -> StorageResult<()> {
        self.take_call()?;
        self.inner.delete_vol(volume).await
    }

    async fn list_dir(&self, volume: &str, dir_path: &str) -> StorageResult<Vec<String>> {
        self.take_call()?;
        self.inner.list_dir(volume, dir_path).await
    }

    async fn read_all(&self, volume: &str, path: &str) -> StorageResult<Vec<u8>> {
        self.take_call()?;
        self.inner.read_all(volume, path).await
    }

    async fn read_file(
        &self,
        volume: &str,
        path: &str,
        offset: u64,
        buf: &mut [u8],
    ) -> StorageResult<u64> {
        self.take_call()?;
        self.inner.read_file(volume, path, offset, buf).await
    }

    async fn append_file(&self, volume: &str, path: &str, buf: &[u8]) -> StorageResult<()> {
        self.take_call()?;
        self.inner.append_file(volume, path, buf).await
    }

    async fn stat_file(&self, volume: &str, path: &str) -> StorageResult<FileInfo> {
        self.take_call()?;
        self.inner.stat_file(volume, path).await
    }

    async fn rename_file(
        &self,
        src_volume: &str,
        src_path: &str,
        dst_volume: &str,
        dst_path: &str,
    ) -> StorageResult<()> {
        self.take_call()?;
        self.inner
            .rename_file(src_volume, src_path, dst_volume, dst_path)
            .await
    }

    async fn delete_file(&self, volume: &str, path: &str) -> StorageResult<()> {
        self.take_call()?;
        self.inner.delete_file(volume, path).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::posix::PosixDisk;
    use tempfile::tempdir;

    #[tokio::test]
    async fn fails_after_budget_exhausted() {
        let dir = tempdir().unwrap();
        let inner: Arc<dyn StorageAPI> = Arc::new(PosixDisk::new(dir.path().join("d")).unwrap());
        inner.make_vol("testvolume").await.unwrap();

        let faulty = FaultyDisk::new(inner, 2);
        assert!(faulty.stat_vol("testvolume").await.is_ok());
        assert!(faulty.stat_vol("testvolume").await.is_ok());
        assert_eq!(
            faulty.stat_vol("testvolume").await,
            Err(StorageError::FaultyDisk)
        );
        // The failure is sticky.
        assert_eq!(
            faulty.list_vols().await.unwrap_err(),
            StorageError::FaultyDisk
        );
    }
}
