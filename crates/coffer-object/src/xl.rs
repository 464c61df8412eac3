//! The XL object store: a fixed set of disks plus quorum arithmetic.

use crate::cache::ObjectCache;
use crate::format::load_or_init_format;
use crate::meta::{XlMetaV1, XL_META_JSON_FILE};
use crate::namespace_lock::NsLockMap;
use crate::quorum::{is_err_ignored, reduce_errs};
use crate::tree_walk::TreeWalkSource;
use crate::tree_walk_pool::TreeWalkPool;
use async_trait::async_trait;
use coffer_common::{
    ObjectError, ObjectResult, StorageError, StorageInfo, StorageResult, SLASH_SEPARATOR,
};
use coffer_erasure::ErasureCodec;
use coffer_storage::StorageAPI;
use futures::future::join_all;
use parking_lot::RwLock;
use rand::Rng;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// Erasure coding happens in blocks of this many bytes of object data.
pub const BLOCK_SIZE: usize = 10 * 1024 * 1024;

/// Disk-set sizes the XL layer accepts.
pub const VALID_DISK_COUNTS: &[usize] = &[4, 6, 8, 12, 16];

/// Tuning knobs for [`XlObjects`].
pub struct XlOptions {
    /// Idle timeout of parked listing walks.
    pub tree_walk_timeout: Duration,
    /// Serve whole small objects from an in-memory LRU.
    pub cache_enabled: bool,
    /// Record per-operation diagnostics in the namespace lock map.
    pub trace_locks: bool,
}

impl Default for XlOptions {
    fn default() -> Self {
        Self {
            tree_walk_timeout: crate::tree_walk_pool::TREE_WALK_TIMEOUT,
            cache_enabled: true,
            trace_locks: false,
        }
    }
}

/// Erasure-coded object store over exactly N disks.
pub struct XlObjects {
    pub(crate) disks: RwLock<Vec<Option<Arc<dyn StorageAPI>>>>,
    pub(crate) data_blocks: usize,
    pub(crate) parity_blocks: usize,
    pub(crate) read_quorum: usize,
    pub(crate) write_quorum: usize,
    pub(crate) codec: ErasureCodec,
    pub(crate) ns_mutex: Arc<NsLockMap>,
    pub(crate) list_pool: Arc<TreeWalkPool>,
    pub(crate) obj_cache: ObjectCache,
    pub(crate) cache_enabled: AtomicBool,
}

impl XlObjects {
    /// Construct the object layer over `disks` with default options. Disk
    /// slots may be `None` (absent at construction).
    pub async fn new(disks: Vec<Option<Arc<dyn StorageAPI>>>) -> ObjectResult<Self> {
        Self::with_options(disks, XlOptions::default()).await
    }

    /// Construct with explicit options.
    pub async fn with_options(
        disks: Vec<Option<Arc<dyn StorageAPI>>>,
        options: XlOptions,
    ) -> ObjectResult<Self> {
        let disk_count = disks.len();
        if !VALID_DISK_COUNTS.contains(&disk_count) {
            return Err(ObjectError::Storage(StorageError::InvalidArgument));
        }
        let data_blocks = disk_count / 2;
        let parity_blocks = disk_count - data_blocks;
        let write_quorum = disk_count / 2 + 1;
        let read_quorum = disk_count - (write_quorum - 1);
        let codec = ErasureCodec::new(data_blocks, parity_blocks)
            .map_err(|err| ObjectError::Storage(StorageError::Io(err.to_string())))?;

        let xl = Self {
            disks: RwLock::new(disks),
            data_blocks,
            parity_blocks,
            read_quorum,
            write_quorum,
            codec,
            ns_mutex: Arc::new(NsLockMap::new(options.trace_locks)),
            list_pool: Arc::new(TreeWalkPool::new(options.tree_walk_timeout)),
            obj_cache: ObjectCache::default(),
            cache_enabled: AtomicBool::new(options.cache_enabled),
        };
        xl.init_format_files().await?;
        info!(
            disks = disk_count,
            write_quorum, read_quorum, "initialized XL object layer"
        );
        Ok(xl)
    }

    /// Mint or validate `format.json` on every present disk; enough disks
    /// must be usable to meet the write quorum.
    async fn init_format_files(&self) -> ObjectResult<()> {
        let disks = self.disk_snapshot();
        let results = join_all(disks.iter().map(|disk| async move {
            match disk {
                Some(disk) => load_or_init_format(disk.as_ref()).await.map(|_| ()),
                None => Err(StorageError::DiskNotFound),
            }
        }))
        .await;
        let errs: Vec<Option<StorageError>> = results.into_iter().map(Result::err).collect();
        let ok = errs.iter().filter(|e| e.is_none()).count();
        if ok < self.write_quorum {
            let (modal, _) = reduce_errs(&errs, &[]);
            warn!(ok, want = self.write_quorum, "not enough formatted disks");
            return Err(ObjectError::Storage(
                modal.unwrap_or(StorageError::UnformattedDisk),
            ));
        }
        Ok(())
    }

    /// Number of disk slots.
    #[must_use]
    pub fn disk_count(&self) -> usize {
        self.disks.read().len()
    }

    #[must_use]
    pub fn write_quorum(&self) -> usize {
        self.write_quorum
    }

    #[must_use]
    pub fn read_quorum(&self) -> usize {
        self.read_quorum
    }

    /// The namespace lock manager, for the lock-state RPC endpoint.
    #[must_use]
    pub fn ns_lock_map(&self) -> Arc<NsLockMap> {
        self.ns_mutex.clone()
    }

    /// Enable or disable the whole-object cache.
    pub fn set_cache_enabled(&self, enabled: bool) {
        self.cache_enabled.store(enabled, Ordering::SeqCst);
    }

    pub(crate) fn cache_enabled(&self) -> bool {
        self.cache_enabled.load(Ordering::SeqCst)
    }

    /// Replace a disk slot at runtime (fault injection, heal rejoin).
    pub fn set_disk(&self, index: usize, disk: Option<Arc<dyn StorageAPI>>) {
        let mut disks = self.disks.write();
        if index < disks.len() {
            disks[index] = disk;
        }
    }

    /// Current view of the disk slots.
    #[must_use]
    pub fn disk_snapshot(&self) -> Vec<Option<Arc<dyn StorageAPI>>> {
        self.disks.read().clone()
    }

    /// The disk slots rotated by a random amount, spreading read traffic.
    pub(crate) fn load_balanced_disks(&self) -> Vec<Option<Arc<dyn StorageAPI>>> {
        let disks = self.disk_snapshot();
        let n = disks.len();
        let start = rand::thread_rng().gen_range(0..n);
        let mut rotated = Vec::with_capacity(n);
        for i in 0..n {
            rotated.push(disks[(start + i) % n].clone());
        }
        rotated
    }

    /// Aggregate capacity over the present disks.
    pub async fn storage_info(&self) -> StorageInfo {
        let disks = self.disk_snapshot();
        let infos = join_all(disks.iter().flatten().map(|disk| disk.disk_info())).await;
        let mut total = StorageInfo::default();
        for info in infos.into_iter().flatten() {
            total.total += info.total;
            total.free += info.free;
        }
        total
    }

    /// Quiesce the layer before process exit. Outstanding operations finish
    /// under their namespace locks; nothing else is buffered.
    pub async fn shutdown(&self) -> ObjectResult<()> {
        info!("object layer shutting down");
        Ok(())
    }

    /// Whether `prefix` names an object (an `xl.json` exists under it) on
    /// any reachable disk.
    pub(crate) async fn is_object(&self, bucket: &str, prefix: &str) -> bool {
        let meta_path = join_object_path(prefix, XL_META_JSON_FILE);
        for disk in self.load_balanced_disks().iter().flatten() {
            // Any disk carrying the metadata sibling settles it; failures
            // mean trying the next disk, whatever their kind.
            if disk.stat_file(bucket, &meta_path).await.is_ok() {
                return true;
            }
        }
        false
    }

    /// Read `xl.json` for an object from every disk in parallel.
    pub(crate) async fn read_xl_metadata_all(
        &self,
        disks: &[Option<Arc<dyn StorageAPI>>],
        bucket: &str,
        object: &str,
    ) -> (Vec<Option<XlMetaV1>>, Vec<Option<StorageError>>) {
        let meta_path = join_object_path(object, XL_META_JSON_FILE);
        let results = join_all(disks.iter().map(|disk| {
            let meta_path = meta_path.clone();
            async move {
                match disk {
                    Some(disk) => match disk.read_all(bucket, &meta_path).await {
                        Ok(data) => match serde_json::from_slice::<XlMetaV1>(&data) {
                            Ok(meta) if meta.is_valid() => (Some(meta), None),
                            _ => (None, Some(StorageError::CorruptedFormat)),
                        },
                        Err(err) => (None, Some(err)),
                    },
                    None => (None, Some(StorageError::DiskNotFound)),
                }
            }
        }))
        .await;
        results.into_iter().unzip()
    }

    /// Pick the latest consistent metadata among the per-disk reads.
    pub(crate) fn pick_valid_meta(metas: &[Option<XlMetaV1>]) -> Option<XlMetaV1> {
        metas
            .iter()
            .flatten()
            .max_by_key(|meta| meta.stat.mod_time)
            .cloned()
    }

    /// Write per-disk metadata (each clone carries its own erasure index)
    /// under `volume/prefix/xl.json`, replacing any previous file.
    pub(crate) async fn write_xl_metadata(
        &self,
        disks: &[Option<Arc<dyn StorageAPI>>],
        volume: &str,
        prefix: &str,
        metas: &[XlMetaV1],
    ) -> Vec<Option<StorageError>> {
        let meta_path = join_object_path(prefix, XL_META_JSON_FILE);
        join_all(disks.iter().zip(metas.iter()).map(|(disk, meta)| {
            let meta_path = meta_path.clone();
            async move {
                let Some(disk) = disk else {
                    return Some(StorageError::DiskNotFound);
                };
                let data = match serde_json::to_vec(meta) {
                    Ok(data) => data,
                    Err(err) => return Some(StorageError::Io(err.to_string())),
                };
                match disk.delete_file(volume, &meta_path).await {
                    Ok(()) | Err(StorageError::FileNotFound) => {}
                    Err(err) => return Some(err),
                }
                disk.append_file(volume, &meta_path, &data).await.err()
            }
        }))
        .await
    }

    /// Per-disk clones of `meta` with the erasure index filled in.
    pub(crate) fn metas_with_indexes(&self, meta: &XlMetaV1) -> Vec<XlMetaV1> {
        (1..=self.disk_count())
            .map(|index| {
                let mut m = meta.clone();
                m.erasure.index = index;
                m
            })
            .collect()
    }

    /// Recursively delete everything under `dir_path` on one disk. The
    /// per-file deletes prune emptied directories on the way out.
    pub(crate) fn cleanup_dir<'a>(
        &'a self,
        disk: &'a dyn StorageAPI,
        volume: &'a str,
        dir_path: String,
    ) -> Pin<Box<dyn Future<Output = StorageResult<()>> + Send + 'a>> {
        Box::pin(async move {
            let dir = coffer_common::retain_slash(&dir_path);
            let entries = match disk.list_dir(volume, &dir).await {
                Ok(entries) => entries,
                Err(StorageError::FileNotFound) => return Ok(()),
                Err(err) => return Err(err),
            };
            for entry in entries {
                let full = format!("{dir}{entry}");
                if entry.ends_with(SLASH_SEPARATOR) {
                    self.cleanup_dir(disk, volume, full).await?;
                } else {
                    match disk.delete_file(volume, &full).await {
                        Ok(()) | Err(StorageError::FileNotFound) => {}
                        Err(err) => return Err(err),
                    }
                }
            }
            // The directory itself may survive when it held no files.
            match disk.delete_file(volume, &dir).await {
                Ok(()) | Err(StorageError::FileNotFound) => Ok(()),
                Err(err) => Err(err),
            }
        })
    }

    /// Walk source over the current disk set: first reachable disk serves
    /// each directory listing, the rest are failover.
    pub(crate) fn walk_source(&self) -> Arc<dyn TreeWalkSource> {
        Arc::new(XlWalkSource {
            disks: self.load_balanced_disks(),
        })
    }
}

/// Join an object prefix and a file name with a slash.
pub(crate) fn join_object_path(prefix: &str, name: &str) -> String {
    if prefix.is_empty() {
        name.to_string()
    } else if prefix.ends_with(SLASH_SEPARATOR) {
        format!("{prefix}{name}")
    } else {
        format!("{prefix}/{name}")
    }
}

/// Errors that make the walker try the next disk instead of failing.
const TREE_WALK_IGNORED_ERRS: &[StorageError] = &[
    StorageError::DiskNotFound,
    StorageError::FaultyDisk,
    StorageError::DiskAccessDenied,
    StorageError::VolumeBusy,
];

struct XlWalkSource {
    disks: Vec<Option<Arc<dyn StorageAPI>>>,
}

#[async_trait]
impl TreeWalkSource for XlWalkSource {
    async fn list_dir(&self, volume: &str, dir_path: &str) -> StorageResult<Vec<String>> {
        let mut last_err = StorageError::DiskNotFound;
        for disk in self.disks.iter().flatten() {
            match disk.list_dir(volume, dir_path).await {
                Ok(entries) => return Ok(entries),
                Err(err) if is_err_ignored(&err, TREE_WALK_IGNORED_ERRS) => {
                    last_err = err;
                    continue;
                }
                Err(err) => return Err(err),
            }
        }
        Err(last_err)
    }

    async fn is_leaf(&self, volume: &str, path: &str) -> bool {
        let meta_path = format!("{}{}", coffer_common::retain_slash(path), XL_META_JSON_FILE);
        for disk in self.disks.iter().flatten() {
            match disk.stat_file(volume, &meta_path).await {
                Ok(_) => return true,
                Err(err) if is_err_ignored(&err, TREE_WALK_IGNORED_ERRS) => continue,
                Err(_) => return false,
            }
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use coffer_storage::PosixDisk;
    use tempfile::tempdir;

    #[tokio::test]
    async fn rejects_invalid_disk_counts() {
        for n in [0usize, 3, 5, 7, 17] {
            let disks: Vec<Option<Arc<dyn StorageAPI>>> = (0..n).map(|_| None).collect();
            assert!(XlObjects::new(disks).await.is_err(), "count {n}");
        }
    }

    #[tokio::test]
    async fn quorum_arithmetic() {
        let dir = tempdir().unwrap();
        let disks: Vec<Option<Arc<dyn StorageAPI>>> = (0..16)
            .map(|i| {
                let disk = PosixDisk::new(dir.path().join(format!("disk{i}"))).unwrap();
                Some(Arc::new(disk) as Arc<dyn StorageAPI>)
            })
            .collect();
        let xl = XlObjects::new(disks).await.unwrap();
        assert_eq!(xl.write_quorum(), 9);
        assert_eq!(xl.read_quorum(), 8);
        assert_eq!(xl.data_blocks, 8);
        assert_eq!(xl.parity_blocks, 8);
    }

    #[tokio::test]
    async fn walk_source_fails_over_between_disks() {
        let dir = tempdir().unwrap();
        let disk1 = Arc::new(PosixDisk::new(dir.path().join("d1")).unwrap());
        let disk2 = Arc::new(PosixDisk::new(dir.path().join("d2")).unwrap());
        for (i, disk) in [disk1.clone(), disk2.clone()].iter().enumerate() {
            disk.make_vol("testvolume").await.unwrap();
            disk.append_file("testvolume", &format!("file{}", i + 1), b"")
                .await
                .unwrap();
        }

        let source = XlWalkSource {
            disks: vec![Some(disk1.clone()), Some(disk2.clone())],
        };
        let entries = source.list_dir("testvolume", "").await.unwrap();
        assert_eq!(entries, vec!["file1".to_string()]);

        // First disk vanishes: the walker moves to the second.
        std::fs::remove_dir_all(dir.path().join("d1")).unwrap();
        let entries = source.list_dir("testvolume", "").await.unwrap();
        assert_eq!(entries, vec!["file2".to_string()]);

        // Both gone: the listing reports an absent disk.
        std::fs::remove_dir_all(dir.path().join("d2")).unwrap();
        assert_eq!(
            source.list_dir("testvolume", "").await,
            Err(StorageError::DiskNotFound)
        );
    }
}
