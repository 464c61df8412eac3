//! Bucket operations.

use crate::namespace_lock::ops_id;
use crate::quorum::{
    count_success, is_err_ignored, reduce_quorum_errs, Reduced, BUCKET_METADATA_IGNORED_ERRS,
    BUCKET_OP_IGNORED_ERRS,
};
use crate::xl::XlObjects;
use coffer_common::{
    is_valid_bucket_name, path_join, to_object_err, BucketInfo, ObjectError, ObjectResult,
    StorageError, META_BUCKET, MPART_META_PREFIX,
};
use futures::future::join_all;
use tracing::debug;

impl XlObjects {
    /// Create a bucket on the disk set under write quorum.
    pub async fn make_bucket(&self, bucket: &str) -> ObjectResult<()> {
        if !is_valid_bucket_name(bucket) {
            return Err(ObjectError::BucketNameInvalid {
                bucket: bucket.to_string(),
            });
        }
        if self.is_bucket_exist(bucket).await {
            return Err(ObjectError::BucketExists {
                bucket: bucket.to_string(),
            });
        }

        let oid = ops_id();
        let _lock = self.ns_mutex.lock(bucket, "", &oid).await;

        let disks = self.disk_snapshot();
        let errs: Vec<Option<StorageError>> = join_all(disks.iter().map(|disk| async move {
            match disk {
                Some(disk) => disk.make_vol(bucket).await.err(),
                None => Some(StorageError::DiskNotFound),
            }
        }))
        .await;

        if count_success(&errs) < self.write_quorum {
            self.undo_make_bucket(bucket).await;
            return Err(ObjectError::WriteQuorum {
                bucket: bucket.to_string(),
                object: String::new(),
            });
        }
        match reduce_quorum_errs(&errs, BUCKET_OP_IGNORED_ERRS, self.write_quorum) {
            Reduced::Ok => {
                debug!(bucket, "created bucket");
                Ok(())
            }
            Reduced::Err(err) => Err(to_object_err(err, bucket, "")),
            Reduced::NoQuorum => Err(ObjectError::WriteQuorum {
                bucket: bucket.to_string(),
                object: String::new(),
            }),
        }
    }

    /// Roll a failed bucket creation back on the disks where it succeeded.
    async fn undo_make_bucket(&self, bucket: &str) {
        let disks = self.disk_snapshot();
        join_all(disks.iter().flatten().map(|disk| async move {
            let _ = disk.delete_vol(bucket).await;
        }))
        .await;
    }

    /// Re-create volume entries removed by a failed bucket delete. The
    /// recreated volumes come back empty; prior contents are not restored.
    async fn undo_delete_bucket(&self, bucket: &str) {
        let disks = self.disk_snapshot();
        join_all(disks.iter().flatten().map(|disk| async move {
            let _ = disk.make_vol(bucket).await;
        }))
        .await;
    }

    /// Stat a bucket from the first load-balanced disk that answers.
    pub async fn get_bucket_info(&self, bucket: &str) -> ObjectResult<BucketInfo> {
        if !is_valid_bucket_name(bucket) {
            return Err(ObjectError::BucketNameInvalid {
                bucket: bucket.to_string(),
            });
        }
        let oid = ops_id();
        let _lock = self.ns_mutex.rlock(bucket, "", &oid).await;
        self.get_bucket_info_unlocked(bucket).await
    }

    pub(crate) async fn get_bucket_info_unlocked(&self, bucket: &str) -> ObjectResult<BucketInfo> {
        let mut last_err = StorageError::DiskNotFound;
        for disk in self.load_balanced_disks().iter().flatten() {
            match disk.stat_vol(bucket).await {
                Ok(vol) => {
                    return Ok(BucketInfo {
                        name: vol.name,
                        created: vol.created,
                    })
                }
                Err(err) if is_err_ignored(&err, BUCKET_METADATA_IGNORED_ERRS) => {
                    // Disk went away; try the next one.
                    last_err = err;
                    continue;
                }
                Err(err) => return Err(to_object_err(err, bucket, "")),
            }
        }
        Err(to_object_err(last_err, bucket, ""))
    }

    /// Whether the bucket exists on at least one reachable disk.
    pub(crate) async fn is_bucket_exist(&self, bucket: &str) -> bool {
        let oid = ops_id();
        let _lock = self.ns_mutex.rlock(bucket, "", &oid).await;
        match self.get_bucket_info_unlocked(bucket).await {
            Ok(_) => true,
            Err(ObjectError::BucketNotFound { .. }) => false,
            Err(_) => false,
        }
    }

    /// List all buckets, sorted by name.
    pub async fn list_buckets(&self) -> ObjectResult<Vec<BucketInfo>> {
        let mut last_err = StorageError::DiskNotFound;
        for disk in self.load_balanced_disks().iter().flatten() {
            match disk.list_vols().await {
                Ok(vols) => {
                    let mut buckets: Vec<BucketInfo> = vols
                        .into_iter()
                        .filter(|vol| {
                            // Skip the reserved volume and anything the
                            // storage layer carries that is not a bucket.
                            vol.name != META_BUCKET && is_valid_bucket_name(&vol.name)
                        })
                        .map(|vol| BucketInfo {
                            name: vol.name,
                            created: vol.created,
                        })
                        .collect();
                    buckets.sort_by(|a, b| a.name.cmp(&b.name));
                    return Ok(buckets);
                }
                Err(err) if is_err_ignored(&err, BUCKET_METADATA_IGNORED_ERRS) => {
                    last_err = err;
                    continue;
                }
                Err(err) => return Err(to_object_err(err, "", "")),
            }
        }
        Err(to_object_err(last_err, "", ""))
    }

    /// Delete a bucket and its multipart bookkeeping under write quorum.
    pub async fn delete_bucket(&self, bucket: &str) -> ObjectResult<()> {
        if !is_valid_bucket_name(bucket) {
            return Err(ObjectError::BucketNameInvalid {
                bucket: bucket.to_string(),
            });
        }
        if !self.is_bucket_exist(bucket).await {
            return Err(ObjectError::BucketNotFound {
                bucket: bucket.to_string(),
            });
        }

        let oid = ops_id();
        let _lock = self.ns_mutex.lock(bucket, "", &oid).await;

        let disks = self.disk_snapshot();
        let mpart_dir = path_join(&[MPART_META_PREFIX, bucket]);
        let errs: Vec<Option<StorageError>> = join_all(disks.iter().map(|disk| {
            let mpart_dir = mpart_dir.clone();
            async move {
                let Some(disk) = disk else {
                    return Some(StorageError::DiskNotFound);
                };
                if let Err(err) = disk.delete_vol(bucket).await {
                    return Some(err);
                }
                // Purge any incomplete multipart state for this bucket.
                match self.cleanup_dir(disk.as_ref(), META_BUCKET, mpart_dir).await {
                    Ok(()) | Err(StorageError::FileNotFound | StorageError::VolumeNotFound) => None,
                    Err(err) => Some(err),
                }
            }
        }))
        .await;

        if count_success(&errs) < self.write_quorum {
            self.undo_delete_bucket(bucket).await;
            return Err(ObjectError::WriteQuorum {
                bucket: bucket.to_string(),
                object: String::new(),
            });
        }
        match reduce_quorum_errs(&errs, BUCKET_OP_IGNORED_ERRS, self.write_quorum) {
            Reduced::Ok => {
                debug!(bucket, "deleted bucket");
                Ok(())
            }
            Reduced::Err(err) => Err(to_object_err(err, bucket, "")),
            Reduced::NoQuorum => Err(ObjectError::WriteQuorum {
                bucket: bucket.to_string(),
                object: String::new(),
            }),
        }
    }
}
