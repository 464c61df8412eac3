//! Healing: rebuilding missing or stale shards and disk metadata.

use crate::format::{load_format, save_format, FormatInfo};
use crate::meta::XlMetaV1;
use crate::namespace_lock::ops_id;
use crate::xl::{join_object_path, XlObjects, BLOCK_SIZE};
use coffer_common::{
    is_valid_bucket_name, is_valid_object_name, path_join, ObjectError, ObjectResult,
    StorageError, META_BUCKET, TMP_META_PREFIX,
};
use coffer_storage::StorageAPI;
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

impl XlObjects {
    /// Rebuild an object on every disk whose shard or metadata is missing
    /// or stale, reconstructing from the healthy quorum.
    pub async fn heal_object(&self, bucket: &str, object: &str) -> ObjectResult<()> {
        if !is_valid_bucket_name(bucket) {
            return Err(ObjectError::BucketNameInvalid {
                bucket: bucket.to_string(),
            });
        }
        if !is_valid_object_name(object) {
            return Err(ObjectError::ObjectNameInvalid {
                bucket: bucket.to_string(),
                object: object.to_string(),
            });
        }
        let oid = ops_id();
        let _lock = self.ns_mutex.lock(bucket, object, &oid).await;

        let disks = self.disk_snapshot();
        let (metas, _errs) = self.read_xl_metadata_all(&disks, bucket, object).await;
        let Some(latest) = Self::pick_valid_meta(&metas) else {
            // No readable copy anywhere; surface the quorum-mapped error.
            return match self.read_quorum_meta(&disks, bucket, object).await {
                Ok(_) => Ok(()),
                Err(err) => Err(err),
            };
        };

        // Disks carrying the current version serve as the repair source.
        let mut healthy: Vec<Option<Arc<dyn StorageAPI>>> = vec![None; disks.len()];
        let mut outdated: Vec<usize> = Vec::new();
        for (i, disk) in disks.iter().enumerate() {
            match (&metas[i], disk) {
                (Some(meta), Some(d)) if meta.is_consistent_with(&latest) => {
                    healthy[i] = Some(d.clone());
                }
                (_, Some(_)) => outdated.push(i),
                (_, None) => {}
            }
        }
        let healthy_count = healthy.iter().flatten().count();
        if healthy_count < self.data_blocks {
            return Err(ObjectError::ReadQuorum {
                bucket: bucket.to_string(),
                object: object.to_string(),
            });
        }
        if outdated.is_empty() {
            return Ok(());
        }
        info!(bucket, object, outdated = outdated.len(), "healing object");

        // Stage reconstructed shards under tmp, then swap them in per disk.
        let tmp_prefix = path_join(&[TMP_META_PREFIX, &Uuid::new_v4().to_string()]);
        let heal_result = self
            .rebuild_outdated(&disks, &healthy, &outdated, &latest, bucket, object, &tmp_prefix)
            .await;
        if let Err(err) = heal_result {
            self.cleanup_tmp(&disks, &tmp_prefix).await;
            return Err(err);
        }

        for &i in &outdated {
            let Some(disk) = disks[i].as_ref() else { continue };
            if let Err(err) = self
                .cleanup_dir(disk.as_ref(), bucket, object.to_string())
                .await
            {
                warn!(bucket, object, disk = i, %err, "failed clearing stale object copy");
            }
            if let Err(err) = disk
                .rename_file(
                    META_BUCKET,
                    &format!("{tmp_prefix}/"),
                    bucket,
                    &format!("{object}/"),
                )
                .await
            {
                warn!(bucket, object, disk = i, %err, "failed installing healed copy");
            }
        }
        self.cleanup_tmp(&disks, &tmp_prefix).await;
        Ok(())
    }

    /// Reconstruct each part of `latest` from the healthy disks and append
    /// the shard for every outdated disk under `tmp_prefix`.
    #[allow(clippy::too_many_arguments)]
    async fn rebuild_outdated(
        &self,
        disks: &[Option<Arc<dyn StorageAPI>>],
        healthy: &[Option<Arc<dyn StorageAPI>>],
        outdated: &[usize],
        latest: &XlMetaV1,
        bucket: &str,
        object: &str,
        tmp_prefix: &str,
    ) -> ObjectResult<()> {
        let block_size = BLOCK_SIZE as u64;
        let full_shard_size = self.codec.shard_size(BLOCK_SIZE) as u64;

        for part in &latest.parts {
            let part_path = join_object_path(object, &part.name);
            let tmp_part = join_object_path(tmp_prefix, &part.name);
            if part.size == 0 {
                for &i in outdated {
                    if let Some(disk) = disks[i].as_ref() {
                        disk.append_file(META_BUCKET, &tmp_part, b"")
                            .await
                            .map_err(ObjectError::Storage)?;
                    }
                }
                continue;
            }
            let blocks = part.size.div_ceil(block_size);
            for block_idx in 0..blocks {
                let block_len = (part.size - block_idx * block_size).min(block_size) as usize;
                let shard_len = self.codec.shard_size(block_len);
                let file_offset = block_idx * full_shard_size;

                let shards = self
                    .gather_shards(healthy, bucket, &part_path, file_offset, shard_len)
                    .await;
                let mut shards = shards.ok_or_else(|| ObjectError::ReadQuorum {
                    bucket: bucket.to_string(),
                    object: object.to_string(),
                })?;
                let block = self
                    .codec
                    .decode(&mut shards, block_len)
                    .map_err(|err| ObjectError::Storage(StorageError::Io(err.to_string())))?;
                let rebuilt = self
                    .codec
                    .encode(&block)
                    .map_err(|err| ObjectError::Storage(StorageError::Io(err.to_string())))?;

                for &i in outdated {
                    if let Some(disk) = disks[i].as_ref() {
                        disk.append_file(META_BUCKET, &tmp_part, &rebuilt[i])
                            .await
                            .map_err(ObjectError::Storage)?;
                    }
                }
            }
        }

        // Fresh metadata for the healed disks, each with its own index.
        let metas = self.metas_with_indexes(latest);
        for &i in outdated {
            if let Some(disk) = disks[i].as_ref() {
                let data = serde_json::to_vec(&metas[i])
                    .map_err(|err| ObjectError::Storage(StorageError::Io(err.to_string())))?;
                let meta_path = join_object_path(tmp_prefix, crate::meta::XL_META_JSON_FILE);
                disk.append_file(META_BUCKET, &meta_path, &data)
                    .await
                    .map_err(ObjectError::Storage)?;
            }
        }
        Ok(())
    }

    /// Re-establish disk identity files: any present disk whose
    /// `format.json` is missing or unreadable gets a fresh one.
    pub async fn heal_disk_metadata(&self) -> ObjectResult<()> {
        let disks = self.disk_snapshot();
        let mut healed = 0usize;
        for disk in disks.iter().flatten() {
            match disk.make_vol(META_BUCKET).await {
                Ok(()) | Err(StorageError::VolumeExists) => {}
                Err(err) => {
                    warn!(%err, "cannot create meta volume while healing");
                    continue;
                }
            }
            match load_format(disk.as_ref()).await {
                Ok(_) => {}
                Err(StorageError::UnformattedDisk | StorageError::CorruptedFormat) => {
                    let format = FormatInfo::new();
                    if let Err(err) = save_format(disk.as_ref(), &format).await {
                        warn!(%err, "failed writing fresh disk format");
                    } else {
                        healed += 1;
                    }
                }
                Err(err) => warn!(%err, "cannot read disk format while healing"),
            }
        }
        if healed > 0 {
            info!(healed, "healed disk metadata");
        }
        Ok(())
    }
}
