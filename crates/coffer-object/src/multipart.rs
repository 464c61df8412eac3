//! Multipart upload operations.
//!
//! Upload state lives under the reserved meta volume at
//! `multipart/<bucket>/<object>/<uploadID>`: one erasure-coded file per
//! part plus the upload's metadata sibling. Completion renames the
//! assembled directory into the bucket under write-quorum semantics.

use crate::meta::ObjectPartInfo;
use crate::namespace_lock::ops_id;
use crate::quorum::count_success;
use crate::tree_walk::start_tree_walk;
use crate::xl::{join_object_path, XlObjects};
use chrono::{DateTime, Utc};
use coffer_storage::StorageAPI;
use coffer_common::{
    is_valid_bucket_name, is_valid_object_name, is_valid_object_prefix, path_join, retain_slash,
    to_object_err, CompletePart, ListMultipartsInfo, ListPartsInfo, MultipartUploadInfo,
    ObjectError, ObjectResult, PartInfo, StorageError, MAX_OBJECT_SIZE, MAX_PARTS_LIST,
    MAX_PART_ID, MAX_UPLOADS_LIST, META_BUCKET, MIN_PART_SIZE, MPART_META_PREFIX,
    SLASH_SEPARATOR, TMP_META_PREFIX,
};
use futures::future::join_all;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::io::AsyncRead;
use tokio::sync::watch;
use tracing::debug;
use uuid::Uuid;

impl XlObjects {
    fn upload_id_path(bucket: &str, object: &str, upload_id: &str) -> String {
        path_join(&[MPART_META_PREFIX, bucket, object, upload_id])
    }

    async fn is_upload_id_exists(&self, bucket: &str, object: &str, upload_id: &str) -> bool {
        let path = Self::upload_id_path(bucket, object, upload_id);
        self.is_object(META_BUCKET, &path).await
    }

    fn check_multipart_args(&self, bucket: &str, object: &str) -> ObjectResult<()> {
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
        Ok(())
    }

    /// Begin a multipart upload; returns the upload id.
    pub async fn new_multipart_upload(
        &self,
        bucket: &str,
        object: &str,
        metadata: HashMap<String, String>,
    ) -> ObjectResult<String> {
        self.check_multipart_args(bucket, object)?;
        if !self.is_bucket_exist(bucket).await {
            return Err(ObjectError::BucketNotFound {
                bucket: bucket.to_string(),
            });
        }

        let upload_id = Uuid::new_v4().to_string();
        let upload_path = Self::upload_id_path(bucket, object, &upload_id);
        let oid = ops_id();
        let _lock = self.ns_mutex.lock(META_BUCKET, &upload_path, &oid).await;

        let disks = self.disk_snapshot();
        let mut meta = crate::meta::XlMetaV1::new(
            self.data_blocks,
            self.parity_blocks,
            crate::xl::BLOCK_SIZE,
        );
        meta.stat.mod_time = Utc::now();
        meta.meta = metadata;

        let metas = self.metas_with_indexes(&meta);
        let errs = self
            .write_xl_metadata(&disks, META_BUCKET, &upload_path, &metas)
            .await;
        if count_success(&errs) < self.write_quorum {
            self.cleanup_tmp(&disks, &upload_path).await;
            return Err(ObjectError::WriteQuorum {
                bucket: bucket.to_string(),
                object: object.to_string(),
            });
        }
        debug!(bucket, object, %upload_id, "created multipart upload");
        Ok(upload_id)
    }

    /// Upload (or re-upload) one part; returns the part's hex MD5.
    #[allow(clippy::too_many_arguments)]
    pub async fn put_object_part<R>(
        &self,
        bucket: &str,
        object: &str,
        upload_id: &str,
        part_id: u32,
        size: u64,
        reader: &mut R,
        md5_hex: &str,
    ) -> ObjectResult<String>
    where
        R: AsyncRead + Unpin + Send,
    {
        self.check_multipart_args(bucket, object)?;
        if !self.is_bucket_exist(bucket).await {
            return Err(ObjectError::BucketNotFound {
                bucket: bucket.to_string(),
            });
        }
        if part_id == 0 || part_id > MAX_PART_ID {
            return Err(ObjectError::InvalidPart {
                part_number: part_id,
            });
        }
        if size > MAX_OBJECT_SIZE {
            return Err(ObjectError::EntityTooLarge {
                size,
                max_size: MAX_OBJECT_SIZE,
            });
        }
        if !self.is_upload_id_exists(bucket, object, upload_id).await {
            return Err(ObjectError::InvalidUploadId {
                upload_id: upload_id.to_string(),
            });
        }

        let upload_path = Self::upload_id_path(bucket, object, upload_id);
        let oid = ops_id();
        let _lock = self.ns_mutex.lock(META_BUCKET, &upload_path, &oid).await;

        let disks = self.disk_snapshot();
        let mut meta = self
            .read_quorum_meta(&disks, META_BUCKET, &upload_path)
            .await
            .map_err(|err| match err {
                ObjectError::ObjectNotFound { .. } => ObjectError::InvalidUploadId {
                    upload_id: upload_id.to_string(),
                },
                other => other,
            })?;

        let part_name = format!("part.{part_id}");
        let tmp_id = Uuid::new_v4().to_string();
        let tmp_prefix = path_join(&[TMP_META_PREFIX, &tmp_id]);
        let tmp_part = join_object_path(&tmp_prefix, &part_name);

        let outcome = match self
            .erasure_write(&disks, META_BUCKET, &tmp_part, reader, size)
            .await
        {
            Ok(outcome) => outcome,
            Err(err) => {
                self.cleanup_tmp(&disks, &tmp_prefix).await;
                return Err(err);
            }
        };
        if count_success(&outcome.errs) < self.write_quorum {
            self.cleanup_tmp(&disks, &tmp_prefix).await;
            return Err(ObjectError::WriteQuorum {
                bucket: bucket.to_string(),
                object: object.to_string(),
            });
        }
        if !md5_hex.is_empty() && !md5_hex.eq_ignore_ascii_case(&outcome.md5_hex) {
            self.cleanup_tmp(&disks, &tmp_prefix).await;
            return Err(ObjectError::BadDigest {
                expected_md5: md5_hex.to_string(),
                calculated_md5: outcome.md5_hex,
            });
        }

        // Move the staged part into the upload directory; re-uploading a
        // part number overwrites the previous file.
        let dst_part = join_object_path(&upload_path, &part_name);
        let rename_errs: Vec<Option<StorageError>> =
            join_all(disks.iter().map(|disk| {
                let (src, dst) = (tmp_part.clone(), dst_part.clone());
                async move {
                    match disk {
                        Some(disk) => disk
                            .rename_file(META_BUCKET, &src, META_BUCKET, &dst)
                            .await
                            .err(),
                        None => Some(StorageError::DiskNotFound),
                    }
                }
            }))
            .await;
        if count_success(&rename_errs) < self.write_quorum {
            self.cleanup_tmp(&disks, &tmp_prefix).await;
            return Err(ObjectError::WriteQuorum {
                bucket: bucket.to_string(),
                object: object.to_string(),
            });
        }
        self.cleanup_tmp(&disks, &tmp_prefix).await;

        meta.add_object_part(ObjectPartInfo {
            number: part_id,
            name: part_name,
            etag: outcome.md5_hex.clone(),
            size,
        });
        meta.stat.mod_time = Utc::now();
        let metas = self.metas_with_indexes(&meta);
        let meta_errs = self
            .write_xl_metadata(&disks, META_BUCKET, &upload_path, &metas)
            .await;
        if count_success(&meta_errs) < self.write_quorum {
            return Err(ObjectError::WriteQuorum {
                bucket: bucket.to_string(),
                object: object.to_string(),
            });
        }
        debug!(bucket, object, upload_id, part_id, size, "stored part");
        Ok(outcome.md5_hex)
    }

    /// List parts of an upload past `part_number_marker`.
    pub async fn list_object_parts(
        &self,
        bucket: &str,
        object: &str,
        upload_id: &str,
        part_number_marker: u32,
        max_parts: i64,
    ) -> ObjectResult<ListPartsInfo> {
        self.check_multipart_args(bucket, object)?;
        if !self.is_upload_id_exists(bucket, object, upload_id).await {
            return Err(ObjectError::InvalidUploadId {
                upload_id: upload_id.to_string(),
            });
        }
        let max_parts = if max_parts < 0 || max_parts as u128 > MAX_PARTS_LIST as u128 {
            MAX_PARTS_LIST
        } else {
            max_parts as usize
        };

        let upload_path = Self::upload_id_path(bucket, object, upload_id);
        let oid = ops_id();
        let _lock = self.ns_mutex.rlock(META_BUCKET, &upload_path, &oid).await;

        let disks = self.disk_snapshot();
        let meta = self
            .read_quorum_meta(&disks, META_BUCKET, &upload_path)
            .await?;

        let mut result = ListPartsInfo {
            bucket: bucket.to_string(),
            object: object.to_string(),
            upload_id: upload_id.to_string(),
            part_number_marker,
            max_parts,
            ..Default::default()
        };
        if max_parts == 0 {
            return Ok(result);
        }

        let eligible: Vec<&ObjectPartInfo> = meta
            .parts
            .iter()
            .filter(|p| p.number > part_number_marker)
            .collect();
        for part in eligible.iter().take(max_parts) {
            result.parts.push(PartInfo {
                part_number: part.number,
                last_modified: meta.stat.mod_time,
                etag: part.etag.clone(),
                size: part.size,
            });
        }
        if eligible.len() > max_parts {
            result.is_truncated = true;
            result.next_part_number_marker =
                result.parts.last().map(|p| p.part_number).unwrap_or_default();
        }
        Ok(result)
    }

    /// Complete a multipart upload from the supplied part list; returns the
    /// composite ETag.
    pub async fn complete_multipart_upload(
        &self,
        bucket: &str,
        object: &str,
        upload_id: &str,
        parts: &[CompletePart],
    ) -> ObjectResult<String> {
        self.check_multipart_args(bucket, object)?;
        if parts.is_empty() {
            return Err(ObjectError::InvalidPart { part_number: 0 });
        }
        if !self.is_upload_id_exists(bucket, object, upload_id).await {
            return Err(ObjectError::InvalidUploadId {
                upload_id: upload_id.to_string(),
            });
        }

        let upload_path = Self::upload_id_path(bucket, object, upload_id);
        let oid = ops_id();
        let upload_lock = self.ns_mutex.lock(META_BUCKET, &upload_path, &oid).await;

        let disks = self.disk_snapshot();
        let mut meta = self
            .read_quorum_meta(&disks, META_BUCKET, &upload_path)
            .await?;

        // Composite S3 ETag: md5 over the concatenated binary part MD5s,
        // suffixed with the part count.
        let mut etag_ctx = md5::Context::new();
        let mut verified: Vec<ObjectPartInfo> = Vec::with_capacity(parts.len());
        let mut total_size = 0u64;
        for (i, requested) in parts.iter().enumerate() {
            let Some(idx) = meta.object_part_index(requested.part_number) else {
                return Err(ObjectError::InvalidPart {
                    part_number: requested.part_number,
                });
            };
            let stored = &meta.parts[idx];
            if stored.etag != requested.etag {
                return Err(ObjectError::InvalidPart {
                    part_number: requested.part_number,
                });
            }
            let is_last = i == parts.len() - 1;
            if !is_last && stored.size < MIN_PART_SIZE {
                return Err(ObjectError::PartTooSmall {
                    part_number: stored.number,
                    size: stored.size,
                    min_size: MIN_PART_SIZE,
                });
            }
            let digest = hex::decode(&stored.etag).map_err(|_| ObjectError::InvalidPart {
                part_number: requested.part_number,
            })?;
            etag_ctx.consume(&digest);
            total_size += stored.size;
            verified.push(stored.clone());
        }
        let s3_md5 = format!("{}-{}", hex::encode(etag_ctx.compute().0), parts.len());

        meta.parts = verified;
        meta.stat.size = total_size;
        meta.stat.mod_time = Utc::now();
        meta.meta
            .insert("md5sum".to_string(), s3_md5.clone());

        let metas = self.metas_with_indexes(&meta);
        let errs = self
            .write_xl_metadata(&disks, META_BUCKET, &upload_path, &metas)
            .await;
        if count_success(&errs) < self.write_quorum {
            return Err(ObjectError::WriteQuorum {
                bucket: bucket.to_string(),
                object: object.to_string(),
            });
        }

        // Publish the assembled upload as the object.
        let object_lock = self.ns_mutex.lock(bucket, object, &oid).await;
        self.commit_rename(&disks, errs, bucket, object, &upload_path)
            .await?;
        drop(object_lock);
        drop(upload_lock);

        // Prune the now-empty upload ancestors, leaving siblings intact.
        self.cleanup_upload_parents(&disks, bucket, object).await;
        self.obj_cache.invalidate(bucket, object);
        debug!(bucket, object, upload_id, size = total_size, "completed multipart upload");
        Ok(s3_md5)
    }

    /// Abort an upload, removing its staged parts from all disks.
    pub async fn abort_multipart_upload(
        &self,
        bucket: &str,
        object: &str,
        upload_id: &str,
    ) -> ObjectResult<()> {
        self.check_multipart_args(bucket, object)?;
        if !self.is_upload_id_exists(bucket, object, upload_id).await {
            return Err(ObjectError::InvalidUploadId {
                upload_id: upload_id.to_string(),
            });
        }
        let upload_path = Self::upload_id_path(bucket, object, upload_id);
        let oid = ops_id();
        let _lock = self.ns_mutex.lock(META_BUCKET, &upload_path, &oid).await;

        let disks = self.disk_snapshot();
        let errs: Vec<Option<StorageError>> = join_all(disks.iter().map(|disk| {
            let path = upload_path.clone();
            async move {
                match disk {
                    Some(disk) => self.cleanup_dir(disk.as_ref(), META_BUCKET, path).await.err(),
                    None => Some(StorageError::DiskNotFound),
                }
            }
        }))
        .await;

        let mut failures = 0usize;
        for err in &errs {
            match err {
                None | Some(StorageError::FileNotFound | StorageError::VolumeNotFound) => {}
                Some(_) => failures += 1,
            }
        }
        if failures > disks.len() - self.write_quorum {
            return Err(ObjectError::WriteQuorum {
                bucket: bucket.to_string(),
                object: object.to_string(),
            });
        }
        self.cleanup_upload_parents(&disks, bucket, object).await;
        debug!(bucket, object, upload_id, "aborted multipart upload");
        Ok(())
    }

    /// List in-progress uploads of a bucket.
    pub async fn list_multipart_uploads(
        &self,
        bucket: &str,
        prefix: &str,
        key_marker: &str,
        upload_id_marker: &str,
        delimiter: &str,
        max_uploads: i64,
    ) -> ObjectResult<ListMultipartsInfo> {
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
        if !is_valid_object_prefix(prefix) {
            return Err(ObjectError::ObjectNameInvalid {
                bucket: bucket.to_string(),
                object: prefix.to_string(),
            });
        }
        if !delimiter.is_empty() && delimiter != SLASH_SEPARATOR {
            return Err(ObjectError::UnsupportedDelimiter {
                delimiter: delimiter.to_string(),
            });
        }
        if !key_marker.is_empty() && !key_marker.starts_with(prefix) {
            return Err(ObjectError::InvalidMarkerPrefixCombination {
                marker: key_marker.to_string(),
                prefix: prefix.to_string(),
            });
        }

        let max_uploads = if max_uploads < 0 || max_uploads as u128 > MAX_UPLOADS_LIST as u128 {
            MAX_UPLOADS_LIST
        } else {
            max_uploads as usize
        };
        let mut result = ListMultipartsInfo {
            key_marker: key_marker.to_string(),
            upload_id_marker: upload_id_marker.to_string(),
            max_uploads,
            prefix: prefix.to_string(),
            delimiter: delimiter.to_string(),
            ..Default::default()
        };
        if max_uploads == 0 {
            return Ok(result);
        }

        let base = retain_slash(&path_join(&[MPART_META_PREFIX, bucket]));
        let walk_prefix = format!("{base}{prefix}");
        let walk_marker = if key_marker.is_empty() {
            String::new()
        } else {
            format!("{base}{key_marker}")
        };

        let (_cancel_tx, cancel_rx) = watch::channel(false);
        let mut items = start_tree_walk(
            self.walk_source(),
            META_BUCKET,
            &walk_prefix,
            &walk_marker,
            true,
            cancel_rx,
        );

        let mut count = 0usize;
        let mut eof = false;
        while count < max_uploads {
            let Some(item) = items.recv().await else {
                eof = true;
                break;
            };
            let res = match item {
                Ok(res) => res,
                Err(StorageError::FileNotFound) => {
                    eof = true;
                    break;
                }
                Err(err) => return Err(to_object_err(err, bucket, prefix)),
            };
            let walk_end = res.end;
            let entry = res.entry;
            'process: {
                // Leaves look like "multipart/<bucket>/<object...>/<uploadID>".
                let Some(rest) = entry.strip_prefix(&base) else {
                    break 'process;
                };
                let Some((object, upload_id)) = rest.rsplit_once(SLASH_SEPARATOR) else {
                    break 'process;
                };
                // Uploads at or before the marker pair belong to earlier
                // pages.
                if !key_marker.is_empty() {
                    if object < key_marker {
                        break 'process;
                    }
                    if object == key_marker
                        && (upload_id_marker.is_empty() || upload_id <= upload_id_marker)
                    {
                        break 'process;
                    }
                }

                if delimiter == SLASH_SEPARATOR {
                    let after = &object[prefix.len().min(object.len())..];
                    if let Some(pos) = after.find(SLASH_SEPARATOR) {
                        let common = format!("{prefix}{}", &after[..=pos]);
                        if result.common_prefixes.last() != Some(&common) {
                            result.common_prefixes.push(common);
                            count += 1;
                        }
                        break 'process;
                    }
                }

                let initiated = self
                    .upload_initiated_time(&entry)
                    .await
                    .unwrap_or_else(Utc::now);
                result.uploads.push(MultipartUploadInfo {
                    object: object.to_string(),
                    upload_id: upload_id.to_string(),
                    initiated,
                });
                result.next_key_marker = object.to_string();
                result.next_upload_id_marker = upload_id.to_string();
                count += 1;
            }

            if walk_end {
                eof = true;
                break;
            }
        }

        result.is_truncated = !eof;
        if !result.is_truncated {
            result.next_key_marker = String::new();
            result.next_upload_id_marker = String::new();
        }
        Ok(result)
    }

    async fn upload_initiated_time(&self, upload_entry: &str) -> Option<DateTime<Utc>> {
        let meta_path = join_object_path(upload_entry, crate::meta::XL_META_JSON_FILE);
        for disk in self.load_balanced_disks().iter().flatten() {
            if let Ok(info) = disk.stat_file(META_BUCKET, &meta_path).await {
                return Some(info.mod_time);
            }
        }
        None
    }

    /// Remove the `multipart/<bucket>/<object...>` directory chain where it
    /// has become empty.
    async fn cleanup_upload_parents(
        &self,
        disks: &[Option<Arc<dyn StorageAPI>>],
        bucket: &str,
        object: &str,
    ) {
        // Deleting the directory marker prunes empty ancestors up to the
        // volume root; non-empty directories make this a no-op.
        let dir = retain_slash(&path_join(&[MPART_META_PREFIX, bucket, object]));
        join_all(disks.iter().flatten().map(|disk| {
            let dir = dir.clone();
            async move {
                let _ = disk.delete_file(META_BUCKET, &dir).await;
            }
        }))
        .await;
    }
}
