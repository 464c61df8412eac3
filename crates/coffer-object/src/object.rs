//! Object operations: put, get, stat, delete.

use crate::meta::{ChecksumInfo, ObjectPartInfo, XlMetaV1};
use crate::namespace_lock::ops_id;
use crate::quorum::{count_success, reduce_errs, BUCKET_OP_IGNORED_ERRS};
use crate::xl::{join_object_path, XlObjects, BLOCK_SIZE};
use bytes::Bytes;
use chrono::Utc;
use coffer_common::{
    is_valid_bucket_name, is_valid_object_name, path_join, retain_slash, to_object_err,
    ObjectError, ObjectInfo, ObjectResult, StorageError, MAX_OBJECT_SIZE, META_BUCKET,
    TMP_META_PREFIX,
};
use coffer_storage::StorageAPI;
use futures::future::join_all;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, warn};
use uuid::Uuid;

/// Outcome of streaming one erasure-coded file onto the disk set.
pub(crate) struct ErasureWriteOutcome {
    pub md5_hex: String,
    pub errs: Vec<Option<StorageError>>,
    pub checksums: Vec<Option<String>>,
}

impl XlObjects {
    /// Store an object; returns its hex MD5.
    pub async fn put_object<R>(
        &self,
        bucket: &str,
        object: &str,
        size: u64,
        reader: &mut R,
        metadata: HashMap<String, String>,
    ) -> ObjectResult<String>
    where
        R: AsyncRead + Unpin + Send,
    {
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
        if !is_valid_object_name(object) {
            return Err(ObjectError::ObjectNameInvalid {
                bucket: bucket.to_string(),
                object: object.to_string(),
            });
        }
        if size > MAX_OBJECT_SIZE {
            return Err(ObjectError::EntityTooLarge {
                size,
                max_size: MAX_OBJECT_SIZE,
            });
        }

        let oid = ops_id();
        let _lock = self.ns_mutex.lock(bucket, object, &oid).await;
        let disks = self.disk_snapshot();

        let tmp_id = Uuid::new_v4().to_string();
        let tmp_prefix = path_join(&[TMP_META_PREFIX, &tmp_id]);
        let part_path = join_object_path(&tmp_prefix, "part.1");

        let outcome = match self
            .erasure_write(&disks, META_BUCKET, &part_path, reader, size)
            .await
        {
            Ok(outcome) => outcome,
            Err(err) => {
                self.cleanup_tmp(&disks, &tmp_prefix).await;
                return Err(err);
            }
        };
        let mut errs = outcome.errs;
        if count_success(&errs) < self.write_quorum {
            self.cleanup_tmp(&disks, &tmp_prefix).await;
            return Err(ObjectError::WriteQuorum {
                bucket: bucket.to_string(),
                object: object.to_string(),
            });
        }

        // Honor a client-supplied content digest.
        if let Some(expected) = metadata.get("md5sum") {
            if !expected.is_empty() && !expected.eq_ignore_ascii_case(&outcome.md5_hex) {
                self.cleanup_tmp(&disks, &tmp_prefix).await;
                return Err(ObjectError::BadDigest {
                    expected_md5: expected.clone(),
                    calculated_md5: outcome.md5_hex,
                });
            }
        }

        let mut meta = XlMetaV1::new(self.data_blocks, self.parity_blocks, BLOCK_SIZE);
        meta.stat.size = size;
        meta.stat.mod_time = Utc::now();
        meta.meta = metadata;
        meta.meta.insert("md5sum".to_string(), outcome.md5_hex.clone());
        meta.parts.push(ObjectPartInfo {
            number: 1,
            name: "part.1".to_string(),
            etag: outcome.md5_hex.clone(),
            size,
        });

        let mut metas = self.metas_with_indexes(&meta);
        for (idx, m) in metas.iter_mut().enumerate() {
            if let Some(Some(hash)) = outcome.checksums.get(idx) {
                m.erasure.checksums = vec![ChecksumInfo {
                    name: "part.1".to_string(),
                    algorithm: "md5".to_string(),
                    hash: hash.clone(),
                }];
            }
        }
        let meta_errs = self
            .write_xl_metadata(&disks, META_BUCKET, &tmp_prefix, &metas)
            .await;
        merge_errs(&mut errs, meta_errs);
        if count_success(&errs) < self.write_quorum {
            self.cleanup_tmp(&disks, &tmp_prefix).await;
            return Err(ObjectError::WriteQuorum {
                bucket: bucket.to_string(),
                object: object.to_string(),
            });
        }

        self.commit_rename(&disks, errs, bucket, object, &tmp_prefix)
            .await?;
        self.obj_cache.invalidate(bucket, object);
        debug!(bucket, object, size, "stored object");
        Ok(outcome.md5_hex)
    }

    /// Move the staged directory into its final object path under write
    /// quorum, shuffling any existing object aside and restoring it if the
    /// commit fails.
    pub(crate) async fn commit_rename(
        &self,
        disks: &[Option<Arc<dyn StorageAPI>>],
        mut errs: Vec<Option<StorageError>>,
        bucket: &str,
        object: &str,
        staged_prefix: &str,
    ) -> ObjectResult<()> {
        let aside = if self.is_object(bucket, object).await {
            let aside_prefix = path_join(&[TMP_META_PREFIX, &Uuid::new_v4().to_string()]);
            let aside_errs = self
                .rename_object_dir(disks, bucket, object, META_BUCKET, &aside_prefix)
                .await;
            if count_success(&aside_errs) < self.write_quorum {
                self.undo_rename_object_dir(
                    disks,
                    &aside_errs,
                    bucket,
                    object,
                    META_BUCKET,
                    &aside_prefix,
                )
                .await;
                self.cleanup_tmp(disks, staged_prefix).await;
                return Err(ObjectError::WriteQuorum {
                    bucket: bucket.to_string(),
                    object: object.to_string(),
                });
            }
            Some(aside_prefix)
        } else {
            None
        };

        let rename_errs = self
            .rename_object_dir(disks, META_BUCKET, staged_prefix, bucket, object)
            .await;
        if count_success(&rename_errs) < self.write_quorum {
            self.undo_rename_object_dir(
                disks,
                &rename_errs,
                META_BUCKET,
                staged_prefix,
                bucket,
                object,
            )
            .await;
            if let Some(aside_prefix) = &aside {
                let restore_errs = self
                    .rename_object_dir(disks, META_BUCKET, aside_prefix, bucket, object)
                    .await;
                if count_success(&restore_errs) < self.write_quorum {
                    warn!(bucket, object, "failed to restore object after aborted overwrite");
                }
            }
            self.cleanup_tmp(disks, staged_prefix).await;
            return Err(ObjectError::WriteQuorum {
                bucket: bucket.to_string(),
                object: object.to_string(),
            });
        }
        merge_errs(&mut errs, rename_errs);

        if let Some(aside_prefix) = &aside {
            self.cleanup_tmp(disks, aside_prefix).await;
        }

        match crate::quorum::reduce_quorum_errs(&errs, BUCKET_OP_IGNORED_ERRS, self.write_quorum)
        {
            crate::quorum::Reduced::Ok => Ok(()),
            crate::quorum::Reduced::Err(err) => Err(to_object_err(err, bucket, object)),
            crate::quorum::Reduced::NoQuorum => Err(ObjectError::WriteQuorum {
                bucket: bucket.to_string(),
                object: object.to_string(),
            }),
        }
    }

    /// Read `length` bytes of an object starting at `offset` into `writer`.
    pub async fn get_object<W>(
        &self,
        bucket: &str,
        object: &str,
        offset: u64,
        length: u64,
        writer: &mut W,
    ) -> ObjectResult<()>
    where
        W: AsyncWrite + Unpin + Send,
    {
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
        let _lock = self.ns_mutex.rlock(bucket, object, &oid).await;
        let disks = self.disk_snapshot();

        let meta = self.read_quorum_meta(&disks, bucket, object).await?;
        let size = meta.stat.size;
        if offset > size || offset + length > size {
            return Err(ObjectError::InvalidRange {
                offset,
                length,
                size,
            });
        }
        if length == 0 {
            writer.flush().await.map_err(io_err)?;
            return Ok(());
        }

        let whole = offset == 0 && length == size;
        if self.cache_enabled() && whole {
            if let Some(data) = self.obj_cache.get(bucket, object, meta.stat.mod_time) {
                writer.write_all(&data).await.map_err(io_err)?;
                writer.flush().await.map_err(io_err)?;
                return Ok(());
            }
        }
        let mut collect: Option<Vec<u8>> = (self.cache_enabled()
            && whole
            && self.obj_cache.admits(size))
        .then(|| Vec::with_capacity(size as usize));

        let (mut part_idx, mut part_offset) = meta
            .object_to_part_offset(offset)
            .ok_or_else(|| ObjectError::InvalidRange {
                offset,
                length,
                size,
            })?;
        let mut remaining = length;
        while remaining > 0 && part_idx < meta.parts.len() {
            let part = &meta.parts[part_idx];
            let take = remaining.min(part.size - part_offset);
            if take == 0 {
                part_offset = 0;
                part_idx += 1;
                continue;
            }
            let part_path = join_object_path(object, &part.name);
            self.erasure_read(
                &disks,
                bucket,
                object,
                &part_path,
                part.size,
                part_offset,
                take,
                writer,
                &mut collect,
            )
            .await?;
            remaining -= take;
            part_offset = 0;
            part_idx += 1;
        }
        if remaining > 0 {
            return Err(ObjectError::ReadQuorum {
                bucket: bucket.to_string(),
                object: object.to_string(),
            });
        }

        if let Some(data) = collect {
            self.obj_cache
                .put(bucket, object, meta.stat.mod_time, Bytes::from(data));
        }
        writer.flush().await.map_err(io_err)?;
        Ok(())
    }

    /// Stat an object.
    pub async fn get_object_info(&self, bucket: &str, object: &str) -> ObjectResult<ObjectInfo> {
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
        let _lock = self.ns_mutex.rlock(bucket, object, &oid).await;
        let disks = self.disk_snapshot();
        let meta = self.read_quorum_meta(&disks, bucket, object).await?;
        Ok(meta.to_object_info(bucket, object))
    }

    /// Delete an object from all disks; succeeds while at most
    /// `N - writeQuorum` disks fail to remove it.
    pub async fn delete_object(&self, bucket: &str, object: &str) -> ObjectResult<()> {
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
        if !self.is_bucket_exist(bucket).await {
            return Err(ObjectError::BucketNotFound {
                bucket: bucket.to_string(),
            });
        }
        let oid = ops_id();
        let _lock = self.ns_mutex.lock(bucket, object, &oid).await;
        if !self.is_object(bucket, object).await {
            return Err(ObjectError::ObjectNotFound {
                bucket: bucket.to_string(),
                object: object.to_string(),
            });
        }

        let disks = self.disk_snapshot();
        let errs: Vec<Option<StorageError>> = join_all(disks.iter().map(|disk| async move {
            match disk {
                Some(disk) => self
                    .cleanup_dir(disk.as_ref(), bucket, object.to_string())
                    .await
                    .err(),
                None => Some(StorageError::DiskNotFound),
            }
        }))
        .await;

        let mut delete_failures = 0usize;
        for err in &errs {
            match err {
                None | Some(StorageError::FileNotFound | StorageError::VolumeNotFound) => {}
                Some(_) => delete_failures += 1,
            }
        }
        if delete_failures > disks.len() - self.write_quorum {
            return Err(ObjectError::WriteQuorum {
                bucket: bucket.to_string(),
                object: object.to_string(),
            });
        }
        self.obj_cache.invalidate(bucket, object);
        debug!(bucket, object, "deleted object");
        Ok(())
    }

    /// Read object metadata under read-quorum rules and pick the freshest
    /// consistent copy.
    pub(crate) async fn read_quorum_meta(
        &self,
        disks: &[Option<Arc<dyn StorageAPI>>],
        bucket: &str,
        object: &str,
    ) -> ObjectResult<XlMetaV1> {
        let (metas, errs) = self.read_xl_metadata_all(disks, bucket, object).await;
        let valid = metas.iter().flatten().count();
        if valid < self.read_quorum {
            let (modal, _) = reduce_errs(
                &errs,
                &[StorageError::DiskNotFound, StorageError::DiskAccessDenied],
            );
            return Err(match modal {
                Some(StorageError::VolumeNotFound) => ObjectError::BucketNotFound {
                    bucket: bucket.to_string(),
                },
                Some(StorageError::FileNotFound) => ObjectError::ObjectNotFound {
                    bucket: bucket.to_string(),
                    object: object.to_string(),
                },
                _ => ObjectError::ReadQuorum {
                    bucket: bucket.to_string(),
                    object: object.to_string(),
                },
            });
        }
        Self::pick_valid_meta(&metas).ok_or_else(|| ObjectError::ReadQuorum {
            bucket: bucket.to_string(),
            object: object.to_string(),
        })
    }

    /// Stream `size` bytes from `reader` into erasure shards appended to
    /// `volume/file_path` on every usable disk.
    pub(crate) async fn erasure_write<R>(
        &self,
        disks: &[Option<Arc<dyn StorageAPI>>],
        volume: &str,
        file_path: &str,
        reader: &mut R,
        size: u64,
    ) -> ObjectResult<ErasureWriteOutcome>
    where
        R: AsyncRead + Unpin + Send,
    {
        let mut errs: Vec<Option<StorageError>> = disks
            .iter()
            .map(|disk| disk.is_none().then_some(StorageError::DiskNotFound))
            .collect();
        let mut shard_md5: Vec<Option<md5::Context>> = disks
            .iter()
            .map(|disk| disk.as_ref().map(|_| md5::Context::new()))
            .collect();
        let mut md5_ctx = md5::Context::new();

        if size == 0 {
            // Zero-byte objects still need their (empty) shard files.
            let results = join_all(disks.iter().enumerate().map(|(i, disk)| async move {
                match disk {
                    Some(disk) => (i, disk.append_file(volume, file_path, b"").await.err()),
                    None => (i, Some(StorageError::DiskNotFound)),
                }
            }))
            .await;
            for (i, err) in results {
                if errs[i].is_none() {
                    errs[i] = err;
                }
            }
        }

        let mut remaining = size;
        while remaining > 0 {
            let block_len = remaining.min(BLOCK_SIZE as u64) as usize;
            let block = read_full(reader, block_len).await?;
            md5_ctx.consume(&block);
            let shards = self
                .codec
                .encode(&block)
                .map_err(|err| ObjectError::Storage(StorageError::Io(err.to_string())))?;

            let writes = disks.iter().enumerate().filter_map(|(i, disk)| {
                if errs[i].is_some() {
                    return None;
                }
                let disk = disk.as_ref()?;
                let shard = &shards[i];
                Some(async move { (i, disk.append_file(volume, file_path, shard).await.err()) })
            });
            let results = join_all(writes).await;
            for (i, err) in results {
                match err {
                    Some(err) => {
                        errs[i] = Some(err);
                        shard_md5[i] = None;
                    }
                    None => {
                        if let Some(ctx) = shard_md5[i].as_mut() {
                            ctx.consume(&shards[i]);
                        }
                    }
                }
            }
            remaining -= block_len as u64;
        }

        let checksums = shard_md5
            .into_iter()
            .map(|ctx| ctx.map(|ctx| hex::encode(ctx.compute().0)))
            .collect();
        Ok(ErasureWriteOutcome {
            md5_hex: hex::encode(md5_ctx.compute().0),
            errs,
            checksums,
        })
    }

    /// Read `[offset, offset + length)` of one erasure-coded part file,
    /// reconstructing missing data shards from parity.
    #[allow(clippy::too_many_arguments)]
    pub(crate) async fn erasure_read<W>(
        &self,
        disks: &[Option<Arc<dyn StorageAPI>>],
        bucket: &str,
        object: &str,
        part_path: &str,
        part_size: u64,
        offset: u64,
        length: u64,
        writer: &mut W,
        collect: &mut Option<Vec<u8>>,
    ) -> ObjectResult<()>
    where
        W: AsyncWrite + Unpin + Send,
    {
        let block_size = BLOCK_SIZE as u64;
        let full_shard_size = self.codec.shard_size(BLOCK_SIZE);
        let start_block = offset / block_size;
        let end_block = (offset + length - 1) / block_size;

        for block_idx in start_block..=end_block {
            let block_len = (part_size - block_idx * block_size).min(block_size) as usize;
            let shard_len = self.codec.shard_size(block_len);
            let file_offset = block_idx * full_shard_size as u64;

            let shards = self
                .gather_shards(disks, bucket, part_path, file_offset, shard_len)
                .await;
            let mut shards = match shards {
                Some(shards) => shards,
                None => {
                    return Err(ObjectError::ReadQuorum {
                        bucket: bucket.to_string(),
                        object: object.to_string(),
                    })
                }
            };
            let block = self
                .codec
                .decode(&mut shards, block_len)
                .map_err(|_| ObjectError::ReadQuorum {
                    bucket: bucket.to_string(),
                    object: object.to_string(),
                })?;

            // Clip the decoded block to the requested byte range.
            let block_start = block_idx * block_size;
            let skip = offset.saturating_sub(block_start) as usize;
            let take = ((offset + length - block_start) as usize)
                .min(block.len())
                .saturating_sub(skip);
            let slice = &block[skip..skip + take];
            writer.write_all(slice).await.map_err(io_err)?;
            if let Some(buf) = collect.as_mut() {
                buf.extend_from_slice(slice);
            }
        }
        Ok(())
    }

    /// Collect at least `data_blocks` shards of one block: the first
    /// data-many live disks in parallel, remaining disks one by one.
    pub(crate) async fn gather_shards(
        &self,
        disks: &[Option<Arc<dyn StorageAPI>>],
        bucket: &str,
        part_path: &str,
        file_offset: u64,
        shard_len: usize,
    ) -> Option<Vec<Option<Vec<u8>>>> {
        let total = disks.len();
        let mut shards: Vec<Option<Vec<u8>>> = vec![None; total];
        let mut tried = vec![false; total];

        let primary: Vec<usize> = (0..total)
            .filter(|&i| disks[i].is_some())
            .take(self.data_blocks)
            .collect();
        let reads = primary.iter().map(|&i| {
            let disk = disks[i].as_ref().expect("primary disks are present");
            async move {
                (
                    i,
                    read_shard(disk.as_ref(), bucket, part_path, file_offset, shard_len).await,
                )
            }
        });
        for (i, shard) in join_all(reads).await {
            tried[i] = true;
            shards[i] = shard;
        }
        let mut have = shards.iter().flatten().count();

        for i in 0..total {
            if have >= self.data_blocks {
                break;
            }
            if tried[i] {
                continue;
            }
            let Some(disk) = disks[i].as_ref() else {
                continue;
            };
            tried[i] = true;
            if let Some(shard) =
                read_shard(disk.as_ref(), bucket, part_path, file_offset, shard_len).await
            {
                shards[i] = Some(shard);
                have += 1;
            }
        }

        (have >= self.data_blocks).then_some(shards)
    }

    /// Rename an object directory across the disk set, one slot per disk.
    pub(crate) async fn rename_object_dir(
        &self,
        disks: &[Option<Arc<dyn StorageAPI>>],
        src_volume: &str,
        src_path: &str,
        dst_volume: &str,
        dst_path: &str,
    ) -> Vec<Option<StorageError>> {
        let src = retain_slash(src_path);
        let dst = retain_slash(dst_path);
        join_all(disks.iter().map(|disk| {
            let (src, dst) = (src.clone(), dst.clone());
            async move {
                match disk {
                    Some(disk) => disk
                        .rename_file(src_volume, &src, dst_volume, &dst)
                        .await
                        .err(),
                    None => Some(StorageError::DiskNotFound),
                }
            }
        }))
        .await
    }

    /// Undo a partially applied directory rename on the disks where it
    /// succeeded.
    pub(crate) async fn undo_rename_object_dir(
        &self,
        disks: &[Option<Arc<dyn StorageAPI>>],
        errs: &[Option<StorageError>],
        src_volume: &str,
        src_path: &str,
        dst_volume: &str,
        dst_path: &str,
    ) {
        let src = retain_slash(src_path);
        let dst = retain_slash(dst_path);
        join_all(
            disks
                .iter()
                .zip(errs.iter())
                .filter(|(_, err)| err.is_none())
                .map(|(disk, _)| {
                    let (src, dst) = (src.clone(), dst.clone());
                    async move {
                        if let Some(disk) = disk {
                            let _ = disk
                                .rename_file(dst_volume, &dst, src_volume, &src)
                                .await;
                        }
                    }
                }),
        )
        .await;
    }

    /// Best-effort removal of a scratch directory on every disk.
    pub(crate) async fn cleanup_tmp(
        &self,
        disks: &[Option<Arc<dyn StorageAPI>>],
        tmp_prefix: &str,
    ) {
        join_all(disks.iter().flatten().map(|disk| {
            let prefix = tmp_prefix.to_string();
            async move {
                let _ = self.cleanup_dir(disk.as_ref(), META_BUCKET, prefix).await;
            }
        }))
        .await;
    }
}

/// Merge later per-disk errors into the accumulated slots, keeping the
/// first failure per disk.
pub(crate) fn merge_errs(acc: &mut [Option<StorageError>], new: Vec<Option<StorageError>>) {
    for (slot, err) in acc.iter_mut().zip(new) {
        if slot.is_none() {
            *slot = err;
        }
    }
}

pub(crate) fn io_err(err: std::io::Error) -> ObjectError {
    ObjectError::Storage(StorageError::Io(err.to_string()))
}

async fn read_full<R: AsyncRead + Unpin>(reader: &mut R, len: usize) -> ObjectResult<Vec<u8>> {
    let mut buf = vec![0u8; len];
    let mut filled = 0usize;
    while filled < len {
        let n = reader.read(&mut buf[filled..]).await.map_err(io_err)?;
        if n == 0 {
            return Err(ObjectError::Storage(StorageError::Io(
                "unexpected end of input".to_string(),
            )));
        }
        filled += n;
    }
    Ok(buf)
}

/// Read one shard segment; anything short of `shard_len` counts as missing.
async fn read_shard(
    disk: &dyn StorageAPI,
    bucket: &str,
    part_path: &str,
    file_offset: u64,
    shard_len: usize,
) -> Option<Vec<u8>> {
    let mut buf = vec![0u8; shard_len];
    match disk.read_file(bucket, part_path, file_offset, &mut buf).await {
        Ok(n) if n as usize == shard_len => Some(buf),
        Ok(_) | Err(_) => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn merge_keeps_first_error() {
        let mut acc = vec![None, Some(StorageError::DiskNotFound), None];
        merge_errs(
            &mut acc,
            vec![Some(StorageError::FaultyDisk), Some(StorageError::DiskFull), None],
        );
        assert_eq!(acc[0], Some(StorageError::FaultyDisk));
        assert_eq!(acc[1], Some(StorageError::DiskNotFound));
        assert_eq!(acc[2], None);
    }
}
