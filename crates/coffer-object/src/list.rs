//! Paginated bucket listing over the tree walker.

use crate::meta::{XlMetaV1, XL_META_JSON_FILE};
use crate::tree_walk::start_tree_walk;
use crate::tree_walk_pool::{ListParams, TreeWalkSession};
use crate::xl::{join_object_path, XlObjects};
use coffer_common::{
    is_valid_bucket_name, is_valid_object_prefix, to_object_err, ListObjectsInfo, ObjectError,
    ObjectInfo, ObjectResult, StorageError, LIST_OBJECTS_LIMIT, SLASH_SEPARATOR,
};
use tokio::sync::watch;
use tracing::debug;

impl XlObjects {
    /// List up to `max_keys` entries of `bucket` under `prefix`, after
    /// `marker`, collapsing directory-like groups when `delimiter` is `/`.
    pub async fn list_objects(
        &self,
        bucket: &str,
        prefix: &str,
        marker: &str,
        delimiter: &str,
        max_keys: i64,
    ) -> ObjectResult<ListObjectsInfo> {
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
        if !marker.is_empty() && !marker.starts_with(prefix) {
            return Err(ObjectError::InvalidMarkerPrefixCombination {
                marker: marker.to_string(),
                prefix: prefix.to_string(),
            });
        }

        let recursive = delimiter != SLASH_SEPARATOR;
        let max_keys = if max_keys < 0 || max_keys as u128 > LIST_OBJECTS_LIMIT as u128 {
            LIST_OBJECTS_LIMIT
        } else {
            max_keys as usize
        };
        if max_keys == 0 {
            return Ok(ListObjectsInfo::default());
        }
        // Object names never begin with a slash, so a rooted prefix cannot
        // match anything.
        if prefix.starts_with(SLASH_SEPARATOR) {
            return Ok(ListObjectsInfo::default());
        }

        let params = ListParams {
            bucket: bucket.to_string(),
            recursive,
            marker: marker.to_string(),
            prefix: prefix.to_string(),
        };
        let mut session = match self.list_pool.release(&params) {
            Some(session) => session,
            None => {
                let (cancel_tx, cancel_rx) = watch::channel(false);
                let items = start_tree_walk(
                    self.walk_source(),
                    bucket,
                    prefix,
                    marker,
                    recursive,
                    cancel_rx,
                );
                TreeWalkSession {
                    items,
                    cancel: cancel_tx,
                }
            }
        };

        let mut objects: Vec<ObjectInfo> = Vec::new();
        let mut prefixes: Vec<String> = Vec::new();
        let mut next_marker = String::new();
        let mut count = 0usize;
        let mut eof = false;

        while count < max_keys {
            let Some(item) = session.items.recv().await else {
                eof = true;
                break;
            };
            let result = match item {
                Ok(result) => result,
                // A prefix naming a directory that does not exist is a
                // valid empty listing.
                Err(StorageError::FileNotFound) => return Ok(ListObjectsInfo::default()),
                Err(err) => return Err(to_object_err(err, bucket, prefix)),
            };

            let entry = result.entry;
            let rest = entry.get(prefix.len()..).unwrap_or_default();
            let group = if recursive {
                None
            } else {
                rest.find(SLASH_SEPARATOR)
                    .map(|pos| format!("{prefix}{}", &rest[..=pos]))
            };

            match group {
                Some(common_prefix) => {
                    // Groups at or before the marker were delivered by an
                    // earlier page; duplicates arise when the walker
                    // resumes inside a group.
                    let stale = !marker.is_empty() && common_prefix.as_str() <= marker;
                    let duplicate = prefixes.last() == Some(&common_prefix);
                    if !stale && !duplicate {
                        next_marker = common_prefix.clone();
                        prefixes.push(common_prefix);
                        count += 1;
                    }
                }
                None => {
                    let stale = !marker.is_empty() && entry.as_str() <= marker;
                    if !stale {
                        // Size and time ride along when a disk answers;
                        // the name alone suffices otherwise.
                        let info = self
                            .object_info_from_any_disk(bucket, &entry)
                            .await
                            .unwrap_or_else(|| ObjectInfo::name_only(bucket, &entry));
                        next_marker = entry.clone();
                        objects.push(info);
                        count += 1;
                    }
                }
            }

            if result.end {
                eof = true;
                break;
            }
        }

        if !eof {
            debug!(bucket, prefix, marker = %next_marker, "parking listing walk");
            let park = ListParams {
                bucket: bucket.to_string(),
                recursive,
                marker: next_marker.clone(),
                prefix: prefix.to_string(),
            };
            self.list_pool.set(park, session);
        }

        Ok(ListObjectsInfo {
            is_truncated: !eof,
            next_marker: if eof { String::new() } else { next_marker },
            objects,
            prefixes,
        })
    }

    /// Object info from the first load-balanced disk carrying readable
    /// metadata; listings tolerate a miss with a name-only entry.
    async fn object_info_from_any_disk(&self, bucket: &str, object: &str) -> Option<ObjectInfo> {
        let meta_path = join_object_path(object, XL_META_JSON_FILE);
        for disk in self.load_balanced_disks().iter().flatten() {
            let Ok(data) = disk.read_all(bucket, &meta_path).await else {
                continue;
            };
            if let Ok(meta) = serde_json::from_slice::<XlMetaV1>(&data) {
                if meta.is_valid() {
                    return Some(meta.to_object_info(bucket, object));
                }
            }
        }
        None
    }
}
