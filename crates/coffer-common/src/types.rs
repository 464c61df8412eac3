//! Core type definitions for coffer
//!
//! Identifiers, listing results and metadata structures shared between the
//! storage layer, the object layer and the RPC surface, together with the
//! S3 name validation rules.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Path separator used in object and volume file names, on every platform.
pub const SLASH_SEPARATOR: &str = "/";

/// Reserved volume holding multipart state and scratch data on every disk.
pub const META_BUCKET: &str = ".coffer.sys";

/// Prefix inside [`META_BUCKET`] for multipart upload state.
pub const MPART_META_PREFIX: &str = "multipart";

/// Prefix inside [`META_BUCKET`] for in-flight write scratch space.
pub const TMP_META_PREFIX: &str = "tmp";

/// Disk identity file, written once per disk into [`META_BUCKET`].
pub const FORMAT_CONFIG_FILE: &str = "format.json";

/// Depth of the tree-walk result channel and page size of a single listing.
pub const MAX_OBJECT_LIST: usize = 1000;

/// Upper clamp for a caller-supplied max-keys value.
pub const LIST_OBJECTS_LIMIT: usize = 10_000;

/// Maximum number of parts returned by a single list-parts call.
pub const MAX_PARTS_LIST: usize = 1000;

/// Maximum number of uploads returned by a single list-uploads call.
pub const MAX_UPLOADS_LIST: usize = 1000;

/// Maximum object size per PUT request (5 GiB).
pub const MAX_OBJECT_SIZE: u64 = 5 * 1024 * 1024 * 1024;

/// Minimum size of a non-terminal multipart part (5 MiB).
pub const MIN_PART_SIZE: u64 = 5 * 1024 * 1024;

/// Part numbers range from 1 to 10000 inclusive.
pub const MAX_PART_ID: u32 = 10_000;

/// Information about a disk backing the storage API.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct DiskInfo {
    pub total: u64,
    pub free: u64,
    pub fs_type: String,
}

/// Information about a volume on one disk.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolInfo {
    pub name: String,
    pub created: DateTime<Utc>,
}

/// Information about a file on one disk.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileInfo {
    pub volume: String,
    pub name: String,
    pub size: u64,
    pub mod_time: DateTime<Utc>,
}

/// Information about a bucket, aggregated over the disk set.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BucketInfo {
    pub name: String,
    pub created: DateTime<Utc>,
}

/// Information about an object.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectInfo {
    pub bucket: String,
    pub name: String,
    pub mod_time: DateTime<Utc>,
    pub size: u64,
    pub is_dir: bool,
    pub md5_sum: String,
    pub content_type: String,
}

impl ObjectInfo {
    /// Placeholder info carrying only the name, for listings that do not
    /// need size or time.
    #[must_use]
    pub fn name_only(bucket: &str, name: &str) -> Self {
        Self {
            bucket: bucket.to_string(),
            name: name.to_string(),
            mod_time: DateTime::<Utc>::MIN_UTC,
            size: 0,
            is_dir: false,
            md5_sum: String::new(),
            content_type: String::new(),
        }
    }
}

/// One page of a bucket listing.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ListObjectsInfo {
    pub is_truncated: bool,
    pub next_marker: String,
    pub objects: Vec<ObjectInfo>,
    pub prefixes: Vec<String>,
}

/// One part of a multipart upload.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartInfo {
    pub part_number: u32,
    pub last_modified: DateTime<Utc>,
    pub etag: String,
    pub size: u64,
}

/// One page of the parts of a multipart upload.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ListPartsInfo {
    pub bucket: String,
    pub object: String,
    pub upload_id: String,
    pub part_number_marker: u32,
    pub next_part_number_marker: u32,
    pub max_parts: usize,
    pub is_truncated: bool,
    pub parts: Vec<PartInfo>,
}

/// An in-progress multipart upload.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MultipartUploadInfo {
    pub object: String,
    pub upload_id: String,
    pub initiated: DateTime<Utc>,
}

/// One page of the multipart uploads of a bucket.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ListMultipartsInfo {
    pub key_marker: String,
    pub upload_id_marker: String,
    pub next_key_marker: String,
    pub next_upload_id_marker: String,
    pub max_uploads: usize,
    pub is_truncated: bool,
    pub uploads: Vec<MultipartUploadInfo>,
    pub prefix: String,
    pub delimiter: String,
    pub common_prefixes: Vec<String>,
}

/// A part reference supplied to complete-multipart-upload.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompletePart {
    pub part_number: u32,
    pub etag: String,
}

/// Aggregate capacity over the disk set.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize)]
pub struct StorageInfo {
    pub total: u64,
    pub free: u64,
}

/// Validate a bucket name: 3-63 characters of `[a-z0-9.-]`, starting and
/// ending with a letter or digit, without consecutive dots.
#[must_use]
pub fn is_valid_bucket_name(name: &str) -> bool {
    if name.len() < 3 || name.len() > 63 {
        return false;
    }
    if name.contains("..") {
        return false;
    }
    let bytes = name.as_bytes();
    let edge_ok = |b: u8| b.is_ascii_lowercase() || b.is_ascii_digit();
    if !edge_ok(bytes[0]) || !edge_ok(bytes[bytes.len() - 1]) {
        return false;
    }
    bytes
        .iter()
        .all(|&b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'.' || b == b'-')
}

/// Validate an object name: non-empty, at most 1024 bytes, never starting or
/// ending with a slash, no interior NUL.
#[must_use]
pub fn is_valid_object_name(name: &str) -> bool {
    if name.is_empty() || name.len() > 1024 {
        return false;
    }
    if name.starts_with(SLASH_SEPARATOR) || name.ends_with(SLASH_SEPARATOR) {
        return false;
    }
    !name.contains('\0')
}

/// Validate an object prefix: may be empty, may carry a trailing slash.
#[must_use]
pub fn is_valid_object_prefix(prefix: &str) -> bool {
    prefix.len() <= 1024 && !prefix.contains('\0')
}

/// Join path elements with a slash, retaining a trailing slash if the last
/// element carries one. Empty elements are skipped.
#[must_use]
pub fn path_join(elements: &[&str]) -> String {
    let trailing = elements
        .iter()
        .rev()
        .find(|e| !e.is_empty())
        .is_some_and(|e| e.ends_with(SLASH_SEPARATOR));
    let mut joined = elements
        .iter()
        .filter(|e| !e.is_empty())
        .map(|e| e.trim_matches('/'))
        .filter(|e| !e.is_empty())
        .collect::<Vec<_>>()
        .join(SLASH_SEPARATOR);
    if trailing && !joined.ends_with(SLASH_SEPARATOR) {
        joined.push('/');
    }
    joined
}

/// Append a trailing slash if the path does not already carry one.
#[must_use]
pub fn retain_slash(path: &str) -> String {
    if path.is_empty() || path.ends_with(SLASH_SEPARATOR) {
        path.to_string()
    } else {
        format!("{path}{SLASH_SEPARATOR}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bucket_name_validation() {
        let valid = ["abc", "my-bucket", "my.bucket", "0bucket9", "a.b-c.d"];
        for name in valid {
            assert!(is_valid_bucket_name(name), "{name} should be valid");
        }
        let invalid = [
            "",
            "ad",
            ".test",
            "Test",
            "---",
            "my_bucket",
            "bucket.",
            "a..b",
            "-bucket",
            &"x".repeat(64),
        ];
        for name in invalid {
            assert!(!is_valid_bucket_name(name), "{name} should be invalid");
        }
    }

    #[test]
    fn object_name_validation() {
        assert!(is_valid_object_name("obj"));
        assert!(is_valid_object_name("a/b/c"));
        assert!(!is_valid_object_name(""));
        assert!(!is_valid_object_name("/obj"));
        assert!(!is_valid_object_name("obj/"));
        assert!(!is_valid_object_name(&"x".repeat(1025)));
        // Prefixes are laxer: leading and trailing slashes are fine.
        assert!(is_valid_object_prefix(""));
        assert!(is_valid_object_prefix("/"));
        assert!(is_valid_object_prefix("a/b/"));
    }

    #[test]
    fn path_join_retains_trailing_slash() {
        assert_eq!(path_join(&["a", "b"]), "a/b");
        assert_eq!(path_join(&["a", "b/"]), "a/b/");
        assert_eq!(path_join(&["", "b"]), "b");
        assert_eq!(path_join(&["a/", "b", "c/"]), "a/b/c/");
        assert_eq!(path_join(&[]), "");
        assert_eq!(retain_slash("a/b"), "a/b/");
        assert_eq!(retain_slash("a/b/"), "a/b/");
        assert_eq!(retain_slash(""), "");
    }
}
