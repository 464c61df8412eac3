//! Per-object metadata (`xl.json`).
//!
//! Every disk carries one metadata sibling next to the object's shard files.
//! The stat and parts sections must agree across disks; the erasure index
//! and shard checksum are disk-specific.

use chrono::{DateTime, Utc};
use coffer_common::ObjectInfo;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Metadata sibling file name.
pub const XL_META_JSON_FILE: &str = "xl.json";

/// Format version understood by this release.
pub const XL_META_VERSION: &str = "1.0.0";

/// Backend format tag.
pub const XL_META_FORMAT: &str = "xl";

/// Release string recorded into newly written metadata.
pub const SERVER_RELEASE: &str = concat!("coffer/", env!("CARGO_PKG_VERSION"));

/// Size and time statistics of an object.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct XlStat {
    pub size: u64,
    pub mod_time: DateTime<Utc>,
}

/// Erasure parameters of an object.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErasureInfo {
    pub algorithm: String,
    pub data_blocks: usize,
    pub parity_blocks: usize,
    pub block_size: usize,
    /// 1-based position of this disk within the distribution.
    pub index: usize,
    pub distribution: Vec<usize>,
    #[serde(default)]
    pub checksums: Vec<ChecksumInfo>,
}

/// Checksum of one shard file on this disk.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChecksumInfo {
    pub name: String,
    pub algorithm: String,
    pub hash: String,
}

/// One part of an object.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectPartInfo {
    pub number: u32,
    pub name: String,
    pub etag: String,
    pub size: u64,
}

/// The `xl.json` document.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct XlMetaV1 {
    pub version: String,
    pub format: String,
    pub stat: XlStat,
    pub erasure: ErasureInfo,
    pub release: String,
    #[serde(default)]
    pub meta: HashMap<String, String>,
    #[serde(default)]
    pub parts: Vec<ObjectPartInfo>,
}

impl XlMetaV1 {
    /// Fresh metadata for the given erasure geometry.
    #[must_use]
    pub fn new(data_blocks: usize, parity_blocks: usize, block_size: usize) -> Self {
        let total = data_blocks + parity_blocks;
        Self {
            version: XL_META_VERSION.to_string(),
            format: XL_META_FORMAT.to_string(),
            stat: XlStat {
                size: 0,
                mod_time: Utc::now(),
            },
            erasure: ErasureInfo {
                algorithm: "reed-solomon".to_string(),
                data_blocks,
                parity_blocks,
                block_size,
                index: 0,
                distribution: (1..=total).collect(),
                checksums: Vec::new(),
            },
            release: SERVER_RELEASE.to_string(),
            meta: HashMap::new(),
            parts: Vec::new(),
        }
    }

    /// Whether this metadata was written by a format we understand.
    #[must_use]
    pub fn is_valid(&self) -> bool {
        self.version == XL_META_VERSION && self.format == XL_META_FORMAT
    }

    /// Two metadata documents describe the same object version when their
    /// shared sections agree; the erasure index and checksums are
    /// disk-specific and excluded.
    #[must_use]
    pub fn is_consistent_with(&self, other: &Self) -> bool {
        self.version == other.version
            && self.format == other.format
            && self.stat == other.stat
            && self.parts == other.parts
    }

    /// Add or replace a part; the parts list stays sorted by part number
    /// and re-uploading a part number overwrites the previous entry.
    pub fn add_object_part(&mut self, part: ObjectPartInfo) {
        match self.parts.binary_search_by_key(&part.number, |p| p.number) {
            Ok(idx) => self.parts[idx] = part,
            Err(idx) => self.parts.insert(idx, part),
        }
    }

    /// Index into `parts` for a part number.
    #[must_use]
    pub fn object_part_index(&self, part_number: u32) -> Option<usize> {
        self.parts
            .binary_search_by_key(&part_number, |p| p.number)
            .ok()
    }

    /// Byte offset of `offset` within the parts sequence: which part the
    /// offset falls into and how far into that part.
    #[must_use]
    pub fn object_to_part_offset(&self, offset: u64) -> Option<(usize, u64)> {
        let mut remaining = offset;
        for (idx, part) in self.parts.iter().enumerate() {
            if remaining < part.size || (part.size == 0 && remaining == 0) {
                return Some((idx, remaining));
            }
            remaining -= part.size;
        }
        None
    }

    /// Render to an object-layer info for API callers.
    #[must_use]
    pub fn to_object_info(&self, bucket: &str, object: &str) -> ObjectInfo {
        ObjectInfo {
            bucket: bucket.to_string(),
            name: object.to_string(),
            mod_time: self.stat.mod_time,
            size: self.stat.size,
            is_dir: false,
            md5_sum: self.meta.get("md5sum").cloned().unwrap_or_default(),
            content_type: self
                .meta
                .get("content-type")
                .cloned()
                .unwrap_or_else(|| "application/octet-stream".to_string()),
        }
    }
}
