//! Error types for coffer
//!
//! Storage errors are the per-disk vocabulary: every disk implementation
//! (local, remote, fault-injecting) speaks in these. Object errors are what
//! the object layer surfaces to API callers after quorum reduction.

use thiserror::Error;

/// Result alias for storage-level (single disk) operations.
pub type StorageResult<T> = std::result::Result<T, StorageError>;

/// Result alias for object-layer operations.
pub type ObjectResult<T> = std::result::Result<T, ObjectError>;

/// Errors surfaced by a single disk, local or remote.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StorageError {
    #[error("corrupted backend format")]
    CorruptedFormat,

    #[error("unformatted disk found")]
    UnformattedDisk,

    #[error("disk path full")]
    DiskFull,

    #[error("disk not found")]
    DiskNotFound,

    #[error("disk access denied")]
    DiskAccessDenied,

    #[error("faulty disk")]
    FaultyDisk,

    #[error("file not found")]
    FileNotFound,

    #[error("file name too long")]
    FileNameTooLong,

    #[error("volume already exists")]
    VolumeExists,

    #[error("not of regular file type")]
    IsNotRegular,

    #[error("volume not found")]
    VolumeNotFound,

    #[error("volume is not empty")]
    VolumeNotEmpty,

    #[error("volume access denied")]
    VolumeAccessDenied,

    #[error("file access denied")]
    FileAccessDenied,

    #[error("volume is busy")]
    VolumeBusy,

    #[error("invalid argument")]
    InvalidArgument,

    #[error("invalid token")]
    InvalidToken,

    #[error("disk i/o error: {0}")]
    Io(String),
}

impl StorageError {
    /// Stable wire code used by the storage RPC to round-trip errors.
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::CorruptedFormat => "CorruptedFormat",
            Self::UnformattedDisk => "UnformattedDisk",
            Self::DiskFull => "DiskFull",
            Self::DiskNotFound => "DiskNotFound",
            Self::DiskAccessDenied => "DiskAccessDenied",
            Self::FaultyDisk => "FaultyDisk",
            Self::FileNotFound => "FileNotFound",
            Self::FileNameTooLong => "FileNameTooLong",
            Self::VolumeExists => "VolumeExists",
            Self::IsNotRegular => "IsNotRegular",
            Self::VolumeNotFound => "VolumeNotFound",
            Self::VolumeNotEmpty => "VolumeNotEmpty",
            Self::VolumeAccessDenied => "VolumeAccessDenied",
            Self::FileAccessDenied => "FileAccessDenied",
            Self::VolumeBusy => "VolumeBusy",
            Self::InvalidArgument => "InvalidArgument",
            Self::InvalidToken => "InvalidToken",
            Self::Io(_) => "Io",
        }
    }

    /// Inverse of [`code`](Self::code); unknown codes become `Io`.
    #[must_use]
    pub fn from_code(code: &str, message: &str) -> Self {
        match code {
            "CorruptedFormat" => Self::CorruptedFormat,
            "UnformattedDisk" => Self::UnformattedDisk,
            "DiskFull" => Self::DiskFull,
            "DiskNotFound" => Self::DiskNotFound,
            "DiskAccessDenied" => Self::DiskAccessDenied,
            "FaultyDisk" => Self::FaultyDisk,
            "FileNotFound" => Self::FileNotFound,
            "FileNameTooLong" => Self::FileNameTooLong,
            "VolumeExists" => Self::VolumeExists,
            "IsNotRegular" => Self::IsNotRegular,
            "VolumeNotFound" => Self::VolumeNotFound,
            "VolumeNotEmpty" => Self::VolumeNotEmpty,
            "VolumeAccessDenied" => Self::VolumeAccessDenied,
            "FileAccessDenied" => Self::FileAccessDenied,
            "VolumeBusy" => Self::VolumeBusy,
            "InvalidArgument" => Self::InvalidArgument,
            "InvalidToken" => Self::InvalidToken,
            _ => Self::Io(message.to_string()),
        }
    }
}

impl From<std::io::Error> for StorageError {
    fn from(err: std::io::Error) -> Self {
        use std::io::ErrorKind;
        match err.kind() {
            ErrorKind::NotFound => Self::FileNotFound,
            ErrorKind::PermissionDenied => Self::FileAccessDenied,
            ErrorKind::AlreadyExists => Self::VolumeExists,
            ErrorKind::StorageFull => Self::DiskFull,
            ErrorKind::DirectoryNotEmpty => Self::VolumeNotEmpty,
            ErrorKind::NotADirectory => Self::FileNotFound,
            ErrorKind::IsADirectory => Self::IsNotRegular,
            ErrorKind::InvalidInput => Self::InvalidArgument,
            _ => Self::Io(err.to_string()),
        }
    }
}

/// Errors returned by the object layer.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ObjectError {
    #[error("invalid bucket name: {bucket}")]
    BucketNameInvalid { bucket: String },

    #[error("invalid object name: {bucket}/{object}")]
    ObjectNameInvalid { bucket: String, object: String },

    #[error("bucket not found: {bucket}")]
    BucketNotFound { bucket: String },

    #[error("bucket already exists: {bucket}")]
    BucketExists { bucket: String },

    #[error("object not found: {bucket}/{object}")]
    ObjectNotFound { bucket: String, object: String },

    #[error("storage reached its minimum free disk threshold")]
    StorageFull,

    #[error("no such multipart upload: {upload_id}")]
    InvalidUploadId { upload_id: String },

    #[error("invalid part: {part_number}")]
    InvalidPart { part_number: u32 },

    #[error("part {part_number} is too small: {size} bytes, minimum {min_size}")]
    PartTooSmall {
        part_number: u32,
        size: u64,
        min_size: u64,
    },

    #[error("bad digest: expected {expected_md5}, calculated {calculated_md5}")]
    BadDigest {
        expected_md5: String,
        calculated_md5: String,
    },

    #[error("entity too large: {size} exceeds maximum {max_size}")]
    EntityTooLarge { size: u64, max_size: u64 },

    #[error("invalid range: offset {offset}, length {length}, object size {size}")]
    InvalidRange { offset: u64, length: u64, size: u64 },

    #[error("delimiter '{delimiter}' is not supported")]
    UnsupportedDelimiter { delimiter: String },

    #[error("invalid combination of marker '{marker}' and prefix '{prefix}'")]
    InvalidMarkerPrefixCombination { marker: String, prefix: String },

    #[error("write quorum not met for {bucket}/{object}")]
    WriteQuorum { bucket: String, object: String },

    #[error("read quorum not met for {bucket}/{object}")]
    ReadQuorum { bucket: String, object: String },

    #[error(transparent)]
    Storage(#[from] StorageError),
}

impl ObjectError {
    /// HTTP status code used when rendering this error over the S3 surface.
    #[must_use]
    pub fn http_status_code(&self) -> u16 {
        match self {
            Self::BucketNameInvalid { .. }
            | Self::ObjectNameInvalid { .. }
            | Self::InvalidPart { .. }
            | Self::PartTooSmall { .. }
            | Self::BadDigest { .. } => 400,
            Self::EntityTooLarge { .. } => 413,
            Self::InvalidRange { .. } => 416,
            Self::BucketNotFound { .. }
            | Self::ObjectNotFound { .. }
            | Self::InvalidUploadId { .. } => 404,
            Self::BucketExists { .. } => 409,
            Self::UnsupportedDelimiter { .. } | Self::InvalidMarkerPrefixCombination { .. } => 501,
            Self::StorageFull
            | Self::WriteQuorum { .. }
            | Self::ReadQuorum { .. }
            | Self::Storage(_) => 500,
        }
    }

    /// S3 error code for API compatibility.
    #[must_use]
    pub fn s3_error_code(&self) -> &'static str {
        match self {
            Self::BucketNameInvalid { .. } => "InvalidBucketName",
            Self::ObjectNameInvalid { .. } => "InvalidObjectName",
            Self::BucketNotFound { .. } => "NoSuchBucket",
            Self::BucketExists { .. } => "BucketAlreadyExists",
            Self::ObjectNotFound { .. } => "NoSuchKey",
            Self::StorageFull => "StorageFull",
            Self::InvalidUploadId { .. } => "NoSuchUpload",
            Self::InvalidPart { .. } => "InvalidPart",
            Self::PartTooSmall { .. } => "EntityTooSmall",
            Self::BadDigest { .. } => "BadDigest",
            Self::EntityTooLarge { .. } => "EntityTooLarge",
            Self::InvalidRange { .. } => "InvalidRange",
            Self::UnsupportedDelimiter { .. } | Self::InvalidMarkerPrefixCombination { .. } => {
                "NotImplemented"
            }
            Self::WriteQuorum { .. } | Self::ReadQuorum { .. } | Self::Storage(_) => {
                "InternalError"
            }
        }
    }
}

/// Translate a storage error into the object-layer error for a bucket/object
/// pair. Pass an empty `object` for bucket-level operations.
#[must_use]
pub fn to_object_err(err: StorageError, bucket: &str, object: &str) -> ObjectError {
    match err {
        StorageError::VolumeNotFound => ObjectError::BucketNotFound {
            bucket: bucket.to_string(),
        },
        StorageError::VolumeExists => ObjectError::BucketExists {
            bucket: bucket.to_string(),
        },
        StorageError::DiskFull => ObjectError::StorageFull,
        StorageError::FileNotFound | StorageError::IsNotRegular if !object.is_empty() => {
            ObjectError::ObjectNotFound {
                bucket: bucket.to_string(),
                object: object.to_string(),
            }
        }
        StorageError::FileNameTooLong => ObjectError::ObjectNameInvalid {
            bucket: bucket.to_string(),
            object: object.to_string(),
        },
        other => ObjectError::Storage(other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn storage_error_code_round_trip() {
        for err in [
            StorageError::DiskNotFound,
            StorageError::FaultyDisk,
            StorageError::FileNotFound,
            StorageError::VolumeNotEmpty,
            StorageError::InvalidToken,
        ] {
            assert_eq!(StorageError::from_code(err.code(), ""), err);
        }
        assert_eq!(
            StorageError::from_code("SomethingElse", "boom"),
            StorageError::Io("boom".to_string())
        );
    }

    #[test]
    fn object_err_mapping() {
        assert_eq!(
            to_object_err(StorageError::VolumeNotFound, "bucket", ""),
            ObjectError::BucketNotFound {
                bucket: "bucket".to_string()
            }
        );
        assert_eq!(
            to_object_err(StorageError::FileNotFound, "bucket", "obj"),
            ObjectError::ObjectNotFound {
                bucket: "bucket".to_string(),
                object: "obj".to_string()
            }
        );
        // A file-not-found with no object context stays a storage error.
        assert_eq!(
            to_object_err(StorageError::FileNotFound, "bucket", ""),
            ObjectError::Storage(StorageError::FileNotFound)
        );
    }

    #[test]
    fn not_implemented_codes() {
        let err = ObjectError::UnsupportedDelimiter {
            delimiter: "*".to_string(),
        };
        assert_eq!(err.s3_error_code(), "NotImplemented");
        assert_eq!(err.http_status_code(), 501);
    }
}
