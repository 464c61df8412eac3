//! Disk identity (`format.json`).
//!
//! Written once into the reserved meta volume when a disk joins the set and
//! verified on every startup. A parse failure means the disk carries data
//! from something that is not us.

use coffer_common::{StorageError, StorageResult, FORMAT_CONFIG_FILE, META_BUCKET};
use coffer_storage::StorageAPI;
use serde::{Deserialize, Serialize};
use tracing::info;
use uuid::Uuid;

/// Format version understood by this release.
pub const FORMAT_VERSION: &str = "1";

/// Backend tag recorded in the disk format file.
pub const FORMAT_BACKEND: &str = "xl";

/// The `format.json` document.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FormatInfo {
    pub version: String,
    pub format: String,
    pub disk: Uuid,
}

impl FormatInfo {
    #[must_use]
    pub fn new() -> Self {
        Self {
            version: FORMAT_VERSION.to_string(),
            format: FORMAT_BACKEND.to_string(),
            disk: Uuid::new_v4(),
        }
    }

    #[must_use]
    pub fn is_valid(&self) -> bool {
        self.version == FORMAT_VERSION && self.format == FORMAT_BACKEND
    }
}

impl Default for FormatInfo {
    fn default() -> Self {
        Self::new()
    }
}

/// Read the disk's format file. Missing file is `UnformattedDisk`,
/// unparseable or alien content is `CorruptedFormat`.
pub async fn load_format(disk: &dyn StorageAPI) -> StorageResult<FormatInfo> {
    let data = match disk.read_all(META_BUCKET, FORMAT_CONFIG_FILE).await {
        Ok(data) => data,
        Err(StorageError::FileNotFound | StorageError::VolumeNotFound) => {
            return Err(StorageError::UnformattedDisk)
        }
        Err(err) => return Err(err),
    };
    let format: FormatInfo =
        serde_json::from_slice(&data).map_err(|_| StorageError::CorruptedFormat)?;
    if !format.is_valid() {
        return Err(StorageError::CorruptedFormat);
    }
    Ok(format)
}

/// Write a fresh format file, replacing whatever is there.
pub async fn save_format(disk: &dyn StorageAPI, format: &FormatInfo) -> StorageResult<()> {
    let data = serde_json::to_vec(format).map_err(|err| StorageError::Io(err.to_string()))?;
    match disk.delete_file(META_BUCKET, FORMAT_CONFIG_FILE).await {
        Ok(()) | Err(StorageError::FileNotFound) => {}
        Err(err) => return Err(err),
    }
    disk.append_file(META_BUCKET, FORMAT_CONFIG_FILE, &data).await
}

/// Prepare one disk for service: create the meta volume and load or mint
/// its identity.
pub async fn load_or_init_format(disk: &dyn StorageAPI) -> StorageResult<FormatInfo> {
    match disk.make_vol(META_BUCKET).await {
        Ok(()) | Err(StorageError::VolumeExists) => {}
        Err(err) => return Err(err),
    }
    match load_format(disk).await {
        Ok(format) => Ok(format),
        Err(StorageError::UnformattedDisk) => {
            let format = FormatInfo::new();
            save_format(disk, &format).await?;
            info!(disk_id = %format.disk, "formatted fresh disk");
            Ok(format)
        }
        Err(err) => Err(err),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use coffer_storage::PosixDisk;
    use tempfile::tempdir;

    #[tokio::test]
    async fn init_then_load_is_stable() {
        let dir = tempdir().unwrap();
        let disk = PosixDisk::new(dir.path().join("d")).unwrap();

        let first = load_or_init_format(&disk).await.unwrap();
        let second = load_or_init_format(&disk).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(load_format(&disk).await.unwrap(), first);
    }

    #[tokio::test]
    async fn corrupt_format_is_detected() {
        let dir = tempdir().unwrap();
        let disk = PosixDisk::new(dir.path().join("d")).unwrap();
        load_or_init_format(&disk).await.unwrap();

        disk.delete_file(META_BUCKET, FORMAT_CONFIG_FILE).await.unwrap();
        disk.append_file(META_BUCKET, FORMAT_CONFIG_FILE, b"not json")
            .await
            .unwrap();
        assert_eq!(
            load_format(&disk).await,
            Err(StorageError::CorruptedFormat)
        );
    }

    #[tokio::test]
    async fn missing_format_is_unformatted() {
        let dir = tempdir().unwrap();
        let disk = PosixDisk::new(dir.path().join("d")).unwrap();
        disk.make_vol(META_BUCKET).await.unwrap();
        assert_eq!(load_format(&disk).await, Err(StorageError::UnformattedDisk));
    }
}
