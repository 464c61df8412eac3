//! Local disk implementation of the storage API.

use crate::api::StorageAPI;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use coffer_common::{DiskInfo, FileInfo, StorageError, StorageResult, VolInfo, SLASH_SEPARATOR};
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tracing::debug;

/// Longest path accepted relative to the disk root.
const MAX_PATH_LENGTH: usize = 4096;

/// Longest single path component accepted.
const MAX_COMPONENT_LENGTH: usize = 255;

/// A disk rooted at a local filesystem path.
pub struct PosixDisk {
    disk_path: PathBuf,
}

impl PosixDisk {
    /// Open a disk rooted at `disk_path`, creating the root directory if it
    /// does not exist yet.
    pub fn new(disk_path: impl Into<PathBuf>) -> StorageResult<Self> {
        let disk_path = disk_path.into();
        if disk_path.as_os_str().is_empty() {
            return Err(StorageError::InvalidArgument);
        }
        match std::fs::metadata(&disk_path) {
            Ok(meta) if meta.is_dir() => {}
            Ok(_) => return Err(StorageError::DiskNotFound),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                std::fs::create_dir_all(&disk_path)?;
            }
            Err(err) => return Err(err.into()),
        }
        debug!(path = %disk_path.display(), "opened posix disk");
        Ok(Self { disk_path })
    }

    /// The filesystem root of this disk.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.disk_path
    }

    fn volume_dir(&self, volume: &str) -> StorageResult<PathBuf> {
        if !is_valid_volname(volume) {
            return Err(StorageError::InvalidArgument);
        }
        Ok(self.disk_path.join(volume))
    }

    /// Resolve a slash-separated file path inside a volume, validating
    /// length limits before any disk access.
    fn file_path(&self, volume: &str, path: &str) -> StorageResult<PathBuf> {
        let vol_dir = self.volume_dir(volume)?;
        check_path_length(path)?;
        let mut full = vol_dir;
        for component in path.split(SLASH_SEPARATOR) {
            if component == "." || component == ".." {
                return Err(StorageError::InvalidArgument);
            }
            if !component.is_empty() {
                full.push(component);
            }
        }
        Ok(full)
    }

    async fn check_volume_exists(&self, volume: &str) -> StorageResult<PathBuf> {
        let vol_dir = self.volume_dir(volume)?;
        match fs::metadata(&vol_dir).await {
            Ok(meta) if meta.is_dir() => Ok(vol_dir),
            Ok(_) => Err(StorageError::VolumeNotFound),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                // Distinguish a vanished disk from a missing volume.
                match fs::metadata(&self.disk_path).await {
                    Ok(_) => Err(StorageError::VolumeNotFound),
                    Err(_) => Err(StorageError::DiskNotFound),
                }
            }
            Err(err) if err.kind() == std::io::ErrorKind::PermissionDenied => {
                Err(StorageError::VolumeAccessDenied)
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Remove now-empty parents of `removed`, stopping at the volume root.
    async fn prune_empty_parents(&self, removed: &Path, vol_dir: &Path) {
        let mut current = removed.parent();
        while let Some(dir) = current {
            if dir == vol_dir || !dir.starts_with(vol_dir) {
                break;
            }
            if fs::remove_dir(dir).await.is_err() {
                break;
            }
            current = dir.parent();
        }
    }
}

#[async_trait]
impl StorageAPI for PosixDisk {
    async fn disk_info(&self) -> StorageResult<DiskInfo> {
        let stats = fs2::statvfs(&self.disk_path).map_err(|err| {
            if err.kind() == std::io::ErrorKind::NotFound {
                StorageError::DiskNotFound
            } else {
                err.into()
            }
        })?;
        Ok(DiskInfo {
            total: stats.total_space(),
            free: stats.free_space(),
            fs_type: "posix".to_string(),
        })
    }

    async fn make_vol(&self, volume: &str) -> StorageResult<()> {
        let vol_dir = self.volume_dir(volume)?;
        match fs::create_dir(&vol_dir).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => {
                Err(StorageError::VolumeExists)
            }
            Err(err) if err.kind() == std::io::ErrorKind::PermissionDenied => {
                Err(StorageError::DiskAccessDenied)
            }
            Err(err) => Err(err.into()),
        }
    }

    async fn list_vols(&self) -> StorageResult<Vec<VolInfo>> {
        let mut entries = match fs::read_dir(&self.disk_path).await {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Err(StorageError::DiskNotFound)
            }
            Err(err) => return Err(err.into()),
        };
        let mut vols = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let meta = entry.metadata().await?;
            if !meta.is_dir() {
                continue;
            }
            let Ok(name) = entry.file_name().into_string() else {
                continue;
            };
            vols.push(VolInfo {
                name,
                created: created_time(&meta),
            });
        }
        Ok(vols)
    }

    async fn stat_vol(&self, volume: &str) -> StorageResult<VolInfo> {
        let vol_dir = self.check_volume_exists(volume).await?;
        let meta = fs::metadata(&vol_dir).await?;
        Ok(VolInfo {
            name: volume.to_string(),
            created: created_time(&meta),
        })
    }

    async fn delete_vol(&self, volume: &str) -> StorageResult<()> {
        let vol_dir = self.volume_dir(volume)?;
        match fs::remove_dir(&vol_dir).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                Err(StorageError::VolumeNotFound)
            }
            Err(err) if err.kind() == std::io::ErrorKind::PermissionDenied => {
                Err(StorageError::VolumeAccessDenied)
            }
            Err(err) => Err(err.into()),
        }
    }

    async fn list_dir(&self, volume: &str, dir_path: &str) -> StorageResult<Vec<String>> {
        self.check_volume_exists(volume).await?;
        let dir = self.file_path(volume, dir_path)?;
        let mut entries = match fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Err(StorageError::FileNotFound)
            }
            Err(err) => return Err(err.into()),
        };
        let mut names = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let Ok(mut name) = entry.file_name().into_string() else {
                continue;
            };
            if entry.metadata().await?.is_dir() {
                name.push('/');
            }
            names.push(name);
        }
        Ok(names)
    }

    async fn read_all(&self, volume: &str, path: &str) -> StorageResult<Vec<u8>> {
        self.check_volume_exists(volume).await?;
        let file_path = self.file_path(volume, path)?;
        match fs::read(&file_path).await {
            Ok(data) => Ok(data),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                Err(StorageError::FileNotFound)
            }
            Err(err) => Err(err.into()),
        }
    }

    async fn read_file(
        &self,
        volume: &str,
        path: &str,
        offset: u64,
        buf: &mut [u8],
    ) -> StorageResult<u64> {
        self.check_volume_exists(volume).await?;
        let file_path = self.file_path(volume, path)?;
        let meta = match fs::metadata(&file_path).await {
            Ok(meta) => meta,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Err(StorageError::FileNotFound)
            }
            Err(err) => return Err(err.into()),
        };
        if !meta.is_file() {
            return Err(StorageError::IsNotRegular);
        }
        let mut file = fs::File::open(&file_path).await?;
        file.seek(std::io::SeekFrom::Start(offset)).await?;
        let mut filled = 0usize;
        while filled < buf.len() {
            let n = file.read(&mut buf[filled..]).await?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        Ok(filled as u64)
    }

    async fn append_file(&self, volume: &str, path: &str, buf: &[u8]) -> StorageResult<()> {
        self.check_volume_exists(volume).await?;
        let file_path = self.file_path(volume, path)?;
        if let Some(parent) = file_path.parent() {
            fs::create_dir_all(parent).await?;
        }
        let mut file = fs::OpenOptions::new()
            .append(true)
            .create(true)
            .open(&file_path)
            .await?;
        tokio::io::AsyncWriteExt::write_all(&mut file, buf).await?;
        Ok(())
    }

    async fn stat_file(&self, volume: &str, path: &str) -> StorageResult<FileInfo> {
        self.check_volume_exists(volume).await?;
        let file_path = self.file_path(volume, path)?;
        let meta = match fs::metadata(&file_path).await {
            Ok(meta) => meta,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Err(StorageError::FileNotFound)
            }
            Err(err) => return Err(err.into()),
        };
        if !meta.is_file() {
            return Err(StorageError::IsNotRegular);
        }
        Ok(FileInfo {
            volume: volume.to_string(),
            name: path.to_string(),
            size: meta.len(),
            mod_time: modified_time(&meta),
        })
    }

    async fn rename_file(
        &self,
        src_volume: &str,
        src_path: &str,
        dst_volume: &str,
        dst_path: &str,
    ) -> StorageResult<()> {
        self.check_volume_exists(src_volume).await?;
        self.check_volume_exists(dst_volume).await?;
        // Either both paths name directories or both name files.
        let src_is_dir = src_path.ends_with(SLASH_SEPARATOR);
        let dst_is_dir = dst_path.ends_with(SLASH_SEPARATOR);
        if src_is_dir != dst_is_dir {
            return Err(StorageError::InvalidArgument);
        }
        let src = self.file_path(src_volume, src_path)?;
        let dst = self.file_path(dst_volume, dst_path)?;
        if let Some(parent) = dst.parent() {
            fs::create_dir_all(parent).await?;
        }
        match fs::rename(&src, &dst).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                Err(StorageError::FileNotFound)
            }
            Err(err) if err.kind() == std::io::ErrorKind::PermissionDenied => {
                Err(StorageError::FileAccessDenied)
            }
            Err(err) => Err(err.into()),
        }
    }

    async fn delete_file(&self, volume: &str, path: &str) -> StorageResult<()> {
        let vol_dir = self.check_volume_exists(volume).await?;
        if path.is_empty() {
            return Err(StorageError::InvalidArgument);
        }
        let file_path = self.file_path(volume, path)?;
        let result = if path.ends_with(SLASH_SEPARATOR) {
            fs::remove_dir(&file_path).await
        } else {
            fs::remove_file(&file_path).await
        };
        match result {
            Ok(()) => {}
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Err(StorageError::FileNotFound)
            }
            Err(err) if err.kind() == std::io::ErrorKind::PermissionDenied => {
                return Err(StorageError::FileAccessDenied)
            }
            Err(err) => return Err(err.into()),
        }
        self.prune_empty_parents(&file_path, &vol_dir).await;
        Ok(())
    }
}

fn is_valid_volname(volume: &str) -> bool {
    volume.len() >= 3 && !volume.contains('/') && !volume.contains('\\')
}

fn check_path_length(path: &str) -> StorageResult<()> {
    if path.len() > MAX_PATH_LENGTH {
        return Err(StorageError::FileNameTooLong);
    }
    for component in path.split(SLASH_SEPARATOR) {
        if component.len() > MAX_COMPONENT_LENGTH {
            return Err(StorageError::FileNameTooLong);
        }
    }
    Ok(())
}

fn created_time(meta: &std::fs::Metadata) -> DateTime<Utc> {
    meta.created()
        .or_else(|_| meta.modified())
        .map(DateTime::<Utc>::from)
        .unwrap_or_else(|_| Utc::now())
}

fn modified_time(meta: &std::fs::Metadata) -> DateTime<Utc> {
    meta.modified()
        .map(DateTime::<Utc>::from)
        .unwrap_or_else(|_| Utc::now())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn new_disk(dir: &tempfile::TempDir) -> PosixDisk {
        PosixDisk::new(dir.path().join("disk")).unwrap()
    }

    #[tokio::test]
    async fn volume_lifecycle() {
        let dir = tempdir().unwrap();
        let disk = new_disk(&dir);

        disk.make_vol("testvolume").await.unwrap();
        assert_eq!(
            disk.make_vol("testvolume").await,
            Err(StorageError::VolumeExists)
        );

        let vol = disk.stat_vol("testvolume").await.unwrap();
        assert_eq!(vol.name, "testvolume");

        let vols = disk.list_vols().await.unwrap();
        assert_eq!(vols.len(), 1);

        disk.append_file("testvolume", "a/b", b"x").await.unwrap();
        assert_eq!(
            disk.delete_vol("testvolume").await,
            Err(StorageError::VolumeNotEmpty)
        );
        disk.delete_file("testvolume", "a/b").await.unwrap();
        disk.delete_vol("testvolume").await.unwrap();
        assert_eq!(
            disk.stat_vol("testvolume").await,
            Err(StorageError::VolumeNotFound)
        );
    }

    #[tokio::test]
    async fn append_read_and_short_read() {
        let dir = tempdir().unwrap();
        let disk = new_disk(&dir);
        disk.make_vol("vol-a").await.unwrap();

        disk.append_file("vol-a", "f", b"hello ").await.unwrap();
        disk.append_file("vol-a", "f", b"world").await.unwrap();

        assert_eq!(disk.read_all("vol-a", "f").await.unwrap(), b"hello world");

        let mut buf = [0u8; 5];
        let n = disk.read_file("vol-a", "f", 6, &mut buf).await.unwrap();
        assert_eq!(n, 5);
        assert_eq!(&buf, b"world");

        // Reading past the end fills only the available prefix.
        let mut buf = [0u8; 16];
        let n = disk.read_file("vol-a", "f", 6, &mut buf).await.unwrap();
        assert_eq!(n, 5);
        assert_eq!(&buf[..5], b"world");

        // Offset entirely beyond the end is still success.
        let n = disk.read_file("vol-a", "f", 100, &mut buf).await.unwrap();
        assert_eq!(n, 0);

        assert_eq!(
            disk.read_all("vol-a", "missing").await,
            Err(StorageError::FileNotFound)
        );
    }

    #[tokio::test]
    async fn list_dir_marks_directories() {
        let dir = tempdir().unwrap();
        let disk = new_disk(&dir);
        disk.make_vol("vol-a").await.unwrap();
        disk.append_file("vol-a", "file1", b"").await.unwrap();
        disk.append_file("vol-a", "sub/file2", b"").await.unwrap();

        let mut entries = disk.list_dir("vol-a", "").await.unwrap();
        entries.sort();
        assert_eq!(entries, vec!["file1".to_string(), "sub/".to_string()]);

        assert_eq!(
            disk.list_dir("vol-a", "nope").await,
            Err(StorageError::FileNotFound)
        );
        assert_eq!(
            disk.list_dir("no-such-vol", "").await,
            Err(StorageError::VolumeNotFound)
        );
    }

    #[tokio::test]
    async fn rename_file_and_directory() {
        let dir = tempdir().unwrap();
        let disk = new_disk(&dir);
        disk.make_vol("vol-a").await.unwrap();
        disk.make_vol("vol-b").await.unwrap();

        disk.append_file("vol-a", "tmp/one", b"1").await.unwrap();
        disk.rename_file("vol-a", "tmp/one", "vol-b", "deep/final/one")
            .await
            .unwrap();
        assert_eq!(disk.read_all("vol-b", "deep/final/one").await.unwrap(), b"1");

        // Directory rename moves the whole subtree.
        disk.append_file("vol-a", "d1/a", b"a").await.unwrap();
        disk.append_file("vol-a", "d1/b", b"b").await.unwrap();
        disk.rename_file("vol-a", "d1/", "vol-b", "d2/").await.unwrap();
        assert_eq!(disk.read_all("vol-b", "d2/a").await.unwrap(), b"a");
        assert_eq!(
            disk.read_all("vol-a", "d1/a").await,
            Err(StorageError::FileNotFound)
        );

        // Mixed file/directory arguments are rejected.
        assert_eq!(
            disk.rename_file("vol-b", "d2/", "vol-b", "plain").await,
            Err(StorageError::InvalidArgument)
        );
    }

    #[tokio::test]
    async fn delete_file_prunes_empty_parents() {
        let dir = tempdir().unwrap();
        let disk = new_disk(&dir);
        disk.make_vol("vol-a").await.unwrap();
        disk.append_file("vol-a", "a/b/c/leaf", b"x").await.unwrap();
        disk.append_file("vol-a", "a/keep", b"y").await.unwrap();

        disk.delete_file("vol-a", "a/b/c/leaf").await.unwrap();

        // "a/b" and "a/b/c" are gone, "a" survives because of "a/keep".
        let mut entries = disk.list_dir("vol-a", "a").await.unwrap();
        entries.sort();
        assert_eq!(entries, vec!["keep".to_string()]);

        assert_eq!(
            disk.delete_file("vol-a", "a/b/c/leaf").await,
            Err(StorageError::FileNotFound)
        );
    }

    #[tokio::test]
    async fn filename_too_long_never_touches_disk() {
        let dir = tempdir().unwrap();
        let disk = new_disk(&dir);
        disk.make_vol("vol-a").await.unwrap();

        let long_component = "x".repeat(256);
        assert_eq!(
            disk.append_file("vol-a", &long_component, b"x").await,
            Err(StorageError::FileNameTooLong)
        );
        let long_path = format!("a/{}", "y/".repeat(2100));
        assert_eq!(
            disk.stat_file("vol-a", &long_path).await,
            Err(StorageError::FileNameTooLong)
        );
    }

    #[tokio::test]
    async fn stat_file_rejects_directories() {
        let dir = tempdir().unwrap();
        let disk = new_disk(&dir);
        disk.make_vol("vol-a").await.unwrap();
        disk.append_file("vol-a", "d/f", b"x").await.unwrap();

        assert_eq!(
            disk.stat_file("vol-a", "d").await,
            Err(StorageError::IsNotRegular)
        );
        let info = disk.stat_file("vol-a", "d/f").await.unwrap();
        assert_eq!(info.size, 1);
    }

    #[tokio::test]
    async fn disk_info_reports_capacity() {
        let dir = tempdir().unwrap();
        let disk = new_disk(&dir);
        let info = disk.disk_info().await.unwrap();
        assert!(info.total > 0);
    }
}
