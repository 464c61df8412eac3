//! Shared fixtures for object-layer integration tests.

use coffer_object::xl::XlOptions;
use coffer_object::XlObjects;
use coffer_storage::{PosixDisk, StorageAPI};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

/// Build an XL object layer over `n` posix disks rooted in one tempdir.
pub async fn prepare_xl(n: usize) -> (TempDir, XlObjects) {
    let dir = TempDir::new().unwrap();
    let disks: Vec<Option<Arc<dyn StorageAPI>>> = (0..n)
        .map(|i| {
            let disk = PosixDisk::new(dir.path().join(format!("disk{i}"))).unwrap();
            Some(Arc::new(disk) as Arc<dyn StorageAPI>)
        })
        .collect();
    let xl = XlObjects::with_options(
        disks,
        XlOptions {
            tree_walk_timeout: Duration::from_secs(30),
            cache_enabled: true,
            trace_locks: false,
        },
    )
    .await
    .unwrap();
    (dir, xl)
}

pub fn md5_hex(data: &[u8]) -> String {
    format!("{:x}", md5::compute(data))
}
