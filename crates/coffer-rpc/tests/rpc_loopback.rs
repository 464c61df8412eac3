//! Loopback test: a remote disk speaking to a real RPC server must be
//! indistinguishable from a local one.

use coffer_common::StorageError;
use coffer_object::namespace_lock::SystemLockState;
use coffer_object::NsLockMap;
use coffer_rpc::{storage_rpc_router, RemoteDisk, RpcCredentials, StorageExport};
use coffer_storage::{PosixDisk, StorageAPI};
use std::net::SocketAddr;
use std::sync::Arc;
use tempfile::tempdir;

fn creds() -> RpcCredentials {
    RpcCredentials {
        access_key: "storage-admin".to_string(),
        secret_key: "loopback-secret".to_string(),
    }
}

async fn spawn_server(
    storage: Arc<dyn StorageAPI>,
    lock_map: Option<Arc<NsLockMap>>,
) -> SocketAddr {
    let router = storage_rpc_router(
        vec![StorageExport {
            disk_path: "/disk0".to_string(),
            storage,
        }],
        creds(),
        lock_map,
    );
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    addr
}

#[tokio::test]
async fn remote_disk_matches_local_contract() {
    let dir = tempdir().unwrap();
    let local: Arc<dyn StorageAPI> = Arc::new(PosixDisk::new(dir.path().join("d")).unwrap());
    let addr = spawn_server(local, None).await;

    let remote = RemoteDisk::new(&format!("http://{addr}"), "/disk0", creds()).unwrap();

    remote.make_vol("testvolume").await.unwrap();
    assert_eq!(
        remote.make_vol("testvolume").await,
        Err(StorageError::VolumeExists)
    );

    remote
        .append_file("testvolume", "dir/file", b"hello ")
        .await
        .unwrap();
    remote
        .append_file("testvolume", "dir/file", b"remote world")
        .await
        .unwrap();
    assert_eq!(
        remote.read_all("testvolume", "dir/file").await.unwrap(),
        b"hello remote world"
    );

    let info = remote.stat_file("testvolume", "dir/file").await.unwrap();
    assert_eq!(info.size, 18);

    // A short read comes back as the consumed prefix, not an error.
    let mut buf = [0u8; 64];
    let n = remote
        .read_file("testvolume", "dir/file", 6, &mut buf)
        .await
        .unwrap();
    assert_eq!(n, 12);
    assert_eq!(&buf[..12], b"remote world");

    let mut entries = remote.list_dir("testvolume", "").await.unwrap();
    entries.sort();
    assert_eq!(entries, vec!["dir/".to_string()]);

    remote
        .rename_file("testvolume", "dir/file", "testvolume", "moved/file")
        .await
        .unwrap();
    assert_eq!(
        remote.read_all("testvolume", "dir/file").await,
        Err(StorageError::FileNotFound)
    );

    remote.delete_file("testvolume", "moved/file").await.unwrap();
    let vols = remote.list_vols().await.unwrap();
    assert_eq!(vols.len(), 1);
    remote.delete_vol("testvolume").await.unwrap();
    assert_eq!(
        remote.stat_vol("testvolume").await,
        Err(StorageError::VolumeNotFound)
    );

    let disk_info = remote.disk_info().await.unwrap();
    assert!(disk_info.total > 0);
}

#[tokio::test]
async fn bad_credentials_are_rejected() {
    let dir = tempdir().unwrap();
    let local: Arc<dyn StorageAPI> = Arc::new(PosixDisk::new(dir.path().join("d")).unwrap());
    let addr = spawn_server(local, None).await;

    let bad = RpcCredentials {
        access_key: "storage-admin".to_string(),
        secret_key: "wrong-secret".to_string(),
    };
    let remote = RemoteDisk::new(&format!("http://{addr}"), "/disk0", bad).unwrap();
    assert_eq!(
        remote.list_vols().await,
        Err(StorageError::InvalidToken)
    );
}

#[tokio::test]
async fn unreachable_endpoint_reads_as_absent_disk() {
    // Nothing listens on this port.
    let remote = RemoteDisk::new("http://127.0.0.1:9", "/disk0", creds()).unwrap();
    assert_eq!(remote.list_vols().await, Err(StorageError::DiskNotFound));
}

#[tokio::test]
async fn oversized_read_is_a_graceful_error() {
    let dir = tempdir().unwrap();
    let local: Arc<dyn StorageAPI> = Arc::new(PosixDisk::new(dir.path().join("d")).unwrap());
    local.make_vol("testvolume").await.unwrap();
    local.append_file("testvolume", "f", b"x").await.unwrap();
    let addr = spawn_server(local, None).await;

    let remote = RemoteDisk::new(&format!("http://{addr}"), "/disk0", creds()).unwrap();
    // The server refuses to allocate a reply buffer this large.
    let mut huge = vec![0u8; 33 * 1024 * 1024];
    assert_eq!(
        remote.read_file("testvolume", "f", 0, &mut huge).await,
        Err(StorageError::InvalidArgument)
    );
}

#[tokio::test]
async fn lock_state_endpoint_snapshots_the_map() {
    let dir = tempdir().unwrap();
    let local: Arc<dyn StorageAPI> = Arc::new(PosixDisk::new(dir.path().join("d")).unwrap());
    let locks = Arc::new(NsLockMap::new(true));
    let addr = spawn_server(local, Some(locks.clone())).await;

    let _guard = locks.lock("bucket", "object", "op-http").await;

    let url = format!("http://{addr}/coffer/lockstate");
    let state: SystemLockState = reqwest::get(&url).await.unwrap().json().await.unwrap();
    assert_eq!(state.total_running_locks, 1);
    assert_eq!(state.locks.len(), 1);
    assert_eq!(state.locks[0].volume, "bucket");
    assert_eq!(state.locks[0].path, "object");
}
