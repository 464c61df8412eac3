//! Remote disk client: the storage contract over HTTP.

use crate::auth::RpcCredentials;
use crate::messages::{
    AppendFileArgs, DataReply, FileArgs, GenericArgs, GenericReply, ListDirArgs, LoginArgs,
    LoginReply, ReadFileArgs, RenameFileArgs, RpcErrorBody, VolArgs,
};
use crate::RESERVED_RPC_PREFIX;
use async_trait::async_trait;
use coffer_common::{DiskInfo, FileInfo, StorageError, StorageResult, VolInfo};
use coffer_storage::StorageAPI;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::debug;

/// Round-trip budget for a single storage call; a disk that cannot answer
/// in time is treated as absent.
const RPC_TIMEOUT: Duration = Duration::from_secs(30);

/// A disk served by another node. Identical in contract to a local disk.
pub struct RemoteDisk {
    base_url: String,
    http: reqwest::Client,
    creds: RpcCredentials,
    token: RwLock<Option<String>>,
}

impl RemoteDisk {
    /// Connect to the disk exported at `endpoint` (e.g. `http://host:9000`)
    /// under `disk_path` (e.g. `/mnt/disk1`).
    pub fn new(endpoint: &str, disk_path: &str, creds: RpcCredentials) -> StorageResult<Self> {
        let suffix = if disk_path.starts_with('/') {
            disk_path.to_string()
        } else {
            format!("/{disk_path}")
        };
        let http = reqwest::Client::builder()
            .timeout(RPC_TIMEOUT)
            .build()
            .map_err(|err| StorageError::Io(err.to_string()))?;
        Ok(Self {
            base_url: format!(
                "{}{RESERVED_RPC_PREFIX}/storage{suffix}",
                endpoint.trim_end_matches('/')
            ),
            http,
            creds,
            token: RwLock::new(None),
        })
    }

    async fn login(&self) -> StorageResult<String> {
        let reply: LoginReply = self
            .post(
                "login",
                &LoginArgs {
                    username: self.creds.access_key.clone(),
                    password: self.creds.secret_key.clone(),
                },
            )
            .await?;
        debug!(server_version = %reply.server_version, "storage rpc login ok");
        *self.token.write().await = Some(reply.token.clone());
        Ok(reply.token)
    }

    async fn token(&self) -> StorageResult<String> {
        if let Some(token) = self.token.read().await.clone() {
            return Ok(token);
        }
        self.login().await
    }

    async fn post<A: Serialize, T: DeserializeOwned>(
        &self,
        method: &str,
        args: &A,
    ) -> StorageResult<T> {
        let url = format!("{}/{method}", self.base_url);
        let response = self
            .http
            .post(&url)
            .json(args)
            .send()
            .await
            .map_err(transport_err)?;
        if response.status().is_success() {
            return response
                .json::<T>()
                .await
                .map_err(|err| StorageError::Io(err.to_string()));
        }
        let err = match response.json::<RpcErrorBody>().await {
            Ok(body) => body.to_storage(),
            Err(err) => StorageError::Io(err.to_string()),
        };
        Err(err)
    }

    /// Issue `method`, logging in lazily and retrying once when the token
    /// has gone stale.
    async fn call<T, F, A>(&self, method: &str, build: F) -> StorageResult<T>
    where
        T: DeserializeOwned,
        A: Serialize,
        F: Fn(String) -> A,
    {
        let token = self.token().await?;
        match self.post(method, &build(token)).await {
            Err(StorageError::InvalidToken) => {
                let token = self.login().await?;
                self.post(method, &build(token)).await
            }
            other => other,
        }
    }
}

/// Connection-level failures mean the disk is unreachable.
fn transport_err(err: reqwest::Error) -> StorageError {
    debug!(%err, "storage rpc transport failure");
    StorageError::DiskNotFound
}

#[async_trait]
impl StorageAPI for RemoteDisk {
    async fn disk_info(&self) -> StorageResult<DiskInfo> {
        self.call("diskinfo", |token| GenericArgs { token }).await
    }

    async fn make_vol(&self, volume: &str) -> StorageResult<()> {
        let _: GenericReply = self
            .call("makevol", |token| VolArgs {
                token,
                volume: volume.to_string(),
            })
            .await?;
        Ok(())
    }

    async fn list_vols(&self) -> StorageResult<Vec<VolInfo>> {
        self.call("listvols", |token| GenericArgs { token }).await
    }

    async fn stat_vol(&self, volume: &str) -> StorageResult<VolInfo> {
        self.call("statvol", |token| VolArgs {
            token,
            volume: volume.to_string(),
        })
        .await
    }

    async fn delete_vol(&self, volume: &str) -> StorageResult<()> {
        let _: GenericReply = self
            .call("deletevol", |token| VolArgs {
                token,
                volume: volume.to_string(),
            })
            .await?;
        Ok(())
    }

    async fn list_dir(&self, volume: &str, dir_path: &str) -> StorageResult<Vec<String>> {
        self.call("listdir", |token| ListDirArgs {
            token,
            volume: volume.to_string(),
            dir_path: dir_path.to_string(),
        })
        .await
    }

    async fn read_all(&self, volume: &str, path: &str) -> StorageResult<Vec<u8>> {
        let reply: DataReply = self
            .call("readall", |token| FileArgs {
                token,
                volume: volume.to_string(),
                path: path.to_string(),
            })
            .await?;
        Ok(reply.data)
    }

    async fn read_file(
        &self,
        volume: &str,
        path: &str,
        offset: u64,
        buf: &mut [u8],
    ) -> StorageResult<u64> {
        let reply: DataReply = self
            .call("readfile", |token| ReadFileArgs {
                token,
                volume: volume.to_string(),
                path: path.to_string(),
                offset,
                size: buf.len() as u64,
            })
            .await?;
        // EOF comes back as a short buffer, never as an error.
        let n = reply.data.len().min(buf.len());
        buf[..n].copy_from_slice(&reply.data[..n]);
        Ok(n as u64)
    }

    async fn append_file(&self, volume: &str, path: &str, data: &[u8]) -> StorageResult<()> {
        let _: GenericReply = self
            .call("appendfile", |token| AppendFileArgs {
                token,
                volume: volume.to_string(),
                path: path.to_string(),
                buffer: data.to_vec(),
            })
            .await?;
        Ok(())
    }

    async fn stat_file(&self, volume: &str, path: &str) -> StorageResult<FileInfo> {
        self.call("statfile", |token| FileArgs {
            token,
            volume: volume.to_string(),
            path: path.to_string(),
        })
        .await
    }

    async fn rename_file(
        &self,
        src_volume: &str,
        src_path: &str,
        dst_volume: &str,
        dst_path: &str,
    ) -> StorageResult<()> {
        let _: GenericReply = self
            .call("renamefile", |token| RenameFileArgs {
                token,
                src_volume: src_volume.to_string(),
                src_path: src_path.to_string(),
                dst_volume: dst_volume.to_string(),
                dst_path: dst_path.to_string(),
            })
            .await?;
        Ok(())
    }

    async fn delete_file(&self, volume: &str, path: &str) -> StorageResult<()> {
        let _: GenericReply = self
            .call("deletefile", |token| FileArgs {
                token,
                volume: volume.to_string(),
                path: path.to_string(),
            })
            .await?;
        Ok(())
    }
}
