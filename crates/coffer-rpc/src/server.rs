//! Storage RPC server: one axum sub-router per exported disk.

use crate::auth::{generate_token, verify_token, RpcCredentials};
use crate::messages::{
    AppendFileArgs, DataReply, FileArgs, GenericArgs, GenericReply, ListDirArgs, LoginArgs,
    LoginReply, ReadFileArgs, RenameFileArgs, RpcErrorBody, VolArgs,
};
use crate::RESERVED_RPC_PREFIX;
use axum::extract::{Json, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::Router;
use coffer_common::{DiskInfo, FileInfo, StorageError, VolInfo};
use coffer_object::namespace_lock::SystemLockState;
use coffer_object::NsLockMap;
use coffer_storage::StorageAPI;
use std::sync::Arc;
use tower_http::catch_panic::CatchPanicLayer;
use tower_http::trace::TraceLayer;
use tracing::{debug, info};

/// Version string reported by the login handler.
pub const SERVER_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Largest single read-file reply the server will allocate. Requests beyond
/// it are answered with a graceful error instead of an oversized buffer.
pub const MAX_READ_BUFFER: u64 = 32 * 1024 * 1024;

/// One disk exported over the RPC surface.
pub struct StorageExport {
    /// Route suffix of the disk, e.g. `/mnt/disk1`.
    pub disk_path: String,
    pub storage: Arc<dyn StorageAPI>,
}

struct RpcState {
    storage: Arc<dyn StorageAPI>,
    creds: RpcCredentials,
}

/// Failure shape of every handler: a status plus the error envelope.
struct RpcFailure(StorageError);

impl IntoResponse for RpcFailure {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            StorageError::InvalidToken => StatusCode::UNAUTHORIZED,
            StorageError::FileNotFound
            | StorageError::VolumeNotFound
            | StorageError::DiskNotFound => StatusCode::NOT_FOUND,
            StorageError::VolumeExists => StatusCode::CONFLICT,
            StorageError::InvalidArgument | StorageError::FileNameTooLong => {
                StatusCode::BAD_REQUEST
            }
            StorageError::DiskAccessDenied
            | StorageError::VolumeAccessDenied
            | StorageError::FileAccessDenied => StatusCode::FORBIDDEN,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, Json(RpcErrorBody::from_storage(&self.0))).into_response()
    }
}

impl From<StorageError> for RpcFailure {
    fn from(err: StorageError) -> Self {
        Self(err)
    }
}

type RpcResult<T> = Result<Json<T>, RpcFailure>;

fn authorize(state: &RpcState, token: &str) -> Result<(), RpcFailure> {
    if verify_token(&state.creds, token) {
        Ok(())
    } else {
        Err(RpcFailure(StorageError::InvalidToken))
    }
}

async fn login(
    State(state): State<Arc<RpcState>>,
    Json(args): Json<LoginArgs>,
) -> RpcResult<LoginReply> {
    if args.username != state.creds.access_key || args.password != state.creds.secret_key {
        return Err(RpcFailure(StorageError::InvalidToken));
    }
    let token =
        generate_token(&state.creds).map_err(|err| StorageError::Io(err.to_string()))?;
    debug!(user = %args.username, "storage rpc login");
    Ok(Json(LoginReply {
        token,
        server_version: SERVER_VERSION.to_string(),
    }))
}

async fn disk_info(
    State(state): State<Arc<RpcState>>,
    Json(args): Json<GenericArgs>,
) -> RpcResult<DiskInfo> {
    authorize(&state, &args.token)?;
    Ok(Json(state.storage.disk_info().await?))
}

async fn make_vol(
    State(state): State<Arc<RpcState>>,
    Json(args): Json<VolArgs>,
) -> RpcResult<GenericReply> {
    authorize(&state, &args.token)?;
    state.storage.make_vol(&args.volume).await?;
    Ok(Json(GenericReply {}))
}

async fn list_vols(
    State(state): State<Arc<RpcState>>,
    Json(args): Json<GenericArgs>,
) -> RpcResult<Vec<VolInfo>> {
    authorize(&state, &args.token)?;
    Ok(Json(state.storage.list_vols().await?))
}

async fn stat_vol(
    State(state): State<Arc<RpcState>>,
    Json(args): Json<VolArgs>,
) -> RpcResult<VolInfo> {
    authorize(&state, &args.token)?;
    Ok(Json(state.storage.stat_vol(&args.volume).await?))
}

async fn delete_vol(
    State(state): State<Arc<RpcState>>,
    Json(args): Json<VolArgs>,
) -> RpcResult<GenericReply> {
    authorize(&state, &args.token)?;
    state.storage.delete_vol(&args.volume).await?;
    Ok(Json(GenericReply {}))
}

async fn list_dir(
    State(state): State<Arc<RpcState>>,
    Json(args): Json<ListDirArgs>,
) -> RpcResult<Vec<String>> {
    authorize(&state, &args.token)?;
    Ok(Json(
        state.storage.list_dir(&args.volume, &args.dir_path).await?,
    ))
}

async fn stat_file(
    State(state): State<Arc<RpcState>>,
    Json(args): Json<FileArgs>,
) -> RpcResult<FileInfo> {
    authorize(&state, &args.token)?;
    Ok(Json(state.storage.stat_file(&args.volume, &args.path).await?))
}

async fn read_all(
    State(state): State<Arc<RpcState>>,
    Json(args): Json<FileArgs>,
) -> RpcResult<DataReply> {
    authorize(&state, &args.token)?;
    let data = state.storage.read_all(&args.volume, &args.path).await?;
    Ok(Json(DataReply { data }))
}

/// The reply buffer is allocated from the client-supplied size; a short
/// read replies with the consumed prefix and success.
async fn read_file(
    State(state): State<Arc<RpcState>>,
    Json(args): Json<ReadFileArgs>,
) -> RpcResult<DataReply> {
    authorize(&state, &args.token)?;
    if args.size > MAX_READ_BUFFER {
        return Err(RpcFailure(StorageError::InvalidArgument));
    }
    let mut buf = vec![0u8; args.size as usize];
    let n = state
        .storage
        .read_file(&args.volume, &args.path, args.offset, &mut buf)
        .await?;
    buf.truncate(n as usize);
    Ok(Json(DataReply { data: buf }))
}

async fn append_file(
    State(state): State<Arc<RpcState>>,
    Json(args): Json<AppendFileArgs>,
) -> RpcResult<GenericReply> {
    authorize(&state, &args.token)?;
    state
        .storage
        .append_file(&args.volume, &args.path, &args.buffer)
        .await?;
    Ok(Json(GenericReply {}))
}

async fn rename_file(
    State(state): State<Arc<RpcState>>,
    Json(args): Json<RenameFileArgs>,
) -> RpcResult<GenericReply> {
    authorize(&state, &args.token)?;
    state
        .storage
        .rename_file(
            &args.src_volume,
            &args.src_path,
            &args.dst_volume,
            &args.dst_path,
        )
        .await?;
    Ok(Json(GenericReply {}))
}

async fn delete_file(
    State(state): State<Arc<RpcState>>,
    Json(args): Json<FileArgs>,
) -> RpcResult<GenericReply> {
    authorize(&state, &args.token)?;
    state.storage.delete_file(&args.volume, &args.path).await?;
    Ok(Json(GenericReply {}))
}

async fn lock_state(State(locks): State<Arc<NsLockMap>>) -> Json<SystemLockState> {
    Json(locks.lock_state())
}

fn disk_router(storage: Arc<dyn StorageAPI>, creds: RpcCredentials) -> Router {
    let state = Arc::new(RpcState { storage, creds });
    Router::new()
        .route("/login", post(login))
        .route("/diskinfo", post(disk_info))
        .route("/makevol", post(make_vol))
        .route("/listvols", post(list_vols))
        .route("/statvol", post(stat_vol))
        .route("/deletevol", post(delete_vol))
        .route("/listdir", post(list_dir))
        .route("/statfile", post(stat_file))
        .route("/readall", post(read_all))
        .route("/readfile", post(read_file))
        .route("/appendfile", post(append_file))
        .route("/renamefile", post(rename_file))
        .route("/deletefile", post(delete_file))
        .with_state(state)
}

/// Assemble the RPC surface: one sub-router per exported disk under
/// `/coffer/storage/<disk-path>`, plus the lock-state snapshot endpoint.
/// Handler panics become plain 500s rather than a dead process.
pub fn storage_rpc_router(
    exports: Vec<StorageExport>,
    creds: RpcCredentials,
    lock_map: Option<Arc<NsLockMap>>,
) -> Router {
    let mut router = Router::new();
    for export in exports {
        let suffix = if export.disk_path.starts_with('/') {
            export.disk_path.clone()
        } else {
            format!("/{}", export.disk_path)
        };
        let base = format!("{RESERVED_RPC_PREFIX}/storage{suffix}");
        info!(path = %base, "exporting disk over rpc");
        router = router.nest(&base, disk_router(export.storage, creds.clone()));
    }
    if let Some(locks) = lock_map {
        router = router.route(
            &format!("{RESERVED_RPC_PREFIX}/lockstate"),
            get(lock_state).with_state(locks),
        );
    }
    router
        .layer(CatchPanicLayer::new())
        .layer(TraceLayer::new_for_http())
}
