//! Coffer Server - erasure-coded S3-compatible object storage
//!
//! Builds the disk set (local paths and remote exports), the XL object
//! layer and the storage RPC surface, then serves HTTP with protocol
//! classification on every accepted connection.

mod mux;
mod shutdown;

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use coffer_object::xl::XlOptions;
use coffer_object::XlObjects;
use coffer_rpc::{storage_rpc_router, RemoteDisk, RpcCredentials, StorageExport};
use coffer_storage::{PosixDisk, StorageAPI};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as ConnBuilder;
use hyper_util::service::TowerToHyperService;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpListener;
use tracing::{debug, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "coffer-server")]
#[command(about = "Erasure-coded S3-compatible object storage server")]
#[command(version)]
struct Args {
    /// Configuration file path
    #[arg(short, long, default_value = "/etc/coffer/server.toml")]
    config: String,

    /// Listen address
    #[arg(short, long)]
    listen: Option<String>,

    /// Disk specs: a local path, or host:port:/path for a remote export
    #[arg(long)]
    disks: Vec<String>,

    /// Access key (overrides config and COFFER_ACCESS_KEY)
    #[arg(long)]
    access_key: Option<String>,

    /// Secret key (overrides config and COFFER_SECRET_KEY)
    #[arg(long)]
    secret_key: Option<String>,

    /// Log level
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Disable the in-memory whole-object cache
    #[arg(long, default_value_t = false)]
    no_cache: bool,

    /// Treat the listener as a TLS port: redirect plaintext clients to
    /// https://<host>/
    #[arg(long)]
    tls_redirect_host: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct Config {
    #[serde(default)]
    server: ServerConfig,
    #[serde(default)]
    storage: StorageConfig,
    #[serde(default)]
    logging: LoggingConfig,
}

#[derive(Debug, Deserialize)]
struct ServerConfig {
    #[serde(default = "default_listen")]
    listen: String,
    #[serde(default = "default_access_key")]
    access_key: String,
    #[serde(default = "default_secret_key")]
    secret_key: String,
    #[serde(default)]
    tls_redirect_host: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            access_key: default_access_key(),
            secret_key: default_secret_key(),
            tls_redirect_host: None,
        }
    }
}

#[derive(Debug, Deserialize, Default)]
struct StorageConfig {
    #[serde(default)]
    disks: Vec<String>,
    #[serde(default)]
    cache_disabled: bool,
}

#[derive(Debug, Deserialize)]
struct LoggingConfig {
    #[serde(default = "default_log_level")]
    level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_listen() -> String {
    "0.0.0.0:9000".to_string()
}

fn default_access_key() -> String {
    std::env::var("COFFER_ACCESS_KEY").unwrap_or_else(|_| "coffer".to_string())
}

fn default_secret_key() -> String {
    std::env::var("COFFER_SECRET_KEY").unwrap_or_else(|_| "coffer-secret".to_string())
}

fn default_log_level() -> String {
    "info".to_string()
}

/// A parsed disk specification.
#[derive(Debug, PartialEq, Eq)]
enum DiskSpec {
    Local(String),
    Remote { endpoint: String, path: String },
}

/// `host:port:/path` names a disk exported by another node; anything else
/// is a local path.
fn parse_disk_spec(spec: &str) -> DiskSpec {
    let parts: Vec<&str> = spec.splitn(3, ':').collect();
    if parts.len() == 3 && parts[1].parse::<u16>().is_ok() && parts[2].starts_with('/') {
        return DiskSpec::Remote {
            endpoint: format!("http://{}:{}", parts[0], parts[1]),
            path: parts[2].to_string(),
        };
    }
    DiskSpec::Local(spec.to_string())
}

fn build_disks(
    specs: &[String],
    creds: &RpcCredentials,
) -> Result<(Vec<Option<Arc<dyn StorageAPI>>>, Vec<StorageExport>)> {
    let mut disks: Vec<Option<Arc<dyn StorageAPI>>> = Vec::with_capacity(specs.len());
    let mut exports = Vec::new();
    for spec in specs {
        match parse_disk_spec(spec) {
            DiskSpec::Local(path) => match PosixDisk::new(&path) {
                Ok(disk) => {
                    let disk: Arc<dyn StorageAPI> = Arc::new(disk);
                    exports.push(StorageExport {
                        disk_path: path.clone(),
                        storage: disk.clone(),
                    });
                    disks.push(Some(disk));
                }
                Err(err) => {
                    warn!(disk = %path, %err, "disk unusable at startup");
                    disks.push(None);
                }
            },
            DiskSpec::Remote { endpoint, path } => {
                match RemoteDisk::new(&endpoint, &path, creds.clone()) {
                    Ok(disk) => disks.push(Some(Arc::new(disk))),
                    Err(err) => {
                        warn!(disk = %spec, %err, "remote disk unusable at startup");
                        disks.push(None);
                    }
                }
            }
        }
    }
    if disks.is_empty() {
        return Err(anyhow!("no disks configured"));
    }
    Ok((disks, exports))
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config: Config = match std::fs::read_to_string(&args.config) {
        Ok(contents) => toml::from_str(&contents)
            .with_context(|| format!("parsing config file {}", args.config))?,
        Err(_) => Config::default(),
    };

    let log_level = if args.log_level == "info" && config.logging.level != "info" {
        config.logging.level.clone()
    } else {
        args.log_level.clone()
    };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| log_level.into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let listen = args.listen.unwrap_or(config.server.listen);
    let creds = RpcCredentials {
        access_key: args.access_key.unwrap_or(config.server.access_key),
        secret_key: args.secret_key.unwrap_or(config.server.secret_key),
    };
    let disk_specs = if args.disks.is_empty() {
        config.storage.disks.clone()
    } else {
        args.disks.clone()
    };
    let cache_enabled = !(args.no_cache || config.storage.cache_disabled);
    let tls_redirect_host = args.tls_redirect_host.or(config.server.tls_redirect_host);

    info!(listen = %listen, disks = disk_specs.len(), "starting coffer server");

    let (disks, exports) = build_disks(&disk_specs, &creds)?;
    let xl = Arc::new(
        XlObjects::with_options(
            disks,
            XlOptions {
                cache_enabled,
                ..XlOptions::default()
            },
        )
        .await
        .map_err(|err| anyhow!("initializing object layer: {err}"))?,
    );

    // Shutdown plumbing: quiesce the object layer before generic cleanup.
    let callbacks = Arc::new(shutdown::ShutdownCallbacks::default());
    let xl_shutdown = xl.clone();
    callbacks.add_object_layer_cb(Box::new(move || {
        let xl = xl_shutdown.clone();
        let result = tokio::task::block_in_place(|| {
            tokio::runtime::Handle::current().block_on(async move { xl.shutdown().await })
        });
        match result {
            Ok(()) => 0,
            Err(_) => 1,
        }
    }));
    let signals = shutdown::trap_signals();
    tokio::spawn(shutdown::monitor_shutdown(callbacks, signals));

    let router = storage_rpc_router(exports, creds, Some(xl.ns_lock_map()));

    let listener = TcpListener::bind(&listen)
        .await
        .with_context(|| format!("binding {listen}"))?;
    info!(addr = %listener.local_addr()?, "listening");

    serve(listener, router, tls_redirect_host).await
}

/// Accept loop: peek each connection to classify its protocol before
/// handing it to the HTTP stack.
async fn serve(
    listener: TcpListener,
    router: axum::Router,
    tls_redirect_host: Option<String>,
) -> Result<()> {
    loop {
        let (stream, peer) = listener.accept().await?;
        let service = TowerToHyperService::new(router.clone());
        let redirect_host = tls_redirect_host.clone();
        tokio::spawn(async move {
            let mut peek_buf = vec![0u8; mux::peek_len()];
            let peeked = match tokio::time::timeout(
                Duration::from_secs(10),
                stream.peek(&mut peek_buf),
            )
            .await
            {
                Ok(Ok(n)) => n,
                _ => return,
            };
            let protocol = mux::classify(&peek_buf[..peeked]);
            debug!(%peer, ?protocol, "accepted connection");

            match protocol {
                mux::Protocol::Tls => {
                    // TLS termination is not configured on this listener.
                    warn!(%peer, "dropping TLS handshake on plaintext listener");
                }
                _ => {
                    if let Some(host) = redirect_host {
                        // This port is meant to be TLS: send plaintext
                        // clients to the https equivalent.
                        let mut stream = stream;
                        let _ = stream
                            .write_all(mux::https_redirect_response(&host).as_bytes())
                            .await;
                        let _ = stream.shutdown().await;
                        return;
                    }
                    let io = TokioIo::new(stream);
                    if let Err(err) = ConnBuilder::new(TokioExecutor::new())
                        .serve_connection(io, service)
                        .await
                    {
                        debug!(%peer, %err, "connection ended");
                    }
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disk_spec_parsing() {
        assert_eq!(
            parse_disk_spec("/mnt/disk1"),
            DiskSpec::Local("/mnt/disk1".to_string())
        );
        assert_eq!(
            parse_disk_spec("relative/dir"),
            DiskSpec::Local("relative/dir".to_string())
        );
        assert_eq!(
            parse_disk_spec("10.0.0.4:9000:/mnt/disk1"),
            DiskSpec::Remote {
                endpoint: "http://10.0.0.4:9000".to_string(),
                path: "/mnt/disk1".to_string(),
            }
        );
        // A port that does not parse falls back to a local path.
        assert_eq!(
            parse_disk_spec("host:notaport:/x"),
            DiskSpec::Local("host:notaport:/x".to_string())
        );
    }

    #[test]
    fn config_defaults_parse() {
        let config: Config = toml::from_str("").unwrap();
        assert_eq!(config.server.listen, "0.0.0.0:9000");
        assert!(config.storage.disks.is_empty());
        assert!(!config.storage.cache_disabled);

        let config: Config = toml::from_str(
            r#"
            [server]
            listen = "127.0.0.1:9901"

            [storage]
            disks = ["/tmp/d1", "/tmp/d2", "/tmp/d3", "/tmp/d4"]
            cache_disabled = true

            [logging]
            level = "debug"
            "#,
        )
        .unwrap();
        assert_eq!(config.server.listen, "127.0.0.1:9901");
        assert_eq!(config.storage.disks.len(), 4);
        assert!(config.storage.cache_disabled);
        assert_eq!(config.logging.level, "debug");
    }
}
