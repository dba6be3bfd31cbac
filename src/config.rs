//! CLI arguments and server configuration defaults.

use clap::Parser;
use shadow_rs::formatcp;
use std::path::PathBuf;

use crate::build;

const VERSION_INFO: &str = formatcp!(
    r#"{}\ncommit_hash: {}\nbuild_time: {}\nbuild_env: {},{}"#,
    build::PKG_VERSION,
    build::SHORT_COMMIT,
    build::BUILD_TIME,
    build::RUST_VERSION,
    build::RUST_CHANNEL
);

pub const MAX_CHUNK_SIZE: u64 = 16 * 1024 * 1024;
pub const DEFAULT_MAX_TRANSMISSION_SIZE: u64 = 10 * 1024 * 1024;
pub const DEFAULT_MAX_CHUNKS: u64 = 8192;
pub const DEFAULT_CLIENT_ID_PREFIX: &str = "relay";
pub const DEFAULT_IDLE_TTL_SECS: u64 = 60 * 60;
pub const DEFAULT_LOCK_WAIT_TIMEOUT_SECS: u64 = 30;
pub const IDLE_SWEEP_INTERVAL_SECS: u64 = 300;

/// CLI arguments and environment configuration for the server.
#[derive(Parser, Debug)]
#[command(name = "chunk-relay", version = VERSION_INFO, about = "Chunked upload relay")]
pub struct Args {
    #[arg(
        short = 'w',
        long,
        env = "RELAY_WORK_DIR",
        help = "Working directory for chunk and assembly temp files (defaults to the system temp dir)"
    )]
    pub work_dir: Option<String>,
    #[arg(
        short = 's',
        long,
        env = "RELAY_STORAGE_DIR",
        default_value = ".relay/storage",
        help = "Directory that receives assembled files"
    )]
    pub storage_dir: String,
    #[arg(
        long,
        env = "RELAY_MAX_TRANSMISSION_SIZE",
        default_value_t = DEFAULT_MAX_TRANSMISSION_SIZE,
        help = "Max cumulative bytes per transmission (0 to disable)"
    )]
    pub max_transmission_size: u64,
    #[arg(
        long,
        env = "RELAY_MAX_CHUNKS",
        default_value_t = DEFAULT_MAX_CHUNKS,
        help = "Max chunk index per transmission (0 to disable)"
    )]
    pub max_chunks: u64,
    #[arg(
        long,
        env = "RELAY_CLIENT_ID_PREFIX",
        default_value = DEFAULT_CLIENT_ID_PREFIX,
        help = "Namespace prefix for generated client ids"
    )]
    pub client_id_prefix: String,
    #[arg(
        long,
        env = "RELAY_IDLE_TTL_SECS",
        default_value_t = DEFAULT_IDLE_TTL_SECS,
        help = "Discard transmissions idle for this many seconds (0 to disable)"
    )]
    pub idle_ttl_secs: u64,
    #[arg(
        short = 'b',
        long,
        env = "RELAY_BIND",
        default_value = "0.0.0.0",
        help = "Bind address for HTTP/HTTPS"
    )]
    pub host: String,
    #[arg(
        short = 'p',
        long,
        env = "RELAY_HTTP_PORT",
        default_value_t = 5005,
        help = "HTTP port"
    )]
    pub http_port: u16,
    #[arg(
        short = 'P',
        long,
        env = "RELAY_HTTPS_PORT",
        help = "HTTPS port (HTTPS disabled when unset)"
    )]
    pub https_port: Option<u16>,
    #[arg(short = 'c', long, env = "RELAY_TLS_CERT", help = "TLS cert path")]
    pub tls_cert: Option<String>,
    #[arg(short = 'k', long, env = "RELAY_TLS_KEY", help = "TLS key path")]
    pub tls_key: Option<String>,
    #[arg(long, env = "RELAY_CORS_ORIGINS", help = "Comma separated CORS origins")]
    pub cors_origins: Option<String>,
}

impl Args {
    /// 返回临时文件工作目录，未配置时使用系统临时目录。
    pub fn work_dir(&self) -> PathBuf {
        self.work_dir
            .as_deref()
            .map(PathBuf::from)
            .unwrap_or_else(std::env::temp_dir)
    }
}
