//! Gateway configuration loading.
//!
//! TOML is the sole config source; no environment variable overrides.
//! Default config path: `/etc/gt06-tracker/gateway.toml`.
//!
//! # Required fields
//! - `schema_version = 1`
//!
//! Every section is optional and falls back to the defaults below.

use serde::Deserialize;
use std::net::{IpAddr, SocketAddr};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

pub const DEFAULT_CONFIG_PATH: &str = "/etc/gt06-tracker/gateway.toml";

const DEFAULT_TCP_BIND: &str = "0.0.0.0";
const DEFAULT_TCP_PORT: u16 = 5000;
const DEFAULT_BACKLOG: u32 = 200;
const DEFAULT_MAX_CONNECTIONS: usize = 1024;
const DEFAULT_IDLE_TIMEOUT_SECS: u64 = 600;
const DEFAULT_READ_BUFFER_BYTES: usize = 2048;
const DEFAULT_MAX_FAILURES: u32 = 3;
const DEFAULT_BLOCK_SECS: u64 = 3600;
const DEFAULT_SQLITE_PATH: &str = "/var/lib/gt06-tracker/fixes.sqlite3";
const DEFAULT_QUEUE_DEPTH: usize = 1024;
const DEFAULT_HTTP_BIND: &str = "0.0.0.0:8080";

// ---------------------------------------------------------------------------
// Config types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub schema_version: u32,
    pub tcp: TcpConfig,
    pub guard: GuardConfig,
    pub storage: StorageConfig,
    pub http: HttpConfig,
}

#[derive(Debug, Clone)]
pub struct TcpConfig {
    pub enabled: bool,
    pub bind: IpAddr,
    pub port: u16,
    pub backlog: u32,
    pub max_connections: usize,
    /// `None` disables the read idle timeout.
    pub idle_timeout: Option<Duration>,
    pub read_buffer_bytes: usize,
}

impl TcpConfig {
    pub fn listen_addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind, self.port)
    }
}

impl Default for TcpConfig {
    fn default() -> Self {
        TcpConfig {
            enabled: true,
            bind: IpAddr::from([0, 0, 0, 0]),
            port: DEFAULT_TCP_PORT,
            backlog: DEFAULT_BACKLOG,
            max_connections: DEFAULT_MAX_CONNECTIONS,
            idle_timeout: Some(Duration::from_secs(DEFAULT_IDLE_TIMEOUT_SECS)),
            read_buffer_bytes: DEFAULT_READ_BUFFER_BYTES,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct GuardConfig {
    pub max_failures: u32,
    pub block_for: Duration,
}

impl Default for GuardConfig {
    fn default() -> Self {
        GuardConfig {
            max_failures: DEFAULT_MAX_FAILURES,
            block_for: Duration::from_secs(DEFAULT_BLOCK_SECS),
        }
    }
}

#[derive(Debug, Clone)]
pub struct StorageConfig {
    pub sqlite_path: String,
    pub queue_depth: usize,
}

#[derive(Debug, Clone)]
pub struct HttpConfig {
    pub enabled: bool,
    pub bind: String,
    pub api_keys: Vec<String>,
}

// ---------------------------------------------------------------------------
// Raw TOML deserialization types (with Option for optional fields)
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawConfig {
    schema_version: Option<u32>,
    tcp: Option<RawTcpConfig>,
    guard: Option<RawGuardConfig>,
    storage: Option<RawStorageConfig>,
    http: Option<RawHttpConfig>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawTcpConfig {
    enabled: Option<bool>,
    bind: Option<String>,
    port: Option<u16>,
    backlog: Option<u32>,
    max_connections: Option<usize>,
    idle_timeout_secs: Option<u64>,
    read_buffer_bytes: Option<usize>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawGuardConfig {
    max_failures: Option<u32>,
    block_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawStorageConfig {
    sqlite_path: Option<String>,
    queue_depth: Option<usize>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawHttpConfig {
    enabled: Option<bool>,
    bind: Option<String>,
    api_keys: Option<Vec<String>>,
}

// ---------------------------------------------------------------------------
// Public API
// ---------------------------------------------------------------------------

/// Load gateway config from a custom path.
pub fn load_config_from_path(path: &Path) -> Result<GatewayConfig, ConfigError> {
    let toml_str = std::fs::read_to_string(path)
        .map_err(|e| ConfigError::Io(format!("reading config file '{}': {}", path.display(), e)))?;
    load_config_from_str(&toml_str)
}

/// Load gateway config from the default path.
pub fn load_config() -> Result<GatewayConfig, ConfigError> {
    load_config_from_path(Path::new(DEFAULT_CONFIG_PATH))
}

/// Load gateway config from a TOML string.
pub fn load_config_from_str(toml_str: &str) -> Result<GatewayConfig, ConfigError> {
    let raw: RawConfig = toml::from_str(toml_str).map_err(|e| ConfigError::Parse(e.to_string()))?;

    let schema_version = raw
        .schema_version
        .ok_or_else(|| ConfigError::MissingField("schema_version".to_owned()))?;
    if schema_version != 1 {
        return Err(ConfigError::InvalidValue(format!(
            "schema_version must be 1, got {}",
            schema_version
        )));
    }

    Ok(GatewayConfig {
        schema_version,
        tcp: tcp_config(raw.tcp.unwrap_or_default())?,
        guard: guard_config(raw.guard.unwrap_or_default())?,
        storage: storage_config(raw.storage.unwrap_or_default())?,
        http: http_config(raw.http.unwrap_or_default())?,
    })
}

fn tcp_config(raw: RawTcpConfig) -> Result<TcpConfig, ConfigError> {
    let bind_str = raw.bind.unwrap_or_else(|| DEFAULT_TCP_BIND.to_owned());
    let bind: IpAddr = bind_str
        .parse()
        .map_err(|_| ConfigError::InvalidValue(format!("tcp.bind is not an IP address: '{}'", bind_str)))?;

    let max_connections = raw.max_connections.unwrap_or(DEFAULT_MAX_CONNECTIONS);
    if max_connections == 0 {
        return Err(ConfigError::InvalidValue(
            "tcp.max_connections must be at least 1".to_owned(),
        ));
    }

    let read_buffer_bytes = raw.read_buffer_bytes.unwrap_or(DEFAULT_READ_BUFFER_BYTES);
    if read_buffer_bytes < 16 {
        return Err(ConfigError::InvalidValue(format!(
            "tcp.read_buffer_bytes must be at least 16, got {}",
            read_buffer_bytes
        )));
    }

    // 0 disables the idle timeout.
    let idle_timeout = match raw.idle_timeout_secs.unwrap_or(DEFAULT_IDLE_TIMEOUT_SECS) {
        0 => None,
        secs => Some(Duration::from_secs(secs)),
    };

    Ok(TcpConfig {
        enabled: raw.enabled.unwrap_or(true),
        bind,
        port: raw.port.unwrap_or(DEFAULT_TCP_PORT),
        backlog: raw.backlog.unwrap_or(DEFAULT_BACKLOG),
        max_connections,
        idle_timeout,
        read_buffer_bytes,
    })
}

fn guard_config(raw: RawGuardConfig) -> Result<GuardConfig, ConfigError> {
    let max_failures = raw.max_failures.unwrap_or(DEFAULT_MAX_FAILURES);
    if max_failures == 0 {
        return Err(ConfigError::InvalidValue(
            "guard.max_failures must be at least 1".to_owned(),
        ));
    }
    Ok(GuardConfig {
        max_failures,
        block_for: Duration::from_secs(raw.block_secs.unwrap_or(DEFAULT_BLOCK_SECS)),
    })
}

fn storage_config(raw: RawStorageConfig) -> Result<StorageConfig, ConfigError> {
    let queue_depth = raw.queue_depth.unwrap_or(DEFAULT_QUEUE_DEPTH);
    if queue_depth == 0 {
        return Err(ConfigError::InvalidValue(
            "storage.queue_depth must be at least 1".to_owned(),
        ));
    }
    Ok(StorageConfig {
        sqlite_path: raw
            .sqlite_path
            .unwrap_or_else(|| DEFAULT_SQLITE_PATH.to_owned()),
        queue_depth,
    })
}

fn http_config(raw: RawHttpConfig) -> Result<HttpConfig, ConfigError> {
    let enabled = raw.enabled.unwrap_or(true);
    let api_keys: Vec<String> = raw
        .api_keys
        .unwrap_or_default()
        .into_iter()
        .map(|k| k.trim().to_owned())
        .filter(|k| !k.is_empty())
        .collect();
    let bind = raw.bind.unwrap_or_else(|| DEFAULT_HTTP_BIND.to_owned());
    if enabled && bind.parse::<SocketAddr>().is_err() {
        return Err(ConfigError::InvalidValue(format!(
            "http.bind is not a socket address: '{}'",
            bind
        )));
    }
    Ok(HttpConfig {
        enabled,
        bind,
        api_keys,
    })
}

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(String),
    #[error("Parse error: {0}")]
    Parse(String),
    #[error("Missing required field: {0}")]
    MissingField(String),
    #[error("Invalid config value: {0}")]
    InvalidValue(String),
}
