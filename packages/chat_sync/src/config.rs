use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::connection::BackoffPolicy;
use crate::error::SyncError;

// =============================================================================
// File config (figment-deserialized from defaults / chat-sync.toml / env vars)
// =============================================================================
//
//   chat-sync.toml:  [connection]
//                    heartbeat_interval_secs = 15
//
//   env var:         CHAT_SYNC_CONNECTION__HEARTBEAT_INTERVAL_SECS=15
//
//   (double underscore = nesting, single underscore stays within field names)

/// Top-level tunable configuration, deserialized by figment.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct FileConfig {
    #[serde(default)]
    pub connection: ConnectionFileConfig,
    #[serde(default)]
    pub buffer: BufferFileConfig,
    #[serde(default)]
    pub generation: GenerationFileConfig,
    #[serde(default)]
    pub api: ApiFileConfig,
}

/// Persistent connection tunables (lives under `[connection]`).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ConnectionFileConfig {
    #[serde(default = "default_ws_url")]
    pub url: String,
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    #[serde(default = "default_heartbeat_interval_secs")]
    pub heartbeat_interval_secs: u64,
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,
    #[serde(default = "default_backoff_max_ms")]
    pub backoff_max_ms: u64,
    #[serde(default = "default_max_reconnect_attempts")]
    pub max_reconnect_attempts: u32,
}

impl Default for ConnectionFileConfig {
    fn default() -> Self {
        Self {
            url: default_ws_url(),
            connect_timeout_ms: default_connect_timeout_ms(),
            heartbeat_interval_secs: default_heartbeat_interval_secs(),
            backoff_base_ms: default_backoff_base_ms(),
            backoff_max_ms: default_backoff_max_ms(),
            max_reconnect_attempts: default_max_reconnect_attempts(),
        }
    }
}

/// Content buffer tunables (lives under `[buffer]`).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BufferFileConfig {
    #[serde(default = "default_flush_threshold_chars")]
    pub flush_threshold_chars: usize,
    #[serde(default = "default_flush_delay_ms")]
    pub flush_delay_ms: u64,
}

impl Default for BufferFileConfig {
    fn default() -> Self {
        Self {
            flush_threshold_chars: default_flush_threshold_chars(),
            flush_delay_ms: default_flush_delay_ms(),
        }
    }
}

/// Liveness safeguard for generations that never finish (lives under `[generation]`).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GenerationFileConfig {
    /// 0 disables the safeguard.
    #[serde(default = "default_stall_timeout_secs")]
    pub stall_timeout_secs: u64,
}

impl Default for GenerationFileConfig {
    fn default() -> Self {
        Self {
            stall_timeout_secs: default_stall_timeout_secs(),
        }
    }
}

/// REST collaborator (lives under `[api]`).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ApiFileConfig {
    #[serde(default = "default_api_base_url")]
    pub base_url: String,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

impl Default for ApiFileConfig {
    fn default() -> Self {
        Self {
            base_url: default_api_base_url(),
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

fn default_ws_url() -> String {
    "ws://127.0.0.1:8000/ws".to_string()
}
fn default_connect_timeout_ms() -> u64 {
    10_000
}
fn default_heartbeat_interval_secs() -> u64 {
    30
}
fn default_backoff_base_ms() -> u64 {
    1_000
}
fn default_backoff_max_ms() -> u64 {
    30_000
}
fn default_max_reconnect_attempts() -> u32 {
    10
}
fn default_flush_threshold_chars() -> usize {
    48
}
fn default_flush_delay_ms() -> u64 {
    40
}
fn default_stall_timeout_secs() -> u64 {
    300
}
fn default_api_base_url() -> String {
    "http://127.0.0.1:8000/api".to_string()
}
fn default_request_timeout_secs() -> u64 {
    30
}

/// Build a figment that layers: defaults → config file (if given) → CHAT_SYNC_* env vars.
///
/// Env vars use double-underscore for nesting into sections:
///   `CHAT_SYNC_BUFFER__FLUSH_DELAY_MS=25`  →  `buffer.flush_delay_ms = 25`
pub fn load_config(config_path: Option<&Path>) -> figment::Figment {
    use figment::{
        Figment,
        providers::{Env, Format, Serialized, Toml},
    };

    let mut figment = Figment::from(Serialized::defaults(FileConfig::default()));
    if let Some(path) = config_path {
        figment = figment.merge(Toml::file(path));
    }
    figment.merge(Env::prefixed("CHAT_SYNC_").split("__"))
}

impl FileConfig {
    pub fn load(config_path: Option<&Path>) -> Result<Self, SyncError> {
        Ok(load_config(config_path).extract()?)
    }
}

// =============================================================================
// Runtime config (derived from FileConfig, used throughout the engine)
// =============================================================================

#[derive(Clone, Debug, Default)]
pub struct SyncConfig {
    pub connection: ConnectionConfig,
    pub buffer: BufferConfig,
    pub generation: GenerationConfig,
    pub api: ApiConfig,
}

impl SyncConfig {
    pub fn from_file(fc: &FileConfig) -> Self {
        Self {
            connection: ConnectionConfig::from_file(&fc.connection),
            buffer: BufferConfig::from_file(&fc.buffer),
            generation: GenerationConfig::from_file(&fc.generation),
            api: ApiConfig::from_file(&fc.api),
        }
    }
}

#[derive(Clone, Debug)]
pub struct ConnectionConfig {
    /// WebSocket endpoint; the bearer token is appended as a `token` query parameter.
    pub url: String,
    pub connect_timeout: Duration,
    pub heartbeat_interval: Duration,
    pub backoff: BackoffPolicy,
}

impl ConnectionConfig {
    pub fn from_file(fc: &ConnectionFileConfig) -> Self {
        Self {
            url: fc.url.clone(),
            connect_timeout: Duration::from_millis(fc.connect_timeout_ms),
            heartbeat_interval: Duration::from_secs(fc.heartbeat_interval_secs.max(1)),
            backoff: BackoffPolicy {
                base: Duration::from_millis(fc.backoff_base_ms),
                max: Duration::from_millis(fc.backoff_max_ms.max(fc.backoff_base_ms)),
                max_attempts: fc.max_reconnect_attempts,
            },
        }
    }
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self::from_file(&ConnectionFileConfig::default())
    }
}

#[derive(Clone, Debug)]
pub struct BufferConfig {
    /// Flush as soon as a batch holds this many characters.
    pub flush_threshold_chars: usize,
    /// Flush a batch this long after its first fragment arrived.
    pub flush_delay: Duration,
}

impl BufferConfig {
    pub fn from_file(fc: &BufferFileConfig) -> Self {
        Self {
            flush_threshold_chars: fc.flush_threshold_chars.max(1),
            flush_delay: Duration::from_millis(fc.flush_delay_ms),
        }
    }
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self::from_file(&BufferFileConfig::default())
    }
}

#[derive(Clone, Debug)]
pub struct GenerationConfig {
    /// Force-complete generations idle for this long (None = disabled).
    pub stall_timeout: Option<Duration>,
}

impl GenerationConfig {
    pub fn from_file(fc: &GenerationFileConfig) -> Self {
        Self {
            stall_timeout: if fc.stall_timeout_secs == 0 {
                None
            } else {
                Some(Duration::from_secs(fc.stall_timeout_secs))
            },
        }
    }
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self::from_file(&GenerationFileConfig::default())
    }
}

#[derive(Clone, Debug)]
pub struct ApiConfig {
    pub base_url: String,
    pub request_timeout: Duration,
}

impl ApiConfig {
    pub fn from_file(fc: &ApiFileConfig) -> Self {
        Self {
            base_url: fc.base_url.trim_end_matches('/').to_string(),
            request_timeout: Duration::from_secs(fc.request_timeout_secs),
        }
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self::from_file(&ApiFileConfig::default())
    }
}
