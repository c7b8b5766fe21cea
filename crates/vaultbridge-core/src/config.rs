//! Configuration system for vaultbridge.
//!
//! Resolution order: environment variables → config file → defaults.
//!
//! Config file location:
//!   1. $VAULTBRIDGE_CONFIG (explicit override)
//!   2. $XDG_CONFIG_HOME/vaultbridge/config.toml
//!   3. ~/.config/vaultbridge/config.toml

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::endpoint::{Endpoint, VSOCK_CID_HOST};
use crate::wire::{DEFAULT_CHUNK_SIZE, DEFAULT_MAX_FRAME_BYTES};

/// Top-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VaultbridgeConfig {
    pub transport: TransportSettings,
    pub host: HostSettings,
    pub enclave: EnclaveSettings,
    pub decryption: DecryptionSettings,
    pub upload: UploadSettings,
    pub router: RouterSettings,
    pub downloader: DownloaderSettings,
    pub store: StoreSettings,
    /// Known data stores. Resolves a data-store id to its bucket.
    pub data_stores: Vec<DataStoreConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportSettings {
    /// Payload bytes per network read/write.
    pub chunk_size: usize,
    pub connect_timeout_secs: u64,
    /// Per-read/per-write timeout. Expiry closes the connection.
    pub io_timeout_secs: u64,
    /// Connections handled concurrently by one server.
    pub accept_pool_size: usize,
    /// Delay before accepting again after an accept failure.
    pub accept_retry_ms: u64,
    pub max_frame_bytes: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HostSettings {
    /// Where the host receives result parts from the enclave.
    pub listen: Endpoint,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EnclaveSettings {
    /// Where the enclave receives encrypted objects from the host.
    pub listen: Endpoint,
    /// How the host reaches `listen`.
    pub connect: Endpoint,
    /// How the enclave reaches the host's `listen`.
    pub host_connect: Endpoint,
    /// Forward every decrypted file back as a result upload.
    pub forward_decrypted: bool,
    /// Data store receiving forwarded results.
    pub result_data_store_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DecryptionSettings {
    /// Decrypt executable. Reads ciphertext on stdin, writes plaintext on stdout.
    pub program: String,
    /// Arguments; `{key}` is replaced with the data key.
    pub args: Vec<String>,
    /// Directory for decrypted scratch files. Prefer a RAM-backed mount.
    pub scratch_dir: PathBuf,
    pub join_timeout_secs: u64,
    pub exit_timeout_secs: u64,
    /// JSON object mapping data-store id → data key.
    pub key_file: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UploadSettings {
    /// Network chunks aggregated into one multipart part.
    pub chunks_per_part: usize,
    /// Concurrent part uploads.
    pub workers: usize,
    pub poll_interval_ms: u64,
    /// Store-side ceiling on parts per multipart upload.
    pub max_parts: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RouterSettings {
    /// Concurrent object sends into the enclave.
    pub send_pool_size: usize,
    /// Request ids sent concurrently in one drain pass.
    pub drain_concurrency: usize,
    pub drain_interval_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DownloaderSettings {
    /// Key suffixes worth streaming (`"parquet"`, `"csv"`, `"json"`).
    pub content_kinds: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreSettings {
    pub region: String,
    /// Custom S3-compatible endpoint. Empty = AWS.
    pub endpoint: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataStoreConfig {
    pub id: String,
    pub bucket: String,
}

// ── Defaults ──────────────────────────────────────────────────────────────────

impl Default for VaultbridgeConfig {
    fn default() -> Self {
        Self {
            transport: TransportSettings::default(),
            host: HostSettings::default(),
            enclave: EnclaveSettings::default(),
            decryption: DecryptionSettings::default(),
            upload: UploadSettings::default(),
            router: RouterSettings::default(),
            downloader: DownloaderSettings::default(),
            store: StoreSettings::default(),
            data_stores: Vec::new(),
        }
    }
}

impl Default for TransportSettings {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            connect_timeout_secs: 30,
            io_timeout_secs: 1200,
            accept_pool_size: 10,
            accept_retry_ms: 100,
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
        }
    }
}

impl Default for HostSettings {
    fn default() -> Self {
        Self {
            listen: Endpoint::Vsock {
                cid: u32::MAX, // VMADDR_CID_ANY
                port: 5006,
            },
        }
    }
}

impl Default for EnclaveSettings {
    fn default() -> Self {
        Self {
            listen: Endpoint::Vsock {
                cid: u32::MAX,
                port: 5005,
            },
            connect: Endpoint::Vsock {
                cid: 16,
                port: 5005,
            },
            host_connect: Endpoint::Vsock {
                cid: VSOCK_CID_HOST,
                port: 5006,
            },
            forward_decrypted: false,
            result_data_store_id: "results".to_string(),
        }
    }
}

impl Default for DecryptionSettings {
    fn default() -> Self {
        Self {
            program: "openssl".to_string(),
            args: ["enc", "-d", "-aes-256-cbc", "-pass", "pass:{key}"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            scratch_dir: PathBuf::from("/dev/shm/vaultbridge"),
            join_timeout_secs: 20,
            exit_timeout_secs: 20,
            key_file: None,
        }
    }
}

impl Default for UploadSettings {
    fn default() -> Self {
        Self {
            chunks_per_part: 14,
            workers: 8,
            poll_interval_ms: 200,
            max_parts: 10_000,
        }
    }
}

impl Default for RouterSettings {
    fn default() -> Self {
        Self {
            send_pool_size: 10,
            drain_concurrency: 16,
            drain_interval_ms: 100,
        }
    }
}

impl Default for DownloaderSettings {
    fn default() -> Self {
        Self {
            content_kinds: vec!["parquet".to_string()],
        }
    }
}

impl Default for StoreSettings {
    fn default() -> Self {
        Self {
            region: "us-east-1".to_string(),
            endpoint: String::new(),
        }
    }
}

// ── Accessors ─────────────────────────────────────────────────────────────────

impl TransportSettings {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn io_timeout(&self) -> Duration {
        Duration::from_secs(self.io_timeout_secs)
    }

    pub fn accept_retry(&self) -> Duration {
        Duration::from_millis(self.accept_retry_ms)
    }
}

impl DecryptionSettings {
    pub fn join_timeout(&self) -> Duration {
        Duration::from_secs(self.join_timeout_secs)
    }

    pub fn exit_timeout(&self) -> Duration {
        Duration::from_secs(self.exit_timeout_secs)
    }
}

impl UploadSettings {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

impl RouterSettings {
    pub fn drain_interval(&self) -> Duration {
        Duration::from_millis(self.drain_interval_ms)
    }
}

// ── Path helpers ──────────────────────────────────────────────────────────────

fn config_dir() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| dirs_or_home().join(".config"))
        .join("vaultbridge")
}

fn dirs_or_home() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/tmp"))
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {0}: {1}")]
    ReadFailed(PathBuf, std::io::Error),
    #[error("failed to parse {0}: {1}")]
    ParseFailed(PathBuf, toml::de::Error),
    #[error("failed to write {0}: {1}")]
    WriteFailed(PathBuf, std::io::Error),
    #[error("failed to serialize: {0}")]
    SerializeFailed(toml::ser::Error),
}

// ── Loading ───────────────────────────────────────────────────────────────────

impl VaultbridgeConfig {
    /// Load config: env vars → file → defaults.
    pub fn load() -> Result<Self, ConfigError> {
        let path = Self::file_path();
        let mut config = if path.exists() {
            Self::from_file(&path)?
        } else {
            VaultbridgeConfig::default()
        };
        config.apply_env_overrides();
        Ok(config)
    }

    /// Parse a specific config file, without env overrides.
    pub fn from_file(path: &std::path::Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::ReadFailed(path.to_path_buf(), e))?;
        toml::from_str(&text).map_err(|e| ConfigError::ParseFailed(path.to_path_buf(), e))
    }

    /// Config file path.
    pub fn file_path() -> PathBuf {
        std::env::var("VAULTBRIDGE_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| config_dir().join("config.toml"))
    }

    /// Write default config if none exists. Returns the path.
    pub fn write_default_if_missing() -> Result<PathBuf, ConfigError> {
        let path = Self::file_path();
        if !path.exists() {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| ConfigError::WriteFailed(path.clone(), e))?;
            }
            let text = toml::to_string_pretty(&VaultbridgeConfig::default())
                .map_err(ConfigError::SerializeFailed)?;
            std::fs::write(&path, text).map_err(|e| ConfigError::WriteFailed(path.clone(), e))?;
        }
        Ok(path)
    }

    /// Resolve a data-store id to its configuration.
    pub fn find_data_store(&self, id: &str) -> Option<&DataStoreConfig> {
        self.data_stores.iter().find(|ds| ds.id == id)
    }

    /// Apply VAULTBRIDGE_* env var overrides.
    fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("VAULTBRIDGE_TRANSPORT__CHUNK_SIZE") {
            if let Ok(n) = v.parse() {
                self.transport.chunk_size = n;
            }
        }
        if let Ok(v) = std::env::var("VAULTBRIDGE_UPLOAD__WORKERS") {
            if let Ok(n) = v.parse() {
                self.upload.workers = n;
            }
        }
        if let Ok(v) = std::env::var("VAULTBRIDGE_ROUTER__SEND_POOL_SIZE") {
            if let Ok(n) = v.parse() {
                self.router.send_pool_size = n;
            }
        }
        if let Ok(v) = std::env::var("VAULTBRIDGE_DECRYPTION__PROGRAM") {
            self.decryption.program = v;
        }
        if let Ok(v) = std::env::var("VAULTBRIDGE_DECRYPTION__SCRATCH_DIR") {
            self.decryption.scratch_dir = PathBuf::from(v);
        }
    }
}
