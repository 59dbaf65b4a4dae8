//! Configuration for Coffer

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CofferConfig {
    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub storage: StorageConfig,

    #[serde(default)]
    pub database: DatabaseConfig,

    #[serde(default)]
    pub auth: AuthConfig,

    #[serde(default)]
    pub logging: LoggingConfig,

    #[serde(default)]
    pub multipart: MultipartConfig,
}

impl CofferConfig {
    pub fn from_file(path: &str) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| crate::Error::InternalError(format!("Failed to read config: {}", e)))?;

        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> crate::Result<Self> {
        toml::from_str(content)
            .map_err(|e| crate::Error::InternalError(format!("Failed to parse config: {}", e)))
    }

    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(addr) = std::env::var("COFFER_BIND_ADDRESS") {
            config.server.bind_address = addr;
        }
        if let Ok(port) = std::env::var("COFFER_PORT") {
            if let Ok(p) = port.parse() {
                config.server.port = p;
            }
        }
        if let Ok(backend) = std::env::var("COFFER_STORAGE_BACKEND") {
            if let Some(b) = StorageBackendKind::parse(&backend) {
                config.storage.backend = b;
            }
        }
        if let Ok(dir) = std::env::var("COFFER_DATA_DIR") {
            config.storage.data_dir = PathBuf::from(dir);
        }
        if let Ok(backend) = std::env::var("COFFER_METADATA_BACKEND") {
            if let Some(b) = MetadataBackendKind::parse(&backend) {
                config.database.backend = b;
            }
        }
        if let Ok(url) = std::env::var("COFFER_DATABASE_URL") {
            config.database.url = url;
        }
        if let Ok(key) = std::env::var("COFFER_ROOT_ACCESS_KEY") {
            config.auth.root_access_key = key;
        }
        if let Ok(secret) = std::env::var("COFFER_ROOT_SECRET_KEY") {
            config.auth.root_secret_key = secret;
        }
        if let Ok(region) = std::env::var("COFFER_REGION") {
            config.auth.region = region;
        }
        if let Ok(v) = std::env::var("COFFER_AUTH_ENABLED") {
            config.auth.enabled = v != "false";
        }
        if std::env::var("COFFER_ALLOW_ANONYMOUS").map(|v| v == "true").unwrap_or(false) {
            config.auth.allow_anonymous = true;
        }
        if let Ok(level) = std::env::var("COFFER_LOG_LEVEL") {
            config.logging.level = level;
        }
        if let Ok(format) = std::env::var("COFFER_LOG_FORMAT") {
            config.logging.format = format;
        }

        config
    }

    pub fn validate(&self) -> crate::Result<()> {
        self.auth.validate()?;
        self.multipart.validate()?;
        if self.logging.format != "pretty" && self.logging.format != "json" {
            return Err(crate::Error::InvalidArgument(format!(
                "Unknown log format: {}",
                self.logging.format
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind_address: String,
    pub port: u16,
    pub metrics_enabled: bool,
    /// Upper bound for XML request bodies (CompleteMultipartUpload)
    pub max_xml_body_bytes: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0".to_string(),
            port: 9000,
            metrics_enabled: true,
            max_xml_body_bytes: 2 * 1024 * 1024,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackendKind {
    #[default]
    Local,
    Memory,
}

impl StorageBackendKind {
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "local" => Some(Self::Local),
            "memory" => Some(Self::Memory),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub backend: StorageBackendKind,
    pub data_dir: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: StorageBackendKind::Local,
            data_dir: PathBuf::from("./data"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MetadataBackendKind {
    Memory,
    #[default]
    Sqlite,
}

impl MetadataBackendKind {
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "memory" => Some(Self::Memory),
            "sqlite" => Some(Self::Sqlite),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub backend: MetadataBackendKind,
    pub url: String,
    pub max_connections: u32,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            backend: MetadataBackendKind::Sqlite,
            url: "sqlite://./data/coffer.db?mode=rwc".to_string(),
            max_connections: 16,
        }
    }
}

/// Additional access key pair accepted by the server
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CredentialEntry {
    pub access_key: String,
    pub secret_key: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    /// When false every request is accepted without signature checks
    pub enabled: bool,
    /// Accept requests that carry no signature at all
    pub allow_anonymous: bool,
    pub region: String,
    pub root_access_key: String,
    pub root_secret_key: String,
    pub credentials: Vec<CredentialEntry>,
    pub max_clock_skew_secs: i64,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            allow_anonymous: false,
            region: crate::DEFAULT_REGION.to_string(),
            root_access_key: "cofferadmin".to_string(),
            root_secret_key: "cofferadmin".to_string(),
            credentials: Vec::new(),
            max_clock_skew_secs: 15 * 60,
        }
    }
}

impl AuthConfig {
    /// Root credentials followed by the extra entries
    pub fn all_credentials(&self) -> Vec<CredentialEntry> {
        let mut all = vec![CredentialEntry {
            access_key: self.root_access_key.clone(),
            secret_key: self.root_secret_key.clone(),
        }];
        all.extend(self.credentials.iter().cloned());
        all
    }

    pub fn validate(&self) -> crate::Result<()> {
        if self.enabled && (self.root_access_key.is_empty() || self.root_secret_key.is_empty()) {
            return Err(crate::Error::InvalidArgument(
                "Auth enabled but root credentials are empty".into(),
            ));
        }
        if self.region.is_empty() {
            return Err(crate::Error::InvalidArgument("Region must not be empty".into()));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MultipartConfig {
    /// Minimum size for every part except the last one
    pub min_part_size: u64,
    /// Abort sessions older than this; `None` disables the janitor
    pub stale_upload_secs: Option<u64>,
    pub janitor_interval_secs: u64,
}

impl Default for MultipartConfig {
    fn default() -> Self {
        Self {
            min_part_size: crate::MIN_PART_SIZE,
            stale_upload_secs: None,
            janitor_interval_secs: 3600,
        }
    }
}

impl MultipartConfig {
    pub fn validate(&self) -> crate::Result<()> {
        if self.stale_upload_secs.is_some() && self.janitor_interval_secs == 0 {
            return Err(crate::Error::InvalidArgument(
                "janitor_interval_secs must be positive when the janitor is enabled".into(),
            ));
        }
        Ok(())
    }
}
