//! Gateway configuration loaded from TOML.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::warn;

use crate::hashing::HashAlgorithm;

/// Main gateway configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    /// SSH server listen address (default: "0.0.0.0:2222")
    pub listen_addr: String,

    /// Path to the SSH host key
    pub host_key_path: PathBuf,

    /// Git executable used to serve upload-pack / receive-pack
    pub git_binary: String,

    /// Fingerprint lookup backend used by the SSH gateway
    #[serde(default)]
    pub lookup: LookupConfig,

    /// Credential service HTTP API
    #[serde(default)]
    pub api: ApiConfig,

    /// Token hashing parameters
    #[serde(default)]
    pub hashing: HashingConfig,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        let data_dir = dirs::data_local_dir()
            .unwrap_or_else(|| PathBuf::from("/var/lib"))
            .join("git-bridge");

        Self {
            listen_addr: "0.0.0.0:2222".to_string(),
            host_key_path: data_dir.join("host_key"),
            git_binary: "git".to_string(),
            lookup: LookupConfig::default(),
            api: ApiConfig {
                store_path: Some(data_dir.join("credentials.json")),
                ..ApiConfig::default()
            },
            hashing: HashingConfig::default(),
        }
    }
}

/// Identity resolver configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LookupConfig {
    /// Base URL of the credential service (required for the SSH gateway)
    pub base_url: Option<String>,

    /// Lifetime of a resolved fingerprint, in seconds
    pub lookup_ttl_secs: u64,

    /// Lifetime of a confirmed-unknown fingerprint, in seconds
    pub negative_ttl_secs: u64,

    /// Timeout applied to every backend request, in seconds
    pub request_timeout_secs: u64,

    /// Value sent as `X-Service-Origin` on backend requests
    pub service_origin: Option<String>,
}

impl Default for LookupConfig {
    fn default() -> Self {
        Self {
            base_url: None,
            lookup_ttl_secs: 60,
            negative_ttl_secs: 5,
            request_timeout_secs: 5,
            service_origin: Some("git-bridge".to_string()),
        }
    }
}

impl LookupConfig {
    pub fn lookup_ttl(&self) -> Duration {
        Duration::from_secs(self.lookup_ttl_secs)
    }

    pub fn negative_ttl(&self) -> Duration {
        Duration::from_secs(self.negative_ttl_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

/// Credential service HTTP API configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    /// HTTP listen address (default: "0.0.0.0:3900")
    pub listen_addr: String,

    /// JSON file holding token and SSH key records (in-memory only when unset)
    pub store_path: Option<PathBuf>,

    /// Basic auth user accepted on the internal API
    pub admin_user: Option<String>,

    /// Basic auth password accepted on the internal API
    pub admin_password: Option<String>,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:3900".to_string(),
            store_path: None,
            admin_user: None,
            admin_password: None,
        }
    }
}

/// Parameters for hashing newly issued tokens.
///
/// Verification always uses the parameters embedded in the stored hash, so
/// changing these only affects tokens created afterwards.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HashingConfig {
    /// Algorithm applied to new tokens
    pub algorithm: HashAlgorithm,

    pub argon2_memory_kib: u32,
    pub argon2_time_cost: u32,
    pub argon2_parallelism: u32,

    pub bcrypt_cost: u32,

    pub pbkdf2_iterations: u32,
}

impl Default for HashingConfig {
    fn default() -> Self {
        Self {
            algorithm: HashAlgorithm::Argon2id,
            argon2_memory_kib: 65536,
            argon2_time_cost: 2,
            argon2_parallelism: 4,
            bcrypt_cost: 12,
            pbkdf2_iterations: 100_000,
        }
    }
}

impl GatewayConfig {
    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        let config: Self = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;
        Ok(config)
    }

    /// Load configuration from a file, or return defaults if the file doesn't exist.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }

    /// Apply overrides from the process environment.
    pub fn apply_env(&mut self) {
        self.apply_env_from(|name| std::env::var(name).ok());
    }

    /// Apply overrides using `lookup` as the variable source.
    ///
    /// TTL variables only take effect when they hold a positive integer.
    pub fn apply_env_from<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(base) = lookup("SSH_LOOKUP_BASE_URL").filter(|v| !v.is_empty()) {
            self.lookup.base_url = Some(base);
        }
        if let Some(ttl) = positive_secs(lookup("CACHE_LOOKUP_TTL_SECONDS")) {
            self.lookup.lookup_ttl_secs = ttl;
        }
        if let Some(ttl) = positive_secs(lookup("CACHE_NEGATIVE_TTL_SECONDS")) {
            self.lookup.negative_ttl_secs = ttl;
        }
        if let Some(algo) = lookup("AUTH_TOKEN_HASH_ALGO") {
            match algo.parse::<HashAlgorithm>() {
                Ok(algorithm) => self.hashing.algorithm = algorithm,
                Err(e) => warn!("Ignoring AUTH_TOKEN_HASH_ALGO: {}", e),
            }
        }
        if let Some(user) = lookup("WEBPROFILE_ADMIN_USER").filter(|v| !v.is_empty()) {
            self.api.admin_user = Some(user);
        }
        if let Some(pass) = lookup("WEBPROFILE_ADMIN_PASS").filter(|v| !v.is_empty()) {
            self.api.admin_password = Some(pass);
        }
    }

    /// Ensure all required directories exist.
    pub fn ensure_dirs(&self) -> Result<()> {
        if let Some(parent) = self.host_key_path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create host key directory: {}", parent.display()))?;
        }

        if let Some(parent) = self.api.store_path.as_deref().and_then(Path::parent) {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create store directory: {}", parent.display()))?;
        }

        Ok(())
    }
}

fn positive_secs(value: Option<String>) -> Option<u64> {
    value
        .and_then(|v| v.trim().parse::<u64>().ok())
        .filter(|n| *n > 0)
}
