//! Configuration loading for Leadflow services
//!
//! Resolution priority for every setting: environment variable, then TOML
//! config file, then compiled default. CRM credentials have no default:
//! a missing API key is a fatal `Config` error at startup.

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tracing::{info, warn};

/// Environment variable naming the TOML config file
pub const CONFIG_PATH_ENV: &str = "LEADFLOW_CONFIG";
/// Environment variable carrying the CRM API key
pub const CRM_API_KEY_ENV: &str = "LEADFLOW_CRM_API_KEY";
/// Environment variable overriding the CRM base URL
pub const CRM_BASE_URL_ENV: &str = "LEADFLOW_CRM_BASE_URL";
/// Environment variable overriding the listen port
pub const PORT_ENV: &str = "LEADFLOW_PORT";
/// Environment variable overriding the work-state database path
pub const DB_PATH_ENV: &str = "LEADFLOW_DB_PATH";

const DEFAULT_CRM_BASE_URL: &str = "https://api.brevo.com/v3";
const DEFAULT_COUNTRY_CODE: &str = "254";
const DEFAULT_PORT: u16 = 5780;

/// Ad platform conversion endpoint
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdPlatformConfig {
    /// Display name used in logs (e.g. "google-ads")
    pub name: String,
    /// Endpoint receiving the conversion payload
    pub url: String,
}

/// Raw TOML configuration file contents
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TomlConfig {
    pub crm_api_key: Option<String>,
    pub crm_base_url: Option<String>,
    pub listen_port: Option<u16>,
    pub country_code: Option<String>,
    pub database_path: Option<String>,
    #[serde(default)]
    pub ad_platforms: Vec<AdPlatformConfig>,
    pub sync: Option<SyncToml>,
}

/// Optional `[sync]` table tuning retry/breaker behaviour
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SyncToml {
    pub max_attempts: Option<u32>,
    pub retry_base_ms: Option<u64>,
    pub crm_timeout_secs: Option<u64>,
    pub breaker_threshold: Option<u32>,
    pub breaker_cooldown_secs: Option<u64>,
    pub sweep_interval_secs: Option<u64>,
}

/// Fully-resolved service configuration
#[derive(Debug, Clone)]
pub struct LeadflowConfig {
    pub listen_port: u16,
    pub crm_base_url: String,
    pub crm_api_key: String,
    /// Country code attached when normalizing national-format phone numbers
    pub default_country_code: String,
    pub database_path: PathBuf,
    pub crm_timeout_secs: u64,
    /// Bounded retry for CRM sync calls
    pub max_sync_attempts: u32,
    pub retry_base_ms: u64,
    /// Consecutive failures before the circuit breaker opens
    pub breaker_threshold: u32,
    pub breaker_cooldown_secs: u64,
    /// Bounded retry for the optimistic-concurrency merge loop
    pub merge_max_retries: u32,
    /// Deferred reconciliation sweep period
    pub sweep_interval_secs: u64,
    pub ad_platforms: Vec<AdPlatformConfig>,
}

impl LeadflowConfig {
    /// Load and resolve configuration from ENV + TOML
    ///
    /// Fails with `Error::Config` when the CRM API key is configured
    /// nowhere: running without CRM access would silently drop leads.
    pub fn load() -> Result<Self> {
        let toml_config = match config_file_path() {
            Some(path) if path.exists() => {
                let content = std::fs::read_to_string(&path)
                    .map_err(|e| Error::Config(format!("Read config failed: {}", e)))?;
                let parsed: TomlConfig = toml::from_str(&content)
                    .map_err(|e| Error::Config(format!("Parse config failed: {}", e)))?;
                info!("Loaded config file: {}", path.display());
                parsed
            }
            _ => TomlConfig::default(),
        };

        Self::resolve(toml_config)
    }

    /// Resolve a parsed TOML config against the environment
    pub fn resolve(toml_config: TomlConfig) -> Result<Self> {
        let env_key = std::env::var(CRM_API_KEY_ENV).ok().filter(|k| !k.trim().is_empty());
        let toml_key = toml_config.crm_api_key.clone().filter(|k| !k.trim().is_empty());

        if env_key.is_some() && toml_key.is_some() {
            warn!(
                "CRM API key found in both {} and config file. Using environment (highest priority).",
                CRM_API_KEY_ENV
            );
        }

        let crm_api_key = env_key.or(toml_key).ok_or_else(|| {
            Error::Config(format!(
                "CRM API key not configured. Please configure using one of:\n\
                 1. Environment: {}=your-key-here\n\
                 2. TOML config: crm_api_key = \"your-key\" ({})",
                CRM_API_KEY_ENV,
                config_file_path()
                    .map(|p| p.display().to_string())
                    .unwrap_or_else(|| "~/.config/leadflow/leadflow.toml".to_string()),
            ))
        })?;

        let crm_base_url = std::env::var(CRM_BASE_URL_ENV)
            .ok()
            .or(toml_config.crm_base_url)
            .unwrap_or_else(|| DEFAULT_CRM_BASE_URL.to_string());

        let listen_port = match std::env::var(PORT_ENV) {
            Ok(raw) => raw
                .parse::<u16>()
                .map_err(|_| Error::Config(format!("{} is not a valid port: {}", PORT_ENV, raw)))?,
            Err(_) => toml_config.listen_port.unwrap_or(DEFAULT_PORT),
        };

        let database_path = std::env::var(DB_PATH_ENV)
            .ok()
            .map(PathBuf::from)
            .or_else(|| toml_config.database_path.as_ref().map(PathBuf::from))
            .unwrap_or_else(default_database_path);

        let sync = toml_config.sync.unwrap_or_default();

        Ok(Self {
            listen_port,
            crm_base_url,
            crm_api_key,
            default_country_code: toml_config
                .country_code
                .unwrap_or_else(|| DEFAULT_COUNTRY_CODE.to_string()),
            database_path,
            crm_timeout_secs: sync.crm_timeout_secs.unwrap_or(10),
            max_sync_attempts: sync.max_attempts.unwrap_or(5),
            retry_base_ms: sync.retry_base_ms.unwrap_or(500),
            breaker_threshold: sync.breaker_threshold.unwrap_or(5),
            breaker_cooldown_secs: sync.breaker_cooldown_secs.unwrap_or(30),
            merge_max_retries: 3,
            sweep_interval_secs: sync.sweep_interval_secs.unwrap_or(60),
            ad_platforms: toml_config.ad_platforms,
        })
    }
}

/// Config file path: $LEADFLOW_CONFIG, else ~/.config/leadflow/leadflow.toml
pub fn config_file_path() -> Option<PathBuf> {
    if let Ok(path) = std::env::var(CONFIG_PATH_ENV) {
        return Some(PathBuf::from(path));
    }
    dirs::config_dir().map(|d| d.join("leadflow").join("leadflow.toml"))
}

/// Default work-state database location under the platform data dir
fn default_database_path() -> PathBuf {
    dirs::data_local_dir()
        .map(|d| d.join("leadflow").join("leadflow.db"))
        .unwrap_or_else(|| PathBuf::from("./leadflow.db"))
}
