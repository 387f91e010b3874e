//! Application configuration for the stitcher.
//!
//! User config lives at `~/.stitcher/stitcher.toml`.
//! CLI flags override config file values, which override defaults.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::{Result, StitchError};
use crate::types::Credential;

/// Default configuration file name.
const CONFIG_FILE_NAME: &str = "stitcher.toml";

/// Default config directory name under the user's home.
const CONFIG_DIR_NAME: &str = ".stitcher";

// ---------------------------------------------------------------------------
// Config structs (matching stitcher.toml schema)
// ---------------------------------------------------------------------------

/// Top-level application config, deserialized from TOML.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub pipeline: PipelineConfig,

    /// Remote document store.
    #[serde(default)]
    pub store: StoreConfig,

    /// Remote annotation source.
    #[serde(default)]
    pub annotations: AnnotationsConfig,

    #[serde(default)]
    pub callback: CallbackConfig,

    /// Local task repository.
    #[serde(default)]
    pub storage: StorageConfig,
}

/// `[pipeline]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Tasks processed concurrently by the worker pool.
    #[serde(default = "default_workers")]
    pub workers: usize,

    /// Document fetches in flight per task.
    #[serde(default = "default_fetch_concurrency")]
    pub fetch_concurrency: usize,

    /// Upper bound on a single fetch or publish call.
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            fetch_concurrency: default_fetch_concurrency(),
            request_timeout_secs: default_request_timeout(),
        }
    }
}

impl PipelineConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

fn default_workers() -> usize {
    4
}
fn default_fetch_concurrency() -> usize {
    1
}
fn default_request_timeout() -> u64 {
    30
}

/// `[store]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default = "default_store_url")]
    pub base_url: String,

    /// Downloads larger than this are aborted.
    #[serde(default = "default_max_document_bytes")]
    pub max_document_bytes: u64,

    /// Name of the env var holding the caller credential (never store the token itself).
    #[serde(default = "default_credential_env")]
    pub credential_env: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            base_url: default_store_url(),
            max_document_bytes: default_max_document_bytes(),
            credential_env: default_credential_env(),
        }
    }
}

fn default_store_url() -> String {
    "http://localhost:4603".into()
}
fn default_max_document_bytes() -> u64 {
    100 * 1024 * 1024
}
fn default_credential_env() -> String {
    "STITCH_CREDENTIAL".into()
}

/// `[annotations]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnnotationsConfig {
    #[serde(default = "default_annotations_url")]
    pub base_url: String,
}

impl Default for AnnotationsConfig {
    fn default() -> Self {
        Self {
            base_url: default_annotations_url(),
        }
    }
}

fn default_annotations_url() -> String {
    "http://localhost:8080".into()
}

/// `[callback]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallbackConfig {
    /// Timeout of the definition-time reachability probe.
    #[serde(default = "default_probe_timeout")]
    pub probe_timeout_secs: u64,
}

impl Default for CallbackConfig {
    fn default() -> Self {
        Self {
            probe_timeout_secs: default_probe_timeout(),
        }
    }
}

fn default_probe_timeout() -> u64 {
    3
}

/// `[storage]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Path of the libSQL database file.
    #[serde(default = "default_db_path")]
    pub db_path: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
        }
    }
}

fn default_db_path() -> String {
    "var/stitcher.db".into()
}

impl AppConfig {
    /// Reject values the pipeline cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.pipeline.workers == 0 {
            return Err(StitchError::config("pipeline.workers must be at least 1"));
        }
        if self.pipeline.fetch_concurrency == 0 {
            return Err(StitchError::config(
                "pipeline.fetch_concurrency must be at least 1",
            ));
        }
        if self.pipeline.request_timeout_secs == 0 {
            return Err(StitchError::config(
                "pipeline.request_timeout_secs must be at least 1",
            ));
        }
        if self.store.max_document_bytes == 0 {
            return Err(StitchError::config("store.max_document_bytes must be positive"));
        }
        for (key, value) in [
            ("store.base_url", &self.store.base_url),
            ("annotations.base_url", &self.annotations.base_url),
        ] {
            Url::parse(value)
                .map_err(|e| StitchError::config(format!("{key} '{value}' is not a URL: {e}")))?;
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Config loading
// ---------------------------------------------------------------------------

/// Get the path to the config directory (`~/.stitcher/`).
pub fn config_dir() -> Result<PathBuf> {
    let home = dirs::home_dir()
        .ok_or_else(|| StitchError::config("could not determine home directory"))?;
    Ok(home.join(CONFIG_DIR_NAME))
}

/// Get the path to the config file (`~/.stitcher/stitcher.toml`).
pub fn config_file_path() -> Result<PathBuf> {
    Ok(config_dir()?.join(CONFIG_FILE_NAME))
}

/// Load the application config from disk. Returns defaults if the file does not exist.
pub fn load_config() -> Result<AppConfig> {
    let path = config_file_path()?;

    if !path.exists() {
        tracing::debug!(?path, "config file not found, using defaults");
        return Ok(AppConfig::default());
    }

    load_config_from(&path)
}

/// Load the application config from a specific file path.
pub fn load_config_from(path: &Path) -> Result<AppConfig> {
    let content = std::fs::read_to_string(path).map_err(|e| StitchError::io(path, e))?;

    let config: AppConfig = toml::from_str(&content)
        .map_err(|e| StitchError::config(format!("failed to parse {}: {e}", path.display())))?;
    config.validate()?;
    Ok(config)
}

/// Create the config directory and write a default config file.
/// Returns the path to the created file.
pub fn init_config() -> Result<PathBuf> {
    let dir = config_dir()?;
    std::fs::create_dir_all(&dir).map_err(|e| StitchError::io(&dir, e))?;

    let path = dir.join(CONFIG_FILE_NAME);
    let config = AppConfig::default();
    let content =
        toml::to_string_pretty(&config).map_err(|e| StitchError::config(e.to_string()))?;

    std::fs::write(&path, content).map_err(|e| StitchError::io(&path, e))?;
    tracing::info!(?path, "created default config file");

    Ok(path)
}

/// Read the caller credential from the env var named in `[store]`.
pub fn resolve_credential(config: &AppConfig) -> Result<Credential> {
    let var_name = &config.store.credential_env;
    match std::env::var(var_name) {
        Ok(val) if !val.is_empty() => Ok(Credential::new(val)),
        _ => Err(StitchError::config(format!(
            "document store credential not found. Set the {var_name} environment variable."
        ))),
    }
}
