//! Configuration loading and root folder resolution
//!
//! Resolution order for the config file:
//! 1. Command-line argument (highest priority)
//! 2. `PIXTAG_CONFIG` environment variable
//! 3. `~/.config/pixtag/config.toml`, then `/etc/pixtag/config.toml`
//! 4. Compiled defaults (a missing file is not an error)
//!
//! After the file is read, individual keys may be overridden by `PIXTAG_*`
//! environment variables.

use crate::db::is_identifier;
use crate::queue::{RateLimits, RetryPolicy};
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};

/// Default model identifier
pub const DEFAULT_MODEL: &str = "gemini-2.0-flash";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PixtagConfig {
    /// Folder holding the shared database; defaults per platform
    pub root_folder: Option<PathBuf>,
    /// Database file name inside the root folder
    pub database_file: String,
    pub logging: LoggingConfig,
    pub catalog: CatalogConfig,
    pub results: ResultsConfig,
    pub queue: QueueConfig,
    pub dispatch: DispatchConfig,
    pub worker: WorkerConfig,
    pub model: ModelConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CatalogConfig {
    pub table: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResultsConfig {
    pub table: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    pub id: String,
    pub max_concurrent_dispatches: u32,
    pub max_dispatches_per_second: u32,
    pub max_attempts: u32,
    pub min_backoff_secs: u64,
    pub max_backoff_secs: u64,
    pub poll_interval_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatchConfig {
    pub bind: String,
    /// Worker endpoint every task is delivered to
    pub worker_url: String,
    pub product_limit: usize,
    pub exclude_classified: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    pub bind: String,
    pub fetch_timeout_secs: u64,
    pub task_timeout_secs: u64,
    pub prompt_file: PathBuf,
    pub type_description: PathBuf,
    /// Accepted age of a callback token
    pub auth_window_secs: u64,
    pub user_agent: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    pub name: String,
    /// Regional endpoint location; with `project` set, the regional API is used
    pub region: Option<String>,
    pub project: Option<String>,
    pub api_key: Option<String>,
    pub access_token: Option<String>,
    /// Overrides the computed endpoint base URL
    pub base_url: Option<String>,
    pub timeout_secs: u64,
}

impl Default for PixtagConfig {
    fn default() -> Self {
        Self {
            root_folder: None,
            database_file: "pixtag.db".to_string(),
            logging: LoggingConfig::default(),
            catalog: CatalogConfig::default(),
            results: ResultsConfig::default(),
            queue: QueueConfig::default(),
            dispatch: DispatchConfig::default(),
            worker: WorkerConfig::default(),
            model: ModelConfig::default(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

impl Default for CatalogConfig {
    fn default() -> Self {
        Self {
            table: "products".to_string(),
        }
    }
}

impl Default for ResultsConfig {
    fn default() -> Self {
        Self {
            table: "labeled_images".to_string(),
        }
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            id: "classify-products".to_string(),
            max_concurrent_dispatches: 10,
            max_dispatches_per_second: 5,
            max_attempts: 5,
            min_backoff_secs: 10,
            max_backoff_secs: 300,
            poll_interval_ms: 500,
        }
    }
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1:5740".to_string(),
            worker_url: "http://127.0.0.1:5741/".to_string(),
            product_limit: 10,
            exclude_classified: true,
        }
    }
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1:5741".to_string(),
            fetch_timeout_secs: 30,
            task_timeout_secs: 540,
            prompt_file: PathBuf::from("config/prompt.txt"),
            type_description: PathBuf::from("config/structured_output.toml"),
            auth_window_secs: 300,
            user_agent: get_user_agent(),
        }
    }
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            name: DEFAULT_MODEL.to_string(),
            region: None,
            project: None,
            api_key: None,
            access_token: None,
            base_url: None,
            timeout_secs: 120,
        }
    }
}

/// User-Agent sent with image fetches. Some CDNs reject library defaults.
pub fn get_user_agent() -> String {
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 \
     (KHTML, like Gecko) Chrome/134.0.0.0 Safari/537.36"
        .to_string()
}

/// Locate the config file per the module-level priority order
pub fn resolve_config_path(cli_arg: Option<&Path>) -> Option<PathBuf> {
    if let Some(path) = cli_arg {
        return Some(path.to_path_buf());
    }

    if let Ok(path) = std::env::var("PIXTAG_CONFIG") {
        return Some(PathBuf::from(path));
    }

    let user_config = dirs::config_dir().map(|d| d.join("pixtag").join("config.toml"));
    if let Some(path) = user_config {
        if path.exists() {
            return Some(path);
        }
    }

    let system_config = PathBuf::from("/etc/pixtag/config.toml");
    if system_config.exists() {
        return Some(system_config);
    }

    None
}

/// OS-dependent default root folder
fn default_root_folder() -> PathBuf {
    dirs::data_local_dir()
        .map(|d| d.join("pixtag"))
        .unwrap_or_else(|| PathBuf::from("./pixtag_data"))
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Result<Option<T>> {
    match std::env::var(name) {
        Ok(value) => value
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|_| Error::Config(format!("{} has an invalid value: {}", name, value))),
        Err(_) => Ok(None),
    }
}

fn env_string(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}

impl PixtagConfig {
    /// Load configuration with file resolution, env overrides and validation
    pub fn load(cli_path: Option<&Path>) -> Result<Self> {
        let mut config = match resolve_config_path(cli_path) {
            Some(path) if path.exists() => {
                info!("Loading configuration from {}", path.display());
                Self::from_file(&path)?
            }
            Some(path) => {
                warn!(
                    "Config file {} not found, using compiled defaults",
                    path.display()
                );
                Self::default()
            }
            None => {
                info!("No config file found, using compiled defaults");
                Self::default()
            }
        };

        config.apply_env()?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("Read TOML failed: {}", e)))?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| Error::Config(format!("Parse TOML failed: {}", e)))
    }

    /// Apply `PIXTAG_*` environment overrides
    pub fn apply_env(&mut self) -> Result<()> {
        if let Some(v) = env_string("PIXTAG_ROOT_FOLDER") {
            self.root_folder = Some(PathBuf::from(v));
        }
        if let Some(v) = env_string("PIXTAG_DATABASE_FILE") {
            self.database_file = v;
        }
        if let Some(v) = env_string("PIXTAG_LOG_LEVEL") {
            self.logging.level = v;
        }
        if let Some(v) = env_string("PIXTAG_CATALOG_TABLE") {
            self.catalog.table = v;
        }
        if let Some(v) = env_string("PIXTAG_RESULTS_TABLE") {
            self.results.table = v;
        }
        if let Some(v) = env_string("PIXTAG_QUEUE_ID") {
            self.queue.id = v;
        }
        if let Some(v) = env_parse("PIXTAG_MAX_CONCURRENT_DISPATCHES")? {
            self.queue.max_concurrent_dispatches = v;
        }
        if let Some(v) = env_parse("PIXTAG_MAX_DISPATCHES_PER_SECOND")? {
            self.queue.max_dispatches_per_second = v;
        }
        if let Some(v) = env_parse("PIXTAG_MAX_ATTEMPTS")? {
            self.queue.max_attempts = v;
        }
        if let Some(v) = env_parse("PIXTAG_MIN_BACKOFF_SECS")? {
            self.queue.min_backoff_secs = v;
        }
        if let Some(v) = env_parse("PIXTAG_MAX_BACKOFF_SECS")? {
            self.queue.max_backoff_secs = v;
        }
        if let Some(v) = env_string("PIXTAG_DISPATCH_BIND") {
            self.dispatch.bind = v;
        }
        if let Some(v) = env_string("PIXTAG_WORKER_URL") {
            self.dispatch.worker_url = v;
        }
        if let Some(v) = env_parse("PIXTAG_PRODUCT_LIMIT")? {
            self.dispatch.product_limit = v;
        }
        if let Some(v) = env_string("PIXTAG_WORKER_BIND") {
            self.worker.bind = v;
        }
        if let Some(v) = env_string("PIXTAG_PROMPT_FILE") {
            self.worker.prompt_file = PathBuf::from(v);
        }
        if let Some(v) = env_string("PIXTAG_TYPE_DESCRIPTION") {
            self.worker.type_description = PathBuf::from(v);
        }
        if let Some(v) = env_string("PIXTAG_MODEL") {
            self.model.name = v;
        }
        if let Some(v) = env_string("PIXTAG_REGION") {
            self.model.region = Some(v);
        }
        if let Some(v) = env_string("PIXTAG_PROJECT") {
            self.model.project = Some(v);
        }
        if let Some(v) = env_string("PIXTAG_MODEL_API_KEY").or_else(|| env_string("GEMINI_API_KEY")) {
            self.model.api_key = Some(v);
        }
        if let Some(v) = env_string("PIXTAG_MODEL_ACCESS_TOKEN") {
            self.model.access_token = Some(v);
        }
        Ok(())
    }

    /// Reject values that would fail later in less obvious ways
    pub fn validate(&self) -> Result<()> {
        for (key, table) in [
            ("catalog.table", &self.catalog.table),
            ("results.table", &self.results.table),
        ] {
            if !is_identifier(table) {
                return Err(Error::Config(format!(
                    "{} must be a plain identifier, got '{}'",
                    key, table
                )));
            }
        }
        if self.catalog.table == self.results.table {
            return Err(Error::Config(
                "catalog.table and results.table must differ".to_string(),
            ));
        }
        if self.queue.id.trim().is_empty() {
            return Err(Error::Config("queue.id must not be empty".to_string()));
        }
        if self.queue.max_concurrent_dispatches == 0 || self.queue.max_dispatches_per_second == 0 {
            return Err(Error::Config(
                "queue rate limits must be greater than zero".to_string(),
            ));
        }
        if self.queue.max_attempts == 0 {
            return Err(Error::Config("queue.max_attempts must be at least 1".to_string()));
        }
        if self.queue.min_backoff_secs > self.queue.max_backoff_secs {
            return Err(Error::Config(
                "queue.min_backoff_secs exceeds queue.max_backoff_secs".to_string(),
            ));
        }
        Ok(())
    }

    pub fn root_folder(&self) -> PathBuf {
        self.root_folder.clone().unwrap_or_else(default_root_folder)
    }

    pub fn database_path(&self) -> PathBuf {
        self.root_folder().join(&self.database_file)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.queue.max_attempts,
            min_backoff: Duration::from_secs(self.queue.min_backoff_secs),
            max_backoff: Duration::from_secs(self.queue.max_backoff_secs),
        }
    }

    pub fn rate_limits(&self) -> RateLimits {
        RateLimits {
            max_concurrent_dispatches: self.queue.max_concurrent_dispatches,
            max_dispatches_per_second: self.queue.max_dispatches_per_second,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::io::Write;

    fn clear_env() {
        for key in [
            "PIXTAG_CONFIG",
            "PIXTAG_ROOT_FOLDER",
            "PIXTAG_QUEUE_ID",
            "PIXTAG_PRODUCT_LIMIT",
            "PIXTAG_MAX_ATTEMPTS",
            "PIXTAG_MODEL",
            "PIXTAG_MODEL_API_KEY",
            "GEMINI_API_KEY",
        ] {
            std::env::remove_var(key);
        }
    }

    #[test]
    fn test_defaults_are_valid() {
        let config = PixtagConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.catalog.table, "products");
        assert_eq!(config.dispatch.product_limit, 10);
        assert_eq!(config.model.name, DEFAULT_MODEL);
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config = PixtagConfig::from_toml_str(
            r#"
            root_folder = "/tmp/pixtag-test"

            [queue]
            id = "nightly"
            max_attempts = 3

            [model]
            region = "us-central1"
            project = "catalog-prod"
            "#,
        )
        .unwrap();

        assert_eq!(config.queue.id, "nightly");
        assert_eq!(config.queue.max_attempts, 3);
        assert_eq!(config.queue.min_backoff_secs, 10);
        assert_eq!(config.model.region.as_deref(), Some("us-central1"));
        assert_eq!(
            config.database_path(),
            PathBuf::from("/tmp/pixtag-test/pixtag.db")
        );
    }

    #[test]
    fn test_retry_policy_conversion() {
        let config = PixtagConfig::default();
        let policy = config.retry_policy();
        assert_eq!(policy.max_attempts, 5);
        assert_eq!(policy.min_backoff, Duration::from_secs(10));
        assert_eq!(policy.max_backoff, Duration::from_secs(300));

        let limits = config.rate_limits();
        assert_eq!(limits.max_concurrent_dispatches, 10);
        assert_eq!(limits.max_dispatches_per_second, 5);
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = PixtagConfig::default();
        config.results.table = "labeled images; drop".to_string();
        assert!(config.validate().is_err());

        let mut config = PixtagConfig::default();
        config.results.table = config.catalog.table.clone();
        assert!(config.validate().is_err());

        let mut config = PixtagConfig::default();
        config.queue.min_backoff_secs = 600;
        assert!(config.validate().is_err());

        let mut config = PixtagConfig::default();
        config.queue.max_dispatches_per_second = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    #[serial]
    fn test_env_overrides_file_values() {
        clear_env();
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[queue]\nid = \"from-file\"\n[dispatch]\nproduct_limit = 7").unwrap();

        std::env::set_var("PIXTAG_QUEUE_ID", "from-env");
        std::env::set_var("GEMINI_API_KEY", "secret-key");

        let config = PixtagConfig::load(Some(file.path())).unwrap();
        assert_eq!(config.queue.id, "from-env");
        assert_eq!(config.dispatch.product_limit, 7);
        assert_eq!(config.model.api_key.as_deref(), Some("secret-key"));

        clear_env();
    }

    #[test]
    #[serial]
    fn test_invalid_numeric_env_rejected() {
        clear_env();
        std::env::set_var("PIXTAG_PRODUCT_LIMIT", "lots");

        let mut config = PixtagConfig::default();
        let err = config.apply_env().unwrap_err();
        assert!(err.to_string().contains("PIXTAG_PRODUCT_LIMIT"));

        clear_env();
    }

    #[test]
    #[serial]
    fn test_missing_config_file_uses_defaults() {
        clear_env();
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("nope.toml");

        let config = PixtagConfig::load(Some(&missing)).unwrap();
        assert_eq!(config.queue.id, QueueConfig::default().id);
    }

    #[test]
    #[serial]
    fn test_config_path_priority() {
        clear_env();
        std::env::set_var("PIXTAG_CONFIG", "/from/env.toml");

        let cli = PathBuf::from("/from/cli.toml");
        assert_eq!(resolve_config_path(Some(&cli)), Some(cli.clone()));
        assert_eq!(
            resolve_config_path(None),
            Some(PathBuf::from("/from/env.toml"))
        );

        clear_env();
    }
}
