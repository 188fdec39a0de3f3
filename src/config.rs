//! Configuration file handling.
//!
//! This module provides loading and saving of layerscan configuration
//! from a TOML file.
//!
//! # Configuration Location
//!
//! The configuration file is stored at:
//! - Linux: `~/.config/layerscan/config.toml`
//! - macOS: `~/Library/Application Support/layerscan/config.toml`
//! - Windows: `%APPDATA%\layerscan\config.toml`
//!
//! # Example Configuration
//!
//! ```toml
//! log_level = "info"
//! log_json = false
//! default_format = "table"
//! dump_dir = "/var/lib/layerscan/dump"
//!
//! [inventory]
//! host_root = "/host"
//! cache_path = "/cache/inventory-cache"
//! ttl_secs = 10800
//! backoff_min_secs = 30
//! backoff_max_secs = 300
//!
//! [extract]
//! max_file_size = 67108864
//!
//! [nvd]
//! sync_feeds = true
//! max_fetch_retries = 10
//! retry_delay_secs = 1
//! request_timeout_secs = 60
//! first_year = 2002
//!
//! [ignore]
//! packages = ["linux-*"]
//! vulnerabilities = ["CVE-2021-12345"]
//! ```

use crate::error::{Error, Result};
use crate::platform;
use crate::vulnmdsrc::nvd::feed::{self, FeedSynchronizer};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Application configuration.
///
/// This struct represents all configurable options for layerscan.
/// It can be loaded from a TOML file or created with default values.
///
/// # Example
///
/// ```no_run
/// use layerscan::Config;
///
/// // Load from file (or use defaults if file doesn't exist)
/// let config = Config::load().unwrap();
///
/// println!("Inventory TTL: {} seconds", config.inventory.ttl_secs);
/// println!("Dump directory: {}", config.dump_dir.display());
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Default log filter when `RUST_LOG` is unset.
    ///
    /// Default: "info"
    pub log_level: String,

    /// Emit logs as JSON lines instead of human-readable text.
    pub log_json: bool,

    /// Default output format when no `--format` flag is provided.
    ///
    /// Valid values: "table", "json"
    /// Default: "table"
    pub default_format: String,

    /// Directory with one subdirectory per metadata source.
    pub dump_dir: PathBuf,

    pub inventory: InventoryConfig,

    pub extract: ExtractConfig,

    pub nvd: NvdConfig,

    /// Ignore list configuration for suppressing known issues.
    pub ignore: IgnoreConfig,
}

/// Settings of the caching node inventory.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct InventoryConfig {
    /// Root of the host filesystem to inventory.
    pub host_root: PathBuf,

    /// File holding the persisted inventory. Defaults to the platform
    /// cache directory.
    pub cache_path: Option<PathBuf>,

    /// How long an inventory is reused, in seconds.
    ///
    /// Default: 10800 (3 hours)
    pub ttl_secs: u64,

    /// Wait before the first retry of a failed scan, in seconds.
    pub backoff_min_secs: u64,

    /// Upper bound of the wait between failed scans, in seconds.
    pub backoff_max_secs: u64,
}

impl InventoryConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }

    pub fn backoff_min(&self) -> Duration {
        Duration::from_secs(self.backoff_min_secs)
    }

    pub fn backoff_max(&self) -> Duration {
        Duration::from_secs(self.backoff_max_secs)
    }
}

impl Default for InventoryConfig {
    fn default() -> Self {
        Self {
            host_root: PathBuf::from("/"),
            cache_path: None,
            ttl_secs: 3 * 60 * 60,
            backoff_min_secs: 30,
            backoff_max_secs: 300,
        }
    }
}

/// Settings of layer extraction.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExtractConfig {
    /// Files larger than this many bytes are skipped.
    ///
    /// Default: 64 MiB
    pub max_file_size: u64,
}

impl Default for ExtractConfig {
    fn default() -> Self {
        Self {
            max_file_size: 64 * 1024 * 1024,
        }
    }
}

/// Settings of the NVD metadata source.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NvdConfig {
    /// Download the yearly feeds into the dump directory before indexing
    /// them, instead of reading a pre-built dump.
    pub sync_feeds: bool,

    pub base_url: String,

    /// Requests per feed file before giving up on it.
    pub max_fetch_retries: u32,

    pub retry_delay_secs: u64,

    pub request_timeout_secs: u64,

    /// Oldest yearly partition to synchronize.
    pub first_year: i32,
}

impl NvdConfig {
    /// Builds the feed synchronizer described by these settings.
    pub fn synchronizer(&self) -> Result<FeedSynchronizer> {
        Ok(FeedSynchronizer::new(
            &self.base_url,
            Duration::from_secs(self.request_timeout_secs),
            self.max_fetch_retries,
            Duration::from_secs(self.retry_delay_secs),
        )?
        .with_years(self.first_year, None))
    }
}

impl Default for NvdConfig {
    fn default() -> Self {
        Self {
            sync_feeds: false,
            base_url: feed::DEFAULT_BASE_URL.to_string(),
            max_fetch_retries: 10,
            retry_delay_secs: 1,
            request_timeout_secs: 60,
            first_year: feed::DEFAULT_FIRST_YEAR,
        }
    }
}

/// Configuration for ignoring specific packages or vulnerabilities.
///
/// Use this to suppress known false positives or accepted risks.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct IgnoreConfig {
    /// Package names to exclude from matching.
    ///
    /// Supports glob patterns (e.g., "linux-*", "*-dev").
    pub packages: Vec<String>,

    /// Vulnerability IDs to ignore (e.g., "CVE-2021-12345", "DSA-*").
    ///
    /// These vulnerabilities will not be reported even if found.
    pub vulnerabilities: Vec<String>,
}

impl IgnoreConfig {
    /// Check if a package should be ignored.
    pub fn should_ignore_package(&self, name: &str) -> bool {
        self.packages.iter().any(|pattern| glob_match(pattern, name))
    }

    /// Check if a vulnerability should be ignored.
    pub fn should_ignore_vulnerability(&self, vuln_id: &str) -> bool {
        self.vulnerabilities
            .iter()
            .any(|pattern| glob_match(pattern, vuln_id))
    }
}

/// Simple glob matching (supports * as wildcard).
fn glob_match(pattern: &str, text: &str) -> bool {
    let parts: Vec<&str> = pattern.split('*').collect();

    if parts.len() == 1 {
        return pattern == text;
    }

    let mut remaining = text;

    // Check prefix (before first *)
    if !parts[0].is_empty() {
        if !remaining.starts_with(parts[0]) {
            return false;
        }
        remaining = &remaining[parts[0].len()..];
    }

    // Check suffix (after last *)
    let last_part = parts[parts.len() - 1];
    if !last_part.is_empty() {
        if !remaining.ends_with(last_part) {
            return false;
        }
        remaining = &remaining[..remaining.len() - last_part.len()];
    }

    for part in &parts[1..parts.len() - 1] {
        if part.is_empty() {
            continue;
        }
        match remaining.find(part) {
            Some(pos) => remaining = &remaining[pos + part.len()..],
            None => return false,
        }
    }

    true
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_json: false,
            default_format: "table".to_string(),
            dump_dir: platform::data_dir().join("dump"),
            inventory: InventoryConfig::default(),
            extract: ExtractConfig::default(),
            nvd: NvdConfig::default(),
            ignore: IgnoreConfig::default(),
        }
    }
}

impl Config {
    /// Loads configuration from the config file.
    ///
    /// If the config file doesn't exist, returns default configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if the config file exists but cannot be read,
    /// parsed, or validated.
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_path())
    }

    /// Loads configuration from `path`, or defaults if it doesn't exist.
    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let content = fs::read_to_string(path).map_err(|e| Error::io(path, e))?;
        let config: Config = toml::from_str(&content)
            .map_err(|e| Error::Config(format!("{}: {}", path.display(), e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Rejects settings that can't work.
    pub fn validate(&self) -> Result<()> {
        if self.inventory.ttl_secs == 0 {
            return Err(Error::Config("inventory.ttl_secs must be positive".to_string()));
        }
        if self.inventory.backoff_min_secs > self.inventory.backoff_max_secs {
            return Err(Error::Config(format!(
                "inventory.backoff_min_secs ({}) exceeds inventory.backoff_max_secs ({})",
                self.inventory.backoff_min_secs, self.inventory.backoff_max_secs
            )));
        }
        if self.nvd.max_fetch_retries == 0 {
            return Err(Error::Config("nvd.max_fetch_retries must be positive".to_string()));
        }
        if self.extract.max_file_size == 0 {
            return Err(Error::Config("extract.max_file_size must be positive".to_string()));
        }
        if !matches!(self.default_format.as_str(), "table" | "json") {
            return Err(Error::Config(format!(
                "unsupported default_format {:?}",
                self.default_format
            )));
        }
        Ok(())
    }

    /// Saves the configuration to the config file.
    ///
    /// Creates the parent directory if it doesn't exist.
    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::config_path())
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| Error::io(parent, e))?;
        }

        let content = toml::to_string_pretty(self).map_err(|e| Error::Config(e.to_string()))?;
        fs::write(path, content).map_err(|e| Error::io(path, e))
    }

    /// Returns the path to the configuration file.
    ///
    /// # Example
    ///
    /// ```
    /// use layerscan::Config;
    ///
    /// let path = Config::config_path();
    /// println!("Config file: {}", path.display());
    /// ```
    pub fn config_path() -> PathBuf {
        platform::config_dir().join("config.toml")
    }

    /// Generates a string containing the default configuration.
    pub fn generate_default_config() -> String {
        let config = Config::default();
        toml::to_string_pretty(&config).unwrap_or_default()
    }
}
