//! Cross-platform path resolution.
//!
//! All directories are namespaced under `layerscan` inside the
//! platform's conventional location, falling back to `/tmp` (or the current
//! directory for configuration) when the location can't be determined.

use std::path::PathBuf;

const APP_DIR: &str = "layerscan";

/// Returns the cache directory for layerscan.
///
/// Platform-specific locations:
/// - Linux: `~/.cache/layerscan/`
/// - macOS: `~/Library/Caches/layerscan/`
/// - Windows: `%LOCALAPPDATA%\layerscan\`
pub fn cache_dir() -> PathBuf {
    dirs::cache_dir()
        .unwrap_or_else(|| PathBuf::from("/tmp"))
        .join(APP_DIR)
}

/// Returns the data directory holding metadata dumps.
///
/// Platform-specific locations:
/// - Linux: `~/.local/share/layerscan/`
/// - macOS: `~/Library/Application Support/layerscan/`
/// - Windows: `%APPDATA%\layerscan\`
pub fn data_dir() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("/tmp"))
        .join(APP_DIR)
}

/// Returns the directory holding `config.toml`.
pub fn config_dir() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(APP_DIR)
}
