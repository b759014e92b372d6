//! Platform-specific paths

use std::path::PathBuf;

/// Get the platform-specific data directory for storing application data
///
/// Returns:
/// - Windows: %LOCALAPPDATA%\HearthSync
/// - macOS: ~/Library/Application Support/HearthSync
/// - Linux/Other: ~/.local/share/HearthSync
pub fn get_data_dir() -> PathBuf {
    let base = dirs::data_local_dir()
        .or_else(dirs::data_dir)
        .or_else(|| dirs::home_dir().map(|h| h.join(".data")))
        .unwrap_or_else(|| PathBuf::from("."));

    base.join("HearthSync")
}

/// Get the platform-specific config directory
pub fn get_config_dir() -> PathBuf {
    let base = dirs::config_dir()
        .or_else(dirs::data_dir)
        .or_else(|| dirs::home_dir().map(|h| h.join(".config")))
        .unwrap_or_else(|| PathBuf::from("."));

    base.join("HearthSync")
}

/// Default location of the local store database
pub fn get_default_store_path() -> PathBuf {
    get_data_dir().join("store.db")
}

/// Default location of the configuration file
pub fn get_default_config_path() -> PathBuf {
    get_config_dir().join("config.toml")
}

/// Where the CLI keeps the passphrase KDF parameters (salt and cost)
pub fn get_root_params_path() -> PathBuf {
    get_data_dir().join("root-kdf.json")
}

/// Ensure the data directory exists, creating it if necessary
pub fn ensure_data_dir() -> std::io::Result<PathBuf> {
    let dir = get_data_dir();
    std::fs::create_dir_all(&dir)?;
    Ok(dir)
}
