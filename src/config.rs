use log::{debug, error, LevelFilter};
use serde::{Deserialize, Serialize};
use std::{
    env::current_exe,
    path::{Path, PathBuf},
    str::FromStr,
};

/// Name of the file that stores the plugin options
pub const CONFIG_FILE_NAME: &str = "mgr-patch-plugin.json";

/// Structure of the configuration file
///
/// Toggles are tri-state, a missing value leaves the game behavior as is
#[derive(Debug, Default, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct PatchConfig {
    /// Skip the intro splash screens
    #[serde(skip_serializing_if = "Option::is_none")]
    pub skip_intro_splashes: Option<bool>,
    /// Skip the frame pacing check
    #[serde(skip_serializing_if = "Option::is_none")]
    pub skip_frame_check: Option<bool>,
    /// Log level filter name (e.g. "info", "debug")
    #[serde(skip_serializing_if = "Option::is_none")]
    pub log_level: Option<String>,
}

impl PatchConfig {
    /// Parses a config from JSON bytes
    pub fn from_slice(bytes: &[u8]) -> serde_json::Result<Self> {
        serde_json::from_slice(bytes)
    }

    /// Config written when none exists, listing every option
    pub fn template() -> Self {
        Self {
            skip_intro_splashes: Some(false),
            skip_frame_check: Some(false),
            log_level: Some("debug".to_string()),
        }
    }

    /// The configured log level, debug when missing or unknown
    pub fn level_filter(&self) -> LevelFilter {
        self.log_level
            .as_deref()
            .and_then(|level| LevelFilter::from_str(level).ok())
            .unwrap_or(LevelFilter::Debug)
    }
}

/// Provides a [`PathBuf`] to the configuration file
pub fn config_path() -> Option<PathBuf> {
    let current_path = current_exe().ok()?;
    let parent = current_path.parent()?;
    Some(parent.join(CONFIG_FILE_NAME))
}

/// Reads the [`PatchConfig`] stored at `file_path` if the file exists
pub fn read_config_at(file_path: &Path) -> Option<PatchConfig> {
    // Check that the config file exists
    if !file_path.exists() {
        return None;
    }

    debug!("Reading config from: {}", file_path.display());

    // Read the config bytes from the file
    let bytes = match std::fs::read(file_path) {
        Ok(value) => value,
        Err(err) => {
            error!("Failed to read patch config: {}", err);
            return None;
        }
    };

    // Parse the config file bytes
    match PatchConfig::from_slice(&bytes) {
        Ok(value) => Some(value),
        Err(err) => {
            error!("Failed to parse patch config: {}", err);
            None
        }
    }
}

/// Writes `config` to `file_path`, replacing any existing file
pub fn write_config_at(file_path: &Path, config: &PatchConfig) {
    // Serialize the config to byte form
    let bytes = match serde_json::to_vec_pretty(config) {
        Ok(value) => value,
        Err(err) => {
            error!("Failed to save patch config: {}", err);
            return;
        }
    };

    // Write the config bytes to the config file
    if let Err(err) = std::fs::write(file_path, bytes) {
        error!("Failed to save patch config: {}", err);
    }
}

/// Reads the config file, writing a template with every patch disabled when
/// there is no config file yet
pub fn load_or_create_config() -> PatchConfig {
    match config_path() {
        Some(file_path) => load_or_create_config_at(&file_path),
        None => {
            error!("Failed to locate patch config path");
            PatchConfig::default()
        }
    }
}

/// Reads the config at `file_path`. When no file exists the template is
/// written there and the defaults are used. An existing file is never
/// replaced, even when it cannot be parsed
pub fn load_or_create_config_at(file_path: &Path) -> PatchConfig {
    if file_path.exists() {
        return read_config_at(file_path).unwrap_or_default();
    }

    debug!("Writing config template to: {}", file_path.display());
    write_config_at(file_path, &PatchConfig::template());

    PatchConfig::default()
}
