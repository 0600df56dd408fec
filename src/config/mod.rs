pub mod inspector_config;

use std::path::PathBuf;

pub use crate::config::inspector_config::{AdapterKind, EventFormat, InspectorConfig, LogFormat};

/// Overrides the location of the configuration file
pub const CONFIG_PATH_ENV: &str = "BLE_INSPECTOR_CONFIG";

const CONFIG_DIR_NAME: &str = ".ble-inspector";
const CONFIG_FILE_NAME: &str = "config.json";

/// Where the inspector reads and writes its settings
pub fn config_path() -> PathBuf {
    match std::env::var_os(CONFIG_PATH_ENV) {
        Some(path) if !path.is_empty() => PathBuf::from(path),
        _ => PathBuf::from(CONFIG_DIR_NAME).join(CONFIG_FILE_NAME),
    }
}
