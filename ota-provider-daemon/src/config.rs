//! Daemon configuration - stored in OTA_PROVIDER_HOME/config.json

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use ota_proto::{FabricIndex, NodeId};
use ota_provider::{ConfigError, ProviderConfig};
use serde::{Deserialize, Serialize};

use crate::catalog::CatalogImage;

pub const CONFIG_FILE: &str = "config.json";

#[derive(Debug, thiserror::Error)]
pub enum DaemonError {
    #[error("could not determine home directory")]
    NoHome,
    #[error("{} already exists", .0.display())]
    AlreadyExists(PathBuf),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    pub listen_addr: String,
    pub provider: ProviderConfig,
    /// Provider node id on each fabric it has joined
    pub fabrics: BTreeMap<FabricIndex, NodeId>,
    pub catalog: Vec<CatalogImage>,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            listen_addr: "127.0.0.1:5540".to_string(),
            provider: ProviderConfig::default(),
            fabrics: BTreeMap::new(),
            catalog: Vec::new(),
        }
    }
}

impl DaemonConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let data = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&data)?)
    }

    /// Write to `path`, refusing to replace an existing file
    pub fn create(&self, path: &Path) -> Result<(), DaemonError> {
        if path.exists() {
            return Err(DaemonError::AlreadyExists(path.to_path_buf()));
        }
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir)?;
        }
        std::fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }
}

/// OTA_PROVIDER_HOME, or ~/.ota-provider
pub fn provider_home() -> Result<PathBuf, DaemonError> {
    if let Ok(home) = std::env::var("OTA_PROVIDER_HOME") {
        return Ok(PathBuf::from(home));
    }
    dirs::home_dir()
        .map(|home| home.join(".ota-provider"))
        .ok_or(DaemonError::NoHome)
}

pub fn default_config_path() -> Result<PathBuf, DaemonError> {
    Ok(provider_home()?.join(CONFIG_FILE))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_full_config() {
        let json = r#"{
            "listen_addr": "0.0.0.0:6000",
            "provider": { "default_allow": true, "delayed_query_action_time_sec": 30 },
            "fabrics": { "1": 1, "2": 4660 },
            "catalog": [{
                "vendor_id": 65521, "product_id": 32768, "software_version": 2,
                "software_version_string": "2.0", "url": "https://images.local/fw-2.bin",
                "size": 4096, "min_applicable_version": 1
            }]
        }"#;
        let config: DaemonConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.listen_addr, "0.0.0.0:6000");
        assert!(config.provider.default_allow);
        assert_eq!(config.provider.delayed_query_action_time_sec, 30);
        assert_eq!(config.fabrics.get(&2), Some(&0x1234));
        assert_eq!(config.catalog[0].min_applicable_version, Some(1));
    }

    #[test]
    fn create_then_load() {
        let dir = std::env::temp_dir().join(format!("ota-provider-config-{}", std::process::id()));
        let path = dir.join(CONFIG_FILE);
        let _ = std::fs::remove_dir_all(&dir);

        let mut config = DaemonConfig::default();
        config.fabrics.insert(1, 0x1);
        config.create(&path).unwrap();
        assert_eq!(DaemonConfig::load(&path).unwrap(), config);

        assert!(matches!(config.create(&path), Err(DaemonError::AlreadyExists(_))));
        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn missing_file() {
        let err = DaemonConfig::load(Path::new("/nonexistent/ota-provider.json")).unwrap_err();
        assert!(matches!(err, ConfigError::Io(_)));
    }
}
