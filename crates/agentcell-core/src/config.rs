//! Agentcell configuration system.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};

/// Root configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CellConfig {
    #[serde(default)]
    pub gateway: GatewayConfig,
    #[serde(default)]
    pub storage: StorageConfig,
}

/// HTTP gateway settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

/// Where per-instance SQLite databases live.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Directory for instance databases. Tilde-expanded at load time.
    /// An empty string means in-memory stores (useful for tests and demos).
    #[serde(default = "default_data_dir")]
    pub data_dir: String,
}

fn default_host() -> String {
    "127.0.0.1".into()
}
fn default_port() -> u16 {
    8787
}
fn default_data_dir() -> String {
    "~/.agentcell/instances".into()
}

impl Default for CellConfig {
    fn default() -> Self {
        Self {
            gateway: GatewayConfig::default(),
            storage: StorageConfig::default(),
        }
    }
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
        }
    }
}

impl CellConfig {
    /// Load config from a path, falling back to defaults when the file is
    /// absent.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if path.exists() {
            Self::load_from(path)
        } else {
            Ok(Self::default())
        }
    }

    /// Load config from a specific path.
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("Failed to read config: {e}")))?;
        let config: Self = toml::from_str(&content)
            .map_err(|e| Error::Config(format!("Failed to parse config: {e}")))?;
        Ok(config)
    }

    /// Resolved instance-database directory, or `None` for in-memory stores.
    pub fn data_dir(&self) -> Option<PathBuf> {
        if self.storage.data_dir.is_empty() {
            return None;
        }
        Some(PathBuf::from(
            shellexpand::tilde(&self.storage.data_dir).to_string(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let cfg = CellConfig::default();
        assert_eq!(cfg.gateway.host, "127.0.0.1");
        assert_eq!(cfg.gateway.port, 8787);
        assert!(cfg.data_dir().is_some());
    }

    #[test]
    fn test_parse_partial_toml() {
        let cfg: CellConfig = toml::from_str(
            r#"
            [gateway]
            port = 9000
            "#,
        )
        .unwrap();
        assert_eq!(cfg.gateway.port, 9000);
        assert_eq!(cfg.gateway.host, "127.0.0.1");
    }

    #[test]
    fn test_empty_data_dir_means_in_memory() {
        let cfg: CellConfig = toml::from_str(
            r#"
            [storage]
            data_dir = ""
            "#,
        )
        .unwrap();
        assert!(cfg.data_dir().is_none());
    }

    #[test]
    fn test_load_or_default_missing_file() {
        let cfg = CellConfig::load_or_default(Path::new("/nonexistent/agentcell.toml")).unwrap();
        assert_eq!(cfg.gateway.port, 8787);
    }
}
