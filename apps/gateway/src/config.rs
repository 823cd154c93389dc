//! Gateway configuration.
//!
//! Reads/writes JSON at `~/.config/objgate/config.json` unless a path is
//! given on the command line.

use std::path::{Path, PathBuf};

use objgate_store::StoreConfig;
use objgate_upload::EngineConfig;
use serde::{Deserialize, Serialize};

/// Gateway configuration, as stored on disk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct GatewayConfig {
    pub store: StoreConfig,
    pub engine: EngineConfig,
    /// Directory holding upload checkpoints.
    pub checkpoint_dir: PathBuf,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            store: StoreConfig::default(),
            engine: EngineConfig::default(),
            checkpoint_dir: config_dir().join("checkpoints"),
        }
    }
}

impl GatewayConfig {
    /// Loads configuration from `path`, or the default location.
    ///
    /// A missing file yields defaults. So does a file that fails to parse,
    /// after a warning.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        let file_path = path.map(Path::to_path_buf).unwrap_or_else(default_path);
        if !file_path.exists() {
            tracing::debug!(path = %file_path.display(), "no config file, using defaults");
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(&file_path)?;
        match serde_json::from_str::<GatewayConfig>(&content) {
            Ok(config) => Ok(config),
            Err(e) => {
                tracing::warn!(
                    path = %file_path.display(),
                    "failed to parse gateway config, using defaults: {e}"
                );
                Ok(Self::default())
            }
        }
    }

    /// Writes configuration to `path`, or the default location.
    pub fn save(&self, path: Option<&Path>) -> anyhow::Result<PathBuf> {
        let file_path = path.map(Path::to_path_buf).unwrap_or_else(default_path);
        if let Some(parent) = file_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(&file_path, json)?;
        tracing::debug!(path = %file_path.display(), "gateway configuration saved");
        Ok(file_path)
    }
}

pub fn default_path() -> PathBuf {
    config_dir().join("config.json")
}

fn config_dir() -> PathBuf {
    config_base_dir().join("objgate")
}

fn config_base_dir() -> PathBuf {
    #[cfg(target_os = "windows")]
    {
        let appdata =
            std::env::var("APPDATA").unwrap_or_else(|_| "C:\\Users\\Default\\AppData".into());
        PathBuf::from(appdata)
    }

    #[cfg(not(target_os = "windows"))]
    {
        if let Ok(xdg) = std::env::var("XDG_CONFIG_HOME")
            && !xdg.is_empty()
        {
            return PathBuf::from(xdg);
        }
        let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".into());
        PathBuf::from(home).join(".config")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = GatewayConfig::load(Some(&dir.path().join("absent.json"))).unwrap();
        assert_eq!(config, GatewayConfig::default());
    }

    #[test]
    fn save_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.json");
        let config = GatewayConfig {
            store: StoreConfig::Filesystem {
                root: dir.path().join("objects"),
                buckets: vec!["media".into()],
            },
            engine: EngineConfig {
                workers: 8,
                ..Default::default()
            },
            checkpoint_dir: dir.path().join("cp"),
        };
        config.save(Some(&path)).unwrap();
        assert_eq!(GatewayConfig::load(Some(&path)).unwrap(), config);
    }

    #[test]
    fn partial_file_fills_in_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, r#"{"engine": {"workers": 2}}"#).unwrap();

        let config = GatewayConfig::load(Some(&path)).unwrap();
        assert_eq!(config.engine.workers, 2);
        assert_eq!(config.engine.part_size, EngineConfig::default().part_size);
        assert_eq!(config.store, StoreConfig::default());
    }

    #[test]
    fn broken_file_falls_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, "{ not json").unwrap();
        assert_eq!(GatewayConfig::load(Some(&path)).unwrap(), GatewayConfig::default());
    }
}
