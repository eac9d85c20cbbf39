use crate::tpm::pcr::{PcrError, PcrSelection};
use crate::tpm::Hierarchy;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

pub const DEFAULT_CONFIG_PATH: &str = "/etc/cattleguard/cattleguard.json";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to access config file `{path}`")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid config file `{path}`")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("config file `{0}` is not a JSON object")]
    NotAnObject(PathBuf),
    #[error(transparent)]
    Pcr(#[from] PcrError),
}

pub type Result<T, E = ConfigError> = core::result::Result<T, E>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SealConfig {
    pub seal_pcrs: Vec<u8>,
    pub primary_hierarchy: Hierarchy,
    pub parent_auth: Option<String>,
    pub primary_auth: String,
    /// Keys we don't know about, written back untouched
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Default for SealConfig {
    fn default() -> Self {
        Self {
            seal_pcrs: vec![0, 7],
            primary_hierarchy: Hierarchy::Owner,
            parent_auth: None,
            primary_auth: "password".to_string(),
            extra: Map::new(),
        }
    }
}

fn default_document() -> Map<String, Value> {
    match serde_json::to_value(SealConfig::default()) {
        Ok(Value::Object(map)) => map,
        _ => Map::new(),
    }
}

impl SealConfig {
    /// Reads `path`, or writes the defaults there when it does not exist yet.
    pub fn load_or_create(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if path.is_file() {
            Self::load(path)
        } else {
            Self::create(path)
        }
    }

    pub fn create(path: &Path) -> Result<Self> {
        let config = Self::default();
        log::debug!("Default config: {:?}", config);
        log::info!("Writing default config to file: {}", path.display());
        let io_err = |source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        };
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(io_err)?;
        }
        let json = serde_json::to_string_pretty(&config).map_err(|source| ConfigError::Json {
            path: path.to_path_buf(),
            source,
        })?;
        fs::write(path, json).map_err(io_err)?;
        Ok(config)
    }

    /// Loads `path`, filling any missing key from the defaults. The file is
    /// left as it is.
    pub fn load(path: &Path) -> Result<Self> {
        log::info!("Loading config from file: {}", path.display());
        let json_err = |source| ConfigError::Json {
            path: path.to_path_buf(),
            source,
        };
        let raw = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let mut document = match serde_json::from_str::<Value>(&raw).map_err(json_err)? {
            Value::Object(map) => map,
            _ => return Err(ConfigError::NotAnObject(path.to_path_buf())),
        };
        for (key, value) in default_document() {
            if !document.contains_key(&key) {
                log::warn!("Key not found in config: {}", key);
                log::info!("[{}] Adding default value to config: {}", key, value);
                document.insert(key, value);
            }
        }
        let config: Self = serde_json::from_value(Value::Object(document)).map_err(json_err)?;
        config.pcr_selection()?;
        Ok(config)
    }

    pub fn pcr_selection(&self) -> Result<PcrSelection> {
        Ok(PcrSelection::new(&self.seal_pcrs)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use eyre::Result;
    use tempfile::tempdir;

    #[test]
    fn create_when_missing() -> Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("nested").join("cattleguard.json");
        let config = SealConfig::load_or_create(&path)?;
        assert_eq!(config, SealConfig::default());

        let written: Value = serde_json::from_str(&fs::read_to_string(&path)?)?;
        assert_eq!(written["seal_pcrs"], serde_json::json!([0, 7]));
        assert_eq!(written["primary_hierarchy"], "owner");
        assert_eq!(written["parent_auth"], Value::Null);
        assert_eq!(written["primary_auth"], "password");
        Ok(())
    }

    #[test]
    fn load_fills_defaults_without_writing() -> Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("cattleguard.json");
        let original = r#"{"primary_hierarchy": "endorsement", "comment": {"by": "ops"}}"#;
        fs::write(&path, original)?;

        let config = SealConfig::load_or_create(&path)?;
        assert_eq!(config.primary_hierarchy, Hierarchy::Endorsement);
        assert_eq!(config.seal_pcrs, vec![0, 7]);
        assert_eq!(config.parent_auth, None);
        assert_eq!(config.primary_auth, "password");
        assert_eq!(config.extra["comment"]["by"], "ops");
        assert_eq!(fs::read_to_string(&path)?, original);
        Ok(())
    }

    #[test]
    fn unknown_keys_round_trip() -> Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("cattleguard.json");
        fs::write(&path, r#"{"seal_pcrs": [7], "luks_device": "/dev/sda2"}"#)?;
        let config = SealConfig::load(&path)?;
        let value = serde_json::to_value(&config)?;
        assert_eq!(value["luks_device"], "/dev/sda2");
        assert_eq!(value["seal_pcrs"], serde_json::json!([7]));
        Ok(())
    }

    #[test]
    fn bad_pcr_rejected() -> Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("cattleguard.json");
        fs::write(&path, r#"{"seal_pcrs": [0, 42]}"#)?;
        assert!(matches!(
            SealConfig::load(&path),
            Err(ConfigError::Pcr(PcrError::InvalidPcrSlot(_)))
        ));
        Ok(())
    }

    #[test]
    fn bad_hierarchy_rejected() -> Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("cattleguard.json");
        fs::write(&path, r#"{"primary_hierarchy": "root"}"#)?;
        assert!(matches!(
            SealConfig::load(&path),
            Err(ConfigError::Json { .. })
        ));
        Ok(())
    }

    #[test]
    fn not_an_object() -> Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("cattleguard.json");
        fs::write(&path, "[0, 7]")?;
        assert!(matches!(
            SealConfig::load(&path),
            Err(ConfigError::NotAnObject(_))
        ));
        Ok(())
    }
}
