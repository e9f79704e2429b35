//! Persisted server address and client id (TOML file).

use std::io;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::debug;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_address: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
}

impl Settings {
    /// Both the address and the client id are known.
    pub fn are_available(&self) -> bool {
        self.server_address.is_some() && self.client_id.is_some()
    }
}

pub struct SettingsStore {
    path: PathBuf,
}

impl SettingsStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Missing file reads as empty settings.
    pub fn load(&self) -> Result<Settings, SettingsError> {
        match std::fs::read_to_string(&self.path) {
            Ok(s) => Ok(toml::from_str(&s)?),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(Settings::default()),
            Err(e) => Err(e.into()),
        }
    }

    pub fn save_server_address(&self, address: &str) -> Result<(), SettingsError> {
        self.update(|s| s.server_address = Some(address.trim().to_string()))
    }

    pub fn save_client_id(&self, client_id: Option<&str>) -> Result<(), SettingsError> {
        self.update(|s| s.client_id = client_id.map(str::to_string))
    }

    pub fn clear(&self) -> Result<(), SettingsError> {
        self.update(|s| *s = Settings::default())
    }

    pub fn are_available(&self) -> Result<bool, SettingsError> {
        Ok(self.load()?.are_available())
    }

    fn update(&self, f: impl FnOnce(&mut Settings)) -> Result<(), SettingsError> {
        let mut settings = self.load()?;
        f(&mut settings);
        if let Some(dir) = self.path.parent() {
            std::fs::create_dir_all(dir)?;
        }
        std::fs::write(&self.path, toml::to_string(&settings)?)?;
        debug!(path = %self.path.display(), "settings saved");
        Ok(())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SettingsError {
    #[error("settings I/O: {0}")]
    Io(#[from] io::Error),
    #[error("malformed settings file: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("cannot encode settings: {0}")]
    Encode(#[from] toml::ser::Error),
}
