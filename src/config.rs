use std::fmt;
use std::fs;
use std::str::FromStr;
use std::time::Duration;

use camino::Utf8PathBuf;
use directories::BaseDirs;
use serde::{Deserialize, Serialize};

use crate::cache::DEFAULT_EXPIRY;
use crate::domain::CollectionPath;
use crate::error::ObisError;
use crate::fs_util::write_bytes_atomic;

pub const DEFAULT_OUTPUT_DIR: &str = "openbis-data";

/// One config file as stored on disk. Every field is optional so that the
/// local file can override only what it sets.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct Settings {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub openbis_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_dir: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_collection: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub verify_certificates: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub verify_checksum: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache_expiry_minutes: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigKey {
    OpenbisUrl,
    OutputDir,
    DefaultCollection,
    VerifyCertificates,
    VerifyChecksum,
    CacheExpiryMinutes,
}

impl ConfigKey {
    pub const ALL: [ConfigKey; 6] = [
        ConfigKey::OpenbisUrl,
        ConfigKey::OutputDir,
        ConfigKey::DefaultCollection,
        ConfigKey::VerifyCertificates,
        ConfigKey::VerifyChecksum,
        ConfigKey::CacheExpiryMinutes,
    ];

    pub fn default_value(&self) -> Option<String> {
        match self {
            ConfigKey::OpenbisUrl | ConfigKey::DefaultCollection => None,
            ConfigKey::OutputDir => Some(DEFAULT_OUTPUT_DIR.to_string()),
            ConfigKey::VerifyCertificates => Some("true".to_string()),
            ConfigKey::VerifyChecksum => Some("false".to_string()),
            ConfigKey::CacheExpiryMinutes => Some((DEFAULT_EXPIRY.as_secs() / 60).to_string()),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ConfigKey::OpenbisUrl => "openbis_url",
            ConfigKey::OutputDir => "output_dir",
            ConfigKey::DefaultCollection => "default_collection",
            ConfigKey::VerifyCertificates => "verify_certificates",
            ConfigKey::VerifyChecksum => "verify_checksum",
            ConfigKey::CacheExpiryMinutes => "cache_expiry_minutes",
        }
    }
}

impl fmt::Display for ConfigKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ConfigKey {
    type Err = ObisError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let normalized = value.trim().to_lowercase().replace('-', "_");
        ConfigKey::ALL
            .into_iter()
            .find(|key| key.as_str() == normalized)
            .ok_or_else(|| ObisError::InvalidConfigKey(value.to_string()))
    }
}

impl Settings {
    pub fn get(&self, key: ConfigKey) -> Option<String> {
        match key {
            ConfigKey::OpenbisUrl => self.openbis_url.clone(),
            ConfigKey::OutputDir => self.output_dir.clone(),
            ConfigKey::DefaultCollection => self.default_collection.clone(),
            ConfigKey::VerifyCertificates => self.verify_certificates.map(|v| v.to_string()),
            ConfigKey::VerifyChecksum => self.verify_checksum.map(|v| v.to_string()),
            ConfigKey::CacheExpiryMinutes => self.cache_expiry_minutes.map(|v| v.to_string()),
        }
    }

    pub fn set(&mut self, key: ConfigKey, value: &str) -> Result<(), ObisError> {
        let invalid = || ObisError::InvalidConfigValue {
            key: key.to_string(),
            value: value.to_string(),
        };
        let trimmed = value.trim();
        match key {
            ConfigKey::OpenbisUrl => {
                if !(trimmed.starts_with("http://") || trimmed.starts_with("https://")) {
                    return Err(invalid());
                }
                self.openbis_url = Some(trimmed.trim_end_matches('/').to_string());
            }
            ConfigKey::OutputDir => {
                if trimmed.is_empty() {
                    return Err(invalid());
                }
                self.output_dir = Some(trimmed.to_string());
            }
            ConfigKey::DefaultCollection => {
                let path: CollectionPath = trimmed.parse().map_err(|_| invalid())?;
                self.default_collection = Some(path.to_string());
            }
            ConfigKey::VerifyCertificates => {
                self.verify_certificates = Some(parse_bool(trimmed).ok_or_else(invalid)?);
            }
            ConfigKey::VerifyChecksum => {
                self.verify_checksum = Some(parse_bool(trimmed).ok_or_else(invalid)?);
            }
            ConfigKey::CacheExpiryMinutes => {
                let minutes = trimmed.parse::<u64>().map_err(|_| invalid())?;
                self.cache_expiry_minutes = Some(minutes);
            }
        }
        Ok(())
    }

    pub fn unset(&mut self, key: ConfigKey) -> bool {
        match key {
            ConfigKey::OpenbisUrl => self.openbis_url.take().is_some(),
            ConfigKey::OutputDir => self.output_dir.take().is_some(),
            ConfigKey::DefaultCollection => self.default_collection.take().is_some(),
            ConfigKey::VerifyCertificates => self.verify_certificates.take().is_some(),
            ConfigKey::VerifyChecksum => self.verify_checksum.take().is_some(),
            ConfigKey::CacheExpiryMinutes => self.cache_expiry_minutes.take().is_some(),
        }
    }

    /// Values set in `other` win.
    pub fn overlay(self, other: Settings) -> Settings {
        Settings {
            openbis_url: other.openbis_url.or(self.openbis_url),
            output_dir: other.output_dir.or(self.output_dir),
            default_collection: other.default_collection.or(self.default_collection),
            verify_certificates: other.verify_certificates.or(self.verify_certificates),
            verify_checksum: other.verify_checksum.or(self.verify_checksum),
            cache_expiry_minutes: other.cache_expiry_minutes.or(self.cache_expiry_minutes),
        }
    }
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.to_lowercase().as_str() {
        "true" | "yes" | "1" | "on" => Some(true),
        "false" | "no" | "0" | "off" => Some(false),
        _ => None,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConfigScope {
    Global,
    Local,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConfigSource {
    Local,
    Global,
    Default,
}

impl ConfigSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConfigSource::Local => "local",
            ConfigSource::Global => "global",
            ConfigSource::Default => "default",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConfigEntry {
    pub key: String,
    pub value: Option<String>,
    pub source: ConfigSource,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConfigChange {
    pub key: String,
    pub scope: ConfigScope,
    pub path: String,
    pub value: Option<String>,
    pub changed: bool,
}

#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    pub openbis_url: Option<String>,
    pub output_dir: Utf8PathBuf,
    pub default_collection: Option<CollectionPath>,
    pub verify_certificates: bool,
    pub verify_checksum: bool,
    pub cache_expiry: Duration,
}

impl ResolvedConfig {
    pub fn from_settings(settings: &Settings) -> Result<Self, ObisError> {
        let default_collection = settings
            .default_collection
            .as_deref()
            .map(str::parse)
            .transpose()?;
        Ok(Self {
            openbis_url: settings.openbis_url.clone(),
            output_dir: expand_home(settings.output_dir.as_deref().unwrap_or(DEFAULT_OUTPUT_DIR)),
            default_collection,
            verify_certificates: settings.verify_certificates.unwrap_or(true),
            verify_checksum: settings.verify_checksum.unwrap_or(false),
            cache_expiry: settings
                .cache_expiry_minutes
                .map(|minutes| Duration::from_secs(minutes.saturating_mul(60)))
                .unwrap_or(DEFAULT_EXPIRY),
        })
    }
}

/// Global (`~/.openbis`) and project-local (`./.openbis`) configuration.
#[derive(Debug, Clone)]
pub struct ConfigStore {
    global_root: Utf8PathBuf,
    local_root: Utf8PathBuf,
}

impl ConfigStore {
    pub fn new() -> Result<Self, ObisError> {
        let cwd = std::env::current_dir().map_err(|err| ObisError::Filesystem(err.to_string()))?;
        let local_root = Utf8PathBuf::from_path_buf(cwd.join(".openbis"))
            .map_err(|_| ObisError::Filesystem("invalid working directory path".to_string()))?;

        let global_root = BaseDirs::new()
            .and_then(|dirs| Utf8PathBuf::from_path_buf(dirs.home_dir().join(".openbis")).ok())
            .ok_or_else(|| ObisError::Filesystem("unable to resolve home directory".to_string()))?;

        Ok(Self {
            global_root,
            local_root,
        })
    }

    pub fn new_with_paths(global_root: Utf8PathBuf, local_root: Utf8PathBuf) -> Self {
        Self {
            global_root,
            local_root,
        }
    }

    pub fn config_path(&self, scope: ConfigScope) -> Utf8PathBuf {
        match scope {
            ConfigScope::Global => self.global_root.join("config.json"),
            ConfigScope::Local => self.local_root.join("config.json"),
        }
    }

    pub fn credentials_path(&self) -> Utf8PathBuf {
        self.global_root.join("credentials")
    }

    pub fn token_path(&self) -> Utf8PathBuf {
        self.global_root.join("session.token")
    }

    pub fn load(&self, scope: ConfigScope) -> Result<Settings, ObisError> {
        let path = self.config_path(scope);
        if !path.as_std_path().exists() {
            return Ok(Settings::default());
        }
        let content = fs::read_to_string(path.as_std_path())
            .map_err(|_| ObisError::ConfigRead(path.clone().into_std_path_buf()))?;
        if content.trim().is_empty() {
            return Ok(Settings::default());
        }
        serde_json::from_str(&content).map_err(|err| ObisError::ConfigParse(err.to_string()))
    }

    pub fn save(&self, scope: ConfigScope, settings: &Settings) -> Result<(), ObisError> {
        let path = self.config_path(scope);
        let mut content = serde_json::to_vec_pretty(settings)
            .map_err(|err| ObisError::ConfigParse(err.to_string()))?;
        content.push(b'\n');
        write_bytes_atomic(path.as_std_path(), &content)
    }

    pub fn effective(&self) -> Result<Settings, ObisError> {
        let global = self.load(ConfigScope::Global)?;
        let local = self.load(ConfigScope::Local)?;
        Ok(global.overlay(local))
    }

    pub fn resolve(&self) -> Result<ResolvedConfig, ObisError> {
        ResolvedConfig::from_settings(&self.effective()?)
    }

    /// Effective value of `key` and the layer it came from.
    pub fn get(&self, key: ConfigKey) -> Result<ConfigEntry, ObisError> {
        let local = self.load(ConfigScope::Local)?;
        let global = self.load(ConfigScope::Global)?;
        Ok(entry_for(key, &global, &local))
    }

    pub fn list(&self) -> Result<Vec<ConfigEntry>, ObisError> {
        let local = self.load(ConfigScope::Local)?;
        let global = self.load(ConfigScope::Global)?;
        Ok(ConfigKey::ALL
            .into_iter()
            .map(|key| entry_for(key, &global, &local))
            .collect())
    }

    pub fn set(
        &self,
        scope: ConfigScope,
        key: ConfigKey,
        value: &str,
    ) -> Result<ConfigChange, ObisError> {
        let mut settings = self.load(scope)?;
        let before = settings.get(key);
        settings.set(key, value)?;
        let after = settings.get(key);
        self.save(scope, &settings)?;
        tracing::debug!(%key, ?scope, "config value written");
        Ok(ConfigChange {
            key: key.to_string(),
            scope,
            path: self.config_path(scope).to_string(),
            changed: before != after,
            value: after,
        })
    }

    pub fn unset(&self, scope: ConfigScope, key: ConfigKey) -> Result<ConfigChange, ObisError> {
        let mut settings = self.load(scope)?;
        let changed = settings.unset(key);
        if changed {
            self.save(scope, &settings)?;
        }
        Ok(ConfigChange {
            key: key.to_string(),
            scope,
            path: self.config_path(scope).to_string(),
            value: None,
            changed,
        })
    }
}

fn entry_for(key: ConfigKey, global: &Settings, local: &Settings) -> ConfigEntry {
    let (value, source) = match (local.get(key), global.get(key)) {
        (Some(value), _) => (Some(value), ConfigSource::Local),
        (None, Some(value)) => (Some(value), ConfigSource::Global),
        (None, None) => (key.default_value(), ConfigSource::Default),
    };
    ConfigEntry {
        key: key.to_string(),
        value,
        source,
    }
}

/// Expands a leading `~` to the user's home directory.
pub fn expand_home(path: &str) -> Utf8PathBuf {
    let home = || {
        BaseDirs::new().and_then(|dirs| Utf8PathBuf::from_path_buf(dirs.home_dir().to_path_buf()).ok())
    };
    if path == "~" {
        return home().unwrap_or_else(|| Utf8PathBuf::from(path));
    }
    match path.strip_prefix("~/") {
        Some(rest) => home()
            .map(|home| home.join(rest))
            .unwrap_or_else(|| Utf8PathBuf::from(path)),
        None => Utf8PathBuf::from(path),
    }
}
