use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{AppError, Result};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default = "default_db_path")]
    pub db_path: String,

    /// Page size for story listings.
    #[serde(default = "default_story_limit")]
    pub story_limit: usize,

    /// Point-reads in flight when resolving a favorites list.
    #[serde(default = "default_favorites_concurrency")]
    pub favorites_concurrency: usize,

    #[serde(default)]
    pub storage: StorageConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    #[default]
    Local,
    Remote,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default)]
    pub backend: StorageBackend,

    #[serde(default = "default_image_dir")]
    pub local_dir: String,

    /// Base of public image URLs for the local backend.
    #[serde(default = "default_public_base_url")]
    pub public_base_url: String,

    pub bucket_url: Option<String>,
    pub access_token: Option<String>,
}

fn data_dir() -> PathBuf {
    let data_dir = dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("storyshelf");
    std::fs::create_dir_all(&data_dir).ok();
    data_dir
}

fn default_db_path() -> String {
    data_dir().join("stories.db").to_string_lossy().to_string()
}

fn default_image_dir() -> String {
    data_dir().join("images").to_string_lossy().to_string()
}

fn default_public_base_url() -> String {
    "http://localhost:8080/storage".to_string()
}

fn default_story_limit() -> usize {
    50
}

fn default_favorites_concurrency() -> usize {
    8
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: StorageBackend::default(),
            local_dir: default_image_dir(),
            public_base_url: default_public_base_url(),
            bucket_url: None,
            access_token: None,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
            story_limit: default_story_limit(),
            favorites_concurrency: default_favorites_concurrency(),
            storage: StorageConfig::default(),
        }
    }
}

impl Config {
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_path())
    }

    /// Read the config at `path`, writing the defaults there first if the
    /// file does not exist yet.
    pub fn load_from(config_path: &Path) -> Result<Self> {
        if config_path.exists() {
            let content = std::fs::read_to_string(config_path)?;
            let config: Config = toml::from_str(&content)?;
            config.validate()?;
            Ok(config)
        } else {
            let config = Config::default();
            config.save_to(config_path)?;
            Ok(config)
        }
    }

    pub fn save_to(&self, config_path: &Path) -> Result<()> {
        if let Some(parent) = config_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)
            .map_err(|e| AppError::Config(e.to_string()))?;
        std::fs::write(config_path, content)?;
        Ok(())
    }

    pub fn config_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("storyshelf")
            .join("config.toml")
    }

    fn validate(&self) -> Result<()> {
        if self.story_limit == 0 {
            return Err(AppError::Config("story_limit must be at least 1".to_string()));
        }
        if self.storage.backend == StorageBackend::Remote && self.storage.bucket_url.is_none() {
            return Err(AppError::Config(
                "storage.bucket_url is required for the remote backend".to_string(),
            ));
        }
        Ok(())
    }
}
