use std::path::{Path, PathBuf};

use figment::Figment;
use figment::providers::{Env, Format, Json, Serialized};
use natter_llm::{DEFAULT_MODEL, DEFAULT_PROVIDER_ID, ProviderConfig};
use serde::{Deserialize, Serialize};
use snafu::ResultExt;

use super::error::{LoadAppConfigSnafu, SettingsResult};

const APP_DIRECTORY_NAME: &str = "natter";
const CONFIG_FILE_NAME: &str = "config.json";
const DATABASE_FILE_NAME: &str = "natter.db";
pub const ENV_PREFIX: &str = "NATTER_";
pub const IN_MEMORY_DATABASE: &str = ":memory:";

/// Process bootstrap settings: where data lives and which provider to seed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub database_path: String,
    pub default_provider: String,
    pub default_model: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            database_path: default_database_path().display().to_string(),
            default_provider: DEFAULT_PROVIDER_ID.to_string(),
            default_model: DEFAULT_MODEL.to_string(),
            api_key: None,
        }
    }
}

impl AppConfig {
    pub fn default_config_dir() -> PathBuf {
        dirs::config_dir()
            .map(|path| path.join(APP_DIRECTORY_NAME))
            .unwrap_or_else(|| PathBuf::from(".natter"))
    }

    pub fn default_config_path() -> PathBuf {
        Self::default_config_dir().join(CONFIG_FILE_NAME)
    }

    /// Defaults, then the JSON file at `path`, then `NATTER_*` variables.
    pub fn figment(path: &Path) -> Figment {
        Figment::from(Serialized::defaults(AppConfig::default()))
            .merge(Json::file(path))
            .merge(Env::prefixed(ENV_PREFIX))
    }

    pub fn extract(figment: &Figment) -> SettingsResult<Self> {
        let config = figment.extract::<AppConfig>().context(LoadAppConfigSnafu {
            stage: "extract-app-config",
        })?;
        Ok(config.normalized())
    }

    /// Loads from the default locations, using defaults when extraction fails.
    pub fn load() -> Self {
        let path = Self::default_config_path();
        match Self::extract(&Self::figment(&path)) {
            Ok(config) => config,
            Err(error) => {
                tracing::warn!(path = %path.display(), error = %error, "failed to load app config, using defaults");
                Self::default()
            }
        }
    }

    pub fn in_memory() -> Self {
        Self {
            database_path: IN_MEMORY_DATABASE.to_string(),
            ..Self::default()
        }
    }

    pub fn uses_in_memory_database(&self) -> bool {
        self.database_path.trim() == IN_MEMORY_DATABASE
    }

    /// Entry the default provider starts from when storage has none.
    pub fn provider_seed(&self) -> ProviderConfig {
        ProviderConfig::new(self.api_key.clone(), Some(self.default_model.clone()))
    }

    fn normalized(mut self) -> Self {
        let defaults = Self::default();
        if self.database_path.trim().is_empty() {
            self.database_path = defaults.database_path;
        }
        if self.default_provider.trim().is_empty() {
            self.default_provider = defaults.default_provider;
        }
        if self.default_model.trim().is_empty() {
            self.default_model = defaults.default_model;
        }
        self.api_key = self
            .api_key
            .map(|key| key.trim().to_string())
            .filter(|key| !key.is_empty());
        self
    }
}

fn default_database_path() -> PathBuf {
    dirs::data_dir()
        .map(|path| path.join(APP_DIRECTORY_NAME))
        .unwrap_or_else(|| PathBuf::from(".natter"))
        .join(DATABASE_FILE_NAME)
}
