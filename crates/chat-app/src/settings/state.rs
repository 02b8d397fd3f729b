use std::sync::Arc;

use natter_storage::{Persistence, StorageError, StorageKey};
use snafu::ResultExt;

use crate::state::{StateStore, SubscriptionId};

use super::error::{SettingsResult, StorageSnafu};
use super::loading::LoadingTracker;
use super::model::{
    ModelConfig, ModelLoadingKey, validate_context_balance, validate_max_tokens,
    validate_system_prompt, validate_temperature, validate_tool_id,
};

/// Live [`ModelConfig`] backed by the `model_config` key.
///
/// Edits are committed one at a time: validate, persist, then publish. A
/// rejected or unsaved edit leaves the published value untouched. Tracked
/// fields show as loading from the moment their edit is requested, including
/// while it queues behind other edits, until it settles.
pub struct ModelConfigStore {
    state: StateStore<ModelConfig>,
    loading: LoadingTracker,
    persistence: Arc<Persistence>,
    commit: tokio::sync::Mutex<()>,
}

impl ModelConfigStore {
    /// Loads the persisted config, falling back to defaults when the record
    /// is missing or unreadable.
    pub async fn load(persistence: Arc<Persistence>) -> SettingsResult<Self> {
        let loaded = persistence
            .load_with_retry::<ModelConfig>(&StorageKey::ModelConfig)
            .await;
        let config = match loaded {
            Ok(Some(config)) => config.normalized(),
            Ok(None) => {
                tracing::info!("no stored model config, using defaults");
                ModelConfig::default()
            }
            Err(error @ StorageError::DeserializeValue { .. }) => {
                tracing::warn!(error = %error, "stored model config is unreadable, using defaults");
                ModelConfig::default()
            }
            Err(error) => {
                return Err(error).context(StorageSnafu {
                    stage: "load-model-config",
                });
            }
        };

        Ok(Self::with_config(persistence, config))
    }

    pub fn with_config(persistence: Arc<Persistence>, config: ModelConfig) -> Self {
        Self {
            state: StateStore::new(config),
            loading: LoadingTracker::new(),
            persistence,
            commit: tokio::sync::Mutex::new(()),
        }
    }

    /// Current snapshot. Later edits never change a snapshot already taken.
    pub fn config(&self) -> Arc<ModelConfig> {
        self.state.get()
    }

    pub fn loading(&self) -> &LoadingTracker {
        &self.loading
    }

    pub fn subscribe<F>(&self, subscriber: F) -> SubscriptionId
    where
        F: Fn(&ModelConfig) + Send + Sync + 'static,
    {
        self.state.subscribe(subscriber)
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.state.unsubscribe(id)
    }

    pub async fn update_temperature(&self, value: f64) -> SettingsResult<Arc<ModelConfig>> {
        self.commit(Some(ModelLoadingKey::Temperature), |config| {
            config.temperature = validate_temperature(value)?;
            Ok(())
        })
        .await
    }

    pub async fn update_max_tokens(&self, value: u64) -> SettingsResult<Arc<ModelConfig>> {
        self.commit(None, |config| {
            config.max_tokens = validate_max_tokens(value)?;
            Ok(())
        })
        .await
    }

    pub async fn update_context_balance(&self, value: f64) -> SettingsResult<Arc<ModelConfig>> {
        self.commit(Some(ModelLoadingKey::ContextBalance), |config| {
            config.context_balance = validate_context_balance(value)?;
            Ok(())
        })
        .await
    }

    pub async fn update_system_prompt(
        &self,
        value: impl Into<String>,
    ) -> SettingsResult<Arc<ModelConfig>> {
        let value = value.into();
        self.commit(Some(ModelLoadingKey::SystemPrompt), move |config| {
            config.system_prompt = validate_system_prompt(value)?;
            Ok(())
        })
        .await
    }

    pub async fn toggle_multi_tools(&self, enabled: bool) -> SettingsResult<Arc<ModelConfig>> {
        self.commit(Some(ModelLoadingKey::MultiTools), |config| {
            config.multi_tools_enabled = enabled;
            Ok(())
        })
        .await
    }

    pub async fn toggle_tool(
        &self,
        tool_id: &str,
        enabled: bool,
    ) -> SettingsResult<Arc<ModelConfig>> {
        self.commit(Some(ModelLoadingKey::EnabledTools), |config| {
            let tool_id = validate_tool_id(tool_id)?;
            if enabled {
                config.enabled_tools.insert(tool_id);
            } else {
                config.enabled_tools.remove(&tool_id);
            }
            Ok(())
        })
        .await
    }

    pub async fn reset(&self) -> SettingsResult<Arc<ModelConfig>> {
        self.commit(None, |config| {
            *config = ModelConfig::default();
            Ok(())
        })
        .await
    }

    async fn commit<F>(
        &self,
        key: Option<ModelLoadingKey>,
        edit: F,
    ) -> SettingsResult<Arc<ModelConfig>>
    where
        F: FnOnce(&mut ModelConfig) -> SettingsResult<()>,
    {
        let _loading = key.map(|key| self.loading.begin(key));
        let _commit = self.commit.lock().await;

        let mut next = ModelConfig::clone(&self.state.get());
        edit(&mut next)?;

        self.persistence
            .store_with_retry(&StorageKey::ModelConfig, &next)
            .await
            .context(StorageSnafu {
                stage: "persist-model-config",
            })?;

        tracing::info!(field = key.map_or("all", ModelLoadingKey::as_str), "committed model config");
        Ok(self.state.set(next))
    }

    pub fn shutdown(&self) {
        self.state.shutdown();
        self.loading.shutdown();
    }
}
