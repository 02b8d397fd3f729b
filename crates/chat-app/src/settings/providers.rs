use std::sync::Arc;

use natter_llm::{LlmConfig, ProviderConfig};
use natter_storage::{Persistence, StorageError, StorageKey};
use snafu::{ResultExt, ensure};

use crate::state::{StateStore, SubscriptionId};

use super::error::{SettingsResult, StorageSnafu, ValidationSnafu};

/// Per-provider credentials and model selection, persisted under `llm_config`.
///
/// The default provider always has an entry. Lookups never fail; a missing
/// key is only an error where a transport tries to use it.
pub struct ProviderRegistry {
    state: StateStore<LlmConfig>,
    persistence: Arc<Persistence>,
    default_provider: String,
    commit: tokio::sync::Mutex<()>,
}

impl ProviderRegistry {
    /// Loads `llm_config` and seeds the default provider entry from `seed`
    /// where the stored entry leaves fields absent.
    pub async fn load(
        persistence: Arc<Persistence>,
        default_provider: &str,
        seed: ProviderConfig,
    ) -> SettingsResult<Self> {
        let loaded = persistence
            .load_with_retry::<LlmConfig>(&StorageKey::LlmConfig)
            .await;
        let config = match loaded {
            Ok(config) => config.unwrap_or_default(),
            Err(error @ StorageError::DeserializeValue { .. }) => {
                tracing::warn!(error = %error, "stored provider config is unreadable, starting empty");
                LlmConfig::default()
            }
            Err(error) => {
                return Err(error).context(StorageSnafu {
                    stage: "load-llm-config",
                });
            }
        };

        Ok(Self::with_config(persistence, default_provider, config, seed))
    }

    pub fn with_config(
        persistence: Arc<Persistence>,
        default_provider: &str,
        config: LlmConfig,
        seed: ProviderConfig,
    ) -> Self {
        let default_provider = default_provider.trim().to_string();
        let config = config.ensure_provider(&default_provider, seed);
        Self {
            state: StateStore::new(config),
            persistence,
            default_provider,
            commit: tokio::sync::Mutex::new(()),
        }
    }

    pub fn config(&self) -> Arc<LlmConfig> {
        self.state.get()
    }

    pub fn default_provider(&self) -> &str {
        &self.default_provider
    }

    /// Entry for `provider_id`, all fields absent when unknown.
    pub fn resolve(&self, provider_id: &str) -> ProviderConfig {
        self.state.get().resolve(provider_id)
    }

    /// The provider new generations use, with its entry.
    pub fn active(&self) -> (String, ProviderConfig) {
        let config = self.state.get();
        let provider_id = config.active_provider_id(&self.default_provider).to_string();
        let provider = config.resolve(&provider_id);
        (provider_id, provider)
    }

    pub fn provider_ids(&self) -> Vec<String> {
        self.state.get().providers.keys().cloned().collect()
    }

    pub async fn select_provider(&self, provider_id: &str) -> SettingsResult<Arc<LlmConfig>> {
        let provider_id = validate_provider_id(provider_id)?;
        self.commit("select-provider", move |config| {
            config.providers.entry(provider_id.clone()).or_default();
            config.active_provider = Some(provider_id);
        })
        .await
    }

    /// Sets or clears (`None` or blank) the API key for a provider.
    pub async fn set_api_key(
        &self,
        provider_id: &str,
        api_key: Option<String>,
    ) -> SettingsResult<Arc<LlmConfig>> {
        let provider_id = validate_provider_id(provider_id)?;
        self.commit("set-api-key", move |config| {
            let entry = config.providers.entry(provider_id).or_default();
            let updated = ProviderConfig::new(api_key, entry.default_model.take());
            *entry = updated;
        })
        .await
    }

    pub async fn set_default_model(
        &self,
        provider_id: &str,
        model: Option<String>,
    ) -> SettingsResult<Arc<LlmConfig>> {
        let provider_id = validate_provider_id(provider_id)?;
        self.commit("set-default-model", move |config| {
            let entry = config.providers.entry(provider_id).or_default();
            let updated = ProviderConfig::new(entry.api_key.take(), model);
            *entry = updated;
        })
        .await
    }

    /// Drops a provider entry. The default provider cannot be removed.
    pub async fn remove_provider(&self, provider_id: &str) -> SettingsResult<Arc<LlmConfig>> {
        let provider_id = validate_provider_id(provider_id)?;
        ensure!(
            provider_id != self.default_provider,
            ValidationSnafu {
                stage: "remove-provider",
                field: "providers",
                details: format!("'{provider_id}' is the default provider"),
            }
        );

        self.commit("remove-provider", move |config| {
            config.providers.remove(&provider_id);
            if config.active_provider.as_deref() == Some(provider_id.as_str()) {
                config.active_provider = None;
            }
        })
        .await
    }

    pub fn subscribe<F>(&self, subscriber: F) -> SubscriptionId
    where
        F: Fn(&LlmConfig) + Send + Sync + 'static,
    {
        self.state.subscribe(subscriber)
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.state.unsubscribe(id)
    }

    pub fn shutdown(&self) {
        self.state.shutdown();
    }

    async fn commit<F>(&self, stage: &'static str, edit: F) -> SettingsResult<Arc<LlmConfig>>
    where
        F: FnOnce(&mut LlmConfig),
    {
        let _commit = self.commit.lock().await;
        let mut next = LlmConfig::clone(&self.state.get());
        edit(&mut next);

        self.persistence
            .store_with_retry(&StorageKey::LlmConfig, &next)
            .await
            .context(StorageSnafu { stage })?;

        tracing::info!(stage, "committed provider config");
        Ok(self.state.set(next))
    }
}

fn validate_provider_id(provider_id: &str) -> SettingsResult<String> {
    let trimmed = provider_id.trim();
    ensure!(
        !trimmed.is_empty(),
        ValidationSnafu {
            stage: "validate-provider-id",
            field: "providers",
            details: "provider name must not be empty".to_string(),
        }
    );
    Ok(trimmed.to_string())
}
