use std::sync::Arc;

use natter_llm::ChunkSource;
use natter_storage::{
    KvStore, MemoryStore, Persistence, SessionId, SqliteStore, StorageError, StorageKey,
};
use parking_lot::Mutex;
use snafu::{ResultExt, Snafu, ensure};

use crate::chat::{ChatSession, ControllerError, StreamController, StreamHandle};
use crate::database::SessionRepository;
use crate::settings::{AppConfig, ModelConfigStore, ProviderRegistry, SettingsError};

pub type AppResult<T> = Result<T, AppError>;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum AppError {
    #[snafu(display("cannot submit an empty prompt on `{stage}`"))]
    EmptyPrompt { stage: &'static str },
    #[snafu(display("session {session_id} does not exist on `{stage}`"))]
    UnknownSession {
        stage: &'static str,
        session_id: SessionId,
    },
    #[snafu(display("storage failed on `{stage}`: {source}"))]
    Storage {
        stage: &'static str,
        source: StorageError,
    },
    #[snafu(display("settings failed on `{stage}`: {source}"))]
    Settings {
        stage: &'static str,
        source: SettingsError,
    },
    #[snafu(display("generation failed on `{stage}`: {source}"))]
    Controller {
        stage: &'static str,
        source: ControllerError,
    },
}

/// Everything a chat front end talks to.
///
/// `submit` resolves once a generation has been accepted and started, not when
/// it finishes. `abort` takes effect immediately and may be called any number
/// of times. `is_generating` is true exactly while the focused session is
/// streaming.
pub struct ChatApp {
    config: AppConfig,
    persistence: Arc<Persistence>,
    sessions: Arc<SessionRepository>,
    model_config: Arc<ModelConfigStore>,
    providers: Arc<ProviderRegistry>,
    controller: StreamController,
    current: Mutex<Option<SessionId>>,
}

impl ChatApp {
    /// Opens the configured database (`:memory:` keeps everything in process).
    pub async fn open(config: AppConfig, source: Arc<dyn ChunkSource>) -> AppResult<Self> {
        let backend: Arc<dyn KvStore> = if config.uses_in_memory_database() {
            Arc::new(MemoryStore::new())
        } else {
            let store = SqliteStore::open(&config.database_path)
                .await
                .context(StorageSnafu {
                    stage: "open-database",
                })?;
            Arc::new(store)
        };

        Self::with_persistence(config, Arc::new(Persistence::new(backend)), source).await
    }

    pub async fn with_persistence(
        config: AppConfig,
        persistence: Arc<Persistence>,
        source: Arc<dyn ChunkSource>,
    ) -> AppResult<Self> {
        let sessions = Arc::new(SessionRepository::new(persistence.clone()));
        let model_config = ModelConfigStore::load(persistence.clone())
            .await
            .context(SettingsSnafu {
                stage: "load-model-config",
            })?;
        let providers = ProviderRegistry::load(
            persistence.clone(),
            &config.default_provider,
            config.provider_seed(),
        )
        .await
        .context(SettingsSnafu {
            stage: "load-provider-config",
        })?;
        let current = sessions
            .current_session_id()
            .await
            .context(StorageSnafu {
                stage: "load-current-session",
            })?;

        let model_config = Arc::new(model_config);
        let providers = Arc::new(providers);
        let controller = StreamController::new(
            source,
            sessions.clone(),
            model_config.clone(),
            providers.clone(),
        );

        tracing::info!(
            database = %config.database_path,
            default_provider = %config.default_provider,
            current_session = ?current,
            "chat app ready"
        );
        Ok(Self {
            config,
            persistence,
            sessions,
            model_config,
            providers,
            controller,
            current: Mutex::new(current),
        })
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn sessions(&self) -> &SessionRepository {
        &self.sessions
    }

    pub fn model_config(&self) -> &ModelConfigStore {
        &self.model_config
    }

    pub fn providers(&self) -> &ProviderRegistry {
        &self.providers
    }

    pub fn controller(&self) -> &StreamController {
        &self.controller
    }

    /// Sends `input` in the focused session, creating one if none exists.
    pub async fn submit(&self, input: &str) -> AppResult<StreamHandle> {
        let prompt = input.trim();
        ensure!(!prompt.is_empty(), EmptyPromptSnafu { stage: "submit" });

        let session = match self.current_session().await? {
            Some(session) => session,
            None => self.new_session("").await?,
        };
        self.controller
            .start(session, prompt)
            .context(ControllerSnafu { stage: "submit" })
    }

    pub fn abort(&self) -> bool {
        self.current_session_id()
            .is_some_and(|session_id| self.controller.abort(session_id))
    }

    pub fn is_generating(&self) -> bool {
        self.current_session_id()
            .is_some_and(|session_id| self.controller.is_streaming(session_id))
    }

    pub fn current_session_id(&self) -> Option<SessionId> {
        *self.current.lock()
    }

    /// Focused session, preferring the live copy over the stored one.
    pub async fn current_session(&self) -> AppResult<Option<ChatSession>> {
        let Some(session_id) = self.current_session_id() else {
            return Ok(None);
        };
        self.session(session_id).await
    }

    pub async fn session(&self, session_id: SessionId) -> AppResult<Option<ChatSession>> {
        if let Some(session) = self.controller.snapshot(session_id) {
            return Ok(Some(session));
        }
        self.sessions
            .load_session(session_id)
            .await
            .context(StorageSnafu {
                stage: "load-session",
            })
    }

    pub async fn list_sessions(&self) -> AppResult<Vec<SessionId>> {
        self.sessions.list_sessions().await.context(StorageSnafu {
            stage: "list-sessions",
        })
    }

    pub async fn new_session(&self, title: &str) -> AppResult<ChatSession> {
        let session = self
            .sessions
            .create_session(title)
            .await
            .context(StorageSnafu {
                stage: "create-session",
            })?;
        *self.current.lock() = Some(session.id);
        Ok(session)
    }

    pub async fn select_session(&self, session_id: SessionId) -> AppResult<()> {
        let known = self.list_sessions().await?;
        ensure!(
            known.contains(&session_id),
            UnknownSessionSnafu {
                stage: "select-session",
                session_id,
            }
        );

        self.sessions
            .select_session(session_id)
            .await
            .context(StorageSnafu {
                stage: "select-session",
            })?;
        *self.current.lock() = Some(session_id);
        Ok(())
    }

    /// Deletes a session, stopping its generation first. Returns the new focus.
    pub async fn remove_session(&self, session_id: SessionId) -> AppResult<Option<SessionId>> {
        self.controller.retire(session_id).await;

        let focus = self
            .sessions
            .remove_session(session_id)
            .await
            .context(StorageSnafu {
                stage: "remove-session",
            })?;
        *self.current.lock() = focus;
        Ok(focus)
    }

    pub async fn theme(&self) -> AppResult<Option<String>> {
        self.preference(StorageKey::Theme).await
    }

    pub async fn set_theme(&self, theme: &str) -> AppResult<()> {
        self.set_preference(StorageKey::Theme, theme).await
    }

    pub async fn language(&self) -> AppResult<Option<String>> {
        self.preference(StorageKey::Language).await
    }

    pub async fn set_language(&self, language: &str) -> AppResult<()> {
        self.set_preference(StorageKey::Language, language).await
    }

    /// Stops every generation, waits for their final writes and drops all
    /// subscribers.
    pub async fn shutdown(&self) {
        let aborted = self.controller.abort_all();
        self.controller.settle_all().await;
        self.model_config.shutdown();
        self.providers.shutdown();
        tracing::info!(aborted, "chat app shut down");
    }

    async fn preference(&self, key: StorageKey) -> AppResult<Option<String>> {
        self.persistence
            .load_with_retry(&key)
            .await
            .context(StorageSnafu {
                stage: "load-preference",
            })
    }

    async fn set_preference(&self, key: StorageKey, value: &str) -> AppResult<()> {
        self.persistence
            .store_with_retry(&key, value)
            .await
            .context(StorageSnafu {
                stage: "store-preference",
            })
    }
}
