use std::sync::Arc;

use natter_storage::{Persistence, SessionId, StorageKey, StorageResult};

use crate::chat::ChatSession;

/// Sessions over the key scheme: `chat_list`, `chat_data_<id>`, `current_chat`.
///
/// `chat_list` is most-recent-first. Read-modify-write on the list and on
/// the focus key runs under one lock so concurrent lifecycle calls cannot
/// drop each other's ids.
pub struct SessionRepository {
    persistence: Arc<Persistence>,
    index: tokio::sync::Mutex<()>,
}

impl SessionRepository {
    pub fn new(persistence: Arc<Persistence>) -> Self {
        Self {
            persistence,
            index: tokio::sync::Mutex::new(()),
        }
    }

    pub fn persistence(&self) -> &Arc<Persistence> {
        &self.persistence
    }

    pub async fn list_sessions(&self) -> StorageResult<Vec<SessionId>> {
        let ids = self
            .persistence
            .load_with_retry::<Vec<SessionId>>(&StorageKey::ChatList)
            .await?;
        Ok(ids.unwrap_or_default())
    }

    pub async fn load_session(&self, id: SessionId) -> StorageResult<Option<ChatSession>> {
        self.persistence
            .load_with_retry(&StorageKey::ChatData(id))
            .await
    }

    /// Writes the session record without loading entries and makes sure its
    /// id is listed.
    pub async fn save_session(&self, session: &ChatSession) -> StorageResult<()> {
        let record = session.persistable();
        self.persistence
            .store_with_retry(&StorageKey::ChatData(record.id), &record)
            .await?;

        let _index = self.index.lock().await;
        let mut ids = self.list_sessions().await?;
        if !ids.contains(&record.id) {
            ids.insert(0, record.id);
            self.store_list(&ids).await?;
        }

        tracing::debug!(session_id = %record.id, messages = record.messages.len(), "saved session");
        Ok(())
    }

    /// Creates an empty session at the front of the list and focuses it.
    pub async fn create_session(&self, title: impl Into<String>) -> StorageResult<ChatSession> {
        let session = ChatSession::new(title);
        self.persistence
            .store_with_retry(&StorageKey::ChatData(session.id), &session)
            .await?;

        let _index = self.index.lock().await;
        let mut ids = self.list_sessions().await?;
        ids.retain(|id| *id != session.id);
        ids.insert(0, session.id);
        self.store_list(&ids).await?;
        self.store_current(Some(session.id)).await?;

        tracing::info!(session_id = %session.id, title = %session.title, "created session");
        Ok(session)
    }

    /// Deletes a session. Focus moves to the first remaining session, or is
    /// cleared when none is left. Returns the new focus.
    pub async fn remove_session(&self, id: SessionId) -> StorageResult<Option<SessionId>> {
        let _index = self.index.lock().await;
        let mut ids = self.list_sessions().await?;
        ids.retain(|existing| *existing != id);
        self.store_list(&ids).await?;
        self.persistence
            .remove_with_retry(&StorageKey::ChatData(id))
            .await?;

        let mut current = self.stored_current().await?;
        if current.is_none_or(|current| current == id || !ids.contains(&current)) {
            current = ids.first().copied();
            self.store_current(current).await?;
        }

        tracing::info!(session_id = %id, "removed session");
        Ok(current)
    }

    pub async fn select_session(&self, id: SessionId) -> StorageResult<()> {
        let _index = self.index.lock().await;
        self.store_current(Some(id)).await
    }

    /// Focused session id. Falls back to the first listed session when the
    /// stored focus is absent or stale.
    pub async fn current_session_id(&self) -> StorageResult<Option<SessionId>> {
        let ids = self.list_sessions().await?;
        let current = self
            .stored_current()
            .await?
            .filter(|current| ids.contains(current));
        Ok(current.or_else(|| ids.first().copied()))
    }

    pub async fn current_session(&self) -> StorageResult<Option<ChatSession>> {
        match self.current_session_id().await? {
            Some(id) => self.load_session(id).await,
            None => Ok(None),
        }
    }

    async fn stored_current(&self) -> StorageResult<Option<SessionId>> {
        let current = self
            .persistence
            .load_with_retry::<Option<SessionId>>(&StorageKey::CurrentChat)
            .await?;
        Ok(current.flatten())
    }

    async fn store_list(&self, ids: &[SessionId]) -> StorageResult<()> {
        self.persistence
            .store_with_retry(&StorageKey::ChatList, ids)
            .await
    }

    async fn store_current(&self, id: Option<SessionId>) -> StorageResult<()> {
        match id {
            Some(id) => {
                self.persistence
                    .store_with_retry(&StorageKey::CurrentChat, &id)
                    .await
            }
            None => {
                self.persistence
                    .remove_with_retry(&StorageKey::CurrentChat)
                    .await
            }
        }
    }
}
