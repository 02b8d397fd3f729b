use natter_llm::{ProviderMessage, Role};
use natter_storage::{MessageId, SessionId};
use serde::{Deserialize, Serialize};

use super::message::{AssistantMessage, ChatMessage, Timestamp, now_unix_ms};

pub const DEFAULT_SESSION_TITLE: &str = "New Conversation";

/// One conversation: ordered messages plus metadata.
///
/// The sequence is append-only. Only the last entry is ever rewritten in
/// place, and only while a generation targeting this session is running.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatSession {
    pub id: SessionId,
    #[serde(default = "default_title")]
    pub title: String,
    #[serde(default)]
    pub messages: Vec<ChatMessage>,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
}

impl ChatSession {
    pub fn new(title: impl Into<String>) -> Self {
        Self::with_id(SessionId::new_v7(), title)
    }

    pub fn with_id(id: SessionId, title: impl Into<String>) -> Self {
        let mut title = title.into();
        if title.trim().is_empty() {
            title = DEFAULT_SESSION_TITLE.to_string();
        }

        let now = now_unix_ms();
        Self {
            id,
            title,
            messages: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn push(&mut self, message: ChatMessage) {
        self.messages.push(message);
        self.touch();
    }

    pub fn last(&self) -> Option<&ChatMessage> {
        self.messages.last()
    }

    /// Folds a content delta into the reply being written.
    ///
    /// Extends the trailing partial assistant message, or opens a new one.
    /// An empty delta changes nothing.
    pub fn append_or_mutate_assistant(&mut self, delta: &str) {
        if delta.is_empty() {
            return;
        }

        match self.messages.last_mut() {
            Some(ChatMessage::Assistant(reply)) if reply.partial => reply.content.push_str(delta),
            _ => self.messages.push(ChatMessage::assistant_partial(delta)),
        }
        self.touch();
    }

    /// Shows a loading entry, replacing the previous one if it is still last.
    pub fn set_loading(&mut self, loading: ChatMessage) {
        debug_assert!(loading.is_loading_chunk());
        self.clear_loading();
        self.push(loading);
    }

    /// Drops a trailing loading entry. Returns whether one was present.
    pub fn clear_loading(&mut self) -> bool {
        if self.messages.last().is_some_and(ChatMessage::is_loading_chunk) {
            self.messages.pop();
            return true;
        }
        false
    }

    /// Closes the reply of the current generation.
    ///
    /// A trailing partial assistant message gets `partial` set as given; when
    /// the generation produced no content, an empty reply is appended so
    /// every accepted generation ends with exactly one assistant message.
    pub fn seal_assistant_reply(&mut self, partial: bool) {
        match self.messages.last_mut() {
            Some(ChatMessage::Assistant(reply)) if reply.partial => reply.partial = partial,
            _ => self.messages.push(ChatMessage::Assistant(AssistantMessage {
                id: MessageId::new_v7(),
                content: String::new(),
                created_at: now_unix_ms(),
                partial,
            })),
        }
        self.touch();
    }

    /// Copy of the session without ephemeral loading entries.
    pub fn persistable(&self) -> Self {
        Self {
            messages: self
                .messages
                .iter()
                .filter(|message| !message.is_loading_chunk())
                .cloned()
                .collect(),
            ..self.clone()
        }
    }

    /// Conversation history as a provider sees it.
    ///
    /// Client notices and loading entries never leave the client.
    pub fn history_for_model(&self) -> Vec<ProviderMessage> {
        self.messages
            .iter()
            .filter_map(|message| match message {
                ChatMessage::User(user) => Some(ProviderMessage::new(Role::User, &user.content)),
                ChatMessage::Assistant(reply) if !reply.content.is_empty() => {
                    Some(ProviderMessage::new(Role::Assistant, &reply.content))
                }
                _ => None,
            })
            .collect()
    }

    fn touch(&mut self) {
        self.updated_at = now_unix_ms().max(self.updated_at);
    }
}

fn default_title() -> String {
    DEFAULT_SESSION_TITLE.to_string()
}
