use std::time::{SystemTime, UNIX_EPOCH};

use natter_llm::normalize_progress;
use natter_storage::MessageId;
use serde::{Deserialize, Serialize};

/// Milliseconds since the Unix epoch.
pub type Timestamp = u64;

pub fn now_unix_ms() -> Timestamp {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |duration| duration.as_millis() as u64)
}

/// One entry in a session's message sequence.
///
/// The `role` tag is the only thing classification looks at.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "role", rename_all = "kebab-case")]
pub enum ChatMessage {
    User(UserMessage),
    Assistant(AssistantMessage),
    ClientNotice(ClientNotice),
    /// Ephemeral stream status; never part of persisted history.
    LoadingChunk(LoadingChunk),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    User,
    Assistant,
    ClientNotice,
    LoadingChunk,
}

impl MessageKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Assistant => "assistant",
            Self::ClientNotice => "client-notice",
            Self::LoadingChunk => "loading-chunk",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserMessage {
    #[serde(default = "MessageId::new_v7")]
    pub id: MessageId,
    pub content: String,
    pub created_at: Timestamp,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AssistantMessage {
    #[serde(default = "MessageId::new_v7")]
    pub id: MessageId,
    pub content: String,
    pub created_at: Timestamp,
    /// Still being written, or cut short by an abort or a transport failure.
    #[serde(default)]
    pub partial: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum NoticeKind {
    TransportError,
    StorageError,
    ValidationError,
    Warning,
    Info,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientNotice {
    #[serde(default = "MessageId::new_v7")]
    pub id: MessageId,
    pub content: String,
    pub kind: NoticeKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    pub created_at: Timestamp,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoadingChunk {
    #[serde(default = "MessageId::new_v7")]
    pub id: MessageId,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub progress: Option<f32>,
}

impl ChatMessage {
    pub fn user(content: impl Into<String>) -> Self {
        Self::User(UserMessage {
            id: MessageId::new_v7(),
            content: content.into(),
            created_at: now_unix_ms(),
        })
    }

    /// An assistant reply that is still open for deltas.
    pub fn assistant_partial(content: impl Into<String>) -> Self {
        Self::Assistant(AssistantMessage {
            id: MessageId::new_v7(),
            content: content.into(),
            created_at: now_unix_ms(),
            partial: true,
        })
    }

    pub fn notice(kind: NoticeKind, content: impl Into<String>) -> Self {
        Self::ClientNotice(ClientNotice {
            id: MessageId::new_v7(),
            content: content.into(),
            kind,
            code: None,
            created_at: now_unix_ms(),
        })
    }

    pub fn notice_with_code(
        kind: NoticeKind,
        content: impl Into<String>,
        code: impl Into<String>,
    ) -> Self {
        Self::ClientNotice(ClientNotice {
            id: MessageId::new_v7(),
            content: content.into(),
            kind,
            code: Some(code.into()),
            created_at: now_unix_ms(),
        })
    }

    pub fn loading(message: impl Into<String>, progress: Option<f32>) -> Self {
        Self::LoadingChunk(LoadingChunk {
            id: MessageId::new_v7(),
            message: message.into(),
            progress: normalize_progress(progress),
        })
    }

    /// Stable across every delta applied to the message.
    pub fn id(&self) -> MessageId {
        match self {
            Self::User(message) => message.id,
            Self::Assistant(message) => message.id,
            Self::ClientNotice(notice) => notice.id,
            Self::LoadingChunk(chunk) => chunk.id,
        }
    }

    pub fn kind(&self) -> MessageKind {
        match self {
            Self::User(_) => MessageKind::User,
            Self::Assistant(_) => MessageKind::Assistant,
            Self::ClientNotice(_) => MessageKind::ClientNotice,
            Self::LoadingChunk(_) => MessageKind::LoadingChunk,
        }
    }

    pub fn is_user(&self) -> bool {
        matches!(self, Self::User(_))
    }

    pub fn is_assistant(&self) -> bool {
        matches!(self, Self::Assistant(_))
    }

    pub fn is_client_notice(&self) -> bool {
        matches!(self, Self::ClientNotice(_))
    }

    pub fn is_loading_chunk(&self) -> bool {
        matches!(self, Self::LoadingChunk(_))
    }

    /// Text shown for this entry, whatever its kind.
    pub fn text(&self) -> &str {
        match self {
            Self::User(message) => &message.content,
            Self::Assistant(message) => &message.content,
            Self::ClientNotice(notice) => &notice.content,
            Self::LoadingChunk(chunk) => &chunk.message,
        }
    }
}

pub fn classify(message: &ChatMessage) -> MessageKind {
    message.kind()
}

pub fn is_assistant_message(message: &ChatMessage) -> bool {
    message.is_assistant()
}

pub fn is_client_notice_message(message: &ChatMessage) -> bool {
    message.is_client_notice()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classification_follows_the_tag() {
        let messages = [
            ChatMessage::user("hi"),
            ChatMessage::assistant_partial(""),
            ChatMessage::notice(NoticeKind::Warning, "careful"),
            ChatMessage::loading("calling tool", None),
        ];
        let kinds = messages.iter().map(classify).collect::<Vec<_>>();
        assert_eq!(
            kinds,
            vec![
                MessageKind::User,
                MessageKind::Assistant,
                MessageKind::ClientNotice,
                MessageKind::LoadingChunk,
            ]
        );
        assert!(is_assistant_message(&messages[1]));
        assert!(!is_assistant_message(&messages[2]));
        assert!(is_client_notice_message(&messages[2]));
        assert!(messages[3].is_loading_chunk());
    }

    #[test]
    fn wire_shape_is_tagged_by_role() {
        let id = MessageId::parse("0192f5e0-0000-7000-8000-000000000001").unwrap();
        let notice = ChatMessage::ClientNotice(ClientNotice {
            id,
            content: "stream failed".to_string(),
            kind: NoticeKind::TransportError,
            code: Some("E_STREAM".to_string()),
            created_at: 7,
        });
        assert_eq!(
            serde_json::to_value(&notice).unwrap(),
            serde_json::json!({
                "role": "client-notice",
                "id": "0192f5e0-0000-7000-8000-000000000001",
                "content": "stream failed",
                "kind": "transport-error",
                "code": "E_STREAM",
                "createdAt": 7,
            })
        );

        let decoded: ChatMessage = serde_json::from_str(
            r#"{"role":"assistant","id":"0192f5e0-0000-7000-8000-000000000001","content":"Hi","createdAt":1}"#,
        )
        .unwrap();
        assert_eq!(
            decoded,
            ChatMessage::Assistant(AssistantMessage {
                id,
                content: "Hi".to_string(),
                created_at: 1,
                partial: false,
            })
        );
    }

    #[test]
    fn every_constructor_assigns_a_fresh_id() {
        let messages = [
            ChatMessage::user("hi"),
            ChatMessage::assistant_partial(""),
            ChatMessage::notice(NoticeKind::Info, "saved"),
            ChatMessage::notice_with_code(NoticeKind::Warning, "slow", "W1"),
            ChatMessage::loading("thinking", None),
        ];
        let ids = messages
            .iter()
            .map(ChatMessage::id)
            .collect::<std::collections::HashSet<_>>();
        assert_eq!(ids.len(), messages.len());

        let legacy: ChatMessage =
            serde_json::from_str(r#"{"role":"user","content":"old","createdAt":1}"#).unwrap();
        assert_eq!(legacy.text(), "old");
    }

    #[test]
    fn loading_progress_is_normalized() {
        let ChatMessage::LoadingChunk(chunk) = ChatMessage::loading("indexing", Some(3.0)) else {
            panic!("expected a loading entry");
        };
        assert_eq!(chunk.progress, Some(1.0));
        assert_eq!(MessageKind::LoadingChunk.as_str(), "loading-chunk");
    }
}
