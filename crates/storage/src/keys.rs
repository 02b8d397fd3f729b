use std::fmt;

use snafu::OptionExt;

use super::error::{InvalidKeySnafu, StorageError, StorageResult};
use super::ids::SessionId;

pub const CHAT_LIST_KEY: &str = "chat_list";
pub const CHAT_DATA_PREFIX: &str = "chat_data_";
pub const CURRENT_CHAT_KEY: &str = "current_chat";
pub const LLM_CONFIG_KEY: &str = "llm_config";
pub const MODEL_CONFIG_KEY: &str = "model_config";
pub const THEME_KEY: &str = "theme";
pub const LANGUAGE_KEY: &str = "language";

/// Every key the application reads or writes.
///
/// The raw string form is what lands in the backend, so it must stay stable
/// across releases.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StorageKey {
    /// Ordered list of known session ids.
    ChatList,
    /// Full record of one session.
    ChatData(SessionId),
    /// Id of the focused session, absent when none is focused.
    CurrentChat,
    /// Provider registry.
    LlmConfig,
    /// Editable model parameters.
    ModelConfig,
    Theme,
    Language,
}

impl StorageKey {
    pub fn as_string(&self) -> String {
        match self {
            Self::ChatList => CHAT_LIST_KEY.to_string(),
            Self::ChatData(id) => format!("{CHAT_DATA_PREFIX}{id}"),
            Self::CurrentChat => CURRENT_CHAT_KEY.to_string(),
            Self::LlmConfig => LLM_CONFIG_KEY.to_string(),
            Self::ModelConfig => MODEL_CONFIG_KEY.to_string(),
            Self::Theme => THEME_KEY.to_string(),
            Self::Language => LANGUAGE_KEY.to_string(),
        }
    }

    pub fn parse(raw: &str) -> StorageResult<Self> {
        let key = match raw {
            CHAT_LIST_KEY => Self::ChatList,
            CURRENT_CHAT_KEY => Self::CurrentChat,
            LLM_CONFIG_KEY => Self::LlmConfig,
            MODEL_CONFIG_KEY => Self::ModelConfig,
            THEME_KEY => Self::Theme,
            LANGUAGE_KEY => Self::Language,
            _ => {
                let id = raw.strip_prefix(CHAT_DATA_PREFIX).context(InvalidKeySnafu {
                    stage: "parse-storage-key",
                    raw: raw.to_string(),
                })?;
                Self::ChatData(SessionId::parse(id)?)
            }
        };
        Ok(key)
    }
}

impl fmt::Display for StorageKey {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter.write_str(&self.as_string())
    }
}

impl std::str::FromStr for StorageKey {
    type Err = StorageError;

    fn from_str(raw: &str) -> StorageResult<Self> {
        Self::parse(raw)
    }
}
