use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;

use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use snafu::{OptionExt, Snafu};
use tokio_util::sync::CancellationToken;

use super::chunk::StreamChunk;

/// Provider that must always have an entry in [`LlmConfig`].
pub const DEFAULT_PROVIDER_ID: &str = "deepseek";
pub const DEFAULT_MODEL: &str = "deepseek-chat";

/// Credentials and model selection for one provider.
///
/// Every field may be absent; absence is only rejected at the point of use.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_model: Option<String>,
}

impl ProviderConfig {
    pub fn new(api_key: Option<String>, default_model: Option<String>) -> Self {
        Self {
            api_key: non_blank(api_key),
            default_model: non_blank(default_model),
        }
    }

    pub fn with_api_key(mut self, api_key: impl Into<String>) -> Self {
        self.api_key = non_blank(Some(api_key.into()));
        self
    }

    pub fn with_default_model(mut self, model: impl Into<String>) -> Self {
        self.default_model = non_blank(Some(model.into()));
        self
    }

    pub fn is_empty(&self) -> bool {
        self.api_key.is_none() && self.default_model.is_none()
    }

    /// Returns the API key or fails for callers about to authenticate.
    pub fn require_api_key(&self, provider_id: &str) -> ProviderResult<&str> {
        self.api_key.as_deref().context(MissingApiKeySnafu {
            stage: "require-api-key",
            provider_id: provider_id.to_string(),
        })
    }
}

/// Persisted provider registry: `{ providers: { [name]: ProviderConfig } }`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LlmConfig {
    #[serde(default)]
    pub providers: BTreeMap<String, ProviderConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub active_provider: Option<String>,
}

impl LlmConfig {
    /// Looks up a provider, handing back an all-absent entry when unknown.
    pub fn resolve(&self, provider_id: &str) -> ProviderConfig {
        self.providers
            .get(provider_id.trim())
            .cloned()
            .unwrap_or_default()
    }

    /// Guarantees `provider_id` has an entry, seeding it from `seed` when missing.
    /// Existing fields win over the seed.
    pub fn ensure_provider(mut self, provider_id: &str, seed: ProviderConfig) -> Self {
        let entry = self
            .providers
            .entry(provider_id.trim().to_string())
            .or_default();
        if entry.api_key.is_none() {
            entry.api_key = seed.api_key;
        }
        if entry.default_model.is_none() {
            entry.default_model = seed.default_model;
        }
        self
    }

    pub fn active_provider_id<'a>(&'a self, fallback: &'a str) -> &'a str {
        self.active_provider
            .as_deref()
            .filter(|id| !id.trim().is_empty())
            .unwrap_or(fallback)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    System,
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderMessage {
    pub role: Role,
    pub content: String,
}

impl ProviderMessage {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }
}

/// Everything a chunk source needs to run one generation.
///
/// Parameters are a snapshot taken when the generation started; later
/// configuration edits never reach an in-flight request.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamRequest {
    pub provider_id: String,
    pub provider: ProviderConfig,
    pub messages: Vec<ProviderMessage>,
    pub preamble: Option<String>,
    pub temperature: Option<f64>,
    pub max_tokens: Option<u64>,
    pub context_balance: Option<f64>,
    pub tools: Vec<String>,
    pub parallel_tool_calls: Option<bool>,
}

impl StreamRequest {
    pub fn new(
        provider_id: impl Into<String>,
        provider: ProviderConfig,
        messages: Vec<ProviderMessage>,
    ) -> Self {
        Self {
            provider_id: provider_id.into(),
            provider,
            messages,
            preamble: None,
            temperature: None,
            max_tokens: None,
            context_balance: None,
            tools: Vec::new(),
            parallel_tool_calls: None,
        }
    }

    pub fn model_id(&self) -> &str {
        self.provider.default_model.as_deref().unwrap_or(DEFAULT_MODEL)
    }

    pub fn with_preamble(mut self, preamble: impl Into<String>) -> Self {
        let preamble = preamble.into();
        self.preamble = (!preamble.trim().is_empty()).then_some(preamble);
        self
    }

    pub fn with_temperature(mut self, temperature: f64) -> Self {
        self.temperature = Some(temperature);
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u64) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }

    pub fn with_context_balance(mut self, context_balance: f64) -> Self {
        self.context_balance = Some(context_balance);
        self
    }

    pub fn with_tools(mut self, tools: Vec<String>, parallel_tool_calls: bool) -> Self {
        // Parallel calls only mean something when tools are offered at all.
        self.parallel_tool_calls = (!tools.is_empty()).then_some(parallel_tool_calls);
        self.tools = tools;
        self
    }
}

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;
pub type ChunkStream = BoxStream<'static, TransportResult<StreamChunk>>;
pub type ProviderResult<T> = Result<T, ProviderError>;
pub type TransportResult<T> = Result<T, TransportError>;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum ProviderError {
    #[snafu(display("missing API key for provider '{provider_id}'"))]
    MissingApiKey {
        stage: &'static str,
        provider_id: String,
    },
}

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum TransportError {
    #[snafu(display("failed to open stream for provider '{provider_id}' on `{stage}`: {details}"))]
    Open {
        stage: &'static str,
        provider_id: String,
        details: String,
    },
    #[snafu(display("provider '{provider_id}' is not usable on `{stage}`: {source}"))]
    Provider {
        stage: &'static str,
        provider_id: String,
        source: ProviderError,
    },
    #[snafu(display("stream failed on `{stage}`: {details}"))]
    Chunk {
        stage: &'static str,
        details: String,
    },
}

/// The external mechanism that turns a request into a chunk sequence.
///
/// Dropping the returned stream, or cancelling the token, asks the source to
/// stop producing.
pub trait ChunkSource: Send + Sync {
    fn id(&self) -> &str;

    fn open<'a>(
        &'a self,
        request: StreamRequest,
        cancel: CancellationToken,
    ) -> BoxFuture<'a, TransportResult<ChunkStream>>;
}

fn non_blank(value: Option<String>) -> Option<String> {
    value
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_provider_resolves_to_absent_fields() {
        let config = LlmConfig::default();
        let resolved = config.resolve("unknown-provider");
        assert_eq!(resolved, ProviderConfig::default());
        assert!(resolved.is_empty());
    }

    #[test]
    fn missing_key_fails_only_at_point_of_use() {
        let config = ProviderConfig::new(Some("   ".to_string()), Some("deepseek-chat".to_string()));
        assert_eq!(config.api_key, None);
        let error = config.require_api_key("deepseek").unwrap_err();
        assert!(matches!(error, ProviderError::MissingApiKey { .. }));

        let config = config.with_api_key("sk-test");
        assert_eq!(config.require_api_key("deepseek").unwrap(), "sk-test");
    }

    #[test]
    fn ensure_provider_keeps_existing_fields() {
        let mut config = LlmConfig::default();
        config.providers.insert(
            DEFAULT_PROVIDER_ID.to_string(),
            ProviderConfig::default().with_api_key("persisted"),
        );

        let seeded = config.ensure_provider(
            DEFAULT_PROVIDER_ID,
            ProviderConfig::new(Some("from-env".to_string()), Some(DEFAULT_MODEL.to_string())),
        );
        let entry = seeded.resolve(DEFAULT_PROVIDER_ID);
        assert_eq!(entry.api_key.as_deref(), Some("persisted"));
        assert_eq!(entry.default_model.as_deref(), Some(DEFAULT_MODEL));
    }

    #[test]
    fn config_wire_shape_omits_absent_fields() {
        let mut config = LlmConfig::default();
        config
            .providers
            .insert("openai".to_string(), ProviderConfig::default().with_default_model("gpt-4o"));

        let encoded = serde_json::to_value(&config).unwrap();
        assert_eq!(
            encoded,
            serde_json::json!({"providers": {"openai": {"defaultModel": "gpt-4o"}}})
        );

        let decoded: LlmConfig =
            serde_json::from_str(r#"{"providers":{"deepseek":{"apiKey":"k"}}}"#).unwrap();
        assert_eq!(decoded.resolve("deepseek").api_key.as_deref(), Some("k"));
        assert_eq!(decoded.active_provider_id("deepseek"), "deepseek");
    }

    #[test]
    fn tools_toggle_parallel_flag() {
        let request = StreamRequest::new("deepseek", ProviderConfig::default(), Vec::new())
            .with_tools(Vec::new(), false);
        assert_eq!(request.parallel_tool_calls, None);

        let request = request.with_tools(vec!["search".to_string()], false);
        assert_eq!(request.parallel_tool_calls, Some(false));
        assert_eq!(request.model_id(), DEFAULT_MODEL);
    }
}
