use std::collections::BTreeSet;
use std::fmt;
use std::ops::RangeInclusive;

use serde::{Deserialize, Serialize};
use snafu::ensure;

use super::error::{SettingsResult, ValidationSnafu};

pub const DEFAULT_TEMPERATURE: f64 = 0.7;
pub const DEFAULT_MAX_TOKENS: u64 = 2000;
pub const DEFAULT_CONTEXT_BALANCE: f64 = 1.0;
pub const DEFAULT_SYSTEM_PROMPT: &str = "You are a helpful assistant.";

pub const TEMPERATURE_RANGE: RangeInclusive<f64> = 0.0..=2.0;
pub const CONTEXT_BALANCE_RANGE: RangeInclusive<f64> = 0.0..=1.0;
pub const MAX_SYSTEM_PROMPT_BYTES: usize = 32 * 1024;

/// User-editable generation parameters, persisted under `model_config`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ModelConfig {
    pub temperature: f64,
    pub max_tokens: u64,
    pub context_balance: f64,
    pub system_prompt: String,
    pub multi_tools_enabled: bool,
    pub enabled_tools: BTreeSet<String>,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            temperature: DEFAULT_TEMPERATURE,
            max_tokens: DEFAULT_MAX_TOKENS,
            context_balance: DEFAULT_CONTEXT_BALANCE,
            system_prompt: DEFAULT_SYSTEM_PROMPT.to_string(),
            multi_tools_enabled: false,
            enabled_tools: BTreeSet::new(),
        }
    }
}

impl ModelConfig {
    /// Repairs values a hand-edited or older record may carry.
    pub fn normalized(mut self) -> Self {
        if !TEMPERATURE_RANGE.contains(&self.temperature) {
            self.temperature = DEFAULT_TEMPERATURE;
        }
        if !CONTEXT_BALANCE_RANGE.contains(&self.context_balance) {
            self.context_balance = DEFAULT_CONTEXT_BALANCE;
        }
        if self.max_tokens == 0 {
            self.max_tokens = DEFAULT_MAX_TOKENS;
        }
        self.enabled_tools.retain(|tool| !tool.trim().is_empty());
        self
    }

    pub fn tools(&self) -> Vec<String> {
        self.enabled_tools.iter().cloned().collect()
    }
}

/// Configuration fields that can be independently mid-save.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ModelLoadingKey {
    Temperature,
    ContextBalance,
    SystemPrompt,
    MultiTools,
    EnabledTools,
}

impl ModelLoadingKey {
    pub const ALL: [Self; 5] = [
        Self::Temperature,
        Self::ContextBalance,
        Self::SystemPrompt,
        Self::MultiTools,
        Self::EnabledTools,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Temperature => "temperature",
            Self::ContextBalance => "contextBalance",
            Self::SystemPrompt => "systemPrompt",
            Self::MultiTools => "multiTools",
            Self::EnabledTools => "enabledTools",
        }
    }
}

impl fmt::Display for ModelLoadingKey {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter.write_str(self.as_str())
    }
}

pub fn validate_temperature(value: f64) -> SettingsResult<f64> {
    ensure!(
        TEMPERATURE_RANGE.contains(&value),
        ValidationSnafu {
            stage: "validate-temperature",
            field: "temperature",
            details: format!("{value} is outside 0.0..=2.0"),
        }
    );
    Ok(value)
}

pub fn validate_context_balance(value: f64) -> SettingsResult<f64> {
    ensure!(
        CONTEXT_BALANCE_RANGE.contains(&value),
        ValidationSnafu {
            stage: "validate-context-balance",
            field: "contextBalance",
            details: format!("{value} is outside 0.0..=1.0"),
        }
    );
    Ok(value)
}

pub fn validate_max_tokens(value: u64) -> SettingsResult<u64> {
    ensure!(
        value > 0,
        ValidationSnafu {
            stage: "validate-max-tokens",
            field: "maxTokens",
            details: "must be greater than zero".to_string(),
        }
    );
    Ok(value)
}

pub fn validate_system_prompt(value: String) -> SettingsResult<String> {
    ensure!(
        value.len() <= MAX_SYSTEM_PROMPT_BYTES,
        ValidationSnafu {
            stage: "validate-system-prompt",
            field: "systemPrompt",
            details: format!(
                "{} bytes exceeds the {MAX_SYSTEM_PROMPT_BYTES} byte limit",
                value.len()
            ),
        }
    );
    Ok(value)
}

pub fn validate_tool_id(value: &str) -> SettingsResult<String> {
    let trimmed = value.trim();
    ensure!(
        !trimmed.is_empty(),
        ValidationSnafu {
            stage: "validate-tool-id",
            field: "enabledTools",
            details: "tool id must not be empty".to_string(),
        }
    );
    Ok(trimmed.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::settings::error::SettingsError;

    #[test]
    fn defaults_match_the_shipped_profile() {
        let config = ModelConfig::default();
        assert_eq!(config.temperature, 0.7);
        assert_eq!(config.max_tokens, 2000);
        assert_eq!(config.context_balance, 1.0);
        assert_eq!(config.system_prompt, "You are a helpful assistant.");
        assert!(!config.multi_tools_enabled);
        assert!(config.enabled_tools.is_empty());
    }

    #[test]
    fn wire_shape_is_camel_case_and_tolerates_missing_fields() {
        let encoded = serde_json::to_value(ModelConfig::default()).unwrap();
        assert_eq!(encoded["maxTokens"], 2000);
        assert_eq!(encoded["multiToolsEnabled"], false);
        assert_eq!(encoded["enabledTools"], serde_json::json!([]));

        let decoded: ModelConfig =
            serde_json::from_str(r#"{"temperature":1.2,"enabledTools":["search"]}"#).unwrap();
        assert_eq!(decoded.temperature, 1.2);
        assert_eq!(decoded.max_tokens, DEFAULT_MAX_TOKENS);
        assert!(decoded.enabled_tools.contains("search"));
    }

    #[test]
    fn normalization_repairs_out_of_range_values() {
        let config = ModelConfig {
            temperature: 9.0,
            context_balance: -1.0,
            max_tokens: 0,
            enabled_tools: BTreeSet::from([" ".to_string(), "code".to_string()]),
            ..ModelConfig::default()
        }
        .normalized();

        assert_eq!(config.temperature, DEFAULT_TEMPERATURE);
        assert_eq!(config.context_balance, DEFAULT_CONTEXT_BALANCE);
        assert_eq!(config.max_tokens, DEFAULT_MAX_TOKENS);
        assert_eq!(config.tools(), vec!["code".to_string()]);
    }

    #[test]
    fn validators_reject_bad_input() {
        assert!(validate_temperature(2.0).is_ok());
        assert!(matches!(
            validate_temperature(2.5),
            Err(SettingsError::Validation { field: "temperature", .. })
        ));
        assert!(validate_temperature(f64::NAN).is_err());
        assert!(validate_context_balance(1.1).is_err());
        assert!(validate_max_tokens(0).is_err());
        assert!(validate_system_prompt("x".repeat(MAX_SYSTEM_PROMPT_BYTES + 1)).is_err());
        assert_eq!(validate_tool_id("  search ").unwrap(), "search");
        assert!(validate_tool_id("  ").is_err());
    }

    #[test]
    fn loading_keys_use_wire_names() {
        let names = ModelLoadingKey::ALL.map(ModelLoadingKey::as_str);
        assert_eq!(
            names,
            ["temperature", "contextBalance", "systemPrompt", "multiTools", "enabledTools"]
        );
    }
}
