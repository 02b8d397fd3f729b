use serde::{Deserialize, Serialize};

/// One unit of incremental output from a generation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum StreamChunk {
    /// Text to append to the assistant reply.
    Delta { content: String },
    /// Ephemeral status, e.g. a tool invocation in progress.
    Loading {
        message: String,
        /// Fraction complete in `[0, 1]`; `None` means indeterminate.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        progress: Option<f32>,
    },
}

impl StreamChunk {
    pub fn delta(content: impl Into<String>) -> Self {
        Self::Delta {
            content: content.into(),
        }
    }

    pub fn loading(message: impl Into<String>, progress: Option<f32>) -> Self {
        Self::Loading {
            message: message.into(),
            progress: normalize_progress(progress),
        }
    }
}

/// Clamps progress into `[0, 1]`, treating NaN as indeterminate.
pub fn normalize_progress(progress: Option<f32>) -> Option<f32> {
    progress
        .filter(|value| !value.is_nan())
        .map(|value| value.clamp(0.0, 1.0))
}
