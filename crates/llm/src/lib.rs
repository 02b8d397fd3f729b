//! Seam between the chat engine and whatever produces model output.
//!
//! The engine only sees [`ChunkSource`]: a request goes in, a cancellable
//! sequence of [`StreamChunk`]s comes out.
mod chunk;
mod provider;
mod scripted;

pub use chunk::{StreamChunk, normalize_progress};
pub use provider::{
    BoxFuture, ChunkSource, ChunkStream, DEFAULT_MODEL, DEFAULT_PROVIDER_ID, LlmConfig,
    ProviderConfig, ProviderError, ProviderMessage, ProviderResult, Role, StreamRequest,
    TransportError, TransportResult,
};
pub use scripted::{SCRIPTED_SOURCE_ID, ScriptStep, ScriptedSource};
