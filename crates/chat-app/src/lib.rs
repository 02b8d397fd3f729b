//! Client-side chat engine: sessions, one streamed reply per session at a
//! time, per-field configuration edits and persistence over a key-value store.
pub mod app;
pub mod chat;
pub mod database;
pub mod settings;
pub mod state;

pub use app::{AppError, AppResult, ChatApp};
