pub mod app_config;
pub mod error;
pub mod loading;
pub mod model;
pub mod providers;
pub mod state;

pub use app_config::AppConfig;
pub use error::{SettingsError, SettingsResult};
pub use loading::{LoadGuard, LoadingTracker, ModelLoadingState};
pub use model::{ModelConfig, ModelLoadingKey};
pub use providers::ProviderRegistry;
pub use state::ModelConfigStore;
