use natter_storage::StorageError;
use snafu::Snafu;

pub type SettingsResult<T> = Result<T, SettingsError>;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum SettingsError {
    #[snafu(display("invalid value for `{field}` on `{stage}`: {details}"))]
    Validation {
        stage: &'static str,
        field: &'static str,
        details: String,
    },
    #[snafu(display("failed to persist settings on `{stage}`: {source}"))]
    Storage {
        stage: &'static str,
        source: StorageError,
    },
    #[snafu(display("failed to load application config on `{stage}`: {source}"))]
    LoadAppConfig {
        stage: &'static str,
        #[snafu(source(from(figment::Error, Box::new)))]
        source: Box<figment::Error>,
    },
}
