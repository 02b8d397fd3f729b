use snafu::Snafu;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum StorageError {
    #[snafu(display("storage backend failed on `{stage}` for key '{key}': {details}"))]
    Backend {
        stage: &'static str,
        key: String,
        details: String,
    },
    #[snafu(display("storage key '{raw}' does not belong to the key scheme"))]
    InvalidKey { stage: &'static str, raw: String },
    #[snafu(display("storage id '{raw}' is invalid for {id_type}"))]
    InvalidId {
        stage: &'static str,
        id_type: &'static str,
        raw: String,
        source: uuid::Error,
    },
    #[snafu(display("failed to serialize value for key '{key}' on `{stage}`: {source}"))]
    SerializeValue {
        stage: &'static str,
        key: String,
        source: serde_json::Error,
    },
    #[snafu(display("failed to deserialize value stored at key '{key}' on `{stage}`: {source}"))]
    DeserializeValue {
        stage: &'static str,
        key: String,
        source: serde_json::Error,
    },
    #[snafu(display("failed to create sqlite directory at {path}"))]
    CreateSqliteDirectory {
        stage: &'static str,
        path: String,
        source: std::io::Error,
    },
    #[snafu(display("failed to parse sqlite connection URL '{database_url}'"))]
    SqliteConnectOptions {
        stage: &'static str,
        database_url: String,
        source: sqlx::Error,
    },
    #[snafu(display("failed to connect sqlite database '{database_url}'"))]
    SqliteConnect {
        stage: &'static str,
        database_url: String,
        source: sqlx::Error,
    },
    #[snafu(display("failed to run sqlite migrations"))]
    SqliteMigrate {
        stage: &'static str,
        source: sqlx::migrate::MigrateError,
    },
    #[snafu(display("sqlite query failed at {stage} for key '{key}': {source}"))]
    SqliteQuery {
        stage: &'static str,
        key: String,
        source: sqlx::Error,
    },
}

pub type StorageResult<T> = Result<T, StorageError>;
