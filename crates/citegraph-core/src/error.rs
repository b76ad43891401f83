use rusqlite::ErrorCode;
use thiserror::Error;

/// All errors that can occur in citegraph-core.
#[derive(Debug, Error)]
pub enum GraphError {
    #[error("Invalid node identity: {0}")]
    InvalidIdentity(String),

    #[error("Invalid name for label or property: {0:?}")]
    InvalidName(String),

    #[error("Config error: {0}")]
    ConfigError(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("TOML serialize error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),
}

impl GraphError {
    /// True when the store itself cannot be reached, as opposed to a single
    /// rejected write. Callers halt the current cycle on these.
    pub fn is_unavailable(&self) -> bool {
        match self {
            Self::Database(rusqlite::Error::SqliteFailure(err, _)) => matches!(
                err.code,
                ErrorCode::CannotOpen
                    | ErrorCode::DatabaseBusy
                    | ErrorCode::DatabaseLocked
                    | ErrorCode::SystemIoFailure
                    | ErrorCode::NotADatabase
                    | ErrorCode::DatabaseCorrupt
                    | ErrorCode::ReadOnly
            ),
            Self::Io(_) => true,
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, GraphError>;
