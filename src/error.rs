//! SymSync Error Types

use thiserror::Error;

/// Result type alias for SymSync operations
pub type Result<T> = std::result::Result<T, Error>;

/// SymSync error types
#[derive(Error, Debug)]
pub enum Error {
    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid configuration file: {0}")]
    ConfigParse(#[from] toml::de::Error),

    // Protocol errors
    #[error("Protocol error at line {line}: {message}")]
    Protocol { line: u64, message: String },

    #[error("Unknown data event type code: {0}")]
    UnknownEventType(String),

    // Storage errors
    #[error("Storage error [state={sql_state}, code={sql_code}]: {message}")]
    Storage {
        sql_state: String,
        sql_code: i32,
        message: String,
    },

    #[error("Unsupported column type '{type_name}' for {table}.{column}")]
    UnsupportedColumnType {
        table: String,
        column: String,
        type_name: String,
    },

    #[error("Not found: {0}")]
    NotFound(String),

    // Transport errors
    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Connection failed to {url}: {reason}")]
    ConnectionFailed { url: String, reason: String },

    #[error("Authentication failed with {0}")]
    AuthenticationFailed(String),

    #[error("Synchronization is disabled on {0}")]
    SyncDisabled(String),

    #[error("Remote node {0} is busy")]
    ConnectionRejected(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // Internal errors
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Shutdown in progress")]
    ShuttingDown,
}

impl Error {
    /// Check if this error is retryable on the next job cycle
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::Transport(_)
                | Error::ConnectionFailed { .. }
                | Error::ConnectionRejected(_)
                | Error::Io(_)
        )
    }

    /// SQL state, code and message for errors that get recorded on a batch
    pub fn sql_details(&self) -> (Option<String>, i32, String) {
        match self {
            Error::Storage {
                sql_state,
                sql_code,
                message,
            } => (Some(sql_state.clone()), *sql_code, message.clone()),
            other => (None, 0, other.to_string()),
        }
    }

    /// Build a protocol error for the given line
    pub fn protocol(line: u64, message: impl Into<String>) -> Self {
        Error::Protocol {
            line,
            message: message.into(),
        }
    }

    /// Check if this storage error is a unique or primary key violation
    pub fn is_unique_violation(&self) -> bool {
        match self {
            Error::Storage { sql_code, .. } => {
                *sql_code == rusqlite::ffi::SQLITE_CONSTRAINT_PRIMARYKEY
                    || *sql_code == rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE
            }
            _ => false,
        }
    }
}

impl From<rusqlite::Error> for Error {
    fn from(e: rusqlite::Error) -> Self {
        match &e {
            rusqlite::Error::SqliteFailure(failure, message) => Error::Storage {
                sql_state: format!("{:?}", failure.code),
                sql_code: failure.extended_code,
                message: message.clone().unwrap_or_else(|| e.to_string()),
            },
            _ => Error::Storage {
                sql_state: "HY000".to_string(),
                sql_code: 0,
                message: e.to_string(),
            },
        }
    }
}

impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Self {
        if e.is_connect() || e.is_timeout() {
            Error::ConnectionFailed {
                url: e
                    .url()
                    .map(|u| u.to_string())
                    .unwrap_or_else(|| "<unknown>".to_string()),
                reason: e.to_string(),
            }
        } else {
            Error::Transport(e.to_string())
        }
    }
}
