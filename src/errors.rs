//! Error types shared across the application.

use std::fmt::{Display, Formatter};

/// Shared application result type.
pub type Result<T> = std::result::Result<T, AppError>;

/// Application error enumeration covering all domain failure modes.
#[derive(Debug)]
pub enum AppError {
    /// Configuration parsing or validation failure.
    Config(String),
    /// Persistence failure when interacting with `SQLite`.
    Db(String),
    /// Decision oracle returned an error or an unusable answer.
    Oracle(String),
    /// Outbound notifier failed to deliver a message.
    Transport(String),
    /// An oracle or notifier call exceeded its time budget.
    Timeout(String),
    /// A status change was rejected by the task transition table.
    InvalidTransition(String),
    /// Requested entity does not exist.
    NotFound(String),
    /// A uniqueness rule rejected the write (e.g. a second open task).
    Duplicate(String),
    /// The record changed between read and write; the caller may retry.
    Conflict(String),
    /// Caller supplied a malformed request.
    InvalidInput(String),
    /// Caller is not authorized to perform the requested action.
    Unauthorized(String),
    /// IPC communication failure.
    Ipc(String),
    /// HTTP listener failure.
    Http(String),
    /// File-system or I/O operation failure.
    Io(String),
}

impl AppError {
    /// Whether the error came from a collaborator call that may succeed on retry.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Oracle(_) | Self::Transport(_) | Self::Timeout(_))
    }
}

impl Display for AppError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Config(msg) => write!(f, "config: {msg}"),
            Self::Db(msg) => write!(f, "db: {msg}"),
            Self::Oracle(msg) => write!(f, "oracle: {msg}"),
            Self::Transport(msg) => write!(f, "transport: {msg}"),
            Self::Timeout(msg) => write!(f, "timeout: {msg}"),
            Self::InvalidTransition(msg) => write!(f, "invalid transition: {msg}"),
            Self::NotFound(msg) => write!(f, "not found: {msg}"),
            Self::Duplicate(msg) => write!(f, "duplicate: {msg}"),
            Self::Conflict(msg) => write!(f, "conflict: {msg}"),
            Self::InvalidInput(msg) => write!(f, "invalid input: {msg}"),
            Self::Unauthorized(msg) => write!(f, "unauthorized: {msg}"),
            Self::Ipc(msg) => write!(f, "ipc: {msg}"),
            Self::Http(msg) => write!(f, "http: {msg}"),
            Self::Io(msg) => write!(f, "io: {msg}"),
        }
    }
}

impl std::error::Error for AppError {}

impl From<toml::de::Error> for AppError {
    fn from(err: toml::de::Error) -> Self {
        Self::Config(format!("invalid config: {err}"))
    }
}

impl From<sqlx::Error> for AppError {
    fn from(err: sqlx::Error) -> Self {
        if let sqlx::Error::Database(ref db_err) = err {
            if db_err.is_unique_violation() {
                return Self::Duplicate(db_err.message().to_owned());
            }
        }
        Self::Db(err.to_string())
    }
}

impl From<reqwest::Error> for AppError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::Timeout(err.to_string())
        } else {
            Self::Transport(err.to_string())
        }
    }
}
