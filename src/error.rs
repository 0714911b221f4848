use thiserror::Error;

#[derive(Error, Debug)]
pub enum DispatchError {
    #[error("Invalid input: {0}")]
    Validation(String),

    #[error("{0} not found: {1}")]
    NotFound(&'static str, String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Unavailable: {0}")]
    Unavailable(String),

    #[error("No default queue configured")]
    NoDefaultQueue,

    #[error("Job is not cancellable in its current state")]
    NotCancellable,

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Fatal: {0}")]
    Fatal(String),
}

impl DispatchError {
    pub fn validation(msg: impl Into<String>) -> Self {
        DispatchError::Validation(msg.into())
    }

    pub fn conflict(msg: impl Into<String>) -> Self {
        DispatchError::Conflict(msg.into())
    }

    pub fn not_found(kind: &'static str, key: impl std::fmt::Display) -> Self {
        DispatchError::NotFound(kind, key.to_string())
    }

    /// True for errors the dispatcher treats as recoverable: the job goes
    /// back to Pending and dispatch is retried later.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            DispatchError::Transport(_) | DispatchError::Unavailable(_)
        )
    }
}

impl From<reqwest::Error> for DispatchError {
    fn from(e: reqwest::Error) -> Self {
        DispatchError::Transport(e.to_string())
    }
}

impl From<sqlx::Error> for DispatchError {
    fn from(e: sqlx::Error) -> Self {
        DispatchError::Storage(e.to_string())
    }
}

impl From<serde_json::Error> for DispatchError {
    fn from(e: serde_json::Error) -> Self {
        DispatchError::Validation(format!("bad JSON payload: {e}"))
    }
}

pub type Result<T> = std::result::Result<T, DispatchError>;
