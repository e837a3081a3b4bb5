// Crabgrass sync error types
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SyncError {
    /// Non-2xx response. `detail` is the server's `detail` field, or
    /// `HTTP {status}` when the body carried none.
    #[error("{detail}")]
    Http { status: u16, detail: String },

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Request timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Session destroyed")]
    Destroyed,
}

impl SyncError {
    pub fn status(&self) -> Option<u16> {
        match self {
            SyncError::Http { status, .. } => Some(*status),
            _ => None,
        }
    }
}

impl From<reqwest::Error> for SyncError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            return SyncError::Transport(format!("request timed out: {}", err));
        }
        SyncError::Transport(err.to_string())
    }
}

// Errors cross into listener payloads and CLI JSON output as plain strings.
impl serde::Serialize for SyncError {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

pub type Result<T> = std::result::Result<T, SyncError>;
