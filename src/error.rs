//! Error types for welfare-chat-sync

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Network error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Request timed out after {0}s")]
    Timeout(u64),

    #[error("HTTP {status}: {message}")]
    Status { status: u16, message: String },

    #[error("Empty response from server")]
    EmptyBody,

    #[error("Invalid JSON response: {0}")]
    InvalidJson(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("User not logged in")]
    NotLoggedIn,

    #[error("Admin role required")]
    AdminRequired,

    #[error("Message is empty")]
    EmptyMessage,

    #[error("Config error: {0}")]
    Config(String),
}

impl Error {
    /// True for failures at the webhook boundary (network, timeout, status, body)
    pub fn is_fetch_failure(&self) -> bool {
        matches!(
            self,
            Error::Http(_)
                | Error::Timeout(_)
                | Error::Status { .. }
                | Error::EmptyBody
                | Error::InvalidJson(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::Status {
            status: 502,
            message: "Bad gateway".to_string(),
        };
        assert!(err.to_string().contains("502"));
        assert!(err.to_string().contains("Bad gateway"));
    }

    #[test]
    fn test_error_from_io() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err: Error = io_err.into();
        assert!(matches!(err, Error::Io(_)));
        assert!(!err.is_fetch_failure());
    }

    #[test]
    fn test_fetch_failures() {
        assert!(Error::Timeout(30).is_fetch_failure());
        assert!(Error::EmptyBody.is_fetch_failure());
        assert!(Error::InvalidJson("eof".into()).is_fetch_failure());
        assert!(!Error::NotLoggedIn.is_fetch_failure());
        assert!(!Error::Config("bad".into()).is_fetch_failure());
    }
}
