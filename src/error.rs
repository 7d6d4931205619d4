//! Error types for mxmda.
//!
//! Errors fall in two tiers. User errors (bad configuration, rejected
//! credentials, malformed identifiers, failed discovery) stop the process with a
//! single log line. Everything else happening inside the sync loop is logged by
//! the component that hit it and the loop keeps going.

use thiserror::Error;

use crate::matrix::ClientError;

#[derive(Error, Debug)]
pub enum Error {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("homeserver discovery for {domain} failed: {reason}")]
    Discovery { domain: String, reason: String },

    #[error("matrix authentication failed: {0}")]
    Authentication(String),

    #[error("invalid matrix identifier {0}")]
    InvalidIdentifier(String),

    #[error("failed to set up matrix client: {0}")]
    ClientSetup(String),

    #[error(transparent)]
    Client(#[from] ClientError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// Whether the operator caused this error and only needs the one-line message.
    pub fn is_user_error(&self) -> bool {
        matches!(
            self,
            Error::Config(_)
                | Error::Discovery { .. }
                | Error::Authentication(_)
                | Error::InvalidIdentifier(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, Error>;
