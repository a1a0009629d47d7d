//! Error taxonomy for the Agentcell workspace.
//!
//! Four failure classes flow through the system, each with a distinct fate:
//! validation and not-found errors map straight to 4xx responses, handler
//! execution failures are interpreted by the lifecycle manager (retry or
//! fail, never surfaced raw), and storage errors propagate to the route
//! layer as 500s.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    /// A request was missing a required field or carried a malformed value.
    /// No state is mutated when this is returned.
    #[error("{0}")]
    Validation(String),

    /// The addressed resource does not exist.
    #[error("{0}")]
    NotFound(String),

    /// A task handler failed. Consumed by the lifecycle manager's
    /// retry-or-fail decision; never reaches the HTTP layer directly.
    #[error("{0}")]
    Execution(String),

    /// The persistence layer itself failed.
    #[error("storage error: {0}")]
    Storage(String),

    /// Configuration could not be read or parsed.
    #[error("config error: {0}")]
    Config(String),
}

impl Error {
    /// HTTP status the gateway maps this error to.
    pub fn status_code(&self) -> u16 {
        match self {
            Error::Validation(_) => 400,
            Error::NotFound(_) => 404,
            Error::Execution(_) | Error::Storage(_) | Error::Config(_) => 500,
        }
    }
}

impl From<rusqlite::Error> for Error {
    fn from(e: rusqlite::Error) -> Self {
        Error::Storage(e.to_string())
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Storage(e.to_string())
    }
}
