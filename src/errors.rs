//! Internal error taxonomy, distinct from the wire-visible ACME problems.
//!
//! These never reach a client directly; the HTTP edge classifies them and
//! renders either a specific problem (storage `NotFound` on a lookup path)
//! or `serverInternal`.

use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum Error {
    #[error("NotFound :: {0}")]
    NotFound(String),
    #[error("NotImplemented :: {0}")]
    NotImplemented(String),
    #[error("Timeout :: a subrequest timed out")]
    Timeout,
    #[error("Unknown :: {0}")]
    Unknown(String),
}

impl Error {
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound(_))
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Error::Timeout)
    }

    pub fn unknown(err: impl std::fmt::Display) -> Self {
        Error::Unknown(format!("a deeper error occured: {}", err))
    }
}
