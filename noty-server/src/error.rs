//! Error taxonomy shared by every component.
//!
//! Kinds map directly to the propagation policy in the spec's error handling
//! design: `NotFound`/`Validation` surface to request callers as 404/400
//! equivalents, `Conflict` drives leader-election outcome rather than failing
//! a caller, `Transport` is retried by the owning component, `External` is
//! captured per workflow step instead of aborting the event, and `Fatal`
//! aborts node startup.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("validation: {0}")]
    Validation(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("transport: {0}")]
    Transport(String),

    #[error("external collaborator failed: {0}")]
    External(String),

    #[error("fatal: {0}")]
    Fatal(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub fn not_found(what: impl Into<String>) -> Self {
        Error::NotFound(what.into())
    }

    pub fn validation(what: impl Into<String>) -> Self {
        Error::Validation(what.into())
    }

    /// `true` for the specific case the catalog adapter and leader election
    /// must distinguish from an ordinary write failure.
    pub fn is_unique_violation(&self) -> bool {
        matches!(self, Error::Conflict(_))
    }
}

impl From<rusqlite::Error> for Error {
    fn from(e: rusqlite::Error) -> Self {
        if is_unique_violation(&e) {
            Error::Conflict(e.to_string())
        } else {
            Error::Transport(e.to_string())
        }
    }
}

fn is_unique_violation(e: &rusqlite::Error) -> bool {
    matches!(
        e,
        rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error {
                code: rusqlite::ffi::ErrorCode::ConstraintViolation,
                ..
            },
            _,
        )
    )
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Transport(e.to_string())
    }
}

impl From<tera::Error> for Error {
    fn from(e: tera::Error) -> Self {
        Error::External(e.to_string())
    }
}

impl From<lettre::error::Error> for Error {
    fn from(e: lettre::error::Error) -> Self {
        Error::External(e.to_string())
    }
}

impl From<lettre::transport::smtp::Error> for Error {
    fn from(e: lettre::transport::smtp::Error) -> Self {
        Error::External(e.to_string())
    }
}

impl From<prost::DecodeError> for Error {
    fn from(e: prost::DecodeError) -> Self {
        Error::Validation(format!("malformed payload: {e}"))
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Validation(e.to_string())
    }
}
