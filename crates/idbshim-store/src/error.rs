//! Error types for idbshim-store

use std::fmt;

use idbshim_codec::{CodecError, GraphError};
use thiserror::Error;

/// Structured failure tag carried by request failures and abort
/// notifications.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Type,
    Syntax,
    Data,
    Constraint,
    NotFound,
    InvalidState,
    TransactionInactive,
    InvalidAccess,
    ReadOnly,
    Version,
    Abort,
    Unknown,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorKind::Type => "TypeError",
            ErrorKind::Syntax => "SyntaxError",
            ErrorKind::Data => "DataError",
            ErrorKind::Constraint => "ConstraintError",
            ErrorKind::NotFound => "NotFoundError",
            ErrorKind::InvalidState => "InvalidStateError",
            ErrorKind::TransactionInactive => "TransactionInactiveError",
            ErrorKind::InvalidAccess => "InvalidAccessError",
            ErrorKind::ReadOnly => "ReadOnlyError",
            ErrorKind::Version => "VersionError",
            ErrorKind::Abort => "AbortError",
            ErrorKind::Unknown => "UnknownError",
        };
        f.write_str(name)
    }
}

/// Errors surfaced by connections, transactions, stores and indexes
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ShimError {
    /// Invalid argument type or value
    #[error("{0}")]
    Type(String),

    /// Malformed key path
    #[error("{0}")]
    Syntax(String),

    /// Invalid or missing key
    #[error("{0}")]
    Data(String),

    /// Duplicate name or unique index violation
    #[error("{0}")]
    Constraint(String),

    /// Missing store or index
    #[error("{0}")]
    NotFound(String),

    /// Operation not allowed in the current connection/transaction state
    #[error("{0}")]
    InvalidState(String),

    /// Transaction already committed or aborted
    #[error("{0}")]
    TransactionInactive(String),

    /// Option combination not allowed
    #[error("{0}")]
    InvalidAccess(String),

    /// Write attempted in a read-only transaction
    #[error("{0}")]
    ReadOnly(String),

    /// Requested version lower than the stored one
    #[error("{0}")]
    Version(String),

    /// Transaction aborted
    #[error("{0}")]
    Abort(String),

    /// Backend query failed
    #[error("{context}: {message}")]
    Backend { context: String, message: String },

    /// Identifier could not be encoded or decoded
    #[error(transparent)]
    Codec(#[from] CodecError),

    /// Stored value could not be encoded or decoded
    #[error(transparent)]
    Graph(#[from] GraphError),
}

impl ShimError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ShimError::Type(_) => ErrorKind::Type,
            ShimError::Syntax(_) => ErrorKind::Syntax,
            ShimError::Data(_) | ShimError::Graph(_) => ErrorKind::Data,
            ShimError::Constraint(_) => ErrorKind::Constraint,
            ShimError::NotFound(_) => ErrorKind::NotFound,
            ShimError::InvalidState(_) => ErrorKind::InvalidState,
            ShimError::TransactionInactive(_) => ErrorKind::TransactionInactive,
            ShimError::InvalidAccess(_) => ErrorKind::InvalidAccess,
            ShimError::ReadOnly(_) => ErrorKind::ReadOnly,
            ShimError::Version(_) => ErrorKind::Version,
            ShimError::Abort(_) => ErrorKind::Abort,
            ShimError::Backend { .. } | ShimError::Codec(_) => ErrorKind::Unknown,
        }
    }

    /// Attach a diagnostic context to a backend failure.
    pub fn backend(context: impl Into<String>, err: BackendError) -> Self {
        ShimError::Backend {
            context: context.into(),
            message: err.message,
        }
    }
}

/// Failure reported by a [`crate::SqlBackend`]
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{message}")]
pub struct BackendError {
    pub message: String,
}

impl BackendError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl From<rusqlite::Error> for BackendError {
    fn from(err: rusqlite::Error) -> Self {
        BackendError::new(err.to_string())
    }
}

impl From<BackendError> for ShimError {
    fn from(err: BackendError) -> Self {
        ShimError::backend("Backend query failed", err)
    }
}

impl From<serde_json::Error> for ShimError {
    fn from(err: serde_json::Error) -> Self {
        ShimError::Graph(GraphError::from(err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backend_context_is_kept_in_message() {
        let err = ShimError::backend(
            "Could not create index \"byTag\"",
            BackendError::new("no such table: S_people"),
        );
        assert_eq!(err.kind(), ErrorKind::Unknown);
        assert_eq!(
            err.to_string(),
            "Could not create index \"byTag\": no such table: S_people"
        );
    }

    #[test]
    fn test_codec_errors_convert() {
        let err: ShimError = CodecError::NameTooLong {
            length: 254,
            limit: 254,
        }
        .into();
        assert!(matches!(err, ShimError::Codec(_)));
        assert!(err.to_string().contains("passed length: 254"));
    }

    #[test]
    fn test_kind_display_uses_dom_names() {
        assert_eq!(ShimError::Abort("x".into()).kind().to_string(), "AbortError");
        assert_eq!(ErrorKind::ReadOnly.to_string(), "ReadOnlyError");
    }
}
