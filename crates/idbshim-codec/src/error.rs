//! Error types for idbshim-codec

use thiserror::Error;

/// Errors raised by the identifier codec
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    /// Encoded identifier reached the configured length limit
    #[error(
        "Unexpectedly long name supplied; passed length: {length}; length limit setting: {limit}"
    )]
    NameTooLong { length: usize, limit: usize },

    /// Identifier is not a well-formed escaped name
    #[error("Malformed identifier at position {position}: {reason}")]
    MalformedIdentifier { position: usize, reason: String },

    /// Decoded name contains unpaired surrogates and cannot be a `String`
    #[error("Decoded name is not valid UTF-16")]
    InvalidUtf16,
}

/// Errors raised by the graph codec
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GraphError {
    /// A `@ref` marker names an id that was never registered
    #[error("Reference to unknown surrogate id: {0}")]
    UnknownReference(String),

    /// A `@id`/`@ref` marker holds something other than a string or number
    #[error("Surrogate id must be a string or number, got: {0}")]
    InvalidSurrogateId(String),

    /// Text form could not be produced or parsed
    #[error("Graph JSON failed: {0}")]
    Json(String),
}

impl From<serde_json::Error> for GraphError {
    fn from(err: serde_json::Error) -> Self {
        GraphError::Json(err.to_string())
    }
}
