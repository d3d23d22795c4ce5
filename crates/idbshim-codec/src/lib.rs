//! idbshim-codec: pure codecs for the idbshim storage adaptation layer
//!
//! Nothing in this crate touches a backend. Both codecs are synchronous
//! function pairs driven by explicit configuration.
//!
//! ## Key Components
//!
//! - `identifier`: reversible escaping of database/store/index names into
//!   backend-safe identifiers
//! - `graph`: identity-preserving encoding of object graphs (shared and
//!   cyclic references) into a tree-shaped JSON form
//! - `sql`: quoting and `LIKE` escaping for escaped identifiers and values

mod error;
pub mod graph;
pub mod identifier;
pub mod sql;

pub use error::{CodecError, GraphError};
pub use graph::{ObjectRef, Value};
pub use identifier::{
    decode_identifier, encode_identifier, escape_database_name, escape_index_name,
    escape_nul, escape_store_name, unescape_database_name, unescape_nul, CodecConfig,
    EscapePolicy, IdentifierKind, NameHooks, DEFAULT_LENGTH_LIMIT,
};

/// Result type for identifier codec operations
pub type CodecResult<T> = std::result::Result<T, CodecError>;

/// Result type for graph codec operations
pub type GraphResult<T> = std::result::Result<T, GraphError>;
