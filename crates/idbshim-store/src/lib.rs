//! idbshim-store: IndexedDB-style object stores over SQLite
//!
//! This crate keeps object stores, secondary indexes and versioned schemas
//! in relational tables. Record values are object graphs stored in the
//! identity-preserving JSON form of `idbshim-codec`; keys use an
//! order-preserving text encoding so the backend can sort and compare them.
//!
//! ## Layer 1 - Persistence adaptation
//!
//! Focus: consistency between index metadata and physical columns, serial
//! transactions, orderly connection shutdown.
//!
//! ## Key Components
//!
//! - `Factory`: opens databases, runs version-change upgrades
//! - `Connection`: schema cache, transactions, close/force-close lifecycle
//! - `Transaction`: FIFO operation queue with commit/abort
//! - `ObjectStore` / `Index`: record writes, index creation/backfill, lookups
//! - `SqlBackend`: backend boundary, implemented by `SqliteBackend`

pub mod backend;
pub mod config;
mod connection;
mod error;
mod factory;
pub mod fakes;
mod index;
pub mod keys;
pub mod migrations;
mod schema;
mod sqlite;
mod store;
pub mod telemetry;
mod transaction;

pub use backend::{BackendResult, Row, Rows, SqlBackend, SqlValue};
pub use config::{Config, ConfigHandle};
pub use connection::{Connection, ConnectionState};
pub use error::{BackendError, ErrorKind, ShimError};
pub use factory::{Factory, UpgradeContext};
pub use index::Index;
pub use keys::{Key, KeyPath, KeyQuery, KeyRange};
pub use schema::{IndexOptions, IndexRecord, StoreOptions};
pub use sqlite::SqliteBackend;
pub use store::ObjectStore;
pub use transaction::{Request, Transaction, TransactionMode, TransactionOutcome};

pub use idbshim_codec::{ObjectRef, Value};

/// Result type for idbshim-store operations
pub type ShimResult<T> = std::result::Result<T, ShimError>;
