//! Storage driver contract and the built-in drivers.
//!
//! A driver is a single logical connection to one database. It executes
//! typed [`Query`] values, supports one connection-level transaction at a
//! time, and can compact its storage. The lifecycle manager obtains drivers
//! through a [`Connector`], so tests can swap in a scripted driver.
//!
//! Methods return `impl Future + Send` rather than using `async fn` so that
//! the futures stay `Send` for `tokio::spawn`.
//!
//! | Driver | Backend types |
//! |--------|---------------|
//! | [`JsonFileDriver`] | `embedded-file-json` |
//! | [`BinaryFileDriver`] | `embedded-file-binary` |
//! | [`SqliteDriver`] | `remote-relational-a`, `remote-relational-b` with a `sqlite:` URL |

mod any;
mod binary_file;
mod json_file;
#[cfg(any(test, feature = "mock"))]
mod scripted;
mod sqlite;
mod staging;

pub use any::{AnyDriver, DefaultConnector};
pub use binary_file::BinaryFileDriver;
pub use json_file::JsonFileDriver;
#[cfg(any(test, feature = "mock"))]
pub use scripted::{ScriptedConnector, ScriptedDriver};
pub use sqlite::SqliteDriver;

use std::fmt;
use std::future::Future;

use player_stats::StatField;

use crate::backend::ConnectionParams;
use crate::row::StatsRow;

/// Errors raised by a driver. Whether an error is worth retrying is decided
/// by [`DriverError::is_transient`].
#[derive(Debug, thiserror::Error)]
pub enum DriverError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Binary encoding error: {0}")]
    Encoding(#[from] bitcode::Error),
    #[error("Database error: {0}")]
    Sqlx(#[from] sqlx::Error),
    #[error("Driver is not connected")]
    NotConnected,
    #[error("No transaction in progress")]
    NoTransaction,
    #[error("A transaction is already in progress")]
    TransactionActive,
    #[error("Row already exists: {0}")]
    Duplicate(String),
    #[error("Row not found: {0}")]
    Missing(String),
    #[error("Driver returned {got} for a {expected} query")]
    UnexpectedOutput {
        expected: &'static str,
        got: &'static str,
    },
    #[error("Unsupported: {0}")]
    Unsupported(String),
    #[error("Corrupt storage: {0}")]
    Corrupt(String),
    #[error("{0}")]
    Other(String),
}

impl DriverError {
    /// Transient errors may succeed on a later attempt; the rest are
    /// deterministic and retrying them only wastes time.
    pub fn is_transient(&self) -> bool {
        !matches!(
            self,
            DriverError::Duplicate(_)
                | DriverError::Missing(_)
                | DriverError::UnexpectedOutput { .. }
                | DriverError::Unsupported(_)
                | DriverError::Corrupt(_)
                | DriverError::NoTransaction
                | DriverError::TransactionActive
        )
    }
}

/// A typed command for a driver.
#[derive(Debug, Clone, PartialEq)]
pub enum Query {
    /// Trivial round trip used to verify connectivity.
    Ping,
    ReadSchemaVersion,
    WriteSchemaVersion(u32),
    CreateSchema,
    FindStats { external_id: String },
    InsertStats(StatsRow),
    UpdateStats(StatsRow),
    DeleteStats { external_id: String },
    ListStats,
    TopStats { field: StatField, limit: usize },
}

impl Query {
    pub fn label(&self) -> &'static str {
        match self {
            Query::Ping => "ping",
            Query::ReadSchemaVersion => "read_schema_version",
            Query::WriteSchemaVersion(_) => "write_schema_version",
            Query::CreateSchema => "create_schema",
            Query::FindStats { .. } => "find_stats",
            Query::InsertStats(_) => "insert_stats",
            Query::UpdateStats(_) => "update_stats",
            Query::DeleteStats { .. } => "delete_stats",
            Query::ListStats => "list_stats",
            Query::TopStats { .. } => "top_stats",
        }
    }
}

impl fmt::Display for Query {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Result of executing a [`Query`].
#[derive(Debug, Clone, PartialEq)]
pub enum QueryOutput {
    Ack,
    Version(u32),
    Row(Option<StatsRow>),
    Rows(Vec<StatsRow>),
    Affected(u64),
}

impl QueryOutput {
    fn variant(&self) -> &'static str {
        match self {
            QueryOutput::Ack => "ack",
            QueryOutput::Version(_) => "version",
            QueryOutput::Row(_) => "row",
            QueryOutput::Rows(_) => "rows",
            QueryOutput::Affected(_) => "affected",
        }
    }

    pub fn into_version(self) -> Result<u32, DriverError> {
        match self {
            QueryOutput::Version(v) => Ok(v),
            other => Err(other.unexpected("version")),
        }
    }

    pub fn into_row(self) -> Result<Option<StatsRow>, DriverError> {
        match self {
            QueryOutput::Row(row) => Ok(row),
            other => Err(other.unexpected("row")),
        }
    }

    pub fn into_rows(self) -> Result<Vec<StatsRow>, DriverError> {
        match self {
            QueryOutput::Rows(rows) => Ok(rows),
            other => Err(other.unexpected("rows")),
        }
    }

    pub fn into_affected(self) -> Result<u64, DriverError> {
        match self {
            QueryOutput::Affected(n) => Ok(n),
            other => Err(other.unexpected("affected")),
        }
    }

    fn unexpected(&self, expected: &'static str) -> DriverError {
        DriverError::UnexpectedOutput {
            expected,
            got: self.variant(),
        }
    }
}

/// One open connection to a storage backend.
pub trait StorageDriver: Send + Sync + 'static {
    fn execute(
        &self,
        query: Query,
    ) -> impl Future<Output = Result<QueryOutput, DriverError>> + Send;

    /// Start a connection-level transaction. Writes are invisible to other
    /// readers of the backend until [`StorageDriver::commit`].
    fn begin_transaction(&self) -> impl Future<Output = Result<(), DriverError>> + Send;
    fn commit(&self) -> impl Future<Output = Result<(), DriverError>> + Send;
    fn rollback(&self) -> impl Future<Output = Result<(), DriverError>> + Send;

    fn is_connected(&self) -> bool;

    /// Compact or optimize the underlying storage. Returns false on failure.
    fn optimize_storage(&self) -> impl Future<Output = bool> + Send;

    fn close(&self) -> impl Future<Output = Result<(), DriverError>> + Send;
}

/// Opens drivers for a set of connection parameters.
pub trait Connector: Send + Sync + 'static {
    type Driver: StorageDriver;

    fn connect(
        &self,
        params: &ConnectionParams,
    ) -> impl Future<Output = Result<Self::Driver, DriverError>> + Send;
}
