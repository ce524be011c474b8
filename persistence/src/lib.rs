//! Resilient persistence for per-player statistics.
//!
//! The [`LifecycleManager`] connects to a storage backend through a
//! [`Connector`], checks the schema and publishes its [`ConnectionState`].
//! The [`StatsRepository`] it builds does validated, transactional CRUD.
//! Writes that cannot happen right now wait in the [`PendingQueue`].
//! In a server the manager lives inside the supervisor task started by
//! [`spawn_supervisor`] and is driven through a [`StatsHandle`].

pub mod backend;
pub mod config;
pub mod driver;
pub mod error;
pub mod lifecycle;
pub mod queue;
pub mod rate_limit;
pub mod repository;
pub mod retry;
pub mod row;
pub mod supervisor;

pub use backend::{select_backend, BackendType, ConnectionParams, Location};
pub use config::PersistenceConfig;
pub use driver::{AnyDriver, Connector, DefaultConnector, DriverError, StorageDriver};
pub use error::{ErrorKind, PersistenceError};
pub use lifecycle::{
    BackupDescriptor, ConnectionState, Diagnostics, LifecycleManager, SaveOutcome,
    CURRENT_SCHEMA_VERSION,
};
pub use queue::{DrainReport, PendingOperation, PendingQueue, HIGH_PRIORITY, NORMAL_PRIORITY};
pub use repository::StatsRepository;
pub use retry::RetryPolicy;
pub use row::StatsEntry;
pub use supervisor::{spawn_supervisor, StatsHandle, SupervisorError};

use std::time::{SystemTime, UNIX_EPOCH};

fn since_epoch() -> std::time::Duration {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
}

/// Unix seconds, as stamped on stored rows.
pub fn now_timestamp() -> u64 {
    since_epoch().as_secs()
}

pub fn now_millis() -> u64 {
    since_epoch().as_millis() as u64
}
