use std::time::Duration;

use player_stats::RecordError;

use crate::driver::DriverError;
use crate::lifecycle::ConnectionState;

/// Coarse classification of a [`PersistenceError`], stable across the
/// concrete error payloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    ConnectionFailed,
    InitializationFailed,
    InvalidConfig,
    QueryFailed,
    Timeout,
    PermissionDenied,
    DatabaseCorrupted,
    DiskFull,
    InvalidOperation,
    ConnectionLost,
    RecoveryFailed,
    BackupFailed,
    SchemaMismatch,
    DataValidationFailed,
    RateLimitExceeded,
    TransactionFailed,
    NotReady,
    QueueFull,
}

/// Errors surfaced by the persistence subsystem.
#[derive(Debug, thiserror::Error)]
pub enum PersistenceError {
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),
    #[error("Initialization failed: {0}")]
    InitializationFailed(String),
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
    #[error("Query failed: {0}")]
    QueryFailed(#[from] DriverError),
    #[error("Timed out after {0:?}")]
    Timeout(Duration),
    #[error("Permission denied: {0}")]
    PermissionDenied(String),
    #[error("Database corrupted: {0}")]
    DatabaseCorrupted(String),
    #[error("Disk full: {0}")]
    DiskFull(String),
    #[error("Invalid operation: {0}")]
    InvalidOperation(String),
    #[error("Connection lost: {0}")]
    ConnectionLost(String),
    #[error("Recovery failed after {attempts} attempts: {reason}")]
    RecoveryFailed { attempts: u32, reason: String },
    #[error("Backup failed: {0}")]
    BackupFailed(String),
    #[error("Schema version {stored} is incompatible with expected {expected}")]
    SchemaMismatch { stored: u32, expected: u32 },
    #[error("Data validation failed: {0}")]
    DataValidationFailed(#[from] RecordError),
    #[error("Rate limit of {limit} operations per second exceeded")]
    RateLimitExceeded { limit: u32 },
    #[error("Transaction failed: {0}")]
    TransactionFailed(String),
    #[error("Persistence is not ready (state: {0})")]
    NotReady(ConnectionState),
    #[error("Pending queue is full ({capacity} operations)")]
    QueueFull { capacity: usize },
}

impl PersistenceError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            PersistenceError::ConnectionFailed(_) => ErrorKind::ConnectionFailed,
            PersistenceError::InitializationFailed(_) => ErrorKind::InitializationFailed,
            PersistenceError::InvalidConfig(_) => ErrorKind::InvalidConfig,
            PersistenceError::QueryFailed(_) => ErrorKind::QueryFailed,
            PersistenceError::Timeout(_) => ErrorKind::Timeout,
            PersistenceError::PermissionDenied(_) => ErrorKind::PermissionDenied,
            PersistenceError::DatabaseCorrupted(_) => ErrorKind::DatabaseCorrupted,
            PersistenceError::DiskFull(_) => ErrorKind::DiskFull,
            PersistenceError::InvalidOperation(_) => ErrorKind::InvalidOperation,
            PersistenceError::ConnectionLost(_) => ErrorKind::ConnectionLost,
            PersistenceError::RecoveryFailed { .. } => ErrorKind::RecoveryFailed,
            PersistenceError::BackupFailed(_) => ErrorKind::BackupFailed,
            PersistenceError::SchemaMismatch { .. } => ErrorKind::SchemaMismatch,
            PersistenceError::DataValidationFailed(_) => ErrorKind::DataValidationFailed,
            PersistenceError::RateLimitExceeded { .. } => ErrorKind::RateLimitExceeded,
            PersistenceError::TransactionFailed(_) => ErrorKind::TransactionFailed,
            PersistenceError::NotReady(_) => ErrorKind::NotReady,
            PersistenceError::QueueFull { .. } => ErrorKind::QueueFull,
        }
    }

    /// Whether re-running the lifecycle (recovery) could plausibly fix this.
    /// Configuration and permission problems need an operator instead.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::ConnectionFailed
                | ErrorKind::ConnectionLost
                | ErrorKind::Timeout
                | ErrorKind::QueryFailed
                | ErrorKind::InitializationFailed
        )
    }
}

/// Map a filesystem error onto the error taxonomy.
pub(crate) fn classify_io(context: &str, err: &std::io::Error) -> PersistenceError {
    // ENOSPC on unix, ERROR_DISK_FULL on windows.
    const DISK_FULL_CODES: [i32; 2] = [28, 112];

    if err.kind() == std::io::ErrorKind::PermissionDenied {
        return PersistenceError::PermissionDenied(format!("{context}: {err}"));
    }
    if err
        .raw_os_error()
        .is_some_and(|code| DISK_FULL_CODES.contains(&code))
    {
        return PersistenceError::DiskFull(format!("{context}: {err}"));
    }
    PersistenceError::InitializationFailed(format!("{context}: {err}"))
}
