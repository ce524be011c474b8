use tokio::sync::oneshot;

use player_stats::{StatField, StatisticsRecord};

use crate::backend::BackendType;
use crate::error::PersistenceError;
use crate::lifecycle::{BackupDescriptor, Diagnostics, SaveOutcome};
use crate::queue::DrainReport;
use crate::row::StatsEntry;

#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    #[error("Persistence supervisor is not running")]
    Closed,
    #[error(transparent)]
    Persistence(#[from] PersistenceError),
}

type Reply<T> = oneshot::Sender<Result<T, PersistenceError>>;

/// Commands sent to the supervisor. Each embeds a oneshot for the reply.
pub enum SupervisorCommand {
    Initialize {
        backend: BackendType,
        database: String,
        connection_string: Option<String>,
        reply: Reply<()>,
    },
    InitializeBestSettings {
        player_estimate: Option<u32>,
        reply: Reply<BackendType>,
    },
    InitializeFromConfig {
        reply: Reply<BackendType>,
    },
    Save {
        external_id: String,
        display_name: String,
        record: StatisticsRecord,
        priority: i32,
        reply: oneshot::Sender<SaveOutcome>,
    },
    Load {
        external_id: String,
        reply: Reply<StatisticsRecord>,
    },
    Delete {
        external_id: String,
        reply: Reply<bool>,
    },
    GetAll {
        reply: Reply<Vec<StatsEntry>>,
    },
    GetTopN {
        limit: usize,
        field: StatField,
        reply: Reply<Vec<StatsEntry>>,
    },
    Backup {
        reply: Reply<Option<BackupDescriptor>>,
    },
    ListBackups {
        reply: Reply<Vec<BackupDescriptor>>,
    },
    Restore {
        name: String,
        reply: Reply<()>,
    },
    Drain {
        reply: oneshot::Sender<DrainReport>,
    },
    RequeueDeadLetters {
        reply: oneshot::Sender<usize>,
    },
    Diagnostics {
        reply: oneshot::Sender<Diagnostics>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}
