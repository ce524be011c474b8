use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;

use player_stats::{StatField, StatisticsRecord};

use super::commands::*;
use crate::backend::BackendType;
use crate::lifecycle::{BackupDescriptor, ConnectionState, Diagnostics, SaveOutcome};
use crate::queue::DrainReport;
use crate::repository::deliver;
use crate::row::StatsEntry;

/// Cheap, cloneable handle to the persistence supervisor.
#[derive(Clone)]
pub struct StatsHandle {
    cmd_tx: mpsc::Sender<SupervisorCommand>,
    state: watch::Receiver<ConnectionState>,
}

impl StatsHandle {
    pub(crate) fn new(
        cmd_tx: mpsc::Sender<SupervisorCommand>,
        state: watch::Receiver<ConnectionState>,
    ) -> Self {
        Self { cmd_tx, state }
    }

    /// Last published lifecycle state. Does not round-trip to the supervisor.
    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.clone()
    }

    pub async fn initialize(
        &self,
        backend: BackendType,
        database: &str,
        connection_string: Option<&str>,
    ) -> Result<(), SupervisorError> {
        let (tx, rx) = oneshot::channel();
        self.send(SupervisorCommand::Initialize {
            backend,
            database: database.to_string(),
            connection_string: connection_string.map(str::to_string),
            reply: tx,
        })
        .await?;
        Ok(rx.await.map_err(|_| SupervisorError::Closed)??)
    }

    pub async fn initialize_with_best_settings(
        &self,
        player_estimate: Option<u32>,
    ) -> Result<BackendType, SupervisorError> {
        let (tx, rx) = oneshot::channel();
        self.send(SupervisorCommand::InitializeBestSettings {
            player_estimate,
            reply: tx,
        })
        .await?;
        Ok(rx.await.map_err(|_| SupervisorError::Closed)??)
    }

    pub async fn initialize_from_config(&self) -> Result<BackendType, SupervisorError> {
        let (tx, rx) = oneshot::channel();
        self.send(SupervisorCommand::InitializeFromConfig { reply: tx })
            .await?;
        Ok(rx.await.map_err(|_| SupervisorError::Closed)??)
    }

    /// Player-path save: written now, or queued when persistence is down.
    pub async fn save(
        &self,
        external_id: &str,
        display_name: &str,
        record: StatisticsRecord,
        priority: i32,
    ) -> Result<SaveOutcome, SupervisorError> {
        let (tx, rx) = oneshot::channel();
        self.send(SupervisorCommand::Save {
            external_id: external_id.to_string(),
            display_name: display_name.to_string(),
            record,
            priority,
            reply: tx,
        })
        .await?;
        rx.await.map_err(|_| SupervisorError::Closed)
    }

    pub async fn load(&self, external_id: &str) -> Result<StatisticsRecord, SupervisorError> {
        let (tx, rx) = oneshot::channel();
        self.send(SupervisorCommand::Load {
            external_id: external_id.to_string(),
            reply: tx,
        })
        .await?;
        Ok(rx.await.map_err(|_| SupervisorError::Closed)??)
    }

    /// Load on a spawned task; `callback` runs exactly once, with a fresh
    /// record if the load fails.
    pub fn load_async<F>(&self, external_id: impl Into<String>, callback: F) -> JoinHandle<()>
    where
        F: FnOnce(StatisticsRecord) + Send + 'static,
    {
        let handle = self.clone();
        let external_id = external_id.into();
        tokio::spawn(async move {
            let record = match handle.load(&external_id).await {
                Ok(record) => record,
                Err(e) => {
                    tracing::warn!(external_id = %external_id, "Async load failed: {}", e);
                    StatisticsRecord::fresh()
                }
            };
            deliver(&external_id, callback, record);
        })
    }

    pub async fn delete(&self, external_id: &str) -> Result<bool, SupervisorError> {
        let (tx, rx) = oneshot::channel();
        self.send(SupervisorCommand::Delete {
            external_id: external_id.to_string(),
            reply: tx,
        })
        .await?;
        Ok(rx.await.map_err(|_| SupervisorError::Closed)??)
    }

    pub async fn get_all(&self) -> Result<Vec<StatsEntry>, SupervisorError> {
        let (tx, rx) = oneshot::channel();
        self.send(SupervisorCommand::GetAll { reply: tx }).await?;
        Ok(rx.await.map_err(|_| SupervisorError::Closed)??)
    }

    pub async fn get_top_n(
        &self,
        limit: usize,
        field: StatField,
    ) -> Result<Vec<StatsEntry>, SupervisorError> {
        let (tx, rx) = oneshot::channel();
        self.send(SupervisorCommand::GetTopN {
            limit,
            field,
            reply: tx,
        })
        .await?;
        Ok(rx.await.map_err(|_| SupervisorError::Closed)??)
    }

    pub async fn backup_now(&self) -> Result<Option<BackupDescriptor>, SupervisorError> {
        let (tx, rx) = oneshot::channel();
        self.send(SupervisorCommand::Backup { reply: tx }).await?;
        Ok(rx.await.map_err(|_| SupervisorError::Closed)??)
    }

    pub async fn list_backups(&self) -> Result<Vec<BackupDescriptor>, SupervisorError> {
        let (tx, rx) = oneshot::channel();
        self.send(SupervisorCommand::ListBackups { reply: tx })
            .await?;
        Ok(rx.await.map_err(|_| SupervisorError::Closed)??)
    }

    /// Restore the snapshot with this directory name.
    pub async fn restore_backup(&self, name: &str) -> Result<(), SupervisorError> {
        let (tx, rx) = oneshot::channel();
        self.send(SupervisorCommand::Restore {
            name: name.to_string(),
            reply: tx,
        })
        .await?;
        Ok(rx.await.map_err(|_| SupervisorError::Closed)??)
    }

    /// Run a drain tick now instead of waiting for the timer.
    pub async fn drain(&self) -> Result<DrainReport, SupervisorError> {
        let (tx, rx) = oneshot::channel();
        self.send(SupervisorCommand::Drain { reply: tx }).await?;
        rx.await.map_err(|_| SupervisorError::Closed)
    }

    pub async fn requeue_dead_letters(&self) -> Result<usize, SupervisorError> {
        let (tx, rx) = oneshot::channel();
        self.send(SupervisorCommand::RequeueDeadLetters { reply: tx })
            .await?;
        rx.await.map_err(|_| SupervisorError::Closed)
    }

    pub async fn diagnostics(&self) -> Result<Diagnostics, SupervisorError> {
        let (tx, rx) = oneshot::channel();
        self.send(SupervisorCommand::Diagnostics { reply: tx })
            .await?;
        rx.await.map_err(|_| SupervisorError::Closed)
    }

    /// Shut persistence down and stop the supervisor. Waits until the
    /// driver is closed.
    pub async fn shutdown(&self) -> Result<(), SupervisorError> {
        let (tx, rx) = oneshot::channel();
        self.send(SupervisorCommand::Shutdown { reply: tx }).await?;
        rx.await.map_err(|_| SupervisorError::Closed)
    }

    async fn send(&self, cmd: SupervisorCommand) -> Result<(), SupervisorError> {
        self.cmd_tx
            .send(cmd)
            .await
            .map_err(|_| SupervisorError::Closed)
    }
}
