//! Connection and lifecycle management.
//!
//! [`LifecycleManager`] owns the driver, the repository built on it, the
//! pending queue and the rate limiter. It is the only writer of the
//! published [`ConnectionState`]; everything else holds a receiver.
//!
//! Nothing here runs on its own. The supervisor task calls
//! [`LifecycleManager::health_check`], [`LifecycleManager::recovery_tick`]
//! and [`LifecycleManager::drain`] from its timers.

pub mod backup;
mod diagnostics;
pub mod schema;
mod state;

pub use backup::BackupDescriptor;
pub use diagnostics::Diagnostics;
pub use schema::{SchemaOutcome, CURRENT_SCHEMA_VERSION};
pub use state::ConnectionState;

use std::sync::atomic::AtomicU64;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant};
use tracing::Instrument;

use player_stats::{StatField, StatisticsRecord};

use crate::backend::{select_backend, BackendType, ConnectionParams};
use crate::config::PersistenceConfig;
use crate::driver::{Connector, DriverError, Query, StorageDriver};
use crate::error::{classify_io, ErrorKind, PersistenceError};
use crate::queue::{DrainReport, PendingEntry, PendingOperation, PendingQueue};
use crate::rate_limit::SlidingWindow;
use crate::repository::{self, StatsRepository};
use crate::retry::RetryPolicy;
use crate::row::StatsEntry;

/// What `initialize` was last asked to connect to. Recovery reuses it.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Target {
    backend: BackendType,
    database: String,
    connection_string: Option<String>,
}

/// Result of a player-path save.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaveOutcome {
    Saved,
    /// Queued for a later drain.
    Deferred,
    /// Rejected outright or the queue was full.
    Dropped,
}

pub struct LifecycleManager<C: Connector> {
    config: PersistenceConfig,
    connector: C,
    state_tx: watch::Sender<ConnectionState>,
    driver: Option<Arc<C::Driver>>,
    repository: Option<StatsRepository<C::Driver>>,
    queue: PendingQueue,
    limiter: SlidingWindow,
    target: Option<Target>,
    params: Option<ConnectionParams>,
    schema_version: Option<u32>,
    corrupted: bool,
    consecutive_failures: u32,
    recovery_attempts: u32,
    last_backup_at: Option<Instant>,
    last_backup_millis: Option<u64>,
    last_maintenance: Option<Instant>,
    anomalies: Arc<AtomicU64>,
}

impl<C: Connector> LifecycleManager<C> {
    pub fn new(config: PersistenceConfig, connector: C) -> Self {
        let (state_tx, state_rx) = watch::channel(ConnectionState::Uninitialized);
        let queue = PendingQueue::new(
            config.max_pending_operations,
            config.max_operation_attempts,
            state_rx,
        );
        let limiter = SlidingWindow::per_second(config.rate_limit_per_second);
        Self {
            config,
            connector,
            state_tx,
            driver: None,
            repository: None,
            queue,
            limiter,
            target: None,
            params: None,
            schema_version: None,
            corrupted: false,
            consecutive_failures: 0,
            recovery_attempts: 0,
            last_backup_at: None,
            last_backup_millis: None,
            last_maintenance: None,
            anomalies: Arc::default(),
        }
    }

    pub fn config(&self) -> &PersistenceConfig {
        &self.config
    }

    pub fn state(&self) -> ConnectionState {
        *self.state_tx.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.state_tx.subscribe()
    }

    /// True while a repository exists and the connection is up.
    pub fn is_initialized(&self) -> bool {
        self.repository.is_some() && self.state().is_connected()
    }

    fn set_state(&self, next: ConnectionState) {
        let previous = self.state_tx.send_replace(next);
        if previous != next {
            tracing::info!(from = %previous, to = %next, "Persistence state changed");
        }
    }

    fn query_retry(&self) -> RetryPolicy {
        RetryPolicy::linear(self.config.query_retry_attempts, self.config.query_retry_delay())
    }

    fn database_name(&self) -> &str {
        self.target
            .as_ref()
            .map(|t| t.database.as_str())
            .unwrap_or(&self.config.database_name)
    }

    // -- lifecycle --

    /// Connect to `database` on `backend` and bring the subsystem to `Ready`.
    /// On failure the half-open connection is closed and the state is
    /// `Uninitialized`.
    pub async fn initialize(
        &mut self,
        backend: BackendType,
        database: &str,
        connection_string: Option<&str>,
    ) -> Result<(), PersistenceError> {
        let target = Target {
            backend,
            database: database.to_string(),
            connection_string: connection_string.map(str::to_string),
        };
        let span = tracing::info_span!("initialize", %backend, database);
        self.initialize_target(target).instrument(span).await
    }

    async fn initialize_target(&mut self, target: Target) -> Result<(), PersistenceError> {
        self.teardown().await;
        self.corrupted = false;
        self.consecutive_failures = 0;
        self.recovery_attempts = 0;
        self.target = Some(target.clone());

        match self.establish(&target).await {
            Ok(()) => {
                self.set_state(ConnectionState::Ready);
                tracing::info!(schema_version = ?self.schema_version, "Persistence ready");
                Ok(())
            }
            Err(e) => {
                tracing::error!("Initialization failed: {}", e);
                self.set_state(ConnectionState::Uninitialized);
                Err(e)
            }
        }
    }

    /// Pick a backend tier from the player estimate and initialize it. A
    /// remote tier that fails to come up falls back to the binary store.
    pub async fn initialize_with_best_settings(
        &mut self,
        player_estimate: Option<u32>,
    ) -> Result<BackendType, PersistenceError> {
        let database = self.config.database_name.clone();
        let remote = self.config.connection_string.clone();
        let backend = select_backend(player_estimate, remote.as_deref());
        tracing::info!(players = ?player_estimate, %backend, "Selected backend");

        match self.initialize(backend, &database, remote.as_deref()).await {
            Ok(()) => Ok(backend),
            Err(e) if backend.is_remote() => {
                tracing::warn!("Remote backend unavailable, falling back to binary store: {}", e);
                let fallback = BackendType::EmbeddedFileBinary;
                self.initialize(fallback, &database, None).await?;
                Ok(fallback)
            }
            Err(e) => Err(e),
        }
    }

    /// Initialize from the configuration alone: best settings when a player
    /// estimate is configured, the configured backend otherwise.
    pub async fn initialize_from_config(&mut self) -> Result<BackendType, PersistenceError> {
        if let Some(players) = self.config.expected_players {
            return self.initialize_with_best_settings(Some(players)).await;
        }
        let backend = self.config.backend;
        let database = self.config.database_name.clone();
        let connection_string = self.config.connection_string.clone();
        self.initialize(backend, &database, connection_string.as_deref())
            .await?;
        Ok(backend)
    }

    /// Connect, verify and check the schema. Stops short of `Ready`.
    async fn establish(&mut self, target: &Target) -> Result<(), PersistenceError> {
        self.set_state(ConnectionState::Connecting);
        let params = ConnectionParams::build(
            target.backend,
            &target.database,
            target.connection_string.as_deref(),
            &self.config.data_dir(),
        )?;
        let backup_root = self.config.backup_dir();
        if params.directory() == Some(backup_root.as_path()) {
            return Err(PersistenceError::InvalidConfig(format!(
                "database {} would live in the backup directory {}",
                target.database,
                backup_root.display()
            )));
        }

        let timeout = self.config.connection_timeout();
        let connected = time::timeout(timeout, self.connector.connect(&params)).await;
        let driver = match connected {
            Err(_) => return Err(PersistenceError::Timeout(timeout)),
            Ok(Err(e)) => return Err(self.connect_error(e)),
            Ok(Ok(driver)) => driver,
        };

        let outcome = match self.bring_up(&driver).await {
            Ok(outcome) => outcome,
            Err(e) => {
                if let Err(close_err) = driver.close().await {
                    tracing::warn!("Failed to close half-open connection: {}", close_err);
                }
                return Err(e);
            }
        };

        let driver = Arc::new(driver);
        self.repository = Some(StatsRepository::new(
            driver.clone(),
            self.state_tx.subscribe(),
            self.query_retry(),
            self.anomalies.clone(),
        ));
        self.driver = Some(driver);
        self.params = Some(params);
        self.schema_version = Some(outcome.version());
        self.last_maintenance = Some(Instant::now());
        Ok(())
    }

    async fn bring_up(&mut self, driver: &C::Driver) -> Result<SchemaOutcome, PersistenceError> {
        self.set_state(ConnectionState::Verifying);
        let retry = RetryPolicy::linear(self.config.max_retry_attempts, self.config.retry_delay_base());
        let timeout = self.config.connection_timeout();
        let ping = retry.run("ping", move || driver.execute(Query::Ping));
        match time::timeout(timeout, ping).await {
            Err(_) => return Err(PersistenceError::Timeout(timeout)),
            Ok(Err(e)) => {
                return Err(PersistenceError::ConnectionFailed(format!(
                    "verification failed: {e}"
                )))
            }
            Ok(Ok(_)) => {}
        }

        self.set_state(ConnectionState::SchemaCheck);
        match schema::ensure_schema(driver, self.query_retry()).await {
            Ok(outcome) => Ok(outcome),
            Err(PersistenceError::QueryFailed(DriverError::Corrupt(detail))) => {
                Err(self.mark_corrupted(detail))
            }
            Err(e) => Err(e),
        }
    }

    fn connect_error(&mut self, err: DriverError) -> PersistenceError {
        match err {
            DriverError::Corrupt(detail) => self.mark_corrupted(detail),
            DriverError::Io(io) => classify_io("open database", &io),
            other => PersistenceError::ConnectionFailed(other.to_string()),
        }
    }

    fn mark_corrupted(&mut self, detail: String) -> PersistenceError {
        self.corrupted = true;
        tracing::error!(detail = %detail, "Storage is corrupted");
        PersistenceError::DatabaseCorrupted(detail)
    }

    /// Drop the repository and close the driver, if any.
    async fn teardown(&mut self) {
        self.repository = None;
        if let Some(driver) = self.driver.take() {
            if let Err(e) = driver.close().await {
                tracing::warn!("Error closing storage driver: {}", e);
            }
        }
    }

    /// Drain what can still be written, then close. Safe to call repeatedly.
    pub async fn shutdown(&mut self) {
        if self.state() == ConnectionState::ShutDown && self.driver.is_none() {
            tracing::debug!("Persistence already shut down");
            return;
        }
        if self.state().accepts_operations() && !self.queue.is_empty() {
            self.drain().await;
        }
        if !self.queue.is_empty() {
            tracing::warn!(pending = self.queue.len(), "Shutting down with unwritten operations");
        }
        self.teardown().await;
        self.set_state(ConnectionState::ShutDown);
        tracing::info!("Persistence shut down");
    }

    // -- health and recovery --

    /// One health check. Returns whether the round trip succeeded.
    pub async fn health_check(&mut self) -> bool {
        let state = self.state();
        if !state.is_connected() {
            tracing::trace!(%state, "Skipping health check");
            return false;
        }
        let Some(driver) = self.driver.clone() else {
            return false;
        };

        let timeout = self.config.connection_timeout();
        let healthy = driver.is_connected()
            && matches!(
                time::timeout(timeout, driver.execute(Query::Ping)).await,
                Ok(Ok(_))
            );

        if !healthy {
            self.consecutive_failures += 1;
            tracing::warn!(
                failures = self.consecutive_failures,
                threshold = self.config.recovery_failure_threshold,
                "Health check failed"
            );
            if state == ConnectionState::Ready {
                self.set_state(ConnectionState::Degraded);
            }
            if self.consecutive_failures >= self.config.recovery_failure_threshold {
                self.start_recovery().await;
            }
            return false;
        }

        if self.consecutive_failures > 0 {
            tracing::info!(after = self.consecutive_failures, "Health check passing again");
            self.consecutive_failures = 0;
        }
        if state == ConnectionState::Degraded {
            self.set_state(ConnectionState::Ready);
        }
        self.maintenance_if_due().await;
        self.backup_if_due();
        true
    }

    async fn maintenance_if_due(&mut self) {
        let due = self
            .last_maintenance
            .map_or(true, |at| at.elapsed() >= self.config.maintenance_interval());
        if !due {
            return;
        }
        let Some(driver) = self.driver.clone() else {
            return;
        };
        if driver.optimize_storage().await {
            tracing::debug!("Storage maintenance complete");
        } else {
            tracing::warn!("Storage maintenance failed");
        }
        self.last_maintenance = Some(Instant::now());
    }

    /// Enter `Recovering`. Attempts happen on [`LifecycleManager::recovery_tick`].
    /// Returns false when there is nothing to recover to.
    pub async fn start_recovery(&mut self) -> bool {
        if self.target.is_none() {
            tracing::error!("Cannot recover: persistence was never initialized");
            return false;
        }
        if self.state() == ConnectionState::Recovering {
            return true;
        }
        tracing::warn!(failures = self.consecutive_failures, "Starting recovery");
        self.teardown().await;
        self.recovery_attempts = 0;
        self.set_state(ConnectionState::Recovering);
        true
    }

    /// One recovery attempt. Does nothing outside `Recovering`.
    pub async fn recovery_tick(&mut self) -> Result<(), PersistenceError> {
        if self.state() != ConnectionState::Recovering {
            return Ok(());
        }
        let Some(target) = self.target.clone() else {
            self.set_state(ConnectionState::Abandoned);
            return Err(PersistenceError::RecoveryFailed {
                attempts: self.recovery_attempts,
                reason: "no configuration to recover".into(),
            });
        };
        self.recovery_attempts += 1;
        let attempt = self.recovery_attempts;
        let span = tracing::info_span!("recovery", attempt, backend = %target.backend);
        self.recovery_attempt(target).instrument(span).await
    }

    async fn recovery_attempt(&mut self, target: Target) -> Result<(), PersistenceError> {
        let attempt = self.recovery_attempts;
        tracing::info!(max = self.config.max_recovery_attempts, "Recovery attempt");
        self.teardown().await;

        let result = match self.establish(&target).await {
            Ok(()) => self.verify_integrity().await,
            Err(e) => Err(e),
        };

        match result {
            Ok(()) => {
                self.recovery_attempts = 0;
                self.consecutive_failures = 0;
                self.set_state(ConnectionState::Ready);
                tracing::info!(attempt, "Recovery succeeded");
                self.drain().await;
                Ok(())
            }
            Err(e) => {
                self.teardown().await;
                if attempt >= self.config.max_recovery_attempts {
                    tracing::error!(
                        attempts = attempt,
                        "Recovery abandoned, operator intervention required: {}",
                        e
                    );
                    self.set_state(ConnectionState::Abandoned);
                    return Err(PersistenceError::RecoveryFailed {
                        attempts: attempt,
                        reason: e.to_string(),
                    });
                }
                tracing::warn!(attempt, "Recovery attempt failed: {}", e);
                self.set_state(ConnectionState::Recovering);
                Err(e)
            }
        }
    }

    async fn verify_integrity(&mut self) -> Result<(), PersistenceError> {
        if self.corrupted {
            return Err(PersistenceError::DatabaseCorrupted(
                "corruption was detected earlier; restore a backup".into(),
            ));
        }
        let driver = self
            .driver
            .clone()
            .ok_or_else(|| PersistenceError::ConnectionLost("no driver after reconnect".into()))?;
        let stored = driver.execute(Query::ReadSchemaVersion).await?.into_version()?;
        if stored < CURRENT_SCHEMA_VERSION {
            return Err(PersistenceError::SchemaMismatch {
                stored,
                expected: CURRENT_SCHEMA_VERSION,
            });
        }
        driver.execute(Query::Ping).await?;
        Ok(())
    }

    // -- backups --

    /// Snapshot the data directory now. Remote backends have nothing to copy
    /// and return `Ok(None)`.
    pub fn backup_now(&mut self) -> Result<Option<BackupDescriptor>, PersistenceError> {
        let params = self.params.as_ref().ok_or_else(|| {
            PersistenceError::InvalidOperation("persistence is not initialized".into())
        })?;
        let Some(source) = params.directory() else {
            tracing::debug!(backend = %params.backend, "Skipping backup for remote backend");
            return Ok(None);
        };

        // Keep snapshot names unique even within one millisecond.
        let millis = crate::now_millis().max(self.last_backup_millis.map_or(0, |m| m + 1));
        let root = self.config.backup_dir();
        let descriptor =
            backup::create_backup(source, &root, &params.database, params.backend, millis)?;
        self.last_backup_at = Some(Instant::now());
        self.last_backup_millis = Some(millis);

        match backup::prune_backups(&root, &params.database, self.config.max_backups) {
            Ok(removed) if !removed.is_empty() => {
                tracing::info!(removed = removed.len(), "Pruned old backups");
            }
            Ok(_) => {}
            Err(e) => tracing::warn!("Backup retention failed: {}", e),
        }
        Ok(Some(descriptor))
    }

    /// Back up if the interval has elapsed. Failures are logged only.
    pub fn backup_if_due(&mut self) {
        let file_based = self
            .params
            .as_ref()
            .is_some_and(|p| p.backend.is_file_based());
        let due = self
            .last_backup_at
            .map_or(true, |at| at.elapsed() >= self.config.backup_interval());
        if !file_based || !due {
            return;
        }
        if let Err(e) = self.backup_now() {
            tracing::error!("Scheduled backup failed: {}", e);
        }
    }

    /// Snapshots of the current database, newest first.
    pub fn list_backups(&self) -> Result<Vec<BackupDescriptor>, PersistenceError> {
        backup::list_backups(&self.config.backup_dir(), Some(self.database_name()))
    }

    pub fn find_backup(&self, name: &str) -> Result<BackupDescriptor, PersistenceError> {
        backup::list_backups(&self.config.backup_dir(), None)?
            .into_iter()
            .find(|b| b.name() == name)
            .ok_or_else(|| PersistenceError::InvalidOperation(format!("no backup named {name}")))
    }

    /// Copy a snapshot over its database directory and initialize on it.
    /// Refused while a connection is up.
    pub async fn restore_backup(&mut self, backup: &BackupDescriptor) -> Result<(), PersistenceError> {
        let state = self.state();
        if state.is_connected() || state.is_initializing() {
            return Err(PersistenceError::InvalidOperation(format!(
                "cannot restore while {state}; shut down first"
            )));
        }
        if !backup.backend.is_file_based() {
            return Err(PersistenceError::InvalidOperation(format!(
                "backend {} has no file snapshot",
                backup.backend
            )));
        }

        self.teardown().await;
        let target = self.config.data_dir().join(&backup.database);
        backup::restore_backup(backup, &target, crate::now_millis())?;
        tracing::info!(backup = %backup.name(), "Re-initializing on restored data");
        self.initialize(backup.backend, &backup.database, None).await
    }

    // -- repository access --

    /// Charge one operation against the rate limit.
    pub fn admit(&mut self) -> Result<(), PersistenceError> {
        if self.limiter.try_acquire() {
            Ok(())
        } else {
            tracing::warn!(limit = self.limiter.capacity(), "Rate limit exceeded");
            Err(PersistenceError::RateLimitExceeded {
                limit: self.limiter.capacity(),
            })
        }
    }

    fn ready_repository(&self) -> Result<&StatsRepository<C::Driver>, PersistenceError> {
        let state = self.state();
        match &self.repository {
            Some(repository) if state.accepts_operations() => Ok(repository),
            _ => Err(PersistenceError::NotReady(state)),
        }
    }

    pub async fn save(
        &mut self,
        external_id: &str,
        display_name: &str,
        record: &StatisticsRecord,
    ) -> Result<(), PersistenceError> {
        self.admit()?;
        self.ready_repository()?
            .try_save(external_id, display_name, record)
            .await
    }

    /// Save, or queue the save when persistence cannot take it right now.
    /// Invalid and rate-limited saves are dropped, never queued.
    pub async fn save_or_defer(
        &mut self,
        external_id: &str,
        display_name: &str,
        record: StatisticsRecord,
        priority: i32,
    ) -> SaveOutcome {
        let error = match self.save(external_id, display_name, &record).await {
            Ok(()) => return SaveOutcome::Saved,
            Err(e) => e,
        };
        if matches!(
            error.kind(),
            ErrorKind::DataValidationFailed | ErrorKind::InvalidOperation | ErrorKind::RateLimitExceeded
        ) {
            tracing::warn!(external_id = %external_id, "Dropping save: {}", error);
            return SaveOutcome::Dropped;
        }

        let operation = PendingOperation::SaveStats {
            external_id: external_id.to_string(),
            display_name: display_name.to_string(),
            record,
        };
        match self.queue.enqueue(operation, priority) {
            Ok(seq) => {
                tracing::debug!(seq, external_id = %external_id, "Deferred save: {}", error);
                SaveOutcome::Deferred
            }
            Err(_) => SaveOutcome::Dropped,
        }
    }

    pub async fn load(&mut self, external_id: &str) -> Result<StatisticsRecord, PersistenceError> {
        self.admit()?;
        Ok(self.ready_repository()?.load(external_id).await)
    }

    /// Like [`StatsRepository::load_async`]. When the load cannot even start
    /// the callback still runs once, with a fresh record.
    pub fn load_async<F>(&mut self, external_id: &str, callback: F) -> JoinHandle<()>
    where
        F: FnOnce(StatisticsRecord) + Send + 'static,
    {
        let ready = self
            .admit()
            .and_then(|()| self.ready_repository().cloned());
        match ready {
            Ok(repository) => repository.load_async(external_id, callback),
            Err(e) => {
                tracing::warn!(external_id = %external_id, "Load refused: {}", e);
                let external_id = external_id.to_string();
                tokio::spawn(async move {
                    repository::deliver(&external_id, callback, StatisticsRecord::fresh());
                })
            }
        }
    }

    pub async fn delete(&mut self, external_id: &str) -> Result<bool, PersistenceError> {
        self.admit()?;
        self.ready_repository()?.try_delete(external_id).await
    }

    pub async fn get_all(&mut self) -> Result<Vec<StatsEntry>, PersistenceError> {
        self.admit()?;
        Ok(self.ready_repository()?.get_all().await)
    }

    pub async fn get_top_n(
        &mut self,
        limit: usize,
        field: StatField,
    ) -> Result<Vec<StatsEntry>, PersistenceError> {
        self.admit()?;
        Ok(self.ready_repository()?.get_top_n(limit, field).await)
    }

    // -- pending queue --

    pub fn enqueue(&mut self, operation: PendingOperation, priority: i32) -> Result<u64, PersistenceError> {
        self.queue.enqueue(operation, priority)
    }

    /// One drain tick over the pending queue.
    pub async fn drain(&mut self) -> DrainReport {
        let Some(repository) = self.repository.clone() else {
            return DrainReport {
                skipped: !self.queue.is_empty(),
                ..DrainReport::default()
            };
        };
        self.queue
            .drain(|operation| {
                let repository = repository.clone();
                async move { repository.execute_pending(operation).await }
            })
            .await
    }

    pub fn pending(&self) -> &[PendingEntry] {
        self.queue.entries()
    }

    pub fn dead_letters(&self) -> Vec<PendingEntry> {
        self.queue.dead_letters().cloned().collect()
    }

    pub fn requeue_dead_letters(&mut self) -> usize {
        self.queue.requeue_dead_letters()
    }

    // -- introspection --

    pub fn diagnostics(&self) -> Diagnostics {
        let backend = self
            .params
            .as_ref()
            .map(|p| p.backend)
            .or_else(|| self.target.as_ref().map(|t| t.backend));
        Diagnostics {
            state: self.state(),
            backend,
            database: self.target.as_ref().map(|t| t.database.clone()),
            consecutive_failures: self.consecutive_failures,
            recovery_attempts: self.recovery_attempts,
            pending: self.queue.len(),
            dead_letters: self.queue.dead_letter_count(),
            last_backup_millis: self.last_backup_millis,
            schema_version: self.schema_version,
            anomalies: self.anomalies.load(std::sync::atomic::Ordering::Relaxed),
            corrupted: self.corrupted,
        }
    }

    pub fn summary(&self) -> String {
        self.diagnostics().to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::{DefaultConnector, ScriptedConnector};
    use crate::queue::{HIGH_PRIORITY, NORMAL_PRIORITY};
    use std::path::Path;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    fn config(dir: &Path) -> PersistenceConfig {
        PersistenceConfig {
            data_dir: Some(dir.to_path_buf()),
            retry_delay_base_ms: 10,
            query_retry_delay_ms: 5,
            ..Default::default()
        }
    }

    fn scripted(config: PersistenceConfig) -> (LifecycleManager<ScriptedConnector>, ScriptedConnector) {
        let connector = ScriptedConnector::new();
        (LifecycleManager::new(config, connector.clone()), connector)
    }

    async fn ready(dir: &Path) -> (LifecycleManager<ScriptedConnector>, ScriptedConnector) {
        let (mut manager, connector) = scripted(config(dir));
        manager
            .initialize(BackendType::EmbeddedFileJson, "stats", None)
            .await
            .unwrap();
        (manager, connector)
    }

    fn kills(kills: u32) -> StatisticsRecord {
        StatisticsRecord {
            kills,
            ..Default::default()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_initialize_reaches_ready_and_schema_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let (mut manager, connector) = ready(dir.path()).await;
        assert_eq!(manager.state(), ConnectionState::Ready);
        assert!(manager.is_initialized());
        assert_eq!(connector.schema_version(), CURRENT_SCHEMA_VERSION);

        manager
            .initialize(BackendType::EmbeddedFileJson, "stats", None)
            .await
            .unwrap();
        assert_eq!(connector.calls("write_schema_version"), 1);
        assert_eq!(connector.connection_count(), 2);
        assert_eq!(connector.calls("close"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_verification_leaves_uninitialized() {
        let dir = tempfile::tempdir().unwrap();
        let (mut manager, connector) = scripted(config(dir.path()));
        connector.fail_always("ping");

        let err = manager
            .initialize(BackendType::EmbeddedFileJson, "stats", None)
            .await
            .unwrap_err();
        assert!(matches!(err, PersistenceError::ConnectionFailed(_)));
        assert_eq!(connector.calls("ping"), 3);
        assert_eq!(connector.calls("close"), 1);
        assert_eq!(manager.state(), ConnectionState::Uninitialized);
        assert!(!manager.is_initialized());
        assert!(matches!(
            manager.save("p1", "Alice", &kills(1)).await,
            Err(PersistenceError::NotReady(ConnectionState::Uninitialized))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_verification_timeout_leaves_uninitialized() {
        let dir = tempfile::tempdir().unwrap();
        let (mut manager, connector) = scripted(PersistenceConfig {
            connection_timeout_ms: 1_000,
            retry_delay_base_ms: 5_000,
            ..config(dir.path())
        });
        connector.fail_always("ping");

        let err = manager
            .initialize(BackendType::EmbeddedFileJson, "stats", None)
            .await
            .unwrap_err();
        assert!(matches!(err, PersistenceError::Timeout(d) if d == Duration::from_secs(1)));
        assert_eq!(connector.calls("ping"), 1);
        assert_eq!(connector.calls("close"), 1);
        assert_eq!(manager.state(), ConnectionState::Uninitialized);
        assert!(!manager.is_initialized());
    }

    #[tokio::test]
    async fn test_invalid_inputs_fail_before_connecting() {
        let dir = tempfile::tempdir().unwrap();
        let (mut manager, connector) = scripted(config(dir.path()));

        let err = manager
            .initialize(BackendType::EmbeddedFileJson, "bad name", None)
            .await
            .unwrap_err();
        assert!(matches!(err, PersistenceError::InvalidConfig(_)));

        let err = manager
            .initialize(BackendType::RemoteRelationalA, "stats", None)
            .await
            .unwrap_err();
        assert!(matches!(err, PersistenceError::InvalidConfig(_)));
        assert_eq!(connector.calls("connect"), 0);
    }

    #[tokio::test]
    async fn test_database_cannot_share_the_backup_directory() {
        let dir = tempfile::tempdir().unwrap();
        let (mut manager, connector) = scripted(config(dir.path()));

        let err = manager
            .initialize(BackendType::EmbeddedFileJson, "backups", None)
            .await
            .unwrap_err();
        assert!(matches!(err, PersistenceError::InvalidConfig(_)));
        assert_eq!(connector.calls("connect"), 0);
        assert_eq!(manager.state(), ConnectionState::Uninitialized);

        manager
            .initialize(BackendType::EmbeddedFileJson, "stats", None)
            .await
            .unwrap();
        assert_eq!(manager.state(), ConnectionState::Ready);
    }

    #[tokio::test(start_paused = true)]
    async fn test_health_failures_degrade_then_recover() {
        let dir = tempfile::tempdir().unwrap();
        let (mut manager, connector) = ready(dir.path()).await;

        connector.set_offline(true);
        assert!(!manager.health_check().await);
        assert_eq!(manager.state(), ConnectionState::Degraded);
        assert!(!manager.health_check().await);
        assert_eq!(manager.state(), ConnectionState::Degraded);
        assert_eq!(manager.diagnostics().consecutive_failures, 2);
        assert!(!manager.health_check().await);
        assert_eq!(manager.state(), ConnectionState::Recovering);
    }

    #[tokio::test(start_paused = true)]
    async fn test_health_success_restores_ready() {
        let dir = tempfile::tempdir().unwrap();
        let (mut manager, connector) = ready(dir.path()).await;

        connector.set_offline(true);
        manager.health_check().await;
        assert_eq!(manager.state(), ConnectionState::Degraded);

        connector.set_offline(false);
        assert!(manager.health_check().await);
        assert_eq!(manager.state(), ConnectionState::Ready);
        assert_eq!(manager.diagnostics().consecutive_failures, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_recovery_replays_deferred_saves() {
        let dir = tempfile::tempdir().unwrap();
        let (mut manager, connector) = ready(dir.path()).await;

        connector.set_offline(true);
        for _ in 0..3 {
            manager.health_check().await;
        }
        assert_eq!(manager.state(), ConnectionState::Recovering);

        let outcome = manager
            .save_or_defer("p1", "Alice", kills(7), NORMAL_PRIORITY)
            .await;
        assert_eq!(outcome, SaveOutcome::Deferred);
        assert_eq!(manager.pending().len(), 1);

        assert!(manager.recovery_tick().await.is_err());
        assert_eq!(manager.state(), ConnectionState::Recovering);

        connector.set_offline(false);
        manager.recovery_tick().await.unwrap();
        assert_eq!(manager.state(), ConnectionState::Ready);
        assert!(manager.pending().is_empty());
        assert_eq!(connector.row("p1").map(|r| r.kills), Some(7));
        assert_eq!(manager.diagnostics().recovery_attempts, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_recovery_abandons_after_max_attempts() {
        let dir = tempfile::tempdir().unwrap();
        let config = PersistenceConfig {
            max_recovery_attempts: 2,
            ..config(dir.path())
        };
        let (mut manager, connector) = scripted(config);
        manager
            .initialize(BackendType::EmbeddedFileJson, "stats", None)
            .await
            .unwrap();

        connector.set_offline(true);
        assert!(manager.start_recovery().await);
        assert!(manager.recovery_tick().await.is_err());
        assert_eq!(manager.state(), ConnectionState::Recovering);

        let err = manager.recovery_tick().await.unwrap_err();
        assert!(matches!(err, PersistenceError::RecoveryFailed { attempts: 2, .. }));
        assert_eq!(manager.state(), ConnectionState::Abandoned);

        // Further ticks are inert.
        manager.recovery_tick().await.unwrap();
        assert_eq!(connector.calls("connect"), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_limit_rejects_excess_operations() {
        let dir = tempfile::tempdir().unwrap();
        let config = PersistenceConfig {
            rate_limit_per_second: 3,
            ..config(dir.path())
        };
        let (mut manager, _connector) = scripted(config);
        manager
            .initialize(BackendType::EmbeddedFileJson, "stats", None)
            .await
            .unwrap();

        for _ in 0..3 {
            manager.load("p1").await.unwrap();
        }
        let err = manager.load("p1").await.unwrap_err();
        assert!(matches!(err, PersistenceError::RateLimitExceeded { limit: 3 }));
        assert_eq!(
            manager.save_or_defer("p1", "Alice", kills(1), HIGH_PRIORITY).await,
            SaveOutcome::Dropped
        );
        assert!(manager.pending().is_empty());

        tokio::time::advance(Duration::from_secs(1)).await;
        manager.load("p1").await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_invalid_save_is_dropped_not_queued() {
        let dir = tempfile::tempdir().unwrap();
        let (mut manager, _connector) = ready(dir.path()).await;
        let outcome = manager
            .save_or_defer("p1", "Alice", kills(99_999), NORMAL_PRIORITY)
            .await;
        assert_eq!(outcome, SaveOutcome::Dropped);
        assert!(manager.pending().is_empty());
    }

    #[tokio::test]
    async fn test_backup_and_restore_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let mut manager = LifecycleManager::new(config(dir.path()), DefaultConnector);
        manager
            .initialize(BackendType::EmbeddedFileJson, "stats", None)
            .await
            .unwrap();

        manager.save("p1", "Alice", &kills(5)).await.unwrap();
        let backup = manager.backup_now().unwrap().unwrap();
        assert!(backup.path.starts_with(dir.path().join("backups")));
        manager.save("p1", "Alice", &kills(9)).await.unwrap();

        let err = manager.restore_backup(&backup).await.unwrap_err();
        assert!(matches!(err, PersistenceError::InvalidOperation(_)));

        manager.shutdown().await;
        let found = manager.find_backup(backup.name()).unwrap();
        manager.restore_backup(&found).await.unwrap();
        assert_eq!(manager.state(), ConnectionState::Ready);
        assert_eq!(manager.load("p1").await.unwrap().kills, 5);
    }

    #[tokio::test]
    async fn test_backup_retention_keeps_max_backups() {
        let dir = tempfile::tempdir().unwrap();
        let config = PersistenceConfig {
            max_backups: 2,
            ..config(dir.path())
        };
        let mut manager = LifecycleManager::new(config, DefaultConnector);
        manager
            .initialize(BackendType::EmbeddedFileBinary, "stats", None)
            .await
            .unwrap();
        manager.save("p1", "Alice", &kills(1)).await.unwrap();

        let mut created = Vec::new();
        for _ in 0..3 {
            created.push(manager.backup_now().unwrap().unwrap());
        }
        let kept = manager.list_backups().unwrap();
        assert_eq!(kept.len(), 2);
        assert_eq!(kept[0], created[2]);
        assert_eq!(kept[1], created[1]);
        assert!(manager.diagnostics().last_backup_millis.is_some());
    }

    #[tokio::test]
    async fn test_remote_backend_skips_backup() {
        let dir = tempfile::tempdir().unwrap();
        let mut manager = LifecycleManager::new(config(dir.path()), DefaultConnector);
        manager
            .initialize(BackendType::RemoteRelationalA, "stats", Some("sqlite::memory:"))
            .await
            .unwrap();
        assert!(manager.backup_now().unwrap().is_none());
        manager.shutdown().await;
    }

    #[tokio::test]
    async fn test_best_settings_tiers() {
        let dir = tempfile::tempdir().unwrap();
        let mut manager = LifecycleManager::new(config(dir.path()), DefaultConnector);
        assert_eq!(
            manager.initialize_with_best_settings(Some(16)).await.unwrap(),
            BackendType::EmbeddedFileJson
        );
        assert_eq!(
            manager.initialize_with_best_settings(Some(64)).await.unwrap(),
            BackendType::EmbeddedFileBinary
        );
        assert_eq!(
            manager.initialize_with_best_settings(None).await.unwrap(),
            BackendType::EmbeddedFileJson
        );
        assert_eq!(manager.state(), ConnectionState::Ready);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unreachable_remote_falls_back_to_binary() {
        let dir = tempfile::tempdir().unwrap();
        let config = PersistenceConfig {
            connection_string: Some("mongodb://stats.invalid:27017".into()),
            ..config(dir.path())
        };
        let mut manager = LifecycleManager::new(config, DefaultConnector);
        let backend = manager.initialize_with_best_settings(Some(200)).await.unwrap();
        assert_eq!(backend, BackendType::EmbeddedFileBinary);
        assert_eq!(manager.diagnostics().backend, Some(BackendType::EmbeddedFileBinary));
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_drains_and_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let (mut manager, connector) = ready(dir.path()).await;
        manager
            .enqueue(
                PendingOperation::SaveStats {
                    external_id: "p1".into(),
                    display_name: "Alice".into(),
                    record: kills(3),
                },
                NORMAL_PRIORITY,
            )
            .unwrap();

        manager.shutdown().await;
        manager.shutdown().await;
        assert_eq!(manager.state(), ConnectionState::ShutDown);
        assert!(!manager.is_initialized());
        assert_eq!(connector.calls("close"), 1);
        assert_eq!(connector.row("p1").map(|r| r.kills), Some(3));
    }

    #[tokio::test(start_paused = true)]
    async fn test_load_async_when_not_ready_delivers_fresh() {
        let dir = tempfile::tempdir().unwrap();
        let (mut manager, _connector) = scripted(config(dir.path()));
        let calls = Arc::new(AtomicU32::new(0));
        let c = calls.clone();
        manager
            .load_async("p1", move |record| {
                assert!(record.is_fresh());
                c.fetch_add(1, Ordering::SeqCst);
            })
            .await
            .unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_diagnostics_reflect_state() {
        let dir = tempfile::tempdir().unwrap();
        let (manager, _connector) = ready(dir.path()).await;
        let diagnostics = manager.diagnostics();
        assert_eq!(diagnostics.state, ConnectionState::Ready);
        assert_eq!(diagnostics.schema_version, Some(CURRENT_SCHEMA_VERSION));
        assert_eq!(diagnostics.database.as_deref(), Some("stats"));
        assert!(manager.summary().starts_with("state=ready"));
    }
}
