//! Validated CRUD over statistics records.
//!
//! Every operation checks the published [`ConnectionState`] first. Writes run
//! inside a driver transaction with retried lookups; reads that hit a row
//! which no longer converts or validates return a fresh record instead.
//!
//! One gate serializes transactions with reads on the same driver, so a
//! reader never sees writes of a transaction that has not committed.

use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;

use player_stats::{notable_changes, validate, NotableChange, StatField, StatisticsRecord};

use crate::driver::{DriverError, Query, StorageDriver};
use crate::error::PersistenceError;
use crate::lifecycle::ConnectionState;
use crate::queue::PendingOperation;
use crate::retry::RetryPolicy;
use crate::row::{StatsEntry, StatsRow};

/// What a lookup found under one external id.
enum Stored {
    Absent,
    Row(StatsRow),
    /// Present but undecodable. Writes overwrite it and deletes remove it.
    Unreadable,
}

pub struct StatsRepository<D> {
    driver: Arc<D>,
    state: watch::Receiver<ConnectionState>,
    retry: RetryPolicy,
    gate: Arc<Mutex<()>>,
    anomalies: Arc<AtomicU64>,
}

impl<D> Clone for StatsRepository<D> {
    fn clone(&self) -> Self {
        Self {
            driver: self.driver.clone(),
            state: self.state.clone(),
            retry: self.retry,
            gate: self.gate.clone(),
            anomalies: self.anomalies.clone(),
        }
    }
}

impl<D: StorageDriver> StatsRepository<D> {
    pub fn new(
        driver: Arc<D>,
        state: watch::Receiver<ConnectionState>,
        retry: RetryPolicy,
        anomalies: Arc<AtomicU64>,
    ) -> Self {
        Self {
            driver,
            state,
            retry,
            gate: Arc::new(Mutex::new(())),
            anomalies,
        }
    }

    /// Stored rows replaced by a fresh record so far.
    pub fn anomaly_count(&self) -> u64 {
        self.anomalies.load(Ordering::Relaxed)
    }

    fn ensure_ready(&self) -> Result<(), PersistenceError> {
        let state = *self.state.borrow();
        if !state.accepts_operations() {
            return Err(PersistenceError::NotReady(state));
        }
        Ok(())
    }

    fn check_id(external_id: &str) -> Result<(), PersistenceError> {
        if external_id.trim().is_empty() {
            return Err(PersistenceError::InvalidOperation(
                "external id must not be empty".into(),
            ));
        }
        Ok(())
    }

    async fn find(&self, external_id: &str) -> Result<Option<StatsRow>, DriverError> {
        let driver = &*self.driver;
        self.retry
            .run("find_stats", move || {
                driver.execute(Query::FindStats {
                    external_id: external_id.to_string(),
                })
            })
            .await?
            .into_row()
    }

    /// [`StatsRepository::find`] that counts an undecodable row as an anomaly
    /// instead of failing.
    async fn find_stored(&self, external_id: &str) -> Result<Stored, DriverError> {
        match self.find(external_id).await {
            Ok(Some(row)) => Ok(Stored::Row(row)),
            Ok(None) => Ok(Stored::Absent),
            Err(DriverError::Corrupt(detail)) => {
                self.anomalies.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(
                    external_id = %external_id,
                    "Stored stats are unreadable, treating them as fresh: {}",
                    detail
                );
                Ok(Stored::Unreadable)
            }
            Err(e) => Err(e),
        }
    }

    async fn rollback(&self, external_id: &str) {
        if let Err(e) = self.driver.rollback().await {
            tracing::warn!(external_id = %external_id, "Rollback failed: {}", e);
        }
    }

    /// Insert or replace the record for `external_id`.
    pub async fn try_save(
        &self,
        external_id: &str,
        display_name: &str,
        record: &StatisticsRecord,
    ) -> Result<(), PersistenceError> {
        Self::check_id(external_id)?;
        validate(record)?;
        self.ensure_ready()?;

        let _gate = self.gate.lock().await;
        self.driver
            .begin_transaction()
            .await
            .map_err(|e| PersistenceError::TransactionFailed(format!("begin: {e}")))?;

        match self.save_in_transaction(external_id, display_name, record).await {
            Ok(previous) => {
                log_notable_changes(external_id, &previous, record);
                tracing::debug!(external_id = %external_id, "Saved stats");
                Ok(())
            }
            Err(e) => {
                self.rollback(external_id).await;
                Err(e)
            }
        }
    }

    /// Returns the record that was replaced, or a fresh one for new players.
    async fn save_in_transaction(
        &self,
        external_id: &str,
        display_name: &str,
        record: &StatisticsRecord,
    ) -> Result<StatisticsRecord, PersistenceError> {
        let now = crate::now_timestamp();
        let previous = match self.find_stored(external_id).await? {
            Stored::Row(existing) => {
                let row = StatsRow::from_record(
                    external_id,
                    display_name,
                    record,
                    existing.created_at,
                    now,
                );
                self.driver.execute(Query::UpdateStats(row)).await?;
                existing.to_record().unwrap_or_default()
            }
            Stored::Unreadable => {
                let row = StatsRow::from_record(external_id, display_name, record, now, now);
                self.driver.execute(Query::UpdateStats(row)).await?;
                StatisticsRecord::fresh()
            }
            Stored::Absent => {
                let row = StatsRow::from_record(external_id, display_name, record, now, now);
                self.driver.execute(Query::InsertStats(row)).await?;
                StatisticsRecord::fresh()
            }
        };
        self.driver
            .commit()
            .await
            .map_err(|e| PersistenceError::TransactionFailed(format!("commit: {e}")))?;
        Ok(previous)
    }

    /// [`StatsRepository::try_save`] for callers that only need success.
    pub async fn save(&self, external_id: &str, display_name: &str, record: &StatisticsRecord) -> bool {
        match self.try_save(external_id, display_name, record).await {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!(external_id = %external_id, "Failed to save stats: {}", e);
                false
            }
        }
    }

    /// Load the record for `external_id`. Unknown players get a fresh record;
    /// a stored row that fails conversion or validation is replaced by one.
    pub async fn try_load(&self, external_id: &str) -> Result<StatisticsRecord, PersistenceError> {
        Self::check_id(external_id)?;
        self.ensure_ready()?;
        let found = {
            let _gate = self.gate.lock().await;
            self.find_stored(external_id).await?
        };
        match found {
            Stored::Row(row) => Ok(self.heal(row).1),
            Stored::Absent | Stored::Unreadable => Ok(StatisticsRecord::fresh()),
        }
    }

    /// Never fails: errors are logged and yield a fresh record.
    pub async fn load(&self, external_id: &str) -> StatisticsRecord {
        match self.try_load(external_id).await {
            Ok(record) => record,
            Err(e) => {
                tracing::warn!(external_id = %external_id, "Failed to load stats: {}", e);
                StatisticsRecord::fresh()
            }
        }
    }

    /// Load on a spawned task and hand the record to `callback` exactly once.
    pub fn load_async<F>(&self, external_id: impl Into<String>, callback: F) -> JoinHandle<()>
    where
        F: FnOnce(StatisticsRecord) + Send + 'static,
    {
        let repo = self.clone();
        let external_id = external_id.into();
        tokio::spawn(async move {
            let record = repo.load(&external_id).await;
            deliver(&external_id, callback, record);
        })
    }

    /// Remove the record. `Ok(false)` means there was nothing to delete.
    pub async fn try_delete(&self, external_id: &str) -> Result<bool, PersistenceError> {
        Self::check_id(external_id)?;
        self.ensure_ready()?;

        let _gate = self.gate.lock().await;
        self.driver
            .begin_transaction()
            .await
            .map_err(|e| PersistenceError::TransactionFailed(format!("begin: {e}")))?;

        match self.delete_in_transaction(external_id).await {
            Ok(true) => {
                tracing::info!(external_id = %external_id, "Deleted stats");
                Ok(true)
            }
            Ok(false) => {
                self.rollback(external_id).await;
                Ok(false)
            }
            Err(e) => {
                self.rollback(external_id).await;
                Err(e)
            }
        }
    }

    async fn delete_in_transaction(&self, external_id: &str) -> Result<bool, PersistenceError> {
        if matches!(self.find_stored(external_id).await?, Stored::Absent) {
            return Ok(false);
        }
        self.driver
            .execute(Query::DeleteStats {
                external_id: external_id.to_string(),
            })
            .await?
            .into_affected()?;
        self.driver
            .commit()
            .await
            .map_err(|e| PersistenceError::TransactionFailed(format!("commit: {e}")))?;
        Ok(true)
    }

    /// False both when the record is absent and when deleting failed.
    pub async fn delete(&self, external_id: &str) -> bool {
        match self.try_delete(external_id).await {
            Ok(deleted) => deleted,
            Err(e) => {
                tracing::warn!(external_id = %external_id, "Failed to delete stats: {}", e);
                false
            }
        }
    }

    pub async fn get_all(&self) -> Vec<StatsEntry> {
        self.list_or_empty(Query::ListStats).await
    }

    /// Best `limit` records by `field`, descending.
    pub async fn get_top_n(&self, limit: usize, field: StatField) -> Vec<StatsEntry> {
        if limit == 0 {
            return vec![];
        }
        self.list_or_empty(Query::TopStats { field, limit }).await
    }

    async fn list_or_empty(&self, query: Query) -> Vec<StatsEntry> {
        let label = query.label();
        match self.try_list(query).await {
            Ok(entries) => entries,
            Err(e) => {
                tracing::error!(query = label, "Bulk stats read failed: {}", e);
                vec![]
            }
        }
    }

    async fn try_list(&self, query: Query) -> Result<Vec<StatsEntry>, PersistenceError> {
        self.ensure_ready()?;
        let rows = {
            let _gate = self.gate.lock().await;
            let driver = &*self.driver;
            self.retry
                .run(query.label(), move || driver.execute(query.clone()))
                .await?
                .into_rows()?
        };
        Ok(rows
            .into_iter()
            .filter_map(|row| match self.heal(row) {
                (Some(row), record) => Some(StatsEntry {
                    external_id: row.external_id,
                    display_name: row.display_name,
                    record,
                    created_at: row.created_at,
                    updated_at: row.updated_at,
                }),
                (None, _) => None,
            })
            .collect())
    }

    /// Convert and validate a stored row. An invalid row counts as one
    /// anomaly and comes back as `(None, fresh)`.
    fn heal(&self, row: StatsRow) -> (Option<StatsRow>, StatisticsRecord) {
        let checked = row
            .to_record()
            .and_then(|record| validate(&record).map(|()| record));
        match checked {
            Ok(record) => (Some(row), record),
            Err(e) => {
                self.anomalies.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(
                    external_id = %row.external_id,
                    "Stored stats are invalid, substituting a fresh record: {}",
                    e
                );
                (None, StatisticsRecord::fresh())
            }
        }
    }

    /// Run a queued operation. A delete of an absent record counts as done.
    pub async fn execute_pending(&self, operation: PendingOperation) -> Result<(), PersistenceError> {
        match operation {
            PendingOperation::SaveStats {
                external_id,
                display_name,
                record,
            } => self.try_save(&external_id, &display_name, &record).await,
            PendingOperation::DeleteStats { external_id } => {
                self.try_delete(&external_id).await.map(|_| ())
            }
        }
    }
}

/// Invoke a load callback, containing any panic it raises.
pub(crate) fn deliver<F>(external_id: &str, callback: F, record: StatisticsRecord)
where
    F: FnOnce(StatisticsRecord),
{
    if std::panic::catch_unwind(AssertUnwindSafe(move || callback(record))).is_err() {
        tracing::error!(external_id = %external_id, "Stats load callback panicked");
    }
}

fn log_notable_changes(external_id: &str, before: &StatisticsRecord, after: &StatisticsRecord) {
    for change in notable_changes(before, after) {
        match change {
            NotableChange::KillSpike { gained } => {
                tracing::info!(external_id = %external_id, gained, "Kill spike");
            }
            NotableChange::ScoreSwing { before, after } => {
                tracing::info!(external_id = %external_id, before, after, "Score swing");
            }
            NotableChange::RankUp { from, to } => {
                tracing::info!(external_id = %external_id, from, to, "Rank up");
            }
        }
    }
}
