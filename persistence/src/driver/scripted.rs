//! Scripted in-memory driver for tests.
//!
//! Every driver opened through one [`ScriptedConnector`] shares the same
//! committed store, so reconnecting (recovery, re-initialization) sees the
//! data written before. Failures are injected per query label
//! (see [`Query::label`]) plus `begin`, `commit`, `rollback` and `connect`.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use super::staging::{self, FileTable, StagedWrite, Staging};
use super::{Connector, DriverError, Query, QueryOutput, StorageDriver};
use crate::backend::ConnectionParams;
use crate::row::StatsRow;

#[derive(Default)]
struct Store {
    rows: BTreeMap<String, StatsRow>,
    version: u32,
}

impl FileTable for Store {
    fn read_row(&self, external_id: &str) -> Result<Option<StatsRow>, DriverError> {
        Ok(self.rows.get(external_id).cloned())
    }

    fn read_all(&self) -> Result<Vec<StatsRow>, DriverError> {
        Ok(self.rows.values().cloned().collect())
    }

    fn read_version(&self) -> Result<u32, DriverError> {
        Ok(self.version)
    }

    fn create_schema(&mut self) -> Result<(), DriverError> {
        Ok(())
    }

    fn apply(&mut self, writes: Vec<StagedWrite>) -> Result<(), DriverError> {
        for write in writes {
            match write {
                StagedWrite::Put(row) => {
                    self.rows.insert(row.external_id.clone(), row);
                }
                StagedWrite::Remove(id) => {
                    self.rows.remove(&id);
                }
                StagedWrite::Version(v) => self.version = v,
            }
        }
        Ok(())
    }
}

#[derive(Default)]
struct Shared {
    store: Store,
    fail_next: HashMap<String, u32>,
    fail_always: HashSet<String>,
    offline: bool,
    commit_delay: Duration,
    calls: Vec<String>,
    connects: u32,
}

impl Shared {
    /// Log the call and decide whether it fails.
    fn check(&mut self, label: &str) -> Result<(), DriverError> {
        self.calls.push(label.to_string());
        if self.offline {
            return Err(DriverError::NotConnected);
        }
        if self.fail_always.contains(label) {
            return Err(DriverError::Other(format!("scripted failure: {label}")));
        }
        if let Some(remaining) = self.fail_next.get_mut(label) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(DriverError::Other(format!("scripted failure: {label}")));
            }
        }
        Ok(())
    }
}

fn lock(shared: &Mutex<Shared>) -> MutexGuard<'_, Shared> {
    shared.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Builds [`ScriptedDriver`]s and controls their behavior.
#[derive(Clone, Default)]
pub struct ScriptedConnector {
    shared: Arc<Mutex<Shared>>,
}

impl ScriptedConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `times` calls with this label.
    pub fn fail_next(&self, label: &str, times: u32) {
        lock(&self.shared).fail_next.insert(label.to_string(), times);
    }

    /// Fail every call with this label until [`ScriptedConnector::heal`].
    pub fn fail_always(&self, label: &str) {
        lock(&self.shared).fail_always.insert(label.to_string());
    }

    pub fn heal(&self, label: &str) {
        let mut shared = lock(&self.shared);
        shared.fail_always.remove(label);
        shared.fail_next.remove(label);
    }

    /// While offline every call and every connect fails with `NotConnected`.
    pub fn set_offline(&self, offline: bool) {
        lock(&self.shared).offline = offline;
    }

    /// Delay applied to commits before they succeed or fail.
    pub fn set_commit_delay(&self, delay: Duration) {
        lock(&self.shared).commit_delay = delay;
    }

    /// Number of calls made with this label, failed ones included.
    pub fn calls(&self, label: &str) -> usize {
        lock(&self.shared)
            .calls
            .iter()
            .filter(|c| c.as_str() == label)
            .count()
    }

    pub fn call_log(&self) -> Vec<String> {
        lock(&self.shared).calls.clone()
    }

    /// Forget the calls recorded so far, failure scripts stay in place.
    pub fn clear_calls(&self) {
        lock(&self.shared).calls.clear();
    }

    pub fn connection_count(&self) -> u32 {
        lock(&self.shared).connects
    }

    /// Write a row straight into the committed store, bypassing validation.
    pub fn insert_raw(&self, row: StatsRow) {
        lock(&self.shared)
            .store
            .rows
            .insert(row.external_id.clone(), row);
    }

    pub fn row(&self, external_id: &str) -> Option<StatsRow> {
        lock(&self.shared).store.rows.get(external_id).cloned()
    }

    pub fn row_count(&self) -> usize {
        lock(&self.shared).store.rows.len()
    }

    pub fn schema_version(&self) -> u32 {
        lock(&self.shared).store.version
    }

    pub fn set_schema_version(&self, version: u32) {
        lock(&self.shared).store.version = version;
    }
}

impl Connector for ScriptedConnector {
    type Driver = ScriptedDriver;

    async fn connect(&self, _params: &ConnectionParams) -> Result<ScriptedDriver, DriverError> {
        {
            let mut shared = lock(&self.shared);
            shared.check("connect")?;
            shared.connects += 1;
        }
        Ok(ScriptedDriver {
            shared: self.shared.clone(),
            staging: Mutex::new(Staging::default()),
            connected: AtomicBool::new(true),
        })
    }
}

/// In-memory driver whose failures are controlled by its connector.
pub struct ScriptedDriver {
    shared: Arc<Mutex<Shared>>,
    staging: Mutex<Staging>,
    connected: AtomicBool,
}

impl ScriptedDriver {
    fn ensure_open(&self) -> Result<(), DriverError> {
        if !self.connected.load(Ordering::Acquire) {
            return Err(DriverError::NotConnected);
        }
        Ok(())
    }

    fn staging(&self) -> MutexGuard<'_, Staging> {
        self.staging.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl StorageDriver for ScriptedDriver {
    async fn execute(&self, query: Query) -> Result<QueryOutput, DriverError> {
        self.ensure_open()?;
        let mut shared = lock(&self.shared);
        shared.check(query.label())?;
        let mut staging = self.staging();
        staging::execute(&mut shared.store, &mut staging, query)
    }

    async fn begin_transaction(&self) -> Result<(), DriverError> {
        self.ensure_open()?;
        lock(&self.shared).check("begin")?;
        self.staging().begin()
    }

    async fn commit(&self) -> Result<(), DriverError> {
        self.ensure_open()?;
        let delay = lock(&self.shared).commit_delay;
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        lock(&self.shared).check("commit")?;
        let writes = self.staging().take()?;
        lock(&self.shared).store.apply(writes)
    }

    async fn rollback(&self) -> Result<(), DriverError> {
        lock(&self.shared).check("rollback")?;
        self.staging().discard()
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire) && !lock(&self.shared).offline
    }

    async fn optimize_storage(&self) -> bool {
        lock(&self.shared).check("optimize").is_ok()
    }

    async fn close(&self) -> Result<(), DriverError> {
        let _ = self.staging().discard();
        self.connected.store(false, Ordering::Release);
        lock(&self.shared).calls.push("close".to_string());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::row::sample_row;
    use crate::test_support::json_params;

    #[tokio::test]
    async fn test_fail_next_then_recover() {
        let connector = ScriptedConnector::new();
        let driver = connector.connect(&json_params()).await.unwrap();
        connector.fail_next("ping", 2);
        assert!(driver.execute(Query::Ping).await.is_err());
        assert!(driver.execute(Query::Ping).await.is_err());
        assert!(driver.execute(Query::Ping).await.is_ok());
        assert_eq!(connector.calls("ping"), 3);
    }

    #[tokio::test]
    async fn test_drivers_share_committed_store() {
        let connector = ScriptedConnector::new();
        let first = connector.connect(&json_params()).await.unwrap();
        first
            .execute(Query::InsertStats(sample_row("p1", 4)))
            .await
            .unwrap();
        first.close().await.unwrap();

        let second = connector.connect(&json_params()).await.unwrap();
        let row = second
            .execute(Query::FindStats {
                external_id: "p1".into(),
            })
            .await
            .unwrap()
            .into_row()
            .unwrap();
        assert_eq!(row.map(|r| r.kills), Some(4));
        assert_eq!(connector.connection_count(), 2);
    }

    #[tokio::test]
    async fn test_offline_blocks_connect_and_queries() {
        let connector = ScriptedConnector::new();
        let driver = connector.connect(&json_params()).await.unwrap();
        connector.set_offline(true);
        assert!(!driver.is_connected());
        assert!(matches!(
            driver.execute(Query::Ping).await,
            Err(DriverError::NotConnected)
        ));
        assert!(connector.connect(&json_params()).await.is_err());
    }
}
