use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};

use super::staging::{self, FileTable, StagedWrite, Staging};
use super::{DriverError, Query, QueryOutput, StorageDriver};
use crate::row::StatsRow;

/// Magic prefix guarding against decoding foreign files.
const MAGIC: &[u8; 4] = b"STK1";

/// On-disk image of the whole table.
#[derive(Debug, Default, Serialize, Deserialize)]
struct Image {
    schema_version: u32,
    rows: Vec<StatsRow>,
}

struct BinaryTable {
    path: PathBuf,
    schema_version: u32,
    rows: BTreeMap<String, StatsRow>,
}

impl BinaryTable {
    fn load(path: PathBuf) -> Result<Self, DriverError> {
        if !path.exists() {
            return Ok(Self {
                path,
                schema_version: 0,
                rows: BTreeMap::new(),
            });
        }
        let bytes = std::fs::read(&path)?;
        let payload = bytes
            .strip_prefix(MAGIC.as_slice())
            .ok_or_else(|| DriverError::Corrupt(format!("{}: bad header", path.display())))?;
        let image: Image = bitcode::deserialize(payload)
            .map_err(|e| DriverError::Corrupt(format!("{}: {}", path.display(), e)))?;
        Ok(Self {
            path,
            schema_version: image.schema_version,
            rows: image
                .rows
                .into_iter()
                .map(|row| (row.external_id.clone(), row))
                .collect(),
        })
    }

    fn persist(&self, schema_version: u32, rows: &BTreeMap<String, StatsRow>) -> Result<(), DriverError> {
        let image = Image {
            schema_version,
            rows: rows.values().cloned().collect(),
        };
        let mut bytes = MAGIC.to_vec();
        bytes.extend(bitcode::serialize(&image)?);

        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let tmp = self.path.with_extension("bin.tmp");
        std::fs::write(&tmp, &bytes)?;
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

impl FileTable for BinaryTable {
    fn read_row(&self, external_id: &str) -> Result<Option<StatsRow>, DriverError> {
        Ok(self.rows.get(external_id).cloned())
    }

    fn read_all(&self) -> Result<Vec<StatsRow>, DriverError> {
        Ok(self.rows.values().cloned().collect())
    }

    fn read_version(&self) -> Result<u32, DriverError> {
        Ok(self.schema_version)
    }

    fn create_schema(&mut self) -> Result<(), DriverError> {
        if !self.path.exists() {
            self.persist(self.schema_version, &self.rows)?;
        }
        Ok(())
    }

    /// Apply to a copy, write the copy, and only then swap it in, so a failed
    /// write leaves memory and disk in agreement.
    fn apply(&mut self, writes: Vec<StagedWrite>) -> Result<(), DriverError> {
        let mut rows = self.rows.clone();
        let mut version = self.schema_version;
        for write in writes {
            match write {
                StagedWrite::Put(row) => {
                    rows.insert(row.external_id.clone(), row);
                }
                StagedWrite::Remove(external_id) => {
                    rows.remove(&external_id);
                }
                StagedWrite::Version(v) => version = v,
            }
        }
        self.persist(version, &rows)?;
        self.rows = rows;
        self.schema_version = version;
        Ok(())
    }
}

struct Inner {
    table: BinaryTable,
    staging: Staging,
}

/// Embedded binary store: the whole table in one `bitcode`-encoded file,
/// rewritten atomically on every commit.
pub struct BinaryFileDriver {
    dir: PathBuf,
    inner: Mutex<Inner>,
    connected: AtomicBool,
}

impl BinaryFileDriver {
    /// Open the database `name` inside `dir`, decoding any existing file.
    pub fn open(dir: PathBuf, name: &str) -> Result<Self, DriverError> {
        std::fs::create_dir_all(&dir)?;
        let table = BinaryTable::load(dir.join(format!("{name}.bin")))?;
        Ok(Self {
            dir,
            inner: Mutex::new(Inner {
                table,
                staging: Staging::default(),
            }),
            connected: AtomicBool::new(true),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn lock(&self) -> Result<MutexGuard<'_, Inner>, DriverError> {
        if !self.connected.load(Ordering::Acquire) {
            return Err(DriverError::NotConnected);
        }
        self.inner
            .lock()
            .map_err(|_| DriverError::Other("binary driver lock poisoned".into()))
    }
}

impl StorageDriver for BinaryFileDriver {
    async fn execute(&self, query: Query) -> Result<QueryOutput, DriverError> {
        let mut guard = self.lock()?;
        let Inner { table, staging } = &mut *guard;
        staging::execute(table, staging, query)
    }

    async fn begin_transaction(&self) -> Result<(), DriverError> {
        self.lock()?.staging.begin()
    }

    async fn commit(&self) -> Result<(), DriverError> {
        let mut guard = self.lock()?;
        let Inner { table, staging } = &mut *guard;
        let writes = staging.take()?;
        table.apply(writes)
    }

    async fn rollback(&self) -> Result<(), DriverError> {
        self.lock()?.staging.discard()
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire) && self.dir.is_dir()
    }

    /// Rewrite the file from the in-memory image, dropping any slack left by
    /// earlier encodings.
    async fn optimize_storage(&self) -> bool {
        let Ok(guard) = self.lock() else {
            return false;
        };
        match guard.table.persist(guard.table.schema_version, &guard.table.rows) {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!("Binary store compaction failed: {}", e);
                false
            }
        }
    }

    async fn close(&self) -> Result<(), DriverError> {
        if let Ok(mut guard) = self.inner.lock() {
            let _ = guard.staging.discard();
        }
        self.connected.store(false, Ordering::Release);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::row::sample_row;

    #[tokio::test]
    async fn test_commit_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let driver = BinaryFileDriver::open(dir.path().to_path_buf(), "stats").unwrap();
            driver.execute(Query::CreateSchema).await.unwrap();
            driver.begin_transaction().await.unwrap();
            driver
                .execute(Query::InsertStats(sample_row("p1", 11)))
                .await
                .unwrap();
            driver.execute(Query::WriteSchemaVersion(3)).await.unwrap();
            driver.commit().await.unwrap();
        }

        let driver = BinaryFileDriver::open(dir.path().to_path_buf(), "stats").unwrap();
        let row = driver
            .execute(Query::FindStats {
                external_id: "p1".into(),
            })
            .await
            .unwrap()
            .into_row()
            .unwrap()
            .unwrap();
        assert_eq!(row.kills, 11);
        let version = driver
            .execute(Query::ReadSchemaVersion)
            .await
            .unwrap()
            .into_version()
            .unwrap();
        assert_eq!(version, 3);
    }

    #[tokio::test]
    async fn test_rollback_discards() {
        let dir = tempfile::tempdir().unwrap();
        let driver = BinaryFileDriver::open(dir.path().to_path_buf(), "stats").unwrap();
        driver.begin_transaction().await.unwrap();
        driver
            .execute(Query::InsertStats(sample_row("p1", 1)))
            .await
            .unwrap();
        driver.rollback().await.unwrap();
        assert!(!dir.path().join("stats.bin").exists());
    }

    #[test]
    fn test_garbage_file_is_corrupt() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("stats.bin"), b"garbage").unwrap();
        let result = BinaryFileDriver::open(dir.path().to_path_buf(), "stats");
        assert!(matches!(result, Err(DriverError::Corrupt(_))));
    }

    #[tokio::test]
    async fn test_top_stats_orders_by_field() {
        let dir = tempfile::tempdir().unwrap();
        let driver = BinaryFileDriver::open(dir.path().to_path_buf(), "stats").unwrap();
        for (id, kills) in [("a", 3), ("b", 9), ("c", 6)] {
            driver
                .execute(Query::InsertStats(sample_row(id, kills)))
                .await
                .unwrap();
        }
        let top = driver
            .execute(Query::TopStats {
                field: player_stats::StatField::Kills,
                limit: 2,
            })
            .await
            .unwrap()
            .into_rows()
            .unwrap();
        let ids: Vec<&str> = top.iter().map(|r| r.external_id.as_str()).collect();
        assert_eq!(ids, vec!["b", "c"]);
    }
}
