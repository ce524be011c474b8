use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};

use super::staging::{self, FileTable, StagedWrite, Staging};
use super::{DriverError, Query, QueryOutput, StorageDriver};
use crate::row::StatsRow;

const PLAYERS_DIR: &str = "players";
const SCHEMA_FILE: &str = "schema.json";

#[derive(Debug, Default, Serialize, Deserialize)]
struct SchemaFile {
    version: u32,
}

/// JSON-file-per-player table inside one database directory.
struct JsonTable {
    dir: PathBuf,
}

impl JsonTable {
    fn players_dir(&self) -> PathBuf {
        self.dir.join(PLAYERS_DIR)
    }

    fn file_path(&self, external_id: &str) -> PathBuf {
        self.players_dir()
            .join(format!("{}.json", file_stem(external_id)))
    }

    fn schema_path(&self) -> PathBuf {
        self.dir.join(SCHEMA_FILE)
    }
}

/// Map an external id onto a file-system-safe, collision-free stem.
fn file_stem(external_id: &str) -> String {
    let mut stem = String::with_capacity(external_id.len());
    for byte in external_id.bytes() {
        if byte.is_ascii_alphanumeric() || byte == b'-' {
            stem.push(byte as char);
        } else {
            stem.push_str(&format!("_{byte:02x}"));
        }
    }
    stem
}

/// Write via a sibling temp file and rename, so readers never see a
/// half-written file.
fn write_atomic(path: &Path, contents: &[u8]) -> std::io::Result<()> {
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, contents)?;
    std::fs::rename(&tmp, path)
}

impl FileTable for JsonTable {
    fn read_row(&self, external_id: &str) -> Result<Option<StatsRow>, DriverError> {
        let path = self.file_path(external_id);
        if !path.exists() {
            return Ok(None);
        }
        let contents = std::fs::read_to_string(&path)?;
        let row = serde_json::from_str(&contents)
            .map_err(|e| DriverError::Corrupt(format!("{}: {}", path.display(), e)))?;
        Ok(Some(row))
    }

    fn contains_row(&self, external_id: &str) -> Result<bool, DriverError> {
        Ok(self.file_path(external_id).exists())
    }

    /// Load every player file, skipping files that fail to parse.
    fn read_all(&self) -> Result<Vec<StatsRow>, DriverError> {
        let dir = self.players_dir();
        if !dir.exists() {
            return Ok(vec![]);
        }
        let mut rows = Vec::new();
        for entry in std::fs::read_dir(&dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            match std::fs::read_to_string(&path) {
                Ok(contents) => match serde_json::from_str::<StatsRow>(&contents) {
                    Ok(row) => rows.push(row),
                    Err(e) => tracing::warn!("Skipping unreadable stats file {:?}: {}", path, e),
                },
                Err(e) => tracing::warn!("Failed to read file {:?}: {}", path, e),
            }
        }
        Ok(rows)
    }

    fn read_version(&self) -> Result<u32, DriverError> {
        let path = self.schema_path();
        if !path.exists() {
            return Ok(0);
        }
        let contents = std::fs::read_to_string(&path)?;
        let schema: SchemaFile = serde_json::from_str(&contents)
            .map_err(|e| DriverError::Corrupt(format!("{}: {}", path.display(), e)))?;
        Ok(schema.version)
    }

    fn create_schema(&mut self) -> Result<(), DriverError> {
        std::fs::create_dir_all(self.players_dir())?;
        Ok(())
    }

    fn apply(&mut self, writes: Vec<StagedWrite>) -> Result<(), DriverError> {
        for write in writes {
            match write {
                StagedWrite::Put(row) => {
                    std::fs::create_dir_all(self.players_dir())?;
                    let json = serde_json::to_string_pretty(&row)?;
                    write_atomic(&self.file_path(&row.external_id), json.as_bytes())?;
                }
                StagedWrite::Remove(external_id) => {
                    let path = self.file_path(&external_id);
                    if path.exists() {
                        std::fs::remove_file(&path)?;
                    }
                }
                StagedWrite::Version(version) => {
                    let json = serde_json::to_string_pretty(&SchemaFile { version })?;
                    write_atomic(&self.schema_path(), json.as_bytes())?;
                }
            }
        }
        Ok(())
    }
}

struct Inner {
    table: JsonTable,
    staging: Staging,
}

/// Embedded JSON store: one pretty-printed file per player under
/// `<dir>/players/`, and the schema version in `<dir>/schema.json`.
pub struct JsonFileDriver {
    dir: PathBuf,
    inner: Mutex<Inner>,
    connected: AtomicBool,
}

impl JsonFileDriver {
    /// Open (or create) the database directory.
    pub fn open(dir: PathBuf) -> Result<Self, DriverError> {
        std::fs::create_dir_all(&dir)?;
        // Fail early on a directory we cannot list.
        std::fs::read_dir(&dir)?;
        Ok(Self {
            dir: dir.clone(),
            inner: Mutex::new(Inner {
                table: JsonTable { dir },
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
            .map_err(|_| DriverError::Other("json driver lock poisoned".into()))
    }
}

impl StorageDriver for JsonFileDriver {
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

    /// Sweep temp files left behind by interrupted writes.
    async fn optimize_storage(&self) -> bool {
        let Ok(guard) = self.lock() else {
            return false;
        };
        let players = guard.table.players_dir();
        let Ok(entries) = std::fs::read_dir(&players) else {
            return !players.exists();
        };
        let mut ok = true;
        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) == Some("tmp") {
                if let Err(e) = std::fs::remove_file(&path) {
                    tracing::warn!("Failed to remove stale temp file {:?}: {}", path, e);
                    ok = false;
                }
            }
        }
        ok
    }

    async fn close(&self) -> Result<(), DriverError> {
        if let Ok(mut guard) = self.inner.lock() {
            let _ = guard.staging.discard();
        }
        self.connected.store(false, Ordering::Release);
        Ok(())
    }
}
