//! Query execution shared by the file-backed drivers.
//!
//! File drivers keep their committed data behind a [`FileTable`] and buffer
//! writes made inside a transaction in a [`Staging`] area. Reads inside a
//! transaction see the staged writes; nothing touches disk until commit.

use std::collections::BTreeMap;

use super::{DriverError, Query, QueryOutput};
use crate::row::{top_rows, StatsRow};

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum StagedWrite {
    Put(StatsRow),
    Remove(String),
    Version(u32),
}

/// Committed storage of a file driver.
pub(crate) trait FileTable {
    fn read_row(&self, external_id: &str) -> Result<Option<StatsRow>, DriverError>;
    /// Whether a committed row exists, without decoding it. An unreadable
    /// row still counts as present so it can be overwritten or removed.
    fn contains_row(&self, external_id: &str) -> Result<bool, DriverError> {
        Ok(self.read_row(external_id)?.is_some())
    }
    fn read_all(&self) -> Result<Vec<StatsRow>, DriverError>;
    fn read_version(&self) -> Result<u32, DriverError>;
    fn create_schema(&mut self) -> Result<(), DriverError>;
    /// Durably apply a batch of writes. Must be all-or-nothing as far as the
    /// backend allows.
    fn apply(&mut self, writes: Vec<StagedWrite>) -> Result<(), DriverError>;
}

/// Transaction buffer. `None` means auto-commit mode.
#[derive(Debug, Default)]
pub(crate) struct Staging {
    writes: Option<Vec<StagedWrite>>,
}

impl Staging {
    pub fn begin(&mut self) -> Result<(), DriverError> {
        if self.writes.is_some() {
            return Err(DriverError::TransactionActive);
        }
        self.writes = Some(Vec::new());
        Ok(())
    }

    pub fn take(&mut self) -> Result<Vec<StagedWrite>, DriverError> {
        self.writes.take().ok_or(DriverError::NoTransaction)
    }

    pub fn discard(&mut self) -> Result<(), DriverError> {
        self.take().map(|_| ())
    }

    /// Staged state of a row: `Some(Some(_))` put, `Some(None)` removed,
    /// `None` untouched by the open transaction.
    fn lookup(&self, external_id: &str) -> Option<Option<&StatsRow>> {
        self.writes.as_ref()?.iter().rev().find_map(|w| match w {
            StagedWrite::Put(row) if row.external_id == external_id => Some(Some(row)),
            StagedWrite::Remove(id) if id == external_id => Some(None),
            _ => None,
        })
    }

    fn version(&self) -> Option<u32> {
        self.writes.as_ref()?.iter().rev().find_map(|w| match w {
            StagedWrite::Version(v) => Some(*v),
            _ => None,
        })
    }
}

fn current_row<T: FileTable>(
    table: &T,
    staging: &Staging,
    external_id: &str,
) -> Result<Option<StatsRow>, DriverError> {
    match staging.lookup(external_id) {
        Some(staged) => Ok(staged.cloned()),
        None => table.read_row(external_id),
    }
}

fn row_exists<T: FileTable>(
    table: &T,
    staging: &Staging,
    external_id: &str,
) -> Result<bool, DriverError> {
    match staging.lookup(external_id) {
        Some(staged) => Ok(staged.is_some()),
        None => table.contains_row(external_id),
    }
}

fn current_rows<T: FileTable>(table: &T, staging: &Staging) -> Result<Vec<StatsRow>, DriverError> {
    let mut rows: BTreeMap<String, StatsRow> = table
        .read_all()?
        .into_iter()
        .map(|row| (row.external_id.clone(), row))
        .collect();
    if let Some(writes) = &staging.writes {
        for write in writes {
            match write {
                StagedWrite::Put(row) => {
                    rows.insert(row.external_id.clone(), row.clone());
                }
                StagedWrite::Remove(id) => {
                    rows.remove(id);
                }
                StagedWrite::Version(_) => {}
            }
        }
    }
    Ok(rows.into_values().collect())
}

/// Stage the write inside a transaction, or apply it right away.
fn write<T: FileTable>(
    table: &mut T,
    staging: &mut Staging,
    write: StagedWrite,
) -> Result<(), DriverError> {
    match staging.writes.as_mut() {
        Some(writes) => {
            writes.push(write);
            Ok(())
        }
        None => table.apply(vec![write]),
    }
}

pub(crate) fn execute<T: FileTable>(
    table: &mut T,
    staging: &mut Staging,
    query: Query,
) -> Result<QueryOutput, DriverError> {
    match query {
        Query::Ping => Ok(QueryOutput::Ack),
        Query::ReadSchemaVersion => {
            let version = match staging.version() {
                Some(v) => v,
                None => table.read_version()?,
            };
            Ok(QueryOutput::Version(version))
        }
        Query::WriteSchemaVersion(v) => {
            write(table, staging, StagedWrite::Version(v))?;
            Ok(QueryOutput::Ack)
        }
        Query::CreateSchema => {
            table.create_schema()?;
            Ok(QueryOutput::Ack)
        }
        Query::FindStats { external_id } => {
            Ok(QueryOutput::Row(current_row(table, staging, &external_id)?))
        }
        Query::InsertStats(row) => {
            if row_exists(table, staging, &row.external_id)? {
                return Err(DriverError::Duplicate(row.external_id));
            }
            write(table, staging, StagedWrite::Put(row))?;
            Ok(QueryOutput::Affected(1))
        }
        Query::UpdateStats(row) => {
            if !row_exists(table, staging, &row.external_id)? {
                return Err(DriverError::Missing(row.external_id));
            }
            write(table, staging, StagedWrite::Put(row))?;
            Ok(QueryOutput::Affected(1))
        }
        Query::DeleteStats { external_id } => {
            if !row_exists(table, staging, &external_id)? {
                return Ok(QueryOutput::Affected(0));
            }
            write(table, staging, StagedWrite::Remove(external_id))?;
            Ok(QueryOutput::Affected(1))
        }
        Query::ListStats => Ok(QueryOutput::Rows(current_rows(table, staging)?)),
        Query::TopStats { field, limit } => Ok(QueryOutput::Rows(top_rows(
            current_rows(table, staging)?,
            field,
            limit,
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::row::sample_row;

    /// Plain in-memory table for exercising the staging rules.
    #[derive(Default)]
    struct MemTable {
        rows: BTreeMap<String, StatsRow>,
        version: u32,
        applied_batches: usize,
    }

    impl FileTable for MemTable {
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
            self.applied_batches += 1;
            for w in writes {
                match w {
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

    #[test]
    fn autocommit_applies_immediately() {
        let mut table = MemTable::default();
        let mut staging = Staging::default();
        execute(&mut table, &mut staging, Query::InsertStats(sample_row("p1", 3))).unwrap();
        assert_eq!(table.rows.len(), 1);
        assert_eq!(table.applied_batches, 1);
    }

    #[test]
    fn transaction_reads_its_own_writes_and_defers_apply() {
        let mut table = MemTable::default();
        let mut staging = Staging::default();
        staging.begin().unwrap();
        execute(&mut table, &mut staging, Query::InsertStats(sample_row("p1", 3))).unwrap();

        let found = execute(
            &mut table,
            &mut staging,
            Query::FindStats {
                external_id: "p1".into(),
            },
        )
        .unwrap()
        .into_row()
        .unwrap();
        assert_eq!(found.unwrap().kills, 3);
        assert!(table.rows.is_empty());

        let writes = staging.take().unwrap();
        table.apply(writes).unwrap();
        assert_eq!(table.rows.len(), 1);
    }

    #[test]
    fn discard_drops_staged_writes() {
        let mut table = MemTable::default();
        let mut staging = Staging::default();
        staging.begin().unwrap();
        execute(&mut table, &mut staging, Query::WriteSchemaVersion(4)).unwrap();
        staging.discard().unwrap();
        assert_eq!(table.version, 0);
        assert!(matches!(staging.discard(), Err(DriverError::NoTransaction)));
    }

    #[test]
    fn insert_update_delete_rules() {
        let mut table = MemTable::default();
        let mut staging = Staging::default();
        execute(&mut table, &mut staging, Query::InsertStats(sample_row("p1", 1))).unwrap();

        let dup = execute(&mut table, &mut staging, Query::InsertStats(sample_row("p1", 2)));
        assert!(matches!(dup, Err(DriverError::Duplicate(_))));

        let missing = execute(&mut table, &mut staging, Query::UpdateStats(sample_row("p2", 2)));
        assert!(matches!(missing, Err(DriverError::Missing(_))));

        let gone = execute(
            &mut table,
            &mut staging,
            Query::DeleteStats {
                external_id: "p9".into(),
            },
        )
        .unwrap();
        assert_eq!(gone, QueryOutput::Affected(0));
    }

    #[test]
    fn nested_begin_is_rejected() {
        let mut staging = Staging::default();
        staging.begin().unwrap();
        assert!(matches!(staging.begin(), Err(DriverError::TransactionActive)));
    }
}
