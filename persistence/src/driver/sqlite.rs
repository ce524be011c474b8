//! SQLite-backed driver for the relational backend types.
//!
//! Wraps a `sqlx::SqlitePool` configured with WAL journaling. A transaction
//! opened through [`StorageDriver::begin_transaction`] pins one pooled
//! connection until commit or rollback; queries issued meanwhile run on it.

use sqlx::sqlite::{
    SqliteConnectOptions, SqliteConnection, SqliteJournalMode, SqlitePoolOptions,
    SqliteSynchronous,
};
use sqlx::{Sqlite, SqlitePool, Transaction};
use std::str::FromStr;
use tokio::sync::Mutex;

use player_stats::StatField;

use super::{DriverError, Query, QueryOutput, StorageDriver};
use crate::row::StatsRow;

const CREATE_SCHEMA: [&str; 2] = [
    r#"
    CREATE TABLE IF NOT EXISTS schema_info (
        id      INTEGER PRIMARY KEY CHECK (id = 1),
        version INTEGER NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS player_stats (
        external_id           TEXT PRIMARY KEY,
        display_name          TEXT NOT NULL,
        kills                 INTEGER NOT NULL DEFAULT 0,
        deaths                INTEGER NOT NULL DEFAULT 0,
        bases_captured        INTEGER NOT NULL DEFAULT 0,
        bases_lost            INTEGER NOT NULL DEFAULT 0,
        experience            INTEGER NOT NULL DEFAULT 0,
        player_rank           INTEGER NOT NULL DEFAULT 0,
        supplies_delivered    INTEGER NOT NULL DEFAULT 0,
        supply_deliveries     INTEGER NOT NULL DEFAULT 0,
        ai_kills              INTEGER NOT NULL DEFAULT 0,
        vehicle_kills         INTEGER NOT NULL DEFAULT 0,
        air_kills             INTEGER NOT NULL DEFAULT 0,
        connection_time       REAL NOT NULL DEFAULT 0,
        last_session_duration REAL NOT NULL DEFAULT 0,
        total_playtime        REAL NOT NULL DEFAULT 0,
        killed_by             TEXT NOT NULL DEFAULT '[]',
        killed_by_weapon      TEXT NOT NULL DEFAULT '[]',
        killed_by_team        TEXT NOT NULL DEFAULT '[]',
        created_at            INTEGER NOT NULL,
        updated_at            INTEGER NOT NULL
    )
    "#,
];

const SELECT_COLUMNS: &str = r#"
    SELECT external_id, display_name, kills, deaths, bases_captured, bases_lost,
           experience, player_rank, supplies_delivered, supply_deliveries,
           ai_kills, vehicle_kills, air_kills, connection_time,
           last_session_duration, total_playtime, killed_by, killed_by_weapon,
           killed_by_team, created_at, updated_at
    FROM player_stats
"#;

/// Row type for stats queries, mapped via `sqlx::FromRow`.
#[derive(sqlx::FromRow)]
struct StatsRecordRow {
    external_id: String,
    display_name: String,
    kills: i64,
    deaths: i64,
    bases_captured: i64,
    bases_lost: i64,
    experience: i64,
    player_rank: i64,
    supplies_delivered: i64,
    supply_deliveries: i64,
    ai_kills: i64,
    vehicle_kills: i64,
    air_kills: i64,
    connection_time: f64,
    last_session_duration: f64,
    total_playtime: f64,
    killed_by: String,
    killed_by_weapon: String,
    killed_by_team: String,
    created_at: i64,
    updated_at: i64,
}

impl StatsRecordRow {
    fn into_row(self) -> Result<StatsRow, DriverError> {
        let decode = |column: &str, raw: &str| -> Result<Vec<String>, DriverError> {
            serde_json::from_str(raw).map_err(|e| {
                DriverError::Corrupt(format!("{column} of {}: {e}", self.external_id))
            })
        };
        let killed_by = decode("killed_by", &self.killed_by)?;
        let killed_by_weapon = decode("killed_by_weapon", &self.killed_by_weapon)?;
        let killed_by_team = decode("killed_by_team", &self.killed_by_team)?;

        Ok(StatsRow {
            external_id: self.external_id,
            display_name: self.display_name,
            kills: self.kills,
            deaths: self.deaths,
            bases_captured: self.bases_captured,
            bases_lost: self.bases_lost,
            experience: self.experience,
            rank: self.player_rank,
            supplies_delivered: self.supplies_delivered,
            supply_deliveries: self.supply_deliveries,
            ai_kills: self.ai_kills,
            vehicle_kills: self.vehicle_kills,
            air_kills: self.air_kills,
            connection_time: self.connection_time,
            last_session_duration: self.last_session_duration,
            total_playtime: self.total_playtime,
            killed_by,
            killed_by_weapon,
            killed_by_team,
            created_at: self.created_at.max(0) as u64,
            updated_at: self.updated_at.max(0) as u64,
        })
    }
}

fn column(field: StatField) -> &'static str {
    match field {
        StatField::Rank => "player_rank",
        other => other.as_str(),
    }
}

/// SQLite implementation of [`StorageDriver`].
pub struct SqliteDriver {
    pool: SqlitePool,
    tx: Mutex<Option<Transaction<'static, Sqlite>>>,
}

impl SqliteDriver {
    /// Connect to the database at `url` (`sqlite:path` or `sqlite::memory:`).
    pub async fn connect(url: &str) -> Result<Self, DriverError> {
        let in_memory = url.contains(":memory:");
        let options = SqliteConnectOptions::from_str(url)?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal);

        // Every connection to `:memory:` is a separate database.
        let max_connections = if in_memory { 1 } else { 5 };
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(options)
            .await?;

        Ok(Self {
            pool,
            tx: Mutex::new(None),
        })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    fn ensure_open(&self) -> Result<(), DriverError> {
        if self.pool.is_closed() {
            return Err(DriverError::NotConnected);
        }
        Ok(())
    }
}

async fn run(conn: &mut SqliteConnection, query: Query) -> Result<QueryOutput, DriverError> {
    match query {
        Query::Ping => {
            let row: (i64,) = sqlx::query_as("SELECT 1").fetch_one(&mut *conn).await?;
            if row.0 != 1 {
                return Err(DriverError::Other("ping returned unexpected value".into()));
            }
            Ok(QueryOutput::Ack)
        }
        Query::ReadSchemaVersion => {
            let exists: (i64,) = sqlx::query_as(
                "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = 'schema_info'",
            )
            .fetch_one(&mut *conn)
            .await?;
            if exists.0 == 0 {
                return Ok(QueryOutput::Version(0));
            }
            let row: Option<(i64,)> = sqlx::query_as("SELECT version FROM schema_info WHERE id = 1")
                .fetch_optional(&mut *conn)
                .await?;
            Ok(QueryOutput::Version(
                row.map(|r| r.0.max(0) as u32).unwrap_or(0),
            ))
        }
        Query::WriteSchemaVersion(version) => {
            sqlx::query("INSERT OR REPLACE INTO schema_info (id, version) VALUES (1, ?)")
                .bind(version as i64)
                .execute(&mut *conn)
                .await?;
            Ok(QueryOutput::Ack)
        }
        Query::CreateSchema => {
            for statement in CREATE_SCHEMA {
                sqlx::query(statement).execute(&mut *conn).await?;
            }
            Ok(QueryOutput::Ack)
        }
        Query::FindStats { external_id } => {
            let row: Option<StatsRecordRow> =
                sqlx::query_as(&format!("{SELECT_COLUMNS} WHERE external_id = ?"))
                    .bind(&external_id)
                    .fetch_optional(&mut *conn)
                    .await?;
            Ok(QueryOutput::Row(row.map(StatsRecordRow::into_row).transpose()?))
        }
        Query::InsertStats(row) => {
            let exists: Option<(String,)> =
                sqlx::query_as("SELECT external_id FROM player_stats WHERE external_id = ?")
                    .bind(&row.external_id)
                    .fetch_optional(&mut *conn)
                    .await?;
            if exists.is_some() {
                return Err(DriverError::Duplicate(row.external_id));
            }
            write_row(conn, &row, "INSERT").await
        }
        Query::UpdateStats(row) => {
            let exists: Option<(String,)> =
                sqlx::query_as("SELECT external_id FROM player_stats WHERE external_id = ?")
                    .bind(&row.external_id)
                    .fetch_optional(&mut *conn)
                    .await?;
            if exists.is_none() {
                return Err(DriverError::Missing(row.external_id));
            }
            write_row(conn, &row, "REPLACE").await
        }
        Query::DeleteStats { external_id } => {
            let result = sqlx::query("DELETE FROM player_stats WHERE external_id = ?")
                .bind(&external_id)
                .execute(&mut *conn)
                .await?;
            Ok(QueryOutput::Affected(result.rows_affected()))
        }
        Query::ListStats => {
            let rows: Vec<StatsRecordRow> =
                sqlx::query_as(&format!("{SELECT_COLUMNS} ORDER BY external_id ASC"))
                    .fetch_all(&mut *conn)
                    .await?;
            Ok(QueryOutput::Rows(decode_rows(rows)))
        }
        Query::TopStats { field, limit } => {
            let sql = format!(
                "{SELECT_COLUMNS} ORDER BY {} DESC, external_id ASC LIMIT ?",
                column(field)
            );
            let rows: Vec<StatsRecordRow> = sqlx::query_as(&sql)
                .bind(limit as i64)
                .fetch_all(&mut *conn)
                .await?;
            Ok(QueryOutput::Rows(decode_rows(rows)))
        }
    }
}

/// Decode rows for bulk reads, skipping the ones that fail to decode.
fn decode_rows(rows: Vec<StatsRecordRow>) -> Vec<StatsRow> {
    rows.into_iter()
        .filter_map(|row| match row.into_row() {
            Ok(row) => Some(row),
            Err(e) => {
                tracing::warn!("Skipping undecodable stats row: {}", e);
                None
            }
        })
        .collect()
}

async fn write_row(
    conn: &mut SqliteConnection,
    row: &StatsRow,
    verb: &str,
) -> Result<QueryOutput, DriverError> {
    let sql = format!(
        r#"
        {verb} INTO player_stats
            (external_id, display_name, kills, deaths, bases_captured, bases_lost,
             experience, player_rank, supplies_delivered, supply_deliveries,
             ai_kills, vehicle_kills, air_kills, connection_time,
             last_session_duration, total_playtime, killed_by, killed_by_weapon,
             killed_by_team, created_at, updated_at)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#
    );
    let result = sqlx::query(&sql)
        .bind(&row.external_id)
        .bind(&row.display_name)
        .bind(row.kills)
        .bind(row.deaths)
        .bind(row.bases_captured)
        .bind(row.bases_lost)
        .bind(row.experience)
        .bind(row.rank)
        .bind(row.supplies_delivered)
        .bind(row.supply_deliveries)
        .bind(row.ai_kills)
        .bind(row.vehicle_kills)
        .bind(row.air_kills)
        .bind(row.connection_time)
        .bind(row.last_session_duration)
        .bind(row.total_playtime)
        .bind(serde_json::to_string(&row.killed_by)?)
        .bind(serde_json::to_string(&row.killed_by_weapon)?)
        .bind(serde_json::to_string(&row.killed_by_team)?)
        .bind(row.created_at as i64)
        .bind(row.updated_at as i64)
        .execute(&mut *conn)
        .await?;
    Ok(QueryOutput::Affected(result.rows_affected()))
}

impl StorageDriver for SqliteDriver {
    async fn execute(&self, query: Query) -> Result<QueryOutput, DriverError> {
        self.ensure_open()?;
        let mut tx = self.tx.lock().await;
        match tx.as_mut() {
            Some(tx) => run(tx, query).await,
            None => {
                let mut conn = self.pool.acquire().await?;
                run(&mut conn, query).await
            }
        }
    }

    async fn begin_transaction(&self) -> Result<(), DriverError> {
        self.ensure_open()?;
        let mut tx = self.tx.lock().await;
        if tx.is_some() {
            return Err(DriverError::TransactionActive);
        }
        *tx = Some(self.pool.begin().await?);
        Ok(())
    }

    async fn commit(&self) -> Result<(), DriverError> {
        let tx = self.tx.lock().await.take().ok_or(DriverError::NoTransaction)?;
        tx.commit().await?;
        Ok(())
    }

    async fn rollback(&self) -> Result<(), DriverError> {
        let tx = self.tx.lock().await.take().ok_or(DriverError::NoTransaction)?;
        tx.rollback().await?;
        Ok(())
    }

    fn is_connected(&self) -> bool {
        !self.pool.is_closed()
    }

    async fn optimize_storage(&self) -> bool {
        if self.ensure_open().is_err() || self.tx.lock().await.is_some() {
            return false;
        }
        for statement in ["PRAGMA optimize", "VACUUM"] {
            if let Err(e) = sqlx::query(statement).execute(&self.pool).await {
                tracing::warn!("SQLite maintenance step {:?} failed: {}", statement, e);
                return false;
            }
        }
        true
    }

    async fn close(&self) -> Result<(), DriverError> {
        if let Some(tx) = self.tx.lock().await.take() {
            let _ = tx.rollback().await;
        }
        self.pool.close().await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::row::sample_row;

    async fn test_db() -> SqliteDriver {
        let driver = SqliteDriver::connect("sqlite::memory:").await.unwrap();
        driver.execute(Query::CreateSchema).await.unwrap();
        driver
    }

    #[tokio::test]
    async fn test_ping() {
        let driver = test_db().await;
        assert_eq!(driver.execute(Query::Ping).await.unwrap(), QueryOutput::Ack);
    }

    #[tokio::test]
    async fn test_schema_version_defaults_to_zero() {
        let driver = SqliteDriver::connect("sqlite::memory:").await.unwrap();
        let version = driver
            .execute(Query::ReadSchemaVersion)
            .await
            .unwrap()
            .into_version()
            .unwrap();
        assert_eq!(version, 0);

        driver.execute(Query::CreateSchema).await.unwrap();
        driver.execute(Query::WriteSchemaVersion(2)).await.unwrap();
        let version = driver
            .execute(Query::ReadSchemaVersion)
            .await
            .unwrap()
            .into_version()
            .unwrap();
        assert_eq!(version, 2);
    }

    #[tokio::test]
    async fn test_insert_find_roundtrip() {
        let driver = test_db().await;
        let mut row = sample_row("p1", 12);
        row.killed_by = vec!["Sniper".into()];
        row.killed_by_weapon = vec!["M21".into()];
        row.killed_by_team = vec!["US".into()];
        driver.execute(Query::InsertStats(row.clone())).await.unwrap();

        let found = driver
            .execute(Query::FindStats {
                external_id: "p1".into(),
            })
            .await
            .unwrap()
            .into_row()
            .unwrap();
        assert_eq!(found, Some(row));
    }

    #[tokio::test]
    async fn test_rollback_discards_insert() {
        let driver = test_db().await;
        driver.begin_transaction().await.unwrap();
        driver
            .execute(Query::InsertStats(sample_row("p1", 1)))
            .await
            .unwrap();
        driver.rollback().await.unwrap();

        let rows = driver.execute(Query::ListStats).await.unwrap().into_rows().unwrap();
        assert!(rows.is_empty());
    }

    #[tokio::test]
    async fn test_update_missing_row_fails() {
        let driver = test_db().await;
        let err = driver
            .execute(Query::UpdateStats(sample_row("ghost", 1)))
            .await
            .unwrap_err();
        assert!(matches!(err, DriverError::Missing(_)));
    }

    #[tokio::test]
    async fn test_top_by_rank_uses_renamed_column() {
        let driver = test_db().await;
        for (id, rank) in [("a", 1), ("b", 4), ("c", 2)] {
            let mut row = sample_row(id, 0);
            row.rank = rank;
            driver.execute(Query::InsertStats(row)).await.unwrap();
        }
        let top = driver
            .execute(Query::TopStats {
                field: StatField::Rank,
                limit: 2,
            })
            .await
            .unwrap()
            .into_rows()
            .unwrap();
        let ids: Vec<&str> = top.iter().map(|r| r.external_id.as_str()).collect();
        assert_eq!(ids, vec!["b", "c"]);
    }

    #[tokio::test]
    async fn test_delete_reports_affected_rows() {
        let driver = test_db().await;
        driver
            .execute(Query::InsertStats(sample_row("p1", 1)))
            .await
            .unwrap();
        let deleted = driver
            .execute(Query::DeleteStats {
                external_id: "p1".into(),
            })
            .await
            .unwrap()
            .into_affected()
            .unwrap();
        assert_eq!(deleted, 1);
    }

    #[tokio::test]
    async fn test_close_marks_disconnected() {
        let driver = test_db().await;
        driver.close().await.unwrap();
        assert!(!driver.is_connected());
        assert!(matches!(
            driver.execute(Query::Ping).await,
            Err(DriverError::NotConnected)
        ));
    }
}
