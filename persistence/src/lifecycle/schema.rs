//! Schema versioning.
//!
//! The stored version is read once per connection. Version 0 means an empty
//! store; every step from the stored version up to
//! [`CURRENT_SCHEMA_VERSION`] runs and the new version is stamped in the same
//! transaction. A store that is already current sees no writes at all.

use crate::driver::{Query, StorageDriver};
use crate::error::PersistenceError;
use crate::retry::RetryPolicy;

pub const CURRENT_SCHEMA_VERSION: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchemaOutcome {
    Created,
    Upgraded { from: u32 },
    Current,
    /// Written by a newer build. Kept as is.
    Newer { stored: u32 },
}

impl SchemaOutcome {
    /// Version the store holds after the check.
    pub fn version(&self) -> u32 {
        match self {
            SchemaOutcome::Newer { stored } => *stored,
            _ => CURRENT_SCHEMA_VERSION,
        }
    }
}

/// Statements that bring a store from `target - 1` to `target`.
fn upgrade_step(target: u32) -> Vec<Query> {
    match target {
        1 => vec![Query::CreateSchema],
        _ => vec![],
    }
}

pub async fn ensure_schema<D: StorageDriver>(
    driver: &D,
    retry: RetryPolicy,
) -> Result<SchemaOutcome, PersistenceError> {
    let stored = retry
        .run("read_schema_version", move || driver.execute(Query::ReadSchemaVersion))
        .await?
        .into_version()?;

    if stored == CURRENT_SCHEMA_VERSION {
        tracing::debug!(version = stored, "Schema is current");
        return Ok(SchemaOutcome::Current);
    }
    if stored > CURRENT_SCHEMA_VERSION {
        tracing::warn!(
            stored,
            expected = CURRENT_SCHEMA_VERSION,
            "Stored schema is newer than this build; continuing"
        );
        return Ok(SchemaOutcome::Newer { stored });
    }

    driver.begin_transaction().await?;
    let result = async {
        for target in (stored + 1)..=CURRENT_SCHEMA_VERSION {
            for query in upgrade_step(target) {
                driver.execute(query).await?;
            }
            tracing::debug!(version = target, "Applied schema step");
        }
        driver
            .execute(Query::WriteSchemaVersion(CURRENT_SCHEMA_VERSION))
            .await?;
        driver.commit().await
    }
    .await;

    if let Err(e) = result {
        if let Err(rollback_err) = driver.rollback().await {
            tracing::warn!("Rollback after failed schema upgrade failed: {}", rollback_err);
        }
        return Err(PersistenceError::InitializationFailed(format!(
            "schema upgrade from version {stored} failed: {e}"
        )));
    }

    if stored == 0 {
        tracing::info!(version = CURRENT_SCHEMA_VERSION, "Created schema");
        Ok(SchemaOutcome::Created)
    } else {
        tracing::info!(
            from = stored,
            to = CURRENT_SCHEMA_VERSION,
            "Upgraded schema"
        );
        Ok(SchemaOutcome::Upgraded { from: stored })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::{Connector, ScriptedConnector};
    use crate::test_support::json_params;

    #[tokio::test]
    async fn test_empty_store_is_created_and_stamped() {
        let connector = ScriptedConnector::new();
        let driver = connector.connect(&json_params()).await.unwrap();
        let outcome = ensure_schema(&driver, RetryPolicy::once()).await.unwrap();
        assert_eq!(outcome, SchemaOutcome::Created);
        assert_eq!(connector.schema_version(), CURRENT_SCHEMA_VERSION);
    }

    #[tokio::test]
    async fn test_second_check_writes_nothing() {
        let connector = ScriptedConnector::new();
        let driver = connector.connect(&json_params()).await.unwrap();
        ensure_schema(&driver, RetryPolicy::once()).await.unwrap();
        assert_eq!(connector.calls("write_schema_version"), 1);

        let driver = connector.connect(&json_params()).await.unwrap();
        let outcome = ensure_schema(&driver, RetryPolicy::once()).await.unwrap();
        assert_eq!(outcome, SchemaOutcome::Current);
        assert_eq!(connector.calls("write_schema_version"), 1);
    }

    #[tokio::test]
    async fn test_newer_store_is_left_alone() {
        let connector = ScriptedConnector::new();
        connector.set_schema_version(CURRENT_SCHEMA_VERSION + 4);
        let driver = connector.connect(&json_params()).await.unwrap();
        let outcome = ensure_schema(&driver, RetryPolicy::once()).await.unwrap();
        assert_eq!(
            outcome,
            SchemaOutcome::Newer {
                stored: CURRENT_SCHEMA_VERSION + 4
            }
        );
        assert_eq!(connector.calls("write_schema_version"), 0);
    }

    #[tokio::test]
    async fn test_failed_upgrade_rolls_back() {
        let connector = ScriptedConnector::new();
        connector.fail_next("commit", 1);
        let driver = connector.connect(&json_params()).await.unwrap();
        let err = ensure_schema(&driver, RetryPolicy::once()).await.unwrap_err();
        assert!(matches!(err, PersistenceError::InitializationFailed(_)));
        assert_eq!(connector.schema_version(), 0);
        assert_eq!(connector.calls("rollback"), 1);
    }
}
