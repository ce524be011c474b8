//! Tunables for the persistence subsystem.
//!
//! Values come from (later wins):
//! 1. built-in defaults
//! 2. an optional JSON config file
//! 3. `STATKEEP_*` environment variables
//!
//! The data directory resolves as `STATKEEP_DATA_DIR` (or `data_dir` in the
//! file), then the platform data directory, then `./data`.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use crate::backend::{validate_name, BackendType};
use crate::error::PersistenceError;

const ENV_PREFIX: &str = "STATKEEP_";
const DEV_DATA_DIR: &str = "./data";
const BACKUP_DIR: &str = "backups";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PersistenceConfig {
    pub backend: BackendType,
    pub database_name: String,
    pub connection_string: Option<String>,
    pub data_dir: Option<PathBuf>,
    pub backup_dir: Option<PathBuf>,

    /// Wall-clock ceiling on connection verification.
    pub connection_timeout_ms: u64,
    /// Round-trip attempts while verifying a new connection.
    pub max_retry_attempts: u32,
    pub retry_delay_base_ms: u64,
    /// Attempts for a repository lookup before the error propagates.
    pub query_retry_attempts: u32,
    pub query_retry_delay_ms: u64,

    pub backup_interval_minutes: u64,
    pub max_backups: usize,
    pub maintenance_interval_minutes: u64,

    pub max_pending_operations: usize,
    /// Failed drains before an operation moves to the dead-letter list.
    pub max_operation_attempts: u32,
    pub drain_interval_ms: u64,

    pub health_check_interval_ms: u64,
    /// Consecutive health-check failures that start recovery.
    pub recovery_failure_threshold: u32,
    pub recovery_interval_ms: u64,
    pub max_recovery_attempts: u32,

    /// Operations accepted per second. Zero disables the limit.
    pub rate_limit_per_second: u32,
    /// Player estimate used by best-settings backend selection.
    pub expected_players: Option<u32>,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            backend: BackendType::EmbeddedFileJson,
            database_name: "player_stats".to_string(),
            connection_string: None,
            data_dir: None,
            backup_dir: None,
            connection_timeout_ms: 5_000,
            max_retry_attempts: 3,
            retry_delay_base_ms: 100,
            query_retry_attempts: 3,
            query_retry_delay_ms: 50,
            backup_interval_minutes: 30,
            max_backups: 5,
            maintenance_interval_minutes: 60,
            max_pending_operations: 1_000,
            max_operation_attempts: 10,
            drain_interval_ms: 5_000,
            health_check_interval_ms: 30_000,
            recovery_failure_threshold: 3,
            recovery_interval_ms: 10_000,
            max_recovery_attempts: 10,
            rate_limit_per_second: 100,
            expected_players: None,
        }
    }
}

impl PersistenceConfig {
    /// Load from an optional JSON file, then apply environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self, PersistenceError> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply_overrides(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, PersistenceError> {
        let contents = std::fs::read_to_string(path).map_err(|e| {
            PersistenceError::InvalidConfig(format!("cannot read {}: {}", path.display(), e))
        })?;
        serde_json::from_str(&contents).map_err(|e| {
            PersistenceError::InvalidConfig(format!("cannot parse {}: {}", path.display(), e))
        })
    }

    /// Apply `STATKEEP_<FIELD>` overrides from `lookup`.
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<(), PersistenceError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |name: &str| lookup(&format!("{ENV_PREFIX}{name}"));

        if let Some(v) = get("BACKEND") {
            self.backend = v.parse().map_err(PersistenceError::InvalidConfig)?;
        }
        if let Some(v) = get("DATABASE_NAME") {
            self.database_name = v;
        }
        if let Some(v) = get("CONNECTION_STRING") {
            self.connection_string = Some(v).filter(|s| !s.is_empty());
        }
        if let Some(v) = get("DATA_DIR") {
            self.data_dir = Some(PathBuf::from(v));
        }
        if let Some(v) = get("BACKUP_DIR") {
            self.backup_dir = Some(PathBuf::from(v));
        }
        override_num(&get, "CONNECTION_TIMEOUT_MS", &mut self.connection_timeout_ms)?;
        override_num(&get, "MAX_RETRY_ATTEMPTS", &mut self.max_retry_attempts)?;
        override_num(&get, "RETRY_DELAY_BASE_MS", &mut self.retry_delay_base_ms)?;
        override_num(&get, "QUERY_RETRY_ATTEMPTS", &mut self.query_retry_attempts)?;
        override_num(&get, "QUERY_RETRY_DELAY_MS", &mut self.query_retry_delay_ms)?;
        override_num(&get, "BACKUP_INTERVAL_MINUTES", &mut self.backup_interval_minutes)?;
        override_num(&get, "MAX_BACKUPS", &mut self.max_backups)?;
        override_num(
            &get,
            "MAINTENANCE_INTERVAL_MINUTES",
            &mut self.maintenance_interval_minutes,
        )?;
        override_num(&get, "MAX_PENDING_OPERATIONS", &mut self.max_pending_operations)?;
        override_num(&get, "MAX_OPERATION_ATTEMPTS", &mut self.max_operation_attempts)?;
        override_num(&get, "DRAIN_INTERVAL_MS", &mut self.drain_interval_ms)?;
        override_num(&get, "HEALTH_CHECK_INTERVAL_MS", &mut self.health_check_interval_ms)?;
        override_num(
            &get,
            "RECOVERY_FAILURE_THRESHOLD",
            &mut self.recovery_failure_threshold,
        )?;
        override_num(&get, "RECOVERY_INTERVAL_MS", &mut self.recovery_interval_ms)?;
        override_num(&get, "MAX_RECOVERY_ATTEMPTS", &mut self.max_recovery_attempts)?;
        override_num(&get, "RATE_LIMIT_PER_SECOND", &mut self.rate_limit_per_second)?;
        if let Some(v) = get("EXPECTED_PLAYERS") {
            self.expected_players = Some(parse_num("EXPECTED_PLAYERS", &v)?);
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), PersistenceError> {
        validate_name(&self.database_name)?;
        let positive = [
            ("health_check_interval_ms", self.health_check_interval_ms),
            ("recovery_interval_ms", self.recovery_interval_ms),
            ("drain_interval_ms", self.drain_interval_ms),
            ("backup_interval_minutes", self.backup_interval_minutes),
            ("maintenance_interval_minutes", self.maintenance_interval_minutes),
            ("connection_timeout_ms", self.connection_timeout_ms),
        ];
        if let Some((name, _)) = positive.iter().find(|(_, v)| *v == 0) {
            return Err(PersistenceError::InvalidConfig(format!(
                "{name} must be greater than zero"
            )));
        }
        if self.max_pending_operations == 0 {
            return Err(PersistenceError::InvalidConfig(
                "max_pending_operations must be greater than zero".into(),
            ));
        }
        if self.recovery_failure_threshold == 0 {
            return Err(PersistenceError::InvalidConfig(
                "recovery_failure_threshold must be greater than zero".into(),
            ));
        }
        Ok(())
    }

    /// Root under which each database gets its own directory.
    pub fn data_dir(&self) -> PathBuf {
        if let Some(dir) = &self.data_dir {
            return dir.clone();
        }
        directories::ProjectDirs::from("", "", "statkeep")
            .map(|dirs| dirs.data_dir().to_path_buf())
            .unwrap_or_else(|| PathBuf::from(DEV_DATA_DIR))
    }

    pub fn backup_dir(&self) -> PathBuf {
        self.backup_dir
            .clone()
            .unwrap_or_else(|| self.data_dir().join(BACKUP_DIR))
    }

    pub fn connection_timeout(&self) -> Duration {
        Duration::from_millis(self.connection_timeout_ms)
    }

    pub fn retry_delay_base(&self) -> Duration {
        Duration::from_millis(self.retry_delay_base_ms)
    }

    pub fn query_retry_delay(&self) -> Duration {
        Duration::from_millis(self.query_retry_delay_ms)
    }

    pub fn backup_interval(&self) -> Duration {
        Duration::from_secs(self.backup_interval_minutes * 60)
    }

    pub fn maintenance_interval(&self) -> Duration {
        Duration::from_secs(self.maintenance_interval_minutes * 60)
    }

    pub fn health_check_interval(&self) -> Duration {
        Duration::from_millis(self.health_check_interval_ms)
    }

    pub fn recovery_interval(&self) -> Duration {
        Duration::from_millis(self.recovery_interval_ms)
    }

    pub fn drain_interval(&self) -> Duration {
        Duration::from_millis(self.drain_interval_ms)
    }
}

fn parse_num<T: FromStr>(name: &str, value: &str) -> Result<T, PersistenceError> {
    value.trim().parse().map_err(|_| {
        PersistenceError::InvalidConfig(format!("{ENV_PREFIX}{name} is not a number: {value}"))
    })
}

fn override_num<T, G>(get: &G, name: &str, target: &mut T) -> Result<(), PersistenceError>
where
    T: FromStr,
    G: Fn(&str) -> Option<String>,
{
    if let Some(v) = get(name) {
        *target = parse_num(name, &v)?;
    }
    Ok(())
}
