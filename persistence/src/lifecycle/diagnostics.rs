use serde::Serialize;
use std::fmt;

use super::ConnectionState;
use crate::backend::BackendType;

/// Point-in-time view of the lifecycle manager for admin tooling.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Diagnostics {
    pub state: ConnectionState,
    pub backend: Option<BackendType>,
    pub database: Option<String>,
    pub consecutive_failures: u32,
    pub recovery_attempts: u32,
    pub pending: usize,
    pub dead_letters: usize,
    /// Unix millis of the last successful backup.
    pub last_backup_millis: Option<u64>,
    pub schema_version: Option<u32>,
    pub anomalies: u64,
    pub corrupted: bool,
}

impl fmt::Display for Diagnostics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "state={}", self.state)?;
        match (&self.backend, &self.database) {
            (Some(backend), Some(database)) => write!(f, " backend={backend} database={database}")?,
            _ => write!(f, " backend=none")?,
        }
        if let Some(version) = self.schema_version {
            write!(f, " schema=v{version}")?;
        }
        write!(
            f,
            " pending={} dead_letters={} failures={} recovery_attempts={} anomalies={}",
            self.pending,
            self.dead_letters,
            self.consecutive_failures,
            self.recovery_attempts,
            self.anomalies
        )?;
        match self.last_backup_millis {
            Some(millis) => write!(f, " last_backup={millis}")?,
            None => write!(f, " last_backup=never")?,
        }
        if self.corrupted {
            write!(f, " CORRUPTED")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_summary_line() {
        let diagnostics = Diagnostics {
            state: ConnectionState::Degraded,
            backend: Some(BackendType::EmbeddedFileBinary),
            database: Some("stats".into()),
            consecutive_failures: 2,
            recovery_attempts: 0,
            pending: 4,
            dead_letters: 1,
            last_backup_millis: None,
            schema_version: Some(1),
            anomalies: 0,
            corrupted: false,
        };
        assert_eq!(
            diagnostics.to_string(),
            "state=degraded backend=embedded-file-binary database=stats schema=v1 \
             pending=4 dead_letters=1 failures=2 recovery_attempts=0 anomalies=0 last_backup=never"
        );
    }
}
