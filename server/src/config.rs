//! Configuration for the stats server.
//!
//! The persistence tunables come from [`PersistenceConfig::load`] (file, then
//! `STATKEEP_*` environment). Command-line flags win over both.

use std::path::{Path, PathBuf};

use anyhow::Context;
use stats_persistence::PersistenceConfig;

/// Resolve the effective configuration and validate it.
pub fn resolve(
    config_path: Option<&Path>,
    data_dir: Option<PathBuf>,
) -> anyhow::Result<PersistenceConfig> {
    let mut config = PersistenceConfig::load(config_path).with_context(|| match config_path {
        Some(path) => format!("loading config from {}", path.display()),
        None => "loading config from environment".to_string(),
    })?;
    if let Some(dir) = data_dir {
        config.data_dir = Some(dir);
    }
    config.validate().context("invalid configuration")?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_data_dir_wins() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stats.json");
        std::fs::write(&path, r#"{ "database_name": "arena", "data_dir": "/from/file" }"#).unwrap();

        let config = resolve(Some(&path), Some(dir.path().to_path_buf())).unwrap();
        assert_eq!(config.database_name, "arena");
        assert_eq!(config.data_dir(), dir.path());
    }

    #[test]
    fn test_invalid_file_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stats.json");
        std::fs::write(&path, r#"{ "database_name": "no spaces allowed" }"#).unwrap();
        assert!(resolve(Some(&path), None).is_err());
    }
}
