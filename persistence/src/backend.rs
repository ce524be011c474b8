//! Backend types and the connection parameters built for them.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use crate::error::{classify_io, PersistenceError};

/// Longest accepted database name.
pub const MAX_NAME_LEN: usize = 64;

/// Player estimates up to this size stay on the JSON store.
pub const SMALL_SERVER_PLAYERS: u32 = 32;
/// Player estimates up to this size use the binary store.
pub const MEDIUM_SERVER_PLAYERS: u32 = 64;

const PROBE_FILE: &str = ".write_probe";

/// Storage technology behind the driver contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BackendType {
    EmbeddedFileJson,
    EmbeddedFileBinary,
    RemoteDocument,
    RemoteRelationalA,
    RemoteRelationalB,
}

impl BackendType {
    pub const ALL: [BackendType; 5] = [
        BackendType::EmbeddedFileJson,
        BackendType::EmbeddedFileBinary,
        BackendType::RemoteDocument,
        BackendType::RemoteRelationalA,
        BackendType::RemoteRelationalB,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            BackendType::EmbeddedFileJson => "embedded-file-json",
            BackendType::EmbeddedFileBinary => "embedded-file-binary",
            BackendType::RemoteDocument => "remote-document",
            BackendType::RemoteRelationalA => "remote-relational-a",
            BackendType::RemoteRelationalB => "remote-relational-b",
        }
    }

    pub fn is_file_based(&self) -> bool {
        matches!(
            self,
            BackendType::EmbeddedFileJson | BackendType::EmbeddedFileBinary
        )
    }

    pub fn is_remote(&self) -> bool {
        !self.is_file_based()
    }
}

impl fmt::Display for BackendType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BackendType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_lowercase().replace('_', "-");
        BackendType::ALL
            .into_iter()
            .find(|b| b.as_str() == normalized)
            .ok_or_else(|| format!("unknown backend type: {s}"))
    }
}

/// Where a driver finds its data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Location {
    /// Database directory of a file backend.
    Directory(PathBuf),
    /// Connection string of a remote backend.
    Url(String),
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Location::Directory(dir) => write!(f, "{}", dir.display()),
            Location::Url(url) => f.write_str(url),
        }
    }
}

/// Backend-specific parameters handed to a [`crate::driver::Connector`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionParams {
    pub backend: BackendType,
    pub database: String,
    pub location: Location,
}

impl ConnectionParams {
    /// Validate inputs and build parameters. File backends get the directory
    /// `<data_dir>/<name>`, which must be writable.
    pub fn build(
        backend: BackendType,
        name: &str,
        connection_string: Option<&str>,
        data_dir: &Path,
    ) -> Result<Self, PersistenceError> {
        validate_name(name)?;

        let location = if backend.is_file_based() {
            let dir = data_dir.join(name);
            probe_writable(&dir)?;
            Location::Directory(dir)
        } else {
            let url = connection_string
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .ok_or_else(|| {
                    PersistenceError::InvalidConfig(format!(
                        "backend {backend} requires a connection string"
                    ))
                })?;
            validate_scheme(url)?;
            Location::Url(url.to_string())
        };

        Ok(Self {
            backend,
            database: name.to_string(),
            location,
        })
    }

    /// Database directory for file backends.
    pub fn directory(&self) -> Option<&Path> {
        match &self.location {
            Location::Directory(dir) => Some(dir),
            Location::Url(_) => None,
        }
    }
}

/// Database names end up in file names: ASCII letters, digits, `_` and `-`.
pub fn validate_name(name: &str) -> Result<(), PersistenceError> {
    if name.is_empty() {
        return Err(PersistenceError::InvalidConfig(
            "database name must not be empty".into(),
        ));
    }
    if name.len() > MAX_NAME_LEN {
        return Err(PersistenceError::InvalidConfig(format!(
            "database name longer than {MAX_NAME_LEN} characters"
        )));
    }
    if let Some(bad) = name
        .chars()
        .find(|c| !(c.is_ascii_alphanumeric() || *c == '_' || *c == '-'))
    {
        return Err(PersistenceError::InvalidConfig(format!(
            "database name contains invalid character {bad:?}"
        )));
    }
    Ok(())
}

fn validate_scheme(url: &str) -> Result<(), PersistenceError> {
    let scheme = url.split_once(':').map(|(scheme, _)| scheme).unwrap_or("");
    let valid = !scheme.is_empty()
        && scheme
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '+' | '-' | '.'));
    if !valid {
        return Err(PersistenceError::InvalidConfig(format!(
            "connection string has no scheme: {url}"
        )));
    }
    Ok(())
}

/// Create `dir` if needed and prove it accepts writes by writing and removing
/// a probe file.
pub fn probe_writable(dir: &Path) -> Result<(), PersistenceError> {
    std::fs::create_dir_all(dir).map_err(|e| classify_io("create data directory", &e))?;
    let probe = dir.join(PROBE_FILE);
    std::fs::write(&probe, b"probe").map_err(|e| classify_io("write probe file", &e))?;
    std::fs::remove_file(&probe).map_err(|e| classify_io("remove probe file", &e))?;
    Ok(())
}

/// Pick a backend tier from a player estimate. No estimate means detection
/// failed, which falls back to the JSON store.
pub fn select_backend(player_estimate: Option<u32>, remote_connection: Option<&str>) -> BackendType {
    let Some(players) = player_estimate else {
        return BackendType::EmbeddedFileJson;
    };
    let has_remote = remote_connection.is_some_and(|s| !s.trim().is_empty());
    match players {
        0..=SMALL_SERVER_PLAYERS => BackendType::EmbeddedFileJson,
        n if n <= MEDIUM_SERVER_PLAYERS => BackendType::EmbeddedFileBinary,
        _ if has_remote => BackendType::RemoteDocument,
        _ => BackendType::EmbeddedFileBinary,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    #[test]
    fn test_backend_names_roundtrip() {
        for backend in BackendType::ALL {
            assert_eq!(backend.as_str().parse::<BackendType>().unwrap(), backend);
        }
        assert_eq!(
            "Remote_Relational_A".parse::<BackendType>().unwrap(),
            BackendType::RemoteRelationalA
        );
        assert!("mongo".parse::<BackendType>().is_err());
    }

    #[test]
    fn test_name_validation() {
        assert!(validate_name("stats_main-1").is_ok());
        assert!(validate_name("").is_err());
        assert!(validate_name("../etc").is_err());
        assert!(validate_name("with space").is_err());
        assert!(validate_name(&"a".repeat(MAX_NAME_LEN + 1)).is_err());
    }

    #[test]
    fn test_file_backend_gets_database_directory() {
        let dir = tempfile::tempdir().unwrap();
        let params =
            ConnectionParams::build(BackendType::EmbeddedFileJson, "stats", None, dir.path())
                .unwrap();
        assert_eq!(params.directory(), Some(dir.path().join("stats").as_path()));
        assert!(dir.path().join("stats").is_dir());
        assert!(!dir.path().join("stats").join(PROBE_FILE).exists());
    }

    #[test]
    fn test_remote_backend_requires_connection_string() {
        let dir = tempfile::tempdir().unwrap();
        let err = ConnectionParams::build(BackendType::RemoteDocument, "stats", None, dir.path())
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidConfig);

        let err = ConnectionParams::build(
            BackendType::RemoteRelationalA,
            "stats",
            Some("localhost"),
            dir.path(),
        )
        .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidConfig);

        let params = ConnectionParams::build(
            BackendType::RemoteRelationalA,
            "stats",
            Some("sqlite::memory:"),
            dir.path(),
        )
        .unwrap();
        assert_eq!(params.location, Location::Url("sqlite::memory:".into()));
    }

    #[test]
    fn test_best_settings_tiers() {
        assert_eq!(select_backend(Some(10), None), BackendType::EmbeddedFileJson);
        assert_eq!(select_backend(Some(32), None), BackendType::EmbeddedFileJson);
        assert_eq!(select_backend(Some(33), None), BackendType::EmbeddedFileBinary);
        assert_eq!(select_backend(Some(64), Some("mongodb://db")), BackendType::EmbeddedFileBinary);
        assert_eq!(select_backend(Some(128), Some("mongodb://db")), BackendType::RemoteDocument);
        assert_eq!(select_backend(Some(128), Some("  ")), BackendType::EmbeddedFileBinary);
        assert_eq!(select_backend(Some(128), None), BackendType::EmbeddedFileBinary);
        assert_eq!(select_backend(None, Some("mongodb://db")), BackendType::EmbeddedFileJson);
    }
}
