use super::{
    BinaryFileDriver, Connector, DriverError, JsonFileDriver, Query, QueryOutput, SqliteDriver,
    StorageDriver,
};
use crate::backend::{BackendType, ConnectionParams, Location};

/// One of the built-in drivers, chosen at connect time.
pub enum AnyDriver {
    Json(JsonFileDriver),
    Binary(BinaryFileDriver),
    Sqlite(SqliteDriver),
}

impl AnyDriver {
    pub fn kind(&self) -> &'static str {
        match self {
            AnyDriver::Json(_) => "json",
            AnyDriver::Binary(_) => "binary",
            AnyDriver::Sqlite(_) => "sqlite",
        }
    }
}

impl StorageDriver for AnyDriver {
    async fn execute(&self, query: Query) -> Result<QueryOutput, DriverError> {
        match self {
            AnyDriver::Json(d) => d.execute(query).await,
            AnyDriver::Binary(d) => d.execute(query).await,
            AnyDriver::Sqlite(d) => d.execute(query).await,
        }
    }

    async fn begin_transaction(&self) -> Result<(), DriverError> {
        match self {
            AnyDriver::Json(d) => d.begin_transaction().await,
            AnyDriver::Binary(d) => d.begin_transaction().await,
            AnyDriver::Sqlite(d) => d.begin_transaction().await,
        }
    }

    async fn commit(&self) -> Result<(), DriverError> {
        match self {
            AnyDriver::Json(d) => d.commit().await,
            AnyDriver::Binary(d) => d.commit().await,
            AnyDriver::Sqlite(d) => d.commit().await,
        }
    }

    async fn rollback(&self) -> Result<(), DriverError> {
        match self {
            AnyDriver::Json(d) => d.rollback().await,
            AnyDriver::Binary(d) => d.rollback().await,
            AnyDriver::Sqlite(d) => d.rollback().await,
        }
    }

    fn is_connected(&self) -> bool {
        match self {
            AnyDriver::Json(d) => d.is_connected(),
            AnyDriver::Binary(d) => d.is_connected(),
            AnyDriver::Sqlite(d) => d.is_connected(),
        }
    }

    async fn optimize_storage(&self) -> bool {
        match self {
            AnyDriver::Json(d) => d.optimize_storage().await,
            AnyDriver::Binary(d) => d.optimize_storage().await,
            AnyDriver::Sqlite(d) => d.optimize_storage().await,
        }
    }

    async fn close(&self) -> Result<(), DriverError> {
        match self {
            AnyDriver::Json(d) => d.close().await,
            AnyDriver::Binary(d) => d.close().await,
            AnyDriver::Sqlite(d) => d.close().await,
        }
    }
}

/// Maps backend types onto the built-in drivers.
///
/// The relational backends are served by SQLite when the connection string
/// is a `sqlite:` URL. No network driver ships, so any other remote location
/// is reported as unsupported.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultConnector;

impl Connector for DefaultConnector {
    type Driver = AnyDriver;

    async fn connect(&self, params: &ConnectionParams) -> Result<AnyDriver, DriverError> {
        match (params.backend, &params.location) {
            (BackendType::EmbeddedFileJson, Location::Directory(dir)) => {
                Ok(AnyDriver::Json(JsonFileDriver::open(dir.clone())?))
            }
            (BackendType::EmbeddedFileBinary, Location::Directory(dir)) => Ok(AnyDriver::Binary(
                BinaryFileDriver::open(dir.clone(), &params.database)?,
            )),
            (
                BackendType::RemoteRelationalA | BackendType::RemoteRelationalB,
                Location::Url(url),
            ) if url.starts_with("sqlite:") => Ok(AnyDriver::Sqlite(SqliteDriver::connect(url).await?)),
            (backend, location) => Err(DriverError::Unsupported(format!(
                "no driver for {backend} at {location}"
            ))),
        }
    }
}
