use serde::Serialize;
use std::fmt;

/// Lifecycle phase of the persistence subsystem.
///
/// ```text
/// Uninitialized → Connecting → Verifying → SchemaCheck → Ready ⇄ Degraded
///                                                          Degraded → Recovering → Ready
///                                                          Recovering → Abandoned
/// any → ShutDown
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    #[default]
    Uninitialized,
    Connecting,
    Verifying,
    SchemaCheck,
    Ready,
    /// Health checks are failing but the threshold is not reached yet.
    Degraded,
    Recovering,
    /// Recovery gave up. Needs an explicit initialize or shutdown.
    Abandoned,
    ShutDown,
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Uninitialized => "uninitialized",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Verifying => "verifying",
            ConnectionState::SchemaCheck => "schema_check",
            ConnectionState::Ready => "ready",
            ConnectionState::Degraded => "degraded",
            ConnectionState::Recovering => "recovering",
            ConnectionState::Abandoned => "abandoned",
            ConnectionState::ShutDown => "shut_down",
        }
    }

    /// Only `Ready` accepts repository work.
    pub fn accepts_operations(&self) -> bool {
        matches!(self, ConnectionState::Ready)
    }

    /// States in the middle of bringing a connection up.
    pub fn is_initializing(&self) -> bool {
        matches!(
            self,
            ConnectionState::Connecting | ConnectionState::Verifying | ConnectionState::SchemaCheck
        )
    }

    /// An active connection exists and health checks apply.
    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionState::Ready | ConnectionState::Degraded)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
