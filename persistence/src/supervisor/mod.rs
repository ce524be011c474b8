//! The persistence supervisor: one task that owns the [`LifecycleManager`]
//! and serializes handle commands with the health, recovery and drain
//! timers.

mod actor;
pub mod commands;
pub mod handle;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::driver::Connector;
use crate::lifecycle::LifecycleManager;
use actor::run_supervisor;
pub use commands::SupervisorError;
pub use handle::StatsHandle;

const COMMAND_BUFFER: usize = 64;

/// Spawn the supervisor task. The task ends after
/// [`StatsHandle::shutdown`] or once every handle is dropped.
pub fn spawn_supervisor<C: Connector>(manager: LifecycleManager<C>) -> (StatsHandle, JoinHandle<()>) {
    let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_BUFFER);
    let handle = StatsHandle::new(cmd_tx, manager.subscribe_state());
    let task = tokio::spawn(async move {
        run_supervisor(manager, cmd_rx).await;
    });
    (handle, task)
}
