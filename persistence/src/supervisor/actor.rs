use std::ops::ControlFlow;
use tokio::sync::mpsc;
use tokio::time::{self, Duration, Instant, Interval};
use tracing::Instrument;

use super::commands::*;
use crate::driver::Connector;
use crate::lifecycle::{ConnectionState, LifecycleManager};

fn ticker(period: Duration) -> Interval {
    // First tick one period from now, not immediately.
    let mut interval = time::interval_at(Instant::now() + period, period);
    interval.set_missed_tick_behavior(time::MissedTickBehavior::Skip);
    interval
}

/// The supervisor loop.
/// Owns the manager. Processes commands and timer ticks sequentially.
pub(crate) async fn run_supervisor<C: Connector>(
    manager: LifecycleManager<C>,
    cmd_rx: mpsc::Receiver<SupervisorCommand>,
) {
    run_supervisor_inner(manager, cmd_rx)
        .instrument(tracing::info_span!("persistence"))
        .await;
}

async fn run_supervisor_inner<C: Connector>(
    mut manager: LifecycleManager<C>,
    mut cmd_rx: mpsc::Receiver<SupervisorCommand>,
) {
    tracing::info!("Persistence supervisor started");

    let config = manager.config().clone();
    let mut health = ticker(config.health_check_interval());
    let mut recovery = ticker(config.recovery_interval());
    let mut drain = ticker(config.drain_interval());

    loop {
        tokio::select! {
            biased;

            cmd = cmd_rx.recv() => {
                let Some(cmd) = cmd else {
                    tracing::info!("All handles dropped");
                    manager.shutdown().await;
                    break;
                };
                if handle_command(&mut manager, cmd).await.is_break() {
                    break;
                }
            }

            _ = health.tick(), if manager.state().is_connected() => {
                manager.health_check().await;
            }

            _ = recovery.tick(), if manager.state() == ConnectionState::Recovering => {
                // Failures are logged by the manager; the next tick retries.
                let _ = manager.recovery_tick().await;
            }

            _ = drain.tick() => {
                manager.drain().await;
            }
        }
    }

    tracing::info!("Persistence supervisor exited");
}

/// Breaks once the manager has shut down.
async fn handle_command<C: Connector>(
    manager: &mut LifecycleManager<C>,
    cmd: SupervisorCommand,
) -> ControlFlow<()> {
    match cmd {
        SupervisorCommand::Initialize {
            backend,
            database,
            connection_string,
            reply,
        } => {
            let result = manager
                .initialize(backend, &database, connection_string.as_deref())
                .await;
            if let Err(e) = &result {
                recover_after_failed_init(manager, e).await;
            }
            let _ = reply.send(result);
        }
        SupervisorCommand::InitializeBestSettings {
            player_estimate,
            reply,
        } => {
            let result = manager.initialize_with_best_settings(player_estimate).await;
            if let Err(e) = &result {
                recover_after_failed_init(manager, e).await;
            }
            let _ = reply.send(result);
        }
        SupervisorCommand::InitializeFromConfig { reply } => {
            let result = manager.initialize_from_config().await;
            if let Err(e) = &result {
                recover_after_failed_init(manager, e).await;
            }
            let _ = reply.send(result);
        }
        SupervisorCommand::Save {
            external_id,
            display_name,
            record,
            priority,
            reply,
        } => {
            let outcome = manager
                .save_or_defer(&external_id, &display_name, record, priority)
                .await;
            let _ = reply.send(outcome);
        }
        SupervisorCommand::Load { external_id, reply } => {
            let _ = reply.send(manager.load(&external_id).await);
        }
        SupervisorCommand::Delete { external_id, reply } => {
            let _ = reply.send(manager.delete(&external_id).await);
        }
        SupervisorCommand::GetAll { reply } => {
            let _ = reply.send(manager.get_all().await);
        }
        SupervisorCommand::GetTopN {
            limit,
            field,
            reply,
        } => {
            let _ = reply.send(manager.get_top_n(limit, field).await);
        }
        SupervisorCommand::Backup { reply } => {
            let _ = reply.send(manager.backup_now());
        }
        SupervisorCommand::ListBackups { reply } => {
            let _ = reply.send(manager.list_backups());
        }
        SupervisorCommand::Restore { name, reply } => {
            let result = match manager.find_backup(&name) {
                Ok(backup) => manager.restore_backup(&backup).await,
                Err(e) => Err(e),
            };
            let _ = reply.send(result);
        }
        SupervisorCommand::Drain { reply } => {
            let _ = reply.send(manager.drain().await);
        }
        SupervisorCommand::RequeueDeadLetters { reply } => {
            let _ = reply.send(manager.requeue_dead_letters());
        }
        SupervisorCommand::Diagnostics { reply } => {
            let _ = reply.send(manager.diagnostics());
        }
        SupervisorCommand::Shutdown { reply } => {
            manager.shutdown().await;
            let _ = reply.send(());
            return ControlFlow::Break(());
        }
    }
    ControlFlow::Continue(())
}

/// A transient initialization failure hands over to the recovery timer.
async fn recover_after_failed_init<C: Connector>(
    manager: &mut LifecycleManager<C>,
    error: &crate::error::PersistenceError,
) {
    if error.is_recoverable() && manager.start_recovery().await {
        tracing::warn!("Initialization will be retried by recovery");
    }
}
