//! Stats server: runs the persistence supervisor for a game server process
//! and offers admin subcommands against the same data.

mod admin;
mod config;
mod logging;

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use player_stats::StatField;
use stats_persistence::{
    spawn_supervisor, ConnectionState, DefaultConnector, LifecycleManager, StatsHandle,
};

#[derive(Parser)]
#[command(name = "stats-server", about = "Resilient player statistics persistence")]
struct Cli {
    /// JSON config file. `STATKEEP_*` environment variables override it.
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Root directory for databases and backups.
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    /// Also write daily rolling log files here.
    #[arg(long, global = true)]
    log_dir: Option<PathBuf>,

    /// Defaults to `run`.
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Keep persistence online until ctrl-c.
    Run {
        /// Expected player count; picks the backend tier.
        #[arg(long)]
        players: Option<u32>,
    },
    /// Print lifecycle diagnostics.
    Status {
        #[arg(long)]
        json: bool,
    },
    /// Snapshot the database directory now.
    Backup,
    /// List snapshots, newest first.
    ListBackups,
    /// Replace the database with a snapshot.
    Restore {
        /// Snapshot directory name as printed by `list-backups`.
        name: String,
    },
    /// Leaderboard by one stat.
    Top {
        #[arg(short, long, default_value = "kills")]
        field: StatField,
        #[arg(short, long, default_value_t = 10)]
        limit: usize,
    },
    /// Print one player's record.
    Show { external_id: String },
    /// Delete one player's record.
    Delete { external_id: String },
}

async fn run(handle: &StatsHandle, players: Option<u32>) -> anyhow::Result<()> {
    let result = match players {
        Some(players) => handle.initialize_with_best_settings(Some(players)).await,
        None => handle.initialize_from_config().await,
    };
    match result {
        Ok(backend) => tracing::info!(%backend, "Persistence online"),
        Err(e) if handle.state() == ConnectionState::Recovering => {
            tracing::warn!("Persistence offline, recovery will keep trying: {}", e);
        }
        Err(e) => return Err(e.into()),
    }

    tokio::signal::ctrl_c().await?;
    let diagnostics = handle.diagnostics().await?;
    tracing::info!(%diagnostics, "Shutting down");
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let _log_guard = logging::init(cli.log_dir.as_deref())?;

    let config = config::resolve(cli.config.as_deref(), cli.data_dir)?;
    tracing::info!(
        data_dir = %config.data_dir().display(),
        database = %config.database_name,
        "Starting stats server"
    );

    let manager = LifecycleManager::new(config, DefaultConnector);
    let (handle, supervisor) = spawn_supervisor(manager);

    let result = match cli.command.unwrap_or(Commands::Run { players: None }) {
        Commands::Run { players } => run(&handle, players).await,
        Commands::Status { json } => admin::status(&handle, json).await,
        Commands::Backup => admin::backup(&handle).await,
        Commands::ListBackups => admin::list_backups(&handle).await,
        Commands::Restore { name } => admin::restore(&handle, &name).await,
        Commands::Top { field, limit } => admin::top(&handle, field, limit).await,
        Commands::Show { external_id } => admin::show(&handle, &external_id).await,
        Commands::Delete { external_id } => admin::delete(&handle, &external_id).await,
    };

    if let Err(e) = handle.shutdown().await {
        tracing::warn!("Supervisor already stopped: {}", e);
    }
    supervisor.await?;
    result
}
