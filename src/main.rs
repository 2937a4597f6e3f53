use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;

use teams_relay::config::Config;
use teams_relay::logging;
use teams_relay::scheduler::notifier::{ScheduledNotifier, TickOutcome};
use teams_relay::scheduler::service::SchedulerService;
use teams_relay::server::app::{bind_address, build_router};
use teams_relay::server::state::AppState;

#[derive(Parser)]
#[command(name = "teams-relay")]
#[command(about = "Proactive Teams notification relay and scheduler", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Path to the TOML config file
    #[arg(long, global = true, env = "TEAMS_RELAY_CONFIG", default_value = "teams-relay.toml")]
    config: PathBuf,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the relay endpoint, plus the scheduler when enabled
    Serve,
    /// Run only the scheduler loop
    Scheduler,
    /// Fire a single scheduled notification and exit
    Notify,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = Config::load(&cli.config)
        .with_context(|| format!("failed to load {}", cli.config.display()))?;
    logging::init(&config.logging());

    match cli.command {
        Commands::Serve => serve(config).await,
        Commands::Scheduler => run_scheduler(config).await,
        Commands::Notify => notify_once(config).await,
    }
}

async fn serve(config: Config) -> Result<()> {
    let state = AppState::from_config(&config).context("invalid relay configuration")?;
    let addr = bind_address(&state);
    let router = build_router(state);

    let shutdown = CancellationToken::new();
    let scheduler_task = if config.scheduler().enabled() {
        let scheduler = build_scheduler(&config)?;
        let token = shutdown.clone();
        Some(tokio::spawn(async move { scheduler.run_loop(token).await }))
    } else {
        None
    };

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    tracing::info!(event = "server_listening", addr = %addr, "relay listening");

    let signal = shutdown.clone();
    axum::serve(listener, router)
        .with_graceful_shutdown(async move {
            wait_for_signal().await;
            signal.cancel();
        })
        .await
        .context("server failed")?;

    shutdown.cancel();
    if let Some(task) = scheduler_task {
        let _ = task.await;
    }
    tracing::info!(event = "server_stopped", "relay stopped");
    Ok(())
}

async fn run_scheduler(config: Config) -> Result<()> {
    let scheduler = build_scheduler(&config)?;
    let shutdown = CancellationToken::new();
    let signal = shutdown.clone();
    tokio::spawn(async move {
        wait_for_signal().await;
        signal.cancel();
    });
    scheduler.run_loop(shutdown).await;
    Ok(())
}

async fn notify_once(config: Config) -> Result<()> {
    let notifier = ScheduledNotifier::from_config(config.scheduler())
        .context("invalid scheduler configuration")?;
    match notifier.tick().await {
        TickOutcome::Delivered { .. } => Ok(()),
        outcome => anyhow::bail!("scheduled notification not delivered: {outcome:?}"),
    }
}

fn build_scheduler(config: &Config) -> Result<SchedulerService> {
    let scheduler_config = config.scheduler();
    let notifier = ScheduledNotifier::from_config(scheduler_config.clone())
        .context("invalid scheduler configuration")?;
    SchedulerService::new(notifier, &scheduler_config).context("invalid scheduler configuration")
}

async fn wait_for_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::error!(event = "signal_error", error = %err, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
}
