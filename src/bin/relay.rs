//! relay CLI: serve the activity stream, tail it, or inspect one poll.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use activity_relay::client::{ClientUpdate, Connector, ConnectorConfig, liveness_for};
use activity_relay::config::{Config, StreamSettings};
use activity_relay::cursor::Cursor;
use activity_relay::db::Db;
use activity_relay::model::{ExecutionStatus, NewExecution, ProjectId, Verbosity};
use activity_relay::store::MemoryLog;
use activity_relay::stream::Poller;
use activity_relay::telemetry::{TelemetryConfig, TelemetryGuard, init_telemetry};
use activity_relay::transport::{self, AppState};
use chrono::Utc;
use clap::{Parser, Subcommand};
use secrecy::ExposeSecret;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "relay", about = "Real-time execution activity over SSE")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Serve the activity stream from Postgres
    Serve {
        /// TOML file with stream settings
        #[arg(long)]
        settings: Option<PathBuf>,
    },
    /// Follow a project's stream and print what arrives
    Tail {
        /// Relay base URL
        #[arg(long, default_value = "http://localhost:8000")]
        url: String,
        /// Project ID
        #[arg(long)]
        project: ProjectId,
        /// Verbosity: 1..3 or low/medium/high
        #[arg(long, default_value = "medium")]
        verbosity: Verbosity,
        /// Resume after this cursor token
        #[arg(long)]
        cursor: Option<String>,
        /// Server heartbeat interval, used to detect a silent connection
        #[arg(long, default_value_t = 30)]
        heartbeat_secs: u64,
    },
    /// Run one poll against the database and print the batch
    Poll {
        /// Project ID
        #[arg(long)]
        project: ProjectId,
        /// Verbosity: 1..3 or low/medium/high
        #[arg(long, default_value = "medium")]
        verbosity: Verbosity,
        /// Read after this cursor token instead of the backlog
        #[arg(long)]
        cursor: Option<Cursor>,
    },
    /// Serve an in-memory log fed by a synthetic executor
    Demo {
        /// Port to listen on
        #[arg(long, default_value_t = 8000)]
        port: u16,
        /// Delay between synthetic executions
        #[arg(long, default_value_t = 3000)]
        interval_ms: u64,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    match cli.command {
        Command::Serve { settings } => cmd_serve(settings).await,
        Command::Tail {
            url,
            project,
            verbosity,
            cursor,
            heartbeat_secs,
        } => cmd_tail(url, project, verbosity, cursor, heartbeat_secs).await,
        Command::Poll {
            project,
            verbosity,
            cursor,
        } => cmd_poll(project, verbosity, cursor).await,
        Command::Demo { port, interval_ms } => cmd_demo(port, interval_ms).await,
    }
}

/// Telemetry for commands that run without a full `Config`.
fn local_telemetry(service_name: &str) -> anyhow::Result<TelemetryGuard> {
    Ok(init_telemetry(TelemetryConfig {
        endpoint: std::env::var("OTEL_ENDPOINT").ok(),
        service_name: service_name.to_string(),
        default_level: std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
    })?)
}

fn cancel_on_ctrl_c(token: CancellationToken) {
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("ctrl-c received, shutting down");
        token.cancel();
    });
}

async fn cmd_serve(settings: Option<PathBuf>) -> anyhow::Result<()> {
    let config = Config::load(settings.as_deref())?;

    let _guard = init_telemetry(TelemetryConfig {
        endpoint: config.otel_endpoint.clone(),
        service_name: "activity-relay".to_string(),
        default_level: config.log_level.clone(),
    })?;
    info!(env = %config.app_env, "starting relay");

    let db = Db::connect(config.database_url.expose_secret(), config.database_pool_size).await?;
    db.migrate().await?;
    db.health_check().await?;

    let state = AppState::new(Arc::new(db), config.stream.clone());
    cancel_on_ctrl_c(state.shutdown.clone());

    let listener = TcpListener::bind(config.listen_addr()).await?;
    transport::serve(listener, state).await?;
    Ok(())
}

async fn cmd_tail(
    url: String,
    project: ProjectId,
    verbosity: Verbosity,
    cursor: Option<String>,
    heartbeat_secs: u64,
) -> anyhow::Result<()> {
    let _guard = local_telemetry("relay-tail")?;

    let mut config = ConnectorConfig::new(url, project);
    config.verbosity = verbosity;
    config.cursor = cursor;
    config.liveness_timeout = liveness_for(Duration::from_secs(heartbeat_secs));

    let cancel = CancellationToken::new();
    cancel_on_ctrl_c(cancel.clone());
    let (mut updates, handle) = Connector::spawn(config, 64, cancel)?;

    while let Some(update) = updates.recv().await {
        match update {
            ClientUpdate::Activity { cursor, payload } => {
                println!(
                    "{} [{:?}] {}",
                    payload.timestamp.format("%H:%M:%S%.3f"),
                    payload.source,
                    payload.message
                );
                if let Some(cursor) = cursor {
                    info!(%cursor, "resume point");
                }
            }
            ClientUpdate::State(state) => {
                println!("-- {state} ({:?})", state.presence());
            }
        }
    }

    let exit = handle.await?;
    println!("-- stopped: {exit:?}");
    Ok(())
}

async fn cmd_poll(
    project: ProjectId,
    verbosity: Verbosity,
    cursor: Option<Cursor>,
) -> anyhow::Result<()> {
    let config = Config::from_env()?;
    let _guard = init_telemetry(TelemetryConfig {
        endpoint: config.otel_endpoint.clone(),
        service_name: "relay-poll".to_string(),
        default_level: config.log_level.clone(),
    })?;

    let db = Db::connect(config.database_url.expose_secret(), 1).await?;
    let mut poller = Poller::new(Arc::new(db), project, verbosity, cursor, &config.stream);
    let batch = poller.poll().await?;

    if batch.is_empty() {
        println!("No records after the cursor.");
    }
    for delivery in &batch.deliveries {
        let payload = delivery.record.to_payload();
        println!(
            "{:<70}  {:<6}  {}",
            delivery.record.ordering_key(),
            payload.source.as_str(),
            payload.message
        );
    }
    let more = if batch.capped { ", more waiting" } else { "" };
    println!("\n{} record(s){more}", batch.deliveries.len());
    println!("Next cursor: {}", batch.cursor);
    Ok(())
}

async fn cmd_demo(port: u16, interval_ms: u64) -> anyhow::Result<()> {
    let _guard = local_telemetry("relay-demo")?;

    let mut settings = StreamSettings::default();
    settings.apply_env()?;
    settings.validate()?;

    let log = Arc::new(MemoryLog::new());
    let project = log.create_project();

    let state = AppState::new(log.clone(), settings);
    cancel_on_ctrl_c(state.shutdown.clone());
    tokio::spawn(synthetic_executor(
        log,
        project,
        Duration::from_millis(interval_ms),
        state.shutdown.clone(),
    ));

    let listener = TcpListener::bind(("127.0.0.1", port)).await?;
    println!("Project: {project}");
    println!(
        "Stream:  http://127.0.0.1:{port}/projects/{project}/activity/stream?verbosity=high"
    );
    transport::serve(listener, state).await?;
    Ok(())
}

/// Produce executions with a few lines of output each, forever.
async fn synthetic_executor(
    log: Arc<MemoryLog>,
    project: ProjectId,
    interval: Duration,
    shutdown: CancellationToken,
) {
    let kinds = ["build", "test", "deploy"];
    let mut ticker = tokio::time::interval(interval);
    for n in 0u64.. {
        tokio::select! {
            _ = shutdown.cancelled() => return,
            _ = ticker.tick() => {}
        }
        let kind = kinds[(n % kinds.len() as u64) as usize];
        if let Err(e) = run_one(&log, project, kind, n).await {
            warn!("synthetic execution failed: {e}");
        }
    }
}

async fn run_one(
    log: &MemoryLog,
    project: ProjectId,
    kind: &str,
    n: u64,
) -> activity_relay::error::Result<()> {
    let exec = log.insert_execution(NewExecution::new(project, kind))?;
    log.transition(exec.id, ExecutionStatus::Running, Utc::now())?;
    for step in 1..=3 {
        tokio::time::sleep(Duration::from_millis(200)).await;
        log.append_line(exec.id, format!("{kind} #{n}: step {step}/3"), Utc::now())?;
    }
    let outcome = if n % 5 == 4 {
        ExecutionStatus::Failed
    } else {
        ExecutionStatus::Completed
    };
    log.transition(exec.id, outcome, Utc::now())?;
    Ok(())
}
