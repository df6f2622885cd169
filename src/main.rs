use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;
use storage_coordinator::config::load_config;
use storage_coordinator::coordinator::handlers;
use storage_coordinator::coordinator::service::Coordinator;
use tracing_subscriber::EnvFilter;

const STATS_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Parser, Debug)]
#[command(name = "storage-coordinator", version, about = "Master of a distributed file-serving cluster")]
struct Cli {
    /// TOML configuration file. Missing means defaults.
    #[arg(long, short, default_value = "coordinator.toml")]
    config: PathBuf,

    /// Admin HTTP listen address (overrides the config file).
    #[arg(long)]
    admin_addr: Option<SocketAddr>,

    /// Snapshot file (overrides the config file).
    #[arg(long)]
    state_path: Option<PathBuf>,

    /// Run without a snapshot file.
    #[arg(long, conflicts_with = "state_path")]
    no_state: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();

    // 1. Configuration: file, then environment, then flags.
    let mut config = load_config(&cli.config)?;
    config.apply_env_overrides()?;
    if let Some(addr) = cli.admin_addr {
        config.admin_addr = addr;
    }
    if let Some(path) = cli.state_path {
        config.state_path = Some(path);
    }
    if cli.no_state {
        config.state_path = None;
    }

    tracing::info!(version = env!("CARGO_PKG_VERSION"), "Starting storage coordinator");
    match &config.state_path {
        Some(path) => tracing::info!("State snapshot: {}", path.display()),
        None => tracing::info!("Running without a state snapshot"),
    }

    // 2. Peers, namespace and selection, restored from the last snapshot:
    let coordinator = Coordinator::bootstrap(&config).await?;

    // 3. Reconnect supervisor and snapshot loop:
    coordinator.clone().start().await;

    // 4. Stats reporter:
    let stats = coordinator.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(STATS_INTERVAL);
        loop {
            interval.tick().await;
            let summaries = stats.peer_summaries();
            let available = summaries
                .iter()
                .filter(|s| s.state == storage_coordinator::peer::types::PeerState::Available)
                .count();
            tracing::info!("Cluster stats: {}/{} peers available", available, summaries.len());
            for summary in summaries {
                tracing::debug!(
                    "  - {} {:?} transfers={} errors={} remerging={}",
                    summary.name,
                    summary.state,
                    summary.active_transfers,
                    summary.recent_errors,
                    summary.remerging
                );
            }
        }
    });

    // 5. Admin HTTP server:
    let app = handlers::router(coordinator.clone());
    let listener = tokio::net::TcpListener::bind(config.admin_addr).await?;
    tracing::info!("Admin API listening on {}", config.admin_addr);
    tracing::info!("Press Ctrl+C to shutdown");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("Shutdown requested");
        })
        .await?;

    // 6. Final snapshot:
    coordinator.save_state().await?;
    tracing::info!("Coordinator stopped");
    Ok(())
}
