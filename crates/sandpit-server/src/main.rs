//! Sandpit build server binary
//!
//! Loads configuration, reconciles the on-disk build store, then serves the
//! HTTP API until Ctrl+C or SIGTERM. The `cache` subcommands work on the
//! store directly without starting a listener.

use anyhow::Result;
use clap::{Parser, Subcommand};
use log::LevelFilter;
use sandpit_core::{
    ArtifactStore, BuildOrchestrator, ConfigLoader, EnvironmentSpec, EvictionPolicy, Janitor,
    SandpitConfig, SystemClock,
};
use sandpit_core::playground::PlaygroundServices;
use sandpit_server::{shutdown_signal, SandpitServer, ServerConfig};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

#[derive(Parser, Debug)]
#[clap(author, version, about = "Sandpit Server - compile and cache untrusted playground code")]
struct Cli {
    #[clap(subcommand)]
    command: Option<Commands>,

    #[clap(long, short, env = "SANDPIT_CONFIG", default_value = "sandpit.yaml")]
    config: PathBuf,

    #[clap(long, env = "SANDPIT_BIND_ADDR", help = "Overrides http.bind_addr")]
    bind_addr: Option<SocketAddr>,

    #[clap(long, env = "SANDPIT_BUILD_DIR", help = "Overrides build.build_dir")]
    build_dir: Option<PathBuf>,

    #[clap(long, short, env = "SANDPIT_LOG_LEVEL", default_value = "info")]
    log_level: String,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the build server (default command)
    Serve,
    /// Inspect or clean the build store
    Cache {
        #[clap(subcommand)]
        action: CacheCommands,
    },
}

#[derive(Subcommand, Debug)]
enum CacheCommands {
    /// Show entry count and size of the build store
    Stats,
    /// Run one janitor sweep over the build store
    Prune,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_level_filter = cli.log_level.parse().unwrap_or(LevelFilter::Info);
    env_logger::Builder::new()
        .filter_level(log_level_filter)
        .init();

    let config = load_config(&cli).await?;

    match cli.command {
        Some(Commands::Cache { action }) => handle_cache_command(action, &config).await,
        Some(Commands::Serve) | None => run_server(config).await,
    }
}

async fn load_config(cli: &Cli) -> Result<SandpitConfig> {
    let mut config = ConfigLoader::from_optional_file(&cli.config).await?;
    if let Some(addr) = cli.bind_addr {
        config.http.bind_addr = addr;
    }
    if let Some(dir) = &cli.build_dir {
        config.build.build_dir = dir.clone();
    }
    config.validate()?;
    Ok(config)
}

async fn open_store(config: &SandpitConfig) -> Result<ArtifactStore> {
    let store = ArtifactStore::new(&config.build.build_dir, Arc::new(SystemClock));
    store.bootstrap().await?;
    Ok(store)
}

async fn run_server(config: SandpitConfig) -> Result<()> {
    let env = EnvironmentSpec::capture(&config.build.env_allow_list);
    let store = open_store(&config).await?;
    let playground = PlaygroundServices::from_config(&config.playground)?;
    let orchestrator = BuildOrchestrator::with_playground(&config.build, store, env, playground);
    orchestrator.spawn_janitor(&config.janitor);

    let server_config =
        ServerConfig::from_http_config(&config.http, config.build.build_timeout());
    let server = SandpitServer::new(orchestrator.clone(), server_config);
    let grace = config.http.shutdown_timeout();

    let stop = CancellationToken::new();
    let mut server_task = tokio::spawn(server.serve_with_shutdown(stop.clone().cancelled_owned()));

    let served = tokio::select! {
        res = &mut server_task => res,
        _ = shutdown_signal() => {
            stop.cancel();
            match tokio::time::timeout(grace, &mut server_task).await {
                Ok(res) => res,
                Err(_) => {
                    log::warn!("Connections still open after {:?}, closing them", grace);
                    server_task.abort();
                    Ok(Ok(()))
                }
            }
        }
    };

    orchestrator.shutdown(grace).await;

    if let Err(e) = served? {
        log::error!("Server failed: {}", e);
        return Err(e.into());
    }
    log::info!("Sandpit server shut down gracefully.");
    Ok(())
}

async fn handle_cache_command(action: CacheCommands, config: &SandpitConfig) -> Result<()> {
    let store = open_store(config).await?;

    match action {
        CacheCommands::Stats => {
            println!("Build store: {}", store.root().display());
            println!("Entries: {}", store.len().await);
            println!("Total size: {} bytes", store.total_bytes().await);
        }
        CacheCommands::Prune => {
            let janitor = Janitor::new(store.clone(), EvictionPolicy::from_config(&config.janitor));
            let report = janitor.sweep().await;
            println!(
                "Evicted {} of {} entries, freed {} bytes ({} skipped).",
                report.evicted, report.scanned, report.freed_bytes, report.skipped
            );
        }
    }

    Ok(())
}
