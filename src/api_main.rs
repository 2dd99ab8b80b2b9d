//! Fairplay API Server Binary
//!
//! Opens the ledger database, starts the idle-session sweeper and serves the
//! HTTP API.

use clap::Parser;
use fairplay::api::ApiServer;
use fairplay::config::{generate_sample_config, ConfigLoader};
use fairplay::expiry::IdleSessionSweeper;
use fairplay::metrics::EngineMetrics;
use fairplay::session::GameEngine;
use fairplay::storage::OptimizedStorage;
use std::sync::Arc;

/// Sample accounts created by `--seed-demo`
const DEMO_USERS: [&str; 3] = ["alice", "bob", "carol"];

#[derive(Parser, Debug)]
#[command(name = "fairplay-api")]
#[command(about = "Provably-fair game session and ledger API", long_about = None)]
struct Args {
    /// TOML configuration file
    #[arg(long)]
    config: Option<String>,

    /// API server host (overrides config)
    #[arg(long)]
    host: Option<String>,

    /// API server port (overrides config)
    #[arg(long)]
    port: Option<u16>,

    /// Database directory (overrides config)
    #[arg(long)]
    db_path: Option<String>,

    /// Create the sample users if they do not exist yet
    #[arg(long)]
    seed_demo: bool,

    /// Write a default configuration file to this path and exit
    #[arg(long)]
    generate_config: Option<String>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    if let Some(path) = args.generate_config {
        generate_sample_config(&path)?;
        println!("Wrote sample configuration to {}", path);
        return Ok(());
    }

    let mut loader = ConfigLoader::new();
    if let Some(ref path) = args.config {
        loader = loader.with_path(path);
    }
    let mut config = loader.load()?;

    if let Some(host) = args.host {
        config.api.host = host;
    }
    if let Some(port) = args.port {
        config.api.port = port;
    }
    if let Some(db_path) = args.db_path {
        config.storage.data_directory = db_path;
    }
    loader.validate(&config)?;

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                format!("fairplay={},tower_http=info", config.monitoring.log_level).into()
            }),
        )
        .init();

    tracing::info!("Opening ledger database: {}", config.storage.data_directory);
    let storage = Arc::new(OptimizedStorage::with_config(&config.storage)?);

    let metrics = Arc::new(EngineMetrics::new());
    let engine = Arc::new(GameEngine::with_metrics(config.engine.clone(), storage, metrics));

    if args.seed_demo {
        seed_demo_users(&engine)?;
    }

    let sweeper = IdleSessionSweeper::spawn(engine.clone(), config.engine.sweep_interval());
    tracing::info!(
        "Idle session sweeper running every {}s",
        config.engine.sweep_interval_secs
    );

    let server = ApiServer::new(config.api.clone(), engine, config.monitoring.enable_metrics);
    let result = server.run().await;
    sweeper.stop();
    result
}

fn seed_demo_users(engine: &GameEngine) -> Result<(), Box<dyn std::error::Error>> {
    for (i, name) in DEMO_USERS.iter().enumerate() {
        if let Some(existing) = engine.ledger().find_user(name)? {
            tracing::info!(user_id = %existing.id, "demo user {} already present", name);
            continue;
        }
        let balance = 1_000 + i as u64 * 500;
        let user = engine
            .ledger()
            .create_user(name, &format!("demo:{}", name), balance)?;
        tracing::info!(user_id = %user.id, balance, "demo user {} created", name);
    }
    Ok(())
}
