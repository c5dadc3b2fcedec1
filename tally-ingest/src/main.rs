//! tally-ingest - webhook ingestion microservice
//!
//! Binds the HTTP endpoints both providers deliver to and reconciles
//! their events into the canonical ledger.

use anyhow::Result;
use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::EnvFilter;

use tally_common::config::Config;
use tally_ingest::AppState;

#[derive(Parser, Debug)]
#[command(name = "tally-ingest", about = "Webhook ingestion service")]
struct Args {
    /// Listen address
    #[arg(long, env = "TALLY_LISTEN", default_value = "127.0.0.1:8380")]
    listen: SocketAddr,

    /// SQLite database path (overrides TALLY_DB_PATH)
    #[arg(long)]
    db_path: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    info!("Starting tally-ingest");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let mut config = Config::from_env()?;
    if let Some(path) = args.db_path {
        config.database_path = path.display().to_string();
    }

    let db_pool =
        tally_common::db::init_database_pool(std::path::Path::new(&config.database_path)).await?;
    info!("Database: {}", config.database_path);

    if config.kajabi_shared_secret.is_none() && config.kajabi_hmac_secret.is_none() {
        tracing::warn!("no kajabi secrets configured; kajabi deliveries will be rejected");
    }
    if config.paypal_client_id.is_none() {
        tracing::warn!("no paypal credentials configured; paypal deliveries will be rejected");
    }

    let state = AppState::new(db_pool, config);
    let app = tally_ingest::build_router(state);

    let listener = tokio::net::TcpListener::bind(args.listen).await?;
    info!("Listening on http://{}", args.listen);
    info!("Health check: http://{}/health", args.listen);

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await?;

    Ok(())
}
