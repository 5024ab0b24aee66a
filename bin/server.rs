// Loan Desk - Web Server
// REST API with Axum over a single SQLite database

use anyhow::{Context, Result};
use clap::Parser;
use loan_desk::api::{router, AppState};
use loan_desk::{init_tracing, open_database, Config};
use std::path::PathBuf;
use tracing::info;

/// Loan application review API
#[derive(Parser)]
#[command(name = "loan-server")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// JSON configuration file
    #[arg(long)]
    config: Option<PathBuf>,

    /// Database file path (overrides config and LOAN_DESK_DATABASE)
    #[arg(long)]
    db: Option<PathBuf>,

    /// Listen address (overrides config and LOAN_DESK_BIND)
    #[arg(long)]
    bind: Option<String>,
}

// ============================================================================
// Main Server
// ============================================================================

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing("info");

    let args = Args::parse();
    let mut config = Config::load(args.config.as_deref())?;
    if let Some(db) = args.db {
        config.database_path = db;
    }
    if let Some(bind) = args.bind {
        config.bind_addr = bind;
    }

    let conn = open_database(&config.database_path)
        .with_context(|| format!("Failed to open database {:?}", config.database_path))?;
    info!(path = ?config.database_path, "database ready");

    let app = router(AppState::new(conn, &config));

    let listener = tokio::net::TcpListener::bind(&config.bind_addr)
        .await
        .with_context(|| format!("Failed to bind to {}", config.bind_addr))?;

    info!(addr = %config.bind_addr, version = loan_desk::VERSION, "loan desk API listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    info!("server stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to listen for shutdown signal");
    }
}
