use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use tokio::net::TcpListener;
use tracing::{info, warn};

use spanner_crm::api::{build_router, AppState};
use spanner_crm::{auth, config, db};

#[derive(Debug, Parser)]
#[command(author, version, about)]
struct Args {
    /// Path to YAML config file
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,
    /// Listen address, overrides `server.bind_addr`
    #[arg(long)]
    bind: Option<String>,
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!(?err, "failed to listen for ctrl-c");
    }
    info!("shutting down");
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_target(false)
        .compact()
        .init();

    let args = Args::parse();
    let mut cfg = config::load(Some(&args.config))?;
    cfg.ensure_dirs()?;
    if let Some(bind) = args.bind {
        cfg.server.bind_addr = bind;
    }

    let database_url = std::env::var("DATABASE_URL").unwrap_or_else(|_| cfg.database_url());
    let pool = db::init_pool(&database_url).await?;
    db::run_migrations(&pool).await?;

    match &cfg.auth.bootstrap_admin {
        Some(admin) => {
            auth::seed_bootstrap_admin(&pool, admin).await?;
        }
        None if db::users::count(&pool).await? == 0 => {
            warn!("no users exist and no bootstrap_admin is configured");
        }
        None => {}
    }

    let bind_addr = cfg.server.bind_addr.clone();
    let app = build_router(AppState::new(pool, cfg));
    let listener = TcpListener::bind(&bind_addr)
        .await
        .with_context(|| format!("binding {bind_addr}"))?;
    info!(addr = %bind_addr, "starting http server");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    Ok(())
}
