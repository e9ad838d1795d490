//! anastasis-httpd — the Anastasis provider daemon.
//!
//! Startup sequence:
//!   1. Load and validate the JSON provider configuration
//!   2. Open (or initialise) the database
//!   3. Build the immutable service context (plugins, merchant client,
//!      derived provider salt)
//!   4. Start the background tasks (timeout scheduler, GC)
//!   5. Serve HTTP until SIGINT/SIGTERM, then resume suspended
//!      requests and drain

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing::{info, warn};

use anastasis_core::constants::{EXIT_BAD_ARGUMENTS, EXIT_FAILURE, EXIT_NOT_CONFIGURED};
use anastasis_core::ProviderConfig;
use anastasis_server::{build_router, spawn_background_tasks, ContextInitError, ServiceContext};

#[derive(Parser, Debug)]
#[command(
    name = "anastasis-httpd",
    version,
    about = "Anastasis provider — pay-per-use escrow of encrypted key shares"
)]
struct Args {
    /// Path to the provider configuration (JSON).
    #[arg(short, long)]
    config: PathBuf,

    /// Override the configured listen address.
    #[arg(long)]
    listen: Option<SocketAddr>,

    /// Override the configured data directory.
    #[arg(long)]
    data_dir: Option<PathBuf>,
}

fn load_config(args: &Args) -> anyhow::Result<ProviderConfig> {
    let raw = std::fs::read_to_string(&args.config)
        .with_context(|| format!("reading configuration {}", args.config.display()))?;
    let mut cfg: ProviderConfig =
        serde_json::from_str(&raw).context("parsing configuration JSON")?;
    if let Some(listen) = args.listen {
        cfg.listen_addr = listen;
    }
    if let Some(dir) = &args.data_dir {
        cfg.data_dir = dir.clone();
    }
    Ok(cfg)
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,anastasis=debug".parse().unwrap()),
        )
        .init();

    let args = Args::parse();
    let cfg = match load_config(&args) {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("anastasis-httpd: {e:#}");
            std::process::exit(EXIT_BAD_ARGUMENTS);
        }
    };

    info!(listen = %cfg.listen_addr, "Anastasis provider starting");
    if let Err(e) = run(cfg).await {
        eprintln!("anastasis-httpd: {e:#}");
        std::process::exit(match e.downcast_ref::<ContextInitError>() {
            Some(ContextInitError::Config(_)) => EXIT_NOT_CONFIGURED,
            _ => EXIT_FAILURE,
        });
    }
}

async fn run(cfg: ProviderConfig) -> anyhow::Result<()> {
    std::fs::create_dir_all(&cfg.data_dir)
        .with_context(|| format!("creating data dir {}", cfg.data_dir.display()))?;

    let listen_addr = cfg.listen_addr;
    let ctx = Arc::new(ServiceContext::new(cfg)?);

    let background = spawn_background_tasks(&ctx);
    let router = build_router(Arc::clone(&ctx));

    let listener = tokio::net::TcpListener::bind(listen_addr)
        .await
        .with_context(|| format!("binding {listen_addr}"))?;
    info!(addr = %listen_addr, "serving");

    let shutdown_ctx = Arc::clone(&ctx);
    axum::serve(listener, router)
        .with_graceful_shutdown(async move {
            shutdown_signal().await;
            warn!("shutdown requested, resuming suspended requests");
            shutdown_ctx.shutdown();
        })
        .await
        .context("HTTP server failed")?;

    for task in background {
        task.abort();
    }
    info!("shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("installing SIGINT handler");
    };
    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("installing SIGTERM handler")
            .recv()
            .await;
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();
    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
