//! The Anastasis provider HTTP service: routing, request state
//! machines, and the cooperative suspension machinery behind them.

pub mod context;
pub mod error;
pub mod handlers;
pub mod lifetime;
pub mod refund;
pub mod wait;

use std::time::Duration;

use axum::extract::DefaultBodyLimit;
use axum::routing::get;
use axum::Router;
use tower_http::cors::{Any, CorsLayer};
use tracing::{debug, error};

pub use context::{ContextInitError, ServiceContext, SharedContext};
pub use error::ApiError;

/// How often expired accounts, truths and codes are collected.
const GC_INTERVAL: Duration = Duration::from_secs(3600);

/// Build the service router with permissive CORS headers (the protocol
/// is consumed by browser wallets).
pub fn build_router(ctx: SharedContext) -> Router {
    let cors = CorsLayer::new()
        .allow_methods(Any)
        .allow_origin(Any)
        .allow_headers(Any)
        .expose_headers(Any);

    let body_limit = ctx.cfg.upload_limit_mb as usize * 1024 * 1024 + 64 * 1024;

    Router::new()
        .route("/", get(handlers::meta::banner))
        .route("/agpl", get(handlers::meta::agpl))
        .route("/config", get(handlers::meta::config))
        .route("/terms", get(handlers::meta::terms))
        .route("/privacy", get(handlers::meta::privacy))
        .route(
            "/policy/:account_pub",
            get(handlers::policy::policy_get).post(handlers::policy::policy_post),
        )
        .route(
            "/truth/:uuid",
            get(handlers::truth::truth_get).post(handlers::truth::truth_post),
        )
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(cors)
        .with_state(ctx)
}

/// Start the background tasks the service needs: the timeout-heap
/// scheduler and the periodic garbage collector. Handles are returned
/// so the binary can abort them on shutdown.
pub fn spawn_background_tasks(ctx: &SharedContext) -> Vec<tokio::task::JoinHandle<()>> {
    let scheduler = ctx.waits.spawn_scheduler();
    let gc_ctx = ctx.clone();
    let gc = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(GC_INTERVAL);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            match gc_ctx.db.gc(gc_ctx.now()) {
                Ok(0) => {}
                Ok(n) => debug!(removed = n, "garbage collection pass"),
                Err(e) => error!(error = %e, "garbage collection failed"),
            }
        }
    });
    vec![scheduler, gc]
}
