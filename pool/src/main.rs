//! XDAG-style RandomX Stratum pool — process entry point.
//!
//! Wires together the seven components of §4: the Upstream Bridge (C1) and
//! its event-consumer pipeline (C2 Job Fabric, C6 Reward Distributor), the
//! Stratum listener (C3/C4/C5), the Payout Engine (C7), the admin HTTP
//! surface, and the ambient housekeeping tasks (dedup rotation, purge).
//!
//! Top-level `#[tokio::main]` wiring: axum `Router` + `TcpListener::bind` +
//! `axum::serve(...).with_graceful_shutdown`, one `tokio::spawn` per
//! background subsystem.

use std::sync::Arc;

use tokio::sync::mpsc;
use xdagpool_pool::config::Config;
use xdagpool_pool::{admin, context::PoolContext, pipeline, stratum, upstream};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _log_guards = xdagpool_pool::logging::init("logs");

    tracing::info!("xdagpool starting up");
    let cfg = Config::load()?;

    // §6 Environment: "two prompts read from the controlling terminal"
    // (security password, wallet password). Skippable via env vars so the
    // pool can run unattended under a process supervisor.
    let admin_password = match std::env::var("XDAGPOOL_ADMIN_PASSWORD") {
        Ok(v) => v,
        Err(_) => rpassword::prompt_password("Security password (admin API): ")
            .unwrap_or_default(),
    };
    if std::env::var("XDAGPOOL_WALLET_PASSWORD").is_err() && !cfg.pool_private_key_hex.is_empty() {
        // The wallet key itself is read from config/env (§9: process-wide
        // state is constructed once at startup); this prompt is the
        // confirmation gate the source reads before unlocking it.
        let _ = rpassword::prompt_password("Wallet password (confirm unlock): ").unwrap_or_default();
    }

    // Upstream Bridge (C1): one bounded event queue, one unbounded submit
    // queue, fed by a long-lived WebSocket task that reconnects forever.
    let (event_tx, event_rx) = mpsc::channel(upstream::QUEUE_CAPACITY);
    let (submit_tx, submit_rx) = mpsc::unbounded_channel::<String>();

    let ctx: Arc<PoolContext> = PoolContext::new(cfg.clone(), submit_tx, &admin_password).await?;

    tokio::spawn(upstream::run_bridge(cfg.upstream_url.clone(), event_tx, submit_rx));
    tokio::spawn(pipeline::run(ctx.clone(), event_rx));

    // Dedup rotator (§3 Deduper: 15-minute generation rotation).
    ctx.dedup.clone().spawn_rotator();

    // Payout Engine (C7) + purge job.
    xdagpool_pool::payout::manager::spawn(ctx.clone());

    // Stratum listener (C3/C4/C5).
    {
        let ctx = ctx.clone();
        tokio::spawn(async move {
            if let Err(e) = stratum::serve(ctx).await {
                tracing::error!(error = %e, "stratum listener exited");
            }
        });
    }

    // Admin HTTP surface (§6).
    let api_listen = cfg.api_listen.clone();
    let listener = tokio::net::TcpListener::bind(&api_listen).await?;
    tracing::info!(addr = %api_listen, "admin API listening");

    let shutdown_signal = async {
        #[cfg(unix)]
        {
            let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                .expect("failed to register SIGTERM handler");
            tokio::select! {
                _ = sigterm.recv() => tracing::info!("SIGTERM received, shutting down"),
                _ = tokio::signal::ctrl_c() => tracing::info!("SIGINT received, shutting down"),
            }
        }
        #[cfg(not(unix))]
        {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("ctrl-c received, shutting down");
        }
    };

    axum::serve(listener, admin::router(ctx))
        .with_graceful_shutdown(shutdown_signal)
        .await?;

    tracing::info!("xdagpool shut down cleanly");
    Ok(())
}
