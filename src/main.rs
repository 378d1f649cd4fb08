//! Machine time - access control and metered charging for shop machines
//!
//! Module structure:
//! - `domain/` - Core business types (Contact, AccessPoint, ChargeRecord, Decision)
//! - `io/` - External interfaces (ledger, directory, schedule, inbound API)
//! - `services/` - Business logic (access decisions, charging, history)
//! - `infra/` - Infrastructure (Config, Metrics, Retry, Context)

use clap::Parser;
use machinetime::infra::{AppContext, Config};
use machinetime::io::ApiState;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::fmt::time::UtcTime;
use tracing_subscriber::EnvFilter;

/// Machine time - card-gated access points with metered billing
#[derive(Parser, Debug)]
#[command(name = "machinetime", version, about)]
struct Args {
    /// Path to TOML configuration file
    #[arg(short, long, default_value = "config/dev.toml")]
    config: String,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    // RUST_LOG overrides, default INFO
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_timer(UtcTime::rfc_3339())
        .with_target(false)
        .init();

    info!(git_hash = %env!("GIT_HASH"), "machinetime starting");

    let args = Args::parse();
    let config = Config::load_from_path(&args.config);

    info!(
        config_file = %config.config_file(),
        site_id = %config.site_id(),
        bind_address = %config.bind_address(),
        port = %config.port(),
        api_key_enabled = %config.api_key_enabled(),
        ledger_url = %config.ledger_url(),
        directory_url = %config.directory_url(),
        schedule_enabled = %config.schedule_enabled(),
        schedule_group = %config.schedule_group(),
        open_hours_min_balance = %config.open_hours_min_balance(),
        max_stale_retries = %config.max_stale_retries(),
        "config_loaded"
    );
    if config.api_key_enabled() && config.api_key().is_empty() {
        warn!("api_key_missing");
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let ctx = AppContext::connect(config)?;
    let metrics = ctx.metrics.clone();
    let metrics_interval = ctx.config.metrics_interval_secs();
    let state = Arc::new(ApiState::new(ctx));

    // Periodic metrics summary in the log
    let mut metrics_shutdown = shutdown_rx.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(std::time::Duration::from_secs(metrics_interval));
        loop {
            tokio::select! {
                _ = interval.tick() => metrics.report().log(),
                _ = metrics_shutdown.changed() => break,
            }
        }
    });

    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("shutdown_signal_received");
        let _ = shutdown_tx.send(true);
    });

    machinetime::io::start_api_server(state, shutdown_rx).await?;

    info!("machinetime shutdown complete");
    Ok(())
}
