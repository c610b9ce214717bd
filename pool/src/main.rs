// Pool payouts: block maturity reconciliation and balance disbursement
//
// One process per pool: classify pending blocks against the coin daemon,
// then pay out due balances, on a fixed interval.

use anyhow::{Context, Result};
use axum::{http::header, response::IntoResponse, routing::get, Json, Router};
use serde_json::json;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

use pool_payouts::config::PoolConfig;
use pool_payouts::ledger::{LedgerStore, PostgresLedger};
use pool_payouts::metrics::prometheus as metrics;
use pool_payouts::payout::{PayoutCycle, PayoutHandlerRegistry};

async fn api_health() -> Json<serde_json::Value> {
    Json(json!({"status": "ok"}))
}

async fn api_metrics() -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4; charset=utf-8")],
        metrics::render(),
    )
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .with_thread_ids(false)
        .init();

    let cfg = PoolConfig::load().context("invalid pool configuration")?;
    tracing::info!("Starting payouts for pool {} ({})", cfg.pool_id, cfg.coin.symbol);

    if cfg.database_url.is_empty() {
        anyhow::bail!("database_url is required (set PAYOUT_DATABASE_URL)");
    }
    let ledger = PostgresLedger::connect(&cfg.database_url)
        .await
        .context("failed to connect to ledger database")?;
    ledger.init_schema().await.context("failed to initialize ledger schema")?;
    let ledger: Arc<dyn LedgerStore> = Arc::new(ledger);

    let handler = PayoutHandlerRegistry::with_defaults()
        .connect(&cfg, ledger.clone())
        .context("failed to configure payout handler")?;

    let app = Router::new()
        .route("/health", get(api_health))
        .route("/metrics", get(api_metrics));
    let listener = tokio::net::TcpListener::bind(&cfg.metrics_listen)
        .await
        .with_context(|| format!("failed to bind metrics listener {}", cfg.metrics_listen))?;
    tracing::info!("Metrics listening on {}", cfg.metrics_listen);
    tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            tracing::error!("Metrics server error: {}", e);
        }
    });

    PayoutCycle::new(Arc::from(handler), ledger, &cfg.payout).run().await;
    Ok(())
}
