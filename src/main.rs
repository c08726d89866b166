// =============================================================================
// candle-ingestor — Main Entry Point
// =============================================================================
//
// Loads configuration once, wires the exchange REST/WS clients, the live
// ingestor, and the client-facing WS server together, then waits for
// Ctrl+C to shut everything down in order.
// =============================================================================

mod config;
mod exchange;
mod ingestor;
mod metrics;
mod repo;
mod server;
mod types;

use std::sync::Arc;

use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::config::Config;
use crate::exchange::{RestClient, WsExchangeClient};
use crate::ingestor::LiveIngestor;
use crate::metrics::{AtomicMetrics, Metrics};
use crate::repo::{CandleRepo, InMemoryCandleRepo};
use crate::server::ClientWsServer;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    info!("╔══════════════════════════════════════════════════════════╗");
    info!("║        candle-ingestor — Starting Up                     ║");
    info!("╚══════════════════════════════════════════════════════════╝");

    let config = Arc::new(Config::load_from_env()?);
    info!(
        symbols = ?config.symbols,
        interval = %config.interval,
        bind_addr = %config.client_ws_bind_addr,
        "configuration loaded"
    );

    let metrics: Arc<dyn Metrics> = Arc::new(AtomicMetrics::new());
    // The columnar candle store lives outside this crate; the in-memory
    // repository here is a placeholder good enough to run the pipeline end
    // to end. Swap in a real implementation of `CandleRepo` to persist.
    let repo: Arc<dyn CandleRepo> = Arc::new(InMemoryCandleRepo::new());

    let rest = Arc::new(RestClient::new(
        config.binance_rest_host.clone(),
        config.rest_default_from_epoch_ms,
        Arc::clone(&metrics),
    ));
    let ws = WsExchangeClient::new(config.binance_ws_host.clone(), Arc::clone(&metrics));
    let ws = Arc::new(ws);

    let server = ClientWsServer::new(Arc::clone(&config), Arc::clone(&metrics));
    server.start().await?;

    let ingestor = LiveIngestor::new(
        rest,
        Arc::clone(&ws),
        Arc::clone(&repo),
        server.clone() as Arc<dyn ingestor::Broadcaster>,
        Arc::clone(&metrics),
        Arc::clone(&config),
    );
    ingestor.run(config.symbols.clone(), config.interval).await?;

    info!("All subsystems running. Press Ctrl+C to stop.");

    tokio::signal::ctrl_c().await?;
    warn!("shutdown signal received, stopping gracefully");

    ingestor.stop().await;
    server.stop().await;

    info!("candle-ingestor shut down complete.");
    Ok(())
}
