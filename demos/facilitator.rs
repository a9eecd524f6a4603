//! Example x402 facilitator service.
//!
//! Verifies payment proofs and settles them against an in-memory ledger. The
//! ledger starts empty apart from an optional funded payer so the demo client
//! has something to spend.
//!
//! Run with:
//! ```bash
//! cargo run --example facilitator
//! ```
//!
//! Environment variables:
//! - X402_NETWORK: CAIP-2 network (default: stacks:2147483648)
//! - X402_CONFIRMATION_TIMEOUT_SECS: Confirmation deadline (default: 30)
//! - X402_POLL_INTERVAL_MS: Confirmation poll interval (default: 500)
//! - X402_BROADCAST_RETRIES: Retries on transient errors (default: 3)
//! - FUND_PRINCIPAL / FUND_AMOUNT: Payer to credit at startup
//! - PORT: Server port (default: 8080)

use std::sync::Arc;
use tower_http::trace::TraceLayer;
use tracing_subscriber::EnvFilter;
use x402_stacks::config::FacilitatorSettings;
use x402_stacks::facilitator::{routes, LocalFacilitator};
use x402_stacks::ledger::InMemoryLedger;
use x402_stacks::types::STX_ASSET;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let settings = FacilitatorSettings::from_env()?;
    let ledger = Arc::new(InMemoryLedger::new());

    if let Ok(principal) = std::env::var("FUND_PRINCIPAL") {
        let amount: u128 = std::env::var("FUND_AMOUNT")
            .unwrap_or_else(|_| "1000000".to_string())
            .parse()?;
        ledger.credit(STX_ASSET, &principal, amount).await;
        tracing::info!(%principal, amount, "funded payer");
    }

    let facilitator = Arc::new(LocalFacilitator::new(settings.facilitator_config(), ledger));
    let app = routes(facilitator).layer(TraceLayer::new_for_http());

    let addr = format!("0.0.0.0:{}", settings.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;

    tracing::info!(
        %addr,
        network = %settings.network,
        confirmation_timeout = ?settings.confirmation_timeout,
        "facilitator listening"
    );

    axum::serve(listener, app).await?;

    Ok(())
}
