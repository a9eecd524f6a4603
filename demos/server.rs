//! Example x402 resource server using Axum.
//!
//! Serves a free `/health` route and a `/weather` route gated behind an STX
//! payment settled through a remote facilitator.
//!
//! Run with:
//! ```bash
//! cargo run --example server
//! ```
//!
//! Environment variables:
//! - X402_FACILITATOR_URL: Facilitator base URL
//! - X402_PAY_TO: Principal receiving payments
//! - X402_NETWORK: CAIP-2 network (default: stacks:2147483648)
//! - X402_PRICE: Price in STX (default: 0.01)
//! - X402_SETTLEMENT_TIMEOUT_SECS: Settlement bound (default: 60)
//! - PORT: Server port (default: 3000)

use axum::{middleware, routing::get, Extension, Json, Router};
use serde_json::{json, Value};
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use tracing_subscriber::EnvFilter;
use x402_stacks::config::GateSettings;
use x402_stacks::facilitator_client::FacilitatorClient;
use x402_stacks::server::{require_payment, PaymentGate, STX_DECIMALS};
use x402_stacks::types::SettlementResult;
use x402_stacks::utils::smallest_unit_to_display;

async fn weather_handler(Extension(settlement): Extension<SettlementResult>) -> Json<Value> {
    Json(json!({
        "location": "San Francisco",
        "temperature": 68,
        "conditions": "Sunny",
        "paid": true,
        "transaction": settlement.transaction,
    }))
}

async fn health_handler() -> Json<Value> {
    Json(json!({
        "status": "healthy",
        "protocol": "x402",
        "version": 1,
    }))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let settings = GateSettings::from_env()?;
    let facilitator = FacilitatorClient::try_from(settings.facilitator_url.as_str())?;

    let mut gate = PaymentGate::new(
        Arc::new(facilitator),
        vec![settings.payment_config("Weather API access")],
    )?
    .with_settlement_timeout(settings.settlement_timeout);
    if let Some(base_url) = settings.base_url.clone() {
        gate = gate.with_base_url(base_url);
    }

    let paid = Router::new()
        .route("/weather", get(weather_handler))
        .layer(middleware::from_fn_with_state(gate, require_payment));

    let app = Router::new()
        .route("/health", get(health_handler))
        .merge(paid)
        .layer(TraceLayer::new_for_http());

    let price = smallest_unit_to_display(settings.price, STX_DECIMALS)?;
    let addr = format!("0.0.0.0:{}", settings.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;

    tracing::info!(
        %addr,
        pay_to = %settings.pay_to,
        network = %settings.network,
        %price,
        facilitator = %settings.facilitator_url,
        "resource server listening"
    );

    axum::serve(listener, app).await?;

    Ok(())
}
