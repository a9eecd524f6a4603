//! Example x402 client.
//!
//! Requests a protected endpoint, pays the 402 challenge with a local key and
//! prints the settlement alongside the response body.
//!
//! Run with:
//! ```bash
//! cargo run --example client
//! ```
//!
//! Environment variables:
//! - X402_PRIVATE_KEY: Hex secp256k1 key used to sign transfers
//! - X402_PAYER_ADDRESS: Principal the key controls
//! - X402_NETWORK: CAIP-2 network (default: stacks:2147483648)
//! - X402_MAX_AMOUNT: Optional per-request limit in micro-STX
//! - API_URL: Protected endpoint (default: http://localhost:3000/weather)

use std::sync::Arc;
use tracing_subscriber::EnvFilter;
use x402_stacks::client::{get, X402ClientConfig};
use x402_stacks::config::ClientSettings;
use x402_stacks::X402Error;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let settings = ClientSettings::from_env()?;
    let api_url =
        std::env::var("API_URL").unwrap_or_else(|_| "http://localhost:3000/weather".to_string());

    let mut config =
        X402ClientConfig::new(Arc::new(settings.signer()?)).with_network(settings.network.clone());
    if let Some(limit) = settings.max_amount {
        config = config.with_max_amount(limit);
    }

    tracing::info!(payer = %settings.address, url = %api_url, "requesting protected resource");

    let paid = match get(&config, &api_url).await {
        Ok(paid) => paid,
        Err(X402Error::PaymentRejected { code, message }) => {
            anyhow::bail!("payment rejected ({code}): {message}");
        }
        Err(e) => return Err(e.into()),
    };

    if let Some(settlement) = &paid.settlement {
        tracing::info!(
            transaction = %settlement.transaction,
            status = ?settlement.status,
            "payment settled"
        );
    }

    let status = paid.response.status();
    let body = paid.response.text().await?;
    match serde_json::from_str::<serde_json::Value>(&body) {
        Ok(json) => println!("{status}\n{}", serde_json::to_string_pretty(&json)?),
        Err(_) => println!("{status}\n{body}"),
    }

    Ok(())
}
