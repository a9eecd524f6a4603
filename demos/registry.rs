//! Example x402 resource registry.
//!
//! Accepts resource registrations, probes each URL for its 402 challenge and
//! lists only the resources whose challenge validates.
//!
//! Run with:
//! ```bash
//! cargo run --example registry
//! ```
//!
//! Then register a resource:
//! ```bash
//! curl -X POST localhost:4000/resources \
//!   -H 'content-type: application/json' \
//!   -d '{"name":"weather","url":"http://localhost:3000/weather"}'
//! ```
//!
//! Environment variables:
//! - PORT: Server port (default: 4000)

use std::sync::Arc;
use tower_http::trace::TraceLayer;
use tracing_subscriber::EnvFilter;
use x402_stacks::registry::{routes, ResourceRegistry};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let port: u16 = std::env::var("PORT")
        .unwrap_or_else(|_| "4000".to_string())
        .parse()?;

    let app = routes(Arc::new(ResourceRegistry::new())).layer(TraceLayer::new_for_http());

    let addr = format!("0.0.0.0:{port}");
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!(%addr, "registry listening");

    axum::serve(listener, app).await?;

    Ok(())
}
