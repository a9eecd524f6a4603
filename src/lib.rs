//! # x402-stacks
//!
//! HTTP 402 payment-gated requests settled on the Stacks ledger.
//!
//! The x402 protocol revitalizes the HTTP 402 "Payment Required" status code: a server
//! answers an unpaid request with the payment methods it accepts, the client signs a
//! transfer for one of them and retries with the proof attached, and a facilitator
//! broadcasts the transfer and confirms it before the server releases the resource.
//!
//! ## Features
//!
//! - **Client Support**: Automatic handling of 402 responses, method selection and spending limits
//! - **Server Support**: Axum middleware gating routes behind a confirmed settlement
//! - **Facilitator Support**: Verification, replay protection, broadcast and confirmation polling
//! - **Signing**: Local secp256k1 keys or a delegated external wallet with a user timeout
//! - **Discovery**: A registry that only lists resources advertising well-formed challenges
//!
//! ## Quick Start
//!
//! ### Client Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use x402_stacks::client::{get, X402ClientConfig};
//! use x402_stacks::network::Network;
//! use x402_stacks::signer::LocalKeySigner;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let signer = LocalKeySigner::from_hex(
//!     "0xYOUR_PRIVATE_KEY",
//!     "ST2JN8XG1BG9TZE5FQ4GP0CMTHKF9EVRZ5THN11R1",
//!     Network::stacks_testnet(),
//! )?;
//! let config = X402ClientConfig::new(Arc::new(signer)).with_max_amount(100_000u64);
//!
//! let paid = get(&config, "https://api.example.com/weather").await?;
//! println!("Response: {}", paid.response.text().await?);
//! # Ok(())
//! # }
//! ```
//!
//! ### Server Example
//!
//! ```rust
//! use x402_stacks::network::Network;
//! use x402_stacks::server::create_stx_config;
//!
//! let config = create_stx_config(
//!     "ST1PQHQKV0RJXZFY1DGX8MNSNYVE3VGZJSRTPGZGM",
//!     Network::stacks_testnet(),
//!     "0.01", // STX
//!     "API access fee",
//! ).unwrap();
//! assert_eq!(config.amount.value(), 10_000);
//! ```
//!
//! ## Protocol Overview
//!
//! 1. **Client requests resource**: Standard HTTP request
//! 2. **Server responds with 402**: Challenge in `X-PAYMENT-REQUIRED` and the JSON body
//! 3. **Client signs a transfer**: Exactly `maxAmountRequired` to `payTo`, never broadcast by the client
//! 4. **Client retries with payment**: Proof in the `X-PAYMENT` header
//! 5. **Server verifies and settles**: Through the facilitator, bounded by a timeout
//! 6. **Server responds**: Only after confirmation, with `X-PAYMENT-RESPONSE`
//!
//! Every failure is reported with a [`PaymentErrorCode`] so the caller can decide
//! whether to retry, pay with another method, or give up.
//!
//! ## Networks
//!
//! Networks are CAIP-2 identifiers (`stacks:1` for mainnet, `stacks:2147483648` for
//! testnet). Bare labels such as `"mainnet"` are not representable.
//!
//! ## References
//!
//! - [x402 Specification](https://github.com/coinbase/x402)
//! - [CAIP-2](https://github.com/ChainAgnostic/CAIPs/blob/main/CAIPs/caip-2.md)

#![warn(missing_docs)]
#![warn(rustdoc::missing_crate_level_docs)]

pub mod client;
pub mod config;
pub mod errors;
pub mod facilitator;
pub mod facilitator_client;
pub mod ledger;
pub mod network;
pub mod registry;
pub mod schemes;
pub mod server;
pub mod signer;
pub mod types;
pub mod utils;

// Re-export commonly used items
pub use errors::{PaymentErrorCode, Result, X402Error};
pub use network::Network;
pub use types::{
    PaymentProof, PaymentRequiredChallenge, PaymentRequirements, SettlementRequest,
    SettlementResult, SettlementStatus, SupportedKind, SupportedResponse, TokenAmount,
    VerificationRequest, VerificationResponse, X402_VERSION,
};

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_version_constant() {
        assert_eq!(X402_VERSION, 1);
    }

    #[test]
    fn test_module_accessibility() {
        let signer = signer::LocalKeySigner::from_hex(
            "ac0974bec39a17e36ba4a6b4d238ff944bacb478cbed5efcae784d7bf4f2ff80",
            "ST2JN8XG1BG9TZE5FQ4GP0CMTHKF9EVRZ5THN11R1",
            Network::stacks_testnet(),
        )
        .unwrap();
        let _ = client::X402ClientConfig::new(Arc::new(signer));
        let _ = server::PaymentConfig::new(
            "ST1PQHQKV0RJXZFY1DGX8MNSNYVE3VGZJSRTPGZGM",
            types::STX_ASSET,
            Network::stacks_testnet(),
            10_000u64,
            "desc",
        );
        let _ = facilitator::FacilitatorConfig::new(Network::stacks_testnet());
        let _ = registry::ResourceRegistry::new();
    }
}
