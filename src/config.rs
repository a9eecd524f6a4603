//! Settings loaded from `X402_*` environment variables.
//!
//! Every loader has a `from_lookup` form taking a key-to-value function, so the
//! parsing rules can be exercised without touching the process environment.
//!
//! | Variable | Used by | Default |
//! |----------|---------|---------|
//! | `X402_FACILITATOR_URL` | gate | required |
//! | `X402_PAY_TO` | gate | required |
//! | `X402_NETWORK` | all | `stacks:2147483648` |
//! | `X402_ASSET` | gate | `STX` |
//! | `X402_PRICE` | gate | `0.01` (display units) |
//! | `X402_ASSET_DECIMALS` | gate | `6` |
//! | `X402_SETTLEMENT_TIMEOUT_SECS` | gate | `60` |
//! | `X402_BASE_URL` | gate | unset |
//! | `X402_PRIVATE_KEY` | client | required |
//! | `X402_PAYER_ADDRESS` | client | required |
//! | `X402_MAX_AMOUNT` | client | unset |
//! | `X402_CONFIRMATION_TIMEOUT_SECS` | facilitator | `30` |
//! | `X402_POLL_INTERVAL_MS` | facilitator | `500` |
//! | `X402_BROADCAST_RETRIES` | facilitator | `3` |
//! | `PORT` | gate, facilitator | `3000` / `8080` |

use crate::errors::{Result, X402Error};
use crate::facilitator::FacilitatorConfig;
use crate::network::Network;
use crate::server::PaymentConfig;
use crate::signer::LocalKeySigner;
use crate::types::{TokenAmount, STX_ASSET};
use crate::utils::display_to_smallest_unit;
use std::fmt::Display;
use std::str::FromStr;
use std::time::Duration;
use url::Url;

fn required<F>(lookup: &F, key: &str) -> Result<String>
where
    F: Fn(&str) -> Option<String>,
{
    lookup(key)
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .ok_or_else(|| X402Error::ConfigError(format!("{key} is not set")))
}

fn optional<F, T>(lookup: &F, key: &str) -> Result<Option<T>>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: Display,
{
    match lookup(key).map(|v| v.trim().to_string()) {
        Some(v) if !v.is_empty() => v
            .parse()
            .map(Some)
            .map_err(|e| X402Error::ConfigError(format!("{key}='{v}': {e}"))),
        _ => Ok(None),
    }
}

fn or_default<F, T>(lookup: &F, key: &str, default: T) -> Result<T>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: Display,
{
    Ok(optional(lookup, key)?.unwrap_or(default))
}

fn network<F>(lookup: &F) -> Result<Network>
where
    F: Fn(&str) -> Option<String>,
{
    or_default(lookup, "X402_NETWORK", Network::stacks_testnet())
}

/// Settings for a resource server running a payment gate.
#[derive(Debug, Clone)]
pub struct GateSettings {
    /// Facilitator base URL
    pub facilitator_url: Url,
    /// Payee principal
    pub pay_to: String,
    /// Network payments must be made on
    pub network: Network,
    /// Asset identifier
    pub asset: String,
    /// Price in smallest units
    pub price: TokenAmount,
    /// Settlement confirmation bound
    pub settlement_timeout: Duration,
    /// Public origin for resource URLs
    pub base_url: Option<Url>,
    /// Listen port
    pub port: u16,
}

impl GateSettings {
    /// Loads from the process environment.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Loads through `lookup`.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let decimals: u32 = or_default(&lookup, "X402_ASSET_DECIMALS", 6)?;
        let price_display = or_default(&lookup, "X402_PRICE", "0.01".to_string())?;
        let price = display_to_smallest_unit(&price_display, decimals)
            .map_err(|e| X402Error::ConfigError(format!("X402_PRICE: {e}")))?;

        Ok(Self {
            facilitator_url: required(&lookup, "X402_FACILITATOR_URL")?
                .parse()
                .map_err(|e| X402Error::ConfigError(format!("X402_FACILITATOR_URL: {e}")))?,
            pay_to: required(&lookup, "X402_PAY_TO")?,
            network: network(&lookup)?,
            asset: or_default(&lookup, "X402_ASSET", STX_ASSET.to_string())?,
            price,
            settlement_timeout: Duration::from_secs(or_default(
                &lookup,
                "X402_SETTLEMENT_TIMEOUT_SECS",
                60,
            )?),
            base_url: optional(&lookup, "X402_BASE_URL")?,
            port: or_default(&lookup, "PORT", 3000)?,
        })
    }

    /// The payment method these settings describe.
    pub fn payment_config(&self, description: impl Into<String>) -> PaymentConfig {
        PaymentConfig::new(
            self.pay_to.clone(),
            self.asset.clone(),
            self.network.clone(),
            self.price,
            description,
        )
    }
}

/// Settings for a paying client.
#[derive(Clone)]
pub struct ClientSettings {
    /// Hex private key
    pub private_key: String,
    /// Payer principal
    pub address: String,
    /// Network the client pays on
    pub network: Network,
    /// Per-request spending limit in smallest units
    pub max_amount: Option<TokenAmount>,
}

impl std::fmt::Debug for ClientSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientSettings")
            .field("address", &self.address)
            .field("network", &self.network)
            .field("max_amount", &self.max_amount)
            .finish_non_exhaustive()
    }
}

impl ClientSettings {
    /// Loads from the process environment.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Loads through `lookup`.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        Ok(Self {
            private_key: required(&lookup, "X402_PRIVATE_KEY")?,
            address: required(&lookup, "X402_PAYER_ADDRESS")?,
            network: network(&lookup)?,
            max_amount: optional(&lookup, "X402_MAX_AMOUNT")?,
        })
    }

    /// Builds the local signer these settings describe.
    pub fn signer(&self) -> Result<LocalKeySigner> {
        LocalKeySigner::from_hex(&self.private_key, self.address.clone(), self.network.clone())
    }
}

/// Settings for the reference facilitator.
#[derive(Debug, Clone)]
pub struct FacilitatorSettings {
    /// Network settled on
    pub network: Network,
    /// Confirmation deadline
    pub confirmation_timeout: Duration,
    /// Confirmation poll interval
    pub poll_interval: Duration,
    /// Broadcast retries on transient errors
    pub broadcast_retries: u32,
    /// Listen port
    pub port: u16,
}

impl FacilitatorSettings {
    /// Loads from the process environment.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Loads through `lookup`.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        Ok(Self {
            network: network(&lookup)?,
            confirmation_timeout: Duration::from_secs(or_default(
                &lookup,
                "X402_CONFIRMATION_TIMEOUT_SECS",
                30,
            )?),
            poll_interval: Duration::from_millis(or_default(
                &lookup,
                "X402_POLL_INTERVAL_MS",
                500,
            )?),
            broadcast_retries: or_default(&lookup, "X402_BROADCAST_RETRIES", 3)?,
            port: or_default(&lookup, "PORT", 8080)?,
        })
    }

    /// The facilitator configuration these settings describe.
    pub fn facilitator_config(&self) -> FacilitatorConfig {
        let defaults = FacilitatorConfig::new(self.network.clone());
        let backoff = defaults.retry_backoff;
        defaults
            .with_confirmation_timeout(self.confirmation_timeout)
            .with_poll_interval(self.poll_interval)
            .with_broadcast_retries(self.broadcast_retries, backoff)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_gate_settings_defaults() {
        let settings = GateSettings::from_lookup(lookup(&[
            ("X402_FACILITATOR_URL", "http://localhost:8080/"),
            ("X402_PAY_TO", "ST1PQHQKV0RJXZFY1DGX8MNSNYVE3VGZJSRTPGZGM"),
        ]))
        .unwrap();
        assert_eq!(settings.network, Network::stacks_testnet());
        assert_eq!(settings.asset, "STX");
        assert_eq!(settings.price, TokenAmount(10_000));
        assert_eq!(settings.settlement_timeout, Duration::from_secs(60));
        assert_eq!(settings.port, 3000);
        assert!(settings.base_url.is_none());

        let config = settings.payment_config("Weather");
        assert_eq!(config.amount, TokenAmount(10_000));
    }

    #[test]
    fn test_gate_settings_overrides() {
        let settings = GateSettings::from_lookup(lookup(&[
            ("X402_FACILITATOR_URL", "http://facilitator:8080/"),
            ("X402_PAY_TO", "SP000"),
            ("X402_NETWORK", "stacks:1"),
            ("X402_PRICE", "2.5"),
            ("X402_SETTLEMENT_TIMEOUT_SECS", "90"),
            ("X402_BASE_URL", "https://api.example.com"),
        ]))
        .unwrap();
        assert_eq!(settings.network, Network::stacks_mainnet());
        assert_eq!(settings.price, TokenAmount(2_500_000));
        assert_eq!(settings.settlement_timeout, Duration::from_secs(90));
        assert!(settings.base_url.is_some());
    }

    #[test]
    fn test_missing_and_invalid_values() {
        let err = GateSettings::from_lookup(lookup(&[("X402_PAY_TO", "SP000")])).unwrap_err();
        assert!(err.to_string().contains("X402_FACILITATOR_URL"));

        let err = GateSettings::from_lookup(lookup(&[
            ("X402_FACILITATOR_URL", "http://localhost:8080/"),
            ("X402_PAY_TO", "SP000"),
            ("X402_NETWORK", "mainnet"),
        ]))
        .unwrap_err();
        assert!(err.to_string().contains("X402_NETWORK"));

        let err = GateSettings::from_lookup(lookup(&[
            ("X402_FACILITATOR_URL", "http://localhost:8080/"),
            ("X402_PAY_TO", "SP000"),
            ("X402_PRICE", "0.0000001"),
        ]))
        .unwrap_err();
        assert!(matches!(err, X402Error::ConfigError(_)));
    }

    #[test]
    fn test_client_settings() {
        let settings = ClientSettings::from_lookup(lookup(&[
            (
                "X402_PRIVATE_KEY",
                "ac0974bec39a17e36ba4a6b4d238ff944bacb478cbed5efcae784d7bf4f2ff80",
            ),
            ("X402_PAYER_ADDRESS", "ST2JN8XG1BG9TZE5FQ4GP0CMTHKF9EVRZ5THN11R1"),
            ("X402_MAX_AMOUNT", "50000"),
        ]))
        .unwrap();
        assert_eq!(settings.max_amount, Some(TokenAmount(50_000)));
        assert!(settings.signer().is_ok());
        assert!(!format!("{settings:?}").contains("ac0974"));
    }

    #[test]
    fn test_facilitator_settings() {
        let settings = FacilitatorSettings::from_lookup(lookup(&[
            ("X402_CONFIRMATION_TIMEOUT_SECS", "5"),
            ("X402_BROADCAST_RETRIES", "1"),
        ]))
        .unwrap();
        let config = settings.facilitator_config();
        assert_eq!(config.confirmation_timeout, Duration::from_secs(5));
        assert_eq!(config.broadcast_retries, 1);
        assert!(config.is_supported("exact", &Network::stacks_testnet()));
        assert_eq!(settings.port, 8080);
    }
}
