//! Utility functions for x402 operations.
//!
//! Header encoding/decoding, nonce handling, time helpers and exact
//! display-unit to smallest-unit conversion.

use crate::errors::{Result, X402Error};
use crate::types::{PaymentProof, TokenAmount};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::str::FromStr;

/// Encodes any x402 message as Base64 JSON for use in a header.
///
/// # Examples
///
/// ```
/// use x402_stacks::utils::{decode_header, encode_header};
/// use serde_json::json;
///
/// let encoded = encode_header(&json!({"x402Version": 1})).unwrap();
/// let decoded: serde_json::Value = decode_header(&encoded).unwrap();
/// assert_eq!(decoded["x402Version"], 1);
/// ```
pub fn encode_header<T: Serialize>(value: &T) -> Result<String> {
    let json = serde_json::to_vec(value)?;
    Ok(BASE64.encode(json))
}

/// Decodes a Base64 JSON header value.
pub fn decode_header<T: DeserializeOwned>(encoded: &str) -> Result<T> {
    let decoded = BASE64.decode(encoded.trim().as_bytes())?;
    let json_str = String::from_utf8(decoded)
        .map_err(|e| X402Error::InvalidPayload(format!("Invalid UTF-8: {}", e)))?;
    Ok(serde_json::from_str(&json_str)?)
}

/// Encodes a [`PaymentProof`] for the `X-PAYMENT` header.
pub fn encode_payment_header(proof: &PaymentProof) -> Result<String> {
    encode_header(proof)
}

/// Decodes a [`PaymentProof`] from the `X-PAYMENT` header.
///
/// Any failure is reported as an invalid payload.
pub fn decode_payment_header(encoded: &str) -> Result<PaymentProof> {
    decode_header(encoded).map_err(|e| match e {
        X402Error::InvalidPayload(_) => e,
        other => X402Error::InvalidPayload(other.to_string()),
    })
}

/// Generates a random 32-byte nonce as 0x-prefixed hex.
///
/// # Examples
///
/// ```
/// use x402_stacks::utils::generate_nonce;
///
/// let nonce = generate_nonce();
/// assert_eq!(nonce.len(), 66); // "0x" + 64 hex chars
/// ```
pub fn generate_nonce() -> String {
    use rand::Rng;
    let mut rng = rand::thread_rng();
    let nonce: [u8; 32] = rng.gen();
    format!("0x{}", hex::encode(nonce))
}

/// Parses a 0x-prefixed (or bare) 32-byte hex nonce.
pub fn parse_nonce(nonce: &str) -> Result<[u8; 32]> {
    let mut bytes = [0u8; 32];
    hex::decode_to_slice(strip_hex_prefix(nonce), &mut bytes)
        .map_err(|e| X402Error::InvalidPayload(format!("Invalid nonce: {}", e)))?;
    Ok(bytes)
}

/// Strips an optional `0x` / `0X` prefix.
pub fn strip_hex_prefix(s: &str) -> &str {
    s.strip_prefix("0x")
        .or_else(|| s.strip_prefix("0X"))
        .unwrap_or(s)
}

/// Converts a display amount (e.g. `"0.01"` STX) to smallest units without
/// going through floating point.
///
/// Amounts with more fractional digits than `decimals` are rejected rather
/// than rounded.
///
/// # Examples
///
/// ```
/// use x402_stacks::utils::display_to_smallest_unit;
///
/// // 0.01 STX in microSTX (6 decimals)
/// let amount = display_to_smallest_unit("0.01", 6).unwrap();
/// assert_eq!(amount.value(), 10_000);
/// assert!(display_to_smallest_unit("0.0000001", 6).is_err());
/// ```
pub fn display_to_smallest_unit(display: &str, decimals: u32) -> Result<TokenAmount> {
    if decimals > 28 {
        return Err(X402Error::InvalidAmount(format!(
            "{decimals} decimals is beyond supported precision"
        )));
    }
    let value = Decimal::from_str(display.trim())
        .map_err(|e| X402Error::InvalidAmount(format!("'{display}': {e}")))?;
    if value.is_sign_negative() {
        return Err(X402Error::InvalidAmount(format!("'{display}' is negative")));
    }
    if value.normalize().scale() > decimals {
        return Err(X402Error::InvalidAmount(format!(
            "'{display}' has more than {decimals} decimal places"
        )));
    }
    let multiplier = Decimal::from_i128_with_scale(10i128.pow(decimals), 0);
    value
        .checked_mul(multiplier)
        .and_then(|scaled| scaled.to_u128())
        .map(TokenAmount)
        .ok_or_else(|| X402Error::InvalidAmount(format!("'{display}' is out of range")))
}

/// Formats a smallest-unit amount in display units, trimming trailing zeros.
///
/// Fails when `10^decimals` does not fit in a `u128`.
///
/// ```
/// use x402_stacks::types::TokenAmount;
/// use x402_stacks::utils::smallest_unit_to_display;
///
/// assert_eq!(smallest_unit_to_display(TokenAmount(10_000), 6).unwrap(), "0.01");
/// assert_eq!(smallest_unit_to_display(TokenAmount(2_000_000), 6).unwrap(), "2");
/// ```
pub fn smallest_unit_to_display(amount: TokenAmount, decimals: u32) -> Result<String> {
    let divisor = 10u128.checked_pow(decimals).ok_or_else(|| {
        X402Error::InvalidAmount(format!("{decimals} decimals is beyond supported precision"))
    })?;
    let whole = amount.value() / divisor;
    let frac = amount.value() % divisor;
    if frac == 0 {
        return Ok(whole.to_string());
    }
    let frac = format!("{:0width$}", frac, width = decimals as usize);
    Ok(format!("{}.{}", whole, frac.trim_end_matches('0')))
}

/// Gets the current Unix timestamp in seconds.
///
/// # Examples
///
/// ```
/// use x402_stacks::utils::current_timestamp;
///
/// let now = current_timestamp();
/// assert!(now > 1600000000); // After Sept 2020
/// ```
pub fn current_timestamp() -> u64 {
    u64::try_from(chrono::Utc::now().timestamp()).unwrap_or(0)
}

/// Checks that `valid_before` has not passed.
///
/// # Examples
///
/// ```
/// use x402_stacks::utils::{current_timestamp, is_unexpired};
///
/// let now = current_timestamp();
/// assert!(is_unexpired(now + 300));
/// assert!(!is_unexpired(now - 60));
/// ```
pub fn is_unexpired(valid_before: u64) -> bool {
    current_timestamp() <= valid_before
}
