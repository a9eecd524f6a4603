//! Error types for the x402-stacks library.
//!
//! [`X402Error`] covers every failure a gate, client or facilitator can hit.
//! [`PaymentErrorCode`] is the wire-level classification that travels in error
//! bodies so a calling agent can decide whether to retry, pick another accepted
//! method, or give up.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Wire classification of a failed payment attempt.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum PaymentErrorCode {
    /// No proof was supplied; the body carries the accepted methods.
    PaymentRequired,
    /// The challenge had no usable `accepts` entries.
    ChallengeMalformed,
    /// None of the accepted methods can be paid by the client.
    UnsupportedMethod,
    /// The signing capability refused or the user rejected the request.
    SigningDeclined,
    /// The proof failed structural, semantic or signature checks.
    ProofInvalid,
    /// The facilitator did not confirm settlement in time. No funds were granted against.
    SettlementTimeout,
    /// The ledger rejected the transfer after broadcast.
    SettlementFailed,
    /// The facilitator could not be reached or answered with garbage.
    FacilitatorUnreachable,
}

impl PaymentErrorCode {
    /// Returns the snake_case wire name.
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentErrorCode::PaymentRequired => "payment_required",
            PaymentErrorCode::ChallengeMalformed => "challenge_malformed",
            PaymentErrorCode::UnsupportedMethod => "unsupported_method",
            PaymentErrorCode::SigningDeclined => "signing_declined",
            PaymentErrorCode::ProofInvalid => "proof_invalid",
            PaymentErrorCode::SettlementTimeout => "settlement_timeout",
            PaymentErrorCode::SettlementFailed => "settlement_failed",
            PaymentErrorCode::FacilitatorUnreachable => "facilitator_unreachable",
        }
    }

    /// Whether the caller may retry with a fresh request and a fresh proof.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            PaymentErrorCode::PaymentRequired
                | PaymentErrorCode::SettlementTimeout
                | PaymentErrorCode::FacilitatorUnreachable
        )
    }
}

impl fmt::Display for PaymentErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Main error type for x402 operations.
#[derive(Error, Debug)]
pub enum X402Error {
    /// Error during HTTP request/response handling
    #[error("HTTP error: {0}")]
    HttpError(#[from] reqwest::Error),

    /// Error during JSON serialization/deserialization
    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),

    /// Error during Base64 encoding/decoding
    #[error("Base64 error: {0}")]
    Base64Error(#[from] base64::DecodeError),

    /// Error parsing URL
    #[error("URL parse error: {0}")]
    UrlParseError(#[from] url::ParseError),

    /// Network identifier is not a namespaced `namespace:reference` value
    #[error("Invalid network identifier: {0}")]
    InvalidNetwork(String),

    /// Invalid amount
    #[error("Invalid amount: {0}")]
    InvalidAmount(String),

    /// The 402 challenge could not be parsed
    #[error("Malformed payment challenge: {0}")]
    MalformedChallenge(String),

    /// The 402 challenge carried an empty `accepts` list
    #[error("No accepted payment methods in challenge")]
    NoAcceptedMethods,

    /// None of the accepted entries is payable with the configured signer
    #[error("No supported payment method: {0}")]
    UnsupportedMethod(String),

    /// The selected entry asks for more than the client is willing to pay
    #[error("Payment of {required} exceeds configured limit of {limit}")]
    PaymentLimitExceeded {
        /// Amount the server asked for, in smallest units
        required: u128,
        /// Client limit, in smallest units
        limit: u128,
    },

    /// The signing capability refused to sign
    #[error("Signing declined: {0}")]
    SigningDeclined(String),

    /// The delegated wallet did not answer in time
    #[error("Signing timed out after {0:?}")]
    SigningTimeout(Duration),

    /// Low-level signature failure (bad key, unrecoverable signature)
    #[error("Signature error: {0}")]
    SignatureError(String),

    /// Invalid payment payload
    #[error("Invalid payment payload: {0}")]
    InvalidPayload(String),

    /// The proof was rejected by local checks or by the facilitator
    #[error("Payment proof invalid: {0}")]
    ProofInvalid(String),

    /// Settlement was not confirmed within the bound
    #[error("Settlement not confirmed in time: {0}")]
    SettlementTimeout(String),

    /// The ledger rejected the transfer
    #[error("Settlement failed: {0}")]
    SettlementFailed(String),

    /// The facilitator could not be reached
    #[error("Facilitator unreachable: {0}")]
    FacilitatorUnreachable(String),

    /// Unsupported payment scheme
    #[error("Unsupported scheme: {0}")]
    UnsupportedScheme(String),

    /// The resource server refused the paid retry
    #[error("Payment rejected by server ({code}): {message}")]
    PaymentRejected {
        /// Error code reported by the gate
        code: PaymentErrorCode,
        /// Human-readable detail
        message: String,
    },

    /// Configuration error
    #[error("Configuration error: {0}")]
    ConfigError(String),
}

impl X402Error {
    /// Maps the error onto its wire classification, if it has one.
    pub fn code(&self) -> Option<PaymentErrorCode> {
        match self {
            X402Error::MalformedChallenge(_) | X402Error::NoAcceptedMethods => {
                Some(PaymentErrorCode::ChallengeMalformed)
            }
            X402Error::UnsupportedMethod(_)
            | X402Error::UnsupportedScheme(_)
            | X402Error::PaymentLimitExceeded { .. } => Some(PaymentErrorCode::UnsupportedMethod),
            X402Error::SigningDeclined(_) | X402Error::SigningTimeout(_) => {
                Some(PaymentErrorCode::SigningDeclined)
            }
            X402Error::InvalidPayload(_)
            | X402Error::ProofInvalid(_)
            | X402Error::Base64Error(_)
            | X402Error::InvalidNetwork(_) => Some(PaymentErrorCode::ProofInvalid),
            X402Error::SettlementTimeout(_) => Some(PaymentErrorCode::SettlementTimeout),
            X402Error::SettlementFailed(_) => Some(PaymentErrorCode::SettlementFailed),
            X402Error::FacilitatorUnreachable(_) => Some(PaymentErrorCode::FacilitatorUnreachable),
            X402Error::PaymentRejected { code, .. } => Some(*code),
            _ => None,
        }
    }
}

/// Result type alias for x402 operations.
pub type Result<T> = std::result::Result<T, X402Error>;
