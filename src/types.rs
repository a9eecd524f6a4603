//! Core type definitions for the x402 protocol.
//!
//! This module contains the wire types exchanged between payer, resource server and
//! facilitator: challenges, payment requirements, proofs, transfers and settlement
//! records.

use crate::errors::{Result, X402Error};
use crate::network::Network;
use crate::utils::parse_nonce;
use chrono::{DateTime, Utc};
use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;
use sha2::{Digest, Sha512_256};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Version of the x402 protocol.
pub const X402_VERSION: u32 = 1;

/// Request header carrying the Base64 JSON [`PaymentProof`].
pub const PAYMENT_HEADER: &str = "X-PAYMENT";

/// Response header carrying the Base64 JSON [`PaymentRequiredChallenge`] on 402.
pub const PAYMENT_REQUIRED_HEADER: &str = "X-PAYMENT-REQUIRED";

/// Response header carrying the Base64 JSON [`SettlementResult`] after a paid request.
pub const PAYMENT_RESPONSE_HEADER: &str = "X-PAYMENT-RESPONSE";

/// The only payment scheme this crate implements.
pub const EXACT_SCHEME: &str = "exact";

/// Asset identifier of the native STX token.
pub const STX_ASSET: &str = "STX";

const TRANSFER_DOMAIN_TAG: &[u8] = b"x402-stacks/transfer/v1";

/// An amount in the asset's smallest unit (e.g. microSTX).
///
/// Serialized as a decimal string so large values survive JSON untouched.
///
/// ```
/// use x402_stacks::types::TokenAmount;
///
/// let amount: TokenAmount = "10000".parse().unwrap();
/// assert_eq!(amount.value(), 10_000);
/// assert!("1.5".parse::<TokenAmount>().is_err());
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct TokenAmount(pub u128);

impl TokenAmount {
    /// Returns the raw smallest-unit value.
    pub fn value(&self) -> u128 {
        self.0
    }
}

impl From<u128> for TokenAmount {
    fn from(value: u128) -> Self {
        TokenAmount(value)
    }
}

impl From<u64> for TokenAmount {
    fn from(value: u64) -> Self {
        TokenAmount(u128::from(value))
    }
}

impl fmt::Display for TokenAmount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for TokenAmount {
    type Err = X402Error;

    fn from_str(s: &str) -> Result<Self> {
        if s.is_empty() || !s.bytes().all(|b| b.is_ascii_digit()) {
            return Err(X402Error::InvalidAmount(format!(
                "'{s}' is not an integer amount in smallest units"
            )));
        }
        s.parse::<u128>()
            .map(TokenAmount)
            .map_err(|e| X402Error::InvalidAmount(format!("'{s}': {e}")))
    }
}

impl Serialize for TokenAmount {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for TokenAmount {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Self::from_str(&s).map_err(de::Error::custom)
    }
}

/// Describes one parameter of a protected resource.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct FieldSchema {
    /// JSON type of the field ("string", "number", ...)
    #[serde(rename = "type")]
    pub kind: String,

    /// Whether the caller must supply the field
    #[serde(default)]
    pub required: bool,

    /// Free-form description
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl FieldSchema {
    /// A required field of the given JSON type.
    pub fn required(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            required: true,
            description: None,
        }
    }

    /// An optional field of the given JSON type.
    pub fn optional(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            required: false,
            description: None,
        }
    }

    /// Attaches a description.
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }
}

/// How to call the resource over HTTP.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct HttpInputSchema {
    /// Always "http"
    #[serde(rename = "type")]
    pub kind: String,

    /// HTTP method
    pub method: String,

    /// Whether directories may list the resource
    #[serde(default)]
    pub discoverable: bool,

    /// Query parameters keyed by name
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub query_params: BTreeMap<String, FieldSchema>,

    /// JSON body fields keyed by name
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub body_fields: BTreeMap<String, FieldSchema>,
}

/// Machine-readable description of how to invoke a resource and what it returns.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct OutputSchema {
    /// Invocation description
    pub input: HttpInputSchema,

    /// Shape of the response body
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
}

impl OutputSchema {
    /// A discoverable HTTP resource with no declared parameters.
    ///
    /// ```
    /// use x402_stacks::types::OutputSchema;
    ///
    /// let schema = OutputSchema::http("GET");
    /// assert_eq!(schema.input.method, "GET");
    /// assert!(schema.input.discoverable);
    /// ```
    pub fn http(method: impl Into<String>) -> Self {
        Self {
            input: HttpInputSchema {
                kind: "http".to_string(),
                method: method.into().to_ascii_uppercase(),
                discoverable: true,
                query_params: BTreeMap::new(),
                body_fields: BTreeMap::new(),
            },
            output: None,
        }
    }

    /// Declares a query parameter.
    pub fn with_query_param(mut self, name: impl Into<String>, field: FieldSchema) -> Self {
        self.input.query_params.insert(name.into(), field);
        self
    }

    /// Declares a body field.
    pub fn with_body_field(mut self, name: impl Into<String>, field: FieldSchema) -> Self {
        self.input.body_fields.insert(name.into(), field);
        self
    }

    /// Declares the response shape.
    pub fn with_output(mut self, output: Value) -> Self {
        self.output = Some(output);
        self
    }
}

/// Describes the payment requirements for a specific resource.
///
/// Each requirement is one accepted way to pay: scheme, network, asset, exact
/// amount, recipient and how long settlement may take.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PaymentRequirements {
    /// Payment scheme (only "exact" is implemented)
    pub scheme: String,

    /// Namespaced network identifier
    pub network: Network,

    /// Asset identifier ("STX" or a SIP-010 contract id `addr.contract::token`)
    pub asset: String,

    /// Amount required in the asset's smallest unit
    pub max_amount_required: TokenAmount,

    /// The resource URL being purchased
    pub resource: String,

    /// Human-readable description of what the payment is for
    #[serde(default)]
    pub description: String,

    /// MIME type of the resource
    #[serde(default)]
    pub mime_type: String,

    /// Recipient principal
    pub pay_to: String,

    /// Maximum time in seconds the payer should wait for settlement
    pub max_timeout_seconds: u64,

    /// How to invoke the resource
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_schema: Option<OutputSchema>,

    /// Scheme-specific extra data
    #[serde(skip_serializing_if = "Option::is_none")]
    pub extra: Option<Value>,
}

impl PaymentRequirements {
    /// True when `other` asks for the same payment: scheme, network, asset,
    /// recipient and amount. Descriptive fields are ignored.
    pub fn same_terms(&self, other: &PaymentRequirements) -> bool {
        self.scheme == other.scheme
            && self.network == other.network
            && self.asset == other.asset
            && self.pay_to == other.pay_to
            && self.max_amount_required == other.max_amount_required
    }
}

/// Response returned by a server when payment is required (HTTP 402).
///
/// Also used as the body of every gate error, so a caller always learns which
/// methods it may retry with.
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct PaymentRequiredChallenge {
    /// Protocol version (currently 1)
    pub x402_version: u32,

    /// Ordered accepted payment alternatives
    pub accepts: Vec<PaymentRequirements>,

    /// Classification of a failed attempt, if any
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<crate::errors::PaymentErrorCode>,

    /// Detail for `error`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl PaymentRequiredChallenge {
    /// Builds a challenge; an empty `accepts` list is rejected.
    pub fn new(accepts: Vec<PaymentRequirements>) -> Result<Self> {
        let challenge = Self {
            x402_version: X402_VERSION,
            accepts,
            error: None,
            message: None,
        };
        challenge.validate()?;
        Ok(challenge)
    }

    /// Attaches an error classification and message.
    pub fn with_error(
        mut self,
        code: crate::errors::PaymentErrorCode,
        message: impl Into<String>,
    ) -> Self {
        self.error = Some(code);
        self.message = Some(message.into());
        self
    }

    /// Checks the challenge is usable by a payer.
    pub fn validate(&self) -> Result<()> {
        if self.accepts.is_empty() {
            return Err(X402Error::NoAcceptedMethods);
        }
        Ok(())
    }
}

/// Payment proof sent by the client in the `X-PAYMENT` header.
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct PaymentProof {
    /// Protocol version
    pub x402_version: u32,

    /// Resource the payment is for
    pub resource: String,

    /// The accepted entry this proof satisfies
    pub accepted: PaymentRequirements,

    /// Scheme payload; for "exact" a [`SignedTransfer`]
    pub payload: Value,
}

impl PaymentProof {
    /// Wraps a signed transfer for the chosen requirements entry.
    pub fn new(accepted: PaymentRequirements, transfer: &SignedTransfer) -> Result<Self> {
        Ok(Self {
            x402_version: X402_VERSION,
            resource: accepted.resource.clone(),
            accepted,
            payload: serde_json::to_value(transfer)?,
        })
    }

    /// Decodes the scheme payload as a signed transfer.
    pub fn signed_transfer(&self) -> Result<SignedTransfer> {
        serde_json::from_value(self.payload.clone())
            .map_err(|e| X402Error::InvalidPayload(format!("Invalid signed transfer: {e}")))
    }
}

/// A transfer instruction ready to be signed but never broadcast by the payer.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct UnsignedTransfer {
    /// Network the transfer targets
    pub network: Network,

    /// Asset being moved
    pub asset: String,

    /// Sender principal
    pub from: String,

    /// Recipient principal
    pub to: String,

    /// Amount in smallest units
    pub amount: TokenAmount,

    /// Unique 32-byte nonce (0x-prefixed hex) for replay protection
    pub nonce: String,

    /// Unix timestamp after which the transfer must not be broadcast
    pub valid_before: u64,

    /// Optional memo attached to the transfer
    #[serde(skip_serializing_if = "Option::is_none")]
    pub memo: Option<String>,
}

impl UnsignedTransfer {
    /// SHA-512/256 digest of the canonical encoding; this is what gets signed.
    ///
    /// Variable-length fields are length-prefixed so no two transfers share
    /// an encoding.
    pub fn signing_digest(&self) -> Result<[u8; 32]> {
        let nonce = parse_nonce(&self.nonce)?;
        let mut hasher = Sha512_256::new();
        hasher.update(TRANSFER_DOMAIN_TAG);
        put_field(&mut hasher, self.network.to_string().as_bytes());
        put_field(&mut hasher, self.asset.as_bytes());
        put_field(&mut hasher, self.from.as_bytes());
        put_field(&mut hasher, self.to.as_bytes());
        hasher.update(self.amount.value().to_be_bytes());
        hasher.update(nonce);
        hasher.update(self.valid_before.to_be_bytes());
        match &self.memo {
            Some(memo) => {
                hasher.update([1u8]);
                put_field(&mut hasher, memo.as_bytes());
            }
            None => hasher.update([0u8]),
        }
        let mut digest = [0u8; 32];
        digest.copy_from_slice(&hasher.finalize());
        Ok(digest)
    }
}

fn put_field(hasher: &mut Sha512_256, bytes: &[u8]) {
    // Field lengths are bounded by header sizes, far below u32::MAX.
    let len = u32::try_from(bytes.len()).unwrap_or(u32::MAX);
    hasher.update(len.to_be_bytes());
    hasher.update(bytes);
}

/// A transfer plus the payer's signature over its digest.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SignedTransfer {
    /// The signed instruction
    #[serde(flatten)]
    pub transfer: UnsignedTransfer,

    /// Compressed secp256k1 public key of the signer (hex, 33 bytes)
    pub public_key: String,

    /// Recoverable signature: recovery id byte followed by r and s (hex, 65 bytes)
    pub signature: String,
}

/// Body of facilitator `/verify` and `/settle` requests.
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct FacilitatorRequest {
    /// Protocol version
    pub x402_version: u32,

    /// The proof received from the payer
    pub payment_payload: PaymentProof,

    /// The requirements the resource server expects
    pub payment_requirements: PaymentRequirements,
}

impl FacilitatorRequest {
    /// Pairs a proof with the server-side requirements it must satisfy.
    pub fn new(proof: PaymentProof, requirements: PaymentRequirements) -> Self {
        Self {
            x402_version: X402_VERSION,
            payment_payload: proof,
            payment_requirements: requirements,
        }
    }
}

/// Request to verify a payment without settling it.
pub type VerificationRequest = FacilitatorRequest;

/// Request to settle a payment.
pub type SettlementRequest = FacilitatorRequest;

/// Response from the facilitator's `/verify` endpoint.
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct VerificationResponse {
    /// Whether the payment payload is valid
    pub is_valid: bool,

    /// Reason if invalid
    #[serde(skip_serializing_if = "Option::is_none")]
    pub invalid_reason: Option<String>,

    /// Payer principal, when known
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payer: Option<String>,
}

impl VerificationResponse {
    /// A positive verdict.
    pub fn valid(payer: impl Into<String>) -> Self {
        Self {
            is_valid: true,
            invalid_reason: None,
            payer: Some(payer.into()),
        }
    }

    /// A negative verdict with a reason.
    pub fn invalid(reason: impl Into<String>) -> Self {
        Self {
            is_valid: false,
            invalid_reason: Some(reason.into()),
            payer: None,
        }
    }
}

/// Ledger-side state of a settlement.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SettlementStatus {
    /// Broadcast but not yet confirmed
    Pending,
    /// Confirmed on the ledger
    Confirmed,
    /// Rejected by the ledger
    Failed,
}

/// Terminal record of one payment attempt, produced by the facilitator.
///
/// Returned from `/settle` and echoed to the payer in `X-PAYMENT-RESPONSE`.
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct SettlementResult {
    /// Transfer (transaction) identifier; empty if nothing was broadcast
    pub transaction: String,

    /// Payer principal
    pub payer: String,

    /// Network the transfer was settled on
    pub network: Network,

    /// Settlement state
    pub status: SettlementStatus,

    /// Reason when `status` is failed
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_reason: Option<String>,

    /// When confirmation was observed
    #[serde(skip_serializing_if = "Option::is_none")]
    pub settled_at: Option<DateTime<Utc>>,
}

impl SettlementResult {
    /// True only for a confirmed settlement.
    pub fn is_confirmed(&self) -> bool {
        self.status == SettlementStatus::Confirmed
    }

    /// A failed settlement record.
    pub fn failed(
        network: Network,
        payer: impl Into<String>,
        transaction: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        Self {
            transaction: transaction.into(),
            payer: payer.into(),
            network,
            status: SettlementStatus::Failed,
            error_reason: Some(reason.into()),
            settled_at: None,
        }
    }
}

/// A supported payment kind (scheme + network combination).
///
/// Returned by the facilitator's `/supported` endpoint.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SupportedKind {
    /// Protocol version
    pub x402_version: u32,

    /// Payment scheme
    pub scheme: String,

    /// Network identifier
    pub network: Network,

    /// Assets accepted on this network; `None` means any
    #[serde(skip_serializing_if = "Option::is_none")]
    pub assets: Option<Vec<String>>,
}

/// Response from the facilitator's `/supported` endpoint.
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct SupportedResponse {
    /// List of supported payment kinds
    pub kinds: Vec<SupportedKind>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::PaymentErrorCode;
    use serde_json::json;

    fn requirements() -> PaymentRequirements {
        PaymentRequirements {
            scheme: EXACT_SCHEME.to_string(),
            network: Network::stacks_testnet(),
            asset: STX_ASSET.to_string(),
            max_amount_required: TokenAmount(10_000),
            resource: "http://localhost:3000/weather".to_string(),
            description: "Weather API access".to_string(),
            mime_type: "application/json".to_string(),
            pay_to: "ST1PQHQKV0RJXZFY1DGX8MNSNYVE3VGZJSRTPGZGM".to_string(),
            max_timeout_seconds: 300,
            output_schema: Some(OutputSchema::http("GET")),
            extra: None,
        }
    }

    fn transfer() -> UnsignedTransfer {
        UnsignedTransfer {
            network: Network::stacks_testnet(),
            asset: STX_ASSET.to_string(),
            from: "ST2JN8XG1BG9TZE5FQ4GP0CMTHKF9EVRZ5THN11R1".to_string(),
            to: "ST1PQHQKV0RJXZFY1DGX8MNSNYVE3VGZJSRTPGZGM".to_string(),
            amount: TokenAmount(10_000),
            nonce: format!("0x{}", "11".repeat(32)),
            valid_before: 1_900_000_000,
            memo: None,
        }
    }

    #[test]
    fn test_challenge_wire_format() {
        let challenge = PaymentRequiredChallenge::new(vec![requirements()]).unwrap();
        let value = serde_json::to_value(&challenge).unwrap();

        assert_eq!(value["x402Version"], 1);
        let entry = &value["accepts"][0];
        assert_eq!(entry["network"], "stacks:2147483648");
        assert_eq!(entry["maxAmountRequired"], "10000");
        assert_eq!(entry["payTo"], "ST1PQHQKV0RJXZFY1DGX8MNSNYVE3VGZJSRTPGZGM");
        assert_eq!(entry["maxTimeoutSeconds"], 300);
        assert_eq!(entry["mimeType"], "application/json");
        assert_eq!(entry["outputSchema"]["input"]["method"], "GET");
        assert!(value.get("error").is_none());
    }

    #[test]
    fn test_empty_challenge_rejected() {
        let err = PaymentRequiredChallenge::new(vec![]).unwrap_err();
        assert!(matches!(err, X402Error::NoAcceptedMethods));

        let parsed: PaymentRequiredChallenge =
            serde_json::from_value(json!({"x402Version": 1, "accepts": []})).unwrap();
        assert!(parsed.validate().is_err());
    }

    #[test]
    fn test_challenge_with_error() {
        let challenge = PaymentRequiredChallenge::new(vec![requirements()])
            .unwrap()
            .with_error(PaymentErrorCode::ProofInvalid, "network mismatch");
        let value = serde_json::to_value(&challenge).unwrap();
        assert_eq!(value["error"], "proof_invalid");
        assert_eq!(value["message"], "network mismatch");
    }

    #[test]
    fn test_requirements_reject_bare_network() {
        let mut value = serde_json::to_value(requirements()).unwrap();
        value["network"] = json!("mainnet");
        assert!(serde_json::from_value::<PaymentRequirements>(value).is_err());
    }

    #[test]
    fn test_amount_must_be_integer_string() {
        assert_eq!("0".parse::<TokenAmount>().unwrap(), TokenAmount(0));
        assert!("".parse::<TokenAmount>().is_err());
        assert!("-1".parse::<TokenAmount>().is_err());
        assert!("0.01".parse::<TokenAmount>().is_err());
        assert!(serde_json::from_value::<TokenAmount>(json!("1e6")).is_err());
    }

    #[test]
    fn test_same_terms_ignores_description() {
        let a = requirements();
        let mut b = requirements();
        b.description = "something else".to_string();
        assert!(a.same_terms(&b));

        b.max_amount_required = TokenAmount(10_001);
        assert!(!a.same_terms(&b));
    }

    #[test]
    fn test_signing_digest_binds_fields() {
        let base = transfer();
        let digest = base.signing_digest().unwrap();
        assert_eq!(digest, base.signing_digest().unwrap());

        let mut other = transfer();
        other.amount = TokenAmount(10_001);
        assert_ne!(digest, other.signing_digest().unwrap());

        let mut other = transfer();
        other.memo = Some(String::new());
        assert_ne!(digest, other.signing_digest().unwrap());
    }

    #[test]
    fn test_signing_digest_rejects_bad_nonce() {
        let mut bad = transfer();
        bad.nonce = "0x1234".to_string();
        assert!(bad.signing_digest().is_err());
    }

    #[test]
    fn test_signed_transfer_flattens() {
        let signed = SignedTransfer {
            transfer: transfer(),
            public_key: "02".to_string(),
            signature: "00".to_string(),
        };
        let value = serde_json::to_value(&signed).unwrap();
        assert_eq!(value["amount"], "10000");
        assert_eq!(value["validBefore"], 1_900_000_000u64);
        assert_eq!(value["publicKey"], "02");

        let proof = PaymentProof::new(requirements(), &signed).unwrap();
        assert_eq!(proof.resource, "http://localhost:3000/weather");
        assert_eq!(proof.signed_transfer().unwrap(), signed);
    }

    #[test]
    fn test_settlement_status_wire_format() {
        let result = SettlementResult::failed(
            Network::stacks_mainnet(),
            "SP000",
            "",
            "insufficient balance",
        );
        let value = serde_json::to_value(&result).unwrap();
        assert_eq!(value["status"], "failed");
        assert_eq!(value["errorReason"], "insufficient balance");
        assert!(!result.is_confirmed());
    }
}
