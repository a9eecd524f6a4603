//! Server-side functionality for the x402 protocol.
//!
//! [`PaymentGate`] protects axum routes: a request without `X-PAYMENT` gets a
//! 402 challenge, a request with a proof is verified and settled through a
//! [`Facilitator`] before the handler runs. The handler runs at most once per
//! confirmed settlement and never on any failure path.
//!
//! ```no_run
//! use axum::{middleware, routing::get, Router};
//! use std::sync::Arc;
//! use x402_stacks::facilitator_client::FacilitatorClient;
//! use x402_stacks::network::Network;
//! use x402_stacks::server::{require_payment, PaymentConfig, PaymentGate};
//! use x402_stacks::types::STX_ASSET;
//!
//! # fn build() -> x402_stacks::Result<Router> {
//! let facilitator = FacilitatorClient::try_from("http://localhost:8080")?;
//! let gate = PaymentGate::new(
//!     Arc::new(facilitator),
//!     vec![PaymentConfig::new(
//!         "ST1PQHQKV0RJXZFY1DGX8MNSNYVE3VGZJSRTPGZGM",
//!         STX_ASSET,
//!         Network::stacks_testnet(),
//!         10_000u64,
//!         "Weather data",
//!     )],
//! )?;
//!
//! Ok(Router::new()
//!     .route("/weather", get(|| async { "sunny" }))
//!     .layer(middleware::from_fn_with_state(gate, require_payment)))
//! # }
//! ```

use crate::errors::{PaymentErrorCode, Result, X402Error};
use crate::facilitator::Facilitator;
use crate::network::Network;
use crate::types::{
    FacilitatorRequest, OutputSchema, PaymentRequiredChallenge, PaymentRequirements,
    SettlementResult, SettlementStatus, TokenAmount, EXACT_SCHEME, PAYMENT_HEADER,
    PAYMENT_REQUIRED_HEADER, PAYMENT_RESPONSE_HEADER, STX_ASSET, X402_VERSION,
};
use crate::utils::{decode_payment_header, display_to_smallest_unit, encode_header};
use axum::extract::{Request, State};
use axum::http::{header, HeaderName, HeaderValue, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;
use url::Url;

/// Decimals of the native STX token.
pub const STX_DECIMALS: u32 = 6;

/// Configuration for one accepted payment method on a server endpoint.
#[derive(Clone, Debug)]
pub struct PaymentConfig {
    /// Address to receive payments
    pub pay_to: String,

    /// Asset identifier (`STX` or a token contract id)
    pub asset: String,

    /// Network the payment must be made on
    pub network: Network,

    /// Payment scheme (e.g., "exact")
    pub scheme: String,

    /// Exact price in smallest units
    pub amount: TokenAmount,

    /// Description of what the payment is for
    pub description: String,

    /// MIME type of the protected resource
    pub mime_type: String,

    /// Maximum timeout in seconds for payment validity
    pub max_timeout_seconds: u64,

    /// Machine-readable description of how to call the resource
    pub output_schema: OutputSchema,

    /// Scheme-specific extra data
    pub extra: Option<Value>,
}

impl PaymentConfig {
    /// Creates a new payment configuration.
    ///
    /// The output schema defaults to a discoverable `GET` endpoint.
    ///
    /// # Examples
    ///
    /// ```
    /// use x402_stacks::network::Network;
    /// use x402_stacks::server::PaymentConfig;
    ///
    /// let config = PaymentConfig::new(
    ///     "ST1PQHQKV0RJXZFY1DGX8MNSNYVE3VGZJSRTPGZGM",
    ///     "STX",
    ///     Network::stacks_testnet(),
    ///     10_000u64, // 0.01 STX
    ///     "Weather API access",
    /// );
    /// let requirements = config.to_requirements("http://localhost:3000/weather");
    /// assert_eq!(requirements.max_amount_required.to_string(), "10000");
    /// assert!(requirements.output_schema.is_some());
    /// ```
    pub fn new(
        pay_to: impl Into<String>,
        asset: impl Into<String>,
        network: Network,
        amount: impl Into<TokenAmount>,
        description: impl Into<String>,
    ) -> Self {
        Self {
            pay_to: pay_to.into(),
            asset: asset.into(),
            network,
            scheme: EXACT_SCHEME.to_string(),
            amount: amount.into(),
            description: description.into(),
            mime_type: "application/json".to_string(),
            max_timeout_seconds: 300,
            output_schema: OutputSchema::http("GET"),
            extra: None,
        }
    }

    /// Sets the timeout for payment validity.
    pub fn with_timeout(mut self, seconds: u64) -> Self {
        self.max_timeout_seconds = seconds;
        self
    }

    /// Sets the MIME type of the resource.
    pub fn with_mime_type(mut self, mime_type: impl Into<String>) -> Self {
        self.mime_type = mime_type.into();
        self
    }

    /// Replaces the output schema.
    pub fn with_output_schema(mut self, schema: OutputSchema) -> Self {
        self.output_schema = schema;
        self
    }

    /// Attaches scheme-specific extra data.
    pub fn with_extra(mut self, extra: Value) -> Self {
        self.extra = Some(extra);
        self
    }

    /// Converts the configuration to payment requirements for `resource`.
    pub fn to_requirements(&self, resource: &str) -> PaymentRequirements {
        PaymentRequirements {
            scheme: self.scheme.clone(),
            network: self.network.clone(),
            asset: self.asset.clone(),
            max_amount_required: self.amount,
            resource: resource.to_string(),
            description: self.description.clone(),
            mime_type: self.mime_type.clone(),
            pay_to: self.pay_to.clone(),
            max_timeout_seconds: self.max_timeout_seconds,
            output_schema: Some(self.output_schema.clone()),
            extra: self.extra.clone(),
        }
    }
}

/// Creates an STX payment configuration from a display price such as `"0.01"`.
///
/// ```
/// use x402_stacks::network::Network;
/// use x402_stacks::server::create_stx_config;
///
/// let config = create_stx_config(
///     "ST1PQHQKV0RJXZFY1DGX8MNSNYVE3VGZJSRTPGZGM",
///     Network::stacks_testnet(),
///     "0.01",
///     "API access",
/// ).unwrap();
/// assert_eq!(config.amount.value(), 10_000);
/// ```
pub fn create_stx_config(
    pay_to: impl Into<String>,
    network: Network,
    price: &str,
    description: impl Into<String>,
) -> Result<PaymentConfig> {
    let amount = display_to_smallest_unit(price, STX_DECIMALS)?;
    Ok(PaymentConfig::new(
        pay_to,
        STX_ASSET,
        network,
        amount,
        description,
    ))
}

/// Creates a 402 challenge listing every configured method, in order.
pub fn create_payment_required_response(
    configs: &[PaymentConfig],
    resource: &str,
) -> Result<PaymentRequiredChallenge> {
    PaymentRequiredChallenge::new(
        configs
            .iter()
            .map(|config| config.to_requirements(resource))
            .collect(),
    )
}

/// HTTP status a gate answers with for each error classification.
pub fn status_for(code: Option<PaymentErrorCode>) -> StatusCode {
    match code {
        Some(PaymentErrorCode::PaymentRequired)
        | Some(PaymentErrorCode::ProofInvalid)
        | Some(PaymentErrorCode::SettlementFailed) => StatusCode::PAYMENT_REQUIRED,
        Some(PaymentErrorCode::SettlementTimeout) => StatusCode::GATEWAY_TIMEOUT,
        Some(PaymentErrorCode::FacilitatorUnreachable) => StatusCode::BAD_GATEWAY,
        Some(_) => StatusCode::BAD_REQUEST,
        None => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

/// Payment gate guarding one or more routes.
///
/// Cheap to clone; use it as axum middleware state with [`require_payment`].
#[derive(Clone)]
pub struct PaymentGate {
    accepts: Arc<Vec<PaymentConfig>>,
    facilitator: Arc<dyn Facilitator>,
    verify_timeout: Duration,
    settlement_timeout: Duration,
    base_url: Option<Url>,
}

impl PaymentGate {
    /// Default bound on a facilitator `/verify` call.
    pub const DEFAULT_VERIFY_TIMEOUT: Duration = Duration::from_secs(10);

    /// Default bound on settlement confirmation.
    pub const DEFAULT_SETTLEMENT_TIMEOUT: Duration = Duration::from_secs(60);

    /// Creates a gate accepting any of `accepts`, in order of preference.
    pub fn new(facilitator: Arc<dyn Facilitator>, accepts: Vec<PaymentConfig>) -> Result<Self> {
        if accepts.is_empty() {
            return Err(X402Error::ConfigError(
                "a payment gate needs at least one accepted method".to_string(),
            ));
        }
        Ok(Self {
            accepts: Arc::new(accepts),
            facilitator,
            verify_timeout: Self::DEFAULT_VERIFY_TIMEOUT,
            settlement_timeout: Self::DEFAULT_SETTLEMENT_TIMEOUT,
            base_url: None,
        })
    }

    /// Bounds the wait for settlement confirmation.
    pub fn with_settlement_timeout(mut self, timeout: Duration) -> Self {
        self.settlement_timeout = timeout;
        self
    }

    /// Bounds the wait for proof verification.
    pub fn with_verify_timeout(mut self, timeout: Duration) -> Self {
        self.verify_timeout = timeout;
        self
    }

    /// Public origin used to build resource URLs, instead of the `Host` header.
    pub fn with_base_url(mut self, base_url: Url) -> Self {
        self.base_url = Some(base_url);
        self
    }

    /// The accepted methods, in order.
    pub fn accepts(&self) -> &[PaymentConfig] {
        &self.accepts
    }

    /// The challenge for `resource`.
    pub fn challenge(&self, resource: &str) -> PaymentRequiredChallenge {
        PaymentRequiredChallenge {
            x402_version: X402_VERSION,
            accepts: self
                .accepts
                .iter()
                .map(|config| config.to_requirements(resource))
                .collect(),
            error: None,
            message: None,
        }
    }

    /// Verifies and settles a proof for `resource`.
    ///
    /// Returns the confirmed settlement; anything short of confirmation is an
    /// error and must not grant access.
    pub async fn authorize(
        &self,
        payment_header: &str,
        resource: &str,
    ) -> Result<SettlementResult> {
        let proof = decode_payment_header(payment_header)
            .map_err(|e| X402Error::ProofInvalid(e.to_string()))?;
        let requirements = self.matching_requirements(&proof.accepted, resource)?;
        let request = FacilitatorRequest::new(proof, requirements);

        let verification = timeout(self.verify_timeout, self.facilitator.verify(&request))
            .await
            .map_err(|_| {
                X402Error::FacilitatorUnreachable(format!(
                    "verification not answered within {:?}",
                    self.verify_timeout
                ))
            })??;
        if !verification.is_valid {
            return Err(X402Error::ProofInvalid(
                verification
                    .invalid_reason
                    .unwrap_or_else(|| "rejected by facilitator".to_string()),
            ));
        }

        let settlement = timeout(self.settlement_timeout, self.facilitator.settle(&request))
            .await
            .map_err(|_| {
                X402Error::SettlementTimeout(format!(
                    "no confirmation within {:?}",
                    self.settlement_timeout
                ))
            })??;

        match settlement.status {
            SettlementStatus::Confirmed => Ok(settlement),
            SettlementStatus::Pending => Err(X402Error::SettlementTimeout(format!(
                "transfer {} still pending",
                settlement.transaction
            ))),
            SettlementStatus::Failed => Err(X402Error::SettlementFailed(
                settlement
                    .error_reason
                    .unwrap_or_else(|| "transfer failed".to_string()),
            )),
        }
    }

    /// Finds the configured method a proof claims to satisfy.
    fn matching_requirements(
        &self,
        accepted: &PaymentRequirements,
        resource: &str,
    ) -> Result<PaymentRequirements> {
        let candidates: Vec<PaymentRequirements> = self
            .accepts
            .iter()
            .map(|config| config.to_requirements(resource))
            .collect();

        if let Some(found) = candidates.iter().find(|r| r.same_terms(accepted)) {
            return Ok(found.clone());
        }
        if !candidates.iter().any(|r| r.network == accepted.network) {
            let networks: Vec<String> = candidates.iter().map(|r| r.network.to_string()).collect();
            return Err(X402Error::ProofInvalid(format!(
                "network mismatch: proof targets {}, route accepts [{}]",
                accepted.network,
                networks.join(", ")
            )));
        }
        Err(X402Error::ProofInvalid(
            "proof does not match any accepted payment method".to_string(),
        ))
    }

    /// Full URL of the requested resource.
    pub fn resource_url(&self, request: &Request) -> String {
        let path_and_query = request
            .uri()
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("/");
        match &self.base_url {
            Some(base) => format!("{}{}", base.as_str().trim_end_matches('/'), path_and_query),
            None => {
                let host = request
                    .headers()
                    .get(header::HOST)
                    .and_then(|h| h.to_str().ok())
                    .unwrap_or("localhost");
                format!("http://{host}{path_and_query}")
            }
        }
    }

    /// A bare 402 challenge.
    pub fn payment_required(&self, resource: &str) -> Response {
        self.challenge_response(StatusCode::PAYMENT_REQUIRED, self.challenge(resource))
    }

    /// Maps a failed payment attempt onto an error response carrying the challenge.
    pub fn reject(&self, resource: &str, error: &X402Error) -> Response {
        let code = error.code();
        let status = status_for(code);
        let challenge = self.challenge(resource);
        let challenge = match code {
            Some(code) => challenge.with_error(code, error.to_string()),
            None => PaymentRequiredChallenge {
                message: Some(error.to_string()),
                ..challenge
            },
        };
        self.challenge_response(status, challenge)
    }

    fn challenge_response(&self, status: StatusCode, challenge: PaymentRequiredChallenge) -> Response {
        let mut response = (status, Json(&challenge)).into_response();
        if status == StatusCode::PAYMENT_REQUIRED {
            insert_encoded(&mut response, PAYMENT_REQUIRED_HEADER, &challenge);
        }
        response
    }
}

fn insert_encoded<T: serde::Serialize>(response: &mut Response, name: &'static str, value: &T) {
    let encoded = match encode_header(value) {
        Ok(encoded) => encoded,
        Err(e) => {
            tracing::warn!(error = %e, "failed to encode {name}");
            return;
        }
    };
    match (
        HeaderName::from_bytes(name.as_bytes()),
        HeaderValue::try_from(encoded),
    ) {
        (Ok(name), Ok(value)) => {
            response.headers_mut().insert(name, value);
        }
        _ => tracing::warn!("{name} could not be attached to the response"),
    }
}

/// Axum middleware enforcing a [`PaymentGate`].
///
/// Use with `axum::middleware::from_fn_with_state(gate, require_payment)`. On
/// success the handler sees the [`SettlementResult`] as a request extension and
/// the response carries it in `X-PAYMENT-RESPONSE`.
pub async fn require_payment(
    State(gate): State<PaymentGate>,
    mut request: Request,
    next: Next,
) -> Response {
    let resource = gate.resource_url(&request);

    let Some(value) = request.headers().get(PAYMENT_HEADER) else {
        tracing::debug!(%resource, "no payment attached");
        return gate.payment_required(&resource);
    };
    let payment_header = match value.to_str() {
        Ok(v) => v.to_owned(),
        Err(_) => {
            let err = X402Error::ProofInvalid("X-PAYMENT is not valid ASCII".to_string());
            return gate.reject(&resource, &err);
        }
    };

    let settlement = match gate.authorize(&payment_header, &resource).await {
        Ok(settlement) => settlement,
        Err(err) => {
            tracing::info!(%resource, error = %err, "payment rejected");
            return gate.reject(&resource, &err);
        }
    };
    tracing::info!(
        %resource,
        payer = %settlement.payer,
        transaction = %settlement.transaction,
        "payment settled"
    );

    request.extensions_mut().insert(settlement.clone());
    let mut response = next.run(request).await;
    insert_encoded(&mut response, PAYMENT_RESPONSE_HEADER, &settlement);
    response
}
