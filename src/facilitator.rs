//! Facilitator service implementation for the x402 protocol.
//!
//! A facilitator verifies payment proofs and settles them on a ledger on behalf
//! of resource servers. [`Facilitator`] is the seam the payment gate talks to;
//! [`LocalFacilitator`] is the reference implementation backed by any
//! [`Ledger`], and [`routes`] exposes any facilitator over HTTP so that
//! [`FacilitatorClient`](crate::facilitator_client::FacilitatorClient) can reach
//! it remotely.

use crate::errors::{PaymentErrorCode, Result, X402Error};
use crate::ledger::{Ledger, LedgerError, TransferStatus};
use crate::network::Network;
use crate::schemes::{scheme_for, VerifiedPayment};
use crate::types::{
    SettlementRequest, SettlementResult, SettlementStatus, SupportedKind, SupportedResponse,
    VerificationRequest, VerificationResponse, EXACT_SCHEME, X402_VERSION,
};
use async_trait::async_trait;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::time::Instant;

/// Verifies and settles payment proofs.
#[async_trait]
pub trait Facilitator: Send + Sync {
    /// Checks a proof without moving funds.
    async fn verify(&self, request: &VerificationRequest) -> Result<VerificationResponse>;

    /// Verifies, broadcasts and waits for the transfer to settle.
    ///
    /// A proof that fails verification is reported as
    /// [`X402Error::ProofInvalid`]; a ledger rejection is a
    /// [`SettlementStatus::Failed`] result; a transfer still unconfirmed at the
    /// deadline is a [`SettlementStatus::Pending`] result.
    async fn settle(&self, request: &SettlementRequest) -> Result<SettlementResult>;

    /// Lists the (scheme, network) combinations this facilitator settles.
    async fn supported(&self) -> Result<SupportedResponse>;
}

#[async_trait]
impl<T: Facilitator + ?Sized> Facilitator for Arc<T> {
    async fn verify(&self, request: &VerificationRequest) -> Result<VerificationResponse> {
        (**self).verify(request).await
    }

    async fn settle(&self, request: &SettlementRequest) -> Result<SettlementResult> {
        (**self).settle(request).await
    }

    async fn supported(&self) -> Result<SupportedResponse> {
        (**self).supported().await
    }
}

/// Configuration for a [`LocalFacilitator`].
#[derive(Debug, Clone)]
pub struct FacilitatorConfig {
    /// Supported (scheme, network) combinations
    pub supported: Vec<(String, Network)>,

    /// How long to wait for ledger confirmation before reporting pending
    pub confirmation_timeout: Duration,

    /// Delay between confirmation polls
    pub poll_interval: Duration,

    /// Extra broadcast attempts after a transient ledger error
    pub broadcast_retries: u32,

    /// Backoff before the first broadcast retry; doubles each attempt
    pub retry_backoff: Duration,
}

impl Default for FacilitatorConfig {
    fn default() -> Self {
        Self {
            supported: Vec::new(),
            confirmation_timeout: Duration::from_secs(30),
            poll_interval: Duration::from_millis(500),
            broadcast_retries: 3,
            retry_backoff: Duration::from_millis(200),
        }
    }
}

impl FacilitatorConfig {
    /// Creates a configuration that settles the exact scheme on `network`.
    ///
    /// # Examples
    ///
    /// ```
    /// use x402_stacks::facilitator::FacilitatorConfig;
    /// use x402_stacks::network::Network;
    ///
    /// let config = FacilitatorConfig::new(Network::stacks_testnet());
    /// assert!(config.is_supported("exact", &Network::stacks_testnet()));
    /// assert!(!config.is_supported("exact", &Network::stacks_mainnet()));
    /// ```
    pub fn new(network: Network) -> Self {
        Self {
            supported: vec![(EXACT_SCHEME.to_string(), network)],
            ..Self::default()
        }
    }

    /// Adds a supported (scheme, network) combination.
    pub fn add_supported(&mut self, scheme: impl Into<String>, network: Network) {
        self.supported.push((scheme.into(), network));
    }

    /// Checks if a (scheme, network) combination is supported.
    pub fn is_supported(&self, scheme: &str, network: &Network) -> bool {
        self.supported
            .iter()
            .any(|(s, n)| s == scheme && n == network)
    }

    /// Sets the confirmation deadline.
    pub fn with_confirmation_timeout(mut self, timeout: Duration) -> Self {
        self.confirmation_timeout = timeout;
        self
    }

    /// Sets the confirmation poll interval.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Sets the number of broadcast retries and the initial backoff.
    pub fn with_broadcast_retries(mut self, retries: u32, backoff: Duration) -> Self {
        self.broadcast_retries = retries;
        self.retry_backoff = backoff;
        self
    }
}

/// Reference facilitator that settles against a [`Ledger`].
///
/// Each (payer, nonce) pair is settled at most once; the set of used nonces
/// lives in memory for the lifetime of the facilitator.
pub struct LocalFacilitator<L> {
    config: FacilitatorConfig,
    ledger: Arc<L>,
    used_nonces: Arc<RwLock<HashSet<String>>>,
}

impl<L: Ledger> LocalFacilitator<L> {
    /// Creates a facilitator over `ledger`.
    pub fn new(config: FacilitatorConfig, ledger: Arc<L>) -> Self {
        Self {
            config,
            ledger,
            used_nonces: Arc::new(RwLock::new(HashSet::new())),
        }
    }

    /// The configuration in use.
    pub fn config(&self) -> &FacilitatorConfig {
        &self.config
    }

    /// The ledger settlements go to.
    pub fn ledger(&self) -> &Arc<L> {
        &self.ledger
    }

    /// Runs the scheme checks without touching the nonce set.
    fn check(&self, request: &VerificationRequest) -> Result<VerifiedPayment> {
        let proof = &request.payment_payload;
        let requirements = &request.payment_requirements;

        if !self
            .config
            .is_supported(&requirements.scheme, &requirements.network)
        {
            return Err(X402Error::ProofInvalid(format!(
                "unsupported scheme/network: {}/{}",
                requirements.scheme, requirements.network
            )));
        }
        let scheme = scheme_for(&requirements.scheme).ok_or_else(|| {
            X402Error::ProofInvalid(format!("unsupported scheme: {}", requirements.scheme))
        })?;

        scheme.verify(proof, requirements).map_err(|e| match e {
            X402Error::ProofInvalid(_) => e,
            other => X402Error::ProofInvalid(other.to_string()),
        })
    }

    async fn broadcast(&self, verified: &VerifiedPayment) -> std::result::Result<String, LedgerError> {
        let mut attempt = 0;
        loop {
            match self.ledger.broadcast(&verified.transfer).await {
                Ok(txid) => return Ok(txid),
                Err(LedgerError::Transient(reason)) if attempt < self.config.broadcast_retries => {
                    let backoff = self.config.retry_backoff * 2u32.saturating_pow(attempt);
                    tracing::warn!(
                        attempt = attempt + 1,
                        ?backoff,
                        %reason,
                        "broadcast failed, retrying"
                    );
                    tokio::time::sleep(backoff).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn await_confirmation(&self, txid: &str) -> TransferStatus {
        let deadline = Instant::now() + self.config.confirmation_timeout;
        loop {
            match self.ledger.status(txid).await {
                Ok(TransferStatus::Pending) => {}
                Ok(terminal) => return terminal,
                Err(LedgerError::Rejected(reason)) => return TransferStatus::Failed(reason),
                Err(LedgerError::Transient(reason)) => {
                    tracing::debug!(%txid, %reason, "status poll failed");
                }
            }
            if Instant::now() >= deadline {
                return TransferStatus::Pending;
            }
            tokio::time::sleep(self.config.poll_interval).await;
        }
    }
}

fn nonce_key(verified: &VerifiedPayment) -> String {
    format!(
        "{}:{}",
        verified.payer, verified.transfer.transfer.nonce
    )
}

#[async_trait]
impl<L: Ledger + 'static> Facilitator for LocalFacilitator<L> {
    async fn verify(&self, request: &VerificationRequest) -> Result<VerificationResponse> {
        let verified = match self.check(request) {
            Ok(v) => v,
            Err(X402Error::ProofInvalid(reason)) => {
                tracing::debug!(%reason, "verification failed");
                return Ok(VerificationResponse::invalid(reason));
            }
            Err(e) => return Ok(VerificationResponse::invalid(e.to_string())),
        };

        // Check nonce to prevent replay
        let nonces = self.used_nonces.read().await;
        if nonces.contains(&nonce_key(&verified)) {
            return Ok(VerificationResponse::invalid("nonce already used"));
        }

        Ok(VerificationResponse::valid(verified.payer))
    }

    async fn settle(&self, request: &SettlementRequest) -> Result<SettlementResult> {
        let verified = self.check(request)?;
        let network = request.payment_requirements.network.clone();
        let key = nonce_key(&verified);

        // Reserve the nonce before anything reaches the ledger
        {
            let mut nonces = self.used_nonces.write().await;
            if !nonces.insert(key.clone()) {
                return Err(X402Error::ProofInvalid("nonce already used".to_string()));
            }
        }

        let txid = match self.broadcast(&verified).await {
            Ok(txid) => txid,
            Err(LedgerError::Transient(reason)) => {
                // Nothing was written, so the proof may be presented again
                self.used_nonces.write().await.remove(&key);
                return Err(X402Error::FacilitatorUnreachable(format!(
                    "ledger unavailable: {reason}"
                )));
            }
            Err(LedgerError::Rejected(reason)) => {
                tracing::info!(payer = %verified.payer, %reason, "broadcast rejected");
                return Ok(SettlementResult::failed(
                    network,
                    verified.payer,
                    "",
                    reason,
                ));
            }
        };
        tracing::info!(payer = %verified.payer, %txid, "transfer broadcast");

        let result = match self.await_confirmation(&txid).await {
            TransferStatus::Confirmed => SettlementResult {
                transaction: txid,
                payer: verified.payer,
                network,
                status: SettlementStatus::Confirmed,
                error_reason: None,
                settled_at: Some(chrono::Utc::now()),
            },
            TransferStatus::Pending => SettlementResult {
                transaction: txid,
                payer: verified.payer,
                network,
                status: SettlementStatus::Pending,
                error_reason: Some("confirmation deadline passed".to_string()),
                settled_at: None,
            },
            TransferStatus::Failed(reason) => {
                SettlementResult::failed(network, verified.payer, txid, reason)
            }
        };
        tracing::info!(
            transaction = %result.transaction,
            status = ?result.status,
            "settlement finished"
        );
        Ok(result)
    }

    async fn supported(&self) -> Result<SupportedResponse> {
        let kinds = self
            .config
            .supported
            .iter()
            .map(|(scheme, network)| SupportedKind {
                x402_version: X402_VERSION,
                scheme: scheme.clone(),
                network: network.clone(),
                assets: None,
            })
            .collect();

        Ok(SupportedResponse { kinds })
    }
}

/// Error body returned by the facilitator HTTP endpoints.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct FacilitatorErrorBody {
    /// Classification, when the failure has one
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<PaymentErrorCode>,
    /// Human-readable detail
    pub message: String,
}

impl FacilitatorErrorBody {
    /// Rebuilds the error the facilitator reported, if it is one the gate
    /// distinguishes.
    pub fn into_error(self) -> Option<X402Error> {
        match self.error? {
            PaymentErrorCode::ProofInvalid => Some(X402Error::ProofInvalid(self.message)),
            PaymentErrorCode::SettlementFailed => Some(X402Error::SettlementFailed(self.message)),
            PaymentErrorCode::SettlementTimeout => Some(X402Error::SettlementTimeout(self.message)),
            PaymentErrorCode::FacilitatorUnreachable => {
                Some(X402Error::FacilitatorUnreachable(self.message))
            }
            _ => None,
        }
    }
}

impl IntoResponse for X402Error {
    fn into_response(self) -> Response {
        let code = self.code();
        let status = match code {
            Some(PaymentErrorCode::ProofInvalid) => StatusCode::BAD_REQUEST,
            Some(PaymentErrorCode::FacilitatorUnreachable) => StatusCode::SERVICE_UNAVAILABLE,
            Some(PaymentErrorCode::SettlementTimeout) => StatusCode::GATEWAY_TIMEOUT,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let body = FacilitatorErrorBody {
            error: code,
            message: self.to_string(),
        };
        (status, Json(body)).into_response()
    }
}

/// Builds the facilitator HTTP router.
///
/// Exposes `POST /verify`, `POST /settle`, `GET /supported` and `GET /health`.
pub fn routes<F: Facilitator + 'static>(facilitator: Arc<F>) -> Router {
    Router::new()
        .route("/verify", post(verify_handler::<F>))
        .route("/settle", post(settle_handler::<F>))
        .route("/supported", get(supported_handler::<F>))
        .route("/health", get(health_handler))
        .with_state(facilitator)
}

async fn verify_handler<F: Facilitator>(
    State(facilitator): State<Arc<F>>,
    Json(request): Json<VerificationRequest>,
) -> Result<Json<VerificationResponse>> {
    facilitator.verify(&request).await.map(Json)
}

async fn settle_handler<F: Facilitator>(
    State(facilitator): State<Arc<F>>,
    Json(request): Json<SettlementRequest>,
) -> Result<Json<SettlementResult>> {
    facilitator.settle(&request).await.map(Json)
}

async fn supported_handler<F: Facilitator>(
    State(facilitator): State<Arc<F>>,
) -> Result<Json<SupportedResponse>> {
    facilitator.supported().await.map(Json)
}

async fn health_handler() -> &'static str {
    "OK"
}
