//! Client-side functionality for the x402 protocol.
//!
//! This module provides functions for making HTTP requests that handle 402 Payment Required
//! responses, sign a payment for one of the accepted methods, and retry the request once
//! with the proof attached.

use crate::errors::{PaymentErrorCode, Result, X402Error};
use crate::network::Network;
use crate::schemes::scheme_for;
use crate::signer::PaymentSigner;
use crate::types::{
    PaymentProof, PaymentRequiredChallenge, PaymentRequirements, SettlementResult, TokenAmount,
    PAYMENT_HEADER, PAYMENT_REQUIRED_HEADER, PAYMENT_RESPONSE_HEADER,
};
use crate::utils::{decode_header, encode_payment_header};
use reqwest::{Client, Method, Response, StatusCode};
use serde_json::Value;
use std::fmt;
use std::sync::Arc;

/// Chooses which accepted payment method to pay with.
///
/// Only entries the signer supports and the client can afford are offered.
pub trait PaymentSelector: Send + Sync {
    /// Picks one of `candidates`, or `None` to decline all of them.
    fn select<'a>(&self, candidates: &[&'a PaymentRequirements]) -> Option<&'a PaymentRequirements>;
}

/// Picks the first payable entry, in server order.
#[derive(Debug, Clone, Copy, Default)]
pub struct FirstMatch;

impl PaymentSelector for FirstMatch {
    fn select<'a>(&self, candidates: &[&'a PaymentRequirements]) -> Option<&'a PaymentRequirements> {
        candidates.first().copied()
    }
}

/// Prefers entries on one network and falls back to the first payable entry.
#[derive(Debug, Clone)]
pub struct PreferNetwork(pub Network);

impl PaymentSelector for PreferNetwork {
    fn select<'a>(&self, candidates: &[&'a PaymentRequirements]) -> Option<&'a PaymentRequirements> {
        candidates
            .iter()
            .find(|r| r.network == self.0)
            .or_else(|| candidates.first())
            .copied()
    }
}

/// Configuration for x402 client requests.
#[derive(Clone)]
pub struct X402ClientConfig {
    /// Signing capability for the payer
    pub signer: Arc<dyn PaymentSigner>,

    /// HTTP client to use for requests
    pub http_client: Client,

    /// Strategy for choosing among accepted methods
    pub selector: Arc<dyn PaymentSelector>,

    /// Refuse to pay more than this per request, in smallest units
    pub max_amount: Option<TokenAmount>,
}

impl fmt::Debug for X402ClientConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("X402ClientConfig")
            .field("payer", &self.signer.address())
            .field("max_amount", &self.max_amount)
            .finish_non_exhaustive()
    }
}

impl X402ClientConfig {
    /// Creates a new client configuration.
    ///
    /// # Examples
    ///
    /// ```
    /// use std::sync::Arc;
    /// use x402_stacks::client::X402ClientConfig;
    /// use x402_stacks::network::Network;
    /// use x402_stacks::signer::LocalKeySigner;
    ///
    /// let signer = LocalKeySigner::from_hex(
    ///     "ac0974bec39a17e36ba4a6b4d238ff944bacb478cbed5efcae784d7bf4f2ff80",
    ///     "ST2JN8XG1BG9TZE5FQ4GP0CMTHKF9EVRZ5THN11R1",
    ///     Network::stacks_testnet(),
    /// ).unwrap();
    /// let config = X402ClientConfig::new(Arc::new(signer)).with_max_amount(100_000u64);
    /// ```
    pub fn new(signer: Arc<dyn PaymentSigner>) -> Self {
        Self {
            signer,
            http_client: Client::new(),
            selector: Arc::new(FirstMatch),
            max_amount: None,
        }
    }

    /// Sets the payment selector.
    pub fn with_selector(mut self, selector: impl PaymentSelector + 'static) -> Self {
        self.selector = Arc::new(selector);
        self
    }

    /// Prefers payment methods on `network`.
    pub fn with_network(self, network: Network) -> Self {
        self.with_selector(PreferNetwork(network))
    }

    /// Caps the amount paid for a single request.
    pub fn with_max_amount(mut self, amount: impl Into<TokenAmount>) -> Self {
        self.max_amount = Some(amount.into());
        self
    }

    /// Sets a custom HTTP client.
    pub fn with_client(mut self, client: Client) -> Self {
        self.http_client = client;
        self
    }
}

/// A response obtained through [`request_with_payment`].
#[derive(Debug)]
pub struct PaidResponse {
    /// The final HTTP response
    pub response: Response,

    /// Settlement record from `X-PAYMENT-RESPONSE`, when a payment was made
    pub settlement: Option<SettlementResult>,
}

impl PaidResponse {
    /// Whether a confirmed payment was made for this response.
    pub fn paid(&self) -> bool {
        self.settlement
            .as_ref()
            .is_some_and(SettlementResult::is_confirmed)
    }
}

/// Makes an HTTP request with automatic x402 payment handling.
///
/// If the server responds with 402 Payment Required, this function will:
/// 1. Parse the challenge from `X-PAYMENT-REQUIRED` or the body
/// 2. Select a payable requirement and sign a transfer for it
/// 3. Retry the request once with the `X-PAYMENT` header
///
/// A challenge with no accepted methods fails before anything is signed. A gate
/// error on the paid retry is returned as [`X402Error::PaymentRejected`] carrying
/// the gate's error code.
///
/// # Examples
///
/// ```no_run
/// use x402_stacks::client::{request_with_payment, X402ClientConfig};
/// use x402_stacks::network::Network;
/// use x402_stacks::signer::LocalKeySigner;
/// use reqwest::Method;
/// use std::sync::Arc;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let signer = LocalKeySigner::from_hex(
///     "ac0974bec39a17e36ba4a6b4d238ff944bacb478cbed5efcae784d7bf4f2ff80",
///     "ST2JN8XG1BG9TZE5FQ4GP0CMTHKF9EVRZ5THN11R1",
///     Network::stacks_testnet(),
/// )?;
/// let config = X402ClientConfig::new(Arc::new(signer));
///
/// let paid = request_with_payment(
///     &config,
///     Method::GET,
///     "https://api.example.com/weather",
///     None,
/// ).await?;
///
/// println!("Response: {}", paid.response.text().await?);
/// # Ok(())
/// # }
/// ```
pub async fn request_with_payment(
    config: &X402ClientConfig,
    method: Method,
    url: &str,
    body: Option<Value>,
) -> Result<PaidResponse> {
    let mut request = config.http_client.request(method.clone(), url);
    if let Some(body) = &body {
        request = request.json(body);
    }
    let response = request.send().await?;

    if response.status() != StatusCode::PAYMENT_REQUIRED {
        return Ok(PaidResponse {
            response,
            settlement: None,
        });
    }

    let challenge = parse_challenge(response).await?;
    let requirement = select_requirement(&challenge, config)?;
    tracing::info!(
        network = %requirement.network,
        asset = %requirement.asset,
        amount = %requirement.max_amount_required,
        pay_to = %requirement.pay_to,
        "paying for {url}"
    );

    let proof = create_payment_proof(requirement, config.signer.as_ref()).await?;
    let payment_header = encode_payment_header(&proof)?;

    let mut retry_request = config
        .http_client
        .request(method, url)
        .header(PAYMENT_HEADER, payment_header);
    if let Some(body) = body {
        retry_request = retry_request.json(&body);
    }
    let retry_response = retry_request.send().await?;

    let settlement = retry_response
        .headers()
        .get(PAYMENT_RESPONSE_HEADER)
        .and_then(|value| value.to_str().ok())
        .and_then(|encoded| match decode_header::<SettlementResult>(encoded) {
            Ok(settlement) => Some(settlement),
            Err(e) => {
                tracing::warn!(error = %e, "ignoring unreadable X-PAYMENT-RESPONSE");
                None
            }
        });

    if is_gate_rejection(retry_response.status()) {
        return Err(rejection(retry_response).await);
    }

    if let Some(settlement) = &settlement {
        tracing::debug!(transaction = %settlement.transaction, "payment settled");
    }
    Ok(PaidResponse {
        response: retry_response,
        settlement,
    })
}

fn is_gate_rejection(status: StatusCode) -> bool {
    matches!(
        status,
        StatusCode::PAYMENT_REQUIRED | StatusCode::BAD_GATEWAY | StatusCode::GATEWAY_TIMEOUT
    )
}

async fn rejection(response: Response) -> X402Error {
    let status = response.status();
    let text = response.text().await.unwrap_or_default();
    match serde_json::from_str::<PaymentRequiredChallenge>(&text) {
        Ok(challenge) => X402Error::PaymentRejected {
            code: challenge.error.unwrap_or(PaymentErrorCode::PaymentRequired),
            message: challenge
                .message
                .unwrap_or_else(|| format!("server answered {status} to a paid request")),
        },
        Err(_) if status == StatusCode::PAYMENT_REQUIRED => X402Error::PaymentRejected {
            code: PaymentErrorCode::PaymentRequired,
            message: text,
        },
        Err(_) => X402Error::PaymentRejected {
            code: PaymentErrorCode::FacilitatorUnreachable,
            message: format!("HTTP {status}: {text}"),
        },
    }
}

/// Reads the challenge from a 402 response.
///
/// The `X-PAYMENT-REQUIRED` header wins; the JSON body is the fallback. A
/// challenge with an empty `accepts` list is [`X402Error::NoAcceptedMethods`].
pub async fn parse_challenge(response: Response) -> Result<PaymentRequiredChallenge> {
    let from_header = response
        .headers()
        .get(PAYMENT_REQUIRED_HEADER)
        .and_then(|value| value.to_str().ok())
        .and_then(|encoded| decode_header::<PaymentRequiredChallenge>(encoded).ok());

    let challenge = match from_header {
        Some(challenge) => challenge,
        None => {
            let text = response.text().await?;
            serde_json::from_str::<PaymentRequiredChallenge>(&text)
                .map_err(|e| X402Error::MalformedChallenge(e.to_string()))?
        }
    };
    challenge.validate()?;
    Ok(challenge)
}

/// Selects an appropriate payment requirement from the server's offers.
pub fn select_requirement<'a>(
    challenge: &'a PaymentRequiredChallenge,
    config: &X402ClientConfig,
) -> Result<&'a PaymentRequirements> {
    if challenge.accepts.is_empty() {
        return Err(X402Error::NoAcceptedMethods);
    }

    let payable: Vec<&PaymentRequirements> = challenge
        .accepts
        .iter()
        .filter(|r| scheme_for(&r.scheme).is_some())
        .filter(|r| config.signer.supports(&r.network, &r.asset))
        .collect();
    if payable.is_empty() {
        let offered: Vec<String> = challenge
            .accepts
            .iter()
            .map(|r| format!("{}/{}/{}", r.scheme, r.network, r.asset))
            .collect();
        return Err(X402Error::UnsupportedMethod(format!(
            "signer cannot pay any of [{}]",
            offered.join(", ")
        )));
    }

    let affordable: Vec<&PaymentRequirements> = match config.max_amount {
        Some(limit) => payable
            .iter()
            .copied()
            .filter(|r| r.max_amount_required <= limit)
            .collect(),
        None => payable.clone(),
    };
    if let (true, Some(limit)) = (affordable.is_empty(), config.max_amount) {
        let required = payable
            .iter()
            .map(|r| r.max_amount_required.value())
            .min()
            .unwrap_or_default();
        return Err(X402Error::PaymentLimitExceeded {
            required,
            limit: limit.value(),
        });
    }

    config
        .selector
        .select(&affordable)
        .ok_or_else(|| X402Error::UnsupportedMethod("selector declined every method".to_string()))
}

/// Signs a transfer satisfying `requirement` and wraps it in a proof.
pub async fn create_payment_proof(
    requirement: &PaymentRequirements,
    signer: &dyn PaymentSigner,
) -> Result<PaymentProof> {
    let scheme = scheme_for(&requirement.scheme)
        .ok_or_else(|| X402Error::UnsupportedScheme(requirement.scheme.clone()))?;
    let transfer = scheme.build_transfer(requirement, signer.address())?;
    let signed = signer.sign_transfer(&transfer).await?;
    PaymentProof::new(requirement.clone(), &signed)
}

/// A simpler convenience function for GET requests.
///
/// # Examples
///
/// ```no_run
/// use x402_stacks::client::{get, X402ClientConfig};
/// # use x402_stacks::signer::PaymentSigner;
/// # use std::sync::Arc;
///
/// # async fn example(signer: Arc<dyn PaymentSigner>) -> Result<(), Box<dyn std::error::Error>> {
/// let config = X402ClientConfig::new(signer);
/// let paid = get(&config, "https://api.example.com/data").await?;
/// println!("{}", paid.response.text().await?);
/// # Ok(())
/// # }
/// ```
pub async fn get(config: &X402ClientConfig, url: &str) -> Result<PaidResponse> {
    request_with_payment(config, Method::GET, url, None).await
}

/// A simpler convenience function for POST requests.
pub async fn post(config: &X402ClientConfig, url: &str, body: Value) -> Result<PaidResponse> {
    request_with_payment(config, Method::POST, url, Some(body)).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signer::LocalKeySigner;
    use crate::types::{OutputSchema, EXACT_SCHEME, STX_ASSET, X402_VERSION};
    use crate::utils::{decode_payment_header, encode_header};
    use serde_json::json;
    use wiremock::matchers::{header_exists, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const KEY: &str = "ac0974bec39a17e36ba4a6b4d238ff944bacb478cbed5efcae784d7bf4f2ff80";
    const PAYER: &str = "ST2JN8XG1BG9TZE5FQ4GP0CMTHKF9EVRZ5THN11R1";
    const PAYEE: &str = "ST1PQHQKV0RJXZFY1DGX8MNSNYVE3VGZJSRTPGZGM";

    fn requirement(network: Network, amount: u128) -> PaymentRequirements {
        PaymentRequirements {
            scheme: EXACT_SCHEME.to_string(),
            network,
            asset: STX_ASSET.to_string(),
            max_amount_required: TokenAmount(amount),
            resource: "http://localhost/weather".to_string(),
            description: "Weather".to_string(),
            mime_type: "application/json".to_string(),
            pay_to: PAYEE.to_string(),
            max_timeout_seconds: 300,
            output_schema: Some(OutputSchema::http("GET")),
            extra: None,
        }
    }

    fn challenge(accepts: Vec<PaymentRequirements>) -> PaymentRequiredChallenge {
        PaymentRequiredChallenge {
            x402_version: X402_VERSION,
            accepts,
            error: None,
            message: None,
        }
    }

    fn config() -> X402ClientConfig {
        let signer = LocalKeySigner::from_hex(KEY, PAYER, Network::stacks_testnet())
            .unwrap()
            .with_network(Network::stacks_mainnet());
        X402ClientConfig::new(Arc::new(signer))
    }

    #[test]
    fn test_select_first_payable() {
        let foreign: Network = "eip155:8453".parse().unwrap();
        let challenge = challenge(vec![
            requirement(foreign, 1),
            requirement(Network::stacks_testnet(), 10_000),
            requirement(Network::stacks_mainnet(), 10_000),
        ]);
        let selected = select_requirement(&challenge, &config()).unwrap();
        assert_eq!(selected.network, Network::stacks_testnet());
    }

    #[test]
    fn test_prefer_network() {
        let challenge = challenge(vec![
            requirement(Network::stacks_testnet(), 10_000),
            requirement(Network::stacks_mainnet(), 10_000),
        ]);
        let config = config().with_network(Network::stacks_mainnet());
        let selected = select_requirement(&challenge, &config).unwrap();
        assert_eq!(selected.network, Network::stacks_mainnet());
    }

    #[test]
    fn test_empty_and_unpayable_accepts() {
        assert!(matches!(
            select_requirement(&challenge(vec![]), &config()),
            Err(X402Error::NoAcceptedMethods)
        ));

        let foreign: Network = "eip155:8453".parse().unwrap();
        let err = select_requirement(&challenge(vec![requirement(foreign, 1)]), &config())
            .unwrap_err();
        assert_eq!(err.code(), Some(PaymentErrorCode::UnsupportedMethod));
    }

    #[test]
    fn test_spending_limit() {
        let challenge = challenge(vec![
            requirement(Network::stacks_testnet(), 50_000),
            requirement(Network::stacks_mainnet(), 5_000),
        ]);
        let selected = select_requirement(&challenge, &config().with_max_amount(10_000u64)).unwrap();
        assert_eq!(selected.max_amount_required, TokenAmount(5_000));

        let err = select_requirement(&challenge, &config().with_max_amount(1_000u64)).unwrap_err();
        assert!(matches!(
            err,
            X402Error::PaymentLimitExceeded {
                required: 5_000,
                limit: 1_000
            }
        ));
    }

    #[tokio::test]
    async fn test_pays_and_retries_once() {
        let server = MockServer::start().await;
        let settlement = json!({
            "transaction": "0xabc",
            "payer": PAYER,
            "network": "stacks:2147483648",
            "status": "confirmed"
        });
        Mock::given(method("GET"))
            .and(path("/weather"))
            .and(header_exists(PAYMENT_HEADER))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header(PAYMENT_RESPONSE_HEADER, encode_header(&settlement).unwrap())
                    .set_body_json(json!({"temperature": 21})),
            )
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/weather"))
            .respond_with(
                ResponseTemplate::new(402).set_body_json(challenge(vec![requirement(
                    Network::stacks_testnet(),
                    10_000,
                )])),
            )
            .expect(1)
            .mount(&server)
            .await;

        let paid = get(&config(), &format!("{}/weather", server.uri()))
            .await
            .unwrap();
        assert_eq!(paid.response.status(), StatusCode::OK);
        assert!(paid.paid());
        assert_eq!(paid.settlement.unwrap().transaction, "0xabc");

        let requests = server.received_requests().await.unwrap();
        let header = requests[1].headers.get(PAYMENT_HEADER).unwrap();
        let proof = decode_payment_header(header.to_str().unwrap()).unwrap();
        let transfer = proof.signed_transfer().unwrap().transfer;
        assert_eq!(transfer.amount, TokenAmount(10_000));
        assert_eq!(transfer.from, PAYER);
    }

    #[tokio::test]
    async fn test_challenge_header_preferred_over_body() {
        let server = MockServer::start().await;
        let header = encode_header(&challenge(vec![requirement(
            Network::stacks_testnet(),
            7,
        )]))
        .unwrap();
        Mock::given(method("GET"))
            .respond_with(
                ResponseTemplate::new(402)
                    .insert_header(PAYMENT_REQUIRED_HEADER, header)
                    .set_body_string("<html>pay up</html>"),
            )
            .mount(&server)
            .await;

        let response = reqwest::get(server.uri()).await.unwrap();
        let challenge = parse_challenge(response).await.unwrap();
        assert_eq!(challenge.accepts[0].max_amount_required, TokenAmount(7));
    }

    #[tokio::test]
    async fn test_malformed_challenge() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(402).set_body_json(json!({
                "x402Version": 1,
                "accepts": [{"scheme": "exact", "network": "mainnet"}]
            })))
            .mount(&server)
            .await;

        let err = get(&config(), &server.uri()).await.unwrap_err();
        assert!(matches!(err, X402Error::MalformedChallenge(_)));
    }

    #[tokio::test]
    async fn test_gate_error_surfaces_code() {
        let server = MockServer::start().await;
        let rejected = challenge(vec![requirement(Network::stacks_testnet(), 10_000)])
            .with_error(PaymentErrorCode::SettlementFailed, "insufficient balance");
        Mock::given(method("GET"))
            .and(header_exists(PAYMENT_HEADER))
            .respond_with(ResponseTemplate::new(402).set_body_json(rejected))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .respond_with(
                ResponseTemplate::new(402).set_body_json(challenge(vec![requirement(
                    Network::stacks_testnet(),
                    10_000,
                )])),
            )
            .mount(&server)
            .await;

        let err = get(&config(), &server.uri()).await.unwrap_err();
        match err {
            X402Error::PaymentRejected { code, message } => {
                assert_eq!(code, PaymentErrorCode::SettlementFailed);
                assert!(message.contains("insufficient balance"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_free_resource_passes_through() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_string("free"))
            .mount(&server)
            .await;

        let paid = get(&config(), &server.uri()).await.unwrap();
        assert!(!paid.paid());
        assert_eq!(paid.response.text().await.unwrap(), "free");
    }
}
