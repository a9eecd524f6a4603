//! A [`Facilitator`] that talks to a remote facilitator over HTTP.
//!
//! Transport failures, timeouts on `/verify` and `/supported`, and responses
//! that cannot be understood are all reported as
//! [`X402Error::FacilitatorUnreachable`]. A timeout while waiting on `/settle`
//! is a [`X402Error::SettlementTimeout`], since the transfer may already be on
//! its way.

use crate::errors::{Result, X402Error};
use crate::facilitator::{Facilitator, FacilitatorErrorBody};
use crate::types::{
    SettlementRequest, SettlementResult, SupportedResponse, VerificationRequest,
    VerificationResponse,
};
use async_trait::async_trait;
use reqwest::{Client, RequestBuilder};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::time::Duration;
use url::Url;

/// A client for communicating with a remote x402 facilitator.
#[derive(Clone, Debug)]
pub struct FacilitatorClient {
    base_url: Url,
    verify_url: Url,
    settle_url: Url,
    supported_url: Url,
    client: Client,
    timeout: Option<Duration>,
}

impl FacilitatorClient {
    /// Constructs a client rooted at `base_url`.
    ///
    /// `./verify`, `./settle` and `./supported` are resolved relative to it.
    pub fn try_new(base_url: Url) -> Result<Self> {
        let verify_url = base_url.join("./verify")?;
        let settle_url = base_url.join("./settle")?;
        let supported_url = base_url.join("./supported")?;
        Ok(Self {
            base_url,
            verify_url,
            settle_url,
            supported_url,
            client: Client::new(),
            timeout: None,
        })
    }

    /// Base URL of the facilitator.
    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    /// The configured per-request timeout, if any.
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    /// Sets a per-request timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Uses a preconfigured reqwest client.
    pub fn with_client(mut self, client: Client) -> Self {
        self.client = client;
        self
    }

    fn apply_timeout(&self, builder: RequestBuilder) -> RequestBuilder {
        match self.timeout {
            Some(timeout) => builder.timeout(timeout),
            None => builder,
        }
    }

    async fn post_json<T, R>(&self, url: &Url, context: &'static str, payload: &T) -> Result<R>
    where
        T: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        let request = self.apply_timeout(self.client.post(url.clone()).json(payload));
        self.send(request, context).await
    }

    async fn get_json<R: DeserializeOwned>(&self, url: &Url, context: &'static str) -> Result<R> {
        let request = self.apply_timeout(self.client.get(url.clone()));
        self.send(request, context).await
    }

    async fn send<R: DeserializeOwned>(
        &self,
        request: RequestBuilder,
        context: &'static str,
    ) -> Result<R> {
        let response = request.send().await.map_err(|e| {
            if e.is_timeout() && context == SETTLE {
                X402Error::SettlementTimeout(format!("{context}: {e}"))
            } else {
                X402Error::FacilitatorUnreachable(format!("{context}: {e}"))
            }
        })?;

        let status = response.status();
        if status.is_success() {
            return response.json::<R>().await.map_err(|e| {
                X402Error::FacilitatorUnreachable(format!("{context}: invalid response: {e}"))
            });
        }

        let body = response.text().await.unwrap_or_default();
        tracing::debug!(%status, %body, "{context} failed");
        if let Some(err) = serde_json::from_str::<FacilitatorErrorBody>(&body)
            .ok()
            .and_then(FacilitatorErrorBody::into_error)
        {
            return Err(err);
        }
        Err(X402Error::FacilitatorUnreachable(format!(
            "{context}: unexpected HTTP status {status}: {body}"
        )))
    }
}

const VERIFY: &str = "POST /verify";
const SETTLE: &str = "POST /settle";
const SUPPORTED: &str = "GET /supported";

impl TryFrom<&str> for FacilitatorClient {
    type Error = X402Error;

    fn try_from(value: &str) -> Result<Self> {
        // Keep the base path when resolving ./verify and friends
        let mut url = Url::parse(value)?;
        if !url.path().ends_with('/') {
            let path = format!("{}/", url.path());
            url.set_path(&path);
        }
        Self::try_new(url)
    }
}

#[async_trait]
impl Facilitator for FacilitatorClient {
    async fn verify(&self, request: &VerificationRequest) -> Result<VerificationResponse> {
        self.post_json(&self.verify_url, VERIFY, request).await
    }

    async fn settle(&self, request: &SettlementRequest) -> Result<SettlementResult> {
        self.post_json(&self.settle_url, SETTLE, request).await
    }

    async fn supported(&self) -> Result<SupportedResponse> {
        self.get_json(&self.supported_url, SUPPORTED).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::PaymentErrorCode;
    use crate::network::Network;
    use crate::types::{
        FacilitatorRequest, OutputSchema, PaymentProof, PaymentRequirements, SettlementStatus,
        TokenAmount, EXACT_SCHEME, STX_ASSET, X402_VERSION,
    };
    use serde_json::json;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn request() -> FacilitatorRequest {
        let requirements = PaymentRequirements {
            scheme: EXACT_SCHEME.to_string(),
            network: Network::stacks_testnet(),
            asset: STX_ASSET.to_string(),
            max_amount_required: TokenAmount(10_000),
            resource: "http://localhost/weather".to_string(),
            description: String::new(),
            mime_type: "application/json".to_string(),
            pay_to: "ST1PQHQKV0RJXZFY1DGX8MNSNYVE3VGZJSRTPGZGM".to_string(),
            max_timeout_seconds: 60,
            output_schema: Some(OutputSchema::http("GET")),
            extra: None,
        };
        let proof = PaymentProof {
            x402_version: X402_VERSION,
            resource: requirements.resource.clone(),
            accepted: requirements.clone(),
            payload: json!({}),
        };
        FacilitatorRequest::new(proof, requirements)
    }

    #[test]
    fn test_urls_resolve_relative_to_base() {
        let client = FacilitatorClient::try_from("http://localhost:8080/x402").unwrap();
        assert_eq!(client.verify_url.as_str(), "http://localhost:8080/x402/verify");
        assert_eq!(client.settle_url.as_str(), "http://localhost:8080/x402/settle");
        assert_eq!(
            client.supported_url.as_str(),
            "http://localhost:8080/x402/supported"
        );
        assert!(FacilitatorClient::try_from("not a url").is_err());
    }

    #[tokio::test]
    async fn test_verify_success() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/verify"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "isValid": true,
                "payer": "ST2JN8XG1BG9TZE5FQ4GP0CMTHKF9EVRZ5THN11R1"
            })))
            .mount(&server)
            .await;

        let client = FacilitatorClient::try_from(server.uri().as_str()).unwrap();
        let response = client.verify(&request()).await.unwrap();
        assert!(response.is_valid);
    }

    #[tokio::test]
    async fn test_settle_success() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/settle"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "transaction": "0xabc",
                "payer": "ST2JN8XG1BG9TZE5FQ4GP0CMTHKF9EVRZ5THN11R1",
                "network": "stacks:2147483648",
                "status": "confirmed"
            })))
            .mount(&server)
            .await;

        let client = FacilitatorClient::try_from(server.uri().as_str()).unwrap();
        let result = client.settle(&request()).await.unwrap();
        assert_eq!(result.status, SettlementStatus::Confirmed);
        assert_eq!(result.transaction, "0xabc");
    }

    #[tokio::test]
    async fn test_error_body_is_mapped_back() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/settle"))
            .respond_with(ResponseTemplate::new(400).set_body_json(json!({
                "error": "proof_invalid",
                "message": "nonce already used"
            })))
            .mount(&server)
            .await;

        let client = FacilitatorClient::try_from(server.uri().as_str()).unwrap();
        let err = client.settle(&request()).await.unwrap_err();
        assert_eq!(err.code(), Some(PaymentErrorCode::ProofInvalid));
    }

    #[tokio::test]
    async fn test_server_error_is_unreachable() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/supported"))
            .respond_with(ResponseTemplate::new(500).set_body_string("boom"))
            .mount(&server)
            .await;

        let client = FacilitatorClient::try_from(server.uri().as_str()).unwrap();
        let err = client.supported().await.unwrap_err();
        assert!(matches!(err, X402Error::FacilitatorUnreachable(ref m) if m.contains("500")));
    }

    #[tokio::test]
    async fn test_garbage_response_is_unreachable() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/verify"))
            .respond_with(ResponseTemplate::new(200).set_body_string("not json"))
            .mount(&server)
            .await;

        let client = FacilitatorClient::try_from(server.uri().as_str()).unwrap();
        let err = client.verify(&request()).await.unwrap_err();
        assert!(matches!(err, X402Error::FacilitatorUnreachable(_)));
    }

    #[tokio::test]
    async fn test_settle_timeout() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/settle"))
            .respond_with(
                ResponseTemplate::new(200).set_delay(Duration::from_millis(500)),
            )
            .mount(&server)
            .await;

        let client = FacilitatorClient::try_from(server.uri().as_str())
            .unwrap()
            .with_timeout(Duration::from_millis(50));
        let err = client.settle(&request()).await.unwrap_err();
        assert!(matches!(err, X402Error::SettlementTimeout(_)));
    }

    #[tokio::test]
    async fn test_remote_settlement_timeout_keeps_its_code() {
        let body = FacilitatorErrorBody {
            error: Some(PaymentErrorCode::SettlementTimeout),
            message: "transfer 0xabc still pending".to_string(),
        };
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/settle"))
            .respond_with(ResponseTemplate::new(504).set_body_json(&body))
            .mount(&server)
            .await;

        let client = FacilitatorClient::try_from(server.uri().as_str()).unwrap();
        let err = client.settle(&request()).await.unwrap_err();
        assert_eq!(err.code(), Some(PaymentErrorCode::SettlementTimeout));
        assert!(matches!(err, X402Error::SettlementTimeout(ref m) if m.contains("0xabc")));
    }

    #[tokio::test]
    async fn test_connection_refused_is_unreachable() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let client = FacilitatorClient::try_from(format!("http://{addr}").as_str()).unwrap();
        let err = client.verify(&request()).await.unwrap_err();
        assert_eq!(err.code(), Some(PaymentErrorCode::FacilitatorUnreachable));
    }
}
