//! Resource discovery registry.
//!
//! A resource is listed only after the registry has fetched its URL, received a
//! 402 challenge, and checked that every accepted entry is payable and
//! self-describing: non-empty `accepts`, a namespaced `network` and an
//! `outputSchema` on every entry.

use crate::network::Network;
use crate::types::{PaymentRequirements, PAYMENT_REQUIRED_HEADER};
use crate::utils::decode_header;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::RwLock;
use url::Url;

const MAX_NAME_LEN: usize = 64;

/// Why a candidate resource was refused.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ValidationErrorCode {
    /// URL missing, unparsable or not http(s)
    InvalidUrl,
    /// Name empty, too long or containing control characters
    InvalidName,
    /// Challenge has no accepted payment methods
    EmptyAccepts,
    /// An entry's network is not a namespaced identifier
    InvalidNetwork,
    /// An entry has no `outputSchema`
    MissingOutputSchema,
    /// The URL could not be fetched
    Unreachable,
    /// The response was not a parsable 402 challenge
    MalformedChallenge,
}

/// A categorized registration failure.
#[derive(Serialize, Deserialize, Debug, Clone, Error, PartialEq, Eq)]
#[error("{message}")]
pub struct ValidationError {
    /// Failure category
    pub code: ValidationErrorCode,
    /// Detail for humans
    pub message: String,
}

impl ValidationError {
    fn new(code: ValidationErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

/// A registration request.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct RegistrationRequest {
    /// Display name
    pub name: String,
    /// URL of the payment-gated resource
    pub url: String,
}

/// A validated, listed resource.
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct ResourceListing {
    /// Display name
    pub name: String,
    /// Normalized resource URL
    pub url: String,
    /// Accepted payment methods as advertised at validation time
    pub accepts: Vec<PaymentRequirements>,
    /// When the resource was (re)validated
    pub listed_at: DateTime<Utc>,
}

/// Checks a display name.
pub fn validate_name(name: &str) -> Result<(), ValidationError> {
    let trimmed = name.trim();
    if trimmed.is_empty() {
        return Err(ValidationError::new(
            ValidationErrorCode::InvalidName,
            "name must not be empty",
        ));
    }
    if trimmed.chars().count() > MAX_NAME_LEN {
        return Err(ValidationError::new(
            ValidationErrorCode::InvalidName,
            format!("name is longer than {MAX_NAME_LEN} characters"),
        ));
    }
    if trimmed.chars().any(char::is_control) {
        return Err(ValidationError::new(
            ValidationErrorCode::InvalidName,
            "name contains control characters",
        ));
    }
    Ok(())
}

/// Parses and checks a candidate resource URL.
pub fn validate_url(url: &str) -> Result<Url, ValidationError> {
    let parsed = Url::parse(url.trim()).map_err(|e| {
        ValidationError::new(ValidationErrorCode::InvalidUrl, format!("'{url}': {e}"))
    })?;
    if !matches!(parsed.scheme(), "http" | "https") {
        return Err(ValidationError::new(
            ValidationErrorCode::InvalidUrl,
            format!("unsupported scheme '{}'", parsed.scheme()),
        ));
    }
    if parsed.host_str().map_or(true, str::is_empty) {
        return Err(ValidationError::new(
            ValidationErrorCode::InvalidUrl,
            "URL has no host",
        ));
    }
    Ok(parsed)
}

/// Validates a raw challenge document.
///
/// Works on untyped JSON so each defect is reported under its own category
/// rather than as a generic parse failure.
///
/// ```
/// use serde_json::json;
/// use x402_stacks::registry::{validate_challenge, ValidationErrorCode};
///
/// let err = validate_challenge(&json!({"x402Version": 1, "accepts": []})).unwrap_err();
/// assert_eq!(err.code, ValidationErrorCode::EmptyAccepts);
/// ```
pub fn validate_challenge(challenge: &Value) -> Result<Vec<PaymentRequirements>, ValidationError> {
    let accepts = match challenge.get("accepts") {
        Some(Value::Array(accepts)) if !accepts.is_empty() => accepts,
        Some(Value::Array(_)) | None | Some(Value::Null) => {
            return Err(ValidationError::new(
                ValidationErrorCode::EmptyAccepts,
                "challenge lists no accepted payment methods",
            ))
        }
        Some(_) => {
            return Err(ValidationError::new(
                ValidationErrorCode::MalformedChallenge,
                "accepts is not a list",
            ))
        }
    };

    accepts
        .iter()
        .enumerate()
        .map(|(i, entry)| {
            let network = entry.get("network").and_then(Value::as_str).unwrap_or("");
            network.parse::<Network>().map_err(|_| {
                ValidationError::new(
                    ValidationErrorCode::InvalidNetwork,
                    format!("accepts[{i}].network '{network}' is not a namespaced identifier"),
                )
            })?;

            if entry.get("outputSchema").map_or(true, Value::is_null) {
                return Err(ValidationError::new(
                    ValidationErrorCode::MissingOutputSchema,
                    format!("accepts[{i}] has no outputSchema"),
                ));
            }

            serde_json::from_value::<PaymentRequirements>(entry.clone()).map_err(|e| {
                ValidationError::new(
                    ValidationErrorCode::MalformedChallenge,
                    format!("accepts[{i}]: {e}"),
                )
            })
        })
        .collect()
}

/// In-memory directory of validated payment-gated resources.
#[derive(Debug)]
pub struct ResourceRegistry {
    http: Client,
    timeout: Duration,
    listings: RwLock<BTreeMap<String, ResourceListing>>,
}

impl Default for ResourceRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ResourceRegistry {
    /// Default bound on fetching a candidate URL.
    pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

    /// Creates an empty registry.
    pub fn new() -> Self {
        Self {
            http: Client::new(),
            timeout: Self::DEFAULT_TIMEOUT,
            listings: RwLock::new(BTreeMap::new()),
        }
    }

    /// Uses a preconfigured reqwest client.
    pub fn with_client(mut self, client: Client) -> Self {
        self.http = client;
        self
    }

    /// Bounds the fetch of a candidate URL.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Validates and lists a resource; re-registering refreshes the listing.
    ///
    /// A resource that fails validation is removed if it was listed before.
    pub async fn register(
        &self,
        request: RegistrationRequest,
    ) -> Result<ResourceListing, ValidationError> {
        validate_name(&request.name)?;
        let url = validate_url(&request.url)?;

        let accepts = match self.fetch_challenge(&url).await.and_then(|c| validate_challenge(&c)) {
            Ok(accepts) => accepts,
            Err(e) => {
                tracing::info!(%url, code = ?e.code, "registration refused: {}", e.message);
                self.listings.write().await.remove(url.as_str());
                return Err(e);
            }
        };

        let listing = ResourceListing {
            name: request.name.trim().to_string(),
            url: url.to_string(),
            accepts,
            listed_at: Utc::now(),
        };
        tracing::info!(url = %listing.url, name = %listing.name, "resource listed");
        self.listings
            .write()
            .await
            .insert(listing.url.clone(), listing.clone());
        Ok(listing)
    }

    /// All listed resources, ordered by URL.
    pub async fn listings(&self) -> Vec<ResourceListing> {
        self.listings.read().await.values().cloned().collect()
    }

    /// Looks up one listing by URL.
    pub async fn get(&self, url: &str) -> Option<ResourceListing> {
        let key = validate_url(url).ok()?;
        self.listings.read().await.get(key.as_str()).cloned()
    }

    async fn fetch_challenge(&self, url: &Url) -> Result<Value, ValidationError> {
        let response = self
            .http
            .get(url.clone())
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|e| ValidationError::new(ValidationErrorCode::Unreachable, e.to_string()))?;

        let status = response.status();
        if status != reqwest::StatusCode::PAYMENT_REQUIRED {
            return Err(ValidationError::new(
                ValidationErrorCode::MalformedChallenge,
                format!("expected HTTP 402, got {status}"),
            ));
        }

        let from_header = response
            .headers()
            .get(PAYMENT_REQUIRED_HEADER)
            .and_then(|v| v.to_str().ok())
            .and_then(|encoded| decode_header::<Value>(encoded).ok());
        if let Some(challenge) = from_header {
            return Ok(challenge);
        }

        let text = response
            .text()
            .await
            .map_err(|e| ValidationError::new(ValidationErrorCode::Unreachable, e.to_string()))?;
        serde_json::from_str(&text).map_err(|e| {
            ValidationError::new(
                ValidationErrorCode::MalformedChallenge,
                format!("402 body is not JSON: {e}"),
            )
        })
    }
}

impl IntoResponse for ValidationError {
    fn into_response(self) -> Response {
        let status = match self.code {
            ValidationErrorCode::Unreachable => StatusCode::BAD_GATEWAY,
            _ => StatusCode::UNPROCESSABLE_ENTITY,
        };
        (status, Json(self)).into_response()
    }
}

/// Builds the registry HTTP router: `POST /resources` and `GET /resources`.
pub fn routes(registry: Arc<ResourceRegistry>) -> Router {
    Router::new()
        .route("/resources", get(list_resources).post(register_resource))
        .with_state(registry)
}

async fn register_resource(
    State(registry): State<Arc<ResourceRegistry>>,
    Json(request): Json<RegistrationRequest>,
) -> Result<(StatusCode, Json<ResourceListing>), ValidationError> {
    let listing = registry.register(request).await?;
    Ok((StatusCode::CREATED, Json(listing)))
}

async fn list_resources(
    State(registry): State<Arc<ResourceRegistry>>,
) -> Json<Vec<ResourceListing>> {
    Json(registry.listings().await)
}
