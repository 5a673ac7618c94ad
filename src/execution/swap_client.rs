use async_trait::async_trait;
use base64::{
    engine::general_purpose::{STANDARD as BASE64, URL_SAFE as BASE64_URL_SAFE},
    Engine,
};
use hmac::{Hmac, Mac};
use reqwest::{Client, Method, RequestBuilder, StatusCode};
use serde::Deserialize;
use sha2::Sha256;
use std::time::Duration;
use thiserror::Error;

use super::venue::{
    ExecutionVenue, RejectReason, Submission, SubmissionStatus, TradeRequest, VenueError,
};
use crate::models::Fingerprint;

type HmacSha256 = Hmac<Sha256>;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(15);

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("invalid base64 secret: {0}")]
    InvalidSecret(#[from] base64::DecodeError),

    #[error("HMAC computation failed: {0}")]
    HmacError(String),
}

#[derive(Debug, Clone)]
pub struct SwapApiAuth {
    pub api_key: String,
    pub api_secret: String,
}

impl SwapApiAuth {
    pub fn new(api_key: String, api_secret: String) -> Self {
        Self {
            api_key,
            api_secret,
        }
    }

    /// HMAC-SHA256 over `{timestamp}{method}{path}{body}` with the
    /// base64-decoded secret, returned base64 encoded.
    pub fn sign(&self, timestamp: &str, method: &str, path: &str, body: &str) -> Result<String, AuthError> {
        let secret_bytes = BASE64_URL_SAFE
            .decode(&self.api_secret)
            .or_else(|_| BASE64.decode(&self.api_secret))?;

        let message = format!("{timestamp}{method}{path}{body}");

        let mut mac = HmacSha256::new_from_slice(&secret_bytes)
            .map_err(|e| AuthError::HmacError(e.to_string()))?;
        mac.update(message.as_bytes());

        Ok(BASE64.encode(mac.finalize().into_bytes()))
    }
}

#[derive(Debug, Error)]
pub enum SwapClientError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("authentication error: {0}")]
    Auth(#[from] AuthError),

    #[error("HTTP {status}: {body}")]
    Status { status: StatusCode, body: String },
}

impl From<SwapClientError> for VenueError {
    fn from(e: SwapClientError) -> Self {
        match e {
            SwapClientError::Http(err) => VenueError::Transient(err.to_string()),
            // A signing failure will not fix itself on retry.
            SwapClientError::Auth(err) => VenueError::Rejected(RejectReason::Other(err.to_string())),
            SwapClientError::Status { status, body } => classify_status(status, &body),
        }
    }
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    #[serde(default)]
    code: Option<String>,
    #[serde(default)]
    message: Option<String>,
}

/// Map a non-success HTTP answer onto the transient/business split.
pub fn classify_status(status: StatusCode, body: &str) -> VenueError {
    if status.is_server_error()
        || status == StatusCode::TOO_MANY_REQUESTS
        || status == StatusCode::REQUEST_TIMEOUT
    {
        return VenueError::Transient(format!("HTTP {status}"));
    }

    let parsed: Option<ErrorBody> = serde_json::from_str(body).ok();
    let reason = match parsed {
        Some(ErrorBody { code: Some(code), .. }) => RejectReason::from_code(&code),
        Some(ErrorBody {
            message: Some(msg), ..
        }) => RejectReason::Other(msg),
        _ => RejectReason::Other(format!("HTTP {status}")),
    };
    VenueError::Rejected(reason)
}

#[derive(Debug, Deserialize)]
struct SwapResponse {
    tx_ref: String,
    status: String,
    #[serde(default)]
    reason: Option<String>,
}

impl SwapResponse {
    fn into_submission(self) -> Submission {
        Submission {
            status: parse_status(&self.status, self.reason),
            tx_ref: self.tx_ref,
        }
    }
}

fn parse_status(status: &str, reason: Option<String>) -> SubmissionStatus {
    match status.to_lowercase().as_str() {
        "confirmed" | "success" | "finalized" => SubmissionStatus::Confirmed,
        "pending" | "submitted" | "processing" => SubmissionStatus::Pending,
        _ => SubmissionStatus::Failed(reason.unwrap_or_else(|| status.to_string())),
    }
}

/// HMAC-authenticated client for the external swap-execution API.
#[derive(Debug, Clone)]
pub struct SwapApiClient {
    http: Client,
    auth: SwapApiAuth,
    base_url: String,
}

impl SwapApiClient {
    pub fn new(auth: SwapApiAuth, base_url: &str) -> Result<Self, SwapClientError> {
        let http = Client::builder().timeout(REQUEST_TIMEOUT).build()?;
        Ok(Self {
            http,
            auth,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    /// Build a signed request. `path` includes the query string.
    fn signed(&self, method: Method, path: &str, body: Option<String>) -> Result<RequestBuilder, SwapClientError> {
        let timestamp = chrono::Utc::now().timestamp().to_string();
        let body_str = body.as_deref().unwrap_or("");
        let signature = self.auth.sign(&timestamp, method.as_str(), path, body_str)?;

        let url = format!("{}{}", self.base_url, path);
        let mut req = self
            .http
            .request(method, &url)
            .header("X-API-KEY", &self.auth.api_key)
            .header("X-SIGNATURE", signature)
            .header("X-TIMESTAMP", &timestamp);

        if let Some(body) = body {
            req = req.header("Content-Type", "application/json").body(body);
        }
        Ok(req)
    }

    async fn send(&self, req: RequestBuilder) -> Result<Option<SwapResponse>, SwapClientError> {
        let resp = req.send().await?;
        let status = resp.status();
        if status == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(SwapClientError::Status { status, body });
        }
        Ok(Some(resp.json().await?))
    }

    pub async fn post_swap(&self, request: &TradeRequest) -> Result<Submission, SwapClientError> {
        let body = serde_json::json!({
            "client_ref": request.client_ref,
            "chain_id": request.chain_id,
            "instrument": request.instrument,
            "side": request.side,
            "amount": request.amount.to_string(),
            "max_slippage_bps": request.max_slippage_bps,
        })
        .to_string();

        let req = self.signed(Method::POST, "/v1/swaps", Some(body))?;
        match self.send(req).await? {
            Some(resp) => Ok(resp.into_submission()),
            None => Err(SwapClientError::Status {
                status: StatusCode::NOT_FOUND,
                body: String::new(),
            }),
        }
    }

    pub async fn get_swap(&self, tx_ref: &str) -> Result<Option<Submission>, SwapClientError> {
        let path = format!("/v1/swaps/{tx_ref}");
        let req = self.signed(Method::GET, &path, None)?;
        Ok(self.send(req).await?.map(SwapResponse::into_submission))
    }

    pub async fn get_swap_by_client_ref(&self, client_ref: &str) -> Result<Option<Submission>, SwapClientError> {
        let path = format!("/v1/swaps?client_ref={client_ref}");
        let req = self.signed(Method::GET, &path, None)?;
        Ok(self.send(req).await?.map(SwapResponse::into_submission))
    }
}

#[async_trait]
impl ExecutionVenue for SwapApiClient {
    async fn submit(&self, request: &TradeRequest) -> Result<Submission, VenueError> {
        Ok(self.post_swap(request).await?)
    }

    async fn query(&self, tx_ref: &str) -> Result<SubmissionStatus, VenueError> {
        match self.get_swap(tx_ref).await? {
            Some(submission) => Ok(submission.status),
            None => Ok(SubmissionStatus::Failed(format!("unknown tx_ref {tx_ref}"))),
        }
    }

    async fn find_by_client_ref(&self, client_ref: &Fingerprint) -> Result<Option<Submission>, VenueError> {
        Ok(self.get_swap_by_client_ref(client_ref.as_str()).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sign_produces_base64_output() {
        let secret = BASE64.encode(b"test-secret-key-1234");
        let auth = SwapApiAuth::new("key".into(), secret);

        let sig = auth.sign("1700000000", "POST", "/v1/swaps", "{}").unwrap();
        assert!(BASE64.decode(&sig).is_ok());
        assert_eq!(sig.len(), 44);
    }

    #[test]
    fn test_sign_depends_on_body() {
        let auth = SwapApiAuth::new("key".into(), BASE64.encode(b"secret"));
        let a = auth.sign("1", "POST", "/v1/swaps", "{\"a\":1}").unwrap();
        let b = auth.sign("1", "POST", "/v1/swaps", "{\"a\":2}").unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_classify_transient_statuses() {
        for status in [
            StatusCode::INTERNAL_SERVER_ERROR,
            StatusCode::BAD_GATEWAY,
            StatusCode::SERVICE_UNAVAILABLE,
            StatusCode::TOO_MANY_REQUESTS,
        ] {
            assert!(classify_status(status, "").is_transient(), "{status} should be transient");
        }
    }

    #[test]
    fn test_classify_business_rejections() {
        let err = classify_status(StatusCode::UNPROCESSABLE_ENTITY, r#"{"code":"insufficient_balance"}"#);
        assert_eq!(err, VenueError::Rejected(RejectReason::InsufficientBalance));

        let err = classify_status(StatusCode::CONFLICT, r#"{"code":"already_filled"}"#);
        assert_eq!(err, VenueError::Rejected(RejectReason::AlreadyFilled));

        let err = classify_status(StatusCode::BAD_REQUEST, "not json");
        assert!(matches!(err, VenueError::Rejected(RejectReason::Other(_))));
    }

    #[test]
    fn test_parse_status_variants() {
        assert_eq!(parse_status("CONFIRMED", None), SubmissionStatus::Confirmed);
        assert_eq!(parse_status("pending", None), SubmissionStatus::Pending);
        assert_eq!(
            parse_status("failed", Some("slippage".into())),
            SubmissionStatus::Failed("slippage".into())
        );
    }
}
