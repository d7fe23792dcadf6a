//! Cloud backend API client.
//!
//! Authenticated HTTP communication with the CARSS backend: ledger mirror
//! inserts, profile lookups, connectivity testing, and the privileged admin
//! endpoints (staff invitation, role change, deactivation).

use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use base64::Engine as _;
use reqwest::{Client, Method, StatusCode};
use serde_json::Value;
use std::time::{Duration, Instant};
use tracing::{info, warn};

use crate::error::{CoreError, CoreResult};
use crate::ledger::RemoteLedger;
use crate::models::{Profile, TransactionStatus};
use crate::storage::BackendCredentials;

/// Default timeout for API requests (30 seconds).
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Timeout used specifically for the lightweight connectivity test.
const CONNECTIVITY_TIMEOUT: Duration = Duration::from_secs(10);

/// Timeout for profile/session lookups during auth bootstrap. Shorter than
/// the default so a dead backend fails fast enough for the bounded retry
/// loop in `session`.
pub const PROFILE_TIMEOUT: Duration = Duration::from_secs(8);

// ---------------------------------------------------------------------------
// URL normalisation
// ---------------------------------------------------------------------------

/// Normalise the backend URL:
/// - strip trailing slashes
/// - strip a trailing `/api` segment
/// - ensure a scheme is present (https, or http for localhost)
pub fn normalize_backend_url(url: &str) -> String {
    let mut url = url.trim().to_string();

    // Ensure scheme
    if !url.starts_with("http://") && !url.starts_with("https://") {
        if url.starts_with("localhost") || url.starts_with("127.0.0.1") {
            url = format!("http://{url}");
        } else {
            url = format!("https://{url}");
        }
    }

    // Strip trailing slashes
    while url.ends_with('/') {
        url.pop();
    }

    // Strip trailing /api
    if url.ends_with("/api") {
        url.truncate(url.len() - 4);
    }

    while url.ends_with('/') {
        url.pop();
    }

    url
}

// ---------------------------------------------------------------------------
// Connection-string decoding
// ---------------------------------------------------------------------------

fn decode_connection_string_payload(raw: &str) -> Option<Value> {
    let trimmed = raw.trim();
    if trimmed.starts_with('{') {
        return serde_json::from_str::<Value>(trimmed).ok();
    }

    let compact: String = trimmed.chars().filter(|c| !c.is_whitespace()).collect();
    if compact.starts_with('{') {
        return serde_json::from_str::<Value>(&compact).ok();
    }
    if compact.len() < 20 {
        return None;
    }

    let base64 = compact.replace('-', "+").replace('_', "/");
    let padded = format!(
        "{}{}",
        base64,
        "=".repeat((4usize.wrapping_sub(base64.len() % 4)) % 4)
    );
    let decoded = BASE64_STANDARD.decode(padded).ok()?;
    serde_json::from_slice::<Value>(&decoded).ok()
}

pub fn extract_api_key_from_connection_string(raw: &str) -> Option<String> {
    decode_connection_string_payload(raw)
        .and_then(|v| {
            v.get("key")
                .and_then(Value::as_str)
                .map(|s| s.trim().to_string())
        })
        .filter(|s| !s.is_empty())
}

pub fn extract_backend_url_from_connection_string(raw: &str) -> Option<String> {
    decode_connection_string_payload(raw)
        .and_then(|v| {
            v.get("url")
                .and_then(Value::as_str)
                .map(normalize_backend_url)
        })
        .filter(|s| !s.is_empty())
}

pub fn extract_business_id_from_connection_string(raw: &str) -> Option<String> {
    decode_connection_string_payload(raw)
        .and_then(|v| {
            v.get("bid")
                .or_else(|| v.get("businessId"))
                .and_then(Value::as_str)
                .map(|s| s.trim().to_string())
        })
        .filter(|s| !s.is_empty())
}

// ---------------------------------------------------------------------------
// Error mapping
// ---------------------------------------------------------------------------

/// Convert a `reqwest::Error` into a typed core error.
fn transport_error(url: &str, err: &reqwest::Error) -> CoreError {
    if err.is_connect() {
        return CoreError::Transient(format!("Cannot reach backend at {url}"));
    }
    if err.is_timeout() {
        return CoreError::Transient(format!("Connection to {url} timed out"));
    }
    if err.is_builder() {
        return CoreError::Config(format!("Invalid backend URL: {url}"));
    }
    CoreError::Transient(format!("Network error communicating with {url}: {err}"))
}

/// Convert an HTTP status code into a typed core error.
fn status_error(status: StatusCode, body: &str) -> CoreError {
    let detail = if body.trim().is_empty() {
        format!("HTTP {}", status.as_u16())
    } else {
        format!("HTTP {}: {}", status.as_u16(), body.trim())
    };
    match status.as_u16() {
        401 => CoreError::Unauthorized("API key is invalid or expired".into()),
        403 => CoreError::Unauthorized(format!("Backend refused the request ({detail})")),
        404 => CoreError::Transient(format!("Backend endpoint not found ({detail})")),
        409 => CoreError::AlreadyProcessed(detail),
        s if s >= 500 => CoreError::Transient(format!("Backend server error ({detail})")),
        _ => CoreError::Transient(format!("Unexpected backend response ({detail})")),
    }
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

/// Result of a connectivity test.
#[derive(Debug, serde::Serialize)]
pub struct ConnectivityResult {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latency_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Authenticated client for the CARSS backend.
pub struct BackendApi {
    base_url: String,
    api_key: String,
    business_id: String,
    client: Client,
}

impl BackendApi {
    /// Build a client from stored credentials. Missing credentials are a
    /// configuration error, surfaced once, never retried automatically.
    pub fn from_credentials(creds: &BackendCredentials) -> CoreResult<Self> {
        let api_key = extract_api_key_from_connection_string(&creds.api_key)
            .unwrap_or_else(|| creds.api_key.clone());
        let client = Client::builder()
            .timeout(DEFAULT_TIMEOUT)
            .build()
            .map_err(|e| CoreError::Config(format!("Failed to create HTTP client: {e}")))?;
        Ok(Self {
            base_url: normalize_backend_url(&creds.backend_url),
            api_key,
            business_id: creds.business_id.clone(),
            client,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn business_id(&self) -> &str {
        &self.business_id
    }

    /// Test connectivity to the backend with a lightweight health-check.
    pub async fn test_connectivity(&self) -> ConnectivityResult {
        let health_url = format!("{}/api/health", self.base_url);
        let start = Instant::now();

        let resp = match self
            .client
            .get(&health_url)
            .timeout(CONNECTIVITY_TIMEOUT)
            .header("X-CARSS-API-Key", &self.api_key)
            .send()
            .await
        {
            Ok(r) => r,
            Err(e) => {
                return ConnectivityResult {
                    success: false,
                    latency_ms: None,
                    error: Some(transport_error(&self.base_url, &e).to_string()),
                };
            }
        };

        let latency = start.elapsed().as_millis() as u64;
        if resp.status().is_success() {
            info!(latency_ms = latency, "connectivity test passed");
            ConnectivityResult {
                success: true,
                latency_ms: Some(latency),
                error: None,
            }
        } else {
            ConnectivityResult {
                success: false,
                latency_ms: Some(latency),
                error: Some(status_error(resp.status(), "").to_string()),
            }
        }
    }

    /// Perform an authenticated request against the backend.
    ///
    /// `path` should include the leading slash, e.g. `/api/ledger/transactions`.
    async fn fetch(
        &self,
        method: Method,
        path: &str,
        body: Option<&Value>,
        timeout: Option<Duration>,
    ) -> CoreResult<Value> {
        let full_url = format!("{}{}", self.base_url, path);

        let mut req = self
            .client
            .request(method, &full_url)
            .header("X-CARSS-API-Key", &self.api_key)
            .header("x-business-id", &self.business_id)
            .header("Content-Type", "application/json");

        if let Some(t) = timeout {
            req = req.timeout(t);
        }
        if let Some(b) = body {
            req = req.json(b);
        }

        let resp = req
            .send()
            .await
            .map_err(|e| transport_error(&self.base_url, &e))?;
        let status = resp.status();
        let body_text = resp.text().await.unwrap_or_default();

        if !status.is_success() {
            // Preserve backend validation details for diagnostics.
            let detail = serde_json::from_str::<Value>(&body_text)
                .ok()
                .and_then(|json| {
                    json.get("error")
                        .or_else(|| json.get("message"))
                        .and_then(Value::as_str)
                        .map(|s| s.to_string())
                })
                .unwrap_or(body_text);
            return Err(status_error(status, &detail));
        }

        if body_text.is_empty() {
            return Ok(Value::Null);
        }
        serde_json::from_str(&body_text)
            .map_err(|e| CoreError::Decode(format!("Invalid JSON from backend: {e}")))
    }

    /// Fetch a staff profile, decoded at the boundary.
    pub async fn fetch_profile(&self, user_id: &str) -> CoreResult<Profile> {
        let raw = self
            .fetch(
                Method::GET,
                &format!("/api/profiles/{user_id}"),
                None,
                Some(PROFILE_TIMEOUT),
            )
            .await?;
        serde_json::from_value(raw)
            .map_err(|e| CoreError::Decode(format!("profile decode: {e}")))
    }

    // -----------------------------------------------------------------------
    // Privileged admin endpoints
    // -----------------------------------------------------------------------

    async fn admin_post(&self, path: &str, token: &str, body: Value) -> CoreResult<Value> {
        let full_url = format!("{}{}", self.base_url, path);
        let resp = self
            .client
            .post(&full_url)
            .bearer_auth(token)
            .header("Content-Type", "application/json")
            .json(&body)
            .send()
            .await
            .map_err(|e| transport_error(&self.base_url, &e))?;
        let status = resp.status();
        let body_text = resp.text().await.unwrap_or_default();
        if !status.is_success() {
            warn!(path, status = status.as_u16(), "admin endpoint rejected request");
            return Err(status_error(status, &body_text));
        }
        if body_text.is_empty() {
            return Ok(Value::Null);
        }
        serde_json::from_str(&body_text)
            .map_err(|e| CoreError::Decode(format!("Invalid JSON from backend: {e}")))
    }

    /// Invite a new staff member (backend provisions the account).
    pub async fn invite_staff(&self, token: &str, email: &str, role: &str) -> CoreResult<Value> {
        self.admin_post(
            "/api/admin/staff-invitations",
            token,
            serde_json::json!({ "email": email, "role": role, "business_id": self.business_id }),
        )
        .await
    }

    /// Change an existing staff member's role.
    pub async fn update_user_role(
        &self,
        token: &str,
        user_id: &str,
        role: &str,
    ) -> CoreResult<Value> {
        self.admin_post(
            "/api/admin/update-user-role",
            token,
            serde_json::json!({ "user_id": user_id, "role": role }),
        )
        .await
    }

    /// Deactivate a staff account.
    pub async fn deactivate_user(&self, token: &str, user_id: &str) -> CoreResult<Value> {
        self.admin_post(
            "/api/admin/deactivate-user",
            token,
            serde_json::json!({ "user_id": user_id }),
        )
        .await
    }
}

#[async_trait::async_trait]
impl crate::session::ProfileSource for BackendApi {
    async fn fetch_profile(&self, user_id: &str) -> CoreResult<Profile> {
        BackendApi::fetch_profile(self, user_id).await
    }
}

#[async_trait::async_trait]
impl RemoteLedger for BackendApi {
    async fn insert_transaction(&self, payload: Value) -> CoreResult<Value> {
        self.fetch(
            Method::POST,
            "/api/ledger/transactions",
            Some(&payload),
            None,
        )
        .await
    }

    async fn update_transaction_status(
        &self,
        remote_id: &str,
        status: TransactionStatus,
        actor_id: &str,
        reason: Option<&str>,
    ) -> CoreResult<Value> {
        self.fetch(
            Method::PATCH,
            &format!("/api/ledger/transactions/{remote_id}"),
            Some(&serde_json::json!({
                "status": status.as_str(),
                "actor_id": actor_id,
                "reason": reason,
            })),
            None,
        )
        .await
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_backend_url() {
        assert_eq!(
            normalize_backend_url("admin.carss.app"),
            "https://admin.carss.app"
        );
        assert_eq!(
            normalize_backend_url("https://admin.carss.app/api/"),
            "https://admin.carss.app"
        );
        assert_eq!(
            normalize_backend_url("localhost:3000/"),
            "http://localhost:3000"
        );
        assert_eq!(
            normalize_backend_url("  https://x.example//  "),
            "https://x.example"
        );
    }

    #[test]
    fn test_connection_string_json_form() {
        let raw = r#"{"key":"sk_live_123","url":"admin.carss.app","bid":"biz-9"}"#;
        assert_eq!(
            extract_api_key_from_connection_string(raw).as_deref(),
            Some("sk_live_123")
        );
        assert_eq!(
            extract_backend_url_from_connection_string(raw).as_deref(),
            Some("https://admin.carss.app")
        );
        assert_eq!(
            extract_business_id_from_connection_string(raw).as_deref(),
            Some("biz-9")
        );
    }

    #[test]
    fn test_connection_string_base64_form() {
        let json = r#"{"key":"sk_live_456","url":"https://ops.carss.app","bid":"biz-1"}"#;
        let encoded = BASE64_STANDARD.encode(json);
        assert_eq!(
            extract_api_key_from_connection_string(&encoded).as_deref(),
            Some("sk_live_456")
        );
        assert_eq!(
            extract_business_id_from_connection_string(&encoded).as_deref(),
            Some("biz-1")
        );
    }

    #[test]
    fn test_connection_string_rejects_garbage() {
        assert!(extract_api_key_from_connection_string("not-a-key").is_none());
        assert!(extract_api_key_from_connection_string("").is_none());
    }

    #[test]
    fn test_status_error_classes() {
        assert!(matches!(
            status_error(StatusCode::UNAUTHORIZED, ""),
            CoreError::Unauthorized(_)
        ));
        assert!(matches!(
            status_error(StatusCode::INTERNAL_SERVER_ERROR, "boom"),
            CoreError::Transient(_)
        ));
        assert!(matches!(
            status_error(StatusCode::CONFLICT, "duplicate"),
            CoreError::AlreadyProcessed(_)
        ));
    }
}
