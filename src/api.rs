//! HTTP transport to the remote store.
//!
//! Implements [`RemoteStore`] over the REST surface: `GET /{kind}` for
//! hydration pulls, `POST /{kind}/sync` for batch-apply, and
//! `POST /sales/{id}/dispatch` for the dispatch operation. Authenticates
//! every request with an API-key header and maps transport and HTTP errors
//! to user-friendly messages.

use reqwest::{Client, StatusCode};
use serde_json::Value;
use std::time::Duration;
use tracing::debug;

use crate::remote::{BatchOp, BatchResponse, DispatchItem, RemoteStore};

/// Default timeout for API requests (30 seconds).
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Timeout used specifically for the lightweight connectivity probe.
const CONNECTIVITY_TIMEOUT: Duration = Duration::from_secs(10);

/// Normalise the remote base URL:
/// - strip trailing slashes
/// - ensure a scheme is present (https, or http for localhost)
pub fn normalize_base_url(url: &str) -> String {
    let mut url = url.trim().to_string();

    if !url.starts_with("http://") && !url.starts_with("https://") {
        if url.starts_with("localhost") || url.starts_with("127.0.0.1") {
            url = format!("http://{url}");
        } else {
            url = format!("https://{url}");
        }
    }

    while url.ends_with('/') {
        url.pop();
    }

    url
}

/// Convert a `reqwest::Error` into a user-friendly message.
fn friendly_error(url: &str, err: &reqwest::Error) -> String {
    if err.is_connect() {
        return format!("Cannot reach remote store at {url}");
    }
    if err.is_timeout() {
        return format!("Connection to {url} timed out");
    }
    if err.is_builder() {
        return format!("Invalid remote store URL: {url}");
    }
    format!("Network error communicating with {url}: {err}")
}

/// Convert an HTTP status code into a user-friendly message.
fn status_error(status: StatusCode) -> String {
    match status.as_u16() {
        401 => "API key is invalid or expired".to_string(),
        403 => "Client not authorized".to_string(),
        404 => "Remote endpoint not found".to_string(),
        s if s >= 500 => format!("Remote store server error (HTTP {s})"),
        s => format!("Unexpected response from remote store (HTTP {s})"),
    }
}

/// Extract the server-provided detail from a non-2xx body, falling back to
/// the generic status message.
fn error_detail(status: StatusCode, body_text: &str) -> String {
    if let Ok(json) = serde_json::from_str::<Value>(body_text) {
        let message = json
            .get("error")
            .or_else(|| json.get("message"))
            .and_then(Value::as_str)
            .map(|s| s.to_string())
            .unwrap_or_else(|| status_error(status));
        return format!("{message} (HTTP {})", status.as_u16());
    }
    if !body_text.trim().is_empty() {
        format!(
            "{} (HTTP {}): {}",
            status_error(status),
            status.as_u16(),
            body_text.trim()
        )
    } else {
        format!("{} (HTTP {})", status_error(status), status.as_u16())
    }
}

/// HTTP implementation of the remote store boundary.
pub struct HttpRemote {
    base_url: String,
    api_key: String,
    client: Client,
}

impl HttpRemote {
    pub fn new(base_url: &str, api_key: &str) -> Result<Self, String> {
        let client = Client::builder()
            .timeout(DEFAULT_TIMEOUT)
            .build()
            .map_err(|e| format!("Failed to create HTTP client: {e}"))?;

        Ok(Self {
            base_url: normalize_base_url(base_url),
            api_key: api_key.trim().to_string(),
            client,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    async fn get_json(&self, path: &str) -> Result<Value, String> {
        let url = format!("{}{path}", self.base_url);
        let resp = self
            .client
            .get(&url)
            .header("X-POS-API-Key", &self.api_key)
            .send()
            .await
            .map_err(|e| friendly_error(&self.base_url, &e))?;

        let status = resp.status();
        let body_text = resp.text().await.unwrap_or_default();
        if !status.is_success() {
            return Err(error_detail(status, &body_text));
        }
        serde_json::from_str(&body_text).map_err(|e| format!("Invalid JSON from remote: {e}"))
    }

    async fn post_json(&self, path: &str, body: &Value) -> Result<Value, String> {
        let url = format!("{}{path}", self.base_url);
        let resp = self
            .client
            .post(&url)
            .header("X-POS-API-Key", &self.api_key)
            .json(body)
            .send()
            .await
            .map_err(|e| friendly_error(&self.base_url, &e))?;

        let status = resp.status();
        let body_text = resp.text().await.unwrap_or_default();
        if !status.is_success() {
            return Err(error_detail(status, &body_text));
        }
        if body_text.is_empty() {
            return Ok(Value::Null);
        }
        serde_json::from_str(&body_text).map_err(|e| format!("Invalid JSON from remote: {e}"))
    }
}

impl RemoteStore for HttpRemote {
    async fn is_online(&self) -> bool {
        let client = match Client::builder().timeout(CONNECTIVITY_TIMEOUT).build() {
            Ok(c) => c,
            Err(_) => return false,
        };
        let url = format!("{}/health", self.base_url);
        match client
            .get(&url)
            .header("X-POS-API-Key", &self.api_key)
            .send()
            .await
        {
            Ok(resp) => resp.status().is_success(),
            Err(_) => false,
        }
    }

    async fn pull(&self, kind: &str) -> Result<Value, String> {
        let resp = self.get_json(&format!("/{kind}")).await?;
        if !resp
            .get("success")
            .and_then(Value::as_bool)
            .unwrap_or(false)
        {
            return Err(format!("pull of '{kind}' reported failure"));
        }
        resp.get("data")
            .cloned()
            .ok_or_else(|| format!("pull of '{kind}' returned no data"))
    }

    async fn push_batch(&self, kind: &str, ops: Vec<BatchOp>) -> Result<BatchResponse, String> {
        let body =
            serde_json::to_value(&ops).map_err(|e| format!("serialize '{kind}' batch: {e}"))?;
        debug!(kind = %kind, ops = ops.len(), "pushing batch");
        let resp = self.post_json(&format!("/{kind}/sync"), &body).await?;
        serde_json::from_value(resp)
            .map_err(|e| format!("invalid batch response for '{kind}': {e}"))
    }

    async fn dispatch(&self, sale_id: &str, items: Vec<DispatchItem>) -> Result<Value, String> {
        let body = serde_json::json!({ "itemsToDispatch": items });
        self.post_json(&format!("/sales/{sale_id}/dispatch"), &body)
            .await
    }
}
