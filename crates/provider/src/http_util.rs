//! Shared HTTP utilities for generation operations.
//!
//! Centralizes send → status-check → JSON decode so every operation hands the
//! orchestrator the same raw error shapes.

use rendergate_types::{ApiKey, GenError, traits::Result};
use rquest::{Client, RequestBuilder};
use serde_json::Value;

/// Header carrying the API key on Generative Language requests.
pub const API_KEY_HEADER: &str = "x-goog-api-key";

/// Shared HTTP helper bound to one API base URL.
#[derive(Clone)]
pub struct ProviderHttp {
    http: Client,
    base_url: String,
}

impl ProviderHttp {
    /// Creates a new helper wrapping the given HTTP client.
    #[must_use]
    pub fn new(http: Client, base_url: impl Into<String>) -> Self {
        Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    /// Joins `path` onto the base URL.
    #[must_use]
    pub fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    /// Sends a request and checks for success status.
    ///
    /// On non-2xx responses, reads the body text and returns
    /// [`GenError::Upstream`].
    ///
    /// # Errors
    ///
    /// Returns `GenError::Upstream` on non-success HTTP status codes,
    /// or a transport error if the request fails to send.
    pub async fn send(&self, builder: RequestBuilder) -> Result<rquest::Response> {
        let resp = builder.send().await?;
        let status = resp.status();
        if status.is_success() {
            Ok(resp)
        } else {
            let text = resp.text().await.unwrap_or_default();
            Err(GenError::Upstream {
                status: status.as_u16(),
                body: text,
            })
        }
    }

    /// POSTs a JSON body authenticated with `key` and decodes the JSON reply.
    ///
    /// # Errors
    ///
    /// Returns `GenError::Upstream` on non-success status, or a
    /// transport/parse error.
    pub async fn post_json(&self, path: &str, key: &ApiKey, body: &Value) -> Result<Value> {
        let builder = self
            .http
            .post(self.url(path))
            .header(API_KEY_HEADER, key.expose())
            .header("content-type", "application/json")
            .json(body);
        let resp = self.send(builder).await?;
        Ok(resp.json().await?)
    }

    /// GETs `path` authenticated with `key` and decodes the JSON reply.
    ///
    /// # Errors
    ///
    /// Returns `GenError::Upstream` on non-success status, or a
    /// transport/parse error.
    pub async fn get_json(&self, path: &str, key: &ApiKey) -> Result<Value> {
        let builder = self
            .http
            .get(self.url(path))
            .header(API_KEY_HEADER, key.expose());
        let resp = self.send(builder).await?;
        Ok(resp.json().await?)
    }
}
