//! HTTP transport for sending events.

use crate::config::Config;
use crate::Error;
use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use serde_json::Value;
use std::collections::HashMap;
use tracing::debug;

/// Path events and batches are posted to.
pub const EVENTS_PATH: &str = "events";

/// Path of the identity endpoint.
pub const IDENTITY_PATH: &str = "/u";

/// Header carrying the current user id.
pub const USER_HEADER: &str = "x-st-user";

/// Status and body of a collector response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportResponse {
    pub status: u16,
    pub body: String,
}

impl TransportResponse {
    /// The collector only acknowledges with a plain 200.
    pub fn is_ok(&self) -> bool {
        self.status == 200
    }
}

/// Sends payloads to the collector.
///
/// A non-success status is a normal response, not an error. `Err` is reserved
/// for failures where no response was received at all.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn post(
        &self,
        path: &str,
        payload: Value,
        headers: &HashMap<String, String>,
    ) -> Result<TransportResponse, Error>;
}

/// HTTP transport for the collector API.
#[derive(Debug)]
pub struct HttpTransport {
    client: reqwest::Client,
    base_url: String,
}

impl HttpTransport {
    /// Create a new HTTP transport.
    pub fn new(config: &Config) -> Result<Self, Error> {
        let mut default_headers = HeaderMap::new();
        let bearer = HeaderValue::from_str(&format!("Bearer {}", config.search_token()))
            .map_err(|_| Error::Config("search_token is not a valid header value".into()))?;
        default_headers.insert(AUTHORIZATION, bearer);
        default_headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));

        let client = reqwest::Client::builder()
            .timeout(config.timeout())
            .default_headers(default_headers)
            .build()?;

        Ok(Self {
            client,
            base_url: config.api_host().trim_end_matches('/').to_string(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn post(
        &self,
        path: &str,
        payload: Value,
        headers: &HashMap<String, String>,
    ) -> Result<TransportResponse, Error> {
        let url = self.url(path);
        debug!(url = %url, "posting to collector");

        let mut request = self.client.post(&url).json(&payload);
        for (name, value) in headers {
            let name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|_| Error::Config(format!("invalid header name: {name}")))?;
            let value = HeaderValue::from_str(value)
                .map_err(|_| Error::Config(format!("invalid value for header {name}")))?;
            request = request.header(name, value);
        }

        let response = request.send().await?;
        let status = response.status().as_u16();
        let body = response.text().await.unwrap_or_default();

        Ok(TransportResponse { status, body })
    }
}
