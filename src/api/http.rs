//! reqwest-backed transport.

use color_eyre::{eyre::eyre, Result};
use reqwest::header::{HeaderValue, CONTENT_TYPE};
use std::future::Future;
use std::time::Duration;

use crate::offline::{Method, OutgoingRequest, Transport, TransportResponse};

impl From<Method> for reqwest::Method {
  fn from(method: Method) -> Self {
    match method {
      Method::Get => reqwest::Method::GET,
      Method::Post => reqwest::Method::POST,
      Method::Put => reqwest::Method::PUT,
      Method::Patch => reqwest::Method::PATCH,
      Method::Delete => reqwest::Method::DELETE,
    }
  }
}

/// HTTP transport with JSON bodies and bearer auth.
#[derive(Clone)]
pub struct HttpTransport {
  client: reqwest::Client,
}

impl HttpTransport {
  pub fn new(timeout: Duration) -> Result<Self> {
    let client = reqwest::Client::builder()
      .timeout(timeout)
      .build()
      .map_err(|e| eyre!("Failed to create HTTP client: {}", e))?;

    Ok(Self { client })
  }

  /// The underlying client, shared with the connectivity probe.
  pub fn client(&self) -> &reqwest::Client {
    &self.client
  }
}

impl Transport for HttpTransport {
  fn send(&self, request: OutgoingRequest) -> impl Future<Output = Result<TransportResponse>> + Send {
    async move {
      let mut builder = self
        .client
        .request(request.method.into(), request.url.as_str())
        .header(CONTENT_TYPE, HeaderValue::from_static("application/json"));

      if let Some(body) = &request.body {
        builder = builder.json(body);
      }
      if let Some(token) = &request.bearer {
        builder = builder.bearer_auth(token);
      }

      let response = builder
        .send()
        .await
        .map_err(|e| eyre!("{} {} failed: {}", request.method, request.url, e))?;

      let status = response.status().as_u16();
      let bytes = response
        .bytes()
        .await
        .map_err(|e| eyre!("Failed to read response from {}: {}", request.url, e))?;

      // Non-JSON bodies (empty 204s, HTML error pages) are dropped
      let body = if bytes.is_empty() {
        None
      } else {
        serde_json::from_slice(&bytes).ok()
      };

      Ok(TransportResponse { status, body })
    }
  }
}
