//! API client with offline queueing and cache fallback.

use chrono::{Duration, Utc};
use color_eyre::{eyre::eyre, Result};
use serde::de::DeserializeOwned;
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::sync::Arc;
use tracing::{debug, info};
use url::Url;

use super::auth::SessionTokens;
use crate::offline::{
  Method, NewAction, OfflineService, OfflineStorage, OutgoingRequest, QueuedAction, TokenProvider,
  Transport,
};

/// What a request produced and where it came from.
#[derive(Debug, Clone, PartialEq)]
pub enum ApiResponse<T> {
  /// Fresh data from the backend
  Network(T),
  /// Offline; served from the cache
  Cached(T),
  /// Offline; the mutation was accepted for later replay
  Queued(QueuedAction),
}

impl<T> ApiResponse<T> {
  pub fn try_map<U, F>(self, f: F) -> Result<ApiResponse<U>>
  where
    F: FnOnce(T) -> Result<U>,
  {
    Ok(match self {
      ApiResponse::Network(data) => ApiResponse::Network(f(data)?),
      ApiResponse::Cached(data) => ApiResponse::Cached(f(data)?),
      ApiResponse::Queued(action) => ApiResponse::Queued(action),
    })
  }
}

/// Decode a JSON value into a typed response.
pub fn decode<T: DeserializeOwned>(value: Value) -> Result<T> {
  serde_json::from_value(value).map_err(|e| eyre!("Failed to parse response: {}", e))
}

/// Cache key for a GET of `url`.
pub fn cache_key(url: &str) -> String {
  let mut hasher = Sha256::new();
  hasher.update(url.as_bytes());
  format!("get:{}", hex::encode(hasher.finalize()))
}

/// Backend client that defers mutations and serves cached reads while offline.
pub struct ApiClient<S, T> {
  base_url: Url,
  transport: Arc<T>,
  offline: Arc<OfflineService<S, T>>,
  tokens: Arc<SessionTokens<S>>,
  cache_ttl: Duration,
}

impl<S: OfflineStorage + 'static, T: Transport + 'static> ApiClient<S, T> {
  pub fn new(
    base_url: &str,
    transport: Arc<T>,
    offline: Arc<OfflineService<S, T>>,
    tokens: Arc<SessionTokens<S>>,
  ) -> Result<Self> {
    // Without a trailing slash Url::join would replace the last segment
    let normalized = format!("{}/", base_url.trim_end_matches('/'));
    let base_url =
      Url::parse(&normalized).map_err(|e| eyre!("Invalid API base URL {}: {}", base_url, e))?;

    Ok(Self {
      base_url,
      transport,
      offline,
      tokens,
      cache_ttl: Duration::minutes(5),
    })
  }

  /// Set how long successful GET responses stay in the cache.
  pub fn with_cache_ttl(mut self, cache_ttl: Duration) -> Self {
    self.cache_ttl = cache_ttl;
    self
  }

  pub fn offline(&self) -> &Arc<OfflineService<S, T>> {
    &self.offline
  }

  /// Resolve a path relative to the base URL. Absolute URLs pass through.
  pub fn resolve(&self, path: &str) -> Result<Url> {
    if path.starts_with("http://") || path.starts_with("https://") {
      return Url::parse(path).map_err(|e| eyre!("Invalid URL {}: {}", path, e));
    }
    self
      .base_url
      .join(path.trim_start_matches('/'))
      .map_err(|e| eyre!("Invalid path {}: {}", path, e))
  }

  /// Issue a request.
  ///
  /// 1. Offline and POST/PUT/DELETE: queue it and return `Queued`
  /// 2. Otherwise send; a non-2xx status is an error
  /// 3. Successful GETs are written through to the cache
  /// 4. A GET that fails while offline falls back to the cache
  pub async fn request(
    &self,
    method: Method,
    path: &str,
    body: Option<Value>,
  ) -> Result<ApiResponse<Value>> {
    let url = self.resolve(path)?.to_string();
    let token = self.tokens.current_token();
    let online = self.offline.is_online();

    if !online && method.is_queueable() {
      let action = self
        .offline
        .queue_offline_action(NewAction::for_request(method, url, body, token))?;
      info!(seq = action.seq, tag = %action.type_tag, "Offline, request queued");
      return Ok(ApiResponse::Queued(action));
    }

    let request = OutgoingRequest {
      method,
      url: url.clone(),
      body,
      bearer: token,
    };

    match self.send(request).await {
      Ok(data) => {
        if method == Method::Get {
          let expires_at = Utc::now() + self.cache_ttl;
          self
            .offline
            .store_offline_data(&cache_key(&url), &data, Some(expires_at));
        }
        Ok(ApiResponse::Network(data))
      }
      Err(e) => {
        if !online && method == Method::Get {
          if let Some(cached) = self.offline.get_offline_data::<Value>(&cache_key(&url)) {
            debug!(url = %url, "Serving cached response");
            return Ok(ApiResponse::Cached(cached));
          }
        }
        Err(e)
      }
    }
  }

  async fn send(&self, request: OutgoingRequest) -> Result<Value> {
    let response = self.transport.send(request).await?;

    if response.status == 401 {
      self.tokens.clear();
    }
    if !response.is_success() {
      return Err(eyre!("HTTP error! status: {}", response.status));
    }

    Ok(response.body.unwrap_or(Value::Null))
  }

  pub async fn get(&self, path: &str) -> Result<ApiResponse<Value>> {
    self.request(Method::Get, path, None).await
  }

  pub async fn post(&self, path: &str, body: Value) -> Result<ApiResponse<Value>> {
    self.request(Method::Post, path, Some(body)).await
  }

  pub async fn put(&self, path: &str, body: Value) -> Result<ApiResponse<Value>> {
    self.request(Method::Put, path, Some(body)).await
  }

  pub async fn delete(&self, path: &str) -> Result<ApiResponse<Value>> {
    self.request(Method::Delete, path, None).await
  }
}
