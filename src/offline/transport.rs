//! Network boundary used for live requests and queue replay.

use color_eyre::Result;
use serde_json::Value;
use std::future::Future;

use super::types::Method;

/// A request ready to go on the wire.
#[derive(Debug, Clone, PartialEq)]
pub struct OutgoingRequest {
  pub method: Method,
  /// Absolute URL
  pub url: String,
  pub body: Option<Value>,
  /// Sent as `Authorization: Bearer <token>` when present
  pub bearer: Option<String>,
}

/// Whatever the server answered, successful or not.
#[derive(Debug, Clone, PartialEq)]
pub struct TransportResponse {
  pub status: u16,
  pub body: Option<Value>,
}

impl TransportResponse {
  pub fn is_success(&self) -> bool {
    (200..300).contains(&self.status)
  }

  pub fn is_auth_error(&self) -> bool {
    matches!(self.status, 401 | 403)
  }
}

/// Sends requests to the backend.
///
/// `Err` means no response was received at all (connection refused, timeout,
/// DNS failure). Any HTTP status, including 4xx/5xx, comes back as `Ok`.
pub trait Transport: Send + Sync {
  fn send(&self, request: OutgoingRequest)
    -> impl Future<Output = Result<TransportResponse>> + Send;
}

#[cfg(test)]
pub mod testing {
  //! Scripted in-memory transport for tests.

  use super::*;
  use color_eyre::eyre::eyre;
  use std::collections::{HashMap, VecDeque};
  use std::sync::Mutex;
  use std::time::Duration;

  /// A canned reply for one request.
  #[derive(Debug, Clone)]
  pub enum Reply {
    Status(u16),
    Json(u16, Value),
    /// Simulate a network error
    Fail,
  }

  /// Records every request and answers from a per-URL script.
  ///
  /// URLs with no script left answer `200 {}`.
  #[derive(Default)]
  pub struct ScriptedTransport {
    calls: Mutex<Vec<OutgoingRequest>>,
    script: Mutex<HashMap<String, VecDeque<Reply>>>,
    delay: Option<Duration>,
  }

  impl ScriptedTransport {
    pub fn new() -> Self {
      Self::default()
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
      self.delay = Some(delay);
      self
    }

    pub fn reply(&self, url: &str, reply: Reply) {
      self
        .script
        .lock()
        .unwrap()
        .entry(url.to_string())
        .or_default()
        .push_back(reply);
    }

    pub fn calls(&self) -> Vec<OutgoingRequest> {
      self.calls.lock().unwrap().clone()
    }

    pub fn called_urls(&self) -> Vec<String> {
      self.calls().into_iter().map(|c| c.url).collect()
    }
  }

  impl Transport for ScriptedTransport {
    fn send(
      &self,
      request: OutgoingRequest,
    ) -> impl Future<Output = Result<TransportResponse>> + Send {
      async move {
        if let Some(delay) = self.delay {
          tokio::time::sleep(delay).await;
        }

        let reply = self
          .script
          .lock()
          .unwrap()
          .get_mut(&request.url)
          .and_then(|queue| queue.pop_front());
        let url = request.url.clone();
        self.calls.lock().unwrap().push(request);

        match reply {
          None => Ok(TransportResponse {
            status: 200,
            body: Some(Value::Object(Default::default())),
          }),
          Some(Reply::Status(status)) => Ok(TransportResponse { status, body: None }),
          Some(Reply::Json(status, body)) => Ok(TransportResponse {
            status,
            body: Some(body),
          }),
          Some(Reply::Fail) => Err(eyre!("Connection refused: {}", url)),
        }
      }
    }
  }
}
