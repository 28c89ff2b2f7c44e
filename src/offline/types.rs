//! Core types shared by the offline store, the action queue and the sync engine.

use chrono::{DateTime, TimeZone, Utc};
use color_eyre::{eyre::eyre, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;

/// HTTP methods understood by the network boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Method {
  Get,
  Post,
  Put,
  Patch,
  Delete,
}

impl Method {
  /// Whether a request with this method may be deferred while offline.
  ///
  /// Only POST, PUT and DELETE are ever queued. GET falls through to the
  /// cache instead and PATCH is never deferred.
  pub fn is_queueable(self) -> bool {
    matches!(self, Method::Post | Method::Put | Method::Delete)
  }

  pub fn as_str(self) -> &'static str {
    match self {
      Method::Get => "GET",
      Method::Post => "POST",
      Method::Put => "PUT",
      Method::Patch => "PATCH",
      Method::Delete => "DELETE",
    }
  }
}

impl fmt::Display for Method {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

impl FromStr for Method {
  type Err = color_eyre::Report;

  fn from_str(s: &str) -> Result<Self> {
    match s.trim().to_uppercase().as_str() {
      "GET" => Ok(Method::Get),
      "POST" => Ok(Method::Post),
      "PUT" => Ok(Method::Put),
      "PATCH" => Ok(Method::Patch),
      "DELETE" => Ok(Method::Delete),
      other => Err(eyre!("Unsupported HTTP method: {}", other)),
    }
  }
}

/// A cached value together with its optional absolute expiry.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredEntry {
  pub key: String,
  pub value: Value,
  /// Epoch milliseconds; `None` never expires
  pub expires_at: Option<i64>,
  /// Epoch milliseconds of the last write, used for size-bounded eviction
  pub stored_at: i64,
}

impl StoredEntry {
  /// Expired entries are treated as absent.
  pub fn is_expired(&self, now_ms: i64) -> bool {
    self.expires_at.is_some_and(|at| at < now_ms)
  }
}

/// A mutating request recorded while offline, awaiting replay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueuedAction {
  /// Monotonically increasing sequence number assigned on enqueue
  pub seq: i64,
  /// Free-form tag for logging, conventionally `"{METHOD}_{url}"`
  pub type_tag: String,
  pub url: String,
  pub method: Method,
  pub payload: Option<Value>,
  /// Bearer token captured at enqueue time
  pub auth_token: Option<String>,
  /// Failed replay attempts so far
  pub attempts: u32,
  pub last_error: Option<String>,
  pub queued_at: DateTime<Utc>,
}

/// Fields supplied by a caller when queueing; storage assigns the rest.
#[derive(Debug, Clone, PartialEq)]
pub struct NewAction {
  pub type_tag: String,
  pub url: String,
  pub method: Method,
  pub payload: Option<Value>,
  pub auth_token: Option<String>,
}

impl NewAction {
  /// Build an action tagged with the conventional `"{METHOD}_{url}"` label.
  pub fn for_request(
    method: Method,
    url: impl Into<String>,
    payload: Option<Value>,
    auth_token: Option<String>,
  ) -> Self {
    let url = url.into();
    Self {
      type_tag: format!("{}_{}", method, url),
      url,
      method,
      payload,
      auth_token,
    }
  }
}

/// An action that exhausted its replay attempts.
#[derive(Debug, Clone, PartialEq)]
pub struct DeadLetter {
  pub action: QueuedAction,
  pub dead_at: DateTime<Utc>,
}

/// Snapshot published for UI badges.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncStatus {
  pub online: bool,
  pub syncing: bool,
  pub pending: usize,
  /// Replay stopped on an auth failure; a new login is needed
  pub auth_required: bool,
}

/// Outcome of one drain trigger.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncReport {
  pub replayed: usize,
  pub failed: usize,
  pub dead_lettered: usize,
  pub remaining: usize,
  pub passes: usize,
  pub auth_required: bool,
  /// Trigger ignored because the environment is offline
  pub skipped_offline: bool,
  /// Trigger folded into a drain that was already running
  pub coalesced: bool,
}

impl SyncReport {
  pub fn skipped() -> Self {
    Self {
      skipped_offline: true,
      ..Self::default()
    }
  }

  pub fn coalesced() -> Self {
    Self {
      coalesced: true,
      ..Self::default()
    }
  }
}

pub fn now_ms() -> i64 {
  Utc::now().timestamp_millis()
}

pub fn from_ms(ms: i64) -> Result<DateTime<Utc>> {
  Utc
    .timestamp_millis_opt(ms)
    .single()
    .ok_or_else(|| eyre!("Invalid timestamp: {}", ms))
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_only_mutations_are_queueable() {
    assert!(Method::Post.is_queueable());
    assert!(Method::Put.is_queueable());
    assert!(Method::Delete.is_queueable());
    assert!(!Method::Get.is_queueable());
    assert!(!Method::Patch.is_queueable());
  }

  #[test]
  fn test_method_parse_is_case_insensitive() {
    assert_eq!("delete".parse::<Method>().unwrap(), Method::Delete);
    assert_eq!(" Put ".parse::<Method>().unwrap(), Method::Put);
    assert!("TRACE".parse::<Method>().is_err());
  }

  #[test]
  fn test_for_request_builds_conventional_tag() {
    let action = NewAction::for_request(Method::Post, "/categories", None, None);
    assert_eq!(action.type_tag, "POST_/categories");
  }

  #[test]
  fn test_entry_without_expiry_never_expires() {
    let entry = StoredEntry {
      key: "k".into(),
      value: Value::Null,
      expires_at: None,
      stored_at: 0,
    };
    assert!(!entry.is_expired(i64::MAX));
  }

  #[test]
  fn test_entry_expires_strictly_after_deadline() {
    let entry = StoredEntry {
      key: "k".into(),
      value: Value::Null,
      expires_at: Some(1_000),
      stored_at: 0,
    };
    assert!(!entry.is_expired(1_000));
    assert!(entry.is_expired(1_001));
  }
}
