//! Session token storage.

use color_eyre::Result;
use serde_json::Value;
use std::sync::Arc;
use tracing::{info, warn};

use crate::offline::{OfflineStorage, TokenProvider};

const TOKEN_KEY: &str = "session:token";

/// The bearer token used for API calls.
///
/// An explicit token (from the environment) wins over the one persisted by
/// `login`. The persisted token lives in the offline store and never expires.
pub struct SessionTokens<S> {
  storage: Arc<S>,
  explicit: Option<String>,
}

impl<S: OfflineStorage> SessionTokens<S> {
  pub fn new(storage: Arc<S>, explicit: Option<String>) -> Self {
    Self { storage, explicit }
  }

  /// Persist a token for later sessions.
  pub fn set_token(&self, token: &str) -> Result<()> {
    self
      .storage
      .put_entry(TOKEN_KEY, &Value::String(token.to_string()), None)?;
    info!("Stored session token");
    Ok(())
  }

  /// Forget the persisted token.
  pub fn clear(&self) {
    match self.storage.delete_entry(TOKEN_KEY) {
      Ok(()) => info!("Cleared session token"),
      Err(e) => warn!("Failed to clear session token: {}", e),
    }
  }

  fn stored_token(&self) -> Option<String> {
    match self.storage.get_entry(TOKEN_KEY) {
      Ok(Some(entry)) => entry.value.as_str().map(String::from),
      Ok(None) => None,
      Err(e) => {
        warn!("Failed to read session token: {}", e);
        None
      }
    }
  }
}

impl<S: OfflineStorage> TokenProvider for SessionTokens<S> {
  fn current_token(&self) -> Option<String> {
    self.explicit.clone().or_else(|| self.stored_token())
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::offline::{now_ms, SqliteStorage};

  fn storage() -> Arc<SqliteStorage> {
    Arc::new(SqliteStorage::open_in_memory().unwrap())
  }

  #[test]
  fn test_no_token_by_default() {
    let tokens = SessionTokens::new(storage(), None);
    assert_eq!(tokens.current_token(), None);
  }

  #[test]
  fn test_stored_token_round_trip_and_clear() {
    let tokens = SessionTokens::new(storage(), None);
    tokens.set_token("abc").unwrap();
    assert_eq!(tokens.current_token().as_deref(), Some("abc"));

    tokens.clear();
    assert_eq!(tokens.current_token(), None);
  }

  #[test]
  fn test_token_survives_cache_sweep() {
    let storage = storage();
    let tokens = SessionTokens::new(Arc::clone(&storage), None);
    tokens.set_token("abc").unwrap();
    for i in 0..3 {
      storage
        .put_entry(&format!("get:{}", i), &Value::from(i), Some(i64::MAX))
        .unwrap();
    }

    assert_eq!(storage.sweep_entries(now_ms(), 2).unwrap(), 1);

    assert_eq!(tokens.current_token().as_deref(), Some("abc"));
  }

  #[test]
  fn test_explicit_token_wins() {
    let storage = storage();
    let tokens = SessionTokens::new(Arc::clone(&storage), Some("env".into()));
    tokens.set_token("stored").unwrap();
    assert_eq!(tokens.current_token().as_deref(), Some("env"));
  }
}
