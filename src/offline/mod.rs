//! Offline resiliency layer.
//!
//! This module provides:
//! - A key-value store with optional absolute expiry and lazy eviction on read
//! - A FIFO queue of mutating requests recorded while offline
//! - A connectivity flag plus an observer that triggers replay on reconnect
//! - A sync engine that drains the queue one action at a time
//!
//! `OfflineService` ties these together and is constructed explicitly by the
//! application, then shared with whatever needs it.

mod connectivity;
pub mod observer;
mod storage;
mod sync;
mod transport;
mod types;

pub use connectivity::{Connectivity, ConnectivityProbe};
pub use storage::{OfflineStorage, SqliteStorage};
pub use sync::{ReplayOutcome, SyncEngine, SyncPolicy, TokenProvider};
pub use transport::{OutgoingRequest, Transport, TransportResponse};
pub use types::{
  now_ms, DeadLetter, Method, NewAction, QueuedAction, StoredEntry, SyncReport, SyncStatus,
};


use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Result};
use serde::{de::DeserializeOwned, Serialize};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Entry point to the offline layer.
pub struct OfflineService<S, T> {
  storage: Arc<S>,
  connectivity: Connectivity,
  engine: Arc<SyncEngine<S, T>>,
}

impl<S: OfflineStorage + 'static, T: Transport + 'static> OfflineService<S, T> {
  pub fn new(
    storage: Arc<S>,
    transport: Arc<T>,
    connectivity: Connectivity,
    policy: SyncPolicy,
    tokens: Option<Arc<dyn TokenProvider>>,
  ) -> Self {
    let mut engine = SyncEngine::new(
      Arc::clone(&storage),
      transport,
      connectivity.clone(),
      policy,
    );
    if let Some(tokens) = tokens {
      engine = engine.with_tokens(tokens);
    }

    Self {
      storage,
      connectivity,
      engine: Arc::new(engine),
    }
  }

  pub fn storage(&self) -> &Arc<S> {
    &self.storage
  }

  pub fn connectivity(&self) -> &Connectivity {
    &self.connectivity
  }

  pub fn is_online(&self) -> bool {
    self.connectivity.is_online()
  }

  pub fn status(&self) -> SyncStatus {
    self.engine.status()
  }

  pub fn subscribe_status(&self) -> watch::Receiver<SyncStatus> {
    self.engine.subscribe_status()
  }

  /// Start the connectivity observer. Abort the handle to stop watching.
  pub fn watch(&self) -> JoinHandle<()> {
    observer::spawn(Arc::clone(&self.engine), &self.connectivity)
  }

  /// Cache `data` under `key`, optionally until `expires_at`.
  ///
  /// Best effort: a failed write is logged and dropped.
  pub fn store_offline_data<V: Serialize>(
    &self,
    key: &str,
    data: &V,
    expires_at: Option<DateTime<Utc>>,
  ) {
    let value = match serde_json::to_value(data) {
      Ok(value) => value,
      Err(e) => {
        warn!("Failed to store offline data {}: {}", key, e);
        return;
      }
    };

    if let Err(e) = self
      .storage
      .put_entry(key, &value, expires_at.map(|at| at.timestamp_millis()))
    {
      warn!("Failed to store offline data {}: {}", key, e);
    }
  }

  /// Read cached data for `key`.
  ///
  /// Missing, expired and unreadable entries all come back as `None`. Expired
  /// entries are deleted by the lookup.
  pub fn get_offline_data<V: DeserializeOwned>(&self, key: &str) -> Option<V> {
    let entry = match self.storage.get_entry(key) {
      Ok(Some(entry)) => entry,
      Ok(None) => return None,
      Err(e) => {
        warn!("Failed to get offline data {}: {}", key, e);
        return None;
      }
    };

    if entry.is_expired(now_ms()) {
      debug!(key, "Evicting expired entry");
      if let Err(e) = self.storage.delete_entry(key) {
        warn!("Failed to evict expired entry {}: {}", key, e);
      }
      return None;
    }

    match serde_json::from_value(entry.value) {
      Ok(data) => Some(data),
      Err(e) => {
        warn!("Failed to get offline data {}: {}", key, e);
        None
      }
    }
  }

  /// Record a mutation for later replay.
  ///
  /// Unlike the cache operations, failures here are returned to the caller.
  pub fn queue_offline_action(&self, action: NewAction) -> Result<QueuedAction> {
    if !action.method.is_queueable() {
      return Err(eyre!(
        "Refusing to queue {} request to {}: only POST, PUT and DELETE can be deferred",
        action.method,
        action.url
      ));
    }

    let queued = self.storage.append_action(&action).map_err(|e| {
      warn!("Failed to queue offline action: {}", e);
      e
    })?;
    debug!(seq = queued.seq, tag = %queued.type_tag, "Queued offline action");

    self.check_pending_actions();
    Ok(queued)
  }

  /// Queued actions in FIFO order.
  pub fn pending_actions(&self) -> Result<Vec<QueuedAction>> {
    self.storage.pending_actions()
  }

  /// Refresh and return the pending-action count.
  pub fn check_pending_actions(&self) -> usize {
    self.engine.refresh_status()
  }

  /// Drain the queue now.
  pub async fn sync_offline_actions(&self) -> SyncReport {
    self.engine.sync().await
  }
}
