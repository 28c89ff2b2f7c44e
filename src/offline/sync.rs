//! Replays queued actions once connectivity returns.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{watch, Mutex, MutexGuard};
use tracing::{debug, info, warn};

use super::connectivity::Connectivity;
use super::storage::OfflineStorage;
use super::transport::{OutgoingRequest, Transport};
use super::types::{now_ms, QueuedAction, SyncReport, SyncStatus};

/// Supplies the bearer token currently in use, which may differ from the one
/// captured when an action was queued.
pub trait TokenProvider: Send + Sync {
  fn current_token(&self) -> Option<String>;
}

/// Knobs for a drain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncPolicy {
  /// Failed attempts after which an action is dead-lettered; `None` retries forever
  pub max_attempts: Option<u32>,
  /// Upper bound on cached entries kept by the sweep run at each trigger
  pub max_entries: usize,
}

impl Default for SyncPolicy {
  fn default() -> Self {
    Self {
      max_attempts: None,
      max_entries: 1000,
    }
  }
}

/// Result of replaying a single action.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplayOutcome {
  /// 2xx; the action can be dequeued
  Replayed,
  /// Network error or non-auth HTTP error; stays queued
  Failed(String),
  /// 401/403 even with the current token
  Unauthorized(String),
}

/// Drains the action queue against the live network.
///
/// At most one drain runs at a time. A trigger that arrives mid-drain is
/// folded into the running drain, which does one more pass before finishing.
pub struct SyncEngine<S, T> {
  storage: Arc<S>,
  transport: Arc<T>,
  connectivity: Connectivity,
  tokens: Option<Arc<dyn TokenProvider>>,
  policy: SyncPolicy,
  drain_lock: Mutex<()>,
  rerun: AtomicBool,
  status: watch::Sender<SyncStatus>,
}

impl<S: OfflineStorage, T: Transport> SyncEngine<S, T> {
  pub fn new(
    storage: Arc<S>,
    transport: Arc<T>,
    connectivity: Connectivity,
    policy: SyncPolicy,
  ) -> Self {
    let (status, _rx) = watch::channel(SyncStatus {
      online: connectivity.is_online(),
      ..SyncStatus::default()
    });

    Self {
      storage,
      transport,
      connectivity,
      tokens: None,
      policy,
      drain_lock: Mutex::new(()),
      rerun: AtomicBool::new(false),
      status,
    }
  }

  pub fn with_tokens(mut self, tokens: Arc<dyn TokenProvider>) -> Self {
    self.tokens = Some(tokens);
    self
  }

  pub fn status(&self) -> SyncStatus {
    *self.status.borrow()
  }

  pub fn subscribe_status(&self) -> watch::Receiver<SyncStatus> {
    self.status.subscribe()
  }

  /// Re-read the online flag and pending count into the published status.
  pub fn refresh_status(&self) -> usize {
    let pending = match self.storage.pending_count() {
      Ok(count) => count,
      Err(e) => {
        warn!("Failed to check pending actions: {}", e);
        self.status().pending
      }
    };
    let online = self.connectivity.is_online();
    self.status.send_modify(|s| {
      s.online = online;
      s.pending = pending;
    });
    pending
  }

  /// Run one drain trigger.
  pub async fn sync(&self) -> SyncReport {
    if !self.connectivity.is_online() {
      debug!("Offline, skipping sync");
      return SyncReport::skipped();
    }

    let Some(mut guard) = self.acquire_drain() else {
      debug!("Drain already running, folding trigger into it");
      return SyncReport::coalesced();
    };

    self.status.send_modify(|s| {
      s.syncing = true;
      s.auth_required = false;
    });
    self.sweep_store();

    let mut report = SyncReport::default();
    loop {
      self.rerun.store(false, Ordering::SeqCst);
      self.drain_pass(&mut report).await;
      report.passes += 1;

      if report.auth_required || !self.connectivity.is_online() {
        break;
      }
      if self.rerun.load(Ordering::SeqCst) {
        continue;
      }

      // A trigger that lost the race for the lock re-checks it after setting
      // the flag, so release first and look again.
      drop(guard);
      if !self.rerun.load(Ordering::SeqCst) {
        break;
      }
      match self.drain_lock.try_lock() {
        Ok(next) => guard = next,
        Err(_) => break,
      }
    }

    report.remaining = self.refresh_status();
    let auth_required = report.auth_required;
    self.status.send_modify(|s| {
      s.syncing = false;
      s.auth_required = auth_required;
    });

    info!(
      replayed = report.replayed,
      failed = report.failed,
      dead_lettered = report.dead_lettered,
      remaining = report.remaining,
      "Sync finished"
    );
    report
  }

  fn acquire_drain(&self) -> Option<MutexGuard<'_, ()>> {
    if let Ok(guard) = self.drain_lock.try_lock() {
      return Some(guard);
    }
    self.rerun.store(true, Ordering::SeqCst);
    self.drain_lock.try_lock().ok()
  }

  fn sweep_store(&self) {
    match self
      .storage
      .sweep_entries(now_ms(), self.policy.max_entries)
    {
      Ok(0) => {}
      Ok(removed) => debug!(removed, "Swept offline store"),
      Err(e) => warn!("Failed to sweep offline store: {}", e),
    }
  }

  async fn drain_pass(&self, report: &mut SyncReport) {
    let actions = match self.storage.pending_actions() {
      Ok(actions) => actions,
      Err(e) => {
        warn!("Failed to read pending actions: {}", e);
        return;
      }
    };

    for action in actions {
      match self.replay(&action).await {
        ReplayOutcome::Replayed => {
          debug!(seq = action.seq, tag = %action.type_tag, "Replayed action");
          if let Err(e) = self.storage.remove_action(action.seq) {
            warn!("Failed to dequeue replayed action {}: {}", action.seq, e);
          }
          report.replayed += 1;
        }
        ReplayOutcome::Failed(reason) => {
          warn!(seq = action.seq, tag = %action.type_tag, "Replay failed: {}", reason);
          self.handle_failure(&action, &reason, report);
        }
        ReplayOutcome::Unauthorized(reason) => {
          // Auth rejections leave the attempt count untouched
          warn!(seq = action.seq, tag = %action.type_tag, "Replay rejected, login required: {}", reason);
          report.failed += 1;
          report.auth_required = true;
          break;
        }
      }
    }
  }

  fn handle_failure(&self, action: &QueuedAction, reason: &str, report: &mut SyncReport) {
    let attempts = match self.storage.record_failure(action.seq, reason) {
      Ok(attempts) => attempts,
      Err(e) => {
        warn!("Failed to record failure for action {}: {}", action.seq, e);
        report.failed += 1;
        return;
      }
    };

    match self.policy.max_attempts {
      Some(max) if attempts >= max => match self.storage.dead_letter(action.seq) {
        Ok(()) => {
          warn!(seq = action.seq, attempts, "Action dead-lettered");
          report.dead_lettered += 1;
        }
        Err(e) => {
          warn!("Failed to dead-letter action {}: {}", action.seq, e);
          report.failed += 1;
        }
      },
      _ => report.failed += 1,
    }
  }

  /// Replay one action, retrying once with the current token on an auth error.
  pub async fn replay(&self, action: &QueuedAction) -> ReplayOutcome {
    let reason = match self.send(action, action.auth_token.clone()).await {
      ReplayOutcome::Unauthorized(reason) => reason,
      outcome => return outcome,
    };

    let current = self.tokens.as_ref().and_then(|t| t.current_token());
    if current.is_none() || current == action.auth_token {
      return ReplayOutcome::Unauthorized(reason);
    }

    debug!(seq = action.seq, "Retrying with current token");
    if let Err(e) = self
      .storage
      .update_action_token(action.seq, current.as_deref())
    {
      warn!("Failed to update token for action {}: {}", action.seq, e);
    }
    self.send(action, current).await
  }

  async fn send(&self, action: &QueuedAction, bearer: Option<String>) -> ReplayOutcome {
    let request = OutgoingRequest {
      method: action.method,
      url: action.url.clone(),
      body: action.payload.clone(),
      bearer,
    };

    match self.transport.send(request).await {
      Ok(response) if response.is_success() => ReplayOutcome::Replayed,
      Ok(response) if response.is_auth_error() => {
        ReplayOutcome::Unauthorized(format!("HTTP error! status: {}", response.status))
      }
      Ok(response) => ReplayOutcome::Failed(format!("HTTP error! status: {}", response.status)),
      Err(e) => ReplayOutcome::Failed(e.to_string()),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::offline::storage::SqliteStorage;
  use crate::offline::transport::testing::{Reply, ScriptedTransport};
  use crate::offline::types::{Method, NewAction};
  use serde_json::json;
  use std::time::Duration;

  struct FixedToken(&'static str);

  impl TokenProvider for FixedToken {
    fn current_token(&self) -> Option<String> {
      Some(self.0.to_string())
    }
  }

  fn engine(
    transport: ScriptedTransport,
    policy: SyncPolicy,
  ) -> SyncEngine<SqliteStorage, ScriptedTransport> {
    SyncEngine::new(
      Arc::new(SqliteStorage::open_in_memory().unwrap()),
      Arc::new(transport),
      Connectivity::new(true),
      policy,
    )
  }

  fn queue(engine: &SyncEngine<SqliteStorage, ScriptedTransport>, url: &str) -> QueuedAction {
    engine
      .storage
      .append_action(&NewAction::for_request(
        Method::Post,
        url,
        Some(json!({ "url": url })),
        Some("old".into()),
      ))
      .unwrap()
  }

  fn queued_urls(engine: &SyncEngine<SqliteStorage, ScriptedTransport>) -> Vec<String> {
    engine
      .storage
      .pending_actions()
      .unwrap()
      .into_iter()
      .map(|a| a.url)
      .collect()
  }

  #[tokio::test]
  async fn test_replays_in_fifo_order() {
    let engine = engine(ScriptedTransport::new(), SyncPolicy::default());
    for url in ["http://api/a1", "http://api/a2", "http://api/a3"] {
      queue(&engine, url);
    }

    let report = engine.sync().await;

    assert_eq!(
      engine.transport.called_urls(),
      vec!["http://api/a1", "http://api/a2", "http://api/a3"]
    );
    assert_eq!(report.replayed, 3);
    assert_eq!(report.remaining, 0);
    assert!(queued_urls(&engine).is_empty());
  }

  #[tokio::test]
  async fn test_partial_failure_keeps_only_failed_action() {
    let transport = ScriptedTransport::new();
    transport.reply("http://api/a2", Reply::Fail);
    let engine = engine(transport, SyncPolicy::default());
    for url in ["http://api/a1", "http://api/a2", "http://api/a3"] {
      queue(&engine, url);
    }

    let report = engine.sync().await;

    assert_eq!(engine.transport.calls().len(), 3);
    assert_eq!(queued_urls(&engine), vec!["http://api/a2"]);
    assert_eq!(report.replayed, 2);
    assert_eq!(report.failed, 1);
    assert_eq!(report.remaining, 1);
  }

  #[tokio::test]
  async fn test_http_error_leaves_action_queued_with_attempt_count() {
    let transport = ScriptedTransport::new();
    transport.reply("http://api/a", Reply::Status(500));
    let engine = engine(transport, SyncPolicy::default());
    queue(&engine, "http://api/a");

    engine.sync().await;

    let pending = engine.storage.pending_actions().unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].attempts, 1);
    assert_eq!(pending[0].last_error.as_deref(), Some("HTTP error! status: 500"));
  }

  #[tokio::test]
  async fn test_offline_sync_is_a_noop() {
    let engine = engine(ScriptedTransport::new(), SyncPolicy::default());
    queue(&engine, "http://api/a");
    engine.connectivity.set_online(false);

    let report = engine.sync().await;

    assert!(report.skipped_offline);
    assert!(engine.transport.calls().is_empty());
    assert_eq!(queued_urls(&engine).len(), 1);
  }

  #[tokio::test]
  async fn test_sends_payload_and_captured_token() {
    let engine = engine(ScriptedTransport::new(), SyncPolicy::default());
    queue(&engine, "http://api/a");

    engine.sync().await;

    let call = &engine.transport.calls()[0];
    assert_eq!(call.method, Method::Post);
    assert_eq!(call.body, Some(json!({ "url": "http://api/a" })));
    assert_eq!(call.bearer.as_deref(), Some("old"));
  }

  #[tokio::test]
  async fn test_overlapping_triggers_never_send_twice() {
    let engine = engine(
      ScriptedTransport::new().with_delay(Duration::from_millis(50)),
      SyncPolicy::default(),
    );
    queue(&engine, "http://api/a");

    let (first, second) = tokio::join!(engine.sync(), engine.sync());

    assert_eq!(engine.transport.calls().len(), 1);
    assert!(second.coalesced);
    assert_eq!(first.replayed, 1);
    assert_eq!(first.passes, 2);
    assert!(queued_urls(&engine).is_empty());
  }

  #[tokio::test]
  async fn test_action_queued_during_drain_is_replayed_by_rerun() {
    let engine = engine(
      ScriptedTransport::new().with_delay(Duration::from_millis(50)),
      SyncPolicy::default(),
    );
    queue(&engine, "http://api/a");

    let (first, second) = tokio::join!(engine.sync(), async {
      tokio::time::sleep(Duration::from_millis(10)).await;
      queue(&engine, "http://api/b");
      engine.sync().await
    });

    assert!(second.coalesced);
    assert_eq!(
      engine.transport.called_urls(),
      vec!["http://api/a", "http://api/b"]
    );
    assert_eq!(first.replayed, 2);
    assert_eq!(first.passes, 2);
    assert_eq!(first.remaining, 0);
    assert!(queued_urls(&engine).is_empty());
  }

  #[tokio::test]
  async fn test_dead_letters_after_max_attempts() {
    let transport = ScriptedTransport::new();
    transport.reply("http://api/a", Reply::Status(400));
    transport.reply("http://api/a", Reply::Status(400));
    let engine = engine(
      transport,
      SyncPolicy {
        max_attempts: Some(2),
        ..SyncPolicy::default()
      },
    );
    queue(&engine, "http://api/a");

    let first = engine.sync().await;
    assert_eq!(first.failed, 1);
    assert_eq!(first.remaining, 1);

    let second = engine.sync().await;
    assert_eq!(second.dead_lettered, 1);
    assert_eq!(second.remaining, 0);
    assert_eq!(engine.storage.dead_letters().unwrap().len(), 1);
  }

  #[tokio::test]
  async fn test_retries_forever_without_max_attempts() {
    let transport = ScriptedTransport::new();
    for _ in 0..5 {
      transport.reply("http://api/a", Reply::Fail);
    }
    let engine = engine(transport, SyncPolicy::default());
    queue(&engine, "http://api/a");

    for _ in 0..5 {
      engine.sync().await;
    }

    let pending = engine.storage.pending_actions().unwrap();
    assert_eq!(pending[0].attempts, 5);
    assert!(engine.storage.dead_letters().unwrap().is_empty());
  }

  #[tokio::test]
  async fn test_stale_token_is_retried_with_current_one() {
    let transport = ScriptedTransport::new();
    transport.reply("http://api/a", Reply::Status(401));
    let engine = engine(transport, SyncPolicy::default()).with_tokens(Arc::new(FixedToken("new")));
    queue(&engine, "http://api/a");

    let report = engine.sync().await;

    let bearers: Vec<_> = engine
      .transport
      .calls()
      .into_iter()
      .map(|c| c.bearer)
      .collect();
    assert_eq!(bearers, vec![Some("old".to_string()), Some("new".to_string())]);
    assert_eq!(report.replayed, 1);
    assert!(!report.auth_required);
  }

  #[tokio::test]
  async fn test_auth_failure_stops_the_pass() {
    let transport = ScriptedTransport::new();
    transport.reply("http://api/a1", Reply::Status(401));
    let engine = engine(transport, SyncPolicy::default());
    queue(&engine, "http://api/a1");
    queue(&engine, "http://api/a2");

    let report = engine.sync().await;

    assert!(report.auth_required);
    assert_eq!(engine.transport.called_urls(), vec!["http://api/a1"]);
    assert_eq!(queued_urls(&engine), vec!["http://api/a1", "http://api/a2"]);
    assert!(engine.status().auth_required);
  }

  #[tokio::test]
  async fn test_auth_failures_do_not_count_toward_max_attempts() {
    let transport = ScriptedTransport::new();
    transport.reply("http://api/a", Reply::Status(401));
    transport.reply("http://api/a", Reply::Status(403));
    let engine = engine(
      transport,
      SyncPolicy {
        max_attempts: Some(1),
        ..SyncPolicy::default()
      },
    );
    queue(&engine, "http://api/a");

    engine.sync().await;
    let second = engine.sync().await;

    assert!(second.auth_required);
    assert_eq!(second.dead_lettered, 0);
    assert_eq!(engine.storage.pending_actions().unwrap()[0].attempts, 0);
    assert!(engine.storage.dead_letters().unwrap().is_empty());
  }

  #[tokio::test]
  async fn test_sync_sweeps_expired_entries() {
    let engine = engine(ScriptedTransport::new(), SyncPolicy::default());
    engine
      .storage
      .put_entry("old", &json!(1), Some(now_ms() - 1_000))
      .unwrap();

    engine.sync().await;

    assert_eq!(engine.storage.entry_count().unwrap(), 0);
  }

  #[tokio::test]
  async fn test_status_tracks_pending_count() {
    let engine = engine(ScriptedTransport::new(), SyncPolicy::default());
    queue(&engine, "http://api/a");
    assert_eq!(engine.refresh_status(), 1);
    assert_eq!(engine.status().pending, 1);

    engine.sync().await;

    let status = engine.status();
    assert_eq!(status.pending, 0);
    assert!(!status.syncing);
    assert!(status.online);
  }
}
