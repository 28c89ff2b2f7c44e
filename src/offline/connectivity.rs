//! Process-wide online/offline state and the probe that feeds it.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info};

/// Cloneable handle on the shared connectivity flag.
///
/// Every clone observes and updates the same state. Subscribers are woken on
/// each actual transition; setting the current value again is a no-op.
#[derive(Clone, Debug)]
pub struct Connectivity {
  tx: Arc<watch::Sender<bool>>,
}

impl Connectivity {
  pub fn new(online: bool) -> Self {
    let (tx, _rx) = watch::channel(online);
    Self { tx: Arc::new(tx) }
  }

  /// Synchronous "am I online" query.
  pub fn is_online(&self) -> bool {
    *self.tx.borrow()
  }

  /// Update the flag. Returns `true` if this was a transition.
  pub fn set_online(&self, online: bool) -> bool {
    let changed = self.tx.send_if_modified(|current| {
      if *current == online {
        false
      } else {
        *current = online;
        true
      }
    });

    if changed {
      info!(online, "Connectivity changed");
    }
    changed
  }

  pub fn subscribe(&self) -> watch::Receiver<bool> {
    self.tx.subscribe()
  }
}

impl Default for Connectivity {
  fn default() -> Self {
    Self::new(true)
  }
}

/// Periodically checks whether the backend is reachable.
///
/// Any HTTP response counts as online, a transport error as offline.
pub struct ConnectivityProbe {
  client: reqwest::Client,
  url: String,
  interval: Duration,
  connectivity: Connectivity,
}

impl ConnectivityProbe {
  pub fn new(
    client: reqwest::Client,
    url: impl Into<String>,
    interval: Duration,
    connectivity: Connectivity,
  ) -> Self {
    Self {
      client,
      url: url.into(),
      interval,
      connectivity,
    }
  }

  /// Probe once and publish the result.
  pub async fn check(&self) -> bool {
    let online = match self.client.get(self.url.as_str()).send().await {
      Ok(response) => {
        debug!(status = %response.status(), url = %self.url, "Probe answered");
        true
      }
      Err(e) => {
        debug!(url = %self.url, "Probe failed: {}", e);
        false
      }
    };
    self.connectivity.set_online(online);
    online
  }

  /// Probe on a fixed interval until the task is aborted.
  pub fn spawn(self) -> JoinHandle<()> {
    tokio::spawn(async move {
      let mut ticker = tokio::time::interval(self.interval);
      ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
      loop {
        ticker.tick().await;
        self.check().await;
      }
    })
  }
}
