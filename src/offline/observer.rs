//! Bridges connectivity transitions into sync triggers.

use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::info;

use super::connectivity::Connectivity;
use super::storage::OfflineStorage;
use super::sync::SyncEngine;
use super::transport::Transport;

/// Watch connectivity for the lifetime of the returned task.
///
/// Refreshes the pending count once up front, then on every offline to online
/// transition starts one drain. Going offline only updates the status; drains
/// already in flight are left to fail on their own.
pub fn spawn<S, T>(engine: Arc<SyncEngine<S, T>>, connectivity: &Connectivity) -> JoinHandle<()>
where
  S: OfflineStorage + 'static,
  T: Transport + 'static,
{
  let mut rx = connectivity.subscribe();

  tokio::spawn(async move {
    let pending = engine.refresh_status();
    let mut was_online = *rx.borrow_and_update();
    info!(online = was_online, pending, "Watching connectivity");

    while rx.changed().await.is_ok() {
      let online = *rx.borrow_and_update();
      if online == was_online {
        continue;
      }
      was_online = online;
      engine.refresh_status();

      if online {
        info!("Back online, syncing queued actions");
        let engine = Arc::clone(&engine);
        tokio::spawn(async move {
          engine.sync().await;
        });
      } else {
        info!("Gone offline");
      }
    }
  })
}
