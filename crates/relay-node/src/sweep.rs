//! Background maintenance: expiring disappearing messages and logging
//! committed changes.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use relay_shared::types::now_millis;
use relay_store::notifications::Subscription;
use relay_store::Database;

use crate::error::NodeError;

/// Remove every message whose timer has run out.  Returns how many went.
pub async fn sweep_once(db: &Arc<Database>) -> Result<usize, NodeError> {
    let db = Arc::clone(db);
    let removed = tokio::task::spawn_blocking(move || db.write(|txn| txn.sweep_expired(now_millis()))).await??;
    if !removed.is_empty() {
        info!(count = removed.len(), "expired messages removed");
    }
    Ok(removed.len())
}

/// Sweep every `period` until the task is aborted.
pub fn spawn_sweeper(db: Arc<Database>, period: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);
        loop {
            interval.tick().await;
            if let Err(e) = sweep_once(&db).await {
                warn!(error = %e, "expiration sweep failed");
            }
        }
    })
}

/// Log each commit notification until the store goes away.  Runs on its own
/// thread since `Subscription::recv` blocks; it never writes, so it cannot
/// stall the writer that publishes to it.
pub fn spawn_notification_logger(subscription: Subscription) -> std::io::Result<std::thread::JoinHandle<()>> {
    std::thread::Builder::new()
        .name("relay-notifications".into())
        .spawn(move || {
            while let Some(notification) = subscription.recv() {
                debug!(
                    commit = notification.commit_seq,
                    records = notification.record_changes.len(),
                    views = notification.view_changes.len(),
                    "commit published"
                );
            }
            debug!("notification stream closed");
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use relay_shared::RecipientId;
    use relay_store::prelude::*;
    use relay_store::{Message, StoreOptions};

    #[tokio::test]
    async fn sweep_removes_expired_messages() {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::open_in(dir.path(), StoreOptions::default()).unwrap();
        db.register_builtin_views().unwrap();

        let id = db
            .write(|txn| {
                txn.get_or_create_thread("t")?;
                let message = Message::incoming("t", RecipientId::from("a"), 1, 1, Some("gone soon".into()))
                    .with_expiration(1);
                txn.save_message(&message)?;
                txn.update_expire_started_at(&message.unique_id, 1)?;
                Ok(message.unique_id)
            })
            .unwrap();

        assert_eq!(sweep_once(&db).await.unwrap(), 1);
        assert!(db.read(|txn| txn.message(&id)).unwrap().is_none());
        assert_eq!(sweep_once(&db).await.unwrap(), 0);
    }
}
