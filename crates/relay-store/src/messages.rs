//! Interaction (message) lifecycle: save, update, read state, delivery
//! state, disappearing-message timers and removal.

use relay_shared::types::now_millis;
use relay_shared::RecipientId;

use crate::error::{Result, StoreError};
use crate::models::{Message, MessageKind, OutgoingState};
use crate::threads::ThreadQueries;
use crate::transaction::{ReadAccess, WriteTransaction};
use crate::views::builtin::{EXPIRING, EXPIRING_GROUP, THREAD_OUTGOING};

pub trait MessageQueries: ThreadQueries {
    fn message(&self, id: &str) -> Result<Option<Message>> {
        self.fetch::<Message>(id)
    }

    /// A visible message of the thread with this timestamp and, when given,
    /// this author.
    fn find_message(
        &self,
        thread_id: &str,
        author: Option<&RecipientId>,
        timestamp: u64,
    ) -> Result<Option<Message>> {
        Ok(self
            .interactions(thread_id)?
            .into_iter()
            .find(|m| m.timestamp == timestamp && (author.is_none() || m.author_id() == author)))
    }

    /// Outgoing message ids of a thread, oldest first.
    fn outgoing_message_ids(&self, thread_id: &str) -> Result<Vec<String>> {
        if self.is_view_ready(THREAD_OUTGOING) {
            return Ok(self.view_ids(THREAD_OUTGOING, thread_id));
        }
        let mut outgoing =
            self.enumerate::<Message, _>(|m| m.thread_id == thread_id && m.is_outgoing())?;
        outgoing.sort_by(|a, b| (a.timestamp, &a.unique_id).cmp(&(b.timestamp, &b.unique_id)));
        Ok(outgoing.into_iter().map(|m| m.unique_id).collect())
    }

    /// Messages whose timer ran out at or before `now`, soonest first.
    fn expired_messages(&self, now: u64) -> Result<Vec<Message>> {
        if !self.is_view_ready(EXPIRING) {
            let mut expired = self.enumerate::<Message, _>(|m| m.has_expired(now))?;
            expired.sort_by_key(|m| (m.expires_at(), m.unique_id.clone()));
            return Ok(expired);
        }

        let mut expired = Vec::new();
        for id in self.view_ids(EXPIRING, EXPIRING_GROUP) {
            let Some(message) = self.fetch::<Message>(&id)? else {
                continue;
            };
            if !message.has_expired(now) {
                break;
            }
            expired.push(message);
        }
        Ok(expired)
    }

    /// Expiry time of the next message due to disappear.
    fn next_expiration(&self) -> Result<Option<u64>> {
        if let Some(view) = self.index().view(EXPIRING) {
            return match view.first_in_group(EXPIRING_GROUP) {
                Some(id) => Ok(self.fetch::<Message>(id)?.and_then(|m| m.expires_at())),
                None => Ok(None),
            };
        }
        Ok(self
            .enumerate::<Message, _>(|m| m.expires_at().is_some())?
            .iter()
            .filter_map(Message::expires_at)
            .min())
    }
}

impl<T: ReadAccess> MessageQueries for T {}

impl WriteTransaction<'_> {
    /// Store a message, link its attachments and refresh its thread.
    /// Messages that are never stored (read receipts, dynamic payloads)
    /// are skipped and `false` is returned.
    pub fn save_message(&mut self, message: &Message) -> Result<bool> {
        if !message.should_be_saved() {
            tracing::debug!(message = %message.unique_id, "message not persisted");
            return Ok(false);
        }
        if self.thread(&message.thread_id)?.is_none() {
            return Err(StoreError::MissingThread(message.thread_id.clone()));
        }

        self.insert(message)?;
        for attachment_id in &message.attachment_ids {
            self.link_attachment(attachment_id, &message.unique_id)?;
        }
        self.update_with_last_message(message)?;

        tracing::debug!(
            message = %message.unique_id,
            thread = %message.thread_id,
            "message saved"
        );
        Ok(true)
    }

    /// Read-modify-write the latest copy of a message.  `None` when the
    /// message no longer exists.
    pub fn update_message<F>(&mut self, message_id: &str, f: F) -> Result<Option<Message>>
    where
        F: FnOnce(&mut Message),
    {
        let Some(mut message) = self.fetch::<Message>(message_id)? else {
            tracing::debug!(message = %message_id, "skipping update of removed message");
            return Ok(None);
        };
        let before = message.clone();
        f(&mut message);
        if message == before {
            return Ok(Some(message));
        }

        self.upsert(&message)?;
        if message.preview_text() != before.preview_text() || message.timestamp != before.timestamp {
            self.refresh_thread_cache(&message.thread_id)?;
        }
        Ok(Some(message))
    }

    /// Remove a message and release its attachments; attachment records
    /// (and files) left unreferenced are deleted unless `keep_attachments`.
    pub fn remove_message(&mut self, message_id: &str, keep_attachments: bool) -> Result<bool> {
        let Some(message) = self.remove::<Message>(message_id)? else {
            tracing::debug!(message = %message_id, "skipping removal of missing message");
            return Ok(false);
        };
        for attachment_id in &message.attachment_ids {
            self.unlink_attachment(attachment_id, message_id, keep_attachments)?;
        }
        self.refresh_thread_cache(&message.thread_id)?;
        Ok(true)
    }

    /// Mark read, arming the disappearing timer when it applies.  Returns
    /// whether the read flag changed.
    pub fn mark_message_read(&mut self, message_id: &str, now: u64) -> Result<bool> {
        let mut changed = false;
        self.update_message(message_id, |m| {
            if !m.was_read {
                m.was_read = true;
                changed = true;
            }
            if m.should_start_expire_timer() {
                m.expire_started_at = now;
            }
        })?;
        Ok(changed)
    }

    /// Arm the disappearing timer.  A timer that is already running keeps
    /// its original start.
    pub fn update_expire_started_at(&mut self, message_id: &str, started_at: u64) -> Result<bool> {
        let mut armed = false;
        self.update_message(message_id, |m| {
            if m.expires_in_seconds > 0 && m.expire_started_at == 0 && started_at > 0 {
                m.expire_started_at = started_at;
                armed = true;
            }
        })?;
        Ok(armed)
    }

    /// Record the delivery outcome of an outgoing message.  A successful
    /// send arms the disappearing timer.
    pub fn set_outgoing_state(&mut self, message_id: &str, state: OutgoingState) -> Result<Option<Message>> {
        let now = now_millis();
        self.update_message(message_id, |m| {
            if !m.is_outgoing() {
                return;
            }
            m.kind = MessageKind::Outgoing { state };
            if m.should_start_expire_timer() {
                m.expire_started_at = now;
            }
        })
    }

    /// Remove every message whose timer ran out by `now`; returns the
    /// removed ids.
    pub fn sweep_expired(&mut self, now: u64) -> Result<Vec<String>> {
        let expired = self.expired_messages(now)?;
        let mut removed = Vec::with_capacity(expired.len());
        for message in expired {
            if self.remove_message(&message.unique_id, false)? {
                removed.push(message.unique_id);
            }
        }
        if !removed.is_empty() {
            tracing::info!(removed = removed.len(), "expired messages removed");
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Thread;
    use crate::record::Collection;
    use crate::test_support::{open_store, rid};

    fn thread_with_participant(db: &crate::Database) -> Thread {
        db.write(|txn| txn.get_or_create_thread_with_participants(&[rid("a")]))
            .unwrap()
    }

    #[test]
    fn save_requires_existing_thread() {
        let (_dir, db) = open_store();
        let orphan = Message::incoming("nowhere", rid("a"), 1, 10, None);
        let err = db.write(|txn| txn.save_message(&orphan)).unwrap_err();
        assert!(matches!(err, StoreError::MissingThread(_)));
    }

    #[test]
    fn receipts_are_never_stored() {
        let (_dir, db) = open_store();
        let thread = thread_with_participant(&db);
        let receipts = Message::read_receipts(&thread.unique_id, vec![1, 2]);
        assert!(!db.write(|txn| txn.save_message(&receipts)).unwrap());
        assert_eq!(db.read(|txn| txn.count(Collection::Interactions)).unwrap(), 0);
    }

    #[test]
    fn save_and_remove_maintain_thread_cache() {
        let (_dir, db) = open_store();
        let thread = thread_with_participant(&db);
        let id = thread.unique_id.as_str();
        let first = Message::incoming(id, rid("a"), 1, 10, Some("first".into()));
        let second = Message::incoming(id, rid("a"), 1, 20, Some("second".into()));

        db.write(|txn| {
            txn.save_message(&first)?;
            txn.save_message(&second)
        })
        .unwrap();
        db.read(|txn| {
            assert_eq!(txn.last_message_text(id)?, "second");
            assert_eq!(txn.unread_count(id)?, 2);
            assert!(txn.thread(id)?.unwrap().has_ever_had_message);
            Ok(())
        })
        .unwrap();

        db.write(|txn| txn.remove_message(&second.unique_id, false)).unwrap();
        assert_eq!(db.read(|txn| txn.last_message_text(id)).unwrap(), "first");

        db.write(|txn| txn.remove_message(&first.unique_id, false)).unwrap();
        let thread = db.read(|txn| txn.thread(id)).unwrap().unwrap();
        assert!(thread.last_message_id.is_none());
        assert!(thread.has_ever_had_message);
    }

    #[test]
    fn reading_arms_timer_once() {
        let (_dir, db) = open_store();
        let thread = thread_with_participant(&db);
        let message = Message::incoming(&thread.unique_id, rid("a"), 1, 10, None).with_expiration(5);
        db.write(|txn| txn.save_message(&message)).unwrap();
        assert_eq!(db.read(|txn| txn.next_expiration()).unwrap(), None);

        assert!(db.write(|txn| txn.mark_message_read(&message.unique_id, 1_000)).unwrap());
        assert!(!db.write(|txn| txn.mark_message_read(&message.unique_id, 9_000)).unwrap());
        assert!(!db
            .write(|txn| txn.update_expire_started_at(&message.unique_id, 9_000))
            .unwrap());

        let stored = db.read(|txn| txn.message(&message.unique_id)).unwrap().unwrap();
        assert_eq!(stored.expire_started_at, 1_000);
        assert_eq!(db.read(|txn| txn.next_expiration()).unwrap(), Some(6_000));
    }

    #[test]
    fn sent_outgoing_message_starts_timer() {
        let (_dir, db) = open_store();
        let mut thread = thread_with_participant(&db);
        thread.disappearing_duration = 30;
        let message = Message::outgoing(&thread, "bye");
        db.write(|txn| txn.save_message(&message)).unwrap();

        let updated = db
            .write(|txn| txn.set_outgoing_state(&message.unique_id, OutgoingState::Sent))
            .unwrap()
            .unwrap();
        assert!(updated.expire_started_at > 0);
        assert_eq!(
            db.read(|txn| txn.outgoing_message_ids(&thread.unique_id)).unwrap(),
            vec![message.unique_id.clone()]
        );
    }

    #[test]
    fn sweep_removes_only_expired() {
        let (_dir, db) = open_store();
        let thread = thread_with_participant(&db);
        let soon = Message::incoming(&thread.unique_id, rid("a"), 1, 10, None).with_expiration(1);
        let later = Message::incoming(&thread.unique_id, rid("a"), 1, 11, None).with_expiration(100);
        db.write(|txn| {
            txn.save_message(&soon)?;
            txn.save_message(&later)?;
            txn.update_expire_started_at(&soon.unique_id, 1_000)?;
            txn.update_expire_started_at(&later.unique_id, 1_000)
        })
        .unwrap();

        let removed = db.write(|txn| txn.sweep_expired(5_000)).unwrap();
        assert_eq!(removed, vec![soon.unique_id.clone()]);
        assert!(db.read(|txn| txn.message(&later.unique_id)).unwrap().is_some());
        assert!(db.write(|txn| txn.sweep_expired(5_000)).unwrap().is_empty());
    }

    #[test]
    fn find_message_by_author_and_timestamp() {
        let (_dir, db) = open_store();
        let thread = thread_with_participant(&db);
        let message = Message::incoming(&thread.unique_id, rid("a"), 1, 42, None);
        db.write(|txn| txn.save_message(&message)).unwrap();
        db.read(|txn| {
            assert!(txn.find_message(&thread.unique_id, Some(&rid("a")), 42)?.is_some());
            assert!(txn.find_message(&thread.unique_id, Some(&rid("b")), 42)?.is_none());
            assert!(txn.find_message(&thread.unique_id, None, 43)?.is_none());
            Ok(())
        })
        .unwrap();
    }
}
