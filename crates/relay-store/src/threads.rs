//! Thread aggregate: lookups, get-or-create and every mutation of a
//! conversation's own state.
//!
//! Mutations are read-modify-write against the latest stored copy.  An id
//! that no longer resolves is a stale reference and turns the call into a
//! logged no-op.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde_json::Value;

use relay_shared::constants::MAX_GENERATED_TITLE_NAMES;
use relay_shared::protocol::ThreadPayload;
use relay_shared::types::{millis_to_datetime, now_millis};
use relay_shared::RecipientId;

use crate::error::{Result, StoreError};
use crate::models::{participant_key, Message, Thread};
use crate::record::Collection;
use crate::services::ContactsManager;
use crate::transaction::{ReadAccess, WriteTransaction};
use crate::views::builtin::{
    ARCHIVE_GROUP, INBOX_GROUP, PARTICIPANTS, PINNED, PINNED_GROUP, TAG_THREADS, THREADS,
    THREAD_INTERACTIONS, UNREAD, UNSEEN,
};

// ---------------------------------------------------------------------------
// Queries
// ---------------------------------------------------------------------------

/// Thread lookups, available on every transaction.  Each query uses its
/// view when ready and falls back to a collection scan otherwise.
pub trait ThreadQueries: ReadAccess {
    fn thread(&self, id: &str) -> Result<Option<Thread>> {
        self.fetch::<Thread>(id)
    }

    /// Visible message ids of a thread, oldest first.
    fn interaction_ids(&self, thread_id: &str) -> Result<Vec<String>> {
        if self.is_view_ready(THREAD_INTERACTIONS) {
            return Ok(self.view_ids(THREAD_INTERACTIONS, thread_id));
        }
        scan_messages(self, thread_id, Message::should_be_saved)
    }

    fn number_of_interactions(&self, thread_id: &str) -> Result<usize> {
        if self.is_view_ready(THREAD_INTERACTIONS) {
            return Ok(self.view_group_len(THREAD_INTERACTIONS, thread_id));
        }
        Ok(self.interaction_ids(thread_id)?.len())
    }

    fn interactions(&self, thread_id: &str) -> Result<Vec<Message>> {
        let ids = self.interaction_ids(thread_id)?;
        self.fetch_many(&ids)
    }

    fn last_interaction(&self, thread_id: &str) -> Result<Option<Message>> {
        let last = match self.index().view(THREAD_INTERACTIONS) {
            Some(view) => view.last_in_group(thread_id).map(str::to_string),
            None => self.interaction_ids(thread_id)?.pop(),
        };
        match last {
            Some(id) => self.fetch::<Message>(&id),
            None => Ok(None),
        }
    }

    fn unread_ids(&self, thread_id: &str) -> Result<Vec<String>> {
        if self.is_view_ready(UNREAD) {
            return Ok(self.view_ids(UNREAD, thread_id));
        }
        scan_messages(self, thread_id, |m| {
            !m.was_read && m.should_affect_unread_counts()
        })
    }

    fn unread_count(&self, thread_id: &str) -> Result<usize> {
        if self.is_view_ready(UNREAD) {
            return Ok(self.view_group_len(UNREAD, thread_id));
        }
        Ok(self.unread_ids(thread_id)?.len())
    }

    fn total_unread_count(&self) -> Result<usize> {
        if let Some(view) = self.index().view(UNREAD) {
            return Ok(view.len());
        }
        Ok(self
            .enumerate::<Message, _>(|m| !m.was_read && m.should_affect_unread_counts())?
            .len())
    }

    /// Unseen message ids; the unread set stands in until the unseen view
    /// is ready.
    fn unseen_ids(&self, thread_id: &str) -> Result<Vec<String>> {
        if self.is_view_ready(UNSEEN) {
            return Ok(self.view_ids(UNSEEN, thread_id));
        }
        self.unread_ids(thread_id)
    }

    fn unseen_count(&self, thread_id: &str) -> Result<usize> {
        if self.is_view_ready(UNSEEN) {
            return Ok(self.view_group_len(UNSEEN, thread_id));
        }
        self.unread_count(thread_id)
    }

    fn inbox_thread_ids(&self) -> Result<Vec<String>> {
        thread_list(self, false)
    }

    fn archived_thread_ids(&self) -> Result<Vec<String>> {
        thread_list(self, true)
    }

    fn pinned_thread_ids(&self) -> Result<Vec<String>> {
        if self.is_view_ready(PINNED) {
            return Ok(self.view_ids(PINNED, PINNED_GROUP));
        }
        let mut pinned = self.enumerate::<Thread, _>(Thread::is_pinned)?;
        pinned.sort_by(|a, b| (a.pin_position, &a.unique_id).cmp(&(b.pin_position, &b.unique_id)));
        Ok(pinned.into_iter().map(|t| t.unique_id).collect())
    }

    /// Threads whose expression references `@slug`, most recent first.
    fn tag_thread_ids(&self, slug: &str) -> Result<Vec<String>> {
        let slug = slug.to_ascii_lowercase();
        if self.is_view_ready(TAG_THREADS) {
            return Ok(self.view_ids(TAG_THREADS, &slug));
        }
        let mut threads = self.enumerate::<Thread, _>(|t| t.tag_slugs().contains(&slug))?;
        sort_by_activity(&mut threads);
        Ok(threads.into_iter().map(|t| t.unique_id).collect())
    }

    /// Draft text; empty when there is none.
    fn current_draft(&self, thread_id: &str) -> Result<String> {
        Ok(self
            .thread(thread_id)?
            .and_then(|t| t.draft)
            .unwrap_or_default())
    }

    fn last_message_text(&self, thread_id: &str) -> Result<String> {
        Ok(self
            .thread(thread_id)?
            .and_then(|t| t.last_message_text)
            .unwrap_or_default())
    }

    fn disappearing_duration(&self, thread_id: &str) -> Result<u32> {
        Ok(self
            .thread(thread_id)?
            .map_or(0, |t| t.disappearing_duration))
    }

    /// Threads whose participant set equals `participants`, oldest first.
    fn threads_with_matching_participants(&self, participants: &[RecipientId]) -> Result<Vec<Thread>> {
        let key = participant_key(participants);
        if key.is_empty() {
            return Ok(Vec::new());
        }
        if self.is_view_ready(PARTICIPANTS) {
            let ids = self.view_ids(PARTICIPANTS, &key);
            return self.fetch_many(&ids);
        }
        let mut threads = self.enumerate::<Thread, _>(|t| t.participant_key() == key)?;
        threads.sort_by(|a, b| (a.created_at, &a.unique_id).cmp(&(b.created_at, &b.unique_id)));
        Ok(threads)
    }

    fn threads_containing_participant(&self, participant: &RecipientId) -> Result<Vec<Thread>> {
        self.enumerate::<Thread, _>(|t| t.participant_ids.contains(participant))
    }
}

impl<T: ReadAccess> ThreadQueries for T {}

fn scan_messages<T, P>(txn: &T, thread_id: &str, mut predicate: P) -> Result<Vec<String>>
where
    T: ReadAccess + ?Sized,
    P: FnMut(&Message) -> bool,
{
    let mut messages = txn.enumerate::<Message, _>(|m| m.thread_id == thread_id && predicate(m))?;
    messages.sort_by(|a, b| (a.timestamp, &a.unique_id).cmp(&(b.timestamp, &b.unique_id)));
    Ok(messages.into_iter().map(|m| m.unique_id).collect())
}

fn thread_list<T: ThreadQueries + ?Sized>(txn: &T, archived: bool) -> Result<Vec<String>> {
    if txn.is_view_ready(THREADS) {
        let group = if archived { ARCHIVE_GROUP } else { INBOX_GROUP };
        return Ok(txn.view_ids(THREADS, group));
    }
    let mut threads = Vec::new();
    for thread in txn.enumerate::<Thread, _>(|t| t.is_archived() == archived)? {
        if thread.has_ever_had_message || txn.number_of_interactions(&thread.unique_id)? > 0 {
            threads.push(thread);
        }
    }
    sort_by_activity(&mut threads);
    Ok(threads.into_iter().map(|t| t.unique_id).collect())
}

fn sort_by_activity(threads: &mut [Thread]) {
    threads.sort_by(|a, b| {
        b.last_activity()
            .cmp(&a.last_activity())
            .then_with(|| a.unique_id.cmp(&b.unique_id))
    });
}

// ---------------------------------------------------------------------------
// Mutations
// ---------------------------------------------------------------------------

impl WriteTransaction<'_> {
    /// Oldest thread with exactly these participants (order-insensitive), or
    /// a new one.  An empty set has no key to match on and is rejected.
    pub fn get_or_create_thread_with_participants(&mut self, participants: &[RecipientId]) -> Result<Thread> {
        if participants.is_empty() {
            return Err(StoreError::NoParticipants);
        }
        if let Some(existing) = self
            .threads_with_matching_participants(participants)?
            .into_iter()
            .next()
        {
            return Ok(existing);
        }
        let thread = Thread::with_participants(participants);
        self.insert(&thread)?;
        tracing::info!(
            thread = %thread.unique_id,
            participants = thread.participant_ids.len(),
            "thread created"
        );
        Ok(thread)
    }

    pub fn get_or_create_thread(&mut self, thread_id: &str) -> Result<Thread> {
        if let Some(existing) = self.thread(thread_id)? {
            return Ok(existing);
        }
        let thread = Thread::new(thread_id, &[]);
        self.insert(&thread)?;
        tracing::info!(thread = %thread_id, "thread created");
        Ok(thread)
    }

    /// Resolve the thread described by a payload, creating or updating it.
    /// A payload without `threadId` or `distribution.userIds` yields `None`.
    pub fn get_or_create_thread_from_payload(&mut self, payload: &Value) -> Result<Option<Thread>> {
        let parsed = match ThreadPayload::parse(payload) {
            Ok(parsed) => parsed,
            Err(e) => {
                tracing::warn!(error = %e, "malformed thread payload");
                return Ok(None);
            }
        };

        match self.thread(&parsed.thread_id)? {
            Some(existing) => {
                let mut thread = existing.clone();
                apply_payload(&mut thread, &parsed);
                if thread != existing {
                    self.upsert(&thread)?;
                    tracing::debug!(thread = %thread.unique_id, "thread updated from payload");
                }
                Ok(Some(thread))
            }
            None => {
                let mut thread = Thread::new(parsed.thread_id.clone(), &[]);
                apply_payload(&mut thread, &parsed);
                self.insert(&thread)?;
                tracing::info!(
                    thread = %thread.unique_id,
                    participants = thread.participant_ids.len(),
                    "thread created from payload"
                );
                Ok(Some(thread))
            }
        }
    }

    /// Read-modify-write the latest copy of a thread.  Returns the updated
    /// thread, or `None` when it no longer exists.
    pub fn update_thread<F>(&mut self, thread_id: &str, f: F) -> Result<Option<Thread>>
    where
        F: FnOnce(&mut Thread),
    {
        let Some(mut thread) = self.thread(thread_id)? else {
            tracing::debug!(thread = %thread_id, "skipping update of removed thread");
            return Ok(None);
        };
        let before = thread.clone();
        f(&mut thread);
        if thread != before {
            self.upsert(&thread)?;
        }
        Ok(Some(thread))
    }

    /// Take `message` into account for the thread's last-message cache.
    /// Calling it again with the same message changes nothing.
    pub fn update_with_last_message(&mut self, message: &Message) -> Result<()> {
        if !message.should_be_saved() {
            return Ok(());
        }
        self.refresh_thread_cache(&message.thread_id)
    }

    /// Recompute `has_ever_had_message` and the last-message cache from the
    /// thread's visible interactions.
    pub fn refresh_thread_cache(&mut self, thread_id: &str) -> Result<()> {
        let last = self.last_interaction(thread_id)?;
        self.update_thread(thread_id, |t| {
            if last.is_some() {
                t.has_ever_had_message = true;
            }
            t.last_message_id = last.as_ref().map(|m| m.unique_id.clone());
            t.last_message_text = last.as_ref().map(Message::preview_text);
            t.last_message_date = last.as_ref().map(|m| millis_to_datetime(m.timestamp));
        })?;
        Ok(())
    }

    /// Mark everything read and move the thread to the archive.
    pub fn archive_thread(&mut self, thread_id: &str, reference: Option<DateTime<Utc>>) -> Result<bool> {
        if self.thread(thread_id)?.is_none() {
            tracing::debug!(thread = %thread_id, "skipping archive of removed thread");
            return Ok(false);
        }
        self.mark_all_read(thread_id)?;
        let date = reference.unwrap_or_else(Utc::now);
        Ok(self
            .update_thread(thread_id, |t| t.archival_date = Some(date))?
            .is_some())
    }

    pub fn unarchive_thread(&mut self, thread_id: &str) -> Result<bool> {
        Ok(self
            .update_thread(thread_id, |t| t.archival_date = None)?
            .is_some())
    }

    pub fn set_muted(&mut self, thread_id: &str, until: Option<DateTime<Utc>>) -> Result<bool> {
        Ok(self
            .update_thread(thread_id, |t| t.muted_until = until)?
            .is_some())
    }

    pub fn add_participants(&mut self, thread_id: &str, ids: &[RecipientId]) -> Result<bool> {
        Ok(self
            .update_thread(thread_id, |t| {
                t.add_participants(ids.iter().cloned());
            })?
            .is_some())
    }

    /// Removing every participant keeps the thread.
    pub fn remove_participants(&mut self, thread_id: &str, ids: &[RecipientId]) -> Result<bool> {
        Ok(self
            .update_thread(thread_id, |t| {
                t.remove_participants(ids);
            })?
            .is_some())
    }

    /// Replace the participant set.
    pub fn update_participants(&mut self, thread_id: &str, ids: &[RecipientId]) -> Result<bool> {
        Ok(self
            .update_thread(thread_id, |t| {
                t.participant_ids.clear();
                t.add_participants(ids.iter().cloned());
            })?
            .is_some())
    }

    pub fn set_draft(&mut self, thread_id: &str, text: &str) -> Result<bool> {
        let draft = (!text.is_empty()).then(|| text.to_string());
        Ok(self
            .update_thread(thread_id, |t| t.draft = draft)?
            .is_some())
    }

    pub fn update_title(&mut self, thread_id: &str, title: &str) -> Result<bool> {
        let title = (!title.trim().is_empty()).then(|| title.to_string());
        Ok(self
            .update_thread(thread_id, |t| t.title = title)?
            .is_some())
    }

    pub fn set_pin_position(&mut self, thread_id: &str, position: Option<i64>) -> Result<bool> {
        Ok(self
            .update_thread(thread_id, |t| t.pin_position = position)?
            .is_some())
    }

    pub fn set_disappearing_duration(&mut self, thread_id: &str, seconds: u32) -> Result<bool> {
        Ok(self
            .update_thread(thread_id, |t| t.disappearing_duration = seconds)?
            .is_some())
    }

    pub fn set_expression(
        &mut self,
        thread_id: &str,
        universal: Option<String>,
        pretty: Option<String>,
    ) -> Result<bool> {
        Ok(self
            .update_thread(thread_id, |t| {
                t.universal_expression = universal;
                t.pretty_expression = pretty;
            })?
            .is_some())
    }

    pub fn add_monitor(&mut self, thread_id: &str, monitor: RecipientId) -> Result<bool> {
        Ok(self
            .update_thread(thread_id, |t| t.monitor_ids.insert(monitor))?
            .is_some())
    }

    pub fn remove_monitor(&mut self, thread_id: &str, monitor: &RecipientId) -> Result<bool> {
        Ok(self
            .update_thread(thread_id, |t| {
                t.monitor_ids.remove(monitor);
            })?
            .is_some())
    }

    /// Mark every unread or unseen message of the thread read; returns how
    /// many changed.
    pub fn mark_all_read(&mut self, thread_id: &str) -> Result<usize> {
        let mut ids: BTreeSet<String> = self.unread_ids(thread_id)?.into_iter().collect();
        ids.extend(self.unseen_ids(thread_id)?);

        let now = now_millis();
        let mut marked = 0;
        for id in ids {
            if self.mark_message_read(&id, now)? {
                marked += 1;
            }
        }
        if marked > 0 {
            tracing::debug!(thread = %thread_id, marked, "marked thread read");
        }
        Ok(marked)
    }

    /// Mark read every message with `timestamp <= before`.
    pub fn mark_as_read_before(&mut self, thread_id: &str, before: u64) -> Result<usize> {
        let mut ids: BTreeSet<String> = self.unread_ids(thread_id)?.into_iter().collect();
        ids.extend(self.unseen_ids(thread_id)?);

        let now = now_millis();
        let mut marked = 0;
        for message in self.fetch_many::<Message>(&ids.into_iter().collect::<Vec<_>>())? {
            if message.timestamp <= before && self.mark_message_read(&message.unique_id, now)? {
                marked += 1;
            }
        }
        Ok(marked)
    }

    /// Remove every interaction of the thread; the thread itself stays.
    pub fn remove_all_interactions(&mut self, thread_id: &str, keep_attachments: bool) -> Result<usize> {
        let ids = self.interaction_ids(thread_id)?;
        let mut removed = 0;
        for id in &ids {
            if self.remove_message(id, keep_attachments)? {
                removed += 1;
            }
        }
        self.refresh_thread_cache(thread_id)?;
        tracing::info!(thread = %thread_id, removed, "cleared thread interactions");
        Ok(removed)
    }

    /// Remove the thread and, first, all of its interactions.
    pub fn remove_thread(&mut self, thread_id: &str, keep_attachments: bool) -> Result<bool> {
        if self.thread(thread_id)?.is_none() {
            tracing::debug!(thread = %thread_id, "skipping removal of missing thread");
            return Ok(false);
        }
        self.remove_all_interactions(thread_id, keep_attachments)?;
        let removed = self.remove_record(Collection::Threads, thread_id)?;
        tracing::info!(thread = %thread_id, "thread removed");
        Ok(removed)
    }
}

fn apply_payload(thread: &mut Thread, payload: &ThreadPayload) {
    thread.participant_ids.clear();
    thread.add_participants(payload.participant_ids.iter().cloned());
    if let Some(title) = &payload.title {
        thread.title = Some(title.clone());
    }
    thread.thread_type = payload.thread_type;
    if payload.expression.is_some() {
        thread.universal_expression = payload.expression.clone();
    }
    if payload.pretty_expression.is_some() {
        thread.pretty_expression = payload.pretty_expression.clone();
    }
}

// ---------------------------------------------------------------------------
// Display
// ---------------------------------------------------------------------------

/// Name shown for a thread: its title when set, else the other
/// participant's name for one-to-one threads, else a label built from
/// participant names.
pub fn display_name(thread: &Thread, local: &RecipientId, contacts: &dyn ContactsManager) -> String {
    if let Some(title) = thread.title.as_deref().filter(|t| !t.trim().is_empty()) {
        return title.to_string();
    }
    if let Some(other) = thread.other_participant(local) {
        return contacts.display_name_or_id(other);
    }

    let mut others: Vec<&RecipientId> = thread
        .participant_ids
        .iter()
        .filter(|p| *p != local)
        .collect();
    if others.is_empty() {
        return thread.pretty_expression.clone().unwrap_or_default();
    }
    others.sort_by(|a, b| contacts.compare(a, b));

    let names: Vec<String> = others
        .iter()
        .take(MAX_GENERATED_TITLE_NAMES)
        .map(|p| contacts.display_name_or_id(p))
        .collect();
    let mut label = names.join(", ");
    if others.len() > MAX_GENERATED_TITLE_NAMES {
        label.push_str(&format!(" +{}", others.len() - MAX_GENERATED_TITLE_NAMES));
    }
    label
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{open_store, rid};
    use serde_json::json;

    #[test]
    fn get_or_create_is_order_insensitive() {
        let (_dir, db) = open_store();
        let ids = db
            .write(|txn| {
                let first = txn.get_or_create_thread_with_participants(&[rid("a"), rid("b")])?;
                let again = txn.get_or_create_thread_with_participants(&[rid("a"), rid("b")])?;
                let reversed = txn.get_or_create_thread_with_participants(&[rid("b"), rid("a")])?;
                Ok((first.unique_id, again.unique_id, reversed.unique_id))
            })
            .unwrap();
        assert_eq!(ids.0, ids.1);
        assert_eq!(ids.0, ids.2);
    }

    #[test]
    fn empty_participant_set_is_rejected() {
        let (_dir, db) = open_store();
        let err = db
            .write(|txn| txn.get_or_create_thread_with_participants(&[]))
            .unwrap_err();
        assert!(matches!(err, StoreError::NoParticipants));
        assert_eq!(db.read(|txn| txn.count(Collection::Threads)).unwrap(), 0);
    }

    #[test]
    fn get_or_create_by_id() {
        let (_dir, db) = open_store();
        db.write(|txn| {
            let t = txn.get_or_create_thread("fixed")?;
            let again = txn.get_or_create_thread("fixed")?;
            assert_eq!(t.created_at, again.created_at);
            Ok(())
        })
        .unwrap();
        assert_eq!(db.read(|txn| txn.count(Collection::Threads)).unwrap(), 1);
    }

    #[test]
    fn payload_creates_then_updates() {
        let (_dir, db) = open_store();
        let payload = json!({
            "threadId": "t-9",
            "threadTitle": "Ops",
            "distribution": { "userIds": ["a", "b"], "expression": "@ops", "pretty": "@ops" }
        });
        let created = db
            .write(|txn| txn.get_or_create_thread_from_payload(&payload))
            .unwrap()
            .unwrap();
        assert_eq!(created.title.as_deref(), Some("Ops"));
        assert_eq!(created.participant_ids, vec![rid("a"), rid("b")]);

        let renamed = json!({
            "threadId": "t-9",
            "threadTitle": "Ops 2",
            "distribution": { "userIds": ["a", "b", "c"] }
        });
        let updated = db
            .write(|txn| txn.get_or_create_thread_from_payload(&renamed))
            .unwrap()
            .unwrap();
        assert_eq!(updated.title.as_deref(), Some("Ops 2"));
        assert_eq!(updated.participant_ids.len(), 3);
        assert_eq!(updated.universal_expression.as_deref(), Some("@ops"));

        let tagged = db.read(|txn| txn.tag_thread_ids("OPS")).unwrap();
        assert_eq!(tagged, vec!["t-9"]);
    }

    #[test]
    fn malformed_payload_yields_none() {
        let (_dir, db) = open_store();
        let missing_users = json!({ "threadId": "t", "distribution": {} });
        let missing_id = json!({ "distribution": { "userIds": ["a"] } });
        db.write(|txn| {
            assert!(txn.get_or_create_thread_from_payload(&missing_users)?.is_none());
            assert!(txn.get_or_create_thread_from_payload(&missing_id)?.is_none());
            Ok(())
        })
        .unwrap();
        assert_eq!(db.read(|txn| txn.count(Collection::Threads)).unwrap(), 0);
    }

    #[test]
    fn archive_then_unarchive_returns_to_inbox() {
        let (_dir, db) = open_store();
        let thread = db
            .write(|txn| {
                let t = txn.get_or_create_thread_with_participants(&[rid("a")])?;
                txn.save_message(&Message::incoming(&t.unique_id, rid("a"), 1, 10, None))?;
                Ok(t)
            })
            .unwrap();
        let id = thread.unique_id.as_str();

        db.write(|txn| txn.archive_thread(id, None)).unwrap();
        db.read(|txn| {
            assert_eq!(txn.archived_thread_ids()?, vec![id.to_string()]);
            assert!(txn.inbox_thread_ids()?.is_empty());
            assert_eq!(txn.unread_count(id)?, 0);
            Ok(())
        })
        .unwrap();

        db.write(|txn| txn.unarchive_thread(id)).unwrap();
        db.read(|txn| {
            assert_eq!(txn.inbox_thread_ids()?, vec![id.to_string()]);
            assert!(txn.thread(id)?.unwrap().archival_date.is_none());
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn draft_and_participants() {
        let (_dir, db) = open_store();
        let id = db
            .write(|txn| Ok(txn.get_or_create_thread_with_participants(&[rid("a"), rid("b")])?.unique_id))
            .unwrap();
        db.write(|txn| {
            assert_eq!(txn.current_draft(&id)?, "");
            txn.set_draft(&id, "half a thought")?;
            assert_eq!(txn.current_draft(&id)?, "half a thought");
            txn.set_draft(&id, "")?;
            assert_eq!(txn.current_draft(&id)?, "");

            txn.remove_participants(&id, &[rid("a"), rid("b")])?;
            let thread = txn.thread(&id)?.unwrap();
            assert!(thread.participant_ids.is_empty());
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn stale_reference_is_noop() {
        let (_dir, db) = open_store();
        let changed = db
            .write(|txn| {
                Ok((
                    txn.archive_thread("gone", None)?,
                    txn.set_muted("gone", Some(Utc::now()))?,
                    txn.remove_thread("gone", false)?,
                ))
            })
            .unwrap();
        assert_eq!(changed, (false, false, false));
    }

    #[test]
    fn pinned_threads_follow_position() {
        let (_dir, db) = open_store();
        db.write(|txn| {
            txn.get_or_create_thread("x")?;
            txn.get_or_create_thread("y")?;
            txn.set_pin_position("x", Some(2))?;
            txn.set_pin_position("y", Some(1))?;
            Ok(())
        })
        .unwrap();
        assert_eq!(db.read(|txn| txn.pinned_thread_ids()).unwrap(), vec!["y", "x"]);
    }

    #[test]
    fn participant_queries_without_views() {
        let dir = tempfile::tempdir().unwrap();
        let db = crate::Database::open_in(dir.path(), Default::default()).unwrap();
        db.write(|txn| {
            let t = txn.get_or_create_thread_with_participants(&[rid("a"), rid("b")])?;
            let same = txn.get_or_create_thread_with_participants(&[rid("b"), rid("a")])?;
            assert_eq!(t.unique_id, same.unique_id);
            assert_eq!(txn.threads_containing_participant(&rid("b"))?.len(), 1);
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn display_names() {
        let me = rid("me");
        let contacts = crate::services::NoopContactsManager;

        let direct = Thread::new("d", &[me.clone(), rid("bob-1234567890")]);
        assert_eq!(display_name(&direct, &me, &contacts), "bob-1234");

        let mut group = Thread::new("g", &[me.clone(), rid("c"), rid("a"), rid("b"), rid("d")]);
        assert_eq!(display_name(&group, &me, &contacts), "a, b, c +1");
        group.title = Some("Crew".into());
        assert_eq!(display_name(&group, &me, &contacts), "Crew");
    }

    struct Directory;

    impl ContactsManager for Directory {
        fn display_name(&self, id: &RecipientId) -> Option<String> {
            (id.0 == "bob").then(|| "Bob Smith".to_string())
        }

        fn all_recipients(&self) -> Vec<RecipientId> {
            vec![rid("bob")]
        }

        fn is_system_contact(&self, id: &RecipientId) -> bool {
            id.0 == "bob"
        }
    }

    #[test]
    fn titled_two_member_thread_uses_title() {
        let me = rid("me");
        let mut thread = Thread::new("t", &[me.clone(), rid("bob")]);
        assert_eq!(display_name(&thread, &me, &Directory), "Bob Smith");

        thread.title = Some("Standup".into());
        assert_eq!(display_name(&thread, &me, &Directory), "Standup");

        thread.title = Some("  ".into());
        assert_eq!(display_name(&thread, &me, &Directory), "Bob Smith");
    }

    #[test]
    fn unknown_contacts_fall_back_to_short_id() {
        let me = rid("me");
        assert_eq!(Directory.display_name(&rid("eve")), None);
        let group = Thread::new("g", &[me.clone(), rid("bob"), rid("eve-0123456789")]);
        assert_eq!(display_name(&group, &me, &Directory), "Bob Smith, eve-0123");
    }
}
