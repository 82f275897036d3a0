//! Views every store registers at startup.

use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::database::UnseenPolicy;
use crate::models::{Message, Thread};
use crate::record::{Collection, StoredRecord};
use crate::views::{IndexState, Placement, SortKey, ViewDefinition};

pub const THREAD_INTERACTIONS: &str = "thread_interactions";
pub const THREADS: &str = "threads";
pub const THREAD_OUTGOING: &str = "thread_outgoing_messages";
pub const UNREAD: &str = "unread";
pub const UNSEEN: &str = "unseen";
pub const PINNED: &str = "pinned";
pub const TAGS: &str = "tags";
pub const TAG_THREADS: &str = "tag_threads";
pub const PARTICIPANTS: &str = "participants";
pub const EXPIRING: &str = "expiring_messages";

pub const INBOX_GROUP: &str = "inbox";
pub const ARCHIVE_GROUP: &str = "archive";
pub const PINNED_GROUP: &str = "pinned";
pub const ACTIVE_TAGS_GROUP: &str = "active";
pub const HIDDEN_TAGS_GROUP: &str = "hidden";
pub const EXPIRING_GROUP: &str = "expiring";

/// Built-in views in dependency order.
pub fn builtin_views(unseen: UnseenPolicy) -> Vec<Arc<dyn ViewDefinition>> {
    vec![
        Arc::new(ThreadInteractions),
        Arc::new(Threads),
        Arc::new(ThreadOutgoing),
        Arc::new(Unread),
        Arc::new(Unseen { policy: unseen }),
        Arc::new(Pinned),
        Arc::new(Tags),
        Arc::new(TagThreads),
        Arc::new(Participants),
        Arc::new(Expiring),
    ]
}

fn ms(value: u64) -> i64 {
    value.min(i64::MAX as u64) as i64
}

fn date_key(date: DateTime<Utc>) -> i64 {
    date.timestamp_millis()
}

fn by_timestamp(message: &Message) -> Placement {
    Placement::new(
        message.thread_id.clone(),
        SortKey::new().int(ms(message.timestamp)),
    )
}

// ---------------------------------------------------------------------------
// Message views
// ---------------------------------------------------------------------------

/// Every stored message, grouped by thread, oldest first.
pub struct ThreadInteractions;

impl ViewDefinition for ThreadInteractions {
    fn name(&self) -> &str {
        THREAD_INTERACTIONS
    }

    fn collection(&self) -> Collection {
        Collection::Interactions
    }

    fn classify(&self, record: &StoredRecord, _: &IndexState) -> Vec<Placement> {
        match record.as_message() {
            Some(m) if m.should_be_saved() => vec![by_timestamp(m)],
            _ => Vec::new(),
        }
    }
}

/// Outgoing subset of [`ThreadInteractions`], same ordering.
pub struct ThreadOutgoing;

impl ViewDefinition for ThreadOutgoing {
    fn name(&self) -> &str {
        THREAD_OUTGOING
    }

    fn collection(&self) -> Collection {
        Collection::Interactions
    }

    fn dependencies(&self) -> &[&'static str] {
        &[THREAD_INTERACTIONS]
    }

    fn classify(&self, record: &StoredRecord, index: &IndexState) -> Vec<Placement> {
        match record.as_message() {
            Some(m) if m.is_outgoing() => index
                .placements(THREAD_INTERACTIONS, &m.unique_id)
                .to_vec(),
            _ => Vec::new(),
        }
    }
}

pub struct Unread;

impl ViewDefinition for Unread {
    fn name(&self) -> &str {
        UNREAD
    }

    fn collection(&self) -> Collection {
        Collection::Interactions
    }

    fn classify(&self, record: &StoredRecord, _: &IndexState) -> Vec<Placement> {
        match record.as_message() {
            Some(m) if !m.was_read && m.should_affect_unread_counts() => vec![by_timestamp(m)],
            _ => Vec::new(),
        }
    }
}

pub struct Unseen {
    pub policy: UnseenPolicy,
}

impl ViewDefinition for Unseen {
    fn name(&self) -> &str {
        UNSEEN
    }

    fn collection(&self) -> Collection {
        Collection::Interactions
    }

    fn classify(&self, record: &StoredRecord, _: &IndexState) -> Vec<Placement> {
        let Some(m) = record.as_message() else {
            return Vec::new();
        };
        let member = match self.policy {
            UnseenPolicy::AllUnread => !m.was_read,
            UnseenPolicy::SameAsUnread => !m.was_read && m.should_affect_unread_counts(),
        };
        if member {
            vec![by_timestamp(m)]
        } else {
            Vec::new()
        }
    }
}

/// Messages with an armed timer, soonest expiry first.
pub struct Expiring;

impl ViewDefinition for Expiring {
    fn name(&self) -> &str {
        EXPIRING
    }

    fn collection(&self) -> Collection {
        Collection::Interactions
    }

    fn classify(&self, record: &StoredRecord, _: &IndexState) -> Vec<Placement> {
        record
            .as_message()
            .and_then(Message::expires_at)
            .map(|at| vec![Placement::new(EXPIRING_GROUP, SortKey::new().int(ms(at)))])
            .unwrap_or_default()
    }
}

// ---------------------------------------------------------------------------
// Thread views
// ---------------------------------------------------------------------------

/// Inbox / archive, most recent activity first.
pub struct Threads;

impl Threads {
    fn is_visible(thread: &Thread, index: &IndexState) -> bool {
        thread.has_ever_had_message || index.group_len(THREAD_INTERACTIONS, &thread.unique_id) > 0
    }
}

impl ViewDefinition for Threads {
    fn name(&self) -> &str {
        THREADS
    }

    fn collection(&self) -> Collection {
        Collection::Threads
    }

    fn dependencies(&self) -> &[&'static str] {
        &[THREAD_INTERACTIONS]
    }

    fn classify(&self, record: &StoredRecord, index: &IndexState) -> Vec<Placement> {
        match record.as_thread() {
            Some(t) if Self::is_visible(t, index) => {
                let group = if t.is_archived() {
                    ARCHIVE_GROUP
                } else {
                    INBOX_GROUP
                };
                vec![Placement::new(
                    group,
                    SortKey::new().desc(date_key(t.last_activity())),
                )]
            }
            _ => Vec::new(),
        }
    }
}

pub struct Pinned;

impl ViewDefinition for Pinned {
    fn name(&self) -> &str {
        PINNED
    }

    fn collection(&self) -> Collection {
        Collection::Threads
    }

    fn classify(&self, record: &StoredRecord, _: &IndexState) -> Vec<Placement> {
        record
            .as_thread()
            .and_then(|t| t.pin_position)
            .map(|pos| vec![Placement::new(PINNED_GROUP, SortKey::new().int(pos))])
            .unwrap_or_default()
    }
}

/// Threads grouped by each tag slug their expression references.
pub struct TagThreads;

impl ViewDefinition for TagThreads {
    fn name(&self) -> &str {
        TAG_THREADS
    }

    fn collection(&self) -> Collection {
        Collection::Threads
    }

    fn classify(&self, record: &StoredRecord, _: &IndexState) -> Vec<Placement> {
        let Some(thread) = record.as_thread() else {
            return Vec::new();
        };
        let key = SortKey::new().desc(date_key(thread.last_activity()));
        thread
            .tag_slugs()
            .into_iter()
            .map(|slug| Placement::new(slug, key.clone()))
            .collect()
    }
}

/// Threads keyed by their canonical participant set, oldest first.
pub struct Participants;

impl ViewDefinition for Participants {
    fn name(&self) -> &str {
        PARTICIPANTS
    }

    fn collection(&self) -> Collection {
        Collection::Threads
    }

    fn classify(&self, record: &StoredRecord, _: &IndexState) -> Vec<Placement> {
        match record.as_thread() {
            Some(t) if !t.participant_ids.is_empty() => vec![Placement::new(
                t.participant_key(),
                SortKey::new().int(date_key(t.created_at)),
            )],
            _ => Vec::new(),
        }
    }
}

// ---------------------------------------------------------------------------
// Tags
// ---------------------------------------------------------------------------

pub struct Tags;

impl ViewDefinition for Tags {
    fn name(&self) -> &str {
        TAGS
    }

    fn collection(&self) -> Collection {
        Collection::Tags
    }

    fn classify(&self, record: &StoredRecord, _: &IndexState) -> Vec<Placement> {
        record
            .as_tag()
            .map(|tag| {
                let group = if tag.hidden {
                    HIDDEN_TAGS_GROUP
                } else {
                    ACTIVE_TAGS_GROUP
                };
                vec![Placement::new(group, SortKey::new().text(tag.slug.clone()))]
            })
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{MessageKind, OutgoingState, Tag};
    use relay_shared::RecipientId;

    fn rid(s: &str) -> RecipientId {
        RecipientId::from(s)
    }

    #[test]
    fn registration_order_respects_dependencies() {
        let views = builtin_views(UnseenPolicy::default());
        let names: Vec<&str> = views.iter().map(|v| v.name()).collect();
        for (i, view) in views.iter().enumerate() {
            for dep in view.dependencies() {
                let pos = names.iter().position(|n| n == dep).unwrap();
                assert!(pos < i, "{} registered before {}", view.name(), dep);
            }
        }
    }

    #[test]
    fn thread_hidden_until_it_has_messages() {
        let index = IndexState::default();
        let mut thread = Thread::new("t", &[rid("a")]);
        let record = StoredRecord::Thread(thread.clone());
        assert!(Threads.classify(&record, &index).is_empty());

        thread.has_ever_had_message = true;
        thread.archival_date = Some(Utc::now());
        let placements = Threads.classify(&StoredRecord::Thread(thread), &index);
        assert_eq!(placements[0].group, ARCHIVE_GROUP);
    }

    #[test]
    fn unseen_policy_controls_membership() {
        let index = IndexState::default();
        let info = StoredRecord::Message(Message::info("t", 1, "joined"));
        assert!(Unread.classify(&info, &index).is_empty());
        assert_eq!(
            Unseen {
                policy: UnseenPolicy::AllUnread
            }
            .classify(&info, &index)
            .len(),
            1
        );
        assert!(Unseen {
            policy: UnseenPolicy::SameAsUnread
        }
        .classify(&info, &index)
        .is_empty());
    }

    #[test]
    fn expiring_only_when_armed() {
        let index = IndexState::default();
        let mut message = Message::incoming("t", rid("a"), 1, 1, None).with_expiration(5);
        assert!(Expiring
            .classify(&StoredRecord::Message(message.clone()), &index)
            .is_empty());
        message.expire_started_at = 10;
        let placements = Expiring.classify(&StoredRecord::Message(message), &index);
        assert_eq!(placements[0].key, SortKey::new().int(5_010));
    }

    #[test]
    fn read_receipts_never_indexed() {
        let index = IndexState::default();
        let mut receipts = Message::read_receipts("t", vec![1]);
        receipts.was_read = false;
        let record = StoredRecord::Message(receipts);
        assert!(ThreadInteractions.classify(&record, &index).is_empty());
        assert!(Unread.classify(&record, &index).is_empty());
    }

    #[test]
    fn outgoing_follows_thread_interactions() {
        let index = IndexState::default();
        let thread = Thread::new("t", &[rid("a")]);
        let mut message = Message::outgoing(&thread, "x");
        message.kind = MessageKind::Outgoing {
            state: OutgoingState::Sent,
        };
        // Not yet placed in the dependency view.
        assert!(ThreadOutgoing
            .classify(&StoredRecord::Message(message), &index)
            .is_empty());
    }

    #[test]
    fn tags_group_by_visibility() {
        let index = IndexState::default();
        let mut tag = Tag::new("Ops");
        tag.hidden = true;
        let placements = Tags.classify(&StoredRecord::Tag(tag), &index);
        assert_eq!(placements[0].group, HIDDEN_TAGS_GROUP);
        assert_eq!(placements[0].key, SortKey::new().text("ops"));
    }

    #[test]
    fn tag_threads_place_in_every_referenced_tag() {
        let index = IndexState::default();
        let mut thread = Thread::new("t", &[rid("a")]);
        thread.universal_expression = Some("@ops + @dev".into());
        let groups: Vec<String> = TagThreads
            .classify(&StoredRecord::Thread(thread), &index)
            .into_iter()
            .map(|p| p.group)
            .collect();
        assert_eq!(groups, vec!["dev", "ops"]);
    }
}
