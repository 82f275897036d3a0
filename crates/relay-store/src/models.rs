//! Domain records persisted in the store.
//!
//! Every struct derives `Serialize` and `Deserialize` so it can be encoded
//! into the `records` table with bincode.  Dates that describe user-facing
//! state use `DateTime<Utc>`; protocol timestamps (the message ordering key,
//! expiration timers) stay in milliseconds since the epoch.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use relay_shared::constants::QUOTE_EXCERPT_CHARS;
use relay_shared::protocol::AttachmentPointer;
use relay_shared::types::{new_unique_id, now_millis};
use relay_shared::{RecipientId, ThreadType};

// ---------------------------------------------------------------------------
// CountedSet
// ---------------------------------------------------------------------------

/// Multiset of recipients; each id is present until removed as many times as
/// it was added.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CountedSet(BTreeMap<RecipientId, u32>);

impl CountedSet {
    pub fn insert(&mut self, id: RecipientId) {
        *self.0.entry(id).or_insert(0) += 1;
    }

    /// Decrement the count for `id`; returns true when it dropped out.
    pub fn remove(&mut self, id: &RecipientId) -> bool {
        match self.0.get_mut(id) {
            Some(count) if *count > 1 => {
                *count -= 1;
                false
            }
            Some(_) => {
                self.0.remove(id);
                true
            }
            None => false,
        }
    }

    pub fn count(&self, id: &RecipientId) -> u32 {
        self.0.get(id).copied().unwrap_or(0)
    }

    pub fn contains(&self, id: &RecipientId) -> bool {
        self.0.contains_key(id)
    }

    /// Distinct members.
    pub fn iter(&self) -> impl Iterator<Item = &RecipientId> {
        self.0.keys()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Thread
// ---------------------------------------------------------------------------

/// A conversation, one-to-one or group.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Thread {
    pub unique_id: String,
    pub title: Option<String>,
    pub thread_type: ThreadType,
    /// Ordered set: insertion order is kept, duplicates are rejected.
    pub participant_ids: Vec<RecipientId>,
    pub has_ever_had_message: bool,
    /// Non-null means archived.
    pub archival_date: Option<DateTime<Utc>>,
    pub muted_until: Option<DateTime<Utc>>,
    pub draft: Option<String>,
    pub pin_position: Option<i64>,
    pub monitor_ids: CountedSet,
    pub universal_expression: Option<String>,
    pub pretty_expression: Option<String>,
    /// Seconds; 0 disables disappearing messages.
    pub disappearing_duration: u32,
    pub created_at: DateTime<Utc>,
    pub last_message_id: Option<String>,
    pub last_message_text: Option<String>,
    pub last_message_date: Option<DateTime<Utc>>,
}

impl Thread {
    pub fn new(unique_id: impl Into<String>, participants: &[RecipientId]) -> Self {
        let mut thread = Self {
            unique_id: unique_id.into(),
            title: None,
            thread_type: ThreadType::Conversation,
            participant_ids: Vec::new(),
            has_ever_had_message: false,
            archival_date: None,
            muted_until: None,
            draft: None,
            pin_position: None,
            monitor_ids: CountedSet::default(),
            universal_expression: None,
            pretty_expression: None,
            disappearing_duration: 0,
            created_at: Utc::now(),
            last_message_id: None,
            last_message_text: None,
            last_message_date: None,
        };
        thread.add_participants(participants.iter().cloned());
        thread
    }

    pub fn with_participants(participants: &[RecipientId]) -> Self {
        Self::new(new_unique_id(), participants)
    }

    /// Append participants not already present; returns how many were added.
    pub fn add_participants(&mut self, ids: impl IntoIterator<Item = RecipientId>) -> usize {
        let mut added = 0;
        for id in ids {
            if !self.participant_ids.contains(&id) {
                self.participant_ids.push(id);
                added += 1;
            }
        }
        added
    }

    pub fn remove_participants(&mut self, ids: &[RecipientId]) -> usize {
        let before = self.participant_ids.len();
        self.participant_ids.retain(|p| !ids.contains(p));
        before - self.participant_ids.len()
    }

    pub fn is_archived(&self) -> bool {
        self.archival_date.is_some()
    }

    pub fn is_muted(&self, now: DateTime<Utc>) -> bool {
        self.muted_until.map_or(false, |until| until > now)
    }

    pub fn is_pinned(&self) -> bool {
        self.pin_position.is_some()
    }

    pub fn is_one_on_one(&self, local: &RecipientId) -> bool {
        self.participant_ids.len() == 2 && self.participant_ids.contains(local)
    }

    pub fn other_participant(&self, local: &RecipientId) -> Option<&RecipientId> {
        if !self.is_one_on_one(local) {
            return None;
        }
        self.participant_ids.iter().find(|p| *p != local)
    }

    /// Order-insensitive key identifying the participant set.
    pub fn participant_key(&self) -> String {
        participant_key(&self.participant_ids)
    }

    pub fn has_participants(&self, ids: &[RecipientId]) -> bool {
        self.participant_key() == participant_key(ids)
    }

    /// Date of the last visible message, or creation date if there is none.
    pub fn last_activity(&self) -> DateTime<Utc> {
        self.last_message_date.unwrap_or(self.created_at)
    }

    /// Tag slugs referenced by `@slug` tokens of the universal expression.
    pub fn tag_slugs(&self) -> BTreeSet<String> {
        self.universal_expression
            .as_deref()
            .map(tag_slugs)
            .unwrap_or_default()
    }
}

/// Canonical participant key: sorted, de-duplicated ids joined by `,`.
pub fn participant_key(ids: &[RecipientId]) -> String {
    let set: BTreeSet<&str> = ids.iter().map(RecipientId::as_str).collect();
    set.into_iter().collect::<Vec<_>>().join(",")
}

/// Extract `@slug` tokens from a tag expression.
pub fn tag_slugs(expression: &str) -> BTreeSet<String> {
    let mut slugs = BTreeSet::new();
    let mut chars = expression.char_indices().peekable();
    while let Some((_, c)) = chars.next() {
        if c != '@' {
            continue;
        }
        let mut slug = String::new();
        while let Some(&(_, next)) = chars.peek() {
            if next.is_ascii_alphanumeric() || matches!(next, '.' | '-' | '_' | ':') {
                slug.push(next.to_ascii_lowercase());
                chars.next();
            } else {
                break;
            }
        }
        if !slug.is_empty() {
            slugs.insert(slug);
        }
    }
    slugs
}

// ---------------------------------------------------------------------------
// Message
// ---------------------------------------------------------------------------

/// Delivery state of an outgoing message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum OutgoingState {
    Sending,
    Sent,
    Failed { reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageKind {
    Incoming {
        author_id: RecipientId,
        source_device_id: u32,
    },
    Outgoing {
        state: OutgoingState,
    },
    Call {
        missed: bool,
    },
    /// Local record of a delivery problem (e.g. a payload that failed to decrypt).
    Error {
        description: String,
    },
    Info {
        text: String,
    },
    /// Batch of read receipts; transmitted, never saved.
    ReadReceipts {
        timestamps: Vec<u64>,
    },
    /// Tells the other participants about a new disappearing duration;
    /// transmitted, never saved.
    ExpirationUpdate {
        seconds: u32,
    },
}

/// Snapshot of the message being replied to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuotedMessage {
    pub message_id: String,
    pub timestamp: u64,
    pub author_id: Option<RecipientId>,
    pub excerpt: String,
    pub thumbnail_attachment_id: Option<String>,
}

impl QuotedMessage {
    pub fn from_message(message: &Message, local: &RecipientId) -> Self {
        let author_id = match &message.kind {
            MessageKind::Incoming { author_id, .. } => Some(author_id.clone()),
            MessageKind::Outgoing { .. } => Some(local.clone()),
            _ => None,
        };
        Self {
            message_id: message.unique_id.clone(),
            timestamp: message.timestamp,
            author_id,
            excerpt: message
                .body
                .as_deref()
                .unwrap_or_default()
                .chars()
                .take(QUOTE_EXCERPT_CHARS)
                .collect(),
            thumbnail_attachment_id: message.attachment_ids.first().cloned(),
        }
    }
}

type PayloadFn = dyn Fn(&RecipientId) -> Bytes + Send + Sync;

/// Per-recipient payload generator for dynamic outgoing messages.
#[derive(Clone)]
pub struct DynamicPayload(Arc<PayloadFn>);

impl DynamicPayload {
    pub fn new(f: impl Fn(&RecipientId) -> Bytes + Send + Sync + 'static) -> Self {
        Self(Arc::new(f))
    }

    pub fn render(&self, recipient: &RecipientId) -> Bytes {
        (self.0)(recipient)
    }
}

impl fmt::Debug for DynamicPayload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("DynamicPayload(..)")
    }
}

impl PartialEq for DynamicPayload {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

/// An interaction within a thread.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub unique_id: String,
    /// Back-reference, resolved through the store.
    pub thread_id: String,
    /// Sender-assigned ms timestamp; the ordering key.
    pub timestamp: u64,
    pub received_at: u64,
    pub body: Option<String>,
    pub attachment_ids: Vec<String>,
    pub expires_in_seconds: u32,
    /// 0 until the expiration timer is armed.
    pub expire_started_at: u64,
    pub quoted_message: Option<QuotedMessage>,
    pub was_read: bool,
    pub kind: MessageKind,
    #[serde(skip)]
    pub dynamic_payload: Option<DynamicPayload>,
}

impl Message {
    fn base(thread_id: &str, timestamp: u64, kind: MessageKind, was_read: bool) -> Self {
        Self {
            unique_id: new_unique_id(),
            thread_id: thread_id.to_string(),
            timestamp,
            received_at: now_millis(),
            body: None,
            attachment_ids: Vec::new(),
            expires_in_seconds: 0,
            expire_started_at: 0,
            quoted_message: None,
            was_read,
            kind,
            dynamic_payload: None,
        }
    }

    /// Outgoing message stamped now, inheriting the thread's disappearing
    /// duration.
    pub fn outgoing(thread: &Thread, body: impl Into<String>) -> Self {
        let mut message = Self::base(
            &thread.unique_id,
            now_millis(),
            MessageKind::Outgoing {
                state: OutgoingState::Sending,
            },
            true,
        );
        message.body = Some(body.into());
        message.expires_in_seconds = thread.disappearing_duration;
        message
    }

    /// Outgoing message whose body is computed per recipient at send time.
    pub fn dynamic(thread: &Thread, payload: DynamicPayload) -> Self {
        let mut message = Self::base(
            &thread.unique_id,
            now_millis(),
            MessageKind::Outgoing {
                state: OutgoingState::Sending,
            },
            true,
        );
        message.dynamic_payload = Some(payload);
        message.expires_in_seconds = thread.disappearing_duration;
        message
    }

    pub fn incoming(
        thread_id: &str,
        author_id: RecipientId,
        source_device_id: u32,
        timestamp: u64,
        body: Option<String>,
    ) -> Self {
        let mut message = Self::base(
            thread_id,
            timestamp,
            MessageKind::Incoming {
                author_id,
                source_device_id,
            },
            false,
        );
        message.body = body;
        message
    }

    pub fn info(thread_id: &str, timestamp: u64, text: impl Into<String>) -> Self {
        Self::base(
            thread_id,
            timestamp,
            MessageKind::Info { text: text.into() },
            false,
        )
    }

    pub fn error(thread_id: &str, timestamp: u64, description: impl Into<String>) -> Self {
        Self::base(
            thread_id,
            timestamp,
            MessageKind::Error {
                description: description.into(),
            },
            false,
        )
    }

    pub fn call(thread_id: &str, timestamp: u64, missed: bool) -> Self {
        Self::base(thread_id, timestamp, MessageKind::Call { missed }, !missed)
    }

    pub fn read_receipts(thread_id: &str, timestamps: Vec<u64>) -> Self {
        Self::base(
            thread_id,
            now_millis(),
            MessageKind::ReadReceipts { timestamps },
            true,
        )
    }

    /// Carries `seconds` both in the kind and as the message's own
    /// duration so receivers apply it like any expiring message.
    pub fn expiration_update(thread: &Thread, seconds: u32) -> Self {
        let mut message = Self::base(
            &thread.unique_id,
            now_millis(),
            MessageKind::ExpirationUpdate { seconds },
            true,
        );
        message.expires_in_seconds = seconds;
        message
    }

    pub fn with_id(mut self, unique_id: impl Into<String>) -> Self {
        self.unique_id = unique_id.into();
        self
    }

    pub fn with_attachments(mut self, ids: Vec<String>) -> Self {
        self.attachment_ids = ids;
        self
    }

    pub fn with_expiration(mut self, seconds: u32) -> Self {
        self.expires_in_seconds = seconds;
        self
    }

    pub fn with_quote(mut self, quote: QuotedMessage) -> Self {
        self.quoted_message = Some(quote);
        self
    }

    pub fn is_outgoing(&self) -> bool {
        matches!(self.kind, MessageKind::Outgoing { .. })
    }

    pub fn is_incoming(&self) -> bool {
        matches!(self.kind, MessageKind::Incoming { .. })
    }

    pub fn author_id(&self) -> Option<&RecipientId> {
        match &self.kind {
            MessageKind::Incoming { author_id, .. } => Some(author_id),
            _ => None,
        }
    }

    pub fn outgoing_state(&self) -> Option<&OutgoingState> {
        match &self.kind {
            MessageKind::Outgoing { state } => Some(state),
            _ => None,
        }
    }

    /// Read receipts, expiration updates and dynamic messages are sent
    /// without being stored.
    pub fn should_be_saved(&self) -> bool {
        !matches!(
            self.kind,
            MessageKind::ReadReceipts { .. } | MessageKind::ExpirationUpdate { .. }
        ) && self.dynamic_payload.is_none()
    }

    pub fn should_affect_unread_counts(&self) -> bool {
        match &self.kind {
            MessageKind::Incoming { .. } | MessageKind::Error { .. } => true,
            MessageKind::Call { missed } => *missed,
            _ => false,
        }
    }

    /// Outgoing messages once sent, incoming ones once read; never twice.
    pub fn should_start_expire_timer(&self) -> bool {
        if self.expires_in_seconds == 0 || self.expire_started_at != 0 {
            return false;
        }
        match &self.kind {
            MessageKind::Outgoing { state } => *state == OutgoingState::Sent,
            MessageKind::Incoming { .. } => self.was_read,
            _ => false,
        }
    }

    pub fn is_expiring(&self) -> bool {
        self.expires_in_seconds > 0
    }

    /// `None` while the timer is not armed.
    pub fn expires_at(&self) -> Option<u64> {
        if self.expire_started_at == 0 || self.expires_in_seconds == 0 {
            return None;
        }
        Some(
            self.expire_started_at
                .saturating_add(u64::from(self.expires_in_seconds) * 1000),
        )
    }

    pub fn has_expired(&self, now: u64) -> bool {
        self.expires_at().map_or(false, |at| at <= now)
    }

    /// Text shown as a thread's last-message preview.
    pub fn preview_text(&self) -> String {
        if let Some(body) = self.body.as_deref().filter(|b| !b.is_empty()) {
            return body.to_string();
        }
        match &self.kind {
            MessageKind::Error { description } => description.clone(),
            MessageKind::Info { text } => text.clone(),
            MessageKind::Call { missed: true } => "Missed call".to_string(),
            MessageKind::Call { missed: false } => "Call".to_string(),
            _ if !self.attachment_ids.is_empty() => "Attachment".to_string(),
            _ => String::new(),
        }
    }

    pub fn payload_for(&self, recipient: &RecipientId) -> Option<Bytes> {
        self.dynamic_payload.as_ref().map(|p| p.render(recipient))
    }
}

// ---------------------------------------------------------------------------
// Attachment
// ---------------------------------------------------------------------------

/// A blob reference shared by the messages listed in `message_ids`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attachment {
    pub unique_id: String,
    pub content_type: String,
    pub byte_count: u64,
    pub source_filename: Option<String>,
    /// BLAKE3 hash of the content, hex encoded.
    pub content_hash: Option<String>,
    pub local_path: Option<PathBuf>,
    pub message_ids: BTreeSet<String>,
    pub created_at: DateTime<Utc>,
}

impl Attachment {
    pub fn new(content_type: impl Into<String>, byte_count: u64) -> Self {
        Self {
            unique_id: new_unique_id(),
            content_type: content_type.into(),
            byte_count,
            source_filename: None,
            content_hash: None,
            local_path: None,
            message_ids: BTreeSet::new(),
            created_at: Utc::now(),
        }
    }

    /// Metadata-only attachment for a pointer delivered with an envelope.
    pub fn from_pointer(pointer: &AttachmentPointer) -> Self {
        let mut attachment = Self::new(pointer.content_type.clone(), pointer.size);
        attachment.unique_id = pointer.id.clone();
        attachment.source_filename = pointer.file_name.clone();
        attachment
    }

    pub fn is_referenced(&self) -> bool {
        !self.message_ids.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Tag
// ---------------------------------------------------------------------------

/// A directory group definition referenced from thread expressions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tag {
    pub unique_id: String,
    pub slug: String,
    pub description: Option<String>,
    pub recipient_ids: Vec<RecipientId>,
    pub hidden: bool,
}

impl Tag {
    pub fn new(slug: impl Into<String>) -> Self {
        Self {
            unique_id: new_unique_id(),
            slug: slug.into().to_ascii_lowercase(),
            description: None,
            recipient_ids: Vec::new(),
            hidden: false,
        }
    }
}
