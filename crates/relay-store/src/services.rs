//! Collaborators the store talks to but does not implement: contact
//! directory, message transport, call signaling and user notifications.
//! Call sites hold them as trait objects inside the
//! [`Environment`](crate::environment::Environment).

use std::cmp::Ordering;

use serde_json::Value;
use thiserror::Error;

use relay_shared::RecipientId;

use crate::models::{Message, Thread};

/// Contact / profile directory.
pub trait ContactsManager: Send + Sync {
    /// Known name for `id`, if the directory has one.
    fn display_name(&self, id: &RecipientId) -> Option<String>;

    fn all_recipients(&self) -> Vec<RecipientId>;

    fn is_system_contact(&self, id: &RecipientId) -> bool;

    /// Known name, else the short form of the id.
    fn display_name_or_id(&self, id: &RecipientId) -> String {
        self.display_name(id)
            .unwrap_or_else(|| id.short().to_string())
    }

    /// Ordering used when listing recipients.
    fn compare(&self, a: &RecipientId, b: &RecipientId) -> Ordering {
        self.display_name_or_id(a)
            .to_lowercase()
            .cmp(&self.display_name_or_id(b).to_lowercase())
            .then_with(|| a.cmp(b))
    }
}

/// Why a send did not go through.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SendError {
    #[error("Transport error: {0}")]
    Transport(String),

    #[error("No recipients to deliver to")]
    NoRecipients,

    #[error("Untrusted identity for {0}")]
    UntrustedIdentity(RecipientId),
}

pub type SendCompletion = Box<dyn FnOnce(std::result::Result<(), SendError>) + Send + 'static>;

/// Outbound transport.  `send` returns immediately; `completion` is called
/// exactly once, from any thread, when the outcome is known.
pub trait MessageSender: Send + Sync {
    fn send(&self, message: Message, thread: Thread, completion: SendCompletion);
}

/// Conference call signaling, keyed by thread, call id and peer id.
pub trait CallMessageHandler: Send + Sync {
    fn received_join(
        &self,
        thread: &Thread,
        sender: &RecipientId,
        device_id: u32,
        originator: &RecipientId,
        call_id: &str,
    );

    fn received_offer(
        &self,
        thread: &Thread,
        sender: &RecipientId,
        device_id: u32,
        call_id: &str,
        peer_id: &str,
        session_description: &str,
    );

    fn received_accept_offer(
        &self,
        thread: &Thread,
        call_id: &str,
        peer_id: &str,
        session_description: &str,
    );

    fn received_ice_candidates(
        &self,
        thread: &Thread,
        sender: &RecipientId,
        device_id: u32,
        call_id: &str,
        candidates: &[Value],
    );

    fn received_leave(&self, thread: &Thread, sender: &RecipientId, device_id: u32, call_id: &str);
}

/// User-facing notification presenter.
pub trait NotificationsManager: Send + Sync {
    fn notify_incoming(&self, thread: &Thread, message: &Message, sender_name: &str);

    fn clear_all(&self);
}

// ---------------------------------------------------------------------------
// No-op implementations
// ---------------------------------------------------------------------------

/// Directory with no entries.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopContactsManager;

impl ContactsManager for NoopContactsManager {
    fn display_name(&self, _id: &RecipientId) -> Option<String> {
        None
    }

    fn all_recipients(&self) -> Vec<RecipientId> {
        Vec::new()
    }

    fn is_system_contact(&self, _id: &RecipientId) -> bool {
        false
    }
}

/// Reports every send as delivered without transmitting anything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopMessageSender;

impl MessageSender for NoopMessageSender {
    fn send(&self, message: Message, _thread: Thread, completion: SendCompletion) {
        tracing::debug!(message = %message.unique_id, "noop sender: reporting success");
        completion(Ok(()));
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoopCallMessageHandler;

impl CallMessageHandler for NoopCallMessageHandler {
    fn received_join(&self, thread: &Thread, _: &RecipientId, _: u32, _: &RecipientId, call_id: &str) {
        tracing::debug!(thread = %thread.unique_id, call = %call_id, "ignoring call join");
    }

    fn received_offer(&self, thread: &Thread, _: &RecipientId, _: u32, call_id: &str, _: &str, _: &str) {
        tracing::debug!(thread = %thread.unique_id, call = %call_id, "ignoring call offer");
    }

    fn received_accept_offer(&self, thread: &Thread, call_id: &str, _: &str, _: &str) {
        tracing::debug!(thread = %thread.unique_id, call = %call_id, "ignoring call answer");
    }

    fn received_ice_candidates(&self, thread: &Thread, _: &RecipientId, _: u32, call_id: &str, _: &[Value]) {
        tracing::debug!(thread = %thread.unique_id, call = %call_id, "ignoring ice candidates");
    }

    fn received_leave(&self, thread: &Thread, _: &RecipientId, _: u32, call_id: &str) {
        tracing::debug!(thread = %thread.unique_id, call = %call_id, "ignoring call leave");
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoopNotificationsManager;

impl NotificationsManager for NoopNotificationsManager {
    fn notify_incoming(&self, _thread: &Thread, _message: &Message, _sender_name: &str) {}

    fn clear_all(&self) {}
}
