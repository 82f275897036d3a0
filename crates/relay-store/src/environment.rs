//! Process-wide wiring: the store plus the collaborators it talks to.
//!
//! An [`Environment`] is built once at startup and passed down explicitly.
//! Cloning is cheap; every clone shares the same store and collaborators.

use std::sync::Arc;

use relay_shared::RecipientId;

use crate::database::Database;
use crate::error::Result;
use crate::models::Thread;
use crate::services::{
    CallMessageHandler, ContactsManager, MessageSender, NoopCallMessageHandler, NoopContactsManager,
    NoopMessageSender, NoopNotificationsManager, NotificationsManager,
};
use crate::threads;

#[derive(Clone)]
pub struct Environment {
    db: Arc<Database>,
    local_id: RecipientId,
    contacts: Arc<dyn ContactsManager>,
    sender: Arc<dyn MessageSender>,
    calls: Arc<dyn CallMessageHandler>,
    notifications: Arc<dyn NotificationsManager>,
}

impl std::fmt::Debug for Environment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Environment")
            .field("database", &self.db.files().database)
            .field("local_id", &self.local_id)
            .finish_non_exhaustive()
    }
}

/// Collaborators left unset fall back to their no-op implementations.
pub struct EnvironmentBuilder {
    db: Arc<Database>,
    local_id: RecipientId,
    contacts: Option<Arc<dyn ContactsManager>>,
    sender: Option<Arc<dyn MessageSender>>,
    calls: Option<Arc<dyn CallMessageHandler>>,
    notifications: Option<Arc<dyn NotificationsManager>>,
}

impl EnvironmentBuilder {
    pub fn contacts(mut self, contacts: Arc<dyn ContactsManager>) -> Self {
        self.contacts = Some(contacts);
        self
    }

    pub fn message_sender(mut self, sender: Arc<dyn MessageSender>) -> Self {
        self.sender = Some(sender);
        self
    }

    pub fn call_handler(mut self, calls: Arc<dyn CallMessageHandler>) -> Self {
        self.calls = Some(calls);
        self
    }

    pub fn notifications(mut self, notifications: Arc<dyn NotificationsManager>) -> Self {
        self.notifications = Some(notifications);
        self
    }

    pub fn build(self) -> Environment {
        Environment {
            db: self.db,
            local_id: self.local_id,
            contacts: self.contacts.unwrap_or_else(|| Arc::new(NoopContactsManager)),
            sender: self.sender.unwrap_or_else(|| Arc::new(NoopMessageSender)),
            calls: self.calls.unwrap_or_else(|| Arc::new(NoopCallMessageHandler)),
            notifications: self
                .notifications
                .unwrap_or_else(|| Arc::new(NoopNotificationsManager)),
        }
    }
}

impl Environment {
    pub fn builder(db: Arc<Database>, local_id: RecipientId) -> EnvironmentBuilder {
        EnvironmentBuilder {
            db,
            local_id,
            contacts: None,
            sender: None,
            calls: None,
            notifications: None,
        }
    }

    pub fn database(&self) -> &Arc<Database> {
        &self.db
    }

    pub fn local_id(&self) -> &RecipientId {
        &self.local_id
    }

    pub fn contacts(&self) -> &Arc<dyn ContactsManager> {
        &self.contacts
    }

    pub fn message_sender(&self) -> &Arc<dyn MessageSender> {
        &self.sender
    }

    pub fn call_handler(&self) -> &Arc<dyn CallMessageHandler> {
        &self.calls
    }

    pub fn notifications(&self) -> &Arc<dyn NotificationsManager> {
        &self.notifications
    }

    pub fn display_name(&self, thread: &Thread) -> String {
        threads::display_name(thread, &self.local_id, self.contacts.as_ref())
    }

    /// Drop every record and pending user notification, returning the store
    /// to an empty state.  Registered views stay registered.
    pub fn reinitialize(&self) -> Result<usize> {
        let removed = self.db.remove_all_records()?;
        self.notifications.clear_all();
        tracing::info!(removed, "environment reinitialized");
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::Collection;
    use crate::test_support::{open_store, rid};
    use crate::transaction::ReadAccess;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct CountingNotifications {
        cleared: AtomicUsize,
    }

    impl NotificationsManager for CountingNotifications {
        fn notify_incoming(&self, _: &Thread, _: &crate::models::Message, _: &str) {}

        fn clear_all(&self) {
            self.cleared.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn reinitialize_empties_store_and_clears_notifications() {
        let (_dir, db) = open_store();
        let notifications = Arc::new(CountingNotifications::default());
        let env = Environment::builder(db, rid("me"))
            .notifications(notifications.clone())
            .build();

        env.database()
            .write(|txn| txn.get_or_create_thread_with_participants(&[rid("me"), rid("a")]))
            .unwrap();
        assert_eq!(env.reinitialize().unwrap(), 1);
        assert_eq!(notifications.cleared.load(Ordering::SeqCst), 1);
        assert_eq!(
            env.database().read(|txn| txn.count(Collection::Threads)).unwrap(),
            0
        );
    }

    #[test]
    fn display_name_uses_contacts() {
        let (_dir, db) = open_store();
        let env = Environment::builder(db, rid("me")).build();
        let thread = Thread::new("t", &[rid("me"), rid("someone-long-id")]);
        assert_eq!(env.display_name(&thread), "someone-");
    }
}
