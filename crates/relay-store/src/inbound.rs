//! Inbound envelope processing.
//!
//! Each envelope is handled in its own write transaction.  Delivering the
//! same message id twice fails that transaction on the duplicate id and is
//! reported as already processed.

use chrono::Utc;

use relay_shared::protocol::{Envelope, MessageType, Payload};
use relay_shared::types::new_unique_id;

use crate::attachments::AttachmentQueries;
use crate::control::ControlOutcome;
use crate::environment::Environment;
use crate::error::{Result, StoreError};
use crate::messages::MessageQueries;
use crate::models::{Attachment, Message, QuotedMessage};
use crate::record::Collection;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundOutcome {
    Saved { thread_id: String, message_id: String },
    Duplicate { message_id: String },
    Control(ControlOutcome),
    /// Malformed or unsupported; nothing stored.
    Ignored,
}

impl Environment {
    pub fn process_envelope(&self, envelope: &Envelope) -> Result<InboundOutcome> {
        let payload = match Payload::parse(&envelope.payload) {
            Ok(payload) => payload,
            Err(e) => {
                tracing::warn!(sender = %envelope.source, error = %e, "dropping unreadable payload");
                return Ok(InboundOutcome::Ignored);
            }
        };

        match payload.message_type {
            MessageType::Content => self.process_content(envelope, &payload),
            MessageType::Control => {
                let sender_name = self.contacts().display_name_or_id(&envelope.source);
                let calls = self.call_handler();
                let outcome = self
                    .database()
                    .write(|txn| txn.apply_control(envelope, &payload, &sender_name, calls))?;
                Ok(InboundOutcome::Control(outcome))
            }
            other => {
                tracing::debug!(message_type = ?other, sender = %envelope.source, "ignoring unsupported message type");
                Ok(InboundOutcome::Ignored)
            }
        }
    }

    fn process_content(&self, envelope: &Envelope, payload: &Payload) -> Result<InboundOutcome> {
        let message_id = payload.message_id.clone().unwrap_or_else(new_unique_id);
        let local_id = self.local_id().clone();

        let written = self.database().write(|txn| {
            let Some(thread) = txn.get_or_create_thread_from_payload(payload.raw())? else {
                return Ok(None);
            };

            for pointer in &envelope.attachments {
                if txn.attachment(&pointer.id)?.is_none() {
                    txn.save_attachment(&Attachment::from_pointer(pointer))?;
                }
            }

            let mut message = Message::incoming(
                &thread.unique_id,
                envelope.source.clone(),
                envelope.source_device,
                envelope.timestamp,
                payload.body_text(),
            )
            .with_id(message_id.clone())
            .with_attachments(envelope.attachments.iter().map(|p| p.id.clone()).collect())
            .with_expiration(payload.expiration_secs());

            if let Some(reference) = &payload.message_ref {
                if let Some(quoted) = txn.message(reference)? {
                    message = message.with_quote(QuotedMessage::from_message(&quoted, &local_id));
                }
            }

            if message.expires_in_seconds != thread.disappearing_duration {
                txn.set_disappearing_duration(&thread.unique_id, message.expires_in_seconds)?;
            }
            txn.save_message(&message)?;
            Ok(Some((thread, message)))
        });

        match written {
            Ok(Some((thread, message))) => {
                if thread.is_muted(Utc::now()) {
                    tracing::debug!(thread = %thread.unique_id, "thread muted, notification suppressed");
                } else if message.author_id() != Some(self.local_id()) {
                    let sender_name = self.contacts().display_name_or_id(&envelope.source);
                    self.notifications().notify_incoming(&thread, &message, &sender_name);
                }
                tracing::debug!(thread = %thread.unique_id, message = %message.unique_id, "incoming message stored");
                Ok(InboundOutcome::Saved {
                    thread_id: thread.unique_id,
                    message_id: message.unique_id,
                })
            }
            Ok(None) => {
                tracing::warn!(sender = %envelope.source, "content message without a usable thread");
                Ok(InboundOutcome::Ignored)
            }
            Err(StoreError::DuplicateId {
                collection: Collection::Interactions,
                id,
            }) => {
                tracing::info!(message = %id, "message already processed");
                Ok(InboundOutcome::Duplicate { message_id: id })
            }
            Err(e) => Err(e),
        }
    }

    /// Record that an envelope from `envelope.source` could not be
    /// decrypted, as an error interaction in the one-to-one thread with the
    /// sender.  Returns the error message id.
    pub fn record_decryption_failure(&self, envelope: &Envelope, reason: &str) -> Result<String> {
        let participants = [self.local_id().clone(), envelope.source.clone()];
        let message_id = self.database().write(|txn| {
            let thread = txn.get_or_create_thread_with_participants(&participants)?;
            let message = Message::error(
                &thread.unique_id,
                envelope.timestamp,
                format!("Unable to decrypt message: {reason}"),
            );
            txn.save_message(&message)?;
            Ok(message.unique_id)
        })?;
        tracing::warn!(sender = %envelope.source, reason, "decryption failure recorded");
        Ok(message_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{MessageKind, Thread};
    use crate::services::NotificationsManager;
    use crate::test_support::{open_store, rid};
    use crate::threads::ThreadQueries;
    use crate::transaction::ReadAccess;
    use relay_shared::protocol::AttachmentPointer;
    use serde_json::{json, Value};
    use std::sync::{Arc, Mutex};

    #[derive(Default)]
    struct RecordingNotifications {
        notified: Mutex<Vec<String>>,
    }

    impl NotificationsManager for RecordingNotifications {
        fn notify_incoming(&self, _: &Thread, message: &Message, sender_name: &str) {
            self.notified
                .lock()
                .unwrap()
                .push(format!("{sender_name}: {}", message.preview_text()));
        }

        fn clear_all(&self) {}
    }

    fn content(message_id: &str, text: &str) -> Value {
        json!({
            "version": 1,
            "messageType": "content",
            "messageId": message_id,
            "threadId": "t-1",
            "sender": { "userId": "alice-0001" },
            "distribution": { "userIds": ["alice-0001", "me"] },
            "data": { "body": [
                { "type": "text/html", "value": "<b>ignored</b>" },
                { "type": "text/plain", "value": text }
            ] }
        })
    }

    fn envelope(payload: Value, timestamp: u64) -> Envelope {
        Envelope {
            source: rid("alice-0001"),
            source_device: 1,
            timestamp,
            server_age_ms: None,
            payload,
            attachments: Vec::new(),
        }
    }

    fn environment() -> (tempfile::TempDir, Environment, Arc<RecordingNotifications>) {
        let (dir, db) = open_store();
        let notifications = Arc::new(RecordingNotifications::default());
        let env = Environment::builder(db, rid("me"))
            .notifications(notifications.clone())
            .build();
        (dir, env, notifications)
    }

    #[test]
    fn content_creates_thread_and_message() {
        let (_dir, env, notifications) = environment();
        let outcome = env.process_envelope(&envelope(content("m-1", "hello"), 100)).unwrap();
        assert_eq!(
            outcome,
            InboundOutcome::Saved {
                thread_id: "t-1".into(),
                message_id: "m-1".into()
            }
        );

        env.database()
            .read(|txn| {
                let message = txn.message("m-1")?.unwrap();
                assert_eq!(message.body.as_deref(), Some("hello"));
                assert_eq!(txn.unread_count("t-1")?, 1);
                assert_eq!(txn.inbox_thread_ids()?, vec!["t-1".to_string()]);
                Ok(())
            })
            .unwrap();
        assert_eq!(*notifications.notified.lock().unwrap(), vec!["alice-00: hello"]);
    }

    #[test]
    fn duplicate_delivery_is_reported_once_stored() {
        let (_dir, env, notifications) = environment();
        env.process_envelope(&envelope(content("m-1", "hello"), 100)).unwrap();
        let again = env.process_envelope(&envelope(content("m-1", "hello"), 100)).unwrap();
        assert_eq!(again, InboundOutcome::Duplicate { message_id: "m-1".into() });
        assert_eq!(
            env.database().read(|txn| txn.number_of_interactions("t-1")).unwrap(),
            1
        );
        assert_eq!(notifications.notified.lock().unwrap().len(), 1);
    }

    #[test]
    fn muted_thread_suppresses_notification() {
        let (_dir, env, notifications) = environment();
        env.process_envelope(&envelope(content("m-1", "first"), 100)).unwrap();
        env.database()
            .write(|txn| txn.set_muted("t-1", Some(Utc::now() + chrono::Duration::hours(1))))
            .unwrap();
        env.process_envelope(&envelope(content("m-2", "second"), 200)).unwrap();

        assert_eq!(notifications.notified.lock().unwrap().len(), 1);
        assert_eq!(env.database().read(|txn| txn.unread_count("t-1")).unwrap(), 2);
    }

    #[test]
    fn attachments_quotes_and_expiration() {
        let (_dir, env, _) = environment();
        env.process_envelope(&envelope(content("m-1", "original"), 100)).unwrap();

        let mut payload = content("m-2", "reply");
        payload["messageRef"] = json!("m-1");
        payload["data"]["expiration"] = json!(30);
        let mut env_with_file = envelope(payload, 200);
        env_with_file.attachments.push(AttachmentPointer {
            id: "att-1".into(),
            content_type: "image/jpeg".into(),
            size: 2048,
            file_name: Some("cat.jpg".into()),
        });
        env.process_envelope(&env_with_file).unwrap();

        env.database()
            .read(|txn| {
                let reply = txn.message("m-2")?.unwrap();
                assert_eq!(reply.quoted_message.as_ref().unwrap().message_id, "m-1");
                assert_eq!(reply.expires_in_seconds, 30);
                let attachment = txn.attachment("att-1")?.unwrap();
                assert!(attachment.message_ids.contains("m-2"));
                assert_eq!(txn.disappearing_duration("t-1")?, 30);
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn malformed_payloads_are_ignored() {
        let (_dir, env, _) = environment();
        let wrong_version = json!({ "version": 2, "messageType": "content" });
        let no_thread = json!({ "version": 1, "messageType": "content", "data": {} });
        assert_eq!(
            env.process_envelope(&envelope(wrong_version, 1)).unwrap(),
            InboundOutcome::Ignored
        );
        assert_eq!(
            env.process_envelope(&envelope(no_thread, 1)).unwrap(),
            InboundOutcome::Ignored
        );
        assert_eq!(
            env.database().read(|txn| txn.count(Collection::Threads)).unwrap(),
            0
        );
    }

    #[test]
    fn decryption_failure_lands_in_direct_thread() {
        let (_dir, env, _) = environment();
        let id = env
            .record_decryption_failure(&envelope(Value::Null, 100), "bad mac")
            .unwrap();
        env.database()
            .read(|txn| {
                let message = txn.message(&id)?.unwrap();
                assert!(matches!(message.kind, MessageKind::Error { .. }));
                assert_eq!(txn.unread_count(&message.thread_id)?, 1);
                Ok(())
            })
            .unwrap();
    }
}
