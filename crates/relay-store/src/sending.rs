//! Outgoing messages.
//!
//! The message is saved in one transaction and handed to the transport;
//! the transport's completion opens a fresh transaction to record the
//! outcome.  A message or thread removed in between turns the completion
//! into a no-op.

use std::sync::Arc;

use relay_shared::types::now_millis;

use crate::database::Database;
use crate::environment::Environment;
use crate::error::{Result, StoreError};
use crate::models::{Message, OutgoingState};
use crate::services::SendError;
use crate::threads::ThreadQueries;

impl Environment {
    /// Save (when it is persisted at all) and transmit `message`.
    pub fn send_message(&self, message: Message) -> Result<()> {
        let persisted = message.should_be_saved();
        let thread = self.database().write(|txn| {
            let thread = txn
                .thread(&message.thread_id)?
                .ok_or_else(|| StoreError::MissingThread(message.thread_id.clone()))?;
            if persisted {
                txn.save_message(&message)?;
            }
            Ok(thread)
        })?;

        let db = Arc::clone(self.database());
        let message_id = message.unique_id.clone();
        tracing::debug!(message = %message_id, thread = %thread.unique_id, "sending message");
        self.message_sender().send(
            message,
            thread,
            Box::new(move |outcome| {
                if persisted {
                    record_send_outcome(&db, &message_id, outcome);
                } else if let Err(e) = outcome {
                    tracing::warn!(message = %message_id, error = %e, "unsaved message failed to send");
                }
            }),
        );
        Ok(())
    }

    /// Build an outgoing text message for `thread_id` and send it.  Returns
    /// the new message id.
    pub fn send_text(&self, thread_id: &str, body: &str) -> Result<String> {
        let thread = self
            .database()
            .read(|txn| txn.thread(thread_id))?
            .ok_or_else(|| StoreError::MissingThread(thread_id.to_string()))?;
        let message = Message::outgoing(&thread, body);
        let id = message.unique_id.clone();
        self.send_message(message)?;
        Ok(id)
    }

    /// Change how long new messages in `thread_id` live, note the change in
    /// the thread and tell the other participants.  Returns the id of the
    /// update that was sent, or `None` when the duration was already set.
    pub fn update_disappearing_duration(&self, thread_id: &str, seconds: u32) -> Result<Option<String>> {
        let thread = self.database().write(|txn| {
            let current = txn
                .thread(thread_id)?
                .ok_or_else(|| StoreError::MissingThread(thread_id.to_string()))?;
            if current.disappearing_duration == seconds {
                return Ok(None);
            }
            let updated = txn
                .update_thread(thread_id, |t| t.disappearing_duration = seconds)?
                .ok_or_else(|| StoreError::MissingThread(thread_id.to_string()))?;
            let text = if seconds == 0 {
                "You disabled disappearing messages.".to_string()
            } else {
                format!("You set disappearing message time to {seconds} seconds.")
            };
            txn.save_message(&Message::info(thread_id, now_millis(), text))?;
            Ok(Some(updated))
        })?;

        let Some(thread) = thread else {
            return Ok(None);
        };
        tracing::info!(thread = %thread_id, seconds, "disappearing duration changed");
        let message = Message::expiration_update(&thread, seconds);
        let id = message.unique_id.clone();
        self.send_message(message)?;
        Ok(Some(id))
    }
}

fn record_send_outcome(db: &Database, message_id: &str, outcome: std::result::Result<(), SendError>) {
    let state = match &outcome {
        Ok(()) => OutgoingState::Sent,
        Err(e) => OutgoingState::Failed {
            reason: e.to_string(),
        },
    };
    match db.write(|txn| txn.set_outgoing_state(message_id, state)) {
        Ok(Some(_)) => match outcome {
            Ok(()) => tracing::info!(message = %message_id, "message sent"),
            Err(e) => tracing::warn!(message = %message_id, error = %e, "message send failed"),
        },
        Ok(None) => tracing::debug!(message = %message_id, "message removed before send completed"),
        Err(e) => tracing::error!(message = %message_id, error = %e, "failed to record send outcome"),
    }
}
