//! Control messages: thread management commands and call signaling sent
//! between clients inside ordinary payloads.
//!
//! Thread commands are applied inside the caller's write transaction.
//! Call signals are only validated there; delivery to the call handler is
//! queued to run after the transaction commits.

use std::sync::Arc;

use relay_shared::constants::STALE_CALL_JOIN_TIMEOUT_MS;
use relay_shared::protocol::{CallSignal, ControlType, Envelope, Payload};
use relay_shared::types::{millis_to_datetime, now_millis};
use relay_shared::RecipientId;

use crate::error::Result;
use crate::models::{Message, Thread};
use crate::services::CallMessageHandler;
use crate::transaction::WriteTransaction;

/// What a control message did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlOutcome {
    /// Thread state changed (or would have, had it differed).
    Applied(ControlType),
    /// Call signal accepted; dispatched once the transaction commits.
    CallQueued { call_id: String },
    /// Malformed, stale or unknown; nothing changed.
    Ignored,
}

/// A validated call signal bound to its thread and sender.
#[derive(Debug, Clone)]
pub struct CallEvent {
    pub thread: Thread,
    pub sender: RecipientId,
    pub device_id: u32,
    pub signal: CallSignal,
}

impl CallEvent {
    pub fn dispatch(&self, handler: &dyn CallMessageHandler) {
        let (thread, sender, device) = (&self.thread, &self.sender, self.device_id);
        match &self.signal {
            CallSignal::Join {
                call_id, originator, ..
            } => handler.received_join(thread, sender, device, originator, call_id),
            CallSignal::Offer { call_id, peer_id, sdp } => {
                handler.received_offer(thread, sender, device, call_id, peer_id, sdp)
            }
            CallSignal::AcceptOffer { call_id, peer_id, sdp } => {
                handler.received_accept_offer(thread, call_id, peer_id, sdp)
            }
            CallSignal::IceCandidates {
                call_id, candidates, ..
            } => handler.received_ice_candidates(thread, sender, device, call_id, candidates),
            CallSignal::Leave { call_id } => handler.received_leave(thread, sender, device, call_id),
        }
    }
}

impl WriteTransaction<'_> {
    /// Apply a control payload.  `sender_name` is used in the info message
    /// recorded for title changes.
    pub fn apply_control(
        &mut self,
        envelope: &Envelope,
        payload: &Payload,
        sender_name: &str,
        calls: &Arc<dyn CallMessageHandler>,
    ) -> Result<ControlOutcome> {
        let Some(control) = payload.control_type() else {
            tracing::info!(
                control = payload.control_name().unwrap_or("<none>"),
                "unhandled control message"
            );
            return Ok(ControlOutcome::Ignored);
        };
        tracing::debug!(control = ?control, sender = %envelope.source, "control message received");

        if control.is_call() {
            return self.queue_call_signal(control, envelope, payload, calls);
        }

        let thread_id = match payload.thread() {
            Ok(thread) => thread.thread_id,
            Err(e) => {
                tracing::debug!(control = ?control, error = %e, "control message without a usable thread");
                return Ok(ControlOutcome::Ignored);
            }
        };

        let applied = match control {
            ControlType::ThreadUpdate => self.apply_thread_update(envelope, payload, sender_name)?,
            ControlType::ThreadClear => {
                self.remove_all_interactions(&thread_id, false)?;
                true
            }
            ControlType::ThreadClose | ControlType::ThreadArchive => {
                let reference = millis_to_datetime(envelope.timestamp);
                self.archive_thread(&thread_id, Some(reference))?
            }
            ControlType::ThreadRestore => self.unarchive_thread(&thread_id)?,
            ControlType::ThreadDelete => self.remove_thread(&thread_id, false)?,
            ControlType::Snooze => {
                let until = payload.snooze_until().map(millis_to_datetime);
                self.set_muted(&thread_id, until)?
            }
            ControlType::ReadMark => {
                let mark = payload.read_mark().unwrap_or_else(|| {
                    tracing::warn!(thread = %thread_id, "read mark without a timestamp");
                    now_millis()
                });
                self.mark_as_read_before(&thread_id, mark)?;
                true
            }
            _ => false,
        };

        Ok(if applied {
            ControlOutcome::Applied(control)
        } else {
            ControlOutcome::Ignored
        })
    }

    fn apply_thread_update(&mut self, envelope: &Envelope, payload: &Payload, sender_name: &str) -> Result<bool> {
        let Some(thread) = self.get_or_create_thread_from_payload(payload.raw())? else {
            tracing::debug!("unable to resolve thread for thread update");
            return Ok(false);
        };
        let Some(updates) = payload.thread_updates() else {
            return Ok(true);
        };

        if let Some(title) = updates.title.filter(|t| thread.title.as_deref() != Some(t.as_str())) {
            self.update_title(&thread.unique_id, &title)?;
            let text = if sender_name.is_empty() {
                format!("Title changed to \"{title}\"")
            } else {
                format!("{sender_name} changed the title to \"{title}\"")
            };
            self.save_message(&Message::info(&thread.unique_id, envelope.timestamp, text))?;
        }

        if let Some(expression) = updates.expression {
            if thread.universal_expression.as_deref() != Some(expression.as_str()) {
                let pretty = thread.pretty_expression.clone();
                self.set_expression(&thread.unique_id, Some(expression), pretty)?;
            }
        }
        Ok(true)
    }

    fn queue_call_signal(
        &mut self,
        control: ControlType,
        envelope: &Envelope,
        payload: &Payload,
        calls: &Arc<dyn CallMessageHandler>,
    ) -> Result<ControlOutcome> {
        if control == ControlType::CallJoin {
            let age = envelope.server_age_ms.unwrap_or(0);
            if age > STALE_CALL_JOIN_TIMEOUT_MS {
                tracing::info!(age_ms = age, "ignoring stale call join");
                return Ok(ControlOutcome::Ignored);
            }
        }

        let signal = match CallSignal::parse(control, &payload.data) {
            Ok(signal) => signal,
            Err(e) => {
                tracing::debug!(control = ?control, error = %e, "call signal missing requirements");
                return Ok(ControlOutcome::Ignored);
            }
        };
        let Some(thread) = self.get_or_create_thread_from_payload(payload.raw())? else {
            return Ok(ControlOutcome::Ignored);
        };

        let call_id = signal.call_id().to_string();
        let event = CallEvent {
            thread,
            sender: envelope.source.clone(),
            device_id: envelope.source_device,
            signal,
        };
        let handler = Arc::clone(calls);
        self.after_commit(move || event.dispatch(handler.as_ref()));
        Ok(ControlOutcome::CallQueued { call_id })
    }
}
