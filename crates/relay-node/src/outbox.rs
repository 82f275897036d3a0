//! Outgoing transport that writes each send as a JSON line.
//!
//! `Outbox::send` only queues; a writer task serializes the message, writes
//! it out and then reports the outcome.  Completions touch the store, so
//! they run on the blocking pool.

use serde::Serialize;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use relay_shared::RecipientId;
use relay_store::services::{MessageSender, SendCompletion, SendError};
use relay_store::{Message, MessageKind, Thread};

pub struct OutboxItem {
    message: Message,
    thread: Thread,
    completion: SendCompletion,
}

#[derive(Clone)]
pub struct Outbox {
    tx: mpsc::UnboundedSender<OutboxItem>,
}

impl Outbox {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<OutboxItem>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl MessageSender for Outbox {
    fn send(&self, message: Message, thread: Thread, completion: SendCompletion) {
        let item = OutboxItem {
            message,
            thread,
            completion,
        };
        if let Err(mpsc::error::SendError(item)) = self.tx.send(item) {
            warn!(message = %item.message.unique_id, "outbox closed, failing send");
            (item.completion)(Err(SendError::Transport("outbox closed".into())));
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct OutboundLine<'a> {
    thread_id: &'a str,
    message_id: &'a str,
    timestamp: u64,
    /// Disappearing duration in seconds, omitted when zero.
    #[serde(skip_serializing_if = "is_zero")]
    expires_in_seconds: u32,
    /// Set when the message only announces a new disappearing duration.
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    expiration_update: bool,
    deliveries: Vec<Delivery<'a>>,
}

fn is_zero(n: &u32) -> bool {
    *n == 0
}

#[derive(Debug, Serialize)]
struct Delivery<'a> {
    recipient: &'a RecipientId,
    body: String,
}

fn render(message: &Message, thread: &Thread, local_id: &RecipientId) -> Result<Vec<u8>, SendError> {
    let deliveries: Vec<Delivery<'_>> = thread
        .participant_ids
        .iter()
        .filter(|p| *p != local_id)
        .map(|recipient| Delivery {
            recipient,
            body: match message.payload_for(recipient) {
                Some(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
                None => message.body.clone().unwrap_or_default(),
            },
        })
        .collect();
    if deliveries.is_empty() {
        return Err(SendError::NoRecipients);
    }

    let line = OutboundLine {
        thread_id: &thread.unique_id,
        message_id: &message.unique_id,
        timestamp: message.timestamp,
        expires_in_seconds: message.expires_in_seconds,
        expiration_update: matches!(message.kind, MessageKind::ExpirationUpdate { .. }),
        deliveries,
    };
    let mut bytes = serde_json::to_vec(&line).map_err(|e| SendError::Transport(e.to_string()))?;
    bytes.push(b'\n');
    Ok(bytes)
}

/// Drain the outbox into `out` until every `Outbox` handle is dropped.
/// Returns the number of messages written.
pub async fn run_outbox<W>(mut rx: mpsc::UnboundedReceiver<OutboxItem>, mut out: W, local_id: RecipientId) -> usize
where
    W: AsyncWrite + Unpin,
{
    let mut written = 0;
    while let Some(item) = rx.recv().await {
        let outcome = match render(&item.message, &item.thread, &local_id) {
            Ok(line) => match out.write_all(&line).await {
                Ok(()) => out.flush().await.map_err(|e| SendError::Transport(e.to_string())),
                Err(e) => Err(SendError::Transport(e.to_string())),
            },
            Err(e) => Err(e),
        };
        if outcome.is_ok() {
            written += 1;
        }
        debug!(message = %item.message.unique_id, ok = outcome.is_ok(), "outbox item handled");

        let completion = item.completion;
        if let Err(e) = tokio::task::spawn_blocking(move || completion(outcome)).await {
            warn!(error = %e, "send completion panicked");
        }
    }
    written
}
