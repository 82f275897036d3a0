//! Line-oriented input: decrypted envelopes, or local send commands, one
//! JSON object per line.

use serde::Deserialize;
use tokio::io::{AsyncBufRead, AsyncBufReadExt};
use tracing::{debug, info, warn};

use relay_shared::protocol::Envelope;
use relay_store::inbound::InboundOutcome;
use relay_store::Environment;

use crate::error::NodeError;

#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum InputLine {
    /// `{"send": {"threadId": "...", "body": "..."}}`
    Send { send: SendCommand },
    /// `{"expire": {"threadId": "...", "seconds": 60}}`
    Expire { expire: ExpireCommand },
    Envelope(Envelope),
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendCommand {
    pub thread_id: String,
    pub body: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExpireCommand {
    pub thread_id: String,
    pub seconds: u32,
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct IngestStats {
    pub saved: usize,
    pub duplicates: usize,
    pub control: usize,
    pub ignored: usize,
    pub sent: usize,
    pub rejected: usize,
}

impl IngestStats {
    fn record(&mut self, outcome: &InboundOutcome) {
        match outcome {
            InboundOutcome::Saved { .. } => self.saved += 1,
            InboundOutcome::Duplicate { .. } => self.duplicates += 1,
            InboundOutcome::Control(_) => self.control += 1,
            InboundOutcome::Ignored => self.ignored += 1,
        }
    }
}

/// Handle one line.  Store work runs on the blocking pool.
async fn handle_line(env: &Environment, line: &str, stats: &mut IngestStats) -> Result<(), NodeError> {
    let input: InputLine = serde_json::from_str(line)?;
    let env = env.clone();
    match input {
        InputLine::Envelope(envelope) => {
            let outcome = tokio::task::spawn_blocking(move || env.process_envelope(&envelope)).await??;
            debug!(?outcome, "envelope processed");
            stats.record(&outcome);
        }
        InputLine::Send { send } => {
            let id = tokio::task::spawn_blocking(move || env.send_text(&send.thread_id, &send.body)).await??;
            debug!(message = %id, "send queued");
            stats.sent += 1;
        }
        InputLine::Expire { expire } => {
            let sent = tokio::task::spawn_blocking(move || {
                env.update_disappearing_duration(&expire.thread_id, expire.seconds)
            })
            .await??;
            if let Some(id) = sent {
                debug!(message = %id, "expiration update queued");
                stats.sent += 1;
            }
        }
    }
    Ok(())
}

/// Read lines until EOF.  Bad lines are logged and skipped; fatal store
/// errors stop ingestion.
pub async fn ingest_lines<R>(env: &Environment, reader: R) -> Result<IngestStats, NodeError>
where
    R: AsyncBufRead + Unpin,
{
    let mut stats = IngestStats::default();
    let mut lines = reader.lines();
    let mut line_no = 0usize;

    while let Some(line) = lines.next_line().await? {
        line_no += 1;
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        match handle_line(env, line, &mut stats).await {
            Ok(()) => {}
            Err(e) if e.is_recoverable() => {
                warn!(line = line_no, error = %e, "rejected input line");
                stats.rejected += 1;
            }
            Err(e) => return Err(e),
        }
    }

    info!(
        lines = line_no,
        saved = stats.saved,
        duplicates = stats.duplicates,
        control = stats.control,
        sent = stats.sent,
        rejected = stats.rejected,
        "input exhausted"
    );
    Ok(stats)
}

#[cfg(test)]
mod tests {
    use super::*;
    use relay_shared::RecipientId;
    use relay_store::prelude::*;
    use relay_store::{Database, StoreOptions};
    use serde_json::json;

    fn environment() -> (tempfile::TempDir, Environment) {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::open_in(dir.path(), StoreOptions::default()).unwrap();
        db.register_builtin_views().unwrap();
        (dir, Environment::builder(db, RecipientId::from("me")).build())
    }

    fn envelope_line(message_id: &str) -> String {
        json!({
            "source": "alice",
            "sourceDevice": 1,
            "timestamp": 100,
            "payload": {
                "version": 1,
                "messageType": "content",
                "messageId": message_id,
                "threadId": "t-1",
                "distribution": { "userIds": ["alice", "me"] },
                "data": { "body": [{ "type": "text/plain", "value": "hi" }] }
            }
        })
        .to_string()
    }

    #[tokio::test]
    async fn envelopes_and_sends_are_applied() {
        let (_dir, env) = environment();
        let input = format!(
            "{}\n\n{}\nnot json\n{}\n",
            envelope_line("m-1"),
            envelope_line("m-1"),
            json!({ "send": { "threadId": "t-1", "body": "reply" } })
        );

        let stats = ingest_lines(&env, input.as_bytes()).await.unwrap();
        assert_eq!(stats.saved, 1);
        assert_eq!(stats.duplicates, 1);
        assert_eq!(stats.sent, 1);
        assert_eq!(stats.rejected, 1);

        let count = env
            .database()
            .read(|txn| txn.number_of_interactions("t-1"))
            .unwrap();
        assert_eq!(count, 2);
    }

    #[tokio::test]
    async fn expire_command_updates_thread() {
        let (_dir, env) = environment();
        let input = format!(
            "{}\n{}\n{}\n",
            envelope_line("m-1"),
            json!({ "expire": { "threadId": "t-1", "seconds": 60 } }),
            json!({ "expire": { "threadId": "t-1", "seconds": 60 } })
        );

        let stats = ingest_lines(&env, input.as_bytes()).await.unwrap();
        assert_eq!(stats.sent, 1);
        let thread = env
            .database()
            .read(|txn| txn.thread("t-1"))
            .unwrap()
            .unwrap();
        assert_eq!(thread.disappearing_duration, 60);
    }

    #[tokio::test]
    async fn send_to_unknown_thread_is_rejected() {
        let (_dir, env) = environment();
        let input = json!({ "send": { "threadId": "nope", "body": "x" } }).to_string();
        let stats = ingest_lines(&env, input.as_bytes()).await.unwrap();
        assert_eq!(stats.rejected, 1);
        assert_eq!(stats.sent, 0);
    }
}
