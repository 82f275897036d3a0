//! Case-insensitive text search over threads and message bodies.

use crate::error::Result;
use crate::models::{Message, Thread};
use crate::services::ContactsManager;
use crate::threads::ThreadQueries;
use crate::transaction::ReadAccess;

pub trait SearchQueries: ThreadQueries {
    /// Threads whose title, participant ids or participant display names
    /// contain `query`, most recent activity first.  An empty query matches
    /// nothing.
    fn search_threads(&self, query: &str, contacts: &dyn ContactsManager) -> Result<Vec<Thread>> {
        let needle = query.trim().to_lowercase();
        if needle.is_empty() {
            return Ok(Vec::new());
        }
        let mut threads = self.enumerate::<Thread, _>(|thread| {
            let title_matches = thread
                .title
                .as_deref()
                .is_some_and(|t| t.to_lowercase().contains(&needle));
            title_matches
                || thread.participant_ids.iter().any(|p| {
                    p.as_str().to_lowercase().contains(&needle)
                        || contacts
                            .display_name(p)
                            .is_some_and(|name| name.to_lowercase().contains(&needle))
                })
        })?;
        threads.sort_by(|a, b| {
            b.last_activity()
                .cmp(&a.last_activity())
                .then_with(|| a.unique_id.cmp(&b.unique_id))
        });
        Ok(threads)
    }

    /// Messages whose body contains `query`, newest first, at most `limit`.
    fn search_messages(&self, query: &str, limit: usize) -> Result<Vec<Message>> {
        let needle = query.trim().to_lowercase();
        if needle.is_empty() || limit == 0 {
            return Ok(Vec::new());
        }
        let mut messages = self.enumerate::<Message, _>(|m| {
            m.body
                .as_deref()
                .is_some_and(|b| b.to_lowercase().contains(&needle))
        })?;
        messages.sort_by(|a, b| {
            b.timestamp
                .cmp(&a.timestamp)
                .then_with(|| a.unique_id.cmp(&b.unique_id))
        });
        messages.truncate(limit);
        Ok(messages)
    }
}

impl<T: ReadAccess> SearchQueries for T {}
