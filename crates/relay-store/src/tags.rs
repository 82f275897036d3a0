//! Tag directory entries and the threads that reference them.

use crate::error::Result;
use crate::models::{Tag, Thread};
use crate::record::Collection;
use crate::threads::ThreadQueries;
use crate::transaction::{ReadAccess, WriteTransaction};
use crate::views::builtin::{ACTIVE_TAGS_GROUP, HIDDEN_TAGS_GROUP, TAGS};

pub trait TagQueries: ThreadQueries {
    fn tag(&self, id: &str) -> Result<Option<Tag>> {
        self.fetch::<Tag>(id)
    }

    fn tag_by_slug(&self, slug: &str) -> Result<Option<Tag>> {
        let slug = slug.to_ascii_lowercase();
        Ok(self
            .enumerate::<Tag, _>(|t| t.slug == slug)?
            .into_iter()
            .next())
    }

    /// Visible tags ordered by slug.
    fn active_tags(&self) -> Result<Vec<Tag>> {
        tags_in(self, false)
    }

    fn hidden_tags(&self) -> Result<Vec<Tag>> {
        tags_in(self, true)
    }

    /// Threads whose expression references the tag, most recent first.
    fn threads_for_tag(&self, slug: &str) -> Result<Vec<Thread>> {
        let ids = self.tag_thread_ids(slug)?;
        self.fetch_many(&ids)
    }
}

impl<T: ReadAccess> TagQueries for T {}

fn tags_in<T: ReadAccess + ?Sized>(txn: &T, hidden: bool) -> Result<Vec<Tag>> {
    if txn.is_view_ready(TAGS) {
        let group = if hidden { HIDDEN_TAGS_GROUP } else { ACTIVE_TAGS_GROUP };
        let ids = txn.view_ids(TAGS, group);
        return txn.fetch_many(&ids);
    }
    let mut tags = txn.enumerate::<Tag, _>(|t| t.hidden == hidden)?;
    tags.sort_by(|a, b| (&a.slug, &a.unique_id).cmp(&(&b.slug, &b.unique_id)));
    Ok(tags)
}

impl WriteTransaction<'_> {
    /// Save a tag.  Slugs are unique: a tag arriving under a new id for a
    /// known slug replaces the stored definition but keeps its id.
    pub fn save_tag(&mut self, tag: &Tag) -> Result<Tag> {
        let mut tag = tag.clone();
        tag.slug = tag.slug.to_ascii_lowercase();
        if let Some(existing) = self.tag_by_slug(&tag.slug)? {
            tag.unique_id = existing.unique_id;
        }
        self.upsert(&tag)?;
        tracing::debug!(tag = %tag.slug, members = tag.recipient_ids.len(), "tag saved");
        Ok(tag)
    }

    pub fn set_tag_hidden(&mut self, id: &str, hidden: bool) -> Result<bool> {
        let Some(mut tag) = self.tag(id)? else {
            tracing::debug!(tag = %id, "skipping update of removed tag");
            return Ok(false);
        };
        if tag.hidden != hidden {
            tag.hidden = hidden;
            self.upsert(&tag)?;
        }
        Ok(true)
    }

    pub fn remove_tag(&mut self, id: &str) -> Result<bool> {
        self.remove_record(Collection::Tags, id)
    }
}
