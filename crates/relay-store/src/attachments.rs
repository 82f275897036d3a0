//! Attachment records and their content-addressed files.
//!
//! Files live in one directory next to the database, named by the hex
//! BLAKE3 hash of their content, so identical content is stored once.
//! Records are reference-counted by the messages listing them; a record
//! left unreferenced is removed together with its file.  Whether the file
//! goes is decided at commit, under the writer lock, against whatever
//! attachments the committed state still holds.  Files a transaction
//! created are deleted again if it rolls back.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use crate::database::StoreFiles;
use crate::error::{Result, StoreError};
use crate::models::{Attachment, Message};
use crate::transaction::{ReadAccess, WriteTransaction};

pub const ATTACHMENTS_DIR: &str = "attachments";

pub fn content_hash(data: &[u8]) -> String {
    hex::encode(blake3::hash(data).as_bytes())
}

#[derive(Debug, Clone)]
pub struct AttachmentStore {
    base_path: PathBuf,
}

impl AttachmentStore {
    pub fn new(base_path: impl Into<PathBuf>) -> Result<Self> {
        let base_path = base_path.into();
        std::fs::create_dir_all(&base_path)?;
        tracing::debug!(path = %base_path.display(), "attachment store ready");
        Ok(Self { base_path })
    }

    /// `attachments/` beside the database file.
    pub fn for_store(files: &StoreFiles) -> Result<Self> {
        let dir = files.dir().unwrap_or_else(|| Path::new("."));
        Self::new(dir.join(ATTACHMENTS_DIR))
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    /// Write `data` under its content hash; returns the hash and path.
    /// Content already present is not rewritten.  A file written outside a
    /// write transaction may be deleted by a concurrent commit before any
    /// record points at it; [`WriteTransaction::save_attachment_data`]
    /// does not have that gap.
    pub fn write(&self, data: &[u8]) -> Result<(String, PathBuf)> {
        let (hash, path, _) = self.write_content(data)?;
        Ok((hash, path))
    }

    /// Like [`write`](Self::write), also reporting whether the file was
    /// created by this call.
    fn write_content(&self, data: &[u8]) -> Result<(String, PathBuf, bool)> {
        let hash = content_hash(data);
        let path = self.base_path.join(&hash);
        if path.exists() {
            return Ok((hash, path, false));
        }
        let staging = self.base_path.join(format!("{hash}.partial"));
        std::fs::write(&staging, data)?;
        std::fs::rename(&staging, &path)?;
        tracing::debug!(hash = %hash, size = data.len(), "attachment written");
        Ok((hash, path, true))
    }

    /// Read an attachment's file, checking it against the recorded hash.
    pub fn read_verified(&self, attachment: &Attachment) -> Result<Vec<u8>> {
        let path = attachment.local_path.as_ref().ok_or(StoreError::NotFound)?;
        let data = std::fs::read(path)?;
        if let Some(expected) = &attachment.content_hash {
            let actual = content_hash(&data);
            if &actual != expected {
                tracing::error!(
                    attachment = %attachment.unique_id,
                    expected = %expected,
                    actual = %actual,
                    "attachment content does not match its hash"
                );
                return Err(StoreError::Corrupt(format!(
                    "attachment {} content hash mismatch",
                    attachment.unique_id
                )));
            }
        }
        Ok(data)
    }
}

pub trait AttachmentQueries: ReadAccess {
    fn attachment(&self, id: &str) -> Result<Option<Attachment>> {
        self.fetch::<Attachment>(id)
    }

    /// Attachments of a message that still exist, in the message's order.
    fn message_attachments(&self, message: &Message) -> Result<Vec<Attachment>> {
        self.fetch_many(&message.attachment_ids)
    }

    /// The message's first attachment, if it still exists.
    fn message_attachment(&self, message: &Message) -> Result<Option<Attachment>> {
        match message.attachment_ids.first() {
            Some(id) => self.attachment(id),
            None => Ok(None),
        }
    }

    /// Attachments no message references any more.
    fn orphaned_attachments(&self) -> Result<Vec<Attachment>> {
        self.enumerate::<Attachment, _>(|a| !a.is_referenced())
    }
}

impl<T: ReadAccess> AttachmentQueries for T {}

/// A content file whose record was removed.
#[derive(Debug, Clone)]
pub(crate) struct FileRemoval {
    pub attachment_id: String,
    pub content_hash: String,
    pub path: PathBuf,
}

/// Paths of the removals whose content no attachment visible to `txn`
/// still uses.
pub(crate) fn unreferenced_files<T: ReadAccess>(txn: &T, removals: Vec<FileRemoval>) -> Result<Vec<PathBuf>> {
    if removals.is_empty() {
        return Ok(Vec::new());
    }
    let candidates: BTreeSet<&str> = removals.iter().map(|r| r.content_hash.as_str()).collect();
    let in_use: BTreeSet<String> = txn
        .enumerate::<Attachment, _>(|a| {
            a.content_hash
                .as_deref()
                .map_or(false, |h| candidates.contains(h))
        })?
        .into_iter()
        .filter_map(|a| a.content_hash)
        .collect();

    let mut paths = BTreeSet::new();
    for removal in removals {
        if in_use.contains(&removal.content_hash) {
            tracing::debug!(attachment = %removal.attachment_id, "attachment file still in use");
        } else {
            paths.insert(removal.path);
        }
    }
    Ok(paths.into_iter().collect())
}

/// Best-effort delete; a file already gone is fine.
pub(crate) fn delete_files(paths: &[PathBuf]) {
    for path in paths {
        match std::fs::remove_file(path) {
            Ok(()) => tracing::debug!(path = %path.display(), "attachment file deleted"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => tracing::warn!(path = %path.display(), error = %e, "failed to delete attachment file"),
        }
    }
}

impl WriteTransaction<'_> {
    pub fn save_attachment(&mut self, attachment: &Attachment) -> Result<()> {
        self.upsert(attachment)
    }

    /// Write the content into `store` and save the record pointing at it.
    pub fn save_attachment_data(
        &mut self,
        store: &AttachmentStore,
        mut attachment: Attachment,
        data: &[u8],
    ) -> Result<Attachment> {
        let (hash, path, created) = store.write_content(data)?;
        if created {
            self.remove_file_on_rollback(path.clone());
        }
        attachment.byte_count = data.len() as u64;
        attachment.content_hash = Some(hash);
        attachment.local_path = Some(path);
        self.upsert(&attachment)?;
        Ok(attachment)
    }

    /// Record that `message_id` references the attachment.  A missing
    /// attachment is skipped.
    pub fn link_attachment(&mut self, attachment_id: &str, message_id: &str) -> Result<bool> {
        let Some(mut attachment) = self.attachment(attachment_id)? else {
            tracing::debug!(attachment = %attachment_id, message = %message_id, "linking missing attachment");
            return Ok(false);
        };
        if attachment.message_ids.insert(message_id.to_string()) {
            self.upsert(&attachment)?;
        }
        Ok(true)
    }

    /// Drop `message_id`'s reference.  An attachment left unreferenced is
    /// removed unless `keep` is set.
    pub fn unlink_attachment(&mut self, attachment_id: &str, message_id: &str, keep: bool) -> Result<()> {
        let Some(mut attachment) = self.attachment(attachment_id)? else {
            return Ok(());
        };
        attachment.message_ids.remove(message_id);
        if attachment.is_referenced() || keep {
            self.upsert(&attachment)
        } else {
            self.remove_attachment(attachment_id).map(|_| ())
        }
    }

    /// Remove the record; its file goes at commit unless an attachment in
    /// the committed state shares the same content.
    pub fn remove_attachment(&mut self, attachment_id: &str) -> Result<bool> {
        let Some(removed) = self.remove::<Attachment>(attachment_id)? else {
            return Ok(false);
        };

        if let (Some(path), Some(content_hash)) = (removed.local_path, removed.content_hash) {
            self.remove_file_on_commit(FileRemoval {
                attachment_id: removed.unique_id,
                content_hash,
                path,
            });
        }
        tracing::debug!(attachment = %attachment_id, "attachment removed");
        Ok(true)
    }

    /// Remove every unreferenced attachment; returns how many went.
    pub fn remove_orphaned_attachments(&mut self) -> Result<usize> {
        let orphans = self.orphaned_attachments()?;
        let mut removed = 0;
        for attachment in orphans {
            if self.remove_attachment(&attachment.unique_id)? {
                removed += 1;
            }
        }
        Ok(removed)
    }
}
