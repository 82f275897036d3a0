//! Scoped read and read-write transactions.
//!
//! Both transaction types implement [`ReadAccess`], so every query helper in
//! the crate works the same inside a read snapshot and inside a write
//! transaction (where it also sees the transaction's own uncommitted writes).

use std::path::PathBuf;
use std::sync::{Arc, MutexGuard};

use chrono::Utc;
use rusqlite::{params, Connection, ErrorCode, OptionalExtension};

use crate::attachments::{self, FileRemoval};
use crate::database::{read_commit_seq, Database};
use crate::error::{Result, StoreError};
use crate::notifications::{ChangeKind, ChangeSet, Notification, ViewChangeSet};
use crate::record::{corrupt, Collection, Record, StoredRecord};
use crate::views::IndexState;

// ---------------------------------------------------------------------------
// ReadAccess
// ---------------------------------------------------------------------------

/// Record and view queries shared by read and write transactions.
pub trait ReadAccess {
    fn connection(&self) -> &Connection;

    fn index(&self) -> &IndexState;

    fn fetch<R: Record>(&self, id: &str) -> Result<Option<R>> {
        load_data(self.connection(), R::COLLECTION, id)?
            .map(|data| R::decode(&data).map_err(|e| corrupt(R::COLLECTION, id, e)))
            .transpose()
    }

    fn fetch_stored(&self, collection: Collection, id: &str) -> Result<Option<StoredRecord>> {
        load_stored(self.connection(), collection, id)
    }

    fn exists(&self, collection: Collection, id: &str) -> Result<bool> {
        Ok(self.version(collection, id)?.is_some())
    }

    /// Store-maintained version counter, starting at 1.
    fn version(&self, collection: Collection, id: &str) -> Result<Option<i64>> {
        Ok(self
            .connection()
            .query_row(
                "SELECT version FROM records WHERE collection = ?1 AND unique_id = ?2",
                params![collection.as_str(), id],
                |row| row.get(0),
            )
            .optional()?)
    }

    fn ids(&self, collection: Collection) -> Result<Vec<String>> {
        let mut stmt = self.connection().prepare(
            "SELECT unique_id FROM records WHERE collection = ?1 ORDER BY unique_id",
        )?;
        let rows = stmt.query_map([collection.as_str()], |row| row.get(0))?;
        Ok(rows.collect::<rusqlite::Result<Vec<String>>>()?)
    }

    fn count(&self, collection: Collection) -> Result<usize> {
        let count: i64 = self.connection().query_row(
            "SELECT COUNT(*) FROM records WHERE collection = ?1",
            [collection.as_str()],
            |row| row.get(0),
        )?;
        Ok(count.max(0) as usize)
    }

    /// Every record of `R`'s collection accepted by `predicate`, by id.
    fn enumerate<R, P>(&self, mut predicate: P) -> Result<Vec<R>>
    where
        R: Record,
        P: FnMut(&R) -> bool,
    {
        let mut stmt = self.connection().prepare(
            "SELECT unique_id, data FROM records WHERE collection = ?1 ORDER BY unique_id",
        )?;
        let rows = stmt.query_map([R::COLLECTION.as_str()], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, Vec<u8>>(1)?))
        })?;

        let mut out = Vec::new();
        for row in rows {
            let (id, data) = row?;
            let record = R::decode(&data).map_err(|e| corrupt(R::COLLECTION, &id, e))?;
            if predicate(&record) {
                out.push(record);
            }
        }
        Ok(out)
    }

    /// Load records by id, skipping ids that no longer exist.
    fn fetch_many<R: Record>(&self, ids: &[String]) -> Result<Vec<R>> {
        let mut out = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(record) = self.fetch::<R>(id)? {
                out.push(record);
            }
        }
        Ok(out)
    }

    fn is_view_ready(&self, view: &str) -> bool {
        self.index().is_ready(view)
    }

    /// Ids of a view group, in view order.
    fn view_ids(&self, view: &str, group: &str) -> Vec<String> {
        self.index().group_ids(view, group)
    }

    fn view_group_len(&self, view: &str, group: &str) -> usize {
        self.index().group_len(view, group)
    }

    fn view_groups(&self, view: &str) -> Vec<String> {
        self.index()
            .view(view)
            .map(|v| v.group_names().map(str::to_string).collect())
            .unwrap_or_default()
    }
}

pub(crate) fn load_data(conn: &Connection, collection: Collection, id: &str) -> Result<Option<Vec<u8>>> {
    Ok(conn
        .query_row(
            "SELECT data FROM records WHERE collection = ?1 AND unique_id = ?2",
            params![collection.as_str(), id],
            |row| row.get(0),
        )
        .optional()?)
}

pub(crate) fn load_stored(conn: &Connection, collection: Collection, id: &str) -> Result<Option<StoredRecord>> {
    load_data(conn, collection, id)?
        .map(|data| StoredRecord::decode(collection, &data).map_err(|e| corrupt(collection, id, e)))
        .transpose()
}

// ---------------------------------------------------------------------------
// ReadTransaction
// ---------------------------------------------------------------------------

/// Snapshot of the store: records and views as of one commit.
pub struct ReadTransaction<'a> {
    conn: &'a Connection,
    index: Arc<IndexState>,
    commit_seq: u64,
}

impl<'a> ReadTransaction<'a> {
    pub(crate) fn begin(db: &Database, conn: &'a Connection) -> Result<Self> {
        let published = db
            .published()
            .read()
            .map_err(|_| StoreError::LockPoisoned("published index"))?;
        conn.execute_batch("BEGIN DEFERRED")?;
        // The first read pins the WAL snapshot.
        let commit_seq = match read_commit_seq(conn) {
            Ok(seq) => seq,
            Err(e) => {
                let _ = conn.execute_batch("ROLLBACK");
                return Err(e);
            }
        };
        let index = Arc::clone(&published);
        drop(published);

        Ok(Self {
            conn,
            index,
            commit_seq,
        })
    }

    pub fn commit_seq(&self) -> u64 {
        self.commit_seq
    }
}

impl ReadAccess for ReadTransaction<'_> {
    fn connection(&self) -> &Connection {
        self.conn
    }

    fn index(&self) -> &IndexState {
        &self.index
    }
}

impl Drop for ReadTransaction<'_> {
    fn drop(&mut self) {
        if let Err(e) = self.conn.execute_batch("ROLLBACK") {
            tracing::warn!(error = %e, "failed to end read transaction");
        }
    }
}

// ---------------------------------------------------------------------------
// WriteTransaction
// ---------------------------------------------------------------------------

type Hook = Box<dyn FnOnce() + Send + 'static>;

/// Exclusive read-write transaction.  Views are updated synchronously with
/// every write; dropping the transaction without committing rolls back.
pub struct WriteTransaction<'db> {
    db: &'db Database,
    conn: MutexGuard<'db, Connection>,
    index: IndexState,
    changes: ChangeSet,
    view_changes: ViewChangeSet,
    after_commit: Vec<Hook>,
    /// Content files that lost a record; resolved against the final state
    /// at commit.
    file_removals: Vec<FileRemoval>,
    /// Content files this transaction created; deleted again on rollback.
    created_files: Vec<PathBuf>,
    finished: bool,
}

impl<'db> WriteTransaction<'db> {
    pub(crate) fn begin(db: &'db Database) -> Result<Self> {
        let conn = db.lock_writer()?;
        conn.execute_batch("BEGIN IMMEDIATE")?;
        let index = match db.published().read() {
            Ok(published) => (**published).clone(),
            Err(_) => {
                let _ = conn.execute_batch("ROLLBACK");
                return Err(StoreError::LockPoisoned("published index"));
            }
        };
        Ok(Self {
            db,
            conn,
            index,
            changes: ChangeSet::default(),
            view_changes: ViewChangeSet::default(),
            after_commit: Vec::new(),
            file_removals: Vec::new(),
            created_files: Vec::new(),
            finished: false,
        })
    }

    pub fn database(&self) -> &'db Database {
        self.db
    }

    /// Insert a new record; fails with [`StoreError::DuplicateId`] if the id
    /// is taken.
    pub fn insert<R: Record>(&mut self, record: &R) -> Result<()> {
        let id = record.unique_id();
        let data = record.encode()?;
        let result = self.conn.execute(
            "INSERT INTO records (collection, unique_id, data, version, updated_at)
             VALUES (?1, ?2, ?3, 1, ?4)",
            params![R::COLLECTION.as_str(), id, data, now_ms()],
        );
        match result {
            Ok(_) => {}
            Err(rusqlite::Error::SqliteFailure(e, _)) if e.code == ErrorCode::ConstraintViolation => {
                return Err(StoreError::DuplicateId {
                    collection: R::COLLECTION,
                    id: id.to_string(),
                });
            }
            Err(e) => return Err(e.into()),
        }
        self.changes.record(R::COLLECTION, id, ChangeKind::Insert);
        self.reindex(R::COLLECTION, id, Some(record.to_stored()))
    }

    /// Insert or replace a record, bumping its version.
    pub fn upsert<R: Record>(&mut self, record: &R) -> Result<()> {
        let id = record.unique_id();
        let data = record.encode()?;
        let updated = self.conn.execute(
            "UPDATE records SET data = ?3, version = version + 1, updated_at = ?4
             WHERE collection = ?1 AND unique_id = ?2",
            params![R::COLLECTION.as_str(), id, data, now_ms()],
        )?;
        let kind = if updated > 0 {
            ChangeKind::Update
        } else {
            self.conn.execute(
                "INSERT INTO records (collection, unique_id, data, version, updated_at)
                 VALUES (?1, ?2, ?3, 1, ?4)",
                params![R::COLLECTION.as_str(), id, data, now_ms()],
            )?;
            ChangeKind::Insert
        };
        self.changes.record(R::COLLECTION, id, kind);
        self.reindex(R::COLLECTION, id, Some(record.to_stored()))
    }

    /// Delete a record by id; returns whether it existed.
    pub fn remove_record(&mut self, collection: Collection, id: &str) -> Result<bool> {
        let deleted = self.conn.execute(
            "DELETE FROM records WHERE collection = ?1 AND unique_id = ?2",
            params![collection.as_str(), id],
        )?;
        if deleted == 0 {
            return Ok(false);
        }
        self.changes.record(collection, id, ChangeKind::Delete);
        self.reindex(collection, id, None)?;
        Ok(true)
    }

    /// Delete and return a typed record.
    pub fn remove<R: Record>(&mut self, id: &str) -> Result<Option<R>> {
        let Some(existing) = self.fetch::<R>(id)? else {
            return Ok(None);
        };
        self.remove_record(R::COLLECTION, id)?;
        Ok(Some(existing))
    }

    /// Run `hook` after a successful commit, once the writer lock is
    /// released.  Dropped on rollback.
    pub fn after_commit<F>(&mut self, hook: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.after_commit.push(Box::new(hook));
    }

    /// Delete the removal's file at commit if no attachment left in the
    /// store still uses its content.
    pub(crate) fn remove_file_on_commit(&mut self, removal: FileRemoval) {
        self.file_removals.push(removal);
    }

    pub(crate) fn remove_file_on_rollback(&mut self, path: PathBuf) {
        self.created_files.push(path);
    }

    /// Number of records changed so far.
    pub fn pending_changes(&self) -> usize {
        self.changes.len()
    }

    fn reindex(&mut self, collection: Collection, id: &str, record: Option<StoredRecord>) -> Result<()> {
        let conn: &Connection = &self.conn;
        let mut loader = |c: Collection, id: &str| load_stored(conn, c, id);
        self.index
            .apply(collection, id, record.as_ref(), &mut loader, &mut self.view_changes)
    }

    /// Commit, publish the working index and notify subscribers.  Returns
    /// the after-commit hooks for the caller to run.
    pub(crate) fn commit(mut self) -> Result<Vec<Hook>> {
        let hooks = std::mem::take(&mut self.after_commit);
        let removals = std::mem::take(&mut self.file_removals);
        let unreferenced = attachments::unreferenced_files(&self, removals)?;

        if self.changes.is_empty() {
            self.conn.execute_batch("COMMIT")?;
            self.finish(&unreferenced);
            return Ok(hooks);
        }

        self.conn.execute(
            "UPDATE store_meta SET value = value + 1 WHERE key = 'commit_seq'",
            [],
        )?;
        let commit_seq = read_commit_seq(&self.conn)?;

        {
            let mut published = self
                .db
                .published()
                .write()
                .map_err(|_| StoreError::LockPoisoned("published index"))?;
            self.conn.execute_batch("COMMIT")?;
            *published = Arc::new(std::mem::take(&mut self.index));
        }
        self.finish(&unreferenced);
        self.db.set_commit_seq(commit_seq);

        let notification = Notification {
            commit_seq,
            record_changes: std::mem::take(&mut self.changes).into_changes(),
            view_changes: std::mem::take(&mut self.view_changes).into_changes(),
        };
        tracing::trace!(
            commit_seq,
            records = notification.record_changes.len(),
            groups = notification.view_changes.len(),
            "transaction committed"
        );
        // Still holding the writer lock, so subscribers see commit order.
        self.db.bus().publish(notification)?;
        Ok(hooks)
    }

    /// Mark the transaction committed and delete files nothing references.
    /// Runs under the writer lock, so no other transaction can pick the
    /// content up again in between.
    fn finish(&mut self, unreferenced: &[PathBuf]) {
        self.finished = true;
        self.created_files.clear();
        attachments::delete_files(unreferenced);
    }
}

impl ReadAccess for WriteTransaction<'_> {
    fn connection(&self) -> &Connection {
        &self.conn
    }

    fn index(&self) -> &IndexState {
        &self.index
    }
}

impl Drop for WriteTransaction<'_> {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        if let Err(e) = self.conn.execute_batch("ROLLBACK") {
            tracing::warn!(error = %e, "rollback failed");
        }
        attachments::delete_files(&self.created_files);
    }
}

fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}
