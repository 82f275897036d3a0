//! Database connection management.
//!
//! The [`Database`] owns one writer connection and a small pool of read-only
//! connections over the same SQLite file in WAL mode.  Writers are exclusive;
//! readers see the snapshot that was current when their transaction began.
//!
//! The in-memory view state is published together with each commit: the
//! writer runs `COMMIT` and swaps the published [`IndexState`] under the same
//! write lock, and readers pin their SQLite snapshot and clone the index under
//! the read lock, so a reader never pairs records from one commit with views
//! from another.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::time::Duration;

use directories::ProjectDirs;
use rusqlite::{Connection, OpenFlags};

use crate::error::{Result, StoreError};
use crate::migrations;
use crate::notifications::{NotificationBus, Subscription};
use crate::record::{corrupt, Collection, StoredRecord};
use crate::transaction::{ReadAccess, ReadTransaction, WriteTransaction};
use crate::views::builtin::builtin_views;
use crate::views::{IndexState, ViewDefinition};

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

// ---------------------------------------------------------------------------
// Options
// ---------------------------------------------------------------------------

/// Which messages count as "unseen".
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum UnseenPolicy {
    /// Every unread message, whether or not it affects unread counts.
    #[default]
    AllUnread,
    /// Exactly the members of the unread view.
    SameAsUnread,
}

#[derive(Debug, Clone)]
pub struct StoreOptions {
    /// Idle read connections kept open.
    pub reader_pool_size: usize,
    /// Per-subscriber notification queue length.
    pub notification_capacity: usize,
    pub unseen_policy: UnseenPolicy,
    /// At-rest key, applied with `PRAGMA key` when built with `sqlcipher`.
    pub key: Option<String>,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self {
            reader_pool_size: 4,
            notification_capacity: 256,
            unseen_policy: UnseenPolicy::default(),
            key: None,
        }
    }
}

/// The database file and its WAL sidecars, handled as one unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreFiles {
    pub database: PathBuf,
    pub wal: PathBuf,
    pub shm: PathBuf,
}

impl StoreFiles {
    pub const DATABASE_FILE: &'static str = "relay.sqlite";

    pub fn for_database(path: impl Into<PathBuf>) -> Self {
        let database = path.into();
        let sidecar = |suffix: &str| {
            let mut name = database.as_os_str().to_owned();
            name.push(suffix);
            PathBuf::from(name)
        };
        Self {
            wal: sidecar("-wal"),
            shm: sidecar("-shm"),
            database,
        }
    }

    pub fn in_dir(dir: &Path) -> Self {
        Self::for_database(dir.join(Self::DATABASE_FILE))
    }

    /// Platform data directory:
    /// - Linux:   `~/.local/share/relay/relay.sqlite`
    /// - macOS:   `~/Library/Application Support/com.relay.relay/relay.sqlite`
    /// - Windows: `{FOLDERID_RoamingAppData}\relay\relay\data\relay.sqlite`
    pub fn default_location() -> Result<Self> {
        let project_dirs = ProjectDirs::from("com", "relay", "relay").ok_or(StoreError::NoDataDir)?;
        Ok(Self::in_dir(project_dirs.data_dir()))
    }

    pub fn all(&self) -> [&Path; 3] {
        [&self.database, &self.wal, &self.shm]
    }

    pub fn dir(&self) -> Option<&Path> {
        self.database.parent()
    }
}

// ---------------------------------------------------------------------------
// Database
// ---------------------------------------------------------------------------

struct RegistrationJob {
    definition: Arc<dyn ViewDefinition>,
    completion: Box<dyn FnOnce(Result<()>) + Send>,
}

#[derive(Default)]
struct Registry {
    /// Every accepted registration, built or pending, in order.
    names: Vec<String>,
    worker: Option<Sender<RegistrationJob>>,
}

pub struct Database {
    files: StoreFiles,
    options: StoreOptions,
    writer: Mutex<Connection>,
    readers: Mutex<Vec<Connection>>,
    published: RwLock<Arc<IndexState>>,
    last_commit_seq: AtomicU64,
    bus: NotificationBus,
    registry: Mutex<Registry>,
    this: Weak<Database>,
}

impl Database {
    /// Open (or create) the store in the platform data directory.
    pub fn open_default(options: StoreOptions) -> Result<Arc<Self>> {
        let files = StoreFiles::default_location()?;
        tracing::info!(path = %files.database.display(), "opening database");
        Self::open(files, options)
    }

    /// Open (or create) `relay.sqlite` inside `dir`.
    pub fn open_in(dir: &Path, options: StoreOptions) -> Result<Arc<Self>> {
        Self::open(StoreFiles::in_dir(dir), options)
    }

    /// Open the store, run migrations and verify integrity.  Corruption is
    /// reported as [`StoreError::Corrupt`] and must block startup.
    pub fn open(files: StoreFiles, options: StoreOptions) -> Result<Arc<Self>> {
        if let Some(dir) = files.dir() {
            std::fs::create_dir_all(dir)?;
        }

        let writer = Connection::open(&files.database)?;
        apply_key(&writer, &options)?;
        writer.busy_timeout(BUSY_TIMEOUT)?;
        let mode: String = writer
            .pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))
            .map_err(not_a_database)?;
        writer.pragma_update(None, "synchronous", "NORMAL")?;

        check_integrity(&writer)?;
        migrations::run_migrations(&writer)?;

        let commit_seq = read_commit_seq(&writer)?;
        tracing::info!(
            path = %files.database.display(),
            journal_mode = %mode,
            commit_seq,
            "database opened"
        );

        Ok(Arc::new_cyclic(|this| Self {
            bus: NotificationBus::new(options.notification_capacity),
            files,
            options,
            writer: Mutex::new(writer),
            readers: Mutex::new(Vec::new()),
            published: RwLock::new(Arc::new(IndexState::default())),
            last_commit_seq: AtomicU64::new(commit_seq),
            registry: Mutex::new(Registry::default()),
            this: this.clone(),
        }))
    }

    pub fn files(&self) -> &StoreFiles {
        &self.files
    }

    pub fn options(&self) -> &StoreOptions {
        &self.options
    }

    /// Sequence number of the last committed transaction that changed data.
    pub fn commit_seq(&self) -> u64 {
        self.last_commit_seq.load(Ordering::Acquire)
    }

    pub fn subscribe(&self) -> Result<Subscription> {
        self.bus.subscribe()
    }

    pub(crate) fn bus(&self) -> &NotificationBus {
        &self.bus
    }

    pub(crate) fn published(&self) -> &RwLock<Arc<IndexState>> {
        &self.published
    }

    pub(crate) fn set_commit_seq(&self, seq: u64) {
        self.last_commit_seq.store(seq, Ordering::Release);
    }

    // -----------------------------------------------------------------------
    // Transactions
    // -----------------------------------------------------------------------

    /// Run `f` against a consistent snapshot.
    pub fn read<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&ReadTransaction<'_>) -> Result<T>,
    {
        let conn = self.take_reader()?;
        let result = {
            let txn = ReadTransaction::begin(self, &conn)?;
            f(&txn)
        };
        self.return_reader(conn);
        result
    }

    /// Run `f` in an exclusive read-write transaction.  `Ok` commits and
    /// publishes one notification; `Err` rolls everything back.
    ///
    /// Must not be called while the same thread holds another write
    /// transaction or is the only consumer of a full notification queue.
    pub fn write<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut WriteTransaction<'_>) -> Result<T>,
    {
        let mut txn = WriteTransaction::begin(self)?;
        match f(&mut txn) {
            Ok(value) => {
                let hooks = txn.commit()?;
                for hook in hooks {
                    hook();
                }
                Ok(value)
            }
            Err(e) => {
                tracing::debug!(error = %e, "write transaction aborted");
                drop(txn);
                Err(e)
            }
        }
    }

    pub(crate) fn lock_writer(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.writer
            .lock()
            .map_err(|_| StoreError::LockPoisoned("writer connection"))
    }

    pub(crate) fn take_reader(&self) -> Result<Connection> {
        let pooled = self
            .readers
            .lock()
            .map_err(|_| StoreError::LockPoisoned("reader pool"))?
            .pop();
        match pooled {
            Some(conn) => Ok(conn),
            None => {
                let conn = Connection::open_with_flags(
                    &self.files.database,
                    OpenFlags::SQLITE_OPEN_READ_ONLY
                        | OpenFlags::SQLITE_OPEN_NO_MUTEX
                        | OpenFlags::SQLITE_OPEN_URI,
                )?;
                apply_key(&conn, &self.options)?;
                conn.busy_timeout(BUSY_TIMEOUT)?;
                Ok(conn)
            }
        }
    }

    pub(crate) fn return_reader(&self, conn: Connection) {
        if let Ok(mut pool) = self.readers.lock() {
            if pool.len() < self.options.reader_pool_size {
                pool.push(conn);
            }
        }
    }

    /// Fold the WAL back into the main database file.
    pub fn checkpoint(&self) -> Result<()> {
        let writer = self.lock_writer()?;
        writer.query_row("PRAGMA wal_checkpoint(TRUNCATE)", [], |_| Ok(()))?;
        tracing::debug!("wal checkpoint complete");
        Ok(())
    }

    /// Delete every record, updating all views.  Used to reset a store
    /// between tests.
    pub fn remove_all_records(&self) -> Result<usize> {
        self.write(|txn| {
            let mut removed = 0;
            for collection in Collection::ALL {
                for id in txn.ids(collection)? {
                    if txn.remove_record(collection, &id)? {
                        removed += 1;
                    }
                }
            }
            Ok(removed)
        })
    }

    // -----------------------------------------------------------------------
    // View registration
    // -----------------------------------------------------------------------

    pub fn is_view_ready(&self, name: &str) -> bool {
        self.published
            .read()
            .map(|state| state.is_ready(name))
            .unwrap_or(false)
    }

    /// Queue `definition` for a background build.  Views are built one at a
    /// time in registration order; `completion` runs once the view is
    /// published (or failed to build) and is the only readiness signal.
    pub fn register_view<F>(&self, definition: Arc<dyn ViewDefinition>, completion: F) -> Result<()>
    where
        F: FnOnce(Result<()>) + Send + 'static,
    {
        let mut registry = self
            .registry
            .lock()
            .map_err(|_| StoreError::LockPoisoned("view registry"))?;

        let name = definition.name().to_string();
        if registry.names.contains(&name) {
            return Err(StoreError::ViewAlreadyRegistered(name));
        }
        for dependency in definition.dependencies() {
            if !registry.names.iter().any(|n| n == dependency) {
                return Err(StoreError::MissingViewDependency {
                    view: name,
                    dependency: dependency.to_string(),
                });
            }
        }

        if registry.worker.is_none() {
            let (tx, rx) = mpsc::channel();
            let this = self.this.clone();
            std::thread::Builder::new()
                .name("relay-views".into())
                .spawn(move || run_registrations(this, rx))?;
            registry.worker = Some(tx);
        }

        let job = RegistrationJob {
            definition,
            completion: Box::new(completion),
        };
        registry
            .worker
            .as_ref()
            .ok_or(StoreError::RegistrationClosed)?
            .send(job)
            .map_err(|_| StoreError::RegistrationClosed)?;
        registry.names.push(name.clone());

        tracing::debug!(view = %name, "view registration queued");
        Ok(())
    }

    /// Register and wait for the build to finish.  Must not be called while
    /// holding a write transaction.
    pub fn register_view_blocking(&self, definition: Arc<dyn ViewDefinition>) -> Result<()> {
        let (tx, rx) = mpsc::channel();
        self.register_view(definition, move |result| {
            let _ = tx.send(result);
        })?;
        rx.recv().map_err(|_| StoreError::RegistrationClosed)?
    }

    /// Register every built-in view in dependency order and wait for all of
    /// them.
    pub fn register_builtin_views(&self) -> Result<()> {
        let mut pending = Vec::new();
        for definition in builtin_views(self.options.unseen_policy) {
            let (tx, rx) = mpsc::channel();
            self.register_view(definition, move |result| {
                let _ = tx.send(result);
            })?;
            pending.push(rx);
        }
        for rx in pending {
            rx.recv().map_err(|_| StoreError::RegistrationClosed)??;
        }
        Ok(())
    }

    fn build_view(&self, definition: Arc<dyn ViewDefinition>) -> Result<()> {
        let writer = self.lock_writer()?;
        let current = Arc::clone(
            &*self
                .published
                .read()
                .map_err(|_| StoreError::LockPoisoned("published index"))?,
        );

        for dependency in definition.dependencies() {
            if !current.is_ready(dependency) {
                return Err(StoreError::MissingViewDependency {
                    view: definition.name().to_string(),
                    dependency: dependency.to_string(),
                });
            }
        }

        let records = load_collection(&writer, definition.collection())?;
        let count = records.len();
        let name = definition.name().to_string();

        let mut next = (*current).clone();
        next.push_view(definition, records);
        let rows = next.view(&name).map_or(0, |v| v.len());

        *self
            .published
            .write()
            .map_err(|_| StoreError::LockPoisoned("published index"))? = Arc::new(next);
        drop(writer);

        tracing::info!(view = %name, scanned = count, rows, "view ready");
        Ok(())
    }
}

fn run_registrations(db: Weak<Database>, jobs: Receiver<RegistrationJob>) {
    while let Ok(job) = jobs.recv() {
        let Some(db) = db.upgrade() else {
            break;
        };
        let name = job.definition.name().to_string();
        let result = db.build_view(job.definition);
        if let Err(e) = &result {
            tracing::error!(view = %name, error = %e, "view registration failed");
        }
        drop(db);
        (job.completion)(result);
    }
    tracing::debug!("view registration worker stopped");
}

// ---------------------------------------------------------------------------
// Connection helpers
// ---------------------------------------------------------------------------

#[cfg(feature = "sqlcipher")]
fn apply_key(conn: &Connection, options: &StoreOptions) -> Result<()> {
    if let Some(key) = &options.key {
        conn.pragma_update(None, "key", key)?;
    }
    Ok(())
}

#[cfg(not(feature = "sqlcipher"))]
fn apply_key(_conn: &Connection, options: &StoreOptions) -> Result<()> {
    if options.key.is_some() {
        tracing::warn!("at-rest key ignored: built without the sqlcipher feature");
    }
    Ok(())
}

/// SQLite reports a damaged header as `NotADatabase`; surface it as corruption.
fn not_a_database(err: rusqlite::Error) -> StoreError {
    match err {
        rusqlite::Error::SqliteFailure(e, msg) if e.code == rusqlite::ErrorCode::NotADatabase => {
            StoreError::Corrupt(msg.unwrap_or_else(|| e.to_string()))
        }
        other => StoreError::Sqlite(other),
    }
}

fn check_integrity(conn: &Connection) -> Result<()> {
    let mut stmt = conn.prepare("PRAGMA quick_check").map_err(not_a_database)?;
    let findings = stmt
        .query_map([], |row| row.get::<_, String>(0))?
        .collect::<rusqlite::Result<Vec<_>>>()
        .map_err(|e| StoreError::Corrupt(e.to_string()))?;
    if findings.len() == 1 && findings[0] == "ok" {
        return Ok(());
    }
    tracing::error!(findings = ?findings, "integrity check failed");
    Err(StoreError::Corrupt(findings.join("; ")))
}

pub(crate) fn read_commit_seq(conn: &Connection) -> Result<u64> {
    let seq: i64 = conn.query_row(
        "SELECT value FROM store_meta WHERE key = 'commit_seq'",
        [],
        |row| row.get(0),
    )?;
    Ok(seq.max(0) as u64)
}

/// Decode every record of `collection`; a record that fails to decode is
/// treated as corruption.
pub(crate) fn load_collection(conn: &Connection, collection: Collection) -> Result<Vec<StoredRecord>> {
    let mut stmt = conn.prepare(
        "SELECT unique_id, data FROM records WHERE collection = ?1 ORDER BY unique_id",
    )?;
    let rows = stmt.query_map([collection.as_str()], |row| {
        Ok((row.get::<_, String>(0)?, row.get::<_, Vec<u8>>(1)?))
    })?;

    let mut records = Vec::new();
    for row in rows {
        let (id, data) = row?;
        let record = StoredRecord::decode(collection, &data).map_err(|e| corrupt(collection, &id, e))?;
        records.push(record);
    }
    Ok(records)
}
