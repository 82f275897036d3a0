use thiserror::Error;

use relay_shared::PayloadError;

use crate::record::Collection;

/// Errors produced by the store layer.
#[derive(Error, Debug)]
pub enum StoreError {
    /// SQLite error.
    #[error("Database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// Failed to determine a platform data directory.
    #[error("Could not determine application data directory")]
    NoDataDir,

    /// Generic I/O error (e.g. creating the database directory).
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// A query expected exactly one row but found none.
    #[error("Record not found")]
    NotFound,

    /// Migration failure.
    #[error("Migration error: {0}")]
    Migration(String),

    /// Record encoding or decoding failure.
    #[error("Record codec error: {0}")]
    Codec(#[from] bincode::Error),

    /// JSON error while importing or exporting a backup.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Backup written in a format this build does not read.
    #[error("Unsupported backup format {0}")]
    UnsupportedBackup(u32),

    /// Hex decoding error.
    #[error("Hex decode error: {0}")]
    Hex(#[from] hex::FromHexError),

    /// `insert` found an existing record with the same id.
    #[error("Duplicate record {collection}/{id}")]
    DuplicateId { collection: Collection, id: String },

    /// A participant-keyed thread was requested with nobody in it.
    #[error("Thread needs at least one participant")]
    NoParticipants,

    /// A record references a thread that does not exist.
    #[error("Thread not found: {0}")]
    MissingThread(String),

    /// View registered before one of the views it depends on.
    #[error("View {view} depends on unregistered view {dependency}")]
    MissingViewDependency { view: String, dependency: String },

    /// A view with the same name was already registered.
    #[error("View already registered: {0}")]
    ViewAlreadyRegistered(String),

    /// The background registration worker is gone.
    #[error("View registration worker unavailable")]
    RegistrationClosed,

    /// Integrity check or record decoding failed; the store must not be used.
    #[error("Store corrupted: {0}")]
    Corrupt(String),

    /// A mutex or rwlock was poisoned by a panicking holder.
    #[error("Lock poisoned: {0}")]
    LockPoisoned(&'static str),

    /// Malformed inbound payload.
    #[error("Payload error: {0}")]
    Payload(#[from] PayloadError),
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, StoreError>;

impl StoreError {
    /// True for failures that should abort startup rather than be retried.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Corrupt(_) | Self::Migration(_))
    }
}
