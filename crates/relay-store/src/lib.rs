//! # relay-store
//!
//! Local persistence for Relay threads, messages, attachments and tags,
//! backed by SQLite in WAL mode.
//!
//! Records are bincode blobs in a single `records` table.  Secondary
//! indexes ("views") are kept in memory, updated inside the same write
//! transaction as the records they index and published atomically at
//! commit together with a change [`Notification`](notifications::Notification).
//!
//! Reads go through [`Database::read`] and see one consistent snapshot;
//! writes go through [`Database::write`] and are serialized.  Domain
//! queries are extension traits over [`ReadAccess`]; bring them into scope
//! with `use relay_store::prelude::*`.

pub mod attachments;
pub mod backup;
pub mod control;
pub mod database;
pub mod environment;
pub mod inbound;
pub mod messages;
pub mod migrations;
pub mod models;
pub mod notifications;
pub mod record;
pub mod search;
pub mod sending;
pub mod services;
pub mod tags;
pub mod threads;
pub mod transaction;
pub mod views;

pub mod error;

#[cfg(test)]
mod test_support;

pub use database::{Database, StoreFiles, StoreOptions, UnseenPolicy};
pub use environment::{Environment, EnvironmentBuilder};
pub use error::{Result, StoreError};
pub use models::*;
pub use record::Collection;
pub use transaction::{ReadAccess, ReadTransaction, WriteTransaction};

/// Query traits for use inside `read` and `write` closures.
pub mod prelude {
    pub use crate::attachments::AttachmentQueries;
    pub use crate::messages::MessageQueries;
    pub use crate::search::SearchQueries;
    pub use crate::tags::TagQueries;
    pub use crate::threads::ThreadQueries;
    pub use crate::transaction::ReadAccess;
}
