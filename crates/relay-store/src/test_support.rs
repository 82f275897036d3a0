use std::sync::Arc;

use relay_shared::RecipientId;

use crate::database::{Database, StoreOptions};

/// Fresh store in a temp dir with every built-in view ready.  Keep the
/// `TempDir` alive for as long as the database is used.
pub(crate) fn open_store() -> (tempfile::TempDir, Arc<Database>) {
    let dir = tempfile::tempdir().unwrap();
    let db = Database::open_in(dir.path(), StoreOptions::default()).unwrap();
    db.register_builtin_views().unwrap();
    (dir, db)
}

pub(crate) fn rid(id: &str) -> RecipientId {
    RecipientId::from(id)
}
