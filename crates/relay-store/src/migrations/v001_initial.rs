//! v001 -- Initial schema creation.
//!
//! Every collection shares one `records` table keyed by
//! `(collection, unique_id)`.  Attribute sets are opaque bincode blobs; the
//! index engine keeps all secondary orderings in memory.

use rusqlite::Connection;

/// SQL executed when upgrading from version 0 to version 1.
const UP_SQL: &str = r#"
-- ----------------------------------------------------------------
-- Records
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS records (
    collection  TEXT NOT NULL,                -- threads / interactions / attachments / tags
    unique_id   TEXT NOT NULL,
    data        BLOB NOT NULL,                -- bincode-encoded attribute set
    version     INTEGER NOT NULL DEFAULT 1,   -- bumped on every update
    updated_at  INTEGER NOT NULL,             -- ms since epoch

    PRIMARY KEY (collection, unique_id)
) WITHOUT ROWID;
"#;

/// Apply the initial migration.
pub fn up(conn: &Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(UP_SQL)
}
