//! Database migration runner.
//!
//! Migrations are executed in order every time a [`Database`](crate::Database)
//! is opened.  Each migration is guarded by a `user_version` pragma so it runs
//! exactly once.

pub mod v001_initial;
pub mod v002_store_meta;

use rusqlite::Connection;

use crate::error::{Result, StoreError};

/// Current schema version.  Bump this and add a new migration module whenever
/// the schema changes.
pub const CURRENT_VERSION: u32 = 2;

/// Run all pending migrations against the open connection.
///
/// The function reads `PRAGMA user_version` to determine which migrations have
/// already been applied, then executes any outstanding ones in order.
pub fn run_migrations(conn: &Connection) -> Result<()> {
    let current: u32 = conn.pragma_query_value(None, "user_version", |row| row.get(0))?;

    tracing::info!(
        current_version = current,
        target_version = CURRENT_VERSION,
        "checking database migrations"
    );

    if current > CURRENT_VERSION {
        return Err(StoreError::Migration(format!(
            "database schema v{current} is newer than supported v{CURRENT_VERSION}"
        )));
    }

    if current < 1 {
        tracing::info!("applying migration v001_initial");
        v001_initial::up(conn).map_err(|e| StoreError::Migration(e.to_string()))?;
        conn.pragma_update(None, "user_version", 1)?;
    }

    if current < 2 {
        tracing::info!("applying migration v002_store_meta");
        v002_store_meta::up(conn).map_err(|e| StoreError::Migration(e.to_string()))?;
        conn.pragma_update(None, "user_version", 2)?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn migrations_are_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        run_migrations(&conn).unwrap();
        run_migrations(&conn).unwrap();

        let version: u32 = conn
            .pragma_query_value(None, "user_version", |row| row.get(0))
            .unwrap();
        assert_eq!(version, CURRENT_VERSION);

        let seq: i64 = conn
            .query_row(
                "SELECT value FROM store_meta WHERE key = 'commit_seq'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(seq, 0);
    }

    #[test]
    fn rejects_newer_schema() {
        let conn = Connection::open_in_memory().unwrap();
        conn.pragma_update(None, "user_version", CURRENT_VERSION + 1)
            .unwrap();
        assert!(matches!(
            run_migrations(&conn),
            Err(StoreError::Migration(_))
        ));
    }
}
