use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::database::{Database, StoreFiles};
use crate::error::{Result, StoreError};
use crate::record::{Collection, StoredRecord};
use crate::transaction::{ReadAccess, WriteTransaction};

pub const BACKUP_FORMAT: u32 = 1;

/// Full logical backup of every record, serialized to JSON.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupPayload {
    /// ISO 8601 timestamp of when the backup was created
    pub created_at: String,
    /// App version that produced the backup
    pub version: String,
    pub format: u32,
    /// Commit sequence of the snapshot the backup was taken from
    pub commit_seq: u64,
    pub records: Vec<BackupRecord>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupRecord {
    pub collection: String,
    pub unique_id: String,
    pub version: i64,
    /// bincode record blob, hex encoded
    pub data_hex: String,
}

#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImportStats {
    pub imported: usize,
    /// Already present; existing records are never overwritten.
    pub skipped_existing: usize,
    /// Unknown collection or undecodable data.
    pub skipped_invalid: usize,
}

impl Database {
    /// Export every record from one consistent snapshot.
    pub fn export_backup(&self) -> Result<BackupPayload> {
        self.read(|txn| {
            let mut stmt = txn.connection().prepare(
                "SELECT collection, unique_id, version, data FROM records
                 ORDER BY collection, unique_id",
            )?;
            let rows = stmt.query_map([], |row| {
                Ok(BackupRecord {
                    collection: row.get(0)?,
                    unique_id: row.get(1)?,
                    version: row.get(2)?,
                    data_hex: hex::encode(row.get::<_, Vec<u8>>(3)?),
                })
            })?;
            let records = rows.collect::<rusqlite::Result<Vec<_>>>()?;

            tracing::info!(records = records.len(), commit_seq = txn.commit_seq(), "backup exported");
            Ok(BackupPayload {
                created_at: chrono::Utc::now().to_rfc3339(),
                version: env!("CARGO_PKG_VERSION").to_string(),
                format: BACKUP_FORMAT,
                commit_seq: txn.commit_seq(),
                records,
            })
        })
    }

    pub fn export_backup_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(&self.export_backup()?)?)
    }

    /// Import a backup in one transaction, merging with existing data
    /// (insert-or-ignore).  Views are updated like for any other write.
    pub fn import_backup(&self, payload: &BackupPayload) -> Result<ImportStats> {
        if payload.format != BACKUP_FORMAT {
            return Err(StoreError::UnsupportedBackup(payload.format));
        }

        let stats = self.write(|txn| {
            let mut stats = ImportStats::default();
            for entry in &payload.records {
                let Some(collection) = Collection::parse(&entry.collection) else {
                    tracing::warn!(collection = %entry.collection, "skipping record of unknown collection");
                    stats.skipped_invalid += 1;
                    continue;
                };
                let record = match hex::decode(&entry.data_hex)
                    .map_err(StoreError::from)
                    .and_then(|data| StoredRecord::decode(collection, &data))
                {
                    Ok(record) if record.unique_id() == entry.unique_id => record,
                    Ok(_) | Err(_) => {
                        tracing::warn!(collection = %collection, id = %entry.unique_id, "skipping undecodable record");
                        stats.skipped_invalid += 1;
                        continue;
                    }
                };

                if txn.exists(collection, &entry.unique_id)? {
                    stats.skipped_existing += 1;
                    continue;
                }
                txn.insert_stored(&record)?;
                stats.imported += 1;
            }
            Ok(stats)
        })?;

        tracing::info!(
            imported = stats.imported,
            existing = stats.skipped_existing,
            invalid = stats.skipped_invalid,
            "backup imported"
        );
        Ok(stats)
    }

    pub fn import_backup_json(&self, json: &str) -> Result<ImportStats> {
        let payload: BackupPayload = serde_json::from_str(json)?;
        self.import_backup(&payload)
    }

    /// Checkpoint the WAL and copy the database file set into `dir`.
    /// Writers are held off for the duration of the copy.
    pub fn backup_files_to(&self, dir: &Path) -> Result<StoreFiles> {
        std::fs::create_dir_all(dir)?;
        let target = StoreFiles::in_dir(dir);

        let writer = self.lock_writer()?;
        writer.query_row("PRAGMA wal_checkpoint(TRUNCATE)", [], |_| Ok(()))?;
        copy_file_set(self.files(), &target)?;
        drop(writer);

        tracing::info!(target = %target.database.display(), "database files copied");
        Ok(target)
    }

    /// Replace the file set at `target` with the copy at `backup`.  The
    /// store at `target` must not be open.
    pub fn restore_files(backup: &StoreFiles, target: &StoreFiles) -> Result<()> {
        if !backup.database.exists() {
            return Err(StoreError::NotFound);
        }
        if let Some(dir) = target.dir() {
            std::fs::create_dir_all(dir)?;
        }
        for path in target.all() {
            if path.exists() {
                std::fs::remove_file(path)?;
            }
        }
        copy_file_set(backup, target)?;
        tracing::info!(target = %target.database.display(), "database files restored");
        Ok(())
    }
}

/// Copy each member of the set that exists; sidecars are optional.
fn copy_file_set(from: &StoreFiles, to: &StoreFiles) -> Result<()> {
    for (src, dst) in from.all().into_iter().zip(to.all()) {
        if src.exists() {
            std::fs::copy(src, dst)?;
        }
    }
    Ok(())
}

impl WriteTransaction<'_> {
    /// Insert a decoded record of any collection.
    pub fn insert_stored(&mut self, record: &StoredRecord) -> Result<()> {
        match record {
            StoredRecord::Thread(t) => self.insert(t),
            StoredRecord::Message(m) => self.insert(m),
            StoredRecord::Attachment(a) => self.insert(a),
            StoredRecord::Tag(t) => self.insert(t),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::StoreOptions;
    use crate::models::{Message, Tag};
    use crate::test_support::{open_store, rid};
    use crate::threads::ThreadQueries;

    fn populate(db: &Database) -> String {
        db.write(|txn| {
            let thread = txn.get_or_create_thread_with_participants(&[rid("me"), rid("a")])?;
            txn.save_message(&Message::incoming(&thread.unique_id, rid("a"), 1, 10, Some("hi".into())))?;
            txn.save_tag(&Tag::new("ops"))?;
            Ok(thread.unique_id)
        })
        .unwrap()
    }

    #[test]
    fn export_import_restores_records_and_views() {
        let (_dir, source) = open_store();
        let thread_id = populate(&source);
        let json = source.export_backup_json().unwrap();

        let (_dir2, target) = open_store();
        let stats = target.import_backup_json(&json).unwrap();
        assert_eq!(stats.imported, 3);
        target
            .read(|txn| {
                assert_eq!(txn.inbox_thread_ids()?, vec![thread_id.clone()]);
                assert_eq!(txn.unread_count(&thread_id)?, 1);
                Ok(())
            })
            .unwrap();

        // Importing again changes nothing.
        let again = target.import_backup_json(&json).unwrap();
        assert_eq!(again.imported, 0);
        assert_eq!(again.skipped_existing, 3);
    }

    #[test]
    fn invalid_entries_are_skipped() {
        let (_dir, db) = open_store();
        let payload = BackupPayload {
            created_at: chrono::Utc::now().to_rfc3339(),
            version: "test".into(),
            format: BACKUP_FORMAT,
            commit_seq: 0,
            records: vec![
                BackupRecord {
                    collection: "channels".into(),
                    unique_id: "x".into(),
                    version: 1,
                    data_hex: String::new(),
                },
                BackupRecord {
                    collection: "threads".into(),
                    unique_id: "y".into(),
                    version: 1,
                    data_hex: "zz".into(),
                },
            ],
        };
        let stats = db.import_backup(&payload).unwrap();
        assert_eq!(stats.skipped_invalid, 2);
        assert_eq!(stats.imported, 0);
    }

    #[test]
    fn file_copy_round_trip() {
        let (dir, db) = open_store();
        let thread_id = populate(&db);
        let copy = db.backup_files_to(&dir.path().join("backup")).unwrap();
        assert!(copy.database.exists());
        drop(db);

        let restored_dir = tempfile::tempdir().unwrap();
        let target = StoreFiles::in_dir(restored_dir.path());
        Database::restore_files(&copy, &target).unwrap();

        let restored = Database::open(target, StoreOptions::default()).unwrap();
        let thread = restored.read(|txn| txn.thread(&thread_id)).unwrap();
        assert!(thread.is_some());
        let version = restored
            .read(|txn| txn.version(Collection::Threads, &thread_id))
            .unwrap();
        assert!(version.is_some());
    }
}
