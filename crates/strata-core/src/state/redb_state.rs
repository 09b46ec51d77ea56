//! # redb-backed State Store
//!
//! Each conditional write runs inside one redb write transaction. redb
//! serializes writers, so the existence check and the write it guards can
//! never interleave with another claimant's.

use super::{RecordKey, RecordUpdate, StagedRecord, StateStore};
use crate::types::{StrataError, storage_err};
use redb::{Database, ReadableDatabase, ReadableTable, TableDefinition};
use std::path::Path;

/// (identifier_stem, id_value) -> JSON `StagedRecord`
const RECORDS: TableDefinition<(&str, &str), &[u8]> = TableDefinition::new("staged_records");

/// (identifier_stem, id_value) -> (), ordered by numeric id value
const WATERMARKS: TableDefinition<(&str, i64), ()> = TableDefinition::new("watermarks");

/// Disk-backed staged state store.
pub struct RedbStateStore {
    db: Database,
}

impl std::fmt::Debug for RedbStateStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedbStateStore").finish_non_exhaustive()
    }
}

impl RedbStateStore {
    /// Open or create a state database at the given path.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StrataError> {
        let db = Database::create(path.as_ref()).map_err(|e| StrataError::IoError(e.to_string()))?;
        let write_txn = db.begin_write().map_err(storage_err)?;
        {
            write_txn.open_table(RECORDS).map_err(storage_err)?;
            write_txn.open_table(WATERMARKS).map_err(storage_err)?;
        }
        write_txn.commit().map_err(storage_err)?;
        Ok(Self { db })
    }
}

fn encode(record: &StagedRecord) -> Result<Vec<u8>, StrataError> {
    serde_json::to_vec(record).map_err(|e| StrataError::SerializationError(e.to_string()))
}

fn decode(bytes: &[u8]) -> Result<StagedRecord, StrataError> {
    serde_json::from_slice(bytes).map_err(|e| StrataError::DeserializationError(e.to_string()))
}

impl StateStore for RedbStateStore {
    fn get(&self, key: &RecordKey) -> Result<Option<StagedRecord>, StrataError> {
        let read_txn = self.db.begin_read().map_err(storage_err)?;
        let table = read_txn.open_table(RECORDS).map_err(storage_err)?;
        table
            .get((key.identifier_stem.as_str(), key.id_value.as_str()))
            .map_err(storage_err)?
            .map(|data| decode(data.value()))
            .transpose()
    }

    fn insert_if_absent(
        &self,
        record: StagedRecord,
        watermark: Option<i64>,
    ) -> Result<bool, StrataError> {
        let key = (record.key.identifier_stem.as_str(), record.key.id_value.as_str());
        let write_txn = self.db.begin_write().map_err(storage_err)?;
        {
            let mut records = write_txn.open_table(RECORDS).map_err(storage_err)?;
            if records.get(key).map_err(storage_err)?.is_some() {
                drop(records);
                write_txn.abort().map_err(storage_err)?;
                return Ok(false);
            }
            let bytes = encode(&record)?;
            records.insert(key, bytes.as_slice()).map_err(storage_err)?;

            if let Some(id_value) = watermark {
                let mut watermarks = write_txn.open_table(WATERMARKS).map_err(storage_err)?;
                watermarks
                    .insert((key.0, id_value), ())
                    .map_err(storage_err)?;
            }
        }
        write_txn.commit().map_err(storage_err)?;
        Ok(true)
    }

    fn mutate(&self, key: &RecordKey, update: &mut RecordUpdate<'_>) -> Result<bool, StrataError> {
        let slot = (key.identifier_stem.as_str(), key.id_value.as_str());
        let write_txn = self.db.begin_write().map_err(storage_err)?;
        let changed = {
            let mut records = write_txn.open_table(RECORDS).map_err(storage_err)?;
            let current = records
                .get(slot)
                .map_err(storage_err)?
                .map(|data| decode(data.value()))
                .transpose()?;
            let Some(mut record) = current else {
                return Err(StrataError::NotFound(format!("staged record {key}")));
            };
            if update(&mut record)? {
                let bytes = encode(&record)?;
                records.insert(slot, bytes.as_slice()).map_err(storage_err)?;
                true
            } else {
                false
            }
        };
        if changed {
            write_txn.commit().map_err(storage_err)?;
        } else {
            write_txn.abort().map_err(storage_err)?;
        }
        Ok(changed)
    }

    fn query_max(&self, identifier_stem: &str) -> Result<i64, StrataError> {
        let read_txn = self.db.begin_read().map_err(storage_err)?;
        let table = read_txn.open_table(WATERMARKS).map_err(storage_err)?;
        let last = table
            .range((identifier_stem, i64::MIN)..=(identifier_stem, i64::MAX))
            .map_err(storage_err)?
            .next_back()
            .transpose()
            .map_err(storage_err)?;
        match last {
            Some((key, _)) => Ok(key.value().1),
            None => Err(StrataError::EmptyIndex(identifier_stem.to_string())),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use super::*;
    use crate::state::tests::{STEM, exercise_lifecycle, exercise_racing_claims};
    use std::sync::Arc;
    use tempfile::tempdir;

    #[test]
    fn redb_lifecycle() {
        let temp = tempdir().expect("temp dir");
        let store = RedbStateStore::open(temp.path().join("state.redb")).expect("open");
        exercise_lifecycle(&store);
    }

    #[test]
    fn redb_racing_claims() {
        let temp = tempdir().expect("temp dir");
        let store = RedbStateStore::open(temp.path().join("state.redb")).expect("open");
        exercise_racing_claims(Arc::new(store), 16);
    }

    #[test]
    fn watermarks_survive_reopen() {
        let temp = tempdir().expect("temp dir");
        let path = temp.path().join("state.redb");
        {
            let store = RedbStateStore::open(&path).expect("open");
            for id in [1001, 998, 1000] {
                assert!(store.claim(STEM, id, "Patient").expect("claim"));
            }
        }
        let store = RedbStateStore::open(&path).expect("reopen");
        assert_eq!(store.query_max(STEM).expect("max"), 1001);
        assert!(matches!(
            store.query_max("#vertex#Patient#{}#"),
            Err(StrataError::EmptyIndex(_))
        ));
    }
}
