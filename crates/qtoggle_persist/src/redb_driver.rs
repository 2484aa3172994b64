//! Embedded redb backend
//!
//! Each collection lives in its own table (`records/<collection>`) keyed by
//! record id, with records stored as JSON bytes. Samples live in
//! `samples/<collection>` under `"<object id>\0<timestamp>"` keys so one
//! object's samples form a contiguous, time-ordered key range.
//!
//! Transactions are synchronous and commits fsync, so every operation runs on
//! the blocking thread pool.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use redb::{Database, ReadableTable, TableDefinition, TableError};

use crate::driver::record_id;
use crate::filter::matches;
use crate::store::next_id;
use crate::{
    Filter, PersistDriver, PersistError, PersistResult, Query, Record, Sample, SampleRange,
};

type Def<'a> = TableDefinition<'a, &'static str, &'static [u8]>;

fn records_table(collection: &str) -> String {
    format!("records/{}", collection)
}

fn samples_table(collection: &str) -> String {
    format!("samples/{}", collection)
}

/// Timestamps are stored with the sign bit flipped so that the decimal key
/// order matches numeric order for negative values too
fn sample_key(obj_id: &str, ts: i64) -> String {
    format!("{}\0{:020}", obj_id, (ts as u64) ^ (1 << 63))
}

fn split_sample_key(key: &str) -> Option<(&str, i64)> {
    let (obj_id, ts) = key.split_once('\0')?;
    let raw: u64 = ts.parse().ok()?;
    Some((obj_id, (raw ^ (1 << 63)) as i64))
}

/// Key just past every sample of `obj_id`
fn sample_key_end(obj_id: &str) -> String {
    format!("{}\u{1}", obj_id)
}

pub struct RedbDriver {
    path: PathBuf,
    db: RwLock<Option<Arc<Database>>>,
}

impl RedbDriver {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            db: RwLock::new(None),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn with_db<T, F>(&self, f: F) -> PersistResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&Database) -> PersistResult<T> + Send + 'static,
    {
        let db = self.db.read().clone().ok_or(PersistError::NotInitialized)?;
        tokio::task::spawn_blocking(move || f(&db))
            .await
            .map_err(PersistError::database)?
    }

    /// Read every record of a collection
    fn load_records(db: &Database, collection: &str) -> PersistResult<Vec<Record>> {
        let name = records_table(collection);
        let txn = db.begin_read().map_err(PersistError::database)?;
        let table = match txn.open_table(Def::new(&name)) {
            Ok(t) => t,
            Err(TableError::TableDoesNotExist(_)) => return Ok(Vec::new()),
            Err(e) => return Err(PersistError::database(e)),
        };

        let mut records = Vec::new();
        for entry in table.iter().map_err(PersistError::database)? {
            let (_, value) = entry.map_err(PersistError::database)?;
            records.push(serde_json::from_slice(value.value())?);
        }
        Ok(records)
    }

    /// Write a batch of records and delete a batch of ids in one transaction
    fn commit_records(
        db: &Database,
        collection: &str,
        upserts: &[(String, Record)],
        deletes: &[String],
    ) -> PersistResult<()> {
        let name = records_table(collection);
        let txn = db.begin_write().map_err(PersistError::database)?;
        {
            let mut table = txn.open_table(Def::new(&name)).map_err(PersistError::database)?;
            for (id, record) in upserts {
                let bytes = serde_json::to_vec(record)?;
                table
                    .insert(id.as_str(), bytes.as_slice())
                    .map_err(PersistError::database)?;
            }
            for id in deletes {
                table.remove(id.as_str()).map_err(PersistError::database)?;
            }
        }
        txn.commit().map_err(PersistError::database)
    }
}

#[async_trait]
impl PersistDriver for RedbDriver {
    fn name(&self) -> &'static str {
        "redb"
    }

    async fn init(&self) -> PersistResult<()> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }

        let path = self.path.clone();
        let db = tokio::task::spawn_blocking(move || Database::create(path))
            .await
            .map_err(PersistError::database)?
            .map_err(|e| PersistError::Database(format!("Failed to open database: {}", e)))?;
        *self.db.write() = Some(Arc::new(db));

        tracing::info!(path = %self.path.display(), "redb persistence ready");
        Ok(())
    }

    async fn cleanup(&self) -> PersistResult<()> {
        if self.db.write().take().is_some() {
            tracing::info!(path = %self.path.display(), "redb persistence closed");
        }
        Ok(())
    }

    async fn query(&self, collection: &str, query: &Query) -> PersistResult<Vec<Record>> {
        let collection = collection.to_string();
        let query = query.clone();
        self.with_db(move |db| query.apply(Self::load_records(db, &collection)?))
            .await
    }

    async fn insert(&self, collection: &str, mut record: Record) -> PersistResult<String> {
        let collection = collection.to_string();
        self.with_db(move |db| {
            let existing = Self::load_records(db, &collection)?;
            let ids: Vec<String> = existing
                .iter()
                .filter_map(|r| record_id(r).map(String::from))
                .collect();

            let id = match record_id(&record) {
                Some(id) => id.to_string(),
                None => next_id(&ids),
            };
            if ids.contains(&id) {
                return Err(PersistError::DuplicateId(id));
            }

            record.insert("id".to_string(), serde_json::Value::String(id.clone()));
            Self::commit_records(db, &collection, &[(id.clone(), record)], &[])?;
            Ok(id)
        })
        .await
    }

    async fn update(&self, collection: &str, part: Record, filter: &Filter) -> PersistResult<usize> {
        let collection = collection.to_string();
        let filter = filter.clone();
        self.with_db(move |db| {
            let mut upserts = Vec::new();
            for mut record in Self::load_records(db, &collection)? {
                if !matches(&record, &filter)? {
                    continue;
                }
                let Some(id) = record_id(&record).map(String::from) else {
                    continue;
                };
                for (k, v) in &part {
                    if k != "id" {
                        record.insert(k.clone(), v.clone());
                    }
                }
                upserts.push((id, record));
            }

            if !upserts.is_empty() {
                Self::commit_records(db, &collection, &upserts, &[])?;
            }
            Ok(upserts.len())
        })
        .await
    }

    async fn replace(&self, collection: &str, id: &str, mut record: Record) -> PersistResult<bool> {
        let collection = collection.to_string();
        let id = id.to_string();
        self.with_db(move |db| {
            let name = records_table(&collection);
            record.insert("id".to_string(), serde_json::Value::String(id.to_string()));
            let bytes = serde_json::to_vec(&record)?;

            let txn = db.begin_write().map_err(PersistError::database)?;
            let matched = {
                let mut table = txn.open_table(Def::new(&name)).map_err(PersistError::database)?;
                table
                    .insert(id.as_str(), bytes.as_slice())
                    .map_err(PersistError::database)?
                    .is_some()
            };
            txn.commit().map_err(PersistError::database)?;
            Ok(matched)
        })
        .await
    }

    async fn remove(&self, collection: &str, filter: &Filter) -> PersistResult<usize> {
        let collection = collection.to_string();
        let filter = filter.clone();
        self.with_db(move |db| {
            let mut deletes = Vec::new();
            for record in Self::load_records(db, &collection)? {
                if matches(&record, &filter)? {
                    if let Some(id) = record_id(&record) {
                        deletes.push(id.to_string());
                    }
                }
            }

            if !deletes.is_empty() {
                Self::commit_records(db, &collection, &[], &deletes)?;
            }
            Ok(deletes.len())
        })
        .await
    }

    fn is_samples_supported(&self) -> bool {
        true
    }

    async fn save_sample(&self, collection: &str, obj_id: &str, sample: Sample) -> PersistResult<()> {
        let collection = collection.to_string();
        let obj_id = obj_id.to_string();
        self.with_db(move |db| {
            let name = samples_table(&collection);
            let key = sample_key(&obj_id, sample.timestamp);
            let bytes = serde_json::to_vec(&sample)?;

            let txn = db.begin_write().map_err(PersistError::database)?;
            {
                let mut table = txn.open_table(Def::new(&name)).map_err(PersistError::database)?;
                table
                    .insert(key.as_str(), bytes.as_slice())
                    .map_err(PersistError::database)?;
            }
            txn.commit().map_err(PersistError::database)
        })
        .await
    }

    async fn get_samples_slice(
        &self,
        collection: &str,
        obj_id: &str,
        range: &SampleRange,
    ) -> PersistResult<Vec<Sample>> {
        let collection = collection.to_string();
        let obj_id = obj_id.to_string();
        let range = range.clone();
        self.with_db(move |db| {
            let name = samples_table(&collection);
            let txn = db.begin_read().map_err(PersistError::database)?;
            let table = match txn.open_table(Def::new(&name)) {
                Ok(t) => t,
                Err(TableError::TableDoesNotExist(_)) => return Ok(Vec::new()),
                Err(e) => return Err(PersistError::database(e)),
            };

            let lo = sample_key(&obj_id, range.from.unwrap_or(i64::MIN));
            let hi = match range.to {
                Some(to) => sample_key(&obj_id, to),
                None => sample_key_end(&obj_id),
            };
            let limit = range.limit.unwrap_or(usize::MAX);
            let entries = table
                .range(lo.as_str()..hi.as_str())
                .map_err(PersistError::database)?;

            let mut out = Vec::new();
            if range.desc {
                for entry in entries.rev() {
                    if out.len() >= limit {
                        break;
                    }
                    let (_, value) = entry.map_err(PersistError::database)?;
                    out.push(serde_json::from_slice(value.value())?);
                }
            } else {
                for entry in entries {
                    if out.len() >= limit {
                        break;
                    }
                    let (_, value) = entry.map_err(PersistError::database)?;
                    out.push(serde_json::from_slice(value.value())?);
                }
            }
            Ok(out)
        })
        .await
    }

    async fn get_samples_by_timestamp(
        &self,
        collection: &str,
        obj_id: &str,
        timestamps: &[i64],
    ) -> PersistResult<Vec<Option<Sample>>> {
        let collection = collection.to_string();
        let obj_id = obj_id.to_string();
        let timestamps = timestamps.to_vec();
        self.with_db(move |db| {
            let name = samples_table(&collection);
            let txn = db.begin_read().map_err(PersistError::database)?;
            let table = match txn.open_table(Def::new(&name)) {
                Ok(t) => t,
                Err(TableError::TableDoesNotExist(_)) => return Ok(vec![None; timestamps.len()]),
                Err(e) => return Err(PersistError::database(e)),
            };

            let lo = sample_key(&obj_id, i64::MIN);
            let mut out = Vec::with_capacity(timestamps.len());
            for ts in &timestamps {
                let hi = sample_key(&obj_id, *ts);
                let last = table
                    .range(lo.as_str()..=hi.as_str())
                    .map_err(PersistError::database)?
                    .next_back();
                out.push(match last {
                    Some(entry) => {
                        let (_, value) = entry.map_err(PersistError::database)?;
                        Some(serde_json::from_slice(value.value())?)
                    }
                    None => None,
                });
            }
            Ok(out)
        })
        .await
    }

    async fn remove_samples(
        &self,
        collection: &str,
        obj_ids: Option<&[String]>,
        range: &SampleRange,
    ) -> PersistResult<usize> {
        let collection = collection.to_string();
        let obj_ids = obj_ids.map(<[String]>::to_vec);
        let range = range.clone();
        self.with_db(move |db| {
            let name = samples_table(&collection);
            let txn = db.begin_write().map_err(PersistError::database)?;
            let removed = {
                let mut table = txn.open_table(Def::new(&name)).map_err(PersistError::database)?;

                let mut doomed = Vec::new();
                for entry in table.iter().map_err(PersistError::database)? {
                    let (key, _) = entry.map_err(PersistError::database)?;
                    let Some((obj_id, ts)) = split_sample_key(key.value()) else {
                        continue;
                    };
                    let wanted = obj_ids.as_ref().is_none_or(|ids| ids.iter().any(|i| i == obj_id));
                    if wanted && range.contains(ts) {
                        doomed.push(key.value().to_string());
                    }
                }

                for key in &doomed {
                    table.remove(key.as_str()).map_err(PersistError::database)?;
                }
                doomed.len()
            };
            txn.commit().map_err(PersistError::database)?;
            Ok(removed)
        })
        .await
    }

    async fn ensure_index(&self, collection: &str, _index: Option<&str>) -> PersistResult<()> {
        // Tables are keyed by id; other indexes are served by scanning
        let collection = collection.to_string();
        self.with_db(move |db| {
            let name = records_table(&collection);
            let txn = db.begin_write().map_err(PersistError::database)?;
            txn.open_table(Def::new(&name)).map_err(PersistError::database)?;
            txn.commit().map_err(PersistError::database)
        })
        .await
    }
}

impl std::fmt::Debug for RedbDriver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedbDriver").field("path", &self.path).finish()
    }
}
