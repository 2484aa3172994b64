//! Persistence driver trait.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{Filter, PersistError, PersistResult, Query, Record};

/// One time-series sample
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    /// Unix milliseconds
    pub timestamp: i64,
    pub value: Value,
}

/// Range selection for sample queries
#[derive(Debug, Clone, Default)]
pub struct SampleRange {
    /// Inclusive lower bound (ms)
    pub from: Option<i64>,
    /// Exclusive upper bound (ms)
    pub to: Option<i64>,
    pub limit: Option<usize>,
    /// Newest first
    pub desc: bool,
}

impl SampleRange {
    pub fn contains(&self, ts: i64) -> bool {
        self.from.is_none_or(|f| ts >= f) && self.to.is_none_or(|t| ts < t)
    }
}

/// Storage backend for port configuration, device attributes and samples.
///
/// Collections are schemaless sets of records, each with a string `id`.
#[async_trait]
pub trait PersistDriver: Send + Sync + 'static {
    /// Backend name as used in configuration
    fn name(&self) -> &'static str;

    /// Open files/connections; failure here is fatal at startup
    async fn init(&self) -> PersistResult<()> {
        Ok(())
    }

    /// Flush and close
    async fn cleanup(&self) -> PersistResult<()> {
        Ok(())
    }

    async fn query(&self, collection: &str, query: &Query) -> PersistResult<Vec<Record>>;

    /// Insert a record, generating an id when it has none; returns the id
    async fn insert(&self, collection: &str, record: Record) -> PersistResult<String>;

    /// Merge `part` into every matching record; returns the number updated
    async fn update(&self, collection: &str, part: Record, filter: &Filter) -> PersistResult<usize>;

    /// Replace the record with the given id, inserting it when absent.
    ///
    /// Returns whether an existing record was matched.
    async fn replace(&self, collection: &str, id: &str, record: Record) -> PersistResult<bool>;

    /// Remove matching records; returns the number removed
    async fn remove(&self, collection: &str, filter: &Filter) -> PersistResult<usize>;

    fn is_samples_supported(&self) -> bool {
        false
    }

    async fn save_sample(
        &self,
        _collection: &str,
        _obj_id: &str,
        _sample: Sample,
    ) -> PersistResult<()> {
        Err(PersistError::SamplesNotSupported)
    }

    async fn get_samples_slice(
        &self,
        _collection: &str,
        _obj_id: &str,
        _range: &SampleRange,
    ) -> PersistResult<Vec<Sample>> {
        Err(PersistError::SamplesNotSupported)
    }

    /// For each timestamp, the latest sample taken at or before it
    async fn get_samples_by_timestamp(
        &self,
        _collection: &str,
        _obj_id: &str,
        _timestamps: &[i64],
    ) -> PersistResult<Vec<Option<Sample>>> {
        Err(PersistError::SamplesNotSupported)
    }

    /// Remove samples of the given objects (all objects when `None`) within a range
    async fn remove_samples(
        &self,
        _collection: &str,
        _obj_ids: Option<&[String]>,
        _range: &SampleRange,
    ) -> PersistResult<usize> {
        Err(PersistError::SamplesNotSupported)
    }

    /// Hint that `collection` will be queried by `index` (or by id when `None`)
    async fn ensure_index(&self, _collection: &str, _index: Option<&str>) -> PersistResult<()> {
        Ok(())
    }
}

/// Pull the `id` out of a record, if it is a non-empty string
pub fn record_id(record: &Record) -> Option<&str> {
    record.get("id").and_then(Value::as_str).filter(|s| !s.is_empty())
}
