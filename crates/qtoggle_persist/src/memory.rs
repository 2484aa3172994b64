//! Volatile backend; everything is lost at exit.

use async_trait::async_trait;
use parking_lot::RwLock;

use crate::store::Store;
use crate::{Filter, PersistDriver, PersistResult, Query, Record, Sample, SampleRange};

#[derive(Debug, Default)]
pub struct MemoryDriver {
    store: RwLock<Store>,
}

impl MemoryDriver {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl PersistDriver for MemoryDriver {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn query(&self, collection: &str, query: &Query) -> PersistResult<Vec<Record>> {
        self.store.read().query(collection, query)
    }

    async fn insert(&self, collection: &str, record: Record) -> PersistResult<String> {
        self.store.write().insert(collection, record)
    }

    async fn update(&self, collection: &str, part: Record, filter: &Filter) -> PersistResult<usize> {
        self.store.write().update(collection, &part, filter)
    }

    async fn replace(&self, collection: &str, id: &str, record: Record) -> PersistResult<bool> {
        Ok(self.store.write().replace(collection, id, record))
    }

    async fn remove(&self, collection: &str, filter: &Filter) -> PersistResult<usize> {
        self.store.write().remove(collection, filter)
    }

    fn is_samples_supported(&self) -> bool {
        true
    }

    async fn save_sample(&self, collection: &str, obj_id: &str, sample: Sample) -> PersistResult<()> {
        self.store.write().save_sample(collection, obj_id, sample);
        Ok(())
    }

    async fn get_samples_slice(
        &self,
        collection: &str,
        obj_id: &str,
        range: &SampleRange,
    ) -> PersistResult<Vec<Sample>> {
        Ok(self.store.read().samples_slice(collection, obj_id, range))
    }

    async fn get_samples_by_timestamp(
        &self,
        collection: &str,
        obj_id: &str,
        timestamps: &[i64],
    ) -> PersistResult<Vec<Option<Sample>>> {
        Ok(self.store.read().samples_by_timestamp(collection, obj_id, timestamps))
    }

    async fn remove_samples(
        &self,
        collection: &str,
        obj_ids: Option<&[String]>,
        range: &SampleRange,
    ) -> PersistResult<usize> {
        Ok(self.store.write().remove_samples(collection, obj_ids, range))
    }
}
