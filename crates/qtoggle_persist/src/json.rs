//! JSON file backend
//!
//! The whole database is one JSON document kept in memory and rewritten after
//! every change. Writes go to a temporary file which is then renamed over the
//! data file; the previous data file is kept next to it with a `.bak` suffix
//! and is used when the main file turns out to be unreadable.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use parking_lot::RwLock;
use tokio::sync::Mutex;

use crate::store::Store;
use crate::{Filter, PersistDriver, PersistResult, Query, Record, Sample, SampleRange};

pub struct JsonDriver {
    path: PathBuf,
    store: RwLock<Store>,
    /// Serializes file rewrites
    write_lock: Mutex<()>,
}

impl JsonDriver {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            store: RwLock::new(Store::default()),
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn sibling(&self, suffix: &str) -> PathBuf {
        let mut name = self.path.as_os_str().to_os_string();
        name.push(suffix);
        PathBuf::from(name)
    }

    async fn load(path: &Path) -> PersistResult<Option<Store>> {
        match tokio::fs::read(path).await {
            Ok(data) if data.iter().all(u8::is_ascii_whitespace) => Ok(Some(Store::default())),
            Ok(data) => Ok(Some(serde_json::from_slice(&data)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn flush(&self) -> PersistResult<()> {
        let _guard = self.write_lock.lock().await;
        let data = serde_json::to_vec_pretty(&*self.store.read())?;

        let tmp = self.sibling(".tmp");
        let bak = self.sibling(".bak");

        tokio::fs::write(&tmp, &data).await?;
        if tokio::fs::try_exists(&self.path).await? {
            tokio::fs::rename(&self.path, &bak).await?;
        }
        tokio::fs::rename(&tmp, &self.path).await?;

        tracing::trace!(path = %self.path.display(), bytes = data.len(), "Data file written");
        Ok(())
    }
}

#[async_trait]
impl PersistDriver for JsonDriver {
    fn name(&self) -> &'static str {
        "json"
    }

    async fn init(&self) -> PersistResult<()> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }

        let store = match Self::load(&self.path).await {
            Ok(Some(store)) => store,
            Ok(None) => {
                tracing::info!(path = %self.path.display(), "Data file missing, starting empty");
                Store::default()
            }
            Err(e) => {
                let bak = self.sibling(".bak");
                tracing::warn!(
                    path = %self.path.display(),
                    error = %e,
                    "Data file unreadable, trying backup"
                );
                match Self::load(&bak).await {
                    Ok(Some(store)) => store,
                    _ => return Err(e),
                }
            }
        };

        *self.store.write() = store;
        tracing::info!(path = %self.path.display(), "JSON persistence ready");
        Ok(())
    }

    async fn cleanup(&self) -> PersistResult<()> {
        self.flush().await
    }

    async fn query(&self, collection: &str, query: &Query) -> PersistResult<Vec<Record>> {
        self.store.read().query(collection, query)
    }

    async fn insert(&self, collection: &str, record: Record) -> PersistResult<String> {
        let id = self.store.write().insert(collection, record)?;
        self.flush().await?;
        Ok(id)
    }

    async fn update(&self, collection: &str, part: Record, filter: &Filter) -> PersistResult<usize> {
        let count = self.store.write().update(collection, &part, filter)?;
        if count > 0 {
            self.flush().await?;
        }
        Ok(count)
    }

    async fn replace(&self, collection: &str, id: &str, record: Record) -> PersistResult<bool> {
        let matched = self.store.write().replace(collection, id, record);
        self.flush().await?;
        Ok(matched)
    }

    async fn remove(&self, collection: &str, filter: &Filter) -> PersistResult<usize> {
        let count = self.store.write().remove(collection, filter)?;
        if count > 0 {
            self.flush().await?;
        }
        Ok(count)
    }

    fn is_samples_supported(&self) -> bool {
        true
    }

    async fn save_sample(&self, collection: &str, obj_id: &str, sample: Sample) -> PersistResult<()> {
        self.store.write().save_sample(collection, obj_id, sample);
        self.flush().await
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
        let count = self.store.write().remove_samples(collection, obj_ids, range);
        if count > 0 {
            self.flush().await?;
        }
        Ok(count)
    }
}

impl std::fmt::Debug for JsonDriver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JsonDriver").field("path", &self.path).finish()
    }
}
