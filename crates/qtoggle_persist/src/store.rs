//! In-memory document store shared by the memory and JSON backends.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::driver::record_id;
use crate::filter::matches;
use crate::{Filter, PersistError, PersistResult, Query, Record, Sample, SampleRange};

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub(crate) struct Store {
    #[serde(default)]
    collections: BTreeMap<String, BTreeMap<String, Record>>,
    /// collection → object id → timestamp → value
    #[serde(default)]
    samples: BTreeMap<String, BTreeMap<String, BTreeMap<i64, Value>>>,
}

impl Store {
    pub fn query(&self, collection: &str, query: &Query) -> PersistResult<Vec<Record>> {
        match self.collections.get(collection) {
            Some(records) => query.apply(records.values().cloned()),
            None => Ok(Vec::new()),
        }
    }

    pub fn insert(&mut self, collection: &str, mut record: Record) -> PersistResult<String> {
        let records = self.collections.entry(collection.to_string()).or_default();

        let id = match record_id(&record) {
            Some(id) => id.to_string(),
            None => next_id(records.keys()),
        };
        if records.contains_key(&id) {
            return Err(PersistError::DuplicateId(id));
        }

        record.insert("id".to_string(), Value::String(id.clone()));
        records.insert(id.clone(), record);
        Ok(id)
    }

    pub fn update(&mut self, collection: &str, part: &Record, filter: &Filter) -> PersistResult<usize> {
        let Some(records) = self.collections.get_mut(collection) else {
            return Ok(0);
        };

        let mut count = 0;
        for record in records.values_mut() {
            if matches(record, filter)? {
                for (k, v) in part {
                    if k != "id" {
                        record.insert(k.clone(), v.clone());
                    }
                }
                count += 1;
            }
        }
        Ok(count)
    }

    pub fn replace(&mut self, collection: &str, id: &str, mut record: Record) -> bool {
        record.insert("id".to_string(), Value::String(id.to_string()));
        self.collections
            .entry(collection.to_string())
            .or_default()
            .insert(id.to_string(), record)
            .is_some()
    }

    pub fn remove(&mut self, collection: &str, filter: &Filter) -> PersistResult<usize> {
        let Some(records) = self.collections.get_mut(collection) else {
            return Ok(0);
        };

        let mut doomed = Vec::new();
        for (id, record) in records.iter() {
            if matches(record, filter)? {
                doomed.push(id.clone());
            }
        }
        for id in &doomed {
            records.remove(id);
        }
        Ok(doomed.len())
    }

    pub fn save_sample(&mut self, collection: &str, obj_id: &str, sample: Sample) {
        self.samples
            .entry(collection.to_string())
            .or_default()
            .entry(obj_id.to_string())
            .or_default()
            .insert(sample.timestamp, sample.value);
    }

    pub fn samples_slice(&self, collection: &str, obj_id: &str, range: &SampleRange) -> Vec<Sample> {
        let Some(series) = self.samples.get(collection).and_then(|c| c.get(obj_id)) else {
            return Vec::new();
        };

        let selected = series.iter().filter(|(ts, _)| range.contains(**ts));
        let to_sample = |(ts, v): (&i64, &Value)| Sample {
            timestamp: *ts,
            value: v.clone(),
        };
        let limit = range.limit.unwrap_or(usize::MAX);

        if range.desc {
            selected.rev().take(limit).map(to_sample).collect()
        } else {
            selected.take(limit).map(to_sample).collect()
        }
    }

    pub fn samples_by_timestamp(
        &self,
        collection: &str,
        obj_id: &str,
        timestamps: &[i64],
    ) -> Vec<Option<Sample>> {
        let series = self.samples.get(collection).and_then(|c| c.get(obj_id));
        timestamps
            .iter()
            .map(|ts| {
                series
                    .and_then(|s| s.range(..=*ts).next_back())
                    .map(|(t, v)| Sample {
                        timestamp: *t,
                        value: v.clone(),
                    })
            })
            .collect()
    }

    pub fn remove_samples(
        &mut self,
        collection: &str,
        obj_ids: Option<&[String]>,
        range: &SampleRange,
    ) -> usize {
        let Some(objects) = self.samples.get_mut(collection) else {
            return 0;
        };

        let mut count = 0;
        for (obj_id, series) in objects.iter_mut() {
            if obj_ids.is_some_and(|ids| !ids.contains(obj_id)) {
                continue;
            }
            let before = series.len();
            series.retain(|ts, _| !range.contains(*ts));
            count += before - series.len();
        }
        objects.retain(|_, series| !series.is_empty());
        count
    }
}

/// Next free numeric id: one past the largest integer-looking id
pub(crate) fn next_id<'a, I>(ids: I) -> String
where
    I: IntoIterator<Item = &'a String>,
{
    let max = ids
        .into_iter()
        .filter_map(|id| id.parse::<u64>().ok())
        .max()
        .unwrap_or(0);
    (max + 1).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record(v: Value) -> Record {
        v.as_object().cloned().unwrap()
    }

    #[test]
    fn test_insert_generates_ids() {
        let mut store = Store::default();
        assert_eq!(store.insert("things", record(json!({"a": 1}))).unwrap(), "1");
        assert_eq!(store.insert("things", record(json!({"id": "9"}))).unwrap(), "9");
        assert_eq!(store.insert("things", record(json!({"a": 2}))).unwrap(), "10");

        let err = store.insert("things", record(json!({"id": "9"}))).unwrap_err();
        assert!(matches!(err, PersistError::DuplicateId(id) if id == "9"));
    }

    #[test]
    fn test_samples_by_timestamp() {
        let mut store = Store::default();
        for (ts, v) in [(100, 1), (200, 2), (300, 3)] {
            store.save_sample("h", "p", Sample { timestamp: ts, value: json!(v) });
        }

        let found = store.samples_by_timestamp("h", "p", &[50, 100, 250, 1000]);
        let values: Vec<Option<i64>> = found
            .iter()
            .map(|s| s.as_ref().and_then(|s| s.value.as_i64()))
            .collect();
        assert_eq!(values, vec![None, Some(1), Some(2), Some(3)]);

        let range = SampleRange {
            from: Some(150),
            ..Default::default()
        };
        assert_eq!(store.remove_samples("h", None, &range), 2);
        assert_eq!(store.samples_slice("h", "p", &SampleRange::default()).len(), 1);
    }
}
