use super::failure_store::PermanentFailureStore;
use crate::dead_letter::PermanentFailureRecord;
use crate::error::RelayResult;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::sync::{PoisonError, RwLock};

/// 内存版永久失败存储
#[derive(Default)]
pub struct InMemoryFailureStore {
    records: RwLock<Vec<PermanentFailureRecord>>,
}

impl InMemoryFailureStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl PermanentFailureStore for InMemoryFailureStore {
    async fn append(&self, record: PermanentFailureRecord) -> RelayResult<()> {
        self.records
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(record);
        Ok(())
    }

    async fn list(&self, limit: usize, offset: usize) -> RelayResult<Vec<PermanentFailureRecord>> {
        let records = self.records.read().unwrap_or_else(PoisonError::into_inner);
        Ok(records.iter().rev().skip(offset).take(limit).cloned().collect())
    }

    async fn count_by_event_type(&self) -> RelayResult<BTreeMap<String, u64>> {
        let records = self.records.read().unwrap_or_else(PoisonError::into_inner);
        let mut counts = BTreeMap::new();
        for r in records.iter() {
            *counts.entry(r.event_type().to_string()).or_insert(0) += 1;
        }
        Ok(counts)
    }

    async fn purge_before(&self, cutoff: DateTime<Utc>) -> RelayResult<usize> {
        let mut records = self.records.write().unwrap_or_else(PoisonError::into_inner);
        let before = records.len();
        records.retain(|r| r.failed_at() >= cutoff);
        Ok(before - records.len())
    }
}
