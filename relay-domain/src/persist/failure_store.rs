use crate::dead_letter::PermanentFailureRecord;
use crate::error::RelayResult;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;

/// 永久失败记录存储：只追加，按保留期清理
#[async_trait]
pub trait PermanentFailureStore: Send + Sync {
    async fn append(&self, record: PermanentFailureRecord) -> RelayResult<()>;

    /// 最近的记录在前
    async fn list(&self, limit: usize, offset: usize) -> RelayResult<Vec<PermanentFailureRecord>>;

    /// 按事件类型计数
    async fn count_by_event_type(&self) -> RelayResult<BTreeMap<String, u64>>;

    /// 删除 `failed_at` 早于 `cutoff` 的记录，返回删除条数
    async fn purge_before(&self, cutoff: DateTime<Utc>) -> RelayResult<usize>;
}
