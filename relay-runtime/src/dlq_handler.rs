//! 进程内死信队列（DlqHandler）
//!
//! 消费端重试耗尽的事件在此暂存：
//! - 容量有界，满时按 FIFO 挤出最旧条目；
//! - 周期重试到期条目，失败后按 `retry_delay * multiplier^retry_count` 推迟（有上限）；
//! - 周期清理超过保留期的条目，与重试状态无关；
//! - 挤出与过期的条目写入永久失败存储（若已配置），不会无声消失。
//!
//! 条目存储由单个互斥区保护；网络发布总在互斥区之外进行。
//!
use crate::backoff::Backoff;
use crate::bus::EventBus;
use crate::config::DlqConfig;
use crate::worker::WorkerHandle;
use bon::Builder;
use chrono::{DateTime, Utc};
use relay_domain::dead_letter::{DlqEntry, FailureSource, PermanentFailureRecord};
use relay_domain::event::{Event, EventType};
use relay_domain::persist::PermanentFailureStore;
use serde::Serialize;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, error, info, warn};

/// 手动重试结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ManualRetry {
    Republished,
    Failed(String),
    /// 条目不存在（可能已被后台重试或清理移除）
    NotFound,
}

/// DLQ 统计快照
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DlqStats {
    pub events_received: u64,
    pub events_retried: u64,
    pub events_expired: u64,
    pub events_processed: u64,
    pub events_evicted: u64,
    pub dlq_size: usize,
    pub config: DlqConfig,
}

#[derive(Default)]
struct Counters {
    received: AtomicU64,
    retried: AtomicU64,
    expired: AtomicU64,
    processed: AtomicU64,
    evicted: AtomicU64,
}

/// 有界 FIFO：插入序号 → 条目，另以 event_id 建索引
#[derive(Default)]
struct DlqStore {
    next_seq: u64,
    entries: BTreeMap<u64, DlqEntry>,
    index: HashMap<String, u64>,
}

impl DlqStore {
    /// 插入新条目；同一事件重复进入时替换旧条目。返回被挤出的条目
    fn insert(&mut self, entry: DlqEntry, capacity: usize) -> Option<DlqEntry> {
        self.remove(entry.event_id());

        let evicted = if self.entries.len() >= capacity.max(1) {
            self.pop_oldest()
        } else {
            None
        };

        self.next_seq += 1;
        self.index.insert(entry.event_id().to_string(), self.next_seq);
        self.entries.insert(self.next_seq, entry);
        evicted
    }

    fn pop_oldest(&mut self) -> Option<DlqEntry> {
        let (_, entry) = self.entries.pop_first()?;
        self.index.remove(entry.event_id());
        Some(entry)
    }

    fn get(&self, event_id: &str) -> Option<&DlqEntry> {
        self.index.get(event_id).and_then(|seq| self.entries.get(seq))
    }

    fn get_mut(&mut self, event_id: &str) -> Option<&mut DlqEntry> {
        let seq = self.index.get(event_id)?;
        self.entries.get_mut(seq)
    }

    fn remove(&mut self, event_id: &str) -> Option<DlqEntry> {
        let seq = self.index.remove(event_id)?;
        self.entries.remove(&seq)
    }

    fn len(&self) -> usize {
        self.entries.len()
    }

    fn clear(&mut self) -> usize {
        let n = self.entries.len();
        self.entries.clear();
        self.index.clear();
        n
    }
}

#[derive(Builder)]
pub struct DlqHandler {
    bus: Arc<EventBus>,
    #[builder(default)]
    config: DlqConfig,
    /// 挤出/过期条目的去处
    failure_store: Option<Arc<dyn PermanentFailureStore>>,
    #[builder(skip)]
    store: Mutex<DlqStore>,
    #[builder(skip)]
    counters: Counters,
    #[builder(skip)]
    started: AtomicBool,
    #[builder(skip)]
    worker: WorkerHandle,
}

impl DlqHandler {
    pub fn config(&self) -> &DlqConfig {
        &self.config
    }

    fn store(&self) -> MutexGuard<'_, DlqStore> {
        self.store.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn backoff(&self) -> Backoff {
        Backoff::exponential(self.config.retry_delay)
            .with_multiplier(self.config.retry_backoff_multiplier)
            .with_max(self.config.max_retry_delay)
    }

    // ---------------------------------------------------------------------
    // 生命周期
    // ---------------------------------------------------------------------

    /// 启动重试与清理两个周期任务；重复调用无效果
    pub fn start(self: &Arc<Self>) {
        if self.started.swap(true, Ordering::SeqCst) || self.worker.is_shutdown() {
            return;
        }

        if self.config.enable_auto_retry {
            let weak = Arc::downgrade(self);
            self.worker.spawn_periodic(self.config.retry_interval, move || {
                let weak = weak.clone();
                async move {
                    if let Some(dlq) = weak.upgrade() {
                        dlq.retry_due_at(Utc::now()).await;
                    }
                }
            });
        }

        let weak = Arc::downgrade(self);
        self.worker.spawn_periodic(self.config.cleanup_interval, move || {
            let weak = weak.clone();
            async move {
                if let Some(dlq) = weak.upgrade() {
                    dlq.expire_at(Utc::now()).await;
                }
            }
        });

        info!(
            auto_retry = self.config.enable_auto_retry,
            max_dlq_size = self.config.max_dlq_size,
            "dlq handler started"
        );
    }

    /// 取消后台任务并等待其退出
    pub async fn stop(&self) {
        self.worker.shutdown_and_join().await;
        info!(dlq_size = self.len(), "dlq handler stopped");
    }

    // ---------------------------------------------------------------------
    // 入队
    // ---------------------------------------------------------------------

    pub async fn send_to_dlq(&self, event: Event, reason: impl Into<String>) {
        self.send_to_dlq_at(event, reason, Utc::now()).await;
    }

    pub async fn send_to_dlq_at(&self, event: Event, reason: impl Into<String>, now: DateTime<Utc>) {
        let entry = DlqEntry::new(event, reason, now);
        let mirror = serde_json::to_vec(&entry);
        let headers = entry.event().headers().clone();

        let (evicted, size) = {
            let mut store = self.store();
            let evicted = store.insert(entry.clone(), self.config.max_dlq_size);
            (evicted, store.len())
        };
        self.counters.received.fetch_add(1, Ordering::Relaxed);
        info!(
            event_id = entry.event_id(),
            event_type = %entry.event().event_type(),
            reason = entry.reason(),
            dlq_size = size,
            "event sent to dlq"
        );

        if let Some(old) = evicted {
            self.counters.evicted.fetch_add(1, Ordering::Relaxed);
            warn!(event_id = old.event_id(), "dlq full, oldest entry evicted");
            self.record_permanent(&old, FailureSource::DlqEvicted).await;
        }

        // 镜像到 dlq 主题，仅尽力而为
        match mirror {
            Ok(payload) => {
                if let Err(e) = self.bus.publish_raw(&self.config.dlq_subject, payload, &headers).await {
                    debug!(subject = %self.config.dlq_subject, error = %e, "dlq mirror publish failed");
                }
            }
            Err(e) => debug!(error = %e, "dlq entry not serializable for mirror"),
        }
    }

    // ---------------------------------------------------------------------
    // 后台任务
    // ---------------------------------------------------------------------

    /// 重投全部到期条目，返回成功数
    pub async fn retry_due_at(&self, now: DateTime<Utc>) -> usize {
        let due: Vec<Event> = self
            .store()
            .entries
            .values()
            .filter(|e| e.is_due(now, self.config.max_retry_attempts))
            .map(|e| e.event().clone())
            .collect();

        let mut republished = 0;
        for event in due {
            self.counters.retried.fetch_add(1, Ordering::Relaxed);
            match self.bus.publish(&event).await {
                Ok(_) => {
                    if self.store().remove(event.event_id()).is_some() {
                        self.counters.processed.fetch_add(1, Ordering::Relaxed);
                        republished += 1;
                        info!(event_id = event.event_id(), "dlq event republished");
                    }
                }
                Err(e) => self.record_retry_failure(event.event_id(), &e.to_string(), now),
            }
        }
        republished
    }

    fn record_retry_failure(&self, event_id: &str, error: &str, now: DateTime<Utc>) {
        let backoff = self.backoff();
        let mut store = self.store();
        let Some(entry) = store.get_mut(event_id) else {
            return;
        };
        let delay = backoff.delay(entry.retry_count().saturating_add(1));
        entry.record_failure(error, now, delay);

        if entry.retry_count() >= self.config.max_retry_attempts {
            warn!(
                event_id,
                retry_count = entry.retry_count(),
                error,
                "dlq retries exhausted, kept for manual retry"
            );
        } else {
            debug!(
                event_id,
                retry_count = entry.retry_count(),
                next_retry_at = %entry.next_retry_at(),
                error,
                "dlq retry failed"
            );
        }
    }

    /// 移除超过保留期的条目，返回移除数
    pub async fn expire_at(&self, now: DateTime<Utc>) -> usize {
        let expired: Vec<DlqEntry> = {
            let mut store = self.store();
            let ids: Vec<String> = store
                .entries
                .values()
                .filter(|e| e.is_expired(now, self.config.retention_period))
                .map(|e| e.event_id().to_string())
                .collect();
            ids.iter().filter_map(|id| store.remove(id)).collect()
        };

        if expired.is_empty() {
            return 0;
        }
        self.counters
            .expired
            .fetch_add(expired.len() as u64, Ordering::Relaxed);
        info!(count = expired.len(), "expired dlq entries removed");

        for entry in &expired {
            self.record_permanent(entry, FailureSource::DlqExpired).await;
        }
        expired.len()
    }

    async fn record_permanent(&self, entry: &DlqEntry, source: FailureSource) {
        let Some(store) = &self.failure_store else {
            return;
        };
        let event = entry.event();
        let record = PermanentFailureRecord::builder()
            .tenant_id(event.tenant_id())
            .event_type(event.event_type().as_str())
            .event_id(event.event_id())
            .original_subject(event.subject())
            .original_headers(event.headers().clone())
            .original_data(Value::Object(event.data().clone()))
            .last_error(entry.last_error().unwrap_or(entry.reason()))
            .retry_count(entry.retry_count())
            .source(source)
            .build();

        if let Err(e) = store.append(record).await {
            error!(event_id = event.event_id(), error = %e, "failed to record permanent failure");
        }
    }

    // ---------------------------------------------------------------------
    // 运维接口
    // ---------------------------------------------------------------------

    pub async fn manual_retry(&self, event_id: &str) -> ManualRetry {
        let Some(event) = self.store().get(event_id).map(|e| e.event().clone()) else {
            return ManualRetry::NotFound;
        };

        self.counters.retried.fetch_add(1, Ordering::Relaxed);
        match self.bus.publish(&event).await {
            Ok(_) => {
                if self.store().remove(event_id).is_some() {
                    self.counters.processed.fetch_add(1, Ordering::Relaxed);
                }
                info!(event_id, "dlq event manually republished");
                ManualRetry::Republished
            }
            Err(e) => {
                let reason = e.to_string();
                self.record_retry_failure(event_id, &reason, Utc::now());
                ManualRetry::Failed(reason)
            }
        }
    }

    /// 按入队顺序分页列出条目
    pub fn get_dlq_events(&self, limit: usize, offset: usize, event_type: Option<&EventType>) -> Vec<DlqEntry> {
        self.store()
            .entries
            .values()
            .filter(|e| event_type.is_none_or(|t| e.event().event_type() == t))
            .skip(offset)
            .take(limit)
            .cloned()
            .collect()
    }

    pub fn get_dlq_event(&self, event_id: &str) -> Option<DlqEntry> {
        self.store().get(event_id).cloned()
    }

    /// 清空队列，返回清除条数
    pub fn clear_dlq(&self) -> usize {
        let n = self.store().clear();
        info!(count = n, "dlq cleared");
        n
    }

    pub fn len(&self) -> usize {
        self.store().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> DlqStats {
        DlqStats {
            events_received: self.counters.received.load(Ordering::Relaxed),
            events_retried: self.counters.retried.load(Ordering::Relaxed),
            events_expired: self.counters.expired.load(Ordering::Relaxed),
            events_processed: self.counters.processed.load(Ordering::Relaxed),
            events_evicted: self.counters.evicted.load(Ordering::Relaxed),
            dlq_size: self.len(),
            config: self.config.clone(),
        }
    }
}
