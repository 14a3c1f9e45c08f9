//! 事件生产者（EventProducer）
//!
//! 吸收突发流量、摊薄发布成本，并对瞬时发布失败做退避重试：
//! - 开启批处理时事件先进入批次，达到 `batch_size` 立即刷新，否则由后台任务按
//!   `batch_timeout` 刷新；
//! - 刷新时在锁内换出整个批次，锁外逐条发布；
//! - 单事件最多尝试 `retry_attempts` 次，间隔 `retry_delay * 2^attempt`；
//! - 最终失败计入 `events_failed` 并返回 `false`；配置了 DLQ 时转入 DLQ；
//! - `stop()` 之后不再接受新事件。
//!
use crate::backoff::Backoff;
use crate::bus::EventBus;
use crate::config::ProducerConfig;
use crate::dlq_handler::DlqHandler;
use crate::worker::WorkerHandle;
use bon::Builder;
use relay_domain::error::RelayError;
use relay_domain::event::{Event, EventType, Headers};
use serde::Serialize;
use serde_json::{Map, Value, json};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, error, info, warn};

/// 生产者统计快照
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ProducerStats {
    pub events_published: u64,
    pub events_failed: u64,
    pub events_retried: u64,
    pub batches_flushed: u64,
    /// 当前批次中尚未发布的事件数
    pub pending: usize,
}

#[derive(Default)]
struct Counters {
    published: AtomicU64,
    failed: AtomicU64,
    retried: AtomicU64,
    batches: AtomicU64,
}

/// 批次中的一项：事件与可选的目标主题
struct Pending {
    event: Event,
    subject: Option<String>,
}

#[derive(Builder)]
pub struct EventProducer {
    bus: Arc<EventBus>,
    #[builder(default)]
    config: ProducerConfig,
    /// 发布重试耗尽的事件转入此处
    dlq: Option<Arc<DlqHandler>>,
    #[builder(skip)]
    batch: Mutex<Vec<Pending>>,
    #[builder(skip)]
    counters: Counters,
    #[builder(skip)]
    started: AtomicBool,
    /// 在批次锁内置位，保证最后一次刷新之后无事件入批
    #[builder(skip)]
    stopped: AtomicBool,
    #[builder(skip)]
    worker: WorkerHandle,
}

impl EventProducer {
    pub fn config(&self) -> &ProducerConfig {
        &self.config
    }

    fn batch(&self) -> MutexGuard<'_, Vec<Pending>> {
        self.batch.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// 启动后台定时刷新；未开启批处理或重复调用时无效果
    pub fn start(self: &Arc<Self>) {
        if !self.config.enable_batching || self.started.swap(true, Ordering::SeqCst) {
            return;
        }
        let weak = Arc::downgrade(self);
        self.worker.spawn_periodic(self.config.batch_timeout, move || {
            let weak = weak.clone();
            async move {
                if let Some(producer) = weak.upgrade() {
                    producer.flush().await;
                }
            }
        });
        info!(
            batch_size = self.config.batch_size,
            batch_timeout = ?self.config.batch_timeout,
            "event producer started"
        );
    }

    /// 拒绝新事件、停止定时刷新，并把剩余批次发布完毕
    pub async fn stop(&self) {
        {
            let _batch = self.batch();
            self.stopped.store(true, Ordering::SeqCst);
        }
        self.worker.shutdown_and_join().await;
        let flushed = self.flush().await;
        info!(flushed, "event producer stopped");
    }

    // ---------------------------------------------------------------------
    // 发布
    // ---------------------------------------------------------------------

    /// 构造事件并发布；返回值表示事件是否被接受（入批或已发布）
    pub async fn publish(
        &self,
        event_type: EventType,
        tenant_id: &str,
        payload: Map<String, Value>,
        headers: Option<Headers>,
        subject: Option<&str>,
    ) -> bool {
        let event = match Event::new(event_type, tenant_id, payload) {
            Ok(event) => event.with_headers(headers.unwrap_or_default()),
            Err(e) => {
                self.counters.failed.fetch_add(1, Ordering::Relaxed);
                warn!(error = %e, "event rejected");
                return false;
            }
        };
        self.publish_event(event, subject).await
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    fn reject_stopped(&self, event: &Event) -> bool {
        self.counters.failed.fetch_add(1, Ordering::Relaxed);
        warn!(event_id = event.event_id(), "producer stopped, event rejected");
        false
    }

    /// 发布已构造的事件
    pub async fn publish_event(&self, event: Event, subject: Option<&str>) -> bool {
        if self.is_stopped() {
            return self.reject_stopped(&event);
        }
        // 校验错误在入批前暴露
        if let Err(e) = self.bus.validate(&event) {
            self.counters.failed.fetch_add(1, Ordering::Relaxed);
            warn!(event_id = event.event_id(), error = %e, "event rejected");
            return false;
        }

        let pending = Pending {
            event,
            subject: subject.map(str::to_string),
        };
        if !self.config.enable_batching {
            return self.publish_with_retry(&pending).await;
        }

        let full = {
            let mut batch = self.batch();
            if self.is_stopped() {
                drop(batch);
                return self.reject_stopped(&pending.event);
            }
            batch.push(pending);
            if batch.len() >= self.config.batch_size {
                Some(std::mem::take(&mut *batch))
            } else {
                None
            }
        };
        if let Some(entries) = full {
            self.publish_batch(entries).await;
        }
        true
    }

    /// 立即发布当前批次，返回成功数
    pub async fn flush(&self) -> usize {
        let entries = std::mem::take(&mut *self.batch());
        self.publish_batch(entries).await
    }

    async fn publish_batch(&self, entries: Vec<Pending>) -> usize {
        if entries.is_empty() {
            return 0;
        }
        let total = entries.len();
        let mut ok = 0;
        for pending in &entries {
            if self.publish_with_retry(pending).await {
                ok += 1;
            }
        }
        self.counters.batches.fetch_add(1, Ordering::Relaxed);
        debug!(total, ok, "batch flushed");
        ok
    }

    async fn publish_with_retry(&self, pending: &Pending) -> bool {
        let event = &pending.event;
        let subject = pending.subject.as_deref().unwrap_or(event.subject());
        let backoff = Backoff::exponential(self.config.retry_delay);
        let attempts = self.config.retry_attempts.max(1);

        let mut last_error: Option<RelayError> = None;
        for attempt in 0..attempts {
            match self.bus.publish_to(event, subject).await {
                Ok(_) => {
                    self.counters.published.fetch_add(1, Ordering::Relaxed);
                    return true;
                }
                Err(e) => {
                    let retry = e.is_retryable() && attempt + 1 < attempts;
                    if retry {
                        self.counters.retried.fetch_add(1, Ordering::Relaxed);
                        let delay = backoff.delay(attempt);
                        warn!(
                            event_id = event.event_id(),
                            subject,
                            attempt = attempt + 1,
                            delay = ?delay,
                            error = %e,
                            "publish failed, retrying"
                        );
                        last_error = Some(e);
                        tokio::time::sleep(delay).await;
                    } else {
                        last_error = Some(e);
                        break;
                    }
                }
            }
        }

        self.counters.failed.fetch_add(1, Ordering::Relaxed);
        let reason = last_error.map_or_else(|| "publish failed".to_string(), |e| e.to_string());
        error!(event_id = event.event_id(), subject, error = %reason, "event publish failed");

        if let Some(dlq) = &self.dlq {
            dlq.send_to_dlq(event.clone(), reason).await;
        }
        false
    }

    // ---------------------------------------------------------------------
    // 分类便捷方法
    // ---------------------------------------------------------------------

    pub async fn publish_agent_run(
        &self,
        tenant_id: &str,
        run_id: &str,
        agent_id: &str,
        status: &str,
        extra: Option<Map<String, Value>>,
    ) -> bool {
        let mut payload = extra.unwrap_or_default();
        payload.insert("run_id".into(), json!(run_id));
        payload.insert("agent_id".into(), json!(agent_id));
        payload.insert("status".into(), json!(status));

        let event_type = match status {
            "started" => EventType::AgentRunStarted,
            "failed" => EventType::AgentRunFailed,
            _ => EventType::AgentRun,
        };
        self.publish(event_type, tenant_id, payload, None, None).await
    }

    pub async fn publish_router_decision(
        &self,
        tenant_id: &str,
        decision_id: &str,
        route: &str,
        extra: Option<Map<String, Value>>,
    ) -> bool {
        let mut payload = extra.unwrap_or_default();
        payload.insert("decision_id".into(), json!(decision_id));
        payload.insert("route".into(), json!(route));
        self.publish(EventType::RouterDecision, tenant_id, payload, None, None)
            .await
    }

    pub async fn publish_feature_flag_change(
        &self,
        tenant_id: &str,
        flag_key: &str,
        enabled: bool,
        changed_by: Option<&str>,
    ) -> bool {
        let mut payload = Map::new();
        payload.insert("flag_key".into(), json!(flag_key));
        payload.insert("enabled".into(), json!(enabled));
        if let Some(who) = changed_by {
            payload.insert("changed_by".into(), json!(who));
        }
        self.publish(EventType::FeatureFlagChanged, tenant_id, payload, None, None)
            .await
    }

    pub async fn publish_alert(
        &self,
        tenant_id: &str,
        alert_type: &str,
        message: &str,
        extra: Option<Map<String, Value>>,
    ) -> bool {
        let mut payload = extra.unwrap_or_default();
        payload.insert("alert_type".into(), json!(alert_type));
        payload.insert("message".into(), json!(message));
        self.publish(EventType::Alert, tenant_id, payload, None, None).await
    }

    pub fn stats(&self) -> ProducerStats {
        ProducerStats {
            events_published: self.counters.published.load(Ordering::Relaxed),
            events_failed: self.counters.failed.load(Ordering::Relaxed),
            events_retried: self.counters.retried.load(Ordering::Relaxed),
            batches_flushed: self.counters.batches.load(Ordering::Relaxed),
            pending: self.batch().len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use relay_domain::eventing::InMemoryBroker;
    use std::time::Duration;

    async fn bus() -> (Arc<InMemoryBroker>, Arc<EventBus>) {
        let broker = Arc::new(InMemoryBroker::new());
        let bus = Arc::new(EventBus::new(broker.clone()));
        bus.connect().await.unwrap();
        bus.register_default_models();
        (broker, bus)
    }

    fn fast(config: ProducerConfig) -> ProducerConfig {
        ProducerConfig {
            retry_delay: Duration::from_millis(1),
            ..config
        }
    }

    #[tokio::test]
    async fn batch_flushes_when_full() {
        let (broker, bus) = bus().await;
        let producer = EventProducer::builder()
            .bus(bus)
            .config(fast(ProducerConfig {
                batch_size: 3,
                ..ProducerConfig::default()
            }))
            .build();

        for n in 0..2 {
            assert!(producer.publish_router_decision("t1", &format!("d-{n}"), "fast", None).await);
        }
        assert_eq!(producer.stats().pending, 2);
        assert!(broker.published(EventType::RouterDecision.subject()).is_empty());

        assert!(producer.publish_router_decision("t1", "d-2", "fast", None).await);
        let stats = producer.stats();
        assert_eq!(stats.pending, 0);
        assert_eq!(stats.events_published, 3);
        assert_eq!(stats.batches_flushed, 1);
        assert_eq!(broker.published(EventType::RouterDecision.subject()).len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn background_flush_bounds_latency() {
        let (broker, bus) = bus().await;
        let producer = Arc::new(
            EventProducer::builder()
                .bus(bus)
                .config(ProducerConfig {
                    batch_timeout: Duration::from_millis(100),
                    ..ProducerConfig::default()
                })
                .build(),
        );
        producer.start();
        assert!(producer.publish_feature_flag_change("t1", "beta", true, Some("ops")).await);

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(broker.published(EventType::FeatureFlagChanged.subject()).len(), 1);
        producer.stop().await;
    }

    #[tokio::test]
    async fn stop_flushes_remaining_events() {
        let (broker, bus) = bus().await;
        let producer = Arc::new(EventProducer::builder().bus(bus).build());
        producer.start();
        assert!(producer.publish_alert("t1", "disk_full", "95% used", None).await);
        producer.stop().await;
        assert_eq!(broker.published(EventType::Alert.subject()).len(), 1);
        assert_eq!(producer.stats().pending, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn stopped_producer_rejects_new_events() {
        let (broker, bus) = bus().await;
        let producer = Arc::new(EventProducer::builder().bus(bus).build());
        producer.start();
        producer.stop().await;

        assert!(!producer.publish_router_decision("t1", "d-late", "fast", None).await);
        tokio::time::sleep(Duration::from_millis(200)).await;

        let stats = producer.stats();
        assert_eq!(stats.pending, 0);
        assert_eq!(stats.events_failed, 1);
        assert!(producer.is_stopped());
        assert!(broker.published(EventType::RouterDecision.subject()).is_empty());
    }

    #[tokio::test]
    async fn transient_failures_are_retried() {
        let (broker, bus) = bus().await;
        let producer = EventProducer::builder()
            .bus(bus)
            .config(fast(ProducerConfig {
                enable_batching: false,
                ..ProducerConfig::default()
            }))
            .build();

        broker.fail_next_publishes(2);
        assert!(producer.publish_agent_run("t1", "r-1", "a-1", "completed", None).await);
        let stats = producer.stats();
        assert_eq!(stats.events_retried, 2);
        assert_eq!(stats.events_published, 1);
        assert_eq!(stats.events_failed, 0);
    }

    #[tokio::test]
    async fn exhausted_publish_goes_to_dlq() {
        let (broker, bus) = bus().await;
        let dlq = Arc::new(DlqHandler::builder().bus(bus.clone()).build());
        let producer = EventProducer::builder()
            .bus(bus)
            .config(fast(ProducerConfig {
                enable_batching: false,
                retry_attempts: 2,
                ..ProducerConfig::default()
            }))
            .dlq(dlq.clone())
            .build();

        broker.fail_next_publishes(2);
        assert!(!producer.publish_agent_run("t1", "r-1", "a-1", "started", None).await);
        assert_eq!(producer.stats().events_failed, 1);

        let entries = dlq.get_dlq_events(10, 0, None);
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].event().event_type(), &EventType::AgentRunStarted);
        assert!(entries[0].reason().contains("injected publish failure"));
    }

    #[tokio::test]
    async fn invalid_events_are_rejected_up_front() {
        let (broker, bus) = bus().await;
        let producer = EventProducer::builder().bus(bus).build();

        let mut payload = Map::new();
        payload.insert("flag_key".into(), json!("beta"));
        payload.insert("enabled".into(), json!("yes"));
        assert!(
            !producer
                .publish(EventType::FeatureFlagChanged, "t1", payload, None, None)
                .await
        );
        assert!(!producer.publish(EventType::Alert, "", Map::new(), None, None).await);
        assert_eq!(producer.stats().events_failed, 2);
        assert_eq!(producer.flush().await, 0);
        assert!(broker.published(EventType::FeatureFlagChanged.subject()).is_empty());
    }

    #[tokio::test]
    async fn disconnected_bus_is_not_retried() {
        let broker = Arc::new(InMemoryBroker::new());
        let bus = Arc::new(EventBus::new(broker));
        let producer = EventProducer::builder()
            .bus(bus)
            .config(ProducerConfig {
                enable_batching: false,
                ..ProducerConfig::default()
            })
            .build();

        let started = std::time::Instant::now();
        assert!(
            !producer
                .publish(EventType::Other("ping".into()), "t1", Map::new(), None, Some("custom_events.ping"))
                .await
        );
        assert!(started.elapsed() < Duration::from_millis(500));
        assert_eq!(producer.stats().events_retried, 0);
    }
}
