//! broker 级死信处理器（DlqProcessor）
//!
//! 处理 broker 因重投耗尽转入 `deadletter.*` 的消息，是事件的最终失败路径：
//! - 按原始主题的第一段解析事件大类，无法解析或没有处理器工厂时记录并丢弃；
//! - 仍有重试额度时按 `min(retry_delay * 2^retry_count, max_retry_delay)` 等待，
//!   用全新处理器实例直接处理原始事件（不再经过 broker）；
//! - 额度耗尽后写入永久失败记录，并发布 `alert` 事件；告警失败只记录日志。
//!
use crate::backoff::Backoff;
use crate::bus::EventBus;
use crate::config::DlqProcessorConfig;
use async_trait::async_trait;
use bon::Builder;
use chrono::Utc;
use dashmap::DashMap;
use relay_domain::dead_letter::{DeadLetterMessage, FailureSource, PermanentFailureRecord};
use relay_domain::error::RelayResult;
use relay_domain::event::{Event, EventCategory, EventType};
use relay_domain::eventing::{
    BrokerMessage, DeadLetterHandler, HandlerFactory, HandlerOutcome, SubscriptionId,
};
use relay_domain::persist::PermanentFailureStore;
use relay_domain::time;
use serde::Serialize;
use serde_json::json;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, error, info, warn};

/// 告警事件的 `alert_type`
pub const PERMANENT_FAILURE_ALERT: &str = "dlq_permanent_failure";

/// 租户未知时告警事件使用的租户
const SYSTEM_TENANT: &str = "system";

/// 一条死信的处理结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DlqDisposition {
    /// 重试成功
    Recovered,
    /// 记录为永久失败
    PermanentFailure,
    /// 无法处理，已丢弃
    Dropped,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DlqProcessorStats {
    pub messages_received: u64,
    pub retried_ok: u64,
    pub dropped: u64,
    pub permanent_failures: u64,
    /// 永久失败按事件类型计数
    pub by_event_type: BTreeMap<String, u64>,
}

/// 最终失败时的上下文
struct FinalFailure<'a> {
    message: &'a DeadLetterMessage,
    event: Option<&'a Event>,
    event_type: String,
    last_error: String,
    retry_count: u32,
}

#[derive(Builder)]
pub struct DlqProcessor {
    bus: Arc<EventBus>,
    failure_store: Arc<dyn PermanentFailureStore>,
    #[builder(default)]
    config: DlqProcessorConfig,
    #[builder(skip)]
    factories: DashMap<EventCategory, Arc<dyn HandlerFactory>>,
    #[builder(skip)]
    stats: Mutex<DlqProcessorStats>,
}

impl DlqProcessor {
    pub fn config(&self) -> &DlqProcessorConfig {
        &self.config
    }

    fn stats_mut(&self) -> MutexGuard<'_, DlqProcessorStats> {
        self.stats.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// 登记某大类的处理器工厂；重复登记覆盖
    pub fn register_factory(&self, category: EventCategory, factory: Arc<dyn HandlerFactory>) {
        debug!(category = %category, "dead letter handler factory registered");
        self.factories.insert(category, factory);
    }

    /// 订阅某类型的 broker 死信
    pub async fn subscribe(self: &Arc<Self>, event_type: EventType) -> RelayResult<SubscriptionId> {
        let handler: Arc<dyn DeadLetterHandler> = self.clone();
        self.bus.subscribe_to_dlq(event_type, handler).await
    }

    pub async fn process_dlq_message(&self, raw: &[u8]) -> DlqDisposition {
        self.stats_mut().messages_received += 1;

        let message = match DeadLetterMessage::from_slice(raw) {
            Ok(message) => message,
            Err(e) => {
                warn!(error = %e, "malformed dead letter dropped");
                return self.dropped();
            }
        };

        let Some(category) = EventCategory::from_subject(&message.original_subject) else {
            warn!(subject = %message.original_subject, "dead letter for unknown category dropped");
            return self.dropped();
        };

        let fallback_type = EventType::from_subject(&message.original_subject)
            .map_or_else(|| category.as_str().to_string(), |t| t.as_str().to_string());

        let event = match message.original_event() {
            Ok(event) => event,
            Err(e) => {
                warn!(subject = %message.original_subject, error = %e, "dead letter payload is not an event");
                return self
                    .final_failure(FinalFailure {
                        message: &message,
                        event: None,
                        event_type: fallback_type,
                        last_error: format!("{}; undecodable payload: {e}", message.error),
                        retry_count: message.retry_count,
                    })
                    .await;
            }
        };

        let mut retry_count = message.retry_count;
        let mut last_error = message.error.clone();

        if retry_count < self.config.retry_attempts {
            let Some(factory) = self.factories.get(&category).map(|f| f.clone()) else {
                warn!(
                    category = %category,
                    event_id = event.event_id(),
                    "no handler factory for dead letter, dropped"
                );
                return self.dropped();
            };

            let backoff = Backoff::exponential(self.config.retry_delay).with_max(self.config.max_retry_delay);
            while retry_count < self.config.retry_attempts {
                let delay = backoff.delay(retry_count);
                debug!(event_id = event.event_id(), retry_count, delay = ?delay, "retrying dead letter");
                tokio::time::sleep(delay).await;

                let handler = factory.create();
                retry_count += 1;
                match handler.handle(&event).await {
                    HandlerOutcome::Success => {
                        self.stats_mut().retried_ok += 1;
                        info!(event_id = event.event_id(), retry_count, "dead letter recovered");
                        return DlqDisposition::Recovered;
                    }
                    HandlerOutcome::Retryable(reason) => last_error = reason,
                    HandlerOutcome::Fatal(reason) => {
                        last_error = reason;
                        break;
                    }
                }
            }
        }

        self.final_failure(FinalFailure {
            message: &message,
            event: Some(&event),
            event_type: event.event_type().as_str().to_string(),
            last_error,
            retry_count,
        })
        .await
    }

    fn dropped(&self) -> DlqDisposition {
        self.stats_mut().dropped += 1;
        DlqDisposition::Dropped
    }

    async fn final_failure(&self, failure: FinalFailure<'_>) -> DlqDisposition {
        let FinalFailure {
            message,
            event,
            event_type,
            last_error,
            retry_count,
        } = failure;
        let tenant_id = event.map_or(SYSTEM_TENANT, |e| e.tenant_id()).to_string();

        let record = PermanentFailureRecord::builder()
            .tenant_id(tenant_id.as_str())
            .event_type(event_type.as_str())
            .maybe_event_id(event.map(|e| e.event_id().to_string()))
            .original_subject(message.original_subject.as_str())
            .original_headers(message.original_headers.clone())
            .original_data(message.original_data.clone())
            .last_error(last_error.as_str())
            .retry_count(retry_count)
            .source(FailureSource::DeadLetterProcessor)
            .build();
        let failed_at = record.failed_at();

        error!(
            event_type = %event_type,
            tenant_id = %tenant_id,
            retry_count,
            error = %last_error,
            "permanent event failure"
        );
        if let Err(e) = self.failure_store.append(record).await {
            error!(event_type = %event_type, error = %e, "failed to persist permanent failure");
        }

        {
            let mut stats = self.stats_mut();
            stats.permanent_failures += 1;
            *stats.by_event_type.entry(event_type.clone()).or_insert(0) += 1;
        }

        let alert = json!({
            "alert_type": PERMANENT_FAILURE_ALERT,
            "tenant_id": tenant_id,
            "event_type": event_type,
            "error": last_error,
            "failed_at": failed_at.timestamp_micros() as f64 / 1_000_000.0,
            "retry_count": retry_count,
            "original_subject": message.original_subject,
        });
        let published = match Event::from_json(EventType::Alert, tenant_id.as_str(), alert) {
            Ok(alert) => self.bus.publish(&alert).await.map(|_| ()),
            Err(e) => Err(e),
        };
        if let Err(e) = published {
            error!(event_type = %event_type, error = %e, "failed to publish permanent failure alert");
        }

        DlqDisposition::PermanentFailure
    }

    pub fn stats(&self) -> DlqProcessorStats {
        self.stats_mut().clone()
    }

    /// 永久失败记录按事件类型的计数（来自存储）
    pub async fn failure_counts(&self) -> RelayResult<BTreeMap<String, u64>> {
        self.failure_store.count_by_event_type().await
    }

    /// 删除超过保留期的永久失败记录
    pub async fn cleanup_old_failures(&self) -> RelayResult<usize> {
        let cutoff = time::before(Utc::now(), self.config.failure_retention);
        let purged = self.failure_store.purge_before(cutoff).await?;
        if purged > 0 {
            info!(purged, "old permanent failures purged");
        }
        Ok(purged)
    }
}

#[async_trait]
impl DeadLetterHandler for DlqProcessor {
    async fn handle_dead_letter(&self, message: BrokerMessage) {
        let disposition = self.process_dlq_message(&message.payload).await;
        debug!(subject = %message.subject, ?disposition, "dead letter handled");
    }
}
