//! 事件消费者（EventConsumer）
//!
//! 把 broker 消息转化为处理器调用：
//! - 每条消息先取得许可（共 `max_concurrent_events` 个）再处理，许可耗尽时等待；
//! - 按消息主题查找处理器，缺失时记录日志并跳过；
//! - 每次调用受 `event_timeout` 约束，超时与失败同样计入重试；
//! - 重试耗尽（或处理器返回 `Fatal`）后转入 DLQ。
//!
//! 关闭顺序：拒绝新订阅并退订 → 消息流结束后处理完已投递的消息 → 停止 DLQ。
//!
use crate::backoff::Backoff;
use crate::bus::EventBus;
use crate::config::ConsumerConfig;
use crate::dlq_handler::DlqHandler;
use bon::Builder;
use dashmap::DashMap;
use futures_util::StreamExt;
use relay_domain::error::{RelayError, RelayResult};
use relay_domain::event::{Event, EventType};
use relay_domain::eventing::{BrokerMessage, EventHandler, HandlerOutcome, SubscriptionId};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError};
use tokio::sync::{Mutex as AsyncMutex, Semaphore};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

/// 消费者统计快照
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ConsumerStats {
    pub events_processed: u64,
    pub events_failed: u64,
    pub events_retried: u64,
    pub events_dlq: u64,
    pub current_concurrent_events: usize,
    pub peak_concurrent_events: usize,
}

/// 单条消息的最终去向
enum Disposition {
    Processed,
    /// 无法解码
    Undecodable,
    /// 没有处理器
    Unhandled,
    Exhausted {
        event: Event,
        reason: String,
    },
}

/// 一个类型的订阅
struct ActiveSubscription {
    id: SubscriptionId,
    /// 仅在退订失败时取消，让分发任务放弃一个不会结束的消息流
    abandon: CancellationToken,
}

#[derive(Builder)]
pub struct EventConsumer {
    bus: Arc<EventBus>,
    #[builder(default)]
    config: ConsumerConfig,
    dlq: Option<Arc<DlqHandler>>,
    /// 主题 → 处理器
    #[builder(skip)]
    handlers: DashMap<String, Arc<dyn EventHandler>>,
    #[builder(skip)]
    subscriptions: DashMap<EventType, ActiveSubscription>,
    /// 串行化订阅的建立与拆除
    #[builder(skip)]
    subscribe_lock: AsyncMutex<()>,
    #[builder(skip)]
    permits: OnceLock<Arc<Semaphore>>,
    #[builder(skip)]
    stats: Mutex<ConsumerStats>,
    #[builder(skip)]
    stopping: AtomicBool,
    #[builder(skip)]
    tracker: TaskTracker,
}

impl EventConsumer {
    pub fn config(&self) -> &ConsumerConfig {
        &self.config
    }

    fn permits(&self) -> Arc<Semaphore> {
        self.permits
            .get_or_init(|| Arc::new(Semaphore::new(self.config.max_concurrent_events.max(1))))
            .clone()
    }

    fn stats_mut(&self) -> MutexGuard<'_, ConsumerStats> {
        self.stats.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// 启动依附的 DLQ 后台任务
    pub fn start(&self) {
        if let Some(dlq) = &self.dlq {
            dlq.start();
        }
    }

    /// 登记类型的处理器；同一类型重复登记时覆盖
    pub fn register_handler(&self, event_type: EventType, handler: Arc<dyn EventHandler>) {
        let subject = event_type.subject().to_string();
        debug!(subject = %subject, handler = handler.handler_name(), "consumer handler registered");
        if self.handlers.insert(subject, handler).is_some() {
            warn!(event_type = %event_type, "consumer handler replaced");
        }
    }

    // ---------------------------------------------------------------------
    // 订阅
    // ---------------------------------------------------------------------

    /// 订阅某类型；已订阅时返回原订阅
    ///
    /// `queue_group` 为空时以 `{consumer_name}-{event_type}` 作为持久订阅名。
    pub async fn subscribe_to_event_type(
        self: &Arc<Self>,
        event_type: EventType,
        queue_group: Option<&str>,
    ) -> RelayResult<SubscriptionId> {
        let _guard = self.subscribe_lock.lock().await;
        if self.is_stopping() {
            return Err(RelayError::invalid_value("event consumer is stopping"));
        }
        if let Some(existing) = self.subscriptions.get(&event_type) {
            warn!(event_type = %event_type, "already subscribed");
            return Ok(existing.id.clone());
        }

        let subject = event_type.subject();
        let durable = queue_group
            .map(str::to_string)
            .unwrap_or_else(|| format!("{}-{}", self.config.consumer_name, event_type.as_str()));
        let subscription = self.bus.subscribe(subject, Some(&durable)).await?;
        let id = subscription.id.clone();
        let abandon = CancellationToken::new();

        let this = Arc::clone(self);
        let abandoned = abandon.clone();
        self.tracker.spawn(async move {
            let mut messages = subscription.messages;
            // 退订后消息流在已投递的消息耗尽时结束
            loop {
                let message = tokio::select! {
                    biased;
                    _ = abandoned.cancelled() => break,
                    next = messages.next() => match next {
                        Some(message) => message,
                        None => break,
                    },
                };

                // 许可耗尽时在此等待，形成背压
                let Ok(permit) = this.permits().acquire_owned().await else {
                    break;
                };
                let worker = Arc::clone(&this);
                this.tracker.spawn(async move {
                    worker.process_message(message).await;
                    drop(permit);
                });
            }
        });

        self.subscriptions
            .insert(event_type.clone(), ActiveSubscription { id: id.clone(), abandon });
        info!(subject, durable = %durable, subscription = %id, "consumer subscribed");
        Ok(id)
    }

    /// 退订某类型；未订阅时返回 `false`
    ///
    /// 已投递到本地的消息仍会被处理。
    pub async fn unsubscribe_from_event_type(&self, event_type: &EventType) -> RelayResult<bool> {
        let _guard = self.subscribe_lock.lock().await;
        let Some((_, subscription)) = self.subscriptions.remove(event_type) else {
            return Ok(false);
        };
        if let Err(e) = self.bus.unsubscribe(&subscription.id).await {
            subscription.abandon.cancel();
            return Err(e);
        }
        info!(event_type = %event_type, subscription = %subscription.id, "consumer unsubscribed");
        Ok(true)
    }

    pub fn subscriptions(&self) -> Vec<(EventType, SubscriptionId)> {
        let mut subs: Vec<(EventType, SubscriptionId)> = self
            .subscriptions
            .iter()
            .map(|e| (e.key().clone(), e.value().id.clone()))
            .collect();
        subs.sort();
        subs
    }

    pub fn is_stopping(&self) -> bool {
        self.stopping.load(Ordering::SeqCst)
    }

    /// 拒绝新订阅并退订，处理完已投递的消息，最后停止 DLQ
    pub async fn stop(&self) {
        {
            let _guard = self.subscribe_lock.lock().await;
            self.stopping.store(true, Ordering::SeqCst);
        }

        let types: Vec<EventType> = self.subscriptions.iter().map(|e| e.key().clone()).collect();
        for event_type in types {
            if let Err(e) = self.unsubscribe_from_event_type(&event_type).await {
                warn!(event_type = %event_type, error = %e, "unsubscribe failed during stop");
            }
        }

        self.tracker.close();
        self.tracker.wait().await;

        if let Some(dlq) = &self.dlq {
            dlq.stop().await;
        }
        info!("event consumer stopped");
    }

    // ---------------------------------------------------------------------
    // 处理
    // ---------------------------------------------------------------------

    async fn process_message(&self, message: BrokerMessage) {
        {
            let mut stats = self.stats_mut();
            stats.current_concurrent_events += 1;
            stats.peak_concurrent_events = stats.peak_concurrent_events.max(stats.current_concurrent_events);
        }

        let disposition = self.run_handler(&message).await;

        let escalate = {
            let mut stats = self.stats_mut();
            stats.current_concurrent_events = stats.current_concurrent_events.saturating_sub(1);
            match disposition {
                Disposition::Processed => {
                    stats.events_processed += 1;
                    None
                }
                Disposition::Undecodable => {
                    stats.events_failed += 1;
                    None
                }
                Disposition::Unhandled => None,
                Disposition::Exhausted { event, reason } => {
                    stats.events_failed += 1;
                    match &self.dlq {
                        Some(dlq) if self.config.enable_dlq => {
                            stats.events_dlq += 1;
                            Some((dlq.clone(), event, reason))
                        }
                        _ => {
                            error!(event_id = event.event_id(), reason = %reason, "event processing failed, dlq disabled");
                            None
                        }
                    }
                }
            }
        };

        if let Some((dlq, event, reason)) = escalate {
            dlq.send_to_dlq(event, reason).await;
        }
    }

    async fn run_handler(&self, message: &BrokerMessage) -> Disposition {
        let event = match Event::from_wire(&message.payload) {
            Ok(event) => event,
            Err(e) => {
                warn!(subject = %message.subject, sequence = message.sequence, error = %e, "undecodable message");
                return Disposition::Undecodable;
            }
        };

        let handler = match self.handlers.get(&message.subject) {
            Some(handler) => handler.clone(),
            None => {
                warn!(subject = %message.subject, event_id = event.event_id(), "no handler for subject");
                return Disposition::Unhandled;
            }
        };

        let backoff = Backoff::exponential(self.config.retry_delay);
        let attempts = self.config.retry_attempts.max(1);
        let mut reason = String::new();

        for attempt in 0..attempts {
            let outcome = match tokio::time::timeout(self.config.event_timeout, handler.handle(&event)).await {
                Ok(outcome) => outcome,
                Err(_) => HandlerOutcome::retryable("timeout"),
            };

            match outcome {
                HandlerOutcome::Success => {
                    debug!(event_id = event.event_id(), attempt = attempt + 1, "event processed");
                    return Disposition::Processed;
                }
                HandlerOutcome::Fatal(r) => {
                    warn!(event_id = event.event_id(), handler = handler.handler_name(), reason = %r, "fatal handler outcome");
                    reason = r;
                    break;
                }
                HandlerOutcome::Retryable(r) => {
                    reason = r;
                    if attempt + 1 < attempts {
                        let delay = backoff.delay(attempt);
                        self.stats_mut().events_retried += 1;
                        debug!(
                            event_id = event.event_id(),
                            attempt = attempt + 1,
                            delay = ?delay,
                            reason = %reason,
                            "handler failed, retrying"
                        );
                        tokio::time::sleep(delay).await;
                    }
                }
            }
        }

        Disposition::Exhausted { event, reason }
    }

    pub fn stats(&self) -> ConsumerStats {
        self.stats_mut().clone()
    }
}
