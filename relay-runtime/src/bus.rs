//! 事件总线（EventBus）
//!
//! broker 之上的门面，集中回答三件事：broker 是否已连接、某类型的合法负载长什么样、
//! 某类型由谁处理。
//! - 连接/断开幂等；未连接时发布与订阅立即返回 `NotConnected`；
//! - 发布前按已登记 schema 校验，失败即 `Validation`，不触达网络；
//! - 同一类型的多个处理器彼此独立执行，单个失败只记录日志；
//! - 流/消费者信息查询直接委托给 broker。
//!
use crate::registry::HandlerRegistry;
use dashmap::DashMap;
use futures_util::StreamExt;
use futures_util::future::join_all;
use relay_domain::error::{RelayError, RelayResult};
use relay_domain::event::{Event, EventSchema, EventType, Headers};
use relay_domain::eventing::{
    Broker, BrokerMessage, BrokerSubscription, ConsumerInfo, DeadLetterHandler, EventHandler,
    HandlerOutcome, StreamInfo, SubscriptionId,
};
use serde_json::{Map, Value};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

pub struct EventBus {
    broker: Arc<dyn Broker>,
    connected: AtomicBool,
    schemas: DashMap<EventType, EventSchema>,
    registry: HandlerRegistry,
    /// 总线自身发起的订阅及其分发任务
    pumps: DashMap<SubscriptionId, JoinHandle<()>>,
}

impl EventBus {
    pub fn new(broker: Arc<dyn Broker>) -> Self {
        Self {
            broker,
            connected: AtomicBool::new(false),
            schemas: DashMap::new(),
            registry: HandlerRegistry::new(),
            pumps: DashMap::new(),
        }
    }

    // ---------------------------------------------------------------------
    // 生命周期
    // ---------------------------------------------------------------------

    pub async fn connect(&self) -> RelayResult<()> {
        if self.is_connected() {
            return Ok(());
        }
        self.broker.connect().await?;
        self.connected.store(true, Ordering::SeqCst);
        info!("event bus connected");
        Ok(())
    }

    /// 断开连接并等待全部分发任务退出
    pub async fn disconnect(&self) -> RelayResult<()> {
        if !self.connected.swap(false, Ordering::SeqCst) {
            return Ok(());
        }
        let result = self.broker.disconnect().await;

        let ids: Vec<SubscriptionId> = self.pumps.iter().map(|e| e.key().clone()).collect();
        for id in ids {
            if let Some((_, pump)) = self.pumps.remove(&id) {
                pump.abort();
                join_pump(&id, pump).await;
            }
        }
        info!("event bus disconnected");
        result
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn ensure_connected(&self) -> RelayResult<()> {
        if self.is_connected() {
            Ok(())
        } else {
            Err(RelayError::NotConnected)
        }
    }

    // ---------------------------------------------------------------------
    // 注册
    // ---------------------------------------------------------------------

    /// 登记类型的 schema；重复登记覆盖
    pub fn register_event_model(&self, event_type: EventType, schema: EventSchema) {
        debug!(event_type = %event_type, schema = schema.name(), "event model registered");
        self.schemas.insert(event_type, schema);
    }

    /// 为全部已知类型登记默认 schema
    pub fn register_default_models(&self) {
        for event_type in EventType::known() {
            if let Some(schema) = EventSchema::for_type(&event_type) {
                self.register_event_model(event_type, schema);
            }
        }
    }

    pub fn event_model(&self, event_type: &EventType) -> Option<EventSchema> {
        self.schemas.get(event_type).map(|s| s.clone())
    }

    /// 追加处理器；同一类型允许多个
    pub fn register_handler(&self, event_type: EventType, handler: Arc<dyn EventHandler>) {
        debug!(event_type = %event_type, handler = handler.handler_name(), "handler registered");
        self.registry.register(event_type, handler);
    }

    pub fn registry(&self) -> &HandlerRegistry {
        &self.registry
    }

    // ---------------------------------------------------------------------
    // 发布
    // ---------------------------------------------------------------------

    /// 按已登记 schema 校验；未登记的类型直接通过
    pub fn validate(&self, event: &Event) -> RelayResult<()> {
        match self.schemas.get(event.event_type()) {
            Some(schema) => schema.validate(event.event_type(), event.data()),
            None => Ok(()),
        }
    }

    /// 构造并发布事件，返回 broker 顺序号
    pub async fn publish_event(
        &self,
        event_type: EventType,
        payload: Map<String, Value>,
        tenant_id: &str,
        headers: Option<Headers>,
    ) -> RelayResult<u64> {
        let event = Event::new(event_type, tenant_id, payload)?.with_headers(headers.unwrap_or_default());
        self.publish(&event).await
    }

    /// 发布到事件类型的默认主题
    pub async fn publish(&self, event: &Event) -> RelayResult<u64> {
        self.publish_to(event, event.subject()).await
    }

    pub async fn publish_to(&self, event: &Event, subject: &str) -> RelayResult<u64> {
        self.validate(event)?;
        self.ensure_connected()?;

        let payload = event.to_wire()?;
        let sequence = self.broker.publish(subject, payload, event.headers()).await?;
        debug!(
            event_id = event.event_id(),
            event_type = %event.event_type(),
            subject,
            sequence,
            "event published"
        );
        Ok(sequence)
    }

    /// 发布不经 schema 校验的原始负载
    pub async fn publish_raw(&self, subject: &str, payload: Vec<u8>, headers: &Headers) -> RelayResult<u64> {
        self.ensure_connected()?;
        self.broker.publish(subject, payload, headers).await
    }

    // ---------------------------------------------------------------------
    // 订阅
    // ---------------------------------------------------------------------

    /// 原始订阅，由调用方自行消费消息流
    pub async fn subscribe(&self, subject: &str, durable_name: Option<&str>) -> RelayResult<BrokerSubscription> {
        self.ensure_connected()?;
        self.broker.subscribe(subject, durable_name).await
    }

    /// 订阅某类型：所有已登记处理器共用一个分发函数
    ///
    /// 未指定 `durable_name` 时，以 `consumer_name` 派生持久订阅名。
    pub async fn subscribe_to_events(
        &self,
        event_type: EventType,
        consumer_name: Option<&str>,
        durable_name: Option<&str>,
    ) -> RelayResult<SubscriptionId> {
        let subject = event_type.subject();
        let durable = durable_name
            .map(str::to_string)
            .or_else(|| consumer_name.map(|c| format!("{c}-{}", event_type.as_str())));

        let subscription = self.subscribe(subject, durable.as_deref()).await?;
        let id = subscription.id.clone();
        let registry = self.registry.clone();

        let pump = tokio::spawn(async move {
            let mut messages = subscription.messages;
            while let Some(message) = messages.next().await {
                dispatch_to_all(&registry, &event_type, message).await;
            }
        });
        self.pumps.insert(id.clone(), pump);

        info!(subject, durable = ?durable, subscription = %id, "subscribed to events");
        Ok(id)
    }

    /// 订阅某类型的 broker 级死信
    pub async fn subscribe_to_dlq(
        &self,
        event_type: EventType,
        handler: Arc<dyn DeadLetterHandler>,
    ) -> RelayResult<SubscriptionId> {
        self.ensure_connected()?;
        let subscription = self.broker.subscribe_dead_letters(event_type.subject()).await?;
        let id = subscription.id.clone();

        let pump = tokio::spawn(async move {
            let mut messages = subscription.messages;
            while let Some(message) = messages.next().await {
                handler.handle_dead_letter(message).await;
            }
        });
        self.pumps.insert(id.clone(), pump);

        info!(event_type = %event_type, subscription = %id, "subscribed to dead letters");
        Ok(id)
    }

    /// 退订；总线自身的分发任务在消息流结束后退出
    pub async fn unsubscribe(&self, id: &SubscriptionId) -> RelayResult<()> {
        self.broker.unsubscribe(id).await?;
        if let Some((_, pump)) = self.pumps.remove(id) {
            join_pump(id, pump).await;
        }
        Ok(())
    }

    // ---------------------------------------------------------------------
    // 观测
    // ---------------------------------------------------------------------

    pub async fn get_stream_info(&self, stream: &str) -> RelayResult<StreamInfo> {
        self.broker.stream_info(stream).await
    }

    pub async fn get_consumer_info(&self, stream: &str, consumer: &str) -> RelayResult<ConsumerInfo> {
        self.broker.consumer_info(stream, consumer).await
    }

    pub async fn get_all_streams_info(&self) -> RelayResult<Vec<StreamInfo>> {
        self.broker.streams().await
    }

    pub async fn get_all_consumers_info(&self, stream: &str) -> RelayResult<Vec<ConsumerInfo>> {
        self.broker.consumers(stream).await
    }
}

/// 等待分发任务退出；取消是预期结果，panic 记录日志
async fn join_pump(id: &SubscriptionId, pump: JoinHandle<()>) {
    if let Err(e) = pump.await {
        if e.is_panic() {
            error!(subscription = %id, error = %e, "dispatch task panicked");
        }
    }
}

/// 把一条消息交给某类型的全部处理器；各处理器独立执行，失败只记录
async fn dispatch_to_all(registry: &HandlerRegistry, event_type: &EventType, message: BrokerMessage) {
    let event = match Event::from_wire(&message.payload) {
        Ok(event) => event,
        Err(e) => {
            warn!(subject = %message.subject, sequence = message.sequence, error = %e, "undecodable message dropped");
            return;
        }
    };

    let handlers = registry.matching(event_type);
    if handlers.is_empty() {
        warn!(event_type = %event_type, event_id = event.event_id(), "no handler registered");
        return;
    }

    let runs = handlers.iter().map(|h| {
        let event = &event;
        async move { (h.handler_name().to_string(), h.handle(event).await) }
    });

    for (handler, outcome) in join_all(runs).await {
        if let HandlerOutcome::Retryable(reason) | HandlerOutcome::Fatal(reason) = outcome {
            warn!(handler = %handler, event_id = event.event_id(), reason = %reason, "event handler failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use relay_domain::eventing::{InMemoryBroker, handler_fn};
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    fn payload(v: Value) -> Map<String, Value> {
        v.as_object().cloned().unwrap()
    }

    async fn connected_bus() -> (Arc<InMemoryBroker>, EventBus) {
        let broker = Arc::new(InMemoryBroker::new());
        let bus = EventBus::new(broker.clone());
        bus.connect().await.unwrap();
        (broker, bus)
    }

    #[tokio::test]
    async fn operations_fail_fast_when_disconnected() {
        let bus = EventBus::new(Arc::new(InMemoryBroker::new()));
        let err = bus
            .publish_event(EventType::Alert, payload(json!({"alert_type": "x"})), "t1", None)
            .await
            .unwrap_err();
        assert!(matches!(err, RelayError::NotConnected));

        let err = bus.subscribe_to_events(EventType::Alert, None, None).await.unwrap_err();
        assert!(matches!(err, RelayError::NotConnected));
    }

    #[tokio::test]
    async fn connect_and_disconnect_are_idempotent() {
        let (broker, bus) = connected_bus().await;
        bus.connect().await.unwrap();
        assert!(broker.is_connected());
        bus.disconnect().await.unwrap();
        bus.disconnect().await.unwrap();
        assert!(!bus.is_connected());
    }

    #[tokio::test]
    async fn validation_happens_before_the_broker() {
        let (broker, bus) = connected_bus().await;
        bus.register_default_models();

        let err = bus
            .publish_event(EventType::AgentRun, payload(json!({"agent_id": "a"})), "t1", None)
            .await
            .unwrap_err();
        assert!(matches!(err, RelayError::Validation { .. }));
        assert!(broker.published(EventType::AgentRun.subject()).is_empty());

        let seq = bus
            .publish_event(
                EventType::AgentRun,
                payload(json!({"agent_id": "a", "run_id": "r"})),
                "t1",
                None,
            )
            .await
            .unwrap();
        assert_eq!(broker.published(EventType::AgentRun.subject())[0].sequence, seq);
    }

    #[tokio::test]
    async fn reregistering_a_model_overwrites() {
        let (_, bus) = connected_bus().await;
        bus.register_default_models();
        bus.register_event_model(EventType::AgentRun, EventSchema::builder().name("loose").build());
        assert_eq!(bus.event_model(&EventType::AgentRun).unwrap().name(), "loose");
        bus.publish_event(EventType::AgentRun, Map::new(), "t1", None).await.unwrap();
    }

    #[tokio::test]
    async fn unsubscribe_survives_a_crashed_dispatch_task() {
        let (broker, bus) = connected_bus().await;
        bus.register_handler(
            EventType::Alert,
            handler_fn("crashing", |_| async {
                let outcome: Option<HandlerOutcome> = None;
                outcome.expect("handler crashed")
            }),
        );
        let id = bus.subscribe_to_events(EventType::Alert, None, None).await.unwrap();
        bus.publish_event(EventType::Alert, payload(json!({"alert_type": "x"})), "t1", None)
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        bus.unsubscribe(&id).await.unwrap();
        assert!(bus.pumps.is_empty());
        assert_eq!(broker.active_subscriptions(), 0);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn one_failing_handler_does_not_block_the_others() {
        let (_, bus) = connected_bus().await;
        let ok = Arc::new(AtomicUsize::new(0));
        let failed = Arc::new(AtomicUsize::new(0));

        let seen = ok.clone();
        bus.register_handler(
            EventType::RouterDecision,
            handler_fn("counter", move |_| {
                let seen = seen.clone();
                async move {
                    seen.fetch_add(1, Ordering::SeqCst);
                    HandlerOutcome::Success
                }
            }),
        );
        let seen = failed.clone();
        bus.register_handler(
            EventType::RouterDecision,
            handler_fn("broken", move |_| {
                let seen = seen.clone();
                async move {
                    seen.fetch_add(1, Ordering::SeqCst);
                    HandlerOutcome::fatal("always broken")
                }
            }),
        );

        bus.subscribe_to_events(EventType::RouterDecision, Some("router"), None)
            .await
            .unwrap();
        for _ in 0..3 {
            bus.publish_event(
                EventType::RouterDecision,
                payload(json!({"decision_id": "d", "route": "r"})),
                "t1",
                None,
            )
            .await
            .unwrap();
        }

        let _ = tokio::time::timeout(Duration::from_secs(2), async {
            while ok.load(Ordering::SeqCst) < 3 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await;
        assert_eq!(ok.load(Ordering::SeqCst), 3);
        assert_eq!(failed.load(Ordering::SeqCst), 3);

        let info = bus
            .get_consumer_info("router_events", "router-router_decision")
            .await
            .unwrap();
        assert_eq!(info.delivered, 3);
        assert_eq!(bus.get_stream_info("router_events").await.unwrap().messages, 3);
    }
}
