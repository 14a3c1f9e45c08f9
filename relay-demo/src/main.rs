//! 端到端演示：内存 broker 上的生产、消费、DLQ 与死信处理
//!
//! `RUST_LOG` 控制日志级别；`RELAY_CONFIG` 可指向 JSON 配置文件。
//!
use anyhow::Context;
use relay_domain::dead_letter::DeadLetterMessage;
use relay_domain::event::{Event, EventCategory, EventType};
use relay_domain::eventing::{Broker, EventHandler, HandlerOutcome, InMemoryBroker, handler_fn};
use relay_domain::persist::{InMemoryFailureStore, PermanentFailureStore};
use relay_runtime::{DlqHandler, DlqProcessor, EventBus, EventConsumer, EventProducer, RelayConfig};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "relay_demo=info,relay_runtime=debug,relay_domain=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let mut config = RelayConfig::from_env().context("loading relay config")?;
    // 演示用的短退避
    config.consumer.retry_delay = Duration::from_millis(50);
    config.processor.retry_delay = Duration::from_millis(50);

    let broker = Arc::new(InMemoryBroker::new());
    let bus = Arc::new(EventBus::new(broker.clone()));
    bus.connect().await?;
    bus.register_default_models();

    let failures = Arc::new(InMemoryFailureStore::new());
    let dlq = Arc::new(
        DlqHandler::builder()
            .bus(bus.clone())
            .config(config.dlq.clone())
            .failure_store(failures.clone())
            .build(),
    );
    let consumer = Arc::new(
        EventConsumer::builder()
            .bus(bus.clone())
            .config(config.consumer.clone())
            .dlq(dlq.clone())
            .build(),
    );
    let producer = Arc::new(
        EventProducer::builder()
            .bus(bus.clone())
            .config(config.producer.clone())
            .dlq(dlq.clone())
            .build(),
    );
    let processor = Arc::new(
        DlqProcessor::builder()
            .bus(bus.clone())
            .failure_store(failures.clone())
            .config(config.processor.clone())
            .build(),
    );

    // 代理运行：奇数租户的处理总是失败
    consumer.register_handler(
        EventType::AgentRun,
        handler_fn("agent-run-recorder", |event: Event| async move {
            if event.tenant_id().ends_with('1') {
                HandlerOutcome::retryable("warehouse unavailable")
            } else {
                HandlerOutcome::Success
            }
        }),
    );
    // 路由决策：第一次失败，之后成功
    let router_calls = Arc::new(AtomicUsize::new(0));
    let calls = router_calls.clone();
    consumer.register_handler(
        EventType::RouterDecision,
        handler_fn("router-audit", move |_| {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n == 0 {
                    HandlerOutcome::retryable("cold cache")
                } else {
                    HandlerOutcome::Success
                }
            }
        }),
    );
    bus.register_handler(
        EventType::Alert,
        handler_fn("pager", |event: Event| async move {
            info!(alert = %serde_json::Value::Object(event.data().clone()), "alert received");
            HandlerOutcome::Success
        }),
    );

    processor.register_factory(
        EventCategory::Agent,
        Arc::new(|| -> Arc<dyn EventHandler> {
            handler_fn("agent-run-replay", |_| async {
                HandlerOutcome::fatal("replay target rejected event")
            })
        }),
    );

    consumer.start();
    producer.start();
    consumer.subscribe_to_event_type(EventType::AgentRun, None).await?;
    consumer.subscribe_to_event_type(EventType::RouterDecision, None).await?;
    bus.subscribe_to_events(EventType::Alert, Some("ops"), None).await?;
    processor.subscribe(EventType::AgentRun).await?;

    for tenant in ["tenant-1", "tenant-2"] {
        producer
            .publish_agent_run(tenant, "run-7", "planner", "completed", None)
            .await;
    }
    producer
        .publish_router_decision("tenant-2", "decision-1", "gpu-pool", None)
        .await;
    producer.flush().await;

    // broker 层重投耗尽，转入死信主题
    let poisoned = Event::from_json(
        EventType::AgentRun,
        "tenant-3",
        serde_json::json!({"run_id": "run-9", "agent_id": "critic"}),
    )?;
    let letter = DeadLetterMessage::from_event(&poisoned, "max deliveries exceeded", 1)?;
    broker
        .publish(
            &relay_domain::dead_letter::dead_letter_subject(poisoned.subject()),
            letter.to_vec()?,
            poisoned.headers(),
        )
        .await?;

    tokio::time::sleep(Duration::from_secs(1)).await;

    for entry in dlq.get_dlq_events(10, 0, None) {
        info!(
            event_id = entry.event_id(),
            event_type = %entry.event().event_type(),
            reason = entry.reason(),
            "dlq entry"
        );
    }
    info!(stats = ?producer.stats(), "producer");
    info!(stats = ?consumer.stats(), "consumer");
    info!(stats = ?dlq.stats(), "dlq");
    info!(stats = ?processor.stats(), "dlq processor");
    info!(
        permanent_failures = failures.list(10, 0).await?.len(),
        streams = bus.get_all_streams_info().await?.len(),
        "summary"
    );

    producer.stop().await;
    consumer.stop().await;
    bus.disconnect().await?;
    Ok(())
}
