use anyhow::Result as AnyResult;
use chrono::{DateTime, Utc};
use relay_domain::event::{Event, EventType};
use relay_domain::eventing::InMemoryBroker;
use relay_domain::time;
use relay_runtime::{DlqConfig, DlqHandler, EventBus, ManualRetry};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

async fn dlq_with(config: DlqConfig) -> AnyResult<(Arc<InMemoryBroker>, DlqHandler)> {
    let broker = Arc::new(InMemoryBroker::new());
    let bus = Arc::new(EventBus::new(broker.clone()));
    bus.connect().await?;
    let dlq = DlqHandler::builder().bus(bus).config(config).build();
    Ok((broker, dlq))
}

fn order(n: usize) -> AnyResult<Event> {
    Ok(Event::from_json(
        EventType::OrderCreated,
        "T1",
        json!({"order_id": format!("o-{n}")}),
    )?)
}

#[tokio::test]
async fn full_dlq_keeps_the_most_recent_entries() -> AnyResult<()> {
    let (_, dlq) = dlq_with(DlqConfig {
        max_dlq_size: 3,
        ..DlqConfig::default()
    })
    .await?;

    let events = (0..5).map(order).collect::<AnyResult<Vec<_>>>()?;
    for e in &events {
        dlq.send_to_dlq(e.clone(), "handler failed").await;
    }

    let kept: Vec<String> = dlq
        .get_dlq_events(10, 0, None)
        .iter()
        .map(|e| e.event_id().to_string())
        .collect();
    let expected: Vec<String> = events[2..].iter().map(|e| e.event_id().to_string()).collect();
    assert_eq!(kept, expected);
    assert_eq!(dlq.stats().events_evicted, 2);
    Ok(())
}

#[tokio::test]
async fn manual_retry_after_removal_is_not_found() -> AnyResult<()> {
    let (_, dlq) = dlq_with(DlqConfig::default()).await?;
    let e = order(1)?;
    dlq.send_to_dlq(e.clone(), "boom").await;

    assert_eq!(dlq.retry_due_at(Utc::now()).await, 1);
    assert_eq!(dlq.manual_retry(e.event_id()).await, ManualRetry::NotFound);
    assert_eq!(dlq.manual_retry(e.event_id()).await, ManualRetry::NotFound);
    assert_eq!(dlq.stats().events_processed, 1);
    Ok(())
}

#[tokio::test]
async fn retention_is_a_hard_ceiling() -> AnyResult<()> {
    let retention = Duration::from_secs(7 * 86_400);
    let (_, dlq) = dlq_with(DlqConfig {
        retention_period: retention,
        ..DlqConfig::default()
    })
    .await?;
    let now = Utc::now();

    let stale = order(1)?;
    let fresh = order(2)?;
    dlq.send_to_dlq_at(stale.clone(), "x", time::before(now, retention + Duration::from_secs(1)))
        .await;
    dlq.send_to_dlq_at(fresh.clone(), "x", now).await;
    assert_eq!(dlq.get_dlq_event(stale.event_id()).map(|e| e.retry_count()), Some(0));

    assert_eq!(dlq.expire_at(now).await, 1);
    assert!(dlq.get_dlq_event(stale.event_id()).is_none());
    assert!(dlq.get_dlq_event(fresh.event_id()).is_some());
    assert_eq!(dlq.stats().events_expired, 1);
    Ok(())
}

#[tokio::test]
async fn failed_retries_back_off_exponentially() -> AnyResult<()> {
    let (broker, dlq) = dlq_with(DlqConfig {
        retry_delay: Duration::from_secs(60),
        retry_backoff_multiplier: 2.0,
        max_retry_attempts: 3,
        ..DlqConfig::default()
    })
    .await?;
    let e2 = order(2)?;
    let mut now: DateTime<Utc> = Utc::now();
    dlq.send_to_dlq_at(e2.clone(), "handler failed", now).await;

    let mut deltas = Vec::new();
    for _ in 0..3 {
        broker.fail_next_publishes(1);
        assert_eq!(dlq.retry_due_at(now).await, 0);
        let entry = dlq.get_dlq_event(e2.event_id()).expect("still queued");
        deltas.push((entry.next_retry_at() - now).num_seconds());
        now = entry.next_retry_at();
    }
    assert_eq!(deltas, vec![120, 240, 480]);

    let entry = dlq.get_dlq_event(e2.event_id()).expect("kept after exhaustion");
    assert_eq!(entry.retry_count(), 3);
    assert!(entry.last_error().is_some_and(|e| e.contains("injected")));
    assert_eq!(dlq.retry_due_at(now).await, 0);
    assert_eq!(dlq.stats().events_retried, 3);
    Ok(())
}

#[tokio::test]
async fn retry_delay_is_monotonic_and_capped() -> AnyResult<()> {
    let cap = Duration::from_secs(300);
    let (broker, dlq) = dlq_with(DlqConfig {
        retry_delay: Duration::from_secs(60),
        max_retry_delay: cap,
        max_retry_attempts: 8,
        ..DlqConfig::default()
    })
    .await?;
    let e = order(1)?;
    let mut now = Utc::now();
    dlq.send_to_dlq_at(e.clone(), "x", now).await;

    let mut previous = now;
    for _ in 0..8 {
        broker.fail_next_publishes(1);
        dlq.retry_due_at(now).await;
        let next = dlq.get_dlq_event(e.event_id()).expect("queued").next_retry_at();
        assert!(next > previous);
        assert!((next - now).num_seconds() <= cap.as_secs() as i64);
        previous = next;
        now = next;
    }
    Ok(())
}
