use anyhow::Result as AnyResult;
use futures_util::StreamExt;
use relay_domain::dead_letter::{DeadLetterMessage, dead_letter_subject};
use relay_domain::event::{Event, EventCategory, EventSchema, EventType, Headers};
use relay_domain::eventing::{Broker, BrokerSubscription, InMemoryBroker};
use serde_json::json;
use std::time::Duration;

async fn next_event(sub: &mut BrokerSubscription) -> AnyResult<Event> {
    let message = tokio::time::timeout(Duration::from_secs(1), sub.messages.next())
        .await?
        .ok_or_else(|| anyhow::anyhow!("subscription closed"))?;
    Ok(Event::from_wire(&message.payload)?)
}

#[tokio::test]
async fn events_travel_through_the_broker_intact() -> AnyResult<()> {
    let broker = InMemoryBroker::new();
    broker.connect().await?;
    let mut sub = broker.subscribe("agent_events.>", Some("audit")).await?;

    let event = Event::from_json(
        EventType::AgentRunFailed,
        "T1",
        json!({"run_id": "r-1", "agent_id": "a-1", "error": "oom"}),
    )?
    .with_header("trace_id", "t-42");
    EventSchema::for_type(event.event_type())
        .expect("known type has a schema")
        .validate(event.event_type(), event.data())?;

    broker
        .publish(event.subject(), event.to_wire()?, event.headers())
        .await?;
    let received = next_event(&mut sub).await?;

    assert_eq!(received.event_id(), event.event_id());
    assert_eq!(received.data(), event.data());
    assert_eq!(received.headers()["trace_id"], "t-42");
    assert_eq!(
        received.timestamp().timestamp_micros(),
        event.timestamp().timestamp_micros()
    );
    assert_eq!(received.subject(), "agent_events.run.failed");
    assert_eq!(
        EventCategory::from_subject(received.subject()),
        Some(EventCategory::Agent)
    );
    Ok(())
}

#[tokio::test]
async fn durable_consumer_catches_up_after_restart() -> AnyResult<()> {
    let broker = InMemoryBroker::new();
    broker.connect().await?;
    let subject = EventType::TenantCreated.subject();

    let first = broker.subscribe(subject, Some("provisioner")).await?;
    broker.unsubscribe(&first.id).await?;

    for name in ["acme", "globex"] {
        let e = Event::from_json(EventType::TenantCreated, "T1", json!({"name": name}))?;
        broker.publish(subject, e.to_wire()?, &Headers::new()).await?;
    }

    let mut again = broker.subscribe(subject, Some("provisioner")).await?;
    assert_eq!(next_event(&mut again).await?.data()["name"], "acme");
    assert_eq!(next_event(&mut again).await?.data()["name"], "globex");

    let info = broker.consumer_info("tenant_events", "provisioner").await?;
    assert_eq!(info.pending, 0);
    assert_eq!(broker.stream_info("tenant_events").await?.messages, 2);
    Ok(())
}

#[tokio::test]
async fn dead_letters_carry_the_original_envelope() -> AnyResult<()> {
    let broker = InMemoryBroker::new();
    broker.connect().await?;
    let original = EventType::RouterDecision.subject();
    let mut dead = broker.subscribe_dead_letters(original).await?;

    let event = Event::from_json(
        EventType::RouterDecision,
        "T9",
        json!({"decision_id": "d-1", "route": "gpu"}),
    )?;
    let letter = DeadLetterMessage::from_event(&event, "max deliveries", 5)?;
    broker
        .publish(&dead_letter_subject(original), letter.to_vec()?, &Headers::new())
        .await?;

    let message = tokio::time::timeout(Duration::from_secs(1), dead.messages.next())
        .await?
        .ok_or_else(|| anyhow::anyhow!("dead letter stream closed"))?;
    let parsed = DeadLetterMessage::from_slice(&message.payload)?;
    assert_eq!(parsed.retry_count, 5);
    assert_eq!(parsed.original_event()?.tenant_id(), "T9");
    Ok(())
}
