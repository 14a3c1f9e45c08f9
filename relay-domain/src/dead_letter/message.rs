use crate::error::RelayResult;
use crate::event::{Event, Headers};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// broker 级死信主题前缀：`deadletter.{original_subject}`
pub const DEAD_LETTER_PREFIX: &str = "deadletter";

/// 原始主题对应的死信主题
pub fn dead_letter_subject(original_subject: &str) -> String {
    format!("{DEAD_LETTER_PREFIX}.{original_subject}")
}

/// broker 因重投耗尽而转入死信主题的消息
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetterMessage {
    pub original_subject: String,
    /// 原始负载（通常是事件信封）
    pub original_data: Value,
    #[serde(default)]
    pub original_headers: Headers,
    pub error: String,
    #[serde(with = "crate::event::unix_seconds")]
    pub failed_at: DateTime<Utc>,
    #[serde(default)]
    pub retry_count: u32,
}

impl DeadLetterMessage {
    /// 由事件构造，负载为完整信封
    pub fn from_event(event: &Event, error: impl Into<String>, retry_count: u32) -> RelayResult<Self> {
        Ok(Self {
            original_subject: event.subject().to_string(),
            original_data: serde_json::to_value(event)?,
            original_headers: event.headers().clone(),
            error: error.into(),
            failed_at: Utc::now(),
            retry_count,
        })
    }

    pub fn from_slice(raw: &[u8]) -> RelayResult<Self> {
        Ok(serde_json::from_slice(raw)?)
    }

    pub fn to_vec(&self) -> RelayResult<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    /// 尝试把原始负载还原为事件
    pub fn original_event(&self) -> RelayResult<Event> {
        let bytes = serde_json::to_vec(&self.original_data)?;
        Event::from_wire(&bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::EventType;
    use serde_json::json;

    #[test]
    fn parses_broker_payload_with_defaults() {
        let raw = json!({
            "original_subject": "agent_events.run.completed",
            "original_data": {"foo": 1},
            "error": "max deliveries",
            "failed_at": 1700000000.0
        });
        let msg = DeadLetterMessage::from_slice(raw.to_string().as_bytes()).unwrap();
        assert_eq!(msg.retry_count, 0);
        assert!(msg.original_headers.is_empty());
        assert!(msg.original_event().is_err());
    }

    #[test]
    fn carries_the_original_event() {
        let event = Event::from_json(EventType::AgentRun, "t1", json!({"run_id": "r"})).unwrap();
        let msg = DeadLetterMessage::from_event(&event, "boom", 2).unwrap();
        let back = DeadLetterMessage::from_slice(&msg.to_vec().unwrap()).unwrap();
        assert_eq!(back.original_subject, "agent_events.run.completed");
        assert_eq!(back.original_event().unwrap().event_id(), event.event_id());
        assert_eq!(
            dead_letter_subject(&back.original_subject),
            "deadletter.agent_events.run.completed"
        );
    }
}
