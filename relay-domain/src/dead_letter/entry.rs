use crate::event::Event;
use crate::time;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// 进程内 DLQ 条目：包裹耗尽重试的事件及其失败信息
///
/// `retry_count` 只增不减；`next_retry_at` 由持有方按退避策略推进。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DlqEntry {
    event: Event,
    /// 进入 DLQ 的原因
    reason: String,
    first_seen_at: DateTime<Utc>,
    retry_count: u32,
    next_retry_at: DateTime<Utc>,
    /// 最近一次重投失败的错误
    #[serde(default, skip_serializing_if = "Option::is_none")]
    last_error: Option<String>,
}

impl DlqEntry {
    pub fn new(event: Event, reason: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            event,
            reason: reason.into(),
            first_seen_at: now,
            retry_count: 0,
            next_retry_at: now,
            last_error: None,
        }
    }

    pub fn event(&self) -> &Event {
        &self.event
    }

    pub fn event_id(&self) -> &str {
        self.event.event_id()
    }

    pub fn reason(&self) -> &str {
        &self.reason
    }

    pub fn first_seen_at(&self) -> DateTime<Utc> {
        self.first_seen_at
    }

    pub fn retry_count(&self) -> u32 {
        self.retry_count
    }

    pub fn next_retry_at(&self) -> DateTime<Utc> {
        self.next_retry_at
    }

    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    /// 到期且尚未耗尽重试次数
    pub fn is_due(&self, now: DateTime<Utc>, max_retry_attempts: u32) -> bool {
        now >= self.next_retry_at && self.retry_count < max_retry_attempts
    }

    /// 超过保留期（与重试状态无关）
    pub fn is_expired(&self, now: DateTime<Utc>, retention: Duration) -> bool {
        self.first_seen_at < time::before(now, retention)
    }

    /// 记录一次重投失败：计数加一，并把下次重试推迟 `delay`
    ///
    /// 下次重试时间不会早于当前值。
    pub fn record_failure(&mut self, error: impl Into<String>, now: DateTime<Utc>, delay: Duration) {
        self.retry_count = self.retry_count.saturating_add(1);
        self.last_error = Some(error.into());
        self.next_retry_at = time::after(now, delay).max(self.next_retry_at);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::EventType;
    use serde_json::Map;

    fn entry(now: DateTime<Utc>) -> DlqEntry {
        let event = Event::new(EventType::AgentRun, "t1", Map::new()).unwrap();
        DlqEntry::new(event, "handler exploded", now)
    }

    #[test]
    fn new_entry_is_immediately_due() {
        let now = Utc::now();
        let e = entry(now);
        assert_eq!(e.retry_count(), 0);
        assert_eq!(e.next_retry_at(), now);
        assert!(e.is_due(now, 3));
        assert!(!e.is_due(now, 0));
    }

    #[test]
    fn failures_push_next_retry_forward() {
        let now = Utc::now();
        let mut e = entry(now);
        e.record_failure("still down", now, Duration::from_secs(120));
        assert_eq!(e.retry_count(), 1);
        assert_eq!(e.last_error(), Some("still down"));
        assert_eq!((e.next_retry_at() - now).num_seconds(), 120);
        assert!(!e.is_due(now, 3));

        // 更短的延迟不会让下次重试提前
        e.record_failure("again", now, Duration::from_secs(10));
        assert_eq!(e.retry_count(), 2);
        assert_eq!((e.next_retry_at() - now).num_seconds(), 120);
    }

    #[test]
    fn expiry_uses_first_seen() {
        let retention = Duration::from_secs(3600);
        let now = Utc::now();
        let e = entry(time::before(now, retention + Duration::from_secs(1)));
        assert!(e.is_expired(now, retention));
        assert!(!entry(now).is_expired(now, retention));
    }
}
