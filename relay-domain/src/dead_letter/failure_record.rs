use crate::event::Headers;
use bon::Builder;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// 永久失败记录的来源
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureSource {
    /// broker 死信经处理器重试耗尽
    DeadLetterProcessor,
    /// 进程内 DLQ 条目超过保留期
    DlqExpired,
    /// 进程内 DLQ 已满被挤出
    DlqEvicted,
}

/// 永久失败记录：每个终态失败事件恰好一条，只追加
#[derive(Debug, Clone, PartialEq, Builder, Serialize, Deserialize)]
pub struct PermanentFailureRecord {
    #[builder(default = uuid::Uuid::new_v4().to_string())]
    record_id: String,
    #[builder(into)]
    tenant_id: String,
    #[builder(into)]
    event_type: String,
    #[builder(into)]
    event_id: Option<String>,
    #[builder(into)]
    original_subject: String,
    #[builder(default)]
    original_headers: Headers,
    #[builder(default)]
    original_data: Value,
    #[builder(into)]
    last_error: String,
    #[builder(default = Utc::now())]
    failed_at: DateTime<Utc>,
    retry_count: u32,
    source: FailureSource,
}

impl PermanentFailureRecord {
    pub fn record_id(&self) -> &str {
        &self.record_id
    }

    pub fn tenant_id(&self) -> &str {
        &self.tenant_id
    }

    pub fn event_type(&self) -> &str {
        &self.event_type
    }

    pub fn event_id(&self) -> Option<&str> {
        self.event_id.as_deref()
    }

    pub fn original_subject(&self) -> &str {
        &self.original_subject
    }

    pub fn original_headers(&self) -> &Headers {
        &self.original_headers
    }

    pub fn original_data(&self) -> &Value {
        &self.original_data
    }

    pub fn last_error(&self) -> &str {
        &self.last_error
    }

    pub fn failed_at(&self) -> DateTime<Utc> {
        self.failed_at
    }

    pub fn retry_count(&self) -> u32 {
        self.retry_count
    }

    pub fn source(&self) -> FailureSource {
        self.source
    }
}
