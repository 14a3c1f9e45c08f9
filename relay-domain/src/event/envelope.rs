//! 事件信封（Event）
//!
//! 不可变的事件载体：构造后只读，所有权在生产者缓冲、消费者在途集合与 DLQ 之间转移。
//! 线上格式为：
//!
//! ```text
//! {event_id, event_type, tenant_id, timestamp: number, data: object, headers?: map}
//! ```
//!
use super::event_type::EventType;
use crate::error::{RelayError, RelayResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

/// 事件头（字符串键值）
pub type Headers = BTreeMap<String, String>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// 全局唯一标识
    event_id: String,
    event_type: EventType,
    /// 租户，必填且非空
    tenant_id: String,
    #[serde(with = "unix_seconds")]
    timestamp: DateTime<Utc>,
    /// 事件负载，发布前按类型的 schema 校验
    data: Map<String, Value>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    headers: Headers,
}

impl Event {
    /// 创建事件，自动生成 id 与时间戳
    pub fn new(
        event_type: EventType,
        tenant_id: impl Into<String>,
        data: Map<String, Value>,
    ) -> RelayResult<Self> {
        let tenant_id = tenant_id.into();
        if tenant_id.trim().is_empty() {
            return Err(RelayError::validation(
                event_type.as_str(),
                "tenant_id must not be empty",
            ));
        }

        Ok(Self {
            event_id: uuid::Uuid::new_v4().to_string(),
            event_type,
            tenant_id,
            timestamp: Utc::now(),
            data,
            headers: Headers::new(),
        })
    }

    /// 由 JSON 对象创建；非对象负载视为校验失败
    pub fn from_json(
        event_type: EventType,
        tenant_id: impl Into<String>,
        data: Value,
    ) -> RelayResult<Self> {
        match data {
            Value::Object(map) => Self::new(event_type, tenant_id, map),
            other => Err(RelayError::validation(
                event_type.as_str(),
                format!("payload must be a JSON object, got {}", json_kind(&other)),
            )),
        }
    }

    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }

    pub fn with_headers(mut self, headers: Headers) -> Self {
        self.headers.extend(headers);
        self
    }

    pub fn event_id(&self) -> &str {
        &self.event_id
    }

    pub fn event_type(&self) -> &EventType {
        &self.event_type
    }

    pub fn tenant_id(&self) -> &str {
        &self.tenant_id
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    pub fn data(&self) -> &Map<String, Value> {
        &self.data
    }

    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    /// 事件默认主题
    pub fn subject(&self) -> &'static str {
        self.event_type.subject()
    }

    pub fn to_wire(&self) -> RelayResult<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    /// 解码线上信封，并重新检查租户不变量
    pub fn from_wire(bytes: &[u8]) -> RelayResult<Self> {
        let event: Event = serde_json::from_slice(bytes)?;
        if event.tenant_id.trim().is_empty() {
            return Err(RelayError::validation(
                event.event_type.as_str(),
                "tenant_id must not be empty",
            ));
        }
        Ok(event)
    }
}

pub(crate) fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// 以浮点秒（unix epoch）编码时间戳
pub(crate) mod unix_seconds {
    use chrono::{DateTime, Utc};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(ts: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_f64(ts.timestamp_micros() as f64 / 1_000_000.0)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<DateTime<Utc>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = f64::deserialize(deserializer)?;
        if !secs.is_finite() {
            return Err(serde::de::Error::custom("timestamp must be finite"));
        }
        DateTime::from_timestamp_micros((secs * 1_000_000.0).round() as i64)
            .ok_or_else(|| serde::de::Error::custom("timestamp out of range"))
    }
}
