//! 事件负载 schema
//!
//! 以字段清单描述某一事件类型的合法负载，发布前校验，失败即 `Validation` 错误，
//! 不会触达 broker。
//!
use super::envelope::json_kind;
use super::event_type::EventType;
use crate::error::{RelayError, RelayResult};
use bon::Builder;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// 字段取值类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldKind {
    String,
    Number,
    Integer,
    Bool,
    Object,
    Array,
    Any,
}

impl FieldKind {
    fn accepts(&self, value: &Value) -> bool {
        match self {
            Self::String => value.is_string(),
            Self::Number => value.is_number(),
            Self::Integer => value.is_i64() || value.is_u64(),
            Self::Bool => value.is_boolean(),
            Self::Object => value.is_object(),
            Self::Array => value.is_array(),
            Self::Any => true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldSpec {
    pub name: String,
    pub kind: FieldKind,
    pub required: bool,
}

impl FieldSpec {
    pub fn required(name: impl Into<String>, kind: FieldKind) -> Self {
        Self {
            name: name.into(),
            kind,
            required: true,
        }
    }

    pub fn optional(name: impl Into<String>, kind: FieldKind) -> Self {
        Self {
            name: name.into(),
            kind,
            required: false,
        }
    }
}

/// 事件负载 schema
#[derive(Debug, Clone, PartialEq, Builder, Serialize, Deserialize)]
pub struct EventSchema {
    #[builder(into)]
    name: String,
    #[builder(default)]
    fields: Vec<FieldSpec>,
    /// 是否允许未声明字段
    #[builder(default = true)]
    allow_unknown: bool,
}

impl EventSchema {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn fields(&self) -> &[FieldSpec] {
        &self.fields
    }

    /// 校验负载；错误信息指出第一个不合规的字段
    pub fn validate(&self, event_type: &EventType, data: &Map<String, Value>) -> RelayResult<()> {
        for field in &self.fields {
            match data.get(&field.name) {
                None | Some(Value::Null) if field.required => {
                    return Err(RelayError::validation(
                        event_type.as_str(),
                        format!("field `{}` is required", field.name),
                    ));
                }
                Some(value) if !value.is_null() && !field.kind.accepts(value) => {
                    return Err(RelayError::validation(
                        event_type.as_str(),
                        format!(
                            "field `{}` expected {:?}, got {}",
                            field.name,
                            field.kind,
                            json_kind(value)
                        ),
                    ));
                }
                _ => {}
            }
        }

        if !self.allow_unknown {
            if let Some(key) = data
                .keys()
                .find(|k| !self.fields.iter().any(|f| &f.name == *k))
            {
                return Err(RelayError::validation(
                    event_type.as_str(),
                    format!("unknown field `{key}`"),
                ));
            }
        }

        Ok(())
    }

    /// 已登记类型的默认 schema
    pub fn for_type(event_type: &EventType) -> Option<EventSchema> {
        use FieldKind::*;

        let (name, fields) = match event_type {
            EventType::AgentRun | EventType::AgentRunStarted => (
                "agent_run",
                vec![
                    FieldSpec::required("run_id", String),
                    FieldSpec::required("agent_id", String),
                    FieldSpec::optional("status", String),
                    FieldSpec::optional("duration_ms", Number),
                ],
            ),
            EventType::AgentRunFailed => (
                "agent_run_failed",
                vec![
                    FieldSpec::required("run_id", String),
                    FieldSpec::required("agent_id", String),
                    FieldSpec::required("error", String),
                ],
            ),
            EventType::RouterDecision => (
                "router_decision",
                vec![
                    FieldSpec::required("decision_id", String),
                    FieldSpec::required("route", String),
                    FieldSpec::optional("confidence", Number),
                ],
            ),
            EventType::FeatureFlagChanged => (
                "feature_flag_changed",
                vec![
                    FieldSpec::required("flag_key", String),
                    FieldSpec::required("enabled", Bool),
                ],
            ),
            EventType::TenantCreated => (
                "tenant_created",
                vec![FieldSpec::required("name", String)],
            ),
            EventType::OrderCreated => (
                "order_created",
                vec![
                    FieldSpec::required("order_id", String),
                    FieldSpec::optional("amount", Number),
                    FieldSpec::optional("items", Array),
                ],
            ),
            EventType::Alert => (
                "alert",
                vec![
                    FieldSpec::required("alert_type", String),
                    FieldSpec::optional("retry_count", Integer),
                ],
            ),
            EventType::Other(_) => return None,
        };

        Some(EventSchema::builder().name(name).fields(fields).build())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn obj(v: Value) -> Map<String, Value> {
        v.as_object().cloned().unwrap()
    }

    #[test]
    fn missing_required_field_fails() {
        let schema = EventSchema::for_type(&EventType::AgentRun).unwrap();
        let err = schema
            .validate(&EventType::AgentRun, &obj(json!({"agent_id": "a"})))
            .unwrap_err();
        assert!(err.to_string().contains("`run_id` is required"));
    }

    #[test]
    fn wrong_kind_fails() {
        let schema = EventSchema::for_type(&EventType::FeatureFlagChanged).unwrap();
        let err = schema
            .validate(
                &EventType::FeatureFlagChanged,
                &obj(json!({"flag_key": "beta", "enabled": "yes"})),
            )
            .unwrap_err();
        assert!(err.to_string().contains("expected Bool, got string"));
    }

    #[test]
    fn optional_null_is_accepted() {
        let schema = EventSchema::for_type(&EventType::RouterDecision).unwrap();
        schema
            .validate(
                &EventType::RouterDecision,
                &obj(json!({"decision_id": "d", "route": "gpt", "confidence": null})),
            )
            .unwrap();
    }

    #[test]
    fn strict_schema_rejects_unknown_fields() {
        let schema = EventSchema::builder()
            .name("strict")
            .fields(vec![FieldSpec::required("id", FieldKind::String)])
            .allow_unknown(false)
            .build();
        let ty = EventType::from("strict");
        schema.validate(&ty, &obj(json!({"id": "x"}))).unwrap();
        assert!(schema.validate(&ty, &obj(json!({"id": "x", "extra": 1}))).is_err());
    }

    #[test]
    fn custom_types_have_no_default_schema() {
        assert!(EventSchema::for_type(&EventType::from("whatever")).is_none());
    }
}
