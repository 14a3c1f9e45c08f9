//! 事件类型与主题（subject）映射
//!
//! 主题命名约定为 `"{category}.{action}"`，例如 `agent_events.run.completed`；
//! 未映射的类型统一落到 `custom_events.unknown`。
//!
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// 未映射类型的兜底主题
pub const FALLBACK_SUBJECT: &str = "custom_events.unknown";

/// 事件类型
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum EventType {
    AgentRun,
    AgentRunStarted,
    AgentRunFailed,
    RouterDecision,
    FeatureFlagChanged,
    TenantCreated,
    OrderCreated,
    Alert,
    /// 未登记的类型，保留原始标签
    Other(String),
}

impl EventType {
    pub fn as_str(&self) -> &str {
        match self {
            Self::AgentRun => "agent_run",
            Self::AgentRunStarted => "agent_run_started",
            Self::AgentRunFailed => "agent_run_failed",
            Self::RouterDecision => "router_decision",
            Self::FeatureFlagChanged => "feature_flag_changed",
            Self::TenantCreated => "tenant_created",
            Self::OrderCreated => "order_created",
            Self::Alert => "alert",
            Self::Other(tag) => tag,
        }
    }

    /// 类型对应的线上主题
    pub fn subject(&self) -> &'static str {
        match self {
            Self::AgentRun => "agent_events.run.completed",
            Self::AgentRunStarted => "agent_events.run.started",
            Self::AgentRunFailed => "agent_events.run.failed",
            Self::RouterDecision => "router_events.decision.made",
            Self::FeatureFlagChanged => "flag_events.flag.changed",
            Self::TenantCreated => "tenant_events.tenant.created",
            Self::OrderCreated => "order_events.order.created",
            Self::Alert => "system_events.alert",
            Self::Other(_) => FALLBACK_SUBJECT,
        }
    }

    pub fn category(&self) -> EventCategory {
        EventCategory::from_subject(self.subject()).unwrap_or(EventCategory::Custom)
    }

    /// 全部已登记类型
    pub fn known() -> [EventType; 8] {
        [
            Self::AgentRun,
            Self::AgentRunStarted,
            Self::AgentRunFailed,
            Self::RouterDecision,
            Self::FeatureFlagChanged,
            Self::TenantCreated,
            Self::OrderCreated,
            Self::Alert,
        ]
    }

    /// 由主题反查已登记类型（兜底主题无法反查）
    pub fn from_subject(subject: &str) -> Option<EventType> {
        Self::known().into_iter().find(|t| t.subject() == subject)
    }
}

impl From<&str> for EventType {
    fn from(tag: &str) -> Self {
        match tag {
            "agent_run" => Self::AgentRun,
            "agent_run_started" => Self::AgentRunStarted,
            "agent_run_failed" => Self::AgentRunFailed,
            "router_decision" => Self::RouterDecision,
            "feature_flag_changed" => Self::FeatureFlagChanged,
            "tenant_created" => Self::TenantCreated,
            "order_created" => Self::OrderCreated,
            "alert" => Self::Alert,
            other => Self::Other(other.to_string()),
        }
    }
}

impl From<String> for EventType {
    fn from(tag: String) -> Self {
        Self::from(tag.as_str())
    }
}

impl From<EventType> for String {
    fn from(value: EventType) -> Self {
        value.as_str().to_string()
    }
}

impl FromStr for EventType {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self::from(s))
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 事件大类，对应主题的第一段
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventCategory {
    Agent,
    Router,
    Flag,
    Tenant,
    Order,
    System,
    Custom,
}

impl EventCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Agent => "agent_events",
            Self::Router => "router_events",
            Self::Flag => "flag_events",
            Self::Tenant => "tenant_events",
            Self::Order => "order_events",
            Self::System => "system_events",
            Self::Custom => "custom_events",
        }
    }

    /// 以主题第一段解析大类；无法识别时返回 `None`
    pub fn from_subject(subject: &str) -> Option<Self> {
        let head = subject.split('.').next()?;
        match head {
            "agent_events" => Some(Self::Agent),
            "router_events" => Some(Self::Router),
            "flag_events" => Some(Self::Flag),
            "tenant_events" => Some(Self::Tenant),
            "order_events" => Some(Self::Order),
            "system_events" => Some(Self::System),
            "custom_events" => Some(Self::Custom),
            _ => None,
        }
    }
}

impl fmt::Display for EventCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
