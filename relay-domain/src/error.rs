//! 事件投递层统一错误定义
//!
//! 按失败类别划分：发布前校验、连接状态、broker 传输、处理器执行与存储，
//! 便于各服务在“快速失败”与“退避重试”之间做出一致的判断。
//!
use std::time::Duration;
use thiserror::Error;

/// 统一错误类型
#[non_exhaustive]
#[derive(Debug, Error)]
pub enum RelayError {
    // --- 序列化/校验 ---
    #[error("serialization error: {source}")]
    Serde {
        #[from]
        source: serde_json::Error,
    },
    #[error("validation failed: type={event_type}, reason={reason}")]
    Validation { event_type: String, reason: String },
    #[error("invalid value: {reason}")]
    InvalidValue { reason: String },

    // --- broker ---
    #[error("broker not connected")]
    NotConnected,
    #[error("broker error: {reason}")]
    Broker { reason: String },
    #[error("publish rejected by broker: subject={subject}")]
    PublishRejected { subject: String },

    // --- 处理器 ---
    #[error("event handler error: handler={handler}, reason={reason}")]
    EventHandler { handler: String, reason: String },
    #[error("timed out after {after:?}")]
    Timeout { after: Duration },

    // --- 存储/查询 ---
    #[error("failure store error: {reason}")]
    FailureStore { reason: String },
    #[error("not found: {reason}")]
    NotFound { reason: String },
}

/// 统一 Result 类型别名
pub type RelayResult<T> = Result<T, RelayError>;

impl RelayError {
    pub fn validation(event_type: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Validation {
            event_type: event_type.into(),
            reason: reason.into(),
        }
    }

    pub fn broker(reason: impl Into<String>) -> Self {
        Self::Broker {
            reason: reason.into(),
        }
    }

    pub fn invalid_value(reason: impl Into<String>) -> Self {
        Self::InvalidValue {
            reason: reason.into(),
        }
    }

    /// 是否属于可退避重试的瞬时错误
    ///
    /// 校验与连接类错误对调用方可见、立即失败；其余（broker 抖动、处理器异常、超时）
    /// 交由重试/退避/DLQ 机制吸收。
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            Self::Validation { .. } | Self::NotConnected | Self::InvalidValue { .. } | Self::Serde { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fail_fast_errors_are_not_retryable() {
        assert!(!RelayError::validation("agent_run", "missing run_id").is_retryable());
        assert!(!RelayError::NotConnected.is_retryable());
        assert!(!RelayError::invalid_value("batch_size=0").is_retryable());
    }

    #[test]
    fn transient_errors_are_retryable() {
        assert!(RelayError::broker("connection reset").is_retryable());
        assert!(
            RelayError::PublishRejected {
                subject: "agent_events.run.completed".into()
            }
            .is_retryable()
        );
        assert!(
            RelayError::Timeout {
                after: Duration::from_secs(1)
            }
            .is_retryable()
        );
    }

    #[test]
    fn display_carries_context() {
        let err = RelayError::validation("agent_run", "field `run_id` is required");
        assert_eq!(
            err.to_string(),
            "validation failed: type=agent_run, reason=field `run_id` is required"
        );
    }
}
