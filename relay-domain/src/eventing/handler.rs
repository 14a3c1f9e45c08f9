//! 事件处理器（EventHandler）
//!
//! 处理器返回显式的 `HandlerOutcome`，重试与升级只取决于结果本身：
//! `Success` 结束，`Retryable` 按退避重试，`Fatal` 直接进入死信路径。
//!
use super::broker::BrokerMessage;
use crate::event::Event;
use async_trait::async_trait;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

/// 处理结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandlerOutcome {
    Success,
    Retryable(String),
    Fatal(String),
}

impl HandlerOutcome {
    pub fn retryable(reason: impl fmt::Display) -> Self {
        Self::Retryable(reason.to_string())
    }

    pub fn fatal(reason: impl fmt::Display) -> Self {
        Self::Fatal(reason.to_string())
    }

    /// `Err` 视为可重试
    pub fn from_result(result: anyhow::Result<()>) -> Self {
        match result {
            Ok(()) => Self::Success,
            Err(e) => Self::Retryable(format!("{e:#}")),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success)
    }

    pub fn reason(&self) -> Option<&str> {
        match self {
            Self::Success => None,
            Self::Retryable(r) | Self::Fatal(r) => Some(r),
        }
    }
}

/// 事件处理器：处理某一类型的事件
#[async_trait]
pub trait EventHandler: Send + Sync {
    /// 处理器名称（用于日志与失败记录）
    fn handler_name(&self) -> &str;

    async fn handle(&self, event: &Event) -> HandlerOutcome;
}

/// broker 级死信处理器
#[async_trait]
pub trait DeadLetterHandler: Send + Sync {
    async fn handle_dead_letter(&self, message: BrokerMessage);
}

/// 按需构造新的处理器实例（死信重试时使用全新实例）
pub trait HandlerFactory: Send + Sync {
    fn create(&self) -> Arc<dyn EventHandler>;
}

impl<F> HandlerFactory for F
where
    F: Fn() -> Arc<dyn EventHandler> + Send + Sync,
{
    fn create(&self) -> Arc<dyn EventHandler> {
        (self)()
    }
}

/// 闭包处理器
pub struct FnHandler<F> {
    name: String,
    f: F,
}

#[async_trait]
impl<F, Fut> EventHandler for FnHandler<F>
where
    F: Fn(Event) -> Fut + Send + Sync,
    Fut: Future<Output = HandlerOutcome> + Send,
{
    fn handler_name(&self) -> &str {
        &self.name
    }

    async fn handle(&self, event: &Event) -> HandlerOutcome {
        (self.f)(event.clone()).await
    }
}

/// 由闭包构造处理器
pub fn handler_fn<F, Fut>(name: impl Into<String>, f: F) -> Arc<dyn EventHandler>
where
    F: Fn(Event) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HandlerOutcome> + Send + 'static,
{
    Arc::new(FnHandler {
        name: name.into(),
        f,
    })
}
