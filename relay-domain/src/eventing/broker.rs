//! Broker 协议
//!
//! 事件层对底层发布/订阅传输的最小依赖：连接生命周期、发布、持久订阅、
//! 死信订阅与流/消费者信息查询。具体 broker 的线上格式不在此处体现。
//!
use crate::error::RelayResult;
use crate::event::Headers;
use async_trait::async_trait;
use futures_core::stream::BoxStream;
use serde::{Deserialize, Serialize};
use std::fmt;

/// 订阅标识，由 broker 分配
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SubscriptionId(String);

impl SubscriptionId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// broker 投递的一条消息
#[derive(Debug, Clone, PartialEq)]
pub struct BrokerMessage {
    pub subject: String,
    pub payload: Vec<u8>,
    pub headers: Headers,
    /// broker 分配的顺序号
    pub sequence: u64,
    /// 第几次投递（从 1 开始）
    pub delivery_count: u32,
}

/// 一次订阅：标识 + `'static` 消息流，便于在 `tokio::spawn` 中消费
///
/// 退订后消息流结束。
pub struct BrokerSubscription {
    pub id: SubscriptionId,
    pub messages: BoxStream<'static, BrokerMessage>,
}

impl fmt::Debug for BrokerSubscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BrokerSubscription")
            .field("id", &self.id)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamInfo {
    pub name: String,
    pub subjects: Vec<String>,
    pub messages: u64,
    pub last_sequence: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsumerInfo {
    pub stream: String,
    pub name: String,
    pub delivered: u64,
    /// 已发布但尚未投递给该消费者的消息数
    pub pending: u64,
}

/// Broker：外部协作方的窄接口
#[async_trait]
pub trait Broker: Send + Sync {
    async fn connect(&self) -> RelayResult<()>;

    async fn disconnect(&self) -> RelayResult<()>;

    /// 发布消息，返回 broker 分配的顺序号
    async fn publish(&self, subject: &str, payload: Vec<u8>, headers: &Headers) -> RelayResult<u64>;

    /// 订阅主题；`durable_name` 非空时为持久订阅（跨重连保留投递位置）
    async fn subscribe(
        &self,
        subject: &str,
        durable_name: Option<&str>,
    ) -> RelayResult<BrokerSubscription>;

    async fn unsubscribe(&self, id: &SubscriptionId) -> RelayResult<()>;

    /// 订阅某主题的 broker 级死信
    async fn subscribe_dead_letters(&self, subject: &str) -> RelayResult<BrokerSubscription>;

    async fn stream_info(&self, stream: &str) -> RelayResult<StreamInfo>;

    async fn consumer_info(&self, stream: &str, consumer: &str) -> RelayResult<ConsumerInfo>;

    async fn streams(&self) -> RelayResult<Vec<StreamInfo>>;

    async fn consumers(&self, stream: &str) -> RelayResult<Vec<ConsumerInfo>>;
}
