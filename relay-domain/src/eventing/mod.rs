//! 事件子系统（eventing）
//!
//! 定义 broker 协议与处理器抽象：
//! - `Broker`：外部发布/订阅传输的窄接口；
//! - `EventHandler` / `HandlerOutcome`：消费事件并返回显式结果；
//! - `DeadLetterHandler`：消费 broker 级死信；
//! - `HandlerFactory`：按需构造全新处理器实例。
//!
//! 运行时（总线、生产者、消费者、DLQ）在 `relay-runtime` 中实现。
//!
pub mod broker;
#[cfg(feature = "inmemory")]
pub mod broker_inmemory;
pub mod handler;

pub use broker::{Broker, BrokerMessage, BrokerSubscription, ConsumerInfo, StreamInfo, SubscriptionId};
#[cfg(feature = "inmemory")]
pub use broker_inmemory::InMemoryBroker;
pub use handler::{
    DeadLetterHandler, EventHandler, FnHandler, HandlerFactory, HandlerOutcome, handler_fn,
};
