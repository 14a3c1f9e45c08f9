//! 事件投递可靠性层：运行时（relay-runtime）
//!
//! 在 `relay-domain` 的模型与端口之上编排投递流程：
//! - `EventBus`：连接状态、负载 schema 与处理器注册的唯一入口；
//! - `EventProducer`：批处理与发布重试；
//! - `EventConsumer`：有界并发、超时与重试，耗尽后转入 DLQ；
//! - `DlqHandler`：进程内有界死信队列，带退避重试与保留期清理；
//! - `DlqProcessor`：broker 级死信的最终失败处理与告警。
//!
//! 所有服务均显式构造并以 `Arc` 共享，不存在进程级单例。
//!
pub mod backoff;
pub mod bus;
pub mod config;
pub mod consumer;
pub mod dlq_handler;
pub mod dlq_processor;
pub mod producer;
pub mod registry;
pub mod worker;

pub use backoff::Backoff;
pub use bus::EventBus;
pub use config::{ConsumerConfig, DlqConfig, DlqProcessorConfig, ProducerConfig, RelayConfig};
pub use consumer::{ConsumerStats, EventConsumer};
pub use dlq_handler::{DlqHandler, DlqStats, ManualRetry};
pub use dlq_processor::{DlqDisposition, DlqProcessor, DlqProcessorStats, PERMANENT_FAILURE_ALERT};
pub use producer::{EventProducer, ProducerStats};
pub use registry::HandlerRegistry;
pub use worker::WorkerHandle;
