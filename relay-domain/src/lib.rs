//! 事件投递可靠性层：领域模型与端口（relay-domain）
//!
//! 提供与具体 broker、存储解耦的最小构件：
//! - 事件模型（`event`）：不可变信封、类型/主题映射与负载 schema
//! - 死信模型（`dead_letter`）：DLQ 条目、broker 死信消息与永久失败记录
//! - 事件子系统（`eventing`）：broker 协议与处理器抽象
//! - 持久化端口（`persist`）：永久失败记录的只追加存储
//!
//! 默认的 `inmemory` 特性提供内存 broker，便于测试与本地运行；
//! 生产、消费与重试编排见 `relay-runtime`。
//!
pub mod dead_letter;
pub mod error;
pub mod event;
pub mod eventing;
pub mod persist;
pub mod time;
