//! 死信模型
//!
//! - `DlqEntry`：进程内 DLQ 中暂存的失败事件（软重试）；
//! - `DeadLetterMessage`：broker 级死信主题上的消息（硬重试）；
//! - `PermanentFailureRecord`：两条路径的终态记录，供运维复核。

mod entry;
mod failure_record;
mod message;

pub use entry::DlqEntry;
pub use failure_record::{FailureSource, PermanentFailureRecord};
pub use message::{DEAD_LETTER_PREFIX, DeadLetterMessage, dead_letter_subject};
