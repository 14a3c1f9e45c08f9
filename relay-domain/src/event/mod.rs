//! 事件模型（Event Model）
//!
//! 不可变事件信封、事件类型与主题映射，以及按类型登记的负载 schema。

mod envelope;
mod event_type;
mod schema;

pub use envelope::{Event, Headers};
pub(crate) use envelope::unix_seconds;
pub use event_type::{EventCategory, EventType, FALLBACK_SUBJECT};
pub use schema::{EventSchema, FieldKind, FieldSpec};
