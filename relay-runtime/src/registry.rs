//! 处理器注册表（HandlerRegistry）
//!
//! 显式的 类型 → 处理器列表 映射，由调用方在启动时填充，可检查、可测试。
//!
use dashmap::DashMap;
use relay_domain::event::EventType;
use relay_domain::eventing::EventHandler;
use std::sync::Arc;

#[derive(Clone, Default)]
pub struct HandlerRegistry {
    by_type: Arc<DashMap<EventType, Vec<Arc<dyn EventHandler>>>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// 追加处理器；同一类型允许多个
    pub fn register(&self, event_type: EventType, handler: Arc<dyn EventHandler>) {
        self.by_type.entry(event_type).or_default().push(handler);
    }

    /// 某类型当前的处理器快照
    pub fn matching(&self, event_type: &EventType) -> Vec<Arc<dyn EventHandler>> {
        self.by_type
            .get(event_type)
            .map(|list| list.clone())
            .unwrap_or_default()
    }

    pub fn handler_names(&self, event_type: &EventType) -> Vec<String> {
        self.matching(event_type)
            .iter()
            .map(|h| h.handler_name().to_string())
            .collect()
    }

    pub fn event_types(&self) -> Vec<EventType> {
        let mut types: Vec<EventType> = self.by_type.iter().map(|e| e.key().clone()).collect();
        types.sort();
        types
    }
}
