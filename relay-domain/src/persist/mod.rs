//! 持久化端口
//!
//! 永久失败记录的只追加存储；进程内实现用于测试与本地运行。

mod failure_store;
mod failure_store_inmemory;

pub use failure_store::PermanentFailureStore;
pub use failure_store_inmemory::InMemoryFailureStore;
