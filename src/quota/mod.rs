//! 每日配额：按 (客户端, 模型, UTC 日期) 计数的限流器及其后端存储。
//!
//! 存储后端只需提供一个原子的"检查并自增"操作；REST 后端面向多实例部署，
//! 内存后端用于单实例或未配置远端存储的场景。

mod limiter;
mod memory;
mod rest;
mod store;

pub use limiter::{Decision, QuotaTable, RateLimiter, reset_message};
pub use memory::MemoryQuotaStore;
pub use rest::RestQuotaStore;
pub use store::{Consume, QuotaStore, QuotaStoreError};
