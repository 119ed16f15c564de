use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;

/// 一次"检查并自增"的结果。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Consume {
    /// 已计数；count 为自增后的值。
    Admitted { count: u64 },
    /// 已达上限，未自增；ttl 为记录剩余存活时间（存储无法给出时为 None）。
    Exhausted { count: u64, ttl: Option<Duration> },
}

#[derive(Debug, Error)]
pub enum QuotaStoreError {
    #[error("配额存储请求失败: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("配额存储返回 HTTP {status}: {body}")]
    Http { status: u16, body: String },

    #[error("配额存储返回错误: {0}")]
    Store(String),

    #[error("配额存储响应无法解析: {0}")]
    Malformed(String),
}

#[async_trait]
pub trait QuotaStore: Send + Sync {
    /// 原子地：若 key 当前计数 < limit 则自增（首次自增时设置 window 过期），否则不变。
    async fn try_consume(
        &self,
        key: &str,
        limit: u64,
        window: Duration,
    ) -> Result<Consume, QuotaStoreError>;
}
