use crate::quota::store::{Consume, QuotaStore, QuotaStoreError};
use async_trait::async_trait;
use moka::future::Cache;
use moka::ops::compute::{CompResult, Op};
use std::time::Duration;
use tokio::time::Instant;

/// 最长记录存活时间；真正的过期判断以记录自带的 expires_at 为准，这里只负责回收内存。
const MAX_RECORD_TTL: Duration = Duration::from_secs(48 * 3600);
const MAX_RECORDS: u64 = 100_000;

#[derive(Debug, Clone, Copy)]
struct Record {
    count: u64,
    expires_at: Instant,
}

/// 进程内配额存储。moka 的 and_compute_with 对同一 key 串行执行，
/// 因此"检查并自增"在单进程内是原子的。
#[derive(Debug, Clone)]
pub struct MemoryQuotaStore {
    records: Cache<String, Record>,
}

impl MemoryQuotaStore {
    pub fn new() -> Self {
        Self {
            records: Cache::builder()
                .max_capacity(MAX_RECORDS)
                .time_to_live(MAX_RECORD_TTL)
                .build(),
        }
    }
}

impl Default for MemoryQuotaStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl QuotaStore for MemoryQuotaStore {
    async fn try_consume(
        &self,
        key: &str,
        limit: u64,
        window: Duration,
    ) -> Result<Consume, QuotaStoreError> {
        let now = Instant::now();

        let result = self
            .records
            .entry(key.to_string())
            .and_compute_with(|entry| {
                let current = entry
                    .map(|e| e.into_value())
                    .filter(|r| r.expires_at > now);
                let op = match current {
                    None if limit == 0 => Op::Nop,
                    None => Op::Put(Record {
                        count: 1,
                        expires_at: now + window,
                    }),
                    Some(r) if r.count >= limit => Op::Nop,
                    Some(r) => Op::Put(Record {
                        count: r.count + 1,
                        expires_at: r.expires_at,
                    }),
                };
                std::future::ready(op)
            })
            .await;

        let consume = match result {
            CompResult::Inserted(e) | CompResult::ReplacedWith(e) => Consume::Admitted {
                count: e.value().count,
            },
            CompResult::Unchanged(e) => {
                let r = e.into_value();
                if r.expires_at > now {
                    Consume::Exhausted {
                        count: r.count,
                        ttl: Some(r.expires_at - now),
                    }
                } else {
                    Consume::Exhausted {
                        count: 0,
                        ttl: None,
                    }
                }
            }
            _ => Consume::Exhausted {
                count: 0,
                ttl: None,
            },
        };
        Ok(consume)
    }
}
