use crate::quota::store::{Consume, QuotaStore};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

/// 每日额度的统计窗口。
pub const DAILY_WINDOW: Duration = Duration::from_secs(24 * 3600);

/// 模型 → 每日上限；未列出的模型使用 default。
#[derive(Debug, Clone)]
pub struct QuotaTable {
    limits: HashMap<String, u64>,
    default: u64,
}

impl QuotaTable {
    pub fn new(limits: HashMap<String, u64>, default: u64) -> Self {
        Self { limits, default }
    }

    pub fn limit_for(&self, model: &str) -> u64 {
        self.limits.get(model).copied().unwrap_or(self.default)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Allow,
    Deny { limit: u64, retry_after: Duration },
}

pub struct RateLimiter {
    store: Arc<dyn QuotaStore>,
    table: QuotaTable,
    window: Duration,
}

impl RateLimiter {
    pub fn new(store: Arc<dyn QuotaStore>, table: QuotaTable) -> Self {
        Self::with_window(store, table, DAILY_WINDOW)
    }

    pub fn with_window(store: Arc<dyn QuotaStore>, table: QuotaTable, window: Duration) -> Self {
        Self {
            store,
            table,
            window,
        }
    }

    /// 检查并计数。存储不可用时记录日志并放行（fail-open）。
    pub async fn check(&self, client_id: &str, model: &str) -> Decision {
        let now = Utc::now();
        let key = day_key(client_id, model, now);
        let limit = self.table.limit_for(model);

        match self.store.try_consume(&key, limit, self.window).await {
            Ok(Consume::Admitted { count }) => {
                tracing::debug!(client = client_id, model, count, limit, "配额计数");
                Decision::Allow
            }
            Ok(Consume::Exhausted { count, ttl }) => {
                let retry_after = ttl.unwrap_or_else(|| until_next_utc_midnight(now));
                tracing::info!(
                    client = client_id,
                    model,
                    count,
                    limit,
                    retry_after_secs = retry_after.as_secs(),
                    "每日配额已用尽"
                );
                Decision::Deny { limit, retry_after }
            }
            Err(e) => {
                tracing::warn!(error = %e, client = client_id, model, "配额存储不可用，放行请求");
                Decision::Allow
            }
        }
    }
}

/// 计数 key：按调用方当前的 UTC 日期分桶。
pub fn day_key(client_id: &str, model: &str, now: DateTime<Utc>) -> String {
    format!("quota:{client_id}:{model}:{}", now.format("%Y-%m-%d"))
}

/// 429 响应里的提示文本。
pub fn reset_message(model: &str, retry_after: Duration) -> String {
    let total_minutes = retry_after.as_secs() / 60;
    let hours = total_minutes / 60;
    let minutes = total_minutes % 60;
    format!("{model} quota exceeded; resets in {hours} hours {minutes} minutes")
}

fn until_next_utc_midnight(now: DateTime<Utc>) -> Duration {
    let next = (now.date_naive() + ChronoDuration::days(1))
        .and_hms_opt(0, 0, 0)
        .map(|dt| dt.and_utc());
    match next {
        Some(next) => (next - now).to_std().unwrap_or(DAILY_WINDOW),
        None => DAILY_WINDOW,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::quota::memory::MemoryQuotaStore;
    use crate::quota::store::QuotaStoreError;
    use async_trait::async_trait;
    use chrono::TimeZone;

    struct BrokenStore;

    #[async_trait]
    impl QuotaStore for BrokenStore {
        async fn try_consume(
            &self,
            _key: &str,
            _limit: u64,
            _window: Duration,
        ) -> Result<Consume, QuotaStoreError> {
            Err(QuotaStoreError::Http {
                status: 503,
                body: "down".to_string(),
            })
        }
    }

    struct NoTtlStore;

    #[async_trait]
    impl QuotaStore for NoTtlStore {
        async fn try_consume(
            &self,
            _key: &str,
            limit: u64,
            _window: Duration,
        ) -> Result<Consume, QuotaStoreError> {
            Ok(Consume::Exhausted {
                count: limit,
                ttl: None,
            })
        }
    }

    fn table(pairs: &[(&str, u64)], default: u64) -> QuotaTable {
        QuotaTable::new(
            pairs.iter().map(|(m, l)| (m.to_string(), *l)).collect(),
            default,
        )
    }

    #[test]
    fn limit_lookup_falls_back_to_default() {
        let t = table(&[("modelA", 2)], 7);
        assert_eq!(t.limit_for("modelA"), 2);
        assert_eq!(t.limit_for("other"), 7);
    }

    #[tokio::test]
    async fn third_request_for_limit_two_is_denied() {
        let limiter = RateLimiter::new(
            Arc::new(MemoryQuotaStore::new()),
            table(&[("modelA", 2)], 100),
        );
        assert_eq!(limiter.check("1.1.1.1", "modelA").await, Decision::Allow);
        assert_eq!(limiter.check("1.1.1.1", "modelA").await, Decision::Allow);
        match limiter.check("1.1.1.1", "modelA").await {
            Decision::Deny { limit, retry_after } => {
                assert_eq!(limit, 2);
                assert!(retry_after <= DAILY_WINDOW);
            }
            Decision::Allow => panic!("expected deny"),
        }
        // 其它客户端、其它模型各自独立计数。
        assert_eq!(limiter.check("2.2.2.2", "modelA").await, Decision::Allow);
        assert_eq!(limiter.check("1.1.1.1", "modelB").await, Decision::Allow);
    }

    #[tokio::test]
    async fn window_expiry_readmits_and_restarts_count() {
        let store = Arc::new(MemoryQuotaStore::new());
        let limiter = RateLimiter::with_window(
            store.clone(),
            table(&[("m", 1)], 1),
            Duration::from_millis(50),
        );
        assert_eq!(limiter.check("c", "m").await, Decision::Allow);
        assert!(matches!(
            limiter.check("c", "m").await,
            Decision::Deny { .. }
        ));
        tokio::time::sleep(Duration::from_millis(80)).await;
        assert_eq!(limiter.check("c", "m").await, Decision::Allow);

        let key = day_key("c", "m", Utc::now());
        assert!(matches!(
            store.try_consume(&key, 1, Duration::from_millis(50)).await,
            Ok(Consume::Exhausted { count: 1, .. })
        ));
    }

    #[tokio::test]
    async fn store_failure_fails_open() {
        let limiter = RateLimiter::new(Arc::new(BrokenStore), table(&[], 0));
        assert_eq!(limiter.check("c", "m").await, Decision::Allow);
    }

    #[tokio::test]
    async fn missing_ttl_falls_back_to_end_of_day() {
        let limiter = RateLimiter::new(Arc::new(NoTtlStore), table(&[], 3));
        match limiter.check("c", "m").await {
            Decision::Deny { limit, retry_after } => {
                assert_eq!(limit, 3);
                assert!(retry_after <= DAILY_WINDOW);
            }
            Decision::Allow => panic!("expected deny"),
        }
    }

    #[test]
    fn day_key_uses_utc_date() {
        let now = Utc.with_ymd_and_hms(2026, 3, 9, 23, 59, 59).unwrap();
        assert_eq!(
            day_key("10.0.0.1", "gemini-2.5-pro", now),
            "quota:10.0.0.1:gemini-2.5-pro:2026-03-09"
        );
    }

    #[test]
    fn midnight_fallback() {
        let now = Utc.with_ymd_and_hms(2026, 3, 9, 22, 30, 0).unwrap();
        assert_eq!(
            until_next_utc_midnight(now),
            Duration::from_secs(90 * 60)
        );
    }

    #[test]
    fn reset_message_format() {
        assert_eq!(
            reset_message("gemini-2.5-pro", Duration::from_secs(5 * 3600 + 7 * 60 + 30)),
            "gemini-2.5-pro quota exceeded; resets in 5 hours 7 minutes"
        );
    }
}
