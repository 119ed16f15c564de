use crate::quota::store::{Consume, QuotaStore, QuotaStoreError};
use async_trait::async_trait;
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE, HeaderMap, HeaderValue};
use serde::Deserialize;
use std::time::Duration;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

/// 在存储端一次性完成：读取 → 比较 → 自增 → 首次设置过期 → 返回 TTL。
/// 返回 {admitted(0/1), count, ttl_seconds}。
const CONSUME_SCRIPT: &str = r#"
local count = tonumber(redis.call('GET', KEYS[1]) or '0')
if count >= tonumber(ARGV[1]) then
  return {0, count, redis.call('TTL', KEYS[1])}
end
count = redis.call('INCR', KEYS[1])
if count == 1 then
  redis.call('EXPIRE', KEYS[1], ARGV[2])
end
return {1, count, redis.call('TTL', KEYS[1])}
"#;

/// Redis 兼容的 REST 配额存储（Upstash 风格：POST 命令数组，Bearer 鉴权）。
#[derive(Debug, Clone)]
pub struct RestQuotaStore {
    http: reqwest::Client,
    url: String,
    token: String,
}

#[derive(Debug, Deserialize)]
struct CommandReply {
    #[serde(default)]
    result: Option<Vec<i64>>,
    #[serde(default)]
    error: Option<String>,
}

impl RestQuotaStore {
    pub fn new(url: &str, token: &str) -> Result<Self, anyhow::Error> {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .pool_max_idle_per_host(10)
            .build()?;
        Ok(Self {
            http,
            url: url.trim_end_matches('/').to_string(),
            token: token.to_string(),
        })
    }

    fn headers(&self) -> HeaderMap {
        let mut h = HeaderMap::new();
        if !self.token.is_empty()
            && let Ok(v) = HeaderValue::from_str(&format!("Bearer {}", self.token))
        {
            h.insert(AUTHORIZATION, v);
        }
        h.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        h
    }
}

#[async_trait]
impl QuotaStore for RestQuotaStore {
    async fn try_consume(
        &self,
        key: &str,
        limit: u64,
        window: Duration,
    ) -> Result<Consume, QuotaStoreError> {
        let command = [
            "EVAL".to_string(),
            CONSUME_SCRIPT.to_string(),
            "1".to_string(),
            key.to_string(),
            limit.to_string(),
            window.as_secs().max(1).to_string(),
        ];
        let body = serde_json::to_vec(&command)
            .map_err(|e| QuotaStoreError::Malformed(e.to_string()))?;

        let resp = self
            .http
            .post(&self.url)
            .headers(self.headers())
            .body(body)
            .send()
            .await?;

        let status = resp.status();
        let bytes = resp.bytes().await?;
        let reply = sonic_rs::from_slice::<CommandReply>(&bytes);

        if !status.is_success() {
            // Upstash 在命令错误时返回 400 + {"error": "..."}
            if let Ok(CommandReply {
                error: Some(msg), ..
            }) = reply
            {
                return Err(QuotaStoreError::Store(msg));
            }
            return Err(QuotaStoreError::Http {
                status: status.as_u16(),
                body: String::from_utf8_lossy(&bytes).into_owned(),
            });
        }

        let reply = reply.map_err(|e| QuotaStoreError::Malformed(e.to_string()))?;
        parse_reply(reply)
    }
}

fn parse_reply(reply: CommandReply) -> Result<Consume, QuotaStoreError> {
    if let Some(msg) = reply.error {
        return Err(QuotaStoreError::Store(msg));
    }
    let Some(values) = reply.result else {
        return Err(QuotaStoreError::Malformed("缺少 result 字段".to_string()));
    };
    let &[admitted, count, ttl] = values.as_slice() else {
        return Err(QuotaStoreError::Malformed(format!(
            "期望 3 个返回值，实际 {}",
            values.len()
        )));
    };

    let count = count.max(0) as u64;
    if admitted == 1 {
        return Ok(Consume::Admitted { count });
    }
    // TTL 返回 -1（无过期）/-2（不存在）时视为未知。
    let ttl = (ttl > 0).then(|| Duration::from_secs(ttl as u64));
    Ok(Consume::Exhausted { count, ttl })
}
