//! 请求分发：特权校验 → 配额检查 → 按轮询顺序逐个凭据调用上游。

pub mod relay;
pub mod request;

pub use request::{ChatRequest, ResponseMode};

use crate::credential::{Credential, CredentialPool};
use crate::error::AppError;
use crate::logging::LogLevel;
use crate::provider::{Generation, Provider, TextStream, UpstreamError};
use crate::quota::{Decision, RateLimiter, reset_message};
use axum::Json;
use axum::body::Body;
use axum::http::{HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use futures::StreamExt;
use serde::Serialize;
use std::sync::Arc;
use std::time::Instant;
use subtle::ConstantTimeEq;

/// 需要口令才能使用的模型集合。
#[derive(Debug, Clone)]
pub struct PrivilegedTier {
    patterns: Vec<String>,
    secret: String,
}

impl PrivilegedTier {
    /// `*` 结尾的模式按前缀匹配，其它按子串匹配（均忽略大小写）。
    pub fn new(patterns: Vec<String>, secret: impl Into<String>) -> Self {
        Self {
            patterns: patterns
                .into_iter()
                .map(|p| p.trim().to_lowercase())
                .filter(|p| !p.is_empty())
                .collect(),
            secret: secret.into(),
        }
    }

    pub fn covers(&self, model: &str) -> bool {
        let model = model.to_lowercase();
        self.patterns.iter().any(|p| match p.strip_suffix('*') {
            Some(prefix) => model.starts_with(prefix),
            None => model.contains(p.as_str()),
        })
    }

    /// 未配置口令时任何 token 都不成立。
    pub fn accepts(&self, token: Option<&str>) -> bool {
        if self.secret.is_empty() {
            return false;
        }
        token.is_some_and(|t| bool::from(t.as_bytes().ct_eq(self.secret.as_bytes())))
    }
}

#[derive(Debug, Serialize)]
struct TextBody {
    text: String,
}

/// 分发成功后的响应。
pub enum Reply {
    Buffered(String),
    Streaming(Body),
}

impl IntoResponse for Reply {
    fn into_response(self) -> Response {
        match self {
            Reply::Buffered(text) => (StatusCode::OK, Json(TextBody { text })).into_response(),
            Reply::Streaming(body) => {
                let mut resp = Response::new(body);
                let headers = resp.headers_mut();
                headers.insert(
                    header::CONTENT_TYPE,
                    HeaderValue::from_static("text/plain; charset=utf-8"),
                );
                headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-cache"));
                headers.insert("x-accel-buffering", HeaderValue::from_static("no"));
                resp
            }
        }
    }
}

pub struct Dispatcher {
    pool: Arc<CredentialPool>,
    provider: Arc<dyn Provider>,
    limiter: RateLimiter,
    privileged: PrivilegedTier,
    log_level: LogLevel,
}

impl Dispatcher {
    pub fn new(
        pool: Arc<CredentialPool>,
        provider: Arc<dyn Provider>,
        limiter: RateLimiter,
        privileged: PrivilegedTier,
        log_level: LogLevel,
    ) -> Self {
        Self {
            pool,
            provider,
            limiter,
            privileged,
            log_level,
        }
    }

    #[cfg(test)]
    pub(crate) fn pool(&self) -> &CredentialPool {
        &self.pool
    }

    pub async fn dispatch(&self, client_id: &str, req: ChatRequest) -> Result<Reply, AppError> {
        let started_at = Instant::now();

        // 特权校验放在计数之前，被拒绝的请求不占用配额。
        if self.privileged.covers(&req.model) && !self.privileged.accepts(req.token.as_deref()) {
            tracing::info!(model = %req.model, "特权模型缺少有效口令");
            return Err(AppError::forbidden(
                "authentication required for this model",
            ));
        }

        if let Decision::Deny { retry_after, .. } = self.limiter.check(client_id, &req.model).await
        {
            return Err(AppError::rate_limited(reset_message(&req.model, retry_after)));
        }

        let attempts = self.pool.snapshot().await;
        let mut last_err: Option<UpstreamError> = None;

        for (index, credential) in attempts {
            tracing::debug!(index, credential = %credential.masked(), model = %req.model, "尝试凭据");

            let outcome = match req.mode {
                ResponseMode::Buffered => self
                    .provider
                    .complete(&credential, req.generation())
                    .await
                    .map(Reply::Buffered),
                ResponseMode::Streaming => self
                    .open_stream(&credential, req.generation())
                    .await
                    .map(|(first, rest)| {
                        Reply::Streaming(relay::relay(
                            first,
                            rest,
                            started_at,
                            self.log_level.client_enabled(),
                        ))
                    }),
            };

            match outcome {
                Ok(reply) => {
                    self.pool.advance(index).await;
                    tracing::info!(
                        index,
                        model = %req.model,
                        elapsed_ms = started_at.elapsed().as_millis() as u64,
                        "分发成功"
                    );
                    return Ok(reply);
                }
                Err(e) => {
                    tracing::warn!(
                        index,
                        credential = %credential.masked(),
                        status = ?e.status(),
                        error = %e,
                        "凭据调用失败，切换下一个"
                    );
                    last_err = Some(e);
                }
            }
        }

        let message = last_err
            .map(|e| e.to_string())
            .unwrap_or_else(|| "no credential attempted".to_string());
        tracing::error!(model = %req.model, error = %message, "所有凭据均失败");
        Err(AppError::exhausted(message))
    }

    /// 等到首个非空文本块才算该凭据成功；之前的任何失败都可以换凭据重试。
    async fn open_stream(
        &self,
        credential: &Credential,
        generation: Generation<'_>,
    ) -> Result<(String, TextStream), UpstreamError> {
        let mut stream = self
            .provider
            .complete_streaming(credential, generation)
            .await?;
        loop {
            match stream.next().await {
                Some(Ok(chunk)) if chunk.is_empty() => continue,
                Some(Ok(chunk)) => return Ok((chunk, stream)),
                Some(Err(e)) => return Err(e),
                None => {
                    return Err(UpstreamError::Empty(
                        "stream ended without text".to_string(),
                    ));
                }
            }
        }
    }
}
