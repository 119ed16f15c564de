use crate::config::Config;
use crate::credential::Credential;
use crate::gemini::stream::decode_sse;
use crate::gemini::types::{Request, Response};
use crate::logging;
use crate::provider::{Generation, Provider, TextStream, UpstreamError};
use async_trait::async_trait;
use reqwest::header::{CONTENT_TYPE, HeaderMap, HeaderValue, USER_AGENT};
use sonic_rs::JsonValueTrait;
use std::time::{Duration, Instant};

const API_KEY_HEADER: &str = "x-goog-api-key";
const CLIENT_USER_AGENT: &str = concat!("gemini-relay/", env!("CARGO_PKG_VERSION"));

#[derive(Debug, Clone)]
pub struct GeminiClient {
    http: reqwest::Client,
    http_stream: reqwest::Client,
    base: String,
    log_level: logging::LogLevel,
}

impl GeminiClient {
    pub fn new(cfg: &Config) -> Result<Self, anyhow::Error> {
        let mut http_builder = reqwest::Client::builder()
            .pool_max_idle_per_host(10)
            .pool_idle_timeout(Duration::from_secs(90));

        // 流式请求不设整体超时（由客户端断开触发取消），只限制建连时间。
        let mut http_stream_builder = reqwest::Client::builder()
            .pool_max_idle_per_host(10)
            .pool_idle_timeout(Duration::from_secs(90))
            .connect_timeout(Duration::from_secs(30));

        if cfg.timeout_ms > 0 {
            http_builder = http_builder.timeout(Duration::from_millis(cfg.timeout_ms));
        }

        if !cfg.proxy.trim().is_empty() {
            // Proxy 不保证可 Clone，这里各自构建一次避免 trait 约束。
            http_builder = http_builder.proxy(reqwest::Proxy::all(cfg.proxy.trim())?);
            http_stream_builder = http_stream_builder.proxy(reqwest::Proxy::all(cfg.proxy.trim())?);
        }

        Ok(Self {
            http: http_builder.build()?,
            http_stream: http_stream_builder.build()?,
            base: cfg.api_base.trim_end_matches('/').to_string(),
            log_level: cfg.log_level(),
        })
    }

    fn model_url(&self, model: &str, method: &str) -> String {
        format!(
            "{}/v1beta/models/{}:{method}",
            self.base,
            urlencoding::encode(model)
        )
    }

    pub fn no_stream_url(&self, model: &str) -> String {
        self.model_url(model, "generateContent")
    }

    pub fn stream_url(&self, model: &str) -> String {
        format!("{}?alt=sse", self.model_url(model, "streamGenerateContent"))
    }

    fn build_headers(&self, credential: &Credential) -> HeaderMap {
        let mut h = HeaderMap::new();
        h.insert(USER_AGENT, HeaderValue::from_static(CLIENT_USER_AGENT));
        h.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        if let Ok(v) = HeaderValue::from_str(credential.secret()) {
            h.insert(API_KEY_HEADER, v);
        }
        h
    }

    fn log_request(&self, url: &str, headers: &HeaderMap, body: &[u8]) {
        if self.log_level.backend_enabled() {
            logging::backend_request("POST", url, headers, body);
        }
    }

    fn log_response(&self, status: u16, start: Instant, body: &[u8]) {
        if self.log_level.backend_enabled() {
            logging::backend_response(status, start.elapsed(), body);
        }
    }
}

#[async_trait]
impl Provider for GeminiClient {
    async fn complete(
        &self,
        credential: &Credential,
        generation: Generation<'_>,
    ) -> Result<String, UpstreamError> {
        let url = self.no_stream_url(generation.model);
        let body = sonic_rs::to_vec(&Request::from_generation(&generation))
            .map_err(|e| UpstreamError::Decode(e.to_string()))?;
        let headers = self.build_headers(credential);
        self.log_request(&url, &headers, &body);

        let start = Instant::now();
        let resp = self
            .http
            .post(url)
            .headers(headers)
            .body(body)
            .send()
            .await?;

        let status = resp.status();
        let bytes = resp.bytes().await?;
        self.log_response(status.as_u16(), start, &bytes);
        if !status.is_success() {
            return Err(extract_error_details(status.as_u16(), &bytes));
        }

        let parsed = sonic_rs::from_slice::<Response>(&bytes)
            .map_err(|e| UpstreamError::Decode(e.to_string()))?;
        let text = parsed.text();
        if text.is_empty() {
            return Err(UpstreamError::Empty(parsed.empty_reason()));
        }
        Ok(text)
    }

    async fn complete_streaming(
        &self,
        credential: &Credential,
        generation: Generation<'_>,
    ) -> Result<TextStream, UpstreamError> {
        let url = self.stream_url(generation.model);
        let body = sonic_rs::to_vec(&Request::from_generation(&generation))
            .map_err(|e| UpstreamError::Decode(e.to_string()))?;
        let headers = self.build_headers(credential);
        self.log_request(&url, &headers, &body);

        let start = Instant::now();
        let resp = self
            .http_stream
            .post(url)
            .headers(headers)
            .body(body)
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            let bytes = resp.bytes().await?;
            self.log_response(status.as_u16(), start, &bytes);
            return Err(extract_error_details(status.as_u16(), &bytes));
        }

        Ok(decode_sse(resp.bytes_stream(), self.log_level.raw_enabled()))
    }
}

/// 解析 `{"error":{"code","message","status"}}`；code 可能是数字或字符串。
pub(crate) fn extract_error_details(status: u16, body: &[u8]) -> UpstreamError {
    #[derive(Debug, serde::Deserialize)]
    struct ErrResp {
        error: ErrInner,
    }

    #[derive(Debug, serde::Deserialize)]
    struct ErrInner {
        #[serde(default)]
        code: Option<sonic_rs::Value>,
        #[serde(default)]
        message: String,
        #[serde(default)]
        status: String,
    }

    let mut out_status = status;
    let mut message = String::from_utf8_lossy(body).trim().to_string();
    if message.is_empty() {
        message = "Unknown error".to_string();
    }

    if let Ok(err_resp) = sonic_rs::from_slice::<ErrResp>(body) {
        let err = err_resp.error;
        if !err.message.is_empty() {
            message = err.message;
        } else if !err.status.is_empty() {
            message = err.status.clone();
        }

        if let Some(code) = err.code {
            if let Some(i) = code.as_i64() {
                if i > 0 && i <= u16::MAX as i64 {
                    out_status = i as u16;
                }
            } else if let Some(s) = code.as_str() {
                match s.to_uppercase().as_str() {
                    "RESOURCE_EXHAUSTED" => out_status = 429,
                    "UNAUTHENTICATED" => out_status = 401,
                    "PERMISSION_DENIED" => out_status = 403,
                    "INTERNAL" => out_status = 500,
                    _ => {}
                }
            }
        }
    }

    UpstreamError::Http {
        status: out_status,
        message,
    }
}
