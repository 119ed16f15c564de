use crate::gateway::AppState;
use axum::extract::{ConnectInfo, FromRequestParts};
use axum::http::HeaderMap;
use axum::http::request::Parts;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;

/// 调用方标识（用作配额计数的 key）。
///
/// 默认只看对端地址；开启 TRUST_PROXY_HEADERS 后优先级为
/// X-Forwarded-For 的第一个地址 > X-Real-IP > 对端地址 > "unknown"。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientIp(pub String);

impl FromRequestParts<Arc<AppState>> for ClientIp {
    type Rejection = Infallible;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &Arc<AppState>,
    ) -> Result<Self, Self::Rejection> {
        let peer = parts
            .extensions
            .get::<ConnectInfo<SocketAddr>>()
            .map(|ConnectInfo(addr)| addr.ip().to_string());
        Ok(Self(resolve(
            &parts.headers,
            peer,
            state.trust_proxy_headers,
        )))
    }
}

fn resolve(headers: &HeaderMap, peer: Option<String>, trust_proxy_headers: bool) -> String {
    let fallback = || peer.clone().unwrap_or_else(|| "unknown".to_string());
    if !trust_proxy_headers {
        // 直连时转发头由客户端任意填写，不能作为配额 key。
        return fallback();
    }

    let header = |name: &str| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty())
    };

    if let Some(first) = header("x-forwarded-for")
        .and_then(|v| v.split(',').next())
        .map(str::trim)
        .filter(|v| !v.is_empty())
    {
        return first.to_string();
    }
    if let Some(real) = header("x-real-ip") {
        return real.to_string();
    }
    fallback()
}
