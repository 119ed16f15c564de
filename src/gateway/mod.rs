//! HTTP 入口：/generate、/authenticate、/health，以及全局 CORS。

pub mod authenticate;
pub mod common;
pub mod generate;

use crate::dispatch::Dispatcher;
use crate::logging::LogLevel;
use axum::routing::{any, get};
use axum::{Router, middleware};
use std::sync::Arc;

pub struct AppState {
    pub dispatcher: Dispatcher,
    pub default_model: String,
    pub auth_token: String,
    pub unlock_code: String,
    pub log_level: LogLevel,
    /// 见 `Config::trust_proxy_headers`。
    pub trust_proxy_headers: bool,
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(handle_health))
        // 方法校验在 handler 内完成，以便 405 也返回统一的 JSON 错误体。
        .route("/generate", any(generate::handle_generate))
        .route("/authenticate", any(authenticate::handle_authenticate))
        .with_state(state)
        .layer(middleware::from_fn(common::cors_middleware))
}

async fn handle_health() -> &'static str {
    "ok"
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credential::CredentialPool;
    use crate::dispatch::PrivilegedTier;
    use crate::provider::mock::{Script, ScriptedProvider};
    use crate::quota::{MemoryQuotaStore, QuotaTable, RateLimiter};
    use axum::body::Body;
    use axum::http::{Request, StatusCode, header};
    use axum::extract::ConnectInfo;
    use std::collections::HashMap;
    use std::net::SocketAddr;
    use tower::ServiceExt;

    fn app(provider: ScriptedProvider, limits: &[(&str, u64)]) -> (Router, Arc<ScriptedProvider>) {
        app_with(provider, limits, false)
    }

    fn app_with(
        provider: ScriptedProvider,
        limits: &[(&str, u64)],
        trust_proxy_headers: bool,
    ) -> (Router, Arc<ScriptedProvider>) {
        let provider = Arc::new(provider);
        let table = QuotaTable::new(
            limits
                .iter()
                .map(|(m, l)| (m.to_string(), *l))
                .collect::<HashMap<_, _>>(),
            50,
        );
        let dispatcher = Dispatcher::new(
            Arc::new(CredentialPool::new(["k1", "k2"]).unwrap()),
            provider.clone(),
            RateLimiter::new(Arc::new(MemoryQuotaStore::new()), table),
            PrivilegedTier::new(vec!["pro".to_string()], "pass-token"),
            LogLevel::Off,
        );
        let state = Arc::new(AppState {
            dispatcher,
            default_model: "gemini-2.5-flash".to_string(),
            auth_token: "pass-token".to_string(),
            unlock_code: "open-sesame".to_string(),
            log_level: LogLevel::Off,
            trust_proxy_headers,
        });
        (router(state), provider)
    }

    fn echo() -> ScriptedProvider {
        ScriptedProvider::new()
            .with("k1", Script::Fail("k1 down".to_string()))
            .with("k2", Script::Chunks(vec!["h".to_string(), "i".to_string()]))
    }

    fn post(uri: &str, body: &str) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    /// 模拟从 `peer` 直连、并自带 X-Forwarded-For 的请求。
    fn post_from(peer: [u8; 4], forwarded_for: &str, body: &str) -> Request<Body> {
        let mut req = post("/generate", body);
        req.headers_mut()
            .insert("x-forwarded-for", forwarded_for.parse().unwrap());
        req.extensions_mut()
            .insert(ConnectInfo(SocketAddr::from((peer, 40000))));
        req
    }

    async fn send(app: &Router, req: Request<Body>) -> (StatusCode, axum::http::HeaderMap, String) {
        let resp = app.clone().oneshot(req).await.unwrap();
        let status = resp.status();
        let headers = resp.headers().clone();
        let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX)
            .await
            .unwrap();
        (status, headers, String::from_utf8(bytes.to_vec()).unwrap())
    }

    fn error_of(body: &str) -> String {
        let v: serde_json::Value = serde_json::from_str(body).unwrap();
        v["error"].as_str().unwrap_or_default().to_string()
    }

    #[tokio::test]
    async fn buffered_generate_returns_text_json() {
        let (app, provider) = app(echo(), &[]);
        let (status, headers, body) =
            send(&app, post("/generate", r#"{"prompt":"hello","stream":false}"#)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, r#"{"text":"hi"}"#);
        assert_eq!(headers[header::ACCESS_CONTROL_ALLOW_ORIGIN], "*");
        assert_eq!(provider.calls(), vec!["k1", "k2"]);
    }

    #[tokio::test]
    async fn streaming_generate_returns_plain_text() {
        let (app, _) = app(echo(), &[]);
        let (status, headers, body) = send(&app, post("/generate", r#"{"prompt":"hello"}"#)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(headers[header::CONTENT_TYPE], "text/plain; charset=utf-8");
        assert_eq!(headers[header::CACHE_CONTROL], "no-cache");
        assert_eq!(headers["x-accel-buffering"], "no");
        assert_eq!(body, "hi");
    }

    #[tokio::test]
    async fn wrong_method_is_405() {
        let (app, provider) = app(echo(), &[]);
        let req = Request::builder()
            .method("GET")
            .uri("/generate")
            .body(Body::empty())
            .unwrap();
        let (status, _, body) = send(&app, req).await;
        assert_eq!(status, StatusCode::METHOD_NOT_ALLOWED);
        assert_eq!(error_of(&body), "Method Not Allowed");
        assert!(provider.calls().is_empty());
    }

    #[tokio::test]
    async fn preflight_is_answered_by_cors_layer() {
        let (app, _) = app(echo(), &[]);
        let req = Request::builder()
            .method("OPTIONS")
            .uri("/generate")
            .body(Body::empty())
            .unwrap();
        let (status, headers, _) = send(&app, req).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(headers[header::ACCESS_CONTROL_ALLOW_METHODS], "POST, OPTIONS");
        assert_eq!(
            headers[header::ACCESS_CONTROL_ALLOW_HEADERS],
            "Content-Type, Authorization"
        );
    }

    #[tokio::test]
    async fn invalid_bodies_are_400() {
        let (app, provider) = app(echo(), &[]);
        for body in ["{", r#"{"prompt":""}"#, r#"{"prompt":"x","bogus":true}"#] {
            let (status, _, resp) = send(&app, post("/generate", body)).await;
            assert_eq!(status, StatusCode::BAD_REQUEST, "{body}");
            assert!(!error_of(&resp).is_empty());
        }
        assert!(provider.calls().is_empty());
    }

    #[tokio::test]
    async fn privileged_model_needs_token() {
        let (app, provider) = app(echo(), &[]);
        let (status, _, body) = send(
            &app,
            post("/generate", r#"{"prompt":"x","model":"gemini-2.5-pro"}"#),
        )
        .await;
        assert_eq!(status, StatusCode::FORBIDDEN);
        assert!(error_of(&body).contains("authentication required"));
        assert!(provider.calls().is_empty());

        let (status, _, body) = send(
            &app,
            post(
                "/generate",
                r#"{"prompt":"x","model":"gemini-2.5-pro","token":"pass-token","stream":false}"#,
            ),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, r#"{"text":"hi"}"#);
    }

    #[tokio::test]
    async fn quota_is_tracked_per_forwarded_client_behind_trusted_proxy() {
        let (app, _) = app_with(echo(), &[("modelA", 1)], true);
        let body = r#"{"prompt":"x","model":"modelA","stream":false}"#;
        let proxy = [10, 0, 0, 1];

        let (status, _, _) = send(&app, post_from(proxy, "203.0.113.1", body)).await;
        assert_eq!(status, StatusCode::OK);

        let (status, _, resp) =
            send(&app, post_from(proxy, "203.0.113.1, 10.0.0.1", body)).await;
        assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
        assert!(error_of(&resp).starts_with("modelA quota exceeded; resets in "));

        let (status, _, _) = send(&app, post_from(proxy, "203.0.113.2", body)).await;
        assert_eq!(status, StatusCode::OK);
    }

    #[tokio::test]
    async fn spoofed_forwarded_for_does_not_reset_quota_on_direct_connection() {
        let (app, provider) = app(echo(), &[("modelA", 1)]);
        let body = r#"{"prompt":"x","model":"modelA","stream":false}"#;
        let peer = [198, 51, 100, 9];

        let (status, _, _) = send(&app, post_from(peer, "203.0.113.1", body)).await;
        assert_eq!(status, StatusCode::OK);
        let served = provider.calls().len();

        for forged in ["203.0.113.2", "203.0.113.3, 10.0.0.1"] {
            let (status, _, resp) = send(&app, post_from(peer, forged, body)).await;
            assert_eq!(status, StatusCode::TOO_MANY_REQUESTS, "{forged}");
            assert!(error_of(&resp).starts_with("modelA quota exceeded"));
        }
        assert_eq!(provider.calls().len(), served);

        let (status, _, _) = send(&app, post_from([198, 51, 100, 10], "203.0.113.1", body)).await;
        assert_eq!(status, StatusCode::OK);
    }

    #[tokio::test]
    async fn exhausted_credentials_are_500() {
        let provider = ScriptedProvider::new()
            .with("k1", Script::Fail("k1 down".to_string()))
            .with("k2", Script::Fail("k2 down".to_string()));
        let (app, _) = app(provider, &[]);
        let (status, _, body) = send(&app, post("/generate", r#"{"prompt":"x"}"#)).await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(
            error_of(&body),
            "all credentials failed: upstream 503: k2 down"
        );
    }

    #[tokio::test]
    async fn authenticate_exchanges_code_for_token() {
        let (app, _) = app(echo(), &[]);

        let (status, _, body) = send(&app, post("/authenticate", r#"{"code":"open-sesame"}"#)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, r#"{"success":true,"token":"pass-token"}"#);

        let (status, _, body) = send(&app, post("/authenticate", r#"{"code":"nope"}"#)).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body, r#"{"success":false,"message":"Invalid code"}"#);

        let (status, _, _) = send(&app, post("/authenticate", "[]")).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn health_is_ok() {
        let (app, _) = app(echo(), &[]);
        let req = Request::builder()
            .uri("/health")
            .body(Body::empty())
            .unwrap();
        let (status, _, body) = send(&app, req).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, "ok");
    }
}
