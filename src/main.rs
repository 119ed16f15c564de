pub mod config;
pub mod credential;
pub mod dispatch;
pub mod error;
pub mod gateway;
pub mod gemini;
pub mod logging;
pub mod provider;
pub mod quota;
pub mod util;

use anyhow::Context;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cfg = config::Config::load().context("加载配置失败")?;

    init_tracing();

    let pool = Arc::new(
        credential::CredentialPool::new(&cfg.credentials).context("初始化凭据池失败")?,
    );
    tracing::info!("已加载 {} 个 Gemini API Key", cfg.credentials.len());
    if cfg.trust_proxy_headers {
        tracing::info!("TRUST_PROXY_HEADERS 已开启，客户端标识取自 X-Forwarded-For / X-Real-IP");
    }

    let store: Arc<dyn quota::QuotaStore> = if cfg.quota_store_url.is_empty() {
        tracing::warn!("未配置 QUOTA_STORE_URL，使用进程内配额计数（多实例部署时不共享）");
        Arc::new(quota::MemoryQuotaStore::new())
    } else {
        Arc::new(
            quota::RestQuotaStore::new(&cfg.quota_store_url, &cfg.quota_store_token)
                .context("初始化配额存储失败")?,
        )
    };
    let limiter = quota::RateLimiter::new(
        store,
        quota::QuotaTable::new(cfg.model_daily_quotas.clone(), cfg.default_daily_quota),
    );

    let gemini = Arc::new(gemini::GeminiClient::new(&cfg).context("初始化 GeminiClient 失败")?);

    if cfg.auth_token.is_empty() {
        tracing::warn!("未配置 AUTH_TOKEN，特权模型将全部拒绝");
    }
    let privileged =
        dispatch::PrivilegedTier::new(cfg.privileged_models.clone(), cfg.auth_token.clone());

    let state = Arc::new(gateway::AppState {
        dispatcher: dispatch::Dispatcher::new(pool, gemini, limiter, privileged, cfg.log_level()),
        default_model: cfg.default_model.clone(),
        auth_token: cfg.auth_token.clone(),
        unlock_code: cfg.unlock_code.clone(),
        log_level: cfg.log_level(),
        trust_proxy_headers: cfg.trust_proxy_headers,
    });

    let app = gateway::router(state);

    let addr: SocketAddr = format!("{}:{}", cfg.host, cfg.port)
        .parse()
        .unwrap_or_else(|_| SocketAddr::from(([0, 0, 0, 0], cfg.port)));

    tracing::info!("Server listening on http://{addr}");

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .context("绑定监听端口失败")?;

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await
    .context("服务异常退出")?;

    Ok(())
}

fn init_tracing() {
    // DEBUG 只控制请求/响应详细日志块；运行日志由 RUST_LOG 决定，
    // 但本项目自身日志至少为 info，避免预设的 RUST_LOG=warn 吞掉关键信息。
    let env = std::env::var("RUST_LOG").unwrap_or_default();
    let env = env.trim();
    let filter = if env.is_empty() {
        EnvFilter::new("warn,gemini_relay=info")
    } else if env.contains("gemini_relay") {
        EnvFilter::new(env)
    } else {
        EnvFilter::new(format!("{env},gemini_relay=info"))
    };

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_level(true)
        .try_init();
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    tracing::info!("收到退出信号，准备关闭服务...");
}
