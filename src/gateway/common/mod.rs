pub mod client_ip;
pub mod cors;

pub use client_ip::ClientIp;
pub use cors::cors_middleware;

use crate::error::AppError;
use axum::http::Method;

/// 业务端点只接受 POST；其它方法统一返回 405 JSON。
pub fn require_post(method: &Method) -> Result<(), AppError> {
    if method == Method::POST {
        Ok(())
    } else {
        Err(AppError::MethodNotAllowed)
    }
}
