use crate::error::AppError;
use crate::gateway::AppState;
use crate::gateway::common::require_post;
use axum::Json;
use axum::body::Bytes;
use axum::extract::State;
use axum::http::{Method, StatusCode};
use axum::response::{IntoResponse, Response};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use subtle::ConstantTimeEq;

#[derive(Debug, Deserialize)]
struct AuthenticateRequest {
    code: String,
}

#[derive(Debug, Serialize)]
#[serde(untagged)]
enum AuthenticateResponse {
    Granted { success: bool, token: String },
    Denied { success: bool, message: &'static str },
}

/// 用解锁码换取特权模型的口令。
pub async fn handle_authenticate(
    State(state): State<Arc<AppState>>,
    method: Method,
    body: Bytes,
) -> Response {
    if let Err(e) = require_post(&method) {
        return e.into_response();
    }

    let req: AuthenticateRequest = match sonic_rs::from_slice(&body) {
        Ok(v) => v,
        Err(_) => return AppError::bad_request("invalid request body").into_response(),
    };

    if code_matches(&state.unlock_code, &req.code) {
        tracing::info!("解锁码校验通过");
        let body = AuthenticateResponse::Granted {
            success: true,
            token: state.auth_token.clone(),
        };
        return (StatusCode::OK, Json(body)).into_response();
    }

    tracing::info!("解锁码错误");
    let body = AuthenticateResponse::Denied {
        success: false,
        message: "Invalid code",
    };
    (StatusCode::UNAUTHORIZED, Json(body)).into_response()
}

fn code_matches(expected: &str, got: &str) -> bool {
    !expected.is_empty() && bool::from(expected.as_bytes().ct_eq(got.as_bytes()))
}
