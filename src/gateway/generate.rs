use crate::dispatch::{ChatRequest, ResponseMode};
use crate::error::AppError;
use crate::gateway::AppState;
use crate::gateway::common::{ClientIp, require_post};
use crate::logging;
use crate::util::id;
use axum::body::Bytes;
use axum::extract::{OriginalUri, State};
use axum::http::{HeaderMap, Method};
use axum::response::{IntoResponse, Response};
use std::sync::Arc;
use std::time::Instant;
use tracing::Instrument;

pub async fn handle_generate(
    State(state): State<Arc<AppState>>,
    ClientIp(client): ClientIp,
    method: Method,
    uri: OriginalUri,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let span = tracing::info_span!("generate", request_id = %id::request_id(), client = %client);

    async move {
        let start = Instant::now();
        let log_level = state.log_level;
        if log_level.client_enabled() {
            logging::client_request(method.as_str(), uri.0.path(), &client, &headers, &body);
        }

        let result = match require_post(&method)
            .and_then(|_| ChatRequest::parse(&body, &state.default_model))
        {
            Ok(req) => {
                let mode = req.mode;
                let model = req.model.clone();
                tracing::info!(%model, ?mode, history = req.history.len(), "收到生成请求");
                state
                    .dispatcher
                    .dispatch(&client, req)
                    .await
                    .map(|reply| (mode, reply))
            }
            Err(e) => Err(e),
        };

        match result {
            // 流式响应的日志在 relay 结束时输出。
            Ok((ResponseMode::Streaming, reply)) => reply.into_response(),
            Ok((ResponseMode::Buffered, reply)) => {
                let resp = reply.into_response();
                if log_level.client_enabled() {
                    logging::client_response(resp.status().as_u16(), start.elapsed(), None);
                }
                resp
            }
            Err(e) => {
                if log_level.client_enabled() {
                    log_error(&e, start);
                }
                e.into_response()
            }
        }
    }
    .instrument(span)
    .await
}

fn log_error(err: &AppError, start: Instant) {
    let mut obj = sonic_rs::Object::new();
    obj.insert(&"error", sonic_rs::Value::from(err.to_string().as_str()));
    logging::client_response(
        err.status().as_u16(),
        start.elapsed(),
        Some(&obj.into_value()),
    );
}
