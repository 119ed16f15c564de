use crate::logging;
use crate::provider::TextStream;
use axum::body::{Body, Bytes};
use futures::StreamExt;
use std::convert::Infallible;
use std::time::Instant;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::Instrument;

/// 把上游文本块转成客户端字节流。
///
/// `first` 是分发阶段已经拿到的首块，之后的失败不能再切换凭据：
/// 追加一段内联错误提示后关闭流。客户端断开时立即丢弃上游 stream，
/// 从而取消仍在进行的上游请求。
pub fn relay(first: String, rest: TextStream, started_at: Instant, client_log: bool) -> Body {
    let (tx, rx) = mpsc::channel::<Result<Bytes, Infallible>>(64);

    let task = async move {
        let mut rest = rest;
        let mut bytes_sent = first.len();
        let mut interrupted = false;

        if tx.send(Ok(Bytes::from(first))).await.is_err() {
            tracing::info!("客户端已断开，取消上游请求");
            interrupted = true;
        }

        while !interrupted {
            let next = tokio::select! {
                _ = tx.closed() => {
                    tracing::info!("客户端已断开，取消上游请求");
                    interrupted = true;
                    break;
                }
                item = rest.next() => item,
            };

            match next {
                None => break,
                Some(Ok(chunk)) => {
                    if chunk.is_empty() {
                        continue;
                    }
                    bytes_sent += chunk.len();
                    if tx.send(Ok(Bytes::from(chunk))).await.is_err() {
                        tracing::info!("客户端已断开，取消上游请求");
                        interrupted = true;
                    }
                }
                Some(Err(e)) => {
                    tracing::warn!(error = %e, bytes_sent, "上游流中途失败");
                    let notice = mid_stream_notice(&e.to_string());
                    bytes_sent += notice.len();
                    let _ = tx.send(Ok(Bytes::from(notice))).await;
                    interrupted = true;
                    break;
                }
            }
        }

        // 先释放上游连接，再记录日志。
        drop(rest);

        if client_log {
            logging::client_stream_response(started_at.elapsed(), bytes_sent, interrupted);
        }
    };
    tokio::spawn(task.instrument(tracing::Span::current()));

    Body::from_stream(ReceiverStream::new(rx))
}

pub fn mid_stream_notice(message: &str) -> String {
    format!("\n\n[error: {message}]")
}
