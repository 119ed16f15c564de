use crate::gemini::client::extract_error_details;
use crate::gemini::types::Response;
use crate::logging;
use crate::provider::{TextStream, UpstreamError};
use bytes::Bytes;
use futures::{Stream, StreamExt};
use serde::Deserialize;

#[derive(Debug)]
enum LineEvent {
    Skip,
    Done,
    Text(String),
    Error(UpstreamError),
}

#[derive(Debug, Default, Deserialize)]
struct ErrorProbe {
    #[serde(default)]
    error: Option<sonic_rs::Value>,
}

/// 把 `alt=sse` 的字节流按行切分，逐个 `data:` 事件解码为文本块。
///
/// 空文本事件（例如只带 finishReason 的尾包）被跳过；传输层错误与流内错误事件
/// 作为最后一项产出后结束。
pub fn decode_sse<S, E>(body: S, raw_log: bool) -> TextStream
where
    S: Stream<Item = Result<Bytes, E>> + Send + 'static,
    E: Into<UpstreamError> + Send + 'static,
{
    let s = async_stream::stream! {
        let mut body = Box::pin(body);
        let mut buf: Vec<u8> = Vec::with_capacity(4 * 1024);
        let mut processed: usize = 0;

        while let Some(item) = body.next().await {
            let chunk = match item {
                Ok(c) => c,
                Err(e) => {
                    yield Err::<String, UpstreamError>(e.into());
                    return;
                }
            };
            buf.extend_from_slice(chunk.as_ref());

            while let Some(nl_rel) = buf[processed..].iter().position(|&b| b == b'\n') {
                let nl = processed + nl_rel;
                let event = decode_line(&buf[processed..nl], raw_log);
                processed = nl + 1;
                match event {
                    LineEvent::Skip => {}
                    LineEvent::Done => return,
                    LineEvent::Text(t) => yield Ok(t),
                    LineEvent::Error(e) => {
                        yield Err(e);
                        return;
                    }
                }
            }

            // 释放已处理的前缀，避免 buffer 无限增长。
            if processed > 0 {
                buf.drain(..processed);
                processed = 0;
            }
        }

        // 上游可能在最后一行后不带换行就关闭连接。
        if !buf.is_empty() {
            match decode_line(&buf, raw_log) {
                LineEvent::Text(t) => yield Ok(t),
                LineEvent::Error(e) => yield Err(e),
                LineEvent::Skip | LineEvent::Done => {}
            }
        }
    };
    s.boxed()
}

fn decode_line(line_raw: &[u8], raw_log: bool) -> LineEvent {
    if raw_log {
        logging::backend_stream_line_raw(line_raw);
    }

    let line = line_raw.strip_suffix(b"\r").unwrap_or(line_raw);
    let Some(json_bytes) = line.strip_prefix(b"data:") else {
        return LineEvent::Skip;
    };
    let json_bytes = json_bytes.trim_ascii_start();
    if json_bytes == b"[DONE]" {
        return LineEvent::Done;
    }

    if let Ok(ErrorProbe { error: Some(_) }) = sonic_rs::from_slice::<ErrorProbe>(json_bytes) {
        return LineEvent::Error(extract_error_details(500, json_bytes));
    }

    let resp = match sonic_rs::from_slice::<Response>(json_bytes) {
        Ok(r) => r,
        Err(e) => return LineEvent::Error(UpstreamError::Decode(e.to_string())),
    };

    let text = resp.text();
    if !text.is_empty() {
        return LineEvent::Text(text);
    }
    if resp
        .prompt_feedback
        .as_ref()
        .is_some_and(|f| !f.block_reason.is_empty())
    {
        return LineEvent::Error(UpstreamError::Empty(resp.empty_reason()));
    }
    LineEvent::Skip
}
