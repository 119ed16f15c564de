use axum::http::HeaderMap;
use sonic_rs::prelude::*;
use std::time::Duration;

/// 日志等级（只控制请求/响应详细日志块，运行日志由 RUST_LOG 控制）：
/// - off：不输出客户端/后端的详细请求响应
/// - low：输出客户端请求/响应（格式化/脱敏）
/// - medium：输出客户端 + 后端请求/响应（格式化/脱敏）
/// - high：在 medium 基础上，后端流式响应逐行原样输出
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Off = 0,
    Low = 1,
    Medium = 2,
    High = 3,
}

impl LogLevel {
    pub fn parse(debug: &str) -> Self {
        match debug.trim().to_lowercase().as_str() {
            "low" | "client" => Self::Low,
            "medium" | "backend" => Self::Medium,
            "high" | "all" | "raw" => Self::High,
            _ => Self::Off,
        }
    }

    pub fn client_enabled(self) -> bool {
        self >= Self::Low
    }

    pub fn backend_enabled(self) -> bool {
        self >= Self::Medium
    }

    pub fn raw_enabled(self) -> bool {
        self >= Self::High
    }
}

pub fn format_duration_ms(d: Duration) -> i64 {
    d.as_millis().min(i64::MAX as u128) as i64
}

pub fn client_request(method: &str, path: &str, client: &str, headers: &HeaderMap, body: &[u8]) {
    tracing::info!(
        "\n===================== 客户端请求 ======================\n[客户端请求] {method} {path} ({client})\n[客户端请求头]\n{}\n{}\n=========================================================",
        format_headers(headers),
        format_body_bytes(body)
    );
}

pub fn client_response(status: u16, duration: Duration, body: Option<&sonic_rs::Value>) {
    tracing::info!(
        "\n===================== 客户端响应 ======================\n[客户端响应] {} {}ms\n{}\n==========================================================",
        status,
        format_duration_ms(duration),
        body.map(format_body_value).unwrap_or_default()
    );
}

pub fn client_stream_response(duration: Duration, bytes_sent: usize, interrupted: bool) {
    tracing::info!(
        "\n=================== 客户端流式响应 =======================\n[客户端流式] 200 {}ms 已发送 {} 字节{}\n==========================================================",
        format_duration_ms(duration),
        bytes_sent,
        if interrupted { "（中途中断）" } else { "" }
    );
}

pub fn backend_request(method: &str, url: &str, headers: &HeaderMap, body: &[u8]) {
    tracing::info!(
        "\n====================== 后端请求 ========================\n[后端请求] {method} {}\n[后端请求头]\n{}\n{}\n==========================================================",
        redact_url(url),
        format_headers(headers),
        format_body_bytes(body)
    );
}

pub fn backend_response(status: u16, duration: Duration, body: &[u8]) {
    tracing::info!(
        "\n====================== 后端响应 ========================\n[后端响应] {} {}ms\n{}\n==========================================================",
        status,
        format_duration_ms(duration),
        format_body_bytes(body)
    );
}

pub fn backend_stream_line_raw(line: &[u8]) {
    // 不做任何 JSON 解析/格式化；尽量原样输出（仅在非 UTF-8 时降级为 lossy）。
    tracing::info!("{}", String::from_utf8_lossy(line));
}

const REDACTED_HEADERS: [&str; 5] = [
    "authorization",
    "proxy-authorization",
    "x-goog-api-key",
    "x-api-key",
    "cookie",
];

fn format_headers(headers: &HeaderMap) -> String {
    let mut obj = sonic_rs::Object::new();

    for (name, value) in headers.iter() {
        let key = name.as_str();
        let redacted = REDACTED_HEADERS.contains(&key.to_lowercase().as_str());

        let v = if redacted {
            sonic_rs::Value::from("***")
        } else {
            match value.to_str() {
                Ok(s) => sonic_rs::Value::from(s),
                Err(_) => sonic_rs::Value::from("<binary>"),
            }
        };

        // HeaderMap 可能存在同名多值，统一用数组输出，避免信息丢失。
        if let Some(existing) = obj.get(&key).and_then(|v| v.as_array()) {
            let mut arr = existing.to_vec();
            arr.push(v);
            obj.insert(key, arr);
        } else {
            obj.insert(key, vec![v]);
        }
    }

    format_body_value(&obj.into_value())
}

fn format_body_value(v: &sonic_rs::Value) -> String {
    let sanitized = sanitize_json_for_log(v);
    match sonic_rs::to_string_pretty(&sanitized) {
        Ok(s) => s,
        Err(_) => sanitized.to_string(),
    }
}

fn format_body_bytes(bytes: &[u8]) -> String {
    if bytes.is_empty() {
        return String::new();
    }

    // 极端大包：避免为了日志反序列化/格式化而产生巨额内存与 CPU 开销。
    const MAX_PARSE_BYTES: usize = 2 * 1024 * 1024;
    if bytes.len() > MAX_PARSE_BYTES {
        return format!("(body too large: {} bytes)", bytes.len());
    }

    match sonic_rs::from_slice::<sonic_rs::Value>(bytes) {
        Ok(v) => format_body_value(&v),
        Err(_) => truncate_text_for_log(&String::from_utf8_lossy(bytes)),
    }
}

/// 去掉 URL 中的 key= 查询参数值。
pub fn redact_url(url: &str) -> String {
    let Some((base, query)) = url.split_once('?') else {
        return url.to_string();
    };
    let query: Vec<String> = query
        .split('&')
        .map(|pair| match pair.split_once('=') {
            Some((k, _)) if k.eq_ignore_ascii_case("key") => format!("{k}=***"),
            _ => pair.to_string(),
        })
        .collect();
    format!("{base}?{}", query.join("&"))
}

fn truncate_text_for_log(s: &str) -> String {
    const MAX_CHARS: usize = 4 * 1024;
    if s.chars().count() <= MAX_CHARS {
        return s.to_string();
    }
    let mut out: String = s.chars().take(MAX_CHARS).collect();
    out.push_str("...[TRUNCATED]");
    out
}

fn sanitize_json_for_log(v: &sonic_rs::Value) -> sonic_rs::Value {
    // 递归走 Value，避免先反序列化到强类型结构体导致字段丢失。
    if let Some(obj) = v.as_object() {
        let mut out = sonic_rs::Object::new();
        for (key, child) in obj.iter() {
            let sanitized = match key {
                "token" | "code" if child.is_str() => sonic_rs::Value::from("***"),
                _ => sanitize_json_for_log(child),
            };
            out.insert(key, sanitized);
        }
        return out.into_value();
    }

    if let Some(arr) = v.as_array() {
        return sonic_rs::Value::from(arr.iter().map(sanitize_json_for_log).collect::<Vec<_>>());
    }

    if let Some(s) = v.as_str() {
        return sonic_rs::Value::from(truncate_text_for_log(s).as_str());
    }

    v.to_owned()
}
