use crate::error::AppError;
use crate::provider::{Generation, Turn};
use serde::Deserialize;

const DEFAULT_TEMPERATURE: f32 = 1.0;
const MAX_TEMPERATURE: f32 = 2.0;

/// 客户端请求体的原始形态；未知字段直接拒绝。
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct GenerateRequest {
    #[serde(default)]
    prompt: Option<String>,
    #[serde(default)]
    history: Vec<Turn>,
    #[serde(default)]
    model: Option<String>,
    #[serde(default)]
    temperature: Option<f32>,
    #[serde(default)]
    stream: Option<bool>,
    #[serde(default)]
    token: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseMode {
    /// 纯文本分块转发。
    Streaming,
    /// 聚合成一个 `{ "text": ... }`。
    Buffered,
}

/// 校验通过的请求。构建后不再修改。
#[derive(Debug, Clone)]
pub struct ChatRequest {
    pub prompt: String,
    pub history: Vec<Turn>,
    pub model: String,
    pub temperature: f32,
    pub mode: ResponseMode,
    pub token: Option<String>,
}

impl ChatRequest {
    pub fn parse(body: &[u8], default_model: &str) -> Result<Self, AppError> {
        let raw: GenerateRequest = sonic_rs::from_slice(body)
            .map_err(|e| AppError::bad_request(format!("invalid request body: {e}")))?;

        let prompt = raw
            .prompt
            .filter(|p| !p.trim().is_empty())
            .ok_or_else(|| AppError::bad_request("prompt is required"))?;

        let temperature = raw.temperature.unwrap_or(DEFAULT_TEMPERATURE);
        if !temperature.is_finite() || !(0.0..=MAX_TEMPERATURE).contains(&temperature) {
            return Err(AppError::bad_request(format!(
                "temperature must be between 0 and {MAX_TEMPERATURE}"
            )));
        }

        let model = raw
            .model
            .map(|m| m.trim().to_string())
            .filter(|m| !m.is_empty())
            .unwrap_or_else(|| default_model.to_string());

        let mode = if raw.stream.unwrap_or(true) {
            ResponseMode::Streaming
        } else {
            ResponseMode::Buffered
        };

        Ok(Self {
            prompt,
            history: raw.history,
            model,
            temperature,
            mode,
            token: raw.token.filter(|t| !t.is_empty()),
        })
    }

    pub fn generation(&self) -> Generation<'_> {
        Generation {
            prompt: &self.prompt,
            history: &self.history,
            model: &self.model,
            temperature: self.temperature,
        }
    }
}
