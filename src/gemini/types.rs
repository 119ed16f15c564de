use crate::provider::{Generation, Role};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Request {
    pub contents: Vec<Content>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub generation_config: Option<GenerationConfig>,
}

impl Request {
    /// 历史轮次在前，本次 prompt 作为最后一个 user 轮次。
    pub fn from_generation(g: &Generation<'_>) -> Self {
        let mut contents: Vec<Content> = g
            .history
            .iter()
            .map(|t| Content::text(role_name(t.role), &t.text))
            .collect();
        contents.push(Content::text("user", g.prompt));

        Self {
            contents,
            generation_config: Some(GenerationConfig {
                temperature: Some(g.temperature),
            }),
        }
    }
}

fn role_name(role: Role) -> &'static str {
    match role {
        Role::User => "user",
        Role::Model => "model",
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Content {
    #[serde(default)]
    pub role: String,
    #[serde(default)]
    pub parts: Vec<Part>,
}

impl Content {
    fn text(role: &str, text: &str) -> Self {
        Self {
            role: role.to_string(),
            parts: vec![Part {
                text: text.to_string(),
                thought: false,
            }],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct Part {
    #[serde(skip_serializing_if = "String::is_empty", default)]
    pub text: String,
    #[serde(skip_serializing_if = "is_false", default)]
    pub thought: bool,
}

fn is_false(v: &bool) -> bool {
    !*v
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerationConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct Response {
    #[serde(default)]
    pub candidates: Vec<Candidate>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub prompt_feedback: Option<PromptFeedback>,
}

impl Response {
    /// 首个候选的可见文本（跳过 thought 部分）。
    pub fn text(&self) -> String {
        let Some(cand) = self.candidates.first() else {
            return String::new();
        };
        let mut out = String::new();
        for p in &cand.content.parts {
            if p.thought {
                continue;
            }
            out.push_str(&p.text);
        }
        out
    }

    /// 没有文本时用于错误信息的原因描述。
    pub fn empty_reason(&self) -> String {
        if let Some(reason) = self
            .prompt_feedback
            .as_ref()
            .map(|f| f.block_reason.as_str())
            .filter(|r| !r.is_empty())
        {
            return format!("prompt blocked ({reason})");
        }
        match self.candidates.first() {
            Some(c) if !c.finish_reason.is_empty() => {
                format!("finish reason {}", c.finish_reason)
            }
            Some(_) => "empty candidate".to_string(),
            None => "no candidates".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Candidate {
    #[serde(default = "empty_content")]
    pub content: Content,
    #[serde(skip_serializing_if = "String::is_empty", default)]
    pub finish_reason: String,
}

fn empty_content() -> Content {
    Content {
        role: String::new(),
        parts: Vec::new(),
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct PromptFeedback {
    #[serde(default)]
    pub block_reason: String,
}
