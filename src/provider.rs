//! 上游文本生成能力的抽象。分发器只依赖这里的 trait，具体实现见 `gemini`。

use crate::credential::Credential;
use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// 对话历史中的角色；`assistant` 作为 `model` 的别名接受。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    #[serde(alias = "assistant")]
    Model,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Turn {
    pub role: Role,
    pub text: String,
}

/// 一次生成调用的参数视图。
#[derive(Debug, Clone, Copy)]
pub struct Generation<'a> {
    pub prompt: &'a str,
    pub history: &'a [Turn],
    pub model: &'a str,
    pub temperature: f32,
}

/// 单个凭据上的上游失败。分发器据此切换到下一个凭据。
#[derive(Debug, Error)]
pub enum UpstreamError {
    #[error("upstream {status}: {message}")]
    Http { status: u16, message: String },

    #[error("upstream request failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("upstream response malformed: {0}")]
    Decode(String),

    #[error("upstream returned no text: {0}")]
    Empty(String),
}

impl UpstreamError {
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Http { status, .. } => Some(*status),
            _ => None,
        }
    }
}

/// 有限、不可重启的文本块序列；任意一次取值都可能失败。
/// 丢弃该 stream 即取消对应的上游请求。
pub type TextStream = BoxStream<'static, Result<String, UpstreamError>>;

#[async_trait]
pub trait Provider: Send + Sync {
    async fn complete(
        &self,
        credential: &Credential,
        generation: Generation<'_>,
    ) -> Result<String, UpstreamError>;

    async fn complete_streaming(
        &self,
        credential: &Credential,
        generation: Generation<'_>,
    ) -> Result<TextStream, UpstreamError>;
}

#[cfg(test)]
pub(crate) mod mock {
    //! 按凭据编排行为的测试用 Provider，并记录每次调用使用的凭据。

    use super::*;
    use futures::StreamExt;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    #[derive(Debug, Clone)]
    pub enum Script {
        /// 调用阶段直接失败。
        Fail(String),
        /// 依次产出这些文本块后正常结束。
        Chunks(Vec<String>),
        /// 产出这些文本块后失败。
        ChunksThenFail(Vec<String>, String),
        /// 产出这些文本块后永远挂起（用于验证取消）。
        ChunksThenHang(Vec<String>),
    }

    #[derive(Default)]
    pub struct ScriptedProvider {
        scripts: HashMap<String, Script>,
        calls: Mutex<Vec<String>>,
        /// 挂起中的上游 stream 被丢弃时置位。
        pub dropped: Arc<AtomicBool>,
    }

    struct DropFlag(Arc<AtomicBool>);

    impl Drop for DropFlag {
        fn drop(&mut self) {
            self.0.store(true, Ordering::SeqCst);
        }
    }

    impl ScriptedProvider {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn with(mut self, secret: &str, script: Script) -> Self {
            self.scripts.insert(secret.to_string(), script);
            self
        }

        pub fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }

        fn script_for(&self, credential: &Credential) -> Script {
            self.calls
                .lock()
                .unwrap()
                .push(credential.secret().to_string());
            self.scripts
                .get(credential.secret())
                .cloned()
                .unwrap_or_else(|| Script::Fail("unscripted credential".to_string()))
        }
    }

    fn fail(msg: String) -> UpstreamError {
        UpstreamError::Http {
            status: 503,
            message: msg,
        }
    }

    #[async_trait]
    impl Provider for ScriptedProvider {
        async fn complete(
            &self,
            credential: &Credential,
            _generation: Generation<'_>,
        ) -> Result<String, UpstreamError> {
            match self.script_for(credential) {
                Script::Fail(msg) | Script::ChunksThenFail(_, msg) => Err(fail(msg)),
                Script::Chunks(chunks) | Script::ChunksThenHang(chunks) => Ok(chunks.concat()),
            }
        }

        async fn complete_streaming(
            &self,
            credential: &Credential,
            _generation: Generation<'_>,
        ) -> Result<TextStream, UpstreamError> {
            match self.script_for(credential) {
                Script::Fail(msg) => Err(fail(msg)),
                Script::Chunks(chunks) => Ok(futures::stream::iter(
                    chunks.into_iter().map(Ok::<String, UpstreamError>),
                )
                .boxed()),
                Script::ChunksThenFail(chunks, msg) => Ok(futures::stream::iter(
                    chunks
                        .into_iter()
                        .map(Ok::<String, UpstreamError>)
                        .chain(std::iter::once(Err(fail(msg)))),
                )
                .boxed()),
                Script::ChunksThenHang(chunks) => {
                    let flag = DropFlag(self.dropped.clone());
                    let s = async_stream::stream! {
                        let _flag = flag;
                        for c in chunks {
                            yield Ok::<String, UpstreamError>(c);
                        }
                        loop {
                            tokio::time::sleep(Duration::from_secs(3600)).await;
                        }
                    };
                    Ok(s.boxed())
                }
            }
        }
    }
}
