//! Gemini 公共 REST API（generativelanguage.googleapis.com）的 Provider 实现。

pub mod client;
pub mod stream;
pub mod types;

pub use client::GeminiClient;
