//! 凭据池：启动时一次性加载的 API Key 列表，以及跨请求共享的轮询游标。

pub mod pool;
pub mod types;

pub use pool::CredentialPool;
pub use types::Credential;
