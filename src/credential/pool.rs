use crate::credential::types::Credential;
use crate::error::AppError;
use tokio::sync::RwLock;

/// 凭据池。
///
/// 凭据列表在构建后只读；唯一的可变状态是轮询游标，由 RwLock 串行化，
/// 只有成功完成的分发才会推进它。
#[derive(Debug)]
pub struct CredentialPool {
    credentials: Vec<Credential>,
    state: RwLock<State>,
}

#[derive(Debug, Default)]
struct State {
    current_index: usize,
}

impl CredentialPool {
    /// 构建凭据池；空列表视为致命的配置错误，服务应拒绝启动。
    pub fn new<I, S>(secrets: I) -> Result<Self, AppError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut credentials: Vec<Credential> = Vec::new();
        for s in secrets {
            let s = s.as_ref().trim();
            if s.is_empty() || credentials.iter().any(|c| c.secret() == s) {
                continue;
            }
            credentials.push(Credential::new(s));
        }

        if credentials.is_empty() {
            return Err(AppError::config(
                "未配置任何 Gemini API Key（GEMINI_API_KEY / GEMINI_API_KEY_<n> / GEMINI_API_KEYS）",
            ));
        }

        Ok(Self {
            credentials,
            state: RwLock::new(State::default()),
        })
    }

    pub async fn cursor(&self) -> usize {
        self.state.read().await.current_index
    }

    /// 从 start 开始按轮询顺序枚举全部凭据，每个恰好一次，越界后取模回绕。
    pub fn rotation(&self, start: usize) -> Vec<(usize, Credential)> {
        let len = self.credentials.len();
        (0..len)
            .map(|offset| {
                let idx = (start + offset) % len;
                (idx, self.credentials[idx].clone())
            })
            .collect()
    }

    /// 以当前游标为起点的一次快照。
    pub async fn snapshot(&self) -> Vec<(usize, Credential)> {
        let start = self.cursor().await;
        self.rotation(start)
    }

    /// 成功分发后调用：游标移动到 index 的下一个位置。
    pub async fn advance(&self, index: usize) {
        let mut state = self.state.write().await;
        state.current_index = (index + 1) % self.credentials.len();
    }
}
