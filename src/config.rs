use anyhow::Context;
use figment::Figment;
use figment::providers::{Env, Serialized};
use serde::Deserialize;
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};

const DEFAULT_HOST: &str = "0.0.0.0";
const DEFAULT_PORT: u16 = 8045;
const DEFAULT_TIMEOUT_MS: u64 = 180_000;
const DEFAULT_API_BASE: &str = "https://generativelanguage.googleapis.com";
const DEFAULT_MODEL: &str = "gemini-2.5-flash";
const DEFAULT_PRIVILEGED_MODELS: &str = "pro";
const DEFAULT_DAILY_QUOTA: u64 = 50;

/// 枚举式凭据变量前缀：GEMINI_API_KEY_1、GEMINI_API_KEY_2 ...
const CREDENTIAL_ENV_PREFIX: &str = "GEMINI_API_KEY_";

#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,

    pub timeout_ms: u64,
    pub proxy: String,
    pub debug: String,

    pub api_base: String,
    pub default_model: String,
    /// 按加载顺序排列、已去重的凭据列表（非空校验在 CredentialPool 构建时完成）。
    pub credentials: Vec<String>,

    pub quota_store_url: String,
    pub quota_store_token: String,
    pub model_daily_quotas: HashMap<String, u64>,
    pub default_daily_quota: u64,

    /// 特权模型的口令（同时也是 /authenticate 下发的通行证）。
    pub auth_token: String,
    pub unlock_code: String,
    pub privileged_models: Vec<String>,

    /// 部署在可信反向代理之后时才采信 X-Forwarded-For / X-Real-IP。
    pub trust_proxy_headers: bool,
}

#[derive(Debug, Default, Deserialize)]
struct RawEnv {
    #[serde(alias = "HOST")]
    host: Option<String>,
    #[serde(alias = "PORT")]
    port: Option<u16>,

    #[serde(alias = "TIMEOUT")]
    timeout: Option<u64>,
    #[serde(alias = "PROXY")]
    proxy: Option<String>,
    #[serde(alias = "DEBUG")]
    debug: Option<String>,

    #[serde(alias = "GEMINI_API_BASE")]
    gemini_api_base: Option<String>,
    #[serde(alias = "DEFAULT_MODEL")]
    default_model: Option<String>,
    #[serde(alias = "GEMINI_API_KEY")]
    gemini_api_key: Option<String>,
    #[serde(alias = "GEMINI_API_KEYS")]
    gemini_api_keys: Option<String>,

    #[serde(alias = "QUOTA_STORE_URL")]
    quota_store_url: Option<String>,
    #[serde(alias = "QUOTA_STORE_TOKEN")]
    quota_store_token: Option<String>,
    #[serde(alias = "MODEL_DAILY_QUOTAS")]
    model_daily_quotas: Option<String>,
    #[serde(alias = "DEFAULT_DAILY_QUOTA")]
    default_daily_quota: Option<u64>,

    #[serde(alias = "AUTH_TOKEN")]
    auth_token: Option<String>,
    #[serde(alias = "UNLOCK_CODE")]
    unlock_code: Option<String>,
    #[serde(alias = "PRIVILEGED_MODELS")]
    privileged_models: Option<String>,
    #[serde(alias = "TRUST_PROXY_HEADERS")]
    trust_proxy_headers: Option<bool>,
}

impl Config {
    pub fn load() -> anyhow::Result<Self> {
        load_dotenv();

        let vars: BTreeMap<String, String> = Env::raw()
            .iter()
            .map(|(k, v)| (k.to_string(), v))
            .collect();

        let raw = extract_raw(&vars).context("环境变量配置无效")?;

        let enumerated: Vec<(String, String)> = vars
            .iter()
            .map(|(k, v)| (k.to_ascii_uppercase(), v.clone()))
            .filter(|(k, _)| k.starts_with(CREDENTIAL_ENV_PREFIX))
            .collect();

        let mut cfg = Self::from_raw(raw, &enumerated);

        // 命令行覆盖：-debug <level>
        let mut args = std::env::args().skip(1);
        while let Some(arg) = args.next() {
            if arg == "-debug"
                && let Some(v) = args.next()
            {
                cfg.debug = v;
            }
        }

        Ok(cfg)
    }

    fn from_raw(raw: RawEnv, enumerated: &[(String, String)]) -> Self {
        let credentials = collect_credentials(
            raw.gemini_api_key.as_deref(),
            enumerated,
            raw.gemini_api_keys.as_deref(),
        );

        Self {
            host: raw.host.unwrap_or_else(|| DEFAULT_HOST.to_string()),
            port: raw.port.unwrap_or(DEFAULT_PORT),
            timeout_ms: raw.timeout.unwrap_or(DEFAULT_TIMEOUT_MS),
            proxy: raw.proxy.unwrap_or_default(),
            debug: raw.debug.unwrap_or_else(|| "off".to_string()),
            api_base: non_blank(raw.gemini_api_base)
                .map(|s| s.trim_end_matches('/').to_string())
                .unwrap_or_else(|| DEFAULT_API_BASE.to_string()),
            default_model: non_blank(raw.default_model)
                .unwrap_or_else(|| DEFAULT_MODEL.to_string()),
            credentials,
            quota_store_url: raw.quota_store_url.unwrap_or_default().trim().to_string(),
            quota_store_token: raw.quota_store_token.unwrap_or_default().trim().to_string(),
            model_daily_quotas: parse_quota_table(raw.model_daily_quotas.as_deref()),
            default_daily_quota: raw.default_daily_quota.unwrap_or(DEFAULT_DAILY_QUOTA),
            auth_token: raw.auth_token.unwrap_or_default(),
            unlock_code: raw.unlock_code.unwrap_or_default(),
            privileged_models: parse_list(
                raw.privileged_models
                    .as_deref()
                    .unwrap_or(DEFAULT_PRIVILEGED_MODELS),
            ),
            trust_proxy_headers: raw.trust_proxy_headers.unwrap_or(false),
        }
    }

    /// 不读取进程环境的默认配置。
    #[cfg(test)]
    pub(crate) fn load_for_tests() -> Self {
        Self::from_raw(RawEnv::default(), &[])
    }

    pub fn log_level(&self) -> crate::logging::LogLevel {
        crate::logging::LogLevel::parse(&self.debug)
    }
}

/// 环境变量原文作为字符串交给 figment，只有数值/布尔字段才按 lossy 规则解析，
/// 因此 `UNLOCK_CODE=0123` 这类纯数字口令保持原样。
fn extract_raw(vars: &BTreeMap<String, String>) -> Result<RawEnv, figment::Error> {
    Figment::from(Serialized::defaults(vars)).extract_lossy::<RawEnv>()
}

fn non_blank(v: Option<String>) -> Option<String> {
    v.map(|s| s.trim().to_string()).filter(|s| !s.is_empty())
}

/// 凭据加载顺序：GEMINI_API_KEY → GEMINI_API_KEY_<n>（按 n 升序）→ GEMINI_API_KEYS（逗号分隔）。
/// 重复项只保留第一次出现的位置。
fn collect_credentials(
    single: Option<&str>,
    enumerated: &[(String, String)],
    list: Option<&str>,
) -> Vec<String> {
    let mut numbered: Vec<(u32, &str)> = enumerated
        .iter()
        .filter_map(|(k, v)| {
            let n = k.strip_prefix(CREDENTIAL_ENV_PREFIX)?.parse::<u32>().ok()?;
            Some((n, v.as_str()))
        })
        .collect();
    numbered.sort_by_key(|(n, _)| *n);

    let candidates = single
        .into_iter()
        .chain(numbered.into_iter().map(|(_, v)| v))
        .chain(list.into_iter().flat_map(|l| l.split(',')));

    let mut out: Vec<String> = Vec::new();
    for c in candidates {
        let c = c.trim();
        if c.is_empty() || out.iter().any(|e| e == c) {
            continue;
        }
        out.push(c.to_string());
    }
    out
}

fn parse_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(|p| p.trim().to_string())
        .filter(|p| !p.is_empty())
        .collect()
}

/// 解析 "model=limit,model=limit"；格式不对的条目直接忽略。
fn parse_quota_table(value: Option<&str>) -> HashMap<String, u64> {
    let mut out = HashMap::new();
    let Some(value) = value else {
        return out;
    };
    for part in value.split(',') {
        let Some((model, limit)) = part.split_once('=') else {
            continue;
        };
        let model = model.trim();
        if model.is_empty() {
            continue;
        }
        if let Ok(n) = limit.trim().parse::<u64>() {
            out.insert(model.to_string(), n);
        }
    }
    out
}

fn load_dotenv() {
    let Some(dotenv_path) = find_dotenv_path() else {
        return;
    };

    let Ok(file) = std::fs::File::open(&dotenv_path) else {
        return;
    };

    let reader = std::io::BufReader::new(file);
    for line in std::io::BufRead::lines(reader).map_while(Result::ok) {
        let Some((key, value)) = parse_dotenv_line(&line) else {
            continue;
        };
        // 已存在的进程环境变量优先于 .env。
        if std::env::var_os(&key).is_some() {
            continue;
        }
        // Rust 2024：修改进程环境变量在并发场景下可能触发 UB，因此 API 为 unsafe。
        // 这里在启动阶段、运行时尚未派生任何任务前加载 .env，符合使用前提。
        unsafe {
            std::env::set_var(key, value);
        }
    }
}

fn find_dotenv_path() -> Option<PathBuf> {
    let cwd = std::env::current_dir().ok()?;
    let mut dir: &Path = cwd.as_path();

    loop {
        let candidate = dir.join(".env");
        if candidate.is_file() {
            return Some(candidate);
        }

        // 避免跨越仓库根目录：发现 Cargo.toml 或 .git 即停止向上寻找。
        if dir.join("Cargo.toml").is_file() || dir.join(".git").is_dir() {
            return None;
        }

        let parent = dir.parent()?;
        if parent == dir {
            return None;
        }
        dir = parent;
    }
}

fn parse_dotenv_line(line: &str) -> Option<(String, String)> {
    let mut line = line.trim();
    if line.is_empty() || line.starts_with('#') {
        return None;
    }

    if let Some(rest) = line.strip_prefix("export ") {
        line = rest.trim_start();
    }

    let (key, raw) = line.split_once('=')?;
    let key = key.trim();
    if key.is_empty() {
        return None;
    }

    let raw = raw.trim();
    if raw.is_empty() {
        return Some((key.to_string(), String::new()));
    }

    let bytes = raw.as_bytes();
    if bytes.len() >= 2 {
        let first = bytes[0];
        let last = bytes[bytes.len() - 1];
        if (first == b'"' && last == b'"') || (first == b'\'' && last == b'\'') {
            return Some((key.to_string(), raw[1..raw.len() - 1].to_string()));
        }
    }

    Some((key.to_string(), strip_inline_comment(raw).trim().to_string()))
}

fn strip_inline_comment(value: &str) -> &str {
    let bytes = value.as_bytes();
    for i in 0..bytes.len() {
        if bytes[i] != b'#' {
            continue;
        }
        if i == 0 || bytes[i - 1] == b' ' || bytes[i - 1] == b'\t' {
            return value[..i].trim_end();
        }
    }
    value
}
