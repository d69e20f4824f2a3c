//! 应用配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `HORNET__*` 覆盖（双下划线表示嵌套，
//! 如 `HORNET__SERVER__PORT=8080`）。基准测试约定的裸环境变量
//! （ANTHROPIC_API_KEY / GREEN_AGENT_MCP_URL / TOOL_TIMEOUT / TASK_TIMEOUT /
//! RL_CACHE_DIR / FALLBACK_MODEL）单独识别，优先级最高。

use std::path::PathBuf;

use serde::Deserialize;

/// 应用配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub llm: LlmSection,
    #[serde(default)]
    pub tools: ToolsSection,
    #[serde(default)]
    pub worker: WorkerSection,
}

/// [server] 段：监听端口
#[derive(Debug, Clone, Deserialize)]
pub struct ServerSection {
    #[serde(default = "default_port")]
    pub port: u16,
}

fn default_port() -> u16 {
    8000
}

impl Default for ServerSection {
    fn default() -> Self {
        Self { port: default_port() }
    }
}

/// [llm] 段：两档模型与 API 超时
#[derive(Debug, Clone, Deserialize)]
pub struct LlmSection {
    /// 快档模型（分类、审计、压缩、MoA 采样）
    #[serde(default = "default_fast_model")]
    pub fast_model: String,
    /// 强档模型（MUTATE 与含分析关键词的 COMPUTE）
    #[serde(default = "default_strong_model")]
    pub strong_model: String,
    /// 单次 API 请求超时（秒）
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
    pub base_url: Option<String>,
}

fn default_fast_model() -> String {
    "claude-haiku-4-5-20251001".to_string()
}

fn default_strong_model() -> String {
    "claude-sonnet-4-6".to_string()
}

fn default_request_timeout() -> u64 {
    60
}

impl Default for LlmSection {
    fn default() -> Self {
        Self {
            fast_model: default_fast_model(),
            strong_model: default_strong_model(),
            request_timeout_secs: default_request_timeout(),
            base_url: None,
        }
    }
}

/// [tools] 段：默认工具端点与调用超时
#[derive(Debug, Clone, Deserialize)]
pub struct ToolsSection {
    #[serde(default = "default_tools_endpoint")]
    pub default_endpoint: String,
    /// 单次工具调用超时（秒）
    #[serde(default = "default_tool_timeout")]
    pub tool_timeout_secs: u64,
}

fn default_tools_endpoint() -> String {
    "http://localhost:9009".to_string()
}

fn default_tool_timeout() -> u64 {
    10
}

impl Default for ToolsSection {
    fn default() -> Self {
        Self {
            default_endpoint: default_tools_endpoint(),
            tool_timeout_secs: default_tool_timeout(),
        }
    }
}

/// [worker] 段：任务超时与持久化目录
#[derive(Debug, Clone, Deserialize)]
pub struct WorkerSection {
    /// 任务级超时（秒），超时返回部分答案并记 failure
    #[serde(default = "default_task_timeout")]
    pub task_timeout_secs: u64,
    /// JSON 状态文件目录（case_log.json / tool_registry.json 等）
    #[serde(default = "default_cache_dir")]
    pub cache_dir: PathBuf,
}

fn default_task_timeout() -> u64 {
    120
}

fn default_cache_dir() -> PathBuf {
    PathBuf::from("/app")
}

impl Default for WorkerSection {
    fn default() -> Self {
        Self {
            task_timeout_secs: default_task_timeout(),
            cache_dir: default_cache_dir(),
        }
    }
}

/// 从 config 目录加载配置，环境变量 HORNET__* 可覆盖，裸约定变量最后叠加
pub fn load_config(config_path: Option<PathBuf>) -> Result<AppConfig, config::ConfigError> {
    let mut builder = config::Config::builder();

    let default_names = ["config/default", "../config/default", "default"];
    for name in default_names {
        let path = format!("{}.toml", name);
        if std::path::Path::new(&path).exists() {
            builder = builder.add_source(config::File::with_name(name).required(false));
            break;
        }
    }

    if let Some(ref path) = config_path {
        if path.exists() {
            builder = builder.add_source(config::File::from(path.clone()).required(false));
        }
    }

    builder = builder.add_source(
        config::Environment::with_prefix("HORNET")
            .separator("__")
            .try_parsing(true),
    );

    let c = builder.build()?;
    let mut cfg: AppConfig = c.try_deserialize()?;
    apply_bare_env(&mut cfg);
    Ok(cfg)
}

/// 基准测试约定的裸环境变量，覆盖 TOML 与 HORNET__* 来源
fn apply_bare_env(cfg: &mut AppConfig) {
    if let Ok(v) = std::env::var("GREEN_AGENT_MCP_URL") {
        if !v.is_empty() {
            cfg.tools.default_endpoint = v;
        }
    }
    if let Ok(v) = std::env::var("FALLBACK_MODEL") {
        if !v.is_empty() {
            cfg.llm.strong_model = v;
        }
    }
    if let Some(secs) = env_u64("TOOL_TIMEOUT") {
        cfg.tools.tool_timeout_secs = secs;
    }
    if let Some(secs) = env_u64("TASK_TIMEOUT") {
        cfg.worker.task_timeout_secs = secs;
    }
    if let Ok(v) = std::env::var("RL_CACHE_DIR") {
        if !v.is_empty() {
            cfg.worker.cache_dir = PathBuf::from(v);
        }
    }
}

fn env_u64(name: &str) -> Option<u64> {
    std::env::var(name).ok().and_then(|v| v.parse().ok())
}
