//! LLM 客户端抽象
//!
//! 所有后端（Anthropic messages / Mock）实现 LlmClient::complete。
//! 本服务不做流式输出（agent card 声明 streaming: false）。

use async_trait::async_trait;

use crate::core::WorkerError;

/// 模型档位：快档（分类、审计、压缩、MoA 采样）与强档（MUTATE、复杂 COMPUTE）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ModelTier {
    Fast,
    Strong,
    /// 预算耗尽：跳过所有后续 LLM 调用
    Skip,
}

/// 一次补全请求；system 与 user 分开传，便于按状态拼接系统上下文
#[derive(Debug, Clone)]
pub struct CompletionRequest {
    pub tier: ModelTier,
    pub system: String,
    pub user: String,
    pub max_tokens: u32,
    /// 采样 top_p；None 用后端默认（MoA 双采样会显式传 0.85 / 0.99）
    pub top_p: Option<f64>,
    /// 单次调用超时（秒）
    pub timeout_secs: u64,
}

impl CompletionRequest {
    pub fn new(tier: ModelTier, system: impl Into<String>, user: impl Into<String>) -> Self {
        Self {
            tier,
            system: system.into(),
            user: user.into(),
            max_tokens: 1024,
            top_p: None,
            timeout_secs: 30,
        }
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    pub fn with_top_p(mut self, top_p: f64) -> Self {
        self.top_p = Some(top_p);
        self
    }

    pub fn with_timeout(mut self, secs: u64) -> Self {
        self.timeout_secs = secs;
        self
    }
}

/// LLM 客户端 trait：非流式补全
///
/// 强档失败时实现方应自行降级到快档重试一次；两档都失败才返回 Err。
#[async_trait]
pub trait LlmClient: Send + Sync {
    async fn complete(&self, req: &CompletionRequest) -> Result<String, WorkerError>;
}
