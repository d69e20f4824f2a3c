//! Anthropic messages API 客户端
//!
//! 直接走 reqwest（POST /v1/messages），按 ModelTier 选择模型；
//! 强档请求失败时自动降级快档重试一次，两档都失败才报 LlmError。

use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use serde_json::json;

use crate::core::WorkerError;
use crate::llm::{CompletionRequest, LlmClient, ModelTier};
use crate::observability::Metrics;

const DEFAULT_BASE_URL: &str = "https://api.anthropic.com";
const API_VERSION: &str = "2023-06-01";

/// Token 使用统计（累计值）
#[derive(Debug, Default)]
pub struct TokenUsage {
    pub input_tokens: AtomicU64,
    pub output_tokens: AtomicU64,
}

impl TokenUsage {
    pub fn add(&self, input: u64, output: u64) {
        self.input_tokens.fetch_add(input, Ordering::Relaxed);
        self.output_tokens.fetch_add(output, Ordering::Relaxed);
    }

    pub fn get(&self) -> (u64, u64) {
        (
            self.input_tokens.load(Ordering::Relaxed),
            self.output_tokens.load(Ordering::Relaxed),
        )
    }
}

/// Anthropic 客户端：持有 API key、两档模型名与 reqwest Client
pub struct AnthropicClient {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
    fast_model: String,
    strong_model: String,
    pub usage: TokenUsage,
}

impl AnthropicClient {
    pub fn new(
        api_key: impl Into<String>,
        fast_model: impl Into<String>,
        strong_model: impl Into<String>,
        base_url: Option<&str>,
    ) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.unwrap_or(DEFAULT_BASE_URL).trim_end_matches('/').to_string(),
            api_key: api_key.into(),
            fast_model: fast_model.into(),
            strong_model: strong_model.into(),
            usage: TokenUsage::default(),
        }
    }

    /// 从环境变量构造；ANTHROPIC_API_KEY 必须存在
    pub fn from_env(cfg: &crate::config::LlmSection) -> Result<Self, WorkerError> {
        let api_key = std::env::var("ANTHROPIC_API_KEY")
            .map_err(|_| WorkerError::Fatal("ANTHROPIC_API_KEY not set".into()))?;
        Ok(Self::new(
            api_key,
            cfg.fast_model.clone(),
            cfg.strong_model.clone(),
            cfg.base_url.as_deref(),
        ))
    }

    fn model_for(&self, tier: ModelTier) -> &str {
        match tier {
            ModelTier::Strong => &self.strong_model,
            _ => &self.fast_model,
        }
    }

    async fn call_once(&self, model: &str, req: &CompletionRequest) -> Result<String, WorkerError> {
        let mut body = json!({
            "model": model,
            "max_tokens": req.max_tokens,
            "messages": [{"role": "user", "content": req.user}],
        });
        if !req.system.is_empty() {
            body["system"] = json!(req.system);
        }
        if let Some(top_p) = req.top_p {
            body["top_p"] = json!(top_p);
        }

        let resp = self
            .http
            .post(format!("{}/v1/messages", self.base_url))
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", API_VERSION)
            .timeout(std::time::Duration::from_secs(req.timeout_secs))
            .json(&body)
            .send()
            .await
            .map_err(|e| WorkerError::Llm(e.to_string()))?;

        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            return Err(WorkerError::Llm(format!("{}: {}", status, text)));
        }

        let value: serde_json::Value = resp
            .json()
            .await
            .map_err(|e| WorkerError::Llm(e.to_string()))?;

        if let Some(usage) = value.get("usage") {
            self.usage.add(
                usage.get("input_tokens").and_then(|v| v.as_u64()).unwrap_or(0),
                usage.get("output_tokens").and_then(|v| v.as_u64()).unwrap_or(0),
            );
        }

        let content = value
            .get("content")
            .and_then(|c| c.as_array())
            .and_then(|arr| arr.first())
            .and_then(|b| b.get("text"))
            .and_then(|t| t.as_str())
            .unwrap_or_default()
            .to_string();

        Ok(content)
    }
}

#[async_trait]
impl LlmClient for AnthropicClient {
    async fn complete(&self, req: &CompletionRequest) -> Result<String, WorkerError> {
        if req.tier == ModelTier::Skip {
            return Err(WorkerError::Llm("budget exhausted, llm skipped".into()));
        }
        let metrics = Metrics::global();
        let model = self.model_for(req.tier);
        match self.call_once(model, req).await {
            Ok(text) => {
                metrics.record_llm(true);
                Ok(text)
            }
            Err(e) if req.tier == ModelTier::Strong => {
                // 强档失败降级快档重试一次
                tracing::warn!(error = %e, "strong tier failed, falling back to fast tier");
                let result = self.call_once(&self.fast_model, req).await;
                metrics.record_llm(result.is_ok());
                result
            }
            Err(e) => {
                metrics.record_llm(false);
                Err(e)
            }
        }
    }
}
