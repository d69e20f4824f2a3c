//! 工具服务器 RPC 客户端（出站）
//!
//! 两个调用：discover_tools（按会话取工具 schema 列表）与 call_tool。
//! 带 session_id 只取该任务会话注册的工具，避免模型一次看到全部场景的
//! 一百多个工具。每次调用套工具级超时，超时按工具错误处理。

use std::time::Duration;

use serde_json::{json, Value};

use crate::core::WorkerError;
use crate::observability::Metrics;
use crate::tools::ToolSchema;

/// 工具 RPC 客户端：持有端点与超时
#[derive(Clone)]
pub struct ToolRpcClient {
    http: reqwest::Client,
    endpoint: String,
    timeout: Duration,
}

impl ToolRpcClient {
    pub fn new(endpoint: impl Into<String>, timeout_secs: u64) -> Self {
        Self {
            http: reqwest::Client::new(),
            endpoint: endpoint.into().trim_end_matches('/').to_string(),
            timeout: Duration::from_secs(timeout_secs),
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// GET {endpoint}/mcp/tools[?session_id=] — 模型工具格式的 schema 列表
    pub async fn discover_tools(&self, session_id: &str) -> Result<Vec<ToolSchema>, WorkerError> {
        let mut url = format!("{}/mcp/tools", self.endpoint);
        if !session_id.is_empty() {
            url = format!("{}?session_id={}", url, session_id);
        }
        let resp = self
            .http
            .get(&url)
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|e| map_reqwest_error("discover_tools", e))?;
        if !resp.status().is_success() {
            return Err(WorkerError::ToolCall(format!(
                "discover_tools returned {}",
                resp.status()
            )));
        }
        resp.json::<Vec<ToolSchema>>()
            .await
            .map_err(|e| WorkerError::ToolCall(format!("discover_tools parse: {}", e)))
    }

    /// POST {endpoint}/mcp — 按名调用工具；错误以 Value 里的 error 字段或 Err 返回
    pub async fn call_tool(
        &self,
        tool_name: &str,
        params: &Value,
        session_id: &str,
    ) -> Result<Value, WorkerError> {
        let metrics = Metrics::global();
        let start = std::time::Instant::now();
        let result = self
            .http
            .post(format!("{}/mcp", self.endpoint))
            .timeout(self.timeout)
            .json(&json!({"tool": tool_name, "params": params, "session_id": session_id}))
            .send()
            .await;

        let resp = match result {
            Ok(r) => r,
            Err(e) => {
                let err = map_reqwest_error(tool_name, e);
                let timed_out = matches!(err, WorkerError::ToolTimeout(_));
                metrics.record_tool(false, timed_out);
                audit(tool_name, params, false, start.elapsed());
                return Err(err);
            }
        };

        if !resp.status().is_success() {
            metrics.record_tool(false, false);
            audit(tool_name, params, false, start.elapsed());
            return Err(WorkerError::ToolCall(format!(
                "{} returned {}",
                tool_name,
                resp.status()
            )));
        }

        let value: Value = resp
            .json()
            .await
            .map_err(|e| WorkerError::ToolCall(format!("{} parse: {}", tool_name, e)))?;
        metrics.record_tool(true, false);
        audit(tool_name, params, true, start.elapsed());
        Ok(value)
    }
}

fn map_reqwest_error(tool_name: &str, e: reqwest::Error) -> WorkerError {
    if e.is_timeout() {
        WorkerError::ToolTimeout(tool_name.to_string())
    } else {
        WorkerError::ToolCall(format!("{}: {}", tool_name, e))
    }
}

/// 结构化审计日志：每次外呼一条 JSON
fn audit(tool: &str, params: &Value, ok: bool, duration: Duration) {
    let preview = {
        let s = params.to_string();
        if s.len() > 200 {
            format!("{}...", s.chars().take(200).collect::<String>())
        } else {
            s
        }
    };
    let line = json!({
        "event": "tool_audit",
        "tool": tool,
        "ok": ok,
        "duration_ms": duration.as_millis() as u64,
        "args_preview": preview,
    });
    tracing::info!(audit = %line.to_string(), "tool");
}
