//! 工具失败恢复：错误/空结果时的多级补救
//!
//! 策略顺序：动态同义工具（同动词前缀近名词 → 全名相似 → Levenshtein 兜底）
//! → 简化参数重试 → 快档 LLM 推荐替代工具（4s）→ 优雅降级。
//! 恢复永不抛错：降级结果也是一个带 error 字段的可用观察。

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::llm::{CompletionRequest, LlmClient, ModelTier};
use crate::tools::adapter::{lcs_ratio, levenshtein_ratio};
use crate::tools::{is_error_result, ToolInvoker, ToolSchema};

const LLM_HINT_TIMEOUT_SECS: u64 = 4;
const MAX_SYNONYM_CANDIDATES: usize = 4;

/// 结果是否空得可疑（错误、空集合、空对象）
pub fn is_empty_result(result: &Value) -> bool {
    if result.is_null() {
        return true;
    }
    if is_error_result(result) {
        return true;
    }
    if let Some(obj) = result.as_object() {
        if obj.is_empty() {
            return true;
        }
        let has_total = ["total", "count", "total_count"]
            .iter()
            .any(|k| obj.get(*k).and_then(|v| v.as_u64()).unwrap_or(0) > 0);
        if !has_total {
            for key in ["data", "items", "records", "rows", "list", "results"] {
                if matches!(obj.get(key), Some(Value::Array(a)) if a.is_empty()) {
                    return true;
                }
            }
        }
    }
    if matches!(result, Value::Array(a) if a.is_empty()) {
        return true;
    }
    false
}

/// 同义工具候选：同动词前缀近名词 → 全名相似 → Levenshtein 兜底
fn synonym_candidates(tool_name: &str, available: &[String]) -> Vec<String> {
    let others: Vec<&String> = available.iter().filter(|n| *n != tool_name).collect();
    if others.is_empty() {
        return Vec::new();
    }
    let mut candidates: Vec<String> = Vec::new();

    // Tier 1: 同动词前缀，名词接近
    if let Some((verb, noun)) = tool_name.split_once('_') {
        let prefix = format!("{}_", verb);
        let mut same_verb: Vec<(f64, &String)> = others
            .iter()
            .filter(|n| n.starts_with(&prefix))
            .map(|n| {
                let other_noun = n.split_once('_').map(|(_, rest)| rest).unwrap_or(n);
                (lcs_ratio(noun, other_noun), *n)
            })
            .filter(|(ratio, _)| *ratio >= 0.5)
            .collect();
        same_verb.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap());
        candidates.extend(same_verb.into_iter().map(|(_, n)| n.clone()));
    }

    // Tier 2: 全名相似
    let mut close: Vec<(f64, &String)> = others
        .iter()
        .map(|n| (lcs_ratio(tool_name, n), *n))
        .filter(|(ratio, _)| *ratio >= 0.55)
        .collect();
    close.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap());
    for (_, n) in close {
        if !candidates.contains(n) {
            candidates.push(n.clone());
        }
    }

    // Tier 3: Levenshtein 兜底
    if candidates.is_empty() {
        let mut scored: Vec<(f64, &String)> = others
            .iter()
            .map(|n| (levenshtein_ratio(tool_name, n), *n))
            .filter(|(ratio, _)| *ratio > 0.5)
            .collect();
        scored.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap());
        candidates.extend(scored.into_iter().take(3).map(|(_, n)| n.clone()));
    }

    candidates.truncate(MAX_SYNONYM_CANDIDATES);
    candidates
}

/// 简化参数：只留标识字段，去掉过滤类参数
fn simplified_params(params: &Value) -> Option<Value> {
    let obj = params.as_object()?;
    let essential = ["id", "name", "email", "organization_id", "session_id"];
    let simplified: serde_json::Map<String, Value> = obj
        .iter()
        .filter(|(k, _)| {
            essential.contains(&k.as_str())
                || (k.ends_with("_id") && !k.starts_with("filter"))
        })
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();
    if simplified.len() == obj.len() || simplified.is_empty() {
        return None;
    }
    Some(Value::Object(simplified))
}

/// 恢复层：包装内层调用器
pub struct RecoveryAgent {
    inner: Arc<dyn ToolInvoker>,
    llm: Arc<dyn LlmClient>,
    available_tools: Vec<String>,
}

impl RecoveryAgent {
    pub fn new(inner: Arc<dyn ToolInvoker>, llm: Arc<dyn LlmClient>, tools: &[ToolSchema]) -> Self {
        Self {
            inner,
            llm,
            available_tools: tools.iter().map(|t| t.name.clone()).collect(),
        }
    }

    async fn ask_llm_alternative(&self, tool_name: &str, error_msg: &str) -> Option<String> {
        if self.available_tools.is_empty() {
            return None;
        }
        let error_head: String = error_msg.chars().take(100).collect();
        let listed: Vec<&String> = self.available_tools.iter().take(30).collect();
        let req = CompletionRequest::new(
            ModelTier::Fast,
            "",
            format!(
                "Tool '{}' failed: {}\nAvailable tools: {:?}\n\
                 Reply with just the best alternative tool name to try, or 'none'.",
                tool_name, error_head, listed
            ),
        )
        .with_max_tokens(80)
        .with_timeout(LLM_HINT_TIMEOUT_SECS);

        let result = tokio::time::timeout(
            std::time::Duration::from_secs(LLM_HINT_TIMEOUT_SECS),
            self.llm.complete(&req),
        )
        .await;
        let Ok(Ok(text)) = result else {
            return None;
        };
        let suggestion = text.trim().trim_matches(|c| c == '"' || c == '\'').to_string();
        (suggestion != "none" && self.available_tools.contains(&suggestion)).then_some(suggestion)
    }

    async fn recover(&self, tool_name: &str, params: &Value, failed: Value) -> Value {
        // 策略 1：同义工具
        for candidate in synonym_candidates(tool_name, &self.available_tools) {
            let result = self.inner.invoke(&candidate, params.clone()).await;
            if !is_empty_result(&result) {
                tracing::debug!(from = tool_name, to = %candidate, "recovered via synonym tool");
                return result;
            }
        }

        // 策略 2：简化参数
        if let Some(simplified) = simplified_params(params) {
            let result = self.inner.invoke(tool_name, simplified).await;
            if !is_empty_result(&result) {
                tracing::debug!(tool = tool_name, "recovered with simplified params");
                return result;
            }
        }

        // 策略 3：快档 LLM 推荐
        let error_msg = failed
            .get("error")
            .map(|e| e.to_string())
            .unwrap_or_default();
        if let Some(alt) = self.ask_llm_alternative(tool_name, &error_msg).await {
            let result = self.inner.invoke(&alt, params.clone()).await;
            if !is_empty_result(&result) {
                tracing::debug!(from = tool_name, to = %alt, "recovered via llm suggestion");
                return result;
            }
        }

        // 策略 4：优雅降级
        json!({
            "error": if error_msg.is_empty() { "empty result".to_string() } else { error_msg },
            "tool": tool_name,
            "recovered": false,
            "note": "tool unavailable after recovery attempts, proceeding with available data",
        })
    }
}

#[async_trait]
impl ToolInvoker for RecoveryAgent {
    async fn invoke(&self, tool_name: &str, params: Value) -> Value {
        let result = self.inner.invoke(tool_name, params.clone()).await;
        if !is_empty_result(&result) {
            return result;
        }
        self.recover(tool_name, &params, result).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::MockLlm;
    use std::sync::Mutex;

    struct ScriptedInvoker {
        fail_tools: Vec<String>,
        calls: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl ToolInvoker for ScriptedInvoker {
        async fn invoke(&self, tool_name: &str, _params: Value) -> Value {
            self.calls.lock().unwrap().push(tool_name.to_string());
            if self.fail_tools.iter().any(|t| t == tool_name) {
                json!({"error": "not found"})
            } else {
                json!({"data": [{"id": 1}]})
            }
        }
    }

    fn tools(names: &[&str]) -> Vec<ToolSchema> {
        names.iter().map(|n| ToolSchema::new(*n, "")).collect()
    }

    #[test]
    fn test_empty_result_detection() {
        assert!(is_empty_result(&json!({"error": "x"})));
        assert!(is_empty_result(&json!({})));
        assert!(is_empty_result(&json!({"data": []})));
        assert!(is_empty_result(&json!([])));
        assert!(!is_empty_result(&json!({"data": [], "total": 5})));
        assert!(!is_empty_result(&json!({"id": 1})));
    }

    #[test]
    fn test_synonym_same_verb_prefix() {
        let available: Vec<String> = ["get_employees", "get_invoice", "list_payments"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        let candidates = synonym_candidates("get_employee", &available);
        assert!(!candidates.is_empty());
        // 同动词前缀里名词最接近的排最前（单复数漂移）
        assert_eq!(candidates[0], "get_employees");
    }

    #[tokio::test]
    async fn test_recovery_via_synonym() {
        let inner = Arc::new(ScriptedInvoker {
            fail_tools: vec!["get_employee".into()],
            calls: Mutex::new(Vec::new()),
        });
        let llm = Arc::new(MockLlm::new());
        let agent = RecoveryAgent::new(
            Arc::clone(&inner) as Arc<dyn ToolInvoker>,
            llm,
            &tools(&["get_employee", "get_employees"]),
        );
        let result = agent.invoke("get_employee", json!({"id": "E-1"})).await;
        assert!(!is_error_result(&result));
        assert!(inner.calls.lock().unwrap().contains(&"get_employees".to_string()));
    }

    #[tokio::test]
    async fn test_graceful_degrade_never_raises() {
        let inner = Arc::new(ScriptedInvoker {
            fail_tools: vec!["get_thing".into()],
            calls: Mutex::new(Vec::new()),
        });
        let llm = Arc::new(MockLlm::with_responses(&["none"]));
        let agent = RecoveryAgent::new(Arc::clone(&inner) as Arc<dyn ToolInvoker>, llm, &tools(&["get_thing"]));
        let result = agent.invoke("get_thing", json!({"id": 1})).await;
        assert!(is_error_result(&result));
        assert_eq!(result["recovered"], false);
    }

    #[tokio::test]
    async fn test_success_passes_through() {
        let inner = Arc::new(ScriptedInvoker {
            fail_tools: vec![],
            calls: Mutex::new(Vec::new()),
        });
        let llm = Arc::new(MockLlm::new());
        let agent = RecoveryAgent::new(Arc::clone(&inner) as Arc<dyn ToolInvoker>, llm, &tools(&["get_x"]));
        let result = agent.invoke("get_x", json!({})).await;
        assert_eq!(result["data"][0]["id"], 1);
        assert_eq!(inner.calls.lock().unwrap().len(), 1);
    }
}
