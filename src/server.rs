//! 传输层：JSON-RPC 2.0 单端点 + 健康/能力端点
//!
//! POST /  — method 必须是 tasks/send；其余 -32601。
//! 错误码：-32602 参数/策略文档不合法，-32603 内部错误（消息脱敏）。
//! 任何输入都返回合法 JSON-RPC 信封，基准评估器永远能解析。
//! GET /health 暴露 RL 指标；GET /.well-known/agent-card.json 能力元数据。

use std::sync::Arc;

use axum::{
    extract::State,
    routing::{get, post},
    Json, Router,
};
use serde_json::{json, Value};

use crate::core::WorkerError;
use crate::observability::Metrics;
use crate::worker::{Task, Worker};

pub struct AppState {
    pub worker: Worker,
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/", post(a2a_handler))
        .route("/health", get(health))
        .route("/.well-known/agent-card.json", get(agent_card))
        .with_state(state)
}

async fn agent_card() -> Json<Value> {
    Json(json!({
        "name": "Hornet Worker",
        "description": "Business process worker agent: 8-state FSM, deterministic policy \
                        enforcement, schema drift resilience, mutation verification and an \
                        RL quality loop.",
        "version": env!("CARGO_PKG_VERSION"),
        "capabilities": {"streaming": false, "tools": true},
        "skills": [{
            "id": "business-process",
            "name": "Business Process Worker",
            "description": "End-to-end business process execution: expense approval, \
                            procurement, offboarding, invoice reconciliation, SLA breach, \
                            order management, compliance audit, dispute resolution, \
                            AR collections, month-end close.",
        }],
    }))
}

async fn health(State(state): State<Arc<AppState>>) -> Json<Value> {
    let w = &state.worker;
    Json(json!({
        "status": "ok",
        "agent": "hornet-worker",
        "metrics": Metrics::global().to_json(),
        "case_log": w.case_log.stats(),
        "bandit": w.bandit.stats(),
        "knowledge_base": w.knowledge.stats(),
        "entity_memory": w.entities.stats(),
        "context_rl": w.context_accuracy.stats(),
        "tool_registry": w.registry.stats(),
        "dynamic_fsm": w.synthesizer.stats(),
        "active_sessions": w.sessions.active_count().await,
    }))
}

fn rpc_error(id: Value, code: i64, message: &str) -> Json<Value> {
    Json(json!({
        "jsonrpc": "2.0",
        "id": id,
        "error": {"code": code, "message": message},
    }))
}

async fn a2a_handler(
    State(state): State<Arc<AppState>>,
    body: Result<Json<Value>, axum::extract::rejection::JsonRejection>,
) -> Json<Value> {
    let Ok(Json(body)) = body else {
        return rpc_error(Value::Null, -32602, "Invalid params: body is not JSON");
    };
    let jsonrpc_id = body.get("id").cloned().unwrap_or(Value::Null);

    if body.get("method").and_then(|m| m.as_str()) != Some("tasks/send") {
        return rpc_error(jsonrpc_id, -32601, "Method not found");
    }

    let params = body.get("params").cloned().unwrap_or_else(|| json!({}));
    let task_id = params
        .get("id")
        .and_then(|v| v.as_str())
        .map(String::from)
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

    let task_text: String = params
        .get("message")
        .and_then(|m| m.get("parts"))
        .and_then(|p| p.as_array())
        .map(|parts| {
            parts
                .iter()
                .filter_map(|p| p.get("text").and_then(|t| t.as_str()))
                .collect::<Vec<_>>()
                .join("")
        })
        .unwrap_or_default();
    if task_text.is_empty() {
        return rpc_error(jsonrpc_id, -32602, "Invalid params: message has no text parts");
    }

    let metadata = params.get("metadata").cloned().unwrap_or_else(|| json!({}));
    let get_meta = |key: &str| {
        metadata
            .get(key)
            .and_then(|v| v.as_str())
            .unwrap_or("")
            .to_string()
    };

    let task = Task {
        session_id: {
            let sid = get_meta("session_id");
            if sid.is_empty() { task_id.clone() } else { sid }
        },
        task_id: task_id.clone(),
        text: task_text,
        policy_doc: get_meta("policy_doc"),
        tools_endpoint: get_meta("tools_endpoint"),
    };

    match state.worker.run(task).await {
        Ok(answer) => Json(json!({
            "jsonrpc": "2.0",
            "id": jsonrpc_id,
            "result": {
                "id": task_id,
                "status": {"state": "completed"},
                "artifacts": [{"parts": [{"text": answer}]}],
            },
        })),
        Err(e) => {
            let code = e.jsonrpc_code().unwrap_or(-32603);
            let message = match &e {
                WorkerError::InvalidPolicy(msg) => format!("Invalid params: {}", msg),
                // 内部错误脱敏：不把组件细节泄给调用方
                _ => "Internal error".to_string(),
            };
            tracing::error!(error = %e, "task failed at transport boundary");
            rpc_error(jsonrpc_id, code, &message)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;
    use crate::llm::MockLlm;
    use tempfile::TempDir;

    fn test_state(dir: &TempDir) -> Arc<AppState> {
        let mut cfg = AppConfig::default();
        cfg.worker.cache_dir = dir.path().to_path_buf();
        cfg.worker.task_timeout_secs = 30;
        cfg.tools.default_endpoint = "http://127.0.0.1:1".to_string();
        cfg.tools.tool_timeout_secs = 1;
        let worker = Worker::new(cfg, Arc::new(MockLlm::new()));
        Arc::new(AppState { worker })
    }

    #[tokio::test]
    async fn test_method_not_found() {
        let dir = TempDir::new().unwrap();
        let state = test_state(&dir);
        let Json(resp) = a2a_handler(
            State(state),
            Ok(Json(json!({"jsonrpc": "2.0", "id": "r1", "method": "tasks/cancel"}))),
        )
        .await;
        assert_eq!(resp["error"]["code"], -32601);
        assert_eq!(resp["id"], "r1");
    }

    #[tokio::test]
    async fn test_missing_text_is_invalid_params() {
        let dir = TempDir::new().unwrap();
        let state = test_state(&dir);
        let Json(resp) = a2a_handler(
            State(state),
            Ok(Json(json!({
                "jsonrpc": "2.0", "id": 7, "method": "tasks/send",
                "params": {"id": "t1", "message": {"parts": []}},
            }))),
        )
        .await;
        assert_eq!(resp["error"]["code"], -32602);
    }

    #[tokio::test]
    async fn test_invalid_policy_doc_maps_to_32602() {
        let dir = TempDir::new().unwrap();
        let state = test_state(&dir);
        let Json(resp) = a2a_handler(
            State(state),
            Ok(Json(json!({
                "jsonrpc": "2.0", "id": 1, "method": "tasks/send",
                "params": {
                    "id": "t1",
                    "message": {"role": "user", "parts": [{"text": "approve the expense"}]},
                    "metadata": {"policy_doc": "{not json"},
                },
            }))),
        )
        .await;
        assert_eq!(resp["error"]["code"], -32602);
    }

    #[tokio::test]
    async fn test_well_formed_envelope_on_success() {
        let dir = TempDir::new().unwrap();
        let state = test_state(&dir);
        let Json(resp) = a2a_handler(
            State(state),
            Ok(Json(json!({
                "jsonrpc": "2.0", "id": "req-9", "method": "tasks/send",
                "params": {
                    "id": "task-9",
                    "message": {"role": "user", "parts": [{"text": "What is the status of order ORD-5"}]},
                },
            }))),
        )
        .await;
        assert_eq!(resp["jsonrpc"], "2.0");
        assert_eq!(resp["id"], "req-9");
        assert_eq!(resp["result"]["id"], "task-9");
        assert_eq!(resp["result"]["status"]["state"], "completed");
        assert!(resp["result"]["artifacts"][0]["parts"][0]["text"].is_string());
    }
}
