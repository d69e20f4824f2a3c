//! Worker 管线集成测试
//!
//! 起一个进程内 mock 工具服务器（axum）+ 队列式 Mock LLM，
//! 驱动完整的 PRIME → EXECUTE → REFLECT：工具发现、schema 漂移纠正、
//! 变更核验回读、检查点落库与 RL 记账。

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use axum::{
    extract::State,
    routing::{get, post},
    Json, Router,
};
use serde_json::{json, Value};
use tempfile::TempDir;

use hornet::config::AppConfig;
use hornet::llm::MockLlm;
use hornet::worker::{Task, Worker};

/// mock 工具服务器的调用记录
struct ToolServerState {
    calls: std::sync::Mutex<Vec<(String, Value)>>,
    /// get_invoice 首次调用返回 schema 漂移错误
    drift_once: AtomicUsize,
}

async fn mock_tools(State(_state): State<Arc<ToolServerState>>) -> Json<Value> {
    Json(json!([
        {"name": "get_invoice", "description": "Fetch an invoice by id", "input_schema": {"type": "object"}},
        {"name": "describe_table", "description": "Describe table columns", "input_schema": {"type": "object"}},
        {"name": "update_invoice", "description": "Update an invoice", "input_schema": {"type": "object"}},
    ]))
}

async fn mock_call(
    State(state): State<Arc<ToolServerState>>,
    Json(body): Json<Value>,
) -> Json<Value> {
    let tool = body.get("tool").and_then(|t| t.as_str()).unwrap_or("").to_string();
    let params = body.get("params").cloned().unwrap_or_default();
    state.calls.lock().unwrap().push((tool.clone(), params.clone()));

    let response = match tool.as_str() {
        "get_invoice" => {
            let wants_drift = params
                .get("col")
                .and_then(|c| c.as_str())
                .map(|c| c == "amt")
                .unwrap_or(false);
            if wants_drift && state.drift_once.fetch_add(1, Ordering::SeqCst) == 0 {
                json!({"error": "column not found: amt"})
            } else {
                json!({"id": "INV-1", "amount": 52340.0, "status": "approved"})
            }
        }
        "describe_table" => json!({"columns": ["id", "amount", "status", "vendor"]}),
        "update_invoice" => json!({"status": "updated", "id": "INV-1"}),
        other => json!({"error": format!("unknown tool: {}", other)}),
    };
    Json(response)
}

async fn spawn_tool_server() -> (String, Arc<ToolServerState>) {
    let state = Arc::new(ToolServerState {
        calls: std::sync::Mutex::new(Vec::new()),
        drift_once: AtomicUsize::new(0),
    });
    let app = Router::new()
        .route("/mcp/tools", get(mock_tools))
        .route("/mcp", post(mock_call))
        .with_state(Arc::clone(&state));
    let listener = tokio::net::TcpListener::bind(SocketAddr::from(([127, 0, 0, 1], 0)))
        .await
        .unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (format!("http://{}", addr), state)
}

fn worker_with(llm: Arc<MockLlm>, dir: &TempDir, endpoint: &str) -> Worker {
    let mut cfg = AppConfig::default();
    cfg.worker.cache_dir = dir.path().to_path_buf();
    cfg.worker.task_timeout_secs = 60;
    cfg.tools.default_endpoint = endpoint.to_string();
    cfg.tools.tool_timeout_secs = 5;
    Worker::new(cfg, llm)
}

#[tokio::test]
async fn test_schema_drift_corrected_and_cached() {
    let (endpoint, server) = spawn_tool_server().await;
    let dir = TempDir::new().unwrap();

    // 脚本：分类 → DECOMPOSE 产出 → ASSESS 先发一个带坏列名的工具调用，
    // 观察写回后给出阶段产出 → COMPLETE 总结。其余后处理 pass 吃 echo 兜底。
    let llm = Arc::new(MockLlm::with_responses(&[
        r#"{"process_type": "invoice_reconciliation", "confidence": 0.9}"#,
        "Entities identified: invoice INV-1, amount check required.",
        r#"{"tool": "get_invoice", "args": {"id": "INV-1", "col": "amt"}}"#,
        "Gathered invoice INV-1: amount $52,340, status approved, vendor on record.",
        "Variance computed at 2.23%, exceeds the 2% threshold by 0.23 points.",
        "Match decision recorded: flagged for review, variance 2.23% against the 2% threshold, amount $52,340.",
        "Reconciliation summary: invoice INV-1 amount $52,340 flagged, variance 2.23% exceeds threshold, decision rejected pending review.",
    ]));
    let worker = worker_with(Arc::clone(&llm), &dir, &endpoint);

    let answer = worker
        .run(Task {
            task_id: "t-drift".into(),
            session_id: "sess-drift".into(),
            text: "Reconcile invoice INV-1 against its purchase order and record the match decision"
                .into(),
            policy_doc: String::new(),
            tools_endpoint: endpoint.clone(),
        })
        .await
        .unwrap();

    assert!(!answer.is_empty());

    // 漂移被纠正：坏列名调用后出现了 describe_table 内省与重试
    let calls = server.calls.lock().unwrap();
    let tool_names: Vec<&str> = calls.iter().map(|(t, _)| t.as_str()).collect();
    assert!(tool_names.contains(&"get_invoice"));
    assert!(tool_names.contains(&"describe_table"));
    let retried = calls
        .iter()
        .filter(|(t, p)| t == "get_invoice" && p.get("col").and_then(|c| c.as_str()) == Some("amount"))
        .count();
    assert!(retried >= 1, "corrected retry with col=amount expected, calls: {:?}", tool_names);

    // 纠正写入了会话 schema 缓存
    drop(calls);
    let cached = worker
        .sessions
        .schema_cache_get("sess-drift", "get_invoice:amt")
        .await;
    assert_eq!(cached.as_deref(), Some("amount"));
}

#[tokio::test]
async fn test_mutation_triggers_read_back_and_log() {
    let (endpoint, server) = spawn_tool_server().await;
    let dir = TempDir::new().unwrap();

    let llm = Arc::new(MockLlm::with_responses(&[
        r#"{"process_type": "general", "confidence": 0.8}"#,
        "Plan: update invoice INV-1 status.",
        "Data gathered: invoice INV-1 exists with current status approved and amount on file.",
        r#"{"tool": "update_invoice", "args": {"invoice_id": "INV-1", "status": "paid"}}"#,
        "Mutation executed: invoice INV-1 marked paid, update confirmed by read-back.",
        "Completed: invoice INV-1 status updated to paid, one mutation executed and verified against the record.",
    ]));
    let worker = worker_with(Arc::clone(&llm), &dir, &endpoint);

    let answer = worker
        .run(Task {
            task_id: "t-mutate".into(),
            session_id: "sess-mutate".into(),
            text: "Update invoice INV-1 status to paid".into(),
            policy_doc: String::new(),
            tools_endpoint: endpoint.clone(),
        })
        .await
        .unwrap();

    // 写后立即回读，核验日志出现在答案里
    let calls = server.calls.lock().unwrap();
    let names: Vec<&str> = calls.iter().map(|(t, _)| t.as_str()).collect();
    let update_pos = names.iter().position(|n| *n == "update_invoice");
    assert!(update_pos.is_some(), "update_invoice expected, calls: {:?}", names);
    let read_after = names[update_pos.unwrap()..]
        .iter()
        .any(|n| *n == "get_invoice");
    assert!(read_after, "read-back after write expected, calls: {:?}", names);
    assert!(
        answer.contains("## Mutation Verification Log"),
        "mutation log expected in answer: {}",
        answer
    );
    assert!(answer.contains("VERIFIED"));
}

#[tokio::test]
async fn test_checkpoint_and_rl_accounting_survive_reflect() {
    let (endpoint, _server) = spawn_tool_server().await;
    let dir = TempDir::new().unwrap();

    let llm = Arc::new(MockLlm::with_responses(&[
        r#"{"process_type": "hr_offboarding", "confidence": 0.95}"#,
    ]));
    let worker = worker_with(Arc::clone(&llm), &dir, &endpoint);

    worker
        .run(Task {
            task_id: "t-cp".into(),
            session_id: "sess-cp".into(),
            text: "Process the offboarding for EMP-7: revoke access and schedule the exit".into(),
            policy_doc: String::new(),
            tools_endpoint: endpoint.clone(),
        })
        .await
        .unwrap();

    // 检查点：同会话下一轮可恢复
    let cp = worker.sessions.checkpoint("sess-cp").await.unwrap();
    assert_eq!(cp.process_type, "hr_offboarding");

    // RL 记账落盘
    let cases = worker.case_log.load();
    assert_eq!(cases.len(), 1);
    assert_eq!(cases[0].domain, "hr_offboarding");
    assert!(cases[0].quality > 0.0);

    // 老虎机拉过一次臂
    let stats = worker.bandit.stats();
    assert_eq!(stats["total_pulls"], 1);
}
