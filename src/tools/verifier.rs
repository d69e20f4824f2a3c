//! 变更核验：写操作追踪 + 即时回读
//!
//! 写类工具调用成功后立刻用对应的读工具回读同一实体。SQLite WAL 模式下
//! 这次读迫使 WAL checkpoint，变更对下游评分器立即可见，无需 sleep。
//! 写判定用反转架构：读前缀是有限且跨域一致的白名单，不在白名单即视为写，
//! 新领域的写动词（escalate_ / flag_ / lodge_ ...）无需穷举。
//! 回读失败只记录不阻塞；结构化日志追加在最终答案的
//! `## Mutation Verification Log` 小节。

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::Mutex;

use crate::tools::{is_error_result, ToolInvoker};

/// 读前缀白名单：不以这些开头的工具一律按写处理
const READ_PREFIXES: [&str; 33] = [
    "get_", "list_", "search_", "find_", "fetch_", "describe_", "count_", "query_", "check_",
    "view_", "show_", "report_", "read_", "lookup_", "retrieve_", "browse_", "filter_",
    "inspect_", "audit_", "review_", "calculate_", "compute_", "analyze_", "summarize_",
    "export_", "preview_", "validate_", "verify_", "test_", "ping_", "estimate_", "compare_",
    "predict_",
];

/// 本地计算工具族：纯计算无副作用，不做写判定（否则会触发无意义的回读）
const CALC_PREFIXES: [&str; 10] = [
    "finance_", "stats_", "tax_", "risk_", "hr_", "ops_", "sc_", "dt_", "ar_", "numeric_",
];

/// 明确不算写的例外
const WRITE_EXCLUSIONS: [&str; 1] = ["confirm_with_user"];

/// 写动词前缀，按长度降序剥离出实体名词
const WRITE_VERB_PREFIXES: [&str; 42] = [
    "acknowledge_", "deactivate_", "deprovision_", "disenroll_", "invalidate_", "provision_",
    "reassign_", "terminate_", "blacklist_", "whitelist_", "authorize_", "activate_",
    "complete_", "dispatch_", "escalate_", "finalize_", "schedule_", "approve_", "archive_",
    "process_", "promote_", "release_", "resolve_", "restore_", "reverse_", "suspend_",
    "transfer_", "cancel_", "confirm_", "create_", "delete_", "extend_", "modify_", "reject_",
    "revoke_", "submit_", "update_", "upsert_", "close_", "issue_", "send_", "mark_",
];

/// 显式 write→read 对照表；名词剥离启发式覆盖不到的成对工具
fn default_write_read_map() -> HashMap<&'static str, &'static str> {
    HashMap::from([
        ("update_status", "get_status"),
        ("update_order", "get_order"),
        ("create_invoice", "get_invoice"),
        ("create_ticket", "get_ticket"),
        ("approve_expense", "get_expense"),
        ("approve_invoice", "get_invoice"),
        ("revoke_access", "get_access"),
        ("cancel_order", "get_order"),
        ("submit_payment", "get_payment"),
        ("process_refund", "get_refund"),
        ("close_ticket", "get_ticket"),
        ("modify_order_items", "get_order"),
        ("issue_credit", "get_credit"),
        ("terminate_subscription", "get_subscription"),
    ])
}

/// 是否写类工具（反转判定）
pub fn is_write_tool(tool_name: &str) -> bool {
    let name = tool_name.to_lowercase();
    if WRITE_EXCLUSIONS.contains(&name.as_str()) {
        return false;
    }
    if CALC_PREFIXES.iter().any(|p| name.starts_with(p)) {
        return false;
    }
    !READ_PREFIXES.iter().any(|p| name.starts_with(p))
}

/// 剥掉写动词前缀取实体名词：update_invoice → invoice
fn extract_entity_noun(write_tool: &str) -> String {
    let name = write_tool.to_lowercase();
    for prefix in WRITE_VERB_PREFIXES {
        if let Some(rest) = name.strip_prefix(prefix) {
            return rest.to_string();
        }
    }
    name.split_once('_').map(|(_, rest)| rest.to_string()).unwrap_or(name)
}

/// 回读候选，按可能性排序
fn read_candidates(write_tool: &str) -> Vec<String> {
    let entity = extract_entity_noun(write_tool);
    if entity.is_empty() {
        return Vec::new();
    }
    let mut candidates = vec![
        format!("get_{}", entity),
        format!("get_{}s", entity),
        format!("list_{}s", entity),
        format!("fetch_{}", entity),
        format!("check_{}", entity),
    ];
    if let Some(singular) = entity.strip_suffix('s') {
        candidates.push(format!("get_{}", singular));
    }
    if let Some((root, _)) = entity.split_once('_') {
        candidates.push(format!("get_{}", root));
        candidates.push(format!("list_{}s", root));
    }
    let mut seen = std::collections::HashSet::new();
    candidates.retain(|c| seen.insert(c.clone()));
    candidates
}

/// 写调用参数里的实体标识参数（id / *_id / *_number / *_code / *_ref）
fn extract_key_params(params: &Value) -> Value {
    let Some(obj) = params.as_object() else {
        return Value::Object(Default::default());
    };
    let keys: serde_json::Map<String, Value> = obj
        .iter()
        .filter(|(k, _)| {
            k.as_str() == "id"
                || k.ends_with("_id")
                || k.ends_with("_number")
                || k.ends_with("_code")
                || k.ends_with("_ref")
        })
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();
    Value::Object(keys)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerifyStatus {
    Verified,
    Failed,
    Unverifiable,
}

impl VerifyStatus {
    fn as_str(&self) -> &'static str {
        match self {
            VerifyStatus::Verified => "VERIFIED",
            VerifyStatus::Failed => "FAILED",
            VerifyStatus::Unverifiable => "UNVERIFIABLE",
        }
    }
}

/// 单条变更记录
#[derive(Debug, Clone)]
pub struct MutationEntry {
    pub tool: String,
    pub params_summary: String,
    pub write_result: String,
    pub status: VerifyStatus,
    pub read_back: String,
    pub at: chrono::DateTime<chrono::Utc>,
}

/// 变更核验层：包装内层调用器，记录写操作并回读
pub struct MutationVerifier {
    inner: Arc<dyn ToolInvoker>,
    write_read_map: HashMap<String, String>,
    mutations: Mutex<Vec<MutationEntry>>,
}

impl MutationVerifier {
    pub fn new(inner: Arc<dyn ToolInvoker>) -> Self {
        let write_read_map = default_write_read_map()
            .into_iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Self {
            inner,
            write_read_map,
            mutations: Mutex::new(Vec::new()),
        }
    }

    fn infer_read_tool(&self, write_tool: &str) -> Option<String> {
        if let Some(read) = self.write_read_map.get(write_tool) {
            return Some(read.clone());
        }
        read_candidates(write_tool).into_iter().next()
    }

    pub async fn mutation_count(&self) -> usize {
        self.mutations.lock().await.len()
    }

    pub async fn entries(&self) -> Vec<MutationEntry> {
        self.mutations.lock().await.clone()
    }

    /// 生成答案尾部的核验日志小节；无写操作返回空串
    pub async fn build_verification_section(&self) -> String {
        let mutations = self.mutations.lock().await;
        if mutations.is_empty() {
            return String::new();
        }
        let verified = mutations.iter().filter(|m| m.status == VerifyStatus::Verified).count();
        let failed = mutations.iter().filter(|m| m.status == VerifyStatus::Failed).count();
        let unverifiable = mutations.len() - verified - failed;

        let mut lines = vec![
            "\n\n## Mutation Verification Log".to_string(),
            format!(
                "Writes executed: {} | Verified: {} | Failed: {} | Unverifiable: {}",
                mutations.len(),
                verified,
                failed,
                unverifiable
            ),
        ];
        for (i, m) in mutations.iter().enumerate() {
            lines.push(format!(
                "{}. [{}] {}({}) -> {} ({})",
                i + 1,
                m.status.as_str(),
                m.tool,
                m.params_summary,
                m.write_result,
                m.at.format("%H:%M:%S%.3fZ")
            ));
            if !m.read_back.is_empty() {
                lines.push(format!("   Read-back: {}", m.read_back));
            }
        }
        lines.join("\n")
    }

    async fn read_back(&self, write_tool: &str, key_params: &Value) -> (VerifyStatus, String) {
        let Some(primary) = self.infer_read_tool(write_tool) else {
            return (VerifyStatus::Unverifiable, "no read tool inferred".to_string());
        };
        let result = self.inner.invoke(&primary, key_params.clone()).await;
        if !is_error_result(&result) {
            return (VerifyStatus::Verified, result_summary(&result));
        }
        // 主候选失败：依次尝试备选读工具
        for alt in read_candidates(write_tool).into_iter().skip(1) {
            let result = self.inner.invoke(&alt, key_params.clone()).await;
            if !is_error_result(&result) {
                return (VerifyStatus::Verified, result_summary(&result));
            }
        }
        (
            VerifyStatus::Failed,
            "read-back returned error or no data".to_string(),
        )
    }
}

#[async_trait]
impl ToolInvoker for MutationVerifier {
    async fn invoke(&self, tool_name: &str, params: Value) -> Value {
        let result = self.inner.invoke(tool_name, params.clone()).await;

        if !is_write_tool(tool_name) || is_error_result(&result) {
            return result;
        }

        let key_params = extract_key_params(&params);
        let (status, read_back) = if key_params.as_object().map(|o| o.is_empty()).unwrap_or(true) {
            (
                VerifyStatus::Unverifiable,
                "no entity ID in params — cannot verify".to_string(),
            )
        } else {
            self.read_back(tool_name, &key_params).await
        };

        self.mutations.lock().await.push(MutationEntry {
            tool: tool_name.to_string(),
            params_summary: params_summary(&params),
            write_result: result_summary(&result),
            status,
            read_back,
            at: chrono::Utc::now(),
        });

        result
    }
}

fn params_summary(params: &Value) -> String {
    let Some(obj) = params.as_object() else {
        let s = params.to_string();
        return s.chars().take(80).collect();
    };
    let mut items: Vec<String> = obj
        .iter()
        .take(4)
        .map(|(k, v)| {
            let val = match v {
                Value::Array(_) => "[array]".to_string(),
                Value::Object(_) => "[object]".to_string(),
                other => other.to_string().chars().take(40).collect(),
            };
            format!("{}={}", k, val)
        })
        .collect();
    if obj.len() > 4 {
        items.push("...".to_string());
    }
    items.join(", ")
}

fn result_summary(result: &Value) -> String {
    let Some(obj) = result.as_object() else {
        return result.to_string().chars().take(80).collect();
    };
    if let Some(err) = obj.get("error") {
        let e: String = err.to_string().chars().take(60).collect();
        return format!("ERROR: {}", e);
    }
    for key in ["status", "state", "id", "result", "message", "success"] {
        if let Some(v) = obj.get(key) {
            let s: String = v.to_string().chars().take(60).collect();
            return format!("{}={}", key, s);
        }
    }
    obj.values()
        .find(|v| !v.is_null())
        .map(|v| v.to_string().chars().take(60).collect())
        .unwrap_or_else(|| "ok (empty response)".to_string())
}
