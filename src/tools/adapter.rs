//! Schema 漂移纠正：列名模糊匹配 + 单次重试
//!
//! 工具调用报「column not found」时：内省 schema → 5 层纠正管线取首个
//! 置信命中 → 换列名重试一次 → 成功则写入会话 schema 缓存（同会话后续
//! 调用在第 0 层短路）。成功但空结果的返回同样触发纠正（过滤列漂移时
//! 查询不报错、只返回空集）。5 层全失败是软失败，任务继续。

use std::collections::HashMap;
use std::sync::{Arc, LazyLock};

use async_trait::async_trait;
use regex::Regex;
use serde_json::Value;

use crate::memory::SessionStore;
use crate::tools::{error_text, is_error_result, ToolInvoker};

/// 规范列名 → 已知变体（双向查）
static KNOWN_COLUMN_ALIASES: LazyLock<Vec<(&'static str, Vec<&'static str>)>> = LazyLock::new(|| {
    vec![
        ("client_name", vec!["customer_name", "account_name", "company_name", "org_name"]),
        ("amount", vec!["value", "total", "price", "cost", "total_amount"]),
        ("user_id", vec!["creator_id", "employee_id"]),
        ("name", vec!["title", "label", "display_name", "full_name"]),
        ("category", vec!["type", "classification", "kind"]),
        ("email", vec!["em", "e_mail", "email_address", "contact_email", "mail"]),
        ("status", vec!["st", "stat", "state", "state_code", "current_status"]),
        ("owner_id", vec!["oid", "owner", "assigned_to", "assignee_id"]),
        ("created_at", vec!["created", "create_date", "creation_date", "date_created", "timestamp"]),
        ("description", vec!["desc", "descr", "detail", "details", "notes"]),
    ]
});

static SCHEMA_ERROR_PATTERNS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [
        r#"column[s]?\s+['"]?(\w+)['"]?\s+(?:not found|does not exist|unknown|not recognized)"#,
        r#"no such column[s]?:?\s+['"]?(\w+)['"]?"#,
        r#"invalid column name[s]?\s+['"]?(\w+)['"]?"#,
        r#"unknown column[s]?[:\s]+['"]?(\w+)['"]?"#,
        r#"field[s]?\s+['"]?(\w+)['"]?\s+(?:not found|does not exist)"#,
    ]
    .iter()
    .map(|p| Regex::new(p).unwrap())
    .collect()
});

const EMPTY_RESULT_KEYS: [&str; 6] = ["data", "items", "records", "results", "rows", "list"];
const SCHEMA_INTROSPECTION_TOOLS: [&str; 4] =
    ["describe_table", "get_schema", "list_columns", "schema_introspect"];

/// 从错误文本提取坏列名；非 schema 错误返回 None
pub fn detect_schema_error(error_text: &str) -> Option<String> {
    let text = error_text.to_lowercase();
    SCHEMA_ERROR_PATTERNS
        .iter()
        .find_map(|re| re.captures(&text).map(|c| c[1].to_string()))
}

/// 成功返回但集合为空，且 total/count 没说明真有数据：可能是过滤列漂移
pub fn is_empty_due_to_drift(result: &Value) -> bool {
    let Some(obj) = result.as_object() else {
        return false;
    };
    if is_error_result(result) {
        return false;
    }
    let has_total = ["total", "count", "total_count"]
        .iter()
        .any(|k| obj.get(*k).and_then(|v| v.as_u64()).unwrap_or(0) > 0);
    EMPTY_RESULT_KEYS.iter().any(|key| {
        matches!(obj.get(*key), Some(Value::Array(a)) if a.is_empty())
            || matches!(obj.get(*key), Some(Value::Object(o)) if o.is_empty())
    }) && !has_total
}

/// 最长公共子序列相似率，difflib SequenceMatcher.ratio 的等价物
pub(crate) fn lcs_ratio(a: &str, b: &str) -> f64 {
    let a_bytes = a.as_bytes();
    let b_bytes = b.as_bytes();
    if a_bytes.is_empty() || b_bytes.is_empty() {
        return 0.0;
    }
    let mut prev = vec![0usize; b_bytes.len() + 1];
    let mut curr = vec![0usize; b_bytes.len() + 1];
    for &ac in a_bytes {
        for (j, &bc) in b_bytes.iter().enumerate() {
            curr[j + 1] = if ac == bc {
                prev[j] + 1
            } else {
                prev[j + 1].max(curr[j])
            };
        }
        std::mem::swap(&mut prev, &mut curr);
        curr.fill(0);
    }
    2.0 * prev[b_bytes.len()] as f64 / (a_bytes.len() + b_bytes.len()) as f64
}

fn levenshtein(a: &str, b: &str) -> usize {
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();
    let mut row: Vec<usize> = (0..=b.len()).collect();
    for (i, ca) in a.iter().enumerate() {
        let mut prev = row[0];
        row[0] = i + 1;
        for (j, cb) in b.iter().enumerate() {
            let cost = if ca == cb { 0 } else { 1 };
            let next = (prev + cost).min(row[j] + 1).min(row[j + 1] + 1);
            prev = row[j + 1];
            row[j + 1] = next;
        }
    }
    row[b.len()]
}

pub(crate) fn levenshtein_ratio(a: &str, b: &str) -> f64 {
    let max_len = a.chars().count().max(b.chars().count());
    if max_len == 0 {
        return 1.0;
    }
    1.0 - levenshtein(a, b) as f64 / max_len as f64
}

/// 5 层模糊匹配：精确 → 别名表 → LCS 相似率 → Levenshtein → 前缀
pub fn fuzzy_match_column(bad_col: &str, candidates: &[String]) -> Option<String> {
    if candidates.is_empty() {
        return None;
    }

    // Tier 1: 精确命中
    if candidates.iter().any(|c| c == bad_col) {
        return Some(bad_col.to_string());
    }

    // Tier 2: 别名表双向查
    for (canonical, aliases) in KNOWN_COLUMN_ALIASES.iter() {
        if aliases.contains(&bad_col) && candidates.iter().any(|c| c == canonical) {
            return Some(canonical.to_string());
        }
        if bad_col == *canonical {
            if let Some(hit) = aliases.iter().find(|a| candidates.iter().any(|c| c == *a)) {
                return Some(hit.to_string());
            }
        }
    }

    // Tier 3: LCS 相似率；短缩写（≤3 字符）放宽到 0.5
    let cutoff = if bad_col.len() <= 3 { 0.5 } else { 0.6 };
    let best_lcs = candidates
        .iter()
        .map(|c| (lcs_ratio(bad_col, c), c))
        .max_by(|a, b| a.0.partial_cmp(&b.0).unwrap());
    if let Some((ratio, c)) = best_lcs {
        if ratio >= cutoff {
            return Some(c.clone());
        }
    }

    // Tier 4: Levenshtein 比率 > 0.7
    let best_lev = candidates
        .iter()
        .map(|c| (levenshtein_ratio(bad_col, c), c))
        .max_by(|a, b| a.0.partial_cmp(&b.0).unwrap());
    if let Some((ratio, c)) = best_lev {
        if ratio > 0.7 {
            return Some(c.clone());
        }
    }

    // Tier 5: 公共前缀（≥3 字符）；优先最短的前缀命中
    if bad_col.len() >= 3 {
        if let Some(c) = candidates
            .iter()
            .filter(|c| c.starts_with(bad_col))
            .min_by_key(|c| c.len())
        {
            return Some(c.clone());
        }
        if let Some(c) = candidates
            .iter()
            .filter(|c| c.len() >= 3 && bad_col.starts_with(c.as_str()))
            .max_by_key(|c| c.len())
        {
            return Some(c.clone());
        }
    }

    None
}

/// 参数里递归替换 bad → good（字符串值与嵌套结构）
fn replace_in_params(params: &Value, bad: &str, good: &str) -> Value {
    match params {
        Value::String(s) => Value::String(s.replace(bad, good)),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), replace_in_params(v, bad, good)))
                .collect(),
        ),
        Value::Array(arr) => Value::Array(arr.iter().map(|v| replace_in_params(v, bad, good)).collect()),
        other => other.clone(),
    }
}

static COLUMN_WORD_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b([a-z_][a-z0-9_]{2,})\b").unwrap());

/// schema 内省结果里可能的列名集合
fn columns_from_schema(schema_result: &Value) -> Vec<String> {
    let text = schema_result.to_string().to_lowercase();
    let mut seen = std::collections::HashSet::new();
    COLUMN_WORD_RE
        .find_iter(&text)
        .map(|m| m.as_str().to_string())
        .filter(|c| seen.insert(c.clone()))
        .collect()
}

/// Schema 纠正层：包装内层调用器
pub struct SchemaAdapter {
    inner: Arc<dyn ToolInvoker>,
    sessions: Arc<SessionStore>,
    session_id: String,
}

impl SchemaAdapter {
    pub fn new(inner: Arc<dyn ToolInvoker>, sessions: Arc<SessionStore>, session_id: &str) -> Self {
        Self {
            inner,
            sessions,
            session_id: session_id.to_string(),
        }
    }

    async fn attempt_correction(&self, tool_name: &str, params: &Value, bad_col: Option<String>) -> Option<Value> {
        // 要尝试纠正的列：错误里点名的那个，或所有疑似列过滤的字符串参数
        let cols_to_try: Vec<String> = match bad_col {
            Some(c) => vec![c],
            None => params
                .as_object()
                .map(|obj| {
                    obj.iter()
                        .filter(|(k, v)| {
                            v.is_string()
                                && !matches!(
                                    k.as_str(),
                                    "table" | "table_name" | "resource" | "session_id" | "organization_id"
                                )
                        })
                        .filter_map(|(_, v)| v.as_str().map(String::from))
                        .collect()
                })
                .unwrap_or_default(),
        };
        if cols_to_try.is_empty() {
            return None;
        }

        // 第 0 层：会话缓存短路，免内省
        let mut corrections: HashMap<String, String> = HashMap::new();
        let mut uncached: Vec<String> = Vec::new();
        for col in &cols_to_try {
            let cache_key = format!("{}:{}", tool_name, col);
            match self.sessions.schema_cache_get(&self.session_id, &cache_key).await {
                Some(good) => {
                    corrections.insert(col.clone(), good);
                }
                None => uncached.push(col.clone()),
            }
        }

        if !uncached.is_empty() {
            let table = params
                .get("table")
                .or_else(|| params.get("table_name"))
                .or_else(|| params.get("resource"))
                .cloned()
                .unwrap_or(Value::Null);
            let introspect_params = if table.is_null() {
                serde_json::json!({})
            } else {
                serde_json::json!({"table": table})
            };

            let mut columns: Vec<String> = Vec::new();
            for schema_tool in SCHEMA_INTROSPECTION_TOOLS {
                let result = self.inner.invoke(schema_tool, introspect_params.clone()).await;
                if !is_error_result(&result) {
                    columns = columns_from_schema(&result);
                    break;
                }
            }
            if columns.is_empty() {
                return None;
            }

            for col in uncached {
                if let Some(good) = fuzzy_match_column(&col, &columns) {
                    corrections.insert(col, good);
                }
            }
        }

        let mut corrected = params.clone();
        let mut changed = false;
        for (bad, good) in &corrections {
            if bad != good {
                corrected = replace_in_params(&corrected, bad, good);
                changed = true;
            }
        }
        if !changed {
            return None;
        }

        let retry = self.inner.invoke(tool_name, corrected).await;
        if !is_error_result(&retry) {
            // 纠正奏效：写回会话缓存
            for (bad, good) in corrections {
                if bad != good {
                    self.sessions
                        .schema_cache_insert(&self.session_id, format!("{}:{}", tool_name, bad), good)
                        .await;
                }
            }
            Some(retry)
        } else {
            None
        }
    }
}

#[async_trait]
impl ToolInvoker for SchemaAdapter {
    async fn invoke(&self, tool_name: &str, params: Value) -> Value {
        let result = self.inner.invoke(tool_name, params.clone()).await;

        if is_error_result(&result) {
            let bad_col = detect_schema_error(&error_text(&result));
            if bad_col.is_none() {
                return result; // 不是 schema 错误，交给上层恢复
            }
            tracing::debug!(tool = tool_name, column = ?bad_col, "schema drift detected, correcting");
            match self.attempt_correction(tool_name, &params, bad_col).await {
                Some(corrected) => corrected,
                None => result,
            }
        } else if is_empty_due_to_drift(&result) {
            match self.attempt_correction(tool_name, &params, None).await {
                Some(corrected) if !is_empty_due_to_drift(&corrected) => corrected,
                _ => result,
            }
        } else {
            result
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Mutex;

    /// 脚本化内层调用器：按 (tool, 次数) 返回预置结果
    struct ScriptedInvoker {
        calls: Mutex<Vec<(String, Value)>>,
        responses: Mutex<HashMap<String, Vec<Value>>>,
    }

    impl ScriptedInvoker {
        fn new() -> Self {
            Self {
                calls: Mutex::new(Vec::new()),
                responses: Mutex::new(HashMap::new()),
            }
        }

        fn push(&self, tool: &str, result: Value) {
            self.responses
                .lock()
                .unwrap()
                .entry(tool.to_string())
                .or_default()
                .push(result);
        }

        fn call_count(&self, tool: &str) -> usize {
            self.calls.lock().unwrap().iter().filter(|(t, _)| t == tool).count()
        }
    }

    #[async_trait]
    impl ToolInvoker for ScriptedInvoker {
        async fn invoke(&self, tool_name: &str, params: Value) -> Value {
            self.calls.lock().unwrap().push((tool_name.to_string(), params));
            let mut responses = self.responses.lock().unwrap();
            match responses.get_mut(tool_name) {
                Some(queue) if !queue.is_empty() => queue.remove(0),
                _ => json!({"error": format!("no script for {}", tool_name)}),
            }
        }
    }

    #[test]
    fn test_detect_schema_error() {
        assert_eq!(detect_schema_error("column not found: amt").as_deref(), Some("amt"));
        assert_eq!(detect_schema_error("Unknown column 'amt'").as_deref(), Some("amt"));
        assert_eq!(detect_schema_error("no such column: amt").as_deref(), Some("amt"));
        assert!(detect_schema_error("connection refused").is_none());
    }

    #[test]
    fn test_fuzzy_tiers() {
        let candidates: Vec<String> = ["amount", "status", "owner_id", "created_at"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        // 别名表
        assert_eq!(fuzzy_match_column("total", &candidates).as_deref(), Some("amount"));
        // LCS 相似
        assert_eq!(fuzzy_match_column("amt", &candidates).as_deref(), Some("amount"));
        assert_eq!(fuzzy_match_column("ammount", &candidates).as_deref(), Some("amount"));
        // 前缀
        assert_eq!(fuzzy_match_column("own", &candidates).as_deref(), Some("owner_id"));
        // 短缩写放宽阈值
        assert_eq!(fuzzy_match_column("st", &candidates).as_deref(), Some("status"));
    }

    #[test]
    fn test_empty_result_drift_detection() {
        assert!(is_empty_due_to_drift(&json!({"data": []})));
        assert!(!is_empty_due_to_drift(&json!({"data": [], "total": 12})));
        assert!(!is_empty_due_to_drift(&json!({"data": [{"id": 1}]})));
        assert!(!is_empty_due_to_drift(&json!({"error": "boom", "data": []})));
    }

    #[tokio::test]
    async fn test_correction_retries_once_and_caches() {
        let inner = Arc::new(ScriptedInvoker::new());
        // 第一次失败，内省给出列表，重试成功
        inner.push("get_invoice", json!({"error": "column not found: amt"}));
        inner.push("describe_table", json!({"columns": ["amount", "status", "vendor"]}));
        inner.push("get_invoice", json!({"amount": 120.0}));

        let sessions = Arc::new(SessionStore::new());
        let adapter = SchemaAdapter::new(inner.clone(), Arc::clone(&sessions), "s1");

        let result = adapter.invoke("get_invoice", json!({"col": "amt"})).await;
        assert_eq!(result["amount"], 120.0);
        assert_eq!(inner.call_count("get_invoice"), 2);
        // 缓存写入：amt → amount
        assert_eq!(
            sessions.schema_cache_get("s1", "get_invoice:amt").await.as_deref(),
            Some("amount")
        );
    }

    #[tokio::test]
    async fn test_cached_correction_short_circuits_introspection() {
        let inner = Arc::new(ScriptedInvoker::new());
        inner.push("get_invoice", json!({"error": "column not found: amt"}));
        inner.push("get_invoice", json!({"amount": 55.0}));

        let sessions = Arc::new(SessionStore::new());
        sessions
            .schema_cache_insert("s1", "get_invoice:amt".into(), "amount".into())
            .await;
        let adapter = SchemaAdapter::new(inner.clone(), Arc::clone(&sessions), "s1");

        let result = adapter.invoke("get_invoice", json!({"col": "amt"})).await;
        assert_eq!(result["amount"], 55.0);
        // 没有调用任何内省工具
        assert_eq!(inner.call_count("describe_table"), 0);
    }

    #[tokio::test]
    async fn test_unrecoverable_returns_original_error() {
        let inner = Arc::new(ScriptedInvoker::new());
        inner.push("get_invoice", json!({"error": "column not found: zzz"}));
        // 内省也全部失败
        let sessions = Arc::new(SessionStore::new());
        let adapter = SchemaAdapter::new(inner.clone(), sessions, "s1");

        let result = adapter.invoke("get_invoice", json!({"col": "zzz"})).await;
        assert!(is_error_result(&result));
        assert!(error_text(&result).contains("zzz"));
    }
}
