//! 批量读取的游标分页：自动探测分页风格并循环取尽
//!
//! 多数工具单次只给 10-100 条记录，而聚合类任务动辄几百条。
//! 支持 page/limit、cursor/next、offset/total、has_more 四种风格，
//! 取尽或到达硬上限（10,000 条 / 20 页）为止。

use serde_json::{json, Value};

use crate::tools::{is_error_result, ToolInvoker};

pub const MAX_PAGES: usize = 20;
pub const MAX_RECORDS: usize = 10_000;
const DEFAULT_PAGE_SIZE: u64 = 100;

/// 常见的结果容器键
const RESULT_KEYS: [&str; 14] = [
    "data", "results", "records", "items", "rows", "transactions", "invoices", "tickets",
    "accounts", "issues", "users", "deals", "contacts", "entries",
];

/// 从不同形状的工具响应里提取记录列表
pub fn extract_records(result: &Value, result_key: Option<&str>) -> Vec<Value> {
    if let Value::Array(arr) = result {
        return arr.clone();
    }
    let Some(obj) = result.as_object() else {
        return Vec::new();
    };
    if let Some(key) = result_key {
        return obj
            .get(key)
            .and_then(|v| v.as_array())
            .cloned()
            .unwrap_or_default();
    }
    for key in RESULT_KEYS {
        if let Some(Value::Array(arr)) = obj.get(key) {
            return arr.clone();
        }
    }
    // 兜底：第一个非空列表值
    obj.values()
        .find_map(|v| match v {
            Value::Array(arr) if !arr.is_empty() => Some(arr.clone()),
            _ => None,
        })
        .unwrap_or_default()
}

/// 循环调用直到取尽；返回聚合记录
pub async fn fetch_all(
    invoker: &dyn ToolInvoker,
    tool_name: &str,
    base_params: &Value,
    result_key: Option<&str>,
) -> Vec<Value> {
    let mut all_records: Vec<Value> = Vec::new();
    let mut page: u64 = 1;
    let mut offset: u64 = 0;
    let mut cursor: Option<String> = None;

    for _ in 0..MAX_PAGES {
        let mut params = base_params.clone();
        if let Some(obj) = params.as_object_mut() {
            if let Some(c) = &cursor {
                obj.insert("cursor".to_string(), json!(c));
            } else {
                obj.entry("page".to_string()).or_insert(json!(page));
                obj.entry("limit".to_string()).or_insert(json!(DEFAULT_PAGE_SIZE));
                obj.entry("offset".to_string()).or_insert(json!(offset));
            }
        }

        let result = invoker.invoke(tool_name, params).await;
        if is_error_result(&result) {
            break; // 工具错误：优雅停下，返回已取部分
        }

        let records = extract_records(&result, result_key);
        if records.is_empty() {
            break;
        }
        let batch_len = records.len();
        all_records.extend(records);
        if all_records.len() >= MAX_RECORDS {
            all_records.truncate(MAX_RECORDS);
            break;
        }

        let Some(obj) = result.as_object() else { break };

        let next_cursor = obj
            .get("next_cursor")
            .or_else(|| obj.get("cursor"))
            .and_then(|v| v.as_str())
            .filter(|s| !s.is_empty());
        if let Some(c) = next_cursor {
            cursor = Some(c.to_string());
            continue;
        }

        let total = ["total", "total_count", "count"]
            .iter()
            .find_map(|k| obj.get(*k).and_then(|v| v.as_u64()));
        if let Some(t) = total {
            if all_records.len() as u64 >= t {
                break;
            }
        }

        let has_more = ["has_more", "next_page", "has_next_page"]
            .iter()
            .any(|k| obj.get(*k).map(truthy).unwrap_or(false));
        let page_size = base_params
            .get("limit")
            .and_then(|v| v.as_u64())
            .unwrap_or(DEFAULT_PAGE_SIZE);
        if !has_more && (batch_len as u64) < page_size {
            break; // 不足一页：最后一页
        }

        page += 1;
        offset += batch_len as u64;
    }

    all_records
}

fn truthy(v: &Value) -> bool {
    match v {
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(false),
        Value::String(s) => !s.is_empty(),
        _ => false,
    }
}

/// 分页取尽后按谓词过滤
pub async fn fetch_all_matching<F>(
    invoker: &dyn ToolInvoker,
    tool_name: &str,
    base_params: &Value,
    predicate: F,
) -> Vec<Value>
where
    F: Fn(&Value) -> bool,
{
    fetch_all(invoker, tool_name, base_params, None)
        .await
        .into_iter()
        .filter(|r| predicate(r))
        .collect()
}

/// 按字段值分组（AR 账龄分桶等）
pub fn group_by(records: &[Value], key: &str) -> std::collections::BTreeMap<String, Vec<Value>> {
    let mut groups: std::collections::BTreeMap<String, Vec<Value>> = Default::default();
    for r in records {
        let k = r
            .get(key)
            .map(|v| match v {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            })
            .unwrap_or_else(|| "unknown".to_string());
        groups.entry(k).or_default().push(r.clone());
    }
    groups
}

/// 数值字段求和；非数值安全跳过
pub fn sum_field(records: &[Value], field: &str) -> f64 {
    let total: f64 = records
        .iter()
        .filter_map(|r| r.get(field))
        .filter_map(|v| match v {
            Value::Number(n) => n.as_f64(),
            Value::String(s) => s.parse().ok(),
            _ => None,
        })
        .sum();
    (total * 100.0).round() / 100.0
}

/// 按键去重，保留首次出现
pub fn deduplicate(records: &[Value], key: &str) -> Vec<Value> {
    let mut seen = std::collections::HashSet::new();
    records
        .iter()
        .filter(|r| match r.get(key) {
            Some(v) => seen.insert(v.to_string()),
            None => true,
        })
        .cloned()
        .collect()
}
