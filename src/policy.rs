//! 确定性策略规则评估：零 LLM、零外部 I/O
//!
//! 当请求携带结构化 policy_doc 时直接按规则求值，而不是把规则塞进 prompt。
//! 条件文法：` || ` / ` && ` 连接、`!field` 取反、数值/字符串比较、裸标识符真值。
//! 未知标识符求值为 false（不是错误）；只有文档结构不合法才报 InvalidPolicy。

use std::sync::LazyLock;

use regex::Regex;
use serde_json::Value;

use crate::core::WorkerError;

/// 升级层级，低到高；多条规则触发时报最高层级
const LEVEL_PRIORITY: [&str; 7] = ["manager", "hr", "finance", "committee", "legal", "cfo", "ciso"];

/// 单条被触发的规则
#[derive(Debug, Clone, serde::Serialize)]
pub struct TriggeredRule {
    pub rule_id: String,
    pub action: String,
    pub level: String,
    pub description: String,
}

/// 策略评估结果
#[derive(Debug, Clone, serde::Serialize)]
pub struct PolicyResult {
    pub passed: bool,
    pub requires_approval: bool,
    pub escalation_required: bool,
    pub triggered: Vec<TriggeredRule>,
    pub escalation_level: Option<String>,
    pub summary: String,
}

/// 解析 policy_doc 并评估
///
/// - 空文档：Ok(None)，视为直接通过
/// - JSON 不合法或缺 rules 数组：InvalidPolicy（映射为 -32602）
pub fn parse_and_evaluate(policy_doc: &str) -> Result<Option<PolicyResult>, WorkerError> {
    let trimmed = policy_doc.trim();
    if trimmed.is_empty() {
        return Ok(None);
    }
    let parsed: Value = serde_json::from_str(trimmed)
        .map_err(|e| WorkerError::InvalidPolicy(format!("policy_doc is not valid JSON: {}", e)))?;
    let rules = parsed
        .get("rules")
        .and_then(|r| r.as_array())
        .ok_or_else(|| WorkerError::InvalidPolicy("policy_doc missing 'rules' array".into()))?;
    let empty = serde_json::Map::new();
    let context = parsed
        .get("context")
        .and_then(|c| c.as_object())
        .unwrap_or(&empty);
    Ok(Some(evaluate_rules(rules, context)))
}

/// 规则评估主体，纯函数
pub fn evaluate_rules(rules: &[Value], context: &serde_json::Map<String, Value>) -> PolicyResult {
    let mut triggered = Vec::new();

    for rule in rules {
        let condition = rule.get("condition").and_then(|c| c.as_str()).unwrap_or("");
        if eval_condition(condition, context) {
            triggered.push(TriggeredRule {
                rule_id: str_field(rule, "id"),
                action: str_field(rule, "action"),
                level: str_field(rule, "level"),
                description: str_field(rule, "description"),
            });
        }
    }

    let requires_approval = triggered.iter().any(|r| r.action == "require_approval");
    let escalation_required = triggered.iter().any(|r| r.action == "escalate");
    let blocked = triggered.iter().any(|r| r.action == "block");

    let escalation_level = LEVEL_PRIORITY
        .iter()
        .rev()
        .find(|l| triggered.iter().any(|r| r.level == **l))
        .map(|l| l.to_string())
        .filter(|_| !triggered.is_empty());

    let passed = !blocked && !escalation_required && !requires_approval;

    let summary = if passed {
        "All policy rules passed".to_string()
    } else {
        format!(
            "{} rule(s) triggered: {}",
            triggered.len(),
            triggered.iter().map(|r| r.rule_id.as_str()).collect::<Vec<_>>().join(", ")
        )
    };

    PolicyResult {
        passed,
        requires_approval,
        escalation_required,
        triggered,
        escalation_level,
        summary,
    }
}

fn str_field(rule: &Value, key: &str) -> String {
    rule.get(key).and_then(|v| v.as_str()).unwrap_or("").to_string()
}

/// 条件求值；优先级 NOT > AND > OR
fn eval_condition(condition: &str, context: &serde_json::Map<String, Value>) -> bool {
    let trimmed = condition.trim();
    if trimmed.is_empty() {
        return false;
    }
    if trimmed.contains(" || ") {
        return trimmed.split(" || ").any(|p| eval_condition(p, context));
    }
    if trimmed.contains(" && ") {
        return trimmed.split(" && ").all(|p| eval_condition(p, context));
    }
    eval_atom(trimmed, context)
}

static COMPARISON_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(\w+)\s*(>=|<=|===|!==|==|!=|>|<)\s*(.+)$").unwrap());
static IDENT_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^\w+$").unwrap());

fn eval_atom(atom: &str, context: &serde_json::Map<String, Value>) -> bool {
    let trimmed = atom.trim();

    if let Some(rest) = trimmed.strip_prefix('!') {
        return !truthy(context.get(rest.trim()));
    }

    if let Some(caps) = COMPARISON_RE.captures(trimmed) {
        let field = &caps[1];
        let op = &caps[2];
        let raw = caps[3].trim();
        let Some(ctx_val) = context.get(field) else {
            return false;
        };

        // 数值比较优先；两侧任一解析失败退回字符串等值比较
        if let (Some(ctx_num), Ok(num_val)) = (as_f64(ctx_val), raw.parse::<f64>()) {
            match op {
                ">" => return ctx_num > num_val,
                "<" => return ctx_num < num_val,
                ">=" => return ctx_num >= num_val,
                "<=" => return ctx_num <= num_val,
                _ => {}
            }
        }

        let str_val = raw.trim_matches(|c| c == '\'' || c == '"');
        let ctx_str = value_as_string(ctx_val);
        return match op {
            "===" | "==" => ctx_str == str_val,
            "!==" | "!=" => ctx_str != str_val,
            _ => false,
        };
    }

    if IDENT_RE.is_match(trimmed) {
        return truthy(context.get(trimmed));
    }

    false
}

fn as_f64(v: &Value) -> Option<f64> {
    match v {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.parse().ok(),
        Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
        _ => None,
    }
}

fn value_as_string(v: &Value) -> String {
    match v {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn truthy(v: Option<&Value>) -> bool {
    match v {
        None | Some(Value::Null) => false,
        Some(Value::Bool(b)) => *b,
        Some(Value::Number(n)) => n.as_f64().map(|f| f != 0.0).unwrap_or(false),
        Some(Value::String(s)) => !s.is_empty(),
        Some(Value::Array(a)) => !a.is_empty(),
        Some(Value::Object(o)) => !o.is_empty(),
    }
}

/// 把确定性评估结果渲染为 system prompt 区块（声明不可被模型推翻）
pub fn build_policy_section(result: &PolicyResult) -> String {
    let status = if result.passed { "PASSED" } else { "FAILED" };
    let mut lines = vec![
        String::new(),
        "## POLICY ENFORCEMENT RESULT (deterministic — do not override)".to_string(),
        format!("Status: {}", status),
        format!("Summary: {}", result.summary),
    ];
    if !result.triggered.is_empty() {
        lines.push(format!(
            "Triggered: {}",
            result.triggered.iter().map(|r| r.rule_id.as_str()).collect::<Vec<_>>().join(", ")
        ));
    }
    if let Some(level) = &result.escalation_level {
        lines.push(format!("Escalation: {}", level));
    }
    lines.push("Your response MUST reflect this outcome exactly.".to_string());
    lines.push(String::new());
    lines.join("\n")
}
