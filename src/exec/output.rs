//! 结构化输出：bracket 格式判定、列表抽取、按流程校验输出字段、审批简报
//!
//! bracket 格式答案是 exact-match 评分目标：整串必须是一个 JSON 列表。
//! 只看 starts_with("[") 会把内嵌方括号的散文误判进来，判定必须走完整
//! JSON 解析。bracket 答案不加策略前缀、不加尾注、不进反思改写。

use std::sync::LazyLock;

use regex::Regex;
use serde_json::Value;

use crate::policy::PolicyResult;

/// bracket 格式判定：首字符 `[`、尾字符 `]` 且整串可解析为 JSON 列表
pub fn is_bracket_format(answer: &str) -> bool {
    let trimmed = answer.trim();
    if !trimmed.starts_with('[') || !trimmed.ends_with(']') {
        return false;
    }
    matches!(serde_json::from_str::<Value>(trimmed), Ok(Value::Array(_)))
}

static NUMBERED_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^\s*\d+[.)]\s+(.+)$").unwrap());
static BULLET_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?m)^\s*[-*•]\s+(.+)$").unwrap());
static JSON_ARRAY_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)\[([^\[\]]+)\]").unwrap());
static NUMERIC_ITEM_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"[\d$€£¥]").unwrap());
static LEADING_NUM_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^\d+[.)]\s*").unwrap());

/// 从应答文本抽取条目列表：JSON 数组 → 编号列表 → 项目符号 → 受限的逗号行
pub fn extract_ranked_items(text: &str) -> Vec<String> {
    // 1. JSON 数组（最可靠）
    if let Some(caps) = JSON_ARRAY_RE.captures(text) {
        let candidate = format!("[{}]", &caps[1]);
        if let Ok(Value::Array(arr)) = serde_json::from_str::<Value>(&candidate) {
            let items: Vec<String> = arr
                .iter()
                .filter_map(|v| match v {
                    Value::String(s) => Some(s.trim().to_string()),
                    Value::Number(n) => Some(n.to_string()),
                    _ => None,
                })
                .filter(|s| !s.is_empty())
                .collect();
            if items.len() == arr.len() && !items.is_empty() {
                return items;
            }
        }
    }

    // 2. 编号列表
    let numbered: Vec<String> = NUMBERED_RE
        .captures_iter(text)
        .map(|c| c[1].trim().to_string())
        .collect();
    if numbered.len() >= 2 {
        return numbered;
    }

    // 3. 项目符号
    let bulleted: Vec<String> = BULLET_RE
        .captures_iter(text)
        .map(|c| c[1].trim().to_string())
        .collect();
    if bulleted.len() >= 2 {
        return bulleted;
    }

    // 4. 单行逗号分隔：严格护栏，金额/数字一概不碰（避免腐蚀财务数据）
    for line in text.trim().lines().take(3) {
        let line = line.trim();
        if !line.contains(',') || line.len() >= 200 {
            continue;
        }
        let items: Vec<String> = line
            .split(',')
            .map(|i| i.trim().to_string())
            .filter(|i| !i.is_empty())
            .collect();
        if items.len() >= 2
            && !items.iter().any(|i| NUMERIC_ITEM_RE.is_match(i))
            && !items.iter().any(|i| i.len() > 50)
        {
            return items;
        }
    }

    Vec::new()
}

/// 规整为 JSON 数组字符串（exact-match 格式）
pub fn enforce_bracket_format(items: &[String]) -> String {
    let clean: Vec<String> = items
        .iter()
        .map(|i| LEADING_NUM_RE.replace(i, "").trim().to_string())
        .filter(|i| !i.is_empty())
        .collect();
    serde_json::to_string(&clean).unwrap_or_else(|_| "[]".to_string())
}

/// 答案后处理：策略失败前缀（仅散文）+ 列表答案规整
pub fn format_structured_answer(answer: &str, policy_result: Option<&PolicyResult>) -> String {
    let stripped = answer.trim();

    // bracket 答案一个字都不能动
    if is_bracket_format(stripped) {
        return stripped.to_string();
    }

    let mut parts = Vec::new();
    if let Some(policy) = policy_result {
        if !policy.passed {
            parts.push(format!("[POLICY: {}]", policy.summary));
        }
    }

    let items = extract_ranked_items(stripped);
    if !items.is_empty() {
        parts.push(enforce_bracket_format(&items));
    } else {
        parts.push(stripped.to_string());
    }
    parts.join("\n")
}

// ── 按流程的必需输出字段校验 ────────────────────────────────────────────

struct RequiredOutput {
    field: &'static str,
    markers: &'static [&'static str],
}

fn required_outputs(process_type: &str) -> &'static [RequiredOutput] {
    macro_rules! outputs {
        ($( ($field:expr, $markers:expr) ),* $(,)?) => {
            &[$( RequiredOutput { field: $field, markers: $markers } ),*]
        };
    }
    match process_type {
        "expense_approval" => outputs![
            ("decision", &["approved", "rejected", "denied", "approval"]),
            ("amount", &["$", "amount"]),
            ("reason", &["reason", "because", "justification", "policy"]),
        ],
        "invoice_reconciliation" => outputs![
            ("decision", &["approved", "rejected", "matched", "reconciled"]),
            ("amount", &["$", "amount", "total"]),
            ("variance", &["variance", "difference", "discrepancy", "match"]),
        ],
        "procurement" => outputs![
            ("po_number", &["po", "purchase order", "order number"]),
            ("vendor", &["vendor", "supplier"]),
            ("amount", &["$", "amount", "total"]),
        ],
        "hr_offboarding" => outputs![
            ("access", &["access revoked", "deactivated", "suspended", "removed"]),
            ("systems", &["systems", "accounts", "github", "slack", "okta"]),
        ],
        "payroll" => outputs![
            ("gross", &["gross"]),
            ("net", &["net"]),
            ("deductions", &["deductions", "tax", "withholding"]),
        ],
        "sla_breach" => outputs![
            ("credit", &["$", "credit", "compensation"]),
            ("breach", &["breach", "violation", "downtime", "duration"]),
        ],
        "ar_collections" => outputs![
            ("amount", &["$", "overdue", "outstanding", "balance"]),
            ("aging", &["30", "60", "90", "days", "aging"]),
        ],
        "dispute_resolution" => outputs![
            ("decision", &["approved", "rejected", "partial", "resolved", "credit"]),
            ("reason", &["reason", "because", "evidence", "determination"]),
        ],
        "subscription_migration" => outputs![
            ("plan", &["plan", "tier", "subscription"]),
            ("billing", &["$", "charge", "refund", "credit", "billing"]),
        ],
        "order_management" => outputs![
            ("order_id", &["order", "confirmation"]),
            ("total", &["$", "total", "amount"]),
        ],
        _ => &[],
    }
}

/// 校验答案是否覆盖该流程的必需输出；返回缺失字段
pub fn validate_output(answer: &str, process_type: &str) -> Vec<&'static str> {
    if is_bracket_format(answer) {
        return Vec::new(); // exact-match 目标不做字段校验
    }
    let lower = answer.to_lowercase();
    required_outputs(process_type)
        .iter()
        .filter(|req| !req.markers.iter().any(|m| lower.contains(m)))
        .map(|req| req.field)
        .collect()
}

/// 缺字段时的补全 prompt
pub fn missing_fields_prompt(missing: &[&str], process_type: &str) -> String {
    if missing.is_empty() {
        return String::new();
    }
    format!(
        "Your answer for this {} task is missing required information: {}. \
         Add the missing details using data already gathered. Keep everything else unchanged.",
        crate::budget::title_case(process_type),
        missing.join(", ")
    )
}

// ── 审批简报 ────────────────────────────────────────────────────────────

/// 审批门生效但答案太薄时，生成结构化审批简报
pub fn build_approval_brief(
    process_type: &str,
    proposed_actions: &[String],
    policy_result: Option<&PolicyResult>,
    risk_level: &str,
) -> String {
    let process = crate::budget::title_case(process_type);
    let mut lines = vec![
        format!("# Approval Request — {}", process),
        String::new(),
        "## Request Summary".to_string(),
        format!("Risk level: {}", risk_level),
        String::new(),
        "## Proposed Actions".to_string(),
    ];
    if proposed_actions.is_empty() {
        lines.push("- (no actions drafted)".to_string());
    } else {
        for action in proposed_actions {
            lines.push(format!("- {}", action.trim()));
        }
    }
    lines.push(String::new());
    lines.push("## Policy Compliance".to_string());
    match policy_result {
        Some(p) if !p.passed => {
            lines.push(format!("Status: FAILED — {}", p.summary));
            if let Some(level) = &p.escalation_level {
                lines.push(format!("Required approver: {}", level));
            }
        }
        Some(_) => lines.push("Status: PASSED".to_string()),
        None => lines.push("Status: no structured policy provided".to_string()),
    }
    lines.push(String::new());
    lines.push("## Approval Request".to_string());
    lines.push("Awaiting approver sign-off before any mutations are executed.".to_string());
    lines.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bracket_format_strict() {
        assert!(is_bracket_format(r#"["INV-001", "INV-002"]"#));
        assert!(is_bracket_format("  [1, 2, 3]  "));
        assert!(is_bracket_format("[]"));
        // 内嵌方括号的散文不是 bracket 格式
        assert!(!is_bracket_format("Rejected. [Reason: over budget]"));
        assert!(!is_bracket_format(r#"The answer is ["a"] as shown"#));
        // JSON 对象不是列表
        assert!(!is_bracket_format(r#"{"a": 1}"#));
        assert!(!is_bracket_format("[not json"));
    }

    #[test]
    fn test_extract_json_array() {
        let items = extract_ranked_items(r#"Top vendors: ["Acme", "Globex", "Initech"]"#);
        assert_eq!(items, vec!["Acme", "Globex", "Initech"]);
    }

    #[test]
    fn test_extract_numbered_list() {
        let items = extract_ranked_items("1. First option\n2. Second option\n3. Third");
        assert_eq!(items.len(), 3);
        assert_eq!(items[0], "First option");
    }

    #[test]
    fn test_comma_line_guards_financial_data() {
        // 含金额的逗号行不得被抽成列表
        let items = extract_ranked_items("Totals: $1,200, $3,400");
        assert!(items.is_empty());
    }

    #[test]
    fn test_policy_prefix_only_on_prose() {
        let policy = crate::policy::evaluate_rules(
            &[serde_json::json!({"id": "V1", "condition": "x > 1", "action": "block", "level": "manager"})],
            serde_json::json!({"x": 5}).as_object().unwrap(),
        );
        let prose = format_structured_answer("Request rejected due to variance.", Some(&policy));
        assert!(prose.starts_with("[POLICY:"));
        // bracket 答案不加前缀
        let bracket = format_structured_answer(r#"["INV-001"]"#, Some(&policy));
        assert_eq!(bracket, r#"["INV-001"]"#);
    }

    #[test]
    fn test_validate_output_missing_fields() {
        let missing = validate_output("Approved the claim.", "expense_approval");
        assert!(missing.contains(&"amount"));
        assert!(!missing.contains(&"decision"));

        let complete = validate_output(
            "Approved $120 expense. Reason: within policy limits.",
            "expense_approval",
        );
        assert!(complete.is_empty());
    }

    #[test]
    fn test_bracket_answers_skip_validation() {
        assert!(validate_output(r#"["a"]"#, "expense_approval").is_empty());
    }

    #[test]
    fn test_approval_brief_sections() {
        let brief = build_approval_brief("procurement", &["Create PO-1 for $9,000".into()], None, "high");
        assert!(brief.contains("# Approval Request — Procurement"));
        assert!(brief.contains("## Proposed Actions"));
        assert!(brief.contains("Create PO-1"));
        assert!(brief.contains("Awaiting approver sign-off"));
    }
}
