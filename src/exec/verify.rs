//! 执行后校验：COMPUTE 算术审计门 + 自反思
//!
//! 审计门：答案里有数值时让快档 LLM 挑明显的算术错误，发现问题给一次
//! 强档修正机会，绝不重试第二次；COMPUTE 不得带着未通过的审计推进。
//! 自反思：先零成本启发式打分（≥0.85 跳过 LLM），低于 0.65 且非 bracket
//! 才触发一次改写；改写结果仍要过替换护栏。

use std::sync::LazyLock;

use regex::Regex;
use serde_json::Value;

use crate::exec::output::is_bracket_format;
use crate::fsm::classifier::parse_json_lenient;
use crate::llm::{CompletionRequest, LlmClient, ModelTier};

const AUDIT_TIMEOUT_SECS: u64 = 8;
const REFLECTION_TIMEOUT_SECS: u64 = 8;
pub const IMPROVE_THRESHOLD: f64 = 0.65;

static NUMBER_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[$£€¥]?\s*\d[\d,]*\.?\d*(?:\s*%)?").unwrap());

/// 审计适用的流程（其余流程没有值得审计的算术）
const COMPUTE_HEAVY: [&str; 9] = [
    "invoice_reconciliation",
    "expense_approval",
    "payroll",
    "month_end_close",
    "ar_collections",
    "sla_breach",
    "procurement",
    "subscription_migration",
    "general",
];

/// 审计结论
#[derive(Debug, Clone)]
pub struct ComputeVerifyResult {
    pub has_errors: bool,
    pub confidence: f64,
    pub issues: Vec<String>,
    pub correction_prompt: String,
}

impl ComputeVerifyResult {
    fn clean(confidence: f64) -> Self {
        Self {
            has_errors: false,
            confidence,
            issues: Vec::new(),
            correction_prompt: String::new(),
        }
    }
}

/// COMPUTE 审计：快档挑错；干净快路径不花任何 API 成本
pub async fn verify_compute_output(
    llm: &dyn LlmClient,
    task_text: &str,
    answer: &str,
    process_type: &str,
) -> ComputeVerifyResult {
    if is_bracket_format(answer) {
        return ComputeVerifyResult::clean(0.95);
    }
    let numbers: Vec<&str> = NUMBER_RE
        .find_iter(answer)
        .map(|m| m.as_str())
        .take(20)
        .collect();
    if numbers.is_empty() || answer.len() < 100 {
        return ComputeVerifyResult::clean(0.85);
    }
    if !COMPUTE_HEAVY.contains(&process_type) && !answer.to_lowercase().contains("compute") {
        return ComputeVerifyResult::clean(0.80);
    }

    let task_snippet: String = task_text.chars().take(800).collect();
    let answer_snippet: String = answer.chars().take(1500).collect();
    let req = CompletionRequest::new(
        ModelTier::Fast,
        "You are a financial calculation auditor. Review computations in an agent's answer.\n\
         Check numerical results for plausibility and internal consistency; spot arithmetic \
         errors, wrong formulas, and values that contradict each other.\n\
         Respond with JSON only:\n\
         {\"has_errors\": true/false, \"confidence\": 0.0-1.0, \"issues\": [\"...\"], \
         \"correction_hint\": \"specific fix instruction or empty string\"}\n\
         Only flag clear errors, not stylistic issues.",
        format!(
            "TASK:\n{}\n\nAGENT ANSWER (excerpt):\n{}\n\nKey numbers found: {}\n\n\
             Are the calculations correct? Return JSON.",
            task_snippet,
            answer_snippet,
            numbers[..numbers.len().min(10)].join(", ")
        ),
    )
    .with_max_tokens(300)
    .with_timeout(AUDIT_TIMEOUT_SECS);

    let result = tokio::time::timeout(
        std::time::Duration::from_secs(AUDIT_TIMEOUT_SECS),
        llm.complete(&req),
    )
    .await;
    let Ok(Ok(text)) = result else {
        // 审计只是尽力而为，失败放行
        return ComputeVerifyResult::clean(0.75);
    };

    let Some(parsed) = parse_json_lenient(&text, '{', '}') else {
        return ComputeVerifyResult::clean(0.75);
    };
    let has_errors = parsed.get("has_errors").and_then(Value::as_bool).unwrap_or(false);
    let confidence = parsed.get("confidence").and_then(Value::as_f64).unwrap_or(0.85);
    let issues: Vec<String> = parsed
        .get("issues")
        .and_then(Value::as_array)
        .map(|arr| arr.iter().filter_map(|v| v.as_str().map(String::from)).collect())
        .unwrap_or_default();
    let hint = parsed
        .get("correction_hint")
        .and_then(Value::as_str)
        .unwrap_or("")
        .to_string();

    let correction_prompt = if has_errors && !hint.is_empty() {
        let issue_list = issues
            .iter()
            .map(|i| format!("- {}", i))
            .collect::<Vec<_>>()
            .join("\n");
        let task_head: String = task_text.chars().take(600).collect();
        format!(
            "Your previous answer had calculation errors:\n{}\n\nCorrection needed: {}\n\n\
             Please recalculate and provide the corrected answer for:\n{}",
            issue_list, hint, task_head
        )
    } else {
        String::new()
    };

    ComputeVerifyResult {
        has_errors,
        confidence,
        issues,
        correction_prompt,
    }
}

// ── 自反思 ──────────────────────────────────────────────────────────────

/// 反思结论
#[derive(Debug, Clone)]
pub struct Reflection {
    pub score: f64,
    pub complete: bool,
    pub missing: Vec<String>,
    pub improve_prompt: String,
}

/// 零 API 启发式质量分；与案例日志的评分同一信号族
fn heuristic_score(answer: &str, tool_count: usize) -> f64 {
    crate::memory::score_quality(answer, tool_count, None)
}

/// 答案自评；bracket 答案定义上有效（1.0），绝不触发改写
pub async fn reflect_on_answer(
    llm: &dyn LlmClient,
    task_text: &str,
    answer: &str,
    process_type: &str,
    tool_count: usize,
) -> Reflection {
    if is_bracket_format(answer) {
        return Reflection {
            score: 1.0,
            complete: true,
            missing: Vec::new(),
            improve_prompt: String::new(),
        };
    }

    let heuristic = heuristic_score(answer, tool_count);
    if heuristic >= 0.85 {
        return Reflection {
            score: heuristic,
            complete: true,
            missing: Vec::new(),
            improve_prompt: String::new(),
        };
    }

    let task_snippet: String = task_text.chars().take(400).collect();
    let answer_snippet: String = answer.chars().take(600).collect();
    let req = CompletionRequest::new(
        ModelTier::Fast,
        "",
        format!(
            "Process: {} | Tools used: {}\nTask: {}\nAnswer: {}\n\n\
             Evaluate this answer. Does it:\n\
             1. Address ALL parts of the task?\n\
             2. Include required fields (amounts, IDs, decisions, reasons)?\n\
             3. Show evidence of data lookup (not just reasoning)?\n\n\
             Reply JSON only:\n\
             {{\"score\": 0.0-1.0, \"complete\": true/false, \"missing\": [\"item\"], \
             \"improve_prompt\": \"one sentence telling what to add\"}}",
            crate::budget::title_case(process_type),
            tool_count,
            task_snippet,
            answer_snippet
        ),
    )
    .with_max_tokens(200)
    .with_timeout(REFLECTION_TIMEOUT_SECS);

    let result = tokio::time::timeout(
        std::time::Duration::from_secs(REFLECTION_TIMEOUT_SECS),
        llm.complete(&req),
    )
    .await;
    let parsed = match result {
        Ok(Ok(text)) => parse_json_lenient(&text, '{', '}'),
        _ => None,
    };
    let Some(parsed) = parsed else {
        return Reflection {
            score: heuristic,
            complete: heuristic >= IMPROVE_THRESHOLD,
            missing: Vec::new(),
            improve_prompt: String::new(),
        };
    };

    Reflection {
        score: parsed.get("score").and_then(Value::as_f64).unwrap_or(0.7),
        complete: parsed.get("complete").and_then(Value::as_bool).unwrap_or(true),
        missing: parsed
            .get("missing")
            .and_then(Value::as_array)
            .map(|arr| arr.iter().filter_map(|v| v.as_str().map(String::from)).collect())
            .unwrap_or_default(),
        improve_prompt: parsed
            .get("improve_prompt")
            .and_then(Value::as_str)
            .unwrap_or("")
            .to_string(),
    }
}

/// 是否需要一次改写
pub fn should_improve(reflection: &Reflection) -> bool {
    (!reflection.complete || reflection.score < IMPROVE_THRESHOLD)
        && (!reflection.missing.is_empty() || !reflection.improve_prompt.is_empty())
}

/// 改写 prompt
pub fn build_improvement_prompt(reflection: &Reflection, task_text: &str) -> String {
    let mut parts = vec!["Your previous answer was incomplete. Improve it:".to_string()];
    if !reflection.missing.is_empty() {
        parts.push(format!("Missing: {}", reflection.missing.join(", ")));
    }
    if !reflection.improve_prompt.is_empty() {
        parts.push(format!("Specifically: {}", reflection.improve_prompt));
    }
    let task_head: String = task_text.chars().take(400).collect();
    parts.push(format!("Original task: {}", task_head));
    parts.push("Provide the complete, final answer now.".to_string());
    parts.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::MockLlm;

    #[tokio::test]
    async fn test_bracket_bypasses_everything() {
        let mock = MockLlm::new();
        let audit = verify_compute_output(&mock, "task", r#"["INV-001"]"#, "general").await;
        assert!(!audit.has_errors);
        let reflection = reflect_on_answer(&mock, "task", r#"["INV-001"]"#, "general", 2).await;
        assert_eq!(reflection.score, 1.0);
        assert!(!should_improve(&reflection));
        assert_eq!(mock.request_count(), 0);
    }

    #[tokio::test]
    async fn test_no_numbers_skips_audit() {
        let mock = MockLlm::new();
        let audit = verify_compute_output(&mock, "t", "All access revoked as requested.", "hr_offboarding").await;
        assert!(!audit.has_errors);
        assert_eq!(mock.request_count(), 0);
    }

    #[tokio::test]
    async fn test_audit_detects_errors_and_builds_correction() {
        let mock = MockLlm::with_responses(&[r#"{
            "has_errors": true,
            "confidence": 0.6,
            "issues": ["total does not equal sum of line items"],
            "correction_hint": "Recompute the total as 3 x $400 = $1,200"
        }"#]);
        let answer = "Line items: $400 each x 3. Total comes to $1,100 which is within the approved budget for this quarter.";
        let audit = verify_compute_output(&mock, "reconcile the invoice totals", answer, "invoice_reconciliation").await;
        assert!(audit.has_errors);
        assert!(audit.correction_prompt.contains("Recompute the total"));
        assert!(audit.correction_prompt.contains("sum of line items"));
    }

    #[tokio::test]
    async fn test_reflection_improvement_cycle() {
        let mock = MockLlm::with_responses(&[r#"{
            "score": 0.4,
            "complete": false,
            "missing": ["amount", "decision"],
            "improve_prompt": "State the approved amount and the decision."
        }"#]);
        let reflection = reflect_on_answer(&mock, "approve the expense", "done", "expense_approval", 0).await;
        assert!(should_improve(&reflection));
        let prompt = build_improvement_prompt(&reflection, "approve the expense");
        assert!(prompt.contains("Missing: amount, decision"));
    }

    #[tokio::test]
    async fn test_good_heuristic_skips_llm() {
        let mock = MockLlm::new();
        let long_good = format!(
            "Approved. Decision: approved. Total: $4,200 across 3 invoices. {}",
            "Detailed breakdown and policy citations follow. ".repeat(18)
        );
        let reflection = reflect_on_answer(&mock, "task", &long_good, "expense_approval", 2).await;
        assert!(reflection.score >= 0.85);
        assert_eq!(mock.request_count(), 0);
    }
}
