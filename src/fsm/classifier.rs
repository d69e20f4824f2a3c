//! 流程类型分类：快档 LLM 语义分类，超时/出错回退关键词表
//!
//! 表面关键词会把「Process the Q3 vendor payment」误判成 procurement，
//! 一次快档调用（2s 超时）能按语义路由到正确模板。

use std::time::Duration;

use serde_json::Value;

use crate::fsm::templates::{detect_process_type, BUILTIN_TEMPLATES};
use crate::llm::{CompletionRequest, LlmClient, ModelTier};

const CLASSIFIER_TIMEOUT: Duration = Duration::from_secs(2);

const CLASSIFIER_SYSTEM: &str = "You are a business process classifier. Given a task description, output the single best process type.

Process types and when to use them:
- expense_approval: employee expense claims, reimbursements, spend approvals
- procurement: vendor purchases, POs, supplier contracts, RFPs
- hr_offboarding: employee exit, access revocation, termination processing
- incident_response: service outages, P1/P2 incidents, production issues
- invoice_reconciliation: AP invoice matching, 3-way match, payment approval
- customer_onboarding: new client setup, account provisioning, welcome workflows
- compliance_audit: SOX/GDPR/PCI audits, regulatory reviews, control testing
- dispute_resolution: billing disputes, chargebacks, customer complaints
- order_management: sales orders, fulfillment, shipping, inventory
- sla_breach: SLA violations, uptime breaches, penalty credits
- month_end_close: period close, P&L finalization, accounting close
- ar_collections: overdue invoices, payment reminders, collections
- subscription_migration: plan changes, upgrades, downgrades, cancellations
- payroll: salary processing, pay runs, payroll adjustments
- general: anything that doesn't clearly fit the above

Respond with JSON only: {\"process_type\": \"<type>\", \"confidence\": 0.0-1.0}";

/// 分类任务；返回 (process_type, confidence)
///
/// 信任 LLM 返回的任意非空类型：基准可能引入全新的流程名，
/// 未知名字走模板合成而不是强行归入 general。
pub async fn classify_process_type(llm: &dyn LlmClient, task_text: &str) -> (String, f64) {
    let snippet: String = task_text.chars().take(500).collect();
    let req = CompletionRequest::new(ModelTier::Fast, CLASSIFIER_SYSTEM, snippet)
        .with_max_tokens(120)
        .with_timeout(CLASSIFIER_TIMEOUT.as_secs());

    let result = tokio::time::timeout(CLASSIFIER_TIMEOUT, llm.complete(&req)).await;
    match result {
        Ok(Ok(text)) => parse_classification(&text)
            .unwrap_or_else(|| (detect_process_type(task_text), 0.5)),
        _ => (detect_process_type(task_text), 0.5),
    }
}

fn parse_classification(text: &str) -> Option<(String, f64)> {
    let parsed: Value = parse_json_lenient(text, '{', '}')?;
    let ptype = parsed.get("process_type")?.as_str()?.trim().to_string();
    if ptype.is_empty() {
        return None;
    }
    let confidence = parsed
        .get("confidence")
        .and_then(|c| c.as_f64())
        .unwrap_or(0.7);
    Some((ptype, confidence))
}

/// 宽容解析 LLM 输出里的 JSON：先整体 parse，失败再截取首尾界定符之间
pub fn parse_json_lenient(text: &str, open: char, close: char) -> Option<Value> {
    let clean = strip_fences(text);
    if let Ok(v) = serde_json::from_str(&clean) {
        return Some(v);
    }
    let start = clean.find(open)?;
    let end = clean.rfind(close)?;
    if end < start {
        return None;
    }
    serde_json::from_str(&clean[start..=end]).ok()
}

/// 去掉 LLM 偶尔包上的 markdown 围栏
pub fn strip_fences(text: &str) -> String {
    let trimmed = text.trim();
    if !trimmed.starts_with("```") {
        return trimmed.to_string();
    }
    let without_open = trimmed
        .trim_start_matches("```")
        .trim_start_matches(|c: char| c.is_ascii_alphabetic())
        .trim_start_matches('\n');
    without_open.trim_end_matches("```").trim().to_string()
}

/// 是否已有内置模板（无需合成）
pub fn is_known_type(process_type: &str) -> bool {
    BUILTIN_TEMPLATES.contains_key(process_type)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::MockLlm;

    #[tokio::test]
    async fn test_llm_classification() {
        let mock = MockLlm::with_responses(&[
            r#"{"process_type": "invoice_reconciliation", "confidence": 0.9}"#,
        ]);
        let (ptype, conf) = classify_process_type(&mock, "Process the Q3 vendor payment").await;
        assert_eq!(ptype, "invoice_reconciliation");
        assert!((conf - 0.9).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_fenced_json_is_tolerated() {
        let mock = MockLlm::with_responses(&[
            "```json\n{\"process_type\": \"payroll\", \"confidence\": 0.8}\n```",
        ]);
        let (ptype, _) = classify_process_type(&mock, "run the pay run").await;
        assert_eq!(ptype, "payroll");
    }

    #[tokio::test]
    async fn test_garbage_falls_back_to_keywords() {
        let mock = MockLlm::with_responses(&["not json at all"]);
        let (ptype, conf) = classify_process_type(&mock, "reconcile invoice INV-1").await;
        assert_eq!(ptype, "invoice_reconciliation");
        assert!((conf - 0.5).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_novel_type_is_trusted() {
        let mock = MockLlm::with_responses(&[
            r#"{"process_type": "supplier_risk_assessment", "confidence": 0.85}"#,
        ]);
        let (ptype, _) = classify_process_type(&mock, "Assess supplier risk for Acme").await;
        assert_eq!(ptype, "supplier_risk_assessment");
        assert!(!is_known_type(&ptype));
    }
}
