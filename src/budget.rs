//! 每任务 Token 预算与按状态选模型
//!
//! 40K 字符预算（4 字符 ≈ 1 token，对应 10K token 目标）。
//! 规则：用量 >80% 一律快档；≥100% 返回 Skip 跳过后续 LLM 调用；
//! MUTATE 永远强档；COMPUTE 仅当任务文本含分析关键词时强档。

use std::collections::HashMap;

use crate::fsm::FsmState;
use crate::llm::ModelTier;

pub const TASK_BUDGET_TOKENS: usize = 10_000;
pub const CHARS_PER_TOKEN: usize = 4;
const FAST_THRESHOLD: f64 = 0.80;
const HARD_LIMIT: f64 = 1.0;

/// 出现任一关键词时 COMPUTE 状态才值得上强档
const COMPLEX_KEYWORDS: [&str; 9] = [
    "reconcile",
    "root cause",
    "diagnose",
    "forecast",
    "synthesise",
    "synthesize",
    "cross-reference",
    "correlate",
    "investigate",
];

/// 任务内 token 预算：按阶段记账，驱动模型选择与 max_tokens 上限
#[derive(Debug)]
pub struct TokenBudget {
    budget: usize,
    used: usize,
    by_phase: HashMap<String, usize>,
}

impl TokenBudget {
    pub fn new() -> Self {
        Self::with_budget(TASK_BUDGET_TOKENS)
    }

    pub fn with_budget(budget: usize) -> Self {
        Self {
            budget,
            used: 0,
            by_phase: HashMap::new(),
        }
    }

    /// 记账：按 4 字符 1 token 估算，至少记 1
    pub fn record(&mut self, text: &str, phase: &str) -> usize {
        let tokens = (text.len() / CHARS_PER_TOKEN).max(1);
        self.used += tokens;
        *self.by_phase.entry(phase.to_string()).or_insert(0) += tokens;
        tokens
    }

    pub fn remaining(&self) -> usize {
        self.budget.saturating_sub(self.used)
    }

    pub fn usage_ratio(&self) -> f64 {
        self.used as f64 / self.budget as f64
    }

    /// 预算耗尽，跳过剩余 LLM 调用
    pub fn should_skip_llm(&self) -> bool {
        self.usage_ratio() >= HARD_LIMIT
    }

    /// 按 FSM 状态与任务文本选择模型档位
    pub fn model_for(&self, state: FsmState, task_text: &str) -> ModelTier {
        if self.should_skip_llm() {
            return ModelTier::Skip;
        }
        if self.usage_ratio() > FAST_THRESHOLD {
            return ModelTier::Fast;
        }
        match state {
            FsmState::Mutate => ModelTier::Strong,
            FsmState::Compute => {
                let text = task_text.to_lowercase();
                if COMPLEX_KEYWORDS.iter().any(|kw| text.contains(kw)) {
                    ModelTier::Strong
                } else {
                    ModelTier::Fast
                }
            }
            _ => ModelTier::Fast,
        }
    }

    /// API max_tokens 上限，随剩余预算收紧
    pub fn max_tokens_cap(&self, state: FsmState) -> u32 {
        let r = self.remaining();
        if r < 500 {
            return 256;
        }
        if r < 2000 {
            return 512;
        }
        let active = matches!(
            state,
            FsmState::Decompose
                | FsmState::Assess
                | FsmState::Compute
                | FsmState::Mutate
                | FsmState::ScheduleNotify
        );
        if active {
            (4096).min(r as u32 / 2)
        } else {
            (1024).min(r as u32 / 3)
        }
    }

    /// 把 prompt 区块截断到剩余预算内
    pub fn cap_prompt(&self, text: &str) -> String {
        let max_chars = self.remaining() * CHARS_PER_TOKEN;
        if text.len() <= max_chars {
            return text.to_string();
        }
        let mut cut = max_chars;
        while cut > 0 && !text.is_char_boundary(cut) {
            cut -= 1;
        }
        format!(
            "{}\n[truncated: {} tokens remaining]",
            &text[..cut],
            self.remaining()
        )
    }

    /// system prompt 尾注：预算越紧要求越苛刻
    pub fn efficiency_hint(&self) -> &'static str {
        let pct = self.usage_ratio();
        if pct < 0.3 {
            "\nBe concise."
        } else if pct < 0.6 {
            "\nBe very concise. One tool call per data need."
        } else if pct < 0.80 {
            "\nCRITICAL: Token budget low. Shortest complete answer only."
        } else {
            "\nEMERGENCY: Budget nearly exhausted. One sentence answer max."
        }
    }

    pub fn report(&self) -> serde_json::Value {
        serde_json::json!({
            "budget": self.budget,
            "used": self.used,
            "remaining": self.remaining(),
            "pct": (self.usage_ratio() * 1000.0).round() / 1000.0,
            "by_phase": self.by_phase,
        })
    }
}

impl Default for TokenBudget {
    fn default() -> Self {
        Self::new()
    }
}

/// 答案元信息：质量分、策略结果、耗时，用于尾注
#[derive(Debug, Clone)]
pub struct AnswerMeta {
    pub process_type: String,
    pub quality: f64,
    pub duration_ms: u64,
    pub policy_passed: Option<bool>,
}

/// 给最终答案追加元信息尾注
///
/// bracket 格式答案是 exact-match 目标，绝不追加尾注（会破坏字符串比对）。
pub fn format_final_answer(answer: &str, meta: &AnswerMeta) -> String {
    let trimmed = answer.trim();
    if crate::exec::output::is_bracket_format(trimmed) {
        return trimmed.to_string();
    }

    let policy = match meta.policy_passed {
        Some(true) => "PASSED",
        Some(false) => "FAILED",
        None => "N/A",
    };
    format!(
        "{}\n\n---\nProcess: {}\nPolicy: {}\nQuality: {:.2}\nDuration: {}ms",
        trimmed,
        title_case(&meta.process_type),
        policy,
        meta.quality,
        meta.duration_ms
    )
}

/// snake_case 转 Title Case（expense_approval → Expense Approval）
pub fn title_case(s: &str) -> String {
    s.split('_')
        .filter(|w| !w.is_empty())
        .map(|w| {
            let mut chars = w.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().collect::<String>() + chars.as_str(),
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_and_ratio() {
        let mut b = TokenBudget::with_budget(100);
        b.record(&"x".repeat(200), "prime");
        assert_eq!(b.remaining(), 50);
        assert!((b.usage_ratio() - 0.5).abs() < 1e-9);
    }

    #[test]
    fn test_mutate_always_strong() {
        let b = TokenBudget::new();
        assert_eq!(b.model_for(FsmState::Mutate, "change the shirt"), ModelTier::Strong);
    }

    #[test]
    fn test_compute_needs_analytical_keyword() {
        let b = TokenBudget::new();
        assert_eq!(b.model_for(FsmState::Compute, "sum these invoices"), ModelTier::Fast);
        assert_eq!(
            b.model_for(FsmState::Compute, "reconcile the ledger against the statement"),
            ModelTier::Strong
        );
    }

    #[test]
    fn test_fast_override_above_80pct() {
        let mut b = TokenBudget::with_budget(100);
        b.record(&"x".repeat(4 * 85), "exec");
        assert_eq!(b.model_for(FsmState::Mutate, "reconcile"), ModelTier::Fast);
    }

    #[test]
    fn test_skip_at_hard_limit() {
        let mut b = TokenBudget::with_budget(10);
        b.record(&"x".repeat(400), "exec");
        assert!(b.should_skip_llm());
        assert_eq!(b.model_for(FsmState::Assess, ""), ModelTier::Skip);
    }

    #[test]
    fn test_max_tokens_tightens() {
        let mut b = TokenBudget::with_budget(10_000);
        assert_eq!(b.max_tokens_cap(FsmState::Compute), 4096);
        b.record(&"x".repeat(4 * 9700), "exec");
        assert_eq!(b.max_tokens_cap(FsmState::Compute), 256);
    }

    #[test]
    fn test_footer_format() {
        let meta = AnswerMeta {
            process_type: "expense_approval".into(),
            quality: 0.82,
            duration_ms: 1234,
            policy_passed: Some(false),
        };
        let out = format_final_answer("Rejected due to variance.", &meta);
        assert!(out.contains("---\nProcess: Expense Approval"));
        assert!(out.contains("Policy: FAILED"));
        assert!(out.contains("Quality: 0.82"));
        assert!(out.contains("Duration: 1234ms"));
    }

    #[test]
    fn test_footer_skipped_for_bracket_answers() {
        let meta = AnswerMeta {
            process_type: "general".into(),
            quality: 1.0,
            duration_ms: 5,
            policy_passed: None,
        };
        let out = format_final_answer(r#"["INV-001", "INV-002"]"#, &meta);
        assert_eq!(out, r#"["INV-001", "INV-002"]"#);
    }

    #[test]
    fn test_footer_idempotent() {
        let meta = AnswerMeta {
            process_type: "general".into(),
            quality: 0.5,
            duration_ms: 10,
            policy_passed: None,
        };
        let once = format_final_answer("answer", &meta);
        // 尾注之前的正文不变：再格式化裸正文得到同一结果
        let again = format_final_answer("answer", &meta);
        assert_eq!(once, again);
    }

    #[test]
    fn test_cap_prompt_truncates() {
        let mut b = TokenBudget::with_budget(10);
        b.record(&"x".repeat(36), "p");
        let capped = b.cap_prompt(&"y".repeat(100));
        assert!(capped.contains("[truncated:"));
        assert!(capped.len() < 100);
    }
}
