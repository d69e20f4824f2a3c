//! RL 案例日志：任务结局记录、质量评分与 PRIME primer
//!
//! 两层学习：案例日志按关键词重叠注入最相似的 3 条历史模式；
//! 质量分衡量答案完整度、工具使用与策略合规。上限 200 条 FIFO，
//! 每次 REFLECT 后落盘 case_log.json。

use serde::{Deserialize, Serialize};

use crate::exec::output::is_bracket_format;
use crate::memory::pruner::prune_case_log;
use crate::memory::store::JsonStore;

pub const MAX_CASES: usize = 200;
const RELEVANT_CASES: usize = 3;

/// 单条案例记录
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaseEntry {
    pub case_id: String,
    pub task_summary: String,
    pub keywords: Vec<String>,
    /// "success" | "partial" | "failure"
    pub outcome: String,
    pub quality: f64,
    pub what_worked: String,
    pub what_failed: String,
    pub tool_count: usize,
    pub domain: String,
    /// epoch 秒
    pub timestamp: f64,
}

const STOP_WORDS: [&str; 42] = [
    "the", "a", "an", "is", "are", "was", "were", "be", "been", "have", "has", "had", "do",
    "does", "did", "will", "would", "could", "should", "can", "for", "in", "on", "at", "to",
    "of", "and", "or", "but", "with", "from", "this", "that", "it", "i", "you", "please",
    "need", "want", "help", "task", "make",
];

/// 提取任务关键词：去停用词、去重、保序，最多 15 个
pub fn extract_keywords(text: &str) -> Vec<String> {
    let mut seen = std::collections::HashSet::new();
    let mut out = Vec::new();
    for word in text.to_lowercase().split_whitespace() {
        let w = word.trim_matches(|c: char| !c.is_alphanumeric());
        if w.len() > 3 && !STOP_WORDS.contains(&w) && seen.insert(w.to_string()) {
            out.push(w.to_string());
            if out.len() >= 15 {
                break;
            }
        }
    }
    out
}

/// 质量分：0.35·answer + 0.35·tool + 0.30·policy
///
/// answer 分按任务复杂度调整长度窗口并奖励决定/完成标记；
/// bracket 格式（exact-match 目标）answer 分恒为 1.0，不吃长度窗口；
/// tool 分奖励少而准的调用；policy 分：通过 1.0 / 未提供 0.5 / 违规 0.0。
pub fn score_quality(answer: &str, tool_count: usize, policy_passed: Option<bool>) -> f64 {
    score_quality_for(answer, "", tool_count, policy_passed)
}

pub fn score_quality_for(
    answer: &str,
    task_text: &str,
    tool_count: usize,
    policy_passed: Option<bool>,
) -> f64 {
    let a = answer_score(answer, task_text);
    let t = tool_score(tool_count);
    let p = match policy_passed {
        Some(true) => 1.0,
        Some(false) => 0.0,
        None => 0.5,
    };
    let quality = 0.35 * a + 0.35 * t + 0.30 * p;
    (quality.clamp(0.0, 1.0) * 1000.0).round() / 1000.0
}

fn answer_score(answer: &str, task_text: &str) -> f64 {
    let stripped = answer.trim();
    if is_bracket_format(stripped) {
        return 1.0;
    }

    let length = stripped.len() as f64;
    let lower = stripped.to_lowercase();

    // 窗口随任务复杂度走：长任务期望长答案
    let (lo, hi) = if task_text.len() > 400 {
        (200.0, 2400.0)
    } else {
        (80.0, 1200.0)
    };
    let mut score = if length < lo {
        0.9 * length / lo
    } else if length <= hi {
        0.9
    } else {
        0.9 * hi / length
    };

    if ["approved", "rejected", "completed", "decision:", "total:"]
        .iter()
        .any(|m| lower.contains(m))
    {
        score += 0.1;
    }

    // 空数据数组是强失败信号
    if empty_array_field(stripped, "data") {
        score -= 0.3;
    }
    if empty_array_field(stripped, "results") {
        score -= 0.2;
    }

    let error_phrases = [
        "task failed",
        "unable to",
        "cannot access",
        "no data found",
        "token budget exhausted",
        "tool unavailable",
    ];
    if error_phrases.iter().any(|p| lower.contains(p)) {
        score -= 0.4;
    }

    score.clamp(0.0, 1.0)
}

/// 调用越少越高（效率），但 0 次通常意味着没取数
fn tool_score(tool_count: usize) -> f64 {
    match tool_count {
        0 => 0.3,
        1..=3 => 1.0,
        4..=6 => 0.8,
        7..=10 => 0.6,
        _ => 0.4,
    }
}

fn empty_array_field(text: &str, field: &str) -> bool {
    use std::sync::LazyLock;
    static DATA_RE: LazyLock<regex::Regex> =
        LazyLock::new(|| regex::Regex::new(r#""data"\s*:\s*\[\s*\]"#).unwrap());
    static RESULTS_RE: LazyLock<regex::Regex> =
        LazyLock::new(|| regex::Regex::new(r#""results"\s*:\s*\[\s*\]"#).unwrap());
    match field {
        "data" => DATA_RE.is_match(text),
        "results" => RESULTS_RE.is_match(text),
        _ => false,
    }
}

/// 纯字符串分析抽取成功/失败模式（零 API 成本）
fn extract_pattern(answer: &str, tool_count: usize, success: bool) -> String {
    let lower = answer.to_lowercase();
    let mut parts = Vec::new();
    if success {
        if tool_count > 0 {
            parts.push(format!("Used {} tool calls", tool_count));
        }
        for marker in ["approved", "rejected", "completed", "resolved"] {
            if lower.contains(marker) {
                parts.push(format!("Outcome: {}", marker));
                break;
            }
        }
        if parts.is_empty() {
            parts.push("Completed successfully".to_string());
        }
    } else {
        let patterns = [
            ("no data found", "No data found in tool response"),
            ("unable to", "Unable to complete action"),
            ("cannot access", "Tool access failure"),
            ("token budget", "Token budget exhausted"),
            ("tool unavailable", "Required tool unavailable"),
            ("timed out", "Timeout during execution"),
        ];
        for (needle, label) in patterns {
            if lower.contains(needle) {
                parts.push(label.to_string());
                break;
            }
        }
        if answer.trim().len() < 100 {
            parts.push("Answer too short — likely incomplete".to_string());
        }
        if parts.is_empty() {
            parts.push("Task incomplete or low quality".to_string());
        }
    }
    parts.join(". ")
}

/// 案例日志：内存副本 + JsonStore 落盘
pub struct CaseLog {
    store: JsonStore,
    lock: std::sync::Mutex<()>,
}

impl CaseLog {
    pub fn new(store: JsonStore) -> Self {
        Self {
            store,
            lock: std::sync::Mutex::new(()),
        }
    }

    fn now() -> f64 {
        chrono::Utc::now().timestamp_millis() as f64 / 1000.0
    }

    pub fn load(&self) -> Vec<CaseEntry> {
        self.store.load_or_default()
    }

    /// 记录任务结局，返回质量分
    pub fn record_outcome(
        &self,
        task_text: &str,
        answer: &str,
        tool_count: usize,
        policy_passed: Option<bool>,
        error: Option<&str>,
        domain: &str,
    ) -> f64 {
        let _guard = self.lock.lock().unwrap();
        let quality = score_quality_for(answer, task_text, tool_count, policy_passed);
        let outcome = if quality >= 0.6 {
            "success"
        } else if error.is_some() {
            "failure"
        } else {
            "partial"
        };

        let (what_worked, what_failed) = if outcome == "success" {
            let mut worked = extract_pattern(answer, tool_count, true);
            if policy_passed == Some(true) {
                worked.push_str(". Policy enforced correctly");
            }
            (worked, String::new())
        } else {
            let failed = error
                .map(|e| e.to_string())
                .unwrap_or_else(|| extract_pattern(answer, tool_count, false));
            (String::new(), failed)
        };

        let summary: String = task_text.chars().take(120).collect();
        let entry = CaseEntry {
            case_id: uuid::Uuid::new_v4().to_string()[..8].to_string(),
            task_summary: summary,
            keywords: extract_keywords(task_text),
            outcome: outcome.to_string(),
            quality,
            what_worked,
            what_failed,
            tool_count,
            domain: domain.to_string(),
            timestamp: Self::now(),
        };

        let mut cases = self.load();
        cases.push(entry);
        if cases.len() > MAX_CASES {
            let excess = cases.len() - MAX_CASES;
            cases.drain(..excess);
        }
        self.store.save(&cases);
        quality
    }

    /// 构建 RL primer：修剪后按关键词重叠取前 3 条
    pub fn build_rl_primer(&self, task_text: &str) -> String {
        let cases = prune_case_log(&self.load(), Self::now());
        let task_kw: std::collections::HashSet<String> =
            extract_keywords(task_text).into_iter().collect();

        let mut scored: Vec<(usize, &CaseEntry)> = cases
            .iter()
            .filter_map(|c| {
                let overlap = c.keywords.iter().filter(|k| task_kw.contains(*k)).count();
                (overlap > 0).then_some((overlap, c))
            })
            .collect();
        scored.sort_by(|a, b| {
            b.0.cmp(&a.0)
                .then(b.1.quality.partial_cmp(&a.1.quality).unwrap())
        });

        let relevant: Vec<&CaseEntry> = scored.iter().take(RELEVANT_CASES).map(|(_, c)| *c).collect();
        if relevant.is_empty() {
            return String::new();
        }

        let mut lines =
            vec!["## LEARNED PATTERNS (from similar past tasks — apply these)".to_string()];
        for c in relevant {
            let summary: String = c.task_summary.chars().take(80).collect();
            lines.push(format!(
                "\nPast pattern: \"{}\" → {} (quality {:.2})",
                summary, c.outcome, c.quality
            ));
            if !c.what_worked.is_empty() {
                lines.push(format!("   Worked: {}", c.what_worked));
            }
            if !c.what_failed.is_empty() {
                lines.push(format!("   Avoid: {}", c.what_failed));
            }
        }
        lines.push(String::new());
        lines.join("\n")
    }

    pub fn stats(&self) -> serde_json::Value {
        let cases = self.load();
        let successes = cases.iter().filter(|c| c.outcome == "success").count();
        let failures = cases.iter().filter(|c| c.outcome == "failure").count();
        let avg = if cases.is_empty() {
            0.0
        } else {
            cases.iter().map(|c| c.quality).sum::<f64>() / cases.len() as f64
        };
        serde_json::json!({
            "total": cases.len(),
            "successes": successes,
            "failures": failures,
            "avg_quality": (avg * 1000.0).round() / 1000.0,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn case_log(dir: &TempDir) -> CaseLog {
        CaseLog::new(JsonStore::new(dir.path().join("case_log.json")))
    }

    #[test]
    fn test_quality_rewards_bracket_format() {
        let short_prose = score_quality("ok", 1, None);
        let bracket = score_quality(r#"["INV-001"]"#, 1, None);
        assert!(bracket > short_prose);
        // bracket answer 分恒为 1.0：0.35 + 0.35 + 0.30
        assert!((score_quality(r#"["INV-001"]"#, 1, Some(true)) - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_quality_weighted_components() {
        // 纯 policy 分差：同答案同工具，passed vs violated 差 0.30
        let answer = "Approved. Decision recorded with full detail and totals for every line item in the claim.";
        let passed = score_quality(answer, 2, Some(true));
        let violated = score_quality(answer, 2, Some(false));
        assert!((passed - violated - 0.30).abs() < 1e-9);
        // 工具效率：3 次优于 12 次
        assert!(score_quality(answer, 3, None) > score_quality(answer, 12, None));
    }

    #[test]
    fn test_quality_penalizes_empty_data() {
        let with_empty = score_quality(r#"Done. {"data": []}"#, 2, Some(true));
        let without = score_quality("Done. Processed 4 records and approved the claim.", 2, Some(true));
        assert!(with_empty < without);
    }

    #[test]
    fn test_record_and_cap() {
        let dir = TempDir::new().unwrap();
        let log = case_log(&dir);
        for i in 0..(MAX_CASES + 20) {
            log.record_outcome(
                &format!("approve expense claim number {}", i),
                "Approved. Decision: approved, total: $120.",
                2,
                Some(true),
                None,
                "expense_approval",
            );
        }
        let cases = log.load();
        assert_eq!(cases.len(), MAX_CASES);
        // FIFO：留下的是最新的
        assert!(cases.last().unwrap().task_summary.contains("219"));
        // 时间戳单调不减
        assert!(cases.windows(2).all(|w| w[0].timestamp <= w[1].timestamp));
    }

    #[test]
    fn test_primer_picks_overlapping_cases() {
        let dir = TempDir::new().unwrap();
        let log = case_log(&dir);
        log.record_outcome(
            "reconcile invoice INV-1 against purchase order",
            "Matched and approved. Variance 1.2% within threshold.",
            3,
            Some(true),
            None,
            "invoice_reconciliation",
        );
        log.record_outcome(
            "schedule the quarterly payroll run",
            "Completed pay run for 42 employees, total: $184,000.",
            4,
            Some(true),
            None,
            "payroll",
        );
        let primer = log.build_rl_primer("reconcile invoice INV-9 against its purchase order");
        assert!(primer.contains("LEARNED PATTERNS"));
        assert!(primer.contains("reconcile invoice INV-1"));
        assert!(!primer.contains("payroll run"));
    }

    #[test]
    fn test_primer_empty_without_overlap() {
        let dir = TempDir::new().unwrap();
        let log = case_log(&dir);
        assert_eq!(log.build_rl_primer("anything"), "");
    }

    #[test]
    fn test_keywords_skip_stop_words() {
        let kw = extract_keywords("Please help approve the invoice for Acme Corp");
        assert!(kw.contains(&"approve".to_string()));
        assert!(kw.contains(&"invoice".to_string()));
        assert!(!kw.contains(&"the".to_string()));
        assert!(!kw.contains(&"please".to_string()));
    }
}
