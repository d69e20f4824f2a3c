//! 上下文腐化修剪：在 RL primer 注入前过滤案例日志
//!
//! 旧的低质量条目会把过期套路带进 PRIME prompt。修剪规则：
//! 低质量失败、超过 72 小时、重复失败簇（≥3 条失败且关键词集合
//! Jaccard 重叠 ≥ 0.5，按词集而非字符 n-gram 计）。保守护栏：
//! 修剪超过 70% 时退回保留质量较高的一半。

use crate::memory::case_log::CaseEntry;

const MIN_QUALITY: f64 = 0.35;
const MAX_AGE_HOURS: f64 = 72.0;
const MIN_KEEP: usize = 3;
const MAX_PRUNE_FRACTION: f64 = 0.7;
const KEYWORD_OVERLAP_THRESHOLD: f64 = 0.5;

/// 两个关键词集合的 Jaccard 重叠
fn keyword_overlap(a: &[String], b: &[String]) -> f64 {
    if a.is_empty() || b.is_empty() {
        return 0.0;
    }
    let set_a: std::collections::HashSet<&str> = a.iter().map(|s| s.as_str()).collect();
    let set_b: std::collections::HashSet<&str> = b.iter().map(|s| s.as_str()).collect();
    let intersection = set_a.intersection(&set_b).count();
    let union = set_a.union(&set_b).count();
    intersection as f64 / union as f64
}

/// 该失败条目是否属于重复失败簇（本条 + 另外 ≥2 条相似失败）
fn is_repeated_failure(entry: &CaseEntry, all: &[CaseEntry]) -> bool {
    if entry.outcome != "failure" {
        return false;
    }
    let similar = all
        .iter()
        .filter(|e| {
            e.case_id != entry.case_id
                && e.outcome == "failure"
                && keyword_overlap(&entry.keywords, &e.keywords) >= KEYWORD_OVERLAP_THRESHOLD
        })
        .count();
    similar >= 2
}

/// 修剪案例日志；now 为当前 epoch 秒
pub fn prune_case_log(cases: &[CaseEntry], now: f64) -> Vec<CaseEntry> {
    if cases.len() <= MIN_KEEP {
        return cases.to_vec();
    }

    let max_age_secs = MAX_AGE_HOURS * 3600.0;
    let kept: Vec<CaseEntry> = cases
        .iter()
        .filter(|e| !(e.quality < MIN_QUALITY && e.outcome == "failure"))
        .filter(|e| now - e.timestamp <= max_age_secs)
        .filter(|e| !is_repeated_failure(e, cases))
        .cloned()
        .collect();

    if kept.len() < MIN_KEEP {
        return cases[cases.len() - MIN_KEEP..].to_vec();
    }

    let prune_fraction = 1.0 - kept.len() as f64 / cases.len() as f64;
    if prune_fraction > MAX_PRUNE_FRACTION {
        // 软回退：保留质量较高的一半
        let mut by_quality = cases.to_vec();
        by_quality.sort_by(|a, b| b.quality.partial_cmp(&a.quality).unwrap());
        by_quality.truncate(MIN_KEEP.max(cases.len() / 2));
        return by_quality;
    }

    kept
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(id: &str, outcome: &str, quality: f64, age_hours: f64, keywords: &[&str]) -> CaseEntry {
        CaseEntry {
            case_id: id.into(),
            task_summary: format!("task {}", id),
            keywords: keywords.iter().map(|s| s.to_string()).collect(),
            outcome: outcome.into(),
            quality,
            what_worked: String::new(),
            what_failed: String::new(),
            tool_count: 1,
            domain: "general".into(),
            timestamp: 1_000_000.0 - age_hours * 3600.0,
        }
    }

    const NOW: f64 = 1_000_000.0;

    #[test]
    fn test_low_quality_failures_dropped() {
        let cases = vec![
            entry("a", "failure", 0.1, 1.0, &["invoice"]),
            entry("b", "success", 0.8, 1.0, &["invoice"]),
            entry("c", "success", 0.7, 1.0, &["order"]),
            entry("d", "success", 0.9, 1.0, &["payroll"]),
        ];
        let pruned = prune_case_log(&cases, NOW);
        assert!(!pruned.iter().any(|e| e.case_id == "a"));
        assert_eq!(pruned.len(), 3);
    }

    #[test]
    fn test_stale_entries_dropped() {
        let cases = vec![
            entry("old", "success", 0.9, 100.0, &["invoice"]),
            entry("b", "success", 0.8, 1.0, &["invoice"]),
            entry("c", "success", 0.7, 1.0, &["order"]),
            entry("d", "success", 0.9, 1.0, &["payroll"]),
        ];
        let pruned = prune_case_log(&cases, NOW);
        assert!(!pruned.iter().any(|e| e.case_id == "old"));
    }

    #[test]
    fn test_repeated_failure_cluster_dropped() {
        let cases = vec![
            entry("f1", "failure", 0.5, 1.0, &["vendor", "invoice", "match"]),
            entry("f2", "failure", 0.5, 1.0, &["vendor", "invoice", "match"]),
            entry("f3", "failure", 0.5, 1.0, &["vendor", "invoice", "match"]),
            entry("ok1", "success", 0.8, 1.0, &["payroll"]),
            entry("ok2", "success", 0.8, 1.0, &["order"]),
            entry("ok3", "success", 0.8, 1.0, &["audit"]),
        ];
        let pruned = prune_case_log(&cases, NOW);
        assert!(!pruned.iter().any(|e| e.outcome == "failure"));
        assert_eq!(pruned.len(), 3);
    }

    #[test]
    fn test_conservative_guard_keeps_better_half() {
        // 全部条目都会被规则剪掉：护栏退回质量较高的一半
        let cases: Vec<CaseEntry> = (0..10)
            .map(|i| entry(&format!("e{}", i), "failure", 0.1 + i as f64 * 0.01, 1.0, &["x"]))
            .collect();
        let pruned = prune_case_log(&cases, NOW);
        assert_eq!(pruned.len(), 5);
        assert!(pruned.iter().all(|e| e.quality >= 0.14));
    }

    #[test]
    fn test_tiny_logs_untouched() {
        let cases = vec![entry("a", "failure", 0.1, 100.0, &["x"])];
        assert_eq!(prune_case_log(&cases, NOW).len(), 1);
    }
}
