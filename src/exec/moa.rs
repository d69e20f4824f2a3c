//! Mixture-of-Agents 合成：零额外基础设施的双采样一致性
//!
//! 同一任务并行跑两次快档（top_p 0.85 保守 / 0.99 发散），
//! 去停用词后的词集 Jaccard ≥ 0.70 视为一致取较长者；
//! 分歧则一次强档合成。数值版仅用于带工具结果的任务，
//! 且替换前过护栏（不短于原答案的 0.8、结尾不是反问、不碰 bracket）。

use std::collections::HashSet;
use std::sync::LazyLock;

use crate::exec::output::is_bracket_format;
use crate::llm::{CompletionRequest, LlmClient, ModelTier};

const OVERLAP_HIGH: f64 = 0.70;
const DUAL_TIMEOUT_EACH_SECS: u64 = 12;
const SYNTH_TIMEOUT_SECS: u64 = 15;

static STOP_WORDS: LazyLock<HashSet<&'static str>> = LazyLock::new(|| {
    "the a an and or but is are was were be been being have has had do does did \
     will would could should may might shall to of in on at by for with from as \
     it its this that these those i we you he she they me us him her them my our \
     your his their what which who whom when where why how all any some"
        .split_whitespace()
        .collect()
});

fn word_set(text: &str) -> HashSet<String> {
    text.to_lowercase()
        .split_whitespace()
        .filter(|w| w.chars().all(|c| c.is_alphabetic()))
        .filter(|w| !STOP_WORDS.contains(w))
        .map(String::from)
        .collect()
}

/// 词集 Jaccard 重叠，[0, 1]
pub fn compute_overlap(a: &str, b: &str) -> f64 {
    let set_a = word_set(a);
    let set_b = word_set(b);
    if set_a.is_empty() || set_b.is_empty() {
        return 0.0;
    }
    let intersection = set_a.intersection(&set_b).count();
    let union = set_a.union(&set_b).count();
    intersection as f64 / union as f64
}

fn best_of_two(a: String, b: String) -> String {
    if a.len() >= b.len() {
        a
    } else {
        b
    }
}

async fn sample(
    llm: &dyn LlmClient,
    system: &str,
    user: &str,
    top_p: f64,
) -> Option<String> {
    let req = CompletionRequest::new(ModelTier::Fast, system, user)
        .with_max_tokens(1024)
        .with_top_p(top_p)
        .with_timeout(DUAL_TIMEOUT_EACH_SECS);
    match tokio::time::timeout(
        std::time::Duration::from_secs(DUAL_TIMEOUT_EACH_SECS),
        llm.complete(&req),
    )
    .await
    {
        Ok(Ok(text)) if !text.trim().is_empty() => Some(text),
        _ => None,
    }
}

/// 双采样 + 一致性检查 + 必要时合成；返回 (answer, consensus)
pub async fn dual_sample_synthesize(
    llm: &dyn LlmClient,
    task_text: &str,
    system_context: &str,
) -> (String, f64) {
    let (conservative, exploratory) = tokio::join!(
        sample(llm, system_context, task_text, 0.85),
        sample(llm, system_context, task_text, 0.99),
    );

    let (a, b) = match (conservative, exploratory) {
        (Some(a), Some(b)) => (a, b),
        (Some(a), None) => return (a, 0.5),
        (None, Some(b)) => return (b, 0.5),
        (None, None) => return (String::new(), 0.0),
    };

    let overlap = compute_overlap(&a, &b);
    if overlap >= OVERLAP_HIGH {
        return (best_of_two(a, b), overlap);
    }

    // 分歧：一次强档合成
    let req = CompletionRequest::new(
        ModelTier::Strong,
        "You are a synthesis engine. You have received two independent answers to the same task. \
         Produce a single best answer by taking the most accurate, complete, and useful elements \
         from both. Do not say 'Answer A says' — output the synthesized answer directly.",
        format!(
            "TASK:\n{}\n\nANSWER A (conservative):\n{}\n\nANSWER B (exploratory):\n{}\n\n\
             Synthesize the best answer:",
            task_text, a, b
        ),
    )
    .with_max_tokens(1024)
    .with_timeout(SYNTH_TIMEOUT_SECS);

    match tokio::time::timeout(
        std::time::Duration::from_secs(SYNTH_TIMEOUT_SECS),
        llm.complete(&req),
    )
    .await
    {
        Ok(Ok(synthesized)) if !synthesized.trim().is_empty() => (synthesized, overlap),
        _ => (best_of_two(a, b), overlap),
    }
}

static FIRST_DOLLAR_RE: LazyLock<regex::Regex> =
    LazyLock::new(|| regex::Regex::new(r"\$\s*([0-9,]+(?:\.\d{1,2})?)").unwrap());

/// 文本里的第一笔美元金额
pub fn first_dollar_amount(text: &str) -> Option<f64> {
    FIRST_DOLLAR_RE
        .captures(text)
        .and_then(|c| c[1].replace(',', "").parse().ok())
}

/// 替换护栏：不许变短太多、结尾不是反问、不碰 bracket 答案
pub fn replacement_ok(candidate: &str, current: &str, min_len_ratio: f64) -> bool {
    if candidate.trim().is_empty() {
        return false;
    }
    if is_bracket_format(current) || is_bracket_format(candidate) {
        return false;
    }
    if (candidate.len() as f64) < current.len() as f64 * min_len_ratio {
        return false;
    }
    let tail: String = candidate.chars().rev().take(100).collect();
    !tail.contains('?')
}

/// 数值 MoA：带工具结果任务的「verify / challenge」双视角核对
///
/// 返回 Some(better) 仅当合成结果通过替换护栏；否则 None 保留原答案。
pub async fn numeric_moa(
    llm: &dyn LlmClient,
    task_text: &str,
    initial_answer: &str,
    system_context: &str,
) -> Option<String> {
    let verify_user = format!(
        "TASK:\n{}\n\nDRAFT ANSWER:\n{}\n\n\
         Verify every number in the draft against the task. \
         Return the final corrected answer (not a critique).",
        task_text, initial_answer
    );
    let challenge_user = format!(
        "TASK:\n{}\n\nDRAFT ANSWER:\n{}\n\n\
         Independently recompute the key figures and challenge the draft. \
         Return your own complete final answer.",
        task_text, initial_answer
    );

    let (verify, challenge) = tokio::join!(
        sample(llm, system_context, &verify_user, 0.85),
        sample(llm, system_context, &challenge_user, 0.99),
    );
    let (a, b) = match (verify, challenge) {
        (Some(a), Some(b)) => (a, b),
        _ => return None,
    };

    let overlap = compute_overlap(&a, &b);
    let candidate = if overlap >= OVERLAP_HIGH {
        best_of_two(a, b)
    } else {
        let req = CompletionRequest::new(
            ModelTier::Strong,
            "Two analysts produced answers with diverging figures. Reconcile them: \
             recompute the disputed numbers, pick the defensible values, and output one \
             final answer.",
            format!(
                "TASK:\n{}\n\nANSWER A:\n{}\n\nANSWER B:\n{}\n\nFinal reconciled answer:",
                task_text, a, b
            ),
        )
        .with_max_tokens(1024)
        .with_timeout(SYNTH_TIMEOUT_SECS);
        match tokio::time::timeout(
            std::time::Duration::from_secs(SYNTH_TIMEOUT_SECS),
            llm.complete(&req),
        )
        .await
        {
            Ok(Ok(s)) if !s.trim().is_empty() => s,
            _ => best_of_two(a, b),
        }
    };

    replacement_ok(&candidate, initial_answer, 0.8).then_some(candidate)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::MockLlm;

    #[test]
    fn test_overlap_identical_and_disjoint() {
        assert!((compute_overlap("approve the invoice now", "approve the invoice now") - 1.0).abs() < 1e-9);
        assert_eq!(compute_overlap("alpha beta gamma", "delta epsilon zeta"), 0.0);
    }

    #[test]
    fn test_overlap_ignores_stop_words() {
        let a = "the invoice is approved";
        let b = "invoice approved";
        assert!((compute_overlap(a, b) - 1.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_consensus_returns_longer() {
        let mock = MockLlm::with_responses(&[
            "approve invoice variance threshold",
            "approve invoice variance threshold immediately",
        ]);
        let (answer, consensus) = dual_sample_synthesize(&mock, "task", "ctx").await;
        assert!(consensus >= OVERLAP_HIGH);
        assert!(answer.contains("immediately"));
        assert_eq!(mock.request_count(), 2); // 一致时不做第三次合成
    }

    #[tokio::test]
    async fn test_divergence_triggers_synthesis() {
        let mock = MockLlm::with_responses(&[
            "alpha beta gamma delta",
            "omega sigma theta lambda",
            "synthesized final verdict",
        ]);
        let (answer, consensus) = dual_sample_synthesize(&mock, "task", "ctx").await;
        assert!(consensus < OVERLAP_HIGH);
        assert_eq!(answer, "synthesized final verdict");
        assert_eq!(mock.request_count(), 3);
    }

    #[test]
    fn test_replacement_guards() {
        assert!(!replacement_ok("short", "a much longer existing answer here", 0.8));
        assert!(!replacement_ok(
            "plausible but ends asking a question?",
            "original",
            0.0
        ));
        assert!(!replacement_ok("anything", r#"["exact"]"#, 0.0));
        assert!(replacement_ok("a good long complete answer.", "short", 0.8));
    }
}
