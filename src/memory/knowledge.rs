//! 跨任务知识库：任务完成后抽取可复用事实，后续任务 PRIME 注入
//!
//! 质量 ≥ 0.5 的任务才抽取。先走零成本的正则快路径（金额、决定、阈值、
//! 账期），再用快档 LLM 抽语义洞见；检索按关键词重叠 + 实体匹配 + 领域
//! 亲和度打分。上限 500 条，落盘 knowledge_base.json。

use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::fsm::classifier::parse_json_lenient;
use crate::llm::{CompletionRequest, LlmClient, ModelTier};
use crate::memory::case_log::extract_keywords;
use crate::memory::store::JsonStore;

const MAX_ENTRIES: usize = 500;
pub const EXTRACTION_THRESHOLD: f64 = 0.50;
const EXTRACT_TIMEOUT_SECS: u64 = 8;

/// 单条知识
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KnowledgeEntry {
    pub entry_id: String,
    pub domain: String,
    pub content: String,
    pub entities: Vec<String>,
    pub keywords: Vec<String>,
    pub confidence: f64,
    pub quality_score: f64,
    pub source_task: String,
    /// "fast-path" | "llm" | "fallback"
    pub extraction_method: String,
    pub created_at: f64,
}

static AMOUNT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\$[\d,]+(?:\.\d{2})?(?:\s*[KMB])?").unwrap());
static DECISION_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\b(approved|rejected|denied|escalated|resolved)\b").unwrap());
static THRESHOLD_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)(?:limit|threshold|cap|ceiling|up to|maximum|minimum)\s+(?:of\s+)?(\$[\d,]+(?:\.\d{2})?)").unwrap()
});
static NET_TERMS_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)net[-\s]?(\d+)").unwrap());
static ID_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\b[A-Z]{2,8}-\d+\b").unwrap());
static TITLE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b([A-Z][a-z]+(?:\s+[A-Z][a-z]+){1,3})\b").unwrap());

/// 正则实体抽取（零 API 成本），供检索匹配
fn extract_entities_regex(text: &str) -> Vec<String> {
    let mut seen = std::collections::HashSet::new();
    let mut out = Vec::new();
    for re in [&*AMOUNT_RE, &*ID_RE, &*TITLE_RE] {
        for m in re.find_iter(text) {
            let v = m.as_str().trim().to_string();
            if v.len() >= 2 && seen.insert(v.clone()) {
                out.push(v);
                if out.len() >= 15 {
                    return out;
                }
            }
        }
    }
    out
}

/// 快路径洞见：结构化事实，confidence 0.6
fn fast_path_insights(task_text: &str, answer: &str, domain: &str) -> Vec<(String, f64)> {
    let combined = format!("{} {}", task_text, answer);
    let mut insights = Vec::new();

    for m in AMOUNT_RE.find_iter(&combined).take(2) {
        insights.push((format!("In {}: amount referenced was {}", domain, m.as_str()), 0.6));
    }
    if let Some(caps) = DECISION_RE.captures(&combined) {
        insights.push((
            format!("{}: outcome was {}", domain, caps[1].to_lowercase()),
            0.6,
        ));
    }
    if let Some(caps) = THRESHOLD_RE.captures(&combined) {
        insights.push((format!("Policy threshold: {} for {}", &caps[1], domain), 0.6));
    }
    if let Some(caps) = NET_TERMS_RE.captures(&combined) {
        insights.push((
            format!("In {}: payment terms net-{} days", domain, &caps[1]),
            0.6,
        ));
    }

    insights.truncate(3);
    insights
}

/// 知识库
pub struct KnowledgeBase {
    store: JsonStore,
    lock: std::sync::Mutex<()>,
}

impl KnowledgeBase {
    pub fn new(store: JsonStore) -> Self {
        Self {
            store,
            lock: std::sync::Mutex::new(()),
        }
    }

    pub fn load(&self) -> Vec<KnowledgeEntry> {
        self.store.load_or_default()
    }

    /// 抽取并入库；返回新增条数。质量低于阈值直接跳过。
    pub async fn extract_and_store(
        &self,
        llm: &dyn LlmClient,
        task_text: &str,
        answer: &str,
        domain: &str,
        quality: f64,
    ) -> usize {
        if quality < EXTRACTION_THRESHOLD || task_text.is_empty() || answer.is_empty() {
            return 0;
        }

        let mut insights: Vec<(String, f64, &str)> = fast_path_insights(task_text, answer, domain)
            .into_iter()
            .map(|(c, conf)| (c, conf, "fast-path"))
            .collect();

        for (content, conf) in self.llm_insights(llm, task_text, answer, domain).await {
            insights.push((content, conf, "llm"));
        }

        if insights.is_empty() && answer.len() > 100 {
            let snippet: String = answer.chars().take(120).collect();
            insights.push((snippet.replace('\n', " "), 0.55, "fallback"));
        }
        if insights.is_empty() {
            return 0;
        }

        let _guard = self.lock.lock().unwrap();
        let mut entries = self.load();
        let existing: std::collections::HashSet<String> =
            entries.iter().map(|e| e.entry_id.clone()).collect();
        let entities = extract_entities_regex(&format!("{} {}", task_text, answer));
        let keywords = extract_keywords(task_text);
        let source: String = task_text.chars().take(80).collect();
        let mut added = 0;

        for (content, confidence, method) in insights.into_iter().take(4) {
            let content = content.trim().to_string();
            if content.len() < 10 {
                continue;
            }
            // 同领域同内容前缀去重
            let prefix: String = content.chars().take(40).collect();
            let entry_id = format!("{:x}", md5_like(&format!("{}:{}", domain, prefix)));
            if existing.contains(&entry_id) {
                continue;
            }
            entries.push(KnowledgeEntry {
                entry_id,
                domain: domain.to_string(),
                content,
                entities: entities.clone(),
                keywords: keywords.clone(),
                confidence,
                quality_score: quality,
                source_task: source.clone(),
                extraction_method: method.to_string(),
                created_at: chrono::Utc::now().timestamp() as f64,
            });
            added += 1;
        }

        if added > 0 {
            if entries.len() > MAX_ENTRIES {
                let excess = entries.len() - MAX_ENTRIES;
                entries.drain(..excess);
            }
            self.store.save(&entries);
        }
        added
    }

    async fn llm_insights(
        &self,
        llm: &dyn LlmClient,
        task_text: &str,
        answer: &str,
        domain: &str,
    ) -> Vec<(String, f64)> {
        let task_snippet: String = task_text.chars().take(300).collect();
        let answer_snippet: String = answer.chars().take(400).collect();
        let req = CompletionRequest::new(
            ModelTier::Fast,
            "",
            format!(
                "Domain: {}\nTask: {}\nResult: {}\n\n\
                 Extract 2-4 SHORT, reusable factual insights from this completed task. \
                 Focus on: vendor terms, entity-specific rules, policy thresholds, \
                 process patterns, or constraints that would help future similar tasks.\n\n\
                 Return JSON array: [{{\"content\": \"...\", \"confidence\": 0.0-1.0}}]\n\
                 Each insight max 50 words. Only facts, no instructions.",
                domain, task_snippet, answer_snippet
            ),
        )
        .with_max_tokens(512)
        .with_timeout(EXTRACT_TIMEOUT_SECS);

        let result = tokio::time::timeout(
            std::time::Duration::from_secs(EXTRACT_TIMEOUT_SECS),
            llm.complete(&req),
        )
        .await;
        let Ok(Ok(text)) = result else {
            return Vec::new();
        };

        parse_json_lenient(&text, '[', ']')
            .and_then(|v| v.as_array().cloned())
            .map(|arr| {
                arr.iter()
                    .filter_map(|item| {
                        let content = item.get("content")?.as_str()?.to_string();
                        let conf = item.get("confidence").and_then(|c| c.as_f64()).unwrap_or(0.7);
                        Some((content, conf))
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    /// 检索相关知识，渲染为 PRIME 注入块；无命中返回空串
    pub fn relevant_knowledge(&self, task_text: &str, domain: &str) -> String {
        let entries = self.load();
        if entries.is_empty() {
            return String::new();
        }

        let task_kw: std::collections::HashSet<String> =
            extract_keywords(task_text).into_iter().collect();
        let task_entities: std::collections::HashSet<String> = extract_entities_regex(task_text)
            .into_iter()
            .map(|e| e.to_lowercase())
            .collect();

        let mut scored: Vec<(f64, &KnowledgeEntry)> = entries
            .iter()
            .filter_map(|e| {
                let kw_overlap = e.keywords.iter().filter(|k| task_kw.contains(*k)).count();
                let ent_overlap = e
                    .entities
                    .iter()
                    .filter(|ent| task_entities.contains(&ent.to_lowercase()))
                    .count();
                let mut score = kw_overlap as f64 * 0.4 + ent_overlap as f64 * 0.8;
                if e.domain == domain {
                    score += 0.3;
                }
                score += e.quality_score * 0.2;
                (score >= 0.4).then_some((score, e))
            })
            .collect();
        if scored.is_empty() {
            return String::new();
        }
        scored.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap());

        let mut lines =
            vec!["## KNOWLEDGE BASE (facts from past tasks — apply where relevant)".to_string()];
        for (_, e) in scored.iter().take(4) {
            lines.push(format!(
                "  • [{}] (confidence: {:.0}%) {}",
                e.domain,
                e.confidence * 100.0,
                e.content
            ));
        }
        lines.push(String::new());
        lines.join("\n")
    }

    pub fn stats(&self) -> serde_json::Value {
        let entries = self.load();
        let mut domains: Vec<String> = entries
            .iter()
            .map(|e| e.domain.clone())
            .collect::<std::collections::HashSet<_>>()
            .into_iter()
            .collect();
        domains.sort();
        serde_json::json!({
            "total_entries": entries.len(),
            "domains_covered": domains,
        })
    }
}

/// 稳定短哈希（FNV-1a），用于条目 ID 去重
fn md5_like(input: &str) -> u64 {
    let mut hash: u64 = 0xcbf29ce484222325;
    for b in input.as_bytes() {
        hash ^= *b as u64;
        hash = hash.wrapping_mul(0x100000001b3);
    }
    hash
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::MockLlm;
    use tempfile::TempDir;

    fn kb(dir: &TempDir) -> KnowledgeBase {
        KnowledgeBase::new(JsonStore::new(dir.path().join("knowledge_base.json")))
    }

    #[tokio::test]
    async fn test_low_quality_skipped() {
        let dir = TempDir::new().unwrap();
        let base = kb(&dir);
        let mock = MockLlm::new();
        let added = base
            .extract_and_store(&mock, "task", "answer text here", "general", 0.3)
            .await;
        assert_eq!(added, 0);
        assert_eq!(mock.request_count(), 0);
    }

    #[tokio::test]
    async fn test_fast_path_and_retrieval() {
        let dir = TempDir::new().unwrap();
        let base = kb(&dir);
        let mock = MockLlm::with_responses(&[r#"[{"content": "Acme Corp invoices use net-60 payment terms", "confidence": 0.9}]"#]);
        let added = base
            .extract_and_store(
                &mock,
                "Reconcile the Acme Corp invoice INV-3 for $12,400 with net-60 terms",
                "Approved. Variance within threshold of $500.",
                "invoice_reconciliation",
                0.8,
            )
            .await;
        assert!(added >= 2);

        let ctx = base.relevant_knowledge(
            "Check the new Acme Corp invoice INV-9",
            "invoice_reconciliation",
        );
        assert!(ctx.contains("KNOWLEDGE BASE"));
        assert!(ctx.contains("net-60") || ctx.contains("amount referenced"));
    }

    #[tokio::test]
    async fn test_no_relevant_knowledge_is_empty() {
        let dir = TempDir::new().unwrap();
        let base = kb(&dir);
        assert_eq!(base.relevant_knowledge("anything", "general"), "");
    }
}
