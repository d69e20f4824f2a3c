//! 实体记忆：正则抽取 + 跨任务沉淀
//!
//! 每个任务（含答案）抽取厂商、人名、金额、ID、日期、产品等实体，
//! 落盘 entity_memory.json。下个任务 PRIME 时注入已知实体上下文，
//! 第 3 个任务里出现过的 Acme Corp 到第 7 个任务时早已认识。
//! 零 API 成本，纯正则快路径；7 天 TTL，上限 1000 条。

use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::memory::store::JsonStore;

const MAX_ENTITIES: usize = 1000;
const ENTITY_TTL_SECS: f64 = 86400.0 * 7.0;

/// 单条实体记录
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntityRecord {
    pub entity_id: String,
    /// vendor | person | amount | id | date | email | percentage | product
    pub entity_type: String,
    pub raw_value: String,
    pub normalized: String,
    pub context: String,
    pub domain: String,
    pub seen_count: u64,
    pub first_seen: f64,
    pub last_seen: f64,
}

struct Pattern {
    entity_type: &'static str,
    re: &'static LazyLock<Regex>,
}

static AMOUNT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\$[\d,]+(?:\.\d{1,2})?(?:\s*[KMB])?").unwrap());
static PCT_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\b\d+(?:\.\d+)?%").unwrap());
static ID_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\b[A-Z]{2,8}-\d+\b").unwrap());
static EMAIL_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b[\w.+-]+@[\w.-]+\.\w{2,}\b").unwrap());
static DATE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\b(?:Jan|Feb|Mar|Apr|May|Jun|Jul|Aug|Sep|Oct|Nov|Dec)[a-z]*\.?\s+\d{1,2}(?:,?\s+\d{4})?\b")
        .unwrap()
});
static DATE_NUM_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b\d{1,2}[/-]\d{1,2}[/-]\d{2,4}\b").unwrap());
static VENDOR_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\b[A-Z][a-zA-Z]+(?:\s+[A-Z][a-zA-Z]+)*\s+(?:Corp|Inc|LLC|Ltd|Co|Group|Holdings|Technologies|Services|Solutions|Systems|Consulting|Partners)\.?\b")
        .unwrap()
});
static PERSON_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\b(?:Mr|Ms|Mrs|Dr)\.?\s+[A-Z][a-z]+(?:\s+[A-Z][a-z]+)+\b").unwrap()
});
static PRODUCT_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\b[A-Z][a-zA-Z]+(?:\s+[A-Z][a-zA-Z]+)?\s+(?:Plan|Tier|Package|License|Subscription|Module|Suite)\b")
        .unwrap()
});

static PATTERNS: LazyLock<Vec<Pattern>> = LazyLock::new(|| {
    vec![
        Pattern { entity_type: "amount", re: &AMOUNT_RE },
        Pattern { entity_type: "percentage", re: &PCT_RE },
        Pattern { entity_type: "id", re: &ID_RE },
        Pattern { entity_type: "email", re: &EMAIL_RE },
        Pattern { entity_type: "date", re: &DATE_RE },
        Pattern { entity_type: "date", re: &DATE_NUM_RE },
        Pattern { entity_type: "vendor", re: &VENDOR_RE },
        Pattern { entity_type: "person", re: &PERSON_RE },
        Pattern { entity_type: "product", re: &PRODUCT_RE },
    ]
});

fn normalize(entity_type: &str, raw: &str) -> String {
    match entity_type {
        "amount" => {
            let s = raw.replace(['$', ','], "");
            let s = s.trim();
            if let Some(stripped) = s.strip_suffix('K').or_else(|| s.strip_suffix('k')) {
                if let Ok(v) = stripped.trim().parse::<f64>() {
                    return format!("${:.0}", v * 1000.0);
                }
            }
            if let Some(stripped) = s.strip_suffix('M') {
                if let Ok(v) = stripped.trim().parse::<f64>() {
                    return format!("${:.0}", v * 1_000_000.0);
                }
            }
            format!("${}", s)
        }
        "email" => raw.to_lowercase(),
        _ => raw.trim().to_string(),
    }
}

fn entity_id(entity_type: &str, normalized: &str) -> String {
    let mut hash: u64 = 0xcbf29ce484222325;
    for b in format!("{}:{}", entity_type, normalized).as_bytes() {
        hash ^= *b as u64;
        hash = hash.wrapping_mul(0x100000001b3);
    }
    format!("{:010x}", hash & 0xff_ffff_ffff)
}

fn context_snippet(text: &str, start: usize, end: usize) -> String {
    let from = text[..start]
        .char_indices()
        .rev()
        .take(30)
        .last()
        .map(|(i, _)| i)
        .unwrap_or(start);
    let to_budget = text[end..].char_indices().take(31).last().map(|(i, _)| end + i).unwrap_or(end);
    text[from..to_budget].replace('\n', " ")
}

/// 从文本抽取实体
pub fn extract_entities(text: &str, domain: &str) -> Vec<EntityRecord> {
    let now = chrono::Utc::now().timestamp() as f64;
    let mut found: std::collections::HashMap<String, EntityRecord> = std::collections::HashMap::new();

    for pattern in PATTERNS.iter() {
        for m in pattern.re.find_iter(text) {
            let raw = m.as_str().trim().to_string();
            if raw.len() < 2 {
                continue;
            }
            let norm = normalize(pattern.entity_type, &raw);
            let eid = entity_id(pattern.entity_type, &norm);
            found.entry(eid.clone()).or_insert_with(|| EntityRecord {
                entity_id: eid,
                entity_type: pattern.entity_type.to_string(),
                raw_value: raw,
                normalized: norm,
                context: context_snippet(text, m.start(), m.end()),
                domain: domain.to_string(),
                seen_count: 1,
                first_seen: now,
                last_seen: now,
            });
        }
    }

    found.into_values().collect()
}

/// 实体记忆库
pub struct EntityMemory {
    store: JsonStore,
    lock: std::sync::Mutex<()>,
}

impl EntityMemory {
    pub fn new(store: JsonStore) -> Self {
        Self {
            store,
            lock: std::sync::Mutex::new(()),
        }
    }

    pub fn load(&self) -> Vec<EntityRecord> {
        self.store.load_or_default()
    }

    /// REFLECT 阶段记账：task + answer 实体合并入库；返回新增数
    pub fn record_task_entities(&self, task_text: &str, answer: &str, domain: &str) -> usize {
        let combined = format!("{}\n{}", task_text, answer);
        let new_records = extract_entities(&combined, domain);
        if new_records.is_empty() {
            return 0;
        }

        let _guard = self.lock.lock().unwrap();
        let now = chrono::Utc::now().timestamp() as f64;
        let mut by_id: std::collections::HashMap<String, EntityRecord> = self
            .load()
            .into_iter()
            .map(|r| (r.entity_id.clone(), r))
            .collect();

        let mut added = 0;
        for rec in new_records {
            match by_id.get_mut(&rec.entity_id) {
                Some(existing) => {
                    existing.seen_count += 1;
                    existing.last_seen = now;
                    existing.domain = domain.to_string();
                }
                None => {
                    by_id.insert(rec.entity_id.clone(), rec);
                    added += 1;
                }
            }
        }

        // TTL 淘汰 + 上限
        let mut records: Vec<EntityRecord> = by_id
            .into_values()
            .filter(|r| now - r.last_seen < ENTITY_TTL_SECS)
            .collect();
        records.sort_by(|a, b| a.last_seen.partial_cmp(&b.last_seen).unwrap());
        if records.len() > MAX_ENTITIES {
            let excess = records.len() - MAX_ENTITIES;
            records.drain(..excess);
        }
        self.store.save(&records);
        added
    }

    /// PRIME 注入：任务中出现的已知实体（复现 ≥2 次）+ 同域高频实体
    pub fn entity_context(&self, task_text: &str) -> String {
        let records = self.load();
        if records.is_empty() {
            return String::new();
        }
        let task_entities = extract_entities(task_text, "");
        if task_entities.is_empty() {
            return String::new();
        }

        let task_vals: std::collections::HashSet<String> = task_entities
            .iter()
            .flat_map(|e| [e.normalized.to_lowercase(), e.raw_value.to_lowercase()])
            .collect();

        let mut matches: Vec<&EntityRecord> = records
            .iter()
            .filter(|r| {
                r.seen_count >= 2
                    && (task_vals.contains(&r.normalized.to_lowercase())
                        || task_vals.contains(&r.raw_value.to_lowercase()))
            })
            .collect();

        let mut frequent: Vec<&EntityRecord> =
            records.iter().filter(|r| r.seen_count >= 3).collect();
        frequent.sort_by(|a, b| b.seen_count.cmp(&a.seen_count));
        for r in frequent.into_iter().take(3) {
            if !matches.iter().any(|m| m.entity_id == r.entity_id) {
                matches.push(r);
            }
        }

        if matches.is_empty() {
            return String::new();
        }

        let mut lines = vec!["## ENTITY MEMORY (known entities from past tasks)".to_string()];
        for m in matches.iter().take(6) {
            let ctx: String = m.context.chars().take(80).collect();
            lines.push(format!(
                "  • [{}] {}  (seen {}x — context: \"{}\")",
                m.entity_type, m.normalized, m.seen_count, ctx
            ));
        }
        lines.push(String::new());
        lines.join("\n")
    }

    pub fn stats(&self) -> serde_json::Value {
        let records = self.load();
        let recurring = records.iter().filter(|r| r.seen_count >= 2).count();
        let mut by_type: std::collections::HashMap<String, u64> = std::collections::HashMap::new();
        for r in &records {
            *by_type.entry(r.entity_type.clone()).or_insert(0) += 1;
        }
        serde_json::json!({
            "total_entities": records.len(),
            "recurring_entities": recurring,
            "by_type": by_type,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn memory(dir: &TempDir) -> EntityMemory {
        EntityMemory::new(JsonStore::new(dir.path().join("entity_memory.json")))
    }

    #[test]
    fn test_extraction_types() {
        let records = extract_entities(
            "Invoice INV-123 from Acme Corp for $52,340 due Mar 15, 2026 with 2.5% variance, \
             contact billing@acme.com",
            "invoice_reconciliation",
        );
        let types: std::collections::HashSet<&str> =
            records.iter().map(|r| r.entity_type.as_str()).collect();
        assert!(types.contains("id"));
        assert!(types.contains("vendor"));
        assert!(types.contains("amount"));
        assert!(types.contains("percentage"));
        assert!(types.contains("email"));
        assert!(types.contains("date"));
    }

    #[test]
    fn test_amount_normalization() {
        assert_eq!(normalize("amount", "$52,340.00"), "$52340.00");
        assert_eq!(normalize("amount", "$12K"), "$12000");
    }

    #[test]
    fn test_recurring_entity_surfaces_in_context() {
        let dir = TempDir::new().unwrap();
        let mem = memory(&dir);
        mem.record_task_entities("Pay the Acme Corp invoice INV-1", "Paid Acme Corp.", "ap");
        mem.record_task_entities("New PO for Acme Corp", "Created.", "procurement");

        let ctx = mem.entity_context("What do we know about Acme Corp orders?");
        assert!(ctx.contains("ENTITY MEMORY"));
        assert!(ctx.contains("Acme Corp"));
        assert!(ctx.contains("seen 2x") || ctx.contains("seen 3x"));
    }

    #[test]
    fn test_single_sighting_not_surfaced() {
        let dir = TempDir::new().unwrap();
        let mem = memory(&dir);
        mem.record_task_entities("Pay Globex Inc invoice", "done", "ap");
        let ctx = mem.entity_context("Anything on Globex Inc?");
        assert!(ctx.is_empty());
    }

    #[test]
    fn test_seen_count_increments() {
        let dir = TempDir::new().unwrap();
        let mem = memory(&dir);
        let added1 = mem.record_task_entities("INV-9 processing", "", "ap");
        let added2 = mem.record_task_entities("INV-9 again", "", "ap");
        assert_eq!(added1, 1);
        assert_eq!(added2, 0);
        let rec = mem.load();
        assert_eq!(rec[0].seen_count, 2);
    }
}
