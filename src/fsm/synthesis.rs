//! 新流程类型的模板合成：一次快档调用，永久缓存
//!
//! 分类器给出内置之外的流程名时，让快档 LLM 合成状态序列与每状态指令，
//! 结果写入 synthesized_definitions.json。同名后续任务零成本取缓存；
//! 合成失败用六状态兜底模板，绝不阻塞任务。

use std::collections::HashMap;

use serde_json::Value;

use crate::fsm::classifier::parse_json_lenient;
use crate::fsm::templates::{FsmState, ProcessTemplate, RiskLevel};
use crate::llm::{CompletionRequest, LlmClient, ModelTier};
use crate::memory::store::JsonStore;

const SYNTHESIS_TIMEOUT_SECS: u64 = 8;

const SYNTHESIS_SYSTEM: &str = "You are a business process analyst specializing in workflow automation.

Given a process type name and task description, synthesize an optimal FSM workflow.

Available FSM states (choose the right subset for this process):
- DECOMPOSE: Break task into sub-tasks, identify required entities and data
- ASSESS: Gather all required data via read-only tools (no write actions yet)
- COMPUTE: Run calculations using gathered data (no tools — pure math and scoring)
- POLICY_CHECK: Verify business rules, thresholds, and compliance constraints
- APPROVAL_GATE: Human-in-the-loop approval required before any mutations
- MUTATE: Execute state changes via write tools (only after all prior phases complete)
- SCHEDULE_NOTIFY: Send notifications, schedule follow-up actions
- COMPLETE: Summarize all outcomes concisely

Design rules:
1. ALWAYS include DECOMPOSE (first) and COMPLETE (last)
2. Include ASSESS if data needs to be gathered from external sources
3. Include COMPUTE only if calculations are needed
4. Include POLICY_CHECK if business rules or approval thresholds must be verified
5. Include APPROVAL_GATE only for high-risk processes requiring explicit human sign-off
6. Include MUTATE if any state changes or write operations are required
7. Include SCHEDULE_NOTIFY only if notifications or scheduling are part of the outcome
8. Write specific, actionable state_instructions for EVERY state you include

Respond ONLY with valid JSON. No explanation. No markdown fences.";

/// 合成器：封装缓存存储
pub struct TemplateSynthesizer {
    store: JsonStore,
}

impl TemplateSynthesizer {
    pub fn new(store: JsonStore) -> Self {
        Self { store }
    }

    /// 取缓存或合成；每个新流程名最多一次 LLM 调用
    pub async fn synthesize_if_needed(
        &self,
        llm: &dyn LlmClient,
        process_type: &str,
        task_text: &str,
    ) -> ProcessTemplate {
        if let Some(cached) = self.load_cached(process_type) {
            return cached;
        }

        let template = match self.call_synthesizer(llm, process_type, task_text).await {
            Some(t) => t,
            None => fallback_template(process_type),
        };
        self.save_cached(&template);
        template
    }

    pub fn load_cached(&self, process_type: &str) -> Option<ProcessTemplate> {
        let cache: HashMap<String, ProcessTemplate> = self.store.load_or_default();
        cache.get(process_type).cloned()
    }

    fn save_cached(&self, template: &ProcessTemplate) {
        let mut cache: HashMap<String, ProcessTemplate> = self.store.load_or_default();
        cache.insert(template.name.clone(), template.clone());
        self.store.save(&cache);
    }

    pub fn stats(&self) -> serde_json::Value {
        let cache: HashMap<String, ProcessTemplate> = self.store.load_or_default();
        let mut names: Vec<&String> = cache.keys().collect();
        names.sort();
        serde_json::json!({
            "total_novel_types": cache.len(),
            "cached_types": names,
        })
    }

    async fn call_synthesizer(
        &self,
        llm: &dyn LlmClient,
        process_type: &str,
        task_text: &str,
    ) -> Option<ProcessTemplate> {
        let task_snippet: String = task_text.chars().take(500).collect();
        let prompt = format!(
            "Process type: {}\nTask description: {}\n\n\
             Synthesize the optimal FSM workflow for this process type.\n\
             Return JSON with exactly this schema:\n\
             {{\n  \"states\": [\"DECOMPOSE\", \"ASSESS\", ...],\n  \"hitl_required\": false,\n  \
             \"risk_level\": \"low\",\n  \"connector_hints\": [\"tool-prefix-1\"],\n  \
             \"state_instructions\": {{\"DECOMPOSE\": \"...\", \"ASSESS\": \"...\"}}\n}}",
            process_type, task_snippet
        );
        let req = CompletionRequest::new(ModelTier::Fast, SYNTHESIS_SYSTEM, prompt)
            .with_max_tokens(700)
            .with_timeout(SYNTHESIS_TIMEOUT_SECS);

        let result = tokio::time::timeout(
            std::time::Duration::from_secs(SYNTHESIS_TIMEOUT_SECS),
            llm.complete(&req),
        )
        .await;

        match result {
            Ok(Ok(text)) => parse_synthesis(process_type, &text),
            _ => None,
        }
    }
}

/// 解析并校验合成应答；状态过滤为合法值，强制 DECOMPOSE/COMPLETE 书挡
fn parse_synthesis(process_type: &str, text: &str) -> Option<ProcessTemplate> {
    let parsed: Value = parse_json_lenient(text, '{', '}')?;

    let raw_states = parsed.get("states")?.as_array()?;
    let mut states: Vec<FsmState> = raw_states
        .iter()
        .filter_map(|s| s.as_str())
        .filter_map(FsmState::parse)
        .filter(|s| !matches!(s, FsmState::Escalate | FsmState::Failed))
        .collect();
    if states.is_empty() {
        return None;
    }
    if states.first() != Some(&FsmState::Decompose) {
        states.insert(0, FsmState::Decompose);
    }
    if states.last() != Some(&FsmState::Complete) {
        states.push(FsmState::Complete);
    }
    // 去重并按规范顺序排序，保证保序子序列不变量
    states.sort_by_key(|s| s.canonical_index().unwrap_or(usize::MAX));
    states.dedup();

    let risk_level = match parsed.get("risk_level").and_then(|v| v.as_str()) {
        Some("low") => RiskLevel::Low,
        Some("high") => RiskLevel::High,
        _ => RiskLevel::Medium,
    };
    let hitl_required = parsed
        .get("hitl_required")
        .and_then(|v| v.as_bool())
        .unwrap_or(risk_level == RiskLevel::High);
    let connector_hints = parsed
        .get("connector_hints")
        .and_then(|v| v.as_array())
        .map(|arr| arr.iter().filter_map(|v| v.as_str()).map(String::from).collect())
        .unwrap_or_default();
    let instructions: HashMap<String, String> = parsed
        .get("state_instructions")
        .and_then(|v| v.as_object())
        .map(|obj| {
            obj.iter()
                .filter_map(|(k, v)| v.as_str().map(|s| (k.clone(), s.to_string())))
                .collect()
        })
        .unwrap_or_default();

    Some(ProcessTemplate {
        name: process_type.to_string(),
        states,
        instructions,
        hitl_required,
        risk_level,
        connector_hints,
    })
}

/// 合成失败时的六状态兜底，比退回 general 模板更贴近业务流程
fn fallback_template(process_type: &str) -> ProcessTemplate {
    let label = process_type.replace('_', " ");
    let mut instructions = HashMap::new();
    instructions.insert(
        "DECOMPOSE".to_string(),
        format!(
            "Break the {} task into sub-tasks. Identify all entities, IDs, amounts and parties \
             involved. List what data you need to collect before taking any action.",
            label
        ),
    );
    instructions.insert(
        "ASSESS".to_string(),
        "Using the read-only tools available for this workspace, gather all required data. \
         Do NOT take any write actions yet."
            .to_string(),
    );
    instructions.insert(
        "COMPUTE".to_string(),
        format!(
            "Run all calculations required for {}. Use only data already collected in ASSESS.",
            label
        ),
    );
    instructions.insert(
        "POLICY_CHECK".to_string(),
        "Verify all business rules, thresholds and constraints before executing any changes."
            .to_string(),
    );
    instructions.insert(
        "MUTATE".to_string(),
        "Execute all required state changes via the write tools available. Log each action."
            .to_string(),
    );
    instructions.insert(
        "COMPLETE".to_string(),
        "Summarize all completed actions and their outcomes, including amounts and entity IDs."
            .to_string(),
    );

    ProcessTemplate {
        name: process_type.to_string(),
        states: vec![
            FsmState::Decompose,
            FsmState::Assess,
            FsmState::Compute,
            FsmState::PolicyCheck,
            FsmState::Mutate,
            FsmState::Complete,
        ],
        instructions,
        hitl_required: false,
        risk_level: RiskLevel::Medium,
        connector_hints: vec![],
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::MockLlm;
    use tempfile::TempDir;

    fn synthesizer(dir: &TempDir) -> TemplateSynthesizer {
        TemplateSynthesizer::new(JsonStore::new(dir.path().join("synthesized_definitions.json")))
    }

    #[tokio::test]
    async fn test_synthesis_parses_and_caches() {
        let dir = TempDir::new().unwrap();
        let synth = synthesizer(&dir);
        let mock = MockLlm::with_responses(&[r#"{
            "states": ["DECOMPOSE", "ASSESS", "COMPUTE", "COMPLETE"],
            "hitl_required": false,
            "risk_level": "low",
            "connector_hints": ["supplier"],
            "state_instructions": {"DECOMPOSE": "Identify the supplier and risk factors."}
        }"#]);

        let t = synth
            .synthesize_if_needed(&mock, "supplier_risk_assessment", "Assess supplier risk")
            .await;
        assert_eq!(t.states.len(), 4);
        assert_eq!(t.states[0], FsmState::Decompose);
        assert!(t.is_canonical_subsequence());

        // 第二次同名调用走缓存，不再消耗 LLM
        let again = synth
            .synthesize_if_needed(&mock, "supplier_risk_assessment", "another task")
            .await;
        assert_eq!(again.states, t.states);
        assert_eq!(mock.request_count(), 1);
    }

    #[tokio::test]
    async fn test_bookends_enforced() {
        let dir = TempDir::new().unwrap();
        let synth = synthesizer(&dir);
        let mock = MockLlm::with_responses(&[r#"{
            "states": ["ASSESS", "MUTATE"],
            "state_instructions": {}
        }"#]);
        let t = synth.synthesize_if_needed(&mock, "novel_type", "do the thing").await;
        assert_eq!(t.states.first(), Some(&FsmState::Decompose));
        assert_eq!(t.states.last(), Some(&FsmState::Complete));
        assert!(t.is_canonical_subsequence());
    }

    #[tokio::test]
    async fn test_garbage_falls_back() {
        let dir = TempDir::new().unwrap();
        let synth = synthesizer(&dir);
        let mock = MockLlm::with_responses(&["total nonsense"]);
        let t = synth.synthesize_if_needed(&mock, "weird_process", "x").await;
        assert_eq!(t.states.len(), 6);
        assert!(t.instruction_for(FsmState::Decompose).unwrap().contains("weird process"));
    }
}
