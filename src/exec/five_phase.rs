//! 五阶段策略：PLAN → GATHER → SYNTHESIZE → ARTIFACT（INSIGHT 在 REFLECT）
//!
//! 复杂多步任务的替代执行器：快档拆 2-4 个子任务，逐个取数，
//! 强档综合分析，快档整理成交付物。第五阶段（知识沉淀）由 worker 的
//! REFLECT 统一做，这里不重复。每一步都有超时与兜底，绝不空手崩掉。

use async_trait::async_trait;
use serde_json::Value;

use crate::exec::fsm_exec::{parse_state_output, StateOutput};
use crate::exec::{Strategy, StrategyContext, StrategyOutcome};
use crate::fsm::classifier::parse_json_lenient;
use crate::llm::{CompletionRequest, LlmClient as _, ModelTier};
use crate::tools::schema::tools_prompt_block;

const PLAN_TIMEOUT_SECS: u64 = 10;
const GATHER_STEP_TIMEOUT_SECS: u64 = 30;
const SYNTH_TIMEOUT_SECS: u64 = 45;
const ARTIFACT_TIMEOUT_SECS: u64 = 20;
const MAX_SUBTASKS: usize = 4;

/// PLAN 产物
struct Plan {
    subtasks: Vec<String>,
    requires_tools: bool,
}

fn parse_plan(text: &str) -> Option<Plan> {
    let parsed = parse_json_lenient(text, '{', '}')?;
    let subtasks: Vec<String> = parsed
        .get("subtasks")?
        .as_array()?
        .iter()
        .filter_map(|s| s.as_str().map(String::from))
        .take(MAX_SUBTASKS)
        .collect();
    if subtasks.is_empty() {
        return None;
    }
    Some(Plan {
        subtasks,
        requires_tools: parsed
            .get("requires_tools")
            .and_then(Value::as_bool)
            .unwrap_or(true),
    })
}

/// 五阶段策略
pub struct FivePhaseStrategy;

#[async_trait]
impl Strategy for FivePhaseStrategy {
    async fn execute(&self, ctx: &mut StrategyContext<'_>) -> StrategyOutcome {
        let mut tool_count = 0usize;

        // ── PLAN（快档）────────────────────────────────────────────────
        let plan_req = CompletionRequest::new(
            ModelTier::Fast,
            "You are a task decomposition engine. Output ONLY valid JSON:\n\
             {\"subtasks\": [\"step 1\", \"step 2\"], \"requires_tools\": true}\n\
             Rules: 2 to 4 concrete actionable subtasks; requires_tools true if any \
             subtask needs data from external systems. No prose.",
            format!("SYSTEM CONTEXT:\n{}\n\nTASK:\n{}", ctx.system_context, ctx.task_text),
        )
        .with_max_tokens(200)
        .with_timeout(PLAN_TIMEOUT_SECS);

        let plan = match ctx.llm.complete(&plan_req).await {
            Ok(text) => {
                ctx.budget.record(&text, "plan");
                parse_plan(&text)
            }
            Err(_) => None,
        }
        .unwrap_or(Plan {
            subtasks: vec![ctx.task_text.to_string()],
            requires_tools: true,
        });

        // ── GATHER（工具取数）──────────────────────────────────────────
        let mut observations: Vec<String> = Vec::new();
        if plan.requires_tools && !ctx.tools.is_empty() {
            let tools_block = tools_prompt_block(ctx.tools);
            for subtask in &plan.subtasks {
                let gather_req = CompletionRequest::new(
                    ModelTier::Fast,
                    format!(
                        "{}\n\nPick the single best tool call for the data this subtask needs. \
                         Respond with ONLY JSON: {{\"tool\": \"name\", \"args\": {{...}}}}. \
                         If no tool is needed, respond with the word NONE.",
                        tools_block
                    ),
                    format!("TASK:\n{}\n\nSUBTASK:\n{}", ctx.task_text, subtask),
                )
                .with_max_tokens(200)
                .with_timeout(GATHER_STEP_TIMEOUT_SECS);

                let Ok(decision) = ctx.llm.complete(&gather_req).await else {
                    continue;
                };
                ctx.budget.record(&decision, "gather");
                if decision.trim().eq_ignore_ascii_case("none") {
                    continue;
                }
                if let StateOutput::ToolCall { tool, args } = parse_state_output(&decision) {
                    if ctx.tools.iter().any(|t| t.name == tool) {
                        tool_count += 1;
                        let result = ctx.invoker.invoke(&tool, args).await;
                        let capped: String = result.to_string().chars().take(2000).collect();
                        ctx.budget.record(&capped, "observation");
                        observations.push(format!("[{}] {} -> {}", subtask, tool, capped));
                    }
                }
            }
        }

        // ── SYNTHESIZE（强档）──────────────────────────────────────────
        let observations_block = if observations.is_empty() {
            "(no tool data gathered)".to_string()
        } else {
            observations.join("\n\n")
        };
        let synth_req = CompletionRequest::new(
            ModelTier::Strong,
            ctx.system_context,
            format!(
                "TASK:\n{}\n\nPLAN:\n{}\n\nGATHERED DATA:\n{}\n\n\
                 Produce the comprehensive analysis and answer. Address every subtask. \
                 Use exact figures from the gathered data.",
                ctx.task_text,
                plan.subtasks.join("\n"),
                observations_block
            ),
        )
        .with_max_tokens(1500)
        .with_timeout(SYNTH_TIMEOUT_SECS);

        let synthesis = match ctx.llm.complete(&synth_req).await {
            Ok(text) => {
                ctx.budget.record(&text, "synthesize");
                text
            }
            Err(e) => {
                return StrategyOutcome {
                    answer: format!("Task failed: {}", e),
                    tool_count,
                    error: Some(e.to_string()),
                };
            }
        };

        // ── ARTIFACT（快档整理）────────────────────────────────────────
        // 合成已经够好时这步只是排版润色；失败直接用合成稿
        let artifact_req = CompletionRequest::new(
            ModelTier::Fast,
            "Format the analysis into a clean, structured deliverable. Keep every figure \
             and decision unchanged. No meta-commentary.",
            format!("TASK:\n{}\n\nANALYSIS:\n{}", ctx.task_text, synthesis),
        )
        .with_max_tokens(800)
        .with_timeout(ARTIFACT_TIMEOUT_SECS);

        let answer = match ctx.llm.complete(&artifact_req).await {
            Ok(text) if text.len() >= synthesis.len() / 2 => {
                ctx.budget.record(&text, "artifact");
                text
            }
            _ => synthesis,
        };

        StrategyOutcome {
            answer,
            tool_count,
            error: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_plan() {
        let plan = parse_plan(
            r#"{"subtasks": ["fetch invoices", "compute variance"], "requires_tools": true}"#,
        )
        .unwrap();
        assert_eq!(plan.subtasks.len(), 2);
        assert!(plan.requires_tools);
    }

    #[test]
    fn test_parse_plan_caps_subtasks() {
        let plan = parse_plan(
            r#"{"subtasks": ["a", "b", "c", "d", "e", "f"], "requires_tools": false}"#,
        )
        .unwrap();
        assert_eq!(plan.subtasks.len(), MAX_SUBTASKS);
    }

    #[test]
    fn test_parse_plan_rejects_garbage() {
        assert!(parse_plan("not json").is_none());
        assert!(parse_plan(r#"{"subtasks": []}"#).is_none());
    }
}
