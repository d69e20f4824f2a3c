//! FSM 策略：逐状态驱动 LLM + 工具回圈
//!
//! 每个状态：HITL 过滤工具集 → 预算选档 → 状态指令拼 system →
//! LLM 输出解析为 Tool Call（JSON）或状态产出 → 观察写回下一轮。
//! POLICY_CHECK 有结构化策略结果时确定性推进，不花 LLM。
//! 每状态步数与全局步数都有上限，防死循环。

use async_trait::async_trait;
use serde_json::Value;

use crate::exec::{Strategy, StrategyContext, StrategyOutcome};
use crate::fsm::FsmState;
use crate::llm::{CompletionRequest, LlmClient as _};
use crate::tools::{filter_tools, schema::tools_prompt_block};

/// 单状态内最大 LLM 步数
const MAX_STEPS_PER_STATE: usize = 5;
/// 整个任务最大 LLM 步数
const MAX_TOTAL_STEPS: usize = 30;

/// LLM 输出的工具调用（简化 JSON：{"tool": "...", "args": {...}}）
#[derive(Debug)]
pub enum StateOutput {
    ToolCall { tool: String, args: Value },
    Response(String),
}

/// 解析状态输出：含有效 tool JSON 则为调用，否则是状态产出文本
pub fn parse_state_output(output: &str) -> StateOutput {
    let trimmed = output.trim();

    let json_str: Option<String> = if let Some(start) = trimmed.find("```json") {
        let rest = &trimmed[start + 7..];
        let inner = rest.find("```").map(|end| &rest[..end]).unwrap_or(rest);
        Some(inner.trim().to_string())
    } else if let (Some(start), Some(end)) = (trimmed.find('{'), trimmed.rfind('}')) {
        (start < end).then(|| trimmed[start..=end].to_string())
    } else {
        None
    };

    if let Some(json_str) = json_str {
        if let Ok(parsed) = serde_json::from_str::<Value>(&json_str) {
            if let Some(tool) = parsed.get("tool").and_then(|t| t.as_str()) {
                if !tool.is_empty() {
                    return StateOutput::ToolCall {
                        tool: tool.to_string(),
                        args: parsed.get("args").cloned().unwrap_or(Value::Object(Default::default())),
                    };
                }
            }
        }
    }
    StateOutput::Response(trimmed.to_string())
}

const TOOL_CALL_INSTRUCTIONS: &str = "\n\nWhen you need a tool, respond with ONLY this JSON \
(no prose): {\"tool\": \"tool_name\", \"args\": {...}}\n\
When the phase is done, respond with the phase result as plain text (no JSON).";

/// FSM 策略
pub struct FsmStrategy;

#[async_trait]
impl Strategy for FsmStrategy {
    async fn execute(&self, ctx: &mut StrategyContext<'_>) -> StrategyOutcome {
        let mut tool_count = 0usize;
        let mut total_steps = 0usize;
        let mut last_output = String::new();
        let mut answer = String::new();

        loop {
            let state = ctx.fsm.current_state();

            // POLICY_CHECK 有确定性结果：不花 LLM，直接应用并推进
            if state == FsmState::PolicyCheck {
                if let Some(policy) = ctx.fsm.policy_result().cloned() {
                    ctx.fsm.apply_policy(policy);
                    continue;
                }
            }

            let filtered = filter_tools(ctx.tools, state);
            let phase_prompt = ctx.fsm.build_phase_prompt(&filtered.visible);
            let tier = ctx.budget.model_for(state, ctx.task_text);
            if tier == crate::llm::ModelTier::Skip {
                let err = "Token budget exhausted. Task incomplete.".to_string();
                return StrategyOutcome {
                    answer: if answer.is_empty() { err.clone() } else { answer },
                    tool_count,
                    error: Some(err),
                };
            }
            let max_tokens = ctx.budget.max_tokens_cap(state);

            let mut system = format!("{}\n\n{}", ctx.system_context, phase_prompt);
            if !filtered.banner.is_empty() {
                system.push_str("\n\n");
                system.push_str(&filtered.banner);
            }
            if !filtered.visible.is_empty() && !state.is_terminal() {
                system.push_str("\n\n");
                system.push_str(&tools_prompt_block(&filtered.visible));
                system.push_str(TOOL_CALL_INSTRUCTIONS);
            }
            ctx.budget.record(&system, "fsm_system");

            let mut observations: Vec<String> = Vec::new();
            let mut state_result = String::new();

            for _step in 0..MAX_STEPS_PER_STATE {
                total_steps += 1;
                if total_steps > MAX_TOTAL_STEPS {
                    break;
                }

                let mut user = format!("TASK:\n{}", ctx.task_text);
                if !last_output.is_empty() {
                    user.push_str(&format!("\n\nPREVIOUS PHASE OUTPUT:\n{}", last_output));
                }
                for obs in &observations {
                    user.push_str(&format!("\n\nOBSERVATION:\n{}", obs));
                }

                let req = CompletionRequest::new(tier, system.clone(), user)
                    .with_max_tokens(max_tokens)
                    .with_timeout(45);
                let output = match ctx.llm.complete(&req).await {
                    Ok(o) => o,
                    Err(e) => {
                        return StrategyOutcome {
                            answer: if answer.is_empty() {
                                format!("Task failed: {}", e)
                            } else {
                                answer
                            },
                            tool_count,
                            error: Some(e.to_string()),
                        };
                    }
                };
                ctx.budget.record(&output, "fsm_output");

                match parse_state_output(&output) {
                    StateOutput::ToolCall { tool, args } => {
                        // 幻觉工具：不在可见集直接写回错误观察，不调用
                        let allowed = filtered.visible.iter().any(|t| t.name == tool);
                        let observation = if allowed {
                            tool_count += 1;
                            let result = ctx.invoker.invoke(&tool, args).await;
                            let text = result.to_string();
                            let capped: String = text.chars().take(2000).collect();
                            ctx.budget.record(&capped, "observation");
                            format!("{} -> {}", tool, capped)
                        } else {
                            format!("{} is not an available tool in this phase", tool)
                        };
                        observations.push(observation);
                    }
                    StateOutput::Response(text) => {
                        state_result = text;
                        break;
                    }
                }
            }

            if !state_result.is_empty() {
                last_output = state_result.clone();
            }

            match state {
                FsmState::Complete | FsmState::Escalate | FsmState::Failed => {
                    answer = if state_result.is_empty() { last_output.clone() } else { state_result };
                    break;
                }
                // 审批门 + 策略要求人工确认：本轮以审批文档收尾，
                // 检查点推进到下一状态，同会话下一轮从 MUTATE 继续
                FsmState::ApprovalGate if ctx.fsm.requires_hitl() => {
                    answer = if state_result.is_empty() { last_output.clone() } else { state_result };
                    ctx.fsm.advance();
                    break;
                }
                _ => {
                    ctx.fsm.advance();
                }
            }

            if total_steps > MAX_TOTAL_STEPS {
                answer = last_output.clone();
                break;
            }
        }

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
    use serde_json::json;

    #[test]
    fn test_parse_tool_call() {
        let out = parse_state_output(r#"{"tool": "get_invoice", "args": {"id": "INV-1"}}"#);
        match out {
            StateOutput::ToolCall { tool, args } => {
                assert_eq!(tool, "get_invoice");
                assert_eq!(args["id"], "INV-1");
            }
            _ => panic!("expected tool call"),
        }
    }

    #[test]
    fn test_parse_fenced_tool_call() {
        let out = parse_state_output("Here it is:\n```json\n{\"tool\": \"list_orders\", \"args\": {}}\n```");
        assert!(matches!(out, StateOutput::ToolCall { tool, .. } if tool == "list_orders"));
    }

    #[test]
    fn test_parse_plain_response() {
        let out = parse_state_output("Phase complete: gathered 4 invoices totalling $12,400.");
        assert!(matches!(out, StateOutput::Response(_)));
    }

    #[test]
    fn test_parse_empty_tool_is_response() {
        let out = parse_state_output(r#"{"tool": "", "args": {}}"#);
        assert!(matches!(out, StateOutput::Response(_)));
    }

    #[test]
    fn test_parse_json_without_tool_key_is_response() {
        let out = parse_state_output(json!({"decision": "approved"}).to_string().as_str());
        assert!(matches!(out, StateOutput::Response(_)));
    }
}
