//! 执行策略层：三个可互换的任务执行器（fsm / five_phase / moa）
//!
//! 统一接口 execute(ctx)；由 UCB1 老虎机按流程类型选择。
//! 策略只透过 ToolInvoker 调工具（分层栈：核验 → 恢复 → schema 纠正 →
//! 分页 → 直调），不直接碰 RPC。

pub mod five_phase;
pub mod fsm_exec;
pub mod moa;
pub mod output;
pub mod verify;

use async_trait::async_trait;

use crate::budget::TokenBudget;
use crate::fsm::FsmRunner;
use crate::llm::LlmClient;
use crate::tools::{ToolInvoker, ToolSchema};

/// 策略执行的共享上下文
pub struct StrategyContext<'a> {
    pub task_text: &'a str,
    pub system_context: &'a str,
    pub tools: &'a [ToolSchema],
    pub llm: &'a dyn LlmClient,
    pub invoker: &'a dyn ToolInvoker,
    pub budget: &'a mut TokenBudget,
    pub fsm: &'a mut FsmRunner,
}

/// 策略产出
#[derive(Debug, Clone, Default)]
pub struct StrategyOutcome {
    pub answer: String,
    pub tool_count: usize,
    pub error: Option<String>,
}

/// 执行策略 trait；三个实现可互换
#[async_trait]
pub trait Strategy: Send + Sync {
    async fn execute(&self, ctx: &mut StrategyContext<'_>) -> StrategyOutcome;
}

/// 按老虎机选出的臂名取策略实例
pub fn strategy_by_name(name: &str) -> Box<dyn Strategy> {
    match name {
        "five_phase" => Box::new(five_phase::FivePhaseStrategy),
        "moa" => Box::new(moa_strategy::MoaStrategy),
        _ => Box::new(fsm_exec::FsmStrategy),
    }
}

mod moa_strategy {
    use super::*;

    /// MoA 策略：双采样一致性直接作为整任务执行器（纯推理任务的臂）
    pub struct MoaStrategy;

    #[async_trait]
    impl Strategy for MoaStrategy {
        async fn execute(&self, ctx: &mut StrategyContext<'_>) -> StrategyOutcome {
            let (answer, _consensus) =
                super::moa::dual_sample_synthesize(ctx.llm, ctx.task_text, ctx.system_context)
                    .await;
            ctx.budget.record(&answer, "moa");
            if answer.is_empty() {
                StrategyOutcome {
                    answer: String::new(),
                    tool_count: 0,
                    error: Some("moa produced no answer".to_string()),
                }
            } else {
                StrategyOutcome {
                    answer,
                    tool_count: 0,
                    error: None,
                }
            }
        }
    }
}
