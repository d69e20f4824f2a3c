//! 8 状态 FSM 执行器
//!
//! 执行器是通用的：状态指令来自模板数据层（内置或合成）。
//! 只读任务短路为 DECOMPOSE → ASSESS → COMPLETE；
//! 检查点恢复跳过 DECOMPOSE 与分类；POLICY_CHECK 记录 passed=false 后
//! MUTATE 不可达，推进到 MUTATE 会被改道 ESCALATE。

use serde::{Deserialize, Serialize};

use crate::fsm::templates::{FsmState, ProcessTemplate};
use crate::policy::PolicyResult;
use crate::tools::{self, ToolSchema};

/// 多轮会话的恢复点；state_idx 必须是模板状态序列的合法下标
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FsmCheckpoint {
    pub process_type: String,
    pub state_idx: usize,
    pub state_history: Vec<String>,
    pub requires_hitl: bool,
}

/// 任务文本里出现这些动词则不是只读任务
const ACTION_VERBS: [&str; 11] = [
    "approve", "reject", "cancel", "update", "create", "delete", "revoke", "refund",
    "reconcile", "issue", "send",
];

const READ_PATTERNS: [&str; 7] = [
    "what is", "show me", "list", "find", "report", "summarise", "summarize",
];

/// 纯查询任务：无动作动词且有读取句式
pub fn is_read_only_task(task_text: &str) -> bool {
    let text = task_text.to_lowercase();
    let has_action = ACTION_VERBS.iter().any(|v| text.contains(v));
    let has_read = READ_PATTERNS.iter().any(|p| text.contains(p));
    !has_action && has_read
}

/// FSM 执行器：持有模板、当前下标与过程数据
pub struct FsmRunner {
    template: ProcessTemplate,
    idx: usize,
    current: FsmState,
    state_history: Vec<String>,
    policy_result: Option<PolicyResult>,
    escalation_reason: String,
    failure_reason: String,
    requires_hitl: bool,
    approval_count: u32,
    restored_from_checkpoint: bool,
}

impl FsmRunner {
    /// 新任务：必要时套用只读短路
    pub fn new(task_text: &str, template: ProcessTemplate) -> Self {
        let template = if is_read_only_task(task_text) {
            ProcessTemplate {
                states: vec![FsmState::Decompose, FsmState::Assess, FsmState::Complete],
                ..template
            }
        } else {
            template
        };
        let current = template.states.first().copied().unwrap_or(FsmState::Decompose);
        Self {
            template,
            idx: 0,
            current,
            state_history: Vec::new(),
            policy_result: None,
            escalation_reason: String::new(),
            failure_reason: String::new(),
            requires_hitl: false,
            approval_count: 0,
            restored_from_checkpoint: false,
        }
    }

    /// 从检查点恢复；不重跑 DECOMPOSE 与分类
    pub fn resume(template: ProcessTemplate, checkpoint: &FsmCheckpoint) -> Self {
        let idx = checkpoint.state_idx.min(template.states.len());
        let current = template.states.get(idx).copied().unwrap_or(FsmState::Complete);
        Self {
            template,
            idx,
            current,
            state_history: checkpoint.state_history.clone(),
            policy_result: None,
            escalation_reason: String::new(),
            failure_reason: String::new(),
            requires_hitl: checkpoint.requires_hitl,
            approval_count: 0,
            restored_from_checkpoint: true,
        }
    }

    pub fn current_state(&self) -> FsmState {
        self.current
    }

    pub fn process_type(&self) -> &str {
        &self.template.name
    }

    pub fn template(&self) -> &ProcessTemplate {
        &self.template
    }

    pub fn state_sequence(&self) -> &[FsmState] {
        &self.template.states
    }

    pub fn is_terminal(&self) -> bool {
        self.current.is_terminal()
    }

    pub fn requires_hitl(&self) -> bool {
        self.requires_hitl
    }

    pub fn was_restored(&self) -> bool {
        self.restored_from_checkpoint
    }

    pub fn escalation_reason(&self) -> &str {
        &self.escalation_reason
    }

    /// 推进到下一状态
    ///
    /// 不变量：策略记录了 passed=false 时 MUTATE 不可达，改道 ESCALATE。
    pub fn advance(&mut self) -> FsmState {
        self.state_history.push(self.current.as_str().to_string());
        self.idx += 1;
        let next = self
            .template
            .states
            .get(self.idx)
            .copied()
            .unwrap_or(FsmState::Complete);

        if next == FsmState::Mutate {
            if let Some(policy) = &self.policy_result {
                if !policy.passed {
                    self.current = FsmState::Escalate;
                    self.escalation_reason = policy.summary.clone();
                    self.requires_hitl = true;
                    return self.current;
                }
            }
        }

        self.current = next;
        self.current
    }

    pub fn fail(&mut self, reason: impl Into<String>) -> FsmState {
        self.state_history.push(self.current.as_str().to_string());
        self.current = FsmState::Failed;
        self.failure_reason = reason.into();
        self.current
    }

    pub fn escalate(&mut self, reason: impl Into<String>) -> FsmState {
        self.state_history.push(self.current.as_str().to_string());
        self.current = FsmState::Escalate;
        self.escalation_reason = reason.into();
        self.requires_hitl = true;
        self.current
    }

    /// 在 POLICY_CHECK 应用确定性评估结果
    pub fn apply_policy(&mut self, result: PolicyResult) -> FsmState {
        if !result.passed && result.escalation_required {
            let summary = result.summary.clone();
            self.policy_result = Some(result);
            return self.escalate(summary);
        }
        if result.requires_approval {
            self.requires_hitl = true;
        }
        self.policy_result = Some(result);
        self.advance()
    }

    pub fn set_policy_result(&mut self, result: PolicyResult) {
        if result.requires_approval {
            self.requires_hitl = true;
        }
        self.policy_result = Some(result);
    }

    pub fn policy_result(&self) -> Option<&PolicyResult> {
        self.policy_result.as_ref()
    }

    /// 多检查点流程：从 MUTATE 折返 APPROVAL_GATE（如 5 道门的迁移）
    pub fn reopen_approval_gate(&mut self) {
        if self.current != FsmState::Mutate {
            return;
        }
        if let Some(gate_idx) = self.template.states[..self.idx]
            .iter()
            .rposition(|s| *s == FsmState::ApprovalGate)
        {
            self.state_history.push(FsmState::Mutate.as_str().to_string());
            self.idx = gate_idx;
            self.current = FsmState::ApprovalGate;
            self.approval_count += 1;
        }
    }

    pub fn checkpoint(&self) -> FsmCheckpoint {
        FsmCheckpoint {
            process_type: self.template.name.clone(),
            state_idx: self.idx.min(self.template.states.len()),
            state_history: self.state_history.clone(),
            requires_hitl: self.requires_hitl,
        }
    }

    /// 当前状态的阶段 prompt：流程名、阶段历史、指令、工具感知
    pub fn build_phase_prompt(&self, available_tools: &[ToolSchema]) -> String {
        let state = self.current;
        let process = crate::budget::title_case(&self.template.name);
        let mut history: Vec<&str> = self.state_history.iter().map(|s| s.as_str()).collect();
        history.push(state.as_str());

        let mut lines = vec![
            format!("## Business Process: {}", process),
            format!("## Execution Phase: {}", state.as_str()),
            format!("## Phase History: {}", history.join(" → ")),
            String::new(),
        ];

        let instruction = match state {
            FsmState::Escalate => format!(
                "ESCALATION REQUIRED: {}\nDo not attempt to resolve this yourself. \
                 Explain clearly why escalation is needed and who must act.",
                if self.escalation_reason.is_empty() {
                    "policy escalation"
                } else {
                    &self.escalation_reason
                }
            ),
            FsmState::Failed => format!(
                "FAILED: {}\nExplain what went wrong and what the next step should be.",
                if self.failure_reason.is_empty() {
                    "unknown error"
                } else {
                    &self.failure_reason
                }
            ),
            _ => self
                .template
                .instruction_for(state)
                .map(|s| s.to_string())
                .unwrap_or_else(|| {
                    format!("Execute the {} phase for this {} process.", state.as_str(), process)
                }),
        };
        lines.push(instruction);

        // 工具感知：各状态点名相关工具，帮模型聚焦
        if !available_tools.is_empty() {
            let names: Vec<&str> = available_tools.iter().map(|t| t.name.as_str()).collect();
            match state {
                FsmState::Assess => {
                    let read: Vec<&str> = names
                        .iter()
                        .filter(|n| tools::hitl::classify(n) == tools::hitl::ToolClass::Read)
                        .copied()
                        .collect();
                    if !read.is_empty() {
                        lines.push(format!("\nAvailable read tools: {}", read[..read.len().min(12)].join(", ")));
                    }
                }
                FsmState::Mutate => {
                    let mutate: Vec<&str> = names
                        .iter()
                        .filter(|n| tools::hitl::classify(n) == tools::hitl::ToolClass::Mutate)
                        .copied()
                        .collect();
                    if !mutate.is_empty() {
                        lines.push(format!(
                            "\nAvailable mutation tools: {}",
                            mutate[..mutate.len().min(12)].join(", ")
                        ));
                    }
                }
                FsmState::ScheduleNotify => {
                    let notify: Vec<&str> = names
                        .iter()
                        .filter(|n| {
                            ["send_", "notify_", "schedule_", "post_", "email_"]
                                .iter()
                                .any(|p| n.starts_with(p))
                        })
                        .copied()
                        .collect();
                    if !notify.is_empty() {
                        lines.push(format!(
                            "\nAvailable notify/schedule tools: {}",
                            notify[..notify.len().min(8)].join(", ")
                        ));
                    }
                }
                FsmState::Decompose => {
                    let hints = &self.template.connector_hints;
                    let relevant: Vec<&str> = names
                        .iter()
                        .filter(|n| hints.iter().any(|h| n.to_lowercase().contains(h)))
                        .copied()
                        .collect();
                    if !relevant.is_empty() {
                        lines.push(format!(
                            "\nConnectors available for this process: {}",
                            relevant[..relevant.len().min(8)].join(", ")
                        ));
                    } else {
                        lines.push(format!(
                            "\nAll available tools: {}",
                            names[..names.len().min(10)].join(", ")
                        ));
                    }
                }
                _ => {}
            }
        }

        if self.approval_count > 0 {
            lines.push(format!("\n[Multi-checkpoint: approval gate #{}]", self.approval_count + 1));
        }

        lines.join("\n")
    }

    pub fn summary(&self) -> serde_json::Value {
        serde_json::json!({
            "process_type": self.template.name,
            "final_state": self.current.as_str(),
            "state_history": self.state_history,
            "requires_hitl": self.requires_hitl,
            "escalation_reason": self.escalation_reason,
            "approval_count": self.approval_count,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fsm::templates::builtin_template;
    use serde_json::json;

    fn policy_failed() -> PolicyResult {
        let rules = vec![json!({"id": "V1", "condition": "variance > 2", "action": "block", "level": "manager"})];
        let ctx = json!({"variance": 2.23}).as_object().unwrap().clone();
        crate::policy::evaluate_rules(&rules, &ctx)
    }

    #[test]
    fn test_read_only_shortcircuit() {
        let template = builtin_template("order_management").unwrap();
        let runner = FsmRunner::new("What is the current status of order ORD-5", template);
        assert_eq!(
            runner.state_sequence(),
            &[FsmState::Decompose, FsmState::Assess, FsmState::Complete]
        );
    }

    #[test]
    fn test_action_task_keeps_full_sequence() {
        let template = builtin_template("order_management").unwrap();
        let runner = FsmRunner::new("Cancel item B and update the order total", template);
        assert!(runner.state_sequence().len() > 3);
    }

    #[test]
    fn test_monotonic_progression() {
        let template = builtin_template("general").unwrap();
        let mut runner = FsmRunner::new("Update the record for EMP-1", template);
        assert_eq!(runner.current_state(), FsmState::Decompose);
        assert_eq!(runner.advance(), FsmState::Assess);
        assert_eq!(runner.advance(), FsmState::Mutate);
        assert_eq!(runner.advance(), FsmState::Complete);
        assert!(runner.is_terminal());
    }

    #[test]
    fn test_mutate_unreachable_after_policy_failure() {
        let template = builtin_template("invoice_reconciliation").unwrap();
        let mut runner = FsmRunner::new("Approve invoice INV-A against PO-A", template);
        // DECOMPOSE → ASSESS → COMPUTE → POLICY_CHECK
        runner.advance();
        runner.advance();
        runner.advance();
        assert_eq!(runner.current_state(), FsmState::PolicyCheck);
        let next = runner.apply_policy(policy_failed());
        // block 不带 escalate 动作：推进时改道 ESCALATE，MUTATE 不可达
        assert_eq!(next, FsmState::Escalate);
        assert!(runner.requires_hitl());
    }

    #[test]
    fn test_checkpoint_roundtrip() {
        let template = builtin_template("hr_offboarding").unwrap();
        let mut runner = FsmRunner::new("Revoke access for EMP-7, last day today", template.clone());
        runner.advance();
        runner.advance();
        let cp = runner.checkpoint();
        assert_eq!(cp.process_type, "hr_offboarding");
        assert_eq!(cp.state_idx, 2);

        let resumed = FsmRunner::resume(template, &cp);
        assert!(resumed.was_restored());
        assert_eq!(resumed.current_state(), FsmState::PolicyCheck);
        assert_eq!(resumed.checkpoint().state_history.len(), 2);
    }

    #[test]
    fn test_checkpoint_state_idx_always_valid() {
        let template = builtin_template("general").unwrap();
        let cp = FsmCheckpoint {
            process_type: "general".into(),
            state_idx: 99,
            state_history: vec![],
            requires_hitl: false,
        };
        let resumed = FsmRunner::resume(template, &cp);
        assert_eq!(resumed.current_state(), FsmState::Complete);
    }

    #[test]
    fn test_reopen_approval_gate() {
        let template = builtin_template("subscription_migration").unwrap();
        let mut runner = FsmRunner::new("Migrate ACC-1 to the annual plan and refund the delta", template);
        while runner.current_state() != FsmState::Mutate && !runner.is_terminal() {
            runner.advance();
        }
        assert_eq!(runner.current_state(), FsmState::Mutate);
        runner.reopen_approval_gate();
        assert_eq!(runner.current_state(), FsmState::ApprovalGate);
        let prompt = runner.build_phase_prompt(&[]);
        assert!(prompt.contains("Multi-checkpoint: approval gate #2"));
    }

    #[test]
    fn test_phase_prompt_tool_awareness() {
        let template = builtin_template("general").unwrap();
        let mut runner = FsmRunner::new("Update the record", template);
        runner.advance(); // ASSESS
        let tools = vec![
            ToolSchema::new("get_record", ""),
            ToolSchema::new("update_record", ""),
        ];
        let prompt = runner.build_phase_prompt(&tools);
        assert!(prompt.contains("Available read tools: get_record"));
        assert!(!prompt.contains("Available mutation tools"));
    }
}
