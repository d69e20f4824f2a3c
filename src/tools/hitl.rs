//! HITL 守卫：工具三分类与审批门状态下的变更工具屏蔽
//!
//! 分类优先级严格按序：compute 前缀 > read 前缀 > 默认 mutate。
//! 默认 mutate 的取舍：误把只读工具拦下只是多一次展示成本，
//! 漏放一个变更工具则是未经审批的状态修改。

use crate::fsm::FsmState;
use crate::tools::ToolSchema;
use crate::policy::PolicyResult;

/// 工具类别
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToolClass {
    Read,
    Compute,
    Mutate,
}

const COMPUTE_PREFIXES: [&str; 4] = ["calculate_", "compute_", "estimate_", "predict_"];

/// 本地计算工具族（财务原语 + 动态注册表的领域前缀）：纯计算、无副作用，
/// 归 compute 而不是吃默认 mutate
const LOCAL_CALC_PREFIXES: [&str; 10] = [
    "finance_", "stats_", "tax_", "risk_", "hr_", "ops_", "sc_", "dt_", "ar_", "numeric_",
];

const READ_PREFIXES: [&str; 9] = [
    "get_", "list_", "find_", "search_", "describe_", "fetch_", "read_", "show_", "query_",
];

/// 分类；检查顺序不可调换（calculate_ 同时命中 compute 与泛读前缀时必须归 compute）
pub fn classify(tool_name: &str) -> ToolClass {
    let name = tool_name.to_lowercase();
    if COMPUTE_PREFIXES.iter().any(|p| name.starts_with(p))
        || LOCAL_CALC_PREFIXES.iter().any(|p| name.starts_with(p))
    {
        return ToolClass::Compute;
    }
    if READ_PREFIXES.iter().any(|p| name.starts_with(p)) {
        return ToolClass::Read;
    }
    ToolClass::Mutate
}

/// 这些状态下变更工具从工具集中结构性移除
pub fn is_gated_state(state: FsmState) -> bool {
    matches!(
        state,
        FsmState::Assess | FsmState::ApprovalGate | FsmState::PolicyCheck | FsmState::Compute
    )
}

/// 过滤结果：可见工具集 + 屏蔽横幅（发生过滤时非空）
pub struct FilteredTools {
    pub visible: Vec<ToolSchema>,
    pub banner: String,
}

/// 按状态过滤工具集；在门控状态下移除 mutate 类并产出横幅
pub fn filter_tools(all_tools: &[ToolSchema], state: FsmState) -> FilteredTools {
    if !is_gated_state(state) {
        return FilteredTools {
            visible: all_tools.to_vec(),
            banner: String::new(),
        };
    }

    let (visible, blocked): (Vec<_>, Vec<_>) = all_tools
        .iter()
        .cloned()
        .partition(|t| classify(&t.name) != ToolClass::Mutate);

    let banner = if blocked.is_empty() {
        String::new()
    } else {
        format!(
            "MUTATION TOOLS BLOCKED AT {}. Produce an approval document instead.",
            state.as_str()
        )
    };

    FilteredTools { visible, banner }
}

/// 列出工具集中全部变更类工具名
pub fn mutate_tool_names(tools: &[ToolSchema]) -> Vec<String> {
    let mut names: Vec<String> = tools
        .iter()
        .filter(|t| classify(&t.name) == ToolClass::Mutate)
        .map(|t| t.name.clone())
        .collect();
    names.sort();
    names
}

/// APPROVAL_GATE 的完整 system prompt 区块：列出被屏蔽工具并强制产出审批文档
pub fn build_hitl_block_prompt(
    mutate_tools: &[String],
    policy_result: Option<&PolicyResult>,
    process_type: &str,
) -> String {
    if mutate_tools.is_empty() {
        return String::new();
    }

    let tool_list = mutate_tools
        .iter()
        .map(|t| format!("  - {}", t))
        .collect::<Vec<_>>()
        .join("\n");

    let policy_note = match policy_result {
        Some(r) if !r.passed => {
            let ids = r
                .triggered
                .iter()
                .map(|t| t.rule_id.as_str())
                .collect::<Vec<_>>()
                .join(", ");
            format!("\nPolicy gate triggered by: {}\n{}", ids, r.summary)
        }
        _ => String::new(),
    };

    let process_note = if process_type.is_empty() {
        String::new()
    } else {
        format!(" for {}", crate::budget::title_case(process_type))
    };

    format!(
        "\n## APPROVAL GATE — MUTATION BLOCKED{process_note}\n\n\
         The following tools are BLOCKED until human approval is received:\n{tool_list}\n{policy_note}\n\
         YOU MUST NOT call any of the blocked tools in this response.\n\n\
         Instead, produce an approval request with these exact sections:\n\
         1. PROPOSED ACTIONS — list every action you plan to take (tool name, parameters, amounts, IDs)\n\
         2. REASON — why each action is needed\n\
         3. POLICY STATUS — which rules triggered this gate and what approval level is required\n\
         4. RISK — what happens if approved vs. if rejected\n\
         5. APPROVAL REQUEST — \"Awaiting [approver role] approval before proceeding.\"\n\n\
         Your response IS the approval request document. Do not execute any actions.\n"
    )
}

/// 审批门检查：返回 (门是否生效, prompt 区块)
pub fn check_approval_gate(
    current_state: FsmState,
    tools: &[ToolSchema],
    policy_result: Option<&PolicyResult>,
    process_type: &str,
) -> (bool, String) {
    if current_state != FsmState::ApprovalGate {
        return (false, String::new());
    }
    let mutate_tools = mutate_tool_names(tools);
    if mutate_tools.is_empty() {
        return (false, String::new());
    }
    let prompt = build_hitl_block_prompt(&mutate_tools, policy_result, process_type);
    (true, prompt)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classification_priority() {
        // compute 前缀优先于泛读前缀；这是有记录的优先级 bug 的回归测试
        assert_eq!(classify("calculate_variance"), ToolClass::Compute);
        assert_eq!(classify("compute_total"), ToolClass::Compute);
        assert_eq!(classify("estimate_cost"), ToolClass::Compute);
        assert_eq!(classify("predict_churn"), ToolClass::Compute);
        assert_eq!(classify("get_invoice"), ToolClass::Read);
        assert_eq!(classify("list_orders"), ToolClass::Read);
        assert_eq!(classify("update_status"), ToolClass::Mutate);
        // 未知前缀默认 mutate：漏放比误拦危险
        assert_eq!(classify("escalate_ticket"), ToolClass::Mutate);
        assert_eq!(classify("finalize_order"), ToolClass::Mutate);
        // 本地计算族不吃默认 mutate，COMPUTE 状态下必须可见
        assert_eq!(classify("finance_variance_check"), ToolClass::Compute);
        assert_eq!(classify("stats_zscore"), ToolClass::Compute);
    }

    #[test]
    fn test_no_mutate_tool_survives_gated_states() {
        let tools = vec![
            ToolSchema::new("get_invoice", ""),
            ToolSchema::new("update_invoice", ""),
            ToolSchema::new("calculate_variance", ""),
            ToolSchema::new("escalate_ticket", ""),
        ];
        for state in [
            FsmState::Assess,
            FsmState::ApprovalGate,
            FsmState::PolicyCheck,
            FsmState::Compute,
        ] {
            let filtered = filter_tools(&tools, state);
            assert!(
                filtered.visible.iter().all(|t| classify(&t.name) != ToolClass::Mutate),
                "mutate tool visible at {}",
                state.as_str()
            );
            assert!(filtered.banner.contains("MUTATION TOOLS BLOCKED AT"));
            assert!(filtered.banner.contains(state.as_str()));
        }
    }

    #[test]
    fn test_mutate_visible_at_mutate_state() {
        let tools = vec![ToolSchema::new("update_invoice", "")];
        let filtered = filter_tools(&tools, FsmState::Mutate);
        assert_eq!(filtered.visible.len(), 1);
        assert!(filtered.banner.is_empty());
    }

    #[test]
    fn test_approval_gate_prompt() {
        let tools = vec![
            ToolSchema::new("update_invoice", ""),
            ToolSchema::new("get_invoice", ""),
        ];
        let (fires, prompt) = check_approval_gate(FsmState::ApprovalGate, &tools, None, "procurement");
        assert!(fires);
        assert!(prompt.contains("update_invoice"));
        assert!(!prompt.contains("- get_invoice"));
        assert!(prompt.contains("PROPOSED ACTIONS"));
        let (fires, _) = check_approval_gate(FsmState::Assess, &tools, None, "");
        assert!(!fires);
    }
}
