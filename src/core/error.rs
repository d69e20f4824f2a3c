//! Worker 错误类型与传播策略
//!
//! 组件级失败尽量在管线内部降级恢复；只有 InvalidPolicy / Fatal 会映射为
//! JSON-RPC 错误，PrivacyViolation 走结构化拒绝回复（零 API 成本）。

use thiserror::Error;

/// 任务执行过程中可能出现的错误（隐私、策略、工具、LLM、超时等）
#[derive(Error, Debug)]
pub enum WorkerError {
    /// 任务命中隐私关键词，PRIME 阶段直接拒绝
    #[error("Privacy violation: {0}")]
    PrivacyViolation(String),

    /// policy_doc 结构不合法（缺 rules 或非对象），映射为 -32602
    #[error("Invalid policy document: {0}")]
    InvalidPolicy(String),

    #[error("Tool call failed: {0}")]
    ToolCall(String),

    #[error("Tool timeout: {0}")]
    ToolTimeout(String),

    /// 5 层 schema 纠正全部失败；软失败，任务继续
    #[error("Schema drift unrecoverable: {0}")]
    SchemaDrift(String),

    /// 合成工具未通过测试用例或沙箱执行失败；丢弃该工具，任务继续
    #[error("Sandbox failure: {0}")]
    Sandbox(String),

    #[error("LLM error: {0}")]
    Llm(String),

    #[error("Json parse error: {0}")]
    JsonParse(String),

    /// 任务超过 120s 未完成，返回部分答案并记 failure
    #[error("Task timeout after {0}ms")]
    TaskTimeout(u64),

    /// 内部不变量被破坏，映射为 -32603（消息脱敏）
    #[error("Fatal: {0}")]
    Fatal(String),
}

impl WorkerError {
    /// 对应的 JSON-RPC 错误码；None 表示不作为传输层错误暴露
    pub fn jsonrpc_code(&self) -> Option<i64> {
        match self {
            WorkerError::InvalidPolicy(_) => Some(-32602),
            WorkerError::Fatal(_) => Some(-32603),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_jsonrpc_mapping() {
        assert_eq!(WorkerError::InvalidPolicy("x".into()).jsonrpc_code(), Some(-32602));
        assert_eq!(WorkerError::Fatal("x".into()).jsonrpc_code(), Some(-32603));
        assert_eq!(WorkerError::ToolCall("x".into()).jsonrpc_code(), None);
        assert_eq!(WorkerError::SchemaDrift("x".into()).jsonrpc_code(), None);
    }
}
