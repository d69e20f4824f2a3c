//! 工具层：RPC 客户端、HITL 守卫、schema 漂移纠正、变更核验、分页、
//! 财务原语、动态工具注册表与沙箱

pub mod adapter;
pub mod client;
pub mod dynamic;
pub mod finance;
pub mod hitl;
pub mod paginate;
pub mod sandbox;
pub mod schema;
pub mod verifier;

pub use adapter::SchemaAdapter;
pub use client::ToolRpcClient;
pub use dynamic::DynamicToolRegistry;
pub use hitl::{classify, filter_tools, ToolClass};
pub use schema::ToolSchema;
pub use verifier::MutationVerifier;

use async_trait::async_trait;
use serde_json::Value;

/// 分层工具栈的统一调用面
///
/// 错误折叠进返回值的 `error` 字段而不是 Err：上层（纠正、恢复、核验）
/// 需要检视失败结果本身来决定下一步，soft failure 永不终止任务。
#[async_trait]
pub trait ToolInvoker: Send + Sync {
    async fn invoke(&self, tool_name: &str, params: Value) -> Value;
}

/// 结果是否带显式错误
pub fn is_error_result(result: &Value) -> bool {
    result
        .get("error")
        .map(|e| match e {
            Value::String(s) => !s.is_empty(),
            Value::Null => false,
            _ => true,
        })
        .unwrap_or(false)
}

pub(crate) fn error_text(result: &Value) -> String {
    result
        .get("error")
        .map(|e| match e {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        })
        .unwrap_or_default()
}
