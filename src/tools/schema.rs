//! 工具 schema：工具服务器返回的模型工具描述格式

use serde::{Deserialize, Serialize};

/// 单个工具的 schema（name / description / JSON-schema 入参）
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolSchema {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default = "default_input_schema")]
    pub input_schema: serde_json::Value,
}

fn default_input_schema() -> serde_json::Value {
    serde_json::json!({"type": "object"})
}

impl ToolSchema {
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            input_schema: default_input_schema(),
        }
    }
}

/// 生成 prompt 中的 Available tools 段落
pub fn tools_prompt_block(tools: &[ToolSchema]) -> String {
    if tools.is_empty() {
        return String::new();
    }
    let mut lines = vec!["## Available tools".to_string()];
    for t in tools {
        lines.push(format!("- {}: {}", t.name, t.description));
    }
    lines.join("\n")
}
