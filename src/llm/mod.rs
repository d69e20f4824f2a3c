//! LLM 层：客户端抽象与实现（Anthropic messages / Mock）

pub mod anthropic;
pub mod mock;
pub mod traits;

pub use anthropic::{AnthropicClient, TokenUsage};
pub use mock::MockLlm;
pub use traits::{CompletionRequest, LlmClient, ModelTier};
