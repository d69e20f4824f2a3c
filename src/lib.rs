//! Hornet - 企业流程智能体服务
//!
//! 模块划分：
//! - **config**: 应用配置加载（TOML + 环境变量）
//! - **core**: 错误分类、工具失败恢复
//! - **llm**: LLM 客户端抽象与实现（Anthropic messages / Mock），快/强两档
//! - **policy**: 确定性策略规则评估（零 LLM）
//! - **budget**: 每任务 token 预算与按状态选模型
//! - **privacy**: PRIME 阶段隐私快速拒绝
//! - **fsm**: 8 状态机、15 个内置流程模板、分类器、模板合成器
//! - **tools**: 分层工具栈（核验 / 恢复 / schema 纠正 / 分页 / 直调）、
//!   财务原语、动态工具注册表与沙箱
//! - **memory**: 会话、RL 案例日志、UCB1 老虎机、知识库、实体记忆
//! - **exec**: 三个可互换执行策略与执行后校验
//! - **worker**: PRIME / EXECUTE / REFLECT 编排
//! - **server**: JSON-RPC 2.0 传输层（tasks/send）、健康与能力端点

pub mod budget;
pub mod config;
pub mod core;
pub mod exec;
pub mod fsm;
pub mod llm;
pub mod memory;
pub mod observability;
pub mod policy;
pub mod privacy;
pub mod server;
pub mod tools;
pub mod worker;
