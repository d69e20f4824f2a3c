//! 记忆层：会话、案例日志、修剪、老虎机、知识库、实体记忆、注入质量回路

pub mod bandit;
pub mod case_log;
pub mod context_rl;
pub mod entity;
pub mod knowledge;
pub mod pruner;
pub mod session;
pub mod store;

pub use bandit::{Arm, StrategyBandit, STRATEGIES};
pub use case_log::{extract_keywords, score_quality, score_quality_for, CaseEntry, CaseLog, MAX_CASES};
pub use context_rl::{check_context_accuracy, ContextAccuracy};
pub use entity::{extract_entities, EntityMemory, EntityRecord};
pub use knowledge::{KnowledgeBase, KnowledgeEntry};
pub use pruner::prune_case_log;
pub use session::{Session, SessionStore, Turn, TurnRole};
pub use store::JsonStore;
