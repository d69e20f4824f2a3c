//! 核心层：错误分类与工具失败恢复

pub mod error;
pub mod recovery;

pub use error::WorkerError;
pub use recovery::{is_empty_result, RecoveryAgent};
