//! FSM 层：状态定义、流程模板数据层、分类器、合成器、执行器

pub mod classifier;
pub mod runner;
pub mod synthesis;
pub mod templates;

pub use classifier::{classify_process_type, is_known_type};
pub use runner::{is_read_only_task, FsmCheckpoint, FsmRunner};
pub use synthesis::TemplateSynthesizer;
pub use templates::{
    builtin_template, detect_process_type, is_builtin, FsmState, ProcessTemplate, RiskLevel,
    CANONICAL_ORDER,
};
