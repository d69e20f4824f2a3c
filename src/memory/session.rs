//! 会话存储：多轮 A2A 上下文、FSM 检查点与 schema 纠正缓存
//!
//! 每个 session_id 一份上下文；超过 20 条原始轮次先做内联压缩（保留最近 6 条），
//! REFLECT 阶段再用快档 LLM 把压缩块升级成真正的摘要。闲置 1 小时淘汰。
//! 同一会话上的操作经由条目级 Mutex 串行化，并发请求不会交错写检查点。
//! 会话只存内存：进程崩溃丢失在途会话是可接受的（客户端换新会话重试）。

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{Mutex, RwLock};

use crate::fsm::FsmCheckpoint;
use crate::llm::{CompletionRequest, LlmClient, ModelTier};

const MAX_SESSION_AGE: Duration = Duration::from_secs(3600);
const MAX_RAW_TURNS: usize = 20;
const KEEP_RECENT: usize = 6;
const COMPRESS_TIMEOUT: Duration = Duration::from_secs(15);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnRole {
    User,
    Assistant,
}

#[derive(Debug, Clone)]
pub struct Turn {
    pub role: TurnRole,
    pub content: String,
    pub at: Instant,
}

/// 单个会话的全部状态
#[derive(Debug, Default)]
pub struct Session {
    pub turns: Vec<Turn>,
    pub compressed_summary: String,
    pub checkpoint: Option<FsmCheckpoint>,
    /// schema 纠正缓存：`tool:bad_column` → corrected_column
    pub schema_cache: HashMap<String, String>,
    last_active: Option<Instant>,
}

impl Session {
    fn touch(&mut self) {
        self.last_active = Some(Instant::now());
    }

    /// 内联压缩：老轮次截断进 summary，不调 LLM
    fn compress_inline(&mut self) {
        if self.turns.len() <= MAX_RAW_TURNS {
            return;
        }
        let split = self.turns.len() - KEEP_RECENT;
        let older: Vec<Turn> = self.turns.drain(..split).collect();
        let lines: Vec<String> = older
            .iter()
            .map(|t| {
                let label = if t.role == TurnRole::User { "User" } else { "Agent" };
                let content: String = t.content.chars().take(200).collect();
                format!("{}: {}", label, content)
            })
            .collect();
        let block = lines.join("\n");
        if self.compressed_summary.is_empty() {
            self.compressed_summary = block;
        } else {
            self.compressed_summary = format!("{}\n\n{}", self.compressed_summary, block);
        }
    }

    /// 拼 system prompt 注入块：摘要 + 最近轮次；首轮返回空
    pub fn context_prompt(&self) -> String {
        if self.compressed_summary.is_empty() && self.turns.is_empty() {
            return String::new();
        }
        let mut parts = Vec::new();
        if !self.compressed_summary.is_empty() {
            parts.push(format!("## Prior Conversation Summary\n{}", self.compressed_summary));
        }
        let recent = &self.turns[self.turns.len().saturating_sub(KEEP_RECENT)..];
        if !recent.is_empty() {
            parts.push("## Recent Conversation".to_string());
            for t in recent {
                let label = if t.role == TurnRole::User { "User" } else { "Agent" };
                let content: String = t.content.chars().take(400).collect();
                parts.push(format!("{}: {}", label, content));
            }
        }
        parts.join("\n")
    }
}

/// 会话表：RwLock<HashMap> + 条目级 Mutex
#[derive(Default)]
pub struct SessionStore {
    sessions: RwLock<HashMap<String, Arc<Mutex<Session>>>>,
}

impl SessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// 取或建会话条目；顺带淘汰过期会话
    pub async fn get_or_create(&self, session_id: &str) -> Arc<Mutex<Session>> {
        self.evict_stale().await;
        {
            let read = self.sessions.read().await;
            if let Some(entry) = read.get(session_id) {
                return Arc::clone(entry);
            }
        }
        let mut write = self.sessions.write().await;
        Arc::clone(
            write
                .entry(session_id.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(Session::default()))),
        )
    }

    pub async fn add_turn(&self, session_id: &str, role: TurnRole, content: &str) {
        let entry = self.get_or_create(session_id).await;
        let mut session = entry.lock().await;
        session.turns.push(Turn {
            role,
            content: content.to_string(),
            at: Instant::now(),
        });
        session.touch();
        session.compress_inline();
    }

    pub async fn context_prompt(&self, session_id: &str) -> String {
        let read = self.sessions.read().await;
        match read.get(session_id) {
            Some(entry) => entry.lock().await.context_prompt(),
            None => String::new(),
        }
    }

    pub async fn is_multi_turn(&self, session_id: &str) -> bool {
        let read = self.sessions.read().await;
        match read.get(session_id) {
            Some(entry) => {
                let s = entry.lock().await;
                !s.turns.is_empty() || !s.compressed_summary.is_empty()
            }
            None => false,
        }
    }

    pub async fn save_checkpoint(&self, session_id: &str, checkpoint: FsmCheckpoint) {
        let entry = self.get_or_create(session_id).await;
        let mut session = entry.lock().await;
        session.checkpoint = Some(checkpoint);
        session.touch();
    }

    pub async fn checkpoint(&self, session_id: &str) -> Option<FsmCheckpoint> {
        let read = self.sessions.read().await;
        match read.get(session_id) {
            Some(entry) => entry.lock().await.checkpoint.clone(),
            None => None,
        }
    }

    pub async fn schema_cache_get(&self, session_id: &str, key: &str) -> Option<String> {
        let read = self.sessions.read().await;
        match read.get(session_id) {
            Some(entry) => entry.lock().await.schema_cache.get(key).cloned(),
            None => None,
        }
    }

    pub async fn schema_cache_insert(&self, session_id: &str, key: String, value: String) {
        let entry = self.get_or_create(session_id).await;
        let mut session = entry.lock().await;
        session.schema_cache.insert(key, value);
        session.touch();
    }

    pub async fn schema_cache_snapshot(&self, session_id: &str) -> HashMap<String, String> {
        let read = self.sessions.read().await;
        match read.get(session_id) {
            Some(entry) => entry.lock().await.schema_cache.clone(),
            None => HashMap::new(),
        }
    }

    pub async fn active_count(&self) -> usize {
        self.sessions.read().await.len()
    }

    /// 把内联压缩块升级成快档 LLM 摘要；15s 超时直接放弃，不报错
    pub async fn compress_with_llm(&self, session_id: &str, llm: &dyn LlmClient) {
        let summary_source = {
            let read = self.sessions.read().await;
            match read.get(session_id) {
                Some(entry) => {
                    let s = entry.lock().await;
                    if s.compressed_summary.len() < 800 {
                        return; // 还不值得一次 LLM 调用
                    }
                    s.compressed_summary.clone()
                }
                None => return,
            }
        };

        let req = CompletionRequest::new(
            ModelTier::Fast,
            "",
            format!(
                "Summarize this conversation excerpt (max 200 words). \
                 Preserve key goals, facts, decisions, in-progress items:\n\n{}",
                summary_source
            ),
        )
        .with_max_tokens(512)
        .with_timeout(COMPRESS_TIMEOUT.as_secs());

        let result = tokio::time::timeout(COMPRESS_TIMEOUT, llm.complete(&req)).await;
        if let Ok(Ok(summary)) = result {
            if !summary.trim().is_empty() {
                let read = self.sessions.read().await;
                if let Some(entry) = read.get(session_id) {
                    let mut s = entry.lock().await;
                    s.compressed_summary = summary.trim().to_string();
                }
            }
        }
    }

    async fn evict_stale(&self) {
        let mut stale = Vec::new();
        {
            let read = self.sessions.read().await;
            for (sid, entry) in read.iter() {
                if let Ok(session) = entry.try_lock() {
                    if let Some(last) = session.last_active {
                        if last.elapsed() > MAX_SESSION_AGE {
                            stale.push(sid.clone());
                        }
                    }
                }
            }
        }
        if !stale.is_empty() {
            let mut write = self.sessions.write().await;
            for sid in stale {
                write.remove(&sid);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_first_turn_has_empty_context() {
        let store = SessionStore::new();
        assert_eq!(store.context_prompt("s1").await, "");
        assert!(!store.is_multi_turn("s1").await);
    }

    #[tokio::test]
    async fn test_turns_and_context() {
        let store = SessionStore::new();
        store.add_turn("s1", TurnRole::User, "approve INV-1").await;
        store.add_turn("s1", TurnRole::Assistant, "approved").await;
        assert!(store.is_multi_turn("s1").await);
        let ctx = store.context_prompt("s1").await;
        assert!(ctx.contains("User: approve INV-1"));
        assert!(ctx.contains("Agent: approved"));
    }

    #[tokio::test]
    async fn test_inline_compression_bounds_raw_turns() {
        let store = SessionStore::new();
        for i in 0..30 {
            store.add_turn("s1", TurnRole::User, &format!("turn {}", i)).await;
        }
        let entry = store.get_or_create("s1").await;
        let session = entry.lock().await;
        assert!(session.turns.len() <= MAX_RAW_TURNS);
        assert!(!session.compressed_summary.is_empty());
        // 最近轮次仍然原样保留
        assert!(session.turns.iter().any(|t| t.content == "turn 29"));
    }

    #[tokio::test]
    async fn test_checkpoint_roundtrip() {
        let store = SessionStore::new();
        let cp = FsmCheckpoint {
            process_type: "hr_offboarding".into(),
            state_idx: 3,
            state_history: vec!["DECOMPOSE".into()],
            requires_hitl: true,
        };
        store.save_checkpoint("s1", cp).await;
        let loaded = store.checkpoint("s1").await.unwrap();
        assert_eq!(loaded.process_type, "hr_offboarding");
        assert_eq!(loaded.state_idx, 3);
        assert!(store.checkpoint("other").await.is_none());
    }

    #[tokio::test]
    async fn test_schema_cache() {
        let store = SessionStore::new();
        store
            .schema_cache_insert("s1", "get_invoice:amt".into(), "amount".into())
            .await;
        assert_eq!(
            store.schema_cache_get("s1", "get_invoice:amt").await.as_deref(),
            Some("amount")
        );
        assert!(store.schema_cache_get("s2", "get_invoice:amt").await.is_none());
    }
}
