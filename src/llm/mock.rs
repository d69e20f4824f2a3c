//! Mock LLM 客户端（用于测试，无需 API）
//!
//! 预置应答队列按序出队；队列空时回显用户消息。可记录收到的请求供断言。

use std::collections::VecDeque;
use std::sync::Mutex;

use async_trait::async_trait;

use crate::core::WorkerError;
use crate::llm::{CompletionRequest, LlmClient};

/// Mock 客户端：按队列出队应答，记录请求历史
#[derive(Default)]
pub struct MockLlm {
    responses: Mutex<VecDeque<String>>,
    pub requests: Mutex<Vec<CompletionRequest>>,
}

impl MockLlm {
    pub fn new() -> Self {
        Self::default()
    }

    /// 预置一条应答（先进先出）
    pub fn push_response(&self, text: impl Into<String>) {
        self.responses.lock().unwrap().push_back(text.into());
    }

    pub fn with_responses(texts: &[&str]) -> Self {
        let mock = Self::new();
        for t in texts {
            mock.push_response(*t);
        }
        mock
    }

    pub fn request_count(&self) -> usize {
        self.requests.lock().unwrap().len()
    }
}

#[async_trait]
impl LlmClient for MockLlm {
    async fn complete(&self, req: &CompletionRequest) -> Result<String, WorkerError> {
        self.requests.lock().unwrap().push(req.clone());
        if let Some(resp) = self.responses.lock().unwrap().pop_front() {
            return Ok(resp);
        }
        Ok(format!("Echo from Mock: {}", req.user))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::ModelTier;

    #[tokio::test]
    async fn test_mock_queue_order() {
        let mock = MockLlm::with_responses(&["first", "second"]);
        let req = CompletionRequest::new(ModelTier::Fast, "", "hi");
        assert_eq!(mock.complete(&req).await.unwrap(), "first");
        assert_eq!(mock.complete(&req).await.unwrap(), "second");
        assert!(mock.complete(&req).await.unwrap().starts_with("Echo from Mock"));
        assert_eq!(mock.request_count(), 3);
    }
}
