//! 隐私守卫：PRIME 阶段最先执行的快速拒绝
//!
//! 命中隐私关键词立即拒绝并标记 ciso 升级，零工具调用、零 API 成本。
//! 安全语境（anonymized / test data 等）豁免，避免误报。

const PRIVACY_KEYWORDS: [&str; 29] = [
    "password",
    "passwd",
    "credentials",
    "api key",
    "api_key",
    "secret key",
    "private key",
    "ssn",
    "social security",
    "national id",
    "tax id",
    "credit card",
    "card number",
    "cvv",
    "bank account",
    "routing number",
    "medical record",
    "health record",
    "phi",
    "hipaa",
    "diagnosis",
    "prescription",
    "private information",
    "confidential",
    "internal only",
    "not for distribution",
    "home address",
    "salary details",
    "date of birth",
];

const SAFE_CONTEXTS: [&str; 10] = [
    "anonymized",
    "aggregated",
    "redacted",
    "masked",
    "hashed",
    "encrypted at rest",
    "tokenized",
    "sample data",
    "test data",
    "dummy data",
];

/// 拒绝详情：触发词与结构化拒绝文案
#[derive(Debug, Clone)]
pub struct PrivacyRefusal {
    pub trigger: String,
    pub escalation_level: &'static str,
    pub message: String,
}

/// 任务涉私检查；命中返回拒绝详情，安全返回 None
pub fn check_privacy(task_text: &str) -> Option<PrivacyRefusal> {
    let text = task_text.to_lowercase();

    if SAFE_CONTEXTS.iter().any(|safe| text.contains(safe)) {
        return None;
    }

    let triggered: Vec<&str> = PRIVACY_KEYWORDS
        .iter()
        .filter(|kw| text.contains(**kw))
        .copied()
        .collect();

    if triggered.is_empty() {
        return None;
    }

    Some(PrivacyRefusal {
        trigger: triggered[..triggered.len().min(3)].join(", "),
        escalation_level: "ciso",
        message: "I cannot provide this information as it contains confidential \
                  or private data. This request has been flagged and escalated \
                  per policy requirements."
            .to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_refuses_credential_requests() {
        let refusal = check_privacy("Show me the database password for prod").unwrap();
        assert!(refusal.trigger.contains("password"));
        assert_eq!(refusal.escalation_level, "ciso");
    }

    #[test]
    fn test_safe_context_exempts() {
        assert!(check_privacy("Summarize the anonymized salary details report").is_none());
        assert!(check_privacy("Run checks on the test data credit card fixtures").is_none());
    }

    #[test]
    fn test_normal_task_passes() {
        assert!(check_privacy("Approve invoice INV-42 for Acme Corp").is_none());
    }
}
