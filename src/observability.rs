//! 可观测性：tracing 初始化与全局指标
//!
//! - LLM 调用次数/token 消耗/错误率
//! - 工具调用次数/超时
//! - 任务数与平均质量分（/health 暴露）

use std::sync::atomic::{AtomicU64, Ordering};

use tracing_subscriber::{fmt, prelude::*, EnvFilter};

pub fn init() {
    tracing_subscriber::registry()
        .with(EnvFilter::from_default_env().add_directive("info".parse().unwrap()))
        .with(fmt::layer())
        .init();
}

/// 全局指标收集器
#[derive(Debug, Default)]
pub struct Metrics {
    pub llm_calls: AtomicU64,
    pub llm_failures: AtomicU64,
    pub tool_calls: AtomicU64,
    pub tool_failures: AtomicU64,
    pub tool_timeouts: AtomicU64,
    pub tasks_total: AtomicU64,
    pub tasks_refused: AtomicU64,
    pub tasks_failed: AtomicU64,
    /// 质量分累计（千分位定点，便于原子累加）
    quality_milli_sum: AtomicU64,
}

impl Metrics {
    pub fn global() -> &'static Metrics {
        static INSTANCE: std::sync::OnceLock<Metrics> = std::sync::OnceLock::new();
        INSTANCE.get_or_init(Metrics::default)
    }

    pub fn record_llm(&self, ok: bool) {
        self.llm_calls.fetch_add(1, Ordering::Relaxed);
        if !ok {
            self.llm_failures.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_tool(&self, ok: bool, timed_out: bool) {
        self.tool_calls.fetch_add(1, Ordering::Relaxed);
        if timed_out {
            self.tool_timeouts.fetch_add(1, Ordering::Relaxed);
        } else if !ok {
            self.tool_failures.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_task(&self, quality: f64, failed: bool) {
        self.tasks_total.fetch_add(1, Ordering::Relaxed);
        if failed {
            self.tasks_failed.fetch_add(1, Ordering::Relaxed);
        }
        self.quality_milli_sum
            .fetch_add((quality.clamp(0.0, 1.0) * 1000.0) as u64, Ordering::Relaxed);
    }

    pub fn avg_quality(&self) -> f64 {
        let n = self.tasks_total.load(Ordering::Relaxed);
        if n == 0 {
            return 0.0;
        }
        self.quality_milli_sum.load(Ordering::Relaxed) as f64 / 1000.0 / n as f64
    }

    /// 导出为 JSON，/health 端点使用
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::json!({
            "llm": {
                "calls": self.llm_calls.load(Ordering::Relaxed),
                "failures": self.llm_failures.load(Ordering::Relaxed),
            },
            "tools": {
                "calls": self.tool_calls.load(Ordering::Relaxed),
                "failures": self.tool_failures.load(Ordering::Relaxed),
                "timeouts": self.tool_timeouts.load(Ordering::Relaxed),
            },
            "tasks": {
                "total": self.tasks_total.load(Ordering::Relaxed),
                "refused": self.tasks_refused.load(Ordering::Relaxed),
                "failed": self.tasks_failed.load(Ordering::Relaxed),
                "avg_quality": (self.avg_quality() * 1000.0).round() / 1000.0,
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_avg_quality() {
        let m = Metrics::default();
        m.record_task(0.8, false);
        m.record_task(0.4, true);
        assert!((m.avg_quality() - 0.6).abs() < 1e-9);
        assert_eq!(m.tasks_failed.load(Ordering::Relaxed), 1);
    }
}
