//! UCB1 策略老虎机：按流程类型学习三个执行策略的优劣
//!
//! 臂：fsm（默认结构化）/ five_phase（复杂多步）/ moa（纯推理与数值）。
//! 评分 Q(arm) + √2·√(ln N / n(arm))；未试过的臂优先（fsm 最先），
//! 奖励为任务质量分，增量均值更新。状态落盘 strategy_bandit.json。

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::memory::store::JsonStore;

pub const STRATEGIES: [&str; 3] = ["fsm", "five_phase", "moa"];

const EXPLORATION_C: f64 = std::f64::consts::SQRT_2;

/// 单臂统计
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Arm {
    pub q: f64,
    pub n: u64,
}

impl Default for Arm {
    fn default() -> Self {
        Self { q: 0.5, n: 0 }
    }
}

type BanditState = HashMap<String, HashMap<String, Arm>>;

/// 策略老虎机：内存态 + JsonStore
pub struct StrategyBandit {
    store: JsonStore,
    lock: std::sync::Mutex<()>,
}

impl StrategyBandit {
    pub fn new(store: JsonStore) -> Self {
        Self {
            store,
            lock: std::sync::Mutex::new(()),
        }
    }

    fn arms_for<'a>(state: &'a mut BanditState, process_type: &str) -> &'a mut HashMap<String, Arm> {
        state.entry(process_type.to_string()).or_insert_with(|| {
            STRATEGIES
                .iter()
                .map(|s| (s.to_string(), Arm::default()))
                .collect()
        })
    }

    /// UCB1 选臂；全新流程类型返回 fsm
    pub fn select_strategy(&self, process_type: &str) -> String {
        let _guard = self.lock.lock().unwrap();
        let mut state: BanditState = self.store.load_or_default();
        let arms = Self::arms_for(&mut state, process_type);

        // 未访问的臂优先探索；fsm 是最可靠的首选
        let unvisited: Vec<&String> = arms.iter().filter(|(_, a)| a.n == 0).map(|(k, _)| k).collect();
        if !unvisited.is_empty() {
            if unvisited.iter().any(|s| *s == "fsm") {
                return "fsm".to_string();
            }
            return unvisited[0].clone();
        }

        let total: u64 = arms.values().map(|a| a.n).sum();
        let ln_total = (total as f64).ln();
        let mut best = ("fsm".to_string(), f64::NEG_INFINITY);
        for (name, arm) in arms.iter() {
            let ucb1 = arm.q + EXPLORATION_C * (ln_total / arm.n as f64).sqrt();
            if ucb1 > best.1 {
                best = (name.clone(), ucb1);
            }
        }
        best.0
    }

    /// 回填奖励：Q_new = Q_old + (reward − Q_old) / n_new
    pub fn record_outcome(&self, process_type: &str, strategy: &str, reward: f64) {
        let _guard = self.lock.lock().unwrap();
        let mut state: BanditState = self.store.load_or_default();
        let arms = Self::arms_for(&mut state, process_type);
        let arm = arms.entry(strategy.to_string()).or_default();
        arm.n += 1;
        arm.q += (reward - arm.q) / arm.n as f64;
        self.store.save(&state);
    }

    pub fn arm(&self, process_type: &str, strategy: &str) -> Arm {
        let state: BanditState = self.store.load_or_default();
        state
            .get(process_type)
            .and_then(|arms| arms.get(strategy))
            .cloned()
            .unwrap_or_default()
    }

    pub fn stats(&self) -> serde_json::Value {
        let state: BanditState = self.store.load_or_default();
        let total_pulls: u64 = state
            .values()
            .flat_map(|arms| arms.values())
            .map(|a| a.n)
            .sum();
        let best_arms: HashMap<&String, String> = state
            .iter()
            .filter(|(_, arms)| arms.values().any(|a| a.n > 0))
            .map(|(pt, arms)| {
                let best = arms
                    .iter()
                    .max_by(|a, b| a.1.q.partial_cmp(&b.1.q).unwrap())
                    .map(|(name, _)| name.clone())
                    .unwrap_or_default();
                (pt, best)
            })
            .collect();
        serde_json::json!({
            "total_pulls": total_pulls,
            "process_types_learned": state.len(),
            "best_arms": best_arms,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn bandit(dir: &TempDir) -> StrategyBandit {
        StrategyBandit::new(JsonStore::new(dir.path().join("strategy_bandit.json")))
    }

    #[test]
    fn test_first_pull_is_fsm() {
        let dir = TempDir::new().unwrap();
        let b = bandit(&dir);
        assert_eq!(b.select_strategy("expense_approval"), "fsm");
    }

    #[test]
    fn test_unvisited_arms_explored_before_exploitation() {
        let dir = TempDir::new().unwrap();
        let b = bandit(&dir);
        b.record_outcome("x", "fsm", 0.9);
        let second = b.select_strategy("x");
        assert_ne!(second, "fsm"); // fsm 已访问，先探索其余臂
    }

    #[test]
    fn test_incremental_mean_matches_true_mean() {
        let dir = TempDir::new().unwrap();
        let b = bandit(&dir);
        let rewards = [0.2, 0.9, 0.5, 0.7, 0.1];
        for r in rewards {
            b.record_outcome("x", "moa", r);
        }
        let arm = b.arm("x", "moa");
        assert_eq!(arm.n, rewards.len() as u64);
        let mean: f64 = rewards.iter().sum::<f64>() / rewards.len() as f64;
        assert!((arm.q - mean).abs() < 1e-9);
    }

    #[test]
    fn test_convergence_to_best_arm() {
        let dir = TempDir::new().unwrap();
        let b = bandit(&dir);
        // 30 轮，按真实奖励回填：fsm=0.8, five_phase=0.6, moa=0.4
        for _ in 0..30 {
            let strategy = b.select_strategy("proc");
            let reward = match strategy.as_str() {
                "fsm" => 0.8,
                "five_phase" => 0.6,
                _ => 0.4,
            };
            b.record_outcome("proc", &strategy, reward);
        }
        let fsm = b.arm("proc", "fsm");
        let five = b.arm("proc", "five_phase");
        let moa = b.arm("proc", "moa");
        assert!(fsm.q > five.q && five.q > moa.q);
        assert!(fsm.n > five.n && five.n >= moa.n);
        assert_eq!(b.select_strategy("proc"), "fsm");
    }

    #[test]
    fn test_persistence_across_instances() {
        let dir = TempDir::new().unwrap();
        {
            let b = bandit(&dir);
            b.record_outcome("x", "fsm", 0.75);
        }
        let b2 = bandit(&dir);
        let arm = b2.arm("x", "fsm");
        assert_eq!(arm.n, 1);
        assert!((arm.q - 0.75).abs() < 1e-9);
    }
}
