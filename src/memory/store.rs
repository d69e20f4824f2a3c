//! 原子 JSON 存储：小型嵌入式 KV 的最低限度实现
//!
//! 所有持久化状态文件（case_log.json / tool_registry.json / strategy_bandit.json
//! / knowledge_base.json / entity_memory.json / synthesized_definitions.json）
//! 都经由这里写盘：写临时文件 + rename 原子替换，单文件单写者由互斥锁保证。
//! 读不加文件锁，读到的总是最近一次完成的原子提交。

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use serde::de::DeserializeOwned;
use serde::Serialize;

/// 单个 JSON 状态文件；Clone 共享同一把写锁
#[derive(Clone)]
pub struct JsonStore {
    path: PathBuf,
    write_lock: Arc<Mutex<()>>,
}

impl JsonStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Arc::new(Mutex::new(())),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// 读取并反序列化；文件缺失或损坏返回 None（损坏不致命，冷启动视同为空）
    pub fn load<T: DeserializeOwned>(&self) -> Option<T> {
        let data = std::fs::read_to_string(&self.path).ok()?;
        match serde_json::from_str(&data) {
            Ok(v) => Some(v),
            Err(e) => {
                tracing::warn!(path = %self.path.display(), error = %e, "state file corrupt, starting empty");
                None
            }
        }
    }

    pub fn load_or_default<T: DeserializeOwned + Default>(&self) -> T {
        self.load().unwrap_or_default()
    }

    /// 原子写：临时文件 + rename；失败只告警，绝不让持久化拖垮任务
    pub fn save<T: Serialize>(&self, value: &T) {
        if let Err(e) = self.try_save(value) {
            tracing::warn!(path = %self.path.display(), error = %e, "state file write failed");
        }
    }

    pub fn try_save<T: Serialize>(&self, value: &T) -> anyhow::Result<()> {
        let _guard = self.write_lock.lock().unwrap();
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(value)?;
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, json)?;
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_roundtrip() {
        let dir = TempDir::new().unwrap();
        let store = JsonStore::new(dir.path().join("state.json"));
        store.save(&vec![1, 2, 3]);
        let loaded: Vec<i32> = store.load_or_default();
        assert_eq!(loaded, vec![1, 2, 3]);
    }

    #[test]
    fn test_missing_file_is_default() {
        let dir = TempDir::new().unwrap();
        let store = JsonStore::new(dir.path().join("absent.json"));
        let loaded: Vec<i32> = store.load_or_default();
        assert!(loaded.is_empty());
    }

    #[test]
    fn test_corrupt_file_is_default() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("bad.json");
        std::fs::write(&path, "{{{not json").unwrap();
        let store = JsonStore::new(path);
        let loaded: Vec<i32> = store.load_or_default();
        assert!(loaded.is_empty());
    }

    #[test]
    fn test_no_tmp_file_left_behind() {
        let dir = TempDir::new().unwrap();
        let store = JsonStore::new(dir.path().join("state.json"));
        store.save(&serde_json::json!({"k": "v"}));
        assert!(!dir.path().join("state.json.tmp").exists());
    }
}
