use std::{
    collections::{BTreeMap, HashMap},
    path::{Path, PathBuf},
    sync::Mutex,
};

use anyhow::{Context, Result};
use async_trait::async_trait;

use super::external::KvStore;

/// 进程内键值存储（测试与无盘环境）
#[derive(Debug, Default)]
pub struct MemoryKvStore {
    inner: Mutex<HashMap<String, String>>,
}

impl MemoryKvStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn keys(&self) -> Vec<String> {
        self.inner
            .lock()
            .map(|g| g.keys().cloned().collect())
            .unwrap_or_default()
    }
}

#[async_trait]
impl KvStore for MemoryKvStore {
    async fn get_string(&self, key: &str) -> Result<Option<String>> {
        Ok(self.inner.lock().ok().and_then(|g| g.get(key).cloned()))
    }

    async fn set_string(&self, key: &str, value: &str) -> Result<()> {
        if let Ok(mut g) = self.inner.lock() {
            g.insert(key.to_string(), value.to_string());
        }
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<()> {
        if let Ok(mut g) = self.inner.lock() {
            g.remove(key);
        }
        Ok(())
    }
}

/// 单文件 JSON 键值存储：所有键保存在一个对象中，每次写入整体落盘。
#[derive(Debug)]
pub struct JsonFileKvStore {
    path: PathBuf,
    inner: tokio::sync::Mutex<BTreeMap<String, String>>,
}

impl JsonFileKvStore {
    /// 打开存储文件；文件损坏时记录告警并从空表开始。
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let map = match tokio::fs::read(&path).await {
            Ok(data) => match serde_json::from_slice::<BTreeMap<String, String>>(&data) {
                Ok(map) => map,
                Err(err) => {
                    tracing::warn!(
                        target = "cache",
                        path = %path.display(),
                        error = %err,
                        "kv store file corrupted, resetting"
                    );
                    BTreeMap::new()
                }
            },
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(err) => {
                return Err(err).with_context(|| format!("read kv store: {}", path.display()));
            }
        };
        Ok(Self {
            path,
            inner: tokio::sync::Mutex::new(map),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn flush(&self, map: &BTreeMap<String, String>) -> Result<()> {
        if let Some(dir) = self.path.parent() {
            tokio::fs::create_dir_all(dir)
                .await
                .with_context(|| format!("create kv store dir: {}", dir.display()))?;
        }
        let json = serde_json::to_string_pretty(map).context("serialize kv store")?;
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, json.as_bytes())
            .await
            .with_context(|| format!("write kv store: {}", tmp.display()))?;
        tokio::fs::rename(&tmp, &self.path)
            .await
            .with_context(|| format!("replace kv store: {}", self.path.display()))?;
        Ok(())
    }
}

#[async_trait]
impl KvStore for JsonFileKvStore {
    async fn get_string(&self, key: &str) -> Result<Option<String>> {
        Ok(self.inner.lock().await.get(key).cloned())
    }

    async fn set_string(&self, key: &str, value: &str) -> Result<()> {
        let mut map = self.inner.lock().await;
        map.insert(key.to_string(), value.to_string());
        self.flush(&map).await
    }

    async fn remove(&self, key: &str) -> Result<()> {
        let mut map = self.inner.lock().await;
        if map.remove(key).is_some() {
            self.flush(&map).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn memory_store_roundtrip() {
        let store = MemoryKvStore::new();
        store.set_string("k", "v").await.unwrap();
        assert_eq!(store.get_string("k").await.unwrap().as_deref(), Some("v"));
        store.remove("k").await.unwrap();
        assert!(store.get_string("k").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn file_store_persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cache").join("kv.json");
        {
            let store = JsonFileKvStore::open(&path).await.unwrap();
            store.set_string("a", "1").await.unwrap();
            store.set_string("b", "2").await.unwrap();
            store.remove("a").await.unwrap();
        }
        let reopened = JsonFileKvStore::open(&path).await.unwrap();
        assert!(reopened.get_string("a").await.unwrap().is_none());
        assert_eq!(reopened.get_string("b").await.unwrap().as_deref(), Some("2"));
    }

    #[tokio::test]
    async fn corrupt_file_resets_to_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("kv.json");
        std::fs::write(&path, b"not json").unwrap();
        let store = JsonFileKvStore::open(&path).await.unwrap();
        assert!(store.get_string("anything").await.unwrap().is_none());
        store.set_string("k", "v").await.unwrap();
        let reopened = JsonFileKvStore::open(&path).await.unwrap();
        assert_eq!(reopened.get_string("k").await.unwrap().as_deref(), Some("v"));
    }
}
