use super::{KeyValueStore, KvError};
use async_trait::async_trait;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Mutex;

/// In-process store used when no etcd endpoint is configured, and in tests
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

#[derive(Default)]
struct Inner {
    leaves: BTreeMap<String, String>,
    dirs: BTreeSet<String>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        // A panic while holding the lock leaves plain maps behind; keep serving them
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn normalize(key: &str) -> String {
    format!("/{}", key.trim_matches('/'))
}

fn dir_prefix(dir: &str) -> String {
    let dir = normalize(dir);
    if dir == "/" {
        dir
    } else {
        format!("{}/", dir)
    }
}

#[async_trait]
impl KeyValueStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<String>, KvError> {
        Ok(self.lock().leaves.get(&normalize(key)).cloned())
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), KvError> {
        self.lock().leaves.insert(normalize(key), value.to_string());
        Ok(())
    }

    async fn create(&self, key: &str, value: &str) -> Result<bool, KvError> {
        let mut inner = self.lock();
        let key = normalize(key);
        if inner.leaves.contains_key(&key) {
            return Ok(false);
        }
        inner.leaves.insert(key, value.to_string());
        Ok(true)
    }

    async fn delete(&self, key: &str) -> Result<bool, KvError> {
        let mut inner = self.lock();
        let key = normalize(key);
        let prefix = dir_prefix(&key);

        let mut removed = inner.leaves.remove(&key).is_some();
        removed |= inner.dirs.remove(&key);

        let before = inner.leaves.len() + inner.dirs.len();
        inner.leaves.retain(|k, _| !k.starts_with(&prefix));
        inner.dirs.retain(|d| !d.starts_with(&prefix));
        removed |= inner.leaves.len() + inner.dirs.len() != before;

        Ok(removed)
    }

    async fn list(&self, dir: &str) -> Result<Vec<(String, String)>, KvError> {
        let inner = self.lock();
        let prefix = dir_prefix(dir);
        Ok(inner
            .leaves
            .iter()
            .filter(|(k, _)| {
                k.strip_prefix(&prefix)
                    .map(|rest| !rest.is_empty() && !rest.contains('/'))
                    .unwrap_or(false)
            })
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }

    async fn mkdir(&self, dir: &str) -> Result<(), KvError> {
        self.lock().dirs.insert(normalize(dir));
        Ok(())
    }
}
