//! 按交付目标名加锁，串行化写入同一目标的组装结果。

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tokio::time;

/// Manages asynchronous mutexes keyed by storage-relative path.
#[derive(Debug, Default)]
pub struct LockManager {
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

#[derive(Debug)]
pub struct LockTimeout;

impl LockManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// 在给定超时时间内获取路径锁。
    pub async fn lock_path_with_timeout(
        &self,
        path: &str,
        timeout: Duration,
    ) -> Result<OwnedMutexGuard<()>, LockTimeout> {
        let key = normalize_lock_key(path);
        let lock = {
            let mut locks = self.locks.lock().await;
            // 只剩表内引用的锁已无人持有或等待。
            locks.retain(|_, lock| Arc::strong_count(lock) > 1);
            locks
                .entry(key)
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone()
        };
        time::timeout(timeout, lock.lock_owned())
            .await
            .map_err(|_| LockTimeout)
    }

    #[cfg(test)]
    async fn len(&self) -> usize {
        self.locks.lock().await.len()
    }
}

fn normalize_lock_key(path: &str) -> String {
    let trimmed = path.trim();
    let trimmed = trimmed.trim_start_matches(['/', '\\']);
    trimmed.replace('\\', "/")
}
