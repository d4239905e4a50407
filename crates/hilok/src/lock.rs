// Copyright 2024 RustFS Team
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::{
    DEFAULT_KEY_PREFIX, DEFAULT_READ_POLL_INTERVAL, DEFAULT_WRITE_POLL_INTERVAL,
    error::{LockError, Result},
    store::KeyspaceStore,
    types::{LockKeys, LockStatus, LockType, OwnerToken},
};

/// Read/write lock on a single store key.
///
/// All decisions are taken by the store in one atomic operation; the lock keeps no
/// ownership state of its own beyond the owner token it presents.
#[derive(Debug, Clone)]
pub struct SingleLock {
    store: Arc<dyn KeyspaceStore>,
    keys: LockKeys,
    key_prefix: String,
    ttl: Duration,
    owner: OwnerToken,
    read_poll_interval: Duration,
    write_poll_interval: Duration,
}

impl SingleLock {
    /// Create a lock on `path` with a freshly generated owner token
    pub fn new(store: Arc<dyn KeyspaceStore>, path: impl Into<String>, ttl: Duration) -> Self {
        let path = path.into();
        Self {
            store,
            keys: LockKeys::new(DEFAULT_KEY_PREFIX, &path),
            key_prefix: DEFAULT_KEY_PREFIX.to_string(),
            ttl,
            owner: OwnerToken::generate(),
            read_poll_interval: DEFAULT_READ_POLL_INTERVAL,
            write_poll_interval: DEFAULT_WRITE_POLL_INTERVAL,
        }
    }

    /// Present `owner` instead of the generated token
    pub fn with_owner(mut self, owner: OwnerToken) -> Self {
        self.owner = owner;
        self
    }

    pub fn with_key_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.key_prefix = prefix.into();
        self.keys = LockKeys::new(&self.key_prefix, &self.keys.path);
        self
    }

    pub fn with_poll_intervals(mut self, read: Duration, write: Duration) -> Self {
        self.read_poll_interval = read;
        self.write_poll_interval = write;
        self
    }

    pub fn path(&self) -> &str {
        &self.keys.path
    }

    pub fn keys(&self) -> &LockKeys {
        &self.keys
    }

    pub fn owner(&self) -> &OwnerToken {
        &self.owner
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Acquire the shared lock. `false` on contention, or on timeout when blocking.
    pub async fn acquire_read_lock(&self, block: bool, timeout: Duration) -> Result<bool> {
        self.acquire(LockType::Shared, block, timeout).await
    }

    /// Acquire the exclusive lock. `false` on contention, or on timeout when blocking.
    pub async fn acquire_write_lock(&self, block: bool, timeout: Duration) -> Result<bool> {
        self.acquire(LockType::Exclusive, block, timeout).await
    }

    pub async fn acquire(&self, lock_type: LockType, block: bool, timeout: Duration) -> Result<bool> {
        let poll_interval = match lock_type {
            LockType::Shared => self.read_poll_interval,
            LockType::Exclusive => self.write_poll_interval,
        };
        let deadline = Instant::now() + timeout;

        loop {
            let acquired = match lock_type {
                LockType::Shared => self.store.try_acquire_read(&self.keys, &self.owner, self.ttl).await?,
                LockType::Exclusive => self.store.try_acquire_write(&self.keys, &self.owner, self.ttl).await?,
            };
            if acquired {
                debug!("{} lock acquired on '{}' by {}", lock_type, self.keys.path, self.owner);
                return Ok(true);
            }
            if !block {
                return Ok(false);
            }

            let now = Instant::now();
            if now >= deadline {
                debug!("{} lock on '{}' not acquired within {:?}", lock_type, self.keys.path, timeout);
                return Ok(false);
            }
            tokio::time::sleep(poll_interval.min(deadline - now)).await;
        }
    }

    /// Re-attach to a shared hold taken earlier under the same owner token
    pub async fn restore_read_lock(&self) -> Result<bool> {
        self.restore(LockType::Shared).await
    }

    /// Re-attach to an exclusive hold taken earlier under the same owner token
    pub async fn restore_write_lock(&self) -> Result<bool> {
        self.restore(LockType::Exclusive).await
    }

    /// Verify the hold through a refresh instead of acquiring. `false` if the token is not recorded.
    pub async fn restore(&self, lock_type: LockType) -> Result<bool> {
        match self.refresh_lock(lock_type).await {
            Ok(()) => {
                debug!("{} lock on '{}' restored for {}", lock_type, self.keys.path, self.owner);
                Ok(true)
            }
            Err(err) if err.is_lock_lost() => Ok(false),
            Err(err) => Err(err),
        }
    }

    /// Extend the lease. Fails with [`LockError::LockLost`] when the token is no longer recorded.
    pub async fn refresh_lock(&self, lock_type: LockType) -> Result<()> {
        let refreshed = self
            .store
            .refresh(&self.keys, &self.owner, lock_type.is_shared(), self.ttl)
            .await?;
        if !refreshed {
            return Err(LockError::lock_lost(self.keys.path.clone(), self.owner.clone(), lock_type));
        }
        Ok(())
    }

    /// Remove our reader entry. Releasing an absent entry is a no-op.
    pub async fn release_read_lock(&self) -> Result<()> {
        self.release(LockType::Shared).await
    }

    /// Clear the writer slot if we hold it. Releasing a foreign or expired slot is a no-op.
    pub async fn release_write_lock(&self) -> Result<()> {
        self.release(LockType::Exclusive).await
    }

    pub async fn release(&self, lock_type: LockType) -> Result<()> {
        let removed = match lock_type {
            LockType::Shared => self.store.release_read(&self.keys, &self.owner).await?,
            LockType::Exclusive => self.store.release_write(&self.keys, &self.owner).await?,
        };
        if removed {
            debug!("{} lock released on '{}' by {}", lock_type, self.keys.path, self.owner);
        } else {
            warn!(
                "{} lock on '{}' was not held by {} at release, already expired or released",
                lock_type, self.keys.path, self.owner
            );
        }
        Ok(())
    }

    pub async fn status(&self) -> Result<LockStatus> {
        self.store.status(&self.keys, &self.owner).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::MemoryStore;

    const TTL: Duration = Duration::from_secs(5);

    fn lock(store: &MemoryStore, path: &str) -> SingleLock {
        SingleLock::new(Arc::new(store.clone()), path, TTL)
            .with_poll_intervals(Duration::from_millis(10), Duration::from_millis(20))
    }

    #[tokio::test]
    async fn test_write_excludes_write() {
        let store = MemoryStore::new();
        let first = lock(&store, "k");
        let second = lock(&store, "k");

        assert!(first.acquire_write_lock(false, Duration::ZERO).await.unwrap());
        assert!(!second.acquire_write_lock(false, Duration::ZERO).await.unwrap());

        first.release_write_lock().await.unwrap();
        assert!(second.acquire_write_lock(false, Duration::ZERO).await.unwrap());
    }

    #[tokio::test]
    async fn test_blocking_write_waits_for_release() {
        let store = MemoryStore::new();
        let reader = lock(&store, "k");
        let writer = lock(&store, "k");
        assert!(reader.acquire_read_lock(false, Duration::ZERO).await.unwrap());

        let release = {
            let reader = reader.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(100)).await;
                reader.release_read_lock().await.unwrap();
            })
        };

        assert!(writer.acquire_write_lock(true, Duration::from_secs(2)).await.unwrap());
        release.await.unwrap();
    }

    #[tokio::test]
    async fn test_blocking_times_out() {
        let store = MemoryStore::new();
        let holder = lock(&store, "k");
        let waiter = lock(&store, "k");
        assert!(holder.acquire_write_lock(false, Duration::ZERO).await.unwrap());

        let started = std::time::Instant::now();
        assert!(!waiter.acquire_read_lock(true, Duration::from_millis(150)).await.unwrap());
        assert!(started.elapsed() >= Duration::from_millis(150));
    }

    #[tokio::test]
    async fn test_refresh_reports_lost_lock() {
        let store = MemoryStore::new();
        let holder = lock(&store, "k");
        assert!(holder.acquire_read_lock(false, Duration::ZERO).await.unwrap());
        holder.refresh_lock(LockType::Shared).await.unwrap();

        holder.release_read_lock().await.unwrap();
        let err = holder.refresh_lock(LockType::Shared).await.unwrap_err();
        assert!(err.is_lock_lost());
    }

    #[tokio::test]
    async fn test_restore_requires_recorded_owner() {
        let store = MemoryStore::new();
        let holder = lock(&store, "k");
        assert!(holder.acquire_write_lock(false, Duration::ZERO).await.unwrap());

        let restored = lock(&store, "k").with_owner(holder.owner().clone());
        assert!(restored.restore_write_lock().await.unwrap());
        assert!(!restored.restore_read_lock().await.unwrap());

        let stranger = lock(&store, "k");
        assert!(!stranger.restore_write_lock().await.unwrap());
    }

    #[tokio::test]
    async fn test_release_is_idempotent() {
        let store = MemoryStore::new();
        let holder = lock(&store, "k");
        let stranger = lock(&store, "k");
        assert!(holder.acquire_write_lock(false, Duration::ZERO).await.unwrap());

        stranger.release_write_lock().await.unwrap();
        stranger.release_read_lock().await.unwrap();
        assert!(holder.status().await.unwrap().owned);

        holder.release_write_lock().await.unwrap();
        holder.release_write_lock().await.unwrap();
        assert!(!holder.status().await.unwrap().held);
    }

    #[tokio::test]
    async fn test_status_reports_mode_and_ownership() {
        let store = MemoryStore::new();
        let holder = lock(&store, "k");
        let observer = lock(&store, "k");

        assert!(!observer.status().await.unwrap().held);
        assert!(holder.acquire_read_lock(false, Duration::ZERO).await.unwrap());

        let status = observer.status().await.unwrap();
        assert!(status.held);
        assert!(!status.owned);
        assert_eq!(status.lock_type, Some(LockType::Shared));
        assert!(status.ttl.is_some_and(|ttl| ttl <= TTL));
        assert!(holder.status().await.unwrap().owned);
    }

    #[tokio::test]
    async fn test_store_errors_propagate_from_acquire() {
        let store = MemoryStore::new();
        store.set_offline(true);
        let err = lock(&store, "k").acquire_read_lock(true, Duration::from_millis(50)).await;
        assert!(matches!(err, Err(LockError::Store { .. })));
    }
}
