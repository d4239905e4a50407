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

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    config::HiLokConfig,
    error::{LockError, Result},
    handle::{RefreshingLockHandle, run_critical},
    lock::SingleLock,
    path::LockPath,
    release::{self, ReleaseJob},
    store::KeyspaceStore,
    types::{LockStats, LockStatus, LockType, OwnerToken},
};

#[derive(Debug, Default)]
struct LockStatsCollector {
    successful_acquires: AtomicU64,
    failed_acquires: AtomicU64,
    restores: AtomicU64,
    releases: AtomicU64,
}

impl LockStatsCollector {
    fn snapshot(&self) -> LockStats {
        LockStats {
            successful_acquires: self.successful_acquires.load(Ordering::Relaxed),
            failed_acquires: self.failed_acquires.load(Ordering::Relaxed),
            restores: self.restores.load(Ordering::Relaxed),
            releases: self.releases.load(Ordering::Relaxed),
        }
    }
}

/// Levels held by one hierarchical acquisition, root first.
///
/// While armed, dropping the chain hands every remaining level to the release
/// worker leaf first, so a cancelled acquisition or scope never leaks a level.
/// A chain being restored stays disarmed until every level is verified: the
/// store entries belong to an existing hold and must survive a failed restore.
#[derive(Debug)]
struct HeldChain {
    path: String,
    owner: OwnerToken,
    abort: CancellationToken,
    levels: Vec<(RefreshingLockHandle, LockType)>,
    armed: bool,
}

impl HeldChain {
    fn new(path: &str, owner: OwnerToken, abort: CancellationToken, armed: bool) -> Self {
        Self {
            path: path.to_string(),
            owner,
            abort,
            levels: Vec::new(),
            armed,
        }
    }

    /// Release leaf to root. A level leaves the chain only once its release
    /// completed, so a cancelled unwind leaves the rest, in-flight level included, to `Drop`.
    async fn unwind(&mut self) {
        while let Some((handle, lock_type)) = self.levels.last().cloned() {
            handle.release(lock_type).await;
            self.levels.pop();
        }
    }

    /// Stop renewal on every level without touching the store
    async fn forget(&mut self) {
        self.armed = false;
        for (handle, _) in self.levels.drain(..).rev() {
            handle.detach().await;
        }
    }

    /// Give up the handles without releasing; the leases stay in the store
    fn into_owner(mut self) -> OwnerToken {
        self.armed = false;
        self.levels.clear();
        self.owner.clone()
    }
}

impl Drop for HeldChain {
    fn drop(&mut self) {
        if !self.armed || self.levels.is_empty() {
            return;
        }
        debug!("Releasing {} abandoned levels of '{}' in background", self.levels.len(), self.path);
        let levels = self.levels.drain(..).rev().collect();
        release::schedule(ReleaseJob { levels });
    }
}

/// Hierarchical lock held for the lifetime of a scope.
///
/// Every level renews its own lease in the background. [`HierarchyGuard::release`]
/// releases leaf to root; dropping the guard does the same in the background.
#[derive(Debug)]
pub struct HierarchyGuard {
    chain: HeldChain,
    mode: LockType,
    stats: Arc<LockStatsCollector>,
}

impl HierarchyGuard {
    pub fn owner_token(&self) -> &OwnerToken {
        &self.chain.owner
    }

    pub fn path(&self) -> &str {
        &self.chain.path
    }

    pub fn lock_type(&self) -> LockType {
        self.mode
    }

    /// Held levels and their modes, root first
    pub fn levels(&self) -> Vec<(String, LockType)> {
        self.chain
            .levels
            .iter()
            .map(|(handle, lock_type)| (handle.path().to_string(), *lock_type))
            .collect()
    }

    /// Whether any level found its lease gone
    pub fn is_lost(&self) -> bool {
        self.chain.levels.iter().any(|(handle, _)| handle.is_lost())
    }

    /// Cancelled when a level loses its lease and the cancel-on-lock-failure policy is on
    pub fn cancellation_token(&self) -> CancellationToken {
        self.chain.abort.clone()
    }

    pub async fn release(mut self) {
        self.chain.unwind().await;
        self.stats.releases.fetch_add(1, Ordering::Relaxed);
        debug!("Released {} lock on '{}' for {}", self.mode, self.chain.path, self.chain.owner);
    }
}

impl Drop for HierarchyGuard {
    fn drop(&mut self) {
        if !self.chain.levels.is_empty() {
            self.stats.releases.fetch_add(1, Ordering::Relaxed);
        }
    }
}

/// Coordinates read/write locks over a path hierarchy.
///
/// Every ancestor prefix of a path is locked shared and the leaf in the requested
/// mode, strictly root to leaf. Releases run strictly leaf to root. A failed
/// acquisition unwinds whatever it obtained before returning, so callers either
/// hold the full chain or nothing.
#[derive(Debug)]
pub struct HierarchicalLockCoordinator {
    store: Arc<dyn KeyspaceStore>,
    config: HiLokConfig,
    stats: Arc<LockStatsCollector>,
}

impl HierarchicalLockCoordinator {
    pub fn new(store: Arc<dyn KeyspaceStore>, config: HiLokConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            store,
            config,
            stats: Arc::new(LockStatsCollector::default()),
        })
    }

    pub fn config(&self) -> &HiLokConfig {
        &self.config
    }

    pub fn stats(&self) -> LockStats {
        self.stats.snapshot()
    }

    /// Split `path` into its lock levels using the configured separator
    pub fn parse_path(&self, path: &str) -> Result<LockPath> {
        LockPath::parse(path, &self.config.path_separator)
    }

    pub async fn is_online(&self) -> bool {
        self.store.is_online().await
    }

    /// Acquire `path` shared and return the owner token. No background renewal runs;
    /// release with [`HierarchicalLockCoordinator::release_read`] before the TTL lapses.
    ///
    /// With `owner` set, re-attaches to an existing hold instead of acquiring.
    pub async fn acquire_read(
        &self,
        path: &str,
        block: bool,
        timeout: Duration,
        owner: Option<OwnerToken>,
    ) -> Result<OwnerToken> {
        let chain = self.acquire_chain(path, LockType::Shared, block, timeout, owner, false).await?;
        Ok(chain.into_owner())
    }

    /// Acquire `path` with an exclusive leaf and return the owner token. See [`HierarchicalLockCoordinator::acquire_read`].
    pub async fn acquire_write(
        &self,
        path: &str,
        block: bool,
        timeout: Duration,
        owner: Option<OwnerToken>,
    ) -> Result<OwnerToken> {
        let chain = self.acquire_chain(path, LockType::Exclusive, block, timeout, owner, false).await?;
        Ok(chain.into_owner())
    }

    /// Acquire `path` shared with background renewal on every level
    pub async fn read_guard(
        &self,
        path: &str,
        block: bool,
        timeout: Duration,
        owner: Option<OwnerToken>,
    ) -> Result<HierarchyGuard> {
        self.guard(path, LockType::Shared, block, timeout, owner).await
    }

    /// Acquire `path` with an exclusive leaf and background renewal on every level
    pub async fn write_guard(
        &self,
        path: &str,
        block: bool,
        timeout: Duration,
        owner: Option<OwnerToken>,
    ) -> Result<HierarchyGuard> {
        self.guard(path, LockType::Exclusive, block, timeout, owner).await
    }

    /// Run `f` while holding `path` shared
    pub async fn read<F, Fut, T>(&self, path: &str, block: bool, timeout: Duration, f: F) -> Result<T>
    where
        F: FnOnce(OwnerToken) -> Fut,
        Fut: Future<Output = T>,
    {
        self.scoped(path, LockType::Shared, block, timeout, f).await
    }

    /// Run `f` while holding `path` with an exclusive leaf
    pub async fn write<F, Fut, T>(&self, path: &str, block: bool, timeout: Duration, f: F) -> Result<T>
    where
        F: FnOnce(OwnerToken) -> Fut,
        Fut: Future<Output = T>,
    {
        self.scoped(path, LockType::Exclusive, block, timeout, f).await
    }

    /// Release a shared hold by owner token, leaf to root
    pub async fn release_read(&self, path: &str, owner: &OwnerToken) -> Result<()> {
        self.release_by_token(path, LockType::Shared, owner).await
    }

    /// Release an exclusive hold by owner token, leaf to root
    pub async fn release_write(&self, path: &str, owner: &OwnerToken) -> Result<()> {
        self.release_by_token(path, LockType::Exclusive, owner).await
    }

    /// Status of every level of `path` as seen by `owner`, root first
    pub async fn status(&self, path: &str, owner: &OwnerToken) -> Result<Vec<LockStatus>> {
        let lock_path = self.parse_path(path)?;
        let mut statuses = Vec::with_capacity(lock_path.levels().len());
        for key in lock_path.levels() {
            statuses.push(self.single_lock(key, owner).status().await?);
        }
        Ok(statuses)
    }

    fn single_lock(&self, key: &str, owner: &OwnerToken) -> SingleLock {
        SingleLock::new(self.store.clone(), key, self.config.ttl)
            .with_owner(owner.clone())
            .with_key_prefix(self.config.key_prefix.clone())
            .with_poll_intervals(self.config.read_poll_interval, self.config.write_poll_interval)
    }

    async fn scoped<F, Fut, T>(&self, path: &str, mode: LockType, block: bool, timeout: Duration, f: F) -> Result<T>
    where
        F: FnOnce(OwnerToken) -> Fut,
        Fut: Future<Output = T>,
    {
        let guard = self.guard(path, mode, block, timeout, None).await?;
        let owner = guard.owner_token().clone();
        let result = run_critical(
            guard.cancellation_token(),
            self.config.cancel_on_lock_failure,
            || LockError::lock_lost(path, owner.clone(), mode),
            f(owner.clone()),
        )
        .await;
        guard.release().await;
        result
    }

    async fn guard(
        &self,
        path: &str,
        mode: LockType,
        block: bool,
        timeout: Duration,
        owner: Option<OwnerToken>,
    ) -> Result<HierarchyGuard> {
        let chain = self.acquire_chain(path, mode, block, timeout, owner, true).await?;
        Ok(HierarchyGuard {
            chain,
            mode,
            stats: self.stats.clone(),
        })
    }

    async fn acquire_chain(
        &self,
        path: &str,
        mode: LockType,
        block: bool,
        timeout: Duration,
        owner: Option<OwnerToken>,
        refresh: bool,
    ) -> Result<HeldChain> {
        let lock_path = self.parse_path(path)?;
        let restore = owner.is_some();
        let owner = owner.unwrap_or_else(OwnerToken::generate);
        let refresh_interval = if refresh { self.config.refresh_interval } else { Duration::ZERO };
        let deadline = Instant::now() + timeout;

        let abort = CancellationToken::new();
        let mut chain = HeldChain::new(lock_path.as_str(), owner.clone(), abort.clone(), !restore);

        for (depth, key) in lock_path.levels().iter().enumerate() {
            let lock_type = lock_path.mode_at(depth, mode);
            let handle = RefreshingLockHandle::linked(
                self.single_lock(key, &owner),
                refresh_interval,
                self.config.cancel_on_lock_failure,
                abort.clone(),
            );

            let outcome = if restore {
                handle.restore(lock_type).await
            } else {
                let remaining = deadline.saturating_duration_since(Instant::now());
                handle.acquire(lock_type, block, remaining).await
            };

            match outcome {
                Ok(true) => chain.levels.push((handle, lock_type)),
                Ok(false) if restore => {
                    warn!(
                        "Level '{}' of '{}' is not held by {} as {}, restore abandoned",
                        key,
                        path,
                        owner,
                        lock_type
                    );
                    chain.forget().await;
                    self.stats.failed_acquires.fetch_add(1, Ordering::Relaxed);
                    return Err(LockError::hierarchy(path, key.clone(), lock_type));
                }
                Err(err) if restore => {
                    warn!("Restoring level '{}' of '{}' failed: {}", key, path, err);
                    chain.forget().await;
                    self.stats.failed_acquires.fetch_add(1, Ordering::Relaxed);
                    return Err(err);
                }
                Ok(false) => {
                    warn!(
                        "Level '{}' of '{}' unavailable for {} lock, unwinding {} held levels",
                        key,
                        path,
                        mode,
                        chain.levels.len()
                    );
                    chain.unwind().await;
                    self.stats.failed_acquires.fetch_add(1, Ordering::Relaxed);
                    return Err(LockError::hierarchy(path, key.clone(), lock_type));
                }
                Err(err) => {
                    warn!("Level '{}' of '{}' failed: {}, unwinding {} held levels", key, path, err, chain.levels.len());
                    chain.unwind().await;
                    self.stats.failed_acquires.fetch_add(1, Ordering::Relaxed);
                    return Err(err);
                }
            }
        }

        if restore {
            chain.armed = true;
            self.stats.restores.fetch_add(1, Ordering::Relaxed);
            info!("Restored {} lock on '{}' for {}", mode, path, owner);
        } else {
            self.stats.successful_acquires.fetch_add(1, Ordering::Relaxed);
            debug!("Acquired {} lock on '{}' for {}", mode, path, owner);
        }
        Ok(chain)
    }

    /// Release every level leaf to root.
    ///
    /// The leaf is checked first: when `owner` holds it in the other mode nothing is
    /// released. An expired or foreign leaf still cascades to the ancestors, so a
    /// partially expired chain is cleaned up as far as it exists.
    async fn release_by_token(&self, path: &str, mode: LockType, owner: &OwnerToken) -> Result<()> {
        let lock_path = self.parse_path(path)?;
        let leaf = self.single_lock(lock_path.leaf(), owner).status().await?;
        if let Some(held) = leaf.lock_type.filter(|held| leaf.owned && *held != mode) {
            warn!("Refusing {} release of '{}' for {}: the leaf is held as {}", mode, path, owner, held);
            return Ok(());
        }

        for (depth, key) in lock_path.levels().iter().enumerate().rev() {
            let lock_type = lock_path.mode_at(depth, mode);
            if let Err(err) = self.single_lock(key, owner).release(lock_type).await {
                warn!("Failed to release {} level '{}' of '{}' for {}: {}", lock_type, key, path, owner, err);
            }
        }
        self.stats.releases.fetch_add(1, Ordering::Relaxed);
        debug!("Released {} lock on '{}' for {} by token", mode, path, owner);
        Ok(())
    }
}
