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

use parking_lot::Mutex;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::{
    error::{LockError, Result},
    lock::SingleLock,
    release::{self, ReleaseJob},
    types::{LockStatus, LockType, OwnerToken},
};

#[derive(Debug)]
struct Refresher {
    stop: CancellationToken,
    task: JoinHandle<()>,
}

#[derive(Debug)]
struct HandleInner {
    lock: Arc<SingleLock>,
    refresh_interval: Duration,
    cancel_on_lock_failure: bool,
    /// Cancelled on lease loss when `cancel_on_lock_failure` is set
    linked: Option<CancellationToken>,
    held: Arc<Mutex<Option<LockType>>>,
    /// Cancelled whenever the current hold is found lost
    lost: Mutex<CancellationToken>,
    refresher: Mutex<Option<Refresher>>,
}

impl Drop for HandleInner {
    fn drop(&mut self) {
        if let Some(refresher) = self.refresher.get_mut().take() {
            refresher.stop.cancel();
        }
    }
}

/// A [`SingleLock`] that keeps its lease alive while held.
///
/// A successful acquire or restore starts exactly one background task renewing the
/// lease every `refresh_interval`; release stops and awaits that task before the
/// store entry is removed, so a late refresh can never revive a released slot.
/// A zero interval disables renewal.
///
/// Clones share the same hold and the same renewal task.
#[derive(Debug, Clone)]
pub struct RefreshingLockHandle {
    inner: Arc<HandleInner>,
}

impl RefreshingLockHandle {
    pub fn new(lock: SingleLock, refresh_interval: Duration, cancel_on_lock_failure: bool) -> Self {
        Self::build(lock, refresh_interval, cancel_on_lock_failure, None)
    }

    /// Like [`RefreshingLockHandle::new`], additionally cancelling `parent` when the
    /// lease is lost and `cancel_on_lock_failure` is set
    pub fn linked(
        lock: SingleLock,
        refresh_interval: Duration,
        cancel_on_lock_failure: bool,
        parent: CancellationToken,
    ) -> Self {
        Self::build(lock, refresh_interval, cancel_on_lock_failure, Some(parent))
    }

    fn build(
        lock: SingleLock,
        refresh_interval: Duration,
        cancel_on_lock_failure: bool,
        linked: Option<CancellationToken>,
    ) -> Self {
        Self {
            inner: Arc::new(HandleInner {
                lock: Arc::new(lock),
                refresh_interval,
                cancel_on_lock_failure,
                linked,
                held: Arc::new(Mutex::new(None)),
                lost: Mutex::new(CancellationToken::new()),
                refresher: Mutex::new(None),
            }),
        }
    }

    pub fn lock(&self) -> &SingleLock {
        &self.inner.lock
    }

    pub fn path(&self) -> &str {
        self.inner.lock.path()
    }

    pub fn owner(&self) -> &OwnerToken {
        self.inner.lock.owner()
    }

    pub fn refresh_interval(&self) -> Duration {
        self.inner.refresh_interval
    }

    /// Mode of the hold this handle believes it has
    pub fn held(&self) -> Option<LockType> {
        *self.inner.held.lock()
    }

    /// Whether the renewal task found the current hold gone
    pub fn is_lost(&self) -> bool {
        self.inner.lost.lock().is_cancelled()
    }

    /// Token cancelled once the current hold is found lost
    pub fn lost_token(&self) -> CancellationToken {
        self.inner.lost.lock().clone()
    }

    pub fn is_refreshing(&self) -> bool {
        self.inner
            .refresher
            .lock()
            .as_ref()
            .is_some_and(|refresher| !refresher.task.is_finished())
    }

    pub async fn acquire_read(&self, block: bool, timeout: Duration) -> Result<bool> {
        self.acquire(LockType::Shared, block, timeout).await
    }

    pub async fn acquire_write(&self, block: bool, timeout: Duration) -> Result<bool> {
        self.acquire(LockType::Exclusive, block, timeout).await
    }

    pub async fn acquire(&self, lock_type: LockType, block: bool, timeout: Duration) -> Result<bool> {
        if !self.inner.lock.acquire(lock_type, block, timeout).await? {
            return Ok(false);
        }
        self.start_hold(lock_type).await;
        Ok(true)
    }

    pub async fn restore_read(&self) -> Result<bool> {
        self.restore(LockType::Shared).await
    }

    pub async fn restore_write(&self) -> Result<bool> {
        self.restore(LockType::Exclusive).await
    }

    /// Re-attach to an existing hold by owner token, then resume renewal
    pub async fn restore(&self, lock_type: LockType) -> Result<bool> {
        if !self.inner.lock.restore(lock_type).await? {
            return Ok(false);
        }
        self.start_hold(lock_type).await;
        Ok(true)
    }

    pub async fn release_read(&self) {
        self.release(LockType::Shared).await
    }

    pub async fn release_write(&self) {
        self.release(LockType::Exclusive).await
    }

    /// Stop renewal, then release. Never fails; store errors are logged and the lease left to expire.
    pub async fn release(&self, lock_type: LockType) {
        self.stop_refresh().await;
        self.inner.held.lock().take();
        if let Err(err) = self.inner.lock.release(lock_type).await {
            warn!(
                "Failed to release {} lock on '{}' for {}, lease will expire: {}",
                lock_type,
                self.path(),
                self.owner(),
                err
            );
        }
    }

    /// Stop renewal and release whatever is held
    pub async fn close(&self) {
        match self.held() {
            Some(lock_type) => self.release(lock_type).await,
            None => self.stop_refresh().await,
        }
    }

    /// Stop renewal and forget the hold. The store entry stays until released or expired.
    pub async fn detach(&self) {
        self.stop_refresh().await;
        self.inner.held.lock().take();
    }

    pub async fn status(&self) -> Result<LockStatus> {
        self.inner.lock.status().await
    }

    /// Run `f` under the shared lock, releasing on every exit path
    pub async fn read<F, Fut, T>(&self, block: bool, timeout: Duration, f: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        self.scoped(LockType::Shared, block, timeout, f).await
    }

    /// Run `f` under the exclusive lock, releasing on every exit path
    pub async fn write<F, Fut, T>(&self, block: bool, timeout: Duration, f: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        self.scoped(LockType::Exclusive, block, timeout, f).await
    }

    async fn scoped<F, Fut, T>(&self, lock_type: LockType, block: bool, timeout: Duration, f: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        let guard = self.guard(lock_type, block, timeout).await?;
        let result = run_critical(
            guard.lost_token(),
            self.inner.cancel_on_lock_failure,
            || LockError::lock_lost(self.path(), self.owner().clone(), lock_type),
            f(),
        )
        .await;
        guard.release().await;
        result
    }

    pub async fn read_guard(&self, block: bool, timeout: Duration) -> Result<HandleGuard> {
        self.guard(LockType::Shared, block, timeout).await
    }

    pub async fn write_guard(&self, block: bool, timeout: Duration) -> Result<HandleGuard> {
        self.guard(LockType::Exclusive, block, timeout).await
    }

    async fn guard(&self, lock_type: LockType, block: bool, timeout: Duration) -> Result<HandleGuard> {
        if !self.acquire(lock_type, block, timeout).await? {
            return Err(LockError::acquire_failed(self.path(), lock_type));
        }
        Ok(HandleGuard {
            handle: self.clone(),
            lock_type,
            armed: true,
        })
    }

    async fn start_hold(&self, lock_type: LockType) {
        self.stop_refresh().await;
        *self.inner.held.lock() = Some(lock_type);
        let lost = CancellationToken::new();
        *self.inner.lost.lock() = lost.clone();

        if self.inner.refresh_interval.is_zero() {
            return;
        }

        let stop = CancellationToken::new();
        let renewal = Renewal {
            lock: self.inner.lock.clone(),
            lock_type,
            interval: self.inner.refresh_interval,
            stop: stop.clone(),
            lost,
            held: self.inner.held.clone(),
            escalate: self.inner.linked.clone().filter(|_| self.inner.cancel_on_lock_failure),
        };
        let task = tokio::spawn(renewal.run());
        *self.inner.refresher.lock() = Some(Refresher { stop, task });
    }

    async fn stop_refresh(&self) {
        let refresher = self.inner.refresher.lock().take();
        let Some(Refresher { stop, task }) = refresher else {
            return;
        };
        stop.cancel();
        if let Err(err) = task.await {
            warn!("Renewal task for '{}' ended abnormally: {}", self.path(), err);
        }
    }
}

/// Run a critical section, aborting it with the error from `lost_err` once `lost` fires
pub(crate) async fn run_critical<Fut, T>(
    lost: CancellationToken,
    abort_on_loss: bool,
    lost_err: impl FnOnce() -> LockError,
    fut: Fut,
) -> Result<T>
where
    Fut: Future<Output = T>,
{
    if !abort_on_loss {
        return Ok(fut.await);
    }
    tokio::select! {
        biased;
        _ = lost.cancelled() => Err(lost_err()),
        out = fut => Ok(out),
    }
}

struct Renewal {
    lock: Arc<SingleLock>,
    lock_type: LockType,
    interval: Duration,
    stop: CancellationToken,
    lost: CancellationToken,
    held: Arc<Mutex<Option<LockType>>>,
    escalate: Option<CancellationToken>,
}

impl Renewal {
    async fn run(self) {
        let mut ticker = tokio::time::interval_at(Instant::now() + self.interval, self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = self.stop.cancelled() => break,
                _ = ticker.tick() => {}
            }

            match self.lock.refresh_lock(self.lock_type).await {
                Ok(()) => trace!("Renewed {} lease on '{}'", self.lock_type, self.lock.path()),
                Err(err) if err.is_lock_lost() => {
                    warn!("{}", err);
                    self.held.lock().take();
                    self.lost.cancel();
                    if let Some(parent) = &self.escalate {
                        debug!("Cancelling work linked to lost lock on '{}'", self.lock.path());
                        parent.cancel();
                    }
                    break;
                }
                Err(err) => warn!(
                    "Renewing {} lease on '{}' failed, retrying: {}",
                    self.lock_type,
                    self.lock.path(),
                    err
                ),
            }
        }
    }
}

/// Scoped hold on a [`RefreshingLockHandle`].
///
/// Dropping the guard without [`HandleGuard::release`] (for example because the
/// owning task was cancelled) hands the release to the background release worker.
#[derive(Debug)]
pub struct HandleGuard {
    handle: RefreshingLockHandle,
    lock_type: LockType,
    armed: bool,
}

impl HandleGuard {
    pub fn handle(&self) -> &RefreshingLockHandle {
        &self.handle
    }

    pub fn lock_type(&self) -> LockType {
        self.lock_type
    }

    pub fn is_lost(&self) -> bool {
        self.handle.is_lost()
    }

    pub fn lost_token(&self) -> CancellationToken {
        self.handle.lost_token()
    }

    /// Release now, awaiting completion
    pub async fn release(mut self) {
        self.armed = false;
        self.handle.release(self.lock_type).await;
    }
}

impl Drop for HandleGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        release::schedule(ReleaseJob {
            levels: vec![(self.handle.clone(), self.lock_type)],
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::MemoryStore;

    fn handle(store: &MemoryStore, path: &str, ttl_ms: u64, refresh_ms: u64, cancel: bool) -> RefreshingLockHandle {
        let lock = SingleLock::new(Arc::new(store.clone()), path, Duration::from_millis(ttl_ms))
            .with_poll_intervals(Duration::from_millis(10), Duration::from_millis(20));
        RefreshingLockHandle::new(lock, Duration::from_millis(refresh_ms), cancel)
    }

    async fn wait_until_unheld(store: &MemoryStore, path: &str) -> bool {
        let checker = SingleLock::new(Arc::new(store.clone()), path, Duration::from_secs(1));
        for _ in 0..100 {
            if !checker.status().await.unwrap().held {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        false
    }

    #[tokio::test]
    async fn test_refresh_keeps_lease_alive() {
        let store = MemoryStore::new();
        let holder = handle(&store, "k", 200, 50, true);
        assert!(holder.acquire_write(false, Duration::ZERO).await.unwrap());
        assert!(holder.is_refreshing());

        tokio::time::sleep(Duration::from_millis(600)).await;
        let status = holder.status().await.unwrap();
        assert!(status.held && status.owned);
        assert!(!holder.is_lost());

        holder.release_write().await;
        assert!(!holder.is_refreshing());
        assert!(!holder.status().await.unwrap().held);
        assert_eq!(holder.held(), None);
    }

    #[tokio::test]
    async fn test_without_refresh_lease_expires() {
        let store = MemoryStore::new();
        let holder = handle(&store, "k", 150, 0, true);
        assert!(holder.acquire_read(false, Duration::ZERO).await.unwrap());
        assert!(!holder.is_refreshing());

        tokio::time::sleep(Duration::from_millis(250)).await;
        assert!(!holder.status().await.unwrap().held);
    }

    #[tokio::test]
    async fn test_lost_lease_is_detected() {
        let store = MemoryStore::new();
        let parent = CancellationToken::new();
        let lock = SingleLock::new(Arc::new(store.clone()), "k", Duration::from_millis(500));
        let holder = RefreshingLockHandle::linked(lock.clone(), Duration::from_millis(30), true, parent.clone());
        assert!(holder.acquire_write(false, Duration::ZERO).await.unwrap());

        // Someone clears our slot behind our back
        lock.release_write_lock().await.unwrap();

        tokio::time::timeout(Duration::from_secs(1), holder.lost_token().cancelled())
            .await
            .unwrap();
        assert!(holder.is_lost());
        assert_eq!(holder.held(), None);
        assert!(parent.is_cancelled());
        holder.close().await;
    }

    #[tokio::test]
    async fn test_lost_lease_without_cancel_policy_leaves_parent_alone() {
        let store = MemoryStore::new();
        let parent = CancellationToken::new();
        let lock = SingleLock::new(Arc::new(store.clone()), "k", Duration::from_millis(500));
        let holder = RefreshingLockHandle::linked(lock.clone(), Duration::from_millis(30), false, parent.clone());
        assert!(holder.acquire_read(false, Duration::ZERO).await.unwrap());

        lock.release_read_lock().await.unwrap();
        tokio::time::timeout(Duration::from_secs(1), holder.lost_token().cancelled())
            .await
            .unwrap();
        assert!(!parent.is_cancelled());
    }

    #[tokio::test]
    async fn test_scoped_write_releases_after_body() {
        let store = MemoryStore::new();
        let holder = handle(&store, "k", 500, 100, true);
        let other = handle(&store, "k", 500, 100, true);

        let value = holder
            .write(false, Duration::ZERO, || async {
                assert!(!other.acquire_read(false, Duration::ZERO).await.unwrap());
                42
            })
            .await
            .unwrap();
        assert_eq!(value, 42);
        assert!(!holder.status().await.unwrap().held);
    }

    #[tokio::test]
    async fn test_scoped_acquire_failure_skips_body() {
        let store = MemoryStore::new();
        let holder = handle(&store, "k", 500, 100, true);
        let other = handle(&store, "k", 500, 100, true);
        assert!(holder.acquire_write(false, Duration::ZERO).await.unwrap());

        let ran = std::sync::atomic::AtomicBool::new(false);
        let result = other
            .read(false, Duration::ZERO, || async {
                ran.store(true, std::sync::atomic::Ordering::SeqCst);
            })
            .await;
        assert!(matches!(result, Err(LockError::AcquireFailed { .. })));
        assert!(!ran.load(std::sync::atomic::Ordering::SeqCst));
        holder.release_write().await;
    }

    #[tokio::test]
    async fn test_scoped_body_aborted_on_lock_loss() {
        let store = MemoryStore::new();
        let holder = handle(&store, "k", 500, 30, true);
        let thief = SingleLock::new(Arc::new(store.clone()), "k", Duration::from_millis(500));

        let result = holder
            .write(false, Duration::ZERO, || async {
                // Our slot vanishes and another client takes the key
                let stolen = SingleLock::new(Arc::new(store.clone()), "k", Duration::from_millis(500))
                    .with_owner(holder.owner().clone());
                stolen.release_write_lock().await.unwrap();
                assert!(thief.acquire_write_lock(false, Duration::ZERO).await.unwrap());
                tokio::time::sleep(Duration::from_secs(5)).await;
            })
            .await;
        assert!(matches!(result, Err(LockError::LockLost { .. })));

        // The thief's hold survives our release
        let status = thief.status().await.unwrap();
        assert!(status.owned);
    }

    #[tokio::test]
    async fn test_dropped_guard_releases_in_background() {
        let store = MemoryStore::new();
        let holder = handle(&store, "k", 5000, 100, true);
        let guard = holder.read_guard(false, Duration::ZERO).await.unwrap();
        assert_eq!(guard.lock_type(), LockType::Shared);
        drop(guard);

        assert!(wait_until_unheld(&store, "k").await);
    }

    #[tokio::test]
    async fn test_cancelled_scope_still_releases() {
        let store = MemoryStore::new();
        let holder = handle(&store, "k", 5000, 100, true);

        let scope = holder.write(false, Duration::ZERO, || tokio::time::sleep(Duration::from_secs(10)));
        assert!(tokio::time::timeout(Duration::from_millis(100), scope).await.is_err());

        assert!(wait_until_unheld(&store, "k").await);
    }

    #[tokio::test]
    async fn test_reacquire_keeps_single_renewal_task() {
        let store = MemoryStore::new();
        let holder = handle(&store, "k", 500, 50, true);
        assert!(holder.acquire_read(false, Duration::ZERO).await.unwrap());
        let first = holder.lost_token();
        assert!(holder.acquire_read(false, Duration::ZERO).await.unwrap());
        assert!(holder.is_refreshing());
        assert!(!first.is_cancelled());

        holder.release_read().await;
        holder.release_read().await;
        holder.close().await;
        assert!(!holder.is_refreshing());
    }
}
