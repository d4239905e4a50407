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

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::time::Instant;

use crate::{
    error::{LockError, Result},
    store::KeyspaceStore,
    types::{LockKeys, LockStatus, LockType, OwnerToken},
};

/// Mutation recorded by [`MemoryStore`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreOp {
    Acquire,
    Release,
}

/// One successful mutation, in the order the store applied it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreEvent {
    pub op: StoreOp,
    pub path: String,
    pub lock_type: LockType,
    pub owner: OwnerToken,
}

#[derive(Debug)]
enum Value {
    Writer(String),
    Readers(Vec<String>),
}

#[derive(Debug)]
struct Entry {
    value: Value,
    expires_at: Option<Instant>,
}

#[derive(Debug, Default)]
struct Keyspace {
    entries: HashMap<String, Entry>,
    journal: Vec<StoreEvent>,
}

impl Keyspace {
    /// Drop `key` if its TTL elapsed, then return it
    fn live(&mut self, key: &str, now: Instant) -> Option<&mut Entry> {
        let expired = self
            .entries
            .get(key)
            .is_some_and(|entry| entry.expires_at.is_some_and(|exp| exp <= now));
        if expired {
            self.entries.remove(key);
        }
        self.entries.get_mut(key)
    }

    fn writer(&mut self, key: &str, now: Instant) -> Option<String> {
        match self.live(key, now) {
            Some(Entry {
                value: Value::Writer(owner),
                ..
            }) => Some(owner.clone()),
            _ => None,
        }
    }

    fn readers(&mut self, key: &str, now: Instant) -> Option<&mut Vec<String>> {
        match self.live(key, now) {
            Some(Entry {
                value: Value::Readers(readers),
                ..
            }) => Some(readers),
            _ => None,
        }
    }

    fn pttl(&self, key: &str, now: Instant) -> i64 {
        match self.entries.get(key) {
            Some(Entry {
                expires_at: Some(exp), ..
            }) => exp.saturating_duration_since(now).as_millis() as i64,
            Some(_) => -1,
            None => -2,
        }
    }

    fn record(&mut self, op: StoreOp, keys: &LockKeys, lock_type: LockType, owner: &OwnerToken) {
        self.journal.push(StoreEvent {
            op,
            path: keys.path.clone(),
            lock_type,
            owner: owner.clone(),
        });
    }
}

/// In-process keyspace store with the same semantics as the Redis scripts.
///
/// One mutex guards the whole keyspace, so every operation is atomic. Expired keys
/// are dropped lazily on access. Clones share the same keyspace, which lets tests
/// model several independent clients against one store.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    keyspace: Arc<Mutex<Keyspace>>,
    offline: Arc<AtomicBool>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every following operation fail with a store error until switched back
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    /// Successful acquire/release mutations, oldest first
    pub fn journal(&self) -> Vec<StoreEvent> {
        self.keyspace.lock().journal.clone()
    }

    pub fn clear_journal(&self) {
        self.keyspace.lock().journal.clear();
    }

    /// Number of live keys
    pub fn len(&self) -> usize {
        let now = Instant::now();
        let keyspace = self.keyspace.lock();
        keyspace
            .entries
            .values()
            .filter(|entry| entry.expires_at.is_none_or(|exp| exp > now))
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn ensure_online(&self) -> Result<()> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(LockError::store(
                "memory store is offline",
                std::io::Error::new(std::io::ErrorKind::NotConnected, "offline"),
            ));
        }
        Ok(())
    }
}

#[async_trait]
impl KeyspaceStore for MemoryStore {
    async fn try_acquire_read(&self, keys: &LockKeys, owner: &OwnerToken, ttl: Duration) -> Result<bool> {
        self.ensure_online()?;
        let now = Instant::now();
        let mut keyspace = self.keyspace.lock();
        if keyspace.writer(&keys.writer, now).is_some() {
            return Ok(false);
        }

        let expires_at = Some(now + ttl);
        match keyspace.readers(&keys.readers, now) {
            Some(readers) => readers.insert(0, owner.as_str().to_string()),
            None => {
                keyspace.entries.insert(
                    keys.readers.clone(),
                    Entry {
                        value: Value::Readers(vec![owner.as_str().to_string()]),
                        expires_at,
                    },
                );
            }
        }
        if let Some(entry) = keyspace.entries.get_mut(&keys.readers) {
            entry.expires_at = expires_at;
        }
        keyspace.record(StoreOp::Acquire, keys, LockType::Shared, owner);
        Ok(true)
    }

    async fn try_acquire_write(&self, keys: &LockKeys, owner: &OwnerToken, ttl: Duration) -> Result<bool> {
        self.ensure_online()?;
        let now = Instant::now();
        let mut keyspace = self.keyspace.lock();
        if keyspace.writer(&keys.writer, now).is_some() {
            return Ok(false);
        }
        if keyspace.readers(&keys.readers, now).is_some_and(|readers| !readers.is_empty()) {
            return Ok(false);
        }

        keyspace.entries.insert(
            keys.writer.clone(),
            Entry {
                value: Value::Writer(owner.as_str().to_string()),
                expires_at: Some(now + ttl),
            },
        );
        keyspace.record(StoreOp::Acquire, keys, LockType::Exclusive, owner);
        Ok(true)
    }

    async fn refresh(&self, keys: &LockKeys, owner: &OwnerToken, shared: bool, ttl: Duration) -> Result<bool> {
        self.ensure_online()?;
        let now = Instant::now();
        let mut keyspace = self.keyspace.lock();
        let (key, present) = if shared {
            let present = keyspace
                .readers(&keys.readers, now)
                .is_some_and(|readers| readers.iter().any(|r| r == owner.as_str()));
            (&keys.readers, present)
        } else {
            let present = keyspace.writer(&keys.writer, now).is_some_and(|w| w == owner.as_str());
            (&keys.writer, present)
        };
        if !present {
            return Ok(false);
        }
        if let Some(entry) = keyspace.entries.get_mut(key) {
            entry.expires_at = Some(now + ttl);
        }
        Ok(true)
    }

    async fn release_read(&self, keys: &LockKeys, owner: &OwnerToken) -> Result<bool> {
        self.ensure_online()?;
        let now = Instant::now();
        let mut keyspace = self.keyspace.lock();
        let Some(readers) = keyspace.readers(&keys.readers, now) else {
            return Ok(false);
        };
        let Some(pos) = readers.iter().position(|r| r == owner.as_str()) else {
            return Ok(false);
        };
        readers.remove(pos);
        if readers.is_empty() {
            keyspace.entries.remove(&keys.readers);
        }
        keyspace.record(StoreOp::Release, keys, LockType::Shared, owner);
        Ok(true)
    }

    async fn release_write(&self, keys: &LockKeys, owner: &OwnerToken) -> Result<bool> {
        self.ensure_online()?;
        let now = Instant::now();
        let mut keyspace = self.keyspace.lock();
        if keyspace.writer(&keys.writer, now).as_deref() != Some(owner.as_str()) {
            return Ok(false);
        }
        keyspace.entries.remove(&keys.writer);
        keyspace.record(StoreOp::Release, keys, LockType::Exclusive, owner);
        Ok(true)
    }

    async fn status(&self, keys: &LockKeys, owner: &OwnerToken) -> Result<LockStatus> {
        self.ensure_online()?;
        let now = Instant::now();
        let mut keyspace = self.keyspace.lock();
        if let Some(writer) = keyspace.writer(&keys.writer, now) {
            let pttl = keyspace.pttl(&keys.writer, now);
            return LockStatus::from_raw(keys.path.clone(), "write", writer == owner.as_str(), pttl);
        }
        let owned = match keyspace.readers(&keys.readers, now) {
            Some(readers) if !readers.is_empty() => Some(readers.iter().any(|r| r == owner.as_str())),
            _ => None,
        };
        match owned {
            Some(owned) => {
                let pttl = keyspace.pttl(&keys.readers, now);
                LockStatus::from_raw(keys.path.clone(), "read", owned, pttl)
            }
            None => Ok(LockStatus::unheld(keys.path.clone())),
        }
    }

    async fn is_online(&self) -> bool {
        !self.offline.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn keys(path: &str) -> LockKeys {
        LockKeys::new("test", path)
    }

    #[tokio::test]
    async fn test_readers_share_and_block_writer() {
        let store = MemoryStore::new();
        let (a, b, w) = (OwnerToken::generate(), OwnerToken::generate(), OwnerToken::generate());
        let ttl = Duration::from_secs(5);

        assert!(store.try_acquire_read(&keys("x"), &a, ttl).await.unwrap());
        assert!(store.try_acquire_read(&keys("x"), &b, ttl).await.unwrap());
        assert!(!store.try_acquire_write(&keys("x"), &w, ttl).await.unwrap());

        assert!(store.release_read(&keys("x"), &a).await.unwrap());
        assert!(store.release_read(&keys("x"), &b).await.unwrap());
        assert!(store.try_acquire_write(&keys("x"), &w, ttl).await.unwrap());
        assert!(!store.try_acquire_read(&keys("x"), &a, ttl).await.unwrap());
    }

    #[tokio::test]
    async fn test_release_only_by_owner() {
        let store = MemoryStore::new();
        let (owner, other) = (OwnerToken::generate(), OwnerToken::generate());
        let ttl = Duration::from_secs(5);

        assert!(store.try_acquire_write(&keys("x"), &owner, ttl).await.unwrap());
        assert!(!store.release_write(&keys("x"), &other).await.unwrap());
        assert!(store.status(&keys("x"), &owner).await.unwrap().owned);
        assert!(store.release_write(&keys("x"), &owner).await.unwrap());
        assert!(!store.release_write(&keys("x"), &owner).await.unwrap());
        assert!(store.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_ttl_expiry_and_refresh() {
        let store = MemoryStore::new();
        let owner = OwnerToken::generate();
        let ttl = Duration::from_millis(500);

        assert!(store.try_acquire_write(&keys("x"), &owner, ttl).await.unwrap());
        tokio::time::advance(Duration::from_millis(400)).await;
        assert!(store.refresh(&keys("x"), &owner, false, ttl).await.unwrap());
        tokio::time::advance(Duration::from_millis(400)).await;

        let status = store.status(&keys("x"), &owner).await.unwrap();
        assert!(status.held);
        assert_eq!(status.ttl, Some(Duration::from_millis(100)));

        tokio::time::advance(Duration::from_millis(200)).await;
        assert!(!store.status(&keys("x"), &owner).await.unwrap().held);
        assert!(!store.refresh(&keys("x"), &owner, false, ttl).await.unwrap());
    }

    #[tokio::test]
    async fn test_refresh_checks_mode() {
        let store = MemoryStore::new();
        let owner = OwnerToken::generate();
        let ttl = Duration::from_secs(5);

        assert!(store.try_acquire_read(&keys("x"), &owner, ttl).await.unwrap());
        assert!(store.refresh(&keys("x"), &owner, true, ttl).await.unwrap());
        assert!(!store.refresh(&keys("x"), &owner, false, ttl).await.unwrap());
        assert!(!store.refresh(&keys("x"), &OwnerToken::generate(), true, ttl).await.unwrap());
    }

    #[tokio::test]
    async fn test_offline_and_journal() {
        let store = MemoryStore::new();
        let owner = OwnerToken::generate();
        let ttl = Duration::from_secs(5);

        assert!(store.try_acquire_read(&keys("x"), &owner, ttl).await.unwrap());
        store.set_offline(true);
        assert!(!store.is_online().await);
        assert!(store.release_read(&keys("x"), &owner).await.is_err());
        store.set_offline(false);
        assert!(store.release_read(&keys("x"), &owner).await.unwrap());

        let ops: Vec<_> = store.journal().into_iter().map(|e| (e.op, e.lock_type)).collect();
        assert_eq!(
            ops,
            vec![(StoreOp::Acquire, LockType::Shared), (StoreOp::Release, LockType::Shared)]
        );
    }
}
