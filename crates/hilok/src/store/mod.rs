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

pub mod memory;
pub mod remote;

use crate::{LockKeys, LockStatus, OwnerToken, Result};
use async_trait::async_trait;
use std::time::Duration;

/// Keyspace store holding every piece of cross-client lock state.
///
/// Each method must execute as one atomic operation on the store side. Callers
/// never combine a read and a later write into a check-then-act sequence.
#[async_trait]
pub trait KeyspaceStore: Send + Sync + std::fmt::Debug {
    /// If no writer is set, push `owner` onto the readers list and reset the list TTL
    async fn try_acquire_read(&self, keys: &LockKeys, owner: &OwnerToken, ttl: Duration) -> Result<bool>;

    /// If no writer is set and the readers list is empty, claim the writer slot with a TTL
    async fn try_acquire_write(&self, keys: &LockKeys, owner: &OwnerToken, ttl: Duration) -> Result<bool>;

    /// Extend the lease if `owner` is still recorded; `false` means the hold is gone
    async fn refresh(&self, keys: &LockKeys, owner: &OwnerToken, shared: bool, ttl: Duration) -> Result<bool>;

    /// Remove one occurrence of `owner` from the readers list; `false` if absent
    async fn release_read(&self, keys: &LockKeys, owner: &OwnerToken) -> Result<bool>;

    /// Clear the writer slot if `owner` holds it; `false` otherwise
    async fn release_write(&self, keys: &LockKeys, owner: &OwnerToken) -> Result<bool>;

    /// Report who holds the key, relative to `owner`
    async fn status(&self, keys: &LockKeys, owner: &OwnerToken) -> Result<LockStatus>;

    /// Check if the store answers
    async fn is_online(&self) -> bool;
}
