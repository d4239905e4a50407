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

//! Hierarchical distributed read/write locks with expiring leases.
//!
//! Lock state lives entirely in a shared keyspace store (Redis in production).
//! A path such as `/tenants/42/jobs` is locked level by level: every ancestor
//! prefix shared, the leaf in the requested mode. Holders renew their leases in
//! the background and are told through a cancellation token when one is lost.

// ============================================================================
// Core Module Declarations
// ============================================================================

// Hierarchy Layer Modules
pub mod hierarchy;
pub mod path;

// Lease Layer Modules
pub mod handle;
pub mod lock;
mod release;

// Store Layer Modules
pub mod store;

// Core Modules
pub mod config;
pub mod error;
pub mod types;

// ============================================================================
// Public API Exports
// ============================================================================

pub use crate::{
    config::HiLokConfig,
    error::{LockError, Result},
    handle::{HandleGuard, RefreshingLockHandle},
    hierarchy::{HierarchicalLockCoordinator, HierarchyGuard},
    lock::SingleLock,
    path::LockPath,
    store::{
        KeyspaceStore,
        memory::{MemoryStore, StoreEvent, StoreOp},
        remote::RedisStore,
    },
    types::{LockKeys, LockStats, LockStatus, LockType, OwnerToken},
};

// ============================================================================
// Defaults
// ============================================================================

use std::sync::Arc;
use std::time::Duration;

/// Current version of the hilok crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Namespace prepended to every store key
pub const DEFAULT_KEY_PREFIX: &str = "hilok";

/// Poll interval while blocking for a shared lock
pub const DEFAULT_READ_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Poll interval while blocking for an exclusive lock
pub const DEFAULT_WRITE_POLL_INTERVAL: Duration = Duration::from_millis(400);

// ============================================================================
// Convenience Functions
// ============================================================================

/// Connect to Redis at `url` and build a coordinator over it
pub async fn connect(url: &str, config: HiLokConfig) -> Result<HierarchicalLockCoordinator> {
    let store = RedisStore::connect(url).await?;
    HierarchicalLockCoordinator::new(Arc::new(store), config)
}
