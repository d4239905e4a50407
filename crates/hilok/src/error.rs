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

use crate::types::{LockType, OwnerToken};
use thiserror::Error;

/// Lock operation related error types
#[derive(Error, Debug)]
pub enum LockError {
    /// The lease behind a held lock expired or was taken over while we believed we held it
    #[error("Lock lost on '{path}': owner {owner} no longer holds the {lock_type} lease")]
    LockLost {
        path: String,
        owner: OwnerToken,
        lock_type: LockType,
    },

    /// Scoped acquisition could not obtain the lock
    #[error("Failed to acquire {lock_type} lock on '{path}'")]
    AcquireFailed { path: String, lock_type: LockType },

    /// One level of a hierarchical acquisition failed; everything below it was unwound
    #[error("Failed to acquire hierarchical {lock_type} lock on '{path}': segment '{segment}' is unavailable")]
    HierarchyAcquire {
        path: String,
        segment: String,
        lock_type: LockType,
    },

    /// Path could not be split into lockable segments
    #[error("Invalid lock path '{path}': {reason}")]
    InvalidPath { path: String, reason: String },

    /// Keyspace store round trip failed
    #[error("Store error: {message}")]
    Store {
        message: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// Configuration error
    #[error("Configuration error: {message}")]
    Configuration { message: String },

    /// The store answered with a reply the lock scripts never produce
    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl LockError {
    /// Create lock lost error
    pub fn lock_lost(path: impl Into<String>, owner: OwnerToken, lock_type: LockType) -> Self {
        Self::LockLost {
            path: path.into(),
            owner,
            lock_type,
        }
    }

    /// Create scoped acquisition failure
    pub fn acquire_failed(path: impl Into<String>, lock_type: LockType) -> Self {
        Self::AcquireFailed {
            path: path.into(),
            lock_type,
        }
    }

    /// Create hierarchical acquisition failure
    pub fn hierarchy(path: impl Into<String>, segment: impl Into<String>, lock_type: LockType) -> Self {
        Self::HierarchyAcquire {
            path: path.into(),
            segment: segment.into(),
            lock_type,
        }
    }

    /// Create invalid path error
    pub fn invalid_path(path: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidPath {
            path: path.into(),
            reason: reason.into(),
        }
    }

    /// Create store error
    pub fn store(message: impl Into<String>, source: impl std::error::Error + Send + Sync + 'static) -> Self {
        Self::Store {
            message: message.into(),
            source: Box::new(source),
        }
    }

    /// Create configuration error
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration { message: message.into() }
    }

    /// Create internal error
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal { message: message.into() }
    }

    /// Check if the error reports a lost lease
    pub fn is_lock_lost(&self) -> bool {
        matches!(self, Self::LockLost { .. })
    }

    /// Check if it is a retryable error
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Store { .. } | Self::AcquireFailed { .. } | Self::HierarchyAcquire { .. }
        )
    }
}

/// Lock operation Result type
pub type Result<T> = std::result::Result<T, LockError>;

impl From<redis::RedisError> for LockError {
    fn from(err: redis::RedisError) -> Self {
        let message = if err.is_timeout() {
            "redis command timed out".to_string()
        } else if err.is_io_error() || err.is_connection_dropped() || err.is_connection_refusal() {
            "redis connection failure".to_string()
        } else {
            format!("redis command failed ({:?})", err.kind())
        };
        Self::store(message, err)
    }
}
