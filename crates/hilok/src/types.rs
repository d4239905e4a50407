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

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use crate::error::LockError;

/// Lock type enumeration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LockType {
    /// Exclusive lock (write lock)
    Exclusive,
    /// Shared lock (read lock)
    Shared,
}

impl LockType {
    pub fn is_shared(&self) -> bool {
        matches!(self, Self::Shared)
    }
}

impl fmt::Display for LockType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Exclusive => f.write_str("write"),
            Self::Shared => f.write_str("read"),
        }
    }
}

impl FromStr for LockType {
    type Err = LockError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "read" | "shared" => Ok(Self::Shared),
            "write" | "exclusive" => Ok(Self::Exclusive),
            other => Err(LockError::configuration(format!("unknown lock mode '{other}'"))),
        }
    }
}

/// Opaque identifier proving which caller holds a reader entry or the writer slot.
///
/// Generated tokens carry 128 bits of randomness, hex encoded. Tokens handed in by
/// callers (for restore) are taken as-is.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OwnerToken(String);

impl OwnerToken {
    /// Generate a fresh random token
    pub fn generate() -> Self {
        Self(format!("{:032x}", rand::random::<u128>()))
    }

    /// Wrap an existing token, e.g. one persisted before a process restart
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for OwnerToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for OwnerToken {
    type Err = LockError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        if trimmed.is_empty() {
            return Err(LockError::configuration("owner token must not be empty"));
        }
        Ok(Self(trimmed.to_string()))
    }
}

impl AsRef<str> for OwnerToken {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Store keys backing a single lock path
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LockKeys {
    /// Lock path (one hierarchy prefix, not the full request path)
    pub path: String,
    /// Hash holding the writer slot in its `owner` field
    pub writer: String,
    /// List of reader owner tokens
    pub readers: String,
}

impl LockKeys {
    pub fn new(prefix: &str, path: &str) -> Self {
        Self {
            path: path.to_string(),
            writer: format!("{prefix}:{path}:write"),
            readers: format!("{prefix}:{path}:read"),
        }
    }
}

/// Point-in-time view of a single lock key
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockStatus {
    /// Lock path
    pub path: String,
    /// Whether anyone holds the key
    pub held: bool,
    /// Mode of the current hold
    pub lock_type: Option<LockType>,
    /// Whether the querying owner is among the holders
    pub owned: bool,
    /// Remaining lease, `None` when unheld or when the store reports no expiry
    #[serde(with = "ttl_millis")]
    pub ttl: Option<Duration>,
}

impl LockStatus {
    pub fn unheld(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            held: false,
            lock_type: None,
            owned: false,
            ttl: None,
        }
    }

    /// Build a status from the raw `(mode, owned, pttl)` triple reported by the store scripts.
    /// `mode` is one of `write`, `read` or `none`; anything else is an internal error.
    pub fn from_raw(path: impl Into<String>, mode: &str, owned: bool, pttl_ms: i64) -> Result<Self, LockError> {
        let lock_type = match mode {
            "write" => Some(LockType::Exclusive),
            "read" => Some(LockType::Shared),
            "none" => None,
            other => return Err(LockError::internal(format!("store reported unknown lock mode '{other}'"))),
        };
        Ok(Self {
            path: path.into(),
            held: lock_type.is_some(),
            lock_type,
            owned: lock_type.is_some() && owned,
            ttl: u64::try_from(pttl_ms).ok().map(Duration::from_millis),
        })
    }
}

mod ttl_millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(ttl: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error> {
        match ttl {
            Some(ttl) => serializer.serialize_some(&(ttl.as_millis() as u64)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<Duration>, D::Error> {
        Ok(Option::<u64>::deserialize(deserializer)?.map(Duration::from_millis))
    }
}

/// Lock statistics snapshot
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockStats {
    /// Hierarchical acquisitions that obtained every level
    pub successful_acquires: u64,
    /// Hierarchical acquisitions that failed and were unwound
    pub failed_acquires: u64,
    /// Acquisitions that re-attached to an existing hold by owner token
    pub restores: u64,
    /// Hierarchical releases, scoped or by token
    pub releases: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_owner_token_generation() {
        let a = OwnerToken::generate();
        let b = OwnerToken::generate();
        assert_ne!(a, b);
        assert_eq!(a.as_str().len(), 32);
        assert!(a.as_str().chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_owner_token_parse() {
        assert_eq!("  abc ".parse::<OwnerToken>().unwrap().as_str(), "abc");
        assert!("".parse::<OwnerToken>().is_err());
    }

    #[test]
    fn test_lock_type_parse_and_display() {
        assert_eq!("read".parse::<LockType>().unwrap(), LockType::Shared);
        assert_eq!("Exclusive".parse::<LockType>().unwrap(), LockType::Exclusive);
        assert!("upgrade".parse::<LockType>().is_err());
        assert_eq!(LockType::Exclusive.to_string(), "write");
    }

    #[test]
    fn test_lock_keys() {
        let keys = LockKeys::new("hilok", "tenants/42");
        assert_eq!(keys.writer, "hilok:tenants/42:write");
        assert_eq!(keys.readers, "hilok:tenants/42:read");
    }

    #[test]
    fn test_status_from_raw() {
        let status = LockStatus::from_raw("a", "write", true, 420).unwrap();
        assert!(status.held);
        assert!(status.owned);
        assert_eq!(status.lock_type, Some(LockType::Exclusive));
        assert_eq!(status.ttl, Some(Duration::from_millis(420)));

        let none = LockStatus::from_raw("a", "none", true, -2).unwrap();
        assert_eq!(none, LockStatus::unheld("a"));
    }

    #[test]
    fn test_status_from_raw_rejects_unknown_mode() {
        let err = LockStatus::from_raw("a", "upgrade", true, 100).unwrap_err();
        assert!(matches!(err, LockError::Internal { .. }));
        assert!(err.to_string().contains("upgrade"));
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_status_serialization() {
        let status = LockStatus::from_raw("a/b", "read", false, 1500).unwrap();
        let json = serde_json::to_string(&status).unwrap();
        assert!(json.contains("\"ttl\":1500"));
        let back: LockStatus = serde_json::from_str(&json).unwrap();
        assert_eq!(back, status);
    }
}
