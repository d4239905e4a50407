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
use redis::Script;
use redis::aio::ConnectionManager;
use std::sync::LazyLock;
use std::time::Duration;
use tracing::{debug, info};

use crate::{
    error::Result,
    store::KeyspaceStore,
    types::{LockKeys, LockStatus, OwnerToken},
};

// KEYS[1] = writer hash, KEYS[2] = readers list, ARGV[1] = owner, ARGV[2] = ttl in ms

const ACQUIRE_READ: &str = r#"
if redis.call('HEXISTS', KEYS[1], 'owner') == 1 then
    return 0
end
redis.call('LPUSH', KEYS[2], ARGV[1])
redis.call('PEXPIRE', KEYS[2], ARGV[2])
return 1
"#;

const ACQUIRE_WRITE: &str = r#"
if redis.call('HEXISTS', KEYS[1], 'owner') == 1 or redis.call('LLEN', KEYS[2]) > 0 then
    return 0
end
redis.call('HSET', KEYS[1], 'owner', ARGV[1])
redis.call('PEXPIRE', KEYS[1], ARGV[2])
return 1
"#;

// ARGV[3] = '1' for a shared hold
const REFRESH: &str = r#"
if ARGV[3] == '1' then
    if not redis.call('LPOS', KEYS[2], ARGV[1]) then
        return 0
    end
    redis.call('PEXPIRE', KEYS[2], ARGV[2])
    return 1
end
if redis.call('HGET', KEYS[1], 'owner') ~= ARGV[1] then
    return 0
end
redis.call('PEXPIRE', KEYS[1], ARGV[2])
return 1
"#;

const RELEASE_READ: &str = r#"
return redis.call('LREM', KEYS[2], 1, ARGV[1])
"#;

const RELEASE_WRITE: &str = r#"
if redis.call('HGET', KEYS[1], 'owner') == ARGV[1] then
    return redis.call('HDEL', KEYS[1], 'owner')
end
return 0
"#;

const STATUS: &str = r#"
local writer = redis.call('HGET', KEYS[1], 'owner')
if writer then
    return {'write', writer == ARGV[1] and 1 or 0, redis.call('PTTL', KEYS[1])}
end
if redis.call('LLEN', KEYS[2]) > 0 then
    local owned = redis.call('LPOS', KEYS[2], ARGV[1]) and 1 or 0
    return {'read', owned, redis.call('PTTL', KEYS[2])}
end
return {'none', 0, -2}
"#;

static ACQUIRE_READ_SCRIPT: LazyLock<Script> = LazyLock::new(|| Script::new(ACQUIRE_READ));
static ACQUIRE_WRITE_SCRIPT: LazyLock<Script> = LazyLock::new(|| Script::new(ACQUIRE_WRITE));
static REFRESH_SCRIPT: LazyLock<Script> = LazyLock::new(|| Script::new(REFRESH));
static RELEASE_READ_SCRIPT: LazyLock<Script> = LazyLock::new(|| Script::new(RELEASE_READ));
static RELEASE_WRITE_SCRIPT: LazyLock<Script> = LazyLock::new(|| Script::new(RELEASE_WRITE));
static STATUS_SCRIPT: LazyLock<Script> = LazyLock::new(|| Script::new(STATUS));

fn ttl_millis(ttl: Duration) -> u64 {
    (ttl.as_millis() as u64).max(1)
}

/// Redis backed keyspace store
///
/// Every operation runs as a Lua script (`EVALSHA`, falling back to `EVAL`), so the
/// check and the mutation happen inside one server-side transaction.
#[derive(Clone)]
pub struct RedisStore {
    endpoint: String,
    conn: ConnectionManager,
}

impl std::fmt::Debug for RedisStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisStore").field("endpoint", &self.endpoint).finish()
    }
}

impl RedisStore {
    /// Connect to `redis://` / `rediss://` endpoint. The connection manager reconnects on its own.
    pub async fn connect(endpoint: &str) -> Result<Self> {
        let client = redis::Client::open(endpoint)?;
        let conn = ConnectionManager::new(client).await?;
        info!("Connected lock store to {}", endpoint);
        Ok(Self {
            endpoint: endpoint.to_string(),
            conn,
        })
    }

    /// Wrap an existing connection manager
    pub fn from_connection_manager(endpoint: impl Into<String>, conn: ConnectionManager) -> Self {
        Self {
            endpoint: endpoint.into(),
            conn,
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

#[async_trait]
impl KeyspaceStore for RedisStore {
    async fn try_acquire_read(&self, keys: &LockKeys, owner: &OwnerToken, ttl: Duration) -> Result<bool> {
        let mut conn = self.conn.clone();
        let acquired: i64 = ACQUIRE_READ_SCRIPT
            .key(&keys.writer)
            .key(&keys.readers)
            .arg(owner.as_str())
            .arg(ttl_millis(ttl))
            .invoke_async(&mut conn)
            .await?;
        Ok(acquired == 1)
    }

    async fn try_acquire_write(&self, keys: &LockKeys, owner: &OwnerToken, ttl: Duration) -> Result<bool> {
        let mut conn = self.conn.clone();
        let acquired: i64 = ACQUIRE_WRITE_SCRIPT
            .key(&keys.writer)
            .key(&keys.readers)
            .arg(owner.as_str())
            .arg(ttl_millis(ttl))
            .invoke_async(&mut conn)
            .await?;
        Ok(acquired == 1)
    }

    async fn refresh(&self, keys: &LockKeys, owner: &OwnerToken, shared: bool, ttl: Duration) -> Result<bool> {
        let mut conn = self.conn.clone();
        let refreshed: i64 = REFRESH_SCRIPT
            .key(&keys.writer)
            .key(&keys.readers)
            .arg(owner.as_str())
            .arg(ttl_millis(ttl))
            .arg(if shared { "1" } else { "0" })
            .invoke_async(&mut conn)
            .await?;
        Ok(refreshed == 1)
    }

    async fn release_read(&self, keys: &LockKeys, owner: &OwnerToken) -> Result<bool> {
        let mut conn = self.conn.clone();
        let removed: i64 = RELEASE_READ_SCRIPT
            .key(&keys.writer)
            .key(&keys.readers)
            .arg(owner.as_str())
            .invoke_async(&mut conn)
            .await?;
        Ok(removed > 0)
    }

    async fn release_write(&self, keys: &LockKeys, owner: &OwnerToken) -> Result<bool> {
        let mut conn = self.conn.clone();
        let removed: i64 = RELEASE_WRITE_SCRIPT
            .key(&keys.writer)
            .key(&keys.readers)
            .arg(owner.as_str())
            .invoke_async(&mut conn)
            .await?;
        Ok(removed > 0)
    }

    async fn status(&self, keys: &LockKeys, owner: &OwnerToken) -> Result<LockStatus> {
        let mut conn = self.conn.clone();
        let (mode, owned, pttl): (String, i64, i64) = STATUS_SCRIPT
            .key(&keys.writer)
            .key(&keys.readers)
            .arg(owner.as_str())
            .invoke_async(&mut conn)
            .await?;
        LockStatus::from_raw(keys.path.clone(), &mode, owned == 1, pttl)
    }

    async fn is_online(&self) -> bool {
        let mut conn = self.conn.clone();
        let pong: redis::RedisResult<String> = redis::cmd("PING").query_async(&mut conn).await;
        if let Err(err) = &pong {
            debug!("Lock store {} is not answering: {}", self.endpoint, err);
        }
        pong.is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ttl_millis_never_zero() {
        assert_eq!(ttl_millis(Duration::ZERO), 1);
        assert_eq!(ttl_millis(Duration::from_millis(1500)), 1500);
    }

    #[test]
    fn test_scripts_touch_both_keys() {
        for script in [ACQUIRE_READ, ACQUIRE_WRITE, REFRESH, STATUS] {
            assert!(script.contains("KEYS[1]"));
            assert!(script.contains("KEYS[2]"));
        }
        assert!(RELEASE_WRITE.contains("HDEL"));
        assert!(RELEASE_READ.contains("LREM"));
    }
}
