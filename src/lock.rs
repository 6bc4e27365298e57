//! Lease-based mutual exclusion per job, backed by an external coordination
//! service. Every successful acquire hands out a fencing token that is
//! strictly greater than any token previously issued for the same key.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bb8::{Pool, PooledConnection};
use redis::aio::MultiplexedConnection;
use redis::{Client, RedisError, Script};
use tokio::time::Instant;

use crate::{BoxLockService, FencingToken, JobId, JobcuterError};

pub const DEFAULT_KEY_PREFIX: &str = "job-lock-";
pub const DEFAULT_LEASE_TTL: Duration = Duration::from_secs(5 * 60);

/// Primitives required from the coordination service.
#[async_trait]
pub trait LockService: Send + Sync {
    /// Takes `key` for `ttl` if nobody holds it. `Ok(None)` means it is held.
    async fn acquire(&self, key: &str, ttl: Duration) -> Result<Option<FencingToken>, JobcuterError>;

    /// Drops `key` if it is still held under `token`. Returns whether a lease
    /// was actually released.
    async fn release(&self, key: &str, token: FencingToken) -> Result<bool, JobcuterError>;
}

/// An exclusive, time-bounded claim on one job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lease {
    pub job_id: JobId,
    pub key: String,
    pub token: FencingToken,
    pub ttl: Duration,
    pub acquired_at: Instant,
}

impl Lease {
    pub fn expires_at(&self) -> Instant {
        self.acquired_at + self.ttl
    }

    pub fn is_expired(&self) -> bool {
        Instant::now() >= self.expires_at()
    }
}

/// Derives lock keys from job ids and turns service replies into leases.
#[derive(Clone)]
pub struct LockCoordinator {
    service: BoxLockService,
    ttl: Duration,
    key_prefix: String,
}

impl LockCoordinator {
    pub fn new(service: BoxLockService, ttl: Duration) -> Self {
        Self::with_prefix(service, ttl, DEFAULT_KEY_PREFIX)
    }

    pub fn with_prefix(service: BoxLockService, ttl: Duration, key_prefix: impl Into<String>) -> Self {
        Self {
            service,
            ttl,
            key_prefix: key_prefix.into(),
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub fn lock_key(&self, job_id: &str) -> String {
        format!("{}{}", self.key_prefix, job_id)
    }

    /// Fails with `LockUnavailable` if another attempt holds the job and with
    /// `Coordination` if the service could not be reached.
    pub async fn acquire(&self, job_id: &str) -> Result<Lease, JobcuterError> {
        let key = self.lock_key(job_id);
        let acquired_at = Instant::now();

        match self.service.acquire(&key, self.ttl).await {
            Ok(Some(token)) => {
                tracing::debug!(job_id, key = %key, fencing_token = token, "Lease acquired");
                Ok(Lease {
                    job_id: job_id.to_string(),
                    key,
                    token,
                    ttl: self.ttl,
                    acquired_at,
                })
            }
            Ok(None) => Err(JobcuterError::LockUnavailable(job_id.to_string())),
            Err(e) => {
                tracing::warn!(job_id, key = %key, error = %e, "Lock service unavailable");
                Err(match e {
                    JobcuterError::Coordination(_) => e,
                    other => JobcuterError::Coordination(other.to_string()),
                })
            }
        }
    }

    /// Best-effort release; a lease that cannot be released expires by TTL.
    pub async fn release(&self, lease: Lease) {
        match self.service.release(&lease.key, lease.token).await {
            Ok(true) => {
                tracing::debug!(job_id = %lease.job_id, fencing_token = lease.token, "Lease released");
            }
            Ok(false) => {
                tracing::warn!(
                    job_id = %lease.job_id,
                    fencing_token = lease.token,
                    "Lease was no longer held at release"
                );
            }
            Err(e) => {
                tracing::warn!(job_id = %lease.job_id, error = %e, "Failed to release lease");
            }
        }
    }
}

#[derive(Debug)]
struct Held {
    token: FencingToken,
    expires_at: Instant,
}

#[derive(Debug, Default)]
struct MemoryLocks {
    held: HashMap<String, Held>,
    fences: HashMap<String, FencingToken>,
}

/// Process-local lock service with the same semantics as the Redis one.
#[derive(Debug, Default)]
pub struct MemoryLockService {
    locks: Mutex<MemoryLocks>,
}

impl MemoryLockService {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    pub fn is_held(&self, key: &str) -> bool {
        let locks = self.locks.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        locks
            .held
            .get(key)
            .is_some_and(|held| held.expires_at > Instant::now())
    }
}

#[async_trait]
impl LockService for MemoryLockService {
    async fn acquire(&self, key: &str, ttl: Duration) -> Result<Option<FencingToken>, JobcuterError> {
        let mut locks = self
            .locks
            .lock()
            .map_err(|e| JobcuterError::Coordination(e.to_string()))?;
        let now = Instant::now();

        if locks.held.get(key).is_some_and(|held| held.expires_at > now) {
            return Ok(None);
        }

        let fence = locks.fences.entry(key.to_string()).or_insert(0);
        *fence += 1;
        let token = *fence;
        locks.held.insert(
            key.to_string(),
            Held {
                token,
                expires_at: now + ttl,
            },
        );
        Ok(Some(token))
    }

    async fn release(&self, key: &str, token: FencingToken) -> Result<bool, JobcuterError> {
        let mut locks = self
            .locks
            .lock()
            .map_err(|e| JobcuterError::Coordination(e.to_string()))?;

        match locks.held.get(key) {
            Some(held) if held.token == token => {
                locks.held.remove(key);
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

type RedisPool = Pool<Client>;

// Issues the fencing token only when the key is free, in one step, so a
// token is never handed out to an acquirer that later loses the race.
const ACQUIRE_SCRIPT: &str = r#"
if redis.call("EXISTS", KEYS[1]) == 1 then
    return false
end
local token = redis.call("INCR", KEYS[2])
redis.call("SET", KEYS[1], token, "PX", ARGV[1])
return token
"#;

const RELEASE_SCRIPT: &str = r#"
if redis.call("GET", KEYS[1]) == ARGV[1] then
    return redis.call("DEL", KEYS[1])
else
    return 0
end
"#;

/// Redis lock service. Acquire is one Lua script that checks the key, bumps a
/// per-key `INCR` fencing counter and sets the key with a `PX` expiry.
pub struct RedisLockService {
    pool: RedisPool,
    acquire_script: Script,
    release_script: Script,
}

impl RedisLockService {
    pub async fn new(
        url: &str,
        pool_size: u32,
        connection_timeout: Duration,
    ) -> Result<Self, JobcuterError> {
        let client = Client::open(url).map_err(coordination)?;

        let pool = Pool::builder()
            .max_size(pool_size)
            .connection_timeout(connection_timeout)
            .build(client)
            .await
            .map_err(coordination)?;

        Ok(Self {
            pool,
            acquire_script: Script::new(ACQUIRE_SCRIPT),
            release_script: Script::new(RELEASE_SCRIPT),
        })
    }

    fn fence_key(key: &str) -> String {
        format!("{}:fence", key)
    }

    async fn get_conn(&self) -> Result<PooledConnection<'_, Client>, JobcuterError> {
        self.pool
            .get()
            .await
            .map_err(|e| JobcuterError::Coordination(e.to_string()))
    }
}

fn coordination(e: RedisError) -> JobcuterError {
    JobcuterError::Coordination(e.to_string())
}

#[async_trait]
impl LockService for RedisLockService {
    async fn acquire(&self, key: &str, ttl: Duration) -> Result<Option<FencingToken>, JobcuterError> {
        let mut conn: PooledConnection<'_, Client> = self.get_conn().await?;
        let conn_ref: &mut MultiplexedConnection = &mut conn;

        let ttl_ms = u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX).max(1);
        self.acquire_script
            .key(key)
            .key(Self::fence_key(key))
            .arg(ttl_ms)
            .invoke_async(conn_ref)
            .await
            .map_err(coordination)
    }

    async fn release(&self, key: &str, token: FencingToken) -> Result<bool, JobcuterError> {
        let mut conn: PooledConnection<'_, Client> = self.get_conn().await?;
        let conn_ref: &mut MultiplexedConnection = &mut conn;

        let deleted: i64 = self
            .release_script
            .key(key)
            .arg(token)
            .invoke_async(conn_ref)
            .await
            .map_err(coordination)?;

        Ok(deleted > 0)
    }
}
