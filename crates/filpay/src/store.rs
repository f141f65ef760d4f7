//! Optional persistence: a key-value store with set and short-lived lock
//! primitives, behind a trait with SQLite and in-memory backends.
//!
//! Key layout (all under a configurable prefix):
//! `pending:{addr}`, `daily:{addr}:{date}`, `tier:{addr}`, `firstseen:{addr}`,
//! `settlement:{id}`, the `settlements:pending` set,
//! `voucher:{id}:{buyer}:{seller}`, `vouchers:buyer:{addr}` sets, and
//! `lock:{resource}` rows for distributed locks.

use std::time::{Instant, SystemTime, UNIX_EPOCH};

use dashmap::DashMap;
use std::collections::HashSet;
use std::sync::Mutex;

use crate::FacilitatorError;

/// Distributed locks are short-lived; a TTL above this is clamped.
pub const MAX_LOCK_TTL_SECS: u64 = 30;

/// Key-value persistence backend.
///
/// Implementations must be thread-safe (`Send + Sync`). All methods are
/// synchronous; callers treat failures as non-fatal (the in-process state is
/// authoritative, the store is a restart-recovery write-through).
pub trait KvStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<String>, FacilitatorError>;
    fn put(&self, key: &str, value: &str) -> Result<(), FacilitatorError>;
    fn delete(&self, key: &str) -> Result<(), FacilitatorError>;

    fn sadd(&self, set: &str, member: &str) -> Result<(), FacilitatorError>;
    fn srem(&self, set: &str, member: &str) -> Result<(), FacilitatorError>;
    fn smembers(&self, set: &str) -> Result<Vec<String>, FacilitatorError>;

    /// Acquire `lock:{resource}` with a random token. Returns `false` when
    /// another holder's unexpired token is present. TTL is clamped to
    /// [`MAX_LOCK_TTL_SECS`].
    fn try_lock(&self, resource: &str, token: &str, ttl_secs: u64)
        -> Result<bool, FacilitatorError>;

    /// Release the lock only if `token` still matches (check-then-delete).
    /// Returns `true` when this call released it.
    fn unlock(&self, resource: &str, token: &str) -> Result<bool, FacilitatorError>;
}

fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}

/// SQLite-backed store. Survives restarts; WAL for concurrent readers.
pub struct SqliteKvStore {
    conn: Mutex<rusqlite::Connection>,
    prefix: String,
}

impl SqliteKvStore {
    /// Open (or create) the database at `path`. Keys are namespaced under
    /// `prefix`.
    pub fn open(path: &str, prefix: &str) -> Result<Self, FacilitatorError> {
        let conn = rusqlite::Connection::open(path)
            .map_err(|e| FacilitatorError::Store(format!("open failed: {e}")))?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS kv (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS kv_sets (
                set_key TEXT NOT NULL,
                member TEXT NOT NULL,
                PRIMARY KEY (set_key, member)
            );
            CREATE TABLE IF NOT EXISTS kv_locks (
                resource TEXT PRIMARY KEY,
                token TEXT NOT NULL,
                expires_at INTEGER NOT NULL
            );
            PRAGMA journal_mode=WAL;",
        )
        .map_err(|e| FacilitatorError::Store(format!("schema failed: {e}")))?;
        Ok(Self {
            conn: Mutex::new(conn),
            prefix: prefix.to_string(),
        })
    }

    fn k(&self, key: &str) -> String {
        format!("{}:{key}", self.prefix)
    }
}

impl KvStore for SqliteKvStore {
    fn get(&self, key: &str) -> Result<Option<String>, FacilitatorError> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT value FROM kv WHERE key = ?1",
            [self.k(key)],
            |row| row.get(0),
        )
        .map(Some)
        .or_else(|e| match e {
            rusqlite::Error::QueryReturnedNoRows => Ok(None),
            other => Err(FacilitatorError::Store(format!("get failed: {other}"))),
        })
    }

    fn put(&self, key: &str, value: &str) -> Result<(), FacilitatorError> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO kv (key, value) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            rusqlite::params![self.k(key), value],
        )
        .map(|_| ())
        .map_err(|e| FacilitatorError::Store(format!("put failed: {e}")))
    }

    fn delete(&self, key: &str) -> Result<(), FacilitatorError> {
        let conn = self.conn.lock().unwrap();
        conn.execute("DELETE FROM kv WHERE key = ?1", [self.k(key)])
            .map(|_| ())
            .map_err(|e| FacilitatorError::Store(format!("delete failed: {e}")))
    }

    fn sadd(&self, set: &str, member: &str) -> Result<(), FacilitatorError> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT OR IGNORE INTO kv_sets (set_key, member) VALUES (?1, ?2)",
            rusqlite::params![self.k(set), member],
        )
        .map(|_| ())
        .map_err(|e| FacilitatorError::Store(format!("sadd failed: {e}")))
    }

    fn srem(&self, set: &str, member: &str) -> Result<(), FacilitatorError> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "DELETE FROM kv_sets WHERE set_key = ?1 AND member = ?2",
            rusqlite::params![self.k(set), member],
        )
        .map(|_| ())
        .map_err(|e| FacilitatorError::Store(format!("srem failed: {e}")))
    }

    fn smembers(&self, set: &str) -> Result<Vec<String>, FacilitatorError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn
            .prepare("SELECT member FROM kv_sets WHERE set_key = ?1")
            .map_err(|e| FacilitatorError::Store(format!("smembers failed: {e}")))?;
        let rows = stmt
            .query_map([self.k(set)], |row| row.get::<_, String>(0))
            .map_err(|e| FacilitatorError::Store(format!("smembers failed: {e}")))?;
        rows.collect::<Result<Vec<_>, _>>()
            .map_err(|e| FacilitatorError::Store(format!("smembers failed: {e}")))
    }

    fn try_lock(
        &self,
        resource: &str,
        token: &str,
        ttl_secs: u64,
    ) -> Result<bool, FacilitatorError> {
        let ttl = ttl_secs.min(MAX_LOCK_TTL_SECS) as i64;
        let now = unix_now();
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "DELETE FROM kv_locks WHERE resource = ?1 AND expires_at <= ?2",
            rusqlite::params![self.k(resource), now],
        )
        .map_err(|e| FacilitatorError::Store(format!("lock sweep failed: {e}")))?;
        let inserted = conn
            .execute(
                "INSERT OR IGNORE INTO kv_locks (resource, token, expires_at) VALUES (?1, ?2, ?3)",
                rusqlite::params![self.k(resource), token, now + ttl],
            )
            .map_err(|e| FacilitatorError::Store(format!("lock failed: {e}")))?;
        Ok(inserted > 0)
    }

    fn unlock(&self, resource: &str, token: &str) -> Result<bool, FacilitatorError> {
        let conn = self.conn.lock().unwrap();
        let deleted = conn
            .execute(
                "DELETE FROM kv_locks WHERE resource = ?1 AND token = ?2",
                rusqlite::params![self.k(resource), token],
            )
            .map_err(|e| FacilitatorError::Store(format!("unlock failed: {e}")))?;
        Ok(deleted > 0)
    }
}

/// In-memory store. Fast, lost on restart; the default when no persistence
/// endpoint is configured and the backend used by tests.
#[derive(Default)]
pub struct InMemoryKvStore {
    kv: DashMap<String, String>,
    sets: Mutex<std::collections::HashMap<String, HashSet<String>>>,
    locks: Mutex<std::collections::HashMap<String, (String, Instant, u64)>>,
}

impl InMemoryKvStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KvStore for InMemoryKvStore {
    fn get(&self, key: &str) -> Result<Option<String>, FacilitatorError> {
        Ok(self.kv.get(key).map(|v| v.clone()))
    }

    fn put(&self, key: &str, value: &str) -> Result<(), FacilitatorError> {
        self.kv.insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<(), FacilitatorError> {
        self.kv.remove(key);
        Ok(())
    }

    fn sadd(&self, set: &str, member: &str) -> Result<(), FacilitatorError> {
        self.sets
            .lock()
            .unwrap()
            .entry(set.to_string())
            .or_default()
            .insert(member.to_string());
        Ok(())
    }

    fn srem(&self, set: &str, member: &str) -> Result<(), FacilitatorError> {
        if let Some(members) = self.sets.lock().unwrap().get_mut(set) {
            members.remove(member);
        }
        Ok(())
    }

    fn smembers(&self, set: &str) -> Result<Vec<String>, FacilitatorError> {
        Ok(self
            .sets
            .lock()
            .unwrap()
            .get(set)
            .map(|m| m.iter().cloned().collect())
            .unwrap_or_default())
    }

    fn try_lock(
        &self,
        resource: &str,
        token: &str,
        ttl_secs: u64,
    ) -> Result<bool, FacilitatorError> {
        let ttl = ttl_secs.min(MAX_LOCK_TTL_SECS);
        let mut locks = self.locks.lock().unwrap();
        if let Some((_, acquired, held_ttl)) = locks.get(resource) {
            if acquired.elapsed().as_secs() < *held_ttl {
                return Ok(false);
            }
        }
        locks.insert(resource.to_string(), (token.to_string(), Instant::now(), ttl));
        Ok(true)
    }

    fn unlock(&self, resource: &str, token: &str) -> Result<bool, FacilitatorError> {
        let mut locks = self.locks.lock().unwrap();
        match locks.get(resource) {
            Some((held, _, _)) if held == token => {
                locks.remove(resource);
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}
