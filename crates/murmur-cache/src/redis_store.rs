use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use redis::{Cmd, Connection, FromRedisValue, RedisError, RedisResult};
use tracing::{error, info, warn};

use crate::transaction::{Command, Reply, Transaction};
use crate::{CacheError, CacheResult, CacheStore, Direction, MAX_SCORE, MIN_SCORE};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(2);
const IO_TIMEOUT: Duration = Duration::from_secs(2);

/// Redis-backed [`CacheStore`].
///
/// Holds a fixed number of connection slots, handed out round-robin and locked
/// for the duration of one command (same pattern as the database reader pool).
/// Slots connect lazily; a slot whose connection broke is emptied and
/// reconnects on its next checkout.
pub struct RedisStore {
    client: redis::Client,
    slots: Vec<Mutex<Option<Connection>>>,
    next_slot: AtomicUsize,
}

impl RedisStore {
    /// Build the pool and verify the server answers `PING`.
    pub fn open(url: &str, pool_size: usize) -> CacheResult<Self> {
        let client = redis::Client::open(url).map_err(|e| classify("", e))?;
        let slots = (0..pool_size.max(1)).map(|_| Mutex::new(None)).collect();
        let store = Self {
            client,
            slots,
            next_slot: AtomicUsize::new(0),
        };

        store.with_conn("", |conn| redis::cmd("PING").query::<String>(conn))?;
        info!("Redis cache connected at {} ({} connections)", url, store.slots.len());
        Ok(store)
    }

    /// Check out one connection for the duration of `f`.
    fn with_conn<T, F>(&self, key: &str, f: F) -> CacheResult<T>
    where
        F: FnOnce(&mut Connection) -> RedisResult<T>,
    {
        let idx = self.next_slot.fetch_add(1, Ordering::Relaxed) % self.slots.len();
        let mut slot = self.slots[idx]
            .lock()
            .map_err(|e| CacheError::Unavailable(format!("connection slot poisoned: {}", e)))?;

        if slot.is_none() {
            let conn = self
                .client
                .get_connection_with_timeout(CONNECT_TIMEOUT)
                .map_err(|e| classify(key, e))?;
            conn.set_read_timeout(Some(IO_TIMEOUT)).map_err(|e| classify(key, e))?;
            conn.set_write_timeout(Some(IO_TIMEOUT)).map_err(|e| classify(key, e))?;
            *slot = Some(conn);
        }
        let conn = slot
            .as_mut()
            .ok_or_else(|| CacheError::Unavailable("connection slot empty".into()))?;

        match f(conn) {
            Ok(v) => Ok(v),
            Err(e) => {
                let err = classify(key, e);
                if err.is_unavailable() {
                    warn!(slot = idx, "dropping broken Redis connection: {}", err);
                    *slot = None;
                }
                Err(err)
            }
        }
    }

    fn query<T: FromRedisValue>(&self, key: &str, cmd: Cmd) -> CacheResult<T> {
        self.with_conn(key, |conn| cmd.query::<T>(conn))
    }
}

/// Map a Redis error onto the cache error taxonomy.
fn classify(key: &str, err: RedisError) -> CacheError {
    if err.code() == Some("WRONGTYPE") || err.to_string().contains("WRONGTYPE") {
        error!(key, "WRONGTYPE operation against cache key: {}", err);
        return CacheError::ShapeMismatch { key: key.to_string() };
    }
    if err.is_io_error() || err.is_connection_dropped() || err.is_connection_refusal() || err.is_timeout() {
        return CacheError::Unavailable(err.to_string());
    }
    CacheError::Protocol(err.to_string())
}

fn score_arg(score: i64) -> String {
    match score {
        MIN_SCORE => "-inf".to_string(),
        MAX_SCORE => "+inf".to_string(),
        n => n.to_string(),
    }
}

fn limit_args(cmd: &mut Cmd, limit: Option<usize>, offset: usize) {
    match (limit, offset) {
        (None, 0) => {}
        (None, offset) => {
            cmd.arg("LIMIT").arg(offset).arg(-1);
        }
        (Some(count), offset) => {
            cmd.arg("LIMIT").arg(offset).arg(count);
        }
    }
}

impl CacheStore for RedisStore {
    fn exists(&self, key: &str) -> CacheResult<bool> {
        self.query(key, redis::cmd("EXISTS").arg(key).clone())
    }

    fn delete(&self, key: &str) -> CacheResult<bool> {
        self.query::<i64>(key, redis::cmd("DEL").arg(key).clone()).map(|n| n > 0)
    }

    fn flush_all(&self) -> CacheResult<()> {
        self.query("", redis::cmd("FLUSHDB").clone())
    }

    fn get(&self, key: &str) -> CacheResult<Option<Vec<u8>>> {
        self.query(key, redis::cmd("GET").arg(key).clone())
    }

    fn set(&self, key: &str, value: &[u8]) -> CacheResult<()> {
        self.query(key, redis::cmd("SET").arg(key).arg(value).clone())
    }

    fn set_if_absent(&self, key: &str, value: &[u8]) -> CacheResult<bool> {
        self.query(key, redis::cmd("SETNX").arg(key).arg(value).clone())
    }

    fn increment(&self, key: &str) -> CacheResult<i64> {
        self.query(key, redis::cmd("INCR").arg(key).clone())
    }

    fn decrement(&self, key: &str) -> CacheResult<i64> {
        self.query(key, redis::cmd("DECR").arg(key).clone())
    }

    fn push_back(&self, key: &str, value: &[u8]) -> CacheResult<i64> {
        self.query(key, redis::cmd("RPUSH").arg(key).arg(value).clone())
    }

    fn push_front(&self, key: &str, value: &[u8]) -> CacheResult<i64> {
        self.query(key, redis::cmd("LPUSH").arg(key).arg(value).clone())
    }

    fn list_range(&self, key: &str, start: i64, end: i64) -> CacheResult<Vec<Vec<u8>>> {
        self.query(key, redis::cmd("LRANGE").arg(key).arg(start).arg(end).clone())
    }

    fn list_len(&self, key: &str) -> CacheResult<i64> {
        self.query(key, redis::cmd("LLEN").arg(key).clone())
    }

    fn remove_from_list(&self, key: &str, value: &[u8]) -> CacheResult<bool> {
        self.query::<i64>(key, redis::cmd("LREM").arg(key).arg(1).arg(value).clone())
            .map(|n| n > 0)
    }

    fn set_field(&self, key: &str, field: &str, value: &[u8]) -> CacheResult<bool> {
        self.query::<i64>(key, redis::cmd("HSET").arg(key).arg(field).arg(value).clone())
            .map(|n| n > 0)
    }

    fn get_field(&self, key: &str, field: &str) -> CacheResult<Option<Vec<u8>>> {
        self.query(key, redis::cmd("HGET").arg(key).arg(field).clone())
    }

    fn get_fields(&self, key: &str, fields: &[&str]) -> CacheResult<Vec<Vec<u8>>> {
        // HMGET rejects an empty field list
        if fields.is_empty() {
            return Ok(Vec::new());
        }
        let values: Vec<Option<Vec<u8>>> =
            self.query(key, redis::cmd("HMGET").arg(key).arg(fields).clone())?;
        Ok(values.into_iter().flatten().collect())
    }

    fn all_values(&self, key: &str) -> CacheResult<Vec<Vec<u8>>> {
        self.query(key, redis::cmd("HVALS").arg(key).clone())
    }

    fn field_count(&self, key: &str) -> CacheResult<i64> {
        self.query(key, redis::cmd("HLEN").arg(key).clone())
    }

    fn field_keys(&self, key: &str) -> CacheResult<Vec<String>> {
        self.query(key, redis::cmd("HKEYS").arg(key).clone())
    }

    fn delete_field(&self, key: &str, field: &str) -> CacheResult<bool> {
        self.query::<i64>(key, redis::cmd("HDEL").arg(key).arg(field).clone())
            .map(|n| n > 0)
    }

    fn add_member(&self, key: &str, member: &[u8]) -> CacheResult<bool> {
        self.query::<i64>(key, redis::cmd("SADD").arg(key).arg(member).clone())
            .map(|n| n > 0)
    }

    fn members(&self, key: &str) -> CacheResult<Vec<Vec<u8>>> {
        self.query(key, redis::cmd("SMEMBERS").arg(key).clone())
    }

    fn remove_member(&self, key: &str, member: &[u8]) -> CacheResult<bool> {
        self.query::<i64>(key, redis::cmd("SREM").arg(key).arg(member).clone())
            .map(|n| n > 0)
    }

    fn member_count(&self, key: &str) -> CacheResult<i64> {
        self.query(key, redis::cmd("SCARD").arg(key).clone())
    }

    fn add_with_score(&self, key: &str, score: i64, member: &[u8]) -> CacheResult<bool> {
        self.query::<i64>(key, redis::cmd("ZADD").arg(key).arg(score).arg(member).clone())
            .map(|n| n > 0)
    }

    fn raise_score(&self, key: &str, score: i64, member: &[u8]) -> CacheResult<bool> {
        self.query::<i64>(
            key,
            redis::cmd("ZADD").arg(key).arg("GT").arg("CH").arg(score).arg(member).clone(),
        )
        .map(|n| n > 0)
    }

    fn score(&self, key: &str, member: &[u8]) -> CacheResult<Option<i64>> {
        let score: Option<f64> = self.query(key, redis::cmd("ZSCORE").arg(key).arg(member).clone())?;
        Ok(score.map(|s| s as i64))
    }

    fn range_by_score(
        &self,
        key: &str,
        min: i64,
        max: i64,
        limit: Option<usize>,
        offset: usize,
        direction: Direction,
    ) -> CacheResult<Vec<Vec<u8>>> {
        let mut cmd = match direction {
            Direction::Forward => {
                let mut c = redis::cmd("ZRANGEBYSCORE");
                c.arg(key).arg(score_arg(min)).arg(score_arg(max));
                c
            }
            Direction::Reverse => {
                let mut c = redis::cmd("ZREVRANGEBYSCORE");
                c.arg(key).arg(score_arg(max)).arg(score_arg(min));
                c
            }
        };
        limit_args(&mut cmd, limit, offset);
        self.query(key, cmd)
    }

    fn range_by_rank(
        &self,
        key: &str,
        start: i64,
        end: i64,
        direction: Direction,
    ) -> CacheResult<Vec<Vec<u8>>> {
        let name = match direction {
            Direction::Forward => "ZRANGE",
            Direction::Reverse => "ZREVRANGE",
        };
        self.query(key, redis::cmd(name).arg(key).arg(start).arg(end).clone())
    }

    fn count_by_score(&self, key: &str, min: i64, max: i64) -> CacheResult<i64> {
        self.query(
            key,
            redis::cmd("ZCOUNT").arg(key).arg(score_arg(min)).arg(score_arg(max)).clone(),
        )
    }

    fn cardinality(&self, key: &str) -> CacheResult<i64> {
        self.query(key, redis::cmd("ZCARD").arg(key).clone())
    }

    fn remove_matching(&self, key: &str, member: &[u8]) -> CacheResult<bool> {
        self.query::<i64>(key, redis::cmd("ZREM").arg(key).arg(member).clone())
            .map(|n| n > 0)
    }

    fn commit(&self, tx: Transaction) -> CacheResult<Vec<Reply>> {
        if tx.is_empty() {
            return Ok(Vec::new());
        }
        let first_key = tx.commands()[0].key().to_string();

        let mut pipe = redis::pipe();
        pipe.atomic();
        for cmd in tx.commands() {
            match cmd {
                Command::Set { key, value } => pipe.cmd("SET").arg(key).arg(value),
                Command::Delete { key } => pipe.cmd("DEL").arg(key),
                Command::Increment { key } => pipe.cmd("INCR").arg(key),
                Command::AddWithScore { key, score, member } => {
                    pipe.cmd("ZADD").arg(key).arg(*score).arg(member)
                }
                Command::RaiseScore { key, score, member } => {
                    pipe.cmd("ZADD").arg(key).arg("GT").arg("CH").arg(*score).arg(member)
                }
                Command::SetField { key, field, value } => pipe.cmd("HSET").arg(key).arg(field).arg(value),
                Command::AddMember { key, member } => pipe.cmd("SADD").arg(key).arg(member),
                Command::Cardinality { key } => pipe.cmd("ZCARD").arg(key),
            };
        }

        let values: Vec<redis::Value> = self.with_conn(&first_key, |conn| pipe.query(conn))?;
        if values.len() != tx.len() {
            return Err(CacheError::Protocol(format!(
                "transaction returned {} replies for {} commands",
                values.len(),
                tx.len()
            )));
        }

        tx.commands()
            .iter()
            .zip(values.iter())
            .map(|(cmd, value)| match cmd {
                Command::Set { key, .. } => redis::from_redis_value::<()>(value)
                    .map(|_| Reply::Done)
                    .map_err(|e| classify(key, e)),
                other => redis::from_redis_value::<i64>(value)
                    .map(Reply::Integer)
                    .map_err(|e| classify(other.key(), e)),
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn infinite_bounds_are_spelled_out() {
        assert_eq!(score_arg(MIN_SCORE), "-inf");
        assert_eq!(score_arg(MAX_SCORE), "+inf");
        assert_eq!(score_arg(42), "42");
    }

    #[test]
    fn limit_is_only_sent_when_paging() {
        let mut plain = Cmd::new();
        limit_args(&mut plain, None, 0);
        assert_eq!(plain.args_iter().count(), 0);

        let mut skip_only = Cmd::new();
        limit_args(&mut skip_only, None, 3);
        assert_eq!(skip_only.args_iter().count(), 3);

        let mut page = Cmd::new();
        limit_args(&mut page, Some(10), 20);
        assert_eq!(page.args_iter().count(), 3);
    }

    #[test]
    fn unreachable_server_is_unavailable() {
        // Port 1 on localhost is never a Redis server
        match RedisStore::open("redis://127.0.0.1:1/", 1) {
            Err(err) => assert!(err.is_unavailable(), "unexpected error: {}", err),
            Ok(_) => panic!("connected to a server that should not exist"),
        }
    }
}
