//! Per-channel message counts.
//!
//! The counter is a cached mirror of the message log's cardinality. A missing
//! or corrupt counter is recomputed from the log, or from the database when the
//! log itself is empty, and written back. A counter that may have drifted is
//! deleted rather than patched; the next read recomputes it.

use std::sync::Arc;

use murmur_cache::{CacheError, Reply, Transaction};
use murmur_types::ChannelId;
use tracing::{debug, warn};

use crate::Context;
use crate::codec::{decode_int, encode_int};
use crate::error::{SyncError, SyncResult};
use crate::repair::RepairJob;

pub struct CountCache {
    ctx: Arc<Context>,
}

impl CountCache {
    pub(crate) fn new(ctx: Arc<Context>) -> Self {
        Self { ctx }
    }

    /// Bump the counter for a message that was just added to the log.
    pub fn increment(&self, channel: ChannelId) -> SyncResult<i64> {
        let mut tx = Transaction::new();
        tx.increment(self.ctx.keys.count(channel))
            .cardinality(self.ctx.keys.messages(channel));
        let replies = self.ctx.store.commit(tx)?;
        let value = reply_int(&replies, 0);
        self.check(channel, value, reply_int(&replies, 1))?;
        Ok(value)
    }

    /// Compare a counter value with the log size read in the same transaction.
    /// A mismatch means the counter was missing or had drifted, so it is
    /// dropped and the next read recomputes it.
    pub(crate) fn check(&self, channel: ChannelId, value: i64, cardinality: i64) -> SyncResult<()> {
        if value != cardinality {
            debug!(channel = %channel, value, cardinality, "count out of step with log, dropping it");
            self.ctx.store.delete(&self.ctx.keys.count(channel))?;
        }
        Ok(())
    }

    pub fn get(&self, channel: ChannelId) -> SyncResult<i64> {
        if self.ctx.repairs.is_pending(RepairJob::Channel(channel)) {
            // the log and counter may be partial until the rebuild runs
            return Ok(self.ctx.db.count_messages(channel)?);
        }
        let key = self.ctx.keys.count(channel);
        let cached = self
            .ctx
            .store
            .get(&key)
            .map_err(SyncError::from)
            .and_then(|raw| raw.map(|raw| decode_int("count", &raw)).transpose());

        match cached {
            Ok(Some(count)) => Ok(count),
            Ok(None) => self.recount(channel),
            Err(e @ SyncError::Corrupt { .. }) => {
                warn!(channel = %channel, "dropping cached count: {}", e);
                if let Err(e) = self.ctx.store.delete(&key) {
                    warn!(channel = %channel, "could not drop corrupt count: {}", e);
                }
                self.recount(channel)
            }
            Err(SyncError::Cache(e)) => self.source_count(channel, e),
            Err(e) => Err(e),
        }
    }

    /// Drop the counter so the next read recomputes it.
    pub fn invalidate(&self, channel: ChannelId) -> SyncResult<()> {
        self.ctx.store.delete(&self.ctx.keys.count(channel))?;
        Ok(())
    }

    fn recount(&self, channel: ChannelId) -> SyncResult<i64> {
        let log_key = self.ctx.keys.messages(channel);
        let cardinality = match self.ctx.store.cardinality(&log_key) {
            Ok(n) => n,
            Err(e) => return self.source_count(channel, e),
        };
        if cardinality > 0 {
            self.write_back(channel, cardinality, true)?;
            return Ok(cardinality);
        }

        let count = self.ctx.db.count_messages(channel)?;
        if count > 0 {
            // the log is empty but the channel is not
            self.ctx.repairs.schedule(RepairJob::Channel(channel));
        }
        self.write_back(channel, count, count == 0)?;
        Ok(count)
    }

    /// Store a recomputed count. With `verify` the log is re-read afterwards and
    /// the counter dropped again if an append slipped in between.
    fn write_back(&self, channel: ChannelId, count: i64, verify: bool) -> SyncResult<()> {
        let key = self.ctx.keys.count(channel);
        let result = (|| -> Result<(), CacheError> {
            self.ctx.store.set(&key, &encode_int(count))?;
            if verify && self.ctx.store.cardinality(&self.ctx.keys.messages(channel))? != count {
                debug!(channel = %channel, "log moved during recount, dropping count");
                self.ctx.store.delete(&key)?;
            }
            Ok(())
        })();
        match result {
            Err(e) if e.is_fatal() => Err(e.into()),
            Err(e) => {
                warn!(channel = %channel, "could not store recomputed count: {}", e);
                Ok(())
            }
            Ok(()) => Ok(()),
        }
    }

    fn source_count(&self, channel: ChannelId, cause: CacheError) -> SyncResult<i64> {
        if cause.is_fatal() {
            return Err(cause.into());
        }
        warn!(channel = %channel, "count cache unavailable, counting in database: {}", cause);
        Ok(self.ctx.db.count_messages(channel)?)
    }
}

pub(crate) fn reply_int(replies: &[Reply], index: usize) -> i64 {
    replies.get(index).and_then(|r| r.as_integer()).unwrap_or(0)
}
