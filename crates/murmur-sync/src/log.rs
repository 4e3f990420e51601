//! Per-channel message log.
//!
//! Each channel's messages live in one ordered set scored by message id, so
//! "everything after id N" is a single score-range read. Appends are written
//! to the database first; the cache write that follows is best effort and
//! falls back to a background rebuild when it fails.

use std::sync::Arc;

use chrono::{DateTime, SubsecRound, Utc};
use murmur_cache::{Direction, MAX_SCORE, MIN_SCORE, Transaction};
use murmur_db::models::MessageRow;
use murmur_types::{Author, ChannelId, Message, MessageId, Order, UserId};
use tracing::{debug, error, info, warn};

use crate::Context;
use crate::authors::AuthorCache;
use crate::codec::{CacheRecord, channel_member, encode_int};
use crate::counts::{CountCache, reply_int};
use crate::error::{SyncError, SyncResult};
use crate::repair::RepairJob;
use crate::sequence::IdAllocator;

/// Attempts at finding a free id before giving up on an append.
const MAX_ALLOCATION_ATTEMPTS: usize = 5;
/// Snapshot passes a rebuild makes while appends keep racing it.
const MAX_REBUILD_PASSES: usize = 3;

pub struct MessageLog {
    ctx: Arc<Context>,
    allocator: IdAllocator,
    counts: CountCache,
    authors: AuthorCache,
}

impl MessageLog {
    pub(crate) fn new(ctx: Arc<Context>) -> Self {
        Self {
            allocator: IdAllocator::new(ctx.clone()),
            counts: CountCache::new(ctx.clone()),
            authors: AuthorCache::new(ctx.clone()),
            ctx,
        }
    }

    pub fn allocator(&self) -> &IdAllocator {
        &self.allocator
    }

    pub fn counts(&self) -> &CountCache {
        &self.counts
    }

    pub fn authors(&self) -> &AuthorCache {
        &self.authors
    }

    /// Store a new message and return it with its assigned id.
    ///
    /// Succeeds once the database has the row. Cache trouble after that point
    /// is logged and repaired in the background.
    pub fn append(&self, channel: ChannelId, user: UserId, content: &str) -> SyncResult<Message> {
        let author = self.authors.get(user)?;
        let created_at = Utc::now().trunc_subsecs(6);

        let message = match self.insert_allocated(channel, &author, content, &created_at) {
            Ok(id) => Message {
                id,
                channel_id: channel,
                author,
                content: content.to_string(),
                created_at,
            },
            Err(e) if e.is_recoverable() => {
                warn!(channel = %channel, "id allocator unavailable, allocating in database: {}", e);
                let id = self.ctx.db.insert_message_next(channel, user, content, &created_at)?;
                self.ctx.repairs.schedule(RepairJob::Channel(channel));
                return Ok(Message {
                    id,
                    channel_id: channel,
                    author,
                    content: content.to_string(),
                    created_at,
                });
            }
            Err(e) => return Err(e),
        };

        match self.publish(&message) {
            Ok(()) => {}
            Err(e) if e.is_fatal() => return Err(e),
            Err(e) => {
                warn!(channel = %channel, id = %message.id, "message stored but not cached: {}", e);
                self.ctx.repairs.schedule(RepairJob::Channel(channel));
            }
        }
        debug!(channel = %channel, id = %message.id, "appended message");
        Ok(message)
    }

    fn insert_allocated(
        &self,
        channel: ChannelId,
        author: &Author,
        content: &str,
        created_at: &DateTime<Utc>,
    ) -> SyncResult<MessageId> {
        for attempt in 1..=MAX_ALLOCATION_ATTEMPTS {
            let allocation = self.allocator.next_id(channel)?;
            if allocation.reseeded {
                self.ctx.repairs.schedule(RepairJob::Channel(channel));
            }
            if self
                .ctx
                .db
                .insert_message(channel, allocation.id, author.id, content, created_at)?
            {
                return Ok(allocation.id);
            }
            warn!(channel = %channel, id = %allocation.id, attempt, "allocated id already taken");
            self.allocator.reseed(channel)?;
            self.ctx.repairs.schedule(RepairJob::Channel(channel));
        }
        error!(channel = %channel, "gave up allocating a message id");
        Err(SyncError::Allocation(channel))
    }

    /// Add a stored message to the cached log and bump the count, atomically.
    fn publish(&self, message: &Message) -> SyncResult<()> {
        let channel = message.channel_id;
        let mut tx = Transaction::new();
        tx.add_with_score(self.ctx.keys.messages(channel), message.id.get(), message.encode()?)
            .increment(self.ctx.keys.count(channel))
            .cardinality(self.ctx.keys.messages(channel));
        let replies = self.ctx.store.commit(tx)?;
        let cardinality = reply_int(&replies, 2);
        if cardinality == 1 && message.id != MessageId(1) {
            // The log was absent before this message went in. Reads skip it
            // until the rebuild has filled in the older messages.
            debug!(channel = %channel, id = %message.id, "message log was missing, queueing rebuild");
            self.ctx.repairs.schedule(RepairJob::Channel(channel));
        }
        self.counts.check(channel, reply_int(&replies, 1), cardinality)
    }

    /// Messages with id strictly greater than `after` (all of them when `after`
    /// is zero), paginated, in the requested order.
    pub fn range(
        &self,
        channel: ChannelId,
        after: MessageId,
        limit: Option<usize>,
        offset: usize,
        order: Order,
    ) -> SyncResult<Vec<Message>> {
        let limit = self.ctx.config.clamp_limit(limit);
        if limit == 0 {
            return Ok(Vec::new());
        }
        if self.awaiting_rebuild(channel) {
            return self.source_range(channel, after, limit, offset, order);
        }
        match self.cached_range(channel, after, limit, offset, order) {
            Ok(Some(messages)) => Ok(messages),
            Ok(None) => self.source_range(channel, after, limit, offset, order),
            Err(e) if e.is_fatal() => Err(e),
            Err(e @ SyncError::Corrupt { .. }) => {
                warn!(channel = %channel, "corrupt message in cache, reading database: {}", e);
                self.ctx.repairs.schedule(RepairJob::Channel(channel));
                self.source_range(channel, after, limit, offset, order)
            }
            Err(e) if e.is_recoverable() => {
                warn!(channel = %channel, "message cache unavailable, reading database: {}", e);
                self.source_range(channel, after, limit, offset, order)
            }
            Err(e) => Err(e),
        }
    }

    /// `None` means the channel's log is not in the cache at all.
    fn cached_range(
        &self,
        channel: ChannelId,
        after: MessageId,
        limit: usize,
        offset: usize,
        order: Order,
    ) -> SyncResult<Option<Vec<Message>>> {
        let key = self.ctx.keys.messages(channel);
        let min = if after.is_zero() { MIN_SCORE } else { after.get().saturating_add(1) };
        let direction = if order.is_descending() { Direction::Reverse } else { Direction::Forward };

        let raw = self
            .ctx
            .store
            .range_by_score(&key, min, MAX_SCORE, Some(limit), offset, direction)?;
        if raw.is_empty() && !self.ctx.store.exists(&key)? {
            return Ok(None);
        }
        self.decode_all(channel, raw).map(Some)
    }

    fn decode_all(&self, channel: ChannelId, raw: Vec<Vec<u8>>) -> SyncResult<Vec<Message>> {
        let mut messages = raw
            .iter()
            .map(|r| Message::decode(r))
            .collect::<SyncResult<Vec<_>>>()?;
        let before = messages.len();
        messages.dedup_by_key(|m| m.id);
        if messages.len() != before {
            warn!(channel = %channel, "message log holds duplicate ids");
            self.ctx.repairs.schedule(RepairJob::Channel(channel));
        }
        Ok(messages)
    }

    fn source_range(
        &self,
        channel: ChannelId,
        after: MessageId,
        limit: usize,
        offset: usize,
        order: Order,
    ) -> SyncResult<Vec<Message>> {
        let rows = self
            .ctx
            .db
            .get_messages(channel, after, Some(limit as i64), offset as i64, order)?;
        if !rows.is_empty() && !self.ctx.store.exists(&self.ctx.keys.messages(channel)).unwrap_or(true) {
            self.ctx.repairs.schedule(RepairJob::Channel(channel));
        }
        into_messages(rows)
    }

    /// The newest `n` messages, returned in `order`.
    pub fn latest(&self, channel: ChannelId, n: usize, order: Order) -> SyncResult<Vec<Message>> {
        let n = self.ctx.config.clamp_limit(Some(n));
        if n == 0 {
            return Ok(Vec::new());
        }
        let key = self.ctx.keys.messages(channel);
        let cached = if self.awaiting_rebuild(channel) {
            Ok(None)
        } else {
            self.ctx
                .store
                .range_by_rank(&key, 0, n as i64 - 1, Direction::Reverse)
                .map_err(SyncError::from)
                .and_then(|raw| {
                    if raw.is_empty() && !self.ctx.store.exists(&key)? {
                        return Ok(None);
                    }
                    self.decode_all(channel, raw).map(Some)
                })
        };

        let mut newest_first = match cached {
            Ok(Some(messages)) => messages,
            Ok(None) => self.source_latest(channel, n)?,
            Err(e) if !e.is_recoverable() => return Err(e),
            Err(e) => {
                warn!(channel = %channel, "reading latest messages from database: {}", e);
                if matches!(e, SyncError::Corrupt { .. }) {
                    self.ctx.repairs.schedule(RepairJob::Channel(channel));
                }
                self.source_latest(channel, n)?
            }
        };
        if !order.is_descending() {
            newest_first.reverse();
        }
        Ok(newest_first)
    }

    fn source_latest(&self, channel: ChannelId, n: usize) -> SyncResult<Vec<Message>> {
        let rows = self
            .ctx
            .db
            .get_messages(channel, MessageId::ZERO, Some(n as i64), 0, Order::Descending)?;
        into_messages(rows)
    }

    pub fn count(&self, channel: ChannelId) -> SyncResult<i64> {
        self.counts.get(channel)
    }

    /// Number of messages with id greater than `after`.
    pub fn count_after(&self, channel: ChannelId, after: MessageId) -> SyncResult<i64> {
        if after.is_zero() {
            return self.count(channel);
        }
        if self.awaiting_rebuild(channel) {
            return Ok(self.ctx.db.count_messages_after(channel, after)?);
        }
        let key = self.ctx.keys.messages(channel);
        let cached = self
            .ctx
            .store
            .count_by_score(&key, after.get().saturating_add(1), MAX_SCORE)
            .and_then(|n| if n == 0 && !self.ctx.store.exists(&key)? { Ok(None) } else { Ok(Some(n)) });
        match cached {
            Ok(Some(n)) => Ok(n),
            Ok(None) => Ok(self.ctx.db.count_messages_after(channel, after)?),
            Err(e) if e.is_fatal() => Err(e.into()),
            Err(e) => {
                warn!(channel = %channel, "counting unread in database: {}", e);
                Ok(self.ctx.db.count_messages_after(channel, after)?)
            }
        }
    }

    /// Replace the channel's cached log, count and allocator floor with what
    /// the database holds. Returns the number of messages loaded.
    pub fn rebuild(&self, channel: ChannelId) -> SyncResult<usize> {
        let log_key = self.ctx.keys.messages(channel);
        let count_key = self.ctx.keys.count(channel);
        let mut loaded = 0;

        for pass in 1..=MAX_REBUILD_PASSES {
            let messages = into_messages(self.ctx.db.get_all_messages(channel)?)?;
            let max = messages.last().map_or(MessageId::ZERO, |m| m.id);

            let mut tx = Transaction::new();
            tx.delete(log_key.clone()).delete(count_key.clone());
            for message in &messages {
                tx.add_with_score(log_key.clone(), message.id.get(), message.encode()?);
            }
            tx.set(count_key.clone(), encode_int(messages.len() as i64));
            self.ctx.store.commit(tx)?;
            self.allocator.seed(channel, max)?;
            loaded = messages.len();

            // Appends that landed between the snapshot and the commit were
            // wiped by the delete; their rows are past `max` in the database.
            let cached_tail = self.ctx.store.count_by_score(&log_key, max.get().saturating_add(1), MAX_SCORE)?;
            let stored_tail = self.ctx.db.count_messages_after(channel, max)?;
            if cached_tail == stored_tail {
                self.register(channel)?;
                info!(channel = %channel, messages = loaded, "rebuilt message log");
                return Ok(loaded);
            }
            debug!(channel = %channel, pass, cached_tail, stored_tail, "appends raced the rebuild, retrying");
        }

        warn!(channel = %channel, "message log still settling after rebuild");
        self.register(channel)?;
        Ok(loaded)
    }

    /// A channel with a rebuild still queued may hold a partial log.
    fn awaiting_rebuild(&self, channel: ChannelId) -> bool {
        self.ctx.repairs.is_pending(RepairJob::Channel(channel))
    }

    /// Add the channel to the channel set, unless the set is absent: a partial
    /// set would hide the channels nobody has rebuilt yet.
    pub(crate) fn register(&self, channel: ChannelId) -> SyncResult<()> {
        let key = self.ctx.keys.channels();
        if self.ctx.store.exists(&key)? {
            self.ctx.store.add_member(&key, &channel_member(channel))?;
        }
        Ok(())
    }
}

fn into_messages(rows: Vec<MessageRow>) -> SyncResult<Vec<Message>> {
    rows.into_iter()
        .map(|row| row.into_message().map_err(SyncError::from))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::Fixture;
    use murmur_cache::CacheStore;

    fn ids(messages: &[Message]) -> Vec<i64> {
        messages.iter().map(|m| m.id.get()).collect()
    }

    #[test]
    fn appends_get_consecutive_ids_and_land_in_both_stores() {
        let fx = Fixture::new();
        let (ch, user) = fx.seed();
        let log = MessageLog::new(fx.ctx.clone());

        for i in 1..=3 {
            let message = log.append(ch, user, &format!("m{}", i)).unwrap();
            assert_eq!(message.id, MessageId(i));
            assert_eq!(message.author.display_name, "Alice");
        }

        assert_eq!(fx.db.count_messages(ch).unwrap(), 3);
        assert_eq!(fx.store.cardinality(&fx.ctx.keys.messages(ch)).unwrap(), 3);
        assert_eq!(log.count(ch).unwrap(), 3);
        // the very first append had to seed the allocator
        assert_eq!(fx.take_repairs(), vec![RepairJob::Channel(ch)]);
    }

    #[test]
    fn range_bounds_are_exclusive_and_paginated() {
        let fx = Fixture::new();
        let (ch, user) = fx.seed();
        let log = MessageLog::new(fx.ctx.clone());
        for i in 1..=5 {
            log.append(ch, user, &format!("m{}", i)).unwrap();
        }

        assert_eq!(ids(&log.range(ch, MessageId::ZERO, None, 0, Order::Ascending).unwrap()), vec![1, 2, 3, 4, 5]);
        assert_eq!(ids(&log.range(ch, MessageId(3), None, 0, Order::Ascending).unwrap()), vec![4, 5]);
        assert_eq!(ids(&log.range(ch, MessageId::ZERO, Some(2), 1, Order::Descending).unwrap()), vec![4, 3]);
        assert!(log.range(ch, MessageId(5), None, 0, Order::Ascending).unwrap().is_empty());
        assert_eq!(ids(&log.latest(ch, 2, Order::Ascending).unwrap()), vec![4, 5]);
        assert_eq!(ids(&log.latest(ch, 2, Order::Descending).unwrap()), vec![5, 4]);
        assert_eq!(log.count_after(ch, MessageId(2)).unwrap(), 3);
    }

    #[test]
    fn empty_channel_reads_empty() {
        let fx = Fixture::new();
        let (ch, _) = fx.seed();
        let log = MessageLog::new(fx.ctx.clone());

        assert!(log.range(ch, MessageId::ZERO, None, 0, Order::Ascending).unwrap().is_empty());
        assert!(log.latest(ch, 10, Order::Descending).unwrap().is_empty());
        assert_eq!(log.count(ch).unwrap(), 0);
        assert!(fx.take_repairs().is_empty());
    }

    #[test]
    fn cold_log_is_served_from_the_database_and_queued_for_rebuild() {
        let fx = Fixture::new();
        let (ch, user) = fx.seed();
        fx.insert(ch, 1, user, "one");
        fx.insert(ch, 2, user, "two");
        let log = MessageLog::new(fx.ctx.clone());

        assert_eq!(ids(&log.range(ch, MessageId::ZERO, None, 0, Order::Ascending).unwrap()), vec![1, 2]);
        assert_eq!(fx.take_repairs(), vec![RepairJob::Channel(ch)]);
    }

    #[test]
    fn corrupt_member_triggers_rebuild_and_database_answer() {
        let fx = Fixture::new();
        let (ch, user) = fx.seed();
        let log = MessageLog::new(fx.ctx.clone());
        log.append(ch, user, "fine").unwrap();
        fx.take_repairs();

        fx.store.add_with_score(&fx.ctx.keys.messages(ch), 2, b"not json").unwrap();
        fx.insert(ch, 2, user, "also fine");

        let messages = log.range(ch, MessageId::ZERO, None, 0, Order::Ascending).unwrap();
        assert_eq!(ids(&messages), vec![1, 2]);
        assert_eq!(messages[1].content, "also fine");
        assert_eq!(fx.take_repairs(), vec![RepairJob::Channel(ch)]);

        log.rebuild(ch).unwrap();
        let cached = log.range(ch, MessageId::ZERO, None, 0, Order::Ascending).unwrap();
        assert_eq!(cached, messages);
        assert!(fx.take_repairs().is_empty());
    }

    #[test]
    fn rebuild_after_flush_restores_identical_state() {
        let fx = Fixture::new();
        let (ch, user) = fx.seed();
        let log = MessageLog::new(fx.ctx.clone());
        for i in 1..=4 {
            log.append(ch, user, &format!("m{}", i)).unwrap();
        }
        let before = log.range(ch, MessageId::ZERO, None, 0, Order::Ascending).unwrap();

        fx.store.flush_all().unwrap();
        assert_eq!(log.rebuild(ch).unwrap(), 4);

        assert_eq!(log.range(ch, MessageId::ZERO, None, 0, Order::Ascending).unwrap(), before);
        assert_eq!(log.count(ch).unwrap(), 4);
        assert_eq!(log.allocator().current(ch).unwrap(), Some(MessageId(4)));
        assert_eq!(log.append(ch, user, "m5").unwrap().id, MessageId(5));
    }

    #[test]
    fn evicted_log_is_not_served_partially_after_an_append() {
        let fx = Fixture::new();
        let (ch, user) = fx.seed();
        let log = MessageLog::new(fx.ctx.clone());
        for i in 1..=3 {
            log.append(ch, user, &format!("m{}", i)).unwrap();
        }
        fx.take_repairs();

        fx.store.delete(&fx.ctx.keys.messages(ch)).unwrap();
        assert_eq!(log.append(ch, user, "m4").unwrap().id, MessageId(4));
        assert_eq!(fx.store.cardinality(&fx.ctx.keys.messages(ch)).unwrap(), 1);

        assert_eq!(ids(&log.range(ch, MessageId::ZERO, None, 0, Order::Ascending).unwrap()), vec![1, 2, 3, 4]);
        assert_eq!(ids(&log.latest(ch, 2, Order::Descending).unwrap()), vec![4, 3]);
        assert_eq!(log.count_after(ch, MessageId(1)).unwrap(), 3);
        assert_eq!(fx.take_repairs(), vec![RepairJob::Channel(ch)]);

        log.rebuild(ch).unwrap();
        assert_eq!(fx.store.cardinality(&fx.ctx.keys.messages(ch)).unwrap(), 4);
        assert_eq!(ids(&log.range(ch, MessageId::ZERO, None, 0, Order::Ascending).unwrap()), vec![1, 2, 3, 4]);
    }

    #[test]
    fn latest_is_capped_at_the_page_limit() {
        let fx = Fixture::new();
        let (ch, user) = fx.seed();
        let log = MessageLog::new(fx.ctx.clone());
        for i in 1..=3 {
            log.append(ch, user, &format!("m{}", i)).unwrap();
        }
        fx.take_repairs();

        assert_eq!(ids(&log.latest(ch, usize::MAX, Order::Ascending).unwrap()), vec![1, 2, 3]);
        assert_eq!(ids(&log.latest(ch, usize::MAX, Order::Descending).unwrap()), vec![3, 2, 1]);
    }

    #[test]
    fn stale_allocator_skips_ids_the_database_already_has() {
        let fx = Fixture::new();
        let (ch, user) = fx.seed();
        for i in 1..=3 {
            fx.insert(ch, i, user, "old");
        }
        fx.store.set(&fx.ctx.keys.sequence(ch), b"1").unwrap();

        let log = MessageLog::new(fx.ctx.clone());
        assert_eq!(log.append(ch, user, "new").unwrap().id, MessageId(4));
        assert_eq!(fx.db.count_messages(ch).unwrap(), 4);
        assert_eq!(fx.take_repairs(), vec![RepairJob::Channel(ch)]);

        log.rebuild(ch).unwrap();
        assert_eq!(ids(&log.range(ch, MessageId::ZERO, None, 0, Order::Ascending).unwrap()), vec![1, 2, 3, 4]);
    }

    #[test]
    fn offline_cache_still_accepts_and_serves_messages() {
        let fx = Fixture::new();
        let (ch, user) = fx.seed();
        let log = MessageLog::new(fx.ctx.clone());
        log.append(ch, user, "online").unwrap();
        fx.take_repairs();

        fx.store.set_offline(true);
        let message = log.append(ch, user, "offline").unwrap();
        assert_eq!(message.id, MessageId(2));
        assert_eq!(ids(&log.range(ch, MessageId::ZERO, None, 0, Order::Ascending).unwrap()), vec![1, 2]);
        assert_eq!(log.count(ch).unwrap(), 2);
        assert_eq!(fx.take_repairs(), vec![RepairJob::Channel(ch)]);

        fx.store.set_offline(false);
        log.rebuild(ch).unwrap();
        assert_eq!(log.append(ch, user, "back").unwrap().id, MessageId(3));
    }

    #[test]
    fn unknown_author_cannot_post() {
        let fx = Fixture::new();
        let (ch, _) = fx.seed();
        let log = MessageLog::new(fx.ctx.clone());

        let err = log.append(ch, UserId(99), "hi").unwrap_err();
        assert!(matches!(err, SyncError::UnknownAuthor(UserId(99))));
        assert_eq!(fx.db.count_messages(ch).unwrap(), 0);
    }

    #[test]
    fn log_key_of_the_wrong_kind_is_an_error() {
        let fx = Fixture::new();
        let (ch, _) = fx.seed();
        fx.store.set(&fx.ctx.keys.messages(ch), b"scalar").unwrap();
        let log = MessageLog::new(fx.ctx.clone());

        let err = log.range(ch, MessageId::ZERO, None, 0, Order::Ascending).unwrap_err();
        assert!(err.is_fatal());
    }
}
