//! Keeps a networked cache in step with the relational database for a chat
//! service.
//!
//! The database is always the source of truth: every write lands there first
//! and every read can be answered from it. The cache holds per-channel message
//! logs, message counts, id counters and per-user read watermarks so the hot
//! paths never touch SQL. When the cache is unreachable or holds something it
//! cannot decode, reads fall back to the database and the affected channel is
//! queued for a background rebuild.
//!
//! [`MessageCache`] is the entry point. All of its methods block; async callers
//! run them on a blocking thread.

pub mod authors;
pub mod bootstrap;
pub mod codec;
pub mod config;
pub mod counts;
pub mod error;
pub mod haveread;
pub mod keys;
pub mod log;
pub mod repair;
pub mod sequence;

#[cfg(test)]
mod testing;

use std::sync::Arc;
use std::thread::JoinHandle;

use murmur_cache::CacheStore;
use murmur_db::Database;
use murmur_types::{ChannelId, ChannelUnread, Message, MessageId, Order, UserId};
use tracing::warn;

pub use bootstrap::{Bootstrap, BootstrapReport};
pub use config::SyncConfig;
pub use error::{SyncError, SyncResult};
pub use haveread::ReadTracker;
pub use keys::Keys;
pub use log::MessageLog;
pub use repair::{RepairHandle, RepairJob, RepairQueue, Repairer};

use codec::decode_channel_member;

/// Backends and settings shared by every component.
pub(crate) struct Context {
    pub(crate) store: Arc<dyn CacheStore>,
    pub(crate) db: Arc<Database>,
    pub(crate) keys: Keys,
    pub(crate) config: SyncConfig,
    pub(crate) repairs: RepairHandle,
}

struct Inner {
    ctx: Arc<Context>,
    log: Arc<MessageLog>,
    reads: Arc<ReadTracker>,
    bootstrap: Bootstrap,
}

impl Repairer for Inner {
    fn repair(&self, job: RepairJob) -> SyncResult<()> {
        match job {
            RepairJob::Channel(channel) => self.log.rebuild(channel).map(|_| ()),
            RepairJob::ReadPositions(user) => self.reads.reload_user(user).map(|_| ()),
        }
    }
}

pub struct MessageCache {
    inner: Arc<Inner>,
    queue: RepairQueue,
}

impl MessageCache {
    pub fn new(store: Arc<dyn CacheStore>, db: Arc<Database>, config: SyncConfig) -> Self {
        let (repairs, queue) = repair::queue();
        let ctx = Arc::new(Context {
            store,
            db,
            keys: Keys::new(config.key_prefix.clone()),
            config,
            repairs,
        });
        let log = Arc::new(MessageLog::new(ctx.clone()));
        let reads = Arc::new(ReadTracker::new(ctx.clone(), log.clone()));
        let bootstrap = Bootstrap::new(ctx.clone(), log.clone(), reads.clone());

        Self {
            inner: Arc::new(Inner {
                ctx,
                log,
                reads,
                bootstrap,
            }),
            queue,
        }
    }

    /// Start the background repair thread. It stops when this cache is dropped.
    pub fn start_repair_worker(&self) -> std::io::Result<JoinHandle<()>> {
        self.queue.clone().spawn(Arc::downgrade(&self.inner))
    }

    /// Run queued repairs on the calling thread. Returns how many ran.
    pub fn run_pending_repairs(&self) -> usize {
        self.queue.drain(self.inner.as_ref())
    }

    pub fn pending_repairs(&self) -> usize {
        self.inner.ctx.repairs.pending()
    }

    pub fn log(&self) -> &MessageLog {
        &self.inner.log
    }

    pub fn reads(&self) -> &ReadTracker {
        &self.inner.reads
    }

    pub fn append(&self, channel: ChannelId, user: UserId, content: &str) -> SyncResult<Message> {
        self.inner.log.append(channel, user, content)
    }

    pub fn range(
        &self,
        channel: ChannelId,
        after: MessageId,
        limit: Option<usize>,
        offset: usize,
        order: Order,
    ) -> SyncResult<Vec<Message>> {
        self.inner.log.range(channel, after, limit, offset, order)
    }

    pub fn latest(&self, channel: ChannelId, n: usize, order: Order) -> SyncResult<Vec<Message>> {
        self.inner.log.latest(channel, n, order)
    }

    pub fn count(&self, channel: ChannelId) -> SyncResult<i64> {
        self.inner.log.count(channel)
    }

    /// Newest page of messages after `after`, oldest first, marking the newest
    /// one as read for `user`.
    pub fn fetch_and_mark(
        &self,
        user: UserId,
        channel: ChannelId,
        after: MessageId,
        limit: Option<usize>,
    ) -> SyncResult<Vec<Message>> {
        let mut messages = self.inner.log.range(channel, after, limit, 0, Order::Descending)?;
        if let Some(newest) = messages.first() {
            self.inner.reads.mark_read(user, channel, newest.id)?;
        }
        messages.reverse();
        Ok(messages)
    }

    pub fn mark_read(&self, user: UserId, channel: ChannelId, message: MessageId) -> SyncResult<()> {
        self.inner.reads.mark_read(user, channel, message)
    }

    pub fn watermark(&self, user: UserId, channel: ChannelId) -> SyncResult<MessageId> {
        self.inner.reads.watermark(user, channel)
    }

    pub fn unread_counts(&self, user: UserId) -> SyncResult<Vec<ChannelUnread>> {
        let channels = self.channels()?;
        self.inner.reads.unread_counts(user, &channels)
    }

    /// Change a user's display fields and drop their cached copy.
    /// Returns `false` for an unknown user.
    pub fn update_profile(&self, user: UserId, display_name: &str, avatar_icon: &str) -> SyncResult<bool> {
        let changed = self.inner.ctx.db.update_profile(user, display_name, avatar_icon)?;
        if changed {
            if let Err(e) = self.inner.log.authors().invalidate(user) {
                if e.is_fatal() {
                    return Err(e);
                }
                warn!(user = %user, "could not drop cached author: {}", e);
            }
        }
        Ok(changed)
    }

    pub fn create_channel(&self, name: &str, description: &str) -> SyncResult<ChannelId> {
        let channel = self.inner.ctx.db.create_channel(name, description)?;
        if let Err(e) = self.inner.log.register(channel) {
            if e.is_fatal() {
                return Err(e);
            }
            warn!(channel = %channel, "could not cache new channel: {}", e);
        }
        Ok(channel)
    }

    pub fn rebuild(&self, channel: ChannelId) -> SyncResult<usize> {
        self.inner.log.rebuild(channel)
    }

    pub fn initialize_all(&self) -> SyncResult<BootstrapReport> {
        self.inner.bootstrap.initialize_all()
    }

    /// Known channel ids in ascending order.
    pub fn channels(&self) -> SyncResult<Vec<ChannelId>> {
        let ctx = &self.inner.ctx;
        let cached = ctx
            .store
            .members(&ctx.keys.channels())
            .map_err(SyncError::from)
            .and_then(|raw| raw.iter().map(|m| decode_channel_member(m)).collect::<SyncResult<Vec<_>>>());

        match cached {
            Ok(mut channels) if !channels.is_empty() => {
                channels.sort();
                Ok(channels)
            }
            Ok(_) => {
                let channels = ctx.db.list_channel_ids()?;
                if let Err(e) = self.inner.bootstrap.register_channels(&channels) {
                    if e.is_fatal() {
                        return Err(e);
                    }
                    warn!("could not cache channel set: {}", e);
                }
                Ok(channels)
            }
            Err(e) if e.is_fatal() => Err(e),
            Err(e) => {
                warn!("channel set unavailable, listing from database: {}", e);
                Ok(ctx.db.list_channel_ids()?)
            }
        }
    }
}
