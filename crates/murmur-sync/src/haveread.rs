//! Per-user read watermarks.
//!
//! A user's watermarks live in one ordered set: member is the channel id,
//! score is the highest message id read. Writes go through the backend's
//! max-merge (`ZADD GT`) so two concurrent marks can never move a watermark
//! backwards. A marker member records that the user's positions have been
//! loaded, which lets an absent channel read as zero without a database trip.

use std::collections::BTreeMap;
use std::sync::Arc;

use murmur_cache::Transaction;
use murmur_types::{ChannelId, ChannelUnread, MessageId, ReadPosition, UserId};
use tracing::{debug, info, warn};

use crate::Context;
use crate::codec::channel_member;
use crate::error::SyncResult;
use crate::log::MessageLog;
use crate::repair::RepairJob;

const LOADED_MARKER: &[u8] = b"loaded";

pub struct ReadTracker {
    ctx: Arc<Context>,
    log: Arc<MessageLog>,
}

impl ReadTracker {
    pub(crate) fn new(ctx: Arc<Context>, log: Arc<MessageLog>) -> Self {
        Self { ctx, log }
    }

    /// Record that `user` has read `channel` up to `message`. The stored
    /// watermark only ever moves forward.
    pub fn mark_read(&self, user: UserId, channel: ChannelId, message: MessageId) -> SyncResult<()> {
        self.ctx.db.upsert_read_position(user, channel, message)?;

        let key = self.ctx.keys.have_read(user);
        match self.ctx.store.raise_score(&key, message.get(), &channel_member(channel)) {
            Ok(_) => Ok(()),
            Err(e) if e.is_fatal() => Err(e.into()),
            Err(e) => {
                warn!(user = %user, channel = %channel, "watermark stored but not cached: {}", e);
                self.ctx.repairs.schedule(RepairJob::ReadPositions(user));
                Ok(())
            }
        }
    }

    /// Highest message id `user` has read in `channel`, zero if none.
    pub fn watermark(&self, user: UserId, channel: ChannelId) -> SyncResult<MessageId> {
        let key = self.ctx.keys.have_read(user);
        let cached = self
            .ctx
            .store
            .score(&key, &channel_member(channel))
            .and_then(|score| match score {
                Some(id) => Ok(Some(MessageId(id))),
                None if self.ctx.store.score(&key, LOADED_MARKER)?.is_some() => Ok(Some(MessageId::ZERO)),
                None => Ok(None),
            });

        match cached {
            Ok(Some(id)) => Ok(id),
            Ok(None) => {
                debug!(user = %user, "read positions not cached, loading");
                if let Err(e) = self.reload_user(user) {
                    if e.is_fatal() {
                        return Err(e);
                    }
                    warn!(user = %user, "could not cache read positions: {}", e);
                }
                Ok(self.ctx.db.get_read_position(user, channel)?)
            }
            Err(e) if e.is_fatal() => Err(e.into()),
            Err(e) => {
                warn!(user = %user, "watermark cache unavailable, reading database: {}", e);
                Ok(self.ctx.db.get_read_position(user, channel)?)
            }
        }
    }

    /// Messages in `channel` newer than the user's watermark.
    pub fn unread(&self, user: UserId, channel: ChannelId) -> SyncResult<i64> {
        let watermark = self.watermark(user, channel)?;
        self.log.count_after(channel, watermark)
    }

    pub fn unread_counts(&self, user: UserId, channels: &[ChannelId]) -> SyncResult<Vec<ChannelUnread>> {
        channels
            .iter()
            .map(|&channel_id| {
                Ok(ChannelUnread {
                    channel_id,
                    unread: self.unread(user, channel_id)?,
                })
            })
            .collect()
    }

    /// Replace the cached watermarks of every user that appears in
    /// `positions`. Returns the number of positions loaded.
    pub fn load(&self, positions: &[ReadPosition]) -> SyncResult<usize> {
        let mut by_user: BTreeMap<UserId, Vec<&ReadPosition>> = BTreeMap::new();
        for position in positions {
            by_user.entry(position.user_id).or_default().push(position);
        }

        for (user, positions) in &by_user {
            let key = self.ctx.keys.have_read(*user);
            let mut tx = Transaction::new();
            tx.delete(key.clone()).raise_score(key.clone(), 0, LOADED_MARKER);
            for p in positions {
                tx.raise_score(key.clone(), p.message_id.get(), channel_member(p.channel_id));
            }
            self.ctx.store.commit(tx)?;
        }
        info!(users = by_user.len(), positions = positions.len(), "loaded read positions");
        Ok(positions.len())
    }

    /// Merge a user's stored positions into the cache. Cached values that are
    /// already ahead are kept.
    pub fn reload_user(&self, user: UserId) -> SyncResult<usize> {
        let rows = self.ctx.db.list_read_positions_for_user(user)?;
        let key = self.ctx.keys.have_read(user);
        let mut tx = Transaction::new();
        for row in &rows {
            tx.raise_score(key.clone(), row.message_id, channel_member(ChannelId(row.channel_id)));
        }
        tx.raise_score(key, 0, LOADED_MARKER);
        self.ctx.store.commit(tx)?;
        Ok(rows.len())
    }
}
