use std::sync::Arc;

use murmur_cache::Transaction;
use murmur_types::{ChannelId, MessageId, ReadPosition, UserId};
use tracing::info;

use crate::Context;
use crate::codec::channel_member;
use crate::error::SyncResult;
use crate::haveread::ReadTracker;
use crate::log::MessageLog;

/// What a full initialization loaded into the cache.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BootstrapReport {
    pub channels: usize,
    pub messages: usize,
    pub read_positions: usize,
}

/// Populates the cache from the database on startup or on demand.
pub struct Bootstrap {
    ctx: Arc<Context>,
    log: Arc<MessageLog>,
    reads: Arc<ReadTracker>,
}

impl Bootstrap {
    pub(crate) fn new(ctx: Arc<Context>, log: Arc<MessageLog>, reads: Arc<ReadTracker>) -> Self {
        Self { ctx, log, reads }
    }

    /// Rebuild every channel and reload every read position. Safe to run
    /// repeatedly; each piece of state is cleared before it is repopulated.
    pub fn initialize_all(&self) -> SyncResult<BootstrapReport> {
        let channels = self.ctx.db.list_channel_ids()?;
        self.register_channels(&channels)?;
        self.ctx.store.delete(&self.ctx.keys.authors())?;

        let mut messages = 0;
        for &channel in &channels {
            messages += self.log.rebuild(channel)?;
        }

        let positions: Vec<ReadPosition> = self
            .ctx
            .db
            .list_read_positions()?
            .into_iter()
            .map(|row| ReadPosition {
                user_id: UserId(row.user_id),
                channel_id: ChannelId(row.channel_id),
                message_id: MessageId(row.message_id),
            })
            .collect();
        let read_positions = self.reads.load(&positions)?;

        let report = BootstrapReport {
            channels: channels.len(),
            messages,
            read_positions,
        };
        info!(
            channels = report.channels,
            messages = report.messages,
            read_positions = report.read_positions,
            "cache initialized"
        );
        Ok(report)
    }

    /// Replace the cached channel set.
    pub fn register_channels(&self, channels: &[ChannelId]) -> SyncResult<()> {
        let key = self.ctx.keys.channels();
        let mut tx = Transaction::new();
        tx.delete(key.clone());
        for &channel in channels {
            tx.add_member(key.clone(), channel_member(channel));
        }
        self.ctx.store.commit(tx)?;
        Ok(())
    }
}
