//! Per-channel message id allocation.
//!
//! Ids come from an atomic increment on `{prefix}:channel:{id}:seq`. When the
//! counter is missing (cold cache, flush, eviction) it is seeded from the
//! highest id in the database before the first increment, so ids never go
//! backwards. The database primary key is the final guard against reuse.

use std::sync::Arc;

use murmur_types::{ChannelId, MessageId};
use tracing::info;

use crate::Context;
use crate::codec::{decode_int, encode_int};
use crate::error::SyncResult;

/// A freshly allocated id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Allocation {
    pub id: MessageId,
    /// The counter had to be seeded from the database first, meaning the rest
    /// of the channel's cached state is suspect too.
    pub reseeded: bool,
}

pub struct IdAllocator {
    ctx: Arc<Context>,
}

impl IdAllocator {
    pub(crate) fn new(ctx: Arc<Context>) -> Self {
        Self { ctx }
    }

    pub fn next_id(&self, channel: ChannelId) -> SyncResult<Allocation> {
        let key = self.ctx.keys.sequence(channel);
        let mut reseeded = false;
        if !self.ctx.store.exists(&key)? {
            let max = self.ctx.db.max_message_id(channel)?;
            reseeded = self.ctx.store.set_if_absent(&key, &encode_int(max.get()))?;
            if reseeded {
                info!(channel = %channel, max = %max, "seeded id allocator from database");
            }
        }
        let id = self.ctx.store.increment(&key)?;
        Ok(Allocation {
            id: MessageId(id),
            reseeded,
        })
    }

    /// Last id handed out, if the counter exists.
    pub fn current(&self, channel: ChannelId) -> SyncResult<Option<MessageId>> {
        let key = self.ctx.keys.sequence(channel);
        match self.ctx.store.get(&key)? {
            Some(raw) => Ok(Some(MessageId(decode_int("sequence", &raw)?))),
            None => Ok(None),
        }
    }

    /// Move the counter up to at least `floor`. Never lowers it.
    pub fn seed(&self, channel: ChannelId, floor: MessageId) -> SyncResult<()> {
        let key = self.ctx.keys.sequence(channel);
        if self.ctx.store.set_if_absent(&key, &encode_int(floor.get()))? {
            return Ok(());
        }
        // Stepping forward one increment at a time keeps concurrent
        // allocations safe; a blind SET could hand out an id twice.
        let mut current = self.current(channel)?.unwrap_or(MessageId::ZERO);
        while current < floor {
            current = MessageId(self.ctx.store.increment(&key)?);
        }
        Ok(())
    }

    /// Seed from the database maximum after an allocated id was found taken.
    pub fn reseed(&self, channel: ChannelId) -> SyncResult<()> {
        let max = self.ctx.db.max_message_id(channel)?;
        info!(channel = %channel, max = %max, "reseeding id allocator");
        self.seed(channel, max)
    }
}
