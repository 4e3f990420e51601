//! Fixed encodings for the records the cache holds.
//!
//! Structured records are JSON and are validated after decoding; counters are
//! ASCII integers so the backend can increment them in place.

use murmur_types::{Author, ChannelId, Message};
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::error::{SyncError, SyncResult};

pub trait CacheRecord: Serialize + DeserializeOwned {
    const KIND: &'static str;

    fn validate(&self) -> Result<(), String>;

    fn encode(&self) -> SyncResult<Vec<u8>> {
        serde_json::to_vec(self).map_err(|e| corrupt(Self::KIND, e))
    }

    fn decode(raw: &[u8]) -> SyncResult<Self> {
        let record: Self = serde_json::from_slice(raw).map_err(|e| corrupt(Self::KIND, e))?;
        record.validate().map_err(|reason| corrupt(Self::KIND, reason))?;
        Ok(record)
    }
}

impl CacheRecord for Message {
    const KIND: &'static str = "message";

    fn validate(&self) -> Result<(), String> {
        if self.id.get() <= 0 {
            return Err(format!("non-positive message id {}", self.id));
        }
        if self.channel_id.get() <= 0 {
            return Err(format!("non-positive channel id {}", self.channel_id));
        }
        self.author.validate()
    }
}

impl CacheRecord for Author {
    const KIND: &'static str = "author";

    fn validate(&self) -> Result<(), String> {
        if self.id.get() <= 0 {
            return Err(format!("non-positive user id {}", self.id));
        }
        Ok(())
    }
}

fn corrupt(kind: &'static str, reason: impl ToString) -> SyncError {
    SyncError::Corrupt {
        kind,
        reason: reason.to_string(),
    }
}

pub fn encode_int(value: i64) -> Vec<u8> {
    value.to_string().into_bytes()
}

/// Decode a counter or id scalar. Negative values are never written by this crate.
pub fn decode_int(kind: &'static str, raw: &[u8]) -> SyncResult<i64> {
    let value = std::str::from_utf8(raw)
        .ok()
        .and_then(|s| s.parse::<i64>().ok())
        .ok_or_else(|| corrupt(kind, format!("not an integer: {:?}", String::from_utf8_lossy(raw))))?;
    if value < 0 {
        return Err(corrupt(kind, format!("negative value {}", value)));
    }
    Ok(value)
}

pub fn channel_member(channel: ChannelId) -> Vec<u8> {
    channel.to_string().into_bytes()
}

pub fn decode_channel_member(raw: &[u8]) -> SyncResult<ChannelId> {
    decode_int("channel", raw).map(ChannelId)
}
