//! Database row types. These map directly to SQLite rows and are kept apart
//! from the murmur-types records so the DB layer stays independent.

use anyhow::{Context, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use murmur_types::{Author, ChannelId, Message, MessageId, UserId};

pub struct MessageRow {
    pub channel_id: i64,
    pub id: i64,
    pub user_id: i64,
    pub user_name: String,
    pub display_name: String,
    pub avatar_icon: String,
    pub content: String,
    pub created_at: String,
}

impl MessageRow {
    pub fn into_message(self) -> Result<Message> {
        let created_at = parse_timestamp(&self.created_at).with_context(|| {
            format!(
                "corrupt created_at '{}' on message {}/{}",
                self.created_at, self.channel_id, self.id
            )
        })?;

        Ok(Message {
            id: MessageId(self.id),
            channel_id: ChannelId(self.channel_id),
            author: Author {
                id: UserId(self.user_id),
                name: self.user_name,
                display_name: self.display_name,
                avatar_icon: self.avatar_icon,
            },
            content: self.content,
            created_at,
        })
    }
}

pub struct ReadPositionRow {
    pub user_id: i64,
    pub channel_id: i64,
    pub message_id: i64,
}

/// Timestamps are stored as RFC 3339 with microsecond precision so a message
/// read back from the database is identical to the one that was cached.
pub fn format_timestamp(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>> {
    Ok(DateTime::parse_from_rfc3339(raw)?.with_timezone(&Utc))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn timestamp_format_keeps_microseconds() {
        let ts = Utc.timestamp_opt(1_700_000_000, 123_456_000).unwrap();
        let raw = format_timestamp(&ts);
        assert_eq!(raw, "2023-11-14T22:13:20.123456Z");
        assert_eq!(parse_timestamp(&raw).unwrap(), ts);
    }

    #[test]
    fn corrupt_timestamp_is_an_error() {
        let row = MessageRow {
            channel_id: 1,
            id: 1,
            user_id: 1,
            user_name: "a".into(),
            display_name: "A".into(),
            avatar_icon: "a.png".into(),
            content: "hi".into(),
            created_at: "yesterday".into(),
        };
        assert!(row.into_message().is_err());
    }
}
