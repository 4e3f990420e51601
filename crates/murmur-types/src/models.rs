use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

macro_rules! id_type {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub i64);

        impl $name {
            pub fn get(self) -> i64 {
                self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<i64> for $name {
            fn from(v: i64) -> Self {
                Self(v)
            }
        }
    };
}

id_type!(
    /// Channel identifier, assigned by the relational store.
    ChannelId
);
id_type!(
    /// User identifier, assigned by the relational store.
    UserId
);
id_type!(
    /// Channel-scoped message identifier. Strictly increasing within a channel;
    /// `MessageId(0)` means "no message" (nothing read yet, range from the start).
    MessageId
);

impl MessageId {
    pub const ZERO: MessageId = MessageId(0);

    pub fn is_zero(self) -> bool {
        self.0 == 0
    }

    pub fn next(self) -> MessageId {
        MessageId(self.0 + 1)
    }
}

/// Denormalized author display fields carried on every message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Author {
    pub id: UserId,
    pub name: String,
    pub display_name: String,
    pub avatar_icon: String,
}

/// A chat message. Created once by an append and never mutated afterwards.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    pub channel_id: ChannelId,
    pub author: Author,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Channel {
    pub id: ChannelId,
    pub name: String,
    pub description: String,
}

/// Last message a user has seen in a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReadPosition {
    pub user_id: UserId,
    pub channel_id: ChannelId,
    pub message_id: MessageId,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelUnread {
    pub channel_id: ChannelId,
    pub unread: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Order {
    #[default]
    Ascending,
    Descending,
}

impl Order {
    pub fn is_descending(self) -> bool {
        matches!(self, Order::Descending)
    }
}

impl FromStr for Order {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "asc" | "ascending" => Ok(Order::Ascending),
            "desc" | "descending" => Ok(Order::Descending),
            other => Err(format!("unknown order: {}", other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_serialize_as_plain_integers() {
        let pos = ReadPosition {
            user_id: UserId(7),
            channel_id: ChannelId(2),
            message_id: MessageId(41),
        };
        let json = serde_json::to_string(&pos).unwrap();
        assert_eq!(json, r#"{"user_id":7,"channel_id":2,"message_id":41}"#);
    }

    #[test]
    fn order_parses_short_and_long_forms() {
        assert_eq!("desc".parse::<Order>().unwrap(), Order::Descending);
        assert_eq!("Ascending".parse::<Order>().unwrap(), Order::Ascending);
        assert!("sideways".parse::<Order>().is_err());
    }

    #[test]
    fn zero_message_id_is_the_start_of_a_channel() {
        assert!(MessageId::ZERO.is_zero());
        assert_eq!(MessageId::ZERO.next(), MessageId(1));
    }
}
