pub mod api;
pub mod models;

pub use models::{Author, Channel, ChannelId, ChannelUnread, Message, MessageId, Order, ReadPosition, UserId};
