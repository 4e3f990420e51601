use serde::{Deserialize, Serialize};

use crate::models::{ChannelId, MessageId, UserId};

// -- Channels --

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CreateChannelRequest {
    pub name: String,
    #[serde(default)]
    pub description: String,
}

// -- Users --

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct UpdateProfileRequest {
    pub display_name: String,
    pub avatar_icon: String,
}

// -- Messages --

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SendMessageRequest {
    pub user_id: UserId,
    pub content: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CountResponse {
    pub channel_id: ChannelId,
    pub count: i64,
}

// -- Read positions --

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MarkReadRequest {
    pub user_id: UserId,
    pub message_id: MessageId,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct WatermarkResponse {
    pub user_id: UserId,
    pub channel_id: ChannelId,
    pub message_id: MessageId,
}

// -- Admin --

#[derive(Debug, Serialize, Deserialize)]
pub struct RebuildResponse {
    pub channels: usize,
    pub messages: usize,
    pub read_positions: usize,
}
