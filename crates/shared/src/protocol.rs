use std::collections::BTreeMap;

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Deserializer, Serialize};

use crate::domain::{ChatId, ConferenceId, MessageId, ProfileId};

/// Body of `POST /chat/token`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatTokenRequest {
    /// The caller's session credential; the backend resolves it to a profile.
    pub identity: String,
    pub conference: ConferenceId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatTokenResponse {
    pub token: String,
    #[serde(deserialize_with = "deserialize_expiry")]
    pub expiry: DateTime<Utc>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum ExpiryRepr {
    Millis(i64),
    Text(DateTime<Utc>),
}

/// Accepts either RFC 3339 text or epoch milliseconds.
fn deserialize_expiry<'de, D>(deserializer: D) -> Result<DateTime<Utc>, D::Error>
where
    D: Deserializer<'de>,
{
    match ExpiryRepr::deserialize(deserializer)? {
        ExpiryRepr::Text(at) => Ok(at),
        ExpiryRepr::Millis(ms) => Utc
            .timestamp_millis_opt(ms)
            .single()
            .ok_or_else(|| serde::de::Error::custom(format!("expiry out of range: {ms}"))),
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub message_id: MessageId,
    pub chat_id: ChatId,
    /// Position of the message within its chat, starting at 0.
    pub index: u64,
    pub author: ProfileId,
    pub body: String,
    pub sent_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub reactions: BTreeMap<String, Vec<ProfileId>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelEventKind {
    MessageAdded,
    MemberJoined,
    MemberLeft,
    TypingStarted,
    TypingEnded,
    ReactionUpdated,
    ChannelUpdated,
    ChannelRemoved,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum ChannelEvent {
    MessageAdded {
        message: ChatMessage,
    },
    MemberJoined {
        chat_id: ChatId,
        profile_id: ProfileId,
    },
    MemberLeft {
        chat_id: ChatId,
        profile_id: ProfileId,
    },
    TypingStarted {
        chat_id: ChatId,
        profile_id: ProfileId,
    },
    TypingEnded {
        chat_id: ChatId,
        profile_id: ProfileId,
    },
    ReactionUpdated {
        chat_id: ChatId,
        message_id: MessageId,
        reaction: String,
        reactors: Vec<ProfileId>,
    },
    ChannelUpdated {
        chat_id: ChatId,
    },
    ChannelRemoved {
        chat_id: ChatId,
    },
}

impl ChannelEvent {
    pub fn kind(&self) -> ChannelEventKind {
        match self {
            ChannelEvent::MessageAdded { .. } => ChannelEventKind::MessageAdded,
            ChannelEvent::MemberJoined { .. } => ChannelEventKind::MemberJoined,
            ChannelEvent::MemberLeft { .. } => ChannelEventKind::MemberLeft,
            ChannelEvent::TypingStarted { .. } => ChannelEventKind::TypingStarted,
            ChannelEvent::TypingEnded { .. } => ChannelEventKind::TypingEnded,
            ChannelEvent::ReactionUpdated { .. } => ChannelEventKind::ReactionUpdated,
            ChannelEvent::ChannelUpdated { .. } => ChannelEventKind::ChannelUpdated,
            ChannelEvent::ChannelRemoved { .. } => ChannelEventKind::ChannelRemoved,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Connecting,
    Connected,
    Disconnecting,
    Disconnected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceEventKind {
    UserUpdated,
    ConnectionError,
    ConnectionStateChanged,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum ServiceEvent {
    UserUpdated {
        profile_id: ProfileId,
        /// `None` when the provider no longer reports presence for this user.
        is_online: Option<bool>,
    },
    ConnectionError {
        message: String,
    },
    ConnectionStateChanged {
        state: ConnectionState,
    },
}

impl ServiceEvent {
    pub fn kind(&self) -> ServiceEventKind {
        match self {
            ServiceEvent::UserUpdated { .. } => ServiceEventKind::UserUpdated,
            ServiceEvent::ConnectionError { .. } => ServiceEventKind::ConnectionError,
            ServiceEvent::ConnectionStateChanged { .. } => ServiceEventKind::ConnectionStateChanged,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_response_accepts_rfc3339_expiry() {
        let parsed: ChatTokenResponse =
            serde_json::from_str(r#"{"token":"t","expiry":"2030-01-02T03:04:05Z"}"#)
                .expect("json");
        assert_eq!(parsed.expiry.to_rfc3339(), "2030-01-02T03:04:05+00:00");
    }

    #[test]
    fn token_response_accepts_epoch_millis_expiry() {
        let parsed: ChatTokenResponse =
            serde_json::from_str(r#"{"token":"t","expiry":1893456000000}"#).expect("json");
        assert_eq!(parsed.expiry.timestamp(), 1_893_456_000);
    }

    #[test]
    fn channel_events_report_their_kind() {
        let event = ChannelEvent::TypingStarted {
            chat_id: ChatId::new("CH-1"),
            profile_id: ProfileId::new("p1"),
        };
        assert_eq!(event.kind(), ChannelEventKind::TypingStarted);
        let json = serde_json::to_value(&event).expect("json");
        assert_eq!(json["type"], "typing_started");
    }
}
