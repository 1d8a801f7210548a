use std::fmt;

use serde::{Deserialize, Serialize};

macro_rules! id_newtype {
    ($name:ident) => {
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub String);

        impl $name {
            pub fn new(value: impl Into<String>) -> Self {
                Self(value.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self(value.to_string())
            }
        }
    };
}

id_newtype!(ConferenceId);
id_newtype!(ProfileId);
id_newtype!(ChatId);
id_newtype!(MessageId);

impl ChatId {
    pub fn generate() -> Self {
        Self(format!("CH{}", uuid::Uuid::new_v4().simple()))
    }
}

impl MessageId {
    pub fn generate() -> Self {
        Self(format!("IM{}", uuid::Uuid::new_v4().simple()))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Conference {
    pub id: ConferenceId,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserProfile {
    pub id: ProfileId,
    pub display_name: String,
}

/// Persisted category marker of a text chat record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChatMode {
    General,
    DirectMessage,
    Moderation,
    ModerationHub,
}

impl ChatMode {
    pub fn as_str(self) -> &'static str {
        match self {
            ChatMode::General => "general",
            ChatMode::DirectMessage => "direct_message",
            ChatMode::Moderation => "moderation",
            ChatMode::ModerationHub => "moderation_hub",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "general" => Some(ChatMode::General),
            "direct_message" => Some(ChatMode::DirectMessage),
            "moderation" => Some(ChatMode::Moderation),
            "moderation_hub" => Some(ChatMode::ModerationHub),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chat_mode_round_trips_through_marker_string() {
        for mode in [
            ChatMode::General,
            ChatMode::DirectMessage,
            ChatMode::Moderation,
            ChatMode::ModerationHub,
        ] {
            assert_eq!(ChatMode::parse(mode.as_str()), Some(mode));
        }
        assert_eq!(ChatMode::ModerationHub.as_str(), "moderation_hub");
        assert_eq!(ChatMode::parse("lobby"), None);
    }

    #[test]
    fn ids_serialize_as_plain_strings() {
        let id = ChatId::new("CH-1");
        assert_eq!(serde_json::to_string(&id).expect("json"), "\"CH-1\"");
        assert!(ChatId::generate().as_str().starts_with("CH"));
    }
}
