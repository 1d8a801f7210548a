use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use shared::domain::{ChatId, ConferenceId, ProfileId};
use tokio::sync::OnceCell;
use tracing::debug;

use crate::{
    error::ChatError,
    provider_channel::{ChannelAttributes, ProviderChannel},
    provider_service::ProviderService,
    store::{ConferenceConfigStore, ANNOUNCEMENTS_CHANNEL_KEY},
};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ChatCategory {
    General {
        is_private: bool,
    },
    DirectMessage {
        member1: MemberDescriptor,
        member2: MemberDescriptor,
    },
    ModerationSession {
        is_active: bool,
        related_moderation_key: Option<String>,
    },
    ModerationHub,
}

impl ChatCategory {
    pub fn is_private(&self) -> bool {
        match self {
            ChatCategory::General { is_private } => *is_private,
            _ => true,
        }
    }

    pub fn is_dm(&self) -> bool {
        matches!(self, ChatCategory::DirectMessage { .. })
    }

    pub fn is_moderation(&self) -> bool {
        matches!(self, ChatCategory::ModerationSession { .. })
    }

    pub fn is_moderation_hub(&self) -> bool {
        matches!(self, ChatCategory::ModerationHub)
    }
}

/// Snapshot of a chat as the application sees it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatDescriptor {
    pub id: ChatId,
    pub friendly_name: String,
    pub auto_watch_enabled: bool,
    pub is_announcements: bool,
    pub creator: ProfileId,
    pub created_at: DateTime<Utc>,
    pub category: ChatCategory,
}

impl ChatDescriptor {
    pub fn is_private(&self) -> bool {
        self.category.is_private()
    }

    pub fn is_dm(&self) -> bool {
        self.category.is_dm()
    }

    pub fn is_moderation(&self) -> bool {
        self.category.is_moderation()
    }

    pub fn is_moderation_hub(&self) -> bool {
        self.category.is_moderation_hub()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemberDescriptor {
    pub profile_id: ProfileId,
    /// `None` when presence is unknown, which is not the same as offline.
    pub is_online: Option<bool>,
}

impl MemberDescriptor {
    pub fn unknown(profile_id: ProfileId) -> Self {
        Self {
            profile_id,
            is_online: None,
        }
    }
}

/// Hub beats moderation, moderation beats a DM pair, and anything else is general.
///
/// DM members come back with unknown presence; [`DescriptorConverter::describe`]
/// fills it in.
pub fn classify(attributes: &ChannelAttributes, is_private: bool) -> ChatCategory {
    if attributes.is_moderation_hub {
        ChatCategory::ModerationHub
    } else if attributes.is_moderation {
        ChatCategory::ModerationSession {
            is_active: !attributes.moderation_completed,
            related_moderation_key: attributes.related_moderation_key.clone(),
        }
    } else if let Some((member1, member2)) = &attributes.dm_members {
        ChatCategory::DirectMessage {
            member1: MemberDescriptor::unknown(member1.clone()),
            member2: MemberDescriptor::unknown(member2.clone()),
        }
    } else {
        ChatCategory::General { is_private }
    }
}

pub struct DescriptorConverter {
    conference_id: ConferenceId,
    config: Arc<dyn ConferenceConfigStore>,
    announcements: OnceCell<Option<ChatId>>,
}

impl DescriptorConverter {
    pub fn new(conference_id: ConferenceId, config: Arc<dyn ConferenceConfigStore>) -> Self {
        Self {
            conference_id,
            config,
            announcements: OnceCell::new(),
        }
    }

    /// Looked up once per session; a failed lookup is retried on the next conversion.
    async fn announcements_id(&self) -> Result<Option<&ChatId>, ChatError> {
        let id = self
            .announcements
            .get_or_try_init(|| async {
                let values = self
                    .config
                    .get_by_key(ANNOUNCEMENTS_CHANNEL_KEY, &self.conference_id)
                    .await
                    .map_err(ChatError::storage)?;
                Ok::<_, ChatError>(values.into_iter().next().map(ChatId))
            })
            .await?;
        Ok(id.as_ref())
    }

    pub async fn describe(
        &self,
        channel: &ProviderChannel,
        presence: &ProviderService,
    ) -> Result<ChatDescriptor, ChatError> {
        let is_announcements = self
            .announcements_id()
            .await?
            .is_some_and(|id| id == channel.id());
        let attributes = channel.attributes().await?;
        let is_private = channel.is_private().await?;
        let friendly_name = channel.friendly_name().await?;

        let mut category = classify(&attributes, is_private);
        if let ChatCategory::DirectMessage { member1, member2 } = &mut category {
            let (online1, online2) = tokio::join!(
                is_online(presence, &member1.profile_id),
                is_online(presence, &member2.profile_id),
            );
            member1.is_online = online1;
            member2.is_online = online2;
        }

        Ok(ChatDescriptor {
            id: channel.id().clone(),
            friendly_name,
            auto_watch_enabled: attributes.auto_watch,
            is_announcements,
            category,
            creator: attributes.creator,
            created_at: attributes.created_at,
        })
    }

    /// Any failed lookup yields `None`; no partial descriptor is produced.
    pub async fn convert(
        &self,
        channel: &ProviderChannel,
        presence: &ProviderService,
    ) -> Option<ChatDescriptor> {
        match self.describe(channel, presence).await {
            Ok(descriptor) => Some(descriptor),
            Err(err) => {
                debug!(chat_id = %channel.id(), error = %err, "chat: channel not describable");
                None
            }
        }
    }

    pub async fn convert_all(
        &self,
        channels: &[ProviderChannel],
        presence: &ProviderService,
    ) -> Vec<ChatDescriptor> {
        join_all(channels.iter().map(|channel| self.convert(channel, presence)))
            .await
            .into_iter()
            .flatten()
            .collect()
    }
}

/// A failed presence lookup does not fail the descriptor; presence is just unknown.
async fn is_online(presence: &ProviderService, profile_id: &ProfileId) -> Option<bool> {
    match presence.get_is_user_online(profile_id).await {
        Ok(is_online) => is_online,
        Err(err) => {
            debug!(profile_id = %profile_id, error = %err, "chat: DM member presence unavailable");
            None
        }
    }
}

#[cfg(test)]
#[path = "tests/descriptor_tests.rs"]
mod tests;
