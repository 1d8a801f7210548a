use std::sync::Arc;

use chrono::{DateTime, Utc};
use provider_integration::{MessagePage, RemoteChannel};
use shared::{
    domain::{ChatId, ChatMode, MessageId, ProfileId},
    protocol::{ChannelEvent, ChatMessage},
};
use storage::StoredTextChat;
use tokio::sync::broadcast;

use crate::{error::ChatError, store::ChannelRecordStore};

/// Category-defining attributes of a channel, read from its classification record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelAttributes {
    pub is_moderation_hub: bool,
    pub is_moderation: bool,
    pub moderation_completed: bool,
    pub related_moderation_key: Option<String>,
    /// Present only when both member columns are set.
    pub dm_members: Option<(ProfileId, ProfileId)>,
    pub auto_watch: bool,
    pub creator: ProfileId,
    pub created_at: DateTime<Utc>,
}

impl From<StoredTextChat> for ChannelAttributes {
    fn from(record: StoredTextChat) -> Self {
        let dm_members = match (record.dm_member1, record.dm_member2) {
            (Some(member1), Some(member2)) => Some((member1, member2)),
            _ => None,
        };
        Self {
            is_moderation_hub: record.mode == ChatMode::ModerationHub,
            is_moderation: record.mode == ChatMode::Moderation,
            moderation_completed: record.moderation_completed,
            related_moderation_key: record.related_moderation_key,
            dm_members,
            auto_watch: record.auto_watch,
            creator: record.creator_id,
            created_at: record.created_at,
        }
    }
}

/// One remote provider channel paired with its classification record.
#[derive(Clone)]
pub struct ProviderChannel {
    remote: Arc<dyn RemoteChannel>,
    records: Arc<dyn ChannelRecordStore>,
}

impl ProviderChannel {
    pub fn new(remote: Arc<dyn RemoteChannel>, records: Arc<dyn ChannelRecordStore>) -> Self {
        Self { remote, records }
    }

    pub fn id(&self) -> &ChatId {
        self.remote.chat_id()
    }

    fn map_err(&self, err: provider_integration::ProviderError) -> ChatError {
        ChatError::for_channel(self.id(), err)
    }

    /// Fails when the channel has no classification record.
    pub async fn attributes(&self) -> Result<ChannelAttributes, ChatError> {
        self.records
            .record(self.id())
            .await
            .map_err(ChatError::storage)?
            .map(ChannelAttributes::from)
            .ok_or_else(|| ChatError::ChannelNotFound(self.id().clone()))
    }

    pub async fn friendly_name(&self) -> Result<String, ChatError> {
        self.remote.friendly_name().await.map_err(|e| self.map_err(e))
    }

    pub async fn is_private(&self) -> Result<bool, ChatError> {
        self.remote.is_private().await.map_err(|e| self.map_err(e))
    }

    pub async fn members(&self) -> Result<Vec<ProfileId>, ChatError> {
        self.remote.members().await.map_err(|e| self.map_err(e))
    }

    pub async fn members_count(&self) -> Result<usize, ChatError> {
        self.remote.members_count().await.map_err(|e| self.map_err(e))
    }

    pub async fn add_members(&self, profile_ids: &[ProfileId]) -> Result<(), ChatError> {
        self.remote
            .add_members(profile_ids)
            .await
            .map_err(|e| self.map_err(e))
    }

    pub async fn send_message(&self, body: &str) -> Result<ChatMessage, ChatError> {
        self.remote
            .send_message(body)
            .await
            .map_err(|e| self.map_err(e))
    }

    pub async fn get_message(
        &self,
        message_id: &MessageId,
        index: u64,
    ) -> Result<ChatMessage, ChatError> {
        self.remote
            .get_message(message_id, index)
            .await
            .map_err(|e| self.map_err(e))
    }

    pub async fn messages_page(
        &self,
        page_size: usize,
        before_index: Option<u64>,
    ) -> Result<MessagePage, ChatError> {
        self.remote
            .messages_page(page_size, before_index)
            .await
            .map_err(|e| self.map_err(e))
    }

    pub async fn add_reaction(&self, message_id: &MessageId, reaction: &str) -> Result<(), ChatError> {
        self.remote
            .add_reaction(message_id, reaction)
            .await
            .map_err(|e| self.map_err(e))
    }

    pub async fn remove_reaction(
        &self,
        message_id: &MessageId,
        reaction: &str,
    ) -> Result<(), ChatError> {
        self.remote
            .remove_reaction(message_id, reaction)
            .await
            .map_err(|e| self.map_err(e))
    }

    pub async fn last_read_index(&self) -> Result<Option<u64>, ChatError> {
        self.remote.last_read_index().await.map_err(|e| self.map_err(e))
    }

    pub async fn set_last_read_index(&self, index: Option<u64>) -> Result<(), ChatError> {
        self.remote
            .set_last_read_index(index)
            .await
            .map_err(|e| self.map_err(e))
    }

    /// Only moderation chats can be completed; any other record is left untouched.
    pub async fn mark_completed(&self) -> Result<(), ChatError> {
        if !self.attributes().await?.is_moderation {
            return Err(ChatError::NotAModerationChat(self.id().clone()));
        }
        let updated = self
            .records
            .set_moderation_completed(self.id(), true)
            .await
            .map_err(ChatError::storage)?;
        if updated {
            Ok(())
        } else {
            Err(ChatError::ChannelNotFound(self.id().clone()))
        }
    }

    pub async fn set_auto_watch(&self, enabled: bool) -> Result<(), ChatError> {
        let updated = self
            .records
            .set_auto_watch(self.id(), enabled)
            .await
            .map_err(ChatError::storage)?;
        if updated {
            Ok(())
        } else {
            Err(ChatError::ChannelNotFound(self.id().clone()))
        }
    }

    /// Removes the provider channel, then its classification record.
    pub async fn delete(&self) -> Result<(), ChatError> {
        self.remote.delete().await.map_err(|e| self.map_err(e))?;
        self.records
            .delete_record(self.id())
            .await
            .map_err(ChatError::storage)
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<ChannelEvent> {
        self.remote.subscribe_events()
    }
}
