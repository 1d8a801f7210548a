use std::{collections::HashMap, sync::Arc};

use futures::{future::join_all, stream, Stream};
use provider_integration::ChatProviderConnector;
use serde::{Deserialize, Serialize};
use shared::{
    domain::{ChatId, ChatMode, ConferenceId, MessageId, ProfileId},
    protocol::{ChannelEventKind, ChatMessage, ServiceEventKind},
};
use storage::Storage;
use tracing::{info, warn};

use crate::{
    config::Settings,
    descriptor::{ChatDescriptor, DescriptorConverter, MemberDescriptor},
    error::ChatError,
    events::{ChannelListener, ServiceListener, Subscription, SubscriptionRegistry},
    mirror::{MirrorService, MirrorStatus},
    provider_channel::ProviderChannel,
    provider_service::{NewChannel, ProviderService, ServiceState},
    single_flight::SingleFlight,
    store::{ChannelRecordStore, ConferenceConfigStore, CredentialCache, MirrorBackend},
    supersede::Supersede,
    token::{SessionCredential, TokenBackend, TokenProvider},
};

/// External collaborators a session is built from.
#[derive(Clone)]
pub struct ChatBackends {
    pub connector: Arc<dyn ChatProviderConnector>,
    pub token_backend: Arc<dyn TokenBackend>,
    pub credentials: Arc<dyn CredentialCache>,
    pub config: Arc<dyn ConferenceConfigStore>,
    pub records: Arc<dyn ChannelRecordStore>,
    pub mirror: Option<Arc<dyn MirrorBackend>>,
}

impl ChatBackends {
    /// Every persistence seam served by one SQLite store.
    pub fn with_storage(
        storage: Storage,
        connector: Arc<dyn ChatProviderConnector>,
        token_backend: Arc<dyn TokenBackend>,
    ) -> Self {
        let storage = Arc::new(storage);
        Self {
            connector,
            token_backend,
            credentials: storage.clone(),
            config: storage.clone(),
            records: storage.clone(),
            mirror: Some(storage),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ChatOptions {
    pub message_page_size: usize,
    pub token_endpoint: Option<String>,
}

impl Default for ChatOptions {
    fn default() -> Self {
        Self::from(&Settings::default())
    }
}

impl From<&Settings> for ChatOptions {
    fn from(settings: &Settings) -> Self {
        Self {
            message_page_size: settings.message_page_size.max(1),
            token_endpoint: settings.token_endpoint.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SetupOutcome {
    pub mirror: MirrorStatus,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReactionAck {
    pub chat_id: ChatId,
    pub message_id: MessageId,
    pub reaction: String,
}

enum PagerCursor {
    Newest,
    Before(u64),
    Exhausted,
}

/// Walks a chat's history from the newest message backwards, one page at a time.
pub struct MessagePager {
    channel: ProviderChannel,
    page_size: usize,
    cursor: PagerCursor,
}

impl MessagePager {
    fn new(channel: ProviderChannel, page_size: usize) -> Self {
        Self {
            channel,
            page_size: page_size.max(1),
            cursor: PagerCursor::Newest,
        }
    }

    pub fn chat_id(&self) -> &ChatId {
        self.channel.id()
    }

    /// Next older page, oldest message first; `None` once history is exhausted.
    pub async fn next_page(&mut self) -> Result<Option<Vec<ChatMessage>>, ChatError> {
        let before = match self.cursor {
            PagerCursor::Newest => None,
            PagerCursor::Before(index) => Some(index),
            PagerCursor::Exhausted => return Ok(None),
        };
        let page = self.channel.messages_page(self.page_size, before).await?;
        self.cursor = match page.messages.first() {
            Some(oldest) if page.has_prior => PagerCursor::Before(oldest.index),
            _ => PagerCursor::Exhausted,
        };
        if page.messages.is_empty() {
            return Ok(None);
        }
        Ok(Some(page.messages))
    }

    pub fn restart(&mut self) {
        self.cursor = PagerCursor::Newest;
    }

    /// Yields pages until history is exhausted; an error ends the stream after it is yielded.
    pub fn into_stream(self) -> impl Stream<Item = Result<Vec<ChatMessage>, ChatError>> + Send {
        stream::unfold(self, |mut pager| async move {
            match pager.next_page().await {
                Ok(Some(page)) => Some((Ok(page), pager)),
                Ok(None) => None,
                Err(err) => {
                    pager.cursor = PagerCursor::Exhausted;
                    Some((Err(err), pager))
                }
            }
        })
    }
}

/// Single entry point for chat operations of one logged-in session.
pub struct ChatSessionManager {
    conference_id: ConferenceId,
    profile_id: ProfileId,
    session: SessionCredential,
    options: ChatOptions,
    records: Arc<dyn ChannelRecordStore>,
    provider: ProviderService,
    mirror: MirrorService,
    descriptors: DescriptorConverter,
    setup_flight: SingleFlight<Result<SetupOutcome, ChatError>>,
    teardown_flight: SingleFlight<Result<(), ChatError>>,
    subscriptions: Arc<SubscriptionRegistry>,
    presence: Supersede,
}

impl ChatSessionManager {
    pub fn new(
        conference_id: ConferenceId,
        profile_id: ProfileId,
        session: SessionCredential,
        backends: ChatBackends,
        options: ChatOptions,
    ) -> Arc<Self> {
        let tokens = Arc::new(TokenProvider::new(
            backends.token_backend,
            backends.credentials,
            Arc::clone(&backends.config),
            options.token_endpoint.clone(),
        ));
        Arc::new(Self {
            provider: ProviderService::new(
                backends.connector,
                tokens,
                Arc::clone(&backends.records),
            ),
            mirror: MirrorService::new(conference_id.clone(), backends.mirror),
            descriptors: DescriptorConverter::new(conference_id.clone(), backends.config),
            records: backends.records,
            conference_id,
            profile_id,
            session,
            options,
            setup_flight: SingleFlight::new(),
            teardown_flight: SingleFlight::new(),
            subscriptions: Arc::new(SubscriptionRegistry::default()),
            presence: Supersede::default(),
        })
    }

    pub fn conference_id(&self) -> &ConferenceId {
        &self.conference_id
    }

    pub fn profile_id(&self) -> &ProfileId {
        &self.profile_id
    }

    pub async fn connection_state(&self) -> ServiceState {
        self.provider.state().await
    }

    pub fn active_subscriptions(&self) -> usize {
        self.subscriptions.active()
    }

    /// Connects the provider (required) and the mirror (best-effort). Concurrent
    /// calls share one initialization; a pending teardown finishes first.
    pub async fn setup(self: &Arc<Self>) -> Result<SetupOutcome, ChatError> {
        if let Some(teardown) = self.teardown_flight.in_flight() {
            let _ = teardown.await;
        }
        let manager = Arc::clone(self);
        self.setup_flight
            .run(move || async move { manager.run_setup().await })
            .await
    }

    async fn run_setup(&self) -> Result<SetupOutcome, ChatError> {
        if self.provider.state().await == ServiceState::Connected {
            return Ok(SetupOutcome {
                mirror: self.mirror.status(),
            });
        }

        info!(conference_id = %self.conference_id, profile_id = %self.profile_id, "chat: setting up session");
        self.provider
            .setup(&self.conference_id, &self.profile_id, &self.session)
            .await?;
        let mirror = self.mirror.setup().await;
        if let MirrorStatus::Failed(err) = &mirror {
            warn!(conference_id = %self.conference_id, error = %err, "chat: continuing without mirror until its backend recovers");
        }
        Ok(SetupOutcome { mirror })
    }

    /// Waits for any pending setup, then releases both services. Concurrent calls
    /// share one teardown.
    pub async fn teardown(self: &Arc<Self>) -> Result<(), ChatError> {
        let manager = Arc::clone(self);
        self.teardown_flight
            .run(move || async move { manager.run_teardown().await })
            .await
    }

    async fn run_teardown(&self) -> Result<(), ChatError> {
        if let Some(setup) = self.setup_flight.in_flight() {
            if let Err(err) = setup.await {
                info!(error = %err, "chat: tearing down after failed setup");
            }
        }
        self.subscriptions.clear();
        self.presence.cancel();
        self.mirror.teardown();
        self.provider.teardown().await
    }

    async fn describe_required(&self, channel: &ProviderChannel) -> Result<ChatDescriptor, ChatError> {
        let descriptor = self.descriptors.describe(channel, &self.provider).await?;
        let _ = self.mirror.sync_channel(&descriptor).await;
        Ok(descriptor)
    }

    async fn list_from(
        &self,
        channels: Result<Vec<ProviderChannel>, ChatError>,
        keep: impl Fn(&ChatDescriptor) -> bool,
    ) -> Vec<ChatDescriptor> {
        match channels {
            Ok(channels) => self
                .descriptors
                .convert_all(&channels, &self.provider)
                .await
                .into_iter()
                .filter(|descriptor| keep(descriptor))
                .collect(),
            Err(err) => {
                warn!(conference_id = %self.conference_id, error = %err, "chat: listing chats failed");
                Vec::new()
            }
        }
    }

    fn is_plain_chat(descriptor: &ChatDescriptor) -> bool {
        !descriptor.is_moderation() && !descriptor.is_moderation_hub()
    }

    pub async fn list_all_chats(&self) -> Vec<ChatDescriptor> {
        self.list_from(self.provider.all_channels().await, Self::is_plain_chat)
            .await
    }

    pub async fn list_watched_chats(&self) -> Vec<ChatDescriptor> {
        self.list_from(self.provider.active_channels().await, Self::is_plain_chat)
            .await
    }

    pub async fn list_all_moderation_chats(&self) -> Vec<ChatDescriptor> {
        self.list_from(
            self.provider.all_channels().await,
            ChatDescriptor::is_moderation,
        )
        .await
    }

    pub async fn list_all_watched_moderation_chats(&self) -> Vec<ChatDescriptor> {
        self.list_from(
            self.provider.active_channels().await,
            ChatDescriptor::is_moderation,
        )
        .await
    }

    pub async fn list_watched_chats_unfiltered(&self) -> Vec<ChatDescriptor> {
        self.list_from(self.provider.active_channels().await, |_| true)
            .await
    }

    pub async fn get_chat(&self, chat_id: &ChatId) -> Option<ChatDescriptor> {
        let channel = self.channel_or_log(chat_id).await?;
        self.descriptors.convert(&channel, &self.provider).await
    }

    async fn channel_or_log(&self, chat_id: &ChatId) -> Option<ProviderChannel> {
        match self.provider.get_channel(chat_id).await {
            Ok(channel) => Some(channel),
            Err(err) => {
                warn!(chat_id = %chat_id, error = %err, "chat: channel lookup failed");
                None
            }
        }
    }

    /// A private chat with exactly one invitee besides the creator is a direct message.
    pub async fn create_chat(
        &self,
        members: &[ProfileId],
        is_private: bool,
        title: &str,
    ) -> Result<ChatDescriptor, ChatError> {
        let mut invite: Vec<ProfileId> = members
            .iter()
            .filter(|member| **member != self.profile_id)
            .cloned()
            .collect();
        invite.sort();
        invite.dedup();

        let dm_members = match invite.as_slice() {
            [other] if is_private => Some((self.profile_id.clone(), other.clone())),
            _ => None,
        };
        let mode = if dm_members.is_some() {
            ChatMode::DirectMessage
        } else {
            ChatMode::General
        };

        let channel = self
            .provider
            .create_channel(NewChannel {
                title: title.to_string(),
                is_private,
                invite,
                mode,
                dm_members,
                related_moderation_key: None,
            })
            .await?;
        info!(chat_id = %channel.id(), ?mode, "chat: created chat");
        self.describe_required(&channel).await
    }

    /// Best-effort: failures are logged and swallowed.
    pub async fn delete_chat(&self, chat_id: &ChatId) {
        let Some(channel) = self.channel_or_log(chat_id).await else {
            return;
        };
        if let Err(err) = channel.delete().await {
            warn!(chat_id = %chat_id, error = %err, "chat: delete failed");
            return;
        }
        let _ = self.mirror.remove_channel(chat_id).await;
        info!(chat_id = %chat_id, "chat: deleted chat");
    }

    pub async fn create_moderation_chat(
        &self,
        specific_moderators: &[ProfileId],
        related_moderation_key: Option<String>,
        initial_message: Option<&str>,
    ) -> Result<ChatDescriptor, ChatError> {
        let channel = self
            .provider
            .create_moderation_channel(specific_moderators, related_moderation_key)
            .await?;
        if let Some(body) = initial_message {
            let message = channel.send_message(body).await?;
            let _ = self.mirror.sync_message(&message).await;
        }
        info!(chat_id = %channel.id(), "chat: created moderation chat");
        self.describe_required(&channel).await
    }

    /// At most one hub exists per conference; a second one is refused.
    pub async fn create_moderation_hub_chat(&self, title: &str) -> Result<ChatDescriptor, ChatError> {
        let existing = self
            .records
            .record_by_mode(&self.conference_id, ChatMode::ModerationHub)
            .await
            .map_err(ChatError::storage)?;
        if existing.is_some() {
            return Err(ChatError::ModerationHubExists(self.conference_id.clone()));
        }

        let channel = self
            .provider
            .create_channel(NewChannel {
                title: title.to_string(),
                is_private: true,
                invite: Vec::new(),
                mode: ChatMode::ModerationHub,
                dm_members: None,
                related_moderation_key: None,
            })
            .await?;
        info!(chat_id = %channel.id(), "chat: created moderation hub");
        self.describe_required(&channel).await
    }

    pub async fn mark_moderation_chat_completed(&self, chat_id: &ChatId) -> Result<(), ChatError> {
        let channel = self.provider.get_channel(chat_id).await?;
        channel.mark_completed().await?;
        if let Some(descriptor) = self.descriptors.convert(&channel, &self.provider).await {
            let _ = self.mirror.sync_channel(&descriptor).await;
        }
        Ok(())
    }

    pub async fn get_moderation_hub_chat_id(&self) -> Option<ChatId> {
        let record = match self
            .records
            .record_by_mode(&self.conference_id, ChatMode::ModerationHub)
            .await
        {
            Ok(record) => record?,
            Err(err) => {
                warn!(conference_id = %self.conference_id, error = %format!("{err:#}"), "chat: moderation hub lookup failed");
                return None;
            }
        };
        let channel = self.channel_or_log(&record.chat_id).await?;
        Some(channel.id().clone())
    }

    pub async fn get_moderation_hub_chat(&self) -> Option<ChatDescriptor> {
        let chat_id = self.get_moderation_hub_chat_id().await?;
        self.get_chat(&chat_id).await
    }

    /// Permission failures surface as [`ChatError::PermissionDenied`].
    pub async fn send_message(&self, chat_id: &ChatId, body: &str) -> Result<ChatMessage, ChatError> {
        let channel = self.provider.get_channel(chat_id).await?;
        let message = channel.send_message(body).await?;
        let _ = self.mirror.sync_message(&message).await;
        Ok(message)
    }

    pub async fn get_message(
        &self,
        chat_id: &ChatId,
        message_id: &MessageId,
        index: u64,
    ) -> Option<ChatMessage> {
        let channel = self.channel_or_log(chat_id).await?;
        channel.get_message(message_id, index).await.ok()
    }

    /// Pager over the chat's history; `page_size` falls back to the configured default.
    pub async fn get_messages(
        &self,
        chat_id: &ChatId,
        page_size: Option<usize>,
    ) -> Option<MessagePager> {
        let channel = self.channel_or_log(chat_id).await?;
        Some(MessagePager::new(
            channel,
            page_size.unwrap_or(self.options.message_page_size),
        ))
    }

    pub async fn add_reaction(
        &self,
        chat_id: &ChatId,
        message_id: &MessageId,
        reaction: &str,
    ) -> Option<ReactionAck> {
        let channel = self.channel_or_log(chat_id).await?;
        match channel.add_reaction(message_id, reaction).await {
            Ok(()) => Some(ReactionAck {
                chat_id: chat_id.clone(),
                message_id: message_id.clone(),
                reaction: reaction.to_string(),
            }),
            Err(err) => {
                warn!(chat_id = %chat_id, message_id = %message_id, error = %err, "chat: add reaction failed");
                None
            }
        }
    }

    pub async fn remove_reaction(
        &self,
        chat_id: &ChatId,
        message_id: &MessageId,
        reaction: &str,
    ) -> Option<ReactionAck> {
        let channel = self.channel_or_log(chat_id).await?;
        match channel.remove_reaction(message_id, reaction).await {
            Ok(()) => Some(ReactionAck {
                chat_id: chat_id.clone(),
                message_id: message_id.clone(),
                reaction: reaction.to_string(),
            }),
            Err(err) => {
                warn!(chat_id = %chat_id, message_id = %message_id, error = %err, "chat: remove reaction failed");
                None
            }
        }
    }

    pub async fn list_chat_members(&self, chat_id: &ChatId) -> Vec<MemberDescriptor> {
        let Some(channel) = self.channel_or_log(chat_id).await else {
            return Vec::new();
        };
        let members = match channel.members().await {
            Ok(members) => members,
            Err(err) => {
                warn!(chat_id = %chat_id, error = %err, "chat: member listing failed");
                return Vec::new();
            }
        };
        join_all(members.into_iter().map(|profile_id| async move {
            let is_online = self.get_is_user_online(&profile_id).await;
            MemberDescriptor {
                profile_id,
                is_online,
            }
        }))
        .await
    }

    pub async fn get_chat_members_count(&self, chat_id: &ChatId) -> Option<usize> {
        let channel = self.channel_or_log(chat_id).await?;
        channel.members_count().await.ok()
    }

    pub async fn invite_users(&self, chat_id: &ChatId, profile_ids: &[ProfileId]) -> Result<(), ChatError> {
        let channel = self.provider.get_channel(chat_id).await?;
        channel.add_members(profile_ids).await
    }

    /// `None` when presence is unknown or the lookup failed.
    pub async fn get_is_user_online(&self, profile_id: &ProfileId) -> Option<bool> {
        match self.provider.get_is_user_online(profile_id).await {
            Ok(presence) => presence,
            Err(err) => {
                warn!(profile_id = %profile_id, error = %err, "chat: presence lookup failed");
                None
            }
        }
    }

    /// Batch presence lookup. A newer call supersedes this one, which then resolves
    /// to `None`. Users with unknown presence are left out.
    pub async fn online_statuses(&self, profile_ids: &[ProfileId]) -> Option<HashMap<ProfileId, bool>> {
        self.presence
            .run(async {
                let lookups = profile_ids.iter().map(|profile_id| async move {
                    (profile_id.clone(), self.get_is_user_online(profile_id).await)
                });
                join_all(lookups)
                    .await
                    .into_iter()
                    .filter_map(|(profile_id, online)| online.map(|online| (profile_id, online)))
                    .collect::<HashMap<_, _>>()
            })
            .await
    }

    pub async fn enable_auto_watch(&self, chat_id: &ChatId) -> Result<(), ChatError> {
        self.set_auto_watch(chat_id, true).await
    }

    pub async fn disable_auto_watch(&self, chat_id: &ChatId) -> Result<(), ChatError> {
        self.set_auto_watch(chat_id, false).await
    }

    async fn set_auto_watch(&self, chat_id: &ChatId, enabled: bool) -> Result<(), ChatError> {
        let channel = self.provider.get_channel(chat_id).await?;
        channel.set_auto_watch(enabled).await?;
        if let Some(descriptor) = self.descriptors.convert(&channel, &self.provider).await {
            let _ = self.mirror.sync_channel(&descriptor).await;
        }
        Ok(())
    }

    pub async fn get_last_read_index(&self, chat_id: &ChatId) -> Option<u64> {
        let channel = self.channel_or_log(chat_id).await?;
        channel.last_read_index().await.ok().flatten()
    }

    pub async fn set_last_read_index(&self, chat_id: &ChatId, index: Option<u64>) -> Result<(), ChatError> {
        let channel = self.provider.get_channel(chat_id).await?;
        channel.set_last_read_index(index).await
    }

    pub async fn channel_event_on(
        &self,
        chat_id: &ChatId,
        kind: ChannelEventKind,
        listener: ChannelListener,
    ) -> Result<Subscription, ChatError> {
        let channel = self.provider.get_channel(chat_id).await?;
        Ok(self
            .subscriptions
            .forward_channel_events(channel.subscribe_events(), kind, listener))
    }

    pub fn channel_event_off(&self, subscription: &Subscription) {
        subscription.unsubscribe();
    }

    pub async fn service_event_on(
        &self,
        kind: ServiceEventKind,
        listener: ServiceListener,
    ) -> Result<Subscription, ChatError> {
        let receiver = self.provider.subscribe_events().await?;
        Ok(self
            .subscriptions
            .forward_service_events(receiver, kind, listener))
    }

    pub fn service_event_off(&self, subscription: &Subscription) {
        subscription.unsubscribe();
    }
}

#[cfg(test)]
#[path = "tests/manager_tests.rs"]
mod tests;
