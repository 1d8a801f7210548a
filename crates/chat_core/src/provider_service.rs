use std::sync::Arc;

use chrono::Utc;
use provider_integration::{
    ChatProviderConnector, CreateChannelOptions, ProviderClient, ProviderError,
};
use shared::{
    domain::{ChatId, ChatMode, ConferenceId, ProfileId},
    protocol::ServiceEvent,
};
use storage::{InsertOutcome, StoredTextChat};
use tokio::sync::{broadcast, RwLock};
use tracing::{info, warn};

use crate::{
    error::ChatError,
    provider_channel::ProviderChannel,
    store::ChannelRecordStore,
    token::{SessionCredential, TokenProvider},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceState {
    Uninitialized,
    Connecting,
    Connected,
    TearingDown,
}

/// What kind of channel to create and how to classify it.
#[derive(Debug, Clone)]
pub struct NewChannel {
    pub title: String,
    pub is_private: bool,
    pub invite: Vec<ProfileId>,
    pub mode: ChatMode,
    pub dm_members: Option<(ProfileId, ProfileId)>,
    pub related_moderation_key: Option<String>,
}

struct ServiceInner {
    state: ServiceState,
    client: Option<Arc<dyn ProviderClient>>,
    conference_id: Option<ConferenceId>,
}

pub struct ProviderService {
    connector: Arc<dyn ChatProviderConnector>,
    tokens: Arc<TokenProvider>,
    records: Arc<dyn ChannelRecordStore>,
    inner: RwLock<ServiceInner>,
}

impl ProviderService {
    pub fn new(
        connector: Arc<dyn ChatProviderConnector>,
        tokens: Arc<TokenProvider>,
        records: Arc<dyn ChannelRecordStore>,
    ) -> Self {
        Self {
            connector,
            tokens,
            records,
            inner: RwLock::new(ServiceInner {
                state: ServiceState::Uninitialized,
                client: None,
                conference_id: None,
            }),
        }
    }

    pub async fn state(&self) -> ServiceState {
        self.inner.read().await.state
    }

    pub async fn setup(
        &self,
        conference_id: &ConferenceId,
        profile_id: &ProfileId,
        session: &SessionCredential,
    ) -> Result<(), ChatError> {
        {
            let mut inner = self.inner.write().await;
            match inner.state {
                ServiceState::Connected => return Ok(()),
                ServiceState::Connecting | ServiceState::TearingDown => {
                    return Err(ChatError::NotReady)
                }
                ServiceState::Uninitialized => inner.state = ServiceState::Connecting,
            }
        }

        let result = self.connect(conference_id, profile_id, session).await;

        let mut inner = self.inner.write().await;
        match result {
            Ok(client) => {
                inner.state = ServiceState::Connected;
                inner.client = Some(client);
                inner.conference_id = Some(conference_id.clone());
                info!(conference_id = %conference_id, profile_id = %profile_id, "chat: provider connected");
                Ok(())
            }
            Err(err) => {
                inner.state = ServiceState::Uninitialized;
                Err(err)
            }
        }
    }

    /// Connects with the current token; a token rejection buys exactly one retry
    /// with a freshly fetched token.
    async fn connect(
        &self,
        conference_id: &ConferenceId,
        profile_id: &ProfileId,
        session: &SessionCredential,
    ) -> Result<Arc<dyn ProviderClient>, ChatError> {
        let token = self
            .tokens
            .get_token(conference_id, profile_id, session)
            .await?;
        match self.connector.connect(&token.token).await {
            Ok(client) => return Ok(client),
            Err(err) if err.is_token_rejection() => {
                warn!(conference_id = %conference_id, attempt = 1, error = %err, "chat: provider rejected token, refreshing");
            }
            Err(err) => return Err(ChatError::ConnectionFailed(err.to_string())),
        }

        let token = self
            .tokens
            .refresh_token(conference_id, profile_id, session)
            .await?;
        self.connector.connect(&token.token).await.map_err(|err| {
            warn!(conference_id = %conference_id, attempt = 2, error = %err, "chat: provider connection failed after token refresh");
            ChatError::ConnectionFailed(err.to_string())
        })
    }

    /// Shuts the client down; a service that never connected has nothing to release.
    pub async fn teardown(&self) -> Result<(), ChatError> {
        let client = {
            let mut inner = self.inner.write().await;
            if inner.state != ServiceState::Connected {
                return Ok(());
            }
            inner.state = ServiceState::TearingDown;
            inner.client.take()
        };

        let result = match client {
            Some(client) => client.shutdown().await.map_err(ChatError::from),
            None => Ok(()),
        };

        let mut inner = self.inner.write().await;
        inner.state = ServiceState::Uninitialized;
        inner.conference_id = None;
        info!("chat: provider torn down");
        result
    }

    async fn connected(&self) -> Result<(Arc<dyn ProviderClient>, ConferenceId), ChatError> {
        let inner = self.inner.read().await;
        match (&inner.state, &inner.client, &inner.conference_id) {
            (ServiceState::Connected, Some(client), Some(conference_id)) => {
                Ok((Arc::clone(client), conference_id.clone()))
            }
            _ => Err(ChatError::NotReady),
        }
    }

    fn wrap(&self, remote: Arc<dyn provider_integration::RemoteChannel>) -> ProviderChannel {
        ProviderChannel::new(remote, Arc::clone(&self.records))
    }

    pub async fn get_channel(&self, chat_id: &ChatId) -> Result<ProviderChannel, ChatError> {
        let (client, _) = self.connected().await?;
        let remote = client.get_channel(chat_id).await.map_err(|err| match err {
            ProviderError::NotFound(_) => ChatError::ChannelNotFound(chat_id.clone()),
            other => other.into(),
        })?;
        Ok(self.wrap(remote))
    }

    /// Every channel visible to the connected identity.
    pub async fn all_channels(&self) -> Result<Vec<ProviderChannel>, ChatError> {
        let (client, _) = self.connected().await?;
        let remotes = client.all_channels().await?;
        Ok(remotes.into_iter().map(|remote| self.wrap(remote)).collect())
    }

    /// Channels the connected identity has joined.
    pub async fn active_channels(&self) -> Result<Vec<ProviderChannel>, ChatError> {
        let (client, _) = self.connected().await?;
        let remotes = client.subscribed_channels().await?;
        Ok(remotes.into_iter().map(|remote| self.wrap(remote)).collect())
    }

    /// Creates the provider channel and its classification record. A record that
    /// cannot be written takes the channel down with it.
    pub async fn create_channel(&self, request: NewChannel) -> Result<ProviderChannel, ChatError> {
        let (client, conference_id) = self.connected().await?;
        let creator = client.identity().clone();
        let remote = client
            .create_channel(CreateChannelOptions {
                friendly_name: request.title.clone(),
                is_private: request.is_private,
                invite: request.invite.clone(),
            })
            .await?;
        let chat_id = remote.chat_id().clone();

        let (dm_member1, dm_member2) = match request.dm_members {
            Some((member1, member2)) => (Some(member1), Some(member2)),
            None => (None, None),
        };
        let record = StoredTextChat {
            chat_id: chat_id.clone(),
            conference_id: conference_id.clone(),
            name: request.title,
            mode: request.mode,
            is_private: request.is_private,
            auto_watch: false,
            creator_id: creator,
            created_at: Utc::now(),
            dm_member1,
            dm_member2,
            moderation_completed: false,
            related_moderation_key: request.related_moderation_key,
        };

        let failure = match self.records.insert_record(&record).await {
            Ok(InsertOutcome::Inserted) => return Ok(self.wrap(remote)),
            Ok(InsertOutcome::Conflict) if request.mode == ChatMode::ModerationHub => {
                ChatError::ModerationHubExists(conference_id)
            }
            Ok(InsertOutcome::Conflict) => {
                ChatError::Storage(format!("record for chat {chat_id} already exists"))
            }
            Err(err) => ChatError::storage(err),
        };

        warn!(chat_id = %chat_id, error = %failure, "chat: rolling back channel without a record");
        if let Err(err) = remote.delete().await {
            warn!(chat_id = %chat_id, error = %err, "chat: rollback of provider channel failed");
        }
        Err(failure)
    }

    /// A private channel holding the creator and the given moderators.
    pub async fn create_moderation_channel(
        &self,
        moderators: &[ProfileId],
        related_moderation_key: Option<String>,
    ) -> Result<ProviderChannel, ChatError> {
        let title = match &related_moderation_key {
            Some(key) => format!("Moderation: {key}"),
            None => "Moderation".to_string(),
        };
        self.create_channel(NewChannel {
            title,
            is_private: true,
            invite: moderators.to_vec(),
            mode: ChatMode::Moderation,
            dm_members: None,
            related_moderation_key,
        })
        .await
    }

    /// `Ok(None)` when the provider cannot say whether the user is online.
    pub async fn get_is_user_online(
        &self,
        profile_id: &ProfileId,
    ) -> Result<Option<bool>, ChatError> {
        let (client, _) = self.connected().await?;
        match client.user_presence(profile_id).await {
            Ok(presence) => Ok(presence),
            Err(ProviderError::NotFound(_)) => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    pub async fn subscribe_events(&self) -> Result<broadcast::Receiver<ServiceEvent>, ChatError> {
        let (client, _) = self.connected().await?;
        Ok(client.subscribe_events())
    }
}

#[cfg(test)]
#[path = "tests/provider_service_tests.rs"]
mod tests;
