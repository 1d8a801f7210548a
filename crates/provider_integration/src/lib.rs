//! Seam between the chat core and a real-time chat provider SDK.
//!
//! The core only talks to [`ChatProviderConnector`], [`ProviderClient`] and
//! [`RemoteChannel`]; [`loopback`] is an in-process provider that implements them.

use std::sync::Arc;

use async_trait::async_trait;
use shared::{
    domain::{ChatId, MessageId, ProfileId},
    protocol::{ChannelEvent, ChatMessage, ServiceEvent},
};
use thiserror::Error;
use tokio::sync::broadcast;

pub mod loopback;
pub mod token;

pub use loopback::{LoopbackConfig, LoopbackProvider};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProviderError {
    #[error("access token expired")]
    TokenExpired,
    #[error("access token rejected: {0}")]
    TokenRejected(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("permission denied: {0}")]
    PermissionDenied(String),
    #[error("client is disconnected")]
    Disconnected,
    #[error("provider unavailable: {0}")]
    Unavailable(String),
}

impl ProviderError {
    /// True when a fresh token might let the same request succeed.
    pub fn is_token_rejection(&self) -> bool {
        matches!(self, ProviderError::TokenExpired | ProviderError::TokenRejected(_))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateChannelOptions {
    pub friendly_name: String,
    pub is_private: bool,
    /// Added as members besides the creating identity.
    pub invite: Vec<ProfileId>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessagePage {
    /// Oldest first.
    pub messages: Vec<ChatMessage>,
    pub has_prior: bool,
}

#[async_trait]
pub trait ChatProviderConnector: Send + Sync {
    async fn connect(&self, token: &str) -> Result<Arc<dyn ProviderClient>, ProviderError>;
}

#[async_trait]
pub trait ProviderClient: Send + Sync {
    fn identity(&self) -> &ProfileId;
    async fn create_channel(
        &self,
        options: CreateChannelOptions,
    ) -> Result<Arc<dyn RemoteChannel>, ProviderError>;
    async fn get_channel(&self, chat_id: &ChatId) -> Result<Arc<dyn RemoteChannel>, ProviderError>;
    /// Public channels plus every private channel the identity belongs to.
    async fn all_channels(&self) -> Result<Vec<Arc<dyn RemoteChannel>>, ProviderError>;
    /// Channels the identity has joined.
    async fn subscribed_channels(&self) -> Result<Vec<Arc<dyn RemoteChannel>>, ProviderError>;
    /// `Ok(None)` when the provider holds no presence information for the user.
    async fn user_presence(&self, profile_id: &ProfileId) -> Result<Option<bool>, ProviderError>;
    fn subscribe_events(&self) -> broadcast::Receiver<ServiceEvent>;
    async fn shutdown(&self) -> Result<(), ProviderError>;
}

#[async_trait]
pub trait RemoteChannel: Send + Sync {
    fn chat_id(&self) -> &ChatId;
    async fn friendly_name(&self) -> Result<String, ProviderError>;
    async fn is_private(&self) -> Result<bool, ProviderError>;
    async fn members(&self) -> Result<Vec<ProfileId>, ProviderError>;
    async fn members_count(&self) -> Result<usize, ProviderError>;
    async fn add_members(&self, profile_ids: &[ProfileId]) -> Result<(), ProviderError>;
    async fn send_message(&self, body: &str) -> Result<ChatMessage, ProviderError>;
    async fn get_message(
        &self,
        message_id: &MessageId,
        index: u64,
    ) -> Result<ChatMessage, ProviderError>;
    async fn messages_page(
        &self,
        page_size: usize,
        before_index: Option<u64>,
    ) -> Result<MessagePage, ProviderError>;
    async fn add_reaction(&self, message_id: &MessageId, reaction: &str)
        -> Result<(), ProviderError>;
    async fn remove_reaction(
        &self,
        message_id: &MessageId,
        reaction: &str,
    ) -> Result<(), ProviderError>;
    async fn last_read_index(&self) -> Result<Option<u64>, ProviderError>;
    async fn set_last_read_index(&self, index: Option<u64>) -> Result<(), ProviderError>;
    async fn delete(&self) -> Result<(), ProviderError>;
    /// The receiver closes once the channel is removed.
    fn subscribe_events(&self) -> broadcast::Receiver<ChannelEvent>;
}

pub struct MissingChatProvider;

#[async_trait]
impl ChatProviderConnector for MissingChatProvider {
    async fn connect(&self, _token: &str) -> Result<Arc<dyn ProviderClient>, ProviderError> {
        Err(ProviderError::Unavailable(
            "chat provider connector is not configured".into(),
        ))
    }
}
