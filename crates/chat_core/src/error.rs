use provider_integration::ProviderError;
use shared::domain::{ChatId, ConferenceId};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ChatError {
    #[error("chat token unavailable: {0}")]
    TokenUnavailable(String),
    #[error("chat provider connection failed: {0}")]
    ConnectionFailed(String),
    #[error("chat service is not connected")]
    NotReady,
    #[error("chat {0} not found")]
    ChannelNotFound(ChatId),
    #[error("permission denied: {0}")]
    PermissionDenied(String),
    #[error("mirror backend unavailable: {0}")]
    MirrorUnavailable(String),
    #[error("chat {0} is not a moderation chat")]
    NotAModerationChat(ChatId),
    #[error("conference {0} already has a moderation hub")]
    ModerationHubExists(ConferenceId),
    #[error("another conference or profile already owns the chat session")]
    SessionConflict,
    #[error("chat provider error: {0}")]
    Provider(String),
    #[error("chat storage error: {0}")]
    Storage(String),
}

impl ChatError {
    pub(crate) fn storage(err: anyhow::Error) -> Self {
        ChatError::Storage(format!("{err:#}"))
    }

    /// Maps a failure on a channel-scoped call, so that a missing channel names its id.
    pub(crate) fn for_channel(chat_id: &ChatId, err: ProviderError) -> Self {
        match err {
            ProviderError::NotFound(what) if what.starts_with("channel") => {
                ChatError::ChannelNotFound(chat_id.clone())
            }
            other => other.into(),
        }
    }
}

impl From<ProviderError> for ChatError {
    fn from(err: ProviderError) -> Self {
        match err {
            ProviderError::PermissionDenied(message) => ChatError::PermissionDenied(message),
            ProviderError::Disconnected => ChatError::NotReady,
            other => ChatError::Provider(other.to_string()),
        }
    }
}
