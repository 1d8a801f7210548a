//! In-process chat provider.
//!
//! Holds every channel in memory, validates access tokens the same way a hosted
//! provider would, and enforces private-channel membership. Used by the CLI and by
//! tests across the workspace.

use std::{
    collections::{BTreeSet, HashMap},
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc, Mutex, MutexGuard, PoisonError,
    },
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use shared::{
    domain::{ChatId, ConferenceId, MessageId, ProfileId},
    protocol::{ChannelEvent, ChatMessage, ServiceEvent},
};
use tokio::sync::broadcast;
use tracing::{debug, info};

use crate::{
    token::{mint_access_token, validate_access_token},
    ChatProviderConnector, CreateChannelOptions, MessagePage, ProviderClient, ProviderError,
    RemoteChannel,
};

const EVENT_BUFFER: usize = 256;

#[derive(Debug, Clone)]
pub struct LoopbackConfig {
    pub signing_secret: String,
    pub ttl_seconds: i64,
}

impl Default for LoopbackConfig {
    fn default() -> Self {
        Self {
            signing_secret: "loopback-dev-secret".into(),
            ttl_seconds: 3600,
        }
    }
}

struct ChannelState {
    seq: u64,
    friendly_name: String,
    is_private: bool,
    created_by: ProfileId,
    members: BTreeSet<ProfileId>,
    messages: Vec<ChatMessage>,
    last_read: HashMap<ProfileId, u64>,
    events: broadcast::Sender<ChannelEvent>,
}

impl ChannelState {
    fn visible_to(&self, identity: &ProfileId) -> bool {
        !self.is_private || self.members.contains(identity)
    }

    fn emit(&self, event: ChannelEvent) {
        let _ = self.events.send(event);
    }
}

#[derive(Default)]
struct LoopbackState {
    next_seq: u64,
    channels: HashMap<ChatId, ChannelState>,
    presence: HashMap<ProfileId, Option<bool>>,
}

struct LoopbackShared {
    state: Mutex<LoopbackState>,
    service_events: broadcast::Sender<ServiceEvent>,
    shutdowns: AtomicUsize,
}

impl LoopbackShared {
    fn state(&self) -> MutexGuard<'_, LoopbackState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_presence(&self, profile_id: &ProfileId, is_online: Option<bool>) {
        self.state().presence.insert(profile_id.clone(), is_online);
        let _ = self.service_events.send(ServiceEvent::UserUpdated {
            profile_id: profile_id.clone(),
            is_online,
        });
    }
}

pub struct LoopbackProvider {
    config: LoopbackConfig,
    shared: Arc<LoopbackShared>,
    connect_attempts: AtomicUsize,
}

impl LoopbackProvider {
    pub fn new(config: LoopbackConfig) -> Arc<Self> {
        let (service_events, _) = broadcast::channel(EVENT_BUFFER);
        Arc::new(Self {
            config,
            shared: Arc::new(LoopbackShared {
                state: Mutex::new(LoopbackState::default()),
                service_events,
                shutdowns: AtomicUsize::new(0),
            }),
            connect_attempts: AtomicUsize::new(0),
        })
    }

    pub fn config(&self) -> &LoopbackConfig {
        &self.config
    }

    /// Issues an access token the way the hosted token endpoint would.
    pub fn mint_token(
        &self,
        identity: &ProfileId,
        conference_id: &ConferenceId,
    ) -> Result<(String, DateTime<Utc>), ProviderError> {
        mint_access_token(&self.config, identity, conference_id)
            .map_err(|err| ProviderError::Unavailable(format!("token signing failed: {err}")))
    }

    /// Makes a user known to presence tracking without connecting them.
    pub fn register_user(&self, profile_id: &ProfileId) {
        self.shared
            .state()
            .presence
            .entry(profile_id.clone())
            .or_insert(Some(false));
    }

    pub fn set_presence(&self, profile_id: &ProfileId, is_online: Option<bool>) {
        self.shared.set_presence(profile_id, is_online);
    }

    pub fn connect_attempts(&self) -> usize {
        self.connect_attempts.load(Ordering::SeqCst)
    }

    /// Number of client shutdowns, across every identity.
    pub fn shutdowns(&self) -> usize {
        self.shared.shutdowns.load(Ordering::SeqCst)
    }

    pub fn channel_count(&self) -> usize {
        self.shared.state().channels.len()
    }

    /// Emits a typing notification on behalf of `profile_id`.
    pub fn simulate_typing(&self, chat_id: &ChatId, profile_id: &ProfileId) {
        let state = self.shared.state();
        if let Some(channel) = state.channels.get(chat_id) {
            channel.emit(ChannelEvent::TypingStarted {
                chat_id: chat_id.clone(),
                profile_id: profile_id.clone(),
            });
        }
    }
}

#[async_trait]
impl ChatProviderConnector for LoopbackProvider {
    async fn connect(&self, token: &str) -> Result<Arc<dyn ProviderClient>, ProviderError> {
        let attempt = self.connect_attempts.fetch_add(1, Ordering::SeqCst) + 1;
        let claims = validate_access_token(&self.config, token)?;
        let identity = claims.identity();
        info!(
            identity = %identity,
            conference_id = %claims.conference_id(),
            attempt,
            "loopback: client connected"
        );
        self.shared.set_presence(&identity, Some(true));
        Ok(Arc::new(LoopbackClient {
            identity,
            shared: Arc::clone(&self.shared),
            connected: Arc::new(AtomicBool::new(true)),
        }))
    }
}

/// Cleared on shutdown; shared with every channel handle the client gave out.
fn ensure_connected(connected: &AtomicBool) -> Result<(), ProviderError> {
    if connected.load(Ordering::SeqCst) {
        Ok(())
    } else {
        Err(ProviderError::Disconnected)
    }
}

struct LoopbackClient {
    identity: ProfileId,
    shared: Arc<LoopbackShared>,
    connected: Arc<AtomicBool>,
}

impl LoopbackClient {
    fn handle(&self, chat_id: ChatId) -> Arc<dyn RemoteChannel> {
        Arc::new(LoopbackChannel {
            chat_id,
            identity: self.identity.clone(),
            shared: Arc::clone(&self.shared),
            connected: Arc::clone(&self.connected),
        })
    }

    fn handles_where(&self, keep: impl Fn(&ChannelState) -> bool) -> Vec<Arc<dyn RemoteChannel>> {
        let state = self.shared.state();
        let mut matching = state
            .channels
            .iter()
            .filter(|(_, channel)| keep(channel))
            .map(|(id, channel)| (channel.seq, id.clone()))
            .collect::<Vec<_>>();
        drop(state);
        matching.sort();
        matching
            .into_iter()
            .map(|(_, id)| self.handle(id))
            .collect()
    }
}

#[async_trait]
impl ProviderClient for LoopbackClient {
    fn identity(&self) -> &ProfileId {
        &self.identity
    }

    async fn create_channel(
        &self,
        options: CreateChannelOptions,
    ) -> Result<Arc<dyn RemoteChannel>, ProviderError> {
        ensure_connected(&self.connected)?;
        let chat_id = ChatId::generate();
        let (events, _) = broadcast::channel(EVENT_BUFFER);
        let mut members = BTreeSet::new();
        members.insert(self.identity.clone());
        members.extend(options.invite.iter().cloned());

        {
            let mut state = self.shared.state();
            state.next_seq += 1;
            let seq = state.next_seq;
            state.channels.insert(
                chat_id.clone(),
                ChannelState {
                    seq,
                    friendly_name: options.friendly_name,
                    is_private: options.is_private,
                    created_by: self.identity.clone(),
                    members,
                    messages: Vec::new(),
                    last_read: HashMap::new(),
                    events,
                },
            );
        }
        debug!(chat_id = %chat_id, creator = %self.identity, "loopback: channel created");
        Ok(self.handle(chat_id))
    }

    async fn get_channel(&self, chat_id: &ChatId) -> Result<Arc<dyn RemoteChannel>, ProviderError> {
        ensure_connected(&self.connected)?;
        {
            let state = self.shared.state();
            let channel = state
                .channels
                .get(chat_id)
                .ok_or_else(|| ProviderError::NotFound(format!("channel {chat_id}")))?;
            if !channel.visible_to(&self.identity) {
                return Err(ProviderError::PermissionDenied(format!(
                    "{} is not a member of channel {chat_id}",
                    self.identity
                )));
            }
        }
        Ok(self.handle(chat_id.clone()))
    }

    async fn all_channels(&self) -> Result<Vec<Arc<dyn RemoteChannel>>, ProviderError> {
        ensure_connected(&self.connected)?;
        Ok(self.handles_where(|channel| channel.visible_to(&self.identity)))
    }

    async fn subscribed_channels(&self) -> Result<Vec<Arc<dyn RemoteChannel>>, ProviderError> {
        ensure_connected(&self.connected)?;
        Ok(self.handles_where(|channel| channel.members.contains(&self.identity)))
    }

    async fn user_presence(&self, profile_id: &ProfileId) -> Result<Option<bool>, ProviderError> {
        ensure_connected(&self.connected)?;
        self.shared
            .state()
            .presence
            .get(profile_id)
            .copied()
            .ok_or_else(|| ProviderError::NotFound(format!("user {profile_id}")))
    }

    fn subscribe_events(&self) -> broadcast::Receiver<ServiceEvent> {
        self.shared.service_events.subscribe()
    }

    async fn shutdown(&self) -> Result<(), ProviderError> {
        if !self.connected.swap(false, Ordering::SeqCst) {
            return Ok(());
        }
        self.shared.shutdowns.fetch_add(1, Ordering::SeqCst);
        self.shared.set_presence(&self.identity, Some(false));
        info!(identity = %self.identity, "loopback: client shut down");
        Ok(())
    }
}

struct LoopbackChannel {
    chat_id: ChatId,
    identity: ProfileId,
    shared: Arc<LoopbackShared>,
    connected: Arc<AtomicBool>,
}

impl LoopbackChannel {
    /// Runs `f` against the channel after checking it still exists and is visible.
    fn with_channel<T>(
        &self,
        f: impl FnOnce(&mut ChannelState, &ProfileId) -> Result<T, ProviderError>,
    ) -> Result<T, ProviderError> {
        ensure_connected(&self.connected)?;
        let mut state = self.shared.state();
        let channel = state
            .channels
            .get_mut(&self.chat_id)
            .ok_or_else(|| ProviderError::NotFound(format!("channel {}", self.chat_id)))?;
        if !channel.visible_to(&self.identity) {
            return Err(ProviderError::PermissionDenied(format!(
                "{} is not a member of channel {}",
                self.identity, self.chat_id
            )));
        }
        f(channel, &self.identity)
    }

    fn require_member(channel: &ChannelState, identity: &ProfileId) -> Result<(), ProviderError> {
        if channel.members.contains(identity) {
            Ok(())
        } else {
            Err(ProviderError::PermissionDenied(format!(
                "{identity} has not joined this channel"
            )))
        }
    }

    fn find_message<'a>(
        channel: &'a mut ChannelState,
        message_id: &MessageId,
    ) -> Result<&'a mut ChatMessage, ProviderError> {
        channel
            .messages
            .iter_mut()
            .find(|m| &m.message_id == message_id)
            .ok_or_else(|| ProviderError::NotFound(format!("message {message_id}")))
    }
}

#[async_trait]
impl RemoteChannel for LoopbackChannel {
    fn chat_id(&self) -> &ChatId {
        &self.chat_id
    }

    async fn friendly_name(&self) -> Result<String, ProviderError> {
        self.with_channel(|channel, _| Ok(channel.friendly_name.clone()))
    }

    async fn is_private(&self) -> Result<bool, ProviderError> {
        self.with_channel(|channel, _| Ok(channel.is_private))
    }

    async fn members(&self) -> Result<Vec<ProfileId>, ProviderError> {
        self.with_channel(|channel, _| Ok(channel.members.iter().cloned().collect()))
    }

    async fn members_count(&self) -> Result<usize, ProviderError> {
        self.with_channel(|channel, _| Ok(channel.members.len()))
    }

    async fn add_members(&self, profile_ids: &[ProfileId]) -> Result<(), ProviderError> {
        let chat_id = self.chat_id.clone();
        self.with_channel(|channel, identity| {
            if channel.is_private {
                Self::require_member(channel, identity)?;
            }
            for profile_id in profile_ids {
                if channel.members.insert(profile_id.clone()) {
                    channel.emit(ChannelEvent::MemberJoined {
                        chat_id: chat_id.clone(),
                        profile_id: profile_id.clone(),
                    });
                }
            }
            Ok(())
        })
    }

    async fn send_message(&self, body: &str) -> Result<ChatMessage, ProviderError> {
        let chat_id = self.chat_id.clone();
        self.with_channel(|channel, identity| {
            if channel.is_private {
                Self::require_member(channel, identity)?;
            } else if channel.members.insert(identity.clone()) {
                channel.emit(ChannelEvent::MemberJoined {
                    chat_id: chat_id.clone(),
                    profile_id: identity.clone(),
                });
            }
            let message = ChatMessage {
                message_id: MessageId::generate(),
                chat_id: chat_id.clone(),
                index: channel.messages.len() as u64,
                author: identity.clone(),
                body: body.to_string(),
                sent_at: Utc::now(),
                reactions: Default::default(),
            };
            channel.messages.push(message.clone());
            channel.emit(ChannelEvent::MessageAdded {
                message: message.clone(),
            });
            Ok(message)
        })
    }

    async fn get_message(
        &self,
        message_id: &MessageId,
        index: u64,
    ) -> Result<ChatMessage, ProviderError> {
        self.with_channel(|channel, _| {
            let by_index = usize::try_from(index)
                .ok()
                .and_then(|i| channel.messages.get(i))
                .filter(|m| &m.message_id == message_id);
            by_index
                .or_else(|| channel.messages.iter().find(|m| &m.message_id == message_id))
                .cloned()
                .ok_or_else(|| ProviderError::NotFound(format!("message {message_id}")))
        })
    }

    async fn messages_page(
        &self,
        page_size: usize,
        before_index: Option<u64>,
    ) -> Result<MessagePage, ProviderError> {
        self.with_channel(|channel, _| {
            let end = match before_index {
                Some(before) => channel
                    .messages
                    .iter()
                    .take_while(|m| m.index < before)
                    .count(),
                None => channel.messages.len(),
            };
            let start = end.saturating_sub(page_size.max(1));
            let messages = channel
                .messages
                .get(start..end)
                .map(<[ChatMessage]>::to_vec)
                .unwrap_or_default();
            Ok(MessagePage {
                messages,
                has_prior: start > 0,
            })
        })
    }

    async fn add_reaction(
        &self,
        message_id: &MessageId,
        reaction: &str,
    ) -> Result<(), ProviderError> {
        let chat_id = self.chat_id.clone();
        self.with_channel(|channel, identity| {
            Self::require_member(channel, identity)?;
            let message = Self::find_message(channel, message_id)?;
            let reactors = message.reactions.entry(reaction.to_string()).or_default();
            if !reactors.contains(identity) {
                reactors.push(identity.clone());
            }
            let reactors = reactors.clone();
            channel.emit(ChannelEvent::ReactionUpdated {
                chat_id,
                message_id: message_id.clone(),
                reaction: reaction.to_string(),
                reactors,
            });
            Ok(())
        })
    }

    async fn remove_reaction(
        &self,
        message_id: &MessageId,
        reaction: &str,
    ) -> Result<(), ProviderError> {
        let chat_id = self.chat_id.clone();
        self.with_channel(|channel, identity| {
            Self::require_member(channel, identity)?;
            let message = Self::find_message(channel, message_id)?;
            let Some(reactors) = message.reactions.get_mut(reaction) else {
                return Err(ProviderError::NotFound(format!("reaction {reaction}")));
            };
            let before = reactors.len();
            reactors.retain(|p| p != identity);
            if reactors.len() == before {
                return Err(ProviderError::NotFound(format!("reaction {reaction}")));
            }
            let reactors = reactors.clone();
            if reactors.is_empty() {
                message.reactions.remove(reaction);
            }
            channel.emit(ChannelEvent::ReactionUpdated {
                chat_id,
                message_id: message_id.clone(),
                reaction: reaction.to_string(),
                reactors,
            });
            Ok(())
        })
    }

    async fn last_read_index(&self) -> Result<Option<u64>, ProviderError> {
        self.with_channel(|channel, identity| Ok(channel.last_read.get(identity).copied()))
    }

    async fn set_last_read_index(&self, index: Option<u64>) -> Result<(), ProviderError> {
        self.with_channel(|channel, identity| {
            Self::require_member(channel, identity)?;
            match index {
                Some(index) => channel.last_read.insert(identity.clone(), index),
                None => channel.last_read.remove(identity),
            };
            Ok(())
        })
    }

    async fn delete(&self) -> Result<(), ProviderError> {
        ensure_connected(&self.connected)?;
        let removed = {
            let mut state = self.shared.state();
            let channel = state
                .channels
                .get(&self.chat_id)
                .ok_or_else(|| ProviderError::NotFound(format!("channel {}", self.chat_id)))?;
            Self::require_member(channel, &self.identity)?;
            state.channels.remove(&self.chat_id)
        };
        if let Some(channel) = removed {
            channel.emit(ChannelEvent::ChannelRemoved {
                chat_id: self.chat_id.clone(),
            });
            debug!(chat_id = %self.chat_id, created_by = %channel.created_by, "loopback: channel deleted");
        }
        Ok(())
    }

    fn subscribe_events(&self) -> broadcast::Receiver<ChannelEvent> {
        let state = self.shared.state();
        match state.channels.get(&self.chat_id) {
            Some(channel) if ensure_connected(&self.connected).is_ok() => channel.events.subscribe(),
            _ => {
                // Closed straight away: the channel is gone or the client shut down.
                let (_, receiver) = broadcast::channel(1);
                receiver
            }
        }
    }
}

#[cfg(test)]
#[path = "tests/loopback_tests.rs"]
mod tests;
