//! Unified chat session manager.
//!
//! [`ChatSessionManager`] hides the real-time chat provider and the mirrored
//! persistence store behind one set of chat operations. Channels come back as
//! [`ChatDescriptor`] values classified into a single [`ChatCategory`].

pub mod config;
pub mod descriptor;
pub mod error;
pub mod events;
pub mod manager;
pub mod mirror;
pub mod provider_channel;
pub mod provider_service;
pub mod session;
pub mod single_flight;
pub mod store;
pub mod supersede;
pub mod token;

pub use descriptor::{ChatCategory, ChatDescriptor, MemberDescriptor};
pub use error::ChatError;
pub use events::Subscription;
pub use manager::{
    ChatBackends, ChatOptions, ChatSessionManager, MessagePager, ReactionAck, SetupOutcome,
};
pub use mirror::MirrorStatus;
pub use session::ChatSessionSlot;
pub use token::{ChatToken, SessionCredential};

#[cfg(test)]
#[path = "tests/support.rs"]
pub(crate) mod test_support;
