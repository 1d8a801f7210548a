use std::sync::Arc;

use shared::domain::{ConferenceId, ProfileId};
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::{
    error::ChatError,
    manager::{ChatBackends, ChatOptions, ChatSessionManager, SetupOutcome},
    single_flight::SingleFlight,
    token::SessionCredential,
};

type Current = Arc<Mutex<Option<Arc<ChatSessionManager>>>>;

/// Holds the one active chat session of the application shell.
#[derive(Default)]
pub struct ChatSessionSlot {
    current: Current,
    teardown_flight: SingleFlight<Result<(), ChatError>>,
}

impl ChatSessionSlot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates or reuses the session for (`conference_id`, `profile_id`) and sets it up.
    ///
    /// A session for a different pair must be torn down first; a teardown still
    /// in flight is awaited before the slot is looked at. A failed setup empties
    /// the slot again.
    pub async fn setup(
        &self,
        conference_id: ConferenceId,
        profile_id: ProfileId,
        session: SessionCredential,
        backends: ChatBackends,
        options: ChatOptions,
    ) -> Result<(Arc<ChatSessionManager>, SetupOutcome), ChatError> {
        if let Some(teardown) = self.teardown_flight.in_flight() {
            let _ = teardown.await;
        }

        let manager = {
            let mut current = self.current.lock().await;
            match current.as_ref() {
                Some(existing)
                    if existing.conference_id() == &conference_id
                        && existing.profile_id() == &profile_id =>
                {
                    Arc::clone(existing)
                }
                Some(existing) => {
                    warn!(
                        active_conference = %existing.conference_id(),
                        requested_conference = %conference_id,
                        "chat: refusing second session"
                    );
                    return Err(ChatError::SessionConflict);
                }
                None => {
                    let manager = ChatSessionManager::new(
                        conference_id,
                        profile_id,
                        session,
                        backends,
                        options,
                    );
                    *current = Some(Arc::clone(&manager));
                    manager
                }
            }
        };

        match manager.setup().await {
            Ok(outcome) => Ok((manager, outcome)),
            Err(err) => {
                let mut current = self.current.lock().await;
                if current
                    .as_ref()
                    .is_some_and(|active| Arc::ptr_eq(active, &manager))
                {
                    *current = None;
                }
                Err(err)
            }
        }
    }

    /// The session stays in the slot until its teardown settles, so no other
    /// session can be set up in the meantime. Concurrent calls share one run.
    pub async fn teardown(&self) -> Result<(), ChatError> {
        let current = Arc::clone(&self.current);
        self.teardown_flight
            .run(move || release(current))
            .await
    }

    pub async fn instance(&self) -> Option<Arc<ChatSessionManager>> {
        self.current.lock().await.clone()
    }
}

async fn release(current: Current) -> Result<(), ChatError> {
    let Some(manager) = current.lock().await.clone() else {
        return Ok(());
    };
    info!(conference_id = %manager.conference_id(), "chat: releasing session");
    let result = manager.teardown().await;

    let mut slot = current.lock().await;
    if slot
        .as_ref()
        .is_some_and(|active| Arc::ptr_eq(active, &manager))
    {
        *slot = None;
    }
    result
}

#[cfg(test)]
#[path = "tests/session_tests.rs"]
mod tests;
