//! Best-effort copy of chat state into the secondary backend.
//!
//! Nothing here returns an error to the caller: every outcome is a
//! [`MirrorStatus`] and failures are logged.

use std::sync::{
    atomic::{AtomicBool, AtomicU32, Ordering},
    Arc,
};

use shared::{
    domain::{ChatId, ConferenceId},
    protocol::ChatMessage,
};
use storage::MirroredMessage;
use tracing::{debug, info, warn};

use crate::{descriptor::ChatDescriptor, error::ChatError, store::MirrorBackend};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MirrorStatus {
    Synced,
    /// No backend configured, or the mirror is not set up.
    Skipped,
    Failed(ChatError),
}

impl MirrorStatus {
    pub fn is_synced(&self) -> bool {
        matches!(self, MirrorStatus::Synced)
    }
}

/// `active` spans setup to teardown; `ready` is whether the backend last passed
/// its health check. Active but not ready means the backend is re-checked on
/// the next operation.
pub struct MirrorService {
    conference_id: ConferenceId,
    backend: Option<Arc<dyn MirrorBackend>>,
    active: AtomicBool,
    ready: AtomicBool,
    failed_checks: AtomicU32,
}

impl MirrorService {
    pub fn new(conference_id: ConferenceId, backend: Option<Arc<dyn MirrorBackend>>) -> Self {
        Self {
            conference_id,
            backend,
            active: AtomicBool::new(false),
            ready: AtomicBool::new(false),
            failed_checks: AtomicU32::new(0),
        }
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }

    fn failed(&self, action: &str, err: anyhow::Error) -> MirrorStatus {
        warn!(conference_id = %self.conference_id, action, error = %format!("{err:#}"), "mirror: operation failed");
        MirrorStatus::Failed(ChatError::MirrorUnavailable(format!("{action}: {err:#}")))
    }

    pub async fn setup(&self) -> MirrorStatus {
        let Some(backend) = &self.backend else {
            debug!(conference_id = %self.conference_id, "mirror: no backend configured");
            return MirrorStatus::Skipped;
        };
        self.active.store(true, Ordering::SeqCst);
        match self.check(backend, "setup").await {
            Ok(()) => MirrorStatus::Synced,
            Err(status) => status,
        }
    }

    async fn check(&self, backend: &Arc<dyn MirrorBackend>, action: &str) -> Result<(), MirrorStatus> {
        match backend.health_check().await {
            Ok(()) => {
                self.ready.store(true, Ordering::SeqCst);
                let failed_checks = self.failed_checks.swap(0, Ordering::SeqCst);
                if failed_checks > 0 {
                    info!(conference_id = %self.conference_id, failed_checks, "mirror: backend reachable again");
                }
                Ok(())
            }
            Err(err) => {
                self.ready.store(false, Ordering::SeqCst);
                self.failed_checks.fetch_add(1, Ordering::SeqCst);
                Err(self.failed(action, err))
            }
        }
    }

    /// Current readiness expressed as a status, for callers that skip a fresh setup.
    pub fn status(&self) -> MirrorStatus {
        let active = self.active.load(Ordering::SeqCst);
        match (&self.backend, active, self.is_ready()) {
            (Some(_), true, true) => MirrorStatus::Synced,
            (Some(_), true, false) => MirrorStatus::Failed(ChatError::MirrorUnavailable(format!(
                "backend unreachable after {} health checks",
                self.failed_checks.load(Ordering::SeqCst)
            ))),
            _ => MirrorStatus::Skipped,
        }
    }

    pub fn teardown(&self) {
        self.active.store(false, Ordering::SeqCst);
        self.ready.store(false, Ordering::SeqCst);
    }

    /// An unhealthy backend is checked again before every write until it recovers.
    async fn active_backend(&self, action: &str) -> Result<&Arc<dyn MirrorBackend>, MirrorStatus> {
        let Some(backend) = &self.backend else {
            return Err(MirrorStatus::Skipped);
        };
        if !self.active.load(Ordering::SeqCst) {
            return Err(MirrorStatus::Skipped);
        }
        if !self.is_ready() {
            self.check(backend, action).await?;
        }
        Ok(backend)
    }

    pub async fn sync_channel(&self, descriptor: &ChatDescriptor) -> MirrorStatus {
        let backend = match self.active_backend("sync channel").await {
            Ok(backend) => backend,
            Err(status) => return status,
        };
        let snapshot = match serde_json::to_string(descriptor) {
            Ok(snapshot) => snapshot,
            Err(err) => return self.failed("encode channel", err.into()),
        };
        match backend
            .mirror_channel(&descriptor.id, &self.conference_id, &snapshot)
            .await
        {
            Ok(()) => MirrorStatus::Synced,
            Err(err) => self.failed("sync channel", err),
        }
    }

    pub async fn sync_message(&self, message: &ChatMessage) -> MirrorStatus {
        let backend = match self.active_backend("sync message").await {
            Ok(backend) => backend,
            Err(status) => return status,
        };
        let mirrored = MirroredMessage {
            chat_id: message.chat_id.clone(),
            message_index: message.index,
            message_id: message.message_id.clone(),
            author_id: message.author.clone(),
            body: message.body.clone(),
            sent_at: message.sent_at,
        };
        match backend.mirror_message(&mirrored).await {
            Ok(()) => MirrorStatus::Synced,
            Err(err) => self.failed("sync message", err),
        }
    }

    pub async fn remove_channel(&self, chat_id: &ChatId) -> MirrorStatus {
        let backend = match self.active_backend("remove channel").await {
            Ok(backend) => backend,
            Err(status) => return status,
        };
        match backend.remove_channel(chat_id).await {
            Ok(()) => MirrorStatus::Synced,
            Err(err) => self.failed("remove channel", err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::{anyhow, Result};
    use async_trait::async_trait;
    use chrono::Utc;
    use shared::domain::{MessageId, ProfileId};
    use std::sync::atomic::AtomicUsize;

    use crate::descriptor::ChatCategory;

    #[derive(Default)]
    struct FlakyBackend {
        healthy: AtomicBool,
        checks: AtomicUsize,
        writes: AtomicUsize,
    }

    #[async_trait]
    impl MirrorBackend for FlakyBackend {
        async fn health_check(&self) -> Result<()> {
            self.checks.fetch_add(1, Ordering::SeqCst);
            if self.healthy.load(Ordering::SeqCst) {
                Ok(())
            } else {
                Err(anyhow!("connection refused"))
            }
        }

        async fn mirror_channel(&self, _: &ChatId, _: &ConferenceId, _: &str) -> Result<()> {
            self.writes.fetch_add(1, Ordering::SeqCst);
            Err(anyhow!("disk full"))
        }

        async fn mirror_message(&self, _: &MirroredMessage) -> Result<()> {
            self.writes.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn remove_channel(&self, _: &ChatId) -> Result<()> {
            self.writes.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn descriptor() -> ChatDescriptor {
        ChatDescriptor {
            id: ChatId::new("CH-1"),
            friendly_name: "lobby".into(),
            auto_watch_enabled: false,
            is_announcements: false,
            creator: ProfileId::new("alice"),
            created_at: Utc::now(),
            category: ChatCategory::General { is_private: false },
        }
    }

    fn message() -> ChatMessage {
        ChatMessage {
            message_id: MessageId::new("MSG-1"),
            chat_id: ChatId::new("CH-1"),
            index: 0,
            author: ProfileId::new("alice"),
            body: "hi".into(),
            sent_at: Utc::now(),
            reactions: Default::default(),
        }
    }

    #[tokio::test]
    async fn without_backend_everything_is_skipped() {
        let mirror = MirrorService::new(ConferenceId::new("conf-1"), None);
        assert_eq!(mirror.setup().await, MirrorStatus::Skipped);
        assert_eq!(mirror.sync_message(&message()).await, MirrorStatus::Skipped);
        assert_eq!(mirror.status(), MirrorStatus::Skipped);
    }

    #[tokio::test]
    async fn unhealthy_backend_fails_until_it_recovers() {
        let backend = Arc::new(FlakyBackend::default());
        let mirror = MirrorService::new(ConferenceId::new("conf-1"), Some(backend.clone()));

        let status = mirror.setup().await;
        assert!(matches!(
            status,
            MirrorStatus::Failed(ChatError::MirrorUnavailable(ref reason)) if reason.contains("connection refused")
        ));
        assert!(!mirror.is_ready());
        assert!(matches!(mirror.status(), MirrorStatus::Failed(_)));

        for _ in 0..2 {
            assert!(matches!(
                mirror.sync_message(&message()).await,
                MirrorStatus::Failed(ChatError::MirrorUnavailable(_))
            ));
        }
        assert_eq!(backend.writes.load(Ordering::SeqCst), 0);
        assert_eq!(backend.checks.load(Ordering::SeqCst), 3);

        backend.healthy.store(true, Ordering::SeqCst);
        for _ in 0..3 {
            assert!(mirror.sync_message(&message()).await.is_synced());
        }
        assert!(mirror.is_ready());
        assert_eq!(mirror.status(), MirrorStatus::Synced);
        assert_eq!(backend.writes.load(Ordering::SeqCst), 3);
        assert_eq!(backend.checks.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn write_failures_are_reported_not_raised() {
        let backend = Arc::new(FlakyBackend::default());
        backend.healthy.store(true, Ordering::SeqCst);
        let mirror = MirrorService::new(ConferenceId::new("conf-1"), Some(backend.clone()));

        assert_eq!(mirror.setup().await, MirrorStatus::Synced);
        assert!(matches!(
            mirror.sync_channel(&descriptor()).await,
            MirrorStatus::Failed(ChatError::MirrorUnavailable(_))
        ));
        assert!(mirror.sync_message(&message()).await.is_synced());
        assert!(mirror.remove_channel(&ChatId::new("CH-1")).await.is_synced());
        assert_eq!(backend.writes.load(Ordering::SeqCst), 3);

        mirror.teardown();
        assert_eq!(mirror.status(), MirrorStatus::Skipped);
        assert_eq!(
            mirror.remove_channel(&ChatId::new("CH-1")).await,
            MirrorStatus::Skipped
        );
    }
}
