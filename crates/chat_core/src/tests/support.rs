use std::sync::{
    atomic::{AtomicBool, AtomicUsize, Ordering},
    Arc,
};

use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use provider_integration::{token::mint_access_token_until, LoopbackConfig, LoopbackProvider};
use shared::{
    domain::{ConferenceId, ProfileId},
    protocol::{ChatTokenRequest, ChatTokenResponse},
};
use storage::Storage;
use tokio::sync::Notify;
use url::Url;

use crate::{
    manager::{ChatBackends, ChatOptions, ChatSessionManager},
    provider_service::ProviderService,
    token::{SessionCredential, TokenBackend, TokenBackendError, TokenProvider},
};

/// Lets a test hold a token fetch open until it decides to release it.
#[derive(Default)]
pub(crate) struct FetchGate {
    pub(crate) entered: Notify,
    pub(crate) release: Notify,
}

/// Mints loopback tokens and counts fetches; can hand out expired tokens or fail.
pub(crate) struct CountingTokenBackend {
    provider: Arc<LoopbackProvider>,
    pub(crate) fetches: AtomicUsize,
    pub(crate) expired_remaining: AtomicUsize,
    pub(crate) fail: AtomicBool,
    pub(crate) gate: Option<Arc<FetchGate>>,
}

impl CountingTokenBackend {
    pub(crate) fn new(provider: Arc<LoopbackProvider>) -> Self {
        Self {
            provider,
            fetches: AtomicUsize::new(0),
            expired_remaining: AtomicUsize::new(0),
            fail: AtomicBool::new(false),
            gate: None,
        }
    }

    pub(crate) fn fetches(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TokenBackend for CountingTokenBackend {
    async fn fetch_token(
        &self,
        _base_url: &Url,
        request: &ChatTokenRequest,
    ) -> Result<ChatTokenResponse, TokenBackendError> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        if let Some(gate) = &self.gate {
            gate.entered.notify_one();
            gate.release.notified().await;
        }
        if self.fail.load(Ordering::SeqCst) {
            return Err(TokenBackendError::Unreachable("auth backend down".into()));
        }

        let identity = ProfileId::new(request.identity.as_str());
        let hand_out_expired = self
            .expired_remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if hand_out_expired {
            // Expired as far as the provider is concerned, fresh as far as the cache knows.
            let token = mint_access_token_until(
                self.provider.config(),
                &identity,
                &request.conference,
                Utc::now() - ChronoDuration::seconds(30),
            )
            .map_err(|err| TokenBackendError::InvalidResponse(err.to_string()))?;
            return Ok(ChatTokenResponse {
                token,
                expiry: Utc::now() + ChronoDuration::minutes(30),
            });
        }

        let (token, expiry) = self
            .provider
            .mint_token(&identity, &request.conference)
            .map_err(|err| TokenBackendError::Unreachable(err.to_string()))?;
        Ok(ChatTokenResponse { token, expiry })
    }
}

pub(crate) struct Harness {
    pub(crate) provider: Arc<LoopbackProvider>,
    pub(crate) storage: Storage,
    pub(crate) tokens: Arc<CountingTokenBackend>,
    pub(crate) conference_id: ConferenceId,
}

impl Harness {
    pub(crate) async fn new() -> Self {
        Self::with_backend(CountingTokenBackend::new).await
    }

    pub(crate) async fn with_backend(
        build: impl FnOnce(Arc<LoopbackProvider>) -> CountingTokenBackend,
    ) -> Self {
        let provider = LoopbackProvider::new(LoopbackConfig::default());
        let storage = Storage::new("sqlite::memory:").await.expect("db");
        let tokens = Arc::new(build(Arc::clone(&provider)));
        Self {
            provider,
            storage,
            tokens,
            conference_id: ConferenceId::new("conf-1"),
        }
    }

    pub(crate) fn options(&self) -> ChatOptions {
        ChatOptions {
            message_page_size: 2,
            token_endpoint: Some("http://auth.test/api/".into()),
        }
    }

    pub(crate) fn backends(&self) -> ChatBackends {
        ChatBackends::with_storage(
            self.storage.clone(),
            self.provider.clone(),
            self.tokens.clone(),
        )
    }

    pub(crate) fn token_provider(&self) -> Arc<TokenProvider> {
        Arc::new(TokenProvider::new(
            self.tokens.clone(),
            Arc::new(self.storage.clone()),
            Arc::new(self.storage.clone()),
            self.options().token_endpoint,
        ))
    }

    pub(crate) fn provider_service(&self) -> ProviderService {
        ProviderService::new(
            self.provider.clone(),
            self.token_provider(),
            Arc::new(self.storage.clone()),
        )
    }

    pub(crate) fn manager(&self, profile: &str) -> Arc<ChatSessionManager> {
        self.provider.register_user(&ProfileId::new(profile));
        ChatSessionManager::new(
            self.conference_id.clone(),
            ProfileId::new(profile),
            SessionCredential::new(profile),
            self.backends(),
            self.options(),
        )
    }

    pub(crate) async fn connected_manager(&self, profile: &str) -> Arc<ChatSessionManager> {
        let manager = self.manager(profile);
        manager.setup().await.expect("setup");
        manager
    }
}
