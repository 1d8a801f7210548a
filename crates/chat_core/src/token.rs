//! Provider access token lifecycle: cache lookup, fetch from the authorization
//! backend, invalidation.

use std::{fmt, sync::Arc, time::Duration};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use provider_integration::LoopbackProvider;
use reqwest::{Client, StatusCode};
use shared::{
    domain::{ConferenceId, ProfileId},
    error::ApiError,
    protocol::{ChatTokenRequest, ChatTokenResponse},
};
use storage::StoredCredential;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use url::Url;
use zeroize::Zeroize;

use crate::{
    error::ChatError,
    store::{ConferenceConfigStore, CredentialCache, CHAT_CALLBACK_URL_KEY},
};

/// The caller's application session credential, exchanged for provider tokens.
#[derive(Clone, PartialEq, Eq)]
pub struct SessionCredential(String);

impl SessionCredential {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for SessionCredential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SessionCredential(<redacted>)")
    }
}

impl Drop for SessionCredential {
    fn drop(&mut self) {
        self.0.zeroize();
    }
}

#[derive(Clone, PartialEq, Eq)]
pub struct ChatToken {
    pub token: String,
    pub expiry: DateTime<Utc>,
}

impl fmt::Debug for ChatToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChatToken")
            .field("token", &"<redacted>")
            .field("expiry", &self.expiry)
            .finish()
    }
}

#[derive(Debug, Error)]
pub enum TokenBackendError {
    #[error("token endpoint unreachable: {0}")]
    Unreachable(String),
    #[error("session credential rejected: {0}")]
    Rejected(ApiError),
    #[error("unexpected token endpoint response: {0}")]
    InvalidResponse(String),
}

#[async_trait]
pub trait TokenBackend: Send + Sync {
    async fn fetch_token(
        &self,
        base_url: &Url,
        request: &ChatTokenRequest,
    ) -> Result<ChatTokenResponse, TokenBackendError>;
}

/// Calls `POST {base}/chat/token` on the authorization backend.
pub struct HttpTokenBackend {
    http: Client,
}

impl HttpTokenBackend {
    pub fn new(timeout: Duration) -> Result<Self, TokenBackendError> {
        let http = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|err| TokenBackendError::Unreachable(err.to_string()))?;
        Ok(Self { http })
    }

    pub fn with_client(http: Client) -> Self {
        Self { http }
    }
}

pub fn token_endpoint(base_url: &Url) -> Result<Url, url::ParseError> {
    let mut base = base_url.clone();
    if !base.path().ends_with('/') {
        let path = format!("{}/", base.path());
        base.set_path(&path);
    }
    base.join("chat/token")
}

#[async_trait]
impl TokenBackend for HttpTokenBackend {
    async fn fetch_token(
        &self,
        base_url: &Url,
        request: &ChatTokenRequest,
    ) -> Result<ChatTokenResponse, TokenBackendError> {
        let endpoint = token_endpoint(base_url)
            .map_err(|err| TokenBackendError::InvalidResponse(err.to_string()))?;
        let res = self
            .http
            .post(endpoint)
            .json(request)
            .send()
            .await
            .map_err(|err| TokenBackendError::Unreachable(err.to_string()))?;

        let status = res.status();
        if status.is_success() {
            return res
                .json::<ChatTokenResponse>()
                .await
                .map_err(|err| TokenBackendError::InvalidResponse(err.to_string()));
        }

        let body = res.json::<ApiError>().await.ok();
        match body {
            Some(api) if api.is_credential_rejection() => Err(TokenBackendError::Rejected(api)),
            Some(api) => Err(TokenBackendError::Unreachable(api.to_string())),
            None if matches!(status, StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN) => {
                Err(TokenBackendError::Rejected(ApiError::new(
                    shared::error::ErrorCode::Unauthorized,
                    format!("token endpoint returned {status}"),
                )))
            }
            None => Err(TokenBackendError::Unreachable(format!(
                "token endpoint returned {status}"
            ))),
        }
    }
}

/// Issues tokens for the in-process provider; the session credential is taken
/// as the profile identity.
pub struct LoopbackTokenBackend {
    provider: Arc<LoopbackProvider>,
}

impl LoopbackTokenBackend {
    pub fn new(provider: Arc<LoopbackProvider>) -> Self {
        Self { provider }
    }
}

#[async_trait]
impl TokenBackend for LoopbackTokenBackend {
    async fn fetch_token(
        &self,
        _base_url: &Url,
        request: &ChatTokenRequest,
    ) -> Result<ChatTokenResponse, TokenBackendError> {
        let (token, expiry) = self
            .provider
            .mint_token(&ProfileId::new(request.identity.as_str()), &request.conference)
            .map_err(|err| TokenBackendError::Unreachable(err.to_string()))?;
        Ok(ChatTokenResponse { token, expiry })
    }
}

/// A cached credential is usable only for its own conference and strictly before expiry.
pub fn is_usable(
    credential: &StoredCredential,
    conference_id: &ConferenceId,
    now: DateTime<Utc>,
) -> bool {
    &credential.conference_id == conference_id && credential.expiry > now
}

#[derive(Default)]
struct TokenState {
    scope: Option<String>,
    cached: Option<StoredCredential>,
    endpoint: Option<(ConferenceId, Url)>,
}

pub struct TokenProvider {
    backend: Arc<dyn TokenBackend>,
    credentials: Arc<dyn CredentialCache>,
    config: Arc<dyn ConferenceConfigStore>,
    fallback_endpoint: Option<String>,
    state: Mutex<TokenState>,
}

impl TokenProvider {
    pub fn new(
        backend: Arc<dyn TokenBackend>,
        credentials: Arc<dyn CredentialCache>,
        config: Arc<dyn ConferenceConfigStore>,
        fallback_endpoint: Option<String>,
    ) -> Self {
        Self {
            backend,
            credentials,
            config,
            fallback_endpoint,
            state: Mutex::new(TokenState::default()),
        }
    }

    /// Returns a usable token, fetching one only when the cache has none.
    ///
    /// Callers are serialized on the internal lock, so concurrent calls share a
    /// single fetch.
    pub async fn get_token(
        &self,
        conference_id: &ConferenceId,
        profile_id: &ProfileId,
        session: &SessionCredential,
    ) -> Result<ChatToken, ChatError> {
        let mut state = self.state.lock().await;
        Self::bind_scope(&mut state, profile_id);

        if state.cached.is_none() {
            state.cached = match self.credentials.load(profile_id.as_str()).await {
                Ok(stored) => stored,
                Err(err) => {
                    warn!(profile_id = %profile_id, error = %err, "token: credential cache read failed");
                    None
                }
            };
        }

        if let Some(cached) = &state.cached {
            if is_usable(cached, conference_id, Utc::now()) {
                debug!(conference_id = %conference_id, "token: using cached credential");
                return Ok(ChatToken {
                    token: cached.token.clone(),
                    expiry: cached.expiry,
                });
            }
            debug!(conference_id = %conference_id, "token: discarding stale credential");
        }
        self.clear_locked(&mut state).await;

        self.fetch_locked(&mut state, conference_id, session).await
    }

    /// Discards the cached token unconditionally and fetches a new one.
    pub async fn refresh_token(
        &self,
        conference_id: &ConferenceId,
        profile_id: &ProfileId,
        session: &SessionCredential,
    ) -> Result<ChatToken, ChatError> {
        let mut state = self.state.lock().await;
        Self::bind_scope(&mut state, profile_id);
        self.clear_locked(&mut state).await;
        self.fetch_locked(&mut state, conference_id, session).await
    }

    pub async fn invalidate(&self) {
        let mut state = self.state.lock().await;
        self.clear_locked(&mut state).await;
    }

    fn bind_scope(state: &mut TokenState, profile_id: &ProfileId) {
        if state.scope.as_deref() != Some(profile_id.as_str()) {
            if let Some(mut stale) = state.cached.take() {
                stale.token.zeroize();
            }
            state.scope = Some(profile_id.as_str().to_string());
        }
    }

    async fn clear_locked(&self, state: &mut TokenState) {
        if let Some(mut stale) = state.cached.take() {
            stale.token.zeroize();
        }
        if let Some(scope) = &state.scope {
            if let Err(err) = self.credentials.clear(scope).await {
                warn!(error = %err, "token: failed to clear cached credential");
            }
        }
    }

    async fn fetch_locked(
        &self,
        state: &mut TokenState,
        conference_id: &ConferenceId,
        session: &SessionCredential,
    ) -> Result<ChatToken, ChatError> {
        let base_url = self.endpoint_locked(state, conference_id).await?;
        let request = ChatTokenRequest {
            identity: session.expose().to_string(),
            conference: conference_id.clone(),
        };

        let response = match self.backend.fetch_token(&base_url, &request).await {
            Ok(response) => response,
            Err(err) => {
                warn!(conference_id = %conference_id, error = %err, "token: fetch failed");
                self.clear_locked(state).await;
                return Err(ChatError::TokenUnavailable(err.to_string()));
            }
        };

        let credential = StoredCredential {
            token: response.token,
            expiry: response.expiry,
            conference_id: conference_id.clone(),
        };
        if let Some(scope) = &state.scope {
            if let Err(err) = self.credentials.store(scope, &credential).await {
                warn!(error = %err, "token: failed to persist credential");
            }
        }
        info!(conference_id = %conference_id, expiry = %credential.expiry, "token: fetched chat token");

        let token = ChatToken {
            token: credential.token.clone(),
            expiry: credential.expiry,
        };
        state.cached = Some(credential);
        Ok(token)
    }

    async fn endpoint_locked(
        &self,
        state: &mut TokenState,
        conference_id: &ConferenceId,
    ) -> Result<Url, ChatError> {
        if let Some((cached_for, url)) = &state.endpoint {
            if cached_for == conference_id {
                return Ok(url.clone());
            }
        }

        let configured = self
            .config
            .get_by_key(CHAT_CALLBACK_URL_KEY, conference_id)
            .await
            .map_err(|err| ChatError::TokenUnavailable(format!("{err:#}")))?
            .into_iter()
            .next();
        let raw = configured
            .or_else(|| self.fallback_endpoint.clone())
            .ok_or_else(|| {
                ChatError::TokenUnavailable(format!(
                    "chat is not configured for conference {conference_id}"
                ))
            })?;
        let url = Url::parse(&raw).map_err(|err| {
            ChatError::TokenUnavailable(format!("invalid token endpoint '{raw}': {err}"))
        })?;

        state.endpoint = Some((conference_id.clone(), url.clone()));
        Ok(url)
    }
}

#[cfg(test)]
#[path = "tests/token_tests.rs"]
mod tests;
