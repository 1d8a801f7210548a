use chrono::{DateTime, Duration, Utc};
use jsonwebtoken::{
    decode, encode, errors::ErrorKind, Algorithm, DecodingKey, EncodingKey, Header, Validation,
};
use serde::{Deserialize, Serialize};
use shared::domain::{ConferenceId, ProfileId};

use crate::{loopback::LoopbackConfig, ProviderError};

const TOKEN_ISSUER: &str = "chat-loopback";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessClaims {
    pub iss: String,
    pub sub: String,
    pub conference: String,
    pub iat: i64,
    pub exp: i64,
}

impl AccessClaims {
    pub fn identity(&self) -> ProfileId {
        ProfileId(self.sub.clone())
    }

    pub fn conference_id(&self) -> ConferenceId {
        ConferenceId(self.conference.clone())
    }
}

/// Mints a token valid for the configured TTL and returns it with its expiry.
pub fn mint_access_token(
    cfg: &LoopbackConfig,
    identity: &ProfileId,
    conference_id: &ConferenceId,
) -> Result<(String, DateTime<Utc>), jsonwebtoken::errors::Error> {
    let expires_at = Utc::now() + Duration::seconds(cfg.ttl_seconds);
    let token = mint_access_token_until(cfg, identity, conference_id, expires_at)?;
    Ok((token, expires_at))
}

pub fn mint_access_token_until(
    cfg: &LoopbackConfig,
    identity: &ProfileId,
    conference_id: &ConferenceId,
    expires_at: DateTime<Utc>,
) -> Result<String, jsonwebtoken::errors::Error> {
    let claims = AccessClaims {
        iss: TOKEN_ISSUER.to_string(),
        sub: identity.0.clone(),
        conference: conference_id.0.clone(),
        iat: Utc::now().timestamp(),
        exp: expires_at.timestamp(),
    };

    encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(cfg.signing_secret.as_bytes()),
    )
}

pub fn validate_access_token(
    cfg: &LoopbackConfig,
    token: &str,
) -> Result<AccessClaims, ProviderError> {
    let mut validation = Validation::new(Algorithm::HS256);
    validation.leeway = 0;
    validation.set_issuer(&[TOKEN_ISSUER]);
    validation.set_required_spec_claims(&["exp", "sub", "iss"]);

    decode::<AccessClaims>(
        token,
        &DecodingKey::from_secret(cfg.signing_secret.as_bytes()),
        &validation,
    )
    .map(|data| data.claims)
    .map_err(|err| match err.kind() {
        ErrorKind::ExpiredSignature => ProviderError::TokenExpired,
        _ => ProviderError::TokenRejected(err.to_string()),
    })
}
