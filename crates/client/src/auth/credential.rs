use std::time::Duration;

use chrono::{DateTime, Utc};
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use workshop_sync_common::types::UserId;

#[derive(Debug, Error)]
pub enum CredentialError {
    #[error("access token could not be decoded: {0}")]
    Malformed(#[from] jsonwebtoken::errors::Error),

    #[error("access token expiry {0} is out of range")]
    ExpiryOutOfRange(i64),
}

#[derive(Debug, Deserialize)]
struct ExpiryClaim {
    exp: i64,
}

#[derive(Debug, Deserialize)]
struct UserClaim {
    #[serde(default)]
    user_id: Option<UserId>,
}

fn unverified() -> Validation {
    let mut validation = Validation::new(Algorithm::HS256);
    validation.insecure_disable_signature_validation();
    validation.validate_exp = false;
    validation.validate_aud = false;
    validation.set_required_spec_claims(&["exp"]);
    validation
}

/// Bearer token plus the expiry decoded from its `exp` claim.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credential {
    pub token: String,
    pub expires_at: DateTime<Utc>,
}

impl Credential {
    /// Decode the expiry of a JWT without checking its signature. The server
    /// is the only party that validates tokens; the client just needs to know
    /// when to refresh.
    pub fn from_token(token: impl Into<String>) -> Result<Self, CredentialError> {
        let token = token.into();
        let claims =
            decode::<ExpiryClaim>(&token, &DecodingKey::from_secret(&[]), &unverified())?.claims;
        let expires_at = DateTime::<Utc>::from_timestamp(claims.exp, 0)
            .ok_or(CredentialError::ExpiryOutOfRange(claims.exp))?;

        Ok(Self { token, expires_at })
    }

    /// The `user_id` claim, if the token carries one.
    pub fn user_id(&self) -> Option<UserId> {
        decode::<UserClaim>(&self.token, &DecodingKey::from_secret(&[]), &unverified())
            .ok()
            .and_then(|data| data.claims.user_id)
    }

    /// Lifetime left at `now`; zero once expired.
    pub fn remaining_at(&self, now: DateTime<Utc>) -> Duration {
        (self.expires_at - now).to_std().unwrap_or(Duration::ZERO)
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}
