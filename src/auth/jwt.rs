use std::{fmt, sync::Arc, time::Duration};

use jsonwebtoken::{
    decode, encode, errors::ErrorKind, Algorithm, DecodingKey, EncodingKey, Header, Validation,
};
use rand::{distr::Alphanumeric, Rng};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use super::AuthError;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    /// User id
    pub sub: String,
    pub iat: i64,
    pub exp: i64,
}

#[derive(Clone)]
pub struct IdentityResolver {
    keys: Arc<(EncodingKey, DecodingKey)>,
    ttl: Duration,
}

impl fmt::Debug for IdentityResolver {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("IdentityResolver")
            .field("ttl", &self.ttl)
            .finish_non_exhaustive()
    }
}

impl IdentityResolver {
    pub fn new(secret: &[u8], ttl: Duration) -> Self {
        Self {
            keys: Arc::new((EncodingKey::from_secret(secret), DecodingKey::from_secret(secret))),
            ttl,
        }
    }

    pub fn issue(&self, user_id: &str) -> Result<String, AuthError> {
        let now = OffsetDateTime::now_utc().unix_timestamp();
        self.sign(&Claims {
            sub: user_id.to_owned(),
            iat: now,
            exp: now + self.ttl.as_secs() as i64,
        })
    }

    pub fn sign(&self, claims: &Claims) -> Result<String, AuthError> {
        encode(&Header::new(Algorithm::HS256), claims, &self.keys.0).map_err(AuthError::Invalid)
    }

    /// Verifies signature and expiry and returns the user id carried in `sub`.
    pub fn resolve(&self, token: &str) -> Result<String, AuthError> {
        let token = token.trim();
        if token.is_empty() {
            return Err(AuthError::Missing);
        }

        let mut validation = Validation::new(Algorithm::HS256);
        validation.leeway = 0;
        let data = decode::<Claims>(token, &self.keys.1, &validation).map_err(|err| {
            match err.kind() {
                ErrorKind::ExpiredSignature => AuthError::Expired,
                _ => AuthError::Invalid(err),
            }
        })?;

        if data.claims.sub.is_empty() {
            return Err(AuthError::Missing);
        }
        Ok(data.claims.sub)
    }
}

/// Per-process signing secret for when none is configured.
pub fn random_secret() -> String {
    rand::rng()
        .sample_iter(&Alphanumeric)
        .take(64)
        .map(char::from)
        .collect()
}
