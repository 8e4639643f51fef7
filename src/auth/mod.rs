//! Identity resolution: bearer tokens in, user ids out.

mod extract;
mod jwt;

use thiserror::Error;

pub use extract::AuthUser;
pub use jwt::{random_secret, Claims, IdentityResolver};

/// Every variant is reported to callers as "unauthenticated"; the distinction is kept for logs.
#[derive(Debug, Error)]
pub enum AuthError {
    #[error("unauthenticated: no credential presented")]
    Missing,
    #[error("unauthenticated: credential expired")]
    Expired,
    #[error("unauthenticated: invalid credential")]
    Invalid(#[source] jsonwebtoken::errors::Error),
    #[error("unauthenticated: credential belongs to another user")]
    SubjectMismatch,
}
