use axum::{
    extract::{FromRef, FromRequestParts},
    http::{header::AUTHORIZATION, request::Parts},
};

use crate::{ApiError, AppError};

use super::{AuthError, IdentityResolver};

/// The authenticated caller of a REST request, resolved from `Authorization: Bearer <token>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthUser(pub String);

impl<S> FromRequestParts<S> for AuthUser
where
    IdentityResolver: FromRef<S>,
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let token = parts
            .headers
            .get(AUTHORIZATION)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.strip_prefix("Bearer "))
            .ok_or(AuthError::Missing)
            .map_err(unauthenticated)?;

        let user_id = IdentityResolver::from_ref(state)
            .resolve(token)
            .map_err(unauthenticated)?;
        Ok(AuthUser(user_id))
    }
}

fn unauthenticated(err: AuthError) -> AppError {
    tracing::debug!(error = %err, "rejected bearer credential");
    ApiError::Unauthenticated.into()
}
