pub mod api;
pub mod auth;
pub mod config;
pub mod db;
pub mod events;
pub mod presence;
pub mod rooms;
pub mod router;
pub mod ws;

use std::time::Duration;

use axum::{extract::FromRef, http::StatusCode, response::{IntoResponse, Response}, routing::get, Json, Router};
use serde_json::json;
use sqlx::SqlitePool;
use thiserror::Error;

use auth::IdentityResolver;
use router::EventRouter;

#[derive(Clone, FromRef)]
pub struct AppState {
    pub db_pool: SqlitePool,
    pub identity: IdentityResolver,
    pub events: EventRouter,
    pub idle_timeout: IdleTimeout,
}

/// How long a socket may stay silent before the transport drops it.
#[derive(Debug, Clone, Copy)]
pub struct IdleTimeout(pub Duration);

/// The application's routes, without transport-level layers.
pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/ws", get(ws::socket))
        .nest("/api", api::router())
        .with_state(state)
}

/// Failures the REST gateway reports with a specific status.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("not authorised")]
    Unauthenticated,
    #[error("{0}")]
    BadRequest(&'static str),
    #[error("{0}")]
    Forbidden(&'static str),
    #[error("{0} not found")]
    NotFound(&'static str),
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self {
            ApiError::Unauthenticated => StatusCode::UNAUTHORIZED,
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Forbidden(_) => StatusCode::FORBIDDEN,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
        }
    }
}

pub type AppResult<T> = Result<T, AppError>;
#[derive(Debug)]
pub struct AppError(pub anyhow::Error);

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = match self.0.downcast_ref::<ApiError>() {
            Some(err) => err.status(),
            None => {
                tracing::error!(error = ?self.0, "request failed");
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        (
            status,
            Json(json!({ "success": false, "message": self.0.to_string() })),
        )
            .into_response()
    }
}

impl<E> From<E> for AppError
where
    E: Into<anyhow::Error>,
{
    fn from(err: E) -> Self {
        Self(err.into())
    }
}
