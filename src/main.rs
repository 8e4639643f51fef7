use anyhow::Context;
use axum::http::HeaderValue;
use murmur::{
    app,
    auth::{self, IdentityResolver},
    config::{Config, LogFormat},
    db,
    rooms::RoomRegistry,
    router::EventRouter,
    AppState, IdleTimeout,
};
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::from_env()?;

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("murmur=info,tower_http=info"));
    match config.log_format {
        LogFormat::Json => tracing_subscriber::fmt().json().with_env_filter(filter).init(),
        LogFormat::Pretty => tracing_subscriber::fmt().with_env_filter(filter).init(),
    }

    let jwt_secret = match &config.jwt_secret {
        Some(secret) => secret.clone(),
        None => {
            tracing::warn!("JWT_SECRET is not set; tokens will not survive a restart");
            auth::random_secret()
        }
    };
    let identity = IdentityResolver::new(jwt_secret.as_bytes(), config.token_ttl);

    let db_pool = db::connect(&config.database_url)
        .await
        .with_context(|| format!("opening {}", config.database_url))?;

    let events = EventRouter::new(RoomRegistry::new(), identity.clone())
        .trust_announced_identity(config.trust_announced_identity);
    if config.trust_announced_identity {
        tracing::warn!("accepting unsigned identity announcements");
    }

    let app_state = AppState {
        db_pool,
        identity,
        events,
        idle_timeout: IdleTimeout(config.idle_timeout),
    };

    let cors = CorsLayer::new()
        .allow_origin(
            config
                .cors_origin
                .parse::<HeaderValue>()
                .with_context(|| format!("invalid CORS_ORIGIN {:?}", config.cors_origin))?,
        )
        .allow_methods(Any)
        .allow_headers(Any);

    let app = app(app_state)
        .layer(cors)
        .layer(TraceLayer::new_for_http());

    let listener = tokio::net::TcpListener::bind(&config.bind_addr)
        .await
        .with_context(|| format!("binding {}", config.bind_addr))?;
    tracing::info!(
        addr = %config.bind_addr,
        idle_timeout_secs = config.idle_timeout.as_secs(),
        "murmur v{} listening",
        env!("CARGO_PKG_VERSION")
    );
    axum::serve(listener, app).await?;

    Ok(())
}
