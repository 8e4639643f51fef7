use std::{str::FromStr, time::Duration};

use anyhow::Context;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Pretty,
    Json,
}

impl FromStr for LogFormat {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "pretty" | "text" => Ok(LogFormat::Pretty),
            "json" => Ok(LogFormat::Json),
            other => anyhow::bail!("unknown log format {other:?}"),
        }
    }
}

/// Server settings, read from the environment (and `.env`, when present).
#[derive(Debug, Clone)]
pub struct Config {
    pub bind_addr: String,
    pub database_url: String,
    /// Shared HS256 secret; a random one is generated per process when unset.
    pub jwt_secret: Option<String>,
    pub token_ttl: Duration,
    pub idle_timeout: Duration,
    pub cors_origin: String,
    /// Accept unsigned user ids in `announce-identity`.
    pub trust_announced_identity: bool,
    pub log_format: LogFormat,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_vars(|key| dotenv::var(key).ok())
    }

    pub fn from_vars(var: impl Fn(&str) -> Option<String>) -> anyhow::Result<Self> {
        let config = Config {
            bind_addr: var("BIND_ADDR").unwrap_or_else(|| "0.0.0.0:5000".to_owned()),
            database_url: var("DATABASE_URL").unwrap_or_else(|| "sqlite://murmur.db?mode=rwc".to_owned()),
            jwt_secret: var("JWT_SECRET").filter(|secret| !secret.is_empty()),
            token_ttl: Duration::from_secs(parse_or(&var, "TOKEN_TTL_SECS", 15 * 24 * 60 * 60)?),
            idle_timeout: Duration::from_secs(parse_or(&var, "IDLE_TIMEOUT_SECS", 70)?),
            cors_origin: var("CORS_ORIGIN").unwrap_or_else(|| "http://localhost:3000".to_owned()),
            trust_announced_identity: parse_or(&var, "TRUST_ANNOUNCED_IDENTITY", false)?,
            log_format: match var("LOG_FORMAT") {
                Some(format) => format.parse()?,
                None => LogFormat::Pretty,
            },
        };
        anyhow::ensure!(!config.idle_timeout.is_zero(), "IDLE_TIMEOUT_SECS must be positive");
        Ok(config)
    }
}

fn parse_or<T>(var: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> anyhow::Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match var(key) {
        Some(raw) => raw.trim().parse().with_context(|| format!("invalid {key}: {raw:?}")),
        None => Ok(default),
    }
}
