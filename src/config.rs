//! Server configuration loaded from environment variables

use std::env;
use std::str::FromStr;

use anyhow::{bail, Context, Result};

/// Minimum required length for JWT_SECRET to be considered secure
const MIN_JWT_SECRET_LENGTH: usize = 32;

/// Deployment environment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Environment {
    #[default]
    Development,
    Production,
}

impl Environment {
    pub fn is_production(&self) -> bool {
        matches!(self, Environment::Production)
    }
}

impl FromStr for Environment {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "production" | "prod" => Ok(Environment::Production),
            _ => Ok(Environment::Development),
        }
    }
}

/// Postgres connection settings
#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub connect_timeout_secs: u64,
}

/// Server configuration
///
/// The JWT secret is shared with the external HTTP service that issues
/// tokens; this server only verifies them.
#[derive(Debug, Clone)]
pub struct Config {
    /// Environment mode
    pub environment: Environment,

    /// Server port (default: 3001)
    pub port: u16,

    /// Postgres settings (group membership and watch session lookups)
    pub database: DatabaseConfig,

    /// Redis URL for the cross-process broadcast fabric
    pub redis_url: String,

    /// JWT verification secret
    pub jwt_secret: String,

    /// Ceiling on concurrently open WebSocket connections (default: 4096)
    pub ws_max_connections: usize,

    /// Seconds a socket may stay silent before it is closed (default: 300)
    pub ws_idle_timeout_secs: u64,
}

impl Config {
    /// Load configuration from environment variables
    ///
    /// In production mode, this function requires:
    /// - `JWT_SECRET`: Must be set and at least 32 characters long
    /// - `DATABASE_URL`: Must be explicitly set (no insecure defaults)
    ///
    /// In development mode, sensible defaults are used for convenience.
    pub fn from_env() -> Result<Self> {
        let environment = Environment::from_str(
            &env::var("ENVIRONMENT").unwrap_or_else(|_| "development".to_string()),
        )
        .unwrap_or_default();
        let is_production = environment.is_production();

        let jwt_secret = Self::load_jwt_secret(is_production)?;
        let database_url = Self::load_database_url(is_production)?;

        Ok(Self {
            environment,

            port: env::var("PORT")
                .unwrap_or_else(|_| "3001".to_string())
                .parse()
                .context("Invalid PORT value")?,

            database: DatabaseConfig {
                url: database_url,
                max_connections: env::var("DATABASE_MAX_CONNECTIONS")
                    .unwrap_or_else(|_| "10".to_string())
                    .parse()
                    .context("Invalid DATABASE_MAX_CONNECTIONS value")?,
                connect_timeout_secs: env::var("DATABASE_CONNECT_TIMEOUT_SECS")
                    .unwrap_or_else(|_| "10".to_string())
                    .parse()
                    .context("Invalid DATABASE_CONNECT_TIMEOUT_SECS value")?,
            },

            redis_url: env::var("REDIS_URL")
                .unwrap_or_else(|_| "redis://127.0.0.1:6379".to_string()),

            jwt_secret,

            ws_max_connections: env::var("WS_MAX_CONNECTIONS")
                .unwrap_or_else(|_| "4096".to_string())
                .parse()
                .context("Invalid WS_MAX_CONNECTIONS value")?,

            ws_idle_timeout_secs: env::var("WS_IDLE_TIMEOUT_SECS")
                .unwrap_or_else(|_| "300".to_string())
                .parse()
                .context("Invalid WS_IDLE_TIMEOUT_SECS value")?,
        })
    }

    /// Load and validate JWT_SECRET
    ///
    /// In production:
    /// - JWT_SECRET must be explicitly set
    /// - Must be at least MIN_JWT_SECRET_LENGTH characters
    ///
    /// In development: uses a default value with a warning
    fn load_jwt_secret(is_production: bool) -> Result<String> {
        match env::var("JWT_SECRET") {
            Ok(secret) if !secret.is_empty() => {
                if is_production && secret.len() < MIN_JWT_SECRET_LENGTH {
                    bail!(
                        "JWT_SECRET must be at least {} characters in production (got {})",
                        MIN_JWT_SECRET_LENGTH,
                        secret.len()
                    );
                }
                Ok(secret)
            }
            _ if is_production => {
                bail!(
                    "JWT_SECRET environment variable is required in production. \
                     Please set the secret shared with the token issuer \
                     (at least {} characters).",
                    MIN_JWT_SECRET_LENGTH
                );
            }
            _ => {
                tracing::warn!(
                    "JWT_SECRET not set, using insecure default. \
                     This is only acceptable in development mode."
                );
                Ok("development-secret-change-in-production".to_string())
            }
        }
    }

    /// Load DATABASE_URL, requiring it to be explicitly set in production
    fn load_database_url(is_production: bool) -> Result<String> {
        match env::var("DATABASE_URL") {
            Ok(url) if !url.is_empty() => Ok(url),
            _ if is_production => {
                bail!(
                    "DATABASE_URL environment variable is required in production. \
                     Please set your PostgreSQL connection string."
                );
            }
            _ => {
                tracing::warn!("DATABASE_URL not set, using development default");
                Ok("postgres://localhost/watchparty".to_string())
            }
        }
    }

    /// Check if running in production
    pub fn is_production(&self) -> bool {
        self.environment.is_production()
    }
}
