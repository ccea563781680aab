//! Token verification
//!
//! Access tokens are issued by the external HTTP service; this server only
//! verifies them with the shared secret and extracts the user identity.

use jsonwebtoken::{decode, DecodingKey, Validation};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{ApiError, ApiResult};

/// Token verification configuration
#[derive(Debug, Clone)]
pub struct AuthConfig {
    /// JWT verification secret (shared with the issuer)
    pub jwt_secret: String,
    /// Expected JWT issuer
    pub issuer: String,
    /// Expected JWT audience
    pub audience: String,
}

impl AuthConfig {
    /// Create a new AuthConfig with the product's issuer/audience
    pub fn new(jwt_secret: String) -> Self {
        Self {
            jwt_secret,
            issuer: "watchparty".to_string(),
            audience: "watchparty".to_string(),
        }
    }
}

/// Access token claims
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    /// Subject (user ID)
    pub sub: Uuid,

    /// Issued at timestamp (Unix epoch seconds)
    pub iat: i64,

    /// Expiration timestamp (Unix epoch seconds)
    pub exp: i64,

    /// Issuer
    #[serde(default = "default_issuer")]
    pub iss: String,

    /// Audience
    #[serde(default = "default_audience")]
    pub aud: String,
}

fn default_issuer() -> String {
    "watchparty".to_string()
}

fn default_audience() -> String {
    "watchparty".to_string()
}

/// Verifies access tokens minted by the external issuer
#[derive(Clone)]
pub struct AuthService {
    config: AuthConfig,
}

impl AuthService {
    /// Create a new AuthService instance
    pub fn new(config: AuthConfig) -> Self {
        Self { config }
    }

    /// Verify an access token and return its claims
    ///
    /// # Errors
    /// - `ApiError::InvalidToken` if the token is invalid, expired, or malformed
    pub fn verify_token(&self, token: &str) -> ApiResult<Claims> {
        let mut validation = Validation::default();
        validation.set_issuer(&[&self.config.issuer]);
        validation.set_audience(&[&self.config.audience]);

        let token_data = decode::<Claims>(
            token,
            &DecodingKey::from_secret(self.config.jwt_secret.as_bytes()),
            &validation,
        )
        .map_err(|e| {
            tracing::debug!(error = %e, "Access token verification failed");
            ApiError::InvalidToken(e.to_string())
        })?;

        Ok(token_data.claims)
    }

    /// Mint a token the way the external issuer would. Test builds only.
    #[cfg(test)]
    pub(crate) fn issue_token_for_tests(&self, user_id: Uuid) -> String {
        use jsonwebtoken::{encode, EncodingKey, Header};

        let now = chrono::Utc::now().timestamp();
        let claims = Claims {
            sub: user_id,
            iat: now,
            exp: now + 300,
            iss: self.config.issuer.clone(),
            aud: self.config.audience.clone(),
        };

        encode(
            &Header::default(),
            &claims,
            &EncodingKey::from_secret(self.config.jwt_secret.as_bytes()),
        )
        .expect("token encoding should not fail")
    }
}
