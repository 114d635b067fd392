//! Bearer-credential verification for gateway handshakes.
//!
//! Token issuance lives with the platform's auth service; this module
//! only verifies HS256-signed tokens against the gateway's configured
//! secret and extracts them from the two places a client may put one:
//! the `Authorization: Bearer <token>` handshake header, or a `token`
//! query parameter. Verification happens once per connection; the
//! resulting [`Principal`] is attached to the session and reused for
//! every guarded message.

use chrono::Utc;
use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};

/// JWT claims the gateway understands.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    /// Subject — the platform user id.
    pub sub: String,
    /// Optional display name claim.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Expiry, seconds since the epoch.
    pub exp: i64,
}

/// The verified identity attached to a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Principal {
    pub user_id: String,
    pub name: Option<String>,
}

/// Authentication errors. Both reject the handshake; the server never
/// retries on the client's behalf.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthError {
    MissingCredential,
    InvalidCredential(String),
}

impl std::fmt::Display for AuthError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::MissingCredential => write!(f, "missing credential"),
            Self::InvalidCredential(e) => write!(f, "invalid credential: {e}"),
        }
    }
}

impl std::error::Error for AuthError {}

/// Verifies (and, for tests and tooling, mints) gateway tokens.
pub struct TokenVerifier {
    encoding: EncodingKey,
    decoding: DecodingKey,
    validation: Validation,
}

impl TokenVerifier {
    pub fn new(secret: &str) -> Self {
        Self {
            encoding: EncodingKey::from_secret(secret.as_bytes()),
            decoding: DecodingKey::from_secret(secret.as_bytes()),
            validation: Validation::default(),
        }
    }

    /// Verify a bearer token and produce the session principal.
    pub fn verify(&self, token: &str) -> Result<Principal, AuthError> {
        let data = decode::<Claims>(token, &self.decoding, &self.validation)
            .map_err(|e| AuthError::InvalidCredential(e.to_string()))?;
        Ok(Principal {
            user_id: data.claims.sub,
            name: data.claims.name,
        })
    }

    /// Sign a token for `sub`, valid for `ttl`.
    pub fn issue(
        &self,
        sub: &str,
        name: Option<&str>,
        ttl: std::time::Duration,
    ) -> Result<String, AuthError> {
        let claims = Claims {
            sub: sub.to_string(),
            name: name.map(str::to_string),
            exp: Utc::now().timestamp() + ttl.as_secs() as i64,
        };
        encode(&Header::default(), &claims, &self.encoding)
            .map_err(|e| AuthError::InvalidCredential(e.to_string()))
    }
}

/// Strip the `Bearer ` scheme from an Authorization header value.
pub fn bearer_from_header(value: &str) -> Option<&str> {
    value
        .strip_prefix("Bearer ")
        .map(str::trim)
        .filter(|token| !token.is_empty())
}

/// Find a `token=` parameter in a raw query string.
pub fn token_from_query(query: &str) -> Option<&str> {
    query
        .split('&')
        .filter_map(|pair| pair.split_once('='))
        .find(|(key, _)| *key == "token")
        .map(|(_, value)| value)
        .filter(|token| !token.is_empty())
}
