//! Token handling for the server: short-lived email tokens (proving
//! control of an address) exchanged for long-lived access tokens, both
//! HS256 JWTs carrying the email. With auth disabled — development and
//! tests — the bearer token is simply taken to be the caller's email.

use chrono::Utc;
use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};

use crate::permissions::is_valid_email;

const ACCESS_TOKEN_TTL_SECS: u64 = 365 * 24 * 3600;

#[derive(Debug, Serialize, Deserialize)]
struct Claims {
    /// The user's email.
    sub: String,
    exp: u64,
    /// "email" (exchangeable only) or "access" (API-usable).
    typ: String,
}

#[derive(Clone)]
pub struct AuthService {
    encoding: EncodingKey,
    decoding: DecodingKey,
    enabled: bool,
    email_token_ttl_secs: u64,
}

impl AuthService {
    pub fn new(secret: &str, enabled: bool, email_token_ttl_secs: u64) -> AuthService {
        AuthService {
            encoding: EncodingKey::from_secret(secret.as_bytes()),
            decoding: DecodingKey::from_secret(secret.as_bytes()),
            enabled,
            email_token_ttl_secs,
        }
    }

    pub fn issue_email_token(&self, email: &str) -> Result<String, String> {
        self.issue(email, "email", self.email_token_ttl_secs)
    }

    pub fn issue_access_token(&self, email: &str) -> Result<String, String> {
        self.issue(email, "access", ACCESS_TOKEN_TTL_SECS)
    }

    fn issue(&self, email: &str, typ: &str, ttl_secs: u64) -> Result<String, String> {
        let claims = Claims {
            sub: email.to_string(),
            exp: Utc::now().timestamp() as u64 + ttl_secs,
            typ: typ.to_string(),
        };
        encode(&Header::default(), &claims, &self.encoding).map_err(|e| e.to_string())
    }

    /// Exchanges a valid email token for the email it certifies.
    pub fn validate_email_token(&self, token: &str) -> Result<String, String> {
        self.validate(token, "email")
    }

    /// Resolves a bearer token to the caller's email. This is the only
    /// authentication path for the sync endpoints.
    pub fn resolve_bearer(&self, token: &str) -> Result<String, String> {
        if !self.enabled {
            return if is_valid_email(token) {
                Ok(token.to_string())
            } else {
                Err("with auth disabled the bearer token must be an email".to_string())
            };
        }
        self.validate(token, "access")
    }

    fn validate(&self, token: &str, expected_typ: &str) -> Result<String, String> {
        let data = decode::<Claims>(token, &self.decoding, &Validation::default()).map_err(|e| e.to_string())?;
        if data.claims.typ != expected_typ {
            return Err(format!("expected a {expected_typ} token"));
        }
        Ok(data.claims.sub)
    }
}
