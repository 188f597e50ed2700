//! Bearer-token verification for the connection handshake.

use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::{DecodingKey, Validation, decode};
use thiserror::Error;

use banter_types::api::Claims;

/// Longest username the relay will admit.
pub const MAX_USERNAME_LEN: usize = 30;

/// Handshake failures. The display strings go out verbatim in the rejection
/// `error` frame, so they are part of the wire contract.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AuthError {
    #[error("Missing token")]
    MissingToken,
    #[error("Token expired")]
    Expired,
    #[error("Invalid token")]
    Invalid,
    #[error("Invalid username format")]
    BadUsername,
}

/// Validates HS256 tokens against the shared secret and extracts the
/// username from the `sub` claim.
pub struct AuthVerifier {
    key: DecodingKey,
    validation: Validation,
}

impl AuthVerifier {
    pub fn new(secret: &str) -> Self {
        Self {
            key: DecodingKey::from_secret(secret.as_bytes()),
            validation: Validation::default(),
        }
    }

    /// Decode the token and return the username it is bound to.
    pub fn verify(&self, token: &str) -> Result<String, AuthError> {
        let data = decode::<Claims>(token, &self.key, &self.validation).map_err(|e| {
            match e.kind() {
                ErrorKind::ExpiredSignature => AuthError::Expired,
                _ => AuthError::Invalid,
            }
        })?;
        let username = data.claims.sub;
        if !valid_username(&username) {
            return Err(AuthError::BadUsername);
        }
        Ok(username)
    }
}

/// Usernames are 1..=30 chars of `[A-Za-z0-9_]`. Anything else is refused at
/// the door, token signature or not.
pub fn valid_username(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= MAX_USERNAME_LEN
        && name.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'_')
}
