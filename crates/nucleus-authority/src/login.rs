//! Local password authentication.
//!
//! Passwords are stored as Argon2id PHC strings. Every failed check is
//! recorded as a [`LoginAttempt`]; a successful one clears the record.

use argon2::password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString};
use argon2::Argon2;
use rand::rngs::OsRng;
use std::sync::Arc;
use tracing::{info, warn};

use crate::clock::Clock;
use crate::config::AuthConfig;
use crate::store::Backend;
use crate::types::LoginAttempt;
use crate::{Error, Result};

pub fn hash_password(password: &str) -> Result<String> {
    let salt = SaltString::generate(&mut OsRng);
    Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map(|hash| hash.to_string())
        .map_err(|e| Error::Internal(format!("password hashing failed: {e}")))
}

/// Checks `password` against a stored PHC string.
pub fn verify_password(password: &str, hash: &str) -> Result<bool> {
    let parsed = PasswordHash::new(hash)
        .map_err(|e| Error::Internal(format!("stored password hash is malformed: {e}")))?;
    Ok(Argon2::default()
        .verify_password(password.as_bytes(), &parsed)
        .is_ok())
}

pub fn check_password_bounds(password: &str, config: &AuthConfig) -> Result<()> {
    let len = password.chars().count();
    if len < config.min_password_length || len > config.max_password_length {
        return Err(Error::BadParameter(format!(
            "password must be between {} and {} characters",
            config.min_password_length, config.max_password_length
        )));
    }
    Ok(())
}

pub struct PasswordAuthenticator {
    backend: Arc<dyn Backend>,
    clock: Arc<dyn Clock>,
    config: AuthConfig,
}

impl PasswordAuthenticator {
    pub fn new(backend: Arc<dyn Backend>, clock: Arc<dyn Clock>, config: AuthConfig) -> Self {
        Self {
            backend,
            clock,
            config,
        }
    }

    pub async fn upsert_password(&self, username: &str, password: &str) -> Result<()> {
        check_password_bounds(password, &self.config)?;
        let mut user = self.backend.get_user(username).await?;
        user.password_hash = Some(hash_password(password)?);
        self.backend.upsert_user(user).await?;
        info!(user = %username, "password updated");
        Ok(())
    }

    /// Fails with `AccessDenied` on any mismatch, without telling unknown
    /// users apart from wrong passwords.
    pub async fn check_password(&self, username: &str, password: &str) -> Result<()> {
        check_password_bounds(password, &self.config)?;

        let matched = match self.backend.get_user(username).await {
            Ok(user) => match &user.password_hash {
                Some(hash) => verify_password(password, hash)?,
                None => false,
            },
            Err(e) if e.is_not_found() => false,
            Err(e) => return Err(e),
        };

        if matched {
            self.backend.delete_login_attempts(username).await?;
            return Ok(());
        }

        self.backend
            .add_login_attempt(
                username,
                LoginAttempt {
                    time: self.clock.now(),
                    success: false,
                },
            )
            .await?;
        let attempts = self.backend.get_login_attempts(username).await?.len();
        warn!(user = %username, attempts, "failed password check");
        Err(Error::AccessDenied("invalid username or password".into()))
    }
}
