//! Browser sessions.
//!
//! A web session holds a private key and user certificates issued for it.
//! Extending a session re-issues the certificates, optionally applying an
//! approved access request or switching back to the base roles. Each
//! extension gets a new session id; the login time never changes.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tracing::info;

use crate::authz::{AuthContext, AuthorizationEngine, Caller};
use crate::builtin::BuiltinRole;
use crate::clock::Clock;
use crate::config::AuthConfig;
use crate::csr::CsrOptions;
use crate::impersonation::ElevationStack;
use crate::issuer::{CertIssuer, UserCertsRequest};
use crate::store::Backend;
use crate::types::cap_expiry;
use crate::{Error, Result};

#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WebSession {
    pub id: String,
    pub user: String,
    pub login_time: DateTime<Utc>,
    pub expires: DateTime<Utc>,
    pub elevation: ElevationStack,
    /// SSH-form certificate.
    pub ssh_cert: String,
    /// PEM X.509 certificate.
    pub tls_cert: String,
    /// PEM private key the certificates certify.
    pub private_key: String,
}

impl fmt::Debug for WebSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WebSession")
            .field("id", &self.id)
            .field("user", &self.user)
            .field("login_time", &self.login_time)
            .field("expires", &self.expires)
            .field("elevation", &self.elevation)
            .field("private_key", &"[REDACTED]")
            .finish()
    }
}

impl WebSession {
    pub fn roles(&self) -> Vec<String> {
        self.elevation.roles()
    }
}

/// What to change when extending a session.
#[derive(Debug, Clone, Default)]
pub struct ExtendRequest {
    pub access_request_id: Option<String>,
    pub switchback: bool,
}

pub struct WebSessionManager {
    backend: Arc<dyn Backend>,
    clock: Arc<dyn Clock>,
    authz: Arc<AuthorizationEngine>,
    issuer: Arc<CertIssuer>,
    cluster_name: String,
    config: AuthConfig,
    default_max_session_ttl: std::time::Duration,
}

impl WebSessionManager {
    pub fn new(
        backend: Arc<dyn Backend>,
        clock: Arc<dyn Clock>,
        authz: Arc<AuthorizationEngine>,
        issuer: Arc<CertIssuer>,
        cluster_name: impl Into<String>,
        config: AuthConfig,
        default_max_session_ttl: std::time::Duration,
    ) -> Self {
        Self {
            backend,
            clock,
            authz,
            issuer,
            cluster_name: cluster_name.into(),
            config,
            default_max_session_ttl,
        }
    }

    /// Starts a session for a user who has already authenticated.
    pub async fn create_web_session(&self, username: &str) -> Result<WebSession> {
        let user = self.backend.get_user(username).await?;
        let roles = self.authz.load_roles(&user.roles).await?;
        let now = self.clock.now();

        let ttl = roles
            .max_session_ttl(self.default_max_session_ttl)
            .min(self.config.web_session_ttl());
        let expires = cap_expiry(DateTime::<Utc>::MAX_UTC, now, ttl)?;
        let elevation = ElevationStack::new(user.roles, expires);

        let session = self.issue(username, now, elevation).await?;
        info!(user = %username, session = %session.id, expires = %session.expires, "created web session");
        Ok(session)
    }

    pub async fn get_web_session(&self, username: &str, id: &str) -> Result<WebSession> {
        let session = self.backend.get_web_session(username, id).await?;
        if session.expires <= self.clock.now() {
            return Err(Error::AccessDenied(format!("web session {id} has expired")));
        }
        Ok(session)
    }

    pub async fn delete_web_session(&self, username: &str, id: &str) -> Result<()> {
        self.backend.delete_web_session(username, id).await?;
        info!(user = %username, session = %id, "deleted web session");
        Ok(())
    }

    /// Re-issues a session, applying `req` to its elevation.
    pub async fn extend_web_session(&self, username: &str, id: &str, req: ExtendRequest) -> Result<WebSession> {
        let previous = self.get_web_session(username, id).await?;
        let now = self.clock.now();

        let elevation = if req.switchback {
            previous.elevation.switchback()
        } else if let Some(request_id) = &req.access_request_id {
            let request = self.backend.get_access_request(request_id).await?;
            let base = self.authz.load_roles(previous.elevation.base_roles()).await?;
            previous.elevation.apply(&request, username, &base, now)?
        } else {
            previous.elevation.clone()
        };

        let session = self.issue(username, previous.login_time, elevation).await?;
        info!(
            user = %username,
            previous = %id,
            session = %session.id,
            roles = ?session.roles(),
            "extended web session"
        );
        Ok(session)
    }

    async fn issue(&self, username: &str, login_time: DateTime<Utc>, elevation: ElevationStack) -> Result<WebSession> {
        let key = CsrOptions::new(username).generate()?;
        let mut req = UserCertsRequest::new(username, key.csr(), elevation.expires());
        req.access_request_ids = elevation.active_requests();
        let certs = self.issuer.generate_user_certs(&self.auth_context().await?, &req).await?;

        let session = WebSession {
            id: uuid::Uuid::new_v4().to_string(),
            user: username.to_string(),
            login_time,
            expires: certs.identity.expires,
            elevation,
            ssh_cert: certs.ssh,
            tls_cert: certs.tls,
            private_key: key.private_key().to_string(),
        };
        self.backend.upsert_web_session(session.clone()).await?;
        Ok(session)
    }

    /// Sessions are issued by the authority itself.
    async fn auth_context(&self) -> Result<AuthContext> {
        self.authz
            .resolve(Caller::builtin(BuiltinRole::Auth, &self.cluster_name, &self.cluster_name))
            .await
    }
}
