//! The authorized entry point.
//!
//! [`AuthService`] wires the components together and is the only surface
//! that takes a [`Caller`]: every operation resolves the caller, checks one
//! [`Action`] and only then delegates.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rand::RngCore;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use crate::authz::{has_admin_privilege, AuthContext, AuthorizationEngine, Caller};
use crate::builtin::{Action, BuiltinRole};
use crate::clock::{add, Clock};
use crate::config::AuthorityConfig;
use crate::impersonation::ImpersonationResolver;
use crate::issuer::{AppTokenRequest, CertIssuer, Certs, HostCertsRequest, UserCertsRequest};
use crate::jwt::{AppTokenClaims, JsonWebKey};
use crate::login::PasswordAuthenticator;
use crate::register::{RegisterUsingTokenRequest, RegistrationEndpoint};
use crate::rotation::{RotateRequest, RotationController};
use crate::session::{ExtendRequest, WebSession, WebSessionManager};
use crate::sshcert::SshCertificate;
use crate::store::{Backend, CertAuthorityStore};
use crate::trust::TrustManager;
use crate::types::{CertAuthId, CertAuthType, CertAuthority, ProvisionToken, RoleMapping};
use crate::{Error, Result};

/// Runs `fut`, failing with `Unavailable` once `deadline` has passed.
///
/// `fut` is dropped at the deadline. Only wrap work that has not committed a
/// write yet: a write that lands after the deadline would be reported as
/// failed although it happened.
pub async fn with_deadline<T>(deadline: Option<Duration>, fut: impl Future<Output = Result<T>>) -> Result<T> {
    match deadline {
        None => fut.await,
        Some(limit) => tokio::time::timeout(limit, fut)
            .await
            .map_err(|_| Error::Unavailable(format!("request deadline of {limit:?} exceeded")))?,
    }
}

pub struct AuthService {
    backend: Arc<dyn Backend>,
    clock: Arc<dyn Clock>,
    config: AuthorityConfig,
    rotation: Arc<RotationController>,
    trust: Arc<TrustManager>,
    authz: Arc<AuthorizationEngine>,
    issuer: Arc<CertIssuer>,
    passwords: PasswordAuthenticator,
    sessions: WebSessionManager,
    deadline: Option<Duration>,
}

impl AuthService {
    pub fn new<B: Backend + 'static>(backend: Arc<B>, clock: Arc<dyn Clock>, config: AuthorityConfig) -> Self {
        let cluster = config.cluster_name.clone();
        let store: Arc<dyn CertAuthorityStore> = backend.clone();
        let backend: Arc<dyn Backend> = backend;

        let rotation = RotationController::new(store, clock.clone(), &config);
        let trust = Arc::new(
            TrustManager::new(backend.clone(), &cluster).with_cas_retries(config.rotation.cas_retries),
        );
        let authz = Arc::new(AuthorizationEngine::new(
            backend.clone(),
            trust.clone(),
            &cluster,
            config.accepted_usage.clone(),
        ));
        let resolver = Arc::new(ImpersonationResolver::new(
            backend.clone(),
            authz.clone(),
            &cluster,
            config.certs.clone(),
        ));
        let issuer = Arc::new(CertIssuer::new(
            backend.clone(),
            clock.clone(),
            resolver,
            &cluster,
            config.certs.clone(),
        ));
        let passwords = PasswordAuthenticator::new(backend.clone(), clock.clone(), config.auth.clone());
        let sessions = WebSessionManager::new(
            backend.clone(),
            clock.clone(),
            authz.clone(),
            issuer.clone(),
            &cluster,
            config.auth.clone(),
            config.certs.default_max_session_ttl(),
        );

        Self {
            backend,
            clock,
            config,
            rotation,
            trust,
            authz,
            issuer,
            passwords,
            sessions,
            deadline: None,
        }
    }

    /// Bounds every certificate-producing operation by `deadline`.
    ///
    /// Rotation only waits on the deadline up to its write; a started write
    /// runs to completion.
    pub fn with_request_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = Some(deadline);
        self
    }

    /// Creates missing local CAs and applies the configured recording mode.
    pub async fn bootstrap(&self) -> Result<()> {
        self.rotation.ensure_cert_authorities().await?;
        self.backend
            .set_session_recording_mode(self.config.session_recording)
            .await?;
        info!(cluster = %self.config.cluster_name, "authority bootstrapped");
        Ok(())
    }

    pub fn cluster_name(&self) -> &str {
        &self.config.cluster_name
    }

    /// The rotation controller, for spawning its background loop.
    pub fn rotation(&self) -> &Arc<RotationController> {
        &self.rotation
    }

    pub async fn authorize(&self, caller: Caller, action: Action) -> Result<AuthContext> {
        self.authz.authorize(caller, action).await
    }

    /// Turns a presented X.509 certificate into a caller.
    pub async fn authenticate_tls(&self, cert_pem: &str) -> Result<Caller> {
        let identity = self.issuer.verify_tls_certificate(cert_pem).await?;
        Ok(match identity.system_role {
            Some(role) => Caller::Builtin {
                role,
                host_id: identity.username,
                cluster: identity.cluster_name,
            },
            None => Caller::User(identity),
        })
    }

    /// Verifies an SSH-form certificate against its cluster's trust set.
    pub async fn verify_ssh_certificate(&self, encoded: &str) -> Result<SshCertificate> {
        self.issuer.verify_ssh_certificate(encoded).await
    }

    pub async fn rotate_cert_authority(&self, caller: Caller, req: RotateRequest) -> Result<CertAuthority> {
        with_deadline(self.deadline, self.authorize(caller, Action::RotateCertAuthority)).await?;
        self.rotation.rotate_cert_authority(req).await
    }

    pub async fn generate_host_certs(&self, caller: Caller, req: &HostCertsRequest) -> Result<Certs> {
        with_deadline(self.deadline, async {
            let ctx = self.authorize(caller, Action::GenerateHostCerts).await?;
            self.issuer.generate_host_certs(&ctx, req).await
        })
        .await
    }

    pub async fn generate_user_certs(&self, caller: Caller, req: &UserCertsRequest) -> Result<Certs> {
        with_deadline(self.deadline, async {
            let ctx = self.authorize(caller, Action::GenerateUserCerts).await?;
            self.issuer.generate_user_certs(&ctx, req).await
        })
        .await
    }

    pub async fn generate_app_token(&self, caller: Caller, req: &AppTokenRequest) -> Result<String> {
        self.authorize(caller, Action::GenerateAppToken).await?;
        self.issuer.generate_app_token(req).await
    }

    pub async fn verify_app_token(
        &self,
        caller: Caller,
        token: &str,
        username: &str,
        uri: &str,
    ) -> Result<AppTokenClaims> {
        self.authorize(caller, Action::ReadCertAuthority).await?;
        self.issuer.verify_app_token(token, username, uri).await
    }

    pub async fn jwks(&self, caller: Caller) -> Result<Vec<JsonWebKey>> {
        self.authorize(caller, Action::ReadCertAuthority).await?;
        self.issuer.jwks().await
    }

    /// Reads a CA. Private keys are returned only to admins of this cluster.
    pub async fn get_cert_authority(&self, caller: Caller, id: &CertAuthId, load_secrets: bool) -> Result<CertAuthority> {
        let action = if load_secrets {
            Action::ReadCertAuthoritySecrets
        } else {
            Action::ReadCertAuthority
        };
        let ctx = self.authorize(caller, action).await?;
        if load_secrets && !has_admin_privilege(&ctx) {
            return Err(Error::AccessDenied(format!(
                "{} can not read cert authority secrets",
                ctx.caller.name()
            )));
        }

        let ca = self.backend.get_cert_authority(id).await?;
        Ok(if load_secrets { ca } else { ca.without_secrets() })
    }

    /// Writes a CA of this cluster, or updates the host CA of a trusted one.
    ///
    /// Remote user CAs and untrusted clusters go through [`trust`](Self::trust).
    /// The stored role map is never replaced here.
    pub async fn upsert_cert_authority(&self, caller: Caller, ca: CertAuthority) -> Result<CertAuthority> {
        let local = ca.domain() == self.config.cluster_name;
        let action = if local {
            Action::UpsertLocalCertAuthority
        } else {
            Action::UpsertRemoteCertAuthority
        };
        let ctx = self.authorize(caller, action).await?;
        ca.check()?;

        let stored = if local {
            self.trust.upsert_cert_authority(ca).await?
        } else {
            if ca.ca_type() != CertAuthType::Host {
                return Err(Error::AccessDenied(format!(
                    "{} can not write {} cert authorities of remote clusters",
                    ctx.caller.name(),
                    ca.ca_type()
                )));
            }
            match self.trust.rotate_external_cert_authority(ca).await {
                Err(e) if e.is_not_found() => {
                    return Err(Error::AccessDenied(format!(
                        "{} can not write cert authorities of untrusted clusters",
                        ctx.caller.name()
                    )))
                }
                result => result?,
            }
        };
        info!(ca = %stored.id, caller = %ctx.caller.name(), "upserted cert authority");
        Ok(stored)
    }

    /// Accepts a rotated CA pushed from a trusted cluster.
    pub async fn rotate_external_cert_authority(&self, caller: Caller, ca: CertAuthority) -> Result<CertAuthority> {
        let ctx = self.authz.resolve(caller).await?;
        let action = if ctx.cluster == ca.domain() {
            Action::RotateOwnExternalCertAuthority
        } else {
            Action::RotateForeignExternalCertAuthority
        };
        self.authz.check(&ctx, action)?;
        self.trust.rotate_external_cert_authority(ca).await
    }

    pub async fn trust(&self, caller: Caller, remote_cas: Vec<CertAuthority>, role_map: Vec<RoleMapping>) -> Result<()> {
        self.authorize(caller, Action::ManageTrust).await?;
        self.trust.trust(remote_cas, role_map).await
    }

    pub async fn untrust(&self, caller: Caller, domain: &str) -> Result<()> {
        self.authorize(caller, Action::ManageTrust).await?;
        self.trust.untrust(domain).await
    }

    pub async fn update_role_map(&self, caller: Caller, domain: &str, role_map: Vec<RoleMapping>) -> Result<()> {
        self.authorize(caller, Action::ManageTrust).await?;
        self.trust.update_role_map(domain, role_map).await
    }

    /// Creates a provisioning token hosts can join with.
    pub async fn generate_token(&self, caller: Caller, roles: Vec<BuiltinRole>, ttl: Duration) -> Result<ProvisionToken> {
        self.authorize(caller, Action::GenerateToken).await?;
        if roles.is_empty() {
            return Err(Error::BadParameter("a token needs at least one role".into()));
        }
        if let Some(role) = roles.iter().find(|r| !r.is_host_role()) {
            return Err(Error::BadParameter(format!("{role} is not a host role")));
        }

        let mut secret = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut secret);
        let token = ProvisionToken {
            token: hex::encode(secret),
            roles,
            expires: add(self.clock.now(), ttl)?,
        };
        self.backend.upsert_token(token.clone()).await?;
        info!(roles = ?token.roles, expires = %token.expires, "generated provisioning token");
        Ok(token)
    }

    /// Redeems a provisioning token for host credentials.
    pub async fn register_using_token(&self, req: RegisterUsingTokenRequest) -> Result<Certs> {
        with_deadline(self.deadline, async {
            self.check_token(&req.token, req.host.role, self.clock.now()).await?;
            let ctx = self.authz.resolve(self.internal_caller()).await?;
            let certs = self.issuer.generate_host_certs(&ctx, &req.host).await?;
            info!(host = %req.host.host_id, role = %req.host.role, "host joined with token");
            Ok(certs)
        })
        .await
    }

    /// Checks a password and starts a web session. Called by the proxy on
    /// behalf of a browser.
    pub async fn authenticate_web_user(&self, caller: Caller, username: &str, password: &str) -> Result<WebSession> {
        self.authorize(caller, Action::CreateWebSession).await?;
        self.passwords.check_password(username, password).await?;
        self.sessions.create_web_session(username).await
    }

    pub async fn check_password(&self, caller: Caller, username: &str, password: &str) -> Result<()> {
        self.authorize_for_user(caller, username).await?;
        self.passwords.check_password(username, password).await
    }

    pub async fn upsert_password(&self, caller: Caller, username: &str, password: &str) -> Result<()> {
        self.authorize_for_user(caller, username).await?;
        self.passwords.upsert_password(username, password).await
    }

    /// Users may act on their own account; anyone else needs user management rights.
    async fn authorize_for_user(&self, caller: Caller, username: &str) -> Result<AuthContext> {
        let ctx = self.authz.resolve(caller).await?;
        let is_self = ctx.is_local() && ctx.identity().is_some_and(|id| id.username == username);
        if !is_self {
            self.authz.check(&ctx, Action::ManageUsers)?;
        }
        Ok(ctx)
    }

    pub async fn extend_web_session(&self, caller: Caller, id: &str, req: ExtendRequest) -> Result<WebSession> {
        let username = self.session_owner(caller).await?;
        self.sessions.extend_web_session(&username, id, req).await
    }

    pub async fn get_web_session(&self, caller: Caller, id: &str) -> Result<WebSession> {
        let username = self.session_owner(caller).await?;
        self.sessions.get_web_session(&username, id).await
    }

    pub async fn delete_web_session(&self, caller: Caller, id: &str) -> Result<()> {
        let username = self.session_owner(caller).await?;
        self.sessions.delete_web_session(&username, id).await
    }

    async fn session_owner(&self, caller: Caller) -> Result<String> {
        let ctx = self.authorize(caller, Action::CreateWebSession).await?;
        match ctx.identity() {
            Some(identity) if ctx.is_local() => Ok(identity.username.clone()),
            _ => Err(Error::AccessDenied("web sessions belong to local users".into())),
        }
    }

    async fn check_token(&self, token: &str, role: BuiltinRole, now: DateTime<Utc>) -> Result<()> {
        let stored = match self.backend.get_token(token).await {
            Ok(stored) => stored,
            Err(e) if e.is_not_found() => return Err(Error::AccessDenied("invalid provisioning token".into())),
            Err(e) => return Err(e),
        };
        if stored.expires <= now {
            self.backend.delete_token(token).await?;
            return Err(Error::AccessDenied("provisioning token has expired".into()));
        }
        if !stored.roles.contains(&role) {
            return Err(Error::AccessDenied(format!(
                "provisioning token does not allow joining as {role}"
            )));
        }
        Ok(())
    }

    fn internal_caller(&self) -> Caller {
        Caller::builtin(BuiltinRole::Auth, &self.config.cluster_name, &self.config.cluster_name)
    }
}

#[async_trait]
impl RegistrationEndpoint for AuthService {
    fn addr(&self) -> String {
        self.config.cluster_name.clone()
    }

    async fn cluster_ca_certs(&self) -> Result<Vec<Vec<u8>>> {
        let id = CertAuthId::new(&self.config.cluster_name, CertAuthType::Host);
        Ok(self.backend.get_cert_authority(&id).await?.trusted_cert_ders())
    }

    async fn register_using_token(&self, req: RegisterUsingTokenRequest) -> Result<Certs> {
        AuthService::register_using_token(self, req).await
    }
}
