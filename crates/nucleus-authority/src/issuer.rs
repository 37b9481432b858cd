//! Credential issuance and verification.
//!
//! Every credential is signed by the current signing key of one local CA:
//!
//! | credential        | CA         | form                                  |
//! |-------------------|------------|---------------------------------------|
//! | host certificate  | host       | X.509 (server + client auth) and SSH  |
//! | user certificate  | user       | X.509 (client auth) and SSH           |
//! | application token | JWT signer | compact ES256 JWS                     |
//!
//! Verification always goes against the full trust set of the issuing
//! cluster's CA as stored at that moment, so credentials signed by either key
//! of an in-progress rotation verify, and credentials of a dropped key do not.

use chrono::{DateTime, Utc};
use rcgen::{
    CertificateParams, DistinguishedName, DnType, ExtendedKeyUsagePurpose,
    KeyUsagePurpose, SanType, string::Ia5String,
};
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;
use rustls::pki_types::{CertificateDer, UnixTime};
use webpki::{anchor_from_trusted_cert, EndEntityCert, KeyUsage};

use crate::authz::{has_admin_privilege, AuthContext, Caller};
use crate::builtin::BuiltinRole;
use crate::clock::{add, Clock};
use crate::config::CertConfig;
use crate::csr::verify_csr;
use crate::identity::{dedup, Identity};
use crate::impersonation::ImpersonationResolver;
use crate::jwt::{self, AppTokenClaims, JsonWebKey};
use crate::keys::{to_offset, KeyPair, CLOCK_SKEW};
use crate::sshcert::{Permits, SshCertType, SshCertificate};
use crate::store::Backend;
use crate::types::{
    CertAuthId, CertAuthType, CertAuthority, CertificateFormat, SessionRecordingMode,
};
use crate::{Error, Result};

/// A host asking for its credentials.
#[derive(Debug, Clone)]
pub struct HostCertsRequest {
    pub host_id: String,
    pub node_name: String,
    pub role: BuiltinRole,
    pub additional_principals: Vec<String>,
    /// PEM CSR signed with the key to certify.
    pub public_key: String,
}

/// A user (or someone acting for one) asking for credentials.
#[derive(Debug, Clone)]
pub struct UserCertsRequest {
    pub username: String,
    /// PEM CSR signed with the key to certify.
    pub public_key: String,
    /// Requested expiry. Capped by policy.
    pub expires: DateTime<Utc>,
    pub format: CertificateFormat,
    pub route_to_cluster: Option<String>,
    pub access_request_ids: Vec<String>,
    /// Drop every active access request.
    pub switchback: bool,
    /// Restrict the certificate to these usages.
    pub usage: Vec<String>,
}

impl UserCertsRequest {
    pub fn new(username: impl Into<String>, public_key: impl Into<String>, expires: DateTime<Utc>) -> Self {
        Self {
            username: username.into(),
            public_key: public_key.into(),
            expires,
            format: CertificateFormat::Unspecified,
            route_to_cluster: None,
            access_request_ids: Vec::new(),
            switchback: false,
            usage: Vec::new(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct AppTokenRequest {
    pub username: String,
    pub roles: Vec<String>,
    /// Application URI; the token's audience.
    pub uri: String,
    pub expires: DateTime<Utc>,
}

/// Issued credentials.
#[derive(Debug, Clone)]
pub struct Certs {
    /// SSH-form certificate.
    pub ssh: String,
    /// PEM X.509 certificate.
    pub tls: String,
    /// PEM certificates of the cluster's host CA, for verifying servers.
    pub tls_ca_certs: Vec<String>,
    pub identity: Identity,
}

pub struct CertIssuer {
    backend: Arc<dyn Backend>,
    clock: Arc<dyn Clock>,
    resolver: Arc<ImpersonationResolver>,
    cluster_name: String,
    certs: CertConfig,
}

impl CertIssuer {
    pub fn new(
        backend: Arc<dyn Backend>,
        clock: Arc<dyn Clock>,
        resolver: Arc<ImpersonationResolver>,
        cluster_name: impl Into<String>,
        certs: CertConfig,
    ) -> Self {
        Self {
            backend,
            clock,
            resolver,
            cluster_name: cluster_name.into(),
            certs,
        }
    }

    pub async fn generate_host_certs(&self, ctx: &AuthContext, req: &HostCertsRequest) -> Result<Certs> {
        if !req.role.is_host_role() {
            return Err(Error::BadParameter(format!("{} is not a host role", req.role)));
        }
        if req.host_id.is_empty() {
            return Err(Error::BadParameter("host_id must not be empty".into()));
        }
        self.check_host_request(ctx, req).await?;

        let ca = self.local_ca(CertAuthType::Host).await?;
        let key = ca.signing_key()?;
        let now = self.clock.now();
        let expires = add(now, self.certs.host_cert_ttl())?.min(key.not_after);

        let principals = dedup(
            [
                req.host_id.clone(),
                format!("{}.{}", req.host_id, self.cluster_name),
                req.node_name.clone(),
            ]
            .into_iter()
            .chain(req.additional_principals.iter().cloned())
            .filter(|p| !p.is_empty()),
        );
        let identity = Identity::host(&req.host_id, &self.cluster_name, req.role, principals, expires);

        let certs = self
            .sign(
                &ca,
                key,
                &req.public_key,
                &identity,
                SshCertType::Host,
                CertificateFormat::Standard,
                Permits::default(),
                now,
            )
            .await?;
        debug!(host = %req.host_id, role = %req.role, expires = %expires, "issued host certificates");
        Ok(certs)
    }

    pub async fn generate_user_certs(&self, ctx: &AuthContext, req: &UserCertsRequest) -> Result<Certs> {
        let now = self.clock.now();
        let resolved = self.resolver.resolve(ctx, req, now).await?;

        let ca = self.local_ca(CertAuthType::User).await?;
        let key = ca.signing_key()?;
        let mut identity = resolved.identity;
        identity.expires = identity.expires.min(key.not_after);
        if identity.expires <= now {
            return Err(Error::BadParameter(format!(
                "certificate for {} would already be expired",
                identity.username
            )));
        }

        let format = match req.format {
            CertificateFormat::Unspecified => resolved.roles.certificate_format(),
            format => format,
        };
        let permits = Permits {
            agent_forwarding: resolved.roles.forward_agent(),
            x11_forwarding: resolved.roles.permit_x11_forwarding(),
        };

        let certs = self
            .sign(&ca, key, &req.public_key, &identity, SshCertType::User, format, permits, now)
            .await?;
        debug!(
            user = %certs.identity.username,
            impersonator = ?certs.identity.impersonator,
            expires = %certs.identity.expires,
            "issued user certificates"
        );
        Ok(certs)
    }

    /// Signs an application token with the JWT signer CA.
    pub async fn generate_app_token(&self, req: &AppTokenRequest) -> Result<String> {
        if req.username.is_empty() || req.uri.is_empty() {
            return Err(Error::BadParameter("username and uri are required".into()));
        }
        let ca = self.local_ca(CertAuthType::JwtSigner).await?;
        let key = ca.signing_key()?;
        let now = self.clock.now();
        let expires = req.expires.min(key.not_after);
        if expires <= now {
            return Err(Error::BadParameter("token expiry must be in the future".into()));
        }

        let claims = AppTokenClaims {
            iss: self.cluster_name.clone(),
            sub: req.username.clone(),
            aud: req.uri.clone(),
            roles: req.roles.clone(),
            iat: now.timestamp(),
            nbf: now.timestamp(),
            exp: expires.timestamp(),
        };
        let token = jwt::encode_app_token(&claims, key)?;
        debug!(user = %req.username, uri = %req.uri, kid = %key.kid, "issued app token");
        Ok(token)
    }

    /// Accepts tokens signed by any key the JWT signer CA trusts right now.
    pub async fn verify_app_token(&self, token: &str, username: &str, uri: &str) -> Result<AppTokenClaims> {
        let ca = self.local_ca(CertAuthType::JwtSigner).await?;
        jwt::verify_app_token(token, ca.trusted_keys(), username, uri, self.clock.now())
            .map_err(bad_certificate)
    }

    /// Public keys of the JWT signer CA, for applications verifying tokens themselves.
    pub async fn jwks(&self) -> Result<Vec<JsonWebKey>> {
        let ca = self.local_ca(CertAuthType::JwtSigner).await?;
        ca.trusted_keys().map(JsonWebKey::from_key_pair).collect()
    }

    /// Verifies an X.509 certificate against its cluster's trust set and
    /// returns the identity it carries.
    pub async fn verify_tls_certificate(&self, cert_pem: &str) -> Result<Identity> {
        let der = pem::parse(cert_pem)
            .map_err(|e| Error::BadParameter(format!("failed to parse certificate PEM: {e}")))?
            .into_contents();
        let claimed = Identity::from_certificate_der(&der)?;
        let ca_type = match claimed.system_role {
            Some(_) => CertAuthType::Host,
            None => CertAuthType::User,
        };
        let ca = self.trusted_ca(&claimed.cluster_name, ca_type).await?;

        let anchor_ders: Vec<CertificateDer<'static>> = ca
            .trusted_cert_ders()
            .into_iter()
            .map(CertificateDer::from)
            .collect();
        let anchors = anchor_ders
            .iter()
            .map(|der| {
                anchor_from_trusted_cert(der)
                    .map(|anchor| anchor.to_owned())
                    .map_err(|e| Error::Internal(format!("invalid CA certificate in {}: {e:?}", ca.id)))
            })
            .collect::<Result<Vec<_>>>()?;

        let leaf = CertificateDer::from(der.clone());
        let end_entity = EndEntityCert::try_from(&leaf)
            .map_err(|e| Error::Certificate(format!("bad certificate: {e:?}")))?;
        let time = UnixTime::since_unix_epoch(Duration::from_secs(
            self.clock.now().timestamp().max(0) as u64,
        ));
        end_entity
            .verify_for_usage(
                webpki::ALL_VERIFICATION_ALGS,
                &anchors,
                &[],
                time,
                KeyUsage::client_auth(),
                None,
                None,
            )
            .map_err(|e| Error::Certificate(format!("bad certificate: {e:?}")))?;

        Ok(claimed)
    }

    /// Verifies an SSH-form certificate against its cluster's trust set.
    pub async fn verify_ssh_certificate(&self, encoded: &str) -> Result<SshCertificate> {
        let claimed = SshCertificate::parse_unverified(encoded)?;
        let ca_type = match claimed.cert_type {
            SshCertType::Host => CertAuthType::Host,
            SshCertType::User => CertAuthType::User,
        };
        let ca = self.trusted_ca(&claimed.cluster_name, ca_type).await?;
        SshCertificate::verify(encoded, ca.trusted_keys(), self.clock.now()).map_err(bad_certificate)
    }

    async fn check_host_request(&self, ctx: &AuthContext, req: &HostCertsRequest) -> Result<()> {
        if has_admin_privilege(ctx) {
            return Ok(());
        }
        let Caller::Builtin { role, host_id, .. } = &ctx.caller else {
            return Err(Error::AccessDenied("host certificates are issued to hosts".into()));
        };
        if *role == req.role && *host_id == req.host_id {
            return Ok(());
        }
        // A recording proxy terminates sessions and needs certificates for
        // the hosts it connects to.
        if *role == BuiltinRole::Proxy
            && self.backend.session_recording_mode().await? == SessionRecordingMode::Proxy
        {
            return Ok(());
        }
        Err(Error::AccessDenied(format!(
            "{role} {host_id} can not request {} certificates for {}",
            req.role, req.host_id
        )))
    }

    #[allow(clippy::too_many_arguments)]
    async fn sign(
        &self,
        ca: &CertAuthority,
        key: &KeyPair,
        csr_pem: &str,
        identity: &Identity,
        cert_type: SshCertType,
        format: CertificateFormat,
        permits: Permits,
        now: DateTime<Utc>,
    ) -> Result<Certs> {
        let mut csr = verify_csr(csr_pem)?;
        let not_before = now - CLOCK_SKEW;
        csr.request.params = leaf_params(identity, cert_type, not_before)?;
        let tls_der = key.sign_csr(&ca.id, &csr.request)?;

        let ssh = SshCertificate::from_identity(cert_type, identity, &csr.public_key, not_before, format, permits)?
            .sign(key)?;

        let host_ca = match ca.ca_type() {
            CertAuthType::Host => ca.clone(),
            _ => self.local_ca(CertAuthType::Host).await?,
        };

        Ok(Certs {
            ssh,
            tls: pem::encode(&pem::Pem::new("CERTIFICATE", tls_der)),
            tls_ca_certs: host_ca.trusted_keys().map(KeyPair::cert_pem).collect(),
            identity: identity.clone(),
        })
    }

    async fn local_ca(&self, ca_type: CertAuthType) -> Result<CertAuthority> {
        self.backend
            .get_cert_authority(&CertAuthId::new(&self.cluster_name, ca_type))
            .await
    }

    async fn trusted_ca(&self, cluster: &str, ca_type: CertAuthType) -> Result<CertAuthority> {
        match self.backend.get_cert_authority(&CertAuthId::new(cluster, ca_type)).await {
            Ok(ca) => Ok(ca),
            Err(e) if e.is_not_found() => Err(Error::ConnectionProblem(format!(
                "cluster {cluster} is not trusted"
            ))),
            Err(e) => Err(e),
        }
    }
}

fn bad_certificate(e: Error) -> Error {
    match e {
        Error::Certificate(msg) => Error::Certificate(format!("bad certificate: {msg}")),
        other => other,
    }
}

fn leaf_params(identity: &Identity, cert_type: SshCertType, not_before: DateTime<Utc>) -> Result<CertificateParams> {
    let mut params = CertificateParams::new(vec![])
        .map_err(|e| Error::Certificate(format!("failed to create params: {e}")))?;

    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, identity.username.clone());
    dn.push(DnType::OrganizationName, identity.cluster_name.clone());
    params.distinguished_name = dn;

    params.not_before = to_offset(not_before)?;
    params.not_after = to_offset(identity.expires)?;
    params.key_usages = vec![KeyUsagePurpose::DigitalSignature];
    params.extended_key_usages = match cert_type {
        SshCertType::Host => vec![
            ExtendedKeyUsagePurpose::ServerAuth,
            ExtendedKeyUsagePurpose::ClientAuth,
        ],
        SshCertType::User => vec![ExtendedKeyUsagePurpose::ClientAuth],
    };
    if cert_type == SshCertType::Host {
        params.subject_alt_names = identity
            .principals
            .iter()
            .filter_map(|p| match p.parse::<IpAddr>() {
                Ok(ip) => Some(SanType::IpAddress(ip)),
                Err(_) => Ia5String::try_from(p.as_str()).ok().map(SanType::DnsName),
            })
            .collect();
    }
    params.custom_extensions.push(identity.to_extension()?);
    Ok(params)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::authz::AuthorizationEngine;
    use crate::clock::ManualClock;
    use crate::config::AuthorityConfig;
    use crate::csr::CsrOptions;
    use crate::role::Role;
    use crate::rotation::{RotateRequest, RotationController};
    use crate::store::{CertAuthorityStore, ClusterConfigStore, MemoryBackend, RoleStore, UserStore};
    use crate::trust::TrustManager;
    use crate::types::{RotationPhase, User};
    use chrono::TimeZone;

    struct Fixture {
        issuer: CertIssuer,
        authz: Arc<AuthorizationEngine>,
        rotation: Arc<RotationController>,
        backend: Arc<MemoryBackend>,
        clock: ManualClock,
    }

    async fn fixture() -> Fixture {
        let config = AuthorityConfig::default();
        let backend = Arc::new(MemoryBackend::new());
        let clock = ManualClock::new(Utc.timestamp_opt(1_700_000_000, 0).unwrap());
        let rotation = RotationController::new(backend.clone(), Arc::new(clock.clone()), &config);
        rotation.ensure_cert_authorities().await.unwrap();

        backend.upsert_role(Role::new("dev").with_logins(&["alice"])).await.unwrap();
        backend.upsert_user(User::new("alice", &["dev"])).await.unwrap();

        let trust = Arc::new(TrustManager::new(backend.clone(), "nucleus.local"));
        let authz = Arc::new(AuthorizationEngine::new(backend.clone(), trust, "nucleus.local", vec![]));
        let resolver = Arc::new(ImpersonationResolver::new(
            backend.clone(),
            authz.clone(),
            "nucleus.local",
            config.certs.clone(),
        ));
        let issuer = CertIssuer::new(
            backend.clone(),
            Arc::new(clock.clone()),
            resolver,
            "nucleus.local",
            config.certs.clone(),
        );
        Fixture {
            issuer,
            authz,
            rotation,
            backend,
            clock,
        }
    }

    impl Fixture {
        async fn ctx(&self, caller: Caller) -> AuthContext {
            self.authz.resolve(caller).await.unwrap()
        }

        fn now(&self) -> DateTime<Utc> {
            self.clock.now()
        }

        async fn alice_certs(&self) -> Certs {
            let ctx = self.ctx(Caller::builtin(BuiltinRole::Admin, "admin", "nucleus.local")).await;
            let csr = CsrOptions::new("alice").generate().unwrap();
            let req = UserCertsRequest::new("alice", csr.csr(), self.now() + chrono::Duration::hours(1));
            self.issuer.generate_user_certs(&ctx, &req).await.unwrap()
        }
    }

    fn host_request(host_id: &str, role: BuiltinRole) -> HostCertsRequest {
        HostCertsRequest {
            host_id: host_id.into(),
            node_name: format!("{host_id}-name"),
            role,
            additional_principals: vec!["10.0.0.1".into()],
            public_key: CsrOptions::new(host_id).generate().unwrap().csr().to_string(),
        }
    }

    #[tokio::test]
    async fn test_host_certs_carry_identity() {
        let f = fixture().await;
        let ctx = f.ctx(Caller::builtin(BuiltinRole::Node, "node-1", "nucleus.local")).await;
        let certs = f
            .issuer
            .generate_host_certs(&ctx, &host_request("node-1", BuiltinRole::Node))
            .await
            .unwrap();

        let identity = f.issuer.verify_tls_certificate(&certs.tls).await.unwrap();
        assert_eq!(identity.system_role, Some(BuiltinRole::Node));
        assert!(identity.principals.contains(&"node-1.nucleus.local".to_string()));
        assert!(identity.principals.contains(&"10.0.0.1".to_string()));

        let ssh = f.issuer.verify_ssh_certificate(&certs.ssh).await.unwrap();
        assert_eq!(ssh.cert_type, SshCertType::Host);
        assert_eq!(certs.tls_ca_certs.len(), 1);
    }

    #[tokio::test]
    async fn test_host_cannot_request_for_other_host() {
        let f = fixture().await;
        let ctx = f.ctx(Caller::builtin(BuiltinRole::Node, "node-1", "nucleus.local")).await;

        let err = f
            .issuer
            .generate_host_certs(&ctx, &host_request("node-2", BuiltinRole::Node))
            .await
            .unwrap_err();
        assert!(err.is_access_denied());

        let err = f
            .issuer
            .generate_host_certs(&ctx, &host_request("node-1", BuiltinRole::Proxy))
            .await
            .unwrap_err();
        assert!(err.is_access_denied());
    }

    #[tokio::test]
    async fn test_recording_proxy_requests_for_other_hosts() {
        let f = fixture().await;
        let ctx = f.ctx(Caller::builtin(BuiltinRole::Proxy, "proxy-1", "nucleus.local")).await;
        let req = host_request("node-1", BuiltinRole::Node);

        assert!(f.issuer.generate_host_certs(&ctx, &req).await.unwrap_err().is_access_denied());

        f.backend
            .set_session_recording_mode(SessionRecordingMode::Proxy)
            .await
            .unwrap();
        assert!(f.issuer.generate_host_certs(&ctx, &req).await.is_ok());
    }

    #[tokio::test]
    async fn test_host_cert_expiry_capped_by_ca() {
        let mut config = AuthorityConfig::default();
        config.certs.ca_ttl_secs = 3600;
        let backend = Arc::new(MemoryBackend::new());
        let clock = ManualClock::new(Utc.timestamp_opt(1_700_000_000, 0).unwrap());
        let rotation = RotationController::new(backend.clone(), Arc::new(clock.clone()), &config);
        rotation.ensure_cert_authorities().await.unwrap();
        let trust = Arc::new(TrustManager::new(backend.clone(), "nucleus.local"));
        let authz = Arc::new(AuthorizationEngine::new(backend.clone(), trust, "nucleus.local", vec![]));
        let resolver = Arc::new(ImpersonationResolver::new(
            backend.clone(),
            authz.clone(),
            "nucleus.local",
            config.certs.clone(),
        ));
        let issuer = CertIssuer::new(backend.clone(), Arc::new(clock.clone()), resolver, "nucleus.local", config.certs);

        let ctx = authz
            .resolve(Caller::builtin(BuiltinRole::Node, "node-1", "nucleus.local"))
            .await
            .unwrap();
        let certs = issuer
            .generate_host_certs(&ctx, &host_request("node-1", BuiltinRole::Node))
            .await
            .unwrap();
        let ca = backend
            .get_cert_authority(&CertAuthId::new("nucleus.local", CertAuthType::Host))
            .await
            .unwrap();
        assert!(certs.identity.expires <= ca.active_keys[0].not_after);
    }

    #[tokio::test]
    async fn test_user_certs_verify_through_rotation() {
        let f = fixture().await;
        let before = f.alice_certs().await;
        let rotate = |phase| RotateRequest::manual(CertAuthType::User, phase);

        f.rotation.rotate_cert_authority(rotate(RotationPhase::Init)).await.unwrap();
        assert!(f.issuer.verify_tls_certificate(&before.tls).await.is_ok());

        f.rotation.rotate_cert_authority(rotate(RotationPhase::UpdateClients)).await.unwrap();
        let after = f.alice_certs().await;
        assert!(f.issuer.verify_tls_certificate(&before.tls).await.is_ok());
        assert!(f.issuer.verify_tls_certificate(&after.tls).await.is_ok());
        assert!(f.issuer.verify_ssh_certificate(&before.ssh).await.is_ok());

        f.rotation.rotate_cert_authority(rotate(RotationPhase::UpdateServers)).await.unwrap();
        f.rotation.rotate_cert_authority(rotate(RotationPhase::Standby)).await.unwrap();

        let err = f.issuer.verify_tls_certificate(&before.tls).await.unwrap_err();
        assert!(err.is_certificate());
        assert!(err.to_string().contains("bad certificate"));
        let err = f.issuer.verify_ssh_certificate(&before.ssh).await.unwrap_err();
        assert!(err.to_string().contains("bad certificate"));
        assert!(f.issuer.verify_tls_certificate(&after.tls).await.is_ok());
    }

    #[tokio::test]
    async fn test_expired_user_cert_rejected() {
        let f = fixture().await;
        let certs = f.alice_certs().await;
        f.clock.advance(chrono::Duration::hours(2));

        let err = f.issuer.verify_tls_certificate(&certs.tls).await.unwrap_err();
        assert!(err.is_certificate());
    }

    #[tokio::test]
    async fn test_app_token_round_trip_and_retirement() {
        let f = fixture().await;
        let req = AppTokenRequest {
            username: "alice".into(),
            roles: vec!["dev".into()],
            uri: "https://grafana.nucleus.local".into(),
            expires: f.now() + chrono::Duration::minutes(10),
        };
        let token = f.issuer.generate_app_token(&req).await.unwrap();
        let claims = f
            .issuer
            .verify_app_token(&token, "alice", "https://grafana.nucleus.local")
            .await
            .unwrap();
        assert_eq!(claims.roles, vec!["dev"]);
        assert_eq!(f.issuer.jwks().await.unwrap().len(), 1);

        let rotate = |phase| RotateRequest::manual(CertAuthType::JwtSigner, phase);
        for phase in [
            RotationPhase::Init,
            RotationPhase::UpdateClients,
            RotationPhase::UpdateServers,
        ] {
            f.rotation.rotate_cert_authority(rotate(phase)).await.unwrap();
            assert!(f
                .issuer
                .verify_app_token(&token, "alice", "https://grafana.nucleus.local")
                .await
                .is_ok());
            assert_eq!(f.issuer.jwks().await.unwrap().len(), 2);
        }

        f.rotation.rotate_cert_authority(rotate(RotationPhase::Standby)).await.unwrap();
        let err = f
            .issuer
            .verify_app_token(&token, "alice", "https://grafana.nucleus.local")
            .await
            .unwrap_err();
        assert!(err.is_certificate());
        assert_eq!(f.issuer.jwks().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_unknown_cluster_is_connection_problem() {
        let f = fixture().await;
        let certs = f.alice_certs().await;

        let mut claimed = SshCertificate::parse_unverified(&certs.ssh).unwrap();
        claimed.cluster_name = "nowhere.example".into();
        let ca = f.issuer.local_ca(CertAuthType::User).await.unwrap();
        let forged = claimed.sign(ca.signing_key().unwrap()).unwrap();

        let err = f.issuer.verify_ssh_certificate(&forged).await.unwrap_err();
        assert!(err.is_connection_problem());
    }
}
