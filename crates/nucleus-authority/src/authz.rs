//! Caller resolution and authorization.
//!
//! Every request arrives with an authenticated [`Caller`]. The engine first
//! resolves it into an [`AuthContext`] (trust direction, effective roles) and
//! then checks actions against that context: builtin callers through the
//! fixed table in [`crate::builtin`], users through their role rules.

use std::sync::Arc;
use tracing::debug;

use crate::builtin::{builtin_allows, Action, BuiltinRole, TrustDirection};
use crate::identity::Identity;
use crate::role::{
    RoleSet, KIND_CERT_AUTHORITY, KIND_NODE, KIND_TOKEN, KIND_TRUSTED_CLUSTER, KIND_USER,
    VERB_CREATE, VERB_LIST, VERB_ROTATE, VERB_UPDATE,
};
use crate::store::Backend;
use crate::trust::TrustManager;
use crate::types::{CertAuthId, CertAuthType};
use crate::{Error, Result};

/// An authenticated principal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Caller {
    /// A cluster component presenting a host certificate.
    Builtin {
        role: BuiltinRole,
        host_id: String,
        /// Cluster that issued the caller's certificate.
        cluster: String,
    },
    User(Identity),
    /// Authenticated transport, no identity.
    Nop,
}

impl Caller {
    pub fn builtin(role: BuiltinRole, host_id: impl Into<String>, cluster: impl Into<String>) -> Self {
        Caller::Builtin {
            role,
            host_id: host_id.into(),
            cluster: cluster.into(),
        }
    }

    pub fn name(&self) -> &str {
        match self {
            Caller::Builtin { host_id, .. } => host_id,
            Caller::User(identity) => &identity.username,
            Caller::Nop => "",
        }
    }
}

/// A resolved caller.
#[derive(Debug, Clone)]
pub struct AuthContext {
    pub caller: Caller,
    pub direction: TrustDirection,
    /// Local roles. Empty for builtin callers.
    pub roles: RoleSet,
    /// Cluster the caller belongs to.
    pub cluster: String,
}

impl AuthContext {
    pub fn identity(&self) -> Option<&Identity> {
        match &self.caller {
            Caller::User(identity) => Some(identity),
            _ => None,
        }
    }

    pub fn builtin_role(&self) -> Option<BuiltinRole> {
        match &self.caller {
            Caller::Builtin { role, .. } => Some(*role),
            Caller::Nop => Some(BuiltinRole::Nop),
            Caller::User(_) => None,
        }
    }

    pub fn is_local(&self) -> bool {
        self.direction == TrustDirection::Local
    }
}

pub struct AuthorizationEngine {
    backend: Arc<dyn Backend>,
    trust: Arc<TrustManager>,
    cluster_name: String,
    accepted_usage: Vec<String>,
}

impl AuthorizationEngine {
    pub fn new(
        backend: Arc<dyn Backend>,
        trust: Arc<TrustManager>,
        cluster_name: impl Into<String>,
        accepted_usage: Vec<String>,
    ) -> Self {
        Self {
            backend,
            trust,
            cluster_name: cluster_name.into(),
            accepted_usage,
        }
    }

    /// Resolves the direction and effective roles of `caller`.
    ///
    /// Callers from a cluster with no trusted CA fail with `ConnectionProblem`.
    pub async fn resolve(&self, caller: Caller) -> Result<AuthContext> {
        match &caller {
            Caller::Nop => Ok(AuthContext {
                caller,
                direction: TrustDirection::Local,
                roles: RoleSet::default(),
                cluster: self.cluster_name.clone(),
            }),
            Caller::Builtin { cluster, .. } => {
                let cluster = cluster.clone();
                let direction = self.direction_of(&cluster, CertAuthType::Host).await?;
                Ok(AuthContext {
                    caller,
                    direction,
                    roles: RoleSet::default(),
                    cluster,
                })
            }
            Caller::User(identity) => {
                self.check_usage(identity)?;
                let cluster = identity.cluster_name.clone();
                let direction = self.direction_of(&cluster, CertAuthType::User).await?;

                let role_names = match direction {
                    TrustDirection::Local => identity.roles.clone(),
                    TrustDirection::Remote => {
                        let mapped = self.trust.map_remote_roles(&cluster, &identity.roles).await?;
                        if mapped.is_empty() {
                            return Err(Error::AccessDenied(format!(
                                "no roles of {}@{cluster} map to a local role",
                                identity.username
                            )));
                        }
                        mapped
                    }
                };
                let roles = self.load_roles(&role_names).await?;
                debug!(
                    user = %identity.username,
                    cluster = %cluster,
                    roles = ?roles.names(),
                    "resolved caller"
                );
                Ok(AuthContext {
                    caller,
                    direction,
                    roles,
                    cluster,
                })
            }
        }
    }

    /// Checks one action against a resolved context.
    pub fn check(&self, ctx: &AuthContext, action: Action) -> Result<()> {
        let allowed = match ctx.builtin_role() {
            Some(role) => builtin_allows(role, action, ctx.direction),
            None => user_allows(ctx, action),
        };
        if allowed {
            Ok(())
        } else {
            Err(Error::AccessDenied(format!(
                "{} is not allowed to perform {action:?}",
                describe(ctx)
            )))
        }
    }

    /// Resolves `caller` and checks `action` in one step.
    pub async fn authorize(&self, caller: Caller, action: Action) -> Result<AuthContext> {
        let ctx = self.resolve(caller).await?;
        self.check(&ctx, action)?;
        Ok(ctx)
    }

    pub async fn load_roles(&self, names: &[String]) -> Result<RoleSet> {
        let mut roles = Vec::with_capacity(names.len());
        for name in names {
            roles.push(self.backend.get_role(name).await?);
        }
        Ok(RoleSet::new(roles))
    }

    async fn direction_of(&self, cluster: &str, ca_type: CertAuthType) -> Result<TrustDirection> {
        if cluster == self.cluster_name {
            return Ok(TrustDirection::Local);
        }
        match self
            .backend
            .get_cert_authority(&CertAuthId::new(cluster, ca_type))
            .await
        {
            Ok(_) => Ok(TrustDirection::Remote),
            Err(e) if e.is_not_found() => Err(Error::ConnectionProblem(format!(
                "cluster {cluster} is not trusted"
            ))),
            Err(e) => Err(e),
        }
    }

    fn check_usage(&self, identity: &Identity) -> Result<()> {
        if identity.accepted_usage.is_empty() || identity.accepted_usage == self.accepted_usage {
            return Ok(());
        }
        Err(Error::AccessDenied(format!(
            "certificate is limited to {:?}",
            identity.accepted_usage
        )))
    }
}

/// Whether the context holds admin privilege in the local cluster.
pub fn has_admin_privilege(ctx: &AuthContext) -> bool {
    if !ctx.is_local() {
        return false;
    }
    match &ctx.caller {
        Caller::Builtin { role, .. } => matches!(role, BuiltinRole::Admin | BuiltinRole::Auth),
        Caller::User(_) => ctx.roles.is_admin(),
        Caller::Nop => false,
    }
}

fn user_allows(ctx: &AuthContext, action: Action) -> bool {
    use Action::*;

    if ctx.roles.is_empty() {
        return false;
    }
    let roles = &ctx.roles;

    match action {
        ReadClusterName | ReadCertAuthority | GenerateUserCerts | CreateWebSession => true,
        ListResources => roles.allows(KIND_NODE, VERB_LIST),
        // Remote users only read and log in.
        _ if !ctx.is_local() => false,
        ReadCertAuthoritySecrets | GenerateHostCerts | GenerateAppToken => roles.is_admin(),
        UpsertLocalCertAuthority | UpsertRemoteCertAuthority => {
            roles.allows(KIND_CERT_AUTHORITY, VERB_UPDATE)
        }
        RotateCertAuthority | RotateOwnExternalCertAuthority | RotateForeignExternalCertAuthority => {
            roles.allows(KIND_CERT_AUTHORITY, VERB_ROTATE)
        }
        ManageUsers => roles.allows(KIND_USER, VERB_UPDATE),
        ManageTrust => roles.allows(KIND_TRUSTED_CLUSTER, VERB_UPDATE),
        GenerateToken => roles.allows(KIND_TOKEN, VERB_CREATE),
    }
}

fn describe(ctx: &AuthContext) -> String {
    let direction = match ctx.direction {
        TrustDirection::Local => "local",
        TrustDirection::Remote => "remote",
    };
    match &ctx.caller {
        Caller::Builtin { role, host_id, .. } => format!("{direction} {role} {host_id}"),
        Caller::User(identity) => format!("{direction} user {}", identity.username),
        Caller::Nop => "unauthenticated caller".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::KeyPair;
    use crate::role::Role;
    use crate::store::{MemoryBackend, RoleStore};
    use crate::types::{CertAuthority, RoleMapping};
    use chrono::Utc;
    use std::time::Duration;

    async fn engine(accepted_usage: Vec<String>) -> (AuthorizationEngine, Arc<MemoryBackend>) {
        let backend = Arc::new(MemoryBackend::new());
        backend.upsert_role(Role::admin("admin")).await.unwrap();
        backend
            .upsert_role(Role::new("dev").with_rule(&[KIND_NODE], &[VERB_LIST]))
            .await
            .unwrap();
        let trust = Arc::new(TrustManager::new(backend.clone(), "nucleus.local"));
        (
            AuthorizationEngine::new(backend.clone(), trust, "nucleus.local", accepted_usage),
            backend,
        )
    }

    async fn trust_leaf(backend: &Arc<MemoryBackend>, role_map: Vec<RoleMapping>) {
        let trust = TrustManager::new(backend.clone(), "nucleus.local");
        let cas = [CertAuthType::Host, CertAuthType::User]
            .into_iter()
            .map(|ca_type| {
                let id = CertAuthId::new("leaf.example", ca_type);
                let key = KeyPair::generate(&id, Utc::now(), Duration::from_secs(3600)).unwrap();
                CertAuthority::new(id, key)
            })
            .collect();
        trust.trust(cas, role_map).await.unwrap();
    }

    fn user(name: &str, cluster: &str, roles: &[&str]) -> Caller {
        Caller::User(Identity::user(
            name,
            cluster,
            roles.iter().map(|r| r.to_string()).collect(),
            Utc::now() + chrono::Duration::hours(1),
        ))
    }

    #[tokio::test]
    async fn test_local_user_roles() {
        let (engine, _) = engine(vec![]).await;
        let ctx = engine.resolve(user("alice", "nucleus.local", &["dev"])).await.unwrap();

        assert!(ctx.is_local());
        assert!(engine.check(&ctx, Action::ListResources).is_ok());
        assert!(engine
            .check(&ctx, Action::ReadCertAuthoritySecrets)
            .unwrap_err()
            .is_access_denied());
        assert!(!has_admin_privilege(&ctx));

        let admin = engine.resolve(user("root", "nucleus.local", &["admin"])).await.unwrap();
        assert!(has_admin_privilege(&admin));
        assert!(engine.check(&admin, Action::RotateCertAuthority).is_ok());
    }

    #[tokio::test]
    async fn test_remote_user_without_role_map_denied() {
        let (engine, backend) = engine(vec![]).await;
        trust_leaf(&backend, vec![]).await;

        let err = engine
            .resolve(user("alice", "leaf.example", &["admin"]))
            .await
            .unwrap_err();
        assert!(err.is_access_denied());
    }

    #[tokio::test]
    async fn test_remote_user_mapped_roles() {
        let (engine, backend) = engine(vec![]).await;
        trust_leaf(&backend, vec![RoleMapping::new("admin", &["admin"])]).await;

        let ctx = engine
            .resolve(user("alice", "leaf.example", &["admin"]))
            .await
            .unwrap();
        assert_eq!(ctx.direction, TrustDirection::Remote);
        assert!(ctx.roles.is_admin());
        // Admin rules of a mapped role do not reach past reads.
        assert!(!has_admin_privilege(&ctx));
        assert!(engine
            .check(&ctx, Action::RotateCertAuthority)
            .unwrap_err()
            .is_access_denied());
        assert!(engine.check(&ctx, Action::ReadCertAuthority).is_ok());
    }

    #[tokio::test]
    async fn test_unknown_cluster_is_connection_problem() {
        let (engine, _) = engine(vec![]).await;

        let err = engine
            .resolve(user("alice", "nowhere.example", &["dev"]))
            .await
            .unwrap_err();
        assert!(err.is_connection_problem());

        let err = engine
            .resolve(Caller::builtin(BuiltinRole::Proxy, "proxy-1", "nowhere.example"))
            .await
            .unwrap_err();
        assert!(err.is_connection_problem());
    }

    #[tokio::test]
    async fn test_remote_builtin_roles() {
        let (engine, backend) = engine(vec![]).await;
        trust_leaf(&backend, vec![]).await;

        let proxy = engine
            .resolve(Caller::builtin(BuiltinRole::Proxy, "proxy-1", "leaf.example"))
            .await
            .unwrap();
        assert!(engine.check(&proxy, Action::ReadCertAuthority).is_ok());
        assert!(engine.check(&proxy, Action::ReadCertAuthoritySecrets).is_err());

        let auth = engine
            .resolve(Caller::builtin(BuiltinRole::Auth, "auth-1", "leaf.example"))
            .await
            .unwrap();
        assert!(!has_admin_privilege(&auth));
        assert!(engine
            .check(&auth, Action::ReadClusterName)
            .unwrap_err()
            .is_access_denied());
    }

    #[tokio::test]
    async fn test_accepted_usage_must_match_exactly() {
        let (engine, _) = engine(vec!["usage:kube".into()]).await;
        let mut identity = Identity::user(
            "alice",
            "nucleus.local",
            vec!["dev".into()],
            Utc::now() + chrono::Duration::hours(1),
        );

        assert!(engine.resolve(Caller::User(identity.clone())).await.is_ok());

        identity.accepted_usage = vec!["usage:kube".into()];
        assert!(engine.resolve(Caller::User(identity.clone())).await.is_ok());

        identity.accepted_usage = vec!["usage:apps".into()];
        assert!(engine
            .resolve(Caller::User(identity))
            .await
            .unwrap_err()
            .is_access_denied());
    }

    #[tokio::test]
    async fn test_user_with_no_roles_denied() {
        let (engine, _) = engine(vec![]).await;
        let ctx = engine.resolve(user("alice", "nucleus.local", &[])).await.unwrap();
        assert!(engine.check(&ctx, Action::ReadClusterName).is_err());
    }

    #[tokio::test]
    async fn test_nop_reads_cluster_name_only() {
        let (engine, _) = engine(vec![]).await;
        let ctx = engine.resolve(Caller::Nop).await.unwrap();
        assert!(engine.check(&ctx, Action::ReadClusterName).is_ok());
        assert!(engine.check(&ctx, Action::ReadCertAuthority).is_err());
    }
}
