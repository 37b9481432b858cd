//! Effective identity of a user certificate request.
//!
//! A caller asks for certificates for some username. Depending on who the
//! caller is, that is a renewal of their own certificate, an admin issuing
//! on someone's behalf, or impersonation. The resolver works out which one
//! and produces the identity and role set the new certificate carries.
//!
//! Temporary elevation through approved access requests is modelled by
//! [`ElevationStack`]: an immutable list of applied requests layered over a
//! base identity and recomputed from scratch on every change.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::debug;

use crate::authz::{AuthContext, AuthorizationEngine, Caller};
use crate::builtin::BuiltinRole;
use crate::config::CertConfig;
use crate::identity::{dedup, Identity};
use crate::issuer::UserCertsRequest;
use crate::role::RoleSet;
use crate::store::Backend;
use crate::types::{cap_expiry, AccessRequest, RequestState, ResourceId};
use crate::{Error, Result};

/// Approved access requests applied over a base identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ElevationStack {
    base_roles: Vec<String>,
    base_expires: DateTime<Utc>,
    requests: Vec<AccessRequest>,
}

impl ElevationStack {
    pub fn new(base_roles: Vec<String>, base_expires: DateTime<Utc>) -> Self {
        Self {
            base_roles: dedup(base_roles),
            base_expires,
            requests: Vec::new(),
        }
    }

    /// Returns a new stack with `request` applied on top.
    ///
    /// `base` is the role set of the requesting user before elevation.
    pub fn apply(
        &self,
        request: &AccessRequest,
        user: &str,
        base: &RoleSet,
        now: DateTime<Utc>,
    ) -> Result<Self> {
        if self.requests.iter().any(|r| r.id == request.id) {
            return Ok(self.clone());
        }
        if request.user != user {
            return Err(Error::AccessDenied(format!(
                "access request {} belongs to {}",
                request.id, request.user
            )));
        }
        if request.state != RequestState::Approved {
            return Err(Error::AccessDenied(format!(
                "access request {} is not approved",
                request.id
            )));
        }
        if request.access_expiry.is_some_and(|expiry| expiry <= now) {
            return Err(Error::AccessDenied(format!(
                "access request {} has expired",
                request.id
            )));
        }
        if let Some(role) = request.roles.iter().find(|role| !base.can_request(role)) {
            return Err(Error::AccessDenied(format!(
                "{user} is not allowed to request role {role}"
            )));
        }
        if request.is_resource_request() && self.requests.iter().any(AccessRequest::is_resource_request) {
            return Err(Error::BadParameter(
                "only one resource access request can be active at a time".into(),
            ));
        }

        let mut next = self.clone();
        next.requests.push(request.clone());
        Ok(next)
    }

    /// Drops every applied request.
    pub fn switchback(&self) -> Self {
        Self {
            requests: Vec::new(),
            ..self.clone()
        }
    }

    pub fn is_elevated(&self) -> bool {
        !self.requests.is_empty()
    }

    pub fn base_roles(&self) -> &[String] {
        &self.base_roles
    }

    pub fn base_expires(&self) -> DateTime<Utc> {
        self.base_expires
    }

    pub fn roles(&self) -> Vec<String> {
        dedup(
            self.base_roles
                .iter()
                .chain(self.requests.iter().flat_map(|r| r.roles.iter()))
                .cloned(),
        )
    }

    /// The earliest of the base expiry and every request's access expiry.
    pub fn expires(&self) -> DateTime<Utc> {
        self.requests
            .iter()
            .filter_map(|r| r.access_expiry)
            .fold(self.base_expires, |earliest, expiry| earliest.min(expiry))
    }

    pub fn active_requests(&self) -> Vec<String> {
        self.requests.iter().map(|r| r.id.clone()).collect()
    }

    pub fn allowed_resources(&self) -> Vec<ResourceId> {
        self.requests
            .iter()
            .flat_map(|r| r.resource_ids.iter().cloned())
            .collect()
    }
}

/// Identity and roles a user certificate is issued with.
#[derive(Debug, Clone)]
pub struct ResolvedIdentity {
    pub identity: Identity,
    pub roles: RoleSet,
}

pub struct ImpersonationResolver {
    backend: Arc<dyn Backend>,
    authz: Arc<AuthorizationEngine>,
    cluster_name: String,
    certs: CertConfig,
}

/// How the caller relates to the requested user.
enum Issuance {
    SelfRenewal(Identity),
    Admin,
    Impersonation(String),
}

impl ImpersonationResolver {
    pub fn new(
        backend: Arc<dyn Backend>,
        authz: Arc<AuthorizationEngine>,
        cluster_name: impl Into<String>,
        certs: CertConfig,
    ) -> Self {
        Self {
            backend,
            authz,
            cluster_name: cluster_name.into(),
            certs,
        }
    }

    pub async fn resolve(
        &self,
        ctx: &AuthContext,
        req: &UserCertsRequest,
        now: DateTime<Utc>,
    ) -> Result<ResolvedIdentity> {
        let issuance = self.classify(ctx, &req.username)?;

        let (base_roles, request_ids) = match &issuance {
            Issuance::SelfRenewal(identity) => {
                let base = if ctx.is_local() {
                    self.backend.get_user(&identity.username).await?.roles
                } else {
                    ctx.roles.names()
                };
                let ids = if req.switchback {
                    req.access_request_ids.clone()
                } else {
                    dedup(
                        identity
                            .active_requests
                            .iter()
                            .chain(req.access_request_ids.iter())
                            .cloned(),
                    )
                };
                (base, ids)
            }
            Issuance::Admin | Issuance::Impersonation(_) => {
                let user = self.backend.get_user(&req.username).await?;
                if let Issuance::Impersonation(_) = &issuance {
                    if !ctx.roles.can_impersonate(&user.name, &user.roles) {
                        return Err(Error::AccessDenied(format!(
                            "{} is not allowed to impersonate {}",
                            ctx.caller.name(),
                            user.name
                        )));
                    }
                }
                (user.roles, req.access_request_ids.clone())
            }
        };
        let base_set = self.authz.load_roles(&base_roles).await?;

        let ttl = match issuance {
            Issuance::Admin => self.certs.max_admin_cert_ttl(),
            _ => base_set.max_session_ttl(self.certs.default_max_session_ttl()),
        };
        let mut expires = cap_expiry(req.expires, now, ttl)?;
        if let Issuance::SelfRenewal(identity) = &issuance {
            // Renewal never outlives the session; switching back restores its expiry.
            expires = expires.min(identity.base_expires.unwrap_or(identity.expires));
        }

        let mut stack = ElevationStack::new(base_roles, expires);
        for id in &request_ids {
            let request = self.backend.get_access_request(id).await?;
            stack = stack.apply(&request, &req.username, &base_set, now)?;
        }
        let roles = self.authz.load_roles(&stack.roles()).await?;

        let route_to_cluster = match req.route_to_cluster.as_deref() {
            None => None,
            Some(name) if name == self.cluster_name => Some(name.to_string()),
            Some(name) => {
                let cluster = self.backend.get_remote_cluster(name).await?;
                if !roles.can_access_cluster(&cluster.labels) {
                    return Err(Error::AccessDenied(format!(
                        "{} is not allowed to access cluster {name}",
                        req.username
                    )));
                }
                Some(name.to_string())
            }
        };

        let mut identity = Identity::user(&req.username, &self.cluster_name, stack.roles(), stack.expires());
        identity.impersonator = match issuance {
            Issuance::SelfRenewal(caller) => caller.impersonator,
            Issuance::Admin => None,
            Issuance::Impersonation(impersonator) => Some(impersonator),
        };
        identity.base_expires = stack.is_elevated().then(|| stack.base_expires());
        identity.route_to_cluster = route_to_cluster;
        identity.active_requests = stack.active_requests();
        identity.allowed_resources = stack.allowed_resources();
        identity.accepted_usage = req.usage.clone();
        identity.principals = roles.logins();

        debug!(
            user = %identity.username,
            impersonator = ?identity.impersonator,
            roles = ?identity.roles,
            expires = %identity.expires,
            "resolved certificate identity"
        );
        Ok(ResolvedIdentity { identity, roles })
    }

    fn classify(&self, ctx: &AuthContext, username: &str) -> Result<Issuance> {
        match &ctx.caller {
            Caller::Nop => Err(Error::AccessDenied("certificates require an identity".into())),
            Caller::Builtin { role, .. } => match role {
                BuiltinRole::Admin | BuiltinRole::Auth if ctx.is_local() => Ok(Issuance::Admin),
                _ => Err(Error::AccessDenied(format!(
                    "{role} can not generate user certificates"
                ))),
            },
            Caller::User(identity) if identity.username == username => {
                Ok(Issuance::SelfRenewal(identity.clone()))
            }
            Caller::User(identity) => {
                if identity.is_impersonated() {
                    return Err(Error::AccessDenied(
                        "impersonated user can not impersonate anyone else".into(),
                    ));
                }
                if !ctx.is_local() {
                    return Err(Error::AccessDenied(
                        "users of remote clusters can not impersonate".into(),
                    ));
                }
                Ok(Issuance::Impersonation(identity.username.clone()))
            }
        }
    }
}
