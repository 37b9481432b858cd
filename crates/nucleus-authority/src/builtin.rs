//! Builtin system roles and the actions they may perform.
//!
//! Hosts and cluster components authenticate with certificates that carry a
//! [`BuiltinRole`] instead of user roles. What each of them may do is fixed
//! by [`builtin_allows`], an explicit `(role, action, direction)` table.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::{Error, Result};

/// Role of a cluster component.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BuiltinRole {
    /// Full control; used by local tooling.
    Admin,
    /// The authority service itself.
    Auth,
    Proxy,
    Node,
    App,
    /// Authenticated transport with no privileges.
    Nop,
}

impl BuiltinRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            BuiltinRole::Admin => "Admin",
            BuiltinRole::Auth => "Auth",
            BuiltinRole::Proxy => "Proxy",
            BuiltinRole::Node => "Node",
            BuiltinRole::App => "App",
            BuiltinRole::Nop => "Nop",
        }
    }

    /// Roles a host may join the cluster as.
    pub fn is_host_role(&self) -> bool {
        matches!(
            self,
            BuiltinRole::Auth | BuiltinRole::Proxy | BuiltinRole::Node | BuiltinRole::App
        )
    }
}

impl fmt::Display for BuiltinRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BuiltinRole {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "Admin" => Ok(BuiltinRole::Admin),
            "Auth" => Ok(BuiltinRole::Auth),
            "Proxy" => Ok(BuiltinRole::Proxy),
            "Node" => Ok(BuiltinRole::Node),
            "App" => Ok(BuiltinRole::App),
            "Nop" => Ok(BuiltinRole::Nop),
            other => Err(Error::BadParameter(format!("unknown builtin role: {other}"))),
        }
    }
}

/// Whether the caller belongs to this cluster or to a trusted one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TrustDirection {
    Local,
    Remote,
}

/// Operations subject to authorization.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Action {
    ReadClusterName,
    ListResources,
    ReadCertAuthority,
    ReadCertAuthoritySecrets,
    /// Write a CA whose domain is the local cluster.
    UpsertLocalCertAuthority,
    /// Write a CA whose domain is a trusted cluster.
    UpsertRemoteCertAuthority,
    RotateCertAuthority,
    /// Push rotation of the caller's own cluster CA into this cluster.
    RotateOwnExternalCertAuthority,
    /// Push rotation of some other cluster's CA into this cluster.
    RotateForeignExternalCertAuthority,
    GenerateHostCerts,
    GenerateUserCerts,
    GenerateAppToken,
    CreateWebSession,
    ManageUsers,
    ManageTrust,
    GenerateToken,
}

/// The builtin role action table.
pub fn builtin_allows(role: BuiltinRole, action: Action, direction: TrustDirection) -> bool {
    use Action::*;

    match (direction, role) {
        (TrustDirection::Local, BuiltinRole::Admin | BuiltinRole::Auth) => true,
        (TrustDirection::Local, BuiltinRole::Proxy) => matches!(
            action,
            ReadClusterName
                | ListResources
                | ReadCertAuthority
                | UpsertRemoteCertAuthority
                | GenerateHostCerts
                | CreateWebSession
        ),
        (TrustDirection::Local, BuiltinRole::Node) => matches!(
            action,
            ReadClusterName | ListResources | ReadCertAuthority | GenerateHostCerts
        ),
        (TrustDirection::Local, BuiltinRole::App) => matches!(
            action,
            ReadClusterName | ReadCertAuthority | GenerateHostCerts | GenerateAppToken
        ),
        (TrustDirection::Local, BuiltinRole::Nop) => matches!(action, ReadClusterName),

        (TrustDirection::Remote, BuiltinRole::Proxy) => matches!(
            action,
            ReadClusterName | ListResources | ReadCertAuthority | RotateOwnExternalCertAuthority
        ),
        (TrustDirection::Remote, BuiltinRole::Node) => matches!(action, ReadClusterName),
        // Remote auth servers, admins and the rest never act in this cluster.
        (TrustDirection::Remote, _) => false,
    }
}
