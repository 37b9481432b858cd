//! User roles and the decisions derived from a set of them.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

use crate::types::CertificateFormat;

/// Matches any value in a role condition.
pub const WILDCARD: &str = "*";

pub const KIND_NODE: &str = "node";
pub const KIND_CERT_AUTHORITY: &str = "cert_authority";
pub const KIND_USER: &str = "user";
pub const KIND_TRUSTED_CLUSTER: &str = "trusted_cluster";
pub const KIND_TOKEN: &str = "token";

pub const VERB_LIST: &str = "list";
pub const VERB_READ: &str = "read";
pub const VERB_CREATE: &str = "create";
pub const VERB_UPDATE: &str = "update";
pub const VERB_ROTATE: &str = "rotate";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Role {
    pub name: String,
    #[serde(default)]
    pub options: RoleOptions,
    #[serde(default)]
    pub allow: RoleConditions,
}

impl Role {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            options: RoleOptions::default(),
            allow: RoleConditions::default(),
        }
    }

    /// A role that may do everything.
    pub fn admin(name: impl Into<String>) -> Self {
        let mut role = Self::new(name);
        role.allow.rules.push(Rule::new(&[WILDCARD], &[WILDCARD]));
        role.allow.logins.push("root".to_string());
        role.allow
            .cluster_labels
            .insert(WILDCARD.to_string(), vec![WILDCARD.to_string()]);
        role
    }

    pub fn with_max_session_ttl(mut self, ttl: Duration) -> Self {
        self.options.max_session_ttl = Some(ttl);
        self
    }

    pub fn with_logins(mut self, logins: &[&str]) -> Self {
        self.allow.logins = logins.iter().map(|s| s.to_string()).collect();
        self
    }

    pub fn with_rule(mut self, resources: &[&str], verbs: &[&str]) -> Self {
        self.allow.rules.push(Rule::new(resources, verbs));
        self
    }

    pub fn with_impersonate(mut self, users: &[&str], roles: &[&str]) -> Self {
        self.allow.impersonate = ImpersonateConditions {
            users: users.iter().map(|s| s.to_string()).collect(),
            roles: roles.iter().map(|s| s.to_string()).collect(),
        };
        self
    }

    pub fn with_request_roles(mut self, roles: &[&str]) -> Self {
        self.allow.request.roles = roles.iter().map(|s| s.to_string()).collect();
        self
    }

    pub fn with_cluster_label(mut self, key: &str, values: &[&str]) -> Self {
        self.allow.cluster_labels.insert(
            key.to_string(),
            values.iter().map(|s| s.to_string()).collect(),
        );
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoleOptions {
    /// Longest certificate a holder of this role may obtain. `None` uses the cluster default.
    #[serde(default)]
    pub max_session_ttl: Option<Duration>,
    #[serde(default = "default_true")]
    pub forward_agent: bool,
    #[serde(default)]
    pub permit_x11_forwarding: bool,
    #[serde(default)]
    pub certificate_format: CertificateFormat,
}

impl Default for RoleOptions {
    fn default() -> Self {
        Self {
            max_session_ttl: None,
            forward_agent: true,
            permit_x11_forwarding: false,
            certificate_format: CertificateFormat::Unspecified,
        }
    }
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoleConditions {
    #[serde(default)]
    pub logins: Vec<String>,
    #[serde(default)]
    pub impersonate: ImpersonateConditions,
    #[serde(default)]
    pub request: RequestConditions,
    /// Label selectors of trusted clusters this role may route to.
    #[serde(default)]
    pub cluster_labels: BTreeMap<String, Vec<String>>,
    #[serde(default)]
    pub rules: Vec<Rule>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImpersonateConditions {
    #[serde(default)]
    pub users: Vec<String>,
    #[serde(default)]
    pub roles: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestConditions {
    #[serde(default)]
    pub roles: Vec<String>,
    #[serde(default)]
    pub search_as_roles: Vec<String>,
}

/// Grants verbs on resource kinds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rule {
    pub resources: Vec<String>,
    pub verbs: Vec<String>,
}

impl Rule {
    pub fn new(resources: &[&str], verbs: &[&str]) -> Self {
        Self {
            resources: resources.iter().map(|s| s.to_string()).collect(),
            verbs: verbs.iter().map(|s| s.to_string()).collect(),
        }
    }

    pub fn matches(&self, resource: &str, verb: &str) -> bool {
        contains_or_wildcard(&self.resources, resource) && contains_or_wildcard(&self.verbs, verb)
    }
}

fn contains_or_wildcard(values: &[String], value: &str) -> bool {
    values.iter().any(|v| v == WILDCARD || v == value)
}

/// The roles a principal holds, resolved from their names.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RoleSet(Vec<Role>);

impl RoleSet {
    pub fn new(roles: Vec<Role>) -> Self {
        Self(roles)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Role> {
        self.0.iter()
    }

    pub fn names(&self) -> Vec<String> {
        self.0.iter().map(|r| r.name.clone()).collect()
    }

    /// The smallest session TTL of any role.
    pub fn max_session_ttl(&self, default: Duration) -> Duration {
        self.0
            .iter()
            .map(|r| r.options.max_session_ttl.unwrap_or(default))
            .min()
            .unwrap_or(default)
    }

    pub fn forward_agent(&self) -> bool {
        self.0.iter().any(|r| r.options.forward_agent)
    }

    pub fn permit_x11_forwarding(&self) -> bool {
        self.0.iter().any(|r| r.options.permit_x11_forwarding)
    }

    /// `OldSsh` only when every role asks for it.
    pub fn certificate_format(&self) -> CertificateFormat {
        if !self.0.is_empty()
            && self
                .0
                .iter()
                .all(|r| r.options.certificate_format == CertificateFormat::OldSsh)
        {
            CertificateFormat::OldSsh
        } else {
            CertificateFormat::Standard
        }
    }

    pub fn logins(&self) -> Vec<String> {
        let mut logins: Vec<String> = Vec::new();
        for login in self.0.iter().flat_map(|r| r.allow.logins.iter()) {
            if !logins.contains(login) {
                logins.push(login.clone());
            }
        }
        logins
    }

    pub fn allows(&self, resource: &str, verb: &str) -> bool {
        self.0
            .iter()
            .flat_map(|r| r.allow.rules.iter())
            .any(|rule| rule.matches(resource, verb))
    }

    /// Whether some role grants every verb on every resource.
    pub fn is_admin(&self) -> bool {
        self.0.iter().flat_map(|r| r.allow.rules.iter()).any(|rule| {
            rule.resources.iter().any(|r| r == WILDCARD) && rule.verbs.iter().any(|v| v == WILDCARD)
        })
    }

    /// Whether a single role lets its holder impersonate `user` holding all of `roles`.
    pub fn can_impersonate(&self, user: &str, roles: &[String]) -> bool {
        self.0.iter().any(|r| {
            let cond = &r.allow.impersonate;
            contains_or_wildcard(&cond.users, user)
                && roles.iter().all(|role| contains_or_wildcard(&cond.roles, role))
        })
    }

    /// Roles the holder may ask to assume through access requests.
    pub fn requestable_roles(&self) -> Vec<String> {
        let mut roles: Vec<String> = Vec::new();
        for role in self
            .0
            .iter()
            .flat_map(|r| r.allow.request.roles.iter().chain(r.allow.request.search_as_roles.iter()))
        {
            if !roles.contains(role) {
                roles.push(role.clone());
            }
        }
        roles
    }

    pub fn can_request(&self, role: &str) -> bool {
        contains_or_wildcard(&self.requestable_roles(), role)
    }

    /// Whether the holder may route to a cluster carrying `labels`.
    ///
    /// Unlabeled clusters are reachable by every role set.
    pub fn can_access_cluster(&self, labels: &BTreeMap<String, String>) -> bool {
        if labels.is_empty() {
            return true;
        }
        self.0.iter().any(|r| {
            let selectors = &r.allow.cluster_labels;
            !selectors.is_empty()
                && selectors.iter().all(|(key, values)| {
                    if key == WILDCARD {
                        return values.iter().any(|v| v == WILDCARD);
                    }
                    labels
                        .get(key)
                        .is_some_and(|actual| contains_or_wildcard(values, actual))
                })
        })
    }
}
