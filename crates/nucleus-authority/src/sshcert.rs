//! SSH-form certificates.
//!
//! The SSH form carries the same identity as the X.509 form, laid out the
//! way SSH certificates are: a key id, principals, a validity window and
//! string extensions. It is serialized as JSON and signed as a compact JWS by
//! the same key generation that signs the X.509 form.

use base64::engine::general_purpose::{STANDARD, URL_SAFE_NO_PAD};
use base64::Engine;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::identity::Identity;
use crate::jwt;
use crate::keys::KeyPair;
use crate::types::CertificateFormat;
use crate::{Error, Result};

pub const EXT_PERMIT_PTY: &str = "permit-pty";
pub const EXT_PERMIT_PORT_FORWARDING: &str = "permit-port-forwarding";
pub const EXT_PERMIT_AGENT_FORWARDING: &str = "permit-agent-forwarding";
pub const EXT_PERMIT_X11_FORWARDING: &str = "permit-X11-forwarding";
pub const EXT_ROLES: &str = "nucleus-roles";
pub const EXT_IMPERSONATOR: &str = "nucleus-impersonator";
pub const EXT_ACTIVE_REQUESTS: &str = "nucleus-active-requests";
pub const EXT_ROUTE_TO_CLUSTER: &str = "nucleus-route-to-cluster";
pub const EXT_ALLOWED_RESOURCES: &str = "nucleus-allowed-resources";
pub const EXT_SYSTEM_ROLE: &str = "nucleus-system-role";

const TYP_SSH_CERT: &str = "nucleus-ssh-cert";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SshCertType {
    User,
    Host,
}

/// Forwarding permissions granted by the holder's roles.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Permits {
    pub agent_forwarding: bool,
    pub x11_forwarding: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SshCertificate {
    pub cert_type: SshCertType,
    pub key_id: String,
    /// Base64 of the certified public key.
    pub public_key: String,
    pub principals: Vec<String>,
    pub valid_after: i64,
    pub valid_before: i64,
    pub extensions: BTreeMap<String, String>,
    /// Cluster whose CA signed the certificate.
    pub cluster_name: String,
}

impl SshCertificate {
    /// Lays out `identity` as an SSH certificate.
    ///
    /// `format` must already be resolved; `Unspecified` is treated as `Standard`.
    pub fn from_identity(
        cert_type: SshCertType,
        identity: &Identity,
        public_key: &[u8],
        valid_after: DateTime<Utc>,
        format: CertificateFormat,
        permits: Permits,
    ) -> Result<Self> {
        let mut extensions = BTreeMap::new();

        if cert_type == SshCertType::User {
            extensions.insert(EXT_PERMIT_PTY.to_string(), String::new());
        }

        if format != CertificateFormat::OldSsh {
            if cert_type == SshCertType::User {
                extensions.insert(EXT_PERMIT_PORT_FORWARDING.to_string(), String::new());
                if permits.agent_forwarding {
                    extensions.insert(EXT_PERMIT_AGENT_FORWARDING.to_string(), String::new());
                }
                if permits.x11_forwarding {
                    extensions.insert(EXT_PERMIT_X11_FORWARDING.to_string(), String::new());
                }
                extensions.insert(EXT_ROLES.to_string(), to_json(&identity.roles)?);
            }
            if let Some(impersonator) = &identity.impersonator {
                extensions.insert(EXT_IMPERSONATOR.to_string(), impersonator.clone());
            }
            if !identity.active_requests.is_empty() {
                extensions.insert(
                    EXT_ACTIVE_REQUESTS.to_string(),
                    to_json(&identity.active_requests)?,
                );
            }
            if let Some(cluster) = &identity.route_to_cluster {
                extensions.insert(EXT_ROUTE_TO_CLUSTER.to_string(), cluster.clone());
            }
            if !identity.allowed_resources.is_empty() {
                extensions.insert(
                    EXT_ALLOWED_RESOURCES.to_string(),
                    to_json(&identity.allowed_resources)?,
                );
            }
            if let Some(role) = identity.system_role {
                extensions.insert(EXT_SYSTEM_ROLE.to_string(), role.to_string());
            }
        }

        Ok(Self {
            cert_type,
            key_id: identity.username.clone(),
            public_key: STANDARD.encode(public_key),
            principals: identity.principals.clone(),
            valid_after: valid_after.timestamp(),
            valid_before: identity.expires.timestamp(),
            extensions,
            cluster_name: identity.cluster_name.clone(),
        })
    }

    pub fn sign(&self, key: &KeyPair) -> Result<String> {
        let payload = serde_json::to_vec(self)
            .map_err(|e| Error::Internal(format!("failed to encode SSH certificate: {e}")))?;
        jwt::sign_es256(&payload, key, TYP_SSH_CERT)
    }

    /// Checks the signature against `keys` and the validity window against `now`.
    pub fn verify<'a>(
        encoded: &str,
        keys: impl IntoIterator<Item = &'a KeyPair>,
        now: DateTime<Utc>,
    ) -> Result<Self> {
        let (header, payload) = jwt::verify_es256(encoded, keys)?;
        if header.typ.as_deref() != Some(TYP_SSH_CERT) {
            return Err(Error::BadParameter("not an SSH certificate".into()));
        }
        let cert: SshCertificate = serde_json::from_slice(&payload)
            .map_err(|e| Error::BadParameter(format!("malformed SSH certificate: {e}")))?;

        let now = now.timestamp();
        if now < cert.valid_after || now >= cert.valid_before {
            return Err(Error::Certificate(
                "SSH certificate is expired or not yet valid".into(),
            ));
        }
        Ok(cert)
    }

    /// Decodes the certificate body without checking anything.
    pub fn parse_unverified(encoded: &str) -> Result<Self> {
        let payload_b64 = encoded
            .split('.')
            .nth(1)
            .ok_or_else(|| Error::BadParameter("malformed SSH certificate".into()))?;
        let payload = URL_SAFE_NO_PAD
            .decode(payload_b64)
            .map_err(|e| Error::BadParameter(format!("malformed SSH certificate: {e}")))?;
        serde_json::from_slice(&payload)
            .map_err(|e| Error::BadParameter(format!("malformed SSH certificate: {e}")))
    }

    pub fn has_extension(&self, name: &str) -> bool {
        self.extensions.contains_key(name)
    }

    /// Roles from the roles extension; empty if absent.
    pub fn roles(&self) -> Vec<String> {
        self.extensions
            .get(EXT_ROLES)
            .and_then(|json| serde_json::from_str(json).ok())
            .unwrap_or_default()
    }

    pub fn active_requests(&self) -> Vec<String> {
        self.extensions
            .get(EXT_ACTIVE_REQUESTS)
            .and_then(|json| serde_json::from_str(json).ok())
            .unwrap_or_default()
    }
}

fn to_json<T: Serialize>(value: &T) -> Result<String> {
    serde_json::to_string(value)
        .map_err(|e| Error::Internal(format!("failed to encode extension: {e}")))
}
