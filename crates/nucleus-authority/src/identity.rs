//! The identity encoded into every issued certificate.
//!
//! X.509 certificates carry it as a private extension under the nucleus arc
//! (`1.3.6.1.4.1.57212.2.1`): a DER UTF8String holding the JSON form below.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::builtin::BuiltinRole;
use crate::types::ResourceId;
use crate::{Error, Result};

/// OID of the identity extension.
pub const IDENTITY_EXTENSION_OID: &[u64] = &[1, 3, 6, 1, 4, 1, 57212, 2, 1];
const IDENTITY_EXTENSION_OID_STR: &str = "1.3.6.1.4.1.57212.2.1";

const UTF8_STRING_TAG: u8 = 0x0c;

/// Who a credential speaks for.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    pub username: String,
    /// Ordered, without duplicates.
    pub roles: Vec<String>,
    /// Set when the credential was issued to someone acting as `username`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub impersonator: Option<String>,
    pub expires: DateTime<Utc>,
    /// Expiry of the session before access requests were applied. Set on
    /// elevated credentials only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_expires: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub route_to_cluster: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub active_requests: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub allowed_resources: Vec<ResourceId>,
    /// Restricts which servers accept the credential. Empty means unrestricted.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub accepted_usage: Vec<String>,
    /// SSH logins, or host names for host credentials.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub principals: Vec<String>,
    /// Cluster whose CA issued the credential.
    pub cluster_name: String,
    /// Set for host credentials.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_role: Option<BuiltinRole>,
}

impl Identity {
    pub fn user(
        username: impl Into<String>,
        cluster_name: impl Into<String>,
        roles: Vec<String>,
        expires: DateTime<Utc>,
    ) -> Self {
        Self {
            username: username.into(),
            roles: dedup(roles),
            impersonator: None,
            expires,
            base_expires: None,
            route_to_cluster: None,
            active_requests: Vec::new(),
            allowed_resources: Vec::new(),
            accepted_usage: Vec::new(),
            principals: Vec::new(),
            cluster_name: cluster_name.into(),
            system_role: None,
        }
    }

    pub fn host(
        host_id: impl Into<String>,
        cluster_name: impl Into<String>,
        role: BuiltinRole,
        principals: Vec<String>,
        expires: DateTime<Utc>,
    ) -> Self {
        Self {
            principals: dedup(principals),
            system_role: Some(role),
            ..Self::user(host_id, cluster_name, vec![role.to_string()], expires)
        }
    }

    pub fn is_impersonated(&self) -> bool {
        self.impersonator.is_some()
    }

    pub(crate) fn to_extension(&self) -> Result<rcgen::CustomExtension> {
        let json = serde_json::to_vec(self)
            .map_err(|e| Error::Internal(format!("failed to encode identity: {e}")))?;
        Ok(rcgen::CustomExtension::from_oid_content(
            IDENTITY_EXTENSION_OID,
            encode_utf8_string(&json),
        ))
    }

    /// Reads the identity extension of a DER certificate. The chain is not checked.
    pub fn from_certificate_der(der: &[u8]) -> Result<Self> {
        let (_, cert) = x509_parser::parse_x509_certificate(der)
            .map_err(|e| Error::Certificate(format!("failed to parse certificate: {e}")))?;

        let ext = cert
            .extensions()
            .iter()
            .find(|ext| ext.oid.to_id_string() == IDENTITY_EXTENSION_OID_STR)
            .ok_or_else(|| Error::Certificate("certificate carries no identity".into()))?;

        let json = decode_utf8_string(ext.value)?;
        serde_json::from_slice(json)
            .map_err(|e| Error::Certificate(format!("malformed identity extension: {e}")))
    }
}

/// Removes duplicates, keeping the first occurrence of each value.
pub fn dedup(values: impl IntoIterator<Item = String>) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    for value in values {
        if !out.contains(&value) {
            out.push(value);
        }
    }
    out
}

fn encode_utf8_string(content: &[u8]) -> Vec<u8> {
    let mut out = vec![UTF8_STRING_TAG];
    let len = content.len();
    if len < 0x80 {
        out.push(len as u8);
    } else {
        let bytes: Vec<u8> = len
            .to_be_bytes()
            .into_iter()
            .skip_while(|b| *b == 0)
            .collect();
        out.push(0x80 | bytes.len() as u8);
        out.extend_from_slice(&bytes);
    }
    out.extend_from_slice(content);
    out
}

fn decode_utf8_string(der: &[u8]) -> Result<&[u8]> {
    let malformed = || Error::Certificate("malformed identity extension encoding".into());

    let (&tag, rest) = der.split_first().ok_or_else(malformed)?;
    if tag != UTF8_STRING_TAG {
        return Err(malformed());
    }
    let (&first, rest) = rest.split_first().ok_or_else(malformed)?;
    let (len, rest) = if first < 0x80 {
        (first as usize, rest)
    } else {
        let n = (first & 0x7f) as usize;
        if n == 0 || n > std::mem::size_of::<usize>() || rest.len() < n {
            return Err(malformed());
        }
        let len = rest[..n].iter().fold(0usize, |acc, b| (acc << 8) | *b as usize);
        (len, &rest[n..])
    };
    if rest.len() != len {
        return Err(malformed());
    }
    Ok(rest)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_roles_deduplicated_in_order() {
        let identity = Identity::user(
            "alice",
            "nucleus.local",
            vec!["dev".into(), "ops".into(), "dev".into()],
            Utc::now(),
        );
        assert_eq!(identity.roles, vec!["dev", "ops"]);
    }

    #[test]
    fn test_host_identity() {
        let identity = Identity::host(
            "00000000-0000-0000-0000-000000000000",
            "nucleus.local",
            BuiltinRole::Node,
            vec!["node-1".into(), "node-1".into()],
            Utc::now(),
        );
        assert_eq!(identity.roles, vec!["Node"]);
        assert_eq!(identity.principals, vec!["node-1"]);
        assert_eq!(identity.system_role, Some(BuiltinRole::Node));
    }

    #[test]
    fn test_utf8_string_encoding() {
        let short = b"{}".to_vec();
        assert_eq!(decode_utf8_string(&encode_utf8_string(&short)).unwrap(), &short[..]);

        let long = vec![b'a'; 1000];
        let encoded = encode_utf8_string(&long);
        assert_eq!(&encoded[..4], &[0x0c, 0x82, 0x03, 0xe8]);
        assert_eq!(decode_utf8_string(&encoded).unwrap(), &long[..]);
    }

    #[test]
    fn test_utf8_string_rejects_garbage() {
        assert!(decode_utf8_string(&[]).is_err());
        assert!(decode_utf8_string(&[0x04, 0x00]).is_err());
        assert!(decode_utf8_string(&[0x0c, 0x05, b'a']).is_err());
        assert!(decode_utf8_string(&[0x0c, 0x80]).is_err());
    }

    #[test]
    fn test_certificate_without_identity() {
        let id = crate::types::CertAuthId::new("nucleus.local", crate::types::CertAuthType::Host);
        let key =
            crate::keys::KeyPair::generate(&id, Utc::now(), std::time::Duration::from_secs(60))
                .unwrap();
        let err = Identity::from_certificate_der(&key.cert_der).unwrap_err();
        assert!(err.is_certificate());
    }
}
