//! Resource types shared by every component.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use crate::clock::{add, to_chrono};
use crate::keys::KeyPair;
use crate::{Error, Result};

/// Kind of certificate authority.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CertAuthType {
    /// Signs host certificates.
    Host,
    /// Signs user certificates.
    User,
    /// Signs application tokens.
    JwtSigner,
}

impl CertAuthType {
    pub const ALL: [CertAuthType; 3] = [CertAuthType::Host, CertAuthType::User, CertAuthType::JwtSigner];

    pub fn as_str(&self) -> &'static str {
        match self {
            CertAuthType::Host => "host",
            CertAuthType::User => "user",
            CertAuthType::JwtSigner => "jwt",
        }
    }
}

impl fmt::Display for CertAuthType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CertAuthType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "host" => Ok(CertAuthType::Host),
            "user" => Ok(CertAuthType::User),
            "jwt" => Ok(CertAuthType::JwtSigner),
            other => Err(Error::BadParameter(format!("unknown CA type: {other}"))),
        }
    }
}

/// Identifies a CA: the cluster domain that owns it and its kind.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CertAuthId {
    pub domain: String,
    pub ca_type: CertAuthType,
}

impl CertAuthId {
    pub fn new(domain: impl Into<String>, ca_type: CertAuthType) -> Self {
        Self {
            domain: domain.into(),
            ca_type,
        }
    }
}

impl fmt::Display for CertAuthId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.domain, self.ca_type)
    }
}

/// Phase of a CA rotation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RotationPhase {
    /// No rotation in progress.
    #[default]
    Standby,
    /// New key exists and is trusted; old key still signs.
    Init,
    /// New key signs; clients re-fetch credentials.
    UpdateClients,
    /// Servers re-fetch credentials; old key still trusted.
    UpdateServers,
    /// Rotation abandoned; old key signs again.
    Rollback,
}

impl RotationPhase {
    pub const ALL: [RotationPhase; 5] = [
        RotationPhase::Standby,
        RotationPhase::Init,
        RotationPhase::UpdateClients,
        RotationPhase::UpdateServers,
        RotationPhase::Rollback,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            RotationPhase::Standby => "standby",
            RotationPhase::Init => "init",
            RotationPhase::UpdateClients => "update_clients",
            RotationPhase::UpdateServers => "update_servers",
            RotationPhase::Rollback => "rollback",
        }
    }

    /// The phase a forward rotation moves to from here.
    pub fn successor(&self) -> RotationPhase {
        match self {
            RotationPhase::Standby => RotationPhase::Init,
            RotationPhase::Init => RotationPhase::UpdateClients,
            RotationPhase::UpdateClients => RotationPhase::UpdateServers,
            RotationPhase::UpdateServers => RotationPhase::Standby,
            RotationPhase::Rollback => RotationPhase::Standby,
        }
    }
}

impl fmt::Display for RotationPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RotationPhase {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        RotationPhase::ALL
            .into_iter()
            .find(|p| p.as_str() == s)
            .ok_or_else(|| Error::BadParameter(format!("unknown rotation phase: {s}")))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RotationMode {
    #[default]
    Manual,
    Auto,
}

impl fmt::Display for RotationMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            RotationMode::Manual => "manual",
            RotationMode::Auto => "auto",
        })
    }
}

/// Deadlines of an automatic rotation, one per remaining phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RotationSchedule {
    pub update_clients: DateTime<Utc>,
    pub update_servers: DateTime<Utc>,
    pub standby: DateTime<Utc>,
}

impl RotationSchedule {
    /// Splits the grace period into thirds starting at `started`.
    pub fn generate(started: DateTime<Utc>, grace_period: Duration) -> Result<Self> {
        let third = grace_period / 3;
        Ok(Self {
            update_clients: add(started, third)?,
            update_servers: add(started, third * 2)?,
            standby: add(started, grace_period)?,
        })
    }

    /// The deadline after which auto mode leaves `phase`.
    pub fn deadline_after(&self, phase: RotationPhase) -> Option<DateTime<Utc>> {
        match phase {
            RotationPhase::Init => Some(self.update_clients),
            RotationPhase::UpdateClients => Some(self.update_servers),
            RotationPhase::UpdateServers => Some(self.standby),
            RotationPhase::Standby | RotationPhase::Rollback => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RotationState {
    pub phase: RotationPhase,
    pub mode: RotationMode,
    /// Identifier of the rotation in progress; empty at standby.
    #[serde(default)]
    pub current_id: String,
    #[serde(default)]
    pub started: Option<DateTime<Utc>>,
    #[serde(default)]
    pub grace_period: Duration,
    #[serde(default)]
    pub last_rotated: Option<DateTime<Utc>>,
    #[serde(default)]
    pub schedule: Option<RotationSchedule>,
}

impl Default for RotationState {
    fn default() -> Self {
        Self {
            phase: RotationPhase::Standby,
            mode: RotationMode::Manual,
            current_id: String::new(),
            started: None,
            grace_period: Duration::ZERO,
            last_rotated: None,
            schedule: None,
        }
    }
}

/// Maps roles of a trusted remote cluster onto local roles.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoleMapping {
    /// Remote role name, or `*` for any role.
    pub remote: String,
    pub local: Vec<String>,
}

impl RoleMapping {
    pub fn new(remote: impl Into<String>, local: &[&str]) -> Self {
        Self {
            remote: remote.into(),
            local: local.iter().map(|s| s.to_string()).collect(),
        }
    }
}

/// A certificate authority and its rotation state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CertAuthority {
    pub id: CertAuthId,
    /// Keys that sign and verify. The first one signs.
    pub active_keys: Vec<KeyPair>,
    /// Keys that only verify.
    #[serde(default)]
    pub additional_trusted_keys: Vec<KeyPair>,
    #[serde(default)]
    pub rotation: RotationState,
    /// Role map for user CAs imported from a trusted cluster.
    #[serde(default)]
    pub role_map: Vec<RoleMapping>,
    /// Compare-and-swap token, maintained by the store.
    #[serde(default)]
    pub resource_version: u64,
}

impl CertAuthority {
    pub fn new(id: CertAuthId, key: KeyPair) -> Self {
        Self {
            id,
            active_keys: vec![key],
            additional_trusted_keys: Vec::new(),
            rotation: RotationState::default(),
            role_map: Vec::new(),
            resource_version: 0,
        }
    }

    pub fn domain(&self) -> &str {
        &self.id.domain
    }

    pub fn ca_type(&self) -> CertAuthType {
        self.id.ca_type
    }

    /// The key that signs new credentials.
    pub fn signing_key(&self) -> Result<&KeyPair> {
        self.active_keys
            .first()
            .filter(|k| k.has_private_key())
            .ok_or_else(|| Error::Internal(format!("CA {} has no signing key", self.id)))
    }

    /// Active keys followed by additionally trusted keys.
    pub fn trusted_keys(&self) -> impl Iterator<Item = &KeyPair> {
        self.active_keys.iter().chain(self.additional_trusted_keys.iter())
    }

    pub fn find_key(&self, kid: &str) -> Option<&KeyPair> {
        self.trusted_keys().find(|k| k.kid == kid)
    }

    pub fn has_secrets(&self) -> bool {
        self.trusted_keys().any(|k| k.has_private_key())
    }

    pub fn without_secrets(&self) -> Self {
        Self {
            active_keys: self.active_keys.iter().map(KeyPair::without_secrets).collect(),
            additional_trusted_keys: self
                .additional_trusted_keys
                .iter()
                .map(KeyPair::without_secrets)
                .collect(),
            ..self.clone()
        }
    }

    /// Pins of the active CA certificates.
    pub fn pins(&self) -> Vec<String> {
        self.active_keys.iter().map(KeyPair::pin).collect()
    }

    /// DER CA certificates of every trusted key.
    pub fn trusted_cert_ders(&self) -> Vec<Vec<u8>> {
        self.trusted_keys().map(|k| k.cert_der.clone()).collect()
    }

    /// Root store for TLS verifiers built on rustls.
    pub fn root_cert_store(&self) -> Result<rustls::RootCertStore> {
        let mut store = rustls::RootCertStore::empty();
        for key in self.trusted_keys() {
            store
                .add(rustls::pki_types::CertificateDer::from(key.cert_der.clone()))
                .map_err(|e| Error::Certificate(format!("failed to add CA certificate: {e}")))?;
        }
        Ok(store)
    }

    /// Structural checks every stored CA satisfies.
    pub fn check(&self) -> Result<()> {
        if self.id.domain.is_empty() {
            return Err(Error::BadParameter("CA domain must not be empty".into()));
        }
        if self.active_keys.is_empty() {
            return Err(Error::BadParameter(format!("CA {} has no active keys", self.id)));
        }
        match self.rotation.phase {
            RotationPhase::Standby => {
                if self.active_keys.len() != 1 || !self.additional_trusted_keys.is_empty() {
                    return Err(Error::BadParameter(format!(
                        "CA {} at standby must have exactly one key",
                        self.id
                    )));
                }
            }
            _ => {
                if self.rotation.current_id.is_empty() || self.rotation.started.is_none() {
                    return Err(Error::BadParameter(format!(
                        "CA {} is rotating without a rotation id",
                        self.id
                    )));
                }
            }
        }
        Ok(())
    }
}

/// Session recording mode of the cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionRecordingMode {
    /// Nodes record their own sessions.
    #[default]
    Node,
    /// The proxy terminates and records sessions; it needs host certificates for any node.
    Proxy,
}

/// A cluster this cluster trusts, with labels used for route-to-cluster checks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteCluster {
    pub name: String,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
}

impl RemoteCluster {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            labels: BTreeMap::new(),
        }
    }

    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }
}

/// A single resource an access request grants.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ResourceId {
    pub cluster: String,
    pub kind: String,
    pub name: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestState {
    #[default]
    Pending,
    Approved,
    Denied,
}

/// A request for temporary elevation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessRequest {
    pub id: String,
    pub user: String,
    pub roles: Vec<String>,
    /// Non-empty for resource-scoped requests.
    #[serde(default)]
    pub resource_ids: Vec<ResourceId>,
    #[serde(default)]
    pub state: RequestState,
    #[serde(default)]
    pub access_expiry: Option<DateTime<Utc>>,
}

impl AccessRequest {
    pub fn new(user: impl Into<String>, roles: &[&str]) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            user: user.into(),
            roles: roles.iter().map(|s| s.to_string()).collect(),
            resource_ids: Vec::new(),
            state: RequestState::Pending,
            access_expiry: None,
        }
    }

    pub fn is_resource_request(&self) -> bool {
        !self.resource_ids.is_empty()
    }
}

/// Certificate format preference.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CertificateFormat {
    /// Use whatever the caller's roles ask for.
    #[default]
    Unspecified,
    /// Full metadata extensions.
    Standard,
    /// No metadata extensions, for clients that reject unknown ones.
    OldSsh,
}

/// A local user account.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub name: String,
    pub roles: Vec<String>,
    /// Argon2 PHC string.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password_hash: Option<String>,
}

impl User {
    pub fn new(name: impl Into<String>, roles: &[&str]) -> Self {
        Self {
            name: name.into(),
            roles: roles.iter().map(|s| s.to_string()).collect(),
            password_hash: None,
        }
    }
}

/// A one-time secret a host presents to join the cluster.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProvisionToken {
    pub token: String,
    pub roles: Vec<crate::builtin::BuiltinRole>,
    pub expires: DateTime<Utc>,
}

/// Outcome of one password check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoginAttempt {
    pub time: DateTime<Utc>,
    pub success: bool,
}

/// The earlier of `requested` and `now + ttl`.
pub(crate) fn cap_expiry(
    requested: DateTime<Utc>,
    now: DateTime<Utc>,
    ttl: Duration,
) -> Result<DateTime<Utc>> {
    let ceiling = now
        .checked_add_signed(to_chrono(ttl)?)
        .unwrap_or(DateTime::<Utc>::MAX_UTC);
    Ok(requested.min(ceiling))
}
