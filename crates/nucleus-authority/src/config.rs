//! Configuration handling

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::types::SessionRecordingMode;
use crate::{Error, Result};

/// Main configuration file
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthorityConfig {
    /// Name of the local cluster; the domain of every local CA
    #[serde(default = "default_cluster_name")]
    pub cluster_name: String,

    /// Rotation settings
    #[serde(default)]
    pub rotation: RotationConfig,

    /// Certificate lifetime settings
    #[serde(default)]
    pub certs: CertConfig,

    /// Password and web session settings
    #[serde(default)]
    pub auth: AuthConfig,

    /// Initial session recording mode; changed at runtime through the backend
    #[serde(default)]
    pub session_recording: SessionRecordingMode,

    /// Usages this server accepts from certificates restricted to a usage set
    #[serde(default)]
    pub accepted_usage: Vec<String>,
}

impl Default for AuthorityConfig {
    fn default() -> Self {
        Self {
            cluster_name: default_cluster_name(),
            rotation: RotationConfig::default(),
            certs: CertConfig::default(),
            auth: AuthConfig::default(),
            session_recording: SessionRecordingMode::default(),
            accepted_usage: Vec::new(),
        }
    }
}

fn default_cluster_name() -> String {
    "nucleus.local".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RotationConfig {
    /// Grace period used when a rotation request does not name one
    #[serde(default = "default_grace_period_secs")]
    pub grace_period_secs: u64,

    /// How often the background loop checks auto rotation schedules
    #[serde(default = "default_check_interval_secs")]
    pub check_interval_secs: u64,

    /// Compare-and-swap attempts before a write gives up
    #[serde(default = "default_cas_retries")]
    pub cas_retries: u32,
}

impl Default for RotationConfig {
    fn default() -> Self {
        Self {
            grace_period_secs: default_grace_period_secs(),
            check_interval_secs: default_check_interval_secs(),
            cas_retries: default_cas_retries(),
        }
    }
}

impl RotationConfig {
    pub fn grace_period(&self) -> Duration {
        Duration::from_secs(self.grace_period_secs)
    }

    pub fn check_interval(&self) -> Duration {
        Duration::from_secs(self.check_interval_secs)
    }
}

fn default_grace_period_secs() -> u64 {
    30 * 3600
}
fn default_check_interval_secs() -> u64 {
    60
}
fn default_cas_retries() -> u32 {
    8
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CertConfig {
    /// Lifetime of host certificates
    #[serde(default = "default_host_cert_ttl_secs")]
    pub host_cert_ttl_secs: u64,

    /// Lifetime of CA certificates generated for new signing keys
    #[serde(default = "default_ca_ttl_secs")]
    pub ca_ttl_secs: u64,

    /// Hard ceiling for certificates issued to administrative callers
    #[serde(default = "default_max_admin_cert_ttl_secs")]
    pub max_admin_cert_ttl_secs: u64,

    /// Session TTL for roles that do not set one
    #[serde(default = "default_max_session_ttl_secs")]
    pub default_max_session_ttl_secs: u64,
}

impl Default for CertConfig {
    fn default() -> Self {
        Self {
            host_cert_ttl_secs: default_host_cert_ttl_secs(),
            ca_ttl_secs: default_ca_ttl_secs(),
            max_admin_cert_ttl_secs: default_max_admin_cert_ttl_secs(),
            default_max_session_ttl_secs: default_max_session_ttl_secs(),
        }
    }
}

impl CertConfig {
    pub fn host_cert_ttl(&self) -> Duration {
        Duration::from_secs(self.host_cert_ttl_secs)
    }

    pub fn ca_ttl(&self) -> Duration {
        Duration::from_secs(self.ca_ttl_secs)
    }

    pub fn max_admin_cert_ttl(&self) -> Duration {
        Duration::from_secs(self.max_admin_cert_ttl_secs)
    }

    pub fn default_max_session_ttl(&self) -> Duration {
        Duration::from_secs(self.default_max_session_ttl_secs)
    }
}

fn default_host_cert_ttl_secs() -> u64 {
    30 * 24 * 3600
}
fn default_ca_ttl_secs() -> u64 {
    10 * 365 * 24 * 3600
}
fn default_max_admin_cert_ttl_secs() -> u64 {
    365 * 24 * 3600
}
fn default_max_session_ttl_secs() -> u64 {
    30 * 3600
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthConfig {
    #[serde(default = "default_min_password_length")]
    pub min_password_length: usize,

    #[serde(default = "default_max_password_length")]
    pub max_password_length: usize,

    /// Lifetime of a freshly created web session
    #[serde(default = "default_web_session_ttl_secs")]
    pub web_session_ttl_secs: u64,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            min_password_length: default_min_password_length(),
            max_password_length: default_max_password_length(),
            web_session_ttl_secs: default_web_session_ttl_secs(),
        }
    }
}

impl AuthConfig {
    pub fn web_session_ttl(&self) -> Duration {
        Duration::from_secs(self.web_session_ttl_secs)
    }
}

fn default_min_password_length() -> usize {
    6
}
fn default_max_password_length() -> usize {
    128
}
fn default_web_session_ttl_secs() -> u64 {
    12 * 3600
}

impl AuthorityConfig {
    /// Load configuration from file, falling back to defaults when it does not exist
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path)?;
        let config: AuthorityConfig = toml::from_str(&content)
            .map_err(|e| Error::BadParameter(format!("invalid config {}: {e}", path.display())))?;
        config.validate()?;
        Ok(config)
    }

    /// Rejects settings the rest of the crate cannot operate with.
    pub fn validate(&self) -> Result<()> {
        if self.cluster_name.trim().is_empty() {
            return Err(Error::BadParameter("cluster_name must not be empty".into()));
        }
        if self.rotation.grace_period_secs == 0 {
            return Err(Error::BadParameter(
                "rotation.grace_period_secs must be positive".into(),
            ));
        }
        if self.rotation.check_interval_secs == 0 {
            return Err(Error::BadParameter(
                "rotation.check_interval_secs must be positive".into(),
            ));
        }
        if self.rotation.cas_retries == 0 {
            return Err(Error::BadParameter("rotation.cas_retries must be positive".into()));
        }
        if self.auth.min_password_length > self.auth.max_password_length {
            return Err(Error::BadParameter(format!(
                "auth.min_password_length ({}) exceeds auth.max_password_length ({})",
                self.auth.min_password_length, self.auth.max_password_length
            )));
        }
        if self.certs.host_cert_ttl_secs == 0 || self.certs.ca_ttl_secs == 0 {
            return Err(Error::BadParameter("certificate TTLs must be positive".into()));
        }
        Ok(())
    }
}
