//! Cross-cluster trust.
//!
//! Trusting a remote cluster means storing the public half of its host and
//! user CAs under the remote domain, plus a role map that translates the
//! roles in its user certificates into local roles. A remote user whose
//! roles map to nothing holds zero roles here.

use std::sync::Arc;
use tracing::info;

use crate::config::RotationConfig;
use crate::identity::dedup;
use crate::role::WILDCARD;
use crate::store::{update_cert_authority, Backend};
use crate::types::{CertAuthId, CertAuthType, CertAuthority, RemoteCluster, RoleMapping};
use crate::{Error, Result};

pub struct TrustManager {
    backend: Arc<dyn Backend>,
    cluster_name: String,
    cas_retries: u32,
}

impl TrustManager {
    pub fn new(backend: Arc<dyn Backend>, cluster_name: impl Into<String>) -> Self {
        Self {
            backend,
            cluster_name: cluster_name.into(),
            cas_retries: RotationConfig::default().cas_retries,
        }
    }

    /// Attempts per write before a conflicting writer makes it fail with `Unavailable`.
    pub fn with_cas_retries(mut self, cas_retries: u32) -> Self {
        self.cas_retries = cas_retries;
        self
    }

    /// Imports the host and user CAs of one remote cluster.
    ///
    /// Private keys are dropped. `role_map` is stored on the user CA.
    pub async fn trust(&self, remote_cas: Vec<CertAuthority>, role_map: Vec<RoleMapping>) -> Result<()> {
        let domain = match remote_cas.first() {
            Some(ca) => ca.domain().to_string(),
            None => return Err(Error::BadParameter("no cert authorities to trust".into())),
        };
        if domain == self.cluster_name {
            return Err(Error::BadParameter(format!(
                "{domain} is the local cluster and can not be trusted as remote"
            )));
        }

        for ca in &remote_cas {
            if ca.domain() != domain {
                return Err(Error::BadParameter(format!(
                    "cert authorities of {domain} and {} can not be trusted together",
                    ca.domain()
                )));
            }
            if ca.ca_type() == CertAuthType::JwtSigner {
                return Err(Error::BadParameter(format!(
                    "{} CAs of remote clusters are not trusted",
                    ca.ca_type()
                )));
            }
        }

        for ca in remote_cas {
            let ca = ca.without_secrets();
            let ca_role_map = match ca.ca_type() {
                CertAuthType::User => role_map.clone(),
                _ => Vec::new(),
            };
            self.put(ca, Some(ca_role_map)).await?;
        }

        let cluster = match self.backend.get_remote_cluster(&domain).await {
            Ok(existing) => existing,
            Err(e) if e.is_not_found() => RemoteCluster::new(&domain),
            Err(e) => return Err(e),
        };
        self.backend.upsert_remote_cluster(cluster).await?;

        info!(cluster = %domain, role_mappings = role_map.len(), "trusted remote cluster");
        Ok(())
    }

    /// Removes every trace of a remote cluster.
    pub async fn untrust(&self, domain: &str) -> Result<()> {
        if domain == self.cluster_name {
            return Err(Error::BadParameter("the local cluster can not be untrusted".into()));
        }

        let mut found = false;
        for ca_type in [CertAuthType::Host, CertAuthType::User] {
            match self
                .backend
                .delete_cert_authority(&CertAuthId::new(domain, ca_type))
                .await
            {
                Ok(()) => found = true,
                Err(e) if e.is_not_found() => {}
                Err(e) => return Err(e),
            }
        }
        match self.backend.delete_remote_cluster(domain).await {
            Ok(()) => found = true,
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e),
        }

        if !found {
            return Err(Error::NotFound(format!("remote cluster {domain}")));
        }
        info!(cluster = %domain, "untrusted remote cluster");
        Ok(())
    }

    pub async fn update_role_map(&self, domain: &str, role_map: Vec<RoleMapping>) -> Result<()> {
        let id = CertAuthId::new(domain, CertAuthType::User);
        self.update(&id, |current| CertAuthority {
            role_map: role_map.clone(),
            ..current.clone()
        })
        .await?;
        info!(cluster = %domain, role_mappings = role_map.len(), "updated role map");
        Ok(())
    }

    /// Translates the roles a remote user holds into local role names.
    pub async fn map_remote_roles(&self, domain: &str, remote_roles: &[String]) -> Result<Vec<String>> {
        let id = CertAuthId::new(domain, CertAuthType::User);
        let ca = match self.backend.get_cert_authority(&id).await {
            Ok(ca) => ca,
            Err(e) if e.is_not_found() => {
                return Err(Error::ConnectionProblem(format!("cluster {domain} is not trusted")))
            }
            Err(e) => return Err(e),
        };
        Ok(map_roles(&ca.role_map, remote_roles))
    }

    /// Replaces the key material and rotation state of a trusted remote CA.
    pub async fn rotate_external_cert_authority(&self, ca: CertAuthority) -> Result<CertAuthority> {
        if ca.domain() == self.cluster_name {
            return Err(Error::BadParameter(
                "the local cluster's cert authorities are rotated locally".into(),
            ));
        }

        let incoming = ca.without_secrets();
        let stored = self
            .update(&incoming.id, |current| with_key_material(current, &incoming, None))
            .await?;

        info!(
            ca = %stored.id,
            phase = %stored.rotation.phase,
            rotation_id = %stored.rotation.current_id,
            "rotated external cert authority"
        );
        Ok(stored)
    }

    /// Creates the CA, or replaces the key material and rotation state of the
    /// stored one. A stored role map is kept.
    pub async fn upsert_cert_authority(&self, ca: CertAuthority) -> Result<CertAuthority> {
        self.put(ca, None).await
    }

    /// Creates `ca`, or folds its key material into the stored CA.
    ///
    /// `role_map` replaces the stored role map when given.
    async fn put(&self, ca: CertAuthority, role_map: Option<Vec<RoleMapping>>) -> Result<CertAuthority> {
        let mut created = ca.clone();
        if let Some(role_map) = &role_map {
            created.role_map = role_map.clone();
        }
        match self.backend.create_cert_authority(created).await {
            Err(e) if e.is_already_exists() => {}
            result => return result,
        }
        self.update(&ca.id, |current| with_key_material(current, &ca, role_map.clone()))
            .await
    }

    async fn update<F>(&self, id: &CertAuthId, mut apply: F) -> Result<CertAuthority>
    where
        F: FnMut(&CertAuthority) -> CertAuthority + Send,
    {
        update_cert_authority(self.backend.as_ref(), id, self.cas_retries, |current| {
            Ok(Some(apply(current)))
        })
        .await?
        .ok_or_else(|| Error::Internal(format!("cert authority {id} was not written")))
    }
}

/// `current` with the keys and rotation state of `incoming`.
fn with_key_material(
    current: &CertAuthority,
    incoming: &CertAuthority,
    role_map: Option<Vec<RoleMapping>>,
) -> CertAuthority {
    CertAuthority {
        active_keys: incoming.active_keys.clone(),
        additional_trusted_keys: incoming.additional_trusted_keys.clone(),
        rotation: incoming.rotation.clone(),
        role_map: role_map.unwrap_or_else(|| current.role_map.clone()),
        ..current.clone()
    }
}

fn map_roles(role_map: &[RoleMapping], remote_roles: &[String]) -> Vec<String> {
    let mapped = remote_roles.iter().flat_map(|remote| {
        role_map
            .iter()
            .filter(move |m| m.remote == WILDCARD || &m.remote == remote)
            .flat_map(|m| m.local.iter().cloned())
    });
    dedup(mapped)
}
