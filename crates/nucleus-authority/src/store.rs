//! Storage collaborators.
//!
//! Durable storage is out of this crate's hands; components talk to it
//! through these narrow traits. Certificate authorities are versioned:
//! every write is a compare-and-swap against the `resource_version` that the
//! writer read, so concurrent rotations never interleave partial states.
//!
//! [`MemoryBackend`] implements every trait in process and is what tests and
//! the CLI run against.

use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};
use tokio::sync::broadcast;
use tracing::debug;

use crate::role::Role;
use crate::session::WebSession;
use crate::types::{
    AccessRequest, CertAuthId, CertAuthType, CertAuthority, LoginAttempt, ProvisionToken,
    RemoteCluster, SessionRecordingMode, User,
};
use crate::{Error, Result};

const EVENT_CHANNEL_CAPACITY: usize = 64;

/// A change to a stored CA, as seen by watchers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CertAuthorityEvent {
    /// Created or replaced. Carries the CA as stored.
    Put(CertAuthority),
    Deleted(CertAuthId),
}

#[async_trait]
pub trait CertAuthorityStore: Send + Sync {
    async fn get_cert_authority(&self, id: &CertAuthId) -> Result<CertAuthority>;

    async fn list_cert_authorities(&self, ca_type: CertAuthType) -> Result<Vec<CertAuthority>>;

    /// Fails with `AlreadyExists` if a CA with the same id is stored.
    async fn create_cert_authority(&self, ca: CertAuthority) -> Result<CertAuthority>;

    /// Replaces the stored CA if its version still equals `expected_version`.
    ///
    /// Fails with `CompareFailed` otherwise. Returns the CA as stored, with a
    /// new version.
    async fn compare_and_swap_cert_authority(
        &self,
        ca: CertAuthority,
        expected_version: u64,
    ) -> Result<CertAuthority>;

    async fn delete_cert_authority(&self, id: &CertAuthId) -> Result<()>;

    /// Receives every write and delete, after it happened.
    fn watch_cert_authorities(&self) -> broadcast::Receiver<CertAuthorityEvent>;
}

/// Read-modify-write of one CA through compare-and-swap.
///
/// `apply` sees the current CA and returns `None` when there is nothing to
/// write. A conflicting writer causes a fresh read and another attempt, up to
/// `retries` attempts in total; after that the update fails with
/// `Unavailable`. Every other error is returned as is.
pub async fn update_cert_authority<S, F>(
    store: &S,
    id: &CertAuthId,
    retries: u32,
    mut apply: F,
) -> Result<Option<CertAuthority>>
where
    S: CertAuthorityStore + ?Sized,
    F: FnMut(&CertAuthority) -> Result<Option<CertAuthority>> + Send,
{
    for attempt in 1..=retries {
        let current = store.get_cert_authority(id).await?;
        let Some(next) = apply(&current)? else {
            return Ok(None);
        };

        match store
            .compare_and_swap_cert_authority(next, current.resource_version)
            .await
        {
            Ok(stored) => return Ok(Some(stored)),
            Err(e) if e.is_compare_failed() => {
                debug!(ca = %id, attempt, "cert authority changed concurrently, retrying");
            }
            Err(e) => return Err(e),
        }
    }

    Err(Error::Unavailable(format!(
        "cert authority {id} kept changing, gave up after {retries} attempts"
    )))
}

#[async_trait]
pub trait UserStore: Send + Sync {
    async fn get_user(&self, name: &str) -> Result<User>;
    async fn upsert_user(&self, user: User) -> Result<()>;
    async fn add_login_attempt(&self, user: &str, attempt: LoginAttempt) -> Result<()>;
    async fn get_login_attempts(&self, user: &str) -> Result<Vec<LoginAttempt>>;
    async fn delete_login_attempts(&self, user: &str) -> Result<()>;
}

#[async_trait]
pub trait RoleStore: Send + Sync {
    async fn get_role(&self, name: &str) -> Result<Role>;
    async fn upsert_role(&self, role: Role) -> Result<()>;
}

#[async_trait]
pub trait AccessRequestStore: Send + Sync {
    async fn get_access_request(&self, id: &str) -> Result<AccessRequest>;
    async fn upsert_access_request(&self, request: AccessRequest) -> Result<()>;
}

#[async_trait]
pub trait RemoteClusterStore: Send + Sync {
    async fn get_remote_cluster(&self, name: &str) -> Result<RemoteCluster>;
    async fn upsert_remote_cluster(&self, cluster: RemoteCluster) -> Result<()>;
    async fn delete_remote_cluster(&self, name: &str) -> Result<()>;
}

#[async_trait]
pub trait ProvisionTokenStore: Send + Sync {
    async fn get_token(&self, token: &str) -> Result<ProvisionToken>;
    async fn upsert_token(&self, token: ProvisionToken) -> Result<()>;
    async fn delete_token(&self, token: &str) -> Result<()>;
}

#[async_trait]
pub trait WebSessionStore: Send + Sync {
    async fn get_web_session(&self, user: &str, id: &str) -> Result<WebSession>;
    async fn upsert_web_session(&self, session: WebSession) -> Result<()>;
    async fn delete_web_session(&self, user: &str, id: &str) -> Result<()>;
}

/// Cluster-wide settings that can change at any time. Read on every request.
#[async_trait]
pub trait ClusterConfigStore: Send + Sync {
    async fn session_recording_mode(&self) -> Result<SessionRecordingMode>;
    async fn set_session_recording_mode(&self, mode: SessionRecordingMode) -> Result<()>;
}

/// Everything the service needs from storage.
pub trait Backend:
    CertAuthorityStore
    + UserStore
    + RoleStore
    + AccessRequestStore
    + RemoteClusterStore
    + ProvisionTokenStore
    + WebSessionStore
    + ClusterConfigStore
{
}

impl<T> Backend for T where
    T: CertAuthorityStore
        + UserStore
        + RoleStore
        + AccessRequestStore
        + RemoteClusterStore
        + ProvisionTokenStore
        + WebSessionStore
        + ClusterConfigStore
{
}

/// In-process backend.
pub struct MemoryBackend {
    cas: RwLock<BTreeMap<CertAuthId, CertAuthority>>,
    users: RwLock<HashMap<String, User>>,
    login_attempts: RwLock<HashMap<String, Vec<LoginAttempt>>>,
    roles: RwLock<HashMap<String, Role>>,
    access_requests: RwLock<HashMap<String, AccessRequest>>,
    remote_clusters: RwLock<HashMap<String, RemoteCluster>>,
    tokens: RwLock<HashMap<String, ProvisionToken>>,
    web_sessions: RwLock<HashMap<(String, String), WebSession>>,
    recording_mode: RwLock<SessionRecordingMode>,
    next_version: RwLock<u64>,
    events: broadcast::Sender<CertAuthorityEvent>,
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBackend {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            cas: RwLock::new(BTreeMap::new()),
            users: RwLock::new(HashMap::new()),
            login_attempts: RwLock::new(HashMap::new()),
            roles: RwLock::new(HashMap::new()),
            access_requests: RwLock::new(HashMap::new()),
            remote_clusters: RwLock::new(HashMap::new()),
            tokens: RwLock::new(HashMap::new()),
            web_sessions: RwLock::new(HashMap::new()),
            recording_mode: RwLock::new(SessionRecordingMode::Node),
            next_version: RwLock::new(1),
            events,
        }
    }

    fn bump_version(&self) -> u64 {
        let mut next = self.next_version.write();
        let version = *next;
        *next += 1;
        version
    }

    fn publish(&self, event: CertAuthorityEvent) {
        // No receivers is fine.
        let _ = self.events.send(event);
    }
}

#[async_trait]
impl CertAuthorityStore for MemoryBackend {
    async fn get_cert_authority(&self, id: &CertAuthId) -> Result<CertAuthority> {
        self.cas
            .read()
            .get(id)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("cert authority {id}")))
    }

    async fn list_cert_authorities(&self, ca_type: CertAuthType) -> Result<Vec<CertAuthority>> {
        Ok(self
            .cas
            .read()
            .values()
            .filter(|ca| ca.id.ca_type == ca_type)
            .cloned()
            .collect())
    }

    async fn create_cert_authority(&self, mut ca: CertAuthority) -> Result<CertAuthority> {
        ca.check()?;
        {
            let mut cas = self.cas.write();
            if cas.contains_key(&ca.id) {
                return Err(Error::AlreadyExists(format!("cert authority {}", ca.id)));
            }
            ca.resource_version = self.bump_version();
            cas.insert(ca.id.clone(), ca.clone());
        }
        debug!(ca = %ca.id, version = ca.resource_version, "created cert authority");
        self.publish(CertAuthorityEvent::Put(ca.clone()));
        Ok(ca)
    }

    async fn compare_and_swap_cert_authority(
        &self,
        mut ca: CertAuthority,
        expected_version: u64,
    ) -> Result<CertAuthority> {
        ca.check()?;
        {
            let mut cas = self.cas.write();
            let current = cas
                .get(&ca.id)
                .ok_or_else(|| Error::NotFound(format!("cert authority {}", ca.id)))?;
            if current.resource_version != expected_version {
                return Err(Error::CompareFailed(format!(
                    "cert authority {} changed: expected version {expected_version}, found {}",
                    ca.id, current.resource_version
                )));
            }
            ca.resource_version = self.bump_version();
            cas.insert(ca.id.clone(), ca.clone());
        }
        self.publish(CertAuthorityEvent::Put(ca.clone()));
        Ok(ca)
    }

    async fn delete_cert_authority(&self, id: &CertAuthId) -> Result<()> {
        if self.cas.write().remove(id).is_none() {
            return Err(Error::NotFound(format!("cert authority {id}")));
        }
        debug!(ca = %id, "deleted cert authority");
        self.publish(CertAuthorityEvent::Deleted(id.clone()));
        Ok(())
    }

    fn watch_cert_authorities(&self) -> broadcast::Receiver<CertAuthorityEvent> {
        self.events.subscribe()
    }
}

#[async_trait]
impl UserStore for MemoryBackend {
    async fn get_user(&self, name: &str) -> Result<User> {
        self.users
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("user {name}")))
    }

    async fn upsert_user(&self, user: User) -> Result<()> {
        self.users.write().insert(user.name.clone(), user);
        Ok(())
    }

    async fn add_login_attempt(&self, user: &str, attempt: LoginAttempt) -> Result<()> {
        self.login_attempts
            .write()
            .entry(user.to_string())
            .or_default()
            .push(attempt);
        Ok(())
    }

    async fn get_login_attempts(&self, user: &str) -> Result<Vec<LoginAttempt>> {
        Ok(self
            .login_attempts
            .read()
            .get(user)
            .cloned()
            .unwrap_or_default())
    }

    async fn delete_login_attempts(&self, user: &str) -> Result<()> {
        self.login_attempts.write().remove(user);
        Ok(())
    }
}

#[async_trait]
impl RoleStore for MemoryBackend {
    async fn get_role(&self, name: &str) -> Result<Role> {
        self.roles
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("role {name}")))
    }

    async fn upsert_role(&self, role: Role) -> Result<()> {
        self.roles.write().insert(role.name.clone(), role);
        Ok(())
    }
}

#[async_trait]
impl AccessRequestStore for MemoryBackend {
    async fn get_access_request(&self, id: &str) -> Result<AccessRequest> {
        self.access_requests
            .read()
            .get(id)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("access request {id}")))
    }

    async fn upsert_access_request(&self, request: AccessRequest) -> Result<()> {
        self.access_requests
            .write()
            .insert(request.id.clone(), request);
        Ok(())
    }
}

#[async_trait]
impl RemoteClusterStore for MemoryBackend {
    async fn get_remote_cluster(&self, name: &str) -> Result<RemoteCluster> {
        self.remote_clusters
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("remote cluster {name}")))
    }

    async fn upsert_remote_cluster(&self, cluster: RemoteCluster) -> Result<()> {
        self.remote_clusters
            .write()
            .insert(cluster.name.clone(), cluster);
        Ok(())
    }

    async fn delete_remote_cluster(&self, name: &str) -> Result<()> {
        self.remote_clusters
            .write()
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| Error::NotFound(format!("remote cluster {name}")))
    }
}

#[async_trait]
impl ProvisionTokenStore for MemoryBackend {
    async fn get_token(&self, token: &str) -> Result<ProvisionToken> {
        self.tokens
            .read()
            .get(token)
            .cloned()
            .ok_or_else(|| Error::NotFound("provision token".into()))
    }

    async fn upsert_token(&self, token: ProvisionToken) -> Result<()> {
        self.tokens.write().insert(token.token.clone(), token);
        Ok(())
    }

    async fn delete_token(&self, token: &str) -> Result<()> {
        self.tokens.write().remove(token);
        Ok(())
    }
}

#[async_trait]
impl WebSessionStore for MemoryBackend {
    async fn get_web_session(&self, user: &str, id: &str) -> Result<WebSession> {
        self.web_sessions
            .read()
            .get(&(user.to_string(), id.to_string()))
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("web session {id}")))
    }

    async fn upsert_web_session(&self, session: WebSession) -> Result<()> {
        self.web_sessions
            .write()
            .insert((session.user.clone(), session.id.clone()), session);
        Ok(())
    }

    async fn delete_web_session(&self, user: &str, id: &str) -> Result<()> {
        self.web_sessions
            .write()
            .remove(&(user.to_string(), id.to_string()))
            .map(|_| ())
            .ok_or_else(|| Error::NotFound(format!("web session {id}")))
    }
}

#[async_trait]
impl ClusterConfigStore for MemoryBackend {
    async fn session_recording_mode(&self) -> Result<SessionRecordingMode> {
        Ok(*self.recording_mode.read())
    }

    async fn set_session_recording_mode(&self, mode: SessionRecordingMode) -> Result<()> {
        *self.recording_mode.write() = mode;
        Ok(())
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use super::testing::ContendedBackend;
    use crate::keys::KeyPair;
    use chrono::Utc;
    use std::time::Duration;

    fn new_ca(domain: &str) -> CertAuthority {
        let id = CertAuthId::new(domain, CertAuthType::Host);
        let key = KeyPair::generate(&id, Utc::now(), Duration::from_secs(3600)).unwrap();
        CertAuthority::new(id, key)
    }

    #[tokio::test]
    async fn test_create_and_get() {
        let backend = MemoryBackend::new();
        let created = backend.create_cert_authority(new_ca("nucleus.local")).await.unwrap();
        assert!(created.resource_version > 0);

        let fetched = backend.get_cert_authority(&created.id).await.unwrap();
        assert_eq!(fetched, created);

        let err = backend.create_cert_authority(new_ca("nucleus.local")).await.unwrap_err();
        assert!(err.is_already_exists());
    }

    #[tokio::test]
    async fn test_compare_and_swap_detects_concurrent_write() {
        let backend = MemoryBackend::new();
        let ca = backend.create_cert_authority(new_ca("nucleus.local")).await.unwrap();
        let stale_version = ca.resource_version;

        let updated = backend
            .compare_and_swap_cert_authority(ca.clone(), stale_version)
            .await
            .unwrap();
        assert!(updated.resource_version > stale_version);

        let err = backend
            .compare_and_swap_cert_authority(ca, stale_version)
            .await
            .unwrap_err();
        assert!(err.is_compare_failed());
    }

    #[tokio::test]
    async fn test_compare_and_swap_rejects_invalid_state() {
        let backend = MemoryBackend::new();
        let mut ca = backend.create_cert_authority(new_ca("nucleus.local")).await.unwrap();
        let version = ca.resource_version;
        ca.active_keys.clear();

        let err = backend
            .compare_and_swap_cert_authority(ca, version)
            .await
            .unwrap_err();
        assert!(err.is_bad_parameter());
    }

    #[tokio::test]
    async fn test_watch_sees_writes() {
        let backend = MemoryBackend::new();
        let mut events = backend.watch_cert_authorities();

        let created = backend.create_cert_authority(new_ca("nucleus.local")).await.unwrap();
        assert_eq!(events.recv().await.unwrap(), CertAuthorityEvent::Put(created.clone()));

        backend.delete_cert_authority(&created.id).await.unwrap();
        assert_eq!(events.recv().await.unwrap(), CertAuthorityEvent::Deleted(created.id.clone()));

        // Deleting what is already gone publishes nothing.
        assert!(backend.delete_cert_authority(&created.id).await.unwrap_err().is_not_found());
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_update_retries_conflicts() {
        let backend = ContendedBackend::new(3);
        let ca = backend.create_cert_authority(new_ca("nucleus.local")).await.unwrap();

        let mut attempts = 0;
        let stored = update_cert_authority(&backend, &ca.id, 8, |current| {
            attempts += 1;
            Ok(Some(current.clone()))
        })
        .await
        .unwrap()
        .unwrap();
        assert_eq!(attempts, 4);
        assert_eq!(backend.conflicts_left(), 0);
        assert!(stored.resource_version > ca.resource_version);
    }

    #[tokio::test]
    async fn test_update_gives_up_after_budget() {
        let backend = ContendedBackend::new(u32::MAX);
        let ca = backend.create_cert_authority(new_ca("nucleus.local")).await.unwrap();

        let err = update_cert_authority(&backend, &ca.id, 3, |current| Ok(Some(current.clone())))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Unavailable(_)), "{err}");
    }

    #[tokio::test]
    async fn test_update_skips_noop_and_propagates_errors() {
        let backend = MemoryBackend::new();
        let ca = backend.create_cert_authority(new_ca("nucleus.local")).await.unwrap();

        let unchanged = update_cert_authority(&backend, &ca.id, 3, |_| Ok(None)).await.unwrap();
        assert!(unchanged.is_none());
        assert_eq!(backend.get_cert_authority(&ca.id).await.unwrap(), ca);

        let missing = CertAuthId::new("other.example", CertAuthType::Host);
        let err = update_cert_authority(&backend, &missing, 3, |current| Ok(Some(current.clone())))
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_list_filters_by_type() {
        let backend = MemoryBackend::new();
        backend.create_cert_authority(new_ca("a.example.com")).await.unwrap();
        backend.create_cert_authority(new_ca("b.example.com")).await.unwrap();

        assert_eq!(backend.list_cert_authorities(CertAuthType::Host).await.unwrap().len(), 2);
        assert!(backend.list_cert_authorities(CertAuthType::User).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_login_attempts() {
        let backend = MemoryBackend::new();
        let attempt = LoginAttempt {
            time: Utc::now(),
            success: false,
        };
        backend.add_login_attempt("alice", attempt).await.unwrap();
        backend.add_login_attempt("alice", attempt).await.unwrap();
        assert_eq!(backend.get_login_attempts("alice").await.unwrap().len(), 2);

        backend.delete_login_attempts("alice").await.unwrap();
        assert!(backend.get_login_attempts("alice").await.unwrap().is_empty());
    }
}
