//! Certificate authority rotation.
//!
//! A rotation replaces a CA's signing key without a moment where some
//! credential in circulation stops verifying:
//!
//! ```text
//!   Standby ──▶ Init ──▶ UpdateClients ──▶ UpdateServers ──▶ Standby
//!                 │             │                 │
//!                 └─────────────┴──────▶ Rollback ┴──────▶ Standby
//! ```
//!
//! | phase          | signs | also trusted |
//! |----------------|-------|--------------|
//! | Standby        | old   | -            |
//! | Init           | old   | new          |
//! | UpdateClients  | new   | old          |
//! | UpdateServers  | new   | old          |
//! | Rollback       | old   | new          |
//!
//! Every transition is a single compare-and-swap on the stored CA, so
//! watchers observe the key set and the phase change together.
//!
//! In auto mode the grace period is split into thirds and
//! [`RotationController::auto_rotate_cert_authorities`] advances one phase
//! each time a third elapses.

use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{info, warn};

use crate::clock::Clock;
use crate::config::{AuthorityConfig, RotationConfig};
use crate::keys::KeyPair;
use crate::store::{update_cert_authority, CertAuthorityStore};
use crate::types::{
    CertAuthId, CertAuthType, CertAuthority, RotationMode, RotationPhase, RotationSchedule,
    RotationState,
};
use crate::{Error, Result};

/// A request to move a local CA to another rotation phase.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RotateRequest {
    pub ca_type: CertAuthType,
    /// `None` means the phase that follows the current one.
    pub target_phase: Option<RotationPhase>,
    pub mode: RotationMode,
    /// `None` uses the configured default.
    pub grace_period: Option<Duration>,
}

impl RotateRequest {
    pub fn manual(ca_type: CertAuthType, target_phase: RotationPhase) -> Self {
        Self {
            ca_type,
            target_phase: Some(target_phase),
            mode: RotationMode::Manual,
            grace_period: None,
        }
    }

    /// Starts a rotation that completes on its own over `grace_period`.
    pub fn auto(ca_type: CertAuthType, grace_period: Duration) -> Self {
        Self {
            ca_type,
            target_phase: Some(RotationPhase::Init),
            mode: RotationMode::Auto,
            grace_period: Some(grace_period),
        }
    }
}

/// Drives the rotation state machine of the local cluster's CAs.
pub struct RotationController {
    store: Arc<dyn CertAuthorityStore>,
    clock: Arc<dyn Clock>,
    cluster_name: String,
    config: RotationConfig,
    ca_ttl: Duration,
    shutdown: watch::Sender<bool>,
}

impl RotationController {
    pub fn new(
        store: Arc<dyn CertAuthorityStore>,
        clock: Arc<dyn Clock>,
        config: &AuthorityConfig,
    ) -> Arc<Self> {
        let (shutdown, _) = watch::channel(false);
        Arc::new(Self {
            store,
            clock,
            cluster_name: config.cluster_name.clone(),
            config: config.rotation.clone(),
            ca_ttl: config.certs.ca_ttl(),
            shutdown,
        })
    }

    pub fn cluster_name(&self) -> &str {
        &self.cluster_name
    }

    /// Creates any of the local host, user and JWT-signer CAs that do not exist yet.
    pub async fn ensure_cert_authorities(&self) -> Result<()> {
        for ca_type in CertAuthType::ALL {
            let id = CertAuthId::new(&self.cluster_name, ca_type);
            match self.store.get_cert_authority(&id).await {
                Ok(_) => continue,
                Err(e) if e.is_not_found() => {}
                Err(e) => return Err(e),
            }

            let key = KeyPair::generate(&id, self.clock.now(), self.ca_ttl)?;
            match self.store.create_cert_authority(CertAuthority::new(id.clone(), key)).await {
                Ok(_) => info!(ca = %id, "created cert authority"),
                // Another instance won the race.
                Err(e) if e.is_already_exists() => {}
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    /// Moves a local CA to the requested phase.
    ///
    /// Only adjacent transitions are accepted; anything else is a
    /// `BadParameter` and leaves the CA untouched.
    pub async fn rotate_cert_authority(&self, req: RotateRequest) -> Result<CertAuthority> {
        let grace_period = req.grace_period.unwrap_or_else(|| self.config.grace_period());
        if grace_period.is_zero() {
            return Err(Error::BadParameter("grace period must be positive".into()));
        }

        let id = CertAuthId::new(&self.cluster_name, req.ca_type);
        let now = self.clock.now();
        let ca_ttl = self.ca_ttl;

        let mut from = RotationPhase::Standby;
        let stored = self
            .update_with_retry(&id, |ca| {
                from = ca.rotation.phase;
                let target = req.target_phase.unwrap_or_else(|| from.successor());
                check_request(from, target, req.mode)?;
                let next = plan_transition(ca, target, req.mode, grace_period, now, || {
                    KeyPair::generate(&ca.id, now, ca_ttl)
                })?;
                Ok(Some(next))
            })
            .await?
            .ok_or_else(|| Error::Internal(format!("rotation of {id} produced no update")))?;

        info!(
            ca = %id,
            from = %from,
            to = %stored.rotation.phase,
            mode = %stored.rotation.mode,
            rotation_id = %stored.rotation.current_id,
            "rotated cert authority"
        );
        Ok(stored)
    }

    /// Advances every local CA in auto mode whose next deadline has passed.
    ///
    /// At most one phase per CA per call.
    pub async fn auto_rotate_cert_authorities(&self) -> Result<()> {
        let mut first_error = None;

        for ca_type in CertAuthType::ALL {
            let id = CertAuthId::new(&self.cluster_name, ca_type);
            let now = self.clock.now();

            match self.update_with_retry(&id, |ca| auto_transition(ca, now)).await {
                Ok(Some(ca)) => info!(
                    ca = %id,
                    phase = %ca.rotation.phase,
                    rotation_id = %ca.rotation.current_id,
                    "auto rotation advanced cert authority"
                ),
                Ok(None) => {}
                Err(e) if e.is_not_found() => {}
                Err(e) => {
                    warn!(ca = %id, error = %e, "auto rotation failed");
                    first_error.get_or_insert(e);
                }
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Checks auto rotation schedules until [`shutdown`](Self::shutdown) is called.
    ///
    /// This should be spawned as a background task. A check that has started
    /// always runs to completion before the loop exits.
    pub async fn run(self: Arc<Self>) {
        let mut shutdown_rx = self.shutdown.subscribe();
        if *shutdown_rx.borrow_and_update() {
            info!("rotation loop shut down before it started");
            return;
        }
        let mut interval = tokio::time::interval(self.config.check_interval());
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if let Err(e) = self.auto_rotate_cert_authorities().await {
                        warn!(error = %e, "auto rotation check failed");
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("rotation loop shutting down");
                        break;
                    }
                }
            }
        }
    }

    /// Stops [`run`](Self::run), including a loop that has not started yet.
    pub fn shutdown(&self) {
        self.shutdown.send_replace(true);
    }

    /// Read-modify-write with compare-and-swap, retried on conflicts.
    ///
    /// `apply` returns `None` when there is nothing to write.
    async fn update_with_retry<F>(
        &self,
        id: &CertAuthId,
        apply: F,
    ) -> Result<Option<CertAuthority>>
    where
        F: FnMut(&CertAuthority) -> Result<Option<CertAuthority>> + Send,
    {
        update_cert_authority(self.store.as_ref(), id, self.config.cas_retries, apply).await
    }
}

fn check_request(from: RotationPhase, target: RotationPhase, mode: RotationMode) -> Result<()> {
    if mode == RotationMode::Auto && from != RotationPhase::Standby {
        return Err(Error::BadParameter(format!(
            "auto rotation can only start from standby, CA is in {from}"
        )));
    }
    if mode == RotationMode::Auto && target == RotationPhase::Rollback {
        return Err(Error::BadParameter("rollback must be requested in manual mode".into()));
    }
    Ok(())
}

fn auto_transition(ca: &CertAuthority, now: DateTime<Utc>) -> Result<Option<CertAuthority>> {
    let rotation = &ca.rotation;
    if rotation.mode != RotationMode::Auto {
        return Ok(None);
    }
    let Some(deadline) = rotation
        .schedule
        .and_then(|s| s.deadline_after(rotation.phase))
    else {
        return Ok(None);
    };
    if now < deadline {
        return Ok(None);
    }

    plan_transition(
        ca,
        rotation.phase.successor(),
        RotationMode::Auto,
        rotation.grace_period,
        now,
        || Err(Error::Internal("auto rotation never generates keys".into())),
    )
    .map(Some)
}

/// Computes the CA that results from moving `ca` to `target`.
///
/// Pure apart from `new_key`, which is only called for Standby to Init.
pub fn plan_transition(
    ca: &CertAuthority,
    target: RotationPhase,
    mode: RotationMode,
    grace_period: Duration,
    now: DateTime<Utc>,
    new_key: impl FnOnce() -> Result<KeyPair>,
) -> Result<CertAuthority> {
    use RotationPhase::*;

    let from = ca.rotation.phase;
    let mut next = ca.clone();

    match (from, target) {
        (Standby, Init) => {
            let old = sole_key(ca)?;
            next.active_keys = vec![old.clone(), new_key()?];
            next.additional_trusted_keys.clear();
            let schedule = match mode {
                RotationMode::Auto => Some(RotationSchedule::generate(now, grace_period)?),
                RotationMode::Manual => None,
            };
            next.rotation = RotationState {
                phase: Init,
                mode,
                current_id: uuid::Uuid::new_v4().to_string(),
                started: Some(now),
                grace_period,
                last_rotated: ca.rotation.last_rotated,
                schedule,
            };
        }
        (Init, UpdateClients) => {
            let (old, new) = init_keys(ca)?;
            next.active_keys = vec![new.clone()];
            next.additional_trusted_keys = vec![old.clone()];
            next.rotation = advance(&ca.rotation, UpdateClients, mode);
        }
        (UpdateClients, UpdateServers) => {
            next.rotation = advance(&ca.rotation, UpdateServers, mode);
        }
        (UpdateServers, Standby) => {
            next.additional_trusted_keys.clear();
            next.rotation = RotationState {
                phase: Standby,
                mode: ca.rotation.mode,
                current_id: String::new(),
                started: None,
                grace_period: ca.rotation.grace_period,
                last_rotated: Some(now),
                schedule: None,
            };
        }
        (Init | UpdateClients | UpdateServers, Rollback) => {
            let (old, new) = match from {
                Init => init_keys(ca)?,
                _ => updated_keys(ca)?,
            };
            next.active_keys = vec![old.clone()];
            // Credentials already signed by the new key stay valid until an
            // explicit move to standby.
            next.additional_trusted_keys = vec![new.without_secrets()];
            next.rotation = RotationState {
                phase: Rollback,
                mode: RotationMode::Manual,
                schedule: None,
                ..ca.rotation.clone()
            };
        }
        (Rollback, Standby) => {
            next.additional_trusted_keys.clear();
            next.rotation = RotationState {
                phase: Standby,
                mode: RotationMode::Manual,
                current_id: String::new(),
                started: None,
                grace_period: ca.rotation.grace_period,
                last_rotated: ca.rotation.last_rotated,
                schedule: None,
            };
        }
        (from, to) if from == to => {
            return Err(Error::BadParameter(format!(
                "cert authority {} is already in phase {to}",
                ca.id
            )));
        }
        (from, to) => {
            return Err(Error::BadParameter(format!(
                "can not rotate cert authority {} from {from} to {to}",
                ca.id
            )));
        }
    }

    Ok(next)
}

/// Moves to `phase`; a manual request takes over an auto rotation.
fn advance(rotation: &RotationState, phase: RotationPhase, mode: RotationMode) -> RotationState {
    let schedule = match mode {
        RotationMode::Auto => rotation.schedule,
        RotationMode::Manual => None,
    };
    RotationState {
        phase,
        mode,
        schedule,
        ..rotation.clone()
    }
}

fn sole_key(ca: &CertAuthority) -> Result<&KeyPair> {
    match ca.active_keys.as_slice() {
        [key] if ca.additional_trusted_keys.is_empty() => Ok(key),
        _ => Err(Error::Internal(format!(
            "cert authority {} at standby must have exactly one key",
            ca.id
        ))),
    }
}

/// (old, new) during Init.
fn init_keys(ca: &CertAuthority) -> Result<(&KeyPair, &KeyPair)> {
    match ca.active_keys.as_slice() {
        [old, new] => Ok((old, new)),
        _ => Err(Error::Internal(format!(
            "cert authority {} in init must have two active keys",
            ca.id
        ))),
    }
}

/// (old, new) during UpdateClients and UpdateServers.
fn updated_keys(ca: &CertAuthority) -> Result<(&KeyPair, &KeyPair)> {
    match (ca.additional_trusted_keys.as_slice(), ca.active_keys.as_slice()) {
        ([old], [new]) => Ok((old, new)),
        _ => Err(Error::Internal(format!(
            "cert authority {} must have one active and one trusted key while updating",
            ca.id
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::store::{CertAuthorityEvent, MemoryBackend};
    use chrono::TimeZone;

    fn start() -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000, 0).unwrap()
    }

    async fn controller() -> (Arc<RotationController>, Arc<MemoryBackend>, ManualClock) {
        let backend = Arc::new(MemoryBackend::new());
        let clock = ManualClock::new(start());
        let controller = RotationController::new(
            backend.clone(),
            Arc::new(clock.clone()),
            &AuthorityConfig::default(),
        );
        controller.ensure_cert_authorities().await.unwrap();
        (controller, backend, clock)
    }

    fn host_ca_id() -> CertAuthId {
        CertAuthId::new("nucleus.local", CertAuthType::Host)
    }

    #[tokio::test]
    async fn test_ensure_cert_authorities_is_idempotent() {
        let (controller, backend, _) = controller().await;
        let before = backend.get_cert_authority(&host_ca_id()).await.unwrap();

        controller.ensure_cert_authorities().await.unwrap();
        let after = backend.get_cert_authority(&host_ca_id()).await.unwrap();
        assert_eq!(before, after);
        for ca_type in CertAuthType::ALL {
            let ca = backend
                .get_cert_authority(&CertAuthId::new("nucleus.local", ca_type))
                .await
                .unwrap();
            assert_eq!(ca.rotation.phase, RotationPhase::Standby);
        }
    }

    #[tokio::test]
    async fn test_manual_rotation_key_sets() {
        let (controller, _, _) = controller().await;
        let rotate = |phase| RotateRequest::manual(CertAuthType::Host, phase);

        let standby = controller.store.get_cert_authority(&host_ca_id()).await.unwrap();
        let old = standby.active_keys[0].clone();

        let init = controller.rotate_cert_authority(rotate(RotationPhase::Init)).await.unwrap();
        assert_eq!(init.active_keys.len(), 2);
        assert_eq!(init.active_keys[0].kid, old.kid);
        assert_eq!(init.signing_key().unwrap().kid, old.kid);
        assert!(!init.rotation.current_id.is_empty());
        let new = init.active_keys[1].clone();

        let clients = controller
            .rotate_cert_authority(rotate(RotationPhase::UpdateClients))
            .await
            .unwrap();
        assert_eq!(clients.signing_key().unwrap().kid, new.kid);
        assert_eq!(clients.additional_trusted_keys[0].kid, old.kid);

        let servers = controller
            .rotate_cert_authority(rotate(RotationPhase::UpdateServers))
            .await
            .unwrap();
        assert_eq!(servers.active_keys, clients.active_keys);
        assert_eq!(servers.additional_trusted_keys, clients.additional_trusted_keys);

        let done = controller.rotate_cert_authority(rotate(RotationPhase::Standby)).await.unwrap();
        assert_eq!(done.active_keys.len(), 1);
        assert_eq!(done.active_keys[0].kid, new.kid);
        assert!(done.additional_trusted_keys.is_empty());
        assert!(done.rotation.current_id.is_empty());
        assert_eq!(done.rotation.last_rotated, Some(start()));
    }

    #[tokio::test]
    async fn test_default_target_is_successor() {
        let (controller, _, _) = controller().await;
        let ca = controller
            .rotate_cert_authority(RotateRequest {
                ca_type: CertAuthType::User,
                target_phase: None,
                mode: RotationMode::Manual,
                grace_period: None,
            })
            .await
            .unwrap();
        assert_eq!(ca.rotation.phase, RotationPhase::Init);
        assert_eq!(ca.rotation.grace_period, Duration::from_secs(30 * 3600));
    }

    #[tokio::test]
    async fn test_rejects_phase_skips() {
        let (controller, backend, _) = controller().await;
        let before = backend.get_cert_authority(&host_ca_id()).await.unwrap();

        for phase in [
            RotationPhase::UpdateClients,
            RotationPhase::UpdateServers,
            RotationPhase::Rollback,
            RotationPhase::Standby,
        ] {
            let err = controller
                .rotate_cert_authority(RotateRequest::manual(CertAuthType::Host, phase))
                .await
                .unwrap_err();
            assert!(err.is_bad_parameter(), "{phase}: {err}");
        }
        assert_eq!(backend.get_cert_authority(&host_ca_id()).await.unwrap(), before);
    }

    #[tokio::test]
    async fn test_rejects_zero_grace_period() {
        let (controller, _, _) = controller().await;
        let err = controller
            .rotate_cert_authority(RotateRequest::auto(CertAuthType::Host, Duration::ZERO))
            .await
            .unwrap_err();
        assert!(err.is_bad_parameter());
    }

    #[tokio::test]
    async fn test_rollback_keeps_new_key_trusted_until_standby() {
        let (controller, _, _) = controller().await;
        let rotate = |phase| RotateRequest::manual(CertAuthType::Host, phase);

        let init = controller.rotate_cert_authority(rotate(RotationPhase::Init)).await.unwrap();
        let (old, new) = (init.active_keys[0].kid.clone(), init.active_keys[1].kid.clone());
        controller
            .rotate_cert_authority(rotate(RotationPhase::UpdateClients))
            .await
            .unwrap();

        let rollback = controller.rotate_cert_authority(rotate(RotationPhase::Rollback)).await.unwrap();
        assert_eq!(rollback.signing_key().unwrap().kid, old);
        assert_eq!(rollback.additional_trusted_keys.len(), 1);
        assert_eq!(rollback.additional_trusted_keys[0].kid, new);
        assert!(!rollback.additional_trusted_keys[0].has_private_key());
        assert_eq!(rollback.rotation.mode, RotationMode::Manual);

        let standby = controller.rotate_cert_authority(rotate(RotationPhase::Standby)).await.unwrap();
        assert_eq!(standby.active_keys.len(), 1);
        assert_eq!(standby.active_keys[0].kid, old);
        assert!(standby.find_key(&new).is_none());
    }

    #[tokio::test]
    async fn test_auto_rollback_rejected() {
        let (controller, _, _) = controller().await;
        controller
            .rotate_cert_authority(RotateRequest::auto(CertAuthType::Host, Duration::from_secs(3 * 3600)))
            .await
            .unwrap();

        let err = controller
            .rotate_cert_authority(RotateRequest {
                ca_type: CertAuthType::Host,
                target_phase: Some(RotationPhase::Rollback),
                mode: RotationMode::Auto,
                grace_period: None,
            })
            .await
            .unwrap_err();
        assert!(err.is_bad_parameter());
    }

    #[tokio::test]
    async fn test_rollback_from_auto_switches_to_manual() {
        let (controller, _, clock) = controller().await;
        controller
            .rotate_cert_authority(RotateRequest::auto(CertAuthType::Host, Duration::from_secs(3 * 3600)))
            .await
            .unwrap();
        clock.advance(chrono::Duration::minutes(61));
        controller.auto_rotate_cert_authorities().await.unwrap();

        let rollback = controller
            .rotate_cert_authority(RotateRequest::manual(CertAuthType::Host, RotationPhase::Rollback))
            .await
            .unwrap();
        assert_eq!(rollback.rotation.mode, RotationMode::Manual);

        // Nothing left for the auto loop to do.
        clock.advance(chrono::Duration::hours(10));
        controller.auto_rotate_cert_authorities().await.unwrap();
        let ca = controller.store.get_cert_authority(&host_ca_id()).await.unwrap();
        assert_eq!(ca.rotation.phase, RotationPhase::Rollback);
    }

    #[tokio::test]
    async fn test_auto_rotation_one_phase_per_call() {
        let (controller, backend, clock) = controller().await;
        controller
            .rotate_cert_authority(RotateRequest::auto(CertAuthType::User, Duration::from_secs(3 * 3600)))
            .await
            .unwrap();
        let id = CertAuthId::new("nucleus.local", CertAuthType::User);

        // Way past every deadline, but only one step at a time.
        clock.advance(chrono::Duration::hours(5));
        controller.auto_rotate_cert_authorities().await.unwrap();
        assert_eq!(
            backend.get_cert_authority(&id).await.unwrap().rotation.phase,
            RotationPhase::UpdateClients
        );
        controller.auto_rotate_cert_authorities().await.unwrap();
        assert_eq!(
            backend.get_cert_authority(&id).await.unwrap().rotation.phase,
            RotationPhase::UpdateServers
        );
        controller.auto_rotate_cert_authorities().await.unwrap();
        assert_eq!(
            backend.get_cert_authority(&id).await.unwrap().rotation.phase,
            RotationPhase::Standby
        );
    }

    #[tokio::test]
    async fn test_auto_rotation_waits_for_deadline() {
        let (controller, backend, clock) = controller().await;
        controller
            .rotate_cert_authority(RotateRequest::auto(CertAuthType::Host, Duration::from_secs(3 * 3600)))
            .await
            .unwrap();

        clock.advance(chrono::Duration::minutes(59));
        controller.auto_rotate_cert_authorities().await.unwrap();
        assert_eq!(
            backend.get_cert_authority(&host_ca_id()).await.unwrap().rotation.phase,
            RotationPhase::Init
        );
    }

    #[tokio::test]
    async fn test_manual_request_takes_over_auto_rotation() {
        let (controller, _, clock) = controller().await;
        controller
            .rotate_cert_authority(RotateRequest::auto(CertAuthType::Host, Duration::from_secs(3 * 3600)))
            .await
            .unwrap();

        let ca = controller
            .rotate_cert_authority(RotateRequest::manual(
                CertAuthType::Host,
                RotationPhase::UpdateClients,
            ))
            .await
            .unwrap();
        assert_eq!(ca.rotation.mode, RotationMode::Manual);
        assert!(ca.rotation.schedule.is_none());

        clock.advance(chrono::Duration::hours(4));
        controller.auto_rotate_cert_authorities().await.unwrap();
        let ca = controller.store.get_cert_authority(&host_ca_id()).await.unwrap();
        assert_eq!(ca.rotation.phase, RotationPhase::UpdateClients);
    }

    #[tokio::test]
    async fn test_rotation_is_observed_atomically() {
        let (controller, backend, _) = controller().await;
        let mut events = backend.watch_cert_authorities();

        controller
            .rotate_cert_authority(RotateRequest::manual(CertAuthType::Host, RotationPhase::Init))
            .await
            .unwrap();

        let Ok(CertAuthorityEvent::Put(event)) = events.recv().await else {
            panic!("expected the rotated CA");
        };
        assert_eq!(event.rotation.phase, RotationPhase::Init);
        assert_eq!(event.active_keys.len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rotation_loop_stops_on_shutdown() {
        let (controller, _, _) = controller().await;
        let handle = tokio::spawn(controller.clone().run());

        tokio::time::sleep(Duration::from_secs(120)).await;
        controller.shutdown();
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_before_run() {
        let (controller, _, _) = controller().await;
        controller.shutdown();

        let handle = tokio::spawn(controller.clone().run());
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("rotation loop kept running after shutdown")
            .unwrap();
    }
}
