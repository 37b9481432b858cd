//! Certificate authority rotation and credential issuance for nucleus clusters.
//!
//! This crate is the trust core of a nucleus control plane. It owns the
//! signing keys of the cluster's certificate authorities, rotates them without
//! downtime, and decides which principal, role set and lifetime every issued
//! credential carries.
//!
//! # Components
//!
//! - [`clock`] - Injected time source (system and manually advanced)
//! - [`store`] - Versioned compare-and-swap storage traits and an in-memory backend
//! - [`keys`] - P-256 signing key generation, CA certificates and CA pins
//! - [`rotation`] - CA rotation state machine and the auto-rotation loop
//! - [`trust`] - Cross-cluster trust and role mapping
//! - [`authz`] / [`builtin`] - Caller resolution and the builtin role action table
//! - [`impersonation`] - Effective identity, impersonation and access-request elevation
//! - [`issuer`] - Host and user certificates, application tokens, verification
//! - [`register`] - Joining a cluster with CA pins or a CA file
//! - [`login`] / [`session`] - Password checks and browser sessions
//! - [`server`] - `AuthService`, the authorized entry point for every operation

pub mod authz;
pub mod builtin;
pub mod clock;
pub mod config;
pub mod csr;
pub mod identity;
pub mod impersonation;
pub mod issuer;
pub mod jwt;
pub mod keys;
pub mod login;
pub mod register;
pub mod role;
pub mod rotation;
pub mod server;
pub mod session;
pub mod sshcert;
pub mod store;
pub mod trust;
pub mod types;

pub use authz::{AuthContext, AuthorizationEngine, Caller};
pub use builtin::{Action, BuiltinRole, TrustDirection};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::AuthorityConfig;
pub use csr::{CertSign, CsrOptions};
pub use identity::Identity;
pub use impersonation::{ElevationStack, ImpersonationResolver};
pub use issuer::{AppTokenRequest, CertIssuer, Certs, HostCertsRequest, UserCertsRequest};
pub use keys::{calculate_pin, KeyPair};
pub use register::{register, RegisterParams, RegisterUsingTokenRequest, RegistrationEndpoint};
pub use role::{Role, RoleSet};
pub use rotation::{RotateRequest, RotationController};
pub use server::{with_deadline, AuthService};
pub use session::{ExtendRequest, WebSession};
pub use store::{Backend, CertAuthorityStore, MemoryBackend};
pub use trust::TrustManager;
pub use types::{
    AccessRequest, CertAuthId, CertAuthType, CertAuthority, CertificateFormat, RemoteCluster,
    RoleMapping, RotationMode, RotationPhase, RotationState, User,
};

/// Errors that can occur in nucleus-authority operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The caller is not permitted to perform the operation.
    #[error("access denied: {0}")]
    AccessDenied(String),

    /// The request is malformed or asks for an invalid transition.
    #[error("bad parameter: {0}")]
    BadParameter(String),

    /// The caller's cluster is not trusted, or a peer could not be reached.
    #[error("connection problem: {0}")]
    ConnectionProblem(String),

    /// The referenced resource does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// The resource being created already exists.
    #[error("already exists: {0}")]
    AlreadyExists(String),

    /// A compare-and-swap lost against a concurrent writer.
    #[error("compare failed: {0}")]
    CompareFailed(String),

    /// Retries or the request deadline were exhausted.
    #[error("service unavailable: {0}")]
    Unavailable(String),

    /// Certificate parsing, signing or validation error.
    #[error("certificate error: {0}")]
    Certificate(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Internal error.
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    pub fn is_access_denied(&self) -> bool {
        matches!(self, Error::AccessDenied(_))
    }

    pub fn is_bad_parameter(&self) -> bool {
        matches!(self, Error::BadParameter(_))
    }

    pub fn is_connection_problem(&self) -> bool {
        matches!(self, Error::ConnectionProblem(_))
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound(_))
    }

    pub fn is_already_exists(&self) -> bool {
        matches!(self, Error::AlreadyExists(_))
    }

    pub fn is_compare_failed(&self) -> bool {
        matches!(self, Error::CompareFailed(_))
    }

    /// Returns true for certificate validity failures (retired key, expiry, bad chain).
    pub fn is_certificate(&self) -> bool {
        matches!(self, Error::Certificate(_))
    }
}

/// Result type for nucleus-authority operations.
pub type Result<T> = std::result::Result<T, Error>;
