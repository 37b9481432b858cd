//! Joining a cluster.
//!
//! A new host holds a provisioning token and some way of recognising the
//! genuine cluster: a list of CA pins, a CA certificate file, or both. It asks
//! each server in turn for the cluster's host CA certificates, checks them,
//! and only then presents its token.

use async_trait::async_trait;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};

use crate::builtin::BuiltinRole;
use crate::issuer::{Certs, HostCertsRequest};
use crate::keys::{calculate_pin, is_well_formed_pin, pins_match};
use crate::{Error, Result};

/// Token redemption request sent once the server has been recognised.
#[derive(Debug, Clone)]
pub struct RegisterUsingTokenRequest {
    pub token: String,
    pub host: HostCertsRequest,
}

#[derive(Debug, Clone)]
pub struct RegisterParams {
    pub token: String,
    pub host_id: String,
    pub node_name: String,
    pub role: BuiltinRole,
    pub additional_principals: Vec<String>,
    /// PEM CSR for the host key.
    pub public_key: String,
    /// Acceptable `sha256:<hex>` pins of the cluster's host CA.
    pub ca_pins: Vec<String>,
    /// PEM file holding the cluster's host CA certificate.
    pub ca_path: Option<PathBuf>,
}

impl RegisterParams {
    fn request(&self) -> RegisterUsingTokenRequest {
        RegisterUsingTokenRequest {
            token: self.token.clone(),
            host: HostCertsRequest {
                host_id: self.host_id.clone(),
                node_name: self.node_name.clone(),
                role: self.role,
                additional_principals: self.additional_principals.clone(),
                public_key: self.public_key.clone(),
            },
        }
    }
}

/// A server a host can register with.
#[async_trait]
pub trait RegistrationEndpoint: Send + Sync {
    /// Address used in logs.
    fn addr(&self) -> String;

    /// DER certificates of the cluster's host CA trust set.
    async fn cluster_ca_certs(&self) -> Result<Vec<Vec<u8>>>;

    async fn register_using_token(&self, req: RegisterUsingTokenRequest) -> Result<Certs>;
}

/// Registers with the first reachable server in `servers`.
///
/// Unreachable servers are skipped; any other failure ends registration.
pub async fn register(servers: &[Arc<dyn RegistrationEndpoint>], params: &RegisterParams) -> Result<Certs> {
    if servers.is_empty() {
        return Err(Error::BadParameter("no servers to register with".into()));
    }
    let trusted = load_ca_file(params).await?;
    if params.ca_pins.is_empty() && trusted.is_none() {
        warn!(
            host = %params.host_id,
            "registering without CA pins or CA file, the cluster's identity is not checked"
        );
    }

    let mut last_error = None;
    for server in servers {
        match register_with(server.as_ref(), params, trusted.as_deref()).await {
            Ok(certs) => {
                info!(
                    host = %params.host_id,
                    role = %params.role,
                    server = %server.addr(),
                    "registered with cluster"
                );
                return Ok(certs);
            }
            Err(e @ (Error::ConnectionProblem(_) | Error::Unavailable(_))) => {
                warn!(server = %server.addr(), error = %e, "server unreachable, trying next");
                last_error = Some(e);
            }
            Err(e) => return Err(e),
        }
    }
    Err(last_error.unwrap_or_else(|| Error::Unavailable("no server reachable".into())))
}

async fn register_with(
    server: &dyn RegistrationEndpoint,
    params: &RegisterParams,
    trusted: Option<&[Vec<u8>]>,
) -> Result<Certs> {
    let presented = server.cluster_ca_certs().await?;
    if presented.is_empty() {
        return Err(Error::AccessDenied(format!(
            "{} presented no CA certificates",
            server.addr()
        )));
    }
    if !params.ca_pins.is_empty() {
        check_pins(&presented, &params.ca_pins)?;
    }
    if let Some(trusted) = trusted {
        if !presented.iter().any(|der| trusted.contains(der)) {
            return Err(Error::AccessDenied(format!(
                "CA presented by {} does not match the CA file",
                server.addr()
            )));
        }
    }
    server.register_using_token(params.request()).await
}

/// Succeeds if any presented certificate matches any pin.
pub fn check_pins(presented: &[Vec<u8>], pins: &[String]) -> Result<()> {
    let presented: Vec<String> = presented.iter().map(|der| calculate_pin(der)).collect();
    for pin in pins {
        if !is_well_formed_pin(pin) {
            warn!(pin = %pin, "ignoring malformed CA pin");
            continue;
        }
        if presented.iter().any(|actual| pins_match(actual, pin)) {
            return Ok(());
        }
    }
    Err(Error::AccessDenied(
        "cluster CA does not match any of the supplied pins".into(),
    ))
}

async fn load_ca_file(params: &RegisterParams) -> Result<Option<Vec<Vec<u8>>>> {
    let Some(path) = &params.ca_path else {
        return Ok(None);
    };
    let contents = tokio::fs::read_to_string(path).await?;
    let ders: Vec<Vec<u8>> = pem::parse_many(&contents)
        .map_err(|e| Error::BadParameter(format!("failed to parse {}: {e}", path.display())))?
        .into_iter()
        .filter(|p| p.tag() == "CERTIFICATE")
        .map(pem::Pem::into_contents)
        .collect();
    if ders.is_empty() {
        return Err(Error::BadParameter(format!(
            "{} holds no certificates",
            path.display()
        )));
    }
    Ok(Some(ders))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::Identity;
    use crate::keys::KeyPair;
    use crate::types::{CertAuthId, CertAuthType};
    use chrono::Utc;
    use parking_lot::Mutex;
    use std::io::Write;
    use std::time::Duration;

    struct FakeServer {
        addr: &'static str,
        ca: Vec<u8>,
        reachable: bool,
        redeemed: Mutex<Vec<String>>,
    }

    impl FakeServer {
        fn new(addr: &'static str, ca: &KeyPair, reachable: bool) -> Arc<Self> {
            Arc::new(Self {
                addr,
                ca: ca.cert_der.clone(),
                reachable,
                redeemed: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl RegistrationEndpoint for FakeServer {
        fn addr(&self) -> String {
            self.addr.to_string()
        }

        async fn cluster_ca_certs(&self) -> Result<Vec<Vec<u8>>> {
            if !self.reachable {
                return Err(Error::ConnectionProblem(format!("{} refused", self.addr)));
            }
            Ok(vec![self.ca.clone()])
        }

        async fn register_using_token(&self, req: RegisterUsingTokenRequest) -> Result<Certs> {
            self.redeemed.lock().push(req.token);
            Ok(Certs {
                ssh: String::new(),
                tls: String::new(),
                tls_ca_certs: Vec::new(),
                identity: Identity::host(
                    &req.host.host_id,
                    "nucleus.local",
                    req.host.role,
                    vec![req.host.host_id.clone()],
                    Utc::now(),
                ),
            })
        }
    }

    fn ca() -> KeyPair {
        KeyPair::generate(
            &CertAuthId::new("nucleus.local", CertAuthType::Host),
            Utc::now(),
            Duration::from_secs(3600),
        )
        .unwrap()
    }

    fn params(pins: Vec<String>) -> RegisterParams {
        RegisterParams {
            token: "join-token".into(),
            host_id: "node-1".into(),
            node_name: "node-1".into(),
            role: BuiltinRole::Node,
            additional_principals: vec![],
            public_key: String::new(),
            ca_pins: pins,
            ca_path: None,
        }
    }

    const GARBAGE_PIN: &str = "sha256:0000000000000000000000000000000000000000000000000000000000000000";

    #[tokio::test]
    async fn test_one_valid_pin_among_garbage() {
        let ca = ca();
        let server = FakeServer::new("auth-1", &ca, true);
        let servers: Vec<Arc<dyn RegistrationEndpoint>> = vec![server.clone()];

        let certs = register(&servers, &params(vec![GARBAGE_PIN.into(), "not-a-pin".into(), ca.pin()]))
            .await
            .unwrap();
        assert_eq!(certs.identity.username, "node-1");
        assert_eq!(*server.redeemed.lock(), vec!["join-token".to_string()]);
    }

    #[tokio::test]
    async fn test_garbage_pins_only_rejected() {
        let server = FakeServer::new("auth-1", &ca(), true);
        let servers: Vec<Arc<dyn RegistrationEndpoint>> = vec![server.clone()];

        let err = register(&servers, &params(vec![GARBAGE_PIN.into(), "garbage".into()]))
            .await
            .unwrap_err();
        assert!(err.is_access_denied());
        assert!(server.redeemed.lock().is_empty());
    }

    #[tokio::test]
    async fn test_fails_over_unreachable_servers() {
        let ca = ca();
        let down = FakeServer::new("auth-1", &ca, false);
        let up = FakeServer::new("auth-2", &ca, true);
        let servers: Vec<Arc<dyn RegistrationEndpoint>> = vec![down, up.clone()];

        register(&servers, &params(vec![ca.pin()])).await.unwrap();
        assert_eq!(up.redeemed.lock().len(), 1);

        let all_down: Vec<Arc<dyn RegistrationEndpoint>> = vec![FakeServer::new("auth-3", &ca, false)];
        let err = register(&all_down, &params(vec![ca.pin()])).await.unwrap_err();
        assert!(err.is_connection_problem());
    }

    #[tokio::test]
    async fn test_pin_mismatch_does_not_fail_over() {
        let genuine = ca();
        let impostor = FakeServer::new("auth-1", &ca(), true);
        let real = FakeServer::new("auth-2", &genuine, true);
        let servers: Vec<Arc<dyn RegistrationEndpoint>> = vec![impostor, real.clone()];

        let err = register(&servers, &params(vec![genuine.pin()])).await.unwrap_err();
        assert!(err.is_access_denied());
        assert!(real.redeemed.lock().is_empty());
    }

    #[tokio::test]
    async fn test_ca_path() {
        let genuine_ca = ca();
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(genuine_ca.cert_pem().as_bytes()).unwrap();

        let mut with_file = params(vec![]);
        with_file.ca_path = Some(file.path().to_path_buf());

        let genuine: Vec<Arc<dyn RegistrationEndpoint>> = vec![FakeServer::new("auth-1", &genuine_ca, true)];
        register(&genuine, &with_file).await.unwrap();

        let impostor: Vec<Arc<dyn RegistrationEndpoint>> = vec![FakeServer::new("auth-1", &ca(), true)];
        assert!(register(&impostor, &with_file).await.unwrap_err().is_access_denied());
    }

    #[tokio::test]
    async fn test_no_servers() {
        assert!(register(&[], &params(vec![])).await.unwrap_err().is_bad_parameter());
    }
}
