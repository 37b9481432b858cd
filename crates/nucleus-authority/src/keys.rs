//! Signing key generations and CA pins.
//!
//! A [`KeyPair`] is one generation of a certificate authority's signing
//! material: a P-256 key, the self-signed CA certificate that anchors X.509
//! chains, and the raw public point used to check SSH-form certificates and
//! application tokens. The same generation signs all three credential forms.

use chrono::{DateTime, Utc};
use rcgen::{
    BasicConstraints, CertificateParams, CertificateSigningRequestParams, DistinguishedName,
    DnType, IsCa, KeyUsagePurpose,
};
use ring::rand::SystemRandom;
use ring::signature::{self, EcdsaKeyPair, KeyPair as _};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::time::Duration;
use subtle::ConstantTimeEq;
use time::OffsetDateTime;

use crate::clock::{add, truncate_secs};
use crate::types::CertAuthId;
use crate::{Error, Result};

/// Prefix of every CA pin.
pub const PIN_PREFIX: &str = "sha256:";

/// Certificates are backdated by this much to tolerate clock skew between hosts.
pub(crate) const CLOCK_SKEW: chrono::Duration = chrono::Duration::minutes(1);

/// One generation of CA signing material.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyPair {
    /// Hex SHA-256 of the public key.
    pub kid: String,
    /// Uncompressed P-256 public point.
    pub public_key: Vec<u8>,
    /// Self-signed CA certificate, DER.
    pub cert_der: Vec<u8>,
    /// PKCS#8 private key, PEM. `None` when loaded without secrets.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub private_key_pem: Option<String>,
    pub not_before: DateTime<Utc>,
    pub not_after: DateTime<Utc>,
}

impl fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyPair")
            .field("kid", &self.kid)
            .field("not_before", &self.not_before)
            .field("not_after", &self.not_after)
            .field(
                "private_key_pem",
                &self.private_key_pem.as_ref().map(|_| "[REDACTED]"),
            )
            .finish()
    }
}

impl KeyPair {
    /// Generates a new key and self-signs its CA certificate.
    pub fn generate(id: &CertAuthId, now: DateTime<Utc>, validity: Duration) -> Result<Self> {
        let key = rcgen::KeyPair::generate_for(&rcgen::PKCS_ECDSA_P256_SHA256)
            .map_err(|e| Error::Internal(format!("key generation failed: {e}")))?;
        let private_key_pem = key.serialize_pem();
        let public_key = public_point(&key.serialize_der())?;
        let kid = hex::encode(Sha256::digest(&public_key));

        let not_before = truncate_secs(now) - CLOCK_SKEW;
        let not_after = truncate_secs(add(now, validity)?);
        let params = ca_params(id, &kid, not_before, not_after)?;
        let cert = params
            .self_signed(&key)
            .map_err(|e| Error::Certificate(format!("CA certificate generation failed: {e}")))?;

        Ok(Self {
            kid,
            public_key,
            cert_der: cert.der().to_vec(),
            private_key_pem: Some(private_key_pem),
            not_before,
            not_after,
        })
    }

    pub fn has_private_key(&self) -> bool {
        self.private_key_pem.is_some()
    }

    /// Returns a copy carrying only public material.
    pub fn without_secrets(&self) -> Self {
        Self {
            private_key_pem: None,
            ..self.clone()
        }
    }

    /// The CA pin of this generation's certificate.
    pub fn pin(&self) -> String {
        calculate_pin(&self.cert_der)
    }

    pub fn cert_pem(&self) -> String {
        pem::encode(&pem::Pem::new("CERTIFICATE", self.cert_der.clone()))
    }

    fn private_key_pem(&self) -> Result<&str> {
        self.private_key_pem
            .as_deref()
            .ok_or_else(|| Error::Internal(format!("key {} has no private material", self.kid)))
    }

    fn pkcs8_der(&self) -> Result<Vec<u8>> {
        let parsed = pem::parse(self.private_key_pem()?)
            .map_err(|e| Error::Internal(format!("failed to parse private key PEM: {e}")))?;
        Ok(parsed.into_contents())
    }

    /// Signs a certificate request with this generation, returning the leaf DER.
    pub(crate) fn sign_csr(
        &self,
        id: &CertAuthId,
        csr: &CertificateSigningRequestParams,
    ) -> Result<Vec<u8>> {
        let key = rcgen::KeyPair::from_pem(self.private_key_pem()?)
            .map_err(|e| Error::Internal(format!("failed to load CA key: {e}")))?;
        let params = ca_params(id, &self.kid, self.not_before, self.not_after)?;
        let issuer = rcgen::Issuer::from_params(&params, &key);
        let cert = csr
            .signed_by(&issuer)
            .map_err(|e| Error::Certificate(format!("certificate signing failed: {e}")))?;
        Ok(cert.der().to_vec())
    }

    /// ECDSA P-256 SHA-256 signature in fixed (r || s) form.
    pub(crate) fn sign(&self, message: &[u8]) -> Result<Vec<u8>> {
        let rng = SystemRandom::new();
        let key_pair = EcdsaKeyPair::from_pkcs8(
            &signature::ECDSA_P256_SHA256_FIXED_SIGNING,
            &self.pkcs8_der()?,
            &rng,
        )
        .map_err(|e| Error::Internal(format!("failed to load ECDSA key pair: {e}")))?;
        let sig = key_pair
            .sign(&rng, message)
            .map_err(|e| Error::Internal(format!("ECDSA signing failed: {e}")))?;
        Ok(sig.as_ref().to_vec())
    }

    pub(crate) fn verify(&self, message: &[u8], sig: &[u8]) -> bool {
        signature::UnparsedPublicKey::new(&signature::ECDSA_P256_SHA256_FIXED, &self.public_key)
            .verify(message, sig)
            .is_ok()
    }
}

/// Computes the pin of a DER-encoded CA certificate: `sha256:<hex>`.
pub fn calculate_pin(cert_der: &[u8]) -> String {
    format!("{PIN_PREFIX}{}", hex::encode(Sha256::digest(cert_der)))
}

/// Compares two pins in constant time. Case of the hex digits is ignored.
pub fn pins_match(a: &str, b: &str) -> bool {
    let a = a.trim().to_ascii_lowercase();
    let b = b.trim().to_ascii_lowercase();
    if a.len() != b.len() {
        return false;
    }
    a.as_bytes().ct_eq(b.as_bytes()).into()
}

/// Returns true if `pin` is syntactically a SHA-256 pin.
pub fn is_well_formed_pin(pin: &str) -> bool {
    pin.strip_prefix(PIN_PREFIX)
        .is_some_and(|h| h.len() == 64 && h.chars().all(|c| c.is_ascii_hexdigit()))
}

fn public_point(pkcs8_der: &[u8]) -> Result<Vec<u8>> {
    let rng = SystemRandom::new();
    let key_pair =
        EcdsaKeyPair::from_pkcs8(&signature::ECDSA_P256_SHA256_FIXED_SIGNING, pkcs8_der, &rng)
            .map_err(|e| Error::Internal(format!("failed to load ECDSA key pair: {e}")))?;
    Ok(key_pair.public_key().as_ref().to_vec())
}

pub(crate) fn to_offset(at: DateTime<Utc>) -> Result<OffsetDateTime> {
    OffsetDateTime::from_unix_timestamp(at.timestamp())
        .map_err(|e| Error::BadParameter(format!("timestamp out of range: {e}")))
}

/// CA certificate parameters. Rebuilt identically when signing so issued
/// certificates name exactly the subject of the anchor.
fn ca_params(
    id: &CertAuthId,
    kid: &str,
    not_before: DateTime<Utc>,
    not_after: DateTime<Utc>,
) -> Result<CertificateParams> {
    let mut params = CertificateParams::new(vec![])
        .map_err(|e| Error::Certificate(format!("failed to create params: {e}")))?;

    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, id.domain.clone());
    dn.push(DnType::OrganizationName, "Nucleus");
    dn.push(
        DnType::OrganizationalUnitName,
        format!("{} CA {}", id.ca_type, &kid[..kid.len().min(16)]),
    );
    params.distinguished_name = dn;

    params.not_before = to_offset(not_before)?;
    params.not_after = to_offset(not_after)?;
    params.is_ca = IsCa::Ca(BasicConstraints::Constrained(0));
    params.key_usages = vec![
        KeyUsagePurpose::KeyCertSign,
        KeyUsagePurpose::CrlSign,
        KeyUsagePurpose::DigitalSignature,
    ];
    Ok(params)
}
