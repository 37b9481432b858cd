//! ES256 compact JWS and application tokens.
//!
//! Applications behind the proxy receive a short-lived token naming the user
//! and roles. The token is signed by the cluster's JWT-signer CA and carries
//! the signing key's id in its header, so verifiers can pick the right key
//! out of the CA's trust set while a rotation is in progress.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::keys::KeyPair;
use crate::{Error, Result};

pub const ALG_ES256: &str = "ES256";
pub const TYP_JWT: &str = "JWT";

/// Protected header of a compact JWS.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JwsHeader {
    pub alg: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub typ: Option<String>,
}

/// Public half of a signing key in JWK form.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JsonWebKey {
    pub kty: String,
    pub crv: String,
    pub x: String,
    pub y: String,
    pub kid: String,
    pub alg: String,
}

impl JsonWebKey {
    pub fn from_key_pair(key: &KeyPair) -> Result<Self> {
        if key.public_key.len() != 65 || key.public_key[0] != 0x04 {
            return Err(Error::Internal(format!(
                "key {} is not an uncompressed P-256 point",
                key.kid
            )));
        }
        Ok(Self {
            kty: "EC".to_string(),
            crv: "P-256".to_string(),
            x: URL_SAFE_NO_PAD.encode(&key.public_key[1..33]),
            y: URL_SAFE_NO_PAD.encode(&key.public_key[33..65]),
            kid: key.kid.clone(),
            alg: ALG_ES256.to_string(),
        })
    }
}

/// Signs `payload` as a compact JWS with the given key.
pub(crate) fn sign_es256(payload: &[u8], key: &KeyPair, typ: &str) -> Result<String> {
    let header = JwsHeader {
        alg: ALG_ES256.to_string(),
        kid: Some(key.kid.clone()),
        typ: Some(typ.to_string()),
    };
    let header_json = serde_json::to_vec(&header)
        .map_err(|e| Error::Internal(format!("failed to encode JWS header: {e}")))?;

    let signing_input = format!(
        "{}.{}",
        URL_SAFE_NO_PAD.encode(header_json),
        URL_SAFE_NO_PAD.encode(payload)
    );
    let sig = key.sign(signing_input.as_bytes())?;

    Ok(format!("{signing_input}.{}", URL_SAFE_NO_PAD.encode(sig)))
}

/// Verifies a compact JWS against any of `keys` and returns its header and payload.
///
/// When the header names a key id only that key is tried.
pub(crate) fn verify_es256<'a>(
    jws: &str,
    keys: impl IntoIterator<Item = &'a KeyPair>,
) -> Result<(JwsHeader, Vec<u8>)> {
    let parts: Vec<&str> = jws.splitn(3, '.').collect();
    if parts.len() != 3 {
        return Err(Error::BadParameter(
            "JWS must have exactly 3 dot-separated parts".to_string(),
        ));
    }
    let [header_b64, payload_b64, sig_b64] = [parts[0], parts[1], parts[2]];

    let header_bytes = URL_SAFE_NO_PAD
        .decode(header_b64)
        .map_err(|e| Error::BadParameter(format!("invalid base64url header: {e}")))?;
    let header: JwsHeader = serde_json::from_slice(&header_bytes)
        .map_err(|e| Error::BadParameter(format!("invalid JWS header: {e}")))?;
    if header.alg != ALG_ES256 {
        return Err(Error::BadParameter(format!(
            "unsupported JWS algorithm: {}",
            header.alg
        )));
    }

    let sig = URL_SAFE_NO_PAD
        .decode(sig_b64)
        .map_err(|e| Error::BadParameter(format!("invalid base64url signature: {e}")))?;
    let signing_input = format!("{header_b64}.{payload_b64}");

    let verified = keys
        .into_iter()
        .filter(|k| header.kid.as_deref().is_none_or(|kid| kid == k.kid))
        .any(|k| k.verify(signing_input.as_bytes(), &sig));
    if !verified {
        return Err(Error::Certificate(
            "signature does not match any trusted key".to_string(),
        ));
    }

    let payload = URL_SAFE_NO_PAD
        .decode(payload_b64)
        .map_err(|e| Error::BadParameter(format!("invalid base64url payload: {e}")))?;
    Ok((header, payload))
}

/// Claims of an application token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppTokenClaims {
    /// Issuing cluster.
    pub iss: String,
    /// Username.
    pub sub: String,
    /// Application URI.
    pub aud: String,
    pub roles: Vec<String>,
    pub iat: i64,
    pub nbf: i64,
    pub exp: i64,
}

impl AppTokenClaims {
    pub fn expires(&self) -> Option<DateTime<Utc>> {
        DateTime::from_timestamp(self.exp, 0)
    }
}

pub(crate) fn encode_app_token(claims: &AppTokenClaims, key: &KeyPair) -> Result<String> {
    let payload = serde_json::to_vec(claims)
        .map_err(|e| Error::Internal(format!("failed to encode claims: {e}")))?;
    sign_es256(&payload, key, TYP_JWT)
}

/// Checks signature, audience, subject and validity window of an app token.
pub fn verify_app_token<'a>(
    token: &str,
    keys: impl IntoIterator<Item = &'a KeyPair>,
    username: &str,
    uri: &str,
    now: DateTime<Utc>,
) -> Result<AppTokenClaims> {
    let (_, payload) = verify_es256(token, keys)?;
    let claims: AppTokenClaims = serde_json::from_slice(&payload)
        .map_err(|e| Error::BadParameter(format!("invalid token claims: {e}")))?;

    if claims.sub != username {
        return Err(Error::AccessDenied(format!(
            "token issued to {}, not {username}",
            claims.sub
        )));
    }
    if claims.aud != uri {
        return Err(Error::AccessDenied(format!(
            "token issued for {}, not {uri}",
            claims.aud
        )));
    }
    let now = now.timestamp();
    if now < claims.nbf || now >= claims.exp {
        return Err(Error::Certificate("token is expired or not yet valid".into()));
    }
    Ok(claims)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{CertAuthId, CertAuthType};
    use std::time::Duration;

    fn key() -> KeyPair {
        let id = CertAuthId::new("nucleus.local", CertAuthType::JwtSigner);
        KeyPair::generate(&id, Utc::now(), Duration::from_secs(3600)).unwrap()
    }

    fn claims(now: DateTime<Utc>) -> AppTokenClaims {
        AppTokenClaims {
            iss: "nucleus.local".into(),
            sub: "alice".into(),
            aud: "https://grafana.nucleus.local".into(),
            roles: vec!["dev".into()],
            iat: now.timestamp(),
            nbf: now.timestamp(),
            exp: now.timestamp() + 60,
        }
    }

    #[test]
    fn test_jws_sign_verify() {
        let key = key();
        let jws = sign_es256(b"hello", &key, TYP_JWT).unwrap();
        let (header, payload) = verify_es256(&jws, [&key]).unwrap();

        assert_eq!(payload, b"hello");
        assert_eq!(header.kid.as_deref(), Some(key.kid.as_str()));
        assert_eq!(header.alg, ALG_ES256);
    }

    #[test]
    fn test_jws_wrong_key() {
        let jws = sign_es256(b"hello", &key(), TYP_JWT).unwrap();
        let err = verify_es256(&jws, [&key()]).unwrap_err();
        assert!(err.is_certificate());
    }

    #[test]
    fn test_jws_tampered_payload() {
        let key = key();
        let jws = sign_es256(b"hello", &key, TYP_JWT).unwrap();
        let parts: Vec<&str> = jws.split('.').collect();
        let tampered = format!("{}.{}.{}", parts[0], URL_SAFE_NO_PAD.encode(b"bye"), parts[2]);

        assert!(verify_es256(&tampered, [&key]).unwrap_err().is_certificate());
    }

    #[test]
    fn test_jws_rejects_malformed_input() {
        let key = key();
        assert!(verify_es256("", [&key]).unwrap_err().is_bad_parameter());
        assert!(verify_es256("a.b", [&key]).unwrap_err().is_bad_parameter());
        assert!(verify_es256("!!.!!.!!", [&key]).unwrap_err().is_bad_parameter());
    }

    #[test]
    fn test_app_token_round_trip() {
        let key = key();
        let now = Utc::now();
        let token = encode_app_token(&claims(now), &key).unwrap();

        let verified = verify_app_token(
            &token,
            [&key],
            "alice",
            "https://grafana.nucleus.local",
            now,
        )
        .unwrap();
        assert_eq!(verified.roles, vec!["dev"]);
    }

    #[test]
    fn test_app_token_wrong_audience_or_subject() {
        let key = key();
        let now = Utc::now();
        let token = encode_app_token(&claims(now), &key).unwrap();

        assert!(verify_app_token(&token, [&key], "bob", "https://grafana.nucleus.local", now)
            .unwrap_err()
            .is_access_denied());
        assert!(verify_app_token(&token, [&key], "alice", "https://other", now)
            .unwrap_err()
            .is_access_denied());
    }

    #[test]
    fn test_app_token_expired() {
        let key = key();
        let now = Utc::now();
        let token = encode_app_token(&claims(now), &key).unwrap();
        let later = now + chrono::Duration::seconds(61);

        let err = verify_app_token(&token, [&key], "alice", "https://grafana.nucleus.local", later)
            .unwrap_err();
        assert!(err.is_certificate());
    }

    #[test]
    fn test_jwk_coordinates() {
        let key = key();
        let jwk = JsonWebKey::from_key_pair(&key).unwrap();
        let x = URL_SAFE_NO_PAD.decode(&jwk.x).unwrap();
        let y = URL_SAFE_NO_PAD.decode(&jwk.y).unwrap();
        assert_eq!(x.len(), 32);
        assert_eq!(y.len(), 32);
        assert_eq!(jwk.kid, key.kid);
    }
}
