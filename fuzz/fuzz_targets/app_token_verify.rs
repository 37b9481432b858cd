#![no_main]

use std::sync::OnceLock;
use std::time::Duration;

use chrono::Utc;
use libfuzzer_sys::fuzz_target;
use nucleus_authority::jwt::verify_app_token;
use nucleus_authority::{CertAuthId, CertAuthType, KeyPair};

fn key() -> &'static KeyPair {
    static KEY: OnceLock<KeyPair> = OnceLock::new();
    KEY.get_or_init(|| {
        KeyPair::generate(
            &CertAuthId::new("fuzz.local", CertAuthType::JwtSigner),
            Utc::now(),
            Duration::from_secs(3600),
        )
        .expect("key generation")
    })
}

fuzz_target!(|data: &[u8]| {
    if let Ok(token) = std::str::from_utf8(data) {
        let _ = verify_app_token(token, [key()], "alice", "https://app.fuzz.local", Utc::now());
    }
});
