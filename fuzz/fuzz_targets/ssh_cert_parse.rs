#![no_main]

use libfuzzer_sys::fuzz_target;
use nucleus_authority::sshcert::SshCertificate;

fuzz_target!(|data: &[u8]| {
    if let Ok(s) = std::str::from_utf8(data) {
        if let Ok(cert) = SshCertificate::parse_unverified(s) {
            let _ = cert.roles();
            let _ = cert.active_requests();
        }
    }
});
