#![no_main]

use libfuzzer_sys::fuzz_target;
use nucleus_authority::Identity;

fuzz_target!(|data: &[u8]| {
    let _ = Identity::from_certificate_der(data);
});
