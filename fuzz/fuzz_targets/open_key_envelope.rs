#![no_main]

use chrono::Utc;
use cryptoshovel_envelope::{key_envelope, RsaIdentity};
use libfuzzer_sys::fuzz_target;
use once_cell::sync::Lazy;

static IDENTITIES: Lazy<Option<(RsaIdentity, RsaIdentity)>> = Lazy::new(|| {
    let me = RsaIdentity::generate(1024).ok()?;
    let sender = RsaIdentity::generate(1024).ok()?;
    Some((me, sender.to_public()))
});

fuzz_target!(|data: &[u8]| {
    let Some((me, sender)) = IDENTITIES.as_ref() else {
        return;
    };
    let _ = cryptoshovel_envelope::wire::decode_key_envelope(data);

    // Address arbitrary input to this identity so the RSA path is reached.
    let mut addressed = data.to_vec();
    if addressed.len() > 17 {
        addressed[0] = cryptoshovel_envelope::wire::KEY_TAG;
        addressed[1..17].copy_from_slice(me.fingerprint().as_bytes());
    }
    let _ = key_envelope::open(&addressed, me, sender, Utc::now());
});
