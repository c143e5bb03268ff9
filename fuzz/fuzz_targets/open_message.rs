#![no_main]

use chrono::Utc;
use cryptoshovel_envelope::message::open;
use cryptoshovel_envelope::{KeyRegistry, KeySource, SymmetricKey};
use libfuzzer_sys::fuzz_target;
use once_cell::sync::Lazy;

static REGISTRY: Lazy<KeyRegistry> = Lazy::new(|| {
    let now = Utc::now();
    let mut registry = KeyRegistry::new();
    let _ = registry.add(SymmetricKey::generate(now));
    registry.select_active(now);
    registry
});

fuzz_target!(|data: &[u8]| {
    let _ = cryptoshovel_envelope::inspect(data);
    let _ = open(data, KeySource::Registry(&REGISTRY));
    if let Some(key) = REGISTRY.active() {
        let _ = open(data, KeySource::Bare(key));
    }
});
