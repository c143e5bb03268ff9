use std::hint::black_box;
use std::time::Instant;

use chrono::Utc;
use cryptoshovel_envelope::message::{open, seal};
use cryptoshovel_envelope::{KeyRegistry, KeySource, MessageMetadata, SymmetricKey};

fn time_it<F: FnMut()>(label: &str, iters: usize, mut f: F) {
    // warmup
    for _ in 0..(iters / 10).max(10) {
        f();
    }

    let start = Instant::now();
    for _ in 0..iters {
        f();
    }
    let elapsed = start.elapsed();

    let per_iter = elapsed / (iters as u32);
    println!("{:<16} total={:?}  per_iter={:?}", label, elapsed, per_iter);
}

fn main() {
    let now = Utc::now();
    let mut registry = KeyRegistry::new();
    registry.add(SymmetricKey::generate(now)).unwrap();
    registry.select_active(now);
    let source = KeySource::Registry(&registry);

    let plaintext = vec![0x42u8; 1024];
    let meta = MessageMetadata::with_routing_key("bench.route");

    let ct = seal(&plaintext, &meta, source).unwrap();

    // Create a tampered ciphertext
    let mut ct_tampered = ct.clone();
    ct_tampered[ct_tampered.len() - 1] ^= 0x01;

    let mut ct_unknown = ct.clone();
    ct_unknown[1] ^= 0x01;

    let iters = 50_000;

    time_it("seal", iters, || {
        let out = seal(black_box(&plaintext), black_box(&meta), source).unwrap();
        black_box(out);
    });

    time_it("valid", iters, || {
        let pt = open(black_box(&ct), source).unwrap();
        black_box(pt);
    });

    time_it("tampered", iters, || {
        let r = open(black_box(&ct_tampered), source);
        black_box(r.err());
    });

    time_it("unknown_key", iters, || {
        let r = open(black_box(&ct_unknown), source);
        black_box(r.err());
    });

    time_it("short", iters, || {
        let r = open(black_box(b"short"), source);
        black_box(r.err());
    });

    println!("\nDone.");
}
