//! The async driver under paused tokio time.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use chrono::DateTime;
use tokio::sync::mpsc;
use tokio::time::Instant;

use cryptoshovel_distributor::*;
use cryptoshovel_envelope::{Fingerprint, KeyRegistry, RsaIdentity};

fn fixture(name: &str) -> RsaIdentity {
    let path = format!(
        "{}/../tests/data/rsa-keys/{}.pem",
        env!("CARGO_MANIFEST_DIR"),
        name
    );
    let pem = std::fs::read_to_string(path).unwrap();
    if name.ends_with(".private") {
        RsaIdentity::from_private_pem(&pem).unwrap()
    } else {
        RsaIdentity::from_public_pem(&pem).unwrap()
    }
}

fn resolver() -> HashMap<String, Arc<RsaIdentity>> {
    (1..=3)
        .map(|n| {
            let name = format!("receiver{}.public", n);
            let identity = Arc::new(fixture(&name));
            (name, identity)
        })
        .collect()
}

fn members(receivers: &[u32]) -> String {
    let entries: Vec<String> = receivers
        .iter()
        .map(|n| format!(r#"{{ "key": "receiver{}.public" }}"#, n))
        .collect();
    format!(r#"{{ "endpoint": [{}] }}"#, entries.join(", "))
}

fn fast() -> DistributorConfig {
    DistributorConfig {
        key_rotation_interval: 8000,
        start_update_window: 6000,
        end_update_window: 2000,
    }
}

struct Running {
    handle: ServiceHandle,
    changes: mpsc::Sender<String>,
    deliveries: mpsc::UnboundedReceiver<Delivery>,
    audit: InMemoryAuditSink,
    registry: SharedRegistry,
}

fn spawn_service() -> Running {
    spawn_service_with(KeyRegistry::new())
}

fn spawn_service_with(registry: KeyRegistry) -> Running {
    let audit = InMemoryAuditSink::new();
    let registry: SharedRegistry = Arc::new(RwLock::new(registry));
    let distributor = KeyDistributor::new(
        fast(),
        Arc::new(fixture("sender.private")),
        Arc::new(resolver()),
        registry.clone(),
        Arc::new(audit.clone()),
    )
    .unwrap();

    let (transport, deliveries) = ChannelTransport::new();
    let (changes, changes_rx) = mpsc::channel(4);
    let clock = TokioClock::new(DateTime::from_timestamp_millis(1_700_000_000_000).unwrap());
    let handle = DistributorService::new(
        distributor,
        Arc::new(transport),
        Arc::new(audit.clone()),
        clock,
    )
    .spawn(changes_rx);

    Running {
        handle,
        changes,
        deliveries,
        audit,
        registry,
    }
}

async fn next(deliveries: &mut mpsc::UnboundedReceiver<Delivery>) -> Delivery {
    deliveries.recv().await.expect("service dropped its transport")
}

#[tokio::test(start_paused = true)]
async fn rollout_follows_the_schedule() {
    let mut running = spawn_service();
    let started = Instant::now();
    running.changes.send(members(&[1, 2])).await.unwrap();

    let mut first = vec![
        next(&mut running.deliveries).await.receiver,
        next(&mut running.deliveries).await.receiver,
    ];
    first.sort();
    let mut expected = vec![
        fixture("receiver1.public").fingerprint(),
        fixture("receiver2.public").fingerprint(),
    ];
    expected.sort();
    assert_eq!(first, expected);
    assert!(started.elapsed() < Duration::from_secs(1));
    assert!(running.registry.read().unwrap().active_id().is_some());

    // next key: first paced send when its start window opens
    next(&mut running.deliveries).await;
    let elapsed = started.elapsed();
    assert!(elapsed >= Duration::from_secs(2) && elapsed < Duration::from_secs(3));

    // the last receiver halfway to the end window
    next(&mut running.deliveries).await;
    let elapsed = started.elapsed();
    assert!(elapsed >= Duration::from_secs(6) && elapsed < Duration::from_secs(7));

    let distributor = running.handle.stop().await.unwrap();
    assert!(!distributor.is_started());
    assert!(distributor.next_deadline().is_none());
    assert!(distributor.pending_key().is_some());
    assert_eq!(distributor.pending_unsent().len(), 0);
}

#[tokio::test(start_paused = true)]
async fn membership_change_reaches_new_receiver_only() {
    let mut running = spawn_service();
    running.changes.send(members(&[1])).await.unwrap();
    next(&mut running.deliveries).await;
    let active = running.registry.read().unwrap().active_id();

    running.changes.send(members(&[1, 3])).await.unwrap();
    let delivery = next(&mut running.deliveries).await;
    assert_eq!(delivery.receiver, fixture("receiver3.public").fingerprint());
    assert_eq!(running.registry.read().unwrap().active_id(), active);
    assert_eq!(running.registry.read().unwrap().len(), 1);

    running.handle.stop().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn failed_delivery_is_audited() {
    let mut running = spawn_service();
    let Running {
        deliveries,
        changes,
        ..
    } = &mut running;
    // nobody listens any more
    deliveries.close();
    changes.send(members(&[1])).await.unwrap();

    // let the service run the first rollout
    tokio::time::sleep(Duration::from_millis(10)).await;
    let failures = running.audit.count(|a| {
        matches!(a, AuditAction::KeySendFailed { reason } if reason.contains("closed"))
    });
    assert_eq!(failures, 1);
    // the receiver counts as served; the key still goes live
    assert!(running.registry.read().unwrap().active_id().is_some());

    running.handle.stop().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn closed_membership_channel_keeps_service_alive() {
    let running = spawn_service();
    let Running {
        handle, changes, ..
    } = running;
    drop(changes);
    tokio::time::sleep(Duration::from_secs(1)).await;

    let distributor = handle.stop().await.unwrap();
    assert!(distributor.receivers().is_empty());
    assert!(distributor.pending_key().is_none());
}

#[tokio::test(start_paused = true)]
async fn registry_store_is_written_by_the_outbound_task() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("keys.json");
    let mut running = spawn_service_with(KeyRegistry::open(&path).unwrap());
    running.changes.send(members(&[1])).await.unwrap();
    next(&mut running.deliveries).await;

    // stop waits for queued writes
    running.handle.stop().await.unwrap();
    let active = running.registry.read().unwrap().active_id();
    assert!(active.is_some());
    let stored = KeyRegistry::open(&path).unwrap();
    assert_eq!(stored.active_id(), active);
}

#[test]
fn fingerprints_are_distinct_fixtures() {
    let prints: Vec<Fingerprint> = (1..=3)
        .map(|n| fixture(&format!("receiver{}.public", n)).fingerprint())
        .collect();
    assert_ne!(prints[0], prints[1]);
    assert_ne!(prints[1], prints[2]);
}
