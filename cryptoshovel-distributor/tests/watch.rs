use std::time::Duration;

use tokio::time::timeout;

use cryptoshovel_distributor::{FileWatcher, MEMBERSHIP_DEBOUNCE_MS};

const POLL: Duration = Duration::from_millis(20);
const PATIENCE: Duration = Duration::from_secs(5);

#[tokio::test]
async fn reports_initial_content_and_changes() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("receivers.json");
    std::fs::write(&path, r#"{ "endpoint": [] }"#).unwrap();

    let (mut changes, task) = FileWatcher::new(&path, POLL).spawn();
    let first = timeout(PATIENCE, changes.recv()).await.unwrap().unwrap();
    assert_eq!(first, r#"{ "endpoint": [] }"#);

    let updated = r#"{ "endpoint": [{ "key": "receiver1.public" }] }"#;
    std::fs::write(&path, updated).unwrap();
    let second = timeout(PATIENCE, changes.recv()).await.unwrap().unwrap();
    assert_eq!(second, updated);

    drop(changes);
    timeout(PATIENCE, task).await.unwrap().unwrap();
}

#[tokio::test]
async fn same_content_rewritten_later_is_reported_again() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("receivers.json");
    let content = r#"{ "endpoint": [{ "key": "receiver1.public", "resend": true }] }"#;
    std::fs::write(&path, content).unwrap();

    let (mut changes, _task) = FileWatcher::new(&path, POLL).spawn();
    let first = timeout(PATIENCE, changes.recv()).await.unwrap().unwrap();
    assert_eq!(first, content);

    // well past the debounce window, and long enough for a new mtime
    tokio::time::sleep(Duration::from_millis(MEMBERSHIP_DEBOUNCE_MS as u64 * 3)).await;
    std::fs::write(&path, content).unwrap();
    let again = timeout(PATIENCE, changes.recv()).await.unwrap().unwrap();
    assert_eq!(again, content);
}

#[tokio::test]
async fn waits_for_missing_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("late.json");

    let (mut changes, _task) = FileWatcher::new(&path, POLL).spawn();
    assert!(timeout(POLL * 5, changes.recv()).await.is_err());

    std::fs::write(&path, "{}").unwrap();
    let content = timeout(PATIENCE, changes.recv()).await.unwrap().unwrap();
    assert_eq!(content, "{}");
}

#[test]
fn keeps_its_path() {
    let watcher = FileWatcher::new("/etc/shovel/receivers.json", POLL);
    assert_eq!(
        watcher.path(),
        std::path::Path::new("/etc/shovel/receivers.json")
    );
}
