//! Membership file change notifications by polling.
//!
//! The file is stat'ed on every poll and re-read when its length or mtime
//! moved. Content identical to the last forwarded one is held back only
//! within the membership debounce window; a later rewrite of the same bytes
//! is forwarded again and the distributor decides what it means.

use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use sha2::{Digest, Sha256};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

use crate::distributor::MEMBERSHIP_DEBOUNCE_MS;

const DEBOUNCE: Duration = Duration::from_millis(MEMBERSHIP_DEBOUNCE_MS as u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Stamp {
    len: u64,
    modified: Option<SystemTime>,
}

/// Polls one file and sends its content on every change.
#[derive(Debug, Clone)]
pub struct FileWatcher {
    path: PathBuf,
    interval: Duration,
}

impl FileWatcher {
    pub fn new(path: impl Into<PathBuf>, interval: Duration) -> Self {
        Self {
            path: path.into(),
            interval,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Start polling. The current content is sent right away when the file
    /// is readable. The task ends when the receiver is dropped.
    pub fn spawn(self) -> (mpsc::Receiver<String>, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(8);
        let handle = tokio::spawn(self.run(tx));
        (rx, handle)
    }

    async fn run(self, tx: mpsc::Sender<String>) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut stamp: Option<Stamp> = None;
        let mut forwarded: Option<([u8; 32], Instant)> = None;

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = tx.closed() => break,
            }

            let current = match tokio::fs::metadata(&self.path).await {
                Ok(meta) => Stamp {
                    len: meta.len(),
                    modified: meta.modified().ok(),
                },
                Err(e) => {
                    if stamp.take().is_some() {
                        tracing::warn!(
                            path = %self.path.display(),
                            error = %e,
                            "membership file unavailable"
                        );
                    }
                    continue;
                }
            };
            if stamp == Some(current) {
                continue;
            }

            let bytes = match tokio::fs::read(&self.path).await {
                Ok(bytes) => bytes,
                Err(e) => {
                    tracing::warn!(
                        path = %self.path.display(),
                        error = %e,
                        "could not read membership file"
                    );
                    continue;
                }
            };
            stamp = Some(current);

            let hash: [u8; 32] = Sha256::digest(&bytes).into();
            if held_back(forwarded, hash, Instant::now()) {
                tracing::trace!(path = %self.path.display(), "same content rewritten");
                continue;
            }

            let content = match String::from_utf8(bytes) {
                Ok(content) => content,
                Err(e) => {
                    tracing::warn!(
                        path = %self.path.display(),
                        error = %e,
                        "membership file is not UTF-8"
                    );
                    continue;
                }
            };
            tracing::debug!(
                path = %self.path.display(),
                digest = %hex::encode(hash),
                "membership file changed"
            );
            forwarded = Some((hash, Instant::now()));
            if tx.send(content).await.is_err() {
                break;
            }
        }
    }
}

/// Same digest as the last forwarded content, inside the debounce window.
fn held_back(forwarded: Option<([u8; 32], Instant)>, hash: [u8; 32], now: Instant) -> bool {
    matches!(forwarded, Some((last, at)) if last == hash && now.duration_since(at) < DEBOUNCE)
}
