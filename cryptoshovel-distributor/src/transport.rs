//! Transports: where key envelopes go once the distributor has sealed them.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::Utc;
use tokio::sync::mpsc;

use cryptoshovel_envelope::Fingerprint;

use crate::error::TransportError;

const ENVELOPE_EXTENSION: &str = "key";

// ---------------------------------------------------------------------------
// Transport trait
// ---------------------------------------------------------------------------

/// Fire-and-forget delivery of a key envelope to one receiver.
///
/// The service calls `deliver` on the blocking pool, one envelope at a time
/// and in send order. Failures are reported, never retried.
pub trait KeyTransport: Send + Sync {
    fn deliver(&self, receiver: &Fingerprint, envelope: &[u8]) -> Result<(), TransportError>;
}

/// One envelope handed to a [`ChannelTransport`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub receiver: Fingerprint,
    pub envelope: Vec<u8>,
}

// ---------------------------------------------------------------------------
// In-process channel
// ---------------------------------------------------------------------------

/// Pushes envelopes into an unbounded tokio channel (embedding and tests).
#[derive(Debug, Clone)]
pub struct ChannelTransport {
    tx: mpsc::UnboundedSender<Delivery>,
}

impl ChannelTransport {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Delivery>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl KeyTransport for ChannelTransport {
    fn deliver(&self, receiver: &Fingerprint, envelope: &[u8]) -> Result<(), TransportError> {
        self.tx
            .send(Delivery {
                receiver: *receiver,
                envelope: envelope.to_vec(),
            })
            .map_err(|_| TransportError::Closed)
    }
}

// ---------------------------------------------------------------------------
// File-drop outbox
// ---------------------------------------------------------------------------

/// Drops each envelope as a file into `<outbox>/<fingerprint hex>/`.
///
/// Files are written under a temporary name and renamed into place, so a
/// receiver polling its directory never sees a partial envelope.
pub struct OutboxTransport {
    outbox: PathBuf,
    sequence: AtomicU64,
}

impl OutboxTransport {
    pub fn new(outbox: impl Into<PathBuf>) -> Self {
        Self {
            outbox: outbox.into(),
            sequence: AtomicU64::new(0),
        }
    }

    pub fn outbox(&self) -> &Path {
        &self.outbox
    }

    /// The directory envelopes for `receiver` are dropped into.
    pub fn mailbox(&self, receiver: &Fingerprint) -> PathBuf {
        self.outbox.join(receiver.to_hex())
    }
}

impl KeyTransport for OutboxTransport {
    fn deliver(&self, receiver: &Fingerprint, envelope: &[u8]) -> Result<(), TransportError> {
        let dir = self.mailbox(receiver);
        fs::create_dir_all(&dir).map_err(|e| TransportError::Io(e.to_string()))?;

        let name = format!(
            "{:016}-{:06}",
            Utc::now().timestamp_millis(),
            self.sequence.fetch_add(1, Ordering::Relaxed)
        );
        let tmp = dir.join(format!("{}.tmp", name));
        let target = dir.join(format!("{}.{}", name, ENVELOPE_EXTENSION));

        fs::write(&tmp, envelope).map_err(|e| TransportError::Io(e.to_string()))?;
        fs::rename(&tmp, &target).map_err(|e| TransportError::Io(e.to_string()))?;
        tracing::debug!(path = %target.display(), bytes = envelope.len(), "envelope dropped");
        Ok(())
    }
}

/// Read and remove every complete envelope in `inbox`, oldest first.
pub fn drain_inbox(inbox: &Path) -> Result<Vec<Vec<u8>>, TransportError> {
    let entries = match fs::read_dir(inbox) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(TransportError::Io(e.to_string())),
    };

    let mut paths: Vec<PathBuf> = entries
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|path| path.extension().is_some_and(|ext| ext == ENVELOPE_EXTENSION))
        .collect();
    paths.sort();

    let mut envelopes = Vec::with_capacity(paths.len());
    for path in paths {
        let data = fs::read(&path).map_err(|e| TransportError::Io(e.to_string()))?;
        fs::remove_file(&path).map_err(|e| TransportError::Io(e.to_string()))?;
        envelopes.push(data);
    }
    Ok(envelopes)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fingerprint(byte: u8) -> Fingerprint {
        Fingerprint::from_bytes([byte; 16])
    }

    #[test]
    fn channel_transport_forwards_envelopes() {
        let (transport, mut rx) = ChannelTransport::new();
        transport.deliver(&fingerprint(1), b"envelope").unwrap();
        let delivery = rx.try_recv().unwrap();
        assert_eq!(delivery.receiver, fingerprint(1));
        assert_eq!(delivery.envelope, b"envelope");
    }

    #[test]
    fn channel_transport_reports_closed_receiver() {
        let (transport, rx) = ChannelTransport::new();
        drop(rx);
        assert_eq!(
            transport.deliver(&fingerprint(1), b"x"),
            Err(TransportError::Closed)
        );
    }

    #[test]
    fn outbox_drops_per_receiver_and_inbox_drains_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let transport = OutboxTransport::new(dir.path());
        transport.deliver(&fingerprint(1), b"first").unwrap();
        transport.deliver(&fingerprint(2), b"other").unwrap();
        transport.deliver(&fingerprint(1), b"second").unwrap();

        let mailbox = transport.mailbox(&fingerprint(1));
        assert_eq!(
            drain_inbox(&mailbox).unwrap(),
            vec![b"first".to_vec(), b"second".to_vec()]
        );
        assert!(drain_inbox(&mailbox).unwrap().is_empty());
        assert_eq!(drain_inbox(&transport.mailbox(&fingerprint(2))).unwrap().len(), 1);
    }

    #[test]
    fn inbox_ignores_partial_files() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("0001.tmp"), b"partial").unwrap();
        fs::write(dir.path().join("0002.key"), b"done").unwrap();
        assert_eq!(drain_inbox(dir.path()).unwrap(), vec![b"done".to_vec()]);
        assert!(dir.path().join("0001.tmp").exists());
    }

    #[test]
    fn missing_inbox_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        assert!(drain_inbox(&dir.path().join("absent")).unwrap().is_empty());
    }
}
