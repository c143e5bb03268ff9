//! Receivers: a public key, a validity window and a resend flag.

use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use cryptoshovel_envelope::{Fingerprint, RsaIdentity, Validity};

use crate::error::MembershipError;

/// Receivers keyed by fingerprint. Ordered, so fan-out order is deterministic.
pub type ReceiverMap = BTreeMap<Fingerprint, ReceiverDescriptor>;

#[derive(Debug, Clone)]
pub struct ReceiverDescriptor {
    pub id: Fingerprint,
    pub identity: Arc<RsaIdentity>,
    /// `[start, end)`; absent bounds are unbounded.
    pub validity: Validity,
    /// Send the current key again even if this receiver already has it.
    pub resend: bool,
    /// The `key` entry the descriptor was loaded from.
    pub key_reference: String,
}

impl ReceiverDescriptor {
    pub fn new(identity: Arc<RsaIdentity>, key_reference: impl Into<String>) -> Self {
        Self {
            id: identity.fingerprint(),
            identity,
            validity: Validity::ALWAYS,
            resend: false,
            key_reference: key_reference.into(),
        }
    }

    pub fn with_validity(mut self, validity: Validity) -> Self {
        self.validity = validity;
        self
    }

    pub fn with_resend(mut self, resend: bool) -> Self {
        self.resend = resend;
        self
    }

    pub fn is_active_at(&self, at: DateTime<Utc>) -> bool {
        self.validity.contains(at)
    }
}

/// The receivers of `all` whose window contains `at`.
pub fn active_on(all: &ReceiverMap, at: DateTime<Utc>) -> ReceiverMap {
    all.iter()
        .filter(|(_, r)| r.is_active_at(at))
        .map(|(id, r)| (*id, r.clone()))
        .collect()
}

// ---------------------------------------------------------------------------
// Public key resolution
// ---------------------------------------------------------------------------

/// Turns a membership `key` entry into a public identity.
pub trait PublicKeyResolver: Send + Sync {
    fn resolve(&self, reference: &str) -> Result<Arc<RsaIdentity>, MembershipError>;
}

/// PEM files in a folder; `key` entries are file names relative to it
/// (absolute paths are used as given).
#[derive(Debug, Clone)]
pub struct KeyDirectory {
    folder: PathBuf,
}

impl KeyDirectory {
    pub fn new(folder: impl Into<PathBuf>) -> Self {
        Self {
            folder: folder.into(),
        }
    }

    pub fn folder(&self) -> &Path {
        &self.folder
    }
}

impl PublicKeyResolver for KeyDirectory {
    fn resolve(&self, reference: &str) -> Result<Arc<RsaIdentity>, MembershipError> {
        let path = self.folder.join(reference);
        let fail = |reason: String| MembershipError::ReceiverKey {
            key: reference.to_string(),
            reason,
        };
        let pem = std::fs::read_to_string(&path)
            .map_err(|e| fail(format!("{}: {}", path.display(), e)))?;
        RsaIdentity::from_public_pem(&pem)
            .map(|identity| Arc::new(identity.to_public()))
            .map_err(|e| fail(e.to_string()))
    }
}

/// Fixed table of identities, mostly for tests and embedding.
impl PublicKeyResolver for HashMap<String, Arc<RsaIdentity>> {
    fn resolve(&self, reference: &str) -> Result<Arc<RsaIdentity>, MembershipError> {
        self.get(reference)
            .cloned()
            .ok_or_else(|| MembershipError::ReceiverKey {
                key: reference.to_string(),
                reason: "unknown key".into(),
            })
    }
}
