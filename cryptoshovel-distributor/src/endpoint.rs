//! The two ends of an encrypting shovel.
//!
//! [`EncryptingEndpoint`] seals outgoing messages with the active key of the
//! distributor's registry (or a pre-shared key). [`DecryptingEndpoint`] takes
//! whatever arrives on the wire: key envelopes go into its registry, message
//! envelopes come back out as plaintext messages.

use std::sync::{Arc, RwLockReadGuard, RwLockWriteGuard};

use chrono::{DateTime, Utc};

use cryptoshovel_envelope::wire::KEY_TAG;
use cryptoshovel_envelope::{
    key_envelope, IdentityError, KeyEnvelopeError, KeyId, KeyRegistry, KeySource, Message,
    RsaIdentity, SymmetricKey,
};

use crate::audit::{AuditAction, AuditEvent, AuditSink};
use crate::distributor::SharedRegistry;
use crate::error::EndpointError;

enum Keys {
    Shared(SymmetricKey),
    Registry(SharedRegistry),
}

fn read(registry: &SharedRegistry) -> RwLockReadGuard<'_, KeyRegistry> {
    registry.read().unwrap_or_else(|e| e.into_inner())
}

fn write(registry: &SharedRegistry) -> RwLockWriteGuard<'_, KeyRegistry> {
    registry.write().unwrap_or_else(|e| e.into_inner())
}

// ---------------------------------------------------------------------------
// Encrypting side
// ---------------------------------------------------------------------------

pub struct EncryptingEndpoint {
    keys: Keys,
}

impl EncryptingEndpoint {
    /// Encrypt with whatever key the registry has active at the time.
    pub fn managed(registry: SharedRegistry) -> Self {
        Self {
            keys: Keys::Registry(registry),
        }
    }

    /// Encrypt every message with one pre-shared key.
    pub fn shared(key: SymmetricKey) -> Self {
        Self {
            keys: Keys::Shared(key),
        }
    }

    pub fn encrypt(&self, mut message: Message) -> Result<Message, EndpointError> {
        match &self.keys {
            Keys::Shared(key) => message.encrypt(KeySource::Bare(key))?,
            Keys::Registry(registry) => {
                let registry = read(registry);
                message.encrypt(KeySource::Registry(&*registry))?
            }
        }
        Ok(message)
    }
}

// ---------------------------------------------------------------------------
// Decrypting side
// ---------------------------------------------------------------------------

/// What [`DecryptingEndpoint::handle`] made of an envelope.
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    /// A key envelope for this endpoint; the key is now in the registry.
    KeyInstalled(KeyId),
    /// A key envelope for another receiver.
    NotForMe,
    /// A decrypted message, routing key and properties restored.
    Message(Message),
}

pub struct DecryptingEndpoint {
    keys: Keys,
    identities: Option<(Arc<RsaIdentity>, Arc<RsaIdentity>)>,
    audit: Arc<dyn AuditSink>,
}

impl DecryptingEndpoint {
    /// Receive keys from `sender` into `registry` and decrypt with them.
    pub fn managed(
        identity: Arc<RsaIdentity>,
        sender: Arc<RsaIdentity>,
        registry: SharedRegistry,
        audit: Arc<dyn AuditSink>,
    ) -> Result<Self, EndpointError> {
        if !identity.has_private_key() {
            return Err(IdentityError::MissingPrivateKey.into());
        }
        Ok(Self {
            keys: Keys::Registry(registry),
            identities: Some((identity, sender)),
            audit,
        })
    }

    pub fn shared(key: SymmetricKey, audit: Arc<dyn AuditSink>) -> Self {
        Self {
            keys: Keys::Shared(key),
            identities: None,
            audit,
        }
    }

    pub fn handle(&self, now: DateTime<Utc>, envelope: Vec<u8>) -> Result<Inbound, EndpointError> {
        match (&self.keys, &self.identities) {
            (Keys::Registry(registry), Some((me, sender))) if envelope.first() == Some(&KEY_TAG) => {
                self.install(now, &envelope, me, sender, registry)
            }
            _ => self.decrypt(now, envelope),
        }
    }

    fn install(
        &self,
        now: DateTime<Utc>,
        envelope: &[u8],
        me: &RsaIdentity,
        sender: &RsaIdentity,
        registry: &SharedRegistry,
    ) -> Result<Inbound, EndpointError> {
        let key = match key_envelope::open(envelope, me, sender, now) {
            Ok(Some(key)) => key,
            Ok(None) => {
                self.audit.record(AuditEvent::new(now, AuditAction::KeyIgnored));
                return Ok(Inbound::NotForMe);
            }
            Err(e) => {
                tracing::warn!(error = %e, "rejected key envelope");
                self.audit.record(
                    AuditEvent::new(now, AuditAction::KeyReceived)
                        .with_detail(e.to_string())
                        .with_failure(),
                );
                return Err(e.into());
            }
        };
        let id = key.id().ok_or(KeyEnvelopeError::IncompleteKey)?;

        let mut registry = write(registry);
        let removed = registry.cleanup(now);
        let known = registry
            .get(&id)
            .is_some_and(|existing| existing.secret() == key.secret());
        if !known {
            registry.add(key)?;
        }
        if removed > 0 || !known {
            registry.persist()?;
        }
        drop(registry);

        tracing::info!(key_id = %id, known, "key received");
        self.audit
            .record(AuditEvent::new(now, AuditAction::KeyReceived).with_key(Some(id)));
        Ok(Inbound::KeyInstalled(id))
    }

    fn decrypt(&self, now: DateTime<Utc>, envelope: Vec<u8>) -> Result<Inbound, EndpointError> {
        let mut message = Message::new(envelope);
        let result = match &self.keys {
            Keys::Shared(key) => message.decrypt(KeySource::Bare(key)),
            Keys::Registry(registry) => message.decrypt(KeySource::Registry(&*read(registry))),
        };
        match result {
            Ok(_) => Ok(Inbound::Message(message)),
            Err(e) => {
                self.audit.record(
                    AuditEvent::new(
                        now,
                        AuditAction::MessageDecryptFailed {
                            reason: e.to_string(),
                        },
                    )
                    .with_failure(),
                );
                Err(e.into())
            }
        }
    }
}
