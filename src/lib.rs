//! # cryptoshovel envelope
//!
//! Authenticated envelopes for end-to-end encrypted message-queue shovels,
//! plus the RSA-protected envelope used to distribute rotating keys.
//!
//! ## Quick Start
//!
//! ```rust
//! use chrono::Utc;
//! use cryptoshovel_envelope::{KeyRegistry, KeySource, Message, SymmetricKey};
//!
//! let now = Utc::now();
//! let mut registry = KeyRegistry::new();
//! registry.add(SymmetricKey::generate(now)).unwrap();
//! registry.select_active(now);
//!
//! let mut msg = Message::new(b"secret".to_vec()).with_routing_key("orders");
//! msg.encrypt(KeySource::Registry(&registry)).unwrap();
//! assert!(msg.routing_key.is_none());
//!
//! let routing = msg.decrypt(KeySource::Registry(&registry)).unwrap();
//! assert_eq!(routing.as_deref(), Some("orders"));
//! assert_eq!(msg.content, b"secret");
//! ```
//!
//! ## Security Properties
//!
//! - **AES-256-GCM**: 16-byte random nonce, 16-byte tag, metadata hidden inside
//! - **Tamper detection**: Any modified byte fails authentication
//! - **Signed key transport**: RSA-OAEP to the receiver, PKCS#1 v1.5 signature by the sender
//! - **Zeroized secrets**: Key material is wiped on drop
//!
//! ## What's NOT Provided
//!
//! - Certificate validation (receivers are identified by key fingerprint only)
//! - Key revocation messages
//! - Transport or queue bindings

#![deny(unsafe_code)]

// ---------------------------------------------------------------------------
// Internal modules (not part of public API)
// ---------------------------------------------------------------------------

mod aead;
mod error;

// Wire module is public for the CLI inspect command and the fuzz targets
// but should not be considered stable API
#[doc(hidden)]
pub mod wire;

// ---------------------------------------------------------------------------
// Public interface
// ---------------------------------------------------------------------------

pub mod identity;
pub mod key;
pub mod key_envelope;
pub mod message;
pub mod registry;

pub use error::{CodecError, IdentityError, KeyEnvelopeError, KeyFormatError, RegistryError};
pub use identity::{Fingerprint, RsaIdentity};
pub use key::{KeyId, KeySecret, SymmetricKey, Validity};
pub use key_envelope::PreparedKey;
pub use message::{KeySource, Message, MessageMetadata};
pub use registry::KeyRegistry;
pub use wire::{inspect, EnvelopeKind};

/// Crate version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    // === Bare (pre-shared key) mode ===

    #[test]
    fn bare_envelope_has_no_header() {
        let key = SymmetricKey::generate(Utc::now());
        let sealed = message::seal(b"hello", &MessageMetadata::default(), KeySource::Bare(&key))
            .unwrap();
        // nonce + tag + 2 byte length + "{}" + content
        assert_eq!(sealed.len(), 32 + 2 + 2 + 5);
        assert_eq!(inspect(&sealed), EnvelopeKind::Unframed { len: sealed.len() });

        let (content, meta) = message::open(&sealed, KeySource::Bare(&key)).unwrap();
        assert_eq!(content, b"hello");
        assert_eq!(meta, MessageMetadata::default());
    }

    // === Registry mode ===

    #[test]
    fn managed_envelope_carries_key_id() {
        let now = Utc::now();
        let mut registry = KeyRegistry::new();
        let id = registry.add(SymmetricKey::generate(now)).unwrap();
        registry.select_active(now);

        let sealed =
            message::seal(b"x", &MessageMetadata::default(), KeySource::Registry(&registry))
                .unwrap();
        assert_eq!(sealed[0], wire::MESSAGE_TAG);
        assert_eq!(&sealed[1..9], id.as_bytes());
        assert!(matches!(
            inspect(&sealed),
            EnvelopeKind::ManagedMessage { key_id, .. } if key_id == *id.as_bytes()
        ));
    }

    #[test]
    fn unknown_key_id_is_reported() {
        let now = Utc::now();
        let mut sender = KeyRegistry::new();
        let id = sender.add(SymmetricKey::generate(now)).unwrap();
        sender.select_active(now);
        let sealed =
            message::seal(b"x", &MessageMetadata::default(), KeySource::Registry(&sender))
                .unwrap();

        let receiver = KeyRegistry::new();
        assert_eq!(
            message::open(&sealed, KeySource::Registry(&receiver)).unwrap_err(),
            CodecError::UnknownKeyId(id)
        );
    }

    #[test]
    fn registry_rejects_untagged_envelope() {
        let registry = KeyRegistry::new();
        let bogus = [0u8; 64];
        assert_eq!(
            message::open(&bogus, KeySource::Registry(&registry)).unwrap_err(),
            CodecError::NotAManagedMessage
        );
    }

    #[test]
    fn short_managed_envelope_is_malformed() {
        let registry = KeyRegistry::new();
        let mut short = vec![wire::MESSAGE_TAG];
        short.extend_from_slice(&[0u8; wire::MANAGED_MESSAGE_MIN_BYTES - 2]);
        assert_eq!(
            message::open(&short, KeySource::Registry(&registry)).unwrap_err(),
            CodecError::Malformed
        );
    }

    #[test]
    fn version_is_set() {
        assert!(!VERSION.is_empty());
    }
}
