//! Message codec: content plus hidden metadata under a symmetric key.
//!
//! Plaintext layout before encryption:
//!   metadata_len[2, LE] || metadata (compact JSON) || content

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use zeroize::Zeroizing;

use crate::error::CodecError;
use crate::key::{KeyId, SymmetricKey};
use crate::registry::KeyRegistry;
use crate::{aead, wire};

/// Where the codec gets its key from, resolved once per call.
#[derive(Debug, Clone, Copy)]
pub enum KeySource<'a> {
    /// Pre-shared key: bare envelope without tag or key id.
    Bare(&'a SymmetricKey),
    /// Registry: encrypt under the active key, decrypt by the embedded id.
    Registry(&'a KeyRegistry),
}

/// Side-channel fields hidden inside the ciphertext.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MessageMetadata {
    #[serde(rename = "r", skip_serializing_if = "Option::is_none", default)]
    pub routing_key: Option<String>,
    #[serde(rename = "p", skip_serializing_if = "Map::is_empty", default)]
    pub properties: Map<String, Value>,
}

impl MessageMetadata {
    pub fn with_routing_key(routing_key: impl Into<String>) -> Self {
        Self {
            routing_key: Some(routing_key.into()),
            properties: Map::new(),
        }
    }
}

/// Encrypt `content` and `metadata` into a message envelope.
pub fn seal(
    content: &[u8],
    metadata: &MessageMetadata,
    source: KeySource<'_>,
) -> Result<Vec<u8>, CodecError> {
    let (key, key_id) = match source {
        KeySource::Bare(key) => (key, None),
        KeySource::Registry(registry) => {
            let key = registry.active().ok_or(CodecError::NoActiveKey)?;
            let id = key.id().ok_or(CodecError::NoActiveKey)?;
            (key, Some(id))
        }
    };

    let meta = serde_json::to_vec(metadata).map_err(|e| CodecError::Metadata(e.to_string()))?;
    let meta_len = u16::try_from(meta.len()).map_err(|_| CodecError::MetadataTooLarge(meta.len()))?;

    let mut buffer = Zeroizing::new(Vec::with_capacity(
        wire::METADATA_LEN_BYTES + meta.len() + content.len(),
    ));
    buffer.extend_from_slice(&meta_len.to_le_bytes());
    buffer.extend_from_slice(&meta);
    buffer.extend_from_slice(content);

    let nonce = aead::nonce()?;
    let tag = aead::seal_in_place(key.secret().expose(), &nonce, &mut buffer)?;

    Ok(wire::encode_message(
        key_id.as_ref().map(KeyId::as_bytes),
        &nonce,
        &tag,
        &buffer,
    ))
}

/// Decrypt a message envelope into its content and metadata.
pub fn open(
    envelope: &[u8],
    source: KeySource<'_>,
) -> Result<(Vec<u8>, MessageMetadata), CodecError> {
    let (parts, key) = match source {
        KeySource::Bare(key) => (wire::decode_message(envelope, false)?, key),
        KeySource::Registry(registry) => {
            let parts = wire::decode_message(envelope, true)?;
            let id = parts
                .key_id
                .map(|raw| KeyId::from_bytes(*raw))
                .ok_or(CodecError::Malformed)?;
            let key = registry.get(&id).ok_or(CodecError::UnknownKeyId(id))?;
            (parts, key)
        }
    };

    let mut buffer = Zeroizing::new(parts.ciphertext.to_vec());
    aead::open_in_place(key.secret().expose(), parts.nonce, parts.tag, &mut buffer)?;

    split_plaintext(&buffer)
}

fn split_plaintext(plaintext: &[u8]) -> Result<(Vec<u8>, MessageMetadata), CodecError> {
    if plaintext.len() < wire::METADATA_LEN_BYTES {
        return Err(CodecError::Malformed);
    }
    let meta_len = u16::from_le_bytes([plaintext[0], plaintext[1]]) as usize;
    let meta_end = wire::METADATA_LEN_BYTES + meta_len;
    if plaintext.len() < meta_end {
        return Err(CodecError::Malformed);
    }

    let metadata = if meta_len == 0 {
        MessageMetadata::default()
    } else {
        serde_json::from_slice(&plaintext[wire::METADATA_LEN_BYTES..meta_end])
            .map_err(|e| CodecError::Metadata(e.to_string()))?
    };

    Ok((plaintext[meta_end..].to_vec(), metadata))
}

// ---------------------------------------------------------------------------
// Message object
// ---------------------------------------------------------------------------

/// A queue message whose routing key and properties travel inside the
/// ciphertext while it is encrypted.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Message {
    pub content: Vec<u8>,
    pub routing_key: Option<String>,
    pub properties: Map<String, Value>,
}

impl Message {
    pub fn new(content: impl Into<Vec<u8>>) -> Self {
        Self {
            content: content.into(),
            ..Self::default()
        }
    }

    pub fn with_routing_key(mut self, routing_key: impl Into<String>) -> Self {
        self.routing_key = Some(routing_key.into());
        self
    }

    pub fn with_property(mut self, name: impl Into<String>, value: Value) -> Self {
        self.properties.insert(name.into(), value);
        self
    }

    /// Replace the content with its envelope. Routing key and properties are
    /// cleared; only decryption recovers them. On error the message is unchanged.
    pub fn encrypt(&mut self, source: KeySource<'_>) -> Result<(), CodecError> {
        let metadata = MessageMetadata {
            routing_key: self.routing_key.clone(),
            properties: self.properties.clone(),
        };
        self.content = seal(&self.content, &metadata, source)?;
        self.routing_key = None;
        self.properties.clear();
        Ok(())
    }

    /// Replace the envelope with the original content and restore the hidden
    /// fields. Returns the recovered routing key. On error the message is unchanged.
    pub fn decrypt(&mut self, source: KeySource<'_>) -> Result<Option<String>, CodecError> {
        let (content, metadata) = open(&self.content, source)?;
        self.content = content;
        self.routing_key = metadata.routing_key;
        self.properties = metadata.properties;
        Ok(self.routing_key.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};

    #[test]
    fn metadata_serializes_compactly() {
        let json = serde_json::to_string(&MessageMetadata::with_routing_key("a.b")).unwrap();
        assert_eq!(json, r#"{"r":"a.b"}"#);
        assert_eq!(serde_json::to_string(&MessageMetadata::default()).unwrap(), "{}");
    }

    #[test]
    fn oversized_metadata_is_rejected() {
        let key = SymmetricKey::generate(Utc::now());
        let metadata = MessageMetadata::with_routing_key("x".repeat(wire::MAX_METADATA_BYTES));
        let err = seal(b"body", &metadata, KeySource::Bare(&key)).unwrap_err();
        assert!(matches!(err, CodecError::MetadataTooLarge(n) if n > wire::MAX_METADATA_BYTES));
    }

    #[test]
    fn registry_without_active_key_cannot_encrypt() {
        let registry = KeyRegistry::new();
        let err = seal(b"body", &MessageMetadata::default(), KeySource::Registry(&registry))
            .unwrap_err();
        assert_eq!(err, CodecError::NoActiveKey);
    }

    #[test]
    fn message_hides_and_restores_routing() {
        let now = Utc::now();
        let mut registry = KeyRegistry::new();
        registry
            .add(SymmetricKey::generate(now - Duration::seconds(1)))
            .unwrap();
        registry.select_active(now);

        let mut msg = Message::new(&b"payload"[..])
            .with_routing_key("orders.eu")
            .with_property("priority", Value::from(3));
        msg.encrypt(KeySource::Registry(&registry)).unwrap();

        assert_eq!(msg.content[0], wire::MESSAGE_TAG);
        assert!(msg.routing_key.is_none());
        assert!(msg.properties.is_empty());

        let routing = msg.decrypt(KeySource::Registry(&registry)).unwrap();
        assert_eq!(routing.as_deref(), Some("orders.eu"));
        assert_eq!(msg.content, b"payload");
        assert_eq!(msg.properties.get("priority"), Some(&Value::from(3)));
    }

    #[test]
    fn failed_decrypt_leaves_message_untouched() {
        let key = SymmetricKey::generate(Utc::now());
        let other = SymmetricKey::generate(Utc::now());

        let mut msg = Message::new(&b"payload"[..]);
        msg.encrypt(KeySource::Bare(&key)).unwrap();
        let sealed = msg.content.clone();

        assert_eq!(
            msg.decrypt(KeySource::Bare(&other)).unwrap_err(),
            CodecError::Authentication
        );
        assert_eq!(msg.content, sealed);
    }

    #[test]
    fn truncated_metadata_prefix_is_malformed() {
        assert_eq!(split_plaintext(&[5, 0, b'{']).unwrap_err(), CodecError::Malformed);
        assert_eq!(split_plaintext(&[1]).unwrap_err(), CodecError::Malformed);
    }
}
