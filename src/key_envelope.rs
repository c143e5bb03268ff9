//! Key distribution envelope: a symmetric key, RSA-encrypted to one receiver
//! and signed by the sender.
//!
//! The signature covers the plaintext payload, not the ciphertext, so one
//! signature serves every receiver of a rollout. [`PreparedKey`] caches it.

use chrono::{DateTime, Utc};
use zeroize::Zeroizing;

use crate::error::KeyEnvelopeError;
use crate::identity::RsaIdentity;
use crate::key::{millis_to_date, KeyId, KeySecret, SymmetricKey, Validity};
use crate::wire::{self, KEY_BYTES, KEY_ID_BYTES, KEY_PAYLOAD_BYTES, NEVER_SENTINEL_MS};

/// A key ready for distribution: payload built and signed once.
pub struct PreparedKey {
    key_id: KeyId,
    payload: Zeroizing<Vec<u8>>,
    signature: Vec<u8>,
}

impl PreparedKey {
    /// Fails with `IncompleteKey` for keys without an id.
    pub fn new(key: &SymmetricKey, sender: &RsaIdentity) -> Result<Self, KeyEnvelopeError> {
        let key_id = key.id().ok_or(KeyEnvelopeError::IncompleteKey)?;
        let payload = encode_payload(key, &key_id);
        let signature = sender.sign(&payload)?;
        Ok(Self {
            key_id,
            payload,
            signature,
        })
    }

    pub fn key_id(&self) -> KeyId {
        self.key_id
    }

    pub fn signature(&self) -> &[u8] {
        &self.signature
    }

    /// Envelope addressed to `recipient`.
    pub fn seal_for(&self, recipient: &RsaIdentity) -> Result<Vec<u8>, KeyEnvelopeError> {
        let ciphertext = recipient.encrypt(&self.payload)?;
        wire::encode_key_envelope(
            recipient.fingerprint().as_bytes(),
            &ciphertext,
            &self.signature,
        )
    }
}

impl std::fmt::Debug for PreparedKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PreparedKey")
            .field("key_id", &self.key_id)
            .field("signature_len", &self.signature.len())
            .finish()
    }
}

/// One-off envelope for a single recipient.
pub fn seal(
    key: &SymmetricKey,
    recipient: &RsaIdentity,
    sender: &RsaIdentity,
) -> Result<Vec<u8>, KeyEnvelopeError> {
    PreparedKey::new(key, sender)?.seal_for(recipient)
}

/// Open a key envelope addressed to `me` and check the sender's signature.
///
/// Returns `Ok(None)` when the envelope is for someone else. The recovered key
/// has no start date and is stamped as created at `received_at`.
pub fn open(
    envelope: &[u8],
    me: &RsaIdentity,
    sender: &RsaIdentity,
    received_at: DateTime<Utc>,
) -> Result<Option<SymmetricKey>, KeyEnvelopeError> {
    let parts = wire::decode_key_envelope(envelope)?;
    if parts.fingerprint != me.fingerprint().as_bytes() {
        return Ok(None);
    }

    let payload = me.decrypt(parts.ciphertext)?;
    if !sender.verify(&payload, parts.signature) {
        return Err(KeyEnvelopeError::SignatureInvalid);
    }

    decode_payload(&payload, received_at).map(Some)
}

// ---------------------------------------------------------------------------
// Payload
// ---------------------------------------------------------------------------

fn encode_payload(key: &SymmetricKey, id: &KeyId) -> Zeroizing<Vec<u8>> {
    let end_ms = key
        .end_date()
        .map_or(NEVER_SENTINEL_MS, |d| d.timestamp_millis() as f64);

    let mut payload = Zeroizing::new(Vec::with_capacity(KEY_PAYLOAD_BYTES));
    payload.extend_from_slice(&end_ms.to_le_bytes());
    payload.extend_from_slice(key.secret().expose());
    payload.extend_from_slice(id.as_bytes());
    payload
}

fn decode_payload(payload: &[u8], received_at: DateTime<Utc>) -> Result<SymmetricKey, KeyEnvelopeError> {
    if payload.len() != KEY_PAYLOAD_BYTES {
        return Err(KeyEnvelopeError::Malformed);
    }
    let (end_raw, rest) = payload.split_at(8);
    let (secret_raw, id_raw) = rest.split_at(KEY_BYTES);

    let end_ms = f64::from_le_bytes(end_raw.try_into().map_err(|_| KeyEnvelopeError::Malformed)?);
    let end = if !end_ms.is_finite() || end_ms >= NEVER_SENTINEL_MS {
        None
    } else {
        Some(millis_to_date(end_ms as i64, "d").map_err(|_| KeyEnvelopeError::Malformed)?)
    };

    let mut secret: [u8; KEY_BYTES] = secret_raw.try_into().map_err(|_| KeyEnvelopeError::Malformed)?;
    let id: [u8; KEY_ID_BYTES] = id_raw.try_into().map_err(|_| KeyEnvelopeError::Malformed)?;

    let key = SymmetricKey::from_secret(KeySecret::from_bytes(secret), received_at)
        .with_id(KeyId::from_bytes(id))
        .with_validity(Validity::new(None, end));
    zeroize::Zeroize::zeroize(&mut secret);
    Ok(key)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn payload_layout() {
        let end = Utc.timestamp_millis_opt(1524043365337).unwrap();
        let key = SymmetricKey::from_secret(KeySecret::from_bytes([0xAB; KEY_BYTES]), end)
            .with_validity(Validity::new(None, Some(end)));
        let id = KeyId::from_bytes([1, 2, 3, 4, 5, 6, 7, 8]);

        let payload = encode_payload(&key, &id);
        assert_eq!(payload.len(), KEY_PAYLOAD_BYTES);
        assert_eq!(&payload[..8], &1524043365337f64.to_le_bytes());
        assert_eq!(&payload[8..40], &[0xAB; KEY_BYTES]);
        assert_eq!(&payload[40..], id.as_bytes());

        let decoded = decode_payload(&payload, end).unwrap();
        assert_eq!(decoded.id(), Some(id));
        assert_eq!(decoded.end_date(), Some(end));
        assert_eq!(decoded.start_date(), None);
    }

    #[test]
    fn never_ending_key_uses_sentinel() {
        let now = Utc::now();
        let key = SymmetricKey::generate(now);
        let id = KeyId::generate();

        let payload = encode_payload(&key, &id);
        assert_eq!(&payload[..8], &NEVER_SENTINEL_MS.to_le_bytes());
        assert_eq!(decode_payload(&payload, now).unwrap().end_date(), None);
    }

    #[test]
    fn short_payload_is_malformed() {
        assert_eq!(
            decode_payload(&[0u8; KEY_PAYLOAD_BYTES - 1], Utc::now()).unwrap_err(),
            KeyEnvelopeError::Malformed
        );
    }
}
