//! Wire formats
//!
//! Message envelope:
//!   ['M'][key_id 8]   (registry mode only)
//!   || nonce[16] || tag[16] || ciphertext
//!
//! Key envelope:
//!   'K' || recipient_fingerprint[16] || ct_len[2, LE] || rsa_ct[ct_len] || signature
//!
//! Key payload (the RSA plaintext inside a key envelope):
//!   end_date_ms[8, LE f64] || secret[32] || key_id[8]

use crate::error::{CodecError, KeyEnvelopeError};

/// Leading byte of a registry-mode message envelope.
pub const MESSAGE_TAG: u8 = b'M';

/// Leading byte of a key envelope.
pub const KEY_TAG: u8 = b'K';

// ---------------------------------------------------------------------------
// Component sizes
// ---------------------------------------------------------------------------

pub const KEY_ID_BYTES: usize = 8;
pub const KEY_BYTES: usize = 32;
pub const NONCE_BYTES: usize = 16;
pub const AEAD_TAG_BYTES: usize = 16;
pub const FINGERPRINT_BYTES: usize = 16;

/// Little-endian length prefix in front of the hidden metadata.
pub const METADATA_LEN_BYTES: usize = 2;
pub const MAX_METADATA_BYTES: usize = u16::MAX as usize;

/// Bare envelope: nonce + tag, ciphertext may be empty.
pub const BARE_MESSAGE_MIN_BYTES: usize = NONCE_BYTES + AEAD_TAG_BYTES; // 32

/// Managed envelope: tag byte + key id + nonce + tag.
pub const MANAGED_MESSAGE_MIN_BYTES: usize = 1 + KEY_ID_BYTES + BARE_MESSAGE_MIN_BYTES; // 41

/// 'K' + fingerprint + u16 length.
pub const KEY_HEADER_BYTES: usize = 1 + FINGERPRINT_BYTES + 2; // 19

/// end date + secret + id.
pub const KEY_PAYLOAD_BYTES: usize = 8 + KEY_BYTES + KEY_ID_BYTES; // 48

/// End date written for keys that never expire (the largest representable
/// ECMAScript time value, kept for wire compatibility).
pub const NEVER_SENTINEL_MS: f64 = 8.64e15;

// ---------------------------------------------------------------------------
// Message envelope
// ---------------------------------------------------------------------------

/// Borrowed view of a parsed message envelope.
#[derive(Debug, Clone, Copy)]
pub struct MessageComponents<'a> {
    pub key_id: Option<&'a [u8; KEY_ID_BYTES]>,
    pub nonce: &'a [u8; NONCE_BYTES],
    pub tag: &'a [u8; AEAD_TAG_BYTES],
    pub ciphertext: &'a [u8],
}

/// Split a message envelope. `managed` selects registry mode (tag byte + key id).
pub fn decode_message(data: &[u8], managed: bool) -> Result<MessageComponents<'_>, CodecError> {
    let (key_id, body) = if managed {
        match data.first() {
            Some(&MESSAGE_TAG) => {}
            _ => return Err(CodecError::NotAManagedMessage),
        }
        if data.len() < MANAGED_MESSAGE_MIN_BYTES {
            return Err(CodecError::Malformed);
        }
        let id: &[u8; KEY_ID_BYTES] = data[1..1 + KEY_ID_BYTES]
            .try_into()
            .map_err(|_| CodecError::Malformed)?;
        (Some(id), &data[1 + KEY_ID_BYTES..])
    } else {
        (None, data)
    };

    if body.len() < BARE_MESSAGE_MIN_BYTES {
        return Err(CodecError::Malformed);
    }

    let nonce: &[u8; NONCE_BYTES] = body[..NONCE_BYTES]
        .try_into()
        .map_err(|_| CodecError::Malformed)?;
    let tag: &[u8; AEAD_TAG_BYTES] = body[NONCE_BYTES..BARE_MESSAGE_MIN_BYTES]
        .try_into()
        .map_err(|_| CodecError::Malformed)?;

    Ok(MessageComponents {
        key_id,
        nonce,
        tag,
        ciphertext: &body[BARE_MESSAGE_MIN_BYTES..],
    })
}

pub fn encode_message(
    key_id: Option<&[u8; KEY_ID_BYTES]>,
    nonce: &[u8; NONCE_BYTES],
    tag: &[u8; AEAD_TAG_BYTES],
    ciphertext: &[u8],
) -> Vec<u8> {
    let header = if key_id.is_some() { 1 + KEY_ID_BYTES } else { 0 };
    let mut out = Vec::with_capacity(header + BARE_MESSAGE_MIN_BYTES + ciphertext.len());

    if let Some(id) = key_id {
        out.push(MESSAGE_TAG);
        out.extend_from_slice(id);
    }
    out.extend_from_slice(nonce);
    out.extend_from_slice(tag);
    out.extend_from_slice(ciphertext);

    out
}

// ---------------------------------------------------------------------------
// Key envelope
// ---------------------------------------------------------------------------

/// Borrowed view of a parsed key envelope.
#[derive(Debug, Clone, Copy)]
pub struct KeyEnvelopeComponents<'a> {
    pub fingerprint: &'a [u8; FINGERPRINT_BYTES],
    pub ciphertext: &'a [u8],
    pub signature: &'a [u8],
}

pub fn decode_key_envelope(data: &[u8]) -> Result<KeyEnvelopeComponents<'_>, KeyEnvelopeError> {
    match data.first() {
        Some(&KEY_TAG) => {}
        _ => return Err(KeyEnvelopeError::NotAKey),
    }
    if data.len() < KEY_HEADER_BYTES {
        return Err(KeyEnvelopeError::Malformed);
    }

    let fingerprint: &[u8; FINGERPRINT_BYTES] = data[1..1 + FINGERPRINT_BYTES]
        .try_into()
        .map_err(|_| KeyEnvelopeError::Malformed)?;
    let ct_len = u16::from_le_bytes([data[KEY_HEADER_BYTES - 2], data[KEY_HEADER_BYTES - 1]]) as usize;

    let ct_end = KEY_HEADER_BYTES + ct_len;
    // ciphertext and signature are both non-empty
    if ct_len == 0 || data.len() <= ct_end {
        return Err(KeyEnvelopeError::Malformed);
    }

    Ok(KeyEnvelopeComponents {
        fingerprint,
        ciphertext: &data[KEY_HEADER_BYTES..ct_end],
        signature: &data[ct_end..],
    })
}

pub fn encode_key_envelope(
    fingerprint: &[u8; FINGERPRINT_BYTES],
    ciphertext: &[u8],
    signature: &[u8],
) -> Result<Vec<u8>, KeyEnvelopeError> {
    let ct_len = u16::try_from(ciphertext.len()).map_err(|_| KeyEnvelopeError::Malformed)?;

    let mut out = Vec::with_capacity(KEY_HEADER_BYTES + ciphertext.len() + signature.len());
    out.push(KEY_TAG);
    out.extend_from_slice(fingerprint);
    out.extend_from_slice(&ct_len.to_le_bytes());
    out.extend_from_slice(ciphertext);
    out.extend_from_slice(signature);

    Ok(out)
}

// ---------------------------------------------------------------------------
// Inspection (no decryption)
// ---------------------------------------------------------------------------

/// What an envelope looks like from its framing alone.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EnvelopeKind {
    /// Registry-mode message, encrypted under the named key id.
    ManagedMessage { key_id: [u8; KEY_ID_BYTES], ciphertext_len: usize },
    /// Key envelope for the recipient with this fingerprint.
    Key {
        fingerprint: [u8; FINGERPRINT_BYTES],
        ciphertext_len: usize,
        signature_len: usize,
    },
    /// No tag: either a bare (pre-shared key) message or not an envelope at all.
    Unframed { len: usize },
}

pub fn inspect(data: &[u8]) -> EnvelopeKind {
    if let Ok(parts) = decode_key_envelope(data) {
        return EnvelopeKind::Key {
            fingerprint: *parts.fingerprint,
            ciphertext_len: parts.ciphertext.len(),
            signature_len: parts.signature.len(),
        };
    }
    if let Ok(MessageComponents { key_id: Some(id), ciphertext, .. }) = decode_message(data, true) {
        return EnvelopeKind::ManagedMessage {
            key_id: *id,
            ciphertext_len: ciphertext.len(),
        };
    }
    EnvelopeKind::Unframed { len: data.len() }
}
