//! AEAD: AES-256-GCM with a 16-byte nonce and a detached 16-byte tag.

use aes_gcm::{
    aead::{consts::U16, generic_array::GenericArray, AeadInPlace, KeyInit},
    aes::Aes256,
    AesGcm,
};
use getrandom::getrandom;

use crate::error::CodecError;
use crate::wire::{AEAD_TAG_BYTES, KEY_BYTES, NONCE_BYTES};

/// AES-256-GCM instantiated with the 128-bit nonce the envelope carries.
type Aes256Gcm16 = AesGcm<Aes256, U16>;

/// Generate a random 16-byte nonce. Used during encryption only.
pub fn nonce() -> Result<[u8; NONCE_BYTES], CodecError> {
    let mut n = [0u8; NONCE_BYTES];
    getrandom(&mut n).map_err(|_| CodecError::Randomness)?;
    Ok(n)
}

/// Encrypt `buffer` in place and return the authentication tag.
pub fn seal_in_place(
    key: &[u8; KEY_BYTES],
    nonce: &[u8; NONCE_BYTES],
    buffer: &mut [u8],
) -> Result<[u8; AEAD_TAG_BYTES], CodecError> {
    let cipher = Aes256Gcm16::new_from_slice(key).map_err(|_| CodecError::Malformed)?;
    let tag = cipher
        .encrypt_in_place_detached(GenericArray::from_slice(nonce), b"", buffer)
        .map_err(|_| CodecError::Malformed)?;

    let mut out = [0u8; AEAD_TAG_BYTES];
    out.copy_from_slice(&tag);
    Ok(out)
}

/// Decrypt `buffer` in place. The buffer is left unspecified on failure and
/// must be discarded by the caller.
pub fn open_in_place(
    key: &[u8; KEY_BYTES],
    nonce: &[u8; NONCE_BYTES],
    tag: &[u8; AEAD_TAG_BYTES],
    buffer: &mut [u8],
) -> Result<(), CodecError> {
    let cipher = Aes256Gcm16::new_from_slice(key).map_err(|_| CodecError::Authentication)?;
    cipher
        .decrypt_in_place_detached(
            GenericArray::from_slice(nonce),
            b"",
            buffer,
            GenericArray::from_slice(tag),
        )
        .map_err(|_| CodecError::Authentication)
}
