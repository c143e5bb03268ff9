//! RSA identities: fingerprint, sign/verify and single-block encrypt/decrypt.
//!
//! Key transport uses RSA-OAEP with SHA-256, signatures use RSASSA-PKCS1-v1_5
//! with SHA-256. The fingerprint is the first 16 bytes of the SHA-256 digest of
//! the public key's PKCS#1 DER encoding.

use core::fmt;

use rand_core::OsRng;
use rsa::pkcs1::{DecodeRsaPrivateKey, DecodeRsaPublicKey, EncodeRsaPublicKey};
use rsa::pkcs1v15::{Signature, SigningKey, VerifyingKey};
use rsa::pkcs8::{DecodePrivateKey, DecodePublicKey, EncodePrivateKey, EncodePublicKey, LineEnding};
use rsa::signature::{SignatureEncoding, Signer, Verifier};
use rsa::traits::PublicKeyParts;
use rsa::{Oaep, RsaPrivateKey, RsaPublicKey};
use sha2::{Digest, Sha256};
use zeroize::Zeroizing;

use crate::error::IdentityError;
use crate::wire::FINGERPRINT_BYTES;

/// OAEP overhead for SHA-256: two digests plus two bytes.
const OAEP_SHA256_OVERHEAD: usize = 2 * 32 + 2;

// ---------------------------------------------------------------------------
// Fingerprint
// ---------------------------------------------------------------------------

/// Stable 16-byte identifier of an RSA public key.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Fingerprint([u8; FINGERPRINT_BYTES]);

impl Fingerprint {
    pub fn from_bytes(bytes: [u8; FINGERPRINT_BYTES]) -> Self {
        Self(bytes)
    }

    pub fn of(public: &RsaPublicKey) -> Result<Self, IdentityError> {
        let der = public
            .to_pkcs1_der()
            .map_err(|e| IdentityError::KeyMaterial(e.to_string()))?;
        let digest = Sha256::digest(der.as_bytes());
        let mut out = [0u8; FINGERPRINT_BYTES];
        out.copy_from_slice(&digest[..FINGERPRINT_BYTES]);
        Ok(Self(out))
    }

    pub fn as_bytes(&self) -> &[u8; FINGERPRINT_BYTES] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl fmt::Debug for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Fingerprint({})", self.to_hex())
    }
}

// ---------------------------------------------------------------------------
// Identity
// ---------------------------------------------------------------------------

/// An RSA public key with an optional private half.
///
/// Immutable after construction; share it behind an `Arc`.
#[derive(Clone)]
pub struct RsaIdentity {
    public: RsaPublicKey,
    private: Option<RsaPrivateKey>,
    fingerprint: Fingerprint,
}

impl RsaIdentity {
    pub fn from_public_key(public: RsaPublicKey) -> Result<Self, IdentityError> {
        let fingerprint = Fingerprint::of(&public)?;
        Ok(Self {
            public,
            private: None,
            fingerprint,
        })
    }

    pub fn from_private_key(private: RsaPrivateKey) -> Result<Self, IdentityError> {
        let public = private.to_public_key();
        let fingerprint = Fingerprint::of(&public)?;
        Ok(Self {
            public,
            private: Some(private),
            fingerprint,
        })
    }

    /// Generate a fresh key pair.
    pub fn generate(bits: usize) -> Result<Self, IdentityError> {
        let private = RsaPrivateKey::new(&mut OsRng, bits)
            .map_err(|e| IdentityError::KeyMaterial(e.to_string()))?;
        Self::from_private_key(private)
    }

    /// Parse a public key PEM (SPKI `PUBLIC KEY` or PKCS#1 `RSA PUBLIC KEY`).
    pub fn from_public_pem(pem: &str) -> Result<Self, IdentityError> {
        let public = RsaPublicKey::from_public_key_pem(pem.trim())
            .or_else(|_| RsaPublicKey::from_pkcs1_pem(pem.trim()))
            .map_err(|e| IdentityError::InvalidPem(e.to_string()))?;
        Self::from_public_key(public)
    }

    /// Parse a private key PEM (PKCS#8 `PRIVATE KEY` or PKCS#1 `RSA PRIVATE KEY`).
    pub fn from_private_pem(pem: &str) -> Result<Self, IdentityError> {
        let private = RsaPrivateKey::from_pkcs8_pem(pem.trim())
            .or_else(|_| RsaPrivateKey::from_pkcs1_pem(pem.trim()))
            .map_err(|e| IdentityError::InvalidPem(e.to_string()))?;
        Self::from_private_key(private)
    }

    pub fn fingerprint(&self) -> Fingerprint {
        self.fingerprint
    }

    pub fn has_private_key(&self) -> bool {
        self.private.is_some()
    }

    /// The same identity without its private half.
    pub fn to_public(&self) -> Self {
        Self {
            public: self.public.clone(),
            private: None,
            fingerprint: self.fingerprint,
        }
    }

    /// Modulus size in bytes; also the signature length.
    pub fn modulus_bytes(&self) -> usize {
        self.public.size()
    }

    /// Largest plaintext `encrypt` accepts.
    pub fn max_plaintext_bytes(&self) -> usize {
        self.modulus_bytes().saturating_sub(OAEP_SHA256_OVERHEAD)
    }

    pub fn public_pem(&self) -> Result<String, IdentityError> {
        self.public
            .to_public_key_pem(LineEnding::LF)
            .map_err(|e| IdentityError::KeyMaterial(e.to_string()))
    }

    pub fn private_pem(&self) -> Result<Zeroizing<String>, IdentityError> {
        self.private_key()?
            .to_pkcs8_pem(LineEnding::LF)
            .map_err(|e| IdentityError::KeyMaterial(e.to_string()))
    }

    // -----------------------------------------------------------------------
    // Signatures
    // -----------------------------------------------------------------------

    pub fn sign(&self, message: &[u8]) -> Result<Vec<u8>, IdentityError> {
        let signing_key = SigningKey::<Sha256>::new(self.private_key()?.clone());
        let signature = signing_key
            .try_sign(message)
            .map_err(|e| IdentityError::Rsa(e.to_string()))?;
        Ok(signature.to_vec())
    }

    pub fn verify(&self, message: &[u8], signature: &[u8]) -> bool {
        let Ok(signature) = Signature::try_from(signature) else {
            return false;
        };
        VerifyingKey::<Sha256>::new(self.public.clone())
            .verify(message, &signature)
            .is_ok()
    }

    // -----------------------------------------------------------------------
    // Key transport
    // -----------------------------------------------------------------------

    /// Encrypt one RSA block to this identity. Oversized payloads are rejected.
    pub fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>, IdentityError> {
        let max = self.max_plaintext_bytes();
        if plaintext.len() > max {
            return Err(IdentityError::PayloadTooLarge {
                len: plaintext.len(),
                max,
            });
        }
        self.public
            .encrypt(&mut OsRng, Oaep::new::<Sha256>(), plaintext)
            .map_err(|e| IdentityError::Rsa(e.to_string()))
    }

    pub fn decrypt(&self, ciphertext: &[u8]) -> Result<Zeroizing<Vec<u8>>, IdentityError> {
        self.private_key()?
            .decrypt(Oaep::new::<Sha256>(), ciphertext)
            .map(Zeroizing::new)
            .map_err(|e| IdentityError::Rsa(e.to_string()))
    }

    fn private_key(&self) -> Result<&RsaPrivateKey, IdentityError> {
        self.private.as_ref().ok_or(IdentityError::MissingPrivateKey)
    }
}

impl fmt::Debug for RsaIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RsaIdentity")
            .field("fingerprint", &self.fingerprint)
            .field("private", &self.private.is_some())
            .finish()
    }
}
