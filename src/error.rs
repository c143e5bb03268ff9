//! Error types for the envelope codecs, identities and the key registry.
//!
//! Decrypt-side errors never carry plaintext or key material.

use crate::key::KeyId;
use std::fmt;

// ---------------------------------------------------------------------------
// Identity errors
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IdentityError {
    /// The operation needs the private half of the key pair.
    MissingPrivateKey,
    /// Payload does not fit into a single RSA block.
    PayloadTooLarge { len: usize, max: usize },
    /// PEM could not be parsed as an RSA key.
    InvalidPem(String),
    /// Key generation or serialization failed.
    KeyMaterial(String),
    /// RSA encryption or decryption failed.
    Rsa(String),
}

impl fmt::Display for IdentityError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MissingPrivateKey => write!(f, "identity has no private key"),
            Self::PayloadTooLarge { len, max } => {
                write!(f, "payload of {} bytes exceeds the {} byte rsa block limit", len, max)
            }
            Self::InvalidPem(msg) => write!(f, "invalid rsa pem: {}", msg),
            Self::KeyMaterial(msg) => write!(f, "rsa key material: {}", msg),
            Self::Rsa(msg) => write!(f, "rsa operation failed: {}", msg),
        }
    }
}

impl std::error::Error for IdentityError {}

// ---------------------------------------------------------------------------
// Symmetric key export form
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeyFormatError {
    Json(String),
    Base64 { field: &'static str },
    Length { field: &'static str, expected: usize, actual: usize },
    Timestamp { field: &'static str, value: i64 },
}

impl fmt::Display for KeyFormatError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Json(msg) => write!(f, "invalid key export: {}", msg),
            Self::Base64 { field } => write!(f, "invalid base64 in key field '{}'", field),
            Self::Length { field, expected, actual } => write!(
                f,
                "key field '{}' must be {} bytes, got {}",
                field, expected, actual
            ),
            Self::Timestamp { field, value } => {
                write!(f, "key field '{}' holds an out of range timestamp {}", field, value)
            }
        }
    }
}

impl std::error::Error for KeyFormatError {}

// ---------------------------------------------------------------------------
// Message codec
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    /// The registry has no active key to encrypt with.
    NoActiveKey,
    /// Serialized metadata does not fit the 2-byte length prefix.
    MetadataTooLarge(usize),
    /// Managed envelopes must start with the 'M' tag.
    NotAManagedMessage,
    /// The envelope names a key the registry does not hold.
    UnknownKeyId(KeyId),
    /// The envelope is too short or its inner framing is inconsistent.
    Malformed,
    /// Authentication tag mismatch: the envelope was tampered with or the key is wrong.
    Authentication,
    /// Metadata could not be serialized or deserialized.
    Metadata(String),
    /// The OS random source failed.
    Randomness,
}

impl fmt::Display for CodecError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NoActiveKey => write!(f, "no active key in registry"),
            Self::MetadataTooLarge(len) => {
                write!(f, "metadata of {} bytes exceeds the 65535 byte limit", len)
            }
            Self::NotAManagedMessage => write!(f, "not a managed message envelope"),
            Self::UnknownKeyId(id) => write!(f, "unknown key id: {}", id),
            Self::Malformed => write!(f, "malformed message envelope"),
            Self::Authentication => write!(f, "message authentication failed"),
            Self::Metadata(msg) => write!(f, "message metadata: {}", msg),
            Self::Randomness => write!(f, "random source unavailable"),
        }
    }
}

impl std::error::Error for CodecError {}

// ---------------------------------------------------------------------------
// Key distribution envelope
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeyEnvelopeError {
    /// Only keys with an id can be distributed.
    IncompleteKey,
    /// Key envelopes must start with the 'K' tag.
    NotAKey,
    /// The envelope is truncated or its length field is inconsistent.
    Malformed,
    /// The sender signature does not match the decrypted payload.
    SignatureInvalid,
    /// The RSA layer rejected the operation.
    Identity(IdentityError),
}

impl fmt::Display for KeyEnvelopeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::IncompleteKey => write!(f, "key has no id and cannot be distributed"),
            Self::NotAKey => write!(f, "not a key envelope"),
            Self::Malformed => write!(f, "malformed key envelope"),
            Self::SignatureInvalid => write!(f, "key envelope signature invalid"),
            Self::Identity(e) => write!(f, "key envelope: {}", e),
        }
    }
}

impl std::error::Error for KeyEnvelopeError {}

impl From<IdentityError> for KeyEnvelopeError {
    fn from(e: IdentityError) -> Self {
        Self::Identity(e)
    }
}

// ---------------------------------------------------------------------------
// Key registry
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    /// Lookup without an id.
    EmptyLookup,
    /// `set_active` was given a key that is not stored under its id.
    KeyNotInRegistry(Option<KeyId>),
    /// A different key is already stored under this id.
    DuplicateKeyId(KeyId),
    /// Reading or writing the persistence file failed.
    Storage(String),
    /// The persistence file could not be decoded.
    Format(String),
}

impl fmt::Display for RegistryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::EmptyLookup => write!(f, "registry lookup without key id"),
            Self::KeyNotInRegistry(Some(id)) => write!(f, "key not in registry: {}", id),
            Self::KeyNotInRegistry(None) => write!(f, "key without id is not in registry"),
            Self::DuplicateKeyId(id) => write!(f, "key id already exists: {}", id),
            Self::Storage(msg) => write!(f, "registry storage error: {}", msg),
            Self::Format(msg) => write!(f, "registry file format: {}", msg),
        }
    }
}

impl std::error::Error for RegistryError {}

impl From<KeyFormatError> for RegistryError {
    fn from(e: KeyFormatError) -> Self {
        Self::Format(e.to_string())
    }
}
