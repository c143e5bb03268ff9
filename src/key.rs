//! Symmetric key records: id, secret, validity window and export form.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::{DateTime, Utc};
use core::fmt;
use rand_core::{OsRng, RngCore};
use serde::{Deserialize, Serialize};
use subtle::ConstantTimeEq;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::KeyFormatError;
use crate::wire::{KEY_BYTES, KEY_ID_BYTES};

// ---------------------------------------------------------------------------
// Key identifier
// ---------------------------------------------------------------------------

/// 8-byte key identifier, written as base64 in JSON and logs.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct KeyId([u8; KEY_ID_BYTES]);

impl KeyId {
    /// Create a new random KeyId.
    pub fn generate() -> Self {
        let mut bytes = [0u8; KEY_ID_BYTES];
        OsRng.fill_bytes(&mut bytes);
        Self(bytes)
    }

    pub fn from_bytes(bytes: [u8; KEY_ID_BYTES]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; KEY_ID_BYTES] {
        &self.0
    }

    pub fn to_base64(&self) -> String {
        BASE64.encode(self.0)
    }

    pub fn from_base64(s: &str) -> Result<Self, KeyFormatError> {
        decode_fixed::<KEY_ID_BYTES>(s, "i").map(Self)
    }
}

impl fmt::Display for KeyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_base64())
    }
}

impl fmt::Debug for KeyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "KeyId({})", self.to_base64())
    }
}

// ---------------------------------------------------------------------------
// Secret
// ---------------------------------------------------------------------------

/// 32 bytes of AES-256 key material, wiped on drop.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct KeySecret([u8; KEY_BYTES]);

impl KeySecret {
    pub fn generate() -> Self {
        let mut bytes = [0u8; KEY_BYTES];
        OsRng.fill_bytes(&mut bytes);
        Self(bytes)
    }

    pub fn from_bytes(bytes: [u8; KEY_BYTES]) -> Self {
        Self(bytes)
    }

    pub fn expose(&self) -> &[u8; KEY_BYTES] {
        &self.0
    }
}

impl PartialEq for KeySecret {
    fn eq(&self, other: &Self) -> bool {
        self.0.ct_eq(&other.0).into()
    }
}

impl Eq for KeySecret {}

impl fmt::Debug for KeySecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "KeySecret(<redacted>)")
    }
}

// ---------------------------------------------------------------------------
// Validity window
// ---------------------------------------------------------------------------

/// Half-open interval `[start, end)`; an absent bound is unbounded.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Validity {
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
}

impl Validity {
    pub const ALWAYS: Validity = Validity {
        start: None,
        end: None,
    };

    pub fn new(start: Option<DateTime<Utc>>, end: Option<DateTime<Utc>>) -> Self {
        Self { start, end }
    }

    pub fn contains(&self, at: DateTime<Utc>) -> bool {
        self.start.map_or(true, |s| s <= at) && self.end.map_or(true, |e| at < e)
    }

    /// True once the end bound has been reached.
    pub fn has_ended(&self, at: DateTime<Utc>) -> bool {
        self.end.map_or(false, |e| e <= at)
    }
}

// ---------------------------------------------------------------------------
// Symmetric key record
// ---------------------------------------------------------------------------

/// A symmetric key: optional id, secret, validity window and creation time.
///
/// A key without an id can encrypt point-to-point (pre-shared key mode) but
/// cannot be distributed or looked up in a registry.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SymmetricKey {
    id: Option<KeyId>,
    secret: KeySecret,
    validity: Validity,
    created_at: DateTime<Utc>,
}

impl SymmetricKey {
    /// Fresh random secret, no id, unbounded validity.
    pub fn generate(created_at: DateTime<Utc>) -> Self {
        Self::from_secret(KeySecret::generate(), created_at)
    }

    pub fn from_secret(secret: KeySecret, created_at: DateTime<Utc>) -> Self {
        Self {
            id: None,
            secret,
            validity: Validity::ALWAYS,
            created_at,
        }
    }

    pub fn with_id(mut self, id: KeyId) -> Self {
        self.id = Some(id);
        self
    }

    pub fn with_validity(mut self, validity: Validity) -> Self {
        self.validity = validity;
        self
    }

    pub fn id(&self) -> Option<KeyId> {
        self.id
    }

    pub fn secret(&self) -> &KeySecret {
        &self.secret
    }

    pub fn validity(&self) -> Validity {
        self.validity
    }

    pub fn start_date(&self) -> Option<DateTime<Utc>> {
        self.validity.start
    }

    pub fn end_date(&self) -> Option<DateTime<Utc>> {
        self.validity.end
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Set the validity window. Only meaningful before the key is distributed.
    pub fn set_validity(&mut self, validity: Validity) {
        self.validity = validity;
    }

    pub(crate) fn assign_id(&mut self, id: KeyId) {
        self.id = Some(id);
    }

    pub fn is_valid_at(&self, at: DateTime<Utc>) -> bool {
        self.validity.contains(at)
    }

    pub fn is_expired_at(&self, at: DateTime<Utc>) -> bool {
        self.validity.has_ended(at)
    }

    // -----------------------------------------------------------------------
    // Export form
    // -----------------------------------------------------------------------

    /// Compact JSON `{"i":..,"k":..,"a":..,"d":..,"c":..}`, absent fields omitted.
    pub fn export(&self) -> String {
        let exported = ExportedKey {
            i: self.id.map(|id| id.to_base64()),
            k: BASE64.encode(self.secret.expose()),
            a: self.validity.start.map(|d| d.timestamp_millis()),
            d: self.validity.end.map(|d| d.timestamp_millis()),
            c: self.created_at.timestamp_millis(),
        };
        // a struct of strings and integers always serializes
        serde_json::to_string(&exported).unwrap_or_default()
    }

    pub fn import(s: &str) -> Result<Self, KeyFormatError> {
        let parsed: ExportedKey =
            serde_json::from_str(s).map_err(|e| KeyFormatError::Json(e.to_string()))?;

        let id = parsed.i.as_deref().map(KeyId::from_base64).transpose()?;
        let mut secret = decode_fixed::<KEY_BYTES>(&parsed.k, "k")?;
        let key = Self {
            id,
            secret: KeySecret::from_bytes(secret),
            validity: Validity {
                start: parsed.a.map(|ms| millis_to_date(ms, "a")).transpose()?,
                end: parsed.d.map(|ms| millis_to_date(ms, "d")).transpose()?,
            },
            created_at: millis_to_date(parsed.c, "c")?,
        };
        secret.zeroize();
        Ok(key)
    }
}

#[derive(Serialize, Deserialize)]
struct ExportedKey {
    #[serde(skip_serializing_if = "Option::is_none", default)]
    i: Option<String>,
    k: String,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    a: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    d: Option<i64>,
    c: i64,
}

pub(crate) fn millis_to_date(ms: i64, field: &'static str) -> Result<DateTime<Utc>, KeyFormatError> {
    DateTime::<Utc>::from_timestamp_millis(ms).ok_or(KeyFormatError::Timestamp { field, value: ms })
}

fn decode_fixed<const N: usize>(s: &str, field: &'static str) -> Result<[u8; N], KeyFormatError> {
    let mut raw = BASE64
        .decode(s)
        .map_err(|_| KeyFormatError::Base64 { field })?;
    let out: Result<[u8; N], _> = raw.as_slice().try_into();
    let actual = raw.len();
    raw.zeroize();
    out.map_err(|_| KeyFormatError::Length {
        field,
        expected: N,
        actual,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECRET_B64: &str = "a9ITQAFpNi+wJqrw4n7SznGJ3rtACO1GoX8iYUHke+8=";

    fn fixed_key() -> SymmetricKey {
        let secret = decode_fixed::<KEY_BYTES>(SECRET_B64, "k").unwrap();
        let created = millis_to_date(1523697157207, "c").unwrap();
        SymmetricKey::from_secret(KeySecret::from_bytes(secret), created)
    }

    #[test]
    fn export_omits_absent_fields() {
        assert_eq!(
            fixed_key().export(),
            r#"{"k":"a9ITQAFpNi+wJqrw4n7SznGJ3rtACO1GoX8iYUHke+8=","c":1523697157207}"#
        );
    }

    #[test]
    fn export_with_all_fields() {
        let key = fixed_key()
            .with_id(KeyId::from_base64("bUcmwfgbWhE=").unwrap())
            .with_validity(Validity::new(
                Some(millis_to_date(1523956965337, "a").unwrap()),
                Some(millis_to_date(1524043365337, "d").unwrap()),
            ));
        assert_eq!(
            key.export(),
            r#"{"i":"bUcmwfgbWhE=","k":"a9ITQAFpNi+wJqrw4n7SznGJ3rtACO1GoX8iYUHke+8=","a":1523956965337,"d":1524043365337,"c":1523697157207}"#
        );
        assert_eq!(SymmetricKey::import(&key.export()).unwrap(), key);
    }

    #[test]
    fn import_rejects_short_secret() {
        let err = SymmetricKey::import(r#"{"k":"AAAA","c":0}"#).unwrap_err();
        assert_eq!(
            err,
            KeyFormatError::Length {
                field: "k",
                expected: 32,
                actual: 3
            }
        );
    }

    #[test]
    fn import_rejects_bad_base64_id() {
        let err = SymmetricKey::import(&format!(r#"{{"i":"!!","k":"{}","c":0}}"#, SECRET_B64))
            .unwrap_err();
        assert_eq!(err, KeyFormatError::Base64 { field: "i" });
    }

    #[test]
    fn validity_is_start_inclusive_end_exclusive() {
        let start = millis_to_date(1_000, "a").unwrap();
        let end = millis_to_date(2_000, "d").unwrap();
        let v = Validity::new(Some(start), Some(end));

        assert!(v.contains(start));
        assert!(!v.contains(end));
        assert!(!v.contains(start - chrono::Duration::milliseconds(1)));
        assert!(v.has_ended(end));
        assert!(!v.has_ended(end - chrono::Duration::milliseconds(1)));
        assert!(Validity::ALWAYS.contains(end));
    }

    #[test]
    fn secrets_compare_by_value() {
        let a = KeySecret::from_bytes([7u8; KEY_BYTES]);
        let b = KeySecret::from_bytes([7u8; KEY_BYTES]);
        let c = KeySecret::from_bytes([8u8; KEY_BYTES]);
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(format!("{:?}", a), "KeySecret(<redacted>)");
    }
}
