//! Membership file: who receives keys, when, and optional timing overrides.
//!
//! ```json
//! {
//!   "startpoint": { "key": "encryptor.public" },
//!   "endpoint": [
//!     { "key": "receiver1.public" },
//!     { "key": "receiver2.public", "startDate": "2024-01-01", "endDate": 1735689600000 },
//!     { "key": "receiver3.public", "resend": true }
//!   ],
//!   "keyRotationInterval": 86400000
//! }
//! ```
//!
//! `encrypt` and `decrypt` are accepted for `startpoint` and `endpoint`.

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use serde::Deserialize;

use cryptoshovel_envelope::Validity;

use crate::config::DistributorConfig;
use crate::error::MembershipError;
use crate::receiver::{self, PublicKeyResolver, ReceiverDescriptor, ReceiverMap};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MembershipDocument {
    #[serde(default, alias = "encrypt")]
    startpoint: Option<ReceiverEntry>,
    #[serde(alias = "decrypt")]
    endpoint: Vec<ReceiverEntry>,
    #[serde(default)]
    key_rotation_interval: Option<u64>,
    #[serde(default)]
    start_update_window: Option<u64>,
    #[serde(default)]
    end_update_window: Option<u64>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ReceiverEntry {
    key: String,
    #[serde(default)]
    start_date: Option<DateSpec>,
    #[serde(default)]
    end_date: Option<DateSpec>,
    #[serde(default)]
    resend: bool,
}

/// Epoch milliseconds, or an RFC 3339 / `YYYY-MM-DD` string (UTC).
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum DateSpec {
    Millis(i64),
    Fractional(f64),
    Text(String),
}

impl DateSpec {
    fn resolve(&self, key: &str) -> Result<DateTime<Utc>, MembershipError> {
        let invalid = |value: String| MembershipError::InvalidDate {
            key: key.to_string(),
            value,
        };
        match self {
            Self::Millis(ms) => {
                DateTime::<Utc>::from_timestamp_millis(*ms).ok_or_else(|| invalid(ms.to_string()))
            }
            Self::Fractional(ms) if ms.is_finite() => {
                DateTime::<Utc>::from_timestamp_millis(ms.floor() as i64)
                    .ok_or_else(|| invalid(ms.to_string()))
            }
            Self::Fractional(ms) => Err(invalid(ms.to_string())),
            Self::Text(text) => parse_date(text).ok_or_else(|| invalid(text.clone())),
        }
    }
}

fn parse_date(text: &str) -> Option<DateTime<Utc>> {
    let text = text.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(text) {
        return Some(dt.with_timezone(&Utc));
    }
    for format in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(text, format) {
            return Some(naive.and_utc());
        }
    }
    NaiveDate::parse_from_str(text, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|naive| naive.and_utc())
}

// ---------------------------------------------------------------------------
// Parsed membership
// ---------------------------------------------------------------------------

/// One parsed membership file.
#[derive(Debug, Clone, Default)]
pub struct Membership {
    /// Every receiver, including the startpoint. A later entry for the same
    /// key replaces an earlier one.
    pub receivers: ReceiverMap,
    pub key_rotation_interval: Option<u64>,
    pub start_update_window: Option<u64>,
    pub end_update_window: Option<u64>,
}

impl Membership {
    pub fn parse(
        content: &str,
        resolver: &dyn PublicKeyResolver,
    ) -> Result<Self, MembershipError> {
        let doc: MembershipDocument =
            serde_json::from_str(content).map_err(|e| MembershipError::Parse(e.to_string()))?;

        let mut receivers = ReceiverMap::new();
        for entry in doc.startpoint.iter().chain(doc.endpoint.iter()) {
            let descriptor = describe(entry, resolver)?;
            receivers.insert(descriptor.id, descriptor);
        }

        Ok(Self {
            receivers,
            key_rotation_interval: doc.key_rotation_interval,
            start_update_window: doc.start_update_window,
            end_update_window: doc.end_update_window,
        })
    }

    pub fn active_on(&self, at: DateTime<Utc>) -> ReceiverMap {
        receiver::active_on(&self.receivers, at)
    }

    /// `current` with the file's timing values applied, validated.
    pub fn timing(&self, current: DistributorConfig) -> Result<DistributorConfig, MembershipError> {
        let merged = DistributorConfig {
            key_rotation_interval: self
                .key_rotation_interval
                .unwrap_or(current.key_rotation_interval),
            start_update_window: self.start_update_window.unwrap_or(current.start_update_window),
            end_update_window: self.end_update_window.unwrap_or(current.end_update_window),
        };
        merged
            .validate()
            .map_err(|e| MembershipError::InvalidWindow(e.to_string()))?;
        Ok(merged)
    }
}

fn describe(
    entry: &ReceiverEntry,
    resolver: &dyn PublicKeyResolver,
) -> Result<ReceiverDescriptor, MembershipError> {
    let identity = resolver.resolve(&entry.key)?;
    let start = entry
        .start_date
        .as_ref()
        .map(|d| d.resolve(&entry.key))
        .transpose()?;
    let end = entry
        .end_date
        .as_ref()
        .map(|d| d.resolve(&entry.key))
        .transpose()?;

    Ok(ReceiverDescriptor::new(identity, entry.key.clone())
        .with_validity(Validity::new(start, end))
        .with_resend(entry.resend))
}
