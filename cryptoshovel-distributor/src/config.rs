//! Configuration: distribution timing and the shovel's file layout.
//!
//! Loaded from JSON (camelCase keys, durations in milliseconds) with
//! `${configRoot}` replaced by the directory holding the file, then
//! overridden from `CRYPTOSHOVEL_*` environment variables:
//!
//!   CRYPTOSHOVEL_PRIVATE_KEY             - own private key PEM file
//!   CRYPTOSHOVEL_PUBLIC_KEY              - own public key PEM file
//!   CRYPTOSHOVEL_SENDER_KEY              - distributor public key PEM file (receivers)
//!   CRYPTOSHOVEL_REGISTRY_FILE           - key registry persistence file
//!   CRYPTOSHOVEL_MEMBERSHIP_FILE         - receiver membership file (distributor)
//!   CRYPTOSHOVEL_RECEIVER_KEY_FOLDER     - folder with receiver public keys
//!   CRYPTOSHOVEL_OUTBOX                  - directory key envelopes are dropped into
//!   CRYPTOSHOVEL_INBOX                   - directory key envelopes are picked up from
//!   CRYPTOSHOVEL_AUDIT_LOG               - JSON-lines audit file
//!   CRYPTOSHOVEL_POLL_INTERVAL_MS        - membership / inbox poll interval
//!   CRYPTOSHOVEL_KEY_ROTATION_INTERVAL_MS
//!   CRYPTOSHOVEL_START_UPDATE_WINDOW_MS
//!   CRYPTOSHOVEL_END_UPDATE_WINDOW_MS

use chrono::TimeDelta;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use cryptoshovel_envelope::RsaIdentity;

use crate::error::ConfigError;

pub const DEFAULT_KEY_ROTATION_INTERVAL_MS: u64 = 24 * 60 * 60 * 1000;
pub const DEFAULT_START_UPDATE_WINDOW_MS: u64 = 60 * 60 * 1000;
pub const DEFAULT_END_UPDATE_WINDOW_MS: u64 = 55 * 60 * 1000;
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 1000;

const CONFIG_ROOT: &str = "${configRoot}";

// ---------------------------------------------------------------------------
// Distribution timing
// ---------------------------------------------------------------------------

/// Rotation interval and the two update windows, in milliseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DistributorConfig {
    /// Force a new key after this long; 0 rotates only on membership boundaries.
    #[serde(default = "default_rotation")]
    pub key_rotation_interval: u64,
    /// How long before activation the paced fan-out starts.
    #[serde(default = "default_start_window")]
    pub start_update_window: u64,
    /// How long before activation every receiver must have the key.
    #[serde(default = "default_end_window")]
    pub end_update_window: u64,
}

fn default_rotation() -> u64 {
    DEFAULT_KEY_ROTATION_INTERVAL_MS
}
fn default_start_window() -> u64 {
    DEFAULT_START_UPDATE_WINDOW_MS
}
fn default_end_window() -> u64 {
    DEFAULT_END_UPDATE_WINDOW_MS
}
fn default_poll() -> u64 {
    DEFAULT_POLL_INTERVAL_MS
}

impl Default for DistributorConfig {
    fn default() -> Self {
        Self {
            key_rotation_interval: DEFAULT_KEY_ROTATION_INTERVAL_MS,
            start_update_window: DEFAULT_START_UPDATE_WINDOW_MS,
            end_update_window: DEFAULT_END_UPDATE_WINDOW_MS,
        }
    }
}

impl DistributorConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (field, value) in [
            ("keyRotationInterval", self.key_rotation_interval),
            ("startUpdateWindow", self.start_update_window),
            ("endUpdateWindow", self.end_update_window),
        ] {
            if value > i64::MAX as u64 {
                return Err(ConfigError::Invalid {
                    field,
                    reason: format!("{} ms is out of range", value),
                });
            }
        }
        if self.end_update_window > self.start_update_window {
            return Err(ConfigError::Invalid {
                field: "endUpdateWindow",
                reason: format!(
                    "{} ms must not exceed startUpdateWindow ({} ms)",
                    self.end_update_window, self.start_update_window
                ),
            });
        }
        if self.key_rotation_interval != 0 && self.key_rotation_interval <= self.start_update_window
        {
            return Err(ConfigError::Invalid {
                field: "keyRotationInterval",
                reason: format!(
                    "{} ms must exceed startUpdateWindow ({} ms)",
                    self.key_rotation_interval, self.start_update_window
                ),
            });
        }
        Ok(())
    }

    /// `None` when rotation is driven by membership boundaries only.
    pub fn rotation_interval(&self) -> Option<TimeDelta> {
        (self.key_rotation_interval != 0).then(|| millis(self.key_rotation_interval))
    }

    pub fn start_window(&self) -> TimeDelta {
        millis(self.start_update_window)
    }

    pub fn end_window(&self) -> TimeDelta {
        millis(self.end_update_window)
    }
}

fn millis(ms: u64) -> TimeDelta {
    TimeDelta::milliseconds(i64::try_from(ms).unwrap_or(i64::MAX))
}

// ---------------------------------------------------------------------------
// Shovel configuration
// ---------------------------------------------------------------------------

/// File layout of one shovel (distributor or receiving endpoint).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ShovelConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub private_rsa_key_file: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub public_rsa_key_file: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender_public_rsa_key_file: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub persist_file: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub receiver_config_file: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub receiver_rsa_key_folder: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outbox: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inbox: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub audit_log: Option<PathBuf>,
    #[serde(default = "default_poll")]
    pub poll_interval: u64,
    #[serde(flatten)]
    pub distribution: DistributorConfig,
}

impl Default for ShovelConfig {
    fn default() -> Self {
        Self {
            private_rsa_key_file: None,
            public_rsa_key_file: None,
            sender_public_rsa_key_file: None,
            persist_file: None,
            receiver_config_file: None,
            receiver_rsa_key_folder: None,
            outbox: None,
            inbox: None,
            audit_log: None,
            poll_interval: DEFAULT_POLL_INTERVAL_MS,
            distribution: DistributorConfig::default(),
        }
    }
}

impl ShovelConfig {
    /// Read a config file, substitute `${configRoot}` and parse it.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::Io(format!("{}: {}", path.display(), e)))?;
        let root = path
            .parent()
            .map(|p| p.to_string_lossy().replace('\\', "/"))
            .unwrap_or_else(|| ".".into());
        Self::parse(&raw.replace(CONFIG_ROOT, &root))
    }

    pub fn parse(json: &str) -> Result<Self, ConfigError> {
        let config: Self =
            serde_json::from_str(json).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.distribution.validate()?;
        Ok(config)
    }

    /// Apply `CRYPTOSHOVEL_*` overrides from the process environment.
    pub fn apply_env(&mut self) -> Result<(), ConfigError> {
        self.apply_overrides(|name| std::env::var(name).ok())
    }

    /// Apply overrides from any variable source.
    pub fn apply_overrides(
        &mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<(), ConfigError> {
        let paths: [(&str, &mut Option<PathBuf>); 9] = [
            ("CRYPTOSHOVEL_PRIVATE_KEY", &mut self.private_rsa_key_file),
            ("CRYPTOSHOVEL_PUBLIC_KEY", &mut self.public_rsa_key_file),
            ("CRYPTOSHOVEL_SENDER_KEY", &mut self.sender_public_rsa_key_file),
            ("CRYPTOSHOVEL_REGISTRY_FILE", &mut self.persist_file),
            ("CRYPTOSHOVEL_MEMBERSHIP_FILE", &mut self.receiver_config_file),
            ("CRYPTOSHOVEL_RECEIVER_KEY_FOLDER", &mut self.receiver_rsa_key_folder),
            ("CRYPTOSHOVEL_OUTBOX", &mut self.outbox),
            ("CRYPTOSHOVEL_INBOX", &mut self.inbox),
            ("CRYPTOSHOVEL_AUDIT_LOG", &mut self.audit_log),
        ];
        for (name, slot) in paths {
            if let Some(value) = lookup(name) {
                *slot = Some(PathBuf::from(value));
            }
        }

        let numbers: [(&str, &'static str, &mut u64); 4] = [
            ("CRYPTOSHOVEL_POLL_INTERVAL_MS", "pollInterval", &mut self.poll_interval),
            (
                "CRYPTOSHOVEL_KEY_ROTATION_INTERVAL_MS",
                "keyRotationInterval",
                &mut self.distribution.key_rotation_interval,
            ),
            (
                "CRYPTOSHOVEL_START_UPDATE_WINDOW_MS",
                "startUpdateWindow",
                &mut self.distribution.start_update_window,
            ),
            (
                "CRYPTOSHOVEL_END_UPDATE_WINDOW_MS",
                "endUpdateWindow",
                &mut self.distribution.end_update_window,
            ),
        ];
        for (name, field, slot) in numbers {
            if let Some(value) = lookup(name) {
                *slot = value.trim().parse().map_err(|_| ConfigError::Invalid {
                    field,
                    reason: format!("{}={} is not a number of milliseconds", name, value),
                })?;
            }
        }

        if self.poll_interval == 0 {
            return Err(ConfigError::Invalid {
                field: "pollInterval",
                reason: "must be at least 1 ms".into(),
            });
        }
        self.distribution.validate()
    }

    pub fn poll_interval(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.poll_interval)
    }

    /// Own identity, private half included.
    pub fn identity(&self) -> Result<RsaIdentity, ConfigError> {
        let path = require(&self.private_rsa_key_file, "privateRsaKeyFile")?;
        load_private_identity(path)
    }

    /// The distributor's public identity, used by receivers to check signatures.
    pub fn sender_identity(&self) -> Result<RsaIdentity, ConfigError> {
        let path = require(&self.sender_public_rsa_key_file, "senderPublicRsaKeyFile")?;
        load_public_identity(path)
    }
}

/// The configured path, or an `Invalid` error naming the missing setting.
pub fn require<'a>(
    slot: &'a Option<PathBuf>,
    field: &'static str,
) -> Result<&'a Path, ConfigError> {
    slot.as_deref().ok_or_else(|| ConfigError::Invalid {
        field,
        reason: "not configured".into(),
    })
}

pub fn load_private_identity(path: &Path) -> Result<RsaIdentity, ConfigError> {
    let pem = read_key_file(path)?;
    RsaIdentity::from_private_pem(&pem).map_err(|e| ConfigError::KeyFile {
        path: path.display().to_string(),
        reason: e.to_string(),
    })
}

pub fn load_public_identity(path: &Path) -> Result<RsaIdentity, ConfigError> {
    let pem = read_key_file(path)?;
    RsaIdentity::from_public_pem(&pem).map_err(|e| ConfigError::KeyFile {
        path: path.display().to_string(),
        reason: e.to_string(),
    })
}

fn read_key_file(path: &Path) -> Result<String, ConfigError> {
    std::fs::read_to_string(path).map_err(|e| ConfigError::KeyFile {
        path: path.display().to_string(),
        reason: e.to_string(),
    })
}
