//! Error types for configuration, membership, distribution and the endpoints.

use std::fmt;

use cryptoshovel_envelope::{CodecError, IdentityError, KeyEnvelopeError, RegistryError};

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    Io(String),
    Parse(String),
    /// A setting has an unusable value.
    Invalid { field: &'static str, reason: String },
    /// A key file referenced by the configuration could not be loaded.
    KeyFile { path: String, reason: String },
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io(msg) => write!(f, "config io error: {}", msg),
            Self::Parse(msg) => write!(f, "config parse error: {}", msg),
            Self::Invalid { field, reason } => write!(f, "invalid {}: {}", field, reason),
            Self::KeyFile { path, reason } => write!(f, "key file {}: {}", path, reason),
        }
    }
}

impl std::error::Error for ConfigError {}

// ---------------------------------------------------------------------------
// Membership file
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MembershipError {
    Parse(String),
    /// A receiver's public key could not be resolved.
    ReceiverKey { key: String, reason: String },
    InvalidDate { key: String, value: String },
    InvalidWindow(String),
}

impl fmt::Display for MembershipError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Parse(msg) => write!(f, "membership file: {}", msg),
            Self::ReceiverKey { key, reason } => {
                write!(f, "receiver key '{}': {}", key, reason)
            }
            Self::InvalidDate { key, value } => {
                write!(f, "receiver '{}' has unrecognised date '{}'", key, value)
            }
            Self::InvalidWindow(msg) => write!(f, "membership update windows: {}", msg),
        }
    }
}

impl std::error::Error for MembershipError {}

// ---------------------------------------------------------------------------
// Distributor
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DistributorError {
    /// The sender identity cannot sign.
    MissingPrivateKey,
    Config(ConfigError),
    Registry(RegistryError),
}

impl fmt::Display for DistributorError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MissingPrivateKey => write!(f, "distributor identity has no private key"),
            Self::Config(e) => write!(f, "distributor: {}", e),
            Self::Registry(e) => write!(f, "distributor: {}", e),
        }
    }
}

impl std::error::Error for DistributorError {}

impl From<ConfigError> for DistributorError {
    fn from(e: ConfigError) -> Self {
        Self::Config(e)
    }
}

impl From<RegistryError> for DistributorError {
    fn from(e: RegistryError) -> Self {
        Self::Registry(e)
    }
}

// ---------------------------------------------------------------------------
// Transport
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    Closed,
    Io(String),
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Closed => write!(f, "transport closed"),
            Self::Io(msg) => write!(f, "transport io error: {}", msg),
        }
    }
}

impl std::error::Error for TransportError {}

// ---------------------------------------------------------------------------
// Endpoints
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EndpointError {
    Codec(CodecError),
    KeyEnvelope(KeyEnvelopeError),
    Registry(RegistryError),
    Identity(IdentityError),
}

impl fmt::Display for EndpointError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Codec(e) => e.fmt(f),
            Self::KeyEnvelope(e) => e.fmt(f),
            Self::Registry(e) => e.fmt(f),
            Self::Identity(e) => e.fmt(f),
        }
    }
}

impl std::error::Error for EndpointError {}

impl From<CodecError> for EndpointError {
    fn from(e: CodecError) -> Self {
        Self::Codec(e)
    }
}

impl From<KeyEnvelopeError> for EndpointError {
    fn from(e: KeyEnvelopeError) -> Self {
        Self::KeyEnvelope(e)
    }
}

impl From<RegistryError> for EndpointError {
    fn from(e: RegistryError) -> Self {
        Self::Registry(e)
    }
}

impl From<IdentityError> for EndpointError {
    fn from(e: IdentityError) -> Self {
        Self::Identity(e)
    }
}
