//! # Cryptoshovel Distributor
//!
//! Key rotation and distribution for encrypting message-queue shovels.
//!
//! A [`KeyDistributor`] mints symmetric keys on a schedule, seals each one
//! for every active receiver listed in a membership file and promotes it in
//! a shared [`KeyRegistry`](cryptoshovel_envelope::KeyRegistry) once
//! everybody has it. Receivers install the keys with a
//! [`DecryptingEndpoint`] and decrypt traffic sealed by the
//! [`EncryptingEndpoint`].
//!
//! Built on top of `cryptoshovel-envelope` for the message and key envelopes.
//!
//! ## Quick Start
//!
//! ```ignore
//! use cryptoshovel_distributor::*;
//! use cryptoshovel_envelope::{KeyRegistry, RsaIdentity};
//! use std::sync::{Arc, RwLock};
//! use std::time::Duration;
//!
//! # tokio_test::block_on(async {
//! let identity = Arc::new(RsaIdentity::from_private_pem(&sender_pem).unwrap());
//! let registry = Arc::new(RwLock::new(KeyRegistry::open("keys.json").unwrap()));
//! let audit = Arc::new(TracingAuditSink);
//!
//! let distributor = KeyDistributor::new(
//!     DistributorConfig::default(),
//!     identity,
//!     Arc::new(KeyDirectory::new("./receiver-keys")),
//!     registry.clone(),
//!     audit.clone(),
//! )
//! .unwrap();
//!
//! // Watch the membership file and drop envelopes into per-receiver folders
//! let (changes, _watcher) = FileWatcher::new("receivers.json", Duration::from_secs(1)).spawn();
//! let transport = Arc::new(OutboxTransport::new("./outbox"));
//! let handle = DistributorService::new(distributor, transport, audit, SystemClock).spawn(changes);
//!
//! // Encrypt with whatever key is active
//! let endpoint = EncryptingEndpoint::managed(registry);
//! let sealed = endpoint.encrypt(Message::new("hello").with_routing_key("a.b")).unwrap();
//!
//! handle.stop().await;
//! # });
//! ```

#![deny(unsafe_code)]

pub mod audit;
pub mod clock;
pub mod config;
pub mod distributor;
pub mod endpoint;
pub mod error;
pub mod membership;
pub mod receiver;
pub mod service;
pub mod transport;
pub mod watch;

pub use audit::{
    AuditAction, AuditEvent, AuditSink, FileAuditSink, InMemoryAuditSink, TracingAuditSink,
};
pub use clock::{Clock, SystemClock, TokioClock};
pub use config::{DistributorConfig, ShovelConfig};
pub use distributor::{
    DistributorAction, KeyDistributor, SharedRegistry, Trigger, MEMBERSHIP_DEBOUNCE_MS,
};
pub use endpoint::{DecryptingEndpoint, EncryptingEndpoint, Inbound};
pub use error::{ConfigError, DistributorError, EndpointError, MembershipError, TransportError};
pub use membership::Membership;
pub use receiver::{KeyDirectory, PublicKeyResolver, ReceiverDescriptor, ReceiverMap};
pub use service::{DistributorService, ServiceHandle};
pub use transport::{drain_inbox, ChannelTransport, Delivery, KeyTransport, OutboxTransport};
pub use watch::FileWatcher;

pub use cryptoshovel_envelope::Message;
