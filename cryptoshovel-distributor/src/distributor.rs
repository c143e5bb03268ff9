//! Key rotation and distribution scheduler.
//!
//! [`KeyDistributor`] is a sans-IO state machine. The caller feeds it a
//! [`Trigger`] together with the current time and carries out the returned
//! [`DistributorAction`]s: hand key envelopes to the transport, arm or cancel
//! the single timer. All decisions about when to mint, whom to send to and
//! when a key becomes active live here.
//!
//! ## Schedule
//!
//! Each key becomes active at an *activation time* and stays valid until the
//! next one. The next activation is the earliest of `activation + interval`
//! and any receiver start or end date after `activation`.
//!
//! ```text
//!   activation - start window      activation - end window     activation
//!   |--- paced sends, one per tick ---|--- everyone else at once ---|-> promote
//! ```
//!
//! Membership changes are folded in as they arrive: new receivers get the
//! current key straight away, a receiver that left forces a new key, and a
//! changed rotation interval restarts the schedule from now.

use chrono::{DateTime, TimeDelta, Utc};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use cryptoshovel_envelope::{
    Fingerprint, KeyEnvelopeError, KeyRegistry, PreparedKey, RsaIdentity, SymmetricKey, Validity,
};

use crate::audit::{AuditAction, AuditEvent, AuditSink};
use crate::config::DistributorConfig;
use crate::error::DistributorError;
use crate::membership::Membership;
use crate::receiver::{self, PublicKeyResolver, ReceiverDescriptor, ReceiverMap};

/// Re-reads of unchanged membership content closer together than this are
/// ignored.
pub const MEMBERSHIP_DEBOUNCE_MS: i64 = 100;

/// Registry shared between the distributor and the encrypting side.
pub type SharedRegistry = Arc<RwLock<KeyRegistry>>;

/// Input to [`KeyDistributor::tick`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Trigger {
    Start,
    /// The membership file now holds this content.
    MembershipChanged(String),
    /// The armed timer fired.
    Timer,
    Stop,
}

/// Output of [`KeyDistributor::tick`], to be carried out in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DistributorAction {
    SendKey {
        receiver: Fingerprint,
        envelope: Vec<u8>,
    },
    /// Replace any armed timer with one firing at `deadline`.
    ArmTimer {
        deadline: DateTime<Utc>,
        wait: TimeDelta,
    },
    CancelTimer,
    /// The registry changed and should be written to its store.
    PersistRegistry,
}

/// The key being rolled out and who has it so far.
struct Rollout {
    key: SymmetricKey,
    prepared: Option<PreparedKey>,
    sent: ReceiverMap,
    unsent: ReceiverMap,
}

impl Rollout {
    fn new(key: SymmetricKey, sent: ReceiverMap, unsent: ReceiverMap) -> Self {
        Self {
            key,
            prepared: None,
            sent,
            unsent,
        }
    }

    /// The payload is encoded and signed once per key, then encrypted per
    /// receiver.
    fn seal_for(
        &mut self,
        sender: &RsaIdentity,
        receiver: &ReceiverDescriptor,
    ) -> Result<Vec<u8>, KeyEnvelopeError> {
        let prepared = match self.prepared.take() {
            Some(prepared) => prepared,
            None => PreparedKey::new(&self.key, sender)?,
        };
        let sealed = prepared.seal_for(&receiver.identity);
        self.prepared = Some(prepared);
        sealed
    }
}

pub struct KeyDistributor {
    settings: DistributorConfig,
    identity: Arc<RsaIdentity>,
    resolver: Arc<dyn PublicKeyResolver>,
    registry: SharedRegistry,
    audit: Arc<dyn AuditSink>,
    started: bool,
    receivers: ReceiverMap,
    active_receivers: ReceiverMap,
    rollout: Option<Rollout>,
    activation_time: Option<DateTime<Utc>>,
    next_deadline: Option<DateTime<Utc>>,
    last_read: Option<(String, DateTime<Utc>)>,
    registry_dirty: bool,
}

impl KeyDistributor {
    pub fn new(
        settings: DistributorConfig,
        identity: Arc<RsaIdentity>,
        resolver: Arc<dyn PublicKeyResolver>,
        registry: SharedRegistry,
        audit: Arc<dyn AuditSink>,
    ) -> Result<Self, DistributorError> {
        if !identity.has_private_key() {
            return Err(DistributorError::MissingPrivateKey);
        }
        settings.validate()?;
        Ok(Self {
            settings,
            identity,
            resolver,
            registry,
            audit,
            started: false,
            receivers: ReceiverMap::new(),
            active_receivers: ReceiverMap::new(),
            rollout: None,
            activation_time: None,
            next_deadline: None,
            last_read: None,
            registry_dirty: false,
        })
    }

    // -----------------------------------------------------------------------
    // Driving
    // -----------------------------------------------------------------------

    /// Advance the state machine.
    pub fn tick(&mut self, now: DateTime<Utc>, trigger: Trigger) -> Vec<DistributorAction> {
        let mut actions = Vec::new();
        match trigger {
            Trigger::Start => self.start(now),
            Trigger::MembershipChanged(content) => {
                self.membership_changed(now, content, &mut actions)
            }
            Trigger::Timer if self.started => self.on_timer(now, &mut actions),
            Trigger::Timer => tracing::debug!("timer fired while stopped, ignored"),
            Trigger::Stop => self.stop(&mut actions),
        }
        if std::mem::take(&mut self.registry_dirty) {
            actions.insert(0, DistributorAction::PersistRegistry);
        }
        actions
    }

    fn start(&mut self, now: DateTime<Utc>) {
        if self.started {
            return;
        }
        tracing::info!(fingerprint = %self.identity.fingerprint(), "distributor started");
        self.started = true;
        self.active_receivers.clear();
        self.last_read = None;
        self.rollout = None;
        self.next_deadline = None;
        self.activation_time = Some(now);
    }

    fn stop(&mut self, actions: &mut Vec<DistributorAction>) {
        if self.started {
            tracing::info!("distributor stopped");
        }
        self.started = false;
        self.next_deadline = None;
        actions.push(DistributorAction::CancelTimer);
    }

    // -----------------------------------------------------------------------
    // Membership changes
    // -----------------------------------------------------------------------

    fn membership_changed(
        &mut self,
        now: DateTime<Utc>,
        content: String,
        actions: &mut Vec<DistributorAction>,
    ) {
        if let Some((previous, read_at)) = &self.last_read {
            if *previous == content
                && now - *read_at < TimeDelta::milliseconds(MEMBERSHIP_DEBOUNCE_MS)
            {
                tracing::trace!("membership unchanged since last read, ignored");
                self.last_read = Some((content, now));
                return;
            }
        }

        let parsed = Membership::parse(&content, self.resolver.as_ref())
            .and_then(|membership| Ok((membership.timing(self.settings)?, membership)));
        self.last_read = Some((content, now));
        let (timing, membership) = match parsed {
            Ok(parsed) => parsed,
            Err(e) => {
                tracing::warn!(error = %e, "membership file rejected, keeping previous receivers");
                self.record(
                    AuditEvent::new(
                        now,
                        AuditAction::MembershipRejected {
                            reason: e.to_string(),
                        },
                    )
                    .with_failure(),
                );
                return;
            }
        };

        let previous_receivers = std::mem::replace(&mut self.receivers, membership.receivers);
        let previous_active = std::mem::replace(
            &mut self.active_receivers,
            receiver::active_on(&self.receivers, now),
        );
        let interval_changed = timing.key_rotation_interval != self.settings.key_rotation_interval;
        if interval_changed {
            self.record(AuditEvent::new(
                now,
                AuditAction::IntervalChanged {
                    from_ms: self.settings.key_rotation_interval as i64,
                    to_ms: timing.key_rotation_interval as i64,
                },
            ));
        }
        self.settings = timing;
        self.record(AuditEvent::new(
            now,
            AuditAction::MembershipLoaded {
                receivers: self.receivers.len(),
                active: self.active_receivers.len(),
            },
        ));

        if !self.started {
            return;
        }

        if interval_changed {
            self.abandon_rollout(now);
            self.rotate_now(now, actions);
            return;
        }

        let newly_resend: Vec<Fingerprint> = self
            .receivers
            .values()
            .filter(|r| r.resend && !previous_receivers.get(&r.id).is_some_and(|p| p.resend))
            .map(|r| r.id)
            .collect();

        if self.rollout.is_some() {
            self.rollout_membership_changed(now, &newly_resend, actions);
        } else {
            self.idle_membership_changed(now, &previous_active, &newly_resend, actions);
        }
    }

    /// A key is on its way out; keep its receiver sets consistent.
    fn rollout_membership_changed(
        &mut self,
        now: DateTime<Utc>,
        newly_resend: &[Fingerprint],
        actions: &mut Vec<DistributorAction>,
    ) {
        let activation = self.activation_time.unwrap_or(now);
        let targets = receiver::active_on(&self.receivers, activation);
        let Some(rollout) = self.rollout.as_mut() else {
            return;
        };

        for id in newly_resend {
            rollout.sent.remove(id);
        }

        if rollout.sent.keys().any(|id| !targets.contains_key(id)) {
            tracing::info!("a receiver holding the pending key left, rotating");
            self.abandon_rollout(now);
            self.rotate_now(now, actions);
            return;
        }

        rollout.unsent = targets
            .into_iter()
            .filter(|(id, _)| !rollout.sent.contains_key(id))
            .collect();
        if !rollout.unsent.is_empty() {
            let joined = rollout.unsent.len();
            let key_id = rollout.key.id();
            self.record(
                AuditEvent::new(now, AuditAction::RolloutJoined { receivers: joined })
                    .with_key(key_id),
            );
            self.arm(now, TimeDelta::zero(), actions);
        }
    }

    /// No rollout in progress: bring newcomers up to date or start over.
    fn idle_membership_changed(
        &mut self,
        now: DateTime<Utc>,
        previous_active: &ReceiverMap,
        newly_resend: &[Fingerprint],
        actions: &mut Vec<DistributorAction>,
    ) {
        if previous_active
            .keys()
            .any(|id| !self.active_receivers.contains_key(id))
        {
            tracing::info!("an active receiver left, rotating");
            self.rotate_now(now, actions);
            return;
        }

        let newcomers: ReceiverMap = self
            .active_receivers
            .iter()
            .filter(|(id, _)| !previous_active.contains_key(*id) || newly_resend.contains(*id))
            .map(|(id, r)| (*id, r.clone()))
            .collect();
        if newcomers.is_empty() {
            self.reschedule(now, actions);
            return;
        }

        let current = self
            .registry_read()
            .active()
            .filter(|key| key.is_valid_at(now))
            .cloned();
        match current {
            Some(key) => {
                let sent = self
                    .active_receivers
                    .iter()
                    .filter(|(id, _)| !newcomers.contains_key(*id))
                    .map(|(id, r)| (*id, r.clone()))
                    .collect();
                self.record(
                    AuditEvent::new(
                        now,
                        AuditAction::RolloutJoined {
                            receivers: newcomers.len(),
                        },
                    )
                    .with_key(key.id()),
                );
                self.rollout = Some(Rollout::new(key, sent, newcomers));
                self.activation_time = Some(now);
                self.arm(now, TimeDelta::zero(), actions);
            }
            None => self.rotate_now(now, actions),
        }
    }

    /// Receiver dates read since the schedule was set can bring the next
    /// activation forward, so nobody starts without a key.
    fn reschedule(&mut self, now: DateTime<Utc>, actions: &mut Vec<DistributorAction>) {
        let Some(boundary) = self.next_boundary(now) else {
            return;
        };
        let planned = self
            .activation_time
            .filter(|at| *at > now && self.next_deadline.is_some());
        match planned {
            Some(at) if boundary >= at => return,
            None if self.registry_read().active().is_none() => return,
            _ => {}
        }

        tracing::info!(activation = %boundary, "receiver dates moved the next rotation forward");
        self.activation_time = Some(boundary);
        let wait = boundary - now - self.settings.start_window();
        self.arm(now, wait, actions);
    }

    // -----------------------------------------------------------------------
    // Timer
    // -----------------------------------------------------------------------

    fn on_timer(&mut self, now: DateTime<Utc>, actions: &mut Vec<DistributorAction>) {
        self.next_deadline = None;
        let activation = *self.activation_time.get_or_insert(now);

        if self.rollout.is_none() {
            self.mint(now, activation);
        }

        let remaining = activation - now;
        let end_window = self.settings.end_window();
        let flush = remaining <= end_window;

        let batch: Vec<ReceiverDescriptor> = match self.rollout.as_mut() {
            Some(rollout) if flush => std::mem::take(&mut rollout.unsent).into_values().collect(),
            Some(rollout) => rollout.unsent.pop_first().map(|(_, r)| r).into_iter().collect(),
            None => return,
        };
        self.send(now, batch, actions);

        let wait = if flush {
            if remaining > TimeDelta::zero() {
                Some(remaining)
            } else {
                self.promote(now)
                    .map(|next| next - now - self.settings.start_window())
            }
        } else {
            let left = self.rollout.as_ref().map_or(0, |r| r.unsent.len());
            match i32::try_from(left) {
                Ok(0) => Some(remaining),
                Ok(left) => Some((remaining - end_window) / left),
                Err(_) => Some(TimeDelta::zero()),
            }
        };

        match wait {
            Some(wait) => self.arm(now, wait, actions),
            None => tracing::info!("no further rotation scheduled"),
        }
    }

    /// Create the key for the coming activation and pick its receivers.
    fn mint(&mut self, now: DateTime<Utc>, activation: DateTime<Utc>) {
        let validity = Validity::new(Some(activation), self.next_boundary(activation));
        let stored = {
            let mut registry = self.registry_write();
            let removed = registry.cleanup(now);
            if removed > 0 {
                tracing::debug!(removed, "expired keys removed");
            }
            registry
                .add(SymmetricKey::generate(now).with_validity(validity))
                .map(|id| registry.get(&id).cloned())
        };
        self.registry_dirty = true;

        match stored {
            Ok(Some(key)) => {
                let unsent = receiver::active_on(&self.receivers, activation);
                tracing::info!(
                    key_id = ?key.id(),
                    receivers = unsent.len(),
                    activation = %activation,
                    "key minted"
                );
                self.record(
                    AuditEvent::new(now, AuditAction::KeyMinted)
                        .with_key(key.id())
                        .with_detail(describe_validity(&validity)),
                );
                self.rollout = Some(Rollout::new(key, ReceiverMap::new(), unsent));
            }
            Ok(None) => tracing::warn!("minted key vanished from the registry"),
            Err(e) => {
                tracing::warn!(error = %e, "could not store minted key");
                self.record(
                    AuditEvent::new(now, AuditAction::KeyMinted)
                        .with_detail(e.to_string())
                        .with_failure(),
                );
            }
        }
    }

    /// Seal and emit the pending key for each receiver. A receiver counts as
    /// sent even when sealing fails; it is not retried for this key.
    fn send(
        &mut self,
        now: DateTime<Utc>,
        batch: Vec<ReceiverDescriptor>,
        actions: &mut Vec<DistributorAction>,
    ) {
        let Some(rollout) = self.rollout.as_mut() else {
            return;
        };
        let key_id = rollout.key.id();
        let mut outcomes = Vec::with_capacity(batch.len());
        for receiver in batch {
            let sealed = rollout.seal_for(&self.identity, &receiver);
            rollout.sent.insert(receiver.id, receiver.clone());
            outcomes.push((receiver, sealed));
        }

        for (receiver, sealed) in outcomes {
            match sealed {
                Ok(envelope) => {
                    tracing::debug!(receiver = %receiver.id, key_id = ?key_id, "key sent");
                    self.record(
                        AuditEvent::new(now, AuditAction::KeySent)
                            .with_key(key_id)
                            .with_receiver(&receiver.id),
                    );
                    actions.push(DistributorAction::SendKey {
                        receiver: receiver.id,
                        envelope,
                    });
                }
                Err(e) => {
                    tracing::warn!(receiver = %receiver.id, error = %e, "could not seal key");
                    self.record(
                        AuditEvent::new(
                            now,
                            AuditAction::KeySendFailed {
                                reason: e.to_string(),
                            },
                        )
                        .with_key(key_id)
                        .with_receiver(&receiver.id)
                        .with_failure(),
                    );
                }
            }
        }
    }

    /// Make the pending key active. Returns the next activation time, if any.
    fn promote(&mut self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let rollout = self.rollout.take()?;
        let key = rollout.key;
        if key.is_expired_at(now) {
            tracing::warn!(
                key_id = ?key.id(),
                end = ?key.end_date(),
                "pending key expired before activation"
            );
            self.record(
                AuditEvent::new(now, AuditAction::KeyActivated)
                    .with_key(key.id())
                    .with_detail("expired before activation")
                    .with_failure(),
            );
            if let Some(id) = key.id() {
                self.registry_write().remove(&id);
                self.registry_dirty = true;
            }
            // a fresh key goes out right away
            self.activation_time = Some(now);
            return Some(now);
        }

        let activated = self.registry_write().set_active(&key);
        self.registry_dirty = true;
        match activated {
            Ok(()) => {
                tracing::info!(key_id = ?key.id(), "key activated");
                self.record(AuditEvent::new(now, AuditAction::KeyActivated).with_key(key.id()));
            }
            Err(e) => {
                tracing::warn!(key_id = ?key.id(), error = %e, "could not activate key");
                self.record(
                    AuditEvent::new(now, AuditAction::KeyActivated)
                        .with_key(key.id())
                        .with_detail(e.to_string())
                        .with_failure(),
                );
            }
        }

        let boundary = self.next_boundary(now);
        let key_end = key.end_date().filter(|end| *end > now);
        let next = match (boundary, key_end) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        };
        if let Some(next) = next {
            self.activation_time = Some(next);
        }
        next
    }

    /// Earliest of `from + interval` and any receiver date after `from`.
    fn next_boundary(&self, from: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let by_interval = self
            .settings
            .rotation_interval()
            .and_then(|interval| from.checked_add_signed(interval));
        self.receivers
            .values()
            .flat_map(|r| [r.validity.start, r.validity.end])
            .flatten()
            .filter(|date| *date > from)
            .chain(by_interval)
            .min()
    }

    fn rotate_now(&mut self, now: DateTime<Utc>, actions: &mut Vec<DistributorAction>) {
        self.activation_time = Some(now);
        self.arm(now, TimeDelta::zero(), actions);
    }

    /// Drop the pending key. It leaves the registry unless it is the active one.
    fn abandon_rollout(&mut self, now: DateTime<Utc>) {
        let Some(rollout) = self.rollout.take() else {
            return;
        };
        let key_id = rollout.key.id();
        if let Some(id) = key_id {
            let mut registry = self.registry_write();
            if registry.active_id() != Some(id) {
                registry.remove(&id);
                drop(registry);
                self.registry_dirty = true;
            }
        }
        self.record(AuditEvent::new(now, AuditAction::RolloutAbandoned).with_key(key_id));
    }

    fn arm(&mut self, now: DateTime<Utc>, wait: TimeDelta, actions: &mut Vec<DistributorAction>) {
        let wait = wait.max(TimeDelta::zero());
        let deadline = now
            .checked_add_signed(wait)
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        tracing::debug!(wait_ms = wait.num_milliseconds(), "timer armed");
        self.next_deadline = Some(deadline);
        actions.push(DistributorAction::ArmTimer { deadline, wait });
    }

    // -----------------------------------------------------------------------
    // Introspection
    // -----------------------------------------------------------------------

    pub fn settings(&self) -> DistributorConfig {
        self.settings
    }

    pub fn is_started(&self) -> bool {
        self.started
    }

    pub fn receivers(&self) -> &ReceiverMap {
        &self.receivers
    }

    /// Receivers active when the membership file was last read.
    pub fn active_receivers(&self) -> &ReceiverMap {
        &self.active_receivers
    }

    pub fn active_receivers_on(&self, at: DateTime<Utc>) -> ReceiverMap {
        receiver::active_on(&self.receivers, at)
    }

    pub fn pending_key(&self) -> Option<&SymmetricKey> {
        self.rollout.as_ref().map(|r| &r.key)
    }

    pub fn pending_sent(&self) -> Vec<Fingerprint> {
        self.rollout
            .as_ref()
            .map(|r| r.sent.keys().copied().collect())
            .unwrap_or_default()
    }

    pub fn pending_unsent(&self) -> Vec<Fingerprint> {
        self.rollout
            .as_ref()
            .map(|r| r.unsent.keys().copied().collect())
            .unwrap_or_default()
    }

    pub fn activation_time(&self) -> Option<DateTime<Utc>> {
        self.activation_time
    }

    pub fn next_deadline(&self) -> Option<DateTime<Utc>> {
        self.next_deadline
    }

    pub fn active_key(&self) -> Option<SymmetricKey> {
        self.registry_read().active().cloned()
    }

    pub fn registry(&self) -> &SharedRegistry {
        &self.registry
    }

    // -----------------------------------------------------------------------
    // Helpers
    // -----------------------------------------------------------------------

    fn record(&self, event: AuditEvent) {
        self.audit.record(event);
    }

    fn registry_read(&self) -> RwLockReadGuard<'_, KeyRegistry> {
        self.registry.read().unwrap_or_else(|e| e.into_inner())
    }

    fn registry_write(&self) -> RwLockWriteGuard<'_, KeyRegistry> {
        self.registry.write().unwrap_or_else(|e| e.into_inner())
    }
}

fn describe_validity(validity: &Validity) -> String {
    let bound = |date: Option<DateTime<Utc>>| date.map_or_else(|| "-".to_string(), |d| d.to_rfc3339());
    format!("[{}, {})", bound(validity.start), bound(validity.end))
}
