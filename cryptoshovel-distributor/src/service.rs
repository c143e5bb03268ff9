//! Async driver for [`KeyDistributor`].
//!
//! One task owns the distributor and `select!`s over the armed timer,
//! membership content from the watcher and a shutdown signal. Each event
//! becomes a single `tick`; the resulting actions are carried out before
//! the next event is looked at, so the state machine is never re-entered.
//!
//! Envelope delivery and registry writes are queued to a second task that
//! runs them in order on the blocking pool. The scheduling loop never waits
//! on the transport or the disk.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use cryptoshovel_envelope::{Fingerprint, KeyRegistry};

use crate::audit::{AuditAction, AuditEvent, AuditSink};
use crate::clock::Clock;
use crate::distributor::{DistributorAction, KeyDistributor, Trigger};
use crate::transport::KeyTransport;

/// Handle to a running [`DistributorService`].
pub struct ServiceHandle {
    shutdown: oneshot::Sender<()>,
    task: JoinHandle<KeyDistributor>,
}

impl ServiceHandle {
    /// Stop the service and hand back the distributor once every queued
    /// envelope has been handed to the transport.
    ///
    /// Returns `None` if the service task panicked.
    pub async fn stop(self) -> Option<KeyDistributor> {
        // The task may already be gone; the join below reports that.
        let _ = self.shutdown.send(());
        match self.task.await {
            Ok(distributor) => Some(distributor),
            Err(e) => {
                tracing::error!(error = %e, "distributor task failed");
                None
            }
        }
    }
}

pub struct DistributorService<C: Clock> {
    distributor: KeyDistributor,
    transport: Arc<dyn KeyTransport>,
    audit: Arc<dyn AuditSink>,
    clock: C,
}

impl<C: Clock + 'static> DistributorService<C> {
    pub fn new(
        distributor: KeyDistributor,
        transport: Arc<dyn KeyTransport>,
        audit: Arc<dyn AuditSink>,
        clock: C,
    ) -> Self {
        Self {
            distributor,
            transport,
            audit,
            clock,
        }
    }

    /// Run on the current tokio runtime until [`ServiceHandle::stop`].
    pub fn spawn(self, changes: mpsc::Receiver<String>) -> ServiceHandle {
        let (shutdown, shutdown_rx) = oneshot::channel();
        let task = tokio::spawn(self.run(changes, shutdown_rx));
        ServiceHandle { shutdown, task }
    }

    async fn run(
        mut self,
        mut changes: mpsc::Receiver<String>,
        mut shutdown: oneshot::Receiver<()>,
    ) -> KeyDistributor {
        let (outbound, jobs) = mpsc::unbounded_channel();
        let worker = tokio::spawn(run_outbound(
            jobs,
            self.transport.clone(),
            self.audit.clone(),
        ));

        let mut deadline: Option<Instant> = None;
        self.handle(Trigger::Start, &mut deadline, &outbound);

        loop {
            let timer = async move {
                match deadline {
                    Some(at) => tokio::time::sleep_until(at).await,
                    None => std::future::pending().await,
                }
            };

            tokio::select! {
                _ = &mut shutdown => break,
                Some(content) = changes.recv() => {
                    self.handle(Trigger::MembershipChanged(content), &mut deadline, &outbound);
                }
                _ = timer => {
                    deadline = None;
                    self.handle(Trigger::Timer, &mut deadline, &outbound);
                }
            }
        }

        self.handle(Trigger::Stop, &mut deadline, &outbound);
        drop(outbound);
        if let Err(e) = worker.await {
            tracing::error!(error = %e, "outbound task failed");
        }
        self.distributor
    }

    fn handle(
        &mut self,
        trigger: Trigger,
        deadline: &mut Option<Instant>,
        outbound: &mpsc::UnboundedSender<Job>,
    ) {
        let now = self.clock.now();
        for action in self.distributor.tick(now, trigger) {
            let job = match action {
                DistributorAction::SendKey { receiver, envelope } => Job::Deliver {
                    at: now,
                    receiver,
                    envelope,
                },
                DistributorAction::PersistRegistry => match self.snapshot() {
                    Some(registry) => Job::Persist(registry),
                    None => continue,
                },
                DistributorAction::ArmTimer { wait, .. } => {
                    *deadline = Some(Instant::now() + wait.to_std().unwrap_or_default());
                    continue;
                }
                DistributorAction::CancelTimer => {
                    *deadline = None;
                    continue;
                }
            };
            if outbound.send(job).is_err() {
                tracing::error!("outbound task is gone, dropping job");
            }
        }
    }

    /// A copy of the registry to write, if it has a store at all.
    fn snapshot(&self) -> Option<KeyRegistry> {
        let registry = self
            .distributor
            .registry()
            .read()
            .unwrap_or_else(|e| e.into_inner());
        registry.store_path()?;
        Some(registry.clone())
    }
}

// ---------------------------------------------------------------------------
// Outbound work
// ---------------------------------------------------------------------------

enum Job {
    Deliver {
        at: DateTime<Utc>,
        receiver: Fingerprint,
        envelope: Vec<u8>,
    },
    Persist(KeyRegistry),
}

impl Job {
    fn run(self, transport: &dyn KeyTransport, audit: &dyn AuditSink) {
        match self {
            Job::Deliver {
                at,
                receiver,
                envelope,
            } => {
                if let Err(e) = transport.deliver(&receiver, &envelope) {
                    delivery_failed(audit, at, &receiver, e.to_string());
                }
            }
            Job::Persist(registry) => {
                if let Err(e) = registry.persist() {
                    tracing::warn!(error = %e, "could not persist key registry");
                }
            }
        }
    }
}

/// Runs jobs one at a time, in the order the scheduler produced them.
async fn run_outbound(
    mut jobs: mpsc::UnboundedReceiver<Job>,
    transport: Arc<dyn KeyTransport>,
    audit: Arc<dyn AuditSink>,
) {
    while let Some(job) = jobs.recv().await {
        let transport = transport.clone();
        let audit = audit.clone();
        let done =
            tokio::task::spawn_blocking(move || job.run(transport.as_ref(), audit.as_ref())).await;
        if let Err(e) = done {
            tracing::error!(error = %e, "outbound job panicked");
        }
    }
}

fn delivery_failed(
    audit: &dyn AuditSink,
    at: DateTime<Utc>,
    receiver: &Fingerprint,
    reason: String,
) {
    tracing::warn!(receiver = %receiver, error = %reason, "key delivery failed");
    audit.record(
        AuditEvent::new(at, AuditAction::KeySendFailed { reason })
            .with_receiver(receiver)
            .with_failure(),
    );
}
