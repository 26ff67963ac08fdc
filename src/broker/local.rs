//! In-process broker and its worker.
//!
//! [`InProcessBroker`] is a bounded tokio channel plus a status map keyed by
//! broker job id. [`BrokerWorker`] drains the channel, rebuilds each job
//! through the [`JobRegistry`] and runs it with bounded concurrency.

use super::{BrokerEnqueueRequest, BrokerError, BrokerJobState, BrokerJobStatus, JobBroker};
use crate::clock::{system_clock, SharedClock};
use crate::jobs::{JobRegistry, JobRunOutcome, JobRunner};
use crate::ledger::StatusUpdate;
use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, info, warn};

/// A queued hand-off
#[derive(Debug, Clone)]
pub struct BrokerMessage {
    pub broker_job_id: String,
    pub request: BrokerEnqueueRequest,
}

/// Bounded in-memory queue
pub struct InProcessBroker {
    sender: mpsc::Sender<BrokerMessage>,
    receiver: Mutex<Option<mpsc::Receiver<BrokerMessage>>>,
    statuses: DashMap<String, BrokerJobStatus>,
    capacity: usize,
    closed: AtomicBool,
    clock: SharedClock,
}

impl std::fmt::Debug for InProcessBroker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InProcessBroker")
            .field("capacity", &self.capacity)
            .field("queued", &self.queued_count())
            .field("closed", &self.closed.load(Ordering::Acquire))
            .finish()
    }
}

impl InProcessBroker {
    pub fn new(capacity: usize) -> Self {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        Self {
            sender,
            receiver: Mutex::new(Some(receiver)),
            statuses: DashMap::new(),
            capacity: capacity.max(1),
            closed: AtomicBool::new(false),
            clock: system_clock(),
        }
    }

    pub fn with_clock(mut self, clock: SharedClock) -> Self {
        self.clock = clock;
        self
    }

    /// Stop accepting work; queued messages are still drained
    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            info!("🛑 In-process broker closed");
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn queued_count(&self) -> usize {
        self.statuses
            .iter()
            .filter(|entry| entry.state == BrokerJobState::Queued)
            .count()
    }

    /// The receiving half; can be taken once
    pub fn take_receiver(&self) -> Option<mpsc::Receiver<BrokerMessage>> {
        self.receiver.lock().take()
    }

    fn set_state(&self, broker_job_id: &str, state: BrokerJobState) {
        if let Some(mut status) = self.statuses.get_mut(broker_job_id) {
            status.state = state;
            status.updated_at = self.clock.now();
        }
    }

    /// Move a queued job to running; false if it was cancelled meanwhile
    pub fn mark_running(&self, broker_job_id: &str) -> bool {
        match self.statuses.get_mut(broker_job_id) {
            Some(mut status) if status.state == BrokerJobState::Queued => {
                status.state = BrokerJobState::Running;
                status.updated_at = self.clock.now();
                true
            }
            Some(_) => false,
            None => true,
        }
    }

    pub fn mark_finished(&self, broker_job_id: &str, succeeded: bool) {
        let state = if succeeded {
            BrokerJobState::Finished
        } else {
            BrokerJobState::Failed
        };
        self.set_state(broker_job_id, state);
    }
}

#[async_trait]
impl JobBroker for InProcessBroker {
    async fn enqueue(&self, request: BrokerEnqueueRequest) -> Result<String, BrokerError> {
        if self.is_closed() {
            return Err(BrokerError::unavailable("broker is closed"));
        }

        let broker_job_id = request.job_id.clone();
        if let Some(existing) = self.statuses.get(&broker_job_id) {
            if existing.state.is_live() {
                debug!(broker_job_id = %broker_job_id, state = %existing.state, "Duplicate hand-off ignored");
                return Ok(broker_job_id);
            }
        }

        let now = self.clock.now();
        self.statuses.insert(
            broker_job_id.clone(),
            BrokerJobStatus {
                broker_job_id: broker_job_id.clone(),
                callable_ref: request.callable_ref.clone(),
                state: BrokerJobState::Queued,
                enqueued_at: now,
                updated_at: now,
            },
        );

        let message = BrokerMessage {
            broker_job_id: broker_job_id.clone(),
            request,
        };
        if let Err(e) = self.sender.try_send(message) {
            self.statuses.remove(&broker_job_id);
            return Err(match e {
                mpsc::error::TrySendError::Full(_) => BrokerError::QueueFull {
                    capacity: self.capacity,
                },
                mpsc::error::TrySendError::Closed(_) => {
                    BrokerError::unavailable("worker channel closed")
                }
            });
        }
        Ok(broker_job_id)
    }

    async fn fetch_status(
        &self,
        broker_job_id: &str,
    ) -> Result<Option<BrokerJobStatus>, BrokerError> {
        Ok(self
            .statuses
            .get(broker_job_id)
            .map(|status| status.clone()))
    }

    async fn cancel(&self, broker_job_id: &str) -> Result<bool, BrokerError> {
        let mut status = self
            .statuses
            .get_mut(broker_job_id)
            .ok_or_else(|| BrokerError::not_found(broker_job_id))?;
        if status.state != BrokerJobState::Queued {
            return Ok(false);
        }
        status.state = BrokerJobState::Cancelled;
        status.updated_at = self.clock.now();
        Ok(true)
    }

    async fn is_available(&self) -> bool {
        !self.is_closed() && !self.sender.is_closed() && self.sender.capacity() > 0
    }
}

/// Drains an [`InProcessBroker`] and runs jobs through the [`JobRunner`]
#[derive(Debug, Clone)]
pub struct BrokerWorker {
    broker: Arc<InProcessBroker>,
    registry: Arc<JobRegistry>,
    runner: Arc<JobRunner>,
    concurrency: usize,
}

impl BrokerWorker {
    pub fn new(
        broker: Arc<InProcessBroker>,
        registry: Arc<JobRegistry>,
        runner: Arc<JobRunner>,
        concurrency: usize,
    ) -> Self {
        Self {
            broker,
            registry,
            runner,
            concurrency: concurrency.max(1),
        }
    }

    /// Start the worker loop; it stops when the runner's shutdown signal
    /// fires and waits for in-flight jobs before returning
    pub fn spawn(self) -> Result<JoinHandle<()>, BrokerError> {
        let receiver = self
            .broker
            .take_receiver()
            .ok_or(BrokerError::WorkerAlreadyStarted)?;
        Ok(tokio::spawn(self.run(receiver)))
    }

    async fn run(self, mut receiver: mpsc::Receiver<BrokerMessage>) {
        let semaphore = Arc::new(Semaphore::new(self.concurrency));
        let mut shutdown = self.runner.shutdown_signal();
        let mut in_flight = JoinSet::new();

        info!(concurrency = self.concurrency, "🚀 Broker worker started");

        loop {
            if *shutdown.borrow_and_update() {
                break;
            }
            let message = tokio::select! {
                message = receiver.recv() => message,
                _ = shutdown.changed() => None,
            };
            let Some(message) = message else { break };

            if !self.broker.mark_running(&message.broker_job_id) {
                debug!(broker_job_id = %message.broker_job_id, "Skipping cancelled broker job");
                continue;
            }

            let permit = match semaphore.clone().acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => break,
            };
            let worker = self.clone();
            in_flight.spawn(async move {
                let _permit = permit;
                worker.process(message).await;
            });

            // Reap finished tasks so the set does not grow unbounded
            while in_flight.try_join_next().is_some() {}
        }

        while in_flight.join_next().await.is_some() {}
        info!("🛑 Broker worker stopped");
    }

    async fn process(&self, message: BrokerMessage) {
        let envelope = &message.request.args;
        let job = match self.registry.construct_envelope(envelope) {
            Ok(job) => job,
            Err(e) => {
                error!(
                    broker_job_id = %message.broker_job_id,
                    callable_ref = %message.request.callable_ref,
                    error = %e,
                    "❌ Broker job rejected by registry"
                );
                if let Some(record_id) = envelope.record_id {
                    let update = StatusUpdate::failed(0, e.to_string(), self.broker.clock.now());
                    if let Err(e) = self.runner.ledger().update_status(record_id, update).await {
                        warn!(record_id = %record_id, error = %e, "Failed to mark rejected job as failed");
                    }
                }
                self.broker.mark_finished(&message.broker_job_id, false);
                return;
            }
        };

        let outcome = self
            .runner
            .run_with_record(job.as_ref(), envelope.record_id)
            .await;
        let succeeded = matches!(
            outcome,
            JobRunOutcome::Completed { .. } | JobRunOutcome::Skipped { .. }
        );
        if let JobRunOutcome::Cancelled { .. } = outcome {
            self.broker
                .set_state(&message.broker_job_id, BrokerJobState::Cancelled);
        } else {
            self.broker.mark_finished(&message.broker_job_id, succeeded);
        }
        debug!(
            broker_job_id = %message.broker_job_id,
            status = %outcome.status(),
            "Broker job processed"
        );
    }
}
