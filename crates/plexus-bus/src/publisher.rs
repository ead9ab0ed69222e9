//! Publisher and delivery worker
//!
//! Published messages enter a bounded queue drained by a single worker
//! thread. One worker means messages from a given publisher reach every
//! subscriber in publication order. Delivery is at-most-once: a message
//! whose deadline passed while queued is dropped, and failed handlers are
//! never retried.

use crate::message::{DeliveryMode, Message};
use crate::router::MessageRouter;
use crate::stats::BusStatistics;
use parking_lot::Mutex;
use plexus_core::{PluginError, Result};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc as std_mpsc, Arc};
use std::thread::{JoinHandle, ThreadId};
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

/// Publisher tunables
#[derive(Debug, Clone, Copy)]
pub struct PublisherConfig {
    /// Queue capacity
    pub max_queue_size: usize,
    /// Time a message may wait in the queue
    pub delivery_timeout: Duration,
}

/// One subscription that failed to handle a message
#[derive(Debug, Clone, Serialize)]
pub struct DeliveryFailure {
    /// Subscription id
    pub subscription_id: Uuid,
    /// Subscriber plugin id
    pub subscriber: String,
    /// What went wrong
    pub error: PluginError,
}

/// Outcome of delivering one message
#[derive(Debug, Clone, Serialize)]
pub struct DeliveryReport {
    /// Message id
    pub message_id: Uuid,
    /// Handlers that completed successfully
    pub delivered: usize,
    /// Handlers that failed
    pub failures: Vec<DeliveryFailure>,
}

impl DeliveryReport {
    /// Whether every routed handler succeeded
    pub fn is_complete(&self) -> bool {
        self.failures.is_empty()
    }
}

enum Ack {
    None,
    Async(oneshot::Sender<Result<DeliveryReport>>),
    Blocking(std_mpsc::SyncSender<Result<DeliveryReport>>),
}

impl Ack {
    fn send(self, outcome: Result<DeliveryReport>) {
        // the caller may have stopped waiting
        match self {
            Ack::None => {}
            Ack::Async(tx) => {
                let _ = tx.send(outcome);
            }
            Ack::Blocking(tx) => {
                let _ = tx.try_send(outcome);
            }
        }
    }
}

struct Envelope {
    message: Message,
    mode: DeliveryMode,
    recipients: Vec<String>,
    enqueued_at: Instant,
    deadline: Instant,
    ack: Ack,
}

/// Accepts messages and hands them to the delivery worker
pub struct Publisher {
    config: PublisherConfig,
    sender: Mutex<Option<mpsc::Sender<Envelope>>>,
    accepting: AtomicBool,
    worker: Mutex<Option<JoinHandle<()>>>,
    worker_id: ThreadId,
    stats: Arc<BusStatistics>,
}

impl std::fmt::Debug for Publisher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Publisher")
            .field("config", &self.config)
            .field("accepting", &self.is_accepting())
            .finish()
    }
}

impl Publisher {
    /// Start a publisher and its delivery worker
    pub fn new(config: PublisherConfig, router: MessageRouter, stats: Arc<BusStatistics>) -> Result<Self> {
        if config.max_queue_size == 0 {
            return Err(PluginError::invalid_configuration("Publisher queue size must be > 0"));
        }

        let (tx, rx) = mpsc::channel(config.max_queue_size);
        let worker_stats = Arc::clone(&stats);
        let worker = std::thread::Builder::new()
            .name("plexus-bus-delivery".into())
            .spawn(move || delivery_loop(rx, router, worker_stats))
            .map_err(|e| PluginError::threading(format!("Failed to start delivery worker: {e}")))?;
        let worker_id = worker.thread().id();

        debug!(
            max_queue_size = config.max_queue_size,
            delivery_timeout = ?config.delivery_timeout,
            "Publisher started"
        );

        Ok(Self {
            config,
            sender: Mutex::new(Some(tx)),
            accepting: AtomicBool::new(true),
            worker: Mutex::new(Some(worker)),
            worker_id,
            stats,
        })
    }

    /// Whether new messages are accepted
    pub fn is_accepting(&self) -> bool {
        self.accepting.load(Ordering::Acquire)
    }

    fn enqueue(
        &self,
        message: Message,
        mode: DeliveryMode,
        recipients: Vec<String>,
        ack: Ack,
    ) -> Result<(Uuid, Instant)> {
        message.validate()?;
        mode.validate_recipients(&recipients)?;

        if !self.is_accepting() {
            return Err(PluginError::invalid_state("Publisher is shut down"));
        }
        let sender = self
            .sender
            .lock()
            .clone()
            .ok_or_else(|| PluginError::invalid_state("Publisher is shut down"))?;

        let id = message.id;
        let now = Instant::now();
        let deadline = now + self.config.delivery_timeout;
        let envelope = Envelope {
            message,
            mode,
            recipients,
            enqueued_at: now,
            deadline,
            ack,
        };

        match sender.try_send(envelope) {
            Ok(()) => {
                self.stats.record_published();
                trace!(message = %id, mode = %mode, "Message queued");
                Ok((id, deadline))
            }
            Err(mpsc::error::TrySendError::Full(_)) => {
                self.stats.record_dropped();
                warn!(message = %id, capacity = self.config.max_queue_size, "Publisher queue full");
                Err(PluginError::resource_exhausted(format!(
                    "Publisher queue full ({} messages)",
                    self.config.max_queue_size
                )))
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                Err(PluginError::invalid_state("Publisher is shut down"))
            }
        }
    }

    /// Queue a message without waiting for delivery
    pub fn publish(&self, message: Message, mode: DeliveryMode, recipients: Vec<String>) -> Result<Uuid> {
        self.enqueue(message, mode, recipients, Ack::None).map(|(id, _)| id)
    }

    /// Queue a message and wait until it is delivered or its deadline passes
    pub async fn publish_async(
        &self,
        message: Message,
        mode: DeliveryMode,
        recipients: Vec<String>,
    ) -> Result<DeliveryReport> {
        let (tx, rx) = oneshot::channel();
        let (id, deadline) = self.enqueue(message, mode, recipients, Ack::Async(tx))?;

        match tokio::time::timeout_at(deadline.into(), rx).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => Err(PluginError::cancelled(format!(
                "Message {id} was discarded during shutdown"
            ))),
            Err(_) => Err(PluginError::timeout(format!(
                "Message {id} was not delivered within {:?}",
                self.config.delivery_timeout
            ))),
        }
    }

    /// Blocking form of [`publish_async`](Self::publish_async).
    ///
    /// Must not be called from inside a message handler; the worker would be
    /// waiting on itself until the deadline.
    pub fn publish_blocking(
        &self,
        message: Message,
        mode: DeliveryMode,
        recipients: Vec<String>,
    ) -> Result<DeliveryReport> {
        let (tx, rx) = std_mpsc::sync_channel(1);
        let (id, deadline) = self.enqueue(message, mode, recipients, Ack::Blocking(tx))?;

        match rx.recv_timeout(deadline.saturating_duration_since(Instant::now())) {
            Ok(outcome) => outcome,
            Err(std_mpsc::RecvTimeoutError::Timeout) => Err(PluginError::timeout(format!(
                "Message {id} was not delivered within {:?}",
                self.config.delivery_timeout
            ))),
            Err(std_mpsc::RecvTimeoutError::Disconnected) => Err(PluginError::cancelled(format!(
                "Message {id} was discarded during shutdown"
            ))),
        }
    }

    /// Stop accepting, drain what is queued, and join the worker. Idempotent.
    pub fn shutdown(&self) {
        self.accepting.store(false, Ordering::Release);
        let sender = self.sender.lock().take();
        if sender.is_none() {
            return;
        }
        drop(sender);

        let worker = self.worker.lock().take();
        if let Some(worker) = worker {
            if std::thread::current().id() == self.worker_id {
                // called from a handler; the loop ends once the queue drains
                return;
            }
            if worker.join().is_err() {
                warn!("Delivery worker terminated abnormally");
            }
        }
        info!("Publisher shut down");
    }
}

impl Drop for Publisher {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn delivery_loop(mut rx: mpsc::Receiver<Envelope>, router: MessageRouter, stats: Arc<BusStatistics>) {
    while let Some(envelope) = rx.blocking_recv() {
        deliver(envelope, &router, &stats);
    }
    debug!("Delivery worker exiting");
}

fn deliver(envelope: Envelope, router: &MessageRouter, stats: &BusStatistics) {
    let Envelope {
        message,
        mode,
        recipients,
        enqueued_at,
        deadline,
        ack,
    } = envelope;

    if Instant::now() >= deadline {
        stats.record_timeout();
        debug!(message = %message.id, message_type = %message.message_type, "Message expired in queue");
        ack.send(Err(PluginError::timeout(format!(
            "Message {} expired before delivery",
            message.id
        ))));
        return;
    }

    let targets = router.route(&message, mode, &recipients);
    let mut report = DeliveryReport {
        message_id: message.id,
        delivered: 0,
        failures: Vec::new(),
    };

    for sub in targets {
        match sub.deliver(&message) {
            Ok(()) => {
                report.delivered += 1;
                stats.record_delivery(enqueued_at.elapsed());
            }
            Err(error) => {
                stats.record_failure();
                warn!(
                    subscription = %sub.id(),
                    subscriber = %sub.subscriber(),
                    message_type = %message.message_type,
                    error = %error,
                    "Message delivery failed"
                );
                report.failures.push(DeliveryFailure {
                    subscription_id: sub.id(),
                    subscriber: sub.subscriber().to_string(),
                    error,
                });
            }
        }
    }

    trace!(
        message = %message.id,
        delivered = report.delivered,
        failed = report.failures.len(),
        "Message delivered"
    );
    ack.send(Ok(report));
}
