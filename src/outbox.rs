//! Transactional outbox: at-least-once delivery of post-commit side effects.
//!
//! Messages are appended next to the mutation that caused them and delivered later by a single
//! polling loop. Each cycle:
//!
//! 1. fetches up to `batch_size` undelivered messages with `attempts < max_retries`, oldest first
//! 2. dispatches them one at a time to the handler registered for their topic
//! 3. marks successes delivered and bumps `attempts` on failures
//! 4. deletes delivered messages older than the retention window
//!
//! A message that runs out of attempts stays in the store as dead-lettered until an operator
//! re-arms it with [`OutboxDispatcher::retry_failed_message`].

use crate::clock::{to_chrono, Clock, SystemClock};
use crate::error::StoreError;
use crate::handlers::{HandlerError, HandlerRegistry};
use crate::sleeper::{Sleeper, TokioSleeper};
use crate::store::{OutboxMessage, OutboxStats, OutboxStore};
use futures::FutureExt;
use serde::Serialize;
use serde_json::Value;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Dispatcher tunables.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DispatcherConfig {
    /// Pause between cycles.
    pub interval: Duration,
    /// Attempts before a message is dead-lettered.
    pub max_retries: u32,
    pub batch_size: usize,
    /// How long delivered messages are kept.
    pub retention: Duration,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(5),
            max_retries: 5,
            batch_size: 50,
            retention: Duration::from_secs(24 * 60 * 60),
        }
    }
}

/// What one poll cycle did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CycleReport {
    pub fetched: usize,
    pub delivered: usize,
    pub failed: usize,
    pub purged: usize,
}

#[derive(Debug)]
struct Shared {
    store: Arc<dyn OutboxStore>,
    handlers: HandlerRegistry,
    clock: Arc<dyn Clock>,
    sleeper: Arc<dyn Sleeper>,
    config: DispatcherConfig,
}

#[derive(Debug)]
struct Worker {
    stop: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

/// Polling outbox dispatcher with an explicit start/stop lifecycle.
#[derive(Debug)]
pub struct OutboxDispatcher {
    shared: Arc<Shared>,
    worker: Mutex<Option<Worker>>,
}

impl OutboxDispatcher {
    pub fn new(store: Arc<dyn OutboxStore>, handlers: HandlerRegistry) -> Self {
        Self::with_config(store, handlers, DispatcherConfig::default())
    }

    pub fn with_config(
        store: Arc<dyn OutboxStore>,
        handlers: HandlerRegistry,
        config: DispatcherConfig,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                store,
                handlers,
                clock: Arc::new(SystemClock),
                sleeper: Arc::new(TokioSleeper),
                config,
            }),
            worker: Mutex::new(None),
        }
    }

    /// Replace the clock. Only effective before the first `start`.
    pub fn with_clock(self, clock: Arc<dyn Clock>) -> Self {
        self.map_shared(|s| s.clock = clock)
    }

    /// Replace the sleeper used between cycles. Only effective before the first `start`.
    pub fn with_sleeper(self, sleeper: Arc<dyn Sleeper>) -> Self {
        self.map_shared(|s| s.sleeper = sleeper)
    }

    fn map_shared(mut self, f: impl FnOnce(&mut Shared)) -> Self {
        if let Some(shared) = Arc::get_mut(&mut self.shared) {
            f(shared);
        }
        self
    }

    pub fn config(&self) -> &DispatcherConfig {
        &self.shared.config
    }

    fn worker(&self) -> MutexGuard<'_, Option<Worker>> {
        self.worker.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Spawn the polling loop on the current tokio runtime.
    ///
    /// Returns `false` without side effects when already running or when called outside a
    /// runtime.
    pub fn start(&self) -> bool {
        let mut worker = self.worker();
        if worker.as_ref().is_some_and(|w| !w.handle.is_finished()) {
            tracing::debug!(target: "bulwark::outbox", "dispatcher already running");
            return false;
        }
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            tracing::error!(target: "bulwark::outbox", "dispatcher start requires a tokio runtime");
            return false;
        };

        let (stop, stop_rx) = watch::channel(false);
        let shared = self.shared.clone();
        let handle = runtime.spawn(shared.run_loop(stop_rx));
        *worker = Some(Worker { stop, handle });
        tracing::info!(
            target: "bulwark::outbox",
            interval_ms = self.shared.config.interval.as_millis() as u64,
            "outbox dispatcher started"
        );
        true
    }

    /// Signal the loop to stop and wait for the in-progress cycle, if any, to finish.
    ///
    /// Returns `false` when the dispatcher was not running.
    pub async fn stop(&self) -> bool {
        let Some(worker) = self.worker().take() else {
            return false;
        };
        let _ = worker.stop.send(true);
        if let Err(err) = worker.handle.await {
            tracing::error!(target: "bulwark::outbox", error = %err, "dispatcher task ended abnormally");
        }
        tracing::info!(target: "bulwark::outbox", "outbox dispatcher stopped");
        true
    }

    pub fn is_running(&self) -> bool {
        self.worker().as_ref().is_some_and(|w| !w.handle.is_finished())
    }

    /// Run exactly one poll cycle.
    pub async fn run_cycle(&self) -> Result<CycleReport, StoreError> {
        self.shared.run_cycle().await
    }

    /// Append a new message for the next cycle.
    pub async fn enqueue(&self, topic: &str, payload: Value) -> Result<OutboxMessage, StoreError> {
        let message = OutboxMessage::new(topic, payload, self.shared.clock.now());
        self.shared.store.append(message.clone()).await?;
        tracing::debug!(target: "bulwark::outbox", id = %message.id, topic, "message enqueued");
        Ok(message)
    }

    /// Dead-lettered messages, oldest first.
    pub async fn get_failed_messages(&self) -> Result<Vec<OutboxMessage>, StoreError> {
        self.shared.store.dead_lettered(self.shared.config.max_retries).await
    }

    /// Reset a message's attempts so the next cycle picks it up again.
    ///
    /// Returns `false` if no undelivered message has this id.
    pub async fn retry_failed_message(&self, id: &str) -> Result<bool, StoreError> {
        let reset = self.shared.store.reset_attempts(id).await?;
        if reset {
            tracing::info!(target: "bulwark::outbox", id, "message re-armed for delivery");
        } else {
            tracing::warn!(target: "bulwark::outbox", id, "no undelivered message to re-arm");
        }
        Ok(reset)
    }

    pub async fn stats(&self) -> Result<OutboxStats, StoreError> {
        self.shared.store.outbox_stats(self.shared.config.max_retries).await
    }
}

impl Drop for OutboxDispatcher {
    fn drop(&mut self) {
        if let Some(worker) = self.worker().take() {
            let _ = worker.stop.send(true);
        }
    }
}

impl Shared {
    async fn run_loop(self: Arc<Self>, mut stop: watch::Receiver<bool>) {
        loop {
            let stopped = *stop.borrow();
            if stopped {
                break;
            }
            if let Err(err) = self.run_cycle().await {
                tracing::error!(target: "bulwark::outbox", error = %err, "outbox cycle failed");
            }
            tokio::select! {
                _ = self.sleeper.sleep(self.config.interval) => {}
                changed = stop.changed() => {
                    let stopped = changed.is_err() || *stop.borrow();
                    if stopped {
                        break;
                    }
                }
            }
        }
    }

    async fn run_cycle(&self) -> Result<CycleReport, StoreError> {
        let messages = self
            .store
            .fetch_pending(self.config.max_retries, self.config.batch_size)
            .await?;
        let mut report = CycleReport { fetched: messages.len(), ..CycleReport::default() };
        if !messages.is_empty() {
            tracing::debug!(target: "bulwark::outbox", count = messages.len(), "processing outbox messages");
        }

        for message in &messages {
            match self.dispatch(message).await {
                Ok(()) => match self.store.mark_delivered(&message.id, self.clock.now()).await {
                    Ok(()) => {
                        report.delivered += 1;
                        tracing::debug!(target: "bulwark::outbox", id = %message.id, topic = %message.topic, "message delivered");
                    }
                    Err(err) => {
                        report.failed += 1;
                        tracing::error!(target: "bulwark::outbox", id = %message.id, error = %err, "failed to mark message delivered");
                    }
                },
                Err(reason) => {
                    report.failed += 1;
                    self.record_failure(message, &reason).await;
                }
            }
        }

        report.purged = self.purge_delivered().await;
        Ok(report)
    }

    async fn dispatch(&self, message: &OutboxMessage) -> Result<(), String> {
        let Some(handler) = self.handlers.get(&message.topic) else {
            return Err(format!("unknown topic '{}'", message.topic));
        };
        let outcome = AssertUnwindSafe(handler.handle(message))
            .catch_unwind()
            .await
            .unwrap_or_else(|panic| Err(HandlerError::Panicked(panic_message(panic.as_ref()))));
        match outcome {
            Ok(true) => Ok(()),
            Ok(false) => Err("handler reported failure".to_string()),
            Err(err) => Err(err.to_string()),
        }
    }

    async fn record_failure(&self, message: &OutboxMessage, reason: &str) {
        match self.store.increment_attempts(&message.id).await {
            Ok(attempts) if attempts >= self.config.max_retries => {
                tracing::error!(
                    target: "bulwark::outbox",
                    id = %message.id,
                    topic = %message.topic,
                    attempts,
                    reason,
                    "message dead-lettered"
                );
            }
            Ok(attempts) => {
                tracing::warn!(
                    target: "bulwark::outbox",
                    id = %message.id,
                    topic = %message.topic,
                    attempts,
                    reason,
                    "message delivery failed"
                );
            }
            Err(err) => {
                tracing::error!(target: "bulwark::outbox", id = %message.id, error = %err, "failed to record delivery attempt");
            }
        }
    }

    async fn purge_delivered(&self) -> usize {
        let cutoff = self.clock.now() - to_chrono(self.config.retention);
        match self.store.purge_delivered_before(cutoff).await {
            Ok(purged) => {
                if purged > 0 {
                    tracing::debug!(target: "bulwark::outbox", purged, "old delivered messages purged");
                }
                purged
            }
            Err(err) => {
                tracing::warn!(target: "bulwark::outbox", error = %err, "outbox purge failed");
                0
            }
        }
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
