// src/tx.rs
//
// Periodic transmit scheduler. Each active saved message owns one tokio
// task driving a fixed-rate interval timer; the registry maps id_key to a
// cancel flag and join handle so deactivation can flush the task before
// returning.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::{interval, Duration, MissedTickBehavior};

use crate::error::{EngineError, EngineResult};
use crate::events::{EngineEvent, EventBus};
use crate::frame::{CanId, MAX_PAYLOAD_LEN};

// ============================================================================
// Types
// ============================================================================

/// A transmit definition the user saved. Owned by the persistence layer;
/// the engine reads it and tracks which are currently active.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SavedTxMessage {
    /// Stable key, unique across renames.
    pub id_key: String,
    pub id: CanId,
    pub payload: Vec<u8>,
    /// Transmit period in ms. 0 means one-shot/manual.
    #[serde(default)]
    pub period_ms: u64,
    #[serde(default)]
    pub name: String,
}

/// Validate a saved message definition.
pub fn validate_message(msg: &SavedTxMessage) -> EngineResult<()> {
    if msg.payload.len() > MAX_PAYLOAD_LEN {
        return Err(EngineError::InvalidMessage(format!(
            "'{}' payload exceeds {} bytes",
            msg.name, MAX_PAYLOAD_LEN
        )));
    }
    Ok(())
}

/// Outbound path a job fires into. Implemented by the session controller,
/// which gates on connection state and writes the TX log lines.
#[async_trait]
pub trait TxSink: Send + Sync {
    async fn job_transmit(&self, id: CanId, payload: &[u8]) -> EngineResult<()>;
}

/// Live periodic-transmission task bound to a saved message.
struct TxJob {
    cancel: Arc<AtomicBool>,
    notify: Arc<Notify>,
    handle: JoinHandle<()>,
}

// ============================================================================
// TxScheduler
// ============================================================================

/// Registry of periodic transmit jobs, at most one per id_key.
pub struct TxScheduler {
    jobs: Mutex<HashMap<String, TxJob>>,
    events: EventBus,
}

impl TxScheduler {
    pub fn new(events: EventBus) -> Self {
        TxScheduler {
            jobs: Mutex::new(HashMap::new()),
            events,
        }
    }

    /// The registry stays usable even if a panic poisoned the lock; the
    /// map itself is always in a consistent state between operations.
    fn jobs(&self) -> std::sync::MutexGuard<'_, HashMap<String, TxJob>> {
        self.jobs.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Start transmitting a saved message.
    ///
    /// Period 0 performs a single immediate transmit and creates no job.
    /// Otherwise the first fire lands at now+period and the timer re-arms
    /// at the original rate; ticks missed under load are collapsed rather
    /// than burst to catch up.
    pub async fn activate(
        &self,
        msg: &SavedTxMessage,
        sink: Arc<dyn TxSink>,
    ) -> EngineResult<()> {
        validate_message(msg)?;

        if msg.period_ms == 0 {
            return sink.job_transmit(msg.id, &msg.payload).await;
        }

        let cancel = Arc::new(AtomicBool::new(false));
        let notify = Arc::new(Notify::new());

        {
            let mut jobs = self.jobs();
            if jobs.contains_key(&msg.id_key) {
                return Err(EngineError::AlreadyActive(msg.id_key.clone()));
            }

            let handle = tokio::spawn(run_job(
                msg.id_key.clone(),
                msg.id,
                msg.payload.clone(),
                msg.period_ms,
                Arc::clone(&cancel),
                Arc::clone(&notify),
                sink,
            ));

            jobs.insert(
                msg.id_key.clone(),
                TxJob {
                    cancel,
                    notify,
                    handle,
                },
            );
        }

        tracing::debug!(id_key = %msg.id_key, period_ms = msg.period_ms, "periodic tx activated");
        self.events.emit(EngineEvent::ActiveTxSetChanged);
        Ok(())
    }

    /// Stop a job and wait for its task to finish. Idempotent: unknown
    /// id_keys are a no-op. After this returns no further fire can be
    /// observed for the id_key.
    pub async fn deactivate(&self, id_key: &str) {
        let job = self.jobs().remove(id_key);

        if let Some(job) = job {
            job.cancel.store(true, Ordering::Relaxed);
            job.notify.notify_one();
            let _ = job.handle.await;
            tracing::debug!(id_key = %id_key, "periodic tx deactivated");
            self.events.emit(EngineEvent::ActiveTxSetChanged);
        }
    }

    /// Cancel every job. The only place jobs are cleared en masse; used on
    /// disconnect, when transmission cannot continue.
    pub async fn cancel_all(&self) {
        let drained: Vec<(String, TxJob)> = self.jobs().drain().collect();

        if drained.is_empty() {
            return;
        }

        for (id_key, job) in drained {
            job.cancel.store(true, Ordering::Relaxed);
            job.notify.notify_one();
            let _ = job.handle.await;
            tracing::debug!(id_key = %id_key, "periodic tx cancelled on disconnect");
        }
        self.events.emit(EngineEvent::ActiveTxSetChanged);
    }

    pub fn is_active(&self, id_key: &str) -> bool {
        self.jobs().contains_key(id_key)
    }

    /// The id_keys with a live job, sorted for stable display.
    pub fn active_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.jobs().keys().cloned().collect();
        ids.sort();
        ids
    }
}

/// Body of one periodic transmit task.
///
/// Transmit failures are the sink's problem to log; the job keeps its
/// schedule and retries at the next tick.
async fn run_job(
    id_key: String,
    id: CanId,
    payload: Vec<u8>,
    period_ms: u64,
    cancel: Arc<AtomicBool>,
    notify: Arc<Notify>,
    sink: Arc<dyn TxSink>,
) {
    let mut ticker = interval(Duration::from_millis(period_ms.max(1)));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    // interval() fires immediately; consume that tick so the first
    // transmit lands at now+period.
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = notify.notified() => break,
            _ = ticker.tick() => {
                if cancel.load(Ordering::Relaxed) {
                    break;
                }
                if let Err(e) = sink.job_transmit(id, &payload).await {
                    tracing::warn!(id_key = %id_key, error = %e, "periodic tx fire failed");
                }
                if cancel.load(Ordering::Relaxed) {
                    break;
                }
            }
        }
    }
}
