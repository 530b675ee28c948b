//! [`RecordStore`] – durable weighing writes that survive store outages.
//!
//! A save writes straight to the repository.  If that fails the weighing is
//! parked in a bounded FIFO retry queue; when the queue is full the oldest
//! entry is dropped (and logged as data loss) to admit the new one.
//!
//! Signals to the rest of the station are edge-triggered:
//!
//! * `database_failed` fires once when the queue grows past `alarm_size`
//!   (capped at `max_retry_queue_size - 1`, so it fires before anything is
//!   evicted).
//! * `database_restored` fires once, after a failure signal, on the first
//!   flush that leaves the queue empty.
//!
//! While a backlog exists, a new save first drains it; if the backlog
//! cannot be drained the new weighing joins the back of the queue.  Store
//! ids therefore follow weighing order and `delete_last` always undoes the
//! latest weighing.
//!
//! A background task retries the queue every `retry_interval`.  After
//! `stop` the store refuses new weighings.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use weighgate_middleware::HandlerRegistry;
use weighgate_types::{Clock, StationError, Weighing};

use crate::repository::{StoreError, WeighingRepository, WeighingSummary};

#[derive(Debug, Clone)]
pub struct RecordStoreConfig {
    pub max_retry_queue_size: usize,
    /// Queue length above which `database_failed` fires.
    pub alarm_size: usize,
    pub retry_interval: Duration,
    pub handler_budget: Duration,
    pub stop_grace: Duration,
}

impl Default for RecordStoreConfig {
    fn default() -> Self {
        Self {
            max_retry_queue_size: 100,
            alarm_size: 50,
            retry_interval: Duration::from_millis(2000),
            handler_budget: Duration::from_secs(1),
            stop_grace: Duration::from_secs(2),
        }
    }
}

/// A weighing waiting for the store to come back.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryEntry {
    pub weight: f64,
    /// When the weighing happened; written as `RecordedAt`.
    pub timestamp: DateTime<Utc>,
    pub enqueued_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SaveOutcome {
    Committed(Weighing),
    Queued { queue_len: usize },
}

/// What [`RecordStore::delete_last`] removed.
#[derive(Debug, Clone, PartialEq)]
pub enum Removed {
    Committed(Weighing),
    Queued(RetryEntry),
}

struct StoreState {
    repo: Box<dyn WeighingRepository>,
    queue: VecDeque<RetryEntry>,
    alarm_raised: bool,
    last_committed_at: Option<DateTime<Utc>>,
}

struct Inner {
    state: Mutex<StoreState>,
    clock: Arc<dyn Clock>,
    config: RecordStoreConfig,
    /// Queue length above which the alarm is raised.
    alarm_at: usize,
    accepting: AtomicBool,
    database_failed: HandlerRegistry<String>,
    database_restored: HandlerRegistry<()>,
}

pub struct RecordStore {
    inner: Arc<Inner>,
    task: Mutex<Option<(watch::Sender<bool>, JoinHandle<()>)>>,
}

impl RecordStore {
    pub fn new(
        repo: Box<dyn WeighingRepository>,
        clock: Arc<dyn Clock>,
        config: RecordStoreConfig,
    ) -> Self {
        let alarm_at = config
            .alarm_size
            .min(config.max_retry_queue_size.saturating_sub(1));
        if alarm_at != config.alarm_size {
            warn!(
                alarm_size = config.alarm_size,
                max_retry_queue_size = config.max_retry_queue_size,
                alarm_at,
                "alarm size lowered below queue capacity"
            );
        }
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(StoreState {
                    repo,
                    queue: VecDeque::new(),
                    alarm_raised: false,
                    last_committed_at: None,
                }),
                clock,
                config,
                alarm_at,
                accepting: AtomicBool::new(true),
                database_failed: HandlerRegistry::new("database_failed"),
                database_restored: HandlerRegistry::new("database_restored"),
            }),
            task: Mutex::new(None),
        }
    }

    /// Spawn the retry-flush task.  Idempotent.
    pub fn start(&self) {
        self.inner.accepting.store(true, Ordering::SeqCst);
        let mut slot = self.task.lock().unwrap_or_else(|p| p.into_inner());
        if slot.as_ref().is_some_and(|(_, h)| !h.is_finished()) {
            return;
        }
        let (tx, rx) = watch::channel(false);
        let inner = Arc::clone(&self.inner);
        *slot = Some((tx, tokio::spawn(async move { inner.flush_loop(rx).await })));
        debug!("record store flush task started");
    }

    /// Stop the flush task.  An in-flight flush gets `stop_grace` to finish.
    pub async fn stop(&self) {
        self.inner.accepting.store(false, Ordering::SeqCst);
        let running = self
            .task
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .take();
        if let Some((tx, mut handle)) = running {
            let _ = tx.send(true);
            if tokio::time::timeout(self.inner.config.stop_grace, &mut handle)
                .await
                .is_err()
            {
                warn!("record store flush task did not stop in time; aborting");
                handle.abort();
            }
        }
        let pending = self.queue_len();
        if pending > 0 {
            warn!(pending, "record store stopped with unflushed weighings");
        }
    }

    /// Write a weighing stamped with the current time, or queue it.
    ///
    /// # Errors
    ///
    /// [`StationError::Persistence`] after [`stop`](Self::stop): the
    /// weighing is neither written nor queued.
    pub async fn save_weighing(&self, weight: f64) -> Result<SaveOutcome, StationError> {
        if !self.inner.accepting.load(Ordering::SeqCst) {
            warn!(weight, "record store stopped; weighing refused");
            return Err(StationError::Persistence(format!(
                "record store stopped; weighing {weight} not accepted"
            )));
        }
        let now = self.inner.clock.now();
        let (outcome, flushed, raise, restored) = {
            let mut guard = self.inner.lock();
            let st = &mut *guard;

            let (flushed, backlog_error) = if st.queue.is_empty() {
                (0, None)
            } else {
                drain(st)
            };
            let written = match backlog_error {
                Some(e) => Err(e),
                None => st.repo.insert(weight, now),
            };

            match written {
                Ok(weighing) => {
                    st.last_committed_at = Some(now);
                    debug!(id = weighing.id, weight, "weighing committed");
                    let restored = std::mem::take(&mut st.alarm_raised);
                    (SaveOutcome::Committed(weighing), flushed, None, restored)
                }
                Err(e) => {
                    warn!(weight, error = %e, "weighing write failed; queued for retry");
                    if st.queue.len() >= self.inner.config.max_retry_queue_size {
                        if let Some(lost) = st.queue.pop_front() {
                            error!(
                                weight = lost.weight,
                                recorded_at = %lost.timestamp,
                                "retry queue full; oldest weighing dropped"
                            );
                        }
                    }
                    st.queue.push_back(RetryEntry {
                        weight,
                        timestamp: now,
                        enqueued_at: now,
                    });
                    let queue_len = st.queue.len();
                    let raise = queue_len > self.inner.alarm_at && !st.alarm_raised;
                    if raise {
                        st.alarm_raised = true;
                    }
                    (
                        SaveOutcome::Queued { queue_len },
                        flushed,
                        raise.then(|| e.to_string()),
                        false,
                    )
                }
            }
        };
        if flushed > 0 {
            info!(flushed, "queued weighings written ahead of the new one");
        }
        if restored {
            info!("database alarm cleared");
            self.inner
                .database_restored
                .dispatch((), self.inner.config.handler_budget)
                .await;
        }
        if let Some(reason) = raise {
            error!(reason = %reason, queue_len = self.queue_len(), "database alarm raised");
            self.inner
                .database_failed
                .dispatch(reason, self.inner.config.handler_budget)
                .await;
        }
        Ok(outcome)
    }

    /// Remove the most recent weighing.  A newer queued entry is taken off
    /// the queue and never reaches the store.
    ///
    /// # Errors
    ///
    /// [`StationError::Persistence`] if the store rejects the delete.
    pub async fn delete_last(&self) -> Result<Option<Removed>, StationError> {
        let mut guard = self.inner.lock();
        let st = &mut *guard;
        let newest_queued = st.queue.back().map(|e| e.timestamp);
        let from_queue = match (newest_queued, st.last_committed_at) {
            (Some(queued), Some(committed)) => queued >= committed,
            (Some(_), None) => true,
            (None, _) => false,
        };
        if from_queue {
            let entry = st.queue.pop_back();
            info!(weight = ?entry.as_ref().map(|e| e.weight), "queued weighing removed");
            return Ok(entry.map(Removed::Queued));
        }

        let removed = st.repo.delete_last()?;
        st.last_committed_at = st
            .repo
            .recent(1)
            .ok()
            .and_then(|rows| rows.first().map(|w| w.recorded_at));
        if let Some(w) = &removed {
            info!(id = w.id, weight = w.weight, "committed weighing removed");
        }
        Ok(removed.map(Removed::Committed))
    }

    /// Drain the queue in FIFO order until it is empty or a write fails.
    /// Returns how many entries were written.
    pub async fn flush_now(&self) -> usize {
        self.inner.flush().await
    }

    pub fn queue_len(&self) -> usize {
        self.inner.lock().queue.len()
    }

    /// Snapshot of the retry queue, oldest first.
    pub fn queued(&self) -> Vec<RetryEntry> {
        self.inner.lock().queue.iter().cloned().collect()
    }

    pub fn is_alarm_raised(&self) -> bool {
        self.inner.lock().alarm_raised
    }

    /// Newest committed weighings first.
    pub fn recent(&self, limit: usize) -> Result<Vec<Weighing>, StationError> {
        Ok(self.inner.lock().repo.recent(limit)?)
    }

    pub fn summary_between(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<WeighingSummary, StationError> {
        Ok(self.inner.lock().repo.summary_between(from, to)?)
    }

    /// Fires once with the last write error when the alarm is raised.
    pub fn database_failed(&self) -> &HandlerRegistry<String> {
        &self.inner.database_failed
    }

    pub fn database_restored(&self) -> &HandlerRegistry<()> {
        &self.inner.database_restored
    }
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, StoreState> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    async fn flush(&self) -> usize {
        let (flushed, restored) = {
            let mut guard = self.lock();
            let st = &mut *guard;
            let (flushed, error) = drain(st);
            if let Some(e) = error {
                debug!(pending = st.queue.len(), error = %e, "flush stopped; store still unavailable");
            }
            let restored = st.queue.is_empty() && st.alarm_raised;
            if restored {
                st.alarm_raised = false;
            }
            (flushed, restored)
        };
        if flushed > 0 {
            info!(flushed, "queued weighings written");
        }
        if restored {
            info!("database alarm cleared");
            self.database_restored
                .dispatch((), self.config.handler_budget)
                .await;
        }
        flushed
    }

    async fn flush_loop(&self, mut shutdown: watch::Receiver<bool>) {
        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.config.retry_interval) => {}
                _ = shutdown.changed() => break,
            }
            if *shutdown.borrow() {
                break;
            }
            let pending = {
                let st = self.lock();
                !st.queue.is_empty() || st.alarm_raised
            };
            if pending {
                self.flush().await;
            }
        }
        debug!("record store flush task exited");
    }
}

/// Write queued entries oldest first until the queue is empty or a write
/// fails.  Returns how many were written and the failure, if any.
fn drain(st: &mut StoreState) -> (usize, Option<StoreError>) {
    let mut flushed = 0;
    while let Some(entry) = st.queue.front().cloned() {
        if let Err(e) = st.repo.insert(entry.weight, entry.timestamp) {
            return (flushed, Some(e));
        }
        st.queue.pop_front();
        flushed += 1;
        st.last_committed_at = Some(
            st.last_committed_at
                .map_or(entry.timestamp, |t| t.max(entry.timestamp)),
        );
    }
    (flushed, None)
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
