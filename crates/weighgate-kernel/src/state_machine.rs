//! [`StateMachine`] – the station's single decision point.
//!
//! Events from the scale processor, the signal bus and the record store
//! arrive through one [`StationInbox`] and are applied strictly one at a
//! time.  Side effects leave through the [`StationActions`] callback table.
//!
//! # Weight policy
//!
//! | Reading | Effect |
//! |---|---|
//! | `|w| <= zero_band` | `on_zero_state`, back to `Idle` |
//! | `zero_band < w < min_weight` | `on_invalid_weight`, back to `Idle` |
//! | `w >= min_weight`, armed | `Settling`; after `semaphore_time` without disqualification: `on_record`, `on_reset_to_zero` |
//! | `w >= min_weight`, not armed | held; no second record |
//!
//! The machine is *armed* initially.  Recording disarms it, and only a
//! reading below `min_weight - hyst_weight` re-arms it, so noise around
//! `min_weight` never produces a duplicate weighing.
//!
//! # Alarms
//!
//! A scale alarm latches [`StationState::Alarm`] until the operator presses
//! the button.  A database alarm is a flag, not a state: weighing goes on
//! (unless `block_recording_on_db_failure` is set) and the flag clears on
//! `DatabaseRestored`.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};
use weighgate_middleware::{StationBus, StationInbox};
use weighgate_types::{FaultSource, StateChange, StationError, StationEvent, StationState};

// ────────────────────────────────────────────────────────────────────────────
// Callback table
// ────────────────────────────────────────────────────────────────────────────

/// Side effects requested by the state machine, one per concern.
///
/// Calls are awaited in order; the machine does not take the next event
/// until the current callback returns.
#[async_trait]
pub trait StationActions: Send + Sync {
    async fn on_connected(&self);
    async fn on_disconnected(&self);
    async fn on_unstable(&self);
    /// Zero the scale.  An error keeps the machine in `ResettingScale`.
    async fn on_reset_to_zero(&self) -> Result<(), StationError>;
    async fn on_zero_state(&self);
    async fn on_invalid_weight(&self);
    async fn on_error(&self, source: FaultSource);
    async fn on_reset_alarm(&self);
    /// Hand a settled weighing to persistence.
    async fn on_record(&self, weight: f64) -> Result<(), StationError>;
}

// ────────────────────────────────────────────────────────────────────────────
// Configuration
// ────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct StateMachineConfig {
    /// Smallest weight treated as a real object.
    pub min_weight: f64,
    /// Margin below `min_weight` a reading must cross to re-arm.
    pub hyst_weight: f64,
    /// Readings with `|w| <= zero_band` count as an empty platform.
    pub zero_band: f64,
    /// Dwell time before a settled weight is recorded.
    pub semaphore_time: Duration,
    /// Refuse new recordings while the database alarm is active.
    pub block_recording_on_db_failure: bool,
}

impl Default for StateMachineConfig {
    fn default() -> Self {
        Self {
            min_weight: 5.0,
            hyst_weight: 0.1,
            zero_band: 0.1,
            semaphore_time: Duration::from_millis(4000),
            block_recording_on_db_failure: false,
        }
    }
}

// ────────────────────────────────────────────────────────────────────────────
// State machine
// ────────────────────────────────────────────────────────────────────────────

struct Settle {
    weight: f64,
    deadline: Instant,
}

pub struct StateMachine {
    config: StateMachineConfig,
    actions: Arc<dyn StationActions>,
    state: StationState,
    armed: bool,
    scale_linked: bool,
    db_alarm: bool,
    zero_failed: bool,
    settle: Option<Settle>,
    bus: Option<StationBus>,
}

impl StateMachine {
    pub fn new(config: StateMachineConfig, actions: Arc<dyn StationActions>) -> Self {
        Self {
            config,
            actions,
            state: StationState::Disconnected,
            armed: true,
            scale_linked: false,
            db_alarm: false,
            zero_failed: false,
            settle: None,
            bus: None,
        }
    }

    /// Announce every transition on `bus`'s state lane.
    pub fn with_state_lane(mut self, bus: StationBus) -> Self {
        self.bus = Some(bus);
        self
    }

    pub fn state(&self) -> StationState {
        self.state
    }

    /// `false` between a recording and the platform clearing.
    pub fn is_armed(&self) -> bool {
        self.armed
    }

    pub fn database_alarm(&self) -> bool {
        self.db_alarm
    }

    /// When the current settling episode completes, if one is running.
    pub fn settle_deadline(&self) -> Option<Instant> {
        self.settle.as_ref().map(|s| s.deadline)
    }

    /// Consume `inbox` until it closes or `shutdown` flips to `true`.
    /// Hands the machine and the inbox back so the loop can be resumed.
    pub async fn run(
        mut self,
        mut inbox: StationInbox,
        mut shutdown: watch::Receiver<bool>,
    ) -> (Self, StationInbox) {
        info!(state = %self.state, "state machine running");
        loop {
            let deadline = self.settle_deadline();
            let next = tokio::select! {
                biased;
                _ = shutdown.changed() => break,
                event = inbox.recv() => event,
                _ = sleep_until_opt(deadline) => {
                    self.dwell_elapsed().await;
                    continue;
                }
            };
            match next {
                Some(event) => {
                    debug!(source = %event.source, event = ?event.payload, "station event");
                    self.handle(event.payload).await;
                }
                None => break,
            }
        }
        info!(state = %self.state, "state machine stopped");
        (self, inbox)
    }

    /// Apply one event.
    pub async fn handle(&mut self, event: StationEvent) {
        match event {
            StationEvent::ScaleConnected => self.scale_connected().await,
            StationEvent::ScaleDisconnected => self.scale_disconnected().await,
            StationEvent::ScaleUnstable => self.scale_unstable().await,
            StationEvent::ScaleAlarm => self.scale_alarm().await,
            StationEvent::WeightReceived(raw) => self.weight_received(raw).await,
            StationEvent::DatabaseFailed(reason) => self.database_failed(&reason).await,
            StationEvent::DatabaseRestored => self.database_restored().await,
            StationEvent::ButtonPressed => self.button_pressed().await,
        }
    }

    async fn scale_connected(&mut self) {
        self.scale_linked = true;
        self.actions.on_connected().await;
        if self.state != StationState::Alarm {
            self.settle = None;
            self.transition(StationState::Idle);
        }
    }

    async fn scale_disconnected(&mut self) {
        self.scale_linked = false;
        self.settle = None;
        self.actions.on_disconnected().await;
        if self.state != StationState::Alarm {
            self.zero_failed = false;
            self.transition(StationState::Disconnected);
        }
    }

    async fn scale_unstable(&mut self) {
        match self.state {
            StationState::Alarm | StationState::ResettingScale | StationState::Disconnected => {
                debug!(state = %self.state, "unstable reading ignored");
            }
            _ => {
                if self.settle.take().is_some() {
                    debug!("load moved; settling cancelled");
                }
                self.transition(StationState::Unstable);
                self.actions.on_unstable().await;
            }
        }
    }

    async fn scale_alarm(&mut self) {
        self.settle = None;
        warn!(from = %self.state, "scale alarm");
        self.transition(StationState::Alarm);
        self.actions.on_error(FaultSource::Scale).await;
    }

    async fn weight_received(&mut self, raw: f64) {
        let cfg = &self.config;
        if raw < cfg.min_weight - cfg.hyst_weight && !self.armed {
            debug!(weight = raw, "platform cleared; re-armed");
            self.armed = true;
        }

        match self.state {
            StationState::Alarm | StationState::ResettingScale | StationState::Disconnected => {
                debug!(state = %self.state, weight = raw, "weight ignored");
                return;
            }
            _ => {}
        }

        if raw < self.config.min_weight {
            self.settle = None;
            self.transition(StationState::Idle);
            if raw.abs() <= self.config.zero_band {
                self.actions.on_zero_state().await;
            } else {
                debug!(weight = raw, min = self.config.min_weight, "weight below minimum");
                self.actions.on_invalid_weight().await;
            }
            return;
        }

        if !self.armed {
            debug!(weight = raw, "already recorded; waiting for the platform to clear");
            self.transition(StationState::Idle);
            return;
        }

        match self.settle.as_mut() {
            // Same episode: keep the running timer, record the latest value.
            Some(settle) => settle.weight = raw,
            None => {
                self.settle = Some(Settle {
                    weight: raw,
                    deadline: Instant::now() + self.config.semaphore_time,
                });
                self.transition(StationState::Settling);
            }
        }
    }

    /// The dwell timer of the current episode elapsed.
    async fn dwell_elapsed(&mut self) {
        let Some(Settle { weight, .. }) = self.settle.take() else {
            return;
        };

        if self.db_alarm && self.config.block_recording_on_db_failure {
            warn!(weight, "recording refused while the database alarm is active");
            self.transition(StationState::Idle);
            self.actions.on_error(FaultSource::Database).await;
            return;
        }

        self.transition(StationState::Recording);
        if let Err(e) = self.actions.on_record(weight).await {
            error!(weight, error = %e, "weighing could not be recorded");
            self.transition(StationState::Idle);
            self.actions.on_error(FaultSource::Recording).await;
            return;
        }
        info!(weight, "weighing recorded");
        self.armed = false;

        self.transition(StationState::ResettingScale);
        self.zero_scale().await;
    }

    async fn zero_scale(&mut self) {
        match self.actions.on_reset_to_zero().await {
            Ok(()) => {
                if std::mem::take(&mut self.zero_failed) {
                    self.actions.on_reset_alarm().await;
                }
                self.transition(StationState::Idle);
            }
            Err(e) => {
                error!(error = %e, "zero command failed; waiting for operator");
                self.zero_failed = true;
                self.actions.on_error(FaultSource::ZeroCommand).await;
            }
        }
    }

    async fn database_failed(&mut self, reason: &str) {
        error!(reason, "database alarm raised");
        self.db_alarm = true;
        self.actions.on_error(FaultSource::Database).await;
    }

    async fn database_restored(&mut self) {
        info!("database alarm cleared");
        self.db_alarm = false;
        if self.state == StationState::Alarm {
            // The scale alarm lamp stays until the operator acknowledges it.
            return;
        }
        self.actions.on_reset_alarm().await;
    }

    async fn button_pressed(&mut self) {
        match self.state {
            StationState::Alarm => {
                info!("alarm acknowledged by operator");
                self.actions.on_reset_alarm().await;
                let next = if self.scale_linked {
                    StationState::Idle
                } else {
                    StationState::Disconnected
                };
                self.transition(next);
                if self.db_alarm {
                    self.actions.on_error(FaultSource::Database).await;
                }
            }
            StationState::ResettingScale => {
                info!("operator retries zero command");
                self.zero_scale().await;
            }
            _ => debug!(state = %self.state, "button press ignored"),
        }
    }

    fn transition(&mut self, to: StationState) {
        if self.state == to {
            return;
        }
        let change = StateChange {
            from: self.state,
            to,
        };
        debug!(from = %change.from, to = %change.to, "transition");
        self.state = to;
        if let Some(bus) = &self.bus {
            bus.announce(change);
        }
    }
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Tests
// ────────────────────────────────────────────────────────────────────────────
