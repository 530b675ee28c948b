//! `weighgate-types` – shared vocabulary of the weighing station.
//!
//! Every other crate speaks in these types: indicator commands, panel frames,
//! scale samples, committed weighings, the events that drive the decision
//! engine, and the one error enum that crosses crate boundaries.

use std::sync::Mutex;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Closed set of commands understood by the indicator/button panel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SignalCode {
    /// Scale link is up.
    LinkOn,
    /// Scale link is down.
    LinkOff,
    /// Platform empty, ready for the next object.
    Idle,
    /// Load is moving.
    Unstable,
    /// A weighing was recorded.
    Completed,
    /// The load settled below the accepted minimum.
    CompletedSmall,
    /// Invalid weight warning (yellow + red lamps).
    YellowRedOn,
    /// Generic error lamp.
    RedOn,
    /// Hardware alarm siren/lamp on.
    AlarmOn,
    /// Alarm acknowledged, all alarm lamps off.
    AlarmOff,
}

impl SignalCode {
    /// Every code, in panel firmware order.
    pub const ALL: [SignalCode; 10] = [
        SignalCode::LinkOn,
        SignalCode::LinkOff,
        SignalCode::Idle,
        SignalCode::Unstable,
        SignalCode::Completed,
        SignalCode::CompletedSmall,
        SignalCode::YellowRedOn,
        SignalCode::RedOn,
        SignalCode::AlarmOn,
        SignalCode::AlarmOff,
    ];

    /// Stable short name used in logs.
    pub fn as_str(&self) -> &'static str {
        match self {
            SignalCode::LinkOn => "link_on",
            SignalCode::LinkOff => "link_off",
            SignalCode::Idle => "idle",
            SignalCode::Unstable => "unstable",
            SignalCode::Completed => "completed",
            SignalCode::CompletedSmall => "completed_small",
            SignalCode::YellowRedOn => "yellow_red_on",
            SignalCode::RedOn => "red_on",
            SignalCode::AlarmOn => "alarm_on",
            SignalCode::AlarmOff => "alarm_off",
        }
    }
}

impl std::fmt::Display for SignalCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Inbound frame decoded from the panel link.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PanelFrame {
    /// The operator pressed the acknowledge button.
    ButtonPressed,
    /// Keep-alive from the panel firmware; carries no action.
    Heartbeat,
}

/// One raw reading taken from the scale on a poll tick.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct WeightSample {
    pub value: f64,
    pub stable: bool,
    pub timestamp: DateTime<Utc>,
}

impl WeightSample {
    /// Sample stamped with the current wall-clock time.
    pub fn now(value: f64, stable: bool) -> Self {
        Self {
            value,
            stable,
            timestamp: Utc::now(),
        }
    }
}

/// A committed weighing as stored in the persistent table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Weighing {
    /// Identity assigned by the store.
    pub id: i64,
    pub weight: f64,
    pub recorded_at: DateTime<Utc>,
}

/// Which part of the station raised an error indication.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FaultSource {
    /// Hardware alarm reported by the scale itself.
    Scale,
    /// The weighing store crossed its alarm threshold.
    Database,
    /// The zero command was rejected by the scale.
    ZeroCommand,
    /// A settled weighing could not be handed to the store.
    Recording,
}

/// Input events consumed by the decision engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum StationEvent {
    ScaleConnected,
    ScaleDisconnected,
    ScaleUnstable,
    ScaleAlarm,
    /// Stability-qualified weight from the scale processor.
    WeightReceived(f64),
    /// The store raised its failure alarm; carries the last error text.
    DatabaseFailed(String),
    DatabaseRestored,
    ButtonPressed,
}

/// States of the decision engine. `Disconnected` is initial.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StationState {
    Disconnected,
    Idle,
    Unstable,
    Settling,
    Recording,
    ResettingScale,
    Alarm,
}

impl std::fmt::Display for StationState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            StationState::Disconnected => "disconnected",
            StationState::Idle => "idle",
            StationState::Unstable => "unstable",
            StationState::Settling => "settling",
            StationState::Recording => "recording",
            StationState::ResettingScale => "resetting_scale",
            StationState::Alarm => "alarm",
        };
        f.write_str(name)
    }
}

/// A transition applied by the decision engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateChange {
    pub from: StationState,
    pub to: StationState,
}

/// Envelope carried through the station bus.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    /// e.g., "weighgate-middleware::scale"
    pub source: String,
    pub payload: StationEvent,
}

impl Event {
    /// Wrap `payload` with a fresh id and the current time.
    pub fn new(source: impl Into<String>, payload: StationEvent) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            source: source.into(),
            payload,
        }
    }
}

/// Error type shared by every station component.
#[derive(Error, Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum StationError {
    #[error("Hardware fault on {component} (code {code}): {details}")]
    HardwareFault {
        component: String,
        code: i64,
        details: String,
    },

    #[error("Connection fault on {component}: {details}")]
    ConnectionFault { component: String, details: String },

    #[error("Link down: {0}")]
    LinkDown(String),

    #[error("Persistence error: {0}")]
    Persistence(String),

    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Channel error: {0}")]
    Channel(String),
}

// ─────────────────────────────────────────────────────────────────────────────
// Clock
// ─────────────────────────────────────────────────────────────────────────────

/// Source of wall-clock timestamps for records.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// The real UTC clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// A clock that only moves when told to. Used for reproducible timestamps.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    /// Move the clock forward by `millis` milliseconds.
    pub fn advance_millis(&self, millis: i64) {
        let mut now = self.now.lock().unwrap_or_else(|p| p.into_inner());
        *now += ChronoDuration::milliseconds(millis);
    }

    pub fn set(&self, at: DateTime<Utc>) {
        *self.now.lock().unwrap_or_else(|p| p.into_inner()) = at;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap_or_else(|p| p.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn signal_code_names_are_unique() {
        let mut names: Vec<&str> = SignalCode::ALL.iter().map(|c| c.as_str()).collect();
        names.sort_unstable();
        names.dedup();
        assert_eq!(names.len(), SignalCode::ALL.len());
    }

    #[test]
    fn event_roundtrip() {
        let event = Event::new(
            "weighgate-middleware::scale",
            StationEvent::WeightReceived(123.4),
        );
        let json = serde_json::to_string(&event).unwrap();
        let back: Event = serde_json::from_str(&json).unwrap();
        assert_eq!(event.id, back.id);
        assert_eq!(back.payload, StationEvent::WeightReceived(123.4));
    }

    #[test]
    fn station_error_display() {
        let err = StationError::HardwareFault {
            component: "scale".to_string(),
            code: 2,
            details: "zero rejected".to_string(),
        };
        let text = err.to_string();
        assert!(text.contains("scale"));
        assert!(text.contains("code 2"));

        let err2 = StationError::LinkDown("panel".to_string());
        assert!(err2.to_string().contains("panel"));
    }

    #[test]
    fn manual_clock_only_moves_when_advanced() {
        let start = Utc.with_ymd_and_hms(2024, 5, 1, 8, 0, 0).unwrap();
        let clock = ManualClock::new(start);
        assert_eq!(clock.now(), start);
        clock.advance_millis(1500);
        assert_eq!(clock.now(), start + ChronoDuration::milliseconds(1500));
        clock.set(start);
        assert_eq!(clock.now(), start);
    }
}
