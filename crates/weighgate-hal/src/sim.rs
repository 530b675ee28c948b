//! In-process simulators for CI and demo runs without physical hardware.
//!
//! Each simulator is split in two: the driver ([`SimScale`], [`SimPanel`])
//! which is boxed and handed to the component that owns the link, and a
//! cloneable handle ([`SimScaleHandle`], [`SimPanelHandle`]) that tests keep
//! to script readings, pull the cable, press the button and count calls.
//!
//! # Example
//!
//! ```rust
//! use weighgate_hal::sim::SimScale;
//!
//! let (scale, handle) = SimScale::new("sim-scale");
//! handle.set_reading(12.5, true);
//! assert_eq!(handle.open_calls(), 0);
//! # drop(scale);
//! ```

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use weighgate_types::{PanelFrame, SignalCode, StationError};

use crate::scale_link::{RESPONSE_OK, ScaleLink};
use crate::signal_link::SignalLink;

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|p| p.into_inner())
}

// ────────────────────────────────────────────────────────────────────────────
// Scale simulator
// ────────────────────────────────────────────────────────────────────────────

/// One scripted scale reading.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SimReading {
    pub weight: f64,
    pub stable: bool,
}

impl SimReading {
    pub fn stable(weight: f64) -> Self {
        Self {
            weight,
            stable: true,
        }
    }

    pub fn moving(weight: f64) -> Self {
        Self {
            weight,
            stable: false,
        }
    }
}

/// Build a repeating load/unload script: empty platform, load swinging in,
/// a long stable plateau per weight, load swinging out.
pub fn load_cycle(weights: &[f64]) -> Vec<SimReading> {
    let mut script = Vec::new();
    for &w in weights {
        script.extend(std::iter::repeat_n(SimReading::stable(0.0), 10));
        script.extend((1..=4).map(|i| SimReading::moving(w * f64::from(i) / 5.0)));
        script.extend(std::iter::repeat_n(SimReading::stable(w), 30));
        script.extend((1..=4).rev().map(|i| SimReading::moving(w * f64::from(i) / 5.0)));
    }
    script
}

#[derive(Debug)]
struct ScaleState {
    connected: bool,
    reachable: bool,
    alarm: bool,
    current: SimReading,
    script: Vec<SimReading>,
    cursor: usize,
    looping: bool,
    last_code: i64,
    last_text: String,
    zero_code: i64,
    zero_text: String,
    open_calls: u32,
    close_calls: u32,
    zero_calls: u32,
    request_calls: u32,
}

impl Default for ScaleState {
    fn default() -> Self {
        Self {
            connected: false,
            reachable: true,
            alarm: false,
            current: SimReading::stable(0.0),
            script: Vec::new(),
            cursor: 0,
            looping: false,
            last_code: RESPONSE_OK,
            last_text: "OK".to_string(),
            zero_code: RESPONSE_OK,
            zero_text: "OK".to_string(),
            open_calls: 0,
            close_calls: 0,
            zero_calls: 0,
            request_calls: 0,
        }
    }
}

/// Simulated scale driver.
pub struct SimScale {
    port: String,
    state: Arc<Mutex<ScaleState>>,
}

/// Control handle for a [`SimScale`].
#[derive(Clone)]
pub struct SimScaleHandle {
    state: Arc<Mutex<ScaleState>>,
}

impl SimScale {
    /// Create a simulator and its control handle.
    pub fn new(port: impl Into<String>) -> (Self, SimScaleHandle) {
        let state = Arc::new(Mutex::new(ScaleState::default()));
        (
            Self {
                port: port.into(),
                state: Arc::clone(&state),
            },
            SimScaleHandle { state },
        )
    }
}

impl SimScaleHandle {
    /// Fix the reading returned on every poll (clears any script).
    pub fn set_reading(&self, weight: f64, stable: bool) {
        let mut s = lock(&self.state);
        s.script.clear();
        s.cursor = 0;
        s.current = SimReading { weight, stable };
    }

    /// Replay `script` one reading per poll. The last reading is held unless
    /// `looping` is set.
    pub fn load_script(&self, script: Vec<SimReading>, looping: bool) {
        let mut s = lock(&self.state);
        s.script = script;
        s.cursor = 0;
        s.looping = looping;
    }

    pub fn set_alarm(&self, alarm: bool) {
        lock(&self.state).alarm = alarm;
    }

    /// Pull (`false`) or reconnect (`true`) the cable.
    pub fn set_reachable(&self, reachable: bool) {
        let mut s = lock(&self.state);
        s.reachable = reachable;
        if !reachable {
            s.connected = false;
        }
    }

    /// Make subsequent zero commands fail with `code`.
    pub fn reject_zero(&self, code: i64, text: impl Into<String>) {
        let mut s = lock(&self.state);
        s.zero_code = code;
        s.zero_text = text.into();
    }

    pub fn accept_zero(&self) {
        let mut s = lock(&self.state);
        s.zero_code = RESPONSE_OK;
        s.zero_text = "OK".to_string();
    }

    pub fn open_calls(&self) -> u32 {
        lock(&self.state).open_calls
    }

    pub fn close_calls(&self) -> u32 {
        lock(&self.state).close_calls
    }

    pub fn zero_calls(&self) -> u32 {
        lock(&self.state).zero_calls
    }

    pub fn request_calls(&self) -> u32 {
        lock(&self.state).request_calls
    }
}

#[async_trait]
impl ScaleLink for SimScale {
    fn port(&self) -> &str {
        &self.port
    }

    async fn open(&mut self) -> Result<(), StationError> {
        let mut s = lock(&self.state);
        s.open_calls += 1;
        if !s.reachable {
            return Err(StationError::ConnectionFault {
                component: self.port.clone(),
                details: "simulated scale unreachable".to_string(),
            });
        }
        s.connected = true;
        Ok(())
    }

    async fn close(&mut self) -> Result<(), StationError> {
        let mut s = lock(&self.state);
        s.close_calls += 1;
        s.connected = false;
        Ok(())
    }

    async fn request_weight(&mut self) -> Result<(), StationError> {
        let mut s = lock(&self.state);
        s.request_calls += 1;
        if !s.connected {
            return Err(StationError::LinkDown(self.port.clone()));
        }
        if !s.script.is_empty() {
            if s.cursor >= s.script.len() && s.looping {
                s.cursor = 0;
            }
            let idx = s.cursor.min(s.script.len() - 1);
            s.current = s.script[idx];
            s.cursor += 1;
        }
        s.last_code = RESPONSE_OK;
        s.last_text = "OK".to_string();
        Ok(())
    }

    async fn set_to_zero(&mut self) -> Result<(), StationError> {
        let mut s = lock(&self.state);
        s.zero_calls += 1;
        if !s.connected {
            return Err(StationError::LinkDown(self.port.clone()));
        }
        s.last_code = s.zero_code;
        s.last_text = s.zero_text.clone();
        if s.zero_code == RESPONSE_OK {
            s.current.weight = 0.0;
        }
        Ok(())
    }

    fn weight(&self) -> f64 {
        lock(&self.state).current.weight
    }

    fn is_stable(&self) -> bool {
        lock(&self.state).current.stable
    }

    fn is_connected(&self) -> bool {
        let s = lock(&self.state);
        s.connected && s.reachable
    }

    fn is_alarm(&self) -> bool {
        lock(&self.state).alarm
    }

    fn last_response_code(&self) -> i64 {
        lock(&self.state).last_code
    }

    fn last_response_text(&self) -> String {
        lock(&self.state).last_text.clone()
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Panel simulator
// ────────────────────────────────────────────────────────────────────────────

#[derive(Debug)]
struct PanelState {
    open: bool,
    reachable: bool,
    sent: Vec<SignalCode>,
    inbound: VecDeque<PanelFrame>,
    open_calls: u32,
    close_calls: u32,
}

impl Default for PanelState {
    fn default() -> Self {
        Self {
            open: false,
            reachable: true,
            sent: Vec::new(),
            inbound: VecDeque::new(),
            open_calls: 0,
            close_calls: 0,
        }
    }
}

/// Simulated indicator/button panel.
pub struct SimPanel {
    port: String,
    state: Arc<Mutex<PanelState>>,
}

/// Control handle for a [`SimPanel`].
#[derive(Clone)]
pub struct SimPanelHandle {
    state: Arc<Mutex<PanelState>>,
}

impl SimPanel {
    pub fn new(port: impl Into<String>) -> (Self, SimPanelHandle) {
        let state = Arc::new(Mutex::new(PanelState::default()));
        (
            Self {
                port: port.into(),
                state: Arc::clone(&state),
            },
            SimPanelHandle { state },
        )
    }

    fn fault(&self) -> StationError {
        StationError::ConnectionFault {
            component: self.port.clone(),
            details: "simulated panel unreachable".to_string(),
        }
    }
}

impl SimPanelHandle {
    /// Queue a button press for the bus to pick up.
    pub fn press_button(&self) {
        lock(&self.state).inbound.push_back(PanelFrame::ButtonPressed);
    }

    pub fn push_frame(&self, frame: PanelFrame) {
        lock(&self.state).inbound.push_back(frame);
    }

    /// Pull (`false`) or reconnect (`true`) the cable.
    pub fn set_reachable(&self, reachable: bool) {
        let mut s = lock(&self.state);
        s.reachable = reachable;
        if !reachable {
            s.open = false;
        }
    }

    /// Every code written so far, oldest first.
    pub fn sent(&self) -> Vec<SignalCode> {
        lock(&self.state).sent.clone()
    }

    pub fn clear_sent(&self) {
        lock(&self.state).sent.clear();
    }

    pub fn open_calls(&self) -> u32 {
        lock(&self.state).open_calls
    }

    pub fn close_calls(&self) -> u32 {
        lock(&self.state).close_calls
    }
}

#[async_trait]
impl SignalLink for SimPanel {
    fn port(&self) -> &str {
        &self.port
    }

    async fn open(&mut self) -> Result<(), StationError> {
        let mut s = lock(&self.state);
        s.open_calls += 1;
        if !s.reachable {
            return Err(self.fault());
        }
        s.open = true;
        Ok(())
    }

    async fn close(&mut self) -> Result<(), StationError> {
        let mut s = lock(&self.state);
        s.close_calls += 1;
        s.open = false;
        Ok(())
    }

    async fn send(&mut self, code: SignalCode) -> Result<(), StationError> {
        let mut s = lock(&self.state);
        if !s.reachable {
            s.open = false;
            return Err(self.fault());
        }
        if !s.open {
            return Err(StationError::LinkDown(self.port.clone()));
        }
        s.sent.push(code);
        Ok(())
    }

    async fn poll_inbound(&mut self) -> Result<Option<PanelFrame>, StationError> {
        let mut s = lock(&self.state);
        if !s.reachable {
            s.open = false;
            return Err(self.fault());
        }
        if !s.open {
            return Err(StationError::LinkDown(self.port.clone()));
        }
        Ok(s.inbound.pop_front())
    }

    fn is_open(&self) -> bool {
        let s = lock(&self.state);
        s.open && s.reachable
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Tests
// ────────────────────────────────────────────────────────────────────────────
