//! `weighgate-kernel` – the decision engine.
//!
//! - [`state_machine`] – [`StateMachine`]: consumes station events one at a
//!   time, applies the weight policy (minimum weight, hysteresis, dwell
//!   time) and calls back into the rest of the station through
//!   [`StationActions`].

pub mod state_machine;

pub use state_machine::{StateMachine, StateMachineConfig, StationActions};
