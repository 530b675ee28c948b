//! `weighgate-runtime` – assembles the station and runs it.
//!
//! # Modules
//!
//! - [`station`] – [`Station`][station::Station]: builds the scale
//!   processor, signal bus, record store and state machine, wires their
//!   notifications into the station inbox, and owns start/stop.
//! - [`actions`] – [`PanelActions`][actions::PanelActions]: the state
//!   machine's callback table, mapped onto indicator codes, the zero command
//!   and the record store.
//! - [`telemetry`] – [`init_tracing`][telemetry::init_tracing]: global
//!   `tracing` subscriber with optional OTLP export.

pub mod actions;
pub mod station;
pub mod telemetry;

pub use actions::PanelActions;
pub use station::{Station, StationConfig};
pub use telemetry::{TracerProviderGuard, init_tracing};
