//! `weighgate-hal` – hardware capability contracts.
//!
//! The core never talks to a COM port directly.  It talks to two traits:
//!
//! - [`scale_link`] – [`ScaleLink`][scale_link::ScaleLink]: open/close, weight,
//!   stability, alarm and connection flags, zero command, last response.
//! - [`signal_link`] – [`SignalLink`][signal_link::SignalLink]: the duplex
//!   serial channel to the indicator/button panel.
//!
//! Drivers:
//!
//! - [`sim`] – in-process scale and panel simulators with control handles for
//!   tests and demo runs.
//! - [`serial_panel`] – panel driver over a real serial port (feature
//!   `serial`, on by default).

pub mod scale_link;
#[cfg(feature = "serial")]
pub mod serial_panel;
pub mod signal_link;
pub mod sim;

pub use scale_link::{RESPONSE_OK, ScaleLink};
pub use signal_link::SignalLink;
