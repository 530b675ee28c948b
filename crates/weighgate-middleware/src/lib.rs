//! `weighgate-middleware` – the moving parts between hardware and decisions.
//!
//! # Modules
//!
//! - [`subscribers`] – multicast handler registry with add/remove that is
//!   safe during dispatch.
//! - [`debounce`] – run-length counters that turn flickering samples into
//!   plateau-qualified readings.
//! - [`scale_processor`] – the scale poll loop.
//! - [`signal_bus`] – panel link lifecycle, indicator sends, button input.
//! - [`bus`] – the serialized station inbox and the state-change lane.

pub mod bus;
pub mod debounce;
pub mod scale_processor;
pub mod signal_bus;
pub mod subscribers;

pub use bus::{EventPublisher, StationBus, StationInbox};
pub use debounce::{Debouncer, Qualified};
pub use scale_processor::{ScaleProcessor, ScaleProcessorConfig};
pub use signal_bus::{SignalBus, SignalBusConfig};
pub use subscribers::{HandlerRegistry, SubscriptionId};
