//! `SignalLink` trait – duplex transport to the indicator/button panel.

use async_trait::async_trait;
use weighgate_types::{PanelFrame, SignalCode, StationError};

/// The serial channel that drives the operator panel.
///
/// Implementations own the framing; callers only deal in [`SignalCode`]
/// commands going out and [`PanelFrame`]s coming in.
#[async_trait]
pub trait SignalLink: Send {
    /// Port name, e.g. `"/dev/ttyUSB0"`.
    fn port(&self) -> &str;

    /// Open the link.
    ///
    /// # Errors
    ///
    /// Returns [`StationError::ConnectionFault`] if the port cannot be opened.
    async fn open(&mut self) -> Result<(), StationError>;

    /// Close the link. Idempotent.
    async fn close(&mut self) -> Result<(), StationError>;

    /// Write one framed command.
    ///
    /// # Errors
    ///
    /// Returns [`StationError::LinkDown`] if the link is closed, or
    /// [`StationError::ConnectionFault`] if the write fails.
    async fn send(&mut self, code: SignalCode) -> Result<(), StationError>;

    /// Return the next complete inbound frame without waiting for one.
    ///
    /// `Ok(None)` means nothing is pending.  An `Err` means the link went bad.
    async fn poll_inbound(&mut self) -> Result<Option<PanelFrame>, StationError>;

    /// `true` while the port is open and healthy.
    fn is_open(&self) -> bool;
}
