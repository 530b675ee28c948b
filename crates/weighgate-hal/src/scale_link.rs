//! `ScaleLink` trait – the capability contract of a scale driver.
//!
//! A driver mirrors the vendor SDK: commands (`request_weight`,
//! `set_to_zero`) update cached flags that are then read through cheap
//! accessors.  Every command leaves a numeric response code behind;
//! [`RESPONSE_OK`] means the scale accepted it.

use async_trait::async_trait;
use weighgate_types::StationError;

/// Response code reported by a scale after an accepted command.
pub const RESPONSE_OK: i64 = 0;

/// A weighing scale reachable over some hardware link.
#[async_trait]
pub trait ScaleLink: Send {
    /// Port or address of the scale, e.g. `"/dev/ttyUSB1"`.
    fn port(&self) -> &str;

    /// Open the link.
    ///
    /// # Errors
    ///
    /// Returns [`StationError::ConnectionFault`] when the port cannot be
    /// opened.
    async fn open(&mut self) -> Result<(), StationError>;

    /// Close the link. Closing an already closed link is not an error.
    async fn close(&mut self) -> Result<(), StationError>;

    /// Ask the scale for a fresh reading; the result is exposed through
    /// [`weight`][Self::weight] and [`is_stable`][Self::is_stable].
    async fn request_weight(&mut self) -> Result<(), StationError>;

    /// Send the zero command. The outcome is reported through
    /// [`last_response_code`][Self::last_response_code].
    async fn set_to_zero(&mut self) -> Result<(), StationError>;

    /// Last weight reported by the scale.
    fn weight(&self) -> f64;

    /// `true` when the last reading was flagged stable.
    fn is_stable(&self) -> bool;

    /// `true` while the link is up.
    fn is_connected(&self) -> bool;

    /// `true` while the scale reports a hardware alarm.
    fn is_alarm(&self) -> bool;

    /// Numeric code of the last response ([`RESPONSE_OK`] on success).
    fn last_response_code(&self) -> i64;

    /// Human-readable text of the last response.
    fn last_response_text(&self) -> String;
}
