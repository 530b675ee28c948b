//! Panel driver over a real serial port.
//!
//! The panel firmware speaks a line protocol: every command is one ASCII
//! digit followed by `\n` (the digit is the command's index in
//! [`SignalCode::ALL`]); the panel answers with `B\n` when the operator
//! presses the button and `H\n` as a keep-alive.
//!
//! Port I/O is blocking, so each call moves the port into
//! [`tokio::task::spawn_blocking`] and takes it back afterwards.

use std::io::{Read, Write};
use std::time::Duration;

use async_trait::async_trait;
use serialport::SerialPort;
use tracing::{debug, trace, warn};
use weighgate_types::{PanelFrame, SignalCode, StationError};

use crate::signal_link::SignalLink;

/// Read timeout applied to the port; inbound polling never blocks longer.
const PORT_TIMEOUT: Duration = Duration::from_millis(20);

/// Longest inbound line kept before the buffer is discarded as garbage.
const MAX_LINE: usize = 64;

/// Encode one command as a protocol frame.
pub fn encode(code: SignalCode) -> [u8; 2] {
    let idx = SignalCode::ALL
        .iter()
        .position(|c| *c == code)
        .unwrap_or_default();
    // ALL has ten entries, so the index always fits a single digit.
    [b'0' + idx as u8, b'\n']
}

/// Decode one inbound line (without the terminator).
pub fn decode(line: &[u8]) -> Option<PanelFrame> {
    match line.trim_ascii() {
        b"B" => Some(PanelFrame::ButtonPressed),
        b"H" => Some(PanelFrame::Heartbeat),
        _ => None,
    }
}

/// Indicator panel attached to a serial port.
pub struct SerialPanel {
    port_name: String,
    baud_rate: u32,
    port: Option<Box<dyn SerialPort>>,
    rx_buf: Vec<u8>,
}

impl SerialPanel {
    pub fn new(port_name: impl Into<String>, baud_rate: u32) -> Self {
        Self {
            port_name: port_name.into(),
            baud_rate,
            port: None,
            rx_buf: Vec::with_capacity(MAX_LINE),
        }
    }

    fn fault(&self, details: impl Into<String>) -> StationError {
        StationError::ConnectionFault {
            component: self.port_name.clone(),
            details: details.into(),
        }
    }

    /// Run `op` on the port in a blocking task. The port is dropped (closed)
    /// if `op` fails.
    async fn with_port<T, F>(&mut self, op: F) -> Result<T, StationError>
    where
        T: Send + 'static,
        F: FnOnce(&mut Box<dyn SerialPort>) -> std::io::Result<T> + Send + 'static,
    {
        let mut port = self
            .port
            .take()
            .ok_or_else(|| StationError::LinkDown(self.port_name.clone()))?;
        let joined = tokio::task::spawn_blocking(move || {
            let result = op(&mut port);
            (port, result)
        })
        .await;
        match joined {
            Ok((port, Ok(value))) => {
                self.port = Some(port);
                Ok(value)
            }
            Ok((_port, Err(e))) => Err(self.fault(e.to_string())),
            Err(e) => Err(self.fault(format!("serial task panicked: {e}"))),
        }
    }

    /// Pull one complete line out of the receive buffer, if any.
    fn take_frame(&mut self) -> Option<PanelFrame> {
        while let Some(pos) = self.rx_buf.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.rx_buf.drain(..=pos).collect();
            match decode(&line[..pos]) {
                Some(frame) => return Some(frame),
                None => debug!(port = %self.port_name, line = ?line, "ignoring unknown panel frame"),
            }
        }
        if self.rx_buf.len() > MAX_LINE {
            warn!(port = %self.port_name, bytes = self.rx_buf.len(), "discarding unterminated panel input");
            self.rx_buf.clear();
        }
        None
    }
}

#[async_trait]
impl SignalLink for SerialPanel {
    fn port(&self) -> &str {
        &self.port_name
    }

    async fn open(&mut self) -> Result<(), StationError> {
        if self.port.is_some() {
            return Ok(());
        }
        let name = self.port_name.clone();
        let baud = self.baud_rate;
        let opened = tokio::task::spawn_blocking(move || {
            serialport::new(name, baud).timeout(PORT_TIMEOUT).open()
        })
        .await
        .map_err(|e| self.fault(format!("serial task panicked: {e}")))?;
        let port = opened.map_err(|e| self.fault(e.to_string()))?;
        self.rx_buf.clear();
        self.port = Some(port);
        debug!(port = %self.port_name, baud = self.baud_rate, "panel port opened");
        Ok(())
    }

    async fn close(&mut self) -> Result<(), StationError> {
        // Dropping the handle releases the OS port.
        self.port = None;
        self.rx_buf.clear();
        Ok(())
    }

    async fn send(&mut self, code: SignalCode) -> Result<(), StationError> {
        let frame = encode(code);
        trace!(port = %self.port_name, code = %code, "panel write");
        self.with_port(move |port| {
            port.write_all(&frame)?;
            port.flush()
        })
        .await
    }

    async fn poll_inbound(&mut self) -> Result<Option<PanelFrame>, StationError> {
        if let Some(frame) = self.take_frame() {
            return Ok(Some(frame));
        }
        let bytes = self
            .with_port(|port| {
                let pending = port.bytes_to_read()? as usize;
                let mut buf = vec![0u8; pending.min(MAX_LINE)];
                if buf.is_empty() {
                    return Ok(buf);
                }
                let n = port.read(&mut buf)?;
                buf.truncate(n);
                Ok(buf)
            })
            .await?;
        self.rx_buf.extend_from_slice(&bytes);
        Ok(self.take_frame())
    }

    fn is_open(&self) -> bool {
        self.port.is_some()
    }
}
