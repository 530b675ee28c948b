//! Panel link lifecycle.
//!
//! [`SignalBus`] owns the [`SignalLink`] to the indicator/button panel:
//!
//! * `send` writes one [`SignalCode`].  Writes are serialized through the
//!   link mutex.  While the link is down a send fails at once with
//!   [`StationError::LinkDown`]; nothing is queued for replay.
//! * A background task polls inbound frames while the link is up and
//!   re-opens it every `reconnect_interval` while it is down.
//! * `connection_lost` fires once when a healthy link goes bad (from either
//!   path), `connection_established` once per successful reconnect, and
//!   `button_pressed` for every button frame.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};
use weighgate_hal::SignalLink;
use weighgate_types::{PanelFrame, SignalCode, StationError};

use crate::subscribers::HandlerRegistry;

#[derive(Debug, Clone)]
pub struct SignalBusConfig {
    pub reconnect_interval: Duration,
    /// Upper bound on one write or one inbound poll.
    pub send_timeout: Duration,
    pub inbound_poll_interval: Duration,
    pub handler_budget: Duration,
    pub stop_grace: Duration,
}

impl Default for SignalBusConfig {
    fn default() -> Self {
        Self {
            reconnect_interval: Duration::from_millis(1000),
            send_timeout: Duration::from_millis(500),
            inbound_poll_interval: Duration::from_millis(50),
            handler_budget: Duration::from_secs(1),
            stop_grace: Duration::from_secs(2),
        }
    }
}

struct Inner {
    port: String,
    link: tokio::sync::Mutex<Box<dyn SignalLink>>,
    config: SignalBusConfig,
    connected: AtomicBool,
    button_pressed: HandlerRegistry<()>,
    connection_lost: HandlerRegistry<()>,
    connection_established: HandlerRegistry<()>,
}

pub struct SignalBus {
    inner: Arc<Inner>,
    task: Mutex<Option<(watch::Sender<bool>, JoinHandle<()>)>>,
}

impl SignalBus {
    pub fn new(link: Box<dyn SignalLink>, config: SignalBusConfig) -> Self {
        let port = link.port().to_string();
        Self {
            inner: Arc::new(Inner {
                port,
                link: tokio::sync::Mutex::new(link),
                config,
                connected: AtomicBool::new(false),
                button_pressed: HandlerRegistry::new("button_pressed"),
                connection_lost: HandlerRegistry::new("panel_connection_lost"),
                connection_established: HandlerRegistry::new("panel_connection_established"),
            }),
            task: Mutex::new(None),
        }
    }

    /// Open the panel port and spawn the link task.
    ///
    /// # Errors
    ///
    /// The error from the initial open.  It is not retried here; the caller
    /// decides whether startup continues.
    pub async fn start(&self) -> Result<(), StationError> {
        let running = self
            .task
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .as_ref()
            .is_some_and(|(_, h)| !h.is_finished());
        if running {
            return Ok(());
        }

        self.inner.link.lock().await.open().await?;
        self.inner.connected.store(true, Ordering::SeqCst);

        let (tx, rx) = watch::channel(false);
        let inner = Arc::clone(&self.inner);
        let handle = tokio::spawn(async move { inner.run(rx).await });
        if let Some((old_tx, old_handle)) = self
            .task
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .replace((tx, handle))
        {
            let _ = old_tx.send(true);
            old_handle.abort();
        }
        info!(port = %self.inner.port, "signal bus started");
        Ok(())
    }

    /// Stop the link task and release the port.  Safe to call repeatedly.
    pub async fn stop(&self) {
        let running = self
            .task
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .take();
        if let Some((tx, mut handle)) = running {
            let _ = tx.send(true);
            if tokio::time::timeout(self.inner.config.stop_grace, &mut handle)
                .await
                .is_err()
            {
                warn!(port = %self.inner.port, "signal bus task did not stop in time; aborting");
                handle.abort();
            }
        }

        self.inner.connected.store(false, Ordering::SeqCst);
        let closed = tokio::time::timeout(self.inner.config.stop_grace, async {
            self.inner.link.lock().await.close().await
        })
        .await;
        match closed {
            Ok(Ok(())) => info!(port = %self.inner.port, "signal bus stopped"),
            Ok(Err(e)) => warn!(port = %self.inner.port, error = %e, "closing panel link failed"),
            Err(_) => warn!(port = %self.inner.port, "closing panel link timed out"),
        }
    }

    /// Write one indicator command.
    ///
    /// # Errors
    ///
    /// * [`StationError::LinkDown`] immediately when the link is down.
    /// * [`StationError::Timeout`] when the write exceeds `send_timeout`.
    /// * The driver's error when the write fails.  A failed write marks the
    ///   link lost and hands it to the reconnect loop.
    pub async fn send(&self, code: SignalCode) -> Result<(), StationError> {
        if !self.inner.connected.load(Ordering::SeqCst) {
            warn!(port = %self.inner.port, code = %code, "panel link down; signal dropped");
            return Err(StationError::LinkDown(self.inner.port.clone()));
        }
        let result = {
            let mut link = self.inner.link.lock().await;
            match tokio::time::timeout(self.inner.config.send_timeout, link.send(code)).await {
                Ok(r) => r,
                Err(_) => Err(StationError::Timeout(format!(
                    "sending {code} to {}",
                    self.inner.port
                ))),
            }
        };
        match &result {
            Ok(()) => debug!(port = %self.inner.port, code = %code, "signal sent"),
            Err(e) => {
                warn!(port = %self.inner.port, code = %code, error = %e, "signal send failed");
                self.inner.mark_lost().await;
            }
        }
        result
    }

    pub fn is_connected(&self) -> bool {
        self.inner.connected.load(Ordering::SeqCst)
    }

    pub fn button_pressed(&self) -> &HandlerRegistry<()> {
        &self.inner.button_pressed
    }

    pub fn connection_lost(&self) -> &HandlerRegistry<()> {
        &self.inner.connection_lost
    }

    pub fn connection_established(&self) -> &HandlerRegistry<()> {
        &self.inner.connection_established
    }
}

impl Inner {
    async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        loop {
            let up = self.connected.load(Ordering::SeqCst);
            let pause = if up {
                self.config.inbound_poll_interval
            } else {
                self.config.reconnect_interval
            };
            tokio::select! {
                _ = tokio::time::sleep(pause) => {}
                _ = shutdown.changed() => break,
            }
            if *shutdown.borrow() {
                break;
            }
            if up {
                self.poll_inbound().await;
            } else {
                self.try_reconnect().await;
            }
        }
        debug!(port = %self.port, "signal bus task exited");
    }

    async fn poll_inbound(&self) {
        let polled = {
            let mut link = self.link.lock().await;
            if link.is_open() {
                tokio::time::timeout(self.config.send_timeout, link.poll_inbound())
                    .await
                    .unwrap_or_else(|_| {
                        Err(StationError::Timeout(format!("polling {}", self.port)))
                    })
            } else {
                Err(StationError::LinkDown(self.port.clone()))
            }
        };
        match polled {
            Ok(Some(PanelFrame::ButtonPressed)) => {
                info!(port = %self.port, "panel button pressed");
                self.button_pressed.dispatch((), self.config.handler_budget).await;
            }
            Ok(Some(PanelFrame::Heartbeat)) => trace!(port = %self.port, "panel heartbeat"),
            Ok(None) => {}
            Err(e) => {
                debug!(port = %self.port, error = %e, "panel poll failed");
                self.mark_lost().await;
            }
        }
    }

    async fn try_reconnect(&self) {
        let reopened = {
            let mut link = self.link.lock().await;
            // Release whatever is left of the old handle first.
            let _ = link.close().await;
            link.open().await
        };
        match reopened {
            Ok(()) => {
                if !self.connected.swap(true, Ordering::SeqCst) {
                    info!(port = %self.port, "panel link re-established");
                    self.connection_established
                        .dispatch((), self.config.handler_budget)
                        .await;
                }
            }
            Err(e) => debug!(port = %self.port, error = %e, "panel reconnect attempt failed"),
        }
    }

    /// Flip to disconnected; only the caller that wins the flip notifies.
    async fn mark_lost(&self) {
        if self.connected.swap(false, Ordering::SeqCst) {
            warn!(port = %self.port, "panel link lost");
            self.connection_lost
                .dispatch((), self.config.handler_budget)
                .await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use weighgate_hal::sim::{SimPanel, SimPanelHandle};

    fn bus() -> (SignalBus, SimPanelHandle) {
        let (panel, handle) = SimPanel::new("sim-panel");
        let config = SignalBusConfig {
            reconnect_interval: Duration::from_millis(100),
            inbound_poll_interval: Duration::from_millis(10),
            ..SignalBusConfig::default()
        };
        (SignalBus::new(Box::new(panel), config), handle)
    }

    fn counter(registry: &HandlerRegistry<()>) -> Arc<AtomicUsize> {
        let hits = Arc::new(AtomicUsize::new(0));
        let h = Arc::clone(&hits);
        registry.subscribe(move |()| {
            let h = Arc::clone(&h);
            async move {
                h.fetch_add(1, Ordering::SeqCst);
            }
        });
        hits
    }

    #[tokio::test(start_paused = true)]
    async fn sends_reach_the_link_in_order() -> Result<(), Box<dyn std::error::Error>> {
        let (bus, panel) = bus();
        bus.start().await?;
        bus.send(SignalCode::LinkOn).await?;
        bus.send(SignalCode::Idle).await?;
        bus.stop().await;
        assert_eq!(panel.sent(), vec![SignalCode::LinkOn, SignalCode::Idle]);
        assert_eq!(panel.close_calls(), 1);
        Ok(())
    }

    /// Writes each frame byte by byte, yielding in between, like a slow UART.
    struct ByteLink {
        wire: Arc<Mutex<Vec<u8>>>,
        open: bool,
    }

    #[async_trait::async_trait]
    impl SignalLink for ByteLink {
        fn port(&self) -> &str {
            "byte-panel"
        }

        async fn open(&mut self) -> Result<(), StationError> {
            self.open = true;
            Ok(())
        }

        async fn close(&mut self) -> Result<(), StationError> {
            self.open = false;
            Ok(())
        }

        async fn send(&mut self, code: SignalCode) -> Result<(), StationError> {
            for byte in code.as_str().bytes().chain(std::iter::once(b'\n')) {
                self.wire.lock().unwrap().push(byte);
                tokio::task::yield_now().await;
            }
            Ok(())
        }

        async fn poll_inbound(&mut self) -> Result<Option<PanelFrame>, StationError> {
            Ok(None)
        }

        fn is_open(&self) -> bool {
            self.open
        }
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_sends_arrive_whole_and_once() -> Result<(), Box<dyn std::error::Error>> {
        let wire = Arc::new(Mutex::new(Vec::new()));
        let link = ByteLink {
            wire: Arc::clone(&wire),
            open: false,
        };
        let bus = SignalBus::new(Box::new(link), SignalBusConfig::default());
        bus.start().await?;

        let (low, high) = SignalCode::ALL.split_at(5);
        let (a, b) = tokio::join!(
            futures_util::future::join_all(low.iter().map(|c| bus.send(*c))),
            futures_util::future::join_all(high.iter().map(|c| bus.send(*c))),
        );
        for result in a.into_iter().chain(b) {
            result?;
        }
        bus.stop().await;

        let bytes = wire.lock().unwrap().clone();
        let text = String::from_utf8(bytes)?;
        let mut lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), SignalCode::ALL.len());
        lines.sort_unstable();
        let mut expected: Vec<&str> = SignalCode::ALL.iter().map(|c| c.as_str()).collect();
        expected.sort_unstable();
        assert_eq!(lines, expected);
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn button_frames_reach_every_subscriber() -> Result<(), Box<dyn std::error::Error>> {
        let (bus, panel) = bus();
        let a = counter(bus.button_pressed());
        let b = counter(bus.button_pressed());
        bus.start().await?;

        panel.press_button();
        panel.push_frame(PanelFrame::Heartbeat);
        panel.press_button();
        tokio::time::sleep(Duration::from_millis(100)).await;
        bus.stop().await;

        assert_eq!(a.load(Ordering::SeqCst), 2);
        assert_eq!(b.load(Ordering::SeqCst), 2);
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn send_fails_fast_while_down() -> Result<(), Box<dyn std::error::Error>> {
        let (bus, panel) = bus();
        let lost = counter(bus.connection_lost());
        bus.start().await?;

        panel.set_reachable(false);
        assert!(bus.send(SignalCode::Idle).await.is_err());
        assert!(!bus.is_connected());

        let started = tokio::time::Instant::now();
        let err = bus.send(SignalCode::Idle).await.unwrap_err();
        assert!(matches!(err, StationError::LinkDown(_)));
        assert_eq!(started.elapsed(), Duration::ZERO);
        assert_eq!(lost.load(Ordering::SeqCst), 1);
        bus.stop().await;
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn reconnect_is_spaced_and_established_fires_once() -> Result<(), Box<dyn std::error::Error>> {
        let (bus, panel) = bus();
        let lost = counter(bus.connection_lost());
        let established = counter(bus.connection_established());
        bus.start().await?;

        panel.set_reachable(false);
        // The inbound poll notices within one poll interval.
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(lost.load(Ordering::SeqCst), 1);

        let opens_before = panel.open_calls();
        tokio::time::sleep(Duration::from_millis(350)).await;
        let attempts = panel.open_calls() - opens_before;
        assert_eq!(attempts, 3, "one attempt per reconnect interval");

        panel.set_reachable(true);
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert!(bus.is_connected());
        assert_eq!(established.load(Ordering::SeqCst), 1);
        assert_eq!(lost.load(Ordering::SeqCst), 1);

        bus.send(SignalCode::LinkOn).await?;
        bus.stop().await;
        assert_eq!(panel.sent(), vec![SignalCode::LinkOn]);
        Ok(())
    }

    #[tokio::test]
    async fn start_fails_when_port_cannot_open() {
        let (bus, panel) = bus();
        panel.set_reachable(false);
        assert!(bus.start().await.is_err());
        assert!(!bus.is_connected());
    }
}
