//! Scale poll loop.
//!
//! [`ScaleProcessor`] owns a [`ScaleLink`] and polls it on a fixed interval.
//! Each tick:
//!
//! 1. If the link reports disconnected, `connection_lost` fires once on the
//!    transition and later ticks try to reopen the link.  A successful
//!    reopen fires `connection_established` once.
//! 2. If the scale reports a hardware alarm, `scale_alarm` fires once on the
//!    rising edge and no weight is read.
//! 3. Otherwise a fresh reading goes through the [`Debouncer`]; qualified
//!    readings fire `weight_received` or `unstable`.
//!
//! Handlers run inside the tick, so the next poll is only scheduled after
//! they return (each bounded by `handler_budget`).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};
use weighgate_hal::{RESPONSE_OK, ScaleLink};
use weighgate_types::{StationError, WeightSample};

use crate::debounce::{Debouncer, Qualified};
use crate::subscribers::HandlerRegistry;

#[derive(Debug, Clone)]
pub struct ScaleProcessorConfig {
    pub polling_interval: Duration,
    /// Consecutive stable polls before a weight qualifies.
    pub stable_threshold: u32,
    /// Consecutive unstable polls before `unstable` fires.
    pub unstable_threshold: u32,
    /// Upper bound on a single handler call.
    pub handler_budget: Duration,
    /// How long `stop` waits for the loop before abandoning it.
    pub stop_grace: Duration,
}

impl Default for ScaleProcessorConfig {
    fn default() -> Self {
        Self {
            polling_interval: Duration::from_millis(200),
            stable_threshold: 3,
            unstable_threshold: 3,
            handler_budget: Duration::from_secs(1),
            stop_grace: Duration::from_secs(2),
        }
    }
}

/// What a tick found, dispatched after the link lock is released.
enum Notice {
    Lost,
    Established,
    Alarm,
    Weight(f64),
    Unstable,
}

/// Per-loop bookkeeping; lives on the poll task's stack.
struct TickState {
    debouncer: Debouncer,
    linked: Option<bool>,
    alarmed: bool,
}

struct Inner {
    port: String,
    link: tokio::sync::Mutex<Box<dyn ScaleLink>>,
    config: ScaleProcessorConfig,
    closed: AtomicBool,
    weight_received: HandlerRegistry<f64>,
    unstable: HandlerRegistry<()>,
    connection_lost: HandlerRegistry<()>,
    connection_established: HandlerRegistry<()>,
    scale_alarm: HandlerRegistry<()>,
}

/// Polls the scale and publishes qualified readings to subscribers.
pub struct ScaleProcessor {
    inner: Arc<Inner>,
    task: Mutex<Option<(watch::Sender<bool>, JoinHandle<()>)>>,
}

impl ScaleProcessor {
    pub fn new(link: Box<dyn ScaleLink>, config: ScaleProcessorConfig) -> Self {
        let port = link.port().to_string();
        Self {
            inner: Arc::new(Inner {
                port,
                link: tokio::sync::Mutex::new(link),
                config,
                closed: AtomicBool::new(false),
                weight_received: HandlerRegistry::new("weight_received"),
                unstable: HandlerRegistry::new("unstable"),
                connection_lost: HandlerRegistry::new("connection_lost"),
                connection_established: HandlerRegistry::new("connection_established"),
                scale_alarm: HandlerRegistry::new("scale_alarm"),
            }),
            task: Mutex::new(None),
        }
    }

    /// Open the link and spawn the poll loop.  Calling `start` on a running
    /// processor does nothing.
    ///
    /// # Errors
    ///
    /// The error from opening the link; startup must not continue without a
    /// scale.
    pub async fn start(&self) -> Result<(), StationError> {
        if self.is_running() {
            return Ok(());
        }
        self.inner.link.lock().await.open().await?;
        self.inner.closed.store(false, Ordering::SeqCst);

        let (tx, rx) = watch::channel(false);
        let inner = Arc::clone(&self.inner);
        let handle = tokio::spawn(async move { inner.run(rx).await });

        let mut slot = self.task.lock().unwrap_or_else(|p| p.into_inner());
        if let Some((old_tx, old_handle)) = slot.replace((tx, handle)) {
            // Lost a race with a concurrent start; keep the newest loop.
            let _ = old_tx.send(true);
            old_handle.abort();
        }
        info!(port = %self.inner.port, "scale processor started");
        Ok(())
    }

    /// Stop the loop and close the link.
    ///
    /// The link is closed exactly once per start, including when `start`
    /// was never called.  A loop that does not finish within `stop_grace`
    /// is aborted.
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
                warn!(port = %self.inner.port, "scale poll loop did not stop in time; aborting");
                handle.abort();
            }
        }

        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let grace = self.inner.config.stop_grace;
        let closed = tokio::time::timeout(grace, async {
            self.inner.link.lock().await.close().await
        })
        .await;
        match closed {
            Ok(Ok(())) => info!(port = %self.inner.port, "scale processor stopped"),
            Ok(Err(e)) => warn!(port = %self.inner.port, error = %e, "closing scale link failed"),
            Err(_) => warn!(port = %self.inner.port, "closing scale link timed out"),
        }
    }

    pub fn is_running(&self) -> bool {
        self.task
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .as_ref()
            .is_some_and(|(_, h)| !h.is_finished())
    }

    /// Send the zero command and check the scale's answer.
    ///
    /// # Errors
    ///
    /// [`StationError::HardwareFault`] when the scale answers with a
    /// non-success response code; link errors are passed through.
    pub async fn reset_to_zero(&self) -> Result<(), StationError> {
        let mut link = self.inner.link.lock().await;
        link.set_to_zero().await?;
        let code = link.last_response_code();
        if code != RESPONSE_OK {
            let details = link.last_response_text();
            warn!(port = %self.inner.port, code, details = %details, "zero command rejected");
            return Err(StationError::HardwareFault {
                component: self.inner.port.clone(),
                code,
                details,
            });
        }
        debug!(port = %self.inner.port, "scale zeroed");
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Subscriptions
    // -----------------------------------------------------------------------

    /// Fires with the plateau weight once per stable plateau.
    pub fn weight_received(&self) -> &HandlerRegistry<f64> {
        &self.inner.weight_received
    }

    /// Fires once per unstable plateau.
    pub fn unstable(&self) -> &HandlerRegistry<()> {
        &self.inner.unstable
    }

    pub fn connection_lost(&self) -> &HandlerRegistry<()> {
        &self.inner.connection_lost
    }

    pub fn connection_established(&self) -> &HandlerRegistry<()> {
        &self.inner.connection_established
    }

    /// Fires on the rising edge of the scale's alarm flag.
    pub fn scale_alarm(&self) -> &HandlerRegistry<()> {
        &self.inner.scale_alarm
    }
}

impl Inner {
    async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let mut state = TickState {
            debouncer: Debouncer::new(self.config.stable_threshold, self.config.unstable_threshold),
            linked: None,
            alarmed: false,
        };
        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.config.polling_interval) => {}
                _ = shutdown.changed() => break,
            }
            if *shutdown.borrow() {
                break;
            }
            let notices = self.poll(&mut state).await;
            for notice in notices {
                self.notify(notice).await;
            }
        }
        debug!(port = %self.port, "scale poll loop exited");
    }

    async fn poll(&self, state: &mut TickState) -> Vec<Notice> {
        let mut notices = Vec::new();
        let mut link = self.link.lock().await;

        if !link.is_connected() {
            if state.linked != Some(false) {
                state.linked = Some(false);
                state.alarmed = false;
                state.debouncer.reset();
                warn!(port = %self.port, "scale link lost");
                notices.push(Notice::Lost);
                return notices;
            }
            if let Err(e) = link.open().await {
                debug!(port = %self.port, error = %e, "scale reopen failed");
                return notices;
            }
            if !link.is_connected() {
                return notices;
            }
        }
        if state.linked != Some(true) {
            state.linked = Some(true);
            info!(port = %self.port, "scale link established");
            notices.push(Notice::Established);
        }

        if link.is_alarm() {
            if !state.alarmed {
                state.alarmed = true;
                state.debouncer.reset();
                warn!(port = %self.port, "scale reports hardware alarm");
                notices.push(Notice::Alarm);
            }
            return notices;
        }
        state.alarmed = false;

        if let Err(e) = link.request_weight().await {
            warn!(port = %self.port, error = %e, "weight request failed");
            return notices;
        }
        let sample = WeightSample::now(link.weight(), link.is_stable());
        drop(link);
        trace!(port = %self.port, weight = sample.value, stable = sample.stable, "sample");

        match state.debouncer.observe_sample(sample) {
            Some(Qualified::Weight(w)) => notices.push(Notice::Weight(w)),
            Some(Qualified::Unstable) => notices.push(Notice::Unstable),
            None => {}
        }
        notices
    }

    async fn notify(&self, notice: Notice) {
        let budget = self.config.handler_budget;
        match notice {
            Notice::Lost => self.connection_lost.dispatch((), budget).await,
            Notice::Established => self.connection_established.dispatch((), budget).await,
            Notice::Alarm => self.scale_alarm.dispatch((), budget).await,
            Notice::Weight(w) => {
                debug!(port = %self.port, weight = w, "stable weight qualified");
                self.weight_received.dispatch(w, budget).await
            }
            Notice::Unstable => self.unstable.dispatch((), budget).await,
        };
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use weighgate_hal::sim::{SimReading, SimScale, SimScaleHandle};

    fn config(stable: u32, unstable: u32) -> ScaleProcessorConfig {
        ScaleProcessorConfig {
            polling_interval: Duration::from_millis(10),
            stable_threshold: stable,
            unstable_threshold: unstable,
            ..ScaleProcessorConfig::default()
        }
    }

    fn processor(stable: u32, unstable: u32) -> (ScaleProcessor, SimScaleHandle) {
        let (scale, handle) = SimScale::new("sim-scale");
        (ScaleProcessor::new(Box::new(scale), config(stable, unstable)), handle)
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
    async fn stable_plateau_fires_weight_once_after_threshold() -> Result<(), Box<dyn std::error::Error>> {
        let (processor, scale) = processor(3, 3);
        scale.set_reading(123.4, true);

        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        processor.weight_received().subscribe(move |w| {
            let tx = tx.clone();
            async move {
                let _ = tx.send((w, tokio::time::Instant::now()));
            }
        });

        let started = tokio::time::Instant::now();
        processor.start().await?;
        tokio::time::sleep(Duration::from_millis(500)).await;
        processor.stop().await;

        let (w, at) = rx.try_recv()?;
        assert!((w - 123.4).abs() < 1e-9);
        assert!(at - started >= Duration::from_millis(30));
        assert!(rx.try_recv().is_err(), "a held weight must not fire again");
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn weight_does_not_fire_before_threshold() -> Result<(), Box<dyn std::error::Error>> {
        let (processor, scale) = processor(5, 3);
        scale.load_script(
            vec![
                SimReading::stable(50.0),
                SimReading::stable(50.0),
                SimReading::stable(50.0),
                SimReading::stable(50.0),
                SimReading::moving(50.0),
            ],
            false,
        );
        let fired = Arc::new(AtomicUsize::new(0));
        let f = Arc::clone(&fired);
        processor.weight_received().subscribe(move |_| {
            let f = Arc::clone(&f);
            async move {
                f.fetch_add(1, Ordering::SeqCst);
            }
        });

        processor.start().await?;
        tokio::time::sleep(Duration::from_millis(200)).await;
        processor.stop().await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn unstable_fires_once_per_plateau() -> Result<(), Box<dyn std::error::Error>> {
        let (processor, scale) = processor(3, 3);
        scale.set_reading(10.0, false);
        let unstable = counter(processor.unstable());

        processor.start().await?;
        tokio::time::sleep(Duration::from_millis(300)).await;
        processor.stop().await;
        assert_eq!(unstable.load(Ordering::SeqCst), 1);
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn connection_edges_fire_once_each() -> Result<(), Box<dyn std::error::Error>> {
        let (processor, scale) = processor(3, 3);
        let lost = counter(processor.connection_lost());
        let established = counter(processor.connection_established());

        processor.start().await?;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(established.load(Ordering::SeqCst), 1);

        scale.set_reachable(false);
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(lost.load(Ordering::SeqCst), 1);
        assert!(scale.open_calls() > 2, "disconnected ticks retry the link");

        scale.set_reachable(true);
        tokio::time::sleep(Duration::from_millis(100)).await;
        processor.stop().await;
        assert_eq!(established.load(Ordering::SeqCst), 2);
        assert_eq!(lost.load(Ordering::SeqCst), 1);
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn alarm_is_edge_triggered() -> Result<(), Box<dyn std::error::Error>> {
        let (processor, scale) = processor(3, 3);
        scale.set_reading(20.0, true);
        let alarms = counter(processor.scale_alarm());

        processor.start().await?;
        scale.set_alarm(true);
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(alarms.load(Ordering::SeqCst), 1);

        scale.set_alarm(false);
        tokio::time::sleep(Duration::from_millis(50)).await;
        scale.set_alarm(true);
        tokio::time::sleep(Duration::from_millis(50)).await;
        processor.stop().await;
        assert_eq!(alarms.load(Ordering::SeqCst), 2);
        Ok(())
    }

    #[tokio::test]
    async fn reset_to_zero_rejects_error_code() -> Result<(), Box<dyn std::error::Error>> {
        let (processor, scale) = processor(3, 3);
        processor.start().await?;
        scale.reject_zero(2, "overload");

        let err = processor.reset_to_zero().await.unwrap_err();
        assert!(matches!(err, StationError::HardwareFault { code: 2, .. }));

        scale.accept_zero();
        processor.reset_to_zero().await?;
        assert_eq!(scale.zero_calls(), 2);
        processor.stop().await;
        Ok(())
    }

    #[tokio::test]
    async fn stop_closes_link_exactly_once() -> Result<(), Box<dyn std::error::Error>> {
        let (never_started, scale) = processor(3, 3);
        never_started.stop().await;
        never_started.stop().await;
        assert_eq!(scale.close_calls(), 1);

        let (started, scale) = processor(3, 3);
        started.start().await?;
        started.start().await?;
        assert_eq!(scale.open_calls(), 1);
        started.stop().await;
        started.stop().await;
        assert_eq!(scale.close_calls(), 1);
        assert!(!started.is_running());
        Ok(())
    }

    #[tokio::test]
    async fn start_fails_when_scale_unreachable() {
        let (processor, scale) = processor(3, 3);
        scale.set_reachable(false);
        let err = processor.start().await.unwrap_err();
        assert!(matches!(err, StationError::ConnectionFault { .. }));
        assert!(!processor.is_running());
    }
}
