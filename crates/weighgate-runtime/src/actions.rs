//! The state machine's callback table, bound to real components.
//!
//! | Callback | Effect |
//! |---|---|
//! | `on_connected` | `LinkOn` |
//! | `on_disconnected` | `LinkOff` |
//! | `on_unstable` | `Unstable` |
//! | `on_zero_state` | `Idle` |
//! | `on_invalid_weight` | `YellowRedOn` |
//! | `on_error(Scale)` | `AlarmOn` |
//! | `on_error(_)` | `RedOn` |
//! | `on_reset_alarm` | `AlarmOff` |
//! | `on_record(w)` | save through the record store, then `Completed`; fails if the store refuses |
//! | `on_reset_to_zero` | zero command through the scale processor |
//!
//! Indicator sends never fail a callback: a down panel is logged by the
//! signal bus and the code is remembered so it can be replayed once the
//! panel is back.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tracing::{debug, info};
use weighgate_kernel::StationActions;
use weighgate_memory::{RecordStore, SaveOutcome};
use weighgate_middleware::{ScaleProcessor, SignalBus};
use weighgate_types::{FaultSource, SignalCode, StationError};

pub struct PanelActions {
    signals: Arc<SignalBus>,
    processor: Arc<ScaleProcessor>,
    store: Arc<RecordStore>,
    last_signal: Mutex<Option<SignalCode>>,
}

impl PanelActions {
    pub fn new(
        signals: Arc<SignalBus>,
        processor: Arc<ScaleProcessor>,
        store: Arc<RecordStore>,
    ) -> Self {
        Self {
            signals,
            processor,
            store,
            last_signal: Mutex::new(None),
        }
    }

    /// Most recent code the station wanted on the panel.
    pub fn last_signal(&self) -> Option<SignalCode> {
        *self.last_signal.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Send the last code again, e.g. after the panel reconnected.
    pub async fn resend_last(&self) {
        if let Some(code) = self.last_signal() {
            debug!(code = %code, "replaying indicator");
            let _ = self.signals.send(code).await;
        }
    }

    async fn signal(&self, code: SignalCode) {
        *self.last_signal.lock().unwrap_or_else(|p| p.into_inner()) = Some(code);
        // Failures are logged by the signal bus.
        let _ = self.signals.send(code).await;
    }
}

#[async_trait]
impl StationActions for PanelActions {
    async fn on_connected(&self) {
        self.signal(SignalCode::LinkOn).await;
    }

    async fn on_disconnected(&self) {
        self.signal(SignalCode::LinkOff).await;
    }

    async fn on_unstable(&self) {
        self.signal(SignalCode::Unstable).await;
    }

    async fn on_reset_to_zero(&self) -> Result<(), StationError> {
        self.processor.reset_to_zero().await
    }

    async fn on_zero_state(&self) {
        self.signal(SignalCode::Idle).await;
    }

    async fn on_invalid_weight(&self) {
        self.signal(SignalCode::YellowRedOn).await;
    }

    async fn on_error(&self, source: FaultSource) {
        let code = match source {
            FaultSource::Scale => SignalCode::AlarmOn,
            FaultSource::Database | FaultSource::ZeroCommand | FaultSource::Recording => {
                SignalCode::RedOn
            }
        };
        self.signal(code).await;
    }

    async fn on_reset_alarm(&self) {
        self.signal(SignalCode::AlarmOff).await;
    }

    async fn on_record(&self, weight: f64) -> Result<(), StationError> {
        match self.store.save_weighing(weight).await? {
            SaveOutcome::Committed(w) => info!(id = w.id, weight, "weighing saved"),
            SaveOutcome::Queued { queue_len } => {
                info!(weight, queue_len, "weighing queued until the store is back")
            }
        }
        self.signal(SignalCode::Completed).await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use weighgate_hal::sim::{SimPanel, SimPanelHandle, SimScale, SimScaleHandle};
    use weighgate_memory::{InMemoryRepository, RecordStoreConfig};
    use weighgate_middleware::{ScaleProcessorConfig, SignalBusConfig};
    use weighgate_types::SystemClock;

    struct Rig {
        actions: PanelActions,
        signals: Arc<SignalBus>,
        store: Arc<RecordStore>,
        panel: SimPanelHandle,
        scale: SimScaleHandle,
    }

    async fn rig() -> Rig {
        let (panel_link, panel) = SimPanel::new("sim-panel");
        let (scale_link, scale) = SimScale::new("sim-scale");
        let signals = Arc::new(SignalBus::new(Box::new(panel_link), SignalBusConfig::default()));
        let processor = Arc::new(ScaleProcessor::new(
            Box::new(scale_link),
            ScaleProcessorConfig::default(),
        ));
        let store = Arc::new(RecordStore::new(
            Box::new(InMemoryRepository::new()),
            Arc::new(SystemClock),
            RecordStoreConfig::default(),
        ));
        signals.start().await.unwrap();
        processor.start().await.unwrap();
        Rig {
            actions: PanelActions::new(Arc::clone(&signals), processor, Arc::clone(&store)),
            signals,
            store,
            panel,
            scale,
        }
    }

    #[tokio::test]
    async fn fault_sources_map_to_lamps() {
        let rig = rig().await;
        rig.actions.on_error(FaultSource::Scale).await;
        rig.actions.on_error(FaultSource::Database).await;
        rig.actions.on_reset_alarm().await;
        rig.actions.on_invalid_weight().await;
        assert_eq!(
            rig.panel.sent(),
            vec![
                SignalCode::AlarmOn,
                SignalCode::RedOn,
                SignalCode::AlarmOff,
                SignalCode::YellowRedOn
            ]
        );
        rig.signals.stop().await;
    }

    #[tokio::test]
    async fn record_saves_then_signals_completed() {
        let rig = rig().await;
        rig.actions.on_record(18.5).await.unwrap();
        let rows = rig.store.recent(5).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].weight, 18.5);
        assert_eq!(rig.panel.sent(), vec![SignalCode::Completed]);
        assert_eq!(rig.actions.last_signal(), Some(SignalCode::Completed));
        rig.signals.stop().await;
    }

    #[tokio::test]
    async fn record_fails_when_store_refuses() {
        let rig = rig().await;
        rig.store.stop().await;
        let err = rig.actions.on_record(7.0).await.unwrap_err();
        assert!(matches!(err, StationError::Persistence(_)));
        assert!(rig.store.recent(5).unwrap().is_empty());
        assert!(rig.panel.sent().is_empty());
        assert_eq!(rig.actions.last_signal(), None);
        rig.signals.stop().await;
    }

    #[tokio::test]
    async fn rejected_zero_is_reported() {
        let rig = rig().await;
        rig.scale.reject_zero(2, "not stable");
        let err = rig.actions.on_reset_to_zero().await.unwrap_err();
        assert!(matches!(err, StationError::HardwareFault { code: 2, .. }));
        rig.signals.stop().await;
    }

    #[tokio::test]
    async fn signals_while_panel_down_are_remembered_not_sent() {
        let rig = rig().await;
        rig.panel.set_reachable(false);
        rig.actions.on_connected().await;
        rig.actions.on_zero_state().await;
        assert!(rig.panel.sent().is_empty());
        assert_eq!(rig.actions.last_signal(), Some(SignalCode::Idle));
        rig.signals.stop().await;
    }
}
