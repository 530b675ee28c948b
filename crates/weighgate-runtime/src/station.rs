//! [`Station`] – builds the components, wires them together, owns their
//! lifetime.
//!
//! Wiring (all producers publish into one [`StationBus`] inbox):
//!
//! | Producer notification | Station event |
//! |---|---|
//! | scale `connection_established` / `connection_lost` | `ScaleConnected` / `ScaleDisconnected` |
//! | scale `unstable` / `scale_alarm` | `ScaleUnstable` / `ScaleAlarm` |
//! | scale `weight_received(w)` | `WeightReceived(w)` |
//! | panel `button_pressed` | `ButtonPressed` |
//! | store `database_failed(e)` / `database_restored` | `DatabaseFailed(e)` / `DatabaseRestored` |
//!
//! When the panel link comes back, the last indicator code is replayed.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use weighgate_hal::{ScaleLink, SignalLink};
use weighgate_kernel::{StateMachine, StateMachineConfig, StationActions};
use weighgate_memory::{RecordStore, RecordStoreConfig, Removed, WeighingRepository};
use weighgate_middleware::{
    EventPublisher, HandlerRegistry, ScaleProcessor, ScaleProcessorConfig, SignalBus,
    SignalBusConfig, StationBus, StationInbox,
};
use weighgate_types::{Clock, StateChange, StationError, StationEvent};

use crate::actions::PanelActions;

/// Per-component settings.
#[derive(Debug, Clone)]
pub struct StationConfig {
    pub scale: ScaleProcessorConfig,
    pub panel: SignalBusConfig,
    pub machine: StateMachineConfig,
    pub store: RecordStoreConfig,
    /// How long `stop` waits for the state machine to finish its event.
    pub stop_grace: Duration,
}

impl Default for StationConfig {
    fn default() -> Self {
        Self {
            scale: ScaleProcessorConfig::default(),
            panel: SignalBusConfig::default(),
            machine: StateMachineConfig::default(),
            store: RecordStoreConfig::default(),
            stop_grace: Duration::from_secs(2),
        }
    }
}

type MachineTask = (watch::Sender<bool>, JoinHandle<(StateMachine, StationInbox)>);

pub struct Station {
    processor: Arc<ScaleProcessor>,
    signals: Arc<SignalBus>,
    store: Arc<RecordStore>,
    actions: Arc<PanelActions>,
    bus: StationBus,
    stop_grace: Duration,
    parked: Mutex<Option<(StateMachine, StationInbox)>>,
    running: Mutex<Option<MachineTask>>,
}

impl Station {
    pub fn new(
        scale: Box<dyn ScaleLink>,
        panel: Box<dyn SignalLink>,
        repo: Box<dyn WeighingRepository>,
        clock: Arc<dyn Clock>,
        config: StationConfig,
    ) -> Self {
        let processor = Arc::new(ScaleProcessor::new(scale, config.scale));
        let signals = Arc::new(SignalBus::new(panel, config.panel));
        let store = Arc::new(RecordStore::new(repo, clock, config.store));
        let actions = Arc::new(PanelActions::new(
            Arc::clone(&signals),
            Arc::clone(&processor),
            Arc::clone(&store),
        ));

        let (bus, inbox) = StationBus::new();
        let callbacks: Arc<dyn StationActions> = actions.clone();
        let machine = StateMachine::new(config.machine, callbacks).with_state_lane(bus.clone());

        let station = Self {
            processor,
            signals,
            store,
            actions,
            bus,
            stop_grace: config.stop_grace,
            parked: Mutex::new(Some((machine, inbox))),
            running: Mutex::new(None),
        };
        station.wire();
        station
    }

    fn wire(&self) {
        let scale = self.bus.publisher("weighgate-middleware::scale");
        forward(self.processor.connection_established(), &scale, StationEvent::ScaleConnected);
        forward(self.processor.connection_lost(), &scale, StationEvent::ScaleDisconnected);
        forward(self.processor.unstable(), &scale, StationEvent::ScaleUnstable);
        forward(self.processor.scale_alarm(), &scale, StationEvent::ScaleAlarm);
        let weights = scale.clone();
        self.processor.weight_received().subscribe(move |w| {
            weights.emit(StationEvent::WeightReceived(w));
            std::future::ready(())
        });

        let panel = self.bus.publisher("weighgate-middleware::panel");
        forward(self.signals.button_pressed(), &panel, StationEvent::ButtonPressed);
        let actions = Arc::clone(&self.actions);
        self.signals.connection_established().subscribe(move |()| {
            let actions = Arc::clone(&actions);
            async move { actions.resend_last().await }
        });
        self.signals.connection_lost().subscribe(|()| {
            warn!("indicator panel unreachable; signals are dropped until it returns");
            std::future::ready(())
        });

        let store = self.bus.publisher("weighgate-memory::store");
        let failed = store.clone();
        self.store.database_failed().subscribe(move |reason| {
            failed.emit(StationEvent::DatabaseFailed(reason));
            std::future::ready(())
        });
        forward(self.store.database_restored(), &store, StationEvent::DatabaseRestored);
    }

    /// Start the state machine, then the panel link, the scale poll loop and
    /// the store's flush task.
    ///
    /// # Errors
    ///
    /// Failing to open the panel or the scale aborts startup; whatever was
    /// already started is stopped again.  [`StationError::Channel`] if the
    /// state machine was lost by an earlier aborted stop.
    pub async fn start(&self) -> Result<(), StationError> {
        self.start_machine()?;

        if let Err(e) = self.signals.start().await {
            error!(error = %e, "panel link failed to open; startup aborted");
            self.stop_machine().await;
            return Err(e);
        }
        if let Err(e) = self.processor.start().await {
            error!(error = %e, "scale link failed to open; startup aborted");
            self.signals.stop().await;
            self.stop_machine().await;
            return Err(e);
        }
        self.store.start();
        info!("station started");
        Ok(())
    }

    /// Stop producers first, then the state machine, then the panel.
    pub async fn stop(&self) {
        self.processor.stop().await;
        self.store.stop().await;
        self.stop_machine().await;
        self.signals.stop().await;
        info!("station stopped");
    }

    /// Compensating action: remove the most recent weighing.
    pub async fn delete_last_weighing(&self) -> Result<Option<Removed>, StationError> {
        self.store.delete_last().await
    }

    pub fn store(&self) -> &RecordStore {
        &self.store
    }

    pub fn subscribe_states(&self) -> broadcast::Receiver<StateChange> {
        self.bus.subscribe_states()
    }

    fn start_machine(&self) -> Result<(), StationError> {
        let mut running = self.running.lock().unwrap_or_else(|p| p.into_inner());
        if running.is_some() {
            return Ok(());
        }
        let (machine, inbox) = self
            .parked
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .take()
            .ok_or_else(|| StationError::Channel("state machine unavailable".to_string()))?;
        let (tx, rx) = watch::channel(false);
        *running = Some((tx, tokio::spawn(machine.run(inbox, rx))));
        Ok(())
    }

    async fn stop_machine(&self) {
        let running = self.running.lock().unwrap_or_else(|p| p.into_inner()).take();
        let Some((tx, mut handle)) = running else {
            return;
        };
        let _ = tx.send(true);
        match tokio::time::timeout(self.stop_grace, &mut handle).await {
            Ok(Ok(parts)) => {
                *self.parked.lock().unwrap_or_else(|p| p.into_inner()) = Some(parts);
            }
            Ok(Err(e)) => error!(error = %e, "state machine task failed"),
            Err(_) => {
                warn!("state machine did not stop in time; aborting");
                handle.abort();
            }
        }
    }
}

/// Re-publish every notification of `registry` as `event`.
fn forward(registry: &HandlerRegistry<()>, publisher: &EventPublisher, event: StationEvent) {
    let publisher = publisher.clone();
    registry.subscribe(move |()| {
        publisher.emit(event.clone());
        std::future::ready(())
    });
}
