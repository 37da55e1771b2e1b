//! Charge point handle
//!
//! [`ChargePoint`] owns one [`Session`] behind a mutex and drives it from
//! three sources:
//! - user commands (the public methods here)
//! - transport events, fed by a pump task spawned on each connect
//! - the meter task and the call-timeout sweep
//!
//! Every path takes the same lock and calls a synchronous session method,
//! so the lock is never held across an `.await`.

use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info};

use super::messages::OcppError;
use super::session::{Session, SessionState, Transaction};
use super::transaction_ids::{ResponseTransactionIds, TransactionIdSource};
use super::types::RegistrationStatus;
use crate::config::SimulatorConfig;
use crate::event_log::LogEntry;
use crate::transport::{Transport, TransportEvent};

struct Shared {
    session: Mutex<Session>,
    transport: Box<dyn Transport>,
    transaction_ids: Box<dyn TransactionIdSource>,
}

/// Simulated OCPP charge point
#[derive(Clone)]
pub struct ChargePoint {
    shared: Arc<Shared>,
}

impl ChargePoint {
    /// Create a charge point that takes transaction ids from the CSMS
    pub fn new(config: SimulatorConfig, transport: impl Transport + 'static) -> Self {
        Self::with_transaction_ids(config, transport, ResponseTransactionIds)
    }

    pub fn with_transaction_ids(
        config: SimulatorConfig,
        transport: impl Transport + 'static,
        transaction_ids: impl TransactionIdSource + 'static,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                session: Mutex::new(Session::new(config)),
                transport: Box::new(transport),
                transaction_ids: Box::new(transaction_ids),
            }),
        }
    }

    // ========================================================================
    // Commands
    // ========================================================================

    /// Open the connection and queue BootNotification. Returns once the
    /// transport has been asked to connect; watch [`ChargePoint::state`] for
    /// `Connected`.
    pub fn connect(&self) -> Result<(), OcppError> {
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        let (generation, sweep_interval) = {
            let mut session = self.shared.session.lock();
            let generation = session.connect(self.shared.transport.as_ref(), events_tx)?;
            (generation, session.config().sweep_interval())
        };

        tokio::spawn(pump(
            Arc::downgrade(&self.shared),
            generation,
            events_rx,
            sweep_interval,
        ));
        Ok(())
    }

    pub fn disconnect(&self) -> Result<(), OcppError> {
        self.shared.session.lock().disconnect()
    }

    /// Send StartTransaction; returns its unique id
    pub fn start_charging(&self) -> Result<String, OcppError> {
        self.shared.session.lock().start_charging()
    }

    /// Send StopTransaction; returns its unique id
    pub fn stop_charging(&self) -> Result<String, OcppError> {
        self.shared.session.lock().stop_charging()
    }

    pub fn set_meter_interval(&self, secs: u64) -> Result<(), OcppError> {
        self.shared.session.lock().set_meter_interval(secs)
    }

    pub fn set_id_tag(&self, id_tag: impl Into<String>) -> Result<(), OcppError> {
        self.shared.session.lock().set_id_tag(id_tag)
    }

    pub fn set_connector_id(&self, connector_id: u32) -> Result<(), OcppError> {
        self.shared.session.lock().set_connector_id(connector_id)
    }

    // ========================================================================
    // Observers
    // ========================================================================

    pub fn state(&self) -> SessionState {
        self.shared.session.lock().state()
    }

    pub fn transaction_id(&self) -> Option<i64> {
        self.shared.session.lock().transaction_id()
    }

    pub fn transaction(&self) -> Option<Transaction> {
        self.shared.session.lock().transaction().cloned()
    }

    pub fn is_start_pending(&self) -> bool {
        self.shared.session.lock().is_start_pending()
    }

    pub fn is_meter_running(&self) -> bool {
        self.shared.session.lock().is_meter_running()
    }

    pub fn registration(&self) -> Option<RegistrationStatus> {
        self.shared.session.lock().registration()
    }

    pub fn pending_calls(&self) -> usize {
        self.shared.session.lock().pending_calls()
    }

    pub fn config(&self) -> SimulatorConfig {
        self.shared.session.lock().config().clone()
    }

    /// Snapshot of the event log, oldest first
    pub fn event_log(&self) -> Vec<LogEntry> {
        self.shared.session.lock().log().entries()
    }

    /// Live feed of new log entries
    pub fn subscribe_log(&self) -> broadcast::Receiver<LogEntry> {
        self.shared.session.lock().log().subscribe()
    }

    /// Receiver woken on every session state change
    pub fn watch_state(&self) -> watch::Receiver<SessionState> {
        self.shared.session.lock().watch_state()
    }

    /// Wait until the session reaches `state` or `timeout` passes
    pub async fn wait_for_state(&self, state: SessionState, timeout: Duration) -> bool {
        let mut rx = self.watch_state();
        let reached = tokio::time::timeout(timeout, rx.wait_for(|current| *current == state)).await;
        matches!(reached, Ok(Ok(_)))
    }

    /// Wait for the outstanding StartTransaction to settle. Returns whether
    /// charging began; a refused, failed or timed-out start returns `false`
    /// as soon as it is known.
    pub async fn wait_for_start(&self, timeout: Duration) -> bool {
        let mut rx = self.watch_state();
        let settled = tokio::time::timeout(timeout, async {
            while self.is_start_pending() {
                if rx.changed().await.is_err() {
                    break;
                }
            }
        })
        .await;
        settled.is_ok() && self.state() == SessionState::Charging
    }
}

impl Shared {
    /// Apply one event from connection `generation`. Returns false once that
    /// connection is no longer the session's current one.
    fn on_transport_event(self: &Arc<Self>, generation: u64, event: TransportEvent) -> bool {
        let mut session = self.session.lock();
        if session.generation() != generation {
            debug!("Dropping {:?} from stale connection", event);
            return false;
        }

        if let Some(start) = session.handle_event(event, self.transaction_ids.as_ref()) {
            let weak = Arc::downgrade(self);
            session.start_meter(start, move |tick| {
                let shared = weak.upgrade()?;
                let next = shared.session.lock().meter_tick(tick);
                next
            });
        }

        session.generation() == generation
    }

    fn sweep(&self, generation: u64, now: Instant) -> bool {
        let mut session = self.session.lock();
        if session.generation() != generation {
            return false;
        }
        session.expire_calls(now);
        session.generation() == generation
    }
}

/// Feed transport events into the session and run the timeout sweep until
/// the connection is replaced or the charge point is dropped
async fn pump(
    shared: Weak<Shared>,
    generation: u64,
    mut events: mpsc::UnboundedReceiver<TransportEvent>,
    sweep_interval: Duration,
) {
    let mut sweep = tokio::time::interval(sweep_interval);
    sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        let current = tokio::select! {
            event = events.recv() => {
                let Some(event) = event else { break };
                let Some(shared) = shared.upgrade() else { break };
                shared.on_transport_event(generation, event)
            }
            _ = sweep.tick() => {
                let Some(shared) = shared.upgrade() else { break };
                shared.sweep(generation, Instant::now())
            }
        };
        if !current {
            break;
        }
    }

    info!("Connection {} pump stopped", generation);
}
