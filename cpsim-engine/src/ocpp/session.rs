//! Charge point session state machine
//!
//! Manages the lifecycle of one charge point connection to the CSMS:
//! - Connect and BootNotification
//! - StartTransaction → charging with periodic MeterValues
//! - StopTransaction → back to idle
//! - Disconnect, which drops pending calls and the meter task
//!
//! Every method is synchronous and returns quickly; frames are handed to the
//! transport without waiting. Callers serialize access to a `Session`.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::debug;

use super::messages::*;
use super::meter::{self, MeterEmitter, MeterSample, MeterTick};
use super::registry::{CallRegistry, Response};
use super::transaction_ids::TransactionIdSource;
use super::types::*;
use crate::config::{OcppVersion, SimulatorConfig};
use crate::event_log::{EventLog, LogKind};
use crate::transport::{Connection, EventSender, Transport, TransportEvent};

/// EVSE id reported in 2.0.1 payloads; the simulator models one EVSE
const EVSE_ID: u32 = 1;

/// Session state in the charge point lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// No connection
    Disconnected,
    /// Transport opening, BootNotification queued
    Connecting,
    /// Open and idle (possibly awaiting a StartTransaction result)
    Connected,
    /// Transaction active, meter task running
    Charging,
    /// StopTransaction sent, awaiting its result
    Stopping,
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// Active transaction state
#[derive(Debug, Clone)]
pub struct Transaction {
    pub transaction_id: i64,
    pub connector_id: u32,
    pub id_tag: String,
    pub started_at: DateTime<Utc>,
    /// Simulated energy register, kWh
    pub energy_kwh: f64,
}

/// Returned when a transaction has just started and metering should begin
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MeterStart {
    pub connector_id: u32,
    pub transaction_id: i64,
    pub interval: Duration,
}

/// Main session state
pub struct Session {
    config: SimulatorConfig,
    state: SessionState,
    /// Bumped on every connect and reset; tags transport events and ticks
    generation: u64,
    connection: Option<Box<dyn Connection>>,
    registry: CallRegistry,
    transaction: Option<Transaction>,
    start_pending: Option<String>,
    stop_pending: Option<String>,
    registration: Option<RegistrationStatus>,
    meter: MeterEmitter,
    log: EventLog,
    /// Republishes `state` on every transition and when a start settles
    state_tx: watch::Sender<SessionState>,
}

impl Session {
    pub fn new(config: SimulatorConfig) -> Self {
        let log = EventLog::new(config.log_capacity);
        Self {
            config,
            state: SessionState::Disconnected,
            generation: 0,
            connection: None,
            registry: CallRegistry::new(),
            transaction: None,
            start_pending: None,
            stop_pending: None,
            registration: None,
            meter: MeterEmitter::new(),
            log,
            state_tx: watch::Sender::new(SessionState::Disconnected),
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn config(&self) -> &SimulatorConfig {
        &self.config
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn transaction(&self) -> Option<&Transaction> {
        self.transaction.as_ref()
    }

    pub fn transaction_id(&self) -> Option<i64> {
        self.transaction.as_ref().map(|tx| tx.transaction_id)
    }

    /// A StartTransaction is out and unanswered
    pub fn is_start_pending(&self) -> bool {
        self.start_pending.is_some()
    }

    pub fn is_meter_running(&self) -> bool {
        self.meter.is_running()
    }

    /// Status from the last BootNotification result on this connection
    pub fn registration(&self) -> Option<RegistrationStatus> {
        self.registration
    }

    pub fn pending_calls(&self) -> usize {
        self.registry.len()
    }

    pub fn log(&self) -> &EventLog {
        &self.log
    }

    /// Receiver woken on every state change, and when a pending start
    /// settles without one
    pub fn watch_state(&self) -> watch::Receiver<SessionState> {
        self.state_tx.subscribe()
    }

    // ========================================================================
    // Commands
    // ========================================================================

    /// Open the transport and queue BootNotification. Returns the new
    /// connection generation.
    pub fn connect(
        &mut self,
        transport: &dyn Transport,
        events: EventSender,
    ) -> Result<u64, OcppError> {
        if self.state != SessionState::Disconnected {
            return Err(self.reject(format!("connect refused: session is {}", self.state)));
        }
        if self.config.csms_url.trim().is_empty() || self.config.station_id.trim().is_empty() {
            return Err(self.reject(
                "connect refused: OCPP server URL and charge station id are required",
            ));
        }
        if let Err(e) = self.config.validate() {
            return Err(self.reject(format!("connect refused: {e}")));
        }

        let boot = to_payload(self.boot_notification_request())?;
        let url = self.config.connection_url();
        let subprotocol = self.config.ocpp_version.subprotocol();

        let connection = match transport.connect(&url, subprotocol, events) {
            Ok(connection) => connection,
            Err(e) => {
                self.log
                    .record(LogKind::Failure, format!("Connection to {url} failed: {e}"));
                return Err(e);
            }
        };

        self.generation += 1;
        self.connection = Some(connection);
        self.set_state(SessionState::Connecting);
        self.log.record(
            LogKind::Accepted,
            format!("Connecting to {url} ({subprotocol})"),
        );

        self.submit(Action::BootNotification, boot)?;
        Ok(self.generation)
    }

    /// Send StartTransaction. Charging begins once the CSMS confirms it.
    pub fn start_charging(&mut self) -> Result<String, OcppError> {
        match self.state {
            SessionState::Connected => {}
            SessionState::Charging | SessionState::Stopping => {
                return Err(self.reject("start refused: charging is already active"));
            }
            SessionState::Disconnected | SessionState::Connecting => {
                return Err(self.reject("start refused: not connected to the OCPP backend"));
            }
        }
        if self.start_pending.is_some() {
            return Err(self.reject(
                "start refused: a StartTransaction is already awaiting its response",
            ));
        }
        if self.config.id_tag.trim().is_empty() {
            return Err(self.reject("start refused: an id tag is required"));
        }
        if self.config.connector_id == 0 {
            return Err(self.reject("start refused: a connector id is required"));
        }

        let request = StartTransactionRequest {
            connector_id: self.config.connector_id,
            id_tag: self.config.id_tag.clone(),
            evse_id: self.evse_id(),
        };
        let unique_id = self.submit(Action::StartTransaction, to_payload(request)?)?;
        self.start_pending = Some(unique_id.clone());
        self.log.record(
            LogKind::Accepted,
            format!(
                "Start charging requested on connector {} for {}",
                self.config.connector_id, self.config.id_tag
            ),
        );
        Ok(unique_id)
    }

    /// Stop metering and send StopTransaction
    pub fn stop_charging(&mut self) -> Result<String, OcppError> {
        if self.state == SessionState::Stopping {
            return Err(self.reject("stop refused: a StopTransaction is already in flight"));
        }
        let transaction = match self.transaction.clone() {
            Some(tx) if self.state == SessionState::Charging => tx,
            _ => return Err(self.reject("stop refused: no active transaction")),
        };

        let request = StopTransactionRequest {
            transaction_id: transaction.transaction_id,
            id_tag: transaction.id_tag.clone(),
            evse_id: self.evse_id(),
        };
        let payload = to_payload(request)?;

        self.meter.stop();
        let unique_id = self.submit(Action::StopTransaction, payload)?;
        self.stop_pending = Some(unique_id.clone());
        self.set_state(SessionState::Stopping);
        self.log.record(
            LogKind::Accepted,
            format!(
                "Stop charging requested for transaction {}",
                transaction.transaction_id
            ),
        );
        Ok(unique_id)
    }

    /// Close the connection and reset. The meter task is cancelled before
    /// this returns.
    pub fn disconnect(&mut self) -> Result<(), OcppError> {
        if self.state == SessionState::Disconnected {
            return Err(self.reject("disconnect refused: not connected"));
        }
        self.log.record(LogKind::Accepted, "Disconnect requested");
        self.reset();
        self.log.record(LogKind::Info, "Disconnected from OCPP backend.");
        Ok(())
    }

    /// Change the meter cadence; a running emitter picks it up after its
    /// current wait.
    pub fn set_meter_interval(&mut self, secs: u64) -> Result<(), OcppError> {
        if secs == 0 {
            return Err(self.reject("meter interval must be a positive number of seconds"));
        }
        self.config.meter_interval_secs = secs;
        self.log.record(
            LogKind::Accepted,
            format!("Meter interval set to {secs}s"),
        );
        Ok(())
    }

    pub fn set_id_tag(&mut self, id_tag: impl Into<String>) -> Result<(), OcppError> {
        if self.transaction_in_progress() {
            return Err(self.reject("id tag cannot change while a transaction is in progress"));
        }
        self.config.id_tag = id_tag.into();
        self.log
            .record(LogKind::Accepted, format!("Id tag set to {}", self.config.id_tag));
        Ok(())
    }

    pub fn set_connector_id(&mut self, connector_id: u32) -> Result<(), OcppError> {
        if connector_id == 0 {
            return Err(self.reject("connector id must be positive"));
        }
        if self.transaction_in_progress() {
            return Err(self.reject("connector cannot change while a transaction is in progress"));
        }
        self.config.connector_id = connector_id;
        self.log
            .record(LogKind::Accepted, format!("Connector set to {connector_id}"));
        Ok(())
    }

    // ========================================================================
    // Transport and timer input
    // ========================================================================

    /// Apply one transport event. Returns `Some` when charging just started
    /// and the caller should start the meter task.
    pub fn handle_event(
        &mut self,
        event: TransportEvent,
        transaction_ids: &dyn TransactionIdSource,
    ) -> Option<MeterStart> {
        match event {
            TransportEvent::Opened => {
                if self.state == SessionState::Connecting {
                    self.set_state(SessionState::Connected);
                    self.log.record(LogKind::Info, "Connected to OCPP backend.");
                }
                None
            }
            TransportEvent::Text(frame) => self.handle_frame(&frame, transaction_ids),
            TransportEvent::Closed => {
                if self.state != SessionState::Disconnected {
                    self.reset();
                    self.log.record(LogKind::Info, "Disconnected from OCPP backend.");
                }
                None
            }
            TransportEvent::Error(detail) => {
                if self.state != SessionState::Disconnected {
                    self.log.record(
                        LogKind::Failure,
                        OcppError::TransportFailure(detail).to_string(),
                    );
                    self.reset();
                }
                None
            }
        }
    }

    /// Decode and dispatch one inbound text frame
    pub fn handle_frame(
        &mut self,
        frame: &str,
        transaction_ids: &dyn TransactionIdSource,
    ) -> Option<MeterStart> {
        self.log
            .record(LogKind::Received, format!("Received message: {frame}"));

        match Envelope::decode(frame) {
            Err(e) => {
                self.log.record(LogKind::Failure, e.to_string());
                None
            }
            Ok(Envelope::Call(call)) => {
                self.refuse_call(call);
                None
            }
            Ok(Envelope::CallResult(CallResult { unique_id, payload })) => {
                self.resolve(&unique_id, Response::Result(payload), transaction_ids)
            }
            Ok(Envelope::CallError(error)) => {
                let unique_id = error.unique_id.clone();
                self.resolve(&unique_id, Response::Error(error), transaction_ids)
            }
        }
    }

    /// Drop calls older than the call timeout and apply their consequences.
    /// Returns how many expired.
    pub fn expire_calls(&mut self, now: Instant) -> usize {
        let expired = self.registry.expire(now, self.config.call_timeout());

        for call in &expired {
            let timeout = OcppError::CallTimeout {
                action: call.action,
                unique_id: call.unique_id.clone(),
            };
            self.log.record(LogKind::Failure, timeout.to_string());

            match call.action {
                Action::StartTransaction
                    if self.start_pending.as_deref() == Some(call.unique_id.as_str()) =>
                {
                    self.start_pending = None;
                    self.publish_state();
                }
                Action::StopTransaction => self.finish_stop(&call.unique_id, "no response"),
                _ => {}
            }
        }

        expired.len()
    }

    /// Begin periodic MeterValues for a just-started transaction
    pub fn start_meter<F>(&mut self, start: MeterStart, on_tick: F)
    where
        F: FnMut(MeterTick) -> Option<Duration> + Send + 'static,
    {
        if self.state != SessionState::Charging {
            return;
        }
        self.meter.start(
            start.connector_id,
            start.transaction_id,
            start.interval,
            on_tick,
        );
        self.log.record(
            LogKind::Info,
            format!("Meter values every {}s", start.interval.as_secs()),
        );
    }

    /// One emitter tick: submit a MeterValues call if still charging.
    /// Returns the delay to the next tick, or `None` to end the emitter.
    pub fn meter_tick(&mut self, tick: MeterTick) -> Option<Duration> {
        if !self.meter.is_current(&tick) {
            return None;
        }

        let charging = self.state == SessionState::Charging
            && self.connection.is_some()
            && self.transaction_id() == Some(tick.transaction_id);
        if !charging {
            debug!("Meter tick outside charging, stopping emitter");
            self.meter.stop();
            return None;
        }

        let energy_kwh = {
            let tx = self.transaction.as_mut()?;
            tx.energy_kwh = meter::next_energy_reading(tx.energy_kwh, &mut rand::thread_rng());
            tx.energy_kwh
        };
        let request = meter::meter_values_request(
            tick.connector_id,
            tick.transaction_id,
            MeterSample::energy_register(energy_kwh),
        );

        let payload = to_payload(request).ok()?;
        self.submit(Action::MeterValues, payload).ok()?;
        Some(self.config.meter_interval())
    }

    // ========================================================================
    // Internals
    // ========================================================================

    fn set_state(&mut self, state: SessionState) {
        self.state = state;
        self.publish_state();
    }

    fn publish_state(&self) {
        self.state_tx.send_replace(self.state);
    }

    fn reject(&mut self, reason: impl Into<String>) -> OcppError {
        let reason = reason.into();
        self.log.record(LogKind::Rejected, reason.clone());
        OcppError::InvalidCommand(reason)
    }

    fn transaction_in_progress(&self) -> bool {
        self.transaction.is_some() || self.start_pending.is_some() || self.stop_pending.is_some()
    }

    fn evse_id(&self) -> Option<u32> {
        (self.config.ocpp_version == OcppVersion::V201).then_some(EVSE_ID)
    }

    fn boot_notification_request(&self) -> BootNotificationRequest {
        let (firmware_version, reason) = match self.config.ocpp_version {
            OcppVersion::V16 => (self.config.firmware_version.clone(), None),
            OcppVersion::V201 => (None, Some(BootReason::PowerUp)),
        };
        BootNotificationRequest {
            charge_point_vendor: self.config.vendor.clone(),
            charge_point_model: self.config.model.clone(),
            firmware_version,
            reason,
        }
    }

    /// Register a CALL and put it on the wire
    fn submit(&mut self, action: Action, payload: Value) -> Result<String, OcppError> {
        let submitted = self.registry.submit(action, payload);
        self.send_frame(submitted.frame)?;
        Ok(submitted.unique_id)
    }

    /// A failed send is a lost transport: the session resets
    fn send_frame(&mut self, frame: String) -> Result<(), OcppError> {
        let sent = match &self.connection {
            Some(connection) => connection.send(frame.clone()),
            None => Err(OcppError::TransportFailure("no open connection".into())),
        };

        match sent {
            Ok(()) => {
                self.log.record(LogKind::Sent, format!("Sent message: {frame}"));
                Ok(())
            }
            Err(e) => {
                self.log.record(LogKind::Failure, format!("Send failed: {e}"));
                if self.state != SessionState::Disconnected {
                    self.reset();
                    self.log.record(LogKind::Info, "Disconnected from OCPP backend.");
                }
                Err(e)
            }
        }
    }

    /// Server-initiated CALLs are outside this simulator's repertoire
    fn refuse_call(&mut self, call: Call) {
        let reply = CallError::new(
            call.unique_id,
            ErrorCode::NotImplemented,
            format!("{} is not supported by this charge point", call.action),
        );
        // A failed send has already reset the session
        let _ = self.send_frame(Envelope::CallError(reply).encode());
    }

    fn resolve(
        &mut self,
        unique_id: &str,
        response: Response,
        transaction_ids: &dyn TransactionIdSource,
    ) -> Option<MeterStart> {
        match self.registry.resolve(unique_id, response) {
            Ok((action, response)) => match action {
                Action::BootNotification => {
                    self.on_boot_response(response);
                    None
                }
                Action::StartTransaction => {
                    self.on_start_response(unique_id, response, transaction_ids)
                }
                Action::StopTransaction => {
                    self.on_stop_response(unique_id, response);
                    None
                }
                Action::MeterValues => {
                    if let Response::Error(error) = response {
                        self.log.record(
                            LogKind::Failure,
                            format!(
                                "MeterValues failed: {} {}",
                                error.error_code, error.error_description
                            ),
                        );
                    }
                    None
                }
            },
            Err(e) => {
                self.log.record(LogKind::Failure, format!("{e}, frame dropped"));
                None
            }
        }
    }

    fn on_boot_response(&mut self, response: Response) {
        let payload = match response {
            Response::Result(payload) => payload,
            Response::Error(error) => {
                self.log.record(
                    LogKind::Failure,
                    format!(
                        "BootNotification failed: {} {}",
                        error.error_code, error.error_description
                    ),
                );
                return;
            }
        };

        match serde_json::from_value::<BootNotificationResponse>(payload) {
            Ok(boot) => {
                self.registration = Some(boot.status);
                let interval = boot
                    .interval
                    .map(|secs| format!(", interval {secs}s"))
                    .unwrap_or_default();
                let (kind, verdict) = match boot.status {
                    RegistrationStatus::Accepted => (LogKind::Accepted, "accepted"),
                    RegistrationStatus::Pending => (LogKind::Info, "pending"),
                    RegistrationStatus::Rejected => (LogKind::Failure, "rejected"),
                };
                self.log
                    .record(kind, format!("BootNotification {verdict}{interval}"));
            }
            Err(e) => {
                self.log.record(
                    LogKind::Failure,
                    format!("BootNotification result not understood: {e}"),
                );
            }
        }
    }

    fn on_start_response(
        &mut self,
        unique_id: &str,
        response: Response,
        transaction_ids: &dyn TransactionIdSource,
    ) -> Option<MeterStart> {
        if self.start_pending.as_deref() != Some(unique_id) {
            self.log.record(
                LogKind::Failure,
                format!("StartTransaction result {unique_id} has no start awaiting it"),
            );
            return None;
        }
        self.start_pending = None;
        self.publish_state();

        let payload = match response {
            Response::Result(payload) => payload,
            Response::Error(error) => {
                self.log.record(
                    LogKind::Failure,
                    format!(
                        "StartTransaction rejected: {} {}",
                        error.error_code, error.error_description
                    ),
                );
                return None;
            }
        };

        if let Some(info) = payload.get("idTagInfo").filter(|info| !info.is_null()) {
            match serde_json::from_value::<IdTagInfo>(info.clone()) {
                Ok(IdTagInfo {
                    status: AuthorizationStatus::Accepted,
                }) => {}
                Ok(IdTagInfo { status }) => {
                    self.log.record(
                        LogKind::Failure,
                        format!(
                            "StartTransaction refused for id tag {}: {:?}",
                            self.config.id_tag, status
                        ),
                    );
                    return None;
                }
                Err(e) => {
                    self.log.record(
                        LogKind::Failure,
                        format!("StartTransaction idTagInfo has no readable status: {e}"),
                    );
                    return None;
                }
            }
        }

        let Some(transaction_id) = transaction_ids.transaction_id(&payload) else {
            self.log.record(
                LogKind::Failure,
                "StartTransaction result carried no usable transactionId",
            );
            return None;
        };

        if self.state != SessionState::Connected {
            return None;
        }

        self.transaction = Some(Transaction {
            transaction_id,
            connector_id: self.config.connector_id,
            id_tag: self.config.id_tag.clone(),
            started_at: Utc::now(),
            energy_kwh: 0.0,
        });
        self.set_state(SessionState::Charging);
        self.log.record(
            LogKind::Accepted,
            format!("Charging started, transaction {transaction_id}"),
        );

        Some(MeterStart {
            connector_id: self.config.connector_id,
            transaction_id,
            interval: self.config.meter_interval(),
        })
    }

    fn on_stop_response(&mut self, unique_id: &str, response: Response) {
        match response {
            Response::Result(_) => self.finish_stop(unique_id, "confirmed"),
            Response::Error(error) => {
                self.log.record(
                    LogKind::Failure,
                    format!(
                        "StopTransaction failed: {} {}",
                        error.error_code, error.error_description
                    ),
                );
                self.finish_stop(unique_id, "refused by backend");
            }
        }
    }

    /// Any resolution of the in-flight StopTransaction ends the transaction
    fn finish_stop(&mut self, unique_id: &str, outcome: &str) {
        if self.stop_pending.as_deref() != Some(unique_id) {
            return;
        }
        self.stop_pending = None;

        if let Some(tx) = self.transaction.take() {
            self.log.record(
                LogKind::Info,
                format!(
                    "Transaction {} ended ({outcome}), {:.2} kWh delivered",
                    tx.transaction_id, tx.energy_kwh
                ),
            );
        }
        if self.state == SessionState::Stopping {
            self.set_state(SessionState::Connected);
        }
    }

    /// Back to Disconnected: meter stopped, connection closed, pending calls
    /// and transaction state dropped
    fn reset(&mut self) {
        self.meter.stop();
        if let Some(connection) = self.connection.take() {
            connection.close();
        }

        let dropped = self.registry.clear();
        if dropped > 0 {
            self.log
                .record(LogKind::Info, format!("Discarded {dropped} pending call(s)"));
        }
        if let Some(tx) = self.transaction.take() {
            self.log.record(
                LogKind::Info,
                format!("Transaction {} abandoned", tx.transaction_id),
            );
        }

        self.start_pending = None;
        self.stop_pending = None;
        self.registration = None;
        self.set_state(SessionState::Disconnected);
        self.generation += 1;
    }
}

fn to_payload(value: impl Serialize) -> Result<Value, OcppError> {
    Ok(serde_json::to_value(value)?)
}
