//! Charge point scenarios against an in-memory transport
//!
//! Time is paused: the meter task and the timeout sweep run on tokio's
//! virtual clock, so a 60 second meter interval costs nothing.

use std::sync::Arc;
use std::time::Duration;

use cpsim_engine::ocpp::{Call, CallResult};
use cpsim_engine::{
    ChargePoint, Connection, Envelope, EventSender, LogKind, OcppError, OcppVersion,
    RegistrationStatus, SessionState, SimulatedTransactionIds, SimulatorConfig, Transport,
    TransportEvent,
};
use parking_lot::Mutex;
use serde_json::{json, Value};

// ============================================================================
// In-memory transport
// ============================================================================

#[derive(Default)]
struct Wire {
    frames: Vec<String>,
    senders: Vec<EventSender>,
    urls: Vec<(String, String)>,
    closed: usize,
    fail_sends: bool,
}

#[derive(Clone, Default)]
struct MockTransport {
    wire: Arc<Mutex<Wire>>,
}

struct MockConnection {
    wire: Arc<Mutex<Wire>>,
}

impl Transport for MockTransport {
    fn connect(
        &self,
        url: &str,
        subprotocol: &str,
        events: EventSender,
    ) -> Result<Box<dyn Connection>, OcppError> {
        let mut wire = self.wire.lock();
        wire.urls.push((url.to_string(), subprotocol.to_string()));
        wire.senders.push(events);
        Ok(Box::new(MockConnection {
            wire: self.wire.clone(),
        }))
    }
}

impl Connection for MockConnection {
    fn send(&self, frame: String) -> Result<(), OcppError> {
        let mut wire = self.wire.lock();
        if wire.fail_sends {
            return Err(OcppError::TransportFailure("socket gone".into()));
        }
        wire.frames.push(frame);
        Ok(())
    }

    fn close(&self) {
        self.wire.lock().closed += 1;
    }
}

impl MockTransport {
    /// Deliver an event on the most recent connection
    fn emit(&self, event: TransportEvent) {
        let sender = self.wire.lock().senders.last().cloned().unwrap();
        sender.send(event).unwrap();
    }

    fn emit_on(&self, connection: usize, event: TransportEvent) {
        let sender = self.wire.lock().senders[connection].clone();
        let _ = sender.send(event);
    }

    fn respond(&self, unique_id: &str, payload: Value) {
        let frame = Envelope::CallResult(CallResult {
            unique_id: unique_id.to_string(),
            payload,
        })
        .encode();
        self.emit(TransportEvent::Text(frame));
    }

    fn calls(&self, action: &str) -> Vec<Call> {
        self.wire
            .lock()
            .frames
            .iter()
            .filter_map(|frame| match Envelope::decode(frame) {
                Ok(Envelope::Call(call)) if call.action == action => Some(call),
                _ => None,
            })
            .collect()
    }

    fn last_call(&self, action: &str) -> Call {
        self.calls(action).pop().unwrap()
    }

    fn frame_count(&self) -> usize {
        self.wire.lock().frames.len()
    }
}

// ============================================================================
// Helpers
// ============================================================================

fn config(version: OcppVersion) -> SimulatorConfig {
    SimulatorConfig::new("ws://csms.test/ocpp", "CP001")
        .with_id_tag("User123")
        .with_connector(1)
        .with_meter_interval(60)
        .with_version(version)
}

/// Let the pump and meter tasks run
async fn settle() {
    tokio::time::sleep(Duration::from_millis(10)).await;
}

async fn connected(version: OcppVersion) -> (ChargePoint, MockTransport) {
    let transport = MockTransport::default();
    let cp = ChargePoint::new(config(version), transport.clone());

    cp.connect().unwrap();
    transport.emit(TransportEvent::Opened);
    settle().await;

    let boot = transport.last_call("BootNotification");
    transport.respond(&boot.unique_id, json!({"status": "Accepted", "interval": 300}));
    settle().await;

    (cp, transport)
}

async fn charging(version: OcppVersion) -> (ChargePoint, MockTransport) {
    let (cp, transport) = connected(version).await;

    let start_id = cp.start_charging().unwrap();
    transport.respond(
        &start_id,
        json!({"transactionId": 42, "idTagInfo": {"status": "Accepted"}}),
    );
    settle().await;

    (cp, transport)
}

// ============================================================================
// Scenarios
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_boot_notification_v16() {
    let (cp, transport) = connected(OcppVersion::V16).await;

    let boot = transport.last_call("BootNotification");
    assert_eq!(boot.payload["chargePointVendor"], "Firebase Studio");
    assert_eq!(boot.payload["chargePointModel"], "OCPPulse Simulator");
    assert_eq!(boot.payload["firmwareVersion"], "1.0");
    assert!(boot.payload.get("reason").is_none());

    let (url, subprotocol) = transport.wire.lock().urls[0].clone();
    assert_eq!(url, "ws://csms.test/ocpp/CP001");
    assert_eq!(subprotocol, "ocpp1.6");

    assert_eq!(cp.state(), SessionState::Connected);
    assert_eq!(cp.registration(), Some(RegistrationStatus::Accepted));
    assert_eq!(cp.pending_calls(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_boot_notification_v201() {
    let (_cp, transport) = connected(OcppVersion::V201).await;

    let boot = transport.last_call("BootNotification");
    assert_eq!(boot.payload["reason"], "PowerUp");
    assert!(boot.payload.get("firmwareVersion").is_none());
    assert_eq!(transport.wire.lock().urls[0].1, "ocpp2.0.1");
}

#[tokio::test(start_paused = true)]
async fn test_start_transaction_begins_charging() {
    let (cp, transport) = connected(OcppVersion::V16).await;

    let start_id = cp.start_charging().unwrap();
    let start = transport.last_call("StartTransaction");
    assert_eq!(start.unique_id, start_id);
    assert_eq!(start.payload, json!({"connectorId": 1, "idTag": "User123"}));
    assert!(cp.is_start_pending());
    assert_eq!(cp.state(), SessionState::Connected);

    transport.respond(&start_id, json!({"transactionId": 42, "idTagInfo": {"status": "Accepted"}}));
    settle().await;

    assert_eq!(cp.state(), SessionState::Charging);
    assert_eq!(cp.transaction_id(), Some(42));
    assert!(cp.is_meter_running());
    assert!(!cp.is_start_pending());
}

#[tokio::test(start_paused = true)]
async fn test_start_transaction_v201_carries_evse() {
    let (cp, transport) = connected(OcppVersion::V201).await;

    cp.start_charging().unwrap();
    let start = transport.last_call("StartTransaction");
    assert_eq!(start.payload["evseId"], 1);
}

#[tokio::test(start_paused = true)]
async fn test_meter_values_after_interval() {
    let (cp, transport) = charging(OcppVersion::V16).await;

    tokio::time::sleep(Duration::from_secs(59)).await;
    assert!(transport.calls("MeterValues").is_empty());

    tokio::time::sleep(Duration::from_secs(1)).await;
    let meter = transport.calls("MeterValues");
    assert_eq!(meter.len(), 1);
    assert_eq!(meter[0].payload["connectorId"], 1);
    assert_eq!(meter[0].payload["transactionId"], 42);

    let sampled = &meter[0].payload["meterValue"][0]["sampledValue"][0];
    assert_eq!(sampled["measurand"], "Energy.Active.Import.Register");
    assert_eq!(sampled["unit"], "kWh");
    let kwh: f64 = sampled["value"].as_str().unwrap().parse().unwrap();
    assert!((0.01..=0.50).contains(&kwh));

    assert_eq!(cp.state(), SessionState::Charging);
}

#[tokio::test(start_paused = true)]
async fn test_stop_halts_meter() {
    let (cp, transport) = charging(OcppVersion::V16).await;

    tokio::time::sleep(Duration::from_secs(61)).await;
    assert_eq!(transport.calls("MeterValues").len(), 1);

    let stop_id = cp.stop_charging().unwrap();
    assert_eq!(cp.state(), SessionState::Stopping);
    assert!(!cp.is_meter_running());

    let stop = transport.last_call("StopTransaction");
    assert_eq!(stop.unique_id, stop_id);
    assert_eq!(stop.payload, json!({"transactionId": 42, "idTag": "User123"}));

    tokio::time::sleep(Duration::from_secs(10)).await;
    assert_eq!(cp.state(), SessionState::Stopping);

    transport.respond(&stop_id, json!({"idTagInfo": {"status": "Accepted"}}));
    settle().await;
    assert_eq!(cp.state(), SessionState::Connected);
    assert_eq!(cp.transaction_id(), None);

    tokio::time::sleep(Duration::from_secs(300)).await;
    assert_eq!(transport.calls("MeterValues").len(), 1);
}

// ============================================================================
// Command guards
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_double_start_rejected() {
    let (cp, transport) = connected(OcppVersion::V16).await;

    cp.start_charging().unwrap();
    let sent = transport.frame_count();
    assert!(matches!(cp.start_charging(), Err(OcppError::InvalidCommand(_))));
    assert_eq!(transport.frame_count(), sent);

    let (cp, transport) = charging(OcppVersion::V16).await;
    let sent = transport.frame_count();
    assert!(matches!(cp.start_charging(), Err(OcppError::InvalidCommand(_))));
    assert_eq!(transport.frame_count(), sent);
}

#[tokio::test(start_paused = true)]
async fn test_connect_without_url_rejected() {
    let transport = MockTransport::default();
    let cp = ChargePoint::new(SimulatorConfig::new("", "CP001"), transport.clone());

    assert!(matches!(cp.connect(), Err(OcppError::InvalidCommand(_))));
    assert!(transport.wire.lock().urls.is_empty());
    assert_eq!(cp.state(), SessionState::Disconnected);

    let rejected = cp
        .event_log()
        .into_iter()
        .filter(|entry| entry.kind == LogKind::Rejected)
        .count();
    assert_eq!(rejected, 1);
}

#[tokio::test(start_paused = true)]
async fn test_connect_twice_rejected() {
    let (cp, transport) = connected(OcppVersion::V16).await;
    assert!(cp.connect().is_err());
    assert_eq!(transport.wire.lock().urls.len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_id_tag_locked_during_transaction() {
    let (cp, _transport) = charging(OcppVersion::V16).await;

    assert!(cp.set_id_tag("Other").is_err());
    assert!(cp.set_connector_id(2).is_err());
    assert!(cp.set_meter_interval(0).is_err());
    assert_eq!(cp.config().id_tag, "User123");
}

// ============================================================================
// Disconnects and stale input
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_disconnect_while_charging() {
    let (cp, transport) = charging(OcppVersion::V16).await;

    cp.disconnect().unwrap();
    assert_eq!(cp.state(), SessionState::Disconnected);
    assert_eq!(cp.transaction_id(), None);
    assert_eq!(cp.pending_calls(), 0);
    assert!(!cp.is_meter_running());
    assert_eq!(transport.wire.lock().closed, 1);

    tokio::time::sleep(Duration::from_secs(600)).await;
    assert!(transport.calls("MeterValues").is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_transport_close_resets_session() {
    let (cp, transport) = charging(OcppVersion::V16).await;

    transport.emit(TransportEvent::Closed);
    settle().await;

    assert_eq!(cp.state(), SessionState::Disconnected);
    assert_eq!(cp.transaction_id(), None);
    assert!(!cp.is_meter_running());

    tokio::time::sleep(Duration::from_secs(120)).await;
    assert!(transport.calls("MeterValues").is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_transport_error_resets_session() {
    let (cp, transport) = charging(OcppVersion::V16).await;

    transport.emit(TransportEvent::Error("connection reset by peer".to_string()));
    settle().await;

    assert_eq!(cp.state(), SessionState::Disconnected);
    assert_eq!(cp.pending_calls(), 0);
    assert_eq!(cp.transaction_id(), None);
    assert!(!cp.is_meter_running());
    assert!(cp
        .event_log()
        .iter()
        .any(|entry| entry.kind == LogKind::Failure && entry.message.contains("connection reset")));

    tokio::time::sleep(Duration::from_secs(120)).await;
    assert!(transport.calls("MeterValues").is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_send_failure_resets_session() {
    let (cp, transport) = charging(OcppVersion::V16).await;
    transport.wire.lock().fail_sends = true;

    let result = cp.stop_charging();
    assert!(matches!(result, Err(OcppError::TransportFailure(_))));
    assert_eq!(cp.state(), SessionState::Disconnected);
    assert_eq!(cp.pending_calls(), 0);
    assert_eq!(cp.transaction_id(), None);
    assert!(!cp.is_meter_running());
    assert_eq!(transport.wire.lock().closed, 1);

    // The session is usable again once the transport recovers
    transport.wire.lock().fail_sends = false;
    cp.connect().unwrap();
    assert_eq!(cp.state(), SessionState::Connecting);
}

#[tokio::test(start_paused = true)]
async fn test_meter_send_failure_resets_session() {
    let (cp, transport) = charging(OcppVersion::V16).await;
    transport.wire.lock().fail_sends = true;

    tokio::time::sleep(Duration::from_secs(61)).await;
    assert_eq!(cp.state(), SessionState::Disconnected);
    assert!(!cp.is_meter_running());
    assert_eq!(cp.transaction_id(), None);
}

#[tokio::test(start_paused = true)]
async fn test_stale_connection_events_ignored() {
    let (cp, transport) = connected(OcppVersion::V16).await;
    let old_boot = transport.last_call("BootNotification");

    cp.disconnect().unwrap();
    cp.connect().unwrap();
    assert_eq!(cp.state(), SessionState::Connecting);

    transport.emit_on(0, TransportEvent::Opened);
    transport.emit_on(0, TransportEvent::Closed);
    settle().await;
    assert_eq!(cp.state(), SessionState::Connecting);

    transport.emit(TransportEvent::Opened);
    settle().await;
    assert_eq!(cp.state(), SessionState::Connected);

    // A response to a call from the previous connection matches nothing
    transport.respond(&old_boot.unique_id, json!({"status": "Accepted"}));
    settle().await;
    assert_eq!(cp.registration(), None);
    assert_eq!(cp.pending_calls(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_unmatched_response_dropped() {
    let (cp, transport) = charging(OcppVersion::V16).await;

    transport.respond("no-such-call", json!({"transactionId": 7}));
    settle().await;

    assert_eq!(cp.state(), SessionState::Charging);
    assert_eq!(cp.transaction_id(), Some(42));
    assert!(cp
        .event_log()
        .iter()
        .any(|entry| entry.kind == LogKind::Failure && entry.message.contains("no-such-call")));
}

#[tokio::test(start_paused = true)]
async fn test_malformed_frame_leaves_session_unaffected() {
    let (cp, transport) = charging(OcppVersion::V16).await;
    let pending = cp.pending_calls();

    for frame in ["not json", "{}", "[9,\"x\",{}]", "[3,\"x\"]"] {
        transport.emit(TransportEvent::Text(frame.to_string()));
    }
    settle().await;

    assert_eq!(cp.state(), SessionState::Charging);
    assert_eq!(cp.transaction_id(), Some(42));
    assert_eq!(cp.pending_calls(), pending);
}

#[tokio::test(start_paused = true)]
async fn test_server_call_answered_not_implemented() {
    let (_cp, transport) = connected(OcppVersion::V16).await;

    transport.emit(TransportEvent::Text(
        r#"[2,"srv-7","RemoteStartTransaction",{"idTag":"X"}]"#.to_string(),
    ));
    settle().await;

    let last = transport.wire.lock().frames.last().cloned().unwrap();
    match Envelope::decode(&last).unwrap() {
        Envelope::CallError(error) => {
            assert_eq!(error.unique_id, "srv-7");
            assert_eq!(error.error_code, "NotImplemented");
        }
        other => panic!("Expected CallError, got {other:?}"),
    }
}

// ============================================================================
// Timeouts and start outcomes
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_start_timeout_clears_pending() {
    let (cp, transport) = connected(OcppVersion::V16).await;

    let start_id = cp.start_charging().unwrap();
    tokio::time::sleep(Duration::from_secs(32)).await;

    assert!(!cp.is_start_pending());
    assert_eq!(cp.pending_calls(), 0);
    assert_eq!(cp.state(), SessionState::Connected);

    // Too late: the call is gone
    transport.respond(&start_id, json!({"transactionId": 42}));
    settle().await;
    assert_eq!(cp.state(), SessionState::Connected);

    // And a fresh start is allowed again
    assert!(cp.start_charging().is_ok());
}

#[tokio::test(start_paused = true)]
async fn test_stop_timeout_completes_stop() {
    let (cp, _transport) = charging(OcppVersion::V16).await;

    cp.stop_charging().unwrap();
    tokio::time::sleep(Duration::from_secs(32)).await;

    assert_eq!(cp.state(), SessionState::Connected);
    assert_eq!(cp.transaction_id(), None);
}

#[tokio::test(start_paused = true)]
async fn test_start_call_error_stays_connected() {
    let (cp, transport) = connected(OcppVersion::V16).await;

    let start_id = cp.start_charging().unwrap();
    let frame = format!(r#"[4,"{start_id}","InternalError","boom",{{}}]"#);
    transport.emit(TransportEvent::Text(frame));
    settle().await;

    assert_eq!(cp.state(), SessionState::Connected);
    assert!(!cp.is_start_pending());
    assert!(!cp.is_meter_running());
}

#[tokio::test(start_paused = true)]
async fn test_wait_for_start_returns_once_refused() {
    let (cp, transport) = connected(OcppVersion::V16).await;
    let start_id = cp.start_charging().unwrap();
    let began = tokio::time::Instant::now();

    let (began_charging, ()) = tokio::join!(cp.wait_for_start(Duration::from_secs(30)), async {
        tokio::time::sleep(Duration::from_secs(2)).await;
        transport.respond(
            &start_id,
            json!({"transactionId": 42, "idTagInfo": {"status": "Blocked"}}),
        );
    });

    assert!(!began_charging);
    assert!(began.elapsed() < Duration::from_secs(3));
    assert_eq!(cp.state(), SessionState::Connected);
}

#[tokio::test(start_paused = true)]
async fn test_wait_for_start_sees_charging() {
    let (cp, transport) = connected(OcppVersion::V16).await;
    let start_id = cp.start_charging().unwrap();

    let (began_charging, ()) = tokio::join!(cp.wait_for_start(Duration::from_secs(30)), async {
        settle().await;
        transport.respond(&start_id, json!({"transactionId": 42}));
    });
    assert!(began_charging);

    let stop_id = cp.stop_charging().unwrap();
    let (stopped, ()) = tokio::join!(
        cp.wait_for_state(SessionState::Connected, Duration::from_secs(30)),
        async {
            settle().await;
            transport.respond(&stop_id, json!({}));
        }
    );
    assert!(stopped);
    assert!(!cp.wait_for_state(SessionState::Charging, Duration::from_secs(5)).await);
}

#[tokio::test(start_paused = true)]
async fn test_simulated_transaction_ids() {
    let transport = MockTransport::default();
    let cp = ChargePoint::with_transaction_ids(
        config(OcppVersion::V16),
        transport.clone(),
        SimulatedTransactionIds,
    );
    cp.connect().unwrap();
    transport.emit(TransportEvent::Opened);
    settle().await;

    let start_id = cp.start_charging().unwrap();
    transport.respond(&start_id, json!({}));
    settle().await;

    assert_eq!(cp.state(), SessionState::Charging);
    let id = cp.transaction_id().unwrap();
    assert!((0..1000).contains(&id));
}

#[tokio::test(start_paused = true)]
async fn test_meter_interval_change_applies_next_tick() {
    let (cp, transport) = charging(OcppVersion::V16).await;

    cp.set_meter_interval(10).unwrap();
    // First tick still waits out the original 60s
    tokio::time::sleep(Duration::from_secs(61)).await;
    assert_eq!(transport.calls("MeterValues").len(), 1);

    tokio::time::sleep(Duration::from_secs(20)).await;
    assert_eq!(transport.calls("MeterValues").len(), 3);
}

#[tokio::test(start_paused = true)]
async fn test_log_subscription_sees_new_entries() {
    let transport = MockTransport::default();
    let cp = ChargePoint::new(config(OcppVersion::V16), transport.clone());
    let mut feed = cp.subscribe_log();

    cp.connect().unwrap();
    let first = feed.recv().await.unwrap();
    assert_eq!(first.kind, LogKind::Accepted);
    let sent = feed.recv().await.unwrap();
    assert_eq!(sent.kind, LogKind::Sent);
    assert!(sent.message.contains("BootNotification"));
}
