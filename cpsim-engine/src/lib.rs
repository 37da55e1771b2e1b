//! # Charge Point Simulator Engine
//!
//! Simulates an OCPP 1.6 / 2.0.1 charge point talking OCPP-J to a CSMS.
//!
//! ## Architecture
//!
//! ```text
//! commands ──► ChargePoint ◄── meter task / timeout sweep
//!                  │ one lock
//!                  ▼
//!          ┌───────────────────┐
//!          │ Session           │
//!          │  CallRegistry     │
//!          │  EventLog         │
//!          └────────┬──────────┘
//!                   │ text frames ▲ TransportEvent
//!                   ▼             │
//!          Transport (WebSocket, or a test double)
//!                   │
//!                   ▼
//!          OCPP CSMS (Backend)
//! ```
//!
//! ## Session Lifecycle
//!
//! | State | Entered on | Left on |
//! |-------|------------|---------|
//! | Disconnected | start, disconnect, transport loss | `connect` |
//! | Connecting | `connect` | transport open |
//! | Connected | open, stop confirmed | StartTransaction accepted |
//! | Charging | StartTransaction accepted | `stop_charging` |
//! | Stopping | `stop_charging` | StopTransaction answered or timed out |
//!
//! ## Usage
//!
//! ```no_run
//! use std::time::Duration;
//! use cpsim_engine::{ChargePoint, SessionState, SimulatorConfig, WsTransport};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = SimulatorConfig::new("ws://localhost:8180/ocpp", "CP001")
//!         .with_id_tag("User123");
//!
//!     let cp = ChargePoint::new(config, WsTransport::default());
//!     cp.connect()?;
//!     cp.wait_for_state(SessionState::Connected, Duration::from_secs(10)).await;
//!     cp.start_charging()?;
//!
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod event_log;
pub mod ocpp;
pub mod transport;

pub use config::{build_ocpp_url, OcppVersion, SimulatorConfig};
pub use event_log::{EventLog, LogEntry, LogKind};
pub use transport::{Connection, EventSender, Transport, TransportEvent, WsTransport};

// Re-export key types
pub use ocpp::{
    Action, ChargePoint, Envelope, OcppError, RegistrationStatus, ResponseTransactionIds,
    SessionState, SimulatedTransactionIds, TransactionIdSource,
};
