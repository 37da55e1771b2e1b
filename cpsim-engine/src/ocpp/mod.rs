//! OCPP-J charge point protocol layer
//!
//! - `types`: payload types for the four simulated actions
//! - `messages`: OCPP-J framing (CALL, CALLRESULT, CALLERROR)
//! - `registry`: outstanding CALLs awaiting a response
//! - `session`: charge point state machine
//! - `meter`: periodic MeterValues emission
//! - `transaction_ids`: where a started transaction gets its id
//! - `client`: the `ChargePoint` handle tying it together

pub mod types;
pub mod messages;
pub mod registry;
pub mod session;
pub mod meter;
pub mod transaction_ids;
pub mod client;

pub use types::*;
pub use messages::*;
pub use registry::{CallRegistry, PendingCall, Response, Submitted};
pub use session::{MeterStart, Session, SessionState, Transaction};
pub use meter::{MeterEmitter, MeterSample, MeterTick};
pub use transaction_ids::{ResponseTransactionIds, SimulatedTransactionIds, TransactionIdSource};
pub use client::ChargePoint;
