//! Where a started transaction gets its id
//!
//! A CSMS assigns the transaction id in its StartTransaction CALLRESULT.
//! [`ResponseTransactionIds`] reads it from there. [`SimulatedTransactionIds`]
//! ignores the payload and draws a random id; it exists for running against
//! backends that answer with an empty payload, and is never the default.

use rand::Rng;
use serde_json::Value;

pub trait TransactionIdSource: Send + Sync {
    /// Transaction id for a confirmed StartTransaction, if one can be had
    fn transaction_id(&self, response: &Value) -> Option<i64>;
}

/// Takes `transactionId` from the CALLRESULT payload (integer, or a string
/// holding one)
#[derive(Debug, Clone, Copy, Default)]
pub struct ResponseTransactionIds;

impl TransactionIdSource for ResponseTransactionIds {
    fn transaction_id(&self, response: &Value) -> Option<i64> {
        let id = response.get("transactionId")?;
        id.as_i64()
            .or_else(|| id.as_str().and_then(|s| s.trim().parse().ok()))
    }
}

/// Testing stub: random id in `0..1000`
#[derive(Debug, Clone, Copy, Default)]
pub struct SimulatedTransactionIds;

impl TransactionIdSource for SimulatedTransactionIds {
    fn transaction_id(&self, _response: &Value) -> Option<i64> {
        Some(rand::thread_rng().gen_range(0..1000))
    }
}
