//! Outstanding CALL tracking
//!
//! Every CALL the charge point sends is recorded here under its unique id
//! until a CALLRESULT/CALLERROR with the same id arrives, the call ages past
//! its deadline, or the connection goes away.

use std::collections::HashMap;
use std::time::Duration;

use serde_json::Value;
use tokio::time::Instant;
use tracing::debug;
use uuid::Uuid;

use super::messages::{Action, Call, CallError, Envelope, OcppError};

/// A CALL awaiting its response
#[derive(Debug, Clone)]
pub struct PendingCall {
    pub unique_id: String,
    pub action: Action,
    pub sent_at: Instant,
}

/// What came back for a CALL
#[derive(Debug, Clone, PartialEq)]
pub enum Response {
    Result(Value),
    Error(CallError),
}

/// A freshly registered CALL, ready to put on the wire
#[derive(Debug, Clone)]
pub struct Submitted {
    pub unique_id: String,
    pub frame: String,
}

/// Correlates outbound CALLs with inbound responses
#[derive(Debug, Default)]
pub struct CallRegistry {
    pending: HashMap<String, PendingCall>,
}

impl CallRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new CALL and encode it
    pub fn submit(&mut self, action: Action, payload: Value) -> Submitted {
        self.submit_at(action, payload, Instant::now())
    }

    pub fn submit_at(&mut self, action: Action, payload: Value, now: Instant) -> Submitted {
        // v4 UUIDs carry 122 random bits; the loop only guards the invariant
        let unique_id = loop {
            let id = Uuid::new_v4().simple().to_string();
            if !self.pending.contains_key(&id) {
                break id;
            }
        };

        let frame = Envelope::Call(Call::new(unique_id.clone(), action.as_str(), payload)).encode();

        self.pending.insert(
            unique_id.clone(),
            PendingCall {
                unique_id: unique_id.clone(),
                action,
                sent_at: now,
            },
        );
        debug!("Tracking {} call {}", action, unique_id);

        Submitted { unique_id, frame }
    }

    /// Match a response to its CALL. Each id resolves at most once; later
    /// attempts report [`OcppError::UnmatchedResponse`].
    pub fn resolve(
        &mut self,
        unique_id: &str,
        response: Response,
    ) -> Result<(Action, Response), OcppError> {
        match self.pending.remove(unique_id) {
            Some(call) => Ok((call.action, response)),
            None => Err(OcppError::UnmatchedResponse(unique_id.to_string())),
        }
    }

    /// Remove and return every call older than `timeout`, oldest first
    pub fn expire(&mut self, now: Instant, timeout: Duration) -> Vec<PendingCall> {
        let stale: Vec<String> = self
            .pending
            .values()
            .filter(|call| now.saturating_duration_since(call.sent_at) > timeout)
            .map(|call| call.unique_id.clone())
            .collect();

        let mut expired: Vec<PendingCall> = stale
            .iter()
            .filter_map(|id| self.pending.remove(id))
            .collect();
        expired.sort_by_key(|call| call.sent_at);
        expired
    }

    /// Drop every pending call, returning how many there were
    pub fn clear(&mut self) -> usize {
        let dropped = self.pending.len();
        self.pending.clear();
        dropped
    }

    pub fn contains(&self, unique_id: &str) -> bool {
        self.pending.contains_key(unique_id)
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_submit_encodes_call() {
        let mut registry = CallRegistry::new();
        let submitted = registry.submit(Action::StartTransaction, json!({"connectorId": 1}));

        let decoded = Envelope::decode(&submitted.frame).unwrap();
        match decoded {
            Envelope::Call(call) => {
                assert_eq!(call.unique_id, submitted.unique_id);
                assert_eq!(call.action, "StartTransaction");
                assert_eq!(call.payload["connectorId"], 1);
            }
            _ => panic!("Expected Call"),
        }
        assert!(registry.contains(&submitted.unique_id));
    }

    #[test]
    fn test_resolve_matches_once() {
        let mut registry = CallRegistry::new();
        let id = registry.submit(Action::BootNotification, json!({})).unique_id;

        let (action, response) = registry
            .resolve(&id, Response::Result(json!({"status": "Accepted"})))
            .unwrap();
        assert_eq!(action, Action::BootNotification);
        assert_eq!(response, Response::Result(json!({"status": "Accepted"})));

        let again = registry.resolve(&id, Response::Result(json!({})));
        assert!(matches!(again, Err(OcppError::UnmatchedResponse(ref u)) if u == &id));
        assert!(registry.is_empty());
    }

    #[test]
    fn test_never_issued_id_is_unmatched() {
        let mut registry = CallRegistry::new();
        registry.submit(Action::MeterValues, json!({}));

        let result = registry.resolve("made-up", Response::Result(json!({})));
        assert!(matches!(result, Err(OcppError::UnmatchedResponse(_))));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_expire_only_removes_old_calls() {
        let mut registry = CallRegistry::new();
        let start = Instant::now();

        let old = registry
            .submit_at(Action::StartTransaction, json!({}), start)
            .unique_id;
        let fresh = registry
            .submit_at(Action::MeterValues, json!({}), start + Duration::from_secs(20))
            .unique_id;

        let expired = registry.expire(start + Duration::from_secs(31), Duration::from_secs(30));
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].unique_id, old);
        assert_eq!(expired[0].action, Action::StartTransaction);
        assert!(registry.contains(&fresh));

        // Expired ids no longer resolve
        assert!(registry.resolve(&old, Response::Result(json!({}))).is_err());
    }

    #[test]
    fn test_clear_drops_everything() {
        let mut registry = CallRegistry::new();
        registry.submit(Action::BootNotification, json!({}));
        registry.submit(Action::StartTransaction, json!({}));

        assert_eq!(registry.clear(), 2);
        assert!(registry.is_empty());
    }
}
