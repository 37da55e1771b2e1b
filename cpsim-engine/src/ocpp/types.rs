//! OCPP payload types
//!
//! Request and response payloads for the four actions a simulated charge
//! point exchanges with its CSMS:
//! - BootNotification
//! - StartTransaction / StopTransaction
//! - MeterValues
//!
//! Field names follow the OCPP-J 1.6 shapes. Where 2.0.1 needs an extra field
//! (`reason`, `evseId`) it is carried as an optional member and omitted from
//! the wire when absent.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ============================================================================
// Enumerations
// ============================================================================

/// Boot reason (2.0.1 only). The simulator always boots from power-up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BootReason {
    PowerUp,
}

/// Registration status for BootNotification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub enum RegistrationStatus {
    Accepted,
    Pending,
    Rejected,
}

/// Authorization status reported in `idTagInfo`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub enum AuthorizationStatus {
    Accepted,
    Blocked,
    Expired,
    Invalid,
    ConcurrentTx,
    #[serde(other)]
    Unknown,
}

/// Measurand of a sampled value; only the energy register is simulated
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Measurand {
    #[serde(rename = "Energy.Active.Import.Register")]
    EnergyActiveImportRegister,
}

/// Reading context for meter values
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReadingContext {
    #[serde(rename = "Sample.Periodic")]
    SamplePeriodic,
}

/// Unit of measure for sampled values
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UnitOfMeasure {
    #[serde(rename = "kWh")]
    KWh,
}

// ============================================================================
// Meter values
// ============================================================================

/// Sampled value for meter readings. `value` is a decimal string on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SampledValue {
    pub value: String,
    pub unit: UnitOfMeasure,
    pub measurand: Measurand,
    pub context: ReadingContext,
}

/// Meter value with timestamp and samples
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MeterValue {
    pub timestamp: DateTime<Utc>,
    pub sampled_value: Vec<SampledValue>,
}

// ============================================================================
// Request Messages
// ============================================================================

/// BootNotification request (CP -> CSMS)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BootNotificationRequest {
    pub charge_point_vendor: String,
    pub charge_point_model: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub firmware_version: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<BootReason>,
}

/// StartTransaction request (CP -> CSMS)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartTransactionRequest {
    pub connector_id: u32,
    pub id_tag: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub evse_id: Option<u32>,
}

/// StopTransaction request (CP -> CSMS)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StopTransactionRequest {
    pub transaction_id: i64,
    pub id_tag: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub evse_id: Option<u32>,
}

/// MeterValues request (CP -> CSMS)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MeterValuesRequest {
    pub connector_id: u32,
    pub transaction_id: i64,
    pub meter_value: Vec<MeterValue>,
}

// ============================================================================
// Response Messages
// ============================================================================

/// BootNotification response (CSMS -> CP). Only `status` is required; real
/// backends disagree on the rest.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BootNotificationResponse {
    pub status: RegistrationStatus,
    #[serde(default)]
    pub interval: Option<i64>,
    #[serde(default)]
    pub current_time: Option<String>,
}

/// Token status block returned with StartTransaction. A present block must
/// carry a readable `status`; unknown status strings map to `Unknown`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IdTagInfo {
    pub status: AuthorizationStatus,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_boot_notification_omits_absent_fields() {
        let req = BootNotificationRequest {
            charge_point_vendor: "Firebase Studio".to_string(),
            charge_point_model: "OCPPulse Simulator".to_string(),
            firmware_version: None,
            reason: Some(BootReason::PowerUp),
        };

        let value = serde_json::to_value(&req).unwrap();
        assert_eq!(value["reason"], "PowerUp");
        assert!(value.get("firmwareVersion").is_none());
        assert_eq!(value["chargePointVendor"], "Firebase Studio");
    }

    #[test]
    fn test_sampled_value_wire_names() {
        let sample = SampledValue {
            value: "1.25".to_string(),
            unit: UnitOfMeasure::KWh,
            measurand: Measurand::EnergyActiveImportRegister,
            context: ReadingContext::SamplePeriodic,
        };

        let value = serde_json::to_value(&sample).unwrap();
        assert_eq!(
            value,
            json!({
                "value": "1.25",
                "unit": "kWh",
                "measurand": "Energy.Active.Import.Register",
                "context": "Sample.Periodic"
            })
        );
    }

    #[test]
    fn test_id_tag_info_status() {
        let info: IdTagInfo = serde_json::from_value(json!({"status": "SomethingNew"})).unwrap();
        assert_eq!(info.status, AuthorizationStatus::Unknown);

        let info: IdTagInfo = serde_json::from_value(json!({"status": "ConcurrentTx"})).unwrap();
        assert_eq!(info.status, AuthorizationStatus::ConcurrentTx);

        assert!(serde_json::from_value::<IdTagInfo>(json!({})).is_err());
        assert!(serde_json::from_value::<IdTagInfo>(json!({"status": 7})).is_err());
    }
}
