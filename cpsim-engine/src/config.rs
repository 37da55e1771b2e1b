//! Configuration for the charge point simulator
//!
//! Everything the operator would type into the simulator form: backend URL,
//! station identity, token, connector, metering cadence and protocol
//! version, plus protocol timing knobs.

use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::ocpp::OcppError;

/// OCPP dialect spoken on the connection
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum OcppVersion {
    #[default]
    #[serde(rename = "1.6")]
    V16,
    #[serde(rename = "2.0.1")]
    V201,
}

impl OcppVersion {
    /// WebSocket subprotocol requested during the handshake
    pub fn subprotocol(self) -> &'static str {
        match self {
            OcppVersion::V16 => "ocpp1.6",
            OcppVersion::V201 => "ocpp2.0.1",
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            OcppVersion::V16 => "1.6",
            OcppVersion::V201 => "2.0.1",
        }
    }
}

impl std::fmt::Display for OcppVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OcppVersion {
    type Err = OcppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "1.6" | "ocpp1.6" => Ok(OcppVersion::V16),
            "2.0.1" | "ocpp2.0.1" => Ok(OcppVersion::V201),
            other => Err(OcppError::Config(format!(
                "unsupported OCPP version {other:?} (expected 1.6 or 2.0.1)"
            ))),
        }
    }
}

/// Complete simulator configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulatorConfig {
    /// CSMS WebSocket URL (without station ID)
    pub csms_url: String,

    /// Station ID (appended to URL)
    pub station_id: String,

    /// Token presented when starting and stopping a transaction
    pub id_tag: String,

    /// Connector the session charges on (1-based)
    pub connector_id: u32,

    /// Seconds between MeterValues while charging
    pub meter_interval_secs: u64,

    pub ocpp_version: OcppVersion,

    /// Vendor name for BootNotification
    pub vendor: String,

    /// Model name for BootNotification
    pub model: String,

    /// Firmware version reported in 1.6 BootNotification
    pub firmware_version: Option<String>,

    /// Seconds a CALL may stay unanswered
    pub call_timeout_secs: u64,

    /// How often unanswered CALLs are swept
    pub sweep_interval_ms: u64,

    /// Entries kept in the event log
    pub log_capacity: usize,
}

impl Default for SimulatorConfig {
    fn default() -> Self {
        Self {
            csms_url: String::new(),
            station_id: String::new(),
            id_tag: String::new(),
            connector_id: 1,
            meter_interval_secs: 60,
            ocpp_version: OcppVersion::V16,
            vendor: "Firebase Studio".to_string(),
            model: "OCPPulse Simulator".to_string(),
            firmware_version: Some("1.0".to_string()),
            call_timeout_secs: 30,
            sweep_interval_ms: 1000,
            log_capacity: 1000,
        }
    }
}

impl SimulatorConfig {
    /// Create config with basic parameters
    pub fn new(csms_url: impl Into<String>, station_id: impl Into<String>) -> Self {
        Self {
            csms_url: csms_url.into(),
            station_id: station_id.into(),
            ..Default::default()
        }
    }

    /// Load from a JSON file; absent keys keep their defaults
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, OcppError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| OcppError::Config(format!("cannot read {}: {}", path.display(), e)))?;
        Ok(serde_json::from_str(&text)?)
    }

    pub fn with_id_tag(mut self, id_tag: impl Into<String>) -> Self {
        self.id_tag = id_tag.into();
        self
    }

    pub fn with_connector(mut self, connector_id: u32) -> Self {
        self.connector_id = connector_id;
        self
    }

    pub fn with_meter_interval(mut self, secs: u64) -> Self {
        self.meter_interval_secs = secs;
        self
    }

    pub fn with_version(mut self, version: OcppVersion) -> Self {
        self.ocpp_version = version;
        self
    }

    /// Set vendor info
    pub fn with_vendor(mut self, vendor: impl Into<String>, model: impl Into<String>) -> Self {
        self.vendor = vendor.into();
        self.model = model.into();
        self
    }

    pub fn with_firmware(mut self, version: impl Into<String>) -> Self {
        self.firmware_version = Some(version.into());
        self
    }

    pub fn with_call_timeout(mut self, secs: u64) -> Self {
        self.call_timeout_secs = secs;
        self
    }

    /// Check numeric settings. Empty URL / station id are left to
    /// `connect`, which refuses them as a command error.
    pub fn validate(&self) -> Result<(), OcppError> {
        if self.connector_id == 0 {
            return Err(OcppError::Config("connector id must be positive".into()));
        }
        if self.meter_interval_secs == 0 {
            return Err(OcppError::Config("meter interval must be positive".into()));
        }
        if self.call_timeout_secs == 0 {
            return Err(OcppError::Config("call timeout must be positive".into()));
        }
        if self.sweep_interval_ms == 0 {
            return Err(OcppError::Config("sweep interval must be positive".into()));
        }
        Ok(())
    }

    /// Full WebSocket URL with the station id as the last path segment
    pub fn connection_url(&self) -> String {
        build_ocpp_url(&self.csms_url, &self.station_id)
    }

    pub fn meter_interval(&self) -> Duration {
        Duration::from_secs(self.meter_interval_secs)
    }

    pub fn call_timeout(&self) -> Duration {
        Duration::from_secs(self.call_timeout_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }
}

/// Build the full OCPP WebSocket URL
pub fn build_ocpp_url(base_url: &str, station_id: &str) -> String {
    format!("{}/{}", base_url.trim_end_matches('/'), station_id)
}
