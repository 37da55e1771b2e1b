//! OCPP-J message framing
//!
//! Every OCPP-J frame is a JSON array:
//! - CALL: [2, uniqueId, action, payload]
//! - CALLRESULT: [3, uniqueId, payload]
//! - CALLERROR: [4, uniqueId, errorCode, errorDescription, errorDetails]
//!
//! The codec only checks the envelope. Payload contents are interpreted by
//! the session layer.

use serde_json::{json, Value};
use thiserror::Error;

/// OCPP message type identifiers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    Call = 2,
    CallResult = 3,
    CallError = 4,
}

impl MessageType {
    fn from_id(id: i64) -> Option<Self> {
        match id {
            2 => Some(MessageType::Call),
            3 => Some(MessageType::CallResult),
            4 => Some(MessageType::CallError),
            _ => None,
        }
    }

    /// Number of array elements a frame of this type carries
    fn frame_len(self) -> usize {
        match self {
            MessageType::Call => 4,
            MessageType::CallResult => 3,
            MessageType::CallError => 5,
        }
    }
}

/// OCPP-J error codes (1.6 and 2.0.1 spellings)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    FormatViolation,
    FormationViolation,
    GenericError,
    InternalError,
    MessageTypeNotSupported,
    NotImplemented,
    NotSupported,
    OccurrenceConstraintViolation,
    PropertyConstraintViolation,
    ProtocolError,
    RpcFrameworkError,
    SecurityError,
    TypeConstraintViolation,
}

impl ErrorCode {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorCode::FormatViolation => "FormatViolation",
            ErrorCode::FormationViolation => "FormationViolation",
            ErrorCode::GenericError => "GenericError",
            ErrorCode::InternalError => "InternalError",
            ErrorCode::MessageTypeNotSupported => "MessageTypeNotSupported",
            ErrorCode::NotImplemented => "NotImplemented",
            ErrorCode::NotSupported => "NotSupported",
            ErrorCode::OccurrenceConstraintViolation => "OccurrenceConstraintViolation",
            ErrorCode::PropertyConstraintViolation => "PropertyConstraintViolation",
            ErrorCode::ProtocolError => "ProtocolError",
            ErrorCode::RpcFrameworkError => "RpcFrameworkError",
            ErrorCode::SecurityError => "SecurityError",
            ErrorCode::TypeConstraintViolation => "TypeConstraintViolation",
        }
    }

    /// Parse a wire error code; anything unrecognised is a GenericError
    pub fn parse(code: &str) -> Self {
        match code {
            "FormatViolation" => ErrorCode::FormatViolation,
            "FormationViolation" => ErrorCode::FormationViolation,
            "InternalError" => ErrorCode::InternalError,
            "MessageTypeNotSupported" => ErrorCode::MessageTypeNotSupported,
            "NotImplemented" => ErrorCode::NotImplemented,
            "NotSupported" => ErrorCode::NotSupported,
            "OccurrenceConstraintViolation" => ErrorCode::OccurrenceConstraintViolation,
            "PropertyConstraintViolation" => ErrorCode::PropertyConstraintViolation,
            "ProtocolError" => ErrorCode::ProtocolError,
            "RpcFrameworkError" => ErrorCode::RpcFrameworkError,
            "SecurityError" => ErrorCode::SecurityError,
            "TypeConstraintViolation" => ErrorCode::TypeConstraintViolation,
            _ => ErrorCode::GenericError,
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Actions this charge point initiates
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Action {
    BootNotification,
    StartTransaction,
    StopTransaction,
    MeterValues,
}

impl Action {
    pub fn as_str(self) -> &'static str {
        match self {
            Action::BootNotification => "BootNotification",
            Action::StartTransaction => "StartTransaction",
            Action::StopTransaction => "StopTransaction",
            Action::MeterValues => "MeterValues",
        }
    }
}

impl std::fmt::Display for Action {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors in OCPP message handling and session control
#[derive(Debug, Error)]
pub enum OcppError {
    #[error("malformed frame ({reason}): {frame}")]
    MalformedFrame { reason: &'static str, frame: String },

    #[error("no pending call matches response id {0}")]
    UnmatchedResponse(String),

    #[error("{action} call {unique_id} timed out")]
    CallTimeout { action: Action, unique_id: String },

    #[error("transport failure: {0}")]
    TransportFailure(String),

    #[error("invalid command: {0}")]
    InvalidCommand(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// OCPP CALL message (request)
#[derive(Debug, Clone, PartialEq)]
pub struct Call {
    pub unique_id: String,
    pub action: String,
    pub payload: Value,
}

impl Call {
    pub fn new(unique_id: impl Into<String>, action: impl Into<String>, payload: Value) -> Self {
        Self {
            unique_id: unique_id.into(),
            action: action.into(),
            payload,
        }
    }
}

/// OCPP CALLRESULT message (success response)
#[derive(Debug, Clone, PartialEq)]
pub struct CallResult {
    pub unique_id: String,
    pub payload: Value,
}

/// OCPP CALLERROR message (error response).
///
/// The error code is kept as received so a frame re-encodes byte-for-byte;
/// use [`CallError::code`] for the parsed form.
#[derive(Debug, Clone, PartialEq)]
pub struct CallError {
    pub unique_id: String,
    pub error_code: String,
    pub error_description: String,
    pub error_details: Value,
}

impl CallError {
    pub fn new(
        unique_id: impl Into<String>,
        error_code: ErrorCode,
        error_description: impl Into<String>,
    ) -> Self {
        Self {
            unique_id: unique_id.into(),
            error_code: error_code.as_str().to_string(),
            error_description: error_description.into(),
            error_details: Value::Object(serde_json::Map::new()),
        }
    }

    pub fn code(&self) -> ErrorCode {
        ErrorCode::parse(&self.error_code)
    }
}

/// Parsed OCPP frame (any type)
#[derive(Debug, Clone, PartialEq)]
pub enum Envelope {
    Call(Call),
    CallResult(CallResult),
    CallError(CallError),
}

impl Envelope {
    /// Encode to the OCPP-J text frame
    pub fn encode(&self) -> String {
        let array = match self {
            Envelope::Call(c) => json!([
                MessageType::Call as i32,
                &c.unique_id,
                &c.action,
                &c.payload
            ]),
            Envelope::CallResult(r) => json!([
                MessageType::CallResult as i32,
                &r.unique_id,
                &r.payload
            ]),
            Envelope::CallError(e) => json!([
                MessageType::CallError as i32,
                &e.unique_id,
                &e.error_code,
                &e.error_description,
                &e.error_details
            ]),
        };
        array.to_string()
    }

    /// Decode an OCPP-J text frame.
    ///
    /// Fails with [`OcppError::MalformedFrame`] (keeping the original text)
    /// when the frame is not an array, the type id is not 2/3/4, the element
    /// count does not match the type, or a string slot holds something else.
    pub fn decode(text: &str) -> Result<Self, OcppError> {
        let malformed = |reason| OcppError::MalformedFrame {
            reason,
            frame: text.to_string(),
        };

        let value: Value = serde_json::from_str(text).map_err(|_| malformed("not valid JSON"))?;
        let array = value.as_array().ok_or_else(|| malformed("not a JSON array"))?;

        let type_id = array
            .first()
            .and_then(Value::as_i64)
            .ok_or_else(|| malformed("missing message type id"))?;
        let message_type =
            MessageType::from_id(type_id).ok_or_else(|| malformed("unknown message type id"))?;

        if array.len() != message_type.frame_len() {
            return Err(malformed("wrong element count for message type"));
        }

        let unique_id = array[1]
            .as_str()
            .ok_or_else(|| malformed("unique id is not a string"))?;
        if unique_id.is_empty() {
            return Err(malformed("unique id is empty"));
        }
        let unique_id = unique_id.to_string();

        match message_type {
            MessageType::Call => {
                let action = array[2]
                    .as_str()
                    .ok_or_else(|| malformed("action is not a string"))?;
                Ok(Envelope::Call(Call {
                    unique_id,
                    action: action.to_string(),
                    payload: array[3].clone(),
                }))
            }
            MessageType::CallResult => Ok(Envelope::CallResult(CallResult {
                unique_id,
                payload: array[2].clone(),
            })),
            MessageType::CallError => {
                let error_code = array[2]
                    .as_str()
                    .ok_or_else(|| malformed("error code is not a string"))?;
                let error_description = array[3]
                    .as_str()
                    .ok_or_else(|| malformed("error description is not a string"))?;
                Ok(Envelope::CallError(CallError {
                    unique_id,
                    error_code: error_code.to_string(),
                    error_description: error_description.to_string(),
                    error_details: array[4].clone(),
                }))
            }
        }
    }

    /// Get the unique id
    pub fn unique_id(&self) -> &str {
        match self {
            Envelope::Call(c) => &c.unique_id,
            Envelope::CallResult(r) => &r.unique_id,
            Envelope::CallError(e) => &e.unique_id,
        }
    }
}
