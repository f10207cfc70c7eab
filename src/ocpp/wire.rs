//! OCPP-J wire framing
//!
//! Every OCPP frame is a positional JSON array:
//! - CALL: `[2, messageId, action, payload]`
//! - CALLRESULT: `[3, messageId, payload]`
//! - CALLERROR: `[4, messageId, errorCode, errorDescription?, errorDetails?]`
//!
//! Parsing never panics on untrusted input. A frame that fails to parse has no
//! verified message id, so it cannot be answered and is dropped by the caller.

use serde_json::{json, Map, Value};
use std::fmt;
use std::str::FromStr;
use strum::{EnumString, IntoStaticStr};
use thiserror::Error;
use uuid::Uuid;

/// OCPP Message Type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    Call = 2,
    CallResult = 3,
    CallError = 4,
}

impl MessageType {
    fn from_tag(tag: &Value) -> Option<Self> {
        match tag.as_u64()? {
            2 => Some(Self::Call),
            3 => Some(Self::CallResult),
            4 => Some(Self::CallError),
            _ => None,
        }
    }
}

/// OCPP Error Codes
///
/// The 1.6 set plus the names OCPP 2.x added. A code outside that set is kept
/// verbatim in `Other` so a relayed CALLERROR is not rewritten.
#[derive(Debug, Clone, PartialEq, Eq, Hash, EnumString, IntoStaticStr)]
pub enum ErrorCode {
    NotImplemented,
    NotSupported,
    InternalError,
    ProtocolError,
    SecurityError,
    FormationViolation,
    PropertyConstraintViolation,
    OccurrenceConstraintViolation,
    TypeConstraintViolation,
    GenericError,
    FormatViolation,
    MessageTypeNotSupported,
    RpcFrameworkError,
    #[strum(default)]
    Other(String),
}

impl ErrorCode {
    pub fn as_str(&self) -> &str {
        match self {
            Self::Other(code) => code,
            known => <&'static str>::from(known),
        }
    }
}

impl AsRef<str> for ErrorCode {
    fn as_ref(&self) -> &str {
        self.as_str()
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Framing errors. None of them carries a message id on purpose.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum FrameError {
    #[error("frame is not valid JSON: {0}")]
    Json(String),

    #[error("frame is not a JSON array")]
    NotAnArray,

    #[error("frame has {0} elements, expected at least 3")]
    TooShort(usize),

    #[error("unknown message type tag: {0}")]
    UnknownType(Value),

    #[error("{kind} frame has {actual} elements, expected {expected}")]
    Arity {
        kind: &'static str,
        expected: &'static str,
        actual: usize,
    },

    #[error("message id must be a string")]
    InvalidMessageId,

    #[error("action must be a non-empty string")]
    InvalidAction,

    #[error("error code must be a string")]
    InvalidErrorCode,

    #[error("error description must be a string")]
    InvalidErrorDescription,

    #[error("payload must be a JSON object")]
    InvalidPayload,
}

/// OCPP Call message
#[derive(Debug, Clone, PartialEq)]
pub struct Call {
    pub message_id: String,
    pub action: String,
    pub payload: Value,
}

/// OCPP CallResult message
#[derive(Debug, Clone, PartialEq)]
pub struct CallResult {
    pub message_id: String,
    pub payload: Value,
}

/// OCPP CallError message
#[derive(Debug, Clone, PartialEq)]
pub struct CallError {
    pub message_id: String,
    pub error_code: ErrorCode,
    pub error_description: String,
    pub error_details: Value,
}

/// A parsed OCPP frame.
#[derive(Debug, Clone, PartialEq)]
pub enum OcppMessage {
    Call(Call),
    CallResult(CallResult),
    CallError(CallError),
}

impl OcppMessage {
    /// Parse a raw text frame.
    pub fn parse(raw: &str) -> Result<Self, FrameError> {
        let value: Value = serde_json::from_str(raw).map_err(|e| FrameError::Json(e.to_string()))?;
        Self::from_value(value)
    }

    /// Parse an already-decoded JSON value.
    pub fn from_value(value: Value) -> Result<Self, FrameError> {
        let Value::Array(mut arr) = value else {
            return Err(FrameError::NotAnArray);
        };
        if arr.len() < 3 {
            return Err(FrameError::TooShort(arr.len()));
        }
        let kind = MessageType::from_tag(&arr[0])
            .ok_or_else(|| FrameError::UnknownType(arr[0].clone()))?;

        match kind {
            MessageType::Call if arr.len() != 4 => Err(FrameError::Arity {
                kind: "CALL",
                expected: "4",
                actual: arr.len(),
            }),
            MessageType::CallResult if arr.len() != 3 => Err(FrameError::Arity {
                kind: "CALLRESULT",
                expected: "3",
                actual: arr.len(),
            }),
            MessageType::CallError if !(4..=5).contains(&arr.len()) => Err(FrameError::Arity {
                kind: "CALLERROR",
                expected: "4 or 5",
                actual: arr.len(),
            }),
            MessageType::Call => {
                let payload = take_object(arr.pop())?;
                let action = match arr.pop() {
                    Some(Value::String(s)) if !s.is_empty() => s,
                    _ => return Err(FrameError::InvalidAction),
                };
                let message_id = take_id(arr.pop())?;
                Ok(Self::Call(Call {
                    message_id,
                    action,
                    payload,
                }))
            }
            MessageType::CallResult => {
                let payload = take_object(arr.pop())?;
                let message_id = take_id(arr.pop())?;
                Ok(Self::CallResult(CallResult {
                    message_id,
                    payload,
                }))
            }
            MessageType::CallError => {
                let mut it = arr.into_iter().skip(1);
                let message_id = take_id(it.next())?;
                let error_code = match it.next() {
                    Some(Value::String(s)) => {
                        ErrorCode::from_str(&s).unwrap_or(ErrorCode::Other(s))
                    }
                    _ => return Err(FrameError::InvalidErrorCode),
                };
                let error_description = match it.next() {
                    None | Some(Value::Null) => String::new(),
                    Some(Value::String(s)) => s,
                    Some(_) => return Err(FrameError::InvalidErrorDescription),
                };
                let error_details = match it.next() {
                    None | Some(Value::Null) => Value::Object(Map::new()),
                    Some(v) => v,
                };
                Ok(Self::CallError(CallError {
                    message_id,
                    error_code,
                    error_description,
                    error_details,
                }))
            }
        }
    }

    /// Serialize back to the positional array form.
    pub fn to_value(&self) -> Value {
        match self {
            Self::Call(c) => json!([MessageType::Call as u8, c.message_id, c.action, c.payload]),
            Self::CallResult(r) => json!([MessageType::CallResult as u8, r.message_id, r.payload]),
            Self::CallError(e) => json!([
                MessageType::CallError as u8,
                e.message_id,
                e.error_code.as_str(),
                e.error_description,
                e.error_details
            ]),
        }
    }

    /// Serialize to the text frame written on the socket.
    pub fn serialize(&self) -> String {
        self.to_value().to_string()
    }

    pub fn message_id(&self) -> &str {
        match self {
            Self::Call(c) => &c.message_id,
            Self::CallResult(r) => &r.message_id,
            Self::CallError(e) => &e.message_id,
        }
    }

    pub fn message_type(&self) -> MessageType {
        match self {
            Self::Call(_) => MessageType::Call,
            Self::CallResult(_) => MessageType::CallResult,
            Self::CallError(_) => MessageType::CallError,
        }
    }

    /// Action name, only present on CALL frames.
    pub fn action(&self) -> Option<&str> {
        match self {
            Self::Call(c) => Some(&c.action),
            _ => None,
        }
    }

    /// New CALL with a freshly generated message id.
    pub fn call(action: impl Into<String>, payload: Value) -> Self {
        Self::Call(Call {
            message_id: Uuid::new_v4().to_string(),
            action: action.into(),
            payload,
        })
    }

    pub fn result(message_id: impl Into<String>, payload: Value) -> Self {
        Self::CallResult(CallResult {
            message_id: message_id.into(),
            payload,
        })
    }

    pub fn error(
        message_id: impl Into<String>,
        error_code: ErrorCode,
        description: impl Into<String>,
    ) -> Self {
        Self::CallError(CallError {
            message_id: message_id.into(),
            error_code,
            error_description: description.into(),
            error_details: Value::Object(Map::new()),
        })
    }
}

fn take_id(v: Option<Value>) -> Result<String, FrameError> {
    match v {
        Some(Value::String(s)) => Ok(s),
        _ => Err(FrameError::InvalidMessageId),
    }
}

fn take_object(v: Option<Value>) -> Result<Value, FrameError> {
    match v {
        Some(v @ Value::Object(_)) => Ok(v),
        _ => Err(FrameError::InvalidPayload),
    }
}
