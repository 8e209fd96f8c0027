//! Shared type definitions for the fleet.
//!
//! This module contains the types every other layer speaks:
//! - Chat message and generation-parameter structures with validation
//! - The unified `ApiResult` returned by the HTTP execution core
//! - The per-backend `ClientStatus` state and its parsing rules
//! - The caller-visible `ChatFailure` envelope
//! - Scheduling priority constants

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::{SystemTime, UNIX_EPOCH};
use validator::Validate;

/// Scheduling priorities. Lower number = picked first, so precious quota
/// gets the highest number and free tiers get burned first.
pub const PRIORITY_MOST_PRECIOUS: i32 = 100;
pub const PRIORITY_EXPENSIVE: i32 = 80;
pub const PRIORITY_NORMAL: i32 = 50;
pub const PRIORITY_CONSUMABLES: i32 = 20;
pub const PRIORITY_FREEBIE: i32 = 0;

/// Relative adjustments: adding makes a client more precious (picked later).
pub const PRIORITY_MORE_PRECIOUS: i32 = 5;
pub const PRIORITY_LESS_PRECIOUS: i32 = -5;

/// Wall-clock epoch seconds, used for all persisted/dashboard timestamps.
pub fn now_ts() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

/// A single message in a chat conversation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: MessageRole,
    pub content: String,
}

impl ChatMessage {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::User,
            content: content.into(),
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::System,
            content: content.into(),
        }
    }
}

/// Who sent a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    System,
    User,
    Assistant,
}

/// Generation parameters for a chat call, validated before anything is sent
/// upstream. Out-of-range values are the caller's fault, never the backend's.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct ChatParams {
    /// Target model. `None` lets the client's model rotation (or the
    /// adapter default) decide.
    pub model: Option<String>,
    #[validate(range(min = 0.0, max = 2.0))]
    pub temperature: f32,
    #[validate(range(min = 1))]
    pub max_tokens: u32,
}

impl Default for ChatParams {
    fn default() -> Self {
        Self {
            model: None,
            temperature: 0.7,
            max_tokens: 4096,
        }
    }
}

/// Error taxonomy of the execution core. The kind alone determines the
/// external retry/health policy; codes and messages are for operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorKind {
    /// The backend (auth, permissions, missing resource) is broken.
    Permanent,
    /// The request itself is broken; the backend is fine.
    BadRequest,
    /// Rate limiting or upstream overload; retry after cooling down.
    TransientServer,
    /// The network path is broken; retry after a longer delay.
    TransientNetwork,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Permanent => "PERMANENT",
            ErrorKind::BadRequest => "BAD_REQUEST",
            ErrorKind::TransientServer => "TRANSIENT_SERVER",
            ErrorKind::TransientNetwork => "TRANSIENT_NETWORK",
        }
    }
}

/// Stable error codes carried in [`ApiFailure::code`].
pub mod codes {
    pub const CONNECTION_TIMEOUT: &str = "CONNECTION_TIMEOUT";
    pub const PROXY_FAIL: &str = "PROXY_FAIL";
    pub const SESSION_RESET_FAILED: &str = "SESSION_RESET_FAILED";
    pub const MISSING_TOKEN: &str = "MISSING_TOKEN";
    pub const UNEXPECTED_CLIENT_ERROR: &str = "UNEXPECTED_CLIENT_ERROR";

    /// `HTTP_<status>` code for a response status.
    pub fn http(status: u16) -> String {
        format!("HTTP_{status}")
    }
}

/// Structured failure half of an [`ApiResult`].
#[derive(Debug, Clone, thiserror::Error, Serialize, Deserialize)]
#[error("{kind:?}/{code}: {message}")]
pub struct ApiFailure {
    #[serde(rename = "type")]
    pub kind: ErrorKind,
    pub code: String,
    pub message: String,
}

impl ApiFailure {
    pub fn new(kind: ErrorKind, code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind,
            code: code.into(),
            message: message.into(),
        }
    }

    pub fn missing_token() -> Self {
        Self::new(
            ErrorKind::Permanent,
            codes::MISSING_TOKEN,
            "API token is missing",
        )
    }
}

/// The canonical outcome of one HTTP attempt group. The execution core never
/// panics across this boundary; every path lands in one of the two variants.
pub type ApiResult = Result<serde_json::Value, ApiFailure>;

/// Health status of a backend client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClientStatus {
    Unknown,
    Available,
    Error,
    Unavailable,
}

impl ClientStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ClientStatus::Unknown => "unknown",
            ClientStatus::Available => "available",
            ClientStatus::Error => "error",
            ClientStatus::Unavailable => "unavailable",
        }
    }
}

impl fmt::Display for ClientStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ClientStatus {
    type Err = std::convert::Infallible;

    /// Unrecognized values fold into `Error` rather than failing, so a
    /// malformed admin request or stale persisted row degrades safely.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s.to_ascii_lowercase().as_str() {
            "unknown" => ClientStatus::Unknown,
            "available" => ClientStatus::Available,
            "error" => ClientStatus::Error,
            "unavailable" => ClientStatus::Unavailable,
            _ => ClientStatus::Error,
        })
    }
}

/// What the scheduler should do with a failed call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    /// Do not retry this request anywhere.
    Fatal,
    /// Try another client.
    Recoverable,
}

/// Caller-visible failure envelope. Callers never see HTTP internals, only
/// the class, the retry directive and a stable code for logs.
#[derive(Debug, Clone, thiserror::Error, Serialize)]
#[error("{error}: {message}")]
pub struct ChatFailure {
    /// Failure class identifier, e.g. `unified_api_error`, `client_busy`.
    pub error: &'static str,
    #[serde(rename = "error_type")]
    pub severity: Severity,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_error_code: Option<String>,
    #[serde(rename = "api_error_type", skip_serializing_if = "Option::is_none")]
    pub api_error_kind: Option<ErrorKind>,
    pub message: String,
}

impl ChatFailure {
    pub fn client_unavailable() -> Self {
        Self {
            error: "client_unavailable",
            severity: Severity::Recoverable,
            api_error_code: None,
            api_error_kind: None,
            message: "Client is marked as unavailable".into(),
        }
    }

    pub fn client_busy() -> Self {
        Self {
            error: "client_busy",
            severity: Severity::Recoverable,
            api_error_code: None,
            api_error_kind: None,
            message: "Client is busy (in use)".into(),
        }
    }

    pub fn empty_response() -> Self {
        Self {
            error: "empty_response",
            severity: Severity::Recoverable,
            api_error_code: None,
            api_error_kind: None,
            message: "API returned an empty choices array".into(),
        }
    }

    pub fn invalid_params(message: impl Into<String>) -> Self {
        Self {
            error: "invalid_request",
            severity: Severity::Fatal,
            api_error_code: None,
            api_error_kind: None,
            message: message.into(),
        }
    }

    pub fn processing(message: impl Into<String>) -> Self {
        Self {
            error: "response_processing_error",
            severity: Severity::Recoverable,
            api_error_code: None,
            api_error_kind: None,
            message: message.into(),
        }
    }

    pub fn unified(failure: &ApiFailure, severity: Severity) -> Self {
        Self {
            error: "unified_api_error",
            severity,
            api_error_code: Some(failure.code.clone()),
            api_error_kind: Some(failure.kind),
            message: failure.message.clone(),
        }
    }
}

/// Outcome of [`crate::client::BackendClient::chat`]: the upstream response
/// map on success, a classified envelope on failure.
pub type ChatResult = Result<serde_json::Value, ChatFailure>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_serialization() {
        let json = serde_json::to_string(&ClientStatus::Available).unwrap();
        assert_eq!(json, "\"available\"");

        let parsed: ClientStatus = serde_json::from_str("\"unavailable\"").unwrap();
        assert_eq!(parsed, ClientStatus::Unavailable);
    }

    #[test]
    fn test_status_parse_fallback() {
        assert_eq!("available".parse::<ClientStatus>().unwrap(), ClientStatus::Available);
        assert_eq!("AVAILABLE".parse::<ClientStatus>().unwrap(), ClientStatus::Available);
        // Garbage folds into Error, never panics or rejects.
        assert_eq!("banana".parse::<ClientStatus>().unwrap(), ClientStatus::Error);
        assert_eq!("".parse::<ClientStatus>().unwrap(), ClientStatus::Error);
    }

    #[test]
    fn test_error_kind_wire_format() {
        let json = serde_json::to_string(&ErrorKind::TransientNetwork).unwrap();
        assert_eq!(json, "\"TRANSIENT_NETWORK\"");
        let json = serde_json::to_string(&ErrorKind::BadRequest).unwrap();
        assert_eq!(json, "\"BAD_REQUEST\"");
    }

    #[test]
    fn test_http_code_format() {
        assert_eq!(codes::http(429), "HTTP_429");
        assert_eq!(codes::http(503), "HTTP_503");
    }

    #[test]
    fn test_chat_params_validation() {
        assert!(ChatParams::default().validate().is_ok());

        let too_hot = ChatParams {
            temperature: 3.5,
            ..Default::default()
        };
        assert!(too_hot.validate().is_err());

        let no_tokens = ChatParams {
            max_tokens: 0,
            ..Default::default()
        };
        assert!(no_tokens.validate().is_err());
    }

    #[test]
    fn test_chat_failure_envelope() {
        let api = ApiFailure::new(ErrorKind::TransientServer, codes::http(503), "upstream down");
        let failure = ChatFailure::unified(&api, Severity::Recoverable);

        let json = serde_json::to_value(&failure).unwrap();
        assert_eq!(json["error"], "unified_api_error");
        assert_eq!(json["error_type"], "recoverable");
        assert_eq!(json["api_error_code"], "HTTP_503");
        assert_eq!(json["api_error_type"], "TRANSIENT_SERVER");
    }

    #[test]
    fn test_message_serialization() {
        let message = ChatMessage::user("Hello world");
        let json = serde_json::to_string(&message).unwrap();
        assert!(json.contains("user"));
        assert!(json.contains("Hello world"));
    }
}
