//! Client lifecycle events.
//!
//! Each backend client owns one outgoing channel carrying these events; the
//! interval log is the single consumer. Pushing through a channel instead of
//! calling into the logger keeps client locks free of persistence I/O.

use serde::Serialize;
use tokio::sync::mpsc;

use crate::types::{ClientStatus, ErrorKind};

/// Sender half handed to clients via `set_event_sink`.
pub type EventSink = mpsc::UnboundedSender<ClientEvent>;

/// Receiver half consumed by the interval log.
pub type EventStream = mpsc::UnboundedReceiver<ClientEvent>;

pub fn channel() -> (EventSink, EventStream) {
    mpsc::unbounded_channel()
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientEvent {
    ChatStart {
        client: String,
        model: Option<String>,
        ts: f64,
        is_health_check: bool,
    },
    ChatEnd {
        client: String,
        model: Option<String>,
        ts: f64,
        is_health_check: bool,
        success: bool,
        error_kind: Option<ErrorKind>,
        error_code: Option<String>,
        /// Client status after the chat's transitions were applied, so the
        /// log can open the right idle interval without calling back.
        status: ClientStatus,
    },
    StatusChange {
        client: String,
        ts: f64,
        old_status: ClientStatus,
        new_status: ClientStatus,
    },
}

impl ClientEvent {
    pub fn client_name(&self) -> &str {
        match self {
            ClientEvent::ChatStart { client, .. }
            | ClientEvent::ChatEnd { client, .. }
            | ClientEvent::StatusChange { client, .. } => client,
        }
    }

    pub fn ts(&self) -> f64 {
        match self {
            ClientEvent::ChatStart { ts, .. }
            | ClientEvent::ChatEnd { ts, .. }
            | ClientEvent::StatusChange { ts, .. } => *ts,
        }
    }
}
