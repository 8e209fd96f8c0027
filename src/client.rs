//! Per-backend client state machine.
//!
//! A [`BackendClient`] owns one adapter plus the local bookkeeping the
//! scheduler needs: health status, error streaks, lease flags, rotation
//! pools and timing counters. Every mutation goes through the client's
//! single mutex; the lock is never held across adapter I/O.
//!
//! Status transitions are driven exclusively by the classified results of
//! the execution core:
//! - `BadRequest` (and the legacy `HTTP_400`-coded permanent) blames the
//!   prompt: status and counters untouched, caller told not to retry.
//! - Other `Permanent` failures blame the backend: `Unavailable`, counted,
//!   fatal.
//! - `Transient*` failures might heal: `Error`, counted, recoverable.
//! - Any success resets the error streak and lands on `Available`.

use std::sync::{Arc, Mutex};

use serde::Serialize;
use tracing::{info, warn};
use validator::Validate;

use crate::adapter::ChatAdapter;
use crate::events::{ClientEvent, EventSink};
use crate::rotator::Rotator;
use crate::types::{
    now_ts, ApiFailure, ChatFailure, ChatMessage, ChatParams, ChatResult, ClientStatus, ErrorKind,
    Severity, PRIORITY_NORMAL,
};

/// Fixed self-test conversation.
pub const TEST_PROMPT: &str = "If you are working, please respond with 'OK'.";
pub const TEST_EXPECTED: &str = "OK";

/// Optional usage/quota capability. The default implementation tracks
/// nothing and reports full health; quota-aware deployments plug in their
/// own probe.
pub trait UsageProbe: Send + Sync {
    fn record_usage(&self, _usage: &serde_json::Value) {}

    /// Abstract health score in `[0.0, 100.0]`; `<= 0` removes the client
    /// from scheduling.
    fn calculate_health(&self) -> f64 {
        100.0
    }

    /// Structured metric rows for the dashboard (quota bars, balances).
    fn standardized_metrics(&self) -> Vec<serde_json::Value> {
        Vec::new()
    }
}

struct NoopProbe;

impl UsageProbe for NoopProbe {}

/// Point-in-time copy of the mutable client state.
#[derive(Debug, Clone, Serialize)]
pub struct ClientSnapshot {
    pub status: ClientStatus,
    pub status_last_updated: f64,
    pub last_acquired: f64,
    pub last_released: f64,
    pub last_chat: f64,
    pub last_test: f64,
    pub acquire_count: u64,
    pub chat_count: u64,
    pub error_count: u32,
    pub error_sum: u64,
    pub in_use: bool,
    pub acquired: bool,
}

#[derive(Debug)]
struct ClientState {
    status: ClientStatus,
    /// Epoch seconds; kept at 0.0 while the status is `Unknown`.
    status_last_updated: f64,
    last_acquired: f64,
    last_released: f64,
    last_chat: f64,
    last_test: f64,
    acquire_count: u64,
    chat_count: u64,
    error_count: u32,
    error_sum: u64,
    in_use: bool,
    acquired: bool,
}

impl ClientState {
    fn new(status: ClientStatus) -> Self {
        Self {
            status,
            status_last_updated: if status == ClientStatus::Unknown {
                0.0
            } else {
                now_ts()
            },
            last_acquired: 0.0,
            last_released: 0.0,
            last_chat: 0.0,
            last_test: 0.0,
            acquire_count: 0,
            chat_count: 0,
            error_count: 0,
            error_sum: 0,
            in_use: false,
            acquired: false,
        }
    }

    fn snapshot(&self) -> ClientSnapshot {
        ClientSnapshot {
            status: self.status,
            status_last_updated: self.status_last_updated,
            last_acquired: self.last_acquired,
            last_released: self.last_released,
            last_chat: self.last_chat,
            last_test: self.last_test,
            acquire_count: self.acquire_count,
            chat_count: self.chat_count,
            error_count: self.error_count,
            error_sum: self.error_sum,
            in_use: self.in_use,
            acquired: self.acquired,
        }
    }
}

/// Registration parameters for a backend client.
#[derive(Debug, Clone)]
pub struct BackendClientConfig {
    pub name: String,
    pub priority: i32,
    pub group_id: String,
    /// Mark `Available` at construction instead of waiting for the first
    /// health check.
    pub default_available: bool,
}

impl Default for BackendClientConfig {
    fn default() -> Self {
        Self {
            name: String::new(),
            priority: PRIORITY_NORMAL,
            group_id: "default".into(),
            default_available: false,
        }
    }
}

pub struct BackendClient {
    name: String,
    priority: i32,
    group_id: String,
    adapter: Arc<dyn ChatAdapter>,
    probe: Box<dyn UsageProbe>,
    model_rotator: Rotator<String>,
    token_rotator: Rotator<String>,
    state: Mutex<ClientState>,
    sink: Mutex<Option<EventSink>>,
}

impl BackendClient {
    pub fn new(config: BackendClientConfig, adapter: Arc<dyn ChatAdapter>) -> Self {
        let initial = if config.default_available {
            ClientStatus::Available
        } else {
            ClientStatus::Unknown
        };
        Self {
            name: config.name,
            priority: config.priority,
            group_id: config.group_id,
            adapter,
            probe: Box::new(NoopProbe),
            model_rotator: Rotator::new(),
            token_rotator: Rotator::new(),
            state: Mutex::new(ClientState::new(initial)),
            sink: Mutex::new(None),
        }
    }

    pub fn with_probe(mut self, probe: Box<dyn UsageProbe>) -> Self {
        self.probe = probe;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn priority(&self) -> i32 {
        self.priority
    }

    pub fn group_id(&self) -> &str {
        &self.group_id
    }

    pub fn current_model(&self) -> String {
        self.adapter.using_model()
    }

    pub fn api_base_url(&self) -> String {
        self.adapter.api_base_url()
    }

    pub async fn get_model_list(&self) -> crate::types::ApiResult {
        self.adapter.get_model_list().await
    }

    /// Configure the model pool to rotate through.
    pub fn set_rotation_models(&self, models: Vec<String>, uses_per_rotation: usize) {
        self.model_rotator.set_items(models, uses_per_rotation);
    }

    /// Configure the token pool to rotate through.
    pub fn set_rotation_tokens(&self, tokens: Vec<String>, uses_per_rotation: usize) {
        self.token_rotator.set_items(tokens, uses_per_rotation);
    }

    /// Attach the outgoing event channel consumed by the interval log.
    pub fn set_event_sink(&self, sink: EventSink) {
        *self.sink.lock().unwrap_or_else(|e| e.into_inner()) = Some(sink);
    }

    pub fn status(&self) -> ClientStatus {
        self.state.lock().unwrap_or_else(|e| e.into_inner()).status
    }

    pub fn snapshot(&self) -> ClientSnapshot {
        self.state
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .snapshot()
    }

    pub fn record_usage(&self, usage: &serde_json::Value) {
        self.probe.record_usage(usage);
    }

    pub fn calculate_health(&self) -> f64 {
        self.probe.calculate_health()
    }

    pub fn standardized_metrics(&self) -> Vec<serde_json::Value> {
        self.probe.standardized_metrics()
    }

    /// Execute one chat call through the adapter and fold the classified
    /// outcome into status transitions plus a caller-visible result.
    pub async fn chat(
        &self,
        messages: &[ChatMessage],
        params: ChatParams,
        is_health_check: bool,
    ) -> ChatResult {
        if let Err(err) = params.validate() {
            // The caller's parameters are broken; the backend is untouched.
            return Err(ChatFailure::invalid_params(err.to_string()));
        }

        {
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            if state.status == ClientStatus::Unavailable {
                return Err(ChatFailure::client_unavailable());
            }
            if state.in_use {
                return Err(ChatFailure::client_busy());
            }
            state.in_use = true;
            state.chat_count += 1;
        }

        // Token strategy first, then model strategy: rotation wins over the
        // caller's explicit model argument.
        if let Some(token) = self.token_rotator.get_next() {
            self.adapter.set_api_token(token);
        }
        let target_model = self.model_rotator.get_next().or_else(|| params.model.clone());
        let event_model = target_model
            .clone()
            .unwrap_or_else(|| self.adapter.using_model());

        self.emit(ClientEvent::ChatStart {
            client: self.name.clone(),
            model: Some(event_model.clone()),
            ts: now_ts(),
            is_health_check,
        });

        let outcome = self
            .adapter
            .create_chat_completion(
                messages,
                target_model.as_deref(),
                params.temperature,
                params.max_tokens,
                is_health_check,
            )
            .await;

        let result = match outcome {
            Ok(data) => self.handle_llm_response(data),
            Err(failure) => Err(self.handle_api_failure(failure)),
        };

        let status_after = {
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            state.in_use = false;
            state.last_chat = now_ts();
            state.status
        };

        self.emit(ClientEvent::ChatEnd {
            client: self.name.clone(),
            model: Some(event_model),
            ts: now_ts(),
            is_health_check,
            success: result.is_ok(),
            error_kind: result.as_ref().err().and_then(|e| e.api_error_kind),
            error_code: result.as_ref().err().and_then(|e| e.api_error_code.clone()),
            status: status_after,
        });

        result
    }

    /// External escape valve: the call looked fine at the HTTP layer but the
    /// content failed business rules. Always counts and degrades to `Error`.
    pub fn complain_error(&self, reason: &str) {
        warn!(client = %self.name, reason, "external complaint received");
        self.increase_error_count();
        self.update_status(ClientStatus::Error);
    }

    /// Pure content check for a successful chat response. Returns the
    /// rejection reason, suitable for passing straight to
    /// [`Self::complain_error`], or `None` when the response is acceptable.
    pub fn validate_response(
        &self,
        response: &serde_json::Value,
        expected_content: Option<&str>,
    ) -> Option<String> {
        let choices = response.get("choices").and_then(|c| c.as_array());
        let Some(choices) = choices.filter(|c| !c.is_empty()) else {
            return Some("Invalid response structure: 'choices' is empty".into());
        };

        let content = choices[0]
            .get("message")
            .and_then(|m| m.get("content"))
            .and_then(|c| c.as_str())
            .unwrap_or("");
        if content.is_empty() {
            return Some("Response content is empty".into());
        }

        if let Some(expected) = expected_content {
            if !content.contains(expected) {
                return Some(format!(
                    "Content validation failed: '{expected}' not found in response"
                ));
            }
        }

        None
    }

    /// Run the fixed self-test conversation and fold the verdict into the
    /// client status. `last_test` is stamped no matter how the test ends.
    pub async fn test_and_update_status(&self) -> bool {
        let params = ChatParams {
            model: None,
            temperature: 0.7,
            max_tokens: 100,
        };
        let result = self
            .chat(&[ChatMessage::user(TEST_PROMPT)], params, true)
            .await;

        let passed = match result {
            // The chat pipeline already counted the failure.
            Err(_) => false,
            Ok(response) => {
                if let Some(reason) = self.validate_response(&response, Some(TEST_EXPECTED)) {
                    self.complain_error(&format!("Self-test failed: {reason}"));
                    false
                } else {
                    self.reset_error_count();
                    self.update_status(ClientStatus::Available);
                    true
                }
            }
        };

        self.state
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .last_test = now_ts();
        passed
    }

    // ---- scheduler-facing lease operations ----

    /// Take the exclusive lease. Refused while already leased or while the
    /// client is `Unavailable`.
    pub(crate) fn acquire(&self) -> bool {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if state.acquired || state.status == ClientStatus::Unavailable {
            return false;
        }
        state.acquired = true;
        state.acquire_count += 1;
        state.last_acquired = now_ts();
        true
    }

    pub(crate) fn release(&self) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.acquired = false;
        state.last_released = now_ts();
    }

    pub(crate) fn is_busy(&self) -> bool {
        self.state.lock().unwrap_or_else(|e| e.into_inner()).in_use
    }

    pub(crate) fn is_acquired(&self) -> bool {
        self.state.lock().unwrap_or_else(|e| e.into_inner()).acquired
    }

    /// Set a new status, stamping `status_last_updated` (0.0 for `Unknown`).
    /// Emits a `StatusChange` event only on an actual transition.
    pub(crate) fn update_status(&self, new_status: ClientStatus) {
        let old_status = {
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            let old = state.status;
            state.status = new_status;
            state.status_last_updated = if new_status == ClientStatus::Unknown {
                0.0
            } else {
                now_ts()
            };
            old
        };

        if old_status != new_status {
            info!(client = %self.name, from = %old_status, to = %new_status, "client status changed");
            self.emit(ClientEvent::StatusChange {
                client: self.name.clone(),
                ts: now_ts(),
                old_status,
                new_status,
            });
        }
    }

    pub(crate) fn reset_error_count(&self) {
        self.state
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .error_count = 0;
    }

    fn increase_error_count(&self) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.error_count += 1;
        state.error_sum += 1;
    }

    // ---- classified-failure folding ----

    fn handle_api_failure(&self, failure: ApiFailure) -> ChatFailure {
        match failure.kind {
            // The prompt is bad, not the backend: leave status and counters
            // alone and tell the caller to stop retrying.
            ErrorKind::BadRequest => ChatFailure::unified(&failure, Severity::Fatal),
            ErrorKind::Permanent if failure.code.starts_with("HTTP_400") => {
                ChatFailure::unified(&failure, Severity::Fatal)
            }
            ErrorKind::Permanent => {
                self.increase_error_count();
                self.update_status(ClientStatus::Unavailable);
                ChatFailure::unified(&failure, Severity::Fatal)
            }
            ErrorKind::TransientServer | ErrorKind::TransientNetwork => {
                self.increase_error_count();
                self.update_status(ClientStatus::Error);
                ChatFailure::unified(&failure, Severity::Recoverable)
            }
        }
    }

    fn handle_llm_response(&self, response: serde_json::Value) -> ChatResult {
        let choices = response.get("choices").and_then(|c| c.as_array());
        let Some(choices) = choices.filter(|c| !c.is_empty()) else {
            // Protocol-level defect: a 200 with nothing in it.
            self.increase_error_count();
            self.update_status(ClientStatus::Error);
            return Err(ChatFailure::empty_response());
        };

        let Some(first_choice) = choices[0].as_object() else {
            self.increase_error_count();
            self.update_status(ClientStatus::Error);
            return Err(ChatFailure::processing(
                "Malformed choice entry in response",
            ));
        };

        // Truncation and content filtering are the API working as designed,
        // worth a warning but never an error count.
        match first_choice.get("finish_reason").and_then(|r| r.as_str()) {
            Some("length") => {
                warn!(client = %self.name, "response truncated due to length")
            }
            Some("content_filter") => {
                warn!(client = %self.name, "response triggered content filter")
            }
            _ => {}
        }

        if let Some(usage) = response.get("usage").filter(|u| !u.is_null()) {
            self.probe.record_usage(usage);
        }

        self.reset_error_count();
        self.update_status(ClientStatus::Available);
        Ok(response)
    }

    fn emit(&self, event: ClientEvent) {
        if let Some(sink) = self
            .sink
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
        {
            // A dropped consumer only costs us the timeline, never a chat.
            let _ = sink.send(event);
        }
    }

    #[cfg(test)]
    pub(crate) fn force_in_use(&self, in_use: bool) {
        self.state.lock().unwrap().in_use = in_use;
    }
}

/// Scripted adapter for exercising the client pipeline without a network.
#[cfg(test)]
pub(crate) struct ScriptedAdapter {
    outcomes: Mutex<std::collections::VecDeque<crate::types::ApiResult>>,
    token: Mutex<Option<String>>,
}

#[cfg(test)]
impl ScriptedAdapter {
    pub(crate) fn new(outcomes: Vec<crate::types::ApiResult>) -> Arc<Self> {
        Arc::new(Self {
            outcomes: Mutex::new(outcomes.into()),
            token: Mutex::new(Some("test-token".into())),
        })
    }

    /// A plausible chat-completion success body.
    pub(crate) fn ok_body(content: &str) -> serde_json::Value {
        serde_json::json!({
            "choices": [{
                "message": {"role": "assistant", "content": content},
                "finish_reason": "stop",
            }],
            "usage": {"prompt_tokens": 5, "completion_tokens": 2, "total_tokens": 7},
        })
    }
}

#[cfg(test)]
#[async_trait::async_trait]
impl ChatAdapter for ScriptedAdapter {
    fn api_token(&self) -> Option<String> {
        self.token.lock().unwrap().clone()
    }

    fn set_api_token(&self, token: String) {
        *self.token.lock().unwrap() = Some(token);
    }

    fn using_model(&self) -> String {
        "scripted-model".into()
    }

    fn api_base_url(&self) -> String {
        "http://scripted.test/v1".into()
    }

    async fn get_model_list(&self) -> crate::types::ApiResult {
        Ok(serde_json::json!({"data": [{"id": "scripted-model"}]}))
    }

    async fn create_chat_completion(
        &self,
        _messages: &[ChatMessage],
        _model: Option<&str>,
        _temperature: f32,
        _max_tokens: u32,
        _is_health_check: bool,
    ) -> crate::types::ApiResult {
        self.outcomes
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Ok(Self::ok_body(TEST_EXPECTED)))
    }
}
