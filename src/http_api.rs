//! HTTP execution core for OpenAI-compatible endpoints.
//!
//! Wraps one upstream base URL with a pooled reqwest client and turns every
//! transport or HTTP outcome into a structured [`ApiResult`]. Nothing
//! escapes this module as a panic or a raw transport error: callers always
//! receive either the parsed response body or a classified [`ApiFailure`].
//!
//! Policy implemented here:
//! - connect timeout 5s; total timeout 300s for normal calls, 5s for health
//!   checks
//! - up to 3 attempts with jittered exponential backoff (base 2, at most
//!   30s spent waiting), retrying only connection-class errors; HTTP
//!   statuses and read timeouts are never retried
//! - after retries exhaust on a connection failure, the pooled client is
//!   rebuilt so a wedged pool or stale proxy cannot poison later calls

use std::sync::Mutex;
use std::time::{Duration, Instant};

use rand::Rng;
use serde_json::json;
use tracing::{debug, warn};

use crate::types::{codes, ApiFailure, ApiResult, ChatMessage, ErrorKind};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const READ_TIMEOUT: Duration = Duration::from_secs(300);
const HEALTH_CHECK_TIMEOUT: Duration = Duration::from_secs(5);
const POOL_MAX_IDLE_PER_HOST: usize = 20;
const MAX_TRIES: u32 = 3;
const MAX_RETRY_ELAPSED: Duration = Duration::from_secs(30);

/// Construction parameters for [`OpenAiCompatApi`].
#[derive(Debug, Clone, Default)]
pub struct HttpApiConfig {
    pub api_base_url: String,
    pub token: Option<String>,
    pub default_model: String,
    pub proxy: Option<String>,
}

/// Connection-pool client for one OpenAI-compatible backend.
pub struct OpenAiCompatApi {
    base_url: String,
    default_model: String,
    proxy: Option<String>,
    /// Guards credential swaps; requests snapshot the token and release the
    /// lock before any I/O.
    token: Mutex<Option<String>>,
    using_model: Mutex<String>,
    /// Swapped wholesale on self-heal. `reqwest::Client` is internally
    /// reference-counted, so requests in flight keep the old pool alive
    /// until they finish.
    client: Mutex<reqwest::Client>,
}

impl OpenAiCompatApi {
    pub fn new(config: HttpApiConfig) -> anyhow::Result<Self> {
        let client = build_client(config.proxy.as_deref())?;
        Ok(Self {
            base_url: config.api_base_url.trim().trim_end_matches('/').to_string(),
            using_model: Mutex::new(config.default_model.clone()),
            default_model: config.default_model,
            proxy: config.proxy,
            token: Mutex::new(config.token),
            client: Mutex::new(client),
        })
    }

    pub fn api_token(&self) -> Option<String> {
        self.token.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn set_api_token(&self, token: String) {
        let mut guard = self.token.lock().unwrap_or_else(|e| e.into_inner());
        *guard = Some(token);
        debug!(base_url = %self.base_url, "API token updated");
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Model name most recently sent upstream (dashboard display).
    pub fn using_model(&self) -> String {
        self.using_model
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// One chat-completion attempt group, classified into an [`ApiResult`].
    pub async fn create_chat_completion(
        &self,
        messages: &[ChatMessage],
        model: Option<&str>,
        temperature: f32,
        max_tokens: u32,
        is_health_check: bool,
    ) -> ApiResult {
        if self.api_token().is_none() {
            return Err(ApiFailure::missing_token());
        }

        let model = model.unwrap_or(&self.default_model).to_string();
        *self.using_model.lock().unwrap_or_else(|e| e.into_inner()) = model.clone();

        let payload = json!({
            "model": model,
            "messages": messages,
            "temperature": temperature,
            "max_tokens": max_tokens,
        });

        self.post_unified("chat/completions", &payload, is_health_check)
            .await
    }

    /// `GET /models`, classified the same way as completions.
    pub async fn get_model_list(&self) -> ApiResult {
        if self.api_token().is_none() {
            return Err(ApiFailure::missing_token());
        }

        let url = self.construct_url("models");
        let client = self.snapshot_client();
        let request = client
            .get(&url)
            .bearer_auth(self.api_token().unwrap_or_default())
            .timeout(READ_TIMEOUT);

        match request.send().await {
            Ok(response) => classify_response(response).await,
            Err(err) => self.network_failure(&err),
        }
    }

    async fn post_unified(
        &self,
        endpoint: &str,
        payload: &serde_json::Value,
        is_health_check: bool,
    ) -> ApiResult {
        let url = self.construct_url(endpoint);
        let total_timeout = if is_health_check {
            HEALTH_CHECK_TIMEOUT
        } else {
            READ_TIMEOUT
        };
        // Health checks fail fast; no second chances.
        let max_tries = if is_health_check { 1 } else { MAX_TRIES };

        let started = Instant::now();
        let mut attempt = 0u32;
        let last_err = loop {
            attempt += 1;

            let client = self.snapshot_client();
            let request = client
                .post(&url)
                .bearer_auth(self.api_token().unwrap_or_default())
                .json(payload)
                .timeout(total_timeout);

            debug!(%url, attempt, "POST chat completion");
            match request.send().await {
                // An HTTP response, whatever the status, ends the attempt
                // group: statuses are classified, never retried.
                Ok(response) => return classify_response(response).await,
                Err(err) => {
                    if !is_retryable(&err) || attempt >= max_tries {
                        break err;
                    }
                    let delay = backoff_delay(attempt);
                    if started.elapsed() + delay > MAX_RETRY_ELAPSED {
                        break err;
                    }
                    warn!(
                        attempt,
                        error = %err,
                        wait_ms = delay.as_millis() as u64,
                        "connection attempt failed, backing off"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        };

        self.network_failure(&last_err)
    }

    /// Terminal transport failure: rebuild the pooled client, then report a
    /// `TransientNetwork` failure to the caller.
    fn network_failure(&self, err: &reqwest::Error) -> ApiResult {
        if let Err(reset_err) = self.reset_session() {
            return Err(ApiFailure::new(
                ErrorKind::TransientNetwork,
                codes::SESSION_RESET_FAILED,
                format!("Network failure: {err}. Session reset failed: {reset_err}"),
            ));
        }

        let code = if err.is_timeout() {
            codes::CONNECTION_TIMEOUT
        } else {
            codes::PROXY_FAIL
        };
        Err(ApiFailure::new(
            ErrorKind::TransientNetwork,
            code,
            format!("Critical network failure ({code}). Session reset triggered. Last error: {err}"),
        ))
    }

    /// Swap in a fresh client. The old pool is dropped lazily as in-flight
    /// requests holding it complete.
    fn reset_session(&self) -> anyhow::Result<()> {
        warn!(base_url = %self.base_url, "resetting HTTP session");
        let fresh = build_client(self.proxy.as_deref())?;
        *self.client.lock().unwrap_or_else(|e| e.into_inner()) = fresh;
        Ok(())
    }

    fn snapshot_client(&self) -> reqwest::Client {
        self.client.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    fn construct_url(&self, endpoint: &str) -> String {
        format!("{}/{}", self.base_url, endpoint.trim_start_matches('/'))
    }
}

fn build_client(proxy: Option<&str>) -> anyhow::Result<reqwest::Client> {
    let mut builder = reqwest::Client::builder()
        .pool_max_idle_per_host(POOL_MAX_IDLE_PER_HOST)
        .connect_timeout(CONNECT_TIMEOUT);
    if let Some(proxy) = proxy {
        builder = builder.proxy(reqwest::Proxy::all(proxy)?);
    }
    Ok(builder.build()?)
}

/// Connection-class errors (connect timeout, refused, proxy) are worth a
/// retry; a read timeout means the model is generating too slowly and
/// retrying would double the wait, so it is surfaced immediately.
fn is_retryable(err: &reqwest::Error) -> bool {
    err.is_connect()
}

/// Jittered exponential backoff: ~1s, ~2s, ~4s with up to 25% spread to
/// avoid thundering herds.
fn backoff_delay(attempt: u32) -> Duration {
    let base_ms = 1000u64.saturating_mul(1u64 << (attempt - 1).min(5));
    let jitter = rand::thread_rng().gen_range(0..=base_ms / 4);
    Duration::from_millis(base_ms + jitter)
}

/// Map a response status to its failure classification; `None` means 200.
pub(crate) fn classify_status(status: u16) -> Option<(ErrorKind, String)> {
    match status {
        200 => None,
        400 => Some((ErrorKind::BadRequest, codes::http(400))),
        401 | 403 | 404 => Some((ErrorKind::Permanent, codes::http(status))),
        429 => Some((ErrorKind::TransientServer, codes::http(429))),
        500..=599 => Some((ErrorKind::TransientServer, codes::http(status))),
        other => Some((ErrorKind::Permanent, codes::http(other))),
    }
}

async fn classify_response(response: reqwest::Response) -> ApiResult {
    let status = response.status().as_u16();
    match classify_status(status) {
        None => response.json::<serde_json::Value>().await.map_err(|err| {
            ApiFailure::new(
                ErrorKind::Permanent,
                codes::UNEXPECTED_CLIENT_ERROR,
                format!("Failed to decode response body: {err}"),
            )
        }),
        Some((kind, code)) => {
            // A short body excerpt helps debugging without ever being used
            // for control flow.
            let body = response.text().await.unwrap_or_default();
            let excerpt: String = body.chars().take(100).collect();
            Err(ApiFailure::new(
                kind,
                code,
                format!("HTTP {status}: {excerpt}"),
            ))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn api(token: Option<&str>) -> OpenAiCompatApi {
        OpenAiCompatApi::new(HttpApiConfig {
            api_base_url: "http://127.0.0.1:1/v1/".into(),
            token: token.map(String::from),
            default_model: "test-model".into(),
            proxy: None,
        })
        .unwrap()
    }

    #[test]
    fn test_classify_status_table() {
        assert!(classify_status(200).is_none());

        let (kind, code) = classify_status(400).unwrap();
        assert_eq!(kind, ErrorKind::BadRequest);
        assert_eq!(code, "HTTP_400");

        for status in [401u16, 403, 404] {
            let (kind, _) = classify_status(status).unwrap();
            assert_eq!(kind, ErrorKind::Permanent, "status {status}");
        }

        let (kind, code) = classify_status(429).unwrap();
        assert_eq!(kind, ErrorKind::TransientServer);
        assert_eq!(code, "HTTP_429");

        for status in [500u16, 502, 503, 504, 524] {
            let (kind, _) = classify_status(status).unwrap();
            assert_eq!(kind, ErrorKind::TransientServer, "status {status}");
        }

        // Anything else is permanent: odd 4xx, redirects.
        for status in [302u16, 402, 418, 422] {
            let (kind, _) = classify_status(status).unwrap();
            assert_eq!(kind, ErrorKind::Permanent, "status {status}");
        }
    }

    #[test]
    fn test_backoff_grows_and_stays_bounded() {
        let d1 = backoff_delay(1);
        let d3 = backoff_delay(3);
        assert!(d1 >= Duration::from_millis(1000));
        assert!(d1 <= Duration::from_millis(1250));
        assert!(d3 >= Duration::from_millis(4000));
        assert!(d3 <= Duration::from_millis(5000));
        // The shift is capped so huge attempt numbers cannot overflow.
        assert!(backoff_delay(40) <= Duration::from_secs(40));
    }

    #[test]
    fn test_url_construction() {
        let api = api(Some("k"));
        assert_eq!(
            api.construct_url("chat/completions"),
            "http://127.0.0.1:1/v1/chat/completions"
        );
        assert_eq!(api.construct_url("/models"), "http://127.0.0.1:1/v1/models");
    }

    #[test]
    fn test_token_swap() {
        let api = api(None);
        assert_eq!(api.api_token(), None);
        api.set_api_token("sk-new".into());
        assert_eq!(api.api_token().as_deref(), Some("sk-new"));
    }

    #[tokio::test]
    async fn test_missing_token_short_circuits() {
        let api = api(None);
        let result = api
            .create_chat_completion(&[ChatMessage::user("hi")], None, 0.7, 16, false)
            .await;
        let failure = result.unwrap_err();
        assert_eq!(failure.kind, ErrorKind::Permanent);
        assert_eq!(failure.code, codes::MISSING_TOKEN);
    }

    #[tokio::test]
    async fn test_unreachable_host_is_transient_network() {
        // Port 1 refuses immediately; the health-check path does not retry,
        // so this stays fast.
        let api = api(Some("k"));
        let result = api
            .create_chat_completion(&[ChatMessage::user("ping")], None, 0.0, 16, true)
            .await;
        let failure = result.unwrap_err();
        assert_eq!(failure.kind, ErrorKind::TransientNetwork);
        assert!(
            failure.code == codes::CONNECTION_TIMEOUT || failure.code == codes::PROXY_FAIL,
            "unexpected code {}",
            failure.code
        );
    }

    #[tokio::test]
    async fn test_using_model_tracks_last_request() {
        let api = api(Some("k"));
        assert_eq!(api.using_model(), "test-model");
        let _ = api
            .create_chat_completion(&[ChatMessage::user("x")], Some("other-model"), 0.7, 16, true)
            .await;
        assert_eq!(api.using_model(), "other-model");
    }
}
