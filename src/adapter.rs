//! The pluggable backend seam.
//!
//! A [`ChatAdapter`] is everything a [`crate::client::BackendClient`] needs
//! from a concrete upstream: credential access, model discovery, and a
//! single classified chat-completion call. Concrete SDK wrappers implement
//! this trait; the rest of the fleet never sees transport details.

use async_trait::async_trait;

use crate::http_api::OpenAiCompatApi;
use crate::types::{ApiResult, ChatMessage};

#[async_trait]
pub trait ChatAdapter: Send + Sync {
    fn api_token(&self) -> Option<String>;

    fn set_api_token(&self, token: String);

    /// Model the adapter would use (or last used) for a request.
    fn using_model(&self) -> String;

    fn api_base_url(&self) -> String;

    async fn get_model_list(&self) -> ApiResult;

    /// One chat-completion attempt group. Implementations must classify
    /// every outcome into the `ApiResult` taxonomy; partial results (e.g. a
    /// stream that dies midway) are reported as a single failure, never as
    /// a truncated success.
    async fn create_chat_completion(
        &self,
        messages: &[ChatMessage],
        model: Option<&str>,
        temperature: f32,
        max_tokens: u32,
        is_health_check: bool,
    ) -> ApiResult;
}

#[async_trait]
impl ChatAdapter for OpenAiCompatApi {
    fn api_token(&self) -> Option<String> {
        OpenAiCompatApi::api_token(self)
    }

    fn set_api_token(&self, token: String) {
        OpenAiCompatApi::set_api_token(self, token)
    }

    fn using_model(&self) -> String {
        OpenAiCompatApi::using_model(self)
    }

    fn api_base_url(&self) -> String {
        self.base_url().to_string()
    }

    async fn get_model_list(&self) -> ApiResult {
        OpenAiCompatApi::get_model_list(self).await
    }

    async fn create_chat_completion(
        &self,
        messages: &[ChatMessage],
        model: Option<&str>,
        temperature: f32,
        max_tokens: u32,
        is_health_check: bool,
    ) -> ApiResult {
        OpenAiCompatApi::create_chat_completion(
            self,
            messages,
            model,
            temperature,
            max_tokens,
            is_health_check,
        )
        .await
    }
}
