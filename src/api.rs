use crate::config::{Credentials, EngineConfig};
use crate::models::Message;
use crate::persona::Persona;
use async_trait::async_trait;
use rand::Rng;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;

/// Maximum number of history entries sent per request. Older context is
/// silently dropped to bound token usage.
pub const MAX_HISTORY_LEN: usize = 4;

/// Fixed sampling temperature for all completion requests.
const TEMPERATURE: f64 = 0.7;

// --- Cancellation ---

/// Creates a linked handle/token pair. The handle side signals, the token
/// side is passed into the async call and observed cooperatively.
pub fn cancellation_pair() -> (CancelHandle, CancelToken) {
    let (tx, rx) = watch::channel(false);
    (CancelHandle { tx }, CancelToken { rx })
}

/// Signalling side of a cancellation pair.
#[derive(Debug)]
pub struct CancelHandle {
    tx: watch::Sender<bool>,
}

impl CancelHandle {
    pub fn cancel(&self) {
        let _ = self.tx.send(true);
    }
}

/// Cooperative cancellation token. Signalling does not forcibly terminate an
/// underlying network call; the awaiting code path observes the token and
/// drops the in-flight future, treating the settlement as `Cancelled`.
#[derive(Clone, Debug)]
pub struct CancelToken {
    rx: watch::Receiver<bool>,
}

impl CancelToken {
    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once cancellation is signalled. Pends forever if the handle
    /// was dropped without signalling.
    pub async fn cancelled(&mut self) {
        if *self.rx.borrow() {
            return;
        }
        while self.rx.changed().await.is_ok() {
            if *self.rx.borrow() {
                return;
            }
        }
        std::future::pending::<()>().await;
    }
}

// --- Error taxonomy ---

/// Why a successful HTTP response still carried no usable content.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IncompleteReason {
    /// Truncated by the token limit (`finish_reason: length`).
    Truncated,
    /// Blocked by the provider's filter (`finish_reason: content_filter`).
    ContentFiltered,
    /// Any other reported finish reason.
    Other(String),
    /// No content and no finish reason at all.
    Empty,
}

impl fmt::Display for IncompleteReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IncompleteReason::Truncated => {
                write!(f, "The response was truncated. Please ask a shorter question.")
            }
            IncompleteReason::ContentFiltered => {
                write!(f, "The request was blocked for safety reasons. Please rephrase it.")
            }
            IncompleteReason::Other(reason) => {
                write!(f, "The model could not finish: {}.", reason)
            }
            IncompleteReason::Empty => {
                write!(f, "The model returned nothing. Please try again in a moment.")
            }
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CompletionError {
    #[error("API key not configured")]
    MissingApiKey,
    #[error("Invalid API key. Please check your API configuration.")]
    InvalidApiKey,
    #[error("Rate limit exceeded. Please wait before sending another request.")]
    RateLimited,
    #[error("Completion service error. Please try again later.")]
    ServiceUnavailable,
    #[error("No response from API. Please check your internet connection.")]
    NetworkUnreachable,
    #[error("API Error: {message}")]
    Api { status: u16, message: String },
    #[error("{0}")]
    Incomplete(IncompleteReason),
    #[error("Query stopped by user.")]
    Cancelled,
    #[error("{0}")]
    Unknown(String),
}

// --- Wire types ---

/// A `{role, content}` pair as the completion endpoint expects it.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct ApiMessage {
    pub role: String,
    pub content: String,
}

impl From<&Message> for ApiMessage {
    fn from(msg: &Message) -> Self {
        Self {
            role: msg.sender.as_role().to_string(),
            content: msg.text.clone(),
        }
    }
}

/// Converts UI-side messages into the wire format.
pub fn to_api_history(messages: &[Message]) -> Vec<ApiMessage> {
    messages.iter().map(ApiMessage::from).collect()
}

#[derive(Serialize, Debug)]
struct CompletionRequestBody<'a> {
    model: &'a str,
    messages: &'a [ApiMessage],
    temperature: f64,
    stream: bool,
}

#[derive(Deserialize, Debug)]
struct CompletionResponseBody {
    #[serde(default)]
    choices: Vec<CompletionChoice>,
}

#[derive(Deserialize, Debug)]
struct CompletionChoice {
    message: Option<ChoiceMessage>,
    finish_reason: Option<String>,
}

#[derive(Deserialize, Debug)]
struct ChoiceMessage {
    content: Option<String>,
}

// Best-effort extraction of the provider's error message from a failed body.
fn api_error_message(body: &str) -> String {
    serde_json::from_str::<serde_json::Value>(body)
        .ok()
        .and_then(|v| v["error"]["message"].as_str().map(String::from))
        .unwrap_or_else(|| "Unknown API error".to_string())
}

// --- Retry policy ---

/// Bounded, jittered exponential backoff. Absorbs transient server hiccups
/// (HTTP 500) and explicit rate-limit signals (HTTP 429) without retrying
/// conditions retries cannot fix.
#[derive(Clone, Copy, Debug)]
pub struct RetryPolicy {
    /// Retries after the first attempt; a single user action makes at most
    /// `max_retries + 1` calls.
    pub max_retries: u32,
    pub base_backoff: Duration,
    /// Small random jitter added to each backoff to avoid thundering herds.
    pub jitter_cap_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 2,
            base_backoff: Duration::from_millis(3000),
            jitter_cap_ms: 400,
        }
    }
}

impl RetryPolicy {
    fn backoff_delay(&self, attempt: u32) -> Duration {
        let jitter = if self.jitter_cap_ms == 0 {
            0
        } else {
            rand::thread_rng().gen_range(0..self.jitter_cap_ms)
        };
        self.base_backoff * (attempt + 1) + Duration::from_millis(jitter)
    }
}

// --- Completion client ---

// Trait seam for the completion endpoint, so the dispatch controller can be
// exercised against a scripted implementation.
#[async_trait]
pub trait CompletionApi: Send + Sync {
    /// Sends one chat turn and returns the assistant's text.
    ///
    /// `history` holds the prior turns (truncated to [`MAX_HISTORY_LEN`]
    /// before sending), `new_message` the latest user turn. The system
    /// instruction comes from `system_override` when given, otherwise from
    /// the persona.
    async fn send(
        &self,
        history: &[ApiMessage],
        new_message: &str,
        cancel: Option<CancelToken>,
        persona: Persona,
        system_override: Option<&str>,
    ) -> Result<String, CompletionError>;
}

/// reqwest-backed client for an OpenAI-compatible chat-completion endpoint.
pub struct CompletionClient {
    client: Client,
    endpoint: String,
    model: String,
    credentials: Credentials,
    retry: RetryPolicy,
}

impl CompletionClient {
    pub fn new(config: &EngineConfig, credentials: Credentials) -> Self {
        Self::with_retry_policy(config, credentials, RetryPolicy::default())
    }

    pub fn with_retry_policy(
        config: &EngineConfig,
        credentials: Credentials,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            client: Client::new(),
            endpoint: config.endpoint.clone(),
            model: config.model.clone(),
            credentials,
            retry,
        }
    }

    async fn sleep_or_cancel(
        &self,
        delay: Duration,
        cancel: &mut Option<CancelToken>,
    ) -> Result<(), CompletionError> {
        match cancel {
            Some(token) => tokio::select! {
                _ = token.cancelled() => Err(CompletionError::Cancelled),
                _ = tokio::time::sleep(delay) => Ok(()),
            },
            None => {
                tokio::time::sleep(delay).await;
                Ok(())
            }
        }
    }

    /// Extracts the first choice's content; an empty body maps to a specific
    /// incomplete-response error rather than an empty Ok.
    fn extract_content(parsed: CompletionResponseBody) -> Result<String, CompletionError> {
        let choice = parsed.choices.into_iter().next();
        let content = choice
            .as_ref()
            .and_then(|c| c.message.as_ref())
            .and_then(|m| m.content.as_deref())
            .map(str::trim)
            .unwrap_or("");

        if !content.is_empty() {
            return Ok(content.to_string());
        }

        let reason = match choice.and_then(|c| c.finish_reason).as_deref() {
            Some("length") => IncompleteReason::Truncated,
            Some("content_filter") => IncompleteReason::ContentFiltered,
            Some(other) => IncompleteReason::Other(other.to_string()),
            None => IncompleteReason::Empty,
        };
        Err(CompletionError::Incomplete(reason))
    }
}

#[async_trait]
impl CompletionApi for CompletionClient {
    async fn send(
        &self,
        history: &[ApiMessage],
        new_message: &str,
        cancel: Option<CancelToken>,
        persona: Persona,
        system_override: Option<&str>,
    ) -> Result<String, CompletionError> {
        // Resolve the credential before any network I/O.
        let api_key = self
            .credentials
            .resolve()
            .ok_or(CompletionError::MissingApiKey)?
            .to_string();

        let system_prompt = system_override.unwrap_or_else(|| persona.system_prompt());

        let start = history.len().saturating_sub(MAX_HISTORY_LEN);
        let mut messages = Vec::with_capacity(history.len() - start + 2);
        messages.push(ApiMessage {
            role: "system".to_string(),
            content: system_prompt.to_string(),
        });
        messages.extend_from_slice(&history[start..]);
        messages.push(ApiMessage {
            role: "user".to_string(),
            content: new_message.to_string(),
        });

        let body = CompletionRequestBody {
            model: &self.model,
            messages: &messages,
            temperature: TEMPERATURE,
            stream: false,
        };

        let mut cancel = cancel;

        for attempt in 0..=self.retry.max_retries {
            if let Some(token) = &cancel {
                if token.is_cancelled() {
                    return Err(CompletionError::Cancelled);
                }
            }

            log::debug!(
                "Sending completion request to {} (attempt {}/{})",
                self.endpoint,
                attempt + 1,
                self.retry.max_retries + 1
            );

            let request = self
                .client
                .post(&self.endpoint)
                .bearer_auth(&api_key)
                .json(&body)
                .send();

            let outcome = match &mut cancel {
                Some(token) => tokio::select! {
                    _ = token.cancelled() => return Err(CompletionError::Cancelled),
                    result = request => result,
                },
                None => request.await,
            };

            let is_last_attempt = attempt == self.retry.max_retries;

            match outcome {
                Ok(response) => {
                    let status = response.status();

                    if status.is_success() {
                        let parsed: CompletionResponseBody = response
                            .json()
                            .await
                            .map_err(|e| CompletionError::Unknown(e.to_string()))?;
                        return Self::extract_content(parsed);
                    }

                    match status {
                        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                            log::error!("Completion request rejected with status {}", status);
                            return Err(CompletionError::InvalidApiKey);
                        }
                        StatusCode::TOO_MANY_REQUESTS => {
                            if is_last_attempt {
                                return Err(CompletionError::RateLimited);
                            }
                            // Honor the server's retry-after (seconds) when present.
                            let retry_after = response
                                .headers()
                                .get(reqwest::header::RETRY_AFTER)
                                .and_then(|v| v.to_str().ok())
                                .and_then(|s| s.parse::<u64>().ok());
                            let delay = retry_after
                                .map(Duration::from_secs)
                                .unwrap_or_else(|| self.retry.backoff_delay(attempt));
                            log::warn!(
                                "Rate limited (429); retrying in {:?} (attempt {})",
                                delay,
                                attempt + 1
                            );
                            self.sleep_or_cancel(delay, &mut cancel).await?;
                        }
                        StatusCode::INTERNAL_SERVER_ERROR => {
                            if is_last_attempt {
                                return Err(CompletionError::ServiceUnavailable);
                            }
                            let delay = self.retry.backoff_delay(attempt);
                            log::warn!(
                                "Completion service returned 500; retrying in {:?} (attempt {})",
                                delay,
                                attempt + 1
                            );
                            self.sleep_or_cancel(delay, &mut cancel).await?;
                        }
                        other => {
                            let text = response.text().await.unwrap_or_default();
                            let message = api_error_message(&text);
                            log::error!("Completion request failed with status {}: {}", other, message);
                            return Err(CompletionError::Api {
                                status: other.as_u16(),
                                message,
                            });
                        }
                    }
                }
                Err(e) if e.is_builder() => {
                    return Err(CompletionError::Unknown(e.to_string()));
                }
                Err(e) => {
                    // Request was made but no response received.
                    if is_last_attempt {
                        log::error!("No response from completion endpoint: {}", e);
                        return Err(CompletionError::NetworkUnreachable);
                    }
                    let delay = self.retry.backoff_delay(attempt);
                    log::warn!("Transport error ({}); retrying in {:?}", e, delay);
                    self.sleep_or_cancel(delay, &mut cancel).await?;
                }
            }
        }

        // The loop always returns on its final attempt.
        Err(CompletionError::Unknown("retry loop exhausted".to_string()))
    }
}
