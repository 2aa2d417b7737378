use crate::api::{cancellation_pair, to_api_history, CancelHandle, CompletionApi};
use crate::format::format_assistant_response;
use crate::models::{FileContext, Message, RetryPayload};
use crate::persona::Persona;
use crate::store::ConversationStore;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::Mutex;
use uuid::Uuid;

/// Minimum enforced time between two outbound requests in the same session,
/// measured from the start of the previous request.
pub const MIN_REQUEST_INTERVAL: Duration = Duration::from_secs(10);

// Session titles become an excerpt of the first user message.
const TITLE_MAX_CHARS: usize = 48;
const TITLE_EXCERPT_CHARS: usize = 45;

/// Why a send was rejected before any state change. Completion failures are
/// not rejections: they surface as error-kind messages in the session.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SendRejected {
    #[error("Cannot send an empty message.")]
    EmptyInput,
    #[error("A request is already in flight for this session.")]
    Busy,
    #[error("Please wait {remaining_secs} second(s) before sending another message.")]
    Cooldown { remaining_secs: u64 },
    #[error("Session no longer exists.")]
    UnknownSession,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Phase {
    Idle,
    Sending,
    /// Between a stop request and the in-flight call settling; new sends are
    /// rejected until the settlement lands.
    PendingCancel,
}

struct DispatchState {
    phase: Phase,
    last_request_start: Option<Instant>,
}

/// Per-session orchestrator of the send/retry/stop cycle. Enforces the
/// single-in-flight rule and the inter-request cooldown, performs the
/// optimistic append, and writes every outcome back into the store.
///
/// Clones share state, so `stop` can be called from another task while
/// `send` is awaited.
#[derive(Clone)]
pub struct DispatchController {
    store: Arc<Mutex<ConversationStore>>,
    client: Arc<dyn CompletionApi>,
    session_id: Uuid,
    persona: Persona,
    min_interval: Duration,
    state: Arc<Mutex<DispatchState>>,
    cancels: Arc<DashMap<Uuid, CancelHandle>>,
}

impl DispatchController {
    pub fn new(
        store: Arc<Mutex<ConversationStore>>,
        client: Arc<dyn CompletionApi>,
        session_id: Uuid,
        persona: Persona,
    ) -> Self {
        Self {
            store,
            client,
            session_id,
            persona,
            min_interval: MIN_REQUEST_INTERVAL,
            state: Arc::new(Mutex::new(DispatchState {
                phase: Phase::Idle,
                last_request_start: None,
            })),
            cancels: Arc::new(DashMap::new()),
        }
    }

    /// Overrides the cooldown interval. Intended for tests.
    pub fn with_min_interval(mut self, min_interval: Duration) -> Self {
        self.min_interval = min_interval;
        self
    }

    pub fn session_id(&self) -> Uuid {
        self.session_id
    }

    /// One full send cycle: validation, optimistic append, completion call,
    /// result write-back. Resolves once the outcome (assistant reply or
    /// error-kind message) has been stored.
    pub async fn send(&self, text: &str) -> Result<(), SendRejected> {
        let trimmed = text.trim();
        if trimmed.is_empty() {
            return Err(SendRejected::EmptyInput);
        }

        {
            let mut state = self.state.lock().await;
            if state.phase != Phase::Idle {
                return Err(SendRejected::Busy);
            }
            if let Some(last) = state.last_request_start {
                let elapsed = last.elapsed();
                if elapsed < self.min_interval {
                    let remaining = self.min_interval - elapsed;
                    return Err(SendRejected::Cooldown {
                        remaining_secs: remaining.as_secs_f64().ceil() as u64,
                    });
                }
            }
            state.phase = Phase::Sending;
            state.last_request_start = Some(Instant::now());
        }

        // Optimistic append: the user message lands before the call starts
        // and stays in place whatever the outcome.
        let (user_message, messages) = {
            let mut store = self.store.lock().await;
            let Some(session) = store.session(self.session_id) else {
                self.state.lock().await.phase = Phase::Idle;
                return Err(SendRejected::UnknownSession);
            };
            let first_message = session.is_empty();
            let mut messages = session.messages.clone();
            let user_message = Message::user(trimmed);
            messages.push(user_message.clone());
            store.replace_messages(self.session_id, messages.clone());

            if first_message {
                store.patch_metadata(
                    self.session_id,
                    Some(excerpt_title(trimmed)),
                    Some("Just now".to_string()),
                );
            }
            (user_message, messages)
        };

        self.run_cycle(user_message, messages).await;
        Ok(())
    }

    /// Replays a failed request from its captured payload. Skips the cooldown
    /// re-validation but honors the single-in-flight rule. On success the
    /// error message is replaced by the assistant reply; on failure by a
    /// fresh, equally retryable error message.
    pub async fn retry(&self, payload: RetryPayload) -> Result<(), SendRejected> {
        {
            let mut state = self.state.lock().await;
            if state.phase != Phase::Idle {
                return Err(SendRejected::Busy);
            }
            state.phase = Phase::Sending;
            state.last_request_start = Some(Instant::now());
        }

        let RetryPayload {
            user_message,
            messages,
        } = payload;
        self.run_cycle(*user_message, messages).await;
        Ok(())
    }

    /// Signals cancellation of the in-flight call. The optimistic user
    /// message stays; the eventual `Cancelled` settlement is surfaced as a
    /// normal error-kind message.
    pub async fn stop(&self) {
        let mut state = self.state.lock().await;
        if state.phase == Phase::Sending {
            state.phase = Phase::PendingCancel;
            if let Some(handle) = self.cancels.get(&self.session_id) {
                handle.cancel();
            }
        }
    }

    /// Shared post-acceptance path of `send` and `retry`. `messages` is the
    /// session's list with the user message already appended; the outbound
    /// history is everything before it.
    async fn run_cycle(&self, user_message: Message, messages: Vec<Message>) {
        let prior = &messages[..messages.len() - 1];
        let history = to_api_history(prior);

        // File context rides along on exactly the first request of a session.
        // Recomposing it here (instead of capturing it in the payload) keeps
        // retries identical to the original send: the context is immutable
        // after session creation.
        let outbound_text = {
            let store = self.store.lock().await;
            let file_context = store
                .session(self.session_id)
                .and_then(|s| s.file_context.clone());
            compose_outbound_text(&user_message.text, prior.is_empty(), file_context.as_ref())
        };

        let (handle, token) = cancellation_pair();
        self.cancels.insert(self.session_id, handle);

        let result = self
            .client
            .send(&history, &outbound_text, Some(token), self.persona, None)
            .await;

        self.cancels.remove(&self.session_id);

        let mut final_messages = messages.clone();
        match result {
            Ok(text) => {
                final_messages.push(Message::assistant(format_assistant_response(&text)));
            }
            Err(e) => {
                log::error!(
                    "Completion call failed for session {}: {}",
                    self.session_id,
                    e
                );
                let payload = RetryPayload {
                    user_message: Box::new(user_message),
                    messages,
                };
                final_messages.push(Message::error(e.to_string(), payload));
            }
        }

        // The outcome must land in the store before the phase returns to
        // Idle: a send accepted in between would clone a stale message list
        // and the two wholesale writes would erase each other's append.
        {
            let mut store = self.store.lock().await;
            store.replace_messages(self.session_id, final_messages);
        }
        self.state.lock().await.phase = Phase::Idle;
    }
}

fn excerpt_title(text: &str) -> String {
    if text.chars().count() > TITLE_MAX_CHARS {
        let head: String = text.chars().take(TITLE_EXCERPT_CHARS).collect();
        format!("{}...", head)
    } else {
        text.to_string()
    }
}

fn compose_outbound_text(
    text: &str,
    first_request: bool,
    file_context: Option<&FileContext>,
) -> String {
    match file_context {
        Some(ctx) if first_request => format!(
            "[File uploaded: {} ({})]\n\nFile content:\n{}\n\n---\n\nUser question: {}",
            ctx.name,
            ctx.size_kb(),
            ctx.content,
            text
        ),
        _ => text.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_titles_pass_through() {
        assert_eq!(excerpt_title("How do I read auth logs?"), "How do I read auth logs?");
    }

    #[test]
    fn long_titles_are_excerpted_with_ellipsis() {
        let long = "a".repeat(60);
        let title = excerpt_title(&long);
        assert_eq!(title.chars().count(), TITLE_EXCERPT_CHARS + 3);
        assert!(title.ends_with("..."));
    }

    #[test]
    fn file_context_only_joins_the_first_request() {
        let ctx = FileContext::new("notes.txt", 2048, "interesting bytes");
        let first = compose_outbound_text("what is this?", true, Some(&ctx));
        assert!(first.contains("[File uploaded: notes.txt (2.0 KB)]"));
        assert!(first.contains("interesting bytes"));
        assert!(first.ends_with("User question: what is this?"));

        let later = compose_outbound_text("and now?", false, Some(&ctx));
        assert_eq!(later, "and now?");
    }
}
