//! Headless engine for a themed security-mentor chat client.
//!
//! The presentation layer (sidebar, message rendering, theming) lives in the
//! host application; this crate owns everything behind it: the session
//! collection ([`store::ConversationStore`]), the outbound message pipeline
//! ([`controller::DispatchController`] driving [`api::CompletionClient`]),
//! assistant-text post-processing ([`format`]), and the CVE lookup used to
//! seed analysis chats ([`cve`]).

// Declare the modules
pub mod api;
pub mod config;
pub mod controller;
pub mod cve;
pub mod format;
pub mod models;
pub mod persona;
pub mod store;

pub use api::{
    cancellation_pair, CancelHandle, CancelToken, CompletionApi, CompletionClient,
    CompletionError, IncompleteReason, RetryPolicy,
};
pub use config::{load_credentials, Credentials, EngineConfig};
pub use controller::{DispatchController, SendRejected};
pub use cve::{analysis_prompt, CveClient, CveError, CveRecord};
pub use models::{ChatSession, FileContext, Message, MessageKind, RetryPayload, Sender};
pub use persona::Persona;
pub use store::{ConversationStore, JsonFileSnapshot, SessionSeed, Snapshot};
