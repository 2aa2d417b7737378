use crate::models::{ChatSession, FileContext, Message};
use anyhow::{Context, Result};
use std::fs;
use std::path::PathBuf;
use uuid::Uuid;

const DEFAULT_TITLE: &str = "New chat";
const DEFAULT_SUBTITLE: &str = "No messages yet";
const WELCOME_TITLE: &str = "Welcome to the academy";
const WELCOME_SUBTITLE: &str = "Security mentor";

/// Persistence collaborator for the session collection. Implementations map
/// to whatever the host environment offers (tab-scoped storage, a file on
/// disk); failures must never abort the chat flow, so the store only logs
/// them.
pub trait Snapshot: Send + Sync {
    fn persist(&self, sessions: &[ChatSession]) -> Result<()>;
    /// Returns `Ok(None)` when no snapshot exists yet.
    fn load(&self) -> Result<Option<Vec<ChatSession>>>;
}

/// Snapshot backend serializing the full session collection as JSON under a
/// fixed path on every mutation.
pub struct JsonFileSnapshot {
    path: PathBuf,
}

impl JsonFileSnapshot {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl Snapshot for JsonFileSnapshot {
    fn persist(&self, sessions: &[ChatSession]) -> Result<()> {
        let json = serde_json::to_string(sessions).context("Failed to serialize sessions")?;
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).context("Failed to create snapshot directory")?;
        }
        fs::write(&self.path, json).context("Failed to write session snapshot")
    }

    fn load(&self) -> Result<Option<Vec<ChatSession>>> {
        if !self.path.exists() {
            return Ok(None);
        }
        let raw = fs::read_to_string(&self.path).context("Failed to read session snapshot")?;
        let sessions: Vec<ChatSession> =
            serde_json::from_str(&raw).context("Failed to parse session snapshot")?;
        Ok(Some(sessions))
    }
}

/// Optional overrides applied when creating a session: preset title/subtitle
/// for analysis chats, an attached file context for uploads.
#[derive(Default)]
pub struct SessionSeed {
    pub title: Option<String>,
    pub subtitle: Option<String>,
    pub file_context: Option<FileContext>,
}

/// Ordered collection of chat sessions plus the "current" pointer.
///
/// Exactly one session is current at any time, and the collection is never
/// empty: deleting the last session replaces it with a fresh welcome session.
pub struct ConversationStore {
    sessions: Vec<ChatSession>,
    current: Uuid,
    snapshot: Option<Box<dyn Snapshot>>,
}

impl ConversationStore {
    /// Rehydrates from the snapshot; corrupt or absent data falls back to a
    /// single fresh welcome session.
    pub fn new(snapshot: Option<Box<dyn Snapshot>>) -> Self {
        let sessions = match snapshot.as_ref().map(|s| s.load()) {
            Some(Ok(Some(sessions))) if !sessions.is_empty() => sessions,
            Some(Err(e)) => {
                log::warn!("Discarding unreadable session snapshot: {:#}", e);
                vec![ChatSession::new(WELCOME_TITLE, WELCOME_SUBTITLE)]
            }
            _ => vec![ChatSession::new(WELCOME_TITLE, WELCOME_SUBTITLE)],
        };
        let current = sessions[0].id;
        Self {
            sessions,
            current,
            snapshot,
        }
    }

    /// Store without a persistence backend.
    pub fn in_memory() -> Self {
        Self::new(None)
    }

    fn persist(&self) {
        if let Some(snapshot) = &self.snapshot {
            if let Err(e) = snapshot.persist(&self.sessions) {
                log::warn!("Failed to persist sessions, continuing: {:#}", e);
            }
        }
    }

    pub fn sessions(&self) -> &[ChatSession] {
        &self.sessions
    }

    pub fn current_id(&self) -> Uuid {
        self.current
    }

    pub fn current(&self) -> &ChatSession {
        self.sessions
            .iter()
            .find(|s| s.id == self.current)
            .expect("current session always exists")
    }

    pub fn session(&self, id: Uuid) -> Option<&ChatSession> {
        self.sessions.iter().find(|s| s.id == id)
    }

    fn session_mut(&mut self, id: Uuid) -> Option<&mut ChatSession> {
        self.sessions.iter_mut().find(|s| s.id == id)
    }

    /// Creates a session at the front of the collection and makes it current.
    pub fn create_session(&mut self, seed: SessionSeed) -> Uuid {
        let mut session = ChatSession::new(
            seed.title.unwrap_or_else(|| DEFAULT_TITLE.to_string()),
            seed.subtitle.unwrap_or_else(|| DEFAULT_SUBTITLE.to_string()),
        );
        session.file_context = seed.file_context;
        let id = session.id;
        self.sessions.insert(0, session);
        self.current = id;
        self.persist();
        id
    }

    /// "New chat": reuses an existing empty session instead of stacking
    /// blanks, creating one only when every session has messages.
    pub fn open_blank_session(&mut self) -> Uuid {
        if let Some(existing) = self.sessions.iter().find(|s| s.is_empty()) {
            self.current = existing.id;
            return existing.id;
        }
        self.create_session(SessionSeed::default())
    }

    pub fn select_session(&mut self, id: Uuid) -> bool {
        if self.sessions.iter().any(|s| s.id == id) {
            self.current = id;
            true
        } else {
            false
        }
    }

    /// Deletes a session. Deleting the current one promotes the first
    /// survivor; deleting the last one leaves a fresh welcome session.
    pub fn delete_session(&mut self, id: Uuid) {
        self.sessions.retain(|s| s.id != id);
        if self.sessions.is_empty() {
            let fresh = ChatSession::new(WELCOME_TITLE, WELCOME_SUBTITLE);
            self.current = fresh.id;
            self.sessions.push(fresh);
        } else if self.current == id {
            self.current = self.sessions[0].id;
        }
        self.persist();
    }

    /// Replaces a session's message list wholesale and advances `updated_at`.
    pub fn replace_messages(&mut self, id: Uuid, messages: Vec<Message>) -> bool {
        let Some(session) = self.session_mut(id) else {
            log::warn!("replace_messages on unknown session {}", id);
            return false;
        };
        session.messages = messages;
        session.updated_at = chrono::Utc::now();
        self.persist();
        true
    }

    /// Patches display metadata without touching the message list.
    pub fn patch_metadata(
        &mut self,
        id: Uuid,
        title: Option<String>,
        subtitle: Option<String>,
    ) -> bool {
        let Some(session) = self.session_mut(id) else {
            log::warn!("patch_metadata on unknown session {}", id);
            return false;
        };
        if let Some(title) = title {
            session.title = title;
        }
        if let Some(subtitle) = subtitle {
            session.subtitle = subtitle;
        }
        self.persist();
        true
    }
}
