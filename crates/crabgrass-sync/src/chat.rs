use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tracing::Level;

use crabgrass_observability::{emit_event, redact_text, SyncEvent};
use crabgrass_types::{
    most_recent_session, AgentMessage, ChatMessage, ChatReply, ChatRequest, SessionSummary,
    SessionTranscript,
};

use crate::error::{Result, SyncError};
use crate::OBS_PROCESS;

/// Conversation endpoints for one document's agent.
#[async_trait]
pub trait ChatBackend: Send + Sync {
    async fn send_message(&self, request: ChatRequest) -> Result<ChatReply>;
    async fn list_sessions(&self) -> Result<Vec<SessionSummary>>;
    async fn load_transcript(&self, session_id: &str) -> Result<SessionTranscript>;

    /// Whether past sessions can be both listed and reloaded. Hydration is
    /// skipped when they cannot.
    fn resumes_sessions(&self) -> bool {
        true
    }
}

pub type CompletionHook = Arc<dyn Fn(bool) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ChatPhase {
    Idle,
    Active,
    Sending,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SendOutcome {
    /// Empty text, or another send was in flight.
    Ignored,
    Delivered { session_id: String },
    Failed { error: String },
}

#[derive(Debug, Clone, Serialize)]
pub struct ConversationSnapshot {
    pub phase: ChatPhase,
    pub session_id: Option<String>,
    pub messages: Vec<ChatMessage>,
    pub is_loading: bool,
    pub last_error: Option<String>,
    pub force_new: bool,
    pub is_complete: Option<bool>,
    pub sessions: Vec<SessionSummary>,
}

#[derive(Debug, Default)]
struct Conversation {
    session_id: Option<String>,
    messages: Vec<ChatMessage>,
    in_flight: bool,
    last_error: Option<String>,
    force_new: bool,
    is_complete: Option<bool>,
    sessions: Vec<SessionSummary>,
    // Bumped when the log is replaced; replies to older generations are
    // dropped.
    generation: u64,
}

impl Conversation {
    fn phase(&self) -> ChatPhase {
        if self.in_flight {
            ChatPhase::Sending
        } else if self.session_id.is_some() || !self.messages.is_empty() {
            ChatPhase::Active
        } else {
            ChatPhase::Idle
        }
    }
}

/// Clears `in_flight` if a send future is dropped before it finishes.
struct InFlight {
    state: Arc<Mutex<Conversation>>,
    generation: u64,
    settled: bool,
}

impl InFlight {
    fn settle(&mut self) {
        self.settled = true;
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        if self.settled {
            return;
        }
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.in_flight = false;
        if state.generation == self.generation {
            state.last_error = Some("Send cancelled".to_string());
        }
        tracing::debug!("Send dropped before the reply arrived");
    }
}

/// One document's conversation with its agent.
///
/// Cheap to clone; clones share state. At most one send is in flight.
#[derive(Clone)]
pub struct SessionChatEngine {
    state: Arc<Mutex<Conversation>>,
    backend: Arc<dyn ChatBackend>,
    send_timeout: Duration,
    reports_completion: bool,
    completion_hook: Option<CompletionHook>,
    label: Arc<str>,
}

impl SessionChatEngine {
    pub fn new(backend: Arc<dyn ChatBackend>, send_timeout: Duration) -> Self {
        Self {
            state: Arc::new(Mutex::new(Conversation::default())),
            backend,
            send_timeout,
            reports_completion: false,
            completion_hook: None,
            label: Arc::from("chat"),
        }
    }

    /// Only kernel documents report completion; the hook is ignored for
    /// everything else.
    pub fn with_completion(mut self, reports_completion: bool, hook: Option<CompletionHook>) -> Self {
        self.reports_completion = reports_completion;
        self.completion_hook = hook;
        self
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Arc::from(label.into());
        self
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Conversation> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn phase(&self) -> ChatPhase {
        self.lock().phase()
    }

    pub fn session_id(&self) -> Option<String> {
        self.lock().session_id.clone()
    }

    pub fn messages(&self) -> Vec<ChatMessage> {
        self.lock().messages.clone()
    }

    pub fn is_loading(&self) -> bool {
        self.lock().in_flight
    }

    pub fn last_error(&self) -> Option<String> {
        self.lock().last_error.clone()
    }

    pub fn is_complete(&self) -> Option<bool> {
        self.lock().is_complete
    }

    pub fn sessions(&self) -> Vec<SessionSummary> {
        self.lock().sessions.clone()
    }

    pub fn snapshot(&self) -> ConversationSnapshot {
        let state = self.lock();
        ConversationSnapshot {
            phase: state.phase(),
            session_id: state.session_id.clone(),
            messages: state.messages.clone(),
            is_loading: state.in_flight,
            last_error: state.last_error.clone(),
            force_new: state.force_new,
            is_complete: state.is_complete,
            sessions: state.sessions.clone(),
        }
    }

    pub fn clear_error(&self) {
        self.lock().last_error = None;
    }

    /// Sends one user turn. The user message is visible in the log before
    /// this returns its first poll, and stays there if the send fails.
    pub async fn send(&self, text: &str) -> SendOutcome {
        let message = text.trim();
        if message.is_empty() {
            return SendOutcome::Ignored;
        }

        let (request, generation) = {
            let mut state = self.lock();
            if state.in_flight {
                tracing::debug!("Ignoring send while another is in flight");
                return SendOutcome::Ignored;
            }
            state.messages.push(ChatMessage::user(message));
            state.in_flight = true;
            state.last_error = None;
            let create_new = std::mem::take(&mut state.force_new);
            let request = ChatRequest {
                message: message.to_string(),
                session_id: state.session_id.clone(),
                create_new,
            };
            (request, state.generation)
        };
        let mut in_flight = InFlight {
            state: self.state.clone(),
            generation,
            settled: false,
        };

        let previous_session = request.session_id.clone();
        let forced = request.create_new;
        let redacted = redact_text(message);
        emit_event(
            Level::INFO,
            OBS_PROCESS,
            SyncEvent {
                document: Some(&self.label),
                session_id: previous_session.as_deref(),
                status: Some(if forced { "new_session" } else { "existing" }),
                detail: Some(&redacted),
                ..SyncEvent::new("chat.send", "chat")
            },
        );

        let result = match tokio::time::timeout(
            self.send_timeout,
            self.backend.send_message(request),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(SyncError::Timeout(self.send_timeout)),
        };

        in_flight.settle();
        match result {
            Ok(reply) => self.accept_reply(reply, generation, previous_session, forced),
            Err(err) => {
                let error = err.to_string();
                {
                    let mut state = self.lock();
                    state.in_flight = false;
                    if state.generation == generation {
                        state.last_error = Some(error.clone());
                    }
                }
                emit_event(
                    Level::WARN,
                    OBS_PROCESS,
                    SyncEvent {
                        document: Some(&self.label),
                        status: Some("failed"),
                        detail: Some(&error),
                        ..SyncEvent::new("chat.send", "chat")
                    },
                );
                SendOutcome::Failed { error }
            }
        }
    }

    fn accept_reply(
        &self,
        reply: ChatReply,
        generation: u64,
        previous_session: Option<String>,
        forced: bool,
    ) -> SendOutcome {
        let ChatReply {
            response,
            session_id,
            is_complete,
            ..
        } = reply;

        {
            let mut state = self.lock();
            state.in_flight = false;
            if state.generation != generation {
                tracing::debug!(
                    "Dropping reply for session {} after the conversation was switched",
                    session_id
                );
                return SendOutcome::Delivered { session_id };
            }
            state.session_id = Some(session_id.clone());
            state.messages.push(ChatMessage::agent(response));
        }

        if let Some(is_complete) = is_complete {
            self.record_completion(is_complete);
        }

        let is_new_session = forced || previous_session.as_deref() != Some(session_id.as_str());
        if is_new_session {
            emit_event(
                Level::INFO,
                OBS_PROCESS,
                SyncEvent {
                    document: Some(&self.label),
                    session_id: Some(&session_id),
                    ..SyncEvent::new("chat.session_adopted", "chat")
                },
            );
            self.spawn_session_refresh();
        }

        SendOutcome::Delivered { session_id }
    }

    fn spawn_session_refresh(&self) {
        let engine = self.clone();
        tokio::spawn(async move {
            if let Err(e) = engine.refresh_sessions().await {
                tracing::debug!("Session list refresh failed: {}", e);
            }
        });
    }

    pub async fn refresh_sessions(&self) -> Result<Vec<SessionSummary>> {
        let sessions = self.backend.list_sessions().await?;
        self.lock().sessions = sessions.clone();
        Ok(sessions)
    }

    /// Switches to an existing session. On failure the current conversation
    /// is kept and the error recorded.
    pub async fn load_session(&self, session_id: &str) -> Result<()> {
        match self.backend.load_transcript(session_id).await {
            Ok(transcript) => {
                let messages = transcript
                    .messages
                    .into_iter()
                    .map(|m| m.into_chat_message())
                    .collect();
                let mut state = self.lock();
                state.session_id = Some(session_id.to_string());
                state.messages = messages;
                state.last_error = None;
                state.force_new = false;
                state.generation += 1;
                Ok(())
            }
            Err(err) => {
                tracing::warn!("Failed to load session {}: {}", session_id, err);
                self.lock().last_error = Some(err.to_string());
                Err(err)
            }
        }
    }

    /// Resumes the most recently active session, if the document has one.
    pub async fn hydrate(&self) -> Result<Option<String>> {
        if !self.backend.resumes_sessions() {
            tracing::debug!("{} keeps no resumable history", self.label);
            return Ok(None);
        }
        let sessions = self.refresh_sessions().await?;
        let Some(latest) = most_recent_session(&sessions) else {
            return Ok(None);
        };
        let id = latest.id.clone();
        self.load_session(&id).await?;
        Ok(Some(id))
    }

    pub fn start_new_session(&self) {
        let mut state = self.lock();
        state.session_id = None;
        state.messages.clear();
        state.last_error = None;
        state.force_new = true;
        state.generation += 1;
    }

    /// Appends a pushed agent message. Returns whether it was taken.
    ///
    /// While a send is in flight its reply arrives over HTTP, so pushes are
    /// not taken then. Pushes naming a session other than the current one
    /// (or any session, before one is adopted) are dropped.
    pub fn ingest_push_message(&self, message: &AgentMessage) -> bool {
        let mut state = self.lock();
        if state.in_flight {
            return false;
        }
        if let Some(pushed) = &message.session_id {
            if state.session_id.as_ref() != Some(pushed) {
                return false;
            }
        }
        state.messages.push(ChatMessage::agent(message.content.clone()));
        true
    }

    /// Completion state pushed by the server for this document.
    pub fn on_completion_changed(&self, is_complete: bool) {
        self.record_completion(is_complete);
    }

    fn record_completion(&self, is_complete: bool) {
        if !self.reports_completion {
            return;
        }
        self.lock().is_complete = Some(is_complete);
        if let Some(hook) = &self.completion_hook {
            hook(is_complete);
        }
    }
}
