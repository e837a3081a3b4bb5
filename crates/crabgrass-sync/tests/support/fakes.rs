use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures::channel::mpsc;
use futures::StreamExt;
use serde_json::Value;
use tokio::sync::Notify;
use tokio::time::Instant;

use crabgrass_sync::{
    ChatBackend, DocumentStore, EventTransport, FrameStream, Result, SseFrame, SyncError,
};
use crabgrass_types::{
    ChatReply, ChatRequest, EntityRef, Role, SessionSummary, SessionTranscript,
    TranscriptMessage,
};

/// Push transport driven by the test. Each open either fails or hands out
/// a fresh channel-backed frame stream; unscripted opens fail.
#[derive(Default)]
pub struct FakeTransport {
    accept: Mutex<VecDeque<bool>>,
    opens: Mutex<Vec<Instant>>,
    senders: Mutex<Vec<mpsc::UnboundedSender<Result<SseFrame>>>>,
    on_open: Mutex<Vec<SseFrame>>,
}

impl FakeTransport {
    pub fn accepting(times: usize) -> Arc<Self> {
        Arc::new(Self {
            accept: Mutex::new(std::iter::repeat(true).take(times).collect()),
            ..Default::default()
        })
    }

    /// Accepts one connection and delivers `frames` as soon as it opens.
    pub fn accepting_with(frames: Vec<(&str, Value)>) -> Arc<Self> {
        Arc::new(Self {
            accept: Mutex::new(VecDeque::from([true])),
            on_open: Mutex::new(
                frames
                    .into_iter()
                    .map(|(event, data)| SseFrame::new(event, data.to_string()))
                    .collect(),
            ),
            ..Default::default()
        })
    }

    pub fn refusing() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn open_count(&self) -> usize {
        self.opens.lock().unwrap().len()
    }

    pub fn open_times(&self) -> Vec<Instant> {
        self.opens.lock().unwrap().clone()
    }

    pub fn emit(&self, event: &str, data: Value) {
        let senders = self.senders.lock().unwrap();
        let sender = senders.last().expect("no accepted connection");
        sender
            .unbounded_send(Ok(SseFrame::new(event, data.to_string())))
            .expect("connection closed");
    }

    /// Ends the current stream as if the server went away.
    pub fn drop_connection(&self) {
        if let Some(sender) = self.senders.lock().unwrap().last() {
            sender.close_channel();
        }
    }

    pub fn current_closed(&self) -> bool {
        self.senders
            .lock()
            .unwrap()
            .last()
            .map(|sender| sender.is_closed())
            .unwrap_or(true)
    }
}

#[async_trait]
impl EventTransport for FakeTransport {
    async fn open(&self, _entity: &EntityRef) -> Result<FrameStream> {
        self.opens.lock().unwrap().push(Instant::now());
        let accept = self.accept.lock().unwrap().pop_front().unwrap_or(false);
        if !accept {
            return Err(SyncError::Transport("connection refused".to_string()));
        }
        let (tx, rx) = mpsc::unbounded();
        for frame in self.on_open.lock().unwrap().drain(..) {
            tx.unbounded_send(Ok(frame)).expect("receiver alive");
        }
        self.senders.lock().unwrap().push(tx);
        Ok(rx.boxed())
    }
}

/// Chat endpoints with scripted replies. With `holding_replies`, every send
/// blocks until [`FakeBackend::release`].
#[derive(Default)]
pub struct FakeBackend {
    replies: Mutex<VecDeque<Result<ChatReply>>>,
    pub requests: Mutex<Vec<ChatRequest>>,
    sessions: Mutex<Vec<SessionSummary>>,
    transcripts: Mutex<HashMap<String, Vec<(Role, String)>>>,
    gate: Option<Arc<Notify>>,
    no_history: bool,
    list_calls: AtomicUsize,
}

impl FakeBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn holding_replies() -> Self {
        Self {
            gate: Some(Arc::new(Notify::new())),
            ..Default::default()
        }
    }

    /// Like an endpoint set whose past sessions cannot be reloaded.
    pub fn without_history(mut self) -> Self {
        self.no_history = true;
        self
    }

    pub fn reply(self, session_id: &str, response: &str, is_complete: Option<bool>) -> Self {
        self.replies.lock().unwrap().push_back(Ok(ChatReply {
            response: response.to_string(),
            session_id: session_id.to_string(),
            is_complete,
            agent_type: None,
        }));
        self
    }

    pub fn fail(self, status: u16, detail: &str) -> Self {
        self.replies.lock().unwrap().push_back(Err(SyncError::Http {
            status,
            detail: detail.to_string(),
        }));
        self
    }

    pub fn session(self, id: &str, last_active: &str, messages: &[(Role, &str)]) -> Self {
        self.sessions.lock().unwrap().push(SessionSummary {
            id: id.to_string(),
            title: None,
            agent_type: None,
            file_type: None,
            created_at: None,
            last_active: Some(last_active.to_string()),
        });
        self.transcripts.lock().unwrap().insert(
            id.to_string(),
            messages
                .iter()
                .map(|(role, content)| (*role, content.to_string()))
                .collect(),
        );
        self
    }

    pub fn release(&self) {
        if let Some(gate) = &self.gate {
            gate.notify_one();
        }
    }

    pub fn request_count(&self) -> usize {
        self.requests.lock().unwrap().len()
    }

    pub fn list_calls(&self) -> usize {
        self.list_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ChatBackend for FakeBackend {
    async fn send_message(&self, request: ChatRequest) -> Result<ChatReply> {
        self.requests.lock().unwrap().push(request);
        if let Some(gate) = &self.gate {
            gate.notified().await;
        }
        self.replies
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Err(SyncError::Transport("no reply scripted".to_string())))
    }

    async fn list_sessions(&self) -> Result<Vec<SessionSummary>> {
        self.list_calls.fetch_add(1, Ordering::SeqCst);
        // A real round trip lets other tasks run.
        tokio::task::yield_now().await;
        Ok(self.sessions.lock().unwrap().clone())
    }

    async fn load_transcript(&self, session_id: &str) -> Result<SessionTranscript> {
        let transcripts = self.transcripts.lock().unwrap();
        let Some(messages) = transcripts.get(session_id) else {
            return Err(SyncError::Http {
                status: 404,
                detail: "Session not found".to_string(),
            });
        };
        let session = self
            .sessions
            .lock()
            .unwrap()
            .iter()
            .find(|s| s.id == session_id)
            .cloned()
            .expect("session registered with transcript");
        Ok(SessionTranscript {
            session,
            messages: messages
                .iter()
                .map(|(role, content)| TranscriptMessage {
                    id: None,
                    role: *role,
                    content: content.clone(),
                    created_at: None,
                })
                .collect(),
        })
    }

    fn resumes_sessions(&self) -> bool {
        !self.no_history
    }
}

/// In-memory document content.
pub struct FakeStore {
    content: Mutex<String>,
    pub saves: Mutex<Vec<String>>,
    save_reply: Mutex<Option<ChatReply>>,
}

impl FakeStore {
    pub fn with_content(content: &str) -> Arc<Self> {
        Arc::new(Self {
            content: Mutex::new(content.to_string()),
            saves: Mutex::new(Vec::new()),
            save_reply: Mutex::new(None),
        })
    }

    pub fn reply_to_saves(&self, reply: ChatReply) {
        *self.save_reply.lock().unwrap() = Some(reply);
    }
}

#[async_trait]
impl DocumentStore for FakeStore {
    async fn load(&self) -> Result<String> {
        Ok(self.content.lock().unwrap().clone())
    }

    async fn save(&self, content: &str) -> Result<Option<ChatReply>> {
        *self.content.lock().unwrap() = content.to_string();
        self.saves.lock().unwrap().push(content.to_string());
        Ok(self.save_reply.lock().unwrap().clone())
    }
}
