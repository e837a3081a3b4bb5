use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use serde::Serialize;
use tokio::sync::broadcast;
use tracing::Level;

use crabgrass_observability::{emit_event, SyncEvent};
use crabgrass_types::{
    AgentEdit, AgentMessage, DocumentRef, EntityRef, EventKind, FileSaved, InboundEvent,
};

use crate::api::ApiClient;
use crate::assembler::StreamingEditAssembler;
use crate::backend::{DocumentEndpoints, DocumentStore};
use crate::chat::{ChatBackend, SendOutcome, SessionChatEngine};
use crate::config::SyncConfig;
use crate::document::{DocumentBuffer, TextSpan};
use crate::error::{Result, SyncError};
use crate::event_stream::{EventStreamClient, ReconnectPolicy};
use crate::listeners::{listener, ClientEvent, Listener, StreamFault};
use crate::router::EditRouter;
use crate::sse::{EventTransport, HttpEventTransport};
use crate::OBS_PROCESS;

/// What observers of an open document are told.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SessionUpdate {
    EditPreview { edit_id: String, content: String },
    EditApplied { edit: AgentEdit, revision: u64 },
    CompletionChanged { is_complete: bool },
    FileSaved { saved: FileSaved },
    AgentMessage { message: AgentMessage },
    LiveUpdatesUnavailable { attempts: u32, message: String },
    StreamError { message: String },
}

struct EditorState {
    assembler: StreamingEditAssembler,
    router: EditRouter,
    buffer: DocumentBuffer,
}

// Shared with the listener closure running on the connection task.
struct SessionCore {
    editor: Mutex<EditorState>,
    chat: SessionChatEngine,
    updates: broadcast::Sender<SessionUpdate>,
    destroyed: AtomicBool,
    label: String,
}

impl SessionCore {
    fn editor(&self) -> std::sync::MutexGuard<'_, EditorState> {
        self.editor.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn publish(&self, update: SessionUpdate) {
        // No receivers is fine.
        let _ = self.updates.send(update);
    }

    fn handle(&self, event: &ClientEvent) {
        if self.destroyed.load(Ordering::SeqCst) {
            return;
        }
        match event {
            ClientEvent::Inbound(inbound) => self.handle_inbound(inbound),
            ClientEvent::Error(StreamFault::ConnectionLost { attempts, message }) => {
                self.publish(SessionUpdate::LiveUpdatesUnavailable {
                    attempts: *attempts,
                    message: message.clone(),
                });
            }
            ClientEvent::Error(fault @ StreamFault::Decode { .. }) => {
                self.publish(SessionUpdate::StreamError {
                    message: fault.to_string(),
                });
            }
        }
    }

    fn handle_inbound(&self, event: &InboundEvent) {
        match event {
            InboundEvent::Connected(_) => {
                tracing::debug!("Live updates connected for {}", self.label);
            }
            InboundEvent::AgentEditStreamStart(start) => {
                self.editor().assembler.on_start(start.clone());
            }
            InboundEvent::AgentEditStreamChunk(chunk) => {
                let preview = {
                    let mut editor = self.editor();
                    let EditorState {
                        assembler, router, ..
                    } = &mut *editor;
                    assembler
                        .on_chunk(&chunk.edit_id, &chunk.content)
                        .filter(|pending| router.accepts_path(&pending.file_path))
                        .map(|pending| pending.preview())
                };
                if let Some(content) = preview {
                    self.publish(SessionUpdate::EditPreview {
                        edit_id: chunk.edit_id.clone(),
                        content,
                    });
                }
            }
            InboundEvent::AgentEditStreamEnd(end) => {
                let completed = self
                    .editor()
                    .assembler
                    .on_end(&end.edit_id, end.final_content.clone());
                if let Some(edit) = completed {
                    self.apply_edit(edit);
                }
            }
            InboundEvent::AgentEdit(edit) => self.apply_edit(edit.clone()),
            InboundEvent::AgentMessage(message) => {
                let for_this_document = {
                    let editor = self.editor();
                    message
                        .file_path
                        .as_deref()
                        .map_or(true, |path| editor.router.accepts_path(path))
                };
                if for_this_document && self.chat.ingest_push_message(message) {
                    self.publish(SessionUpdate::AgentMessage {
                        message: message.clone(),
                    });
                }
            }
            InboundEvent::CompletionChanged(change) => {
                if self.editor().router.matches_completion(change) {
                    self.chat.on_completion_changed(change.is_complete);
                    self.publish(SessionUpdate::CompletionChanged {
                        is_complete: change.is_complete,
                    });
                }
            }
            InboundEvent::FileSaved(saved) => {
                let matched = {
                    let mut editor = self.editor();
                    let matched = editor.router.matches_saved(saved);
                    if matched {
                        editor.buffer.note_remote_save(saved.clone());
                    }
                    matched
                };
                if matched {
                    self.publish(SessionUpdate::FileSaved {
                        saved: saved.clone(),
                    });
                }
            }
        }
    }

    fn apply_edit(&self, edit: AgentEdit) {
        let revision = {
            let mut editor = self.editor();
            if !editor.router.should_apply(&edit) {
                tracing::trace!("Edit for {} does not target {}", edit.file_path, self.label);
                return;
            }
            if !editor.buffer.apply(&edit) {
                return;
            }
            editor.buffer.revision()
        };

        emit_event(
            Level::INFO,
            OBS_PROCESS,
            SyncEvent {
                document: Some(&self.label),
                edit_id: edit.edit_id.as_deref(),
                status: Some(edit.operation.as_str()),
                ..SyncEvent::new("edit.applied", "editing_session")
            },
        );
        self.publish(SessionUpdate::EditApplied { edit, revision });
    }
}

/// One open document: its live event stream, streamed-edit assembly, local
/// buffer and agent conversation.
pub struct FileEditingSession {
    entity: EntityRef,
    document: DocumentRef,
    stream: EventStreamClient,
    core: Arc<SessionCore>,
    store: Arc<dyn DocumentStore>,
    listener: Listener,
}

impl FileEditingSession {
    pub fn new(
        config: &SyncConfig,
        entity: EntityRef,
        document: DocumentRef,
        transport: Arc<dyn EventTransport>,
        chat_backend: Arc<dyn ChatBackend>,
        store: Arc<dyn DocumentStore>,
    ) -> Result<Self> {
        if document.owner_kind() != entity.kind {
            return Err(SyncError::InvalidConfig(format!(
                "document {} cannot be opened under {}",
                document, entity
            )));
        }

        let label = format!("{}/{}", entity, document);
        let (updates, _) = broadcast::channel(config.update_buffer);
        let chat = SessionChatEngine::new(chat_backend, config.send_timeout())
            .with_completion(document.reports_completion(), None)
            .with_label(label.clone());

        let core = Arc::new(SessionCore {
            editor: Mutex::new(EditorState {
                assembler: StreamingEditAssembler::new(config.pending_edit_ttl()),
                router: EditRouter::new(document.clone()),
                buffer: DocumentBuffer::default(),
            }),
            chat,
            updates,
            destroyed: AtomicBool::new(false),
            label,
        });

        let stream = EventStreamClient::new(
            entity.clone(),
            transport,
            ReconnectPolicy::from_config(config),
        );
        let handler_core = core.clone();
        let handler = listener(move |event| handler_core.handle(event));
        for kind in EventKind::INBOUND {
            stream.on(kind, handler.clone());
        }
        stream.on(EventKind::Error, handler.clone());

        Ok(Self {
            entity,
            document,
            stream,
            core,
            store,
            listener: handler,
        })
    }

    /// Wires a session against the live REST API and SSE endpoint.
    pub fn over_http(config: &SyncConfig, entity: EntityRef, document: DocumentRef) -> Result<Self> {
        let api = ApiClient::new(config)?;
        let endpoints = Arc::new(DocumentEndpoints::new(
            api,
            entity.clone(),
            document.clone(),
        )?);
        let transport = Arc::new(HttpEventTransport::new(config)?);
        Self::new(
            config,
            entity,
            document,
            transport,
            endpoints.clone(),
            endpoints,
        )
    }

    pub fn entity(&self) -> &EntityRef {
        &self.entity
    }

    pub fn document(&self) -> &DocumentRef {
        &self.document
    }

    pub fn chat(&self) -> &SessionChatEngine {
        &self.core.chat
    }

    pub fn stream(&self) -> &EventStreamClient {
        &self.stream
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionUpdate> {
        self.core.updates.subscribe()
    }

    pub fn is_destroyed(&self) -> bool {
        self.core.destroyed.load(Ordering::SeqCst)
    }

    fn ensure_live(&self) -> Result<()> {
        if self.is_destroyed() {
            return Err(SyncError::Destroyed);
        }
        Ok(())
    }

    pub fn content(&self) -> String {
        self.core.editor().buffer.content().to_string()
    }

    pub fn buffer(&self) -> DocumentBuffer {
        self.core.editor().buffer.clone()
    }

    pub fn is_dirty(&self) -> bool {
        self.core.editor().buffer.is_dirty()
    }

    pub fn pending_edits(&self) -> usize {
        self.core.editor().assembler.pending_count()
    }

    pub fn preview(&self, edit_id: &str) -> Option<String> {
        self.core.editor().assembler.preview(edit_id)
    }

    /// Loads the document, resumes the latest conversation, then connects
    /// live updates so pushed messages land on the resumed log. A failed
    /// resume is recorded on the chat engine and does not fail the open.
    pub async fn open(&self) -> Result<()> {
        self.ensure_live()?;
        let content = self.store.load().await?;
        self.core.editor().buffer.load(content);

        if let Err(e) = self.core.chat.hydrate().await {
            tracing::warn!("Could not resume conversation for {}: {}", self.core.label, e);
        }
        self.stream.connect().await;
        emit_event(
            Level::INFO,
            OBS_PROCESS,
            SyncEvent {
                entity: Some(&self.entity.to_string()),
                document: Some(&self.core.label),
                session_id: self.core.chat.session_id().as_deref(),
                ..SyncEvent::new("session.opened", "editing_session")
            },
        );
        Ok(())
    }

    /// Starts (or restarts) live updates without reloading content.
    pub async fn connect(&self) -> Result<()> {
        self.ensure_live()?;
        self.stream.connect().await;
        Ok(())
    }

    pub fn edit_local(&self, content: impl Into<String>) -> Result<()> {
        self.ensure_live()?;
        self.core.editor().buffer.edit_local(content);
        Ok(())
    }

    /// Writes the buffer through the store. Local edits made while the
    /// write was in flight keep the buffer dirty.
    pub async fn save(&self) -> Result<()> {
        self.ensure_live()?;
        let (content, revision) = {
            let editor = self.core.editor();
            (editor.buffer.content().to_string(), editor.buffer.revision())
        };

        let reply = self.store.save(&content).await?;

        {
            let mut editor = self.core.editor();
            if editor.buffer.revision() == revision {
                editor.buffer.mark_saved();
            }
        }
        if let Some(is_complete) = reply.and_then(|r| r.is_complete) {
            self.core.chat.on_completion_changed(is_complete);
            if self.document.reports_completion() {
                self.core
                    .publish(SessionUpdate::CompletionChanged { is_complete });
            }
        }
        Ok(())
    }

    /// Asks the document's agent to rework a selection.
    pub async fn request_selection_edit(
        &self,
        span: TextSpan,
        instruction: &str,
    ) -> Result<SendOutcome> {
        self.ensure_live()?;
        let instruction = instruction.trim();
        if instruction.is_empty() {
            return Ok(SendOutcome::Ignored);
        }
        let selection = self.core.editor().buffer.slice(span);
        let message = compose_selection_request(&self.document, &selection, instruction);
        Ok(self.core.chat.send(&message).await)
    }

    /// Stops live updates, unregisters listeners and drops pending edits.
    /// Later calls that need the network fail with [`SyncError::Destroyed`].
    pub async fn destroy(&self) {
        if self.core.destroyed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.stream.disconnect().await;
        for kind in EventKind::INBOUND {
            self.stream.off(kind, &self.listener);
        }
        self.stream.off(EventKind::Error, &self.listener);
        let dropped = self.core.editor().assembler.clear();

        emit_event(
            Level::INFO,
            OBS_PROCESS,
            SyncEvent {
                document: Some(&self.core.label),
                detail: Some(&format!("dropped_pending_edits={}", dropped)),
                ..SyncEvent::new("session.destroyed", "editing_session")
            },
        );
    }
}

fn compose_selection_request(document: &DocumentRef, selection: &str, instruction: &str) -> String {
    if selection.trim().is_empty() {
        return instruction.to_string();
    }
    let quoted: Vec<String> = selection.lines().map(|line| format!("> {}", line)).collect();
    format!(
        "In {}, regarding this selection:\n\n{}\n\n{}",
        document.canonical_path(),
        quoted.join("\n"),
        instruction
    )
}
