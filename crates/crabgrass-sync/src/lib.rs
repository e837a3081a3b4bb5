//! Live synchronization for Crabgrass documents: the push-event client,
//! streamed-edit assembly, per-document routing, and the agent chat engine,
//! composed per open document by [`FileEditingSession`].

pub mod api;
pub mod assembler;
pub mod backend;
pub mod chat;
pub mod config;
pub mod document;
pub mod editing_session;
pub mod error;
pub mod event_stream;
pub mod listeners;
pub mod router;
pub mod sse;

use crabgrass_observability::ProcessKind;

pub use api::ApiClient;
pub use assembler::{PendingEdit, StreamingEditAssembler};
pub use backend::{CoherenceEndpoints, DocumentEndpoints, DocumentStore};
pub use chat::{
    ChatBackend, ChatPhase, CompletionHook, ConversationSnapshot, SendOutcome, SessionChatEngine,
};
pub use config::SyncConfig;
pub use document::{DocumentBuffer, TextSpan};
pub use editing_session::{FileEditingSession, SessionUpdate};
pub use error::{Result, SyncError};
pub use event_stream::{EventStreamClient, ReconnectPolicy, StreamHealth};
pub use listeners::{listener, ClientEvent, Listener, ListenerRegistry, StreamFault};
pub use router::EditRouter;
pub use sse::{EventTransport, FrameStream, HttpEventTransport, SseDecoder, SseFrame};

pub(crate) const OBS_PROCESS: ProcessKind = ProcessKind::Embedded;
