use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crabgrass_types::{
    ChatReply, ChatRequest, DocumentRef, EntityRef, EntityType, SessionSummary,
    SessionTranscript, SessionsList,
};

use crate::api::ApiClient;
use crate::chat::ChatBackend;
use crate::error::{Result, SyncError};

/// Load/save of one document's content.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    async fn load(&self) -> Result<String>;
    /// Some update endpoints answer with an agent reply; it is returned
    /// when present.
    async fn save(&self, content: &str) -> Result<Option<ChatReply>>;
}

#[derive(Debug, Deserialize)]
struct DocumentBody {
    content: String,
}

#[derive(Debug, Serialize)]
struct UpdateBody<'a> {
    content: &'a str,
}

/// REST endpoints for one document under one entity: its content and its
/// agent conversation.
#[derive(Clone)]
pub struct DocumentEndpoints {
    api: ApiClient,
    entity: EntityRef,
    document: DocumentRef,
}

impl DocumentEndpoints {
    pub fn new(api: ApiClient, entity: EntityRef, document: DocumentRef) -> Result<Self> {
        if document.owner_kind() != entity.kind {
            return Err(SyncError::InvalidConfig(format!(
                "document {} cannot be opened under {}",
                document, entity
            )));
        }
        Ok(Self {
            api,
            entity,
            document,
        })
    }

    pub fn document_path(&self) -> String {
        let base = self.entity.api_path();
        match &self.document {
            DocumentRef::Kernel { file_type } => format!("{}/kernel/{}", base, file_type),
            DocumentRef::Context { file_id } | DocumentRef::ObjectiveContext { file_id } => {
                format!("{}/context/{}", base, file_id)
            }
            DocumentRef::Objective => format!("{}/file", base),
        }
    }

    pub fn chat_path(&self) -> String {
        match &self.document {
            DocumentRef::Objective => format!("{}/chat", self.entity.api_path()),
            _ => format!("{}/chat", self.document_path()),
        }
    }

    /// Kernel files and the objective file list their sessions; context
    /// files only chat.
    pub fn sessions_path(&self) -> Option<String> {
        match &self.document {
            DocumentRef::Kernel { .. } => Some(format!("{}/sessions", self.document_path())),
            DocumentRef::Objective => Some(format!("{}/sessions", self.entity.api_path())),
            DocumentRef::Context { .. } | DocumentRef::ObjectiveContext { .. } => None,
        }
    }

    pub fn transcript_path(&self, session_id: &str) -> Option<String> {
        transcript_path(&self.entity, session_id)
    }
}

/// Session transcripts are served per idea only.
pub fn transcript_path(entity: &EntityRef, session_id: &str) -> Option<String> {
    match entity.kind {
        EntityType::Idea => Some(format!("{}/sessions/{}", entity.api_path(), session_id)),
        EntityType::Objective => None,
    }
}

async fn fetch_transcript(
    api: &ApiClient,
    entity: &EntityRef,
    session_id: &str,
) -> Result<SessionTranscript> {
    let path = transcript_path(entity, session_id).ok_or_else(|| {
        SyncError::NotFound(format!("session transcripts for {}", entity))
    })?;
    api.get(&path).await
}

#[async_trait]
impl ChatBackend for DocumentEndpoints {
    async fn send_message(&self, request: ChatRequest) -> Result<ChatReply> {
        self.api.post(&self.chat_path(), &request).await
    }

    async fn list_sessions(&self) -> Result<Vec<SessionSummary>> {
        let Some(path) = self.sessions_path() else {
            return Ok(Vec::new());
        };
        let list: SessionsList = self.api.get(&path).await?;
        Ok(list.sessions)
    }

    async fn load_transcript(&self, session_id: &str) -> Result<SessionTranscript> {
        fetch_transcript(&self.api, &self.entity, session_id).await
    }

    fn resumes_sessions(&self) -> bool {
        self.sessions_path().is_some() && self.entity.kind == EntityType::Idea
    }
}

/// The idea-level coherence agent. Its conversation belongs to the idea
/// rather than to one document.
///
/// The server reuses the idea's coherence session when none is named, so a
/// forced new session is not honored here.
#[derive(Clone)]
pub struct CoherenceEndpoints {
    api: ApiClient,
    idea: EntityRef,
}

impl CoherenceEndpoints {
    pub fn new(api: ApiClient, idea: EntityRef) -> Result<Self> {
        if idea.kind != EntityType::Idea {
            return Err(SyncError::InvalidConfig(format!(
                "the coherence agent is only available for ideas, not {}",
                idea
            )));
        }
        Ok(Self { api, idea })
    }

    pub fn chat_path(&self) -> String {
        format!("{}/coherence/chat", self.idea.api_path())
    }

    pub fn sessions_path(&self) -> String {
        format!("{}/coherence/sessions", self.idea.api_path())
    }
}

#[async_trait]
impl ChatBackend for CoherenceEndpoints {
    async fn send_message(&self, request: ChatRequest) -> Result<ChatReply> {
        self.api.post(&self.chat_path(), &request).await
    }

    async fn list_sessions(&self) -> Result<Vec<SessionSummary>> {
        let list: SessionsList = self.api.get(&self.sessions_path()).await?;
        Ok(list.sessions)
    }

    async fn load_transcript(&self, session_id: &str) -> Result<SessionTranscript> {
        fetch_transcript(&self.api, &self.idea, session_id).await
    }
}

#[async_trait]
impl DocumentStore for DocumentEndpoints {
    async fn load(&self) -> Result<String> {
        let body: DocumentBody = self.api.get(&self.document_path()).await?;
        Ok(body.content)
    }

    async fn save(&self, content: &str) -> Result<Option<ChatReply>> {
        let response: Value = self
            .api
            .put(&self.document_path(), &UpdateBody { content })
            .await?;
        Ok(serde_json::from_value::<ChatReply>(response).ok())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chat::SessionChatEngine;
    use crate::config::SyncConfig;
    use crabgrass_types::KernelFileType;
    use std::sync::Arc;
    use std::time::Duration;

    fn api() -> ApiClient {
        ApiClient::new(&SyncConfig::default()).unwrap()
    }

    fn endpoints(entity: EntityRef, document: DocumentRef) -> Result<DocumentEndpoints> {
        DocumentEndpoints::new(api(), entity, document)
    }

    #[test]
    fn kernel_paths() {
        let e = endpoints(
            EntityRef::idea("42"),
            DocumentRef::kernel(KernelFileType::CoherentSteps),
        )
        .unwrap();
        assert_eq!(e.document_path(), "/api/ideas/42/kernel/coherent_steps");
        assert_eq!(e.chat_path(), "/api/ideas/42/kernel/coherent_steps/chat");
        assert_eq!(
            e.sessions_path().as_deref(),
            Some("/api/ideas/42/kernel/coherent_steps/sessions")
        );
        assert_eq!(
            e.transcript_path("s-1").as_deref(),
            Some("/api/ideas/42/sessions/s-1")
        );
        assert!(e.resumes_sessions());
    }

    #[test]
    fn context_files_chat_without_history() {
        let e = endpoints(EntityRef::idea("42"), DocumentRef::context("f-1")).unwrap();
        assert_eq!(e.chat_path(), "/api/ideas/42/context/f-1/chat");
        assert_eq!(e.sessions_path(), None);
        assert!(!e.resumes_sessions());
    }

    #[test]
    fn objective_paths() {
        let e = endpoints(EntityRef::objective("o-7"), DocumentRef::Objective).unwrap();
        assert_eq!(e.document_path(), "/api/objectives/o-7/file");
        assert_eq!(e.chat_path(), "/api/objectives/o-7/chat");
        assert_eq!(e.sessions_path().as_deref(), Some("/api/objectives/o-7/sessions"));
        assert_eq!(e.transcript_path("s-1"), None);
        assert!(!e.resumes_sessions());

        let ctx = endpoints(
            EntityRef::objective("o-7"),
            DocumentRef::objective_context("f-1"),
        )
        .unwrap();
        assert_eq!(ctx.chat_path(), "/api/objectives/o-7/context/f-1/chat");
        assert_eq!(ctx.sessions_path(), None);
    }

    #[test]
    fn mismatched_owner_is_rejected() {
        let err = endpoints(EntityRef::objective("o-7"), DocumentRef::context("f-1"))
            .err()
            .unwrap();
        assert!(matches!(err, SyncError::InvalidConfig(_)));
    }

    #[tokio::test]
    async fn objective_hydration_does_not_touch_missing_routes() {
        let e = endpoints(EntityRef::objective("o-7"), DocumentRef::Objective).unwrap();
        let engine = SessionChatEngine::new(Arc::new(e.clone()), Duration::from_secs(5));

        assert_eq!(engine.hydrate().await.unwrap(), None);
        assert!(engine.last_error().is_none());
        assert!(engine.session_id().is_none());

        let err = e.load_transcript("s-1").await.unwrap_err();
        assert!(matches!(err, SyncError::NotFound(_)));
    }

    #[tokio::test]
    async fn context_session_list_is_empty_without_a_request() {
        let e = endpoints(EntityRef::idea("42"), DocumentRef::context("f-1")).unwrap();
        assert!(e.list_sessions().await.unwrap().is_empty());
    }

    #[test]
    fn coherence_paths_are_idea_scoped() {
        let c = CoherenceEndpoints::new(api(), EntityRef::idea("42")).unwrap();
        assert_eq!(c.chat_path(), "/api/ideas/42/coherence/chat");
        assert_eq!(c.sessions_path(), "/api/ideas/42/coherence/sessions");
        assert!(c.resumes_sessions());

        let err = CoherenceEndpoints::new(api(), EntityRef::objective("o-7"))
            .err()
            .unwrap();
        assert!(matches!(err, SyncError::InvalidConfig(_)));
    }
}
