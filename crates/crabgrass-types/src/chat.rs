use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    #[serde(alias = "assistant")]
    Agent,
}

/// One visible conversation turn.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
    pub timestamp: DateTime<Utc>,
}

impl ChatMessage {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
            timestamp: Utc::now(),
        }
    }

    pub fn agent(content: impl Into<String>) -> Self {
        Self {
            role: Role::Agent,
            content: content.into(),
            timestamp: Utc::now(),
        }
    }
}

/// Body of every agent chat endpoint.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct ChatRequest {
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub create_new: bool,
}

/// `{session_id, response, is_complete?}` returned by chat and
/// document-update endpoints.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChatReply {
    pub response: String,
    pub session_id: String,
    #[serde(default)]
    pub is_complete: Option<bool>,
    #[serde(default)]
    pub agent_type: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SessionSummary {
    pub id: String,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub agent_type: Option<String>,
    #[serde(default)]
    pub file_type: Option<String>,
    #[serde(default)]
    pub created_at: Option<String>,
    #[serde(default)]
    pub last_active: Option<String>,
}

impl SessionSummary {
    pub fn last_active_at(&self) -> Option<DateTime<Utc>> {
        self.last_active.as_deref().and_then(parse_timestamp)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SessionsList {
    pub sessions: Vec<SessionSummary>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TranscriptMessage {
    #[serde(default)]
    pub id: Option<String>,
    pub role: Role,
    pub content: String,
    #[serde(default)]
    pub created_at: Option<String>,
}

impl TranscriptMessage {
    pub fn into_chat_message(self) -> ChatMessage {
        let timestamp = self
            .created_at
            .as_deref()
            .and_then(parse_timestamp)
            .unwrap_or_else(Utc::now);
        ChatMessage {
            role: self.role,
            content: self.content,
            timestamp,
        }
    }
}

/// Authoritative server transcript of one session.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SessionTranscript {
    pub session: SessionSummary,
    #[serde(default)]
    pub messages: Vec<TranscriptMessage>,
}

/// Picks the session the user touched last. Sessions without a parseable
/// `last_active` lose to any that have one; ties keep list order.
pub fn most_recent_session(sessions: &[SessionSummary]) -> Option<&SessionSummary> {
    let mut best: Option<&SessionSummary> = None;
    for candidate in sessions {
        match best {
            Some(current) if candidate.last_active_at() <= current.last_active_at() => {}
            _ => best = Some(candidate),
        }
    }
    best
}

/// Accepts RFC 3339 and the naive `isoformat()` output the backend emits
/// for timezone-less columns (assumed UTC).
pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Some(ts.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f")
        .ok()
        .map(|naive| DateTime::<Utc>::from_naive_utc_and_offset(naive, Utc))
}
