use serde::{Deserialize, Serialize};
use std::fmt;

/// Top-level object a document or conversation hangs off.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum EntityType {
    Idea,
    Objective,
}

impl EntityType {
    pub fn as_str(self) -> &'static str {
        match self {
            EntityType::Idea => "idea",
            EntityType::Objective => "objective",
        }
    }

    /// REST collection segment, e.g. `/api/ideas/...`.
    pub fn collection(self) -> &'static str {
        match self {
            EntityType::Idea => "ideas",
            EntityType::Objective => "objectives",
        }
    }
}

impl fmt::Display for EntityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Subscription target of one push connection.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct EntityRef {
    pub kind: EntityType,
    pub id: String,
}

impl EntityRef {
    pub fn idea(id: impl Into<String>) -> Self {
        Self {
            kind: EntityType::Idea,
            id: id.into(),
        }
    }

    pub fn objective(id: impl Into<String>) -> Self {
        Self {
            kind: EntityType::Objective,
            id: id.into(),
        }
    }

    pub fn api_path(&self) -> String {
        format!("/api/{}/{}", self.kind.collection(), self.id)
    }

    pub fn events_path(&self) -> String {
        format!("{}/events", self.api_path())
    }
}

impl fmt::Display for EntityRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind, self.id)
    }
}
