use crate::entity::EntityType;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// The four fixed structured documents every idea carries.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum KernelFileType {
    Summary,
    Challenge,
    Approach,
    CoherentSteps,
}

impl KernelFileType {
    pub const ALL: [KernelFileType; 4] = [
        KernelFileType::Summary,
        KernelFileType::Challenge,
        KernelFileType::Approach,
        KernelFileType::CoherentSteps,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            KernelFileType::Summary => "summary",
            KernelFileType::Challenge => "challenge",
            KernelFileType::Approach => "approach",
            KernelFileType::CoherentSteps => "coherent_steps",
        }
    }
}

impl fmt::Display for KernelFileType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for KernelFileType {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let normalized = raw.trim().to_ascii_lowercase();
        KernelFileType::ALL
            .into_iter()
            .find(|kind| kind.as_str() == normalized)
            .ok_or_else(|| {
                format!(
                    "invalid kernel file type '{}'; expected one of summary, challenge, approach, coherent_steps",
                    raw
                )
            })
    }
}

/// Identity of one open document.
///
/// Context files live in the `context/` namespace under both ideas and
/// objectives, so `Context` and `ObjectiveContext` share a canonical path
/// shape and only differ by the entity they are opened under.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DocumentRef {
    Kernel { file_type: KernelFileType },
    Context { file_id: String },
    Objective,
    ObjectiveContext { file_id: String },
}

impl DocumentRef {
    pub fn kernel(file_type: KernelFileType) -> Self {
        DocumentRef::Kernel { file_type }
    }

    pub fn context(file_id: impl Into<String>) -> Self {
        DocumentRef::Context {
            file_id: file_id.into(),
        }
    }

    pub fn objective_context(file_id: impl Into<String>) -> Self {
        DocumentRef::ObjectiveContext {
            file_id: file_id.into(),
        }
    }

    /// Path string the server stamps on edits targeting this document.
    pub fn canonical_path(&self) -> String {
        match self {
            DocumentRef::Kernel { file_type } => format!("kernel/{}", file_type.as_str()),
            DocumentRef::Context { file_id } | DocumentRef::ObjectiveContext { file_id } => {
                format!("context/{}", file_id)
            }
            DocumentRef::Objective => "objective".to_string(),
        }
    }

    /// Entity kind this document must be opened under.
    pub fn owner_kind(&self) -> EntityType {
        match self {
            DocumentRef::Kernel { .. } | DocumentRef::Context { .. } => EntityType::Idea,
            DocumentRef::Objective | DocumentRef::ObjectiveContext { .. } => EntityType::Objective,
        }
    }

    pub fn kernel_type(&self) -> Option<KernelFileType> {
        match self {
            DocumentRef::Kernel { file_type } => Some(*file_type),
            _ => None,
        }
    }

    /// Only kernel agents report completion state alongside their replies.
    pub fn reports_completion(&self) -> bool {
        matches!(self, DocumentRef::Kernel { .. })
    }

    /// Inverse of [`DocumentRef::canonical_path`]. `context/<id>` is
    /// ambiguous on its own, so the owning entity kind picks the variant.
    pub fn from_canonical_path(path: &str, owner: EntityType) -> Result<Self, String> {
        let path = path.trim().trim_matches('/');
        match path.split_once('/') {
            Some(("kernel", file_type)) if owner == EntityType::Idea => {
                Ok(DocumentRef::kernel(file_type.parse()?))
            }
            Some(("context", file_id)) if !file_id.is_empty() => Ok(match owner {
                EntityType::Idea => DocumentRef::context(file_id),
                EntityType::Objective => DocumentRef::objective_context(file_id),
            }),
            None if path == "objective" && owner == EntityType::Objective => {
                Ok(DocumentRef::Objective)
            }
            _ => Err(format!(
                "'{}' is not a {} document path",
                path,
                owner.as_str()
            )),
        }
    }
}

impl fmt::Display for DocumentRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.canonical_path())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canonical_paths_follow_server_convention() {
        assert_eq!(
            DocumentRef::kernel(KernelFileType::CoherentSteps).canonical_path(),
            "kernel/coherent_steps"
        );
        assert_eq!(DocumentRef::context("abc").canonical_path(), "context/abc");
        assert_eq!(DocumentRef::Objective.canonical_path(), "objective");
        assert_eq!(
            DocumentRef::objective_context("abc").canonical_path(),
            "context/abc"
        );
    }

    #[test]
    fn kernel_type_parses_case_insensitively() {
        assert_eq!(
            "Summary".parse::<KernelFileType>().unwrap(),
            KernelFileType::Summary
        );
        assert!("steps".parse::<KernelFileType>().is_err());
    }

    #[test]
    fn canonical_path_parses_back_per_owner() {
        assert_eq!(
            DocumentRef::from_canonical_path("kernel/approach", EntityType::Idea).unwrap(),
            DocumentRef::kernel(KernelFileType::Approach)
        );
        assert_eq!(
            DocumentRef::from_canonical_path("context/f1", EntityType::Objective).unwrap(),
            DocumentRef::objective_context("f1")
        );
        assert!(DocumentRef::from_canonical_path("kernel/summary", EntityType::Objective).is_err());
        assert!(DocumentRef::from_canonical_path("objective", EntityType::Idea).is_err());
    }

    #[test]
    fn owner_kind_pairs_documents_with_entities() {
        assert_eq!(DocumentRef::context("f").owner_kind(), EntityType::Idea);
        assert_eq!(
            DocumentRef::objective_context("f").owner_kind(),
            EntityType::Objective
        );
    }
}
