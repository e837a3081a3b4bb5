use crabgrass_types::{AgentEdit, CompletionChanged, DocumentRef, FileSaved};

/// Decides which pushed events concern the open document.
///
/// Matching is exact string equality against the document's canonical path.
/// No prefix or case-insensitive matching: `kernel/summary` never matches
/// `kernel/summary_v2`.
#[derive(Debug, Clone)]
pub struct EditRouter {
    document: DocumentRef,
    canonical: String,
}

impl EditRouter {
    pub fn new(document: DocumentRef) -> Self {
        let canonical = document.canonical_path();
        Self {
            document,
            canonical,
        }
    }

    pub fn document(&self) -> &DocumentRef {
        &self.document
    }

    pub fn canonical_path(&self) -> &str {
        &self.canonical
    }

    pub fn accepts_path(&self, file_path: &str) -> bool {
        file_path == self.canonical
    }

    pub fn should_apply(&self, edit: &AgentEdit) -> bool {
        self.accepts_path(&edit.file_path)
    }

    /// Saves name the file by path when the server knows it, else by kernel
    /// file type.
    pub fn matches_saved(&self, saved: &FileSaved) -> bool {
        if let Some(path) = saved.file_path.as_deref() {
            return self.accepts_path(path);
        }
        match (saved.file_type.as_deref(), &self.document) {
            (Some(file_type), DocumentRef::Kernel { file_type: mine }) => {
                file_type == mine.as_str()
            }
            (Some(file_type), DocumentRef::Objective) => file_type == "objective",
            _ => false,
        }
    }

    pub fn matches_completion(&self, change: &CompletionChanged) -> bool {
        self.document
            .kernel_type()
            .is_some_and(|mine| change.file_type == mine.as_str())
    }
}
