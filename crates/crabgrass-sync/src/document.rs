use serde::Serialize;
use serde_json::Value;

use crabgrass_types::{AgentEdit, EditOperation, FileSaved};

/// Half-open character range `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TextSpan {
    pub start: usize,
    pub end: usize,
}

impl TextSpan {
    pub fn new(start: usize, end: usize) -> Self {
        Self {
            start: start.min(end),
            end: start.max(end),
        }
    }

    /// Reads `[start, end]` or `{"start": .., "end": ..}`. Anything else,
    /// including `null`, means "no range".
    pub fn from_range(range: &Value) -> Option<Self> {
        let (start, end) = match range {
            Value::Array(items) if items.len() == 2 => (items[0].as_u64()?, items[1].as_u64()?),
            Value::Object(map) => (map.get("start")?.as_u64()?, map.get("end")?.as_u64()?),
            _ => return None,
        };
        Some(Self::new(
            usize::try_from(start).ok()?,
            usize::try_from(end).ok()?,
        ))
    }

    fn clamp(self, len: usize) -> Self {
        Self {
            start: self.start.min(len),
            end: self.end.min(len),
        }
    }
}

/// Local copy of the open document.
#[derive(Debug, Clone, Default, Serialize)]
pub struct DocumentBuffer {
    content: String,
    dirty: bool,
    revision: u64,
    last_remote_save: Option<FileSaved>,
}

impl DocumentBuffer {
    pub fn new(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            ..Self::default()
        }
    }

    pub fn content(&self) -> &str {
        &self.content
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Bumped on every content change, local or remote.
    pub fn revision(&self) -> u64 {
        self.revision
    }

    pub fn last_remote_save(&self) -> Option<&FileSaved> {
        self.last_remote_save.as_ref()
    }

    /// Replaces content with what the server holds.
    pub fn load(&mut self, content: impl Into<String>) {
        self.content = content.into();
        self.dirty = false;
        self.revision += 1;
    }

    pub fn edit_local(&mut self, content: impl Into<String>) {
        self.content = content.into();
        self.dirty = true;
        self.revision += 1;
    }

    pub fn mark_saved(&mut self) {
        self.dirty = false;
    }

    pub fn note_remote_save(&mut self, saved: FileSaved) {
        self.last_remote_save = Some(saved);
    }

    pub fn slice(&self, span: TextSpan) -> String {
        let span = span.clamp(self.content.chars().count());
        self.content
            .chars()
            .skip(span.start)
            .take(span.end - span.start)
            .collect()
    }

    /// Applies an agent edit. Offsets are character offsets, clamped to the
    /// document. Agent edits do not change the dirty flag.
    ///
    /// Returns `false` when the edit cannot be interpreted: an unknown
    /// operation, or a delete without a range.
    pub fn apply(&mut self, edit: &AgentEdit) -> bool {
        let len = self.content.chars().count();
        let span = TextSpan::from_range(&edit.range).map(|s| s.clamp(len));

        let (span, replacement) = match (&edit.operation, span) {
            (EditOperation::Replace, Some(span)) => (span, edit.content.as_str()),
            (EditOperation::Replace, None) => (TextSpan::new(0, len), edit.content.as_str()),
            (EditOperation::Insert, Some(span)) => {
                (TextSpan::new(span.start, span.start), edit.content.as_str())
            }
            (EditOperation::Insert, None) => (TextSpan::new(len, len), edit.content.as_str()),
            (EditOperation::Delete, Some(span)) => (span, ""),
            (EditOperation::Delete, None) => return false,
            (EditOperation::Other(op), _) => {
                tracing::warn!("Skipping edit with unsupported operation '{}'", op);
                return false;
            }
        };

        self.content = splice_chars(&self.content, span, replacement);
        self.revision += 1;
        true
    }
}

fn splice_chars(text: &str, span: TextSpan, replacement: &str) -> String {
    let byte_at = |char_idx: usize| {
        text.char_indices()
            .nth(char_idx)
            .map(|(idx, _)| idx)
            .unwrap_or(text.len())
    };
    let start = byte_at(span.start);
    let end = byte_at(span.end);

    let mut out = String::with_capacity(text.len() - (end - start) + replacement.len());
    out.push_str(&text[..start]);
    out.push_str(replacement);
    out.push_str(&text[end..]);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn edit(operation: EditOperation, range: Value, content: &str) -> AgentEdit {
        AgentEdit {
            edit_id: None,
            file_path: "kernel/summary".to_string(),
            operation,
            range,
            content: content.to_string(),
        }
    }

    #[test]
    fn replace_range_uses_character_offsets() {
        let mut doc = DocumentBuffer::new("caf\u{e9} au lait");
        assert!(doc.apply(&edit(EditOperation::Replace, json!([0, 4]), "th\u{e9}")));
        assert_eq!(doc.content(), "th\u{e9} au lait");
    }

    #[test]
    fn replace_without_range_swaps_everything() {
        let mut doc = DocumentBuffer::new("old");
        doc.apply(&edit(EditOperation::Replace, Value::Null, "Hello world"));
        assert_eq!(doc.content(), "Hello world");
        assert_eq!(doc.revision(), 1);
        assert!(!doc.is_dirty());
    }

    #[test]
    fn insert_and_delete_with_object_ranges() {
        let mut doc = DocumentBuffer::new("Hello world");
        doc.apply(&edit(
            EditOperation::Insert,
            json!({"start": 5, "end": 5}),
            ",",
        ));
        assert_eq!(doc.content(), "Hello, world");

        doc.apply(&edit(EditOperation::Delete, json!({"start": 5, "end": 6}), ""));
        assert_eq!(doc.content(), "Hello world");
    }

    #[test]
    fn out_of_bounds_ranges_are_clamped() {
        let mut doc = DocumentBuffer::new("abc");
        doc.apply(&edit(EditOperation::Replace, json!([10, 2]), "Z"));
        assert_eq!(doc.content(), "abZ");
    }

    #[test]
    fn uninterpretable_edits_leave_content_alone() {
        let mut doc = DocumentBuffer::new("keep");
        assert!(!doc.apply(&edit(EditOperation::Delete, Value::Null, "")));
        assert!(!doc.apply(&edit(
            EditOperation::Other("rewrite".to_string()),
            Value::Null,
            "x"
        )));
        assert_eq!(doc.content(), "keep");
        assert_eq!(doc.revision(), 0);
    }

    #[test]
    fn local_edits_mark_dirty_until_saved() {
        let mut doc = DocumentBuffer::new("a");
        doc.edit_local("ab");
        assert!(doc.is_dirty());
        doc.mark_saved();
        assert!(!doc.is_dirty());
        assert_eq!(doc.slice(TextSpan::new(1, 5)), "b");
    }
}
