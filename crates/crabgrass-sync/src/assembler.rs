use std::collections::HashMap;
use std::time::{Duration, Instant};

use serde_json::Value;

use crabgrass_types::{AgentEdit, EditOperation, EditStreamStart};

/// An edit whose stream has started but not ended.
#[derive(Debug, Clone)]
pub struct PendingEdit {
    pub file_path: String,
    pub operation: EditOperation,
    pub range: Value,
    chunks: Vec<String>,
    started_at: Instant,
}

impl PendingEdit {
    /// Concatenation of every chunk received so far.
    pub fn preview(&self) -> String {
        self.chunks.concat()
    }

    pub fn chunk_count(&self) -> usize {
        self.chunks.len()
    }

    pub fn started_at(&self) -> Instant {
        self.started_at
    }
}

/// Rebuilds streamed agent edits from start/chunk/end events.
///
/// Chunk content is display-only; the edit finally applied always carries
/// the `end` event's `final_content`. Entries whose stream never ends are
/// dropped once older than the TTL.
#[derive(Debug)]
pub struct StreamingEditAssembler {
    pending: HashMap<String, PendingEdit>,
    ttl: Duration,
}

impl StreamingEditAssembler {
    pub fn new(ttl: Duration) -> Self {
        Self {
            pending: HashMap::new(),
            ttl,
        }
    }

    pub fn on_start(&mut self, start: EditStreamStart) {
        self.sweep_expired(Instant::now());

        let EditStreamStart {
            edit_id,
            file_path,
            operation,
            range,
        } = start;

        if let Some(previous) = self.pending.get(&edit_id) {
            tracing::warn!(
                "Edit stream {} restarted for {} (had {} chunks); discarding previous",
                edit_id,
                previous.file_path,
                previous.chunk_count()
            );
        }

        self.pending.insert(
            edit_id,
            PendingEdit {
                file_path,
                operation,
                range,
                chunks: Vec::new(),
                started_at: Instant::now(),
            },
        );
    }

    /// Appends a chunk and returns the updated entry. Unknown ids are ignored.
    pub fn on_chunk(&mut self, edit_id: &str, content: &str) -> Option<&PendingEdit> {
        let Some(pending) = self.pending.get_mut(edit_id) else {
            tracing::debug!("Ignoring chunk for unknown edit {}", edit_id);
            return None;
        };
        pending.chunks.push(content.to_string());
        Some(pending)
    }

    /// Finishes an edit. Returns `None` for ids with no pending entry.
    pub fn on_end(&mut self, edit_id: &str, final_content: String) -> Option<AgentEdit> {
        let Some(pending) = self.pending.remove(edit_id) else {
            tracing::debug!("Ignoring end for unknown edit {}", edit_id);
            return None;
        };
        Some(AgentEdit {
            edit_id: Some(edit_id.to_string()),
            file_path: pending.file_path,
            operation: pending.operation,
            range: pending.range,
            content: final_content,
        })
    }

    pub fn get(&self, edit_id: &str) -> Option<&PendingEdit> {
        self.pending.get(edit_id)
    }

    pub fn preview(&self, edit_id: &str) -> Option<String> {
        self.pending.get(edit_id).map(PendingEdit::preview)
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub fn sweep_expired(&mut self, now: Instant) -> usize {
        let ttl = self.ttl;
        let before = self.pending.len();
        self.pending.retain(|edit_id, pending| {
            let keep = now.saturating_duration_since(pending.started_at) <= ttl;
            if !keep {
                tracing::warn!(
                    "Dropping edit stream {} for {}: no end received",
                    edit_id,
                    pending.file_path
                );
            }
            keep
        });
        before - self.pending.len()
    }

    pub fn clear(&mut self) -> usize {
        let dropped = self.pending.len();
        self.pending.clear();
        dropped
    }
}
