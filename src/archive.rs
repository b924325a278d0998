//! Conversation persistence collaborator.
//!
//! The core treats storage as a black box behind [`ConversationArchive`]:
//! insert a finished conversation, query latest / by id / all. The
//! bundled [`MemoryArchive`] keeps the most recent records in memory and
//! is what the built-in tools use unless the host supplies its own
//! backend.

use std::collections::VecDeque;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;

use crate::convo::{ConversationTurn, DetectedAction};

/// A finished conversation as handed to the archive.
#[derive(Debug, Clone, Serialize)]
pub struct ConversationRecord {
    pub id: String,
    pub saved_at: DateTime<Utc>,
    pub conversation: Vec<ConversationTurn>,
    pub summary: String,
    pub actions: Vec<DetectedAction>,
}

/// Storage backend for finished conversations.
#[async_trait]
pub trait ConversationArchive: Send + Sync {
    /// Persist a record and return its identifier.
    async fn save(
        &self,
        conversation: Vec<ConversationTurn>,
        summary: String,
        actions: Vec<DetectedAction>,
    ) -> anyhow::Result<String>;

    /// Most recently saved record, if any.
    async fn latest(&self) -> Option<ConversationRecord>;

    /// Record with the given identifier, if present.
    async fn by_id(&self, id: &str) -> Option<ConversationRecord>;

    /// All retained records, newest first.
    async fn all(&self) -> Vec<ConversationRecord>;
}

/// In-memory archive retaining the newest records up to a fixed capacity.
pub struct MemoryArchive {
    records: Mutex<VecDeque<ConversationRecord>>,
    capacity: usize,
}

impl MemoryArchive {
    pub fn new(capacity: usize) -> Self {
        Self {
            records: Mutex::new(VecDeque::new()),
            capacity,
        }
    }
}

impl Default for MemoryArchive {
    fn default() -> Self {
        Self::new(10)
    }
}

#[async_trait]
impl ConversationArchive for MemoryArchive {
    async fn save(
        &self,
        conversation: Vec<ConversationTurn>,
        summary: String,
        actions: Vec<DetectedAction>,
    ) -> anyhow::Result<String> {
        let now = Utc::now();
        let record = ConversationRecord {
            id: now.timestamp_millis().to_string(),
            saved_at: now,
            conversation,
            summary,
            actions,
        };
        let id = record.id.clone();

        let mut records = self.records.lock();
        records.push_front(record);
        records.truncate(self.capacity);

        tracing::debug!(record_id = %id, retained = records.len(), "Conversation archived");
        Ok(id)
    }

    async fn latest(&self) -> Option<ConversationRecord> {
        self.records.lock().front().cloned()
    }

    async fn by_id(&self, id: &str) -> Option<ConversationRecord> {
        self.records.lock().iter().find(|r| r.id == id).cloned()
    }

    async fn all(&self) -> Vec<ConversationRecord> {
        self.records.lock().iter().cloned().collect()
    }
}

// ── Tests ──────────────────────────────────────────────────────────
