//! Conversation state: ordered turns, streaming reconciliation, detected
//! actions, and the summary slot.
//!
//! Streaming input is reconciled through two tracks. The user track is an
//! *ephemeral turn* identified by a tracked id: created when speech begins,
//! mutated in place while partial transcripts arrive, frozen on the final
//! transcript. The assistant track is positional: deltas append to the
//! trailing assistant turn if it is still open, otherwise a fresh turn is
//! started. At most one non-final turn exists per track at any time.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use uuid::Uuid;

// ── Turn model ─────────────────────────────────────────────────────

/// Who produced a conversation turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

/// Lifecycle phase of a turn while its content streams in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TurnStatus {
    Speaking,
    Processing,
    Final,
}

/// One entry in the conversation log.
#[derive(Debug, Clone, Serialize)]
pub struct ConversationTurn {
    pub id: Uuid,
    pub role: Role,
    pub text: String,
    pub created_at: DateTime<Utc>,
    pub is_final: bool,
    pub status: TurnStatus,
}

/// Language lane a finalized user turn was routed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageLanguage {
    English,
    Spanish,
}

/// Partial update applied to the outstanding ephemeral turn.
#[derive(Debug, Clone, Default)]
pub struct TurnUpdate {
    pub text: Option<String>,
    pub status: Option<TurnStatus>,
    pub is_final: Option<bool>,
}

// ── Detected actions ───────────────────────────────────────────────

/// A recorded tool invocation with its arguments and timestamp.
///
/// The action list is deduplicated on structural equality of
/// (type, data); it intentionally survives session teardown so the
/// post-session summary view can show what happened.
#[derive(Debug, Clone, Serialize)]
pub struct DetectedAction {
    #[serde(rename = "type")]
    pub action_type: String,
    pub data: Value,
    pub occurred_at: DateTime<Utc>,
}

impl DetectedAction {
    pub fn new(action_type: impl Into<String>, data: Value) -> Self {
        Self {
            action_type: action_type.into(),
            data,
            occurred_at: Utc::now(),
        }
    }

    fn same_invocation(&self, other: &Self) -> bool {
        self.action_type == other.action_type && self.data == other.data
    }
}

// ── Store ──────────────────────────────────────────────────────────

/// Ordered conversation log with streaming reconciliation rules.
#[derive(Debug, Default)]
pub struct ConversationStore {
    turns: Vec<ConversationTurn>,
    ephemeral_id: Option<Uuid>,
    languages: HashMap<Uuid, MessageLanguage>,
    actions: Vec<DetectedAction>,
    summary: String,
}

impl ConversationStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Begin (or continue) the ephemeral user turn. A new turn is appended
    /// only when none is outstanding; otherwise the existing id is
    /// returned unchanged.
    pub fn begin_ephemeral_turn(&mut self, role: Role) -> Uuid {
        if let Some(id) = self.ephemeral_id {
            return id;
        }
        let id = Uuid::new_v4();
        self.ephemeral_id = Some(id);
        self.turns.push(ConversationTurn {
            id,
            role,
            text: String::new(),
            created_at: Utc::now(),
            is_final: false,
            status: TurnStatus::Speaking,
        });
        id
    }

    /// Apply a partial update to the outstanding ephemeral turn, if any.
    /// Never creates a turn.
    pub fn update_ephemeral_turn(&mut self, update: TurnUpdate) {
        let Some(id) = self.ephemeral_id else {
            return;
        };
        if let Some(turn) = self.turns.iter_mut().find(|t| t.id == id) {
            if let Some(text) = update.text {
                turn.text = text;
            }
            if let Some(status) = update.status {
                turn.status = status;
            }
            if let Some(is_final) = update.is_final {
                turn.is_final = is_final;
            }
        }
    }

    /// Freeze the ephemeral turn with its final text and clear the
    /// tracked id so the next speech input starts a fresh turn.
    pub fn finalize_ephemeral_turn(&mut self, text: impl Into<String>) {
        self.update_ephemeral_turn(TurnUpdate {
            text: Some(text.into()),
            status: Some(TurnStatus::Final),
            is_final: Some(true),
        });
        self.ephemeral_id = None;
    }

    /// Id of the outstanding ephemeral turn, if one exists.
    pub fn ephemeral_id(&self) -> Option<Uuid> {
        self.ephemeral_id
    }

    /// Append a streaming fragment to the trailing assistant turn, or
    /// open a new one if the last turn is missing, final, or not from the
    /// assistant. Assistant turns are identified positionally, not by a
    /// tracked id.
    pub fn append_assistant_delta(&mut self, fragment: &str) {
        if let Some(last) = self.turns.last_mut() {
            if last.role == Role::Assistant && !last.is_final {
                last.text.push_str(fragment);
                return;
            }
        }
        self.turns.push(ConversationTurn {
            id: Uuid::new_v4(),
            role: Role::Assistant,
            text: fragment.to_string(),
            created_at: Utc::now(),
            is_final: false,
            status: TurnStatus::Speaking,
        });
    }

    /// Mark the last turn final and return its text. No-op on an empty
    /// store.
    pub fn finalize_last_assistant_turn(&mut self) -> Option<String> {
        let last = self.turns.last_mut()?;
        last.is_final = true;
        last.status = TurnStatus::Final;
        Some(last.text.clone())
    }

    /// Append an already-final turn (optimistic local echo for typed
    /// messages).
    pub fn push_final_turn(&mut self, role: Role, text: impl Into<String>) -> Uuid {
        let id = Uuid::new_v4();
        self.turns.push(ConversationTurn {
            id,
            role,
            text: text.into(),
            created_at: Utc::now(),
            is_final: true,
            status: TurnStatus::Final,
        });
        id
    }

    /// Tag the language lane of a turn.
    pub fn tag_language(&mut self, id: Uuid, language: MessageLanguage) {
        self.languages.insert(id, language);
    }

    pub fn language_of(&self, id: Uuid) -> Option<MessageLanguage> {
        self.languages.get(&id).copied()
    }

    pub fn turns(&self) -> &[ConversationTurn] {
        &self.turns
    }

    /// Clone of the current turn sequence, for observers and persistence.
    pub fn snapshot(&self) -> Vec<ConversationTurn> {
        self.turns.clone()
    }

    /// Count of finalized turns for the given role.
    pub fn final_turn_count(&self, role: Role) -> usize {
        self.turns
            .iter()
            .filter(|t| t.role == role && t.is_final)
            .count()
    }

    // ── Actions and summary ────────────────────────────────────────

    /// Record a tool invocation, deduplicating on (type, data). Returns
    /// false when an identical invocation was already recorded.
    pub fn record_action(&mut self, action: DetectedAction) -> bool {
        if self.actions.iter().any(|a| a.same_invocation(&action)) {
            return false;
        }
        self.actions.push(action);
        true
    }

    pub fn actions(&self) -> &[DetectedAction] {
        &self.actions
    }

    /// Overwrite the conversation summary. Later writes win.
    pub fn set_summary(&mut self, summary: impl Into<String>) {
        self.summary = summary.into();
    }

    pub fn summary(&self) -> &str {
        &self.summary
    }

    pub fn has_summary(&self) -> bool {
        !self.summary.is_empty()
    }

    /// Clear turns, language tags, and the ephemeral reference. Detected
    /// actions and the summary are preserved for the post-session view.
    pub fn reset(&mut self) {
        self.turns.clear();
        self.languages.clear();
        self.ephemeral_id = None;
    }

    /// Drop detected actions (new-conversation flow).
    pub fn clear_actions(&mut self) {
        self.actions.clear();
    }

    /// Drop the summary (new-conversation flow).
    pub fn clear_summary(&mut self) {
        self.summary.clear();
    }
}

// ── Tests ──────────────────────────────────────────────────────────
