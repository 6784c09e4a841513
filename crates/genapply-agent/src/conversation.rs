use chrono::Utc;
use genapply_core::{
    ConversationConfig, ConversationEdit, ConversationMessage, ConversationState, MajorChange,
    MessageMetadata, MessageRole,
};
use genapply_llm::ChatTurn;
use std::sync::{Mutex, MutexGuard};

/// Conversation history shared by the generation requests of one session.
///
/// The state is created on first use and lives until `reset`. Concurrent
/// requests serialize on the lock, so each mutation is applied whole.
pub struct ConversationStore {
    state: Mutex<Option<ConversationState>>,
    bounds: ConversationConfig,
}

impl ConversationStore {
    pub fn new(bounds: ConversationConfig) -> Self {
        Self {
            state: Mutex::new(None),
            bounds,
        }
    }

    pub fn snapshot(&self) -> Option<ConversationState> {
        self.lock().clone()
    }

    pub fn reset(&self) {
        *self.lock() = None;
    }

    /// The newest `history_window` messages as provider chat turns.
    pub fn history(&self) -> Vec<ChatTurn> {
        let mut guard = self.lock();
        let state = guard.get_or_insert_with(ConversationState::new);
        state
            .recent_messages(self.bounds.history_window)
            .iter()
            .map(|message| ChatTurn {
                role: message.role,
                content: message.content.clone(),
            })
            .collect()
    }

    pub fn record_user(&self, content: &str) {
        self.with_state(|state, bounds| {
            state.push_message(ConversationMessage::new(MessageRole::User, content), bounds);
        });
    }

    pub fn record_assistant(&self, content: &str, metadata: MessageMetadata) {
        self.with_state(|state, bounds| {
            state.push_message(
                ConversationMessage::new(MessageRole::Assistant, content).with_metadata(metadata),
                bounds,
            );
        });
    }

    pub fn record_edit(&self, edit: ConversationEdit) {
        self.with_state(|state, bounds| state.push_edit(edit, bounds));
    }

    pub fn record_major_change(&self, description: impl Into<String>, files_affected: Vec<String>) {
        let change = MajorChange {
            timestamp: Utc::now(),
            description: description.into(),
            files_affected,
        };
        self.with_state(|state, _| state.push_major_change(change));
    }

    fn with_state(&self, f: impl FnOnce(&mut ConversationState, &ConversationConfig)) {
        let mut guard = self.lock();
        let state = guard.get_or_insert_with(ConversationState::new);
        f(state, &self.bounds);
    }

    fn lock(&self) -> MutexGuard<'_, Option<ConversationState>> {
        // A panicked writer leaves at worst a partially bounded log.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Default for ConversationStore {
    fn default() -> Self {
        Self::new(ConversationConfig::default())
    }
}
