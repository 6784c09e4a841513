use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use uuid::Uuid;

mod config;

pub use config::{
    AppConfig, ApplyConfig, ConversationConfig, LlmConfig, ObserveConfig, PolicyConfig,
    ProviderConfig, ProviderId, SandboxConfig, ServerConfig,
};

pub type Result<T> = anyhow::Result<T>;

pub fn runtime_dir(workspace: &Path) -> PathBuf {
    workspace.join(".genapply")
}

// ── File records and apply results ──────────────────────────────────────

/// A project-relative `(path, content)` pair destined for a filesystem write.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileRecord {
    pub path: String,
    pub content: String,
}

impl FileRecord {
    pub fn new(path: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            content: content.into(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApplyResult {
    pub files_created: Vec<String>,
    pub files_updated: Vec<String>,
    pub files_skipped: Vec<String>,
    pub errors: Vec<String>,
    pub packages: Vec<String>,
}

impl ApplyResult {
    pub fn succeeded(&self) -> usize {
        self.files_created.len() + self.files_updated.len()
    }

    pub fn summary(&self, total: usize) -> ApplySummary {
        ApplySummary {
            total,
            succeeded: self.succeeded(),
            failed: self.errors.len(),
            skipped: self.files_skipped.len(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApplySummary {
    pub total: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub skipped: usize,
}

/// Everything the generation endpoint reports once the provider stream ends.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GenerationSummary {
    pub generated_code: String,
    pub explanation: String,
    pub files: Vec<FileRecord>,
    pub packages: Vec<String>,
}

// ── Progress events ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileAction {
    Validating,
    Creating,
    Updating,
    Skipped,
}

/// One frame of the server-to-caller push stream.
///
/// Serialized as `{"type": "<kebab-case variant>", ...camelCase fields}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ProgressEvent {
    Status {
        message: String,
    },
    /// A feature degraded but the request continues.
    Warning {
        message: String,
    },
    Stream {
        text: String,
    },
    /// A file block closed while the generation buffer was still growing.
    #[serde(rename_all = "camelCase")]
    FileGenerated {
        file_name: String,
        current: usize,
    },
    #[serde(rename_all = "camelCase")]
    FileProgress {
        file_name: String,
        action: FileAction,
        current: usize,
        total: usize,
    },
    #[serde(rename_all = "camelCase")]
    FileComplete {
        file_name: String,
        action: FileAction,
        current: usize,
        total: usize,
    },
    #[serde(rename_all = "camelCase")]
    FileError {
        file_name: String,
        error: String,
        current: usize,
        total: usize,
    },
    #[serde(rename_all = "camelCase")]
    Complete {
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        results: Option<ApplyResult>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        summary: Option<ApplySummary>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        generated_code: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        explanation: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        files: Option<Vec<FileRecord>>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        file_count: Option<usize>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        packages: Option<Vec<String>>,
    },
    Error {
        error: String,
    },
}

impl ProgressEvent {
    pub fn status(message: impl Into<String>) -> Self {
        Self::Status {
            message: message.into(),
        }
    }

    pub fn warning(message: impl Into<String>) -> Self {
        Self::Warning {
            message: message.into(),
        }
    }

    pub fn error(error: impl Into<String>) -> Self {
        Self::Error {
            error: error.into(),
        }
    }

    pub fn apply_complete(message: impl Into<String>, results: ApplyResult, total: usize) -> Self {
        let summary = results.summary(total);
        Self::Complete {
            message: message.into(),
            results: Some(results),
            summary: Some(summary),
            generated_code: None,
            explanation: None,
            files: None,
            file_count: None,
            packages: None,
        }
    }

    pub fn generation_complete(message: impl Into<String>, generation: GenerationSummary) -> Self {
        let file_count = generation.files.len();
        Self::Complete {
            message: message.into(),
            results: None,
            summary: None,
            generated_code: Some(generation.generated_code),
            explanation: Some(generation.explanation),
            files: Some(generation.files),
            file_count: Some(file_count),
            packages: Some(generation.packages),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Status { .. } => "status",
            Self::Warning { .. } => "warning",
            Self::Stream { .. } => "stream",
            Self::FileGenerated { .. } => "file-generated",
            Self::FileProgress { .. } => "file-progress",
            Self::FileComplete { .. } => "file-complete",
            Self::FileError { .. } => "file-error",
            Self::Complete { .. } => "complete",
            Self::Error { .. } => "error",
        }
    }

    /// `complete` and `error` end a request; nothing may follow them.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Complete { .. } | Self::Error { .. })
    }
}

/// Receiver side of a request's ordered progress stream.
pub trait EventSink: Send + Sync {
    fn emit(&self, event: ProgressEvent);

    /// True once the caller has gone away; producers stop at the next
    /// suspension point.
    fn is_closed(&self) -> bool {
        false
    }
}

impl<F> EventSink for F
where
    F: Fn(ProgressEvent) + Send + Sync,
{
    fn emit(&self, event: ProgressEvent) {
        self(event)
    }
}

#[derive(Debug, Clone, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

// ── Provider streaming ──────────────────────────────────────────────────

/// A single chunk emitted while a provider streams its response.
#[derive(Debug, Clone)]
pub enum StreamChunk {
    ContentDelta(String),
    ToolCallStart {
        tool_name: String,
        args_summary: String,
    },
    ToolCallEnd {
        tool_name: String,
        success: bool,
        summary: String,
    },
    Done,
}

/// Uses `Arc<dyn Fn>` so one callback can follow a request across tool rounds.
pub type StreamCallback = Arc<dyn Fn(StreamChunk) + Send + Sync>;

// ── Error taxonomy ──────────────────────────────────────────────────────

/// Scope of a failure, which decides how far it propagates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorClass {
    /// Malformed request; nothing runs.
    Validation,
    /// One path failed policy; the batch continues.
    PolicyViolation,
    /// One filesystem operation failed; the batch continues.
    IoFailure,
    /// The model provider failed; the whole generation aborts.
    ProviderFailure,
    /// An optional feature failed; logged and skipped.
    DegradedFeature,
}

// ── Conversation state ──────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    User,
    Assistant,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EditType {
    UpdateComponent,
    AddFeature,
    FixIssue,
    UpdateStyle,
    Refactor,
    FullRebuild,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageMetadata {
    #[serde(default)]
    pub edited_files: Vec<String>,
    #[serde(default)]
    pub added_packages: Vec<String>,
    #[serde(default)]
    pub edit_type: Option<EditType>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationMessage {
    pub id: String,
    pub role: MessageRole,
    pub content: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub metadata: Option<MessageMetadata>,
}

impl ConversationMessage {
    pub fn new(role: MessageRole, content: impl Into<String>) -> Self {
        Self {
            id: Uuid::now_v7().to_string(),
            role,
            content: content.into(),
            timestamp: Utc::now(),
            metadata: None,
        }
    }

    pub fn with_metadata(mut self, metadata: MessageMetadata) -> Self {
        self.metadata = Some(metadata);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EditOutcome {
    Success,
    Partial,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationEdit {
    pub timestamp: DateTime<Utc>,
    pub user_request: String,
    pub edit_type: EditType,
    pub target_files: Vec<String>,
    pub confidence: f32,
    pub outcome: EditOutcome,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MajorChange {
    pub timestamp: DateTime<Utc>,
    pub description: String,
    pub files_affected: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProjectEvolution {
    pub major_changes: Vec<MajorChange>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationState {
    pub conversation_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub last_updated: DateTime<Utc>,
    pub messages: Vec<ConversationMessage>,
    pub edits: Vec<ConversationEdit>,
    pub project_evolution: ProjectEvolution,
}

impl ConversationState {
    pub fn new() -> Self {
        let now = Utc::now();
        Self {
            conversation_id: Uuid::now_v7(),
            started_at: now,
            last_updated: now,
            messages: Vec::new(),
            edits: Vec::new(),
            project_evolution: ProjectEvolution::default(),
        }
    }

    /// Appends a message; once the log exceeds `max_messages` it is cut back
    /// to the newest `keep_messages`.
    pub fn push_message(&mut self, message: ConversationMessage, bounds: &ConversationConfig) {
        self.messages.push(message);
        truncate_front(&mut self.messages, bounds.max_messages, bounds.keep_messages);
        self.last_updated = Utc::now();
    }

    pub fn push_edit(&mut self, edit: ConversationEdit, bounds: &ConversationConfig) {
        self.edits.push(edit);
        truncate_front(&mut self.edits, bounds.max_edits, bounds.keep_edits);
        self.last_updated = Utc::now();
    }

    pub fn push_major_change(&mut self, change: MajorChange) {
        self.project_evolution.major_changes.push(change);
        self.last_updated = Utc::now();
    }

    pub fn recent_messages(&self, window: usize) -> &[ConversationMessage] {
        let start = self.messages.len().saturating_sub(window);
        &self.messages[start..]
    }
}

impl Default for ConversationState {
    fn default() -> Self {
        Self::new()
    }
}

fn truncate_front<T>(items: &mut Vec<T>, max: usize, keep: usize) {
    if items.len() > max {
        let drop = items.len() - keep.min(items.len());
        items.drain(..drop);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn progress_event_serializes_with_kebab_tag_and_camel_fields() {
        let event = ProgressEvent::FileProgress {
            file_name: "src/a.txt".to_string(),
            action: FileAction::Validating,
            current: 1,
            total: 2,
        };
        let value = serde_json::to_value(&event).expect("serialize");
        assert_eq!(
            value,
            json!({
                "type": "file-progress",
                "fileName": "src/a.txt",
                "action": "validating",
                "current": 1,
                "total": 2
            })
        );
    }

    #[test]
    fn apply_complete_carries_results_and_summary_only() {
        let results = ApplyResult {
            files_created: vec!["src/a.txt".to_string()],
            errors: vec!["src/.env: protected file".to_string()],
            ..ApplyResult::default()
        };
        let value = serde_json::to_value(ProgressEvent::apply_complete("done", results, 2))
            .expect("serialize");
        assert_eq!(value["type"], "complete");
        assert_eq!(value["results"]["filesCreated"], json!(["src/a.txt"]));
        assert_eq!(value["summary"]["succeeded"], 1);
        assert_eq!(value["summary"]["failed"], 1);
        assert!(value.get("generatedCode").is_none());
        assert!(value.get("fileCount").is_none());
    }

    #[test]
    fn generation_complete_reports_file_count() {
        let event = ProgressEvent::generation_complete(
            "ok",
            GenerationSummary {
                generated_code: "<file path=\"src/x.ts\">x</file>".to_string(),
                explanation: String::new(),
                files: vec![FileRecord::new("src/x.ts", "x")],
                packages: vec!["zod".to_string()],
            },
        );
        let value = serde_json::to_value(&event).expect("serialize");
        assert_eq!(value["fileCount"], 1);
        assert_eq!(value["packages"], json!(["zod"]));
        assert!(value.get("results").is_none());
        let back: ProgressEvent = serde_json::from_value(value).expect("deserialize");
        assert_eq!(back, event);
    }

    #[test]
    fn message_log_is_cut_back_after_exceeding_bound() {
        let bounds = ConversationConfig::default();
        let mut state = ConversationState::new();
        for i in 0..bounds.max_messages {
            state.push_message(
                ConversationMessage::new(MessageRole::User, format!("m{i}")),
                &bounds,
            );
        }
        assert_eq!(state.messages.len(), bounds.max_messages);
        state.push_message(ConversationMessage::new(MessageRole::User, "last"), &bounds);
        assert_eq!(state.messages.len(), bounds.keep_messages);
        assert_eq!(
            state.messages.last().map(|m| m.content.as_str()),
            Some("last")
        );
    }

    #[test]
    fn edit_log_keeps_newest_entries() {
        let bounds = ConversationConfig::default();
        let mut state = ConversationState::new();
        for i in 0..=bounds.max_edits {
            state.push_edit(
                ConversationEdit {
                    timestamp: Utc::now(),
                    user_request: format!("edit {i}"),
                    edit_type: EditType::FixIssue,
                    target_files: vec![],
                    confidence: 0.5,
                    outcome: EditOutcome::Success,
                },
                &bounds,
            );
        }
        assert_eq!(state.edits.len(), bounds.keep_edits);
        assert_eq!(
            state.edits.first().map(|e| e.user_request.clone()),
            Some(format!("edit {}", bounds.max_edits + 1 - bounds.keep_edits))
        );
    }

    #[test]
    fn recent_messages_clamps_to_available() {
        let bounds = ConversationConfig::default();
        let mut state = ConversationState::new();
        state.push_message(ConversationMessage::new(MessageRole::User, "a"), &bounds);
        state.push_message(ConversationMessage::new(MessageRole::Assistant, "b"), &bounds);
        assert_eq!(state.recent_messages(10).len(), 2);
        assert_eq!(state.recent_messages(1)[0].content, "b");
    }

    #[test]
    fn cancellation_token_is_shared_between_clones() {
        let token = CancellationToken::new();
        let clone = token.clone();
        assert!(!clone.is_cancelled());
        token.cancel();
        assert!(clone.is_cancelled());
    }

    #[test]
    fn closures_are_event_sinks() {
        let seen = std::sync::Mutex::new(Vec::new());
        let sink = |event: ProgressEvent| seen.lock().expect("lock").push(event.kind());
        sink.emit(ProgressEvent::status("hi"));
        assert!(!EventSink::is_closed(&sink));
        assert_eq!(*seen.lock().expect("lock"), vec!["status"]);
    }
}
