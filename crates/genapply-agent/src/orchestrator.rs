use crate::context::{ContextSearch, EditContext, KeywordSearch, ProjectManifest, build_edit_context};
use crate::conversation::ConversationStore;
use crate::prompts::build_system_prompt;
use crate::tools::SearchProjectTool;
use chrono::Utc;
use genapply_core::{
    AppConfig, CancellationToken, ConversationEdit, EditOutcome, ErrorClass, EventSink,
    GenerationSummary, LlmConfig, MessageMetadata, ProgressEvent, ProviderId, StreamCallback,
    StreamChunk,
};
use genapply_extract::{FileBlockParser, PackageInferer};
use genapply_llm::{GenerationPrompt, ProviderError, ProviderRegistry, ToolBox};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerationContext {
    #[serde(default)]
    pub sandbox_id: Option<String>,
    #[serde(default)]
    pub current_files: BTreeMap<String, String>,
}

/// Body of a generation request.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerationRequest {
    #[serde(default)]
    pub prompt: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub provider: Option<ProviderId>,
    #[serde(default)]
    pub context: Option<GenerationContext>,
    #[serde(default)]
    pub is_edit: bool,
    #[serde(default)]
    pub enable_search: bool,
}

impl GenerationRequest {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            ..Self::default()
        }
    }

    pub fn from_json(bytes: &[u8]) -> Result<Self, GenerationError> {
        let request: Self = serde_json::from_slice(bytes)
            .map_err(|err| GenerationError::MalformedBody(err.to_string()))?;
        request.validate()?;
        Ok(request)
    }

    pub fn validate(&self) -> Result<(), GenerationError> {
        if self.prompt.trim().is_empty() {
            return Err(GenerationError::EmptyPrompt);
        }
        Ok(())
    }
}

#[derive(thiserror::Error, Debug)]
pub enum GenerationError {
    #[error("prompt is required")]
    EmptyPrompt,
    #[error("malformed request body: {0}")]
    MalformedBody(String),
    #[error(transparent)]
    Provider(#[from] ProviderError),
    #[error("request cancelled")]
    Cancelled,
}

impl GenerationError {
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::EmptyPrompt | Self::MalformedBody(_) => ErrorClass::Validation,
            Self::Provider(err) => err.class(),
            Self::Cancelled => ErrorClass::ProviderFailure,
        }
    }
}

/// Where a generation request is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GenerationState {
    Idle,
    ProviderSelected,
    EditContextBuilt,
    Streaming,
    Finalizing,
    Done,
    Failed,
}

impl GenerationState {
    pub fn can_advance_to(self, next: Self) -> bool {
        use GenerationState::*;
        match (self, next) {
            (Done | Failed, _) => false,
            (_, Failed) => true,
            (Idle, ProviderSelected) => true,
            (ProviderSelected, EditContextBuilt | Streaming) => true,
            (EditContextBuilt, Streaming) => true,
            (Streaming, Finalizing) => true,
            (Finalizing, Done) => true,
            _ => false,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Done | Self::Failed)
    }
}

#[derive(Debug, Clone)]
pub struct GenerationOutcome {
    pub state: GenerationState,
    pub provider: Option<ProviderId>,
    pub summary: Option<GenerationSummary>,
}

#[derive(Default)]
struct StreamState {
    buffer: String,
    announced: Vec<String>,
}

struct Run {
    state: GenerationState,
    provider: Option<ProviderId>,
}

impl Run {
    fn advance(&mut self, next: GenerationState) {
        debug_assert!(
            self.state.can_advance_to(next),
            "invalid transition {:?} -> {next:?}",
            self.state
        );
        tracing::debug!(from = ?self.state, to = ?next, "generation state");
        self.state = next;
    }
}

/// Drives one prompt through a provider and reports progress on a sink.
pub struct GenerationOrchestrator {
    llm: LlmConfig,
    conversations: Arc<ConversationStore>,
    search: Arc<dyn ContextSearch>,
    registry: Arc<dyn ProviderRegistry>,
    parser: Arc<FileBlockParser>,
    inferer: PackageInferer,
}

impl GenerationOrchestrator {
    pub fn new(
        cfg: &AppConfig,
        conversations: Arc<ConversationStore>,
        registry: Arc<dyn ProviderRegistry>,
    ) -> Self {
        Self {
            llm: cfg.llm.clone(),
            conversations,
            search: Arc::new(KeywordSearch),
            registry,
            parser: Arc::new(FileBlockParser::new()),
            inferer: PackageInferer::from_config(&cfg.apply),
        }
    }

    pub fn with_search(mut self, search: Arc<dyn ContextSearch>) -> Self {
        self.search = search;
        self
    }

    pub fn conversations(&self) -> &Arc<ConversationStore> {
        &self.conversations
    }

    /// Runs a request to completion.
    ///
    /// Emits exactly one terminal event: `complete` on success, `error` on
    /// any failure. A sink that closes mid-run cancels `cancel`.
    pub fn run(
        &self,
        request: &GenerationRequest,
        sink: Arc<dyn EventSink>,
        cancel: &CancellationToken,
    ) -> GenerationOutcome {
        let mut run = Run {
            state: GenerationState::Idle,
            provider: None,
        };
        match self.drive(request, &sink, cancel, &mut run) {
            Ok(summary) => {
                run.advance(GenerationState::Done);
                sink.emit(ProgressEvent::generation_complete(
                    format!("Generated {} file(s)", summary.files.len()),
                    summary.clone(),
                ));
                GenerationOutcome {
                    state: run.state,
                    provider: run.provider,
                    summary: Some(summary),
                }
            }
            Err(err) => {
                tracing::warn!(error = %err, class = ?err.class(), state = ?run.state, "generation failed");
                run.advance(GenerationState::Failed);
                sink.emit(ProgressEvent::error(err.to_string()));
                GenerationOutcome {
                    state: run.state,
                    provider: run.provider,
                    summary: None,
                }
            }
        }
    }

    fn drive(
        &self,
        request: &GenerationRequest,
        sink: &Arc<dyn EventSink>,
        cancel: &CancellationToken,
        run: &mut Run,
    ) -> Result<GenerationSummary, GenerationError> {
        request.validate()?;

        sink.emit(ProgressEvent::status("Selecting model provider"));
        let choice = self
            .registry
            .resolve(&self.llm, request.provider, request.model.as_deref())?;
        if let Some(from) = choice.failed_over_from {
            sink.emit(ProgressEvent::warning(format!(
                "{from} has no credentials configured; using {}",
                choice.provider
            )));
        }
        let provider = self.registry.build(&choice, &self.llm)?;
        run.provider = Some(choice.provider);
        run.advance(GenerationState::ProviderSelected);
        tracing::info!(provider = %choice.provider, model = %choice.model, edit = request.is_edit, "generation started");
        sink.emit(ProgressEvent::status(format!(
            "Using {} ({})",
            choice.provider, choice.model
        )));

        let manifest = Arc::new(ProjectManifest::new(
            request
                .context
                .as_ref()
                .map(|ctx| ctx.current_files.clone())
                .unwrap_or_default(),
        ));
        let edit = if request.is_edit {
            self.edit_context(&request.prompt, &manifest, sink, run)
        } else {
            None
        };

        let mut tools = ToolBox::new();
        if request.enable_search && !manifest.is_empty() {
            tools = tools.with(Arc::new(SearchProjectTool::new(
                Arc::clone(&self.search),
                Arc::clone(&manifest),
            )));
            tracing::debug!(tools = ?tools.names(), "tools offered to the model");
        }

        let prompt = GenerationPrompt {
            system: build_system_prompt(edit.as_ref(), !tools.is_empty()),
            history: self.conversations.history(),
            user: request.prompt.clone(),
            model: choice.model.clone(),
            temperature: self.llm.temperature,
            max_tokens: self.llm.max_tokens,
        };
        self.conversations.record_user(&request.prompt);

        check_open(sink, cancel)?;
        run.advance(GenerationState::Streaming);
        sink.emit(ProgressEvent::status("Generating code"));
        let text = match provider.stream(&prompt, &tools, self.stream_callback(sink, cancel), cancel) {
            Ok(text) => text,
            Err(_) if cancel.is_cancelled() => return Err(GenerationError::Cancelled),
            Err(err) => return Err(err.into()),
        };
        check_open(sink, cancel)?;

        run.advance(GenerationState::Finalizing);
        Ok(self.finalize(request, text, edit.as_ref()))
    }

    fn edit_context(
        &self,
        prompt: &str,
        manifest: &ProjectManifest,
        sink: &Arc<dyn EventSink>,
        run: &mut Run,
    ) -> Option<EditContext> {
        sink.emit(ProgressEvent::status(format!(
            "Analyzing {} project file(s)",
            manifest.len()
        )));
        match build_edit_context(self.search.as_ref(), prompt, manifest) {
            Ok(ctx) => {
                run.advance(GenerationState::EditContextBuilt);
                sink.emit(ProgressEvent::status(format!(
                    "Editing {} ({})",
                    ctx.target.path, ctx.target.reason
                )));
                Some(ctx)
            }
            Err(err) => {
                tracing::warn!(error = %err, class = ?err.class(), "edit context unavailable");
                sink.emit(ProgressEvent::warning(format!(
                    "Edit context unavailable ({err}); generating without it"
                )));
                None
            }
        }
    }

    fn stream_callback(&self, sink: &Arc<dyn EventSink>, cancel: &CancellationToken) -> StreamCallback {
        let sink = Arc::clone(sink);
        let cancel = cancel.clone();
        let parser = Arc::clone(&self.parser);
        let state = Arc::new(Mutex::new(StreamState::default()));
        Arc::new(move |chunk: StreamChunk| {
            if sink.is_closed() {
                cancel.cancel();
                return;
            }
            match chunk {
                StreamChunk::ContentDelta(text) => {
                    let closes_block = text.contains('>') || text.contains('`');
                    sink.emit(ProgressEvent::Stream { text: text.clone() });
                    let Ok(mut state) = state.lock() else {
                        return;
                    };
                    state.buffer.push_str(&text);
                    if !closes_block {
                        return;
                    }
                    for path in parser.completed_paths(&state.buffer) {
                        if state.announced.contains(&path) {
                            continue;
                        }
                        state.announced.push(path.clone());
                        sink.emit(ProgressEvent::FileGenerated {
                            file_name: path,
                            current: state.announced.len(),
                        });
                    }
                }
                StreamChunk::ToolCallStart {
                    tool_name,
                    args_summary,
                } => sink.emit(ProgressEvent::status(format!(
                    "Calling {tool_name} {args_summary}"
                ))),
                StreamChunk::ToolCallEnd {
                    tool_name,
                    success: false,
                    summary,
                } => sink.emit(ProgressEvent::warning(format!("{tool_name} failed: {summary}"))),
                StreamChunk::ToolCallEnd { .. } | StreamChunk::Done => {}
            }
        })
    }

    fn finalize(
        &self,
        request: &GenerationRequest,
        text: String,
        edit: Option<&EditContext>,
    ) -> GenerationSummary {
        let extraction = self.parser.extract(&text);
        let packages = self.inferer.infer(&extraction.files);
        let paths: Vec<String> = extraction.files.iter().map(|f| f.path.clone()).collect();

        self.conversations.record_assistant(
            &text,
            MessageMetadata {
                edited_files: paths.clone(),
                added_packages: packages.clone(),
                edit_type: edit.map(|ctx| ctx.edit_type),
            },
        );
        match edit {
            Some(ctx) => {
                let outcome = if paths.contains(&ctx.target.path) {
                    EditOutcome::Success
                } else if paths.is_empty() {
                    EditOutcome::Failed
                } else {
                    EditOutcome::Partial
                };
                self.conversations.record_edit(ConversationEdit {
                    timestamp: Utc::now(),
                    user_request: request.prompt.clone(),
                    edit_type: ctx.edit_type,
                    target_files: vec![ctx.target.path.clone()],
                    confidence: ctx.target.score,
                    outcome,
                });
            }
            None if !paths.is_empty() => {
                self.conversations
                    .record_major_change(request.prompt.clone(), paths.clone());
            }
            None => {}
        }

        GenerationSummary {
            generated_code: text,
            explanation: extraction.explanation,
            files: extraction.files,
            packages,
        }
    }
}

fn check_open(sink: &Arc<dyn EventSink>, cancel: &CancellationToken) -> Result<(), GenerationError> {
    if sink.is_closed() {
        cancel.cancel();
    }
    if cancel.is_cancelled() {
        return Err(GenerationError::Cancelled);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use GenerationState::*;

    #[test]
    fn edit_context_is_an_optional_stop() {
        assert!(Idle.can_advance_to(ProviderSelected));
        assert!(ProviderSelected.can_advance_to(EditContextBuilt));
        assert!(ProviderSelected.can_advance_to(Streaming));
        assert!(EditContextBuilt.can_advance_to(Streaming));
        assert!(!Idle.can_advance_to(Streaming));
        assert!(!Streaming.can_advance_to(Done));
    }

    #[test]
    fn terminal_states_do_not_move() {
        assert!(Done.is_terminal() && Failed.is_terminal());
        assert!(!Done.can_advance_to(Failed));
        assert!(!Failed.can_advance_to(Idle));
        assert!(Streaming.can_advance_to(Failed));
    }

    #[test]
    fn request_body_is_camel_case() {
        let body = br#"{"prompt":"edit header","provider":"groq","isEdit":true,"enableSearch":true,
            "context":{"sandboxId":"sb-1","currentFiles":{"src/App.jsx":"x"}}}"#;
        let request = GenerationRequest::from_json(body).expect("request");
        assert_eq!(request.provider, Some(ProviderId::Groq));
        assert!(request.is_edit && request.enable_search);
        let ctx = request.context.expect("context");
        assert_eq!(ctx.sandbox_id.as_deref(), Some("sb-1"));
        assert_eq!(ctx.current_files.len(), 1);
    }

    #[test]
    fn empty_prompt_and_bad_json_are_validation_errors() {
        let err = GenerationRequest::from_json(br#"{"prompt":"   "}"#).expect_err("empty");
        assert!(matches!(err, GenerationError::EmptyPrompt));
        assert_eq!(err.class(), ErrorClass::Validation);
        let err = GenerationRequest::from_json(b"{nope").expect_err("malformed");
        assert!(matches!(err, GenerationError::MalformedBody(_)));
    }
}
