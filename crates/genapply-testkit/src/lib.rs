//! Test doubles shared by the workspace's integration tests.

use genapply_core::{
    CancellationToken, EventSink, LlmConfig, ProgressEvent, ProviderId, StreamCallback,
    StreamChunk,
};
use genapply_llm::{
    GenerationPrompt, LlmProvider, ProviderChoice, ProviderError, ProviderRegistry, ToolBox,
    resolve_provider,
};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tempfile::TempDir;

pub fn temp_workspace() -> TempDir {
    tempfile::tempdir().expect("create temp workspace")
}

/// Records every event; optionally reports itself closed after `n` events.
#[derive(Clone, Default)]
pub struct CollectingSink {
    events: Arc<Mutex<Vec<ProgressEvent>>>,
    close_after: Option<usize>,
}

impl CollectingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn closing_after(n: usize) -> Self {
        Self {
            close_after: Some(n),
            ..Self::default()
        }
    }

    pub fn events(&self) -> Vec<ProgressEvent> {
        self.events.lock().expect("events lock").clone()
    }

    pub fn kinds(&self) -> Vec<&'static str> {
        self.events().iter().map(ProgressEvent::kind).collect()
    }

    pub fn terminal_count(&self) -> usize {
        self.events().iter().filter(|e| e.is_terminal()).count()
    }
}

impl EventSink for CollectingSink {
    fn emit(&self, event: ProgressEvent) {
        self.events.lock().expect("events lock").push(event);
    }

    fn is_closed(&self) -> bool {
        self.close_after
            .is_some_and(|n| self.events.lock().expect("events lock").len() >= n)
    }
}

#[derive(Debug, Clone)]
pub enum ScriptStep {
    Text(String),
    ToolCall { name: String, args: Value },
}

/// Provider that replays a fixed script instead of calling a model.
#[derive(Clone)]
pub struct ScriptedProvider {
    id: ProviderId,
    steps: Vec<ScriptStep>,
    failure: Option<String>,
    prompts: Arc<Mutex<Vec<GenerationPrompt>>>,
}

impl ScriptedProvider {
    pub fn new(id: ProviderId) -> Self {
        Self {
            id,
            steps: Vec::new(),
            failure: None,
            prompts: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Streams `chunks` as successive text deltas.
    pub fn streaming(id: ProviderId, chunks: &[&str]) -> Self {
        chunks
            .iter()
            .fold(Self::new(id), |provider, chunk| provider.text(chunk))
    }

    pub fn text(mut self, chunk: &str) -> Self {
        self.steps.push(ScriptStep::Text(chunk.to_string()));
        self
    }

    pub fn tool_call(mut self, name: &str, args: Value) -> Self {
        self.steps.push(ScriptStep::ToolCall {
            name: name.to_string(),
            args,
        });
        self
    }

    /// Fail with a transport error after the scripted steps.
    pub fn failing(mut self, message: &str) -> Self {
        self.failure = Some(message.to_string());
        self
    }

    /// Prompts received so far.
    pub fn prompts(&self) -> Vec<GenerationPrompt> {
        self.prompts.lock().expect("prompts lock").clone()
    }
}

impl LlmProvider for ScriptedProvider {
    fn id(&self) -> ProviderId {
        self.id
    }

    fn stream(
        &self,
        prompt: &GenerationPrompt,
        tools: &ToolBox,
        cb: StreamCallback,
        cancel: &CancellationToken,
    ) -> Result<String, ProviderError> {
        self.prompts.lock().expect("prompts lock").push(prompt.clone());
        let mut text = String::new();
        for step in &self.steps {
            if cancel.is_cancelled() {
                return Err(ProviderError::Cancelled);
            }
            match step {
                ScriptStep::Text(chunk) => {
                    text.push_str(chunk);
                    cb(StreamChunk::ContentDelta(chunk.clone()));
                }
                ScriptStep::ToolCall { name, args } => {
                    tools.invoke(name, args, &cb);
                }
            }
        }
        if let Some(message) = &self.failure {
            return Err(ProviderError::Transport(message.clone()));
        }
        cb(StreamChunk::Done);
        Ok(text)
    }
}

/// Real provider resolution over a fixed credential table, handing out a
/// scripted provider.
#[derive(Clone)]
pub struct ScriptedRegistry {
    provider: ScriptedProvider,
    credentials: HashMap<String, String>,
    resolved: Arc<Mutex<Vec<ProviderChoice>>>,
}

impl ScriptedRegistry {
    /// Both providers have credentials.
    pub fn new(provider: ScriptedProvider) -> Self {
        let cfg = LlmConfig::default();
        let credentials = ProviderId::ALL
            .into_iter()
            .map(|id| (cfg.provider(id).api_key_env.clone(), format!("{id}-test-key")))
            .collect();
        Self {
            provider,
            credentials,
            resolved: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Only the listed environment variables are set.
    pub fn with_credentials(provider: ScriptedProvider, vars: &[(&str, &str)]) -> Self {
        Self {
            credentials: vars
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            ..Self::new(provider)
        }
    }

    pub fn provider(&self) -> &ScriptedProvider {
        &self.provider
    }

    pub fn resolved(&self) -> Vec<ProviderChoice> {
        self.resolved.lock().expect("resolved lock").clone()
    }
}

impl ProviderRegistry for ScriptedRegistry {
    fn resolve(
        &self,
        cfg: &LlmConfig,
        explicit: Option<ProviderId>,
        model: Option<&str>,
    ) -> Result<ProviderChoice, ProviderError> {
        let choice = resolve_provider(cfg, explicit, model, |name| {
            self.credentials.get(name).cloned()
        })?;
        self.resolved
            .lock()
            .expect("resolved lock")
            .push(choice.clone());
        Ok(choice)
    }

    fn build(
        &self,
        _choice: &ProviderChoice,
        _cfg: &LlmConfig,
    ) -> Result<Box<dyn LlmProvider>, ProviderError> {
        Ok(Box::new(self.provider.clone()))
    }
}
