use genapply_core::{
    CancellationToken, ErrorClass, LlmConfig, MessageRole, ProviderId, StreamCallback,
};
use serde::{Deserialize, Serialize};

mod google;
mod groq;
mod http;
mod resolve;
mod tools;

#[cfg(test)]
mod test_support;

pub use google::GoogleProvider;
pub use groq::GroqProvider;
pub use resolve::{ProviderChoice, resolve_provider};
pub use tools::{ProviderTool, ToolBox};

#[derive(thiserror::Error, Debug)]
pub enum ProviderError {
    #[error("no credentials configured for {provider} (set {env} or llm.{provider}.api_key)")]
    MissingCredentials { provider: ProviderId, env: String },
    #[error("no model provider has credentials configured")]
    NoProviderAvailable,
    #[error("{0}")]
    Transport(String),
    #[error("{provider} API error (HTTP {status}): {detail}")]
    Api {
        provider: ProviderId,
        status: u16,
        detail: String,
    },
    #[error("stream read error: {0}")]
    Stream(String),
    #[error("request cancelled")]
    Cancelled,
}

impl ProviderError {
    pub fn class(&self) -> ErrorClass {
        ErrorClass::ProviderFailure
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatTurn {
    pub role: MessageRole,
    pub content: String,
}

/// Everything a provider needs for one streamed generation.
#[derive(Debug, Clone)]
pub struct GenerationPrompt {
    pub system: String,
    pub history: Vec<ChatTurn>,
    pub user: String,
    pub model: String,
    pub temperature: f32,
    pub max_tokens: u32,
}

/// A model backend that streams text for a prompt.
///
/// `cb` receives every text delta as it arrives plus tool call markers.
/// The return value is the concatenated text of every round.
pub trait LlmProvider: Send + Sync {
    fn id(&self) -> ProviderId;

    fn stream(
        &self,
        prompt: &GenerationPrompt,
        tools: &ToolBox,
        cb: StreamCallback,
        cancel: &CancellationToken,
    ) -> Result<String, ProviderError>;
}

/// Builds the HTTP client for the resolved provider.
pub fn build_provider(
    choice: &ProviderChoice,
    cfg: &LlmConfig,
) -> Result<Box<dyn LlmProvider>, ProviderError> {
    let provider_cfg = cfg.provider(choice.provider);
    Ok(match choice.provider {
        ProviderId::Google => Box::new(GoogleProvider::new(
            provider_cfg.endpoint.clone(),
            choice.api_key.clone(),
            cfg,
        )?),
        ProviderId::Groq => Box::new(GroqProvider::new(
            provider_cfg.endpoint.clone(),
            choice.api_key.clone(),
            cfg,
        )?),
    })
}

/// Turns a request's provider preferences into a ready client.
pub trait ProviderRegistry: Send + Sync {
    fn resolve(
        &self,
        cfg: &LlmConfig,
        explicit: Option<ProviderId>,
        model: Option<&str>,
    ) -> Result<ProviderChoice, ProviderError>;

    fn build(
        &self,
        choice: &ProviderChoice,
        cfg: &LlmConfig,
    ) -> Result<Box<dyn LlmProvider>, ProviderError>;
}

/// Resolves credentials from config and the environment and talks HTTP.
#[derive(Debug, Clone, Copy, Default)]
pub struct HttpProviderRegistry;

impl ProviderRegistry for HttpProviderRegistry {
    fn resolve(
        &self,
        cfg: &LlmConfig,
        explicit: Option<ProviderId>,
        model: Option<&str>,
    ) -> Result<ProviderChoice, ProviderError> {
        resolve_provider(cfg, explicit, model, |name| std::env::var(name).ok())
    }

    fn build(
        &self,
        choice: &ProviderChoice,
        cfg: &LlmConfig,
    ) -> Result<Box<dyn LlmProvider>, ProviderError> {
        build_provider(choice, cfg)
    }
}
