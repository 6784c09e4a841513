use crate::ProviderError;
use genapply_core::{LlmConfig, ProviderId};

/// The provider, model and credential a generation will use.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderChoice {
    pub provider: ProviderId,
    pub model: String,
    pub api_key: String,
    /// Set when the requested provider had no credentials.
    pub failed_over_from: Option<ProviderId>,
}

/// Picks a provider for a request.
///
/// Precedence: explicit provider, the model alias table, the model name
/// (`gemini*` is Google, any other named model is Groq), then the
/// configured default. A provider without credentials fails over to the
/// other one; the fallback provider then uses its own default model.
pub fn resolve_provider(
    cfg: &LlmConfig,
    explicit: Option<ProviderId>,
    model: Option<&str>,
    lookup: impl Fn(&str) -> Option<String>,
) -> Result<ProviderChoice, ProviderError> {
    let model = model.map(str::trim).filter(|m| !m.is_empty());
    let (prefixed, bare_model) = match model.and_then(split_provider_prefix) {
        Some((id, rest)) => (Some(id), Some(rest)),
        None => (None, model),
    };

    let requested = explicit
        .or(prefixed)
        .or_else(|| model.and_then(|m| cfg.model_aliases.get(m).copied()))
        .or_else(|| bare_model.map(provider_for_model_name))
        .unwrap_or(cfg.default_provider);

    if let Some(api_key) = cfg.provider(requested).resolve_api_key_with(&lookup) {
        let model = match bare_model {
            Some(name) if model_fits(requested, name, explicit.is_some() || prefixed.is_some(), cfg) => {
                name.to_string()
            }
            _ => cfg.provider(requested).default_model.clone(),
        };
        return Ok(ProviderChoice {
            provider: requested,
            model,
            api_key,
            failed_over_from: None,
        });
    }

    let fallback = ProviderId::ALL
        .into_iter()
        .find(|id| *id != requested)
        .ok_or(ProviderError::NoProviderAvailable)?;
    match cfg.provider(fallback).resolve_api_key_with(&lookup) {
        Some(api_key) => Ok(ProviderChoice {
            provider: fallback,
            model: cfg.provider(fallback).default_model.clone(),
            api_key,
            failed_over_from: Some(requested),
        }),
        None if explicit.is_some() => Err(ProviderError::MissingCredentials {
            provider: requested,
            env: cfg.provider(requested).api_key_env.clone(),
        }),
        None => Err(ProviderError::NoProviderAvailable),
    }
}

fn split_provider_prefix(model: &str) -> Option<(ProviderId, &str)> {
    let (prefix, rest) = model.split_once('/')?;
    let id = match prefix.to_ascii_lowercase().as_str() {
        "google" => ProviderId::Google,
        "groq" => ProviderId::Groq,
        _ => return None,
    };
    (!rest.is_empty()).then_some((id, rest))
}

fn provider_for_model_name(model: &str) -> ProviderId {
    if model.to_ascii_lowercase().starts_with("gemini") {
        ProviderId::Google
    } else {
        ProviderId::Groq
    }
}

/// A caller-named model is only forwarded to a provider that can serve it.
fn model_fits(provider: ProviderId, model: &str, pinned: bool, cfg: &LlmConfig) -> bool {
    pinned
        || cfg.model_aliases.get(model) == Some(&provider)
        || provider_for_model_name(model) == provider
}
