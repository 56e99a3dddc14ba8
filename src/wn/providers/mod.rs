//! Provider adapters and the construction factory.
//!
//! Four back-ends hide behind the [`Provider`](crate::wn::provider::Provider)
//! contract: Anthropic Claude and Google Gemini (system-separated wire
//! formats), OpenAI (unified role list through the SDK plus a raw
//! native-tools path), and Ollama (unified role list over NDJSON).  The
//! [`make_provider`] factory applies each vendor's credential policy and
//! fails fast with a descriptive error when a required secret is absent.

pub mod claude;
pub mod common;
pub mod gemini;
pub mod ollama;
pub mod openai;

use std::sync::Arc;

use crate::wn::config::ProviderEntry;
use crate::wn::error::{CoreError, CoreResult};
use crate::wn::provider::Provider;

use claude::{ClaudeAuth, ClaudeProvider};
use gemini::GeminiProvider;
use ollama::OllamaProvider;
use openai::OpenAIProvider;

/// Resolve a credential from the config entry or a documented env fallback.
fn resolve_key(configured: Option<&String>, env_var: &str) -> Option<String> {
    configured
        .cloned()
        .filter(|k| !k.trim().is_empty())
        .or_else(|| std::env::var(env_var).ok().filter(|k| !k.trim().is_empty()))
}

/// Build a provider by name from its configuration entry and model.
///
/// | Name | Required credential | Env fallback |
/// |---|---|---|
/// | `claude` | `apiKey` or `authToken` | `ANTHROPIC_API_KEY` |
/// | `openai` | `apiKey` | `OPENAI_API_KEY` |
/// | `gemini` | `apiKey` | `GEMINI_API_KEY` |
/// | `ollama` | none | — |
pub fn make_provider(
    name: &str,
    entry: &ProviderEntry,
    model: &str,
) -> CoreResult<Arc<dyn Provider>> {
    let base_url = entry.base_url.as_deref();
    match name {
        "claude" => {
            let auth = if let Some(token) = entry
                .auth_token
                .as_ref()
                .filter(|t| !t.trim().is_empty())
            {
                ClaudeAuth::AuthToken(token.clone())
            } else if let Some(key) = resolve_key(entry.api_key.as_ref(), "ANTHROPIC_API_KEY") {
                ClaudeAuth::ApiKey(key)
            } else {
                return Err(CoreError::Config(
                    "claude provider requires apiKey or authToken (or ANTHROPIC_API_KEY)"
                        .to_string(),
                ));
            };
            Ok(Arc::new(ClaudeProvider::with_auth(auth, base_url, model)))
        }
        "openai" => {
            let key = resolve_key(entry.api_key.as_ref(), "OPENAI_API_KEY").ok_or_else(|| {
                CoreError::Config(
                    "openai provider requires apiKey (or OPENAI_API_KEY)".to_string(),
                )
            })?;
            Ok(Arc::new(OpenAIProvider::new(&key, base_url, model)))
        }
        "gemini" => {
            let key = resolve_key(entry.api_key.as_ref(), "GEMINI_API_KEY").ok_or_else(|| {
                CoreError::Config(
                    "gemini provider requires apiKey (or GEMINI_API_KEY)".to_string(),
                )
            })?;
            Ok(Arc::new(GeminiProvider::new(&key, base_url, model)))
        }
        "ollama" => Ok(Arc::new(OllamaProvider::new(base_url, model))),
        other => Err(CoreError::Config(format!("unknown provider: {}", other))),
    }
}
