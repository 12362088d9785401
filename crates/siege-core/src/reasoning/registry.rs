//! Maps an agent's [`ProviderKind`] to a configured provider.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::debug;

use siege_state::ProviderKind;

use super::anthropic::AnthropicProvider;
use super::error::{ProviderError, ProviderResult};
use super::openai::OpenAiCompatProvider;
use super::ReasoningProvider;

/// Configured reasoning providers, keyed by kind.
///
/// Kinds whose credentials were absent at construction are remembered so that
/// resolving them reports which variable to set.
#[derive(Default, Clone)]
pub struct ProviderRegistry {
    providers: HashMap<ProviderKind, Arc<dyn ReasoningProvider>>,
    missing: HashMap<ProviderKind, String>,
}

impl ProviderRegistry {
    pub fn empty() -> Self {
        Self::default()
    }

    /// Build providers from `OPENAI_API_KEY`, `ANTHROPIC_API_KEY`,
    /// `XAI_API_KEY` and `GOOGLE_AI_API_KEY` (or `GEMINI_API_KEY`).
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let key = |names: &[&str]| {
            names
                .iter()
                .find_map(|name| lookup(name).filter(|v| !v.trim().is_empty()))
        };
        let mut registry = Self::empty();

        match key(&["OPENAI_API_KEY"]) {
            Some(k) => registry.insert(ProviderKind::Openai, Arc::new(OpenAiCompatProvider::openai(k))),
            None => registry.mark_missing(ProviderKind::Openai, "OPENAI_API_KEY"),
        }
        match key(&["ANTHROPIC_API_KEY"]) {
            Some(k) => registry.insert(ProviderKind::Anthropic, Arc::new(AnthropicProvider::new(k))),
            None => registry.mark_missing(ProviderKind::Anthropic, "ANTHROPIC_API_KEY"),
        }
        match key(&["XAI_API_KEY"]) {
            Some(k) => registry.insert(ProviderKind::Xai, Arc::new(OpenAiCompatProvider::xai(k))),
            None => registry.mark_missing(ProviderKind::Xai, "XAI_API_KEY"),
        }
        match key(&["GOOGLE_AI_API_KEY", "GEMINI_API_KEY"]) {
            Some(k) => registry.insert(ProviderKind::Google, Arc::new(OpenAiCompatProvider::google(k))),
            None => registry.mark_missing(ProviderKind::Google, "GOOGLE_AI_API_KEY"),
        }

        debug!(
            configured = registry.providers.len(),
            missing = registry.missing.len(),
            "reasoning providers loaded"
        );
        registry
    }

    /// Register (or replace) the provider for `kind`.
    pub fn with_provider(mut self, kind: ProviderKind, provider: Arc<dyn ReasoningProvider>) -> Self {
        self.insert(kind, provider);
        self
    }

    fn insert(&mut self, kind: ProviderKind, provider: Arc<dyn ReasoningProvider>) {
        self.missing.remove(&kind);
        self.providers.insert(kind, provider);
    }

    fn mark_missing(&mut self, kind: ProviderKind, env_var: &str) {
        self.missing.insert(kind, env_var.to_string());
    }

    pub fn is_configured(&self, kind: ProviderKind) -> bool {
        self.providers.contains_key(&kind)
    }

    pub fn resolve(&self, kind: ProviderKind) -> ProviderResult<Arc<dyn ReasoningProvider>> {
        if let Some(provider) = self.providers.get(&kind) {
            return Ok(provider.clone());
        }
        match self.missing.get(&kind) {
            Some(env_var) => Err(ProviderError::MissingCredentials {
                provider: kind.to_string(),
                env_var: env_var.clone(),
            }),
            None => Err(ProviderError::UnsupportedProvider(kind.to_string())),
        }
    }
}
